//! Day-sharded, append-only feedback log.
//!
//! Each calendar day (in the configured zone) has its own relation, created
//! by the first write of that day. Shards are never dropped here, so a shard
//! once seen present is cached for the life of the process.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use tokio::sync::RwLock;
use tracing::{debug, info};

use maskmap_core::{
    Error, FeedbackBackend, FeedbackFilter, FeedbackOption, FeedbackRecord, IdGenerator,
    NanoIdGenerator, NewFeedback, PageMetadata, PageRequest, PageResult, Result, ShardKey,
};

/// Source of creation timestamps.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Appends feedback to day shards and serves paged reads.
pub struct FeedbackStore {
    backend: Arc<dyn FeedbackBackend>,
    ids: Arc<dyn IdGenerator>,
    timezone: Tz,
    clock: Clock,
    present: RwLock<HashSet<ShardKey>>,
}

impl FeedbackStore {
    pub fn new(backend: Arc<dyn FeedbackBackend>, timezone: Tz) -> Self {
        Self {
            backend,
            ids: Arc::new(NanoIdGenerator::new()),
            timezone,
            clock: Arc::new(Utc::now),
            present: RwLock::new(HashSet::new()),
        }
    }

    pub fn with_id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Shard key for "now" in the configured zone.
    pub fn today(&self) -> ShardKey {
        ShardKey::for_instant(&(self.clock)(), &self.timezone)
    }

    /// Append `feedback` to `shard`, creating the shard on first use.
    ///
    /// Input is validated before any storage call. Returns the generated id.
    pub async fn append(&self, shard: &ShardKey, feedback: NewFeedback) -> Result<String> {
        feedback.validate()?;
        self.ensure_shard(shard).await?;

        let id = self.ids.generate()?;
        let record = feedback.into_record(id.clone(), (self.clock)());

        match self.backend.insert_feedback(shard, &record).await {
            Err(Error::NotFound(_)) => {
                // Cached presence was wrong (relation removed externally).
                self.present.write().await.remove(shard);
                self.ensure_shard(shard).await?;
                self.backend.insert_feedback(shard, &record).await?;
            }
            other => other?,
        }

        debug!(
            subsystem = "feedback",
            op = "append",
            shard = %shard,
            "Feedback appended"
        );
        Ok(id)
    }

    /// Append to the shard for the current day.
    pub async fn append_today(&self, feedback: NewFeedback) -> Result<(ShardKey, String)> {
        let shard = self.today();
        let id = self.append(&shard, feedback).await?;
        Ok((shard, id))
    }

    /// Feedback about one pharmacy on one day, newest first.
    pub async fn query_by_target(
        &self,
        pharmacy_id: &str,
        shard: &ShardKey,
        page: PageRequest,
    ) -> Result<PageResult<FeedbackRecord>> {
        self.page(shard, FeedbackFilter::Pharmacy(pharmacy_id.to_string()), page)
            .await
    }

    /// Feedback from one user on one day, newest first.
    pub async fn query_by_user(
        &self,
        user_id: &str,
        shard: &ShardKey,
        page: PageRequest,
    ) -> Result<PageResult<FeedbackRecord>> {
        self.page(shard, FeedbackFilter::User(user_id.to_string()), page)
            .await
    }

    pub async fn list_options(&self) -> Result<Vec<FeedbackOption>> {
        self.backend.list_options().await.map_err(Error::query)
    }

    async fn page(
        &self,
        shard: &ShardKey,
        filter: FeedbackFilter,
        page: PageRequest,
    ) -> Result<PageResult<FeedbackRecord>> {
        page.validate()?;

        if !self.is_present(shard).await.map_err(Error::query)? {
            debug!(
                subsystem = "feedback",
                op = "query",
                shard = %shard,
                "Shard absent, returning empty page"
            );
            return Ok(PageResult::empty(page));
        }

        let items = match self.backend.select_feedback(shard, &filter, page).await {
            Ok(items) => items,
            Err(Error::NotFound(_)) => {
                self.present.write().await.remove(shard);
                return Ok(PageResult::empty(page));
            }
            Err(e) => return Err(Error::query(e)),
        };
        let total = self
            .backend
            .count_feedback(shard, &filter)
            .await
            .map_err(Error::query)?;

        Ok(PageResult {
            metadata: PageMetadata {
                total,
                limit: page.limit,
                offset: page.offset,
            },
            items,
        })
    }

    async fn is_present(&self, shard: &ShardKey) -> Result<bool> {
        if self.present.read().await.contains(shard) {
            return Ok(true);
        }
        let exists = self.backend.shard_exists(shard).await?;
        if exists {
            self.present.write().await.insert(shard.clone());
        }
        Ok(exists)
    }

    /// Conditional create; a concurrent creator winning counts as success.
    async fn ensure_shard(&self, shard: &ShardKey) -> Result<()> {
        if self.present.read().await.contains(shard) {
            return Ok(());
        }

        match self.backend.create_shard(shard).await {
            Ok(()) => {
                info!(
                    subsystem = "feedback",
                    op = "create_shard",
                    shard = %shard,
                    "Feedback shard ready"
                );
            }
            Err(Error::ShardCreateRace(table)) => {
                debug!(
                    subsystem = "feedback",
                    op = "create_shard",
                    db_table = %table,
                    "Shard created concurrently by another writer"
                );
            }
            Err(e) => return Err(e),
        }

        self.present.write().await.insert(shard.clone());
        Ok(())
    }
}
