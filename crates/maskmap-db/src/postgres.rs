//! PostgreSQL implementation of the snapshot and feedback backends.
//!
//! Snapshots live in one relation per version (`pharmacy_<version>`). One
//! transaction creates the staging relation, fills it and renames it to the
//! published name, so no other session ever sees a half-built table. The
//! `snapshot_registry` row names the current version. Cut-over and retention
//! both take `pg_advisory_xact_lock(CUTOVER_LOCK_KEY)`, which is released on
//! commit, on rollback and when the connection drops. Feedback lives in one
//! relation per day (`feedback_<yyyy_mmdd>`), created on first write.

use async_trait::async_trait;
use sqlx::{Connection, PgConnection, PgPool, Postgres, QueryBuilder};
use tracing::{debug, info};

use maskmap_core::defaults::{CUTOVER_LOCK_KEY, MATERIALIZE_LOCK_CLASS, REGISTRY_DATASET};
use maskmap_core::names::{SNAPSHOT_PREFIX, STAGING_PREFIX};
use maskmap_core::{
    retention_split, CutoverOutcome, Error, FeedbackBackend, FeedbackFilter, FeedbackOption,
    FeedbackRecord, GcReport, MaterializeOutcome, NearbyPoint, NearbyQuery, PageRequest,
    PointRecord, Result, ShardKey, SnapshotBackend, VersionId,
};

use crate::relation_validation::{shard_table, snapshot_table, staging_table};

/// SQLSTATE for a reference to a relation that does not exist.
const UNDEFINED_TABLE: &str = "42P01";
/// SQLSTATE for `CREATE TABLE` of a relation that already exists.
const DUPLICATE_TABLE: &str = "42P07";
/// SQLSTATE raised by concurrent `CREATE TABLE IF NOT EXISTS` on the type catalog.
const UNIQUE_VIOLATION: &str = "23505";

/// Idempotent DDL for the fixed (non-versioned) relations.
const SCHEMA_STATEMENTS: &[&str] = &[
    "CREATE EXTENSION IF NOT EXISTS cube",
    "CREATE EXTENSION IF NOT EXISTS earthdistance",
    r#"
    CREATE TABLE IF NOT EXISTS snapshot_registry (
        dataset    varchar(64) PRIMARY KEY,
        version    varchar(32) NOT NULL,
        updated_at timestamptz NOT NULL DEFAULT now()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS options (
        id   varchar(21)  PRIMARY KEY,
        name varchar(254) NOT NULL
    )
    "#,
    r#"
    INSERT INTO options (id, name) VALUES
        ('IRESxM58KC~dqg5XLCH~n', '自訂'),
        ('ddCp1m88O4g5SU1GDJRPi', '當天已售完'),
        ('uYrYL~7Gd65IN2wWsWa9A', '號碼牌已發送完畢'),
        ('nAn6pj8UkrXST1syShrzV', '發放號碼牌')
    ON CONFLICT (id) DO NOTHING
    "#,
];

const POINT_COLUMNS: &str = "id, name, phone, address, mask_adult, mask_child, updated, \
     available, note, custom_note, website, longitude, latitude, \
     service_periods, service_note, county, town, cunli";

const FEEDBACK_COLUMNS: &str =
    "id, user_id, pharmacy_id, option_id, description, longitude, latitude, created_at";

fn sql_state(e: &sqlx::Error) -> Option<String> {
    match e {
        sqlx::Error::Database(db) => db.code().map(|c| c.into_owned()),
        _ => None,
    }
}

fn is_undefined_table(e: &sqlx::Error) -> bool {
    sql_state(e).as_deref() == Some(UNDEFINED_TABLE)
}

fn is_already_exists(e: &sqlx::Error) -> bool {
    matches!(
        sql_state(e).as_deref(),
        Some(DUPLICATE_TABLE) | Some(UNIQUE_VIOLATION)
    )
}

/// Map a missing relation to `NotFound`, everything else to `Database`.
fn relation_error(table: &str, e: sqlx::Error) -> Error {
    if is_undefined_table(&e) {
        Error::NotFound(format!("relation {} does not exist", table))
    } else {
        Error::Database(e)
    }
}

/// PostgreSQL-backed snapshot and feedback storage.
#[derive(Clone)]
pub struct PgBackend {
    pool: PgPool,
}

impl PgBackend {
    /// Create a new PgBackend with the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the extensions, registry and option tables if missing.
    ///
    /// Safe to run on every start; equivalent to the bundled migrations.
    pub async fn ensure_schema(&self) -> Result<()> {
        for statement in SCHEMA_STATEMENTS {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(Error::Database)?;
        }
        debug!(
            subsystem = "database",
            component = "schema",
            op = "ensure",
            "Fixed relations are present"
        );
        Ok(())
    }

    async fn relation_exists<'e, E>(executor: E, table: &str) -> Result<bool>
    where
        E: sqlx::Executor<'e, Database = Postgres>,
    {
        sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM pg_catalog.pg_tables
                WHERE schemaname = current_schema() AND tablename = $1
            )
            "#,
        )
        .bind(table)
        .fetch_one(executor)
        .await
        .map_err(Error::Database)
    }

    /// Committed relations in the current schema whose name starts with `prefix`.
    async fn relations_with_prefix<'e, E>(executor: E, prefix: &str) -> Result<Vec<String>>
    where
        E: sqlx::Executor<'e, Database = Postgres>,
    {
        sqlx::query_scalar(
            r#"
            SELECT tablename::text
            FROM pg_catalog.pg_tables
            WHERE schemaname = current_schema() AND tablename LIKE $1
            ORDER BY tablename DESC
            "#,
        )
        .bind(format!("{}%", prefix.replace('_', "\\_")))
        .fetch_all(executor)
        .await
        .map_err(Error::Database)
    }

    /// Create the empty staging relation and its lookup index.
    async fn create_staging(conn: &mut PgConnection, staging: &str) -> Result<()> {
        sqlx::query(&format!("DROP TABLE IF EXISTS {}", staging))
            .execute(&mut *conn)
            .await
            .map_err(Error::Database)?;

        sqlx::query(&format!(
            r#"
            CREATE TABLE {} (
                id              varchar(64)   PRIMARY KEY,
                name            varchar(254)  NOT NULL DEFAULT '',
                phone           varchar(254)  NOT NULL DEFAULT '',
                address         varchar(254)  NOT NULL DEFAULT '',
                mask_adult      integer       NOT NULL DEFAULT 0,
                mask_child      integer       NOT NULL DEFAULT 0,
                updated         timestamptz,
                available       varchar(1024) NOT NULL DEFAULT '',
                note            varchar(1024) NOT NULL DEFAULT '',
                custom_note     varchar(1024) NOT NULL DEFAULT '',
                website         varchar(1024) NOT NULL DEFAULT '',
                longitude       double precision NOT NULL DEFAULT 0.0,
                latitude        double precision NOT NULL DEFAULT 0.0,
                service_periods varchar(64)   NOT NULL DEFAULT '',
                service_note    varchar(1024) NOT NULL DEFAULT '',
                county          varchar(64)   NOT NULL DEFAULT '',
                town            varchar(64)   NOT NULL DEFAULT '',
                cunli           varchar(64)   NOT NULL DEFAULT ''
            )
            "#,
            staging
        ))
        .execute(&mut *conn)
        .await
        .map_err(Error::Database)?;

        sqlx::query(&format!(
            "CREATE INDEX {}_lnglat_idx ON {} (longitude, latitude)",
            staging, staging
        ))
        .execute(&mut *conn)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }

    async fn insert_rows(conn: &mut PgConnection, staging: &str, batch: &[PointRecord]) -> Result<u64> {
        if batch.is_empty() {
            return Ok(0);
        }

        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("INSERT INTO {} ({}) ", staging, POINT_COLUMNS));
        builder.push_values(batch, |mut b, r| {
            b.push_bind(r.id.as_str())
                .push_bind(r.name.as_str())
                .push_bind(r.phone.as_str())
                .push_bind(r.address.as_str())
                .push_bind(r.mask_adult)
                .push_bind(r.mask_child)
                .push_bind(r.updated)
                .push_bind(r.available.as_str())
                .push_bind(r.note.as_str())
                .push_bind(r.custom_note.as_str())
                .push_bind(r.website.as_str())
                .push_bind(r.longitude)
                .push_bind(r.latitude)
                .push_bind(r.service_periods.as_str())
                .push_bind(r.service_note.as_str())
                .push_bind(r.county.as_str())
                .push_bind(r.town.as_str())
                .push_bind(r.cunli.as_str());
        });

        let result = builder
            .build()
            .execute(&mut *conn)
            .await
            .map_err(|e| relation_error(staging, e))?;
        Ok(result.rows_affected())
    }

    /// Drop one relation inside a savepoint so a failure does not abort the
    /// surrounding transaction.
    async fn drop_relation(conn: &mut PgConnection, table: &str) -> Result<()> {
        let mut savepoint = conn.begin().await.map_err(Error::Database)?;
        sqlx::query(&format!("DROP TABLE IF EXISTS {}", table))
            .execute(&mut *savepoint)
            .await
            .map_err(Error::Database)?;
        savepoint.commit().await.map_err(Error::Database)
    }
}

#[async_trait]
impl SnapshotBackend for PgBackend {
    async fn registered_version(&self) -> Result<Option<VersionId>> {
        let version: Option<String> =
            sqlx::query_scalar("SELECT version FROM snapshot_registry WHERE dataset = $1")
                .bind(REGISTRY_DATASET)
                .fetch_optional(&self.pool)
                .await
                .map_err(Error::Database)?;

        version.map(|v| VersionId::parse(&v)).transpose()
    }

    async fn snapshot_exists(&self, version: &VersionId) -> Result<bool> {
        let table = snapshot_table(version)?;
        Self::relation_exists(&self.pool, &table).await
    }

    async fn materialize(
        &self,
        version: &VersionId,
        batches: &[Vec<PointRecord>],
    ) -> Result<MaterializeOutcome> {
        let staging = staging_table(version)?;
        let table = snapshot_table(version)?;
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        // Duplicate builds of one version queue here until the first commits.
        sqlx::query("SELECT pg_advisory_xact_lock($1, hashtext($2))")
            .bind(MATERIALIZE_LOCK_CLASS)
            .bind(&table)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;

        if Self::relation_exists(&mut *tx, &table).await? {
            debug!(
                subsystem = "database",
                component = "writer",
                op = "materialize",
                db_table = %table,
                "Snapshot relation already published"
            );
            return Ok(MaterializeOutcome::AlreadyPresent);
        }

        Self::create_staging(&mut tx, &staging).await?;
        let mut records = 0u64;
        for batch in batches {
            records += Self::insert_rows(&mut tx, &staging, batch).await?;
        }

        match sqlx::query(&format!("ALTER TABLE {} RENAME TO {}", staging, table))
            .execute(&mut *tx)
            .await
        {
            Ok(_) => {}
            // Published by a writer that does not take the build lock.
            Err(e) if is_already_exists(&e) => return Ok(MaterializeOutcome::AlreadyPresent),
            Err(e) => return Err(relation_error(&staging, e)),
        }
        sqlx::query(&format!(
            "ALTER INDEX IF EXISTS {}_lnglat_idx RENAME TO {}_lnglat_idx",
            staging, table
        ))
        .execute(&mut *tx)
        .await
        .map_err(Error::Database)?;
        tx.commit().await.map_err(Error::Database)?;

        info!(
            subsystem = "database",
            component = "writer",
            op = "publish",
            db_table = %table,
            record_count = records,
            "Snapshot relation published"
        );
        Ok(MaterializeOutcome::Written { records })
    }

    async fn cutover(&self, version: &VersionId) -> Result<CutoverOutcome> {
        let table = snapshot_table(version)?;
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        // Held until commit/rollback; serializes every cut-over.
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(CUTOVER_LOCK_KEY)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;

        if !Self::relation_exists(&mut *tx, &table).await? {
            return Err(Error::NotFound(format!(
                "cannot point registry at missing relation {}",
                table
            )));
        }

        let current: Option<String> = sqlx::query_scalar(
            "SELECT version FROM snapshot_registry WHERE dataset = $1 FOR UPDATE",
        )
        .bind(REGISTRY_DATASET)
        .fetch_optional(&mut *tx)
        .await
        .map_err(Error::Database)?;
        let current = current.map(|v| VersionId::parse(&v)).transpose()?;

        let outcome = match current {
            Some(ref c) if c == version => CutoverOutcome::AlreadyCurrent,
            Some(c) if c > *version => CutoverOutcome::SkippedOlder { current: c },
            previous => {
                sqlx::query(
                    r#"
                    INSERT INTO snapshot_registry (dataset, version, updated_at)
                    VALUES ($1, $2, now())
                    ON CONFLICT (dataset)
                    DO UPDATE SET version = EXCLUDED.version, updated_at = EXCLUDED.updated_at
                    "#,
                )
                .bind(REGISTRY_DATASET)
                .bind(version.as_str())
                .execute(&mut *tx)
                .await
                .map_err(Error::Database)?;
                CutoverOutcome::Advanced { previous }
            }
        };

        tx.commit().await.map_err(Error::Database)?;
        Ok(outcome)
    }

    async fn list_snapshots(&self) -> Result<Vec<VersionId>> {
        let tables = Self::relations_with_prefix(&self.pool, SNAPSHOT_PREFIX).await?;
        Ok(tables
            .iter()
            .filter_map(|t| VersionId::from_table_name(t))
            .collect())
    }

    async fn drop_retired(&self, keep: usize) -> Result<GcReport> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        // Same lock as cut-over: the pointer cannot move until the drops commit.
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(CUTOVER_LOCK_KEY)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;

        let current: Option<String> = sqlx::query_scalar(
            "SELECT version FROM snapshot_registry WHERE dataset = $1 FOR UPDATE",
        )
        .bind(REGISTRY_DATASET)
        .fetch_optional(&mut *tx)
        .await
        .map_err(Error::Database)?;
        let current = current.map(|v| VersionId::parse(&v)).transpose()?;

        let published: Vec<VersionId> = Self::relations_with_prefix(&mut *tx, SNAPSHOT_PREFIX)
            .await?
            .iter()
            .filter_map(|t| VersionId::from_table_name(t))
            .collect();
        // In-flight builds are uncommitted and invisible here; anything listed
        // was left by a build that never finished.
        let abandoned: Vec<VersionId> = Self::relations_with_prefix(&mut *tx, STAGING_PREFIX)
            .await?
            .iter()
            .filter_map(|t| VersionId::from_staging_table_name(t))
            .collect();

        let (kept, retired) = retention_split(published, current.as_ref(), keep);
        let mut report = GcReport {
            kept,
            ..Default::default()
        };

        for version in retired {
            let dropped = match snapshot_table(&version) {
                Ok(table) => Self::drop_relation(&mut tx, &table).await,
                Err(e) => Err(e),
            };
            match dropped {
                Ok(()) => report.dropped.push(version),
                Err(e) => report.errors.push(format!("{}: {}", version, e)),
            }
        }

        for version in abandoned {
            let dropped = match staging_table(&version) {
                Ok(staging) => Self::drop_relation(&mut tx, &staging).await,
                Err(e) => Err(e),
            };
            match dropped {
                Ok(()) => report.discarded_staging.push(version),
                Err(e) => report
                    .errors
                    .push(format!("{}: {}", version.staging_table_name(), e)),
            }
        }

        tx.commit().await.map_err(Error::Database)?;
        Ok(report)
    }

    async fn query_nearby(
        &self,
        version: &VersionId,
        query: &NearbyQuery,
    ) -> Result<Vec<NearbyPoint>> {
        let table = snapshot_table(version)?;
        let sql = format!(
            r#"
            SELECT {cols}, point($1, $2) <@> point(longitude, latitude) AS distance
            FROM {table}
            WHERE longitude >= $3 AND longitude <= $4
              AND latitude >= $5 AND latitude <= $6
            ORDER BY distance, id
            LIMIT $7
            "#,
            cols = POINT_COLUMNS,
            table = table
        );

        sqlx::query_as::<_, NearbyPoint>(&sql)
            .bind(query.center.lng)
            .bind(query.center.lat)
            .bind(query.bbox.sw.lng)
            .bind(query.bbox.ne.lng)
            .bind(query.bbox.sw.lat)
            .bind(query.bbox.ne.lat)
            .bind(query.sql_limit())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| relation_error(&table, e))
    }
}

#[async_trait]
impl FeedbackBackend for PgBackend {
    async fn shard_exists(&self, shard: &ShardKey) -> Result<bool> {
        let table = shard_table(shard)?;
        Self::relation_exists(&self.pool, &table).await
    }

    async fn create_shard(&self, shard: &ShardKey) -> Result<()> {
        let table = shard_table(shard)?;
        let statements = [
            format!(
                r#"
                CREATE TABLE IF NOT EXISTS {} (
                    id          varchar(21)   PRIMARY KEY,
                    user_id     varchar(64)   NOT NULL DEFAULT '',
                    pharmacy_id varchar(64)   NOT NULL DEFAULT '',
                    option_id   varchar(21)   NOT NULL DEFAULT '',
                    description varchar(1024) NOT NULL DEFAULT '',
                    longitude   double precision NOT NULL DEFAULT 0.0,
                    latitude    double precision NOT NULL DEFAULT 0.0,
                    created_at  timestamptz   NOT NULL DEFAULT now()
                )
                "#,
                table
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS {t}_user_idx ON {t} (user_id, created_at DESC)",
                t = table
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS {t}_pharmacy_idx ON {t} (pharmacy_id, created_at DESC)",
                t = table
            ),
        ];

        let mut tx = self.pool.begin().await.map_err(Error::Database)?;
        for statement in &statements {
            if let Err(e) = sqlx::query(statement).execute(&mut *tx).await {
                if is_already_exists(&e) {
                    return Err(Error::ShardCreateRace(table));
                }
                return Err(Error::Database(e));
            }
        }
        match tx.commit().await {
            Ok(()) => Ok(()),
            Err(e) if is_already_exists(&e) => Err(Error::ShardCreateRace(table)),
            Err(e) => Err(Error::Database(e)),
        }
    }

    async fn insert_feedback(&self, shard: &ShardKey, record: &FeedbackRecord) -> Result<()> {
        let table = shard_table(shard)?;
        sqlx::query(&format!(
            "INSERT INTO {} ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            table, FEEDBACK_COLUMNS
        ))
        .bind(&record.id)
        .bind(&record.user_id)
        .bind(&record.pharmacy_id)
        .bind(&record.option_id)
        .bind(&record.description)
        .bind(record.longitude)
        .bind(record.latitude)
        .bind(record.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| relation_error(&table, e))?;
        Ok(())
    }

    async fn select_feedback(
        &self,
        shard: &ShardKey,
        filter: &FeedbackFilter,
        page: PageRequest,
    ) -> Result<Vec<FeedbackRecord>> {
        let table = shard_table(shard)?;
        sqlx::query_as::<_, FeedbackRecord>(&format!(
            "SELECT {} FROM {} WHERE {} = $1 ORDER BY created_at DESC, id LIMIT $2 OFFSET $3",
            FEEDBACK_COLUMNS,
            table,
            filter.column()
        ))
        .bind(filter.value())
        .bind(page.limit)
        .bind(page.offset)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| relation_error(&table, e))
    }

    async fn count_feedback(&self, shard: &ShardKey, filter: &FeedbackFilter) -> Result<i64> {
        let table = shard_table(shard)?;
        sqlx::query_scalar::<_, i64>(&format!(
            "SELECT COUNT(*) FROM {} WHERE {} = $1",
            table,
            filter.column()
        ))
        .bind(filter.value())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| relation_error(&table, e))
    }

    async fn list_options(&self) -> Result<Vec<FeedbackOption>> {
        sqlx::query_as::<_, FeedbackOption>("SELECT id, name FROM options ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Database)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_point_columns_match_record_fields() {
        let cols: Vec<&str> = POINT_COLUMNS.split(',').map(str::trim).collect();
        assert_eq!(cols.len(), 18);
        assert_eq!(cols[0], "id");
        assert!(cols.contains(&"cunli"));
    }

    #[test]
    fn test_feedback_columns() {
        let cols: Vec<&str> = FEEDBACK_COLUMNS.split(',').map(str::trim).collect();
        assert_eq!(cols.len(), 8);
        assert_eq!(cols.last(), Some(&"created_at"));
    }

    #[test]
    fn test_relation_error_maps_non_database_errors() {
        let err = relation_error("pharmacy_2020_0204_183000", sqlx::Error::RowNotFound);
        assert!(matches!(err, Error::Database(_)));
    }
}
