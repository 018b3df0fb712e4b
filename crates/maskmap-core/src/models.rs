//! Domain records shared by the storage, query and ingestion layers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::defaults;
use crate::error::{Error, Result};
use crate::geo::LngLat;
use crate::names::VersionId;

// =============================================================================
// POINT-OF-INTEREST DIRECTORY
// =============================================================================

/// One directory entry (a pharmacy and its mask stock).
///
/// `id` is unique within a snapshot and stable across snapshots.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct PointRecord {
    pub id: String,
    pub name: String,
    pub phone: String,
    pub address: String,
    pub mask_adult: i32,
    pub mask_child: i32,
    /// Source-asserted update time; the feed may omit it.
    pub updated: Option<DateTime<Utc>>,
    pub available: String,
    pub note: String,
    pub custom_note: String,
    pub website: String,
    pub longitude: f64,
    pub latitude: f64,
    pub service_periods: String,
    pub service_note: String,
    pub county: String,
    pub town: String,
    pub cunli: String,
}

impl PointRecord {
    pub fn coords(&self) -> LngLat {
        LngLat::new(self.longitude, self.latitude)
    }
}

/// A directory entry annotated with its distance (statute miles) from the query center.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct NearbyPoint {
    #[serde(flatten)]
    #[sqlx(flatten)]
    pub record: PointRecord,
    pub distance: f64,
}

/// Split records into consecutive batches of at most `size` records.
///
/// A `size` of zero is treated as one.
pub fn partition(records: Vec<PointRecord>, size: usize) -> Vec<Vec<PointRecord>> {
    let size = size.max(1);
    let mut batches = Vec::with_capacity(records.len() / size + 1);
    let mut iter = records.into_iter().peekable();
    while iter.peek().is_some() {
        batches.push(iter.by_ref().take(size).collect());
    }
    batches
}

// =============================================================================
// FEEDBACK LOG
// =============================================================================

/// Selectable feedback category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct FeedbackOption {
    pub id: String,
    pub name: String,
}

/// Feedback as submitted by a user, before an id is assigned.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewFeedback {
    pub user_id: String,
    #[serde(rename = "storeId")]
    pub pharmacy_id: String,
    pub option_id: String,
    #[serde(default)]
    pub description: String,
    pub longitude: f64,
    pub latitude: f64,
}

impl NewFeedback {
    /// Reject input that must never reach storage.
    pub fn validate(&self) -> Result<()> {
        if self.user_id.is_empty() {
            return Err(Error::MalformedEntity("user id is required".to_string()));
        }
        if self.pharmacy_id.is_empty() {
            return Err(Error::MalformedEntity("pharmacy id is required".to_string()));
        }
        if self.option_id.is_empty() {
            return Err(Error::MalformedEntity("option id is required".to_string()));
        }
        if self.option_id == defaults::CUSTOM_OPTION_ID && self.description.trim().is_empty() {
            return Err(Error::MalformedEntity(
                "description is required for the custom option".to_string(),
            ));
        }
        if !self.longitude.is_finite() || !self.latitude.is_finite() {
            return Err(Error::MalformedEntity(
                "feedback coordinates must be finite".to_string(),
            ));
        }
        Ok(())
    }

    pub fn into_record(self, id: String, created_at: DateTime<Utc>) -> FeedbackRecord {
        FeedbackRecord {
            id,
            user_id: self.user_id,
            pharmacy_id: self.pharmacy_id,
            option_id: self.option_id,
            description: self.description,
            longitude: self.longitude,
            latitude: self.latitude,
            created_at,
        }
    }
}

/// One append-only feedback row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackRecord {
    pub id: String,
    pub user_id: String,
    #[serde(rename = "storeId")]
    pub pharmacy_id: String,
    pub option_id: String,
    pub description: String,
    pub longitude: f64,
    pub latitude: f64,
    pub created_at: DateTime<Utc>,
}

/// Which feedback rows a paged read selects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedbackFilter {
    User(String),
    Pharmacy(String),
}

impl FeedbackFilter {
    /// Column the filter applies to.
    pub fn column(&self) -> &'static str {
        match self {
            FeedbackFilter::User(_) => "user_id",
            FeedbackFilter::Pharmacy(_) => "pharmacy_id",
        }
    }

    pub fn value(&self) -> &str {
        match self {
            FeedbackFilter::User(v) | FeedbackFilter::Pharmacy(v) => v,
        }
    }

    pub fn matches(&self, record: &FeedbackRecord) -> bool {
        match self {
            FeedbackFilter::User(v) => &record.user_id == v,
            FeedbackFilter::Pharmacy(v) => &record.pharmacy_id == v,
        }
    }
}

// =============================================================================
// PAGINATION
// =============================================================================

/// Offset/limit window over an ordered result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub offset: i64,
    pub limit: i64,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            offset: defaults::PAGE_OFFSET,
            limit: defaults::PAGE_LIMIT,
        }
    }
}

impl PageRequest {
    pub fn new(offset: i64, limit: i64) -> Self {
        Self { offset, limit }
    }

    pub fn validate(&self) -> Result<()> {
        if self.offset < 0 {
            return Err(Error::MalformedEntity(format!(
                "offset must not be negative, got {}",
                self.offset
            )));
        }
        if self.limit < 1 || self.limit > defaults::PAGE_LIMIT_MAX {
            return Err(Error::MalformedEntity(format!(
                "limit must be between 1 and {}, got {}",
                defaults::PAGE_LIMIT_MAX,
                self.limit
            )));
        }
        Ok(())
    }
}

/// Pagination metadata returned with every page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PageMetadata {
    /// Count of all matching rows, ignoring offset/limit.
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}

/// One page of results plus metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageResult<T> {
    #[serde(flatten)]
    pub metadata: PageMetadata,
    pub items: Vec<T>,
}

impl<T> PageResult<T> {
    /// A page with no items and a zero total.
    pub fn empty(page: PageRequest) -> Self {
        Self {
            metadata: PageMetadata {
                total: 0,
                limit: page.limit,
                offset: page.offset,
            },
            items: Vec::new(),
        }
    }

    pub fn total(&self) -> i64 {
        self.metadata.total
    }
}

// =============================================================================
// SNAPSHOT LIFECYCLE
// =============================================================================

/// Result of the pointer update step of a commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CutoverOutcome {
    /// The pointer moved to the new version.
    Advanced { previous: Option<VersionId> },
    /// The pointer already named this version.
    AlreadyCurrent,
    /// A newer version is current; the pointer was left alone.
    SkippedOlder { current: VersionId },
}

/// Result of building a snapshot relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaterializeOutcome {
    /// The relation was built and published by this call.
    Written { records: u64 },
    /// The relation was already published, possibly by a concurrent commit.
    AlreadyPresent,
}

/// What retention GC did after a cut-over.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcReport {
    pub kept: Vec<VersionId>,
    pub dropped: Vec<VersionId>,
    /// Staging relations left behind by abandoned builds.
    pub discarded_staging: Vec<VersionId>,
    /// Failed drops; GC continues past them.
    pub errors: Vec<String>,
}

impl GcReport {
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}

/// Split published versions into those retention keeps and those it drops.
///
/// The `keep` newest survive, and so does `current` wherever it ranks.
/// Both halves come back newest first. Callers must hold the cut-over lock
/// from reading `current` until the retired relations are gone.
pub fn retention_split(
    mut versions: Vec<VersionId>,
    current: Option<&VersionId>,
    keep: usize,
) -> (Vec<VersionId>, Vec<VersionId>) {
    versions.sort_unstable_by(|a, b| b.cmp(a));
    versions.dedup();
    let keep = keep.max(1);
    let mut kept = Vec::new();
    let mut retired = Vec::new();
    for (rank, version) in versions.into_iter().enumerate() {
        if rank < keep || current == Some(&version) {
            kept.push(version);
        } else {
            retired.push(version);
        }
    }
    (kept, retired)
}

/// Summary of one `commit` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitReport {
    pub version: VersionId,
    /// False when the snapshot already existed and was not rewritten.
    pub materialized: bool,
    pub records: u64,
    pub cutover: CutoverOutcome,
    pub gc: GcReport,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str) -> PointRecord {
        PointRecord {
            id: id.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_partition_exact_and_remainder() {
        let records: Vec<_> = (0..1201).map(|i| record(&i.to_string())).collect();
        let batches = partition(records, 500);
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].len(), 500);
        assert_eq!(batches[1].len(), 500);
        assert_eq!(batches[2].len(), 201);
        assert_eq!(batches[2][0].id, "1000");
    }

    fn versions(hours: &[u32]) -> Vec<VersionId> {
        hours
            .iter()
            .map(|h| VersionId::parse(&format!("2020_0204_{:02}0000", h)).unwrap())
            .collect()
    }

    #[test]
    fn test_retention_split_keeps_newest_and_current() {
        let all = versions(&[10, 13, 11, 12, 14]);
        let current = versions(&[11]).remove(0);

        let (kept, retired) = retention_split(all, Some(&current), 2);
        assert_eq!(kept, versions(&[14, 13, 11]));
        assert_eq!(retired, versions(&[12, 10]));
    }

    #[test]
    fn test_retention_split_floor_of_one() {
        let (kept, retired) = retention_split(versions(&[10, 11, 11]), None, 0);
        assert_eq!(kept, versions(&[11]));
        assert_eq!(retired, versions(&[10]));
    }

    #[test]
    fn test_partition_empty_and_zero_size() {
        assert!(partition(Vec::new(), 500).is_empty());
        let batches = partition(vec![record("a"), record("b")], 0);
        assert_eq!(batches.len(), 2);
    }

    #[test]
    fn test_custom_option_requires_description() {
        let fb = NewFeedback {
            user_id: "u1".into(),
            pharmacy_id: "5901012345".into(),
            option_id: defaults::CUSTOM_OPTION_ID.into(),
            description: "   ".into(),
            longitude: 121.0,
            latitude: 25.0,
        };
        assert!(matches!(fb.validate(), Err(Error::MalformedEntity(_))));

        let fb = NewFeedback {
            description: "line is very long".into(),
            ..fb
        };
        assert!(fb.validate().is_ok());
    }

    #[test]
    fn test_required_feedback_fields() {
        let ok = NewFeedback {
            user_id: "u1".into(),
            pharmacy_id: "p1".into(),
            option_id: "ddCp1m88O4g5SU1GDJRPi".into(),
            ..Default::default()
        };
        assert!(ok.validate().is_ok());
        assert!(NewFeedback { user_id: String::new(), ..ok.clone() }.validate().is_err());
        assert!(NewFeedback { pharmacy_id: String::new(), ..ok.clone() }.validate().is_err());
        assert!(NewFeedback { option_id: String::new(), ..ok }.validate().is_err());
    }

    #[test]
    fn test_page_request_bounds() {
        assert!(PageRequest::default().validate().is_ok());
        assert!(PageRequest::new(0, 0).validate().is_err());
        assert!(PageRequest::new(0, 101).validate().is_err());
        assert!(PageRequest::new(-1, 10).validate().is_err());
        assert!(PageRequest::new(40, 100).validate().is_ok());
    }

    #[test]
    fn test_page_result_serializes_flat() {
        let page: PageResult<FeedbackOption> = PageResult::empty(PageRequest::new(0, 10));
        let json = serde_json::to_value(&page).unwrap();
        assert_eq!(json["total"], 0);
        assert_eq!(json["limit"], 10);
        assert_eq!(json["offset"], 0);
        assert!(json["items"].as_array().unwrap().is_empty());
    }

    #[test]
    fn test_feedback_filter() {
        let rec = NewFeedback {
            user_id: "u1".into(),
            pharmacy_id: "p1".into(),
            option_id: "o".into(),
            ..Default::default()
        }
        .into_record("id".into(), Utc::now());
        assert!(FeedbackFilter::User("u1".into()).matches(&rec));
        assert!(!FeedbackFilter::User("p1".into()).matches(&rec));
        assert!(FeedbackFilter::Pharmacy("p1".into()).matches(&rec));
        assert_eq!(FeedbackFilter::Pharmacy("p1".into()).column(), "pharmacy_id");
    }

    #[test]
    fn test_nearby_point_serializes_flat() {
        let p = NearbyPoint {
            record: record("5901012345"),
            distance: 1.5,
        };
        let json = serde_json::to_value(&p).unwrap();
        assert_eq!(json["id"], "5901012345");
        assert_eq!(json["distance"], 1.5);
        assert_eq!(json["maskAdult"], 0);
    }
}
