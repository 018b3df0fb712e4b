//! GeoJSON feed parsing.
//!
//! The feed is a FeatureCollection of Point features whose properties carry
//! the directory fields in snake_case. `updated` is a local wall-clock time
//! (`YYYY/MM/DD HH:MM:SS`) in the configured zone; the first feature that
//! carries one names the snapshot version.

use std::collections::HashSet;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use geojson::{Feature, GeoJson, Value};
use serde::{Deserialize, Deserializer};

use maskmap_core::defaults::FEED_TIME_FORMAT;
use maskmap_core::{Error, PointRecord, Result, VersionId};

fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Feature properties as published.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FeedProperties {
    #[serde(deserialize_with = "null_as_default")]
    id: String,
    #[serde(deserialize_with = "null_as_default")]
    name: String,
    #[serde(deserialize_with = "null_as_default")]
    phone: String,
    #[serde(deserialize_with = "null_as_default")]
    address: String,
    // Unsigned here so negative stock is rejected at the boundary.
    #[serde(deserialize_with = "null_as_default")]
    mask_adult: u64,
    #[serde(deserialize_with = "null_as_default")]
    mask_child: u64,
    #[serde(deserialize_with = "null_as_default")]
    updated: String,
    #[serde(deserialize_with = "null_as_default")]
    available: String,
    #[serde(deserialize_with = "null_as_default")]
    note: String,
    #[serde(deserialize_with = "null_as_default")]
    custom_note: String,
    #[serde(deserialize_with = "null_as_default")]
    website: String,
    #[serde(deserialize_with = "null_as_default")]
    service_periods: String,
    #[serde(deserialize_with = "null_as_default")]
    service_note: String,
    #[serde(deserialize_with = "null_as_default")]
    county: String,
    #[serde(deserialize_with = "null_as_default")]
    town: String,
    #[serde(deserialize_with = "null_as_default")]
    cunli: String,
}

/// Records of one feed document plus the version they belong to.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedFeed {
    pub version: VersionId,
    pub records: Vec<PointRecord>,
}

impl ParsedFeed {
    pub fn record_count(&self) -> usize {
        self.records.len()
    }
}

/// Parse a feed timestamp in `tz`. Empty means "no timestamp".
pub fn parse_updated(raw: &str, tz: &Tz) -> Result<Option<DateTime<Tz>>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    let naive = NaiveDateTime::parse_from_str(raw, FEED_TIME_FORMAT).map_err(|e| {
        Error::MalformedEntity(format!(
            "updated '{}' does not match {}: {}",
            raw, FEED_TIME_FORMAT, e
        ))
    })?;
    tz.from_local_datetime(&naive)
        .earliest()
        .map(Some)
        .ok_or_else(|| {
            Error::MalformedEntity(format!("updated '{}' does not exist in {}", raw, tz))
        })
}

/// Parse a whole feed document.
///
/// Any malformed feature fails the whole document; a partial snapshot is
/// worse than a rejected one.
pub fn parse_feed(document: &str, tz: &Tz) -> Result<ParsedFeed> {
    let geojson = document
        .parse::<GeoJson>()
        .map_err(|e| Error::Feed(format!("invalid GeoJSON: {}", e)))?;

    let collection = match geojson {
        GeoJson::FeatureCollection(collection) => collection,
        _ => {
            return Err(Error::Feed(
                "feed is not a GeoJSON FeatureCollection".to_string(),
            ))
        }
    };

    let mut version = None;
    let mut seen = HashSet::with_capacity(collection.features.len());
    let mut records = Vec::with_capacity(collection.features.len());

    for (index, feature) in collection.features.into_iter().enumerate() {
        let (record, updated) = parse_feature(index, feature, tz)?;

        if !seen.insert(record.id.clone()) {
            return Err(Error::MalformedEntity(format!(
                "feature {} repeats id {}",
                index, record.id
            )));
        }
        if version.is_none() {
            version = updated.as_ref().map(VersionId::from_timestamp);
        }
        records.push(record);
    }

    let version = version.ok_or(Error::NoVersionTimestamp)?;
    Ok(ParsedFeed { version, records })
}

/// Narrow a stock count to the stored column width.
fn mask_count(index: usize, field: &str, value: u64) -> Result<i32> {
    i32::try_from(value).map_err(|_| {
        Error::MalformedEntity(format!(
            "feature {} has {} {} beyond the storable range",
            index, field, value
        ))
    })
}

fn parse_feature(
    index: usize,
    feature: Feature,
    tz: &Tz,
) -> Result<(PointRecord, Option<DateTime<Tz>>)> {
    let (longitude, latitude) = match feature.geometry.as_ref().map(|g| &g.value) {
        Some(Value::Point(coords)) if coords.len() >= 2 => (coords[0], coords[1]),
        _ => {
            return Err(Error::MalformedEntity(format!(
                "feature {} has no point coordinates",
                index
            )))
        }
    };
    if !longitude.is_finite() || !latitude.is_finite() {
        return Err(Error::MalformedEntity(format!(
            "feature {} has non-finite coordinates",
            index
        )));
    }

    let props: FeedProperties = match feature.properties {
        Some(map) => serde_json::from_value(serde_json::Value::Object(map)).map_err(|e| {
            Error::MalformedEntity(format!("feature {} properties: {}", index, e))
        })?,
        None => FeedProperties::default(),
    };
    if props.id.trim().is_empty() {
        return Err(Error::MalformedEntity(format!(
            "feature {} has an empty id",
            index
        )));
    }

    let updated = parse_updated(&props.updated, tz).map_err(|e| match e {
        Error::MalformedEntity(msg) => {
            Error::MalformedEntity(format!("feature {} ({}): {}", index, props.id, msg))
        }
        other => other,
    })?;

    let mask_adult = mask_count(index, "mask_adult", props.mask_adult)?;
    let mask_child = mask_count(index, "mask_child", props.mask_child)?;

    let record = PointRecord {
        id: props.id,
        name: props.name,
        phone: props.phone,
        address: props.address,
        mask_adult,
        mask_child,
        updated: updated.as_ref().map(|t| t.with_timezone(&Utc)),
        available: props.available,
        note: props.note,
        custom_note: props.custom_note,
        website: props.website,
        longitude,
        latitude,
        service_periods: props.service_periods,
        service_note: props.service_note,
        county: props.county,
        town: props.town,
        cunli: props.cunli,
    };
    Ok((record, updated))
}
