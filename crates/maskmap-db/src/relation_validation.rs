//! Guard for relation names that are interpolated into DDL and DML.
//!
//! PostgreSQL cannot bind identifiers as parameters, so every dynamic table
//! name goes through [`validate_relation_name`] immediately before it is
//! formatted into SQL. Names are only ever produced by `VersionId` and
//! `ShardKey`; this check is the second line.

use maskmap_core::names::{SHARD_PREFIX, SNAPSHOT_PREFIX, STAGING_PREFIX};
use maskmap_core::{Error, Result, ShardKey, VersionId};

/// Validate a dynamic relation name.
///
/// A valid name:
/// - is a non-empty PostgreSQL identifier of at most 63 bytes
/// - contains only lowercase ASCII letters, digits and underscores
/// - is a snapshot, staging or shard relation whose suffix parses as a
///   `VersionId` or `ShardKey`
///
/// # Examples
///
/// ```
/// use maskmap_db::validate_relation_name;
///
/// assert!(validate_relation_name("pharmacy_2020_0204_183000").is_ok());
/// assert!(validate_relation_name("feedback_2020_0204").is_ok());
/// assert!(validate_relation_name("pharmacies").is_err());
/// assert!(validate_relation_name("feedback_2020_0204; DROP TABLE options").is_err());
/// ```
pub fn validate_relation_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::MalformedEntity(
            "Relation name cannot be empty".to_string(),
        ));
    }

    if name.len() > 63 {
        return Err(Error::MalformedEntity(format!(
            "Relation name exceeds 63 character limit: {} characters",
            name.len()
        )));
    }

    if let Some(ch) = name
        .chars()
        .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '_'))
    {
        return Err(Error::MalformedEntity(format!(
            "Relation name contains invalid character: '{}'",
            ch
        )));
    }

    let controlled = if let Some(rest) = name.strip_prefix(STAGING_PREFIX) {
        VersionId::parse(rest).is_ok()
    } else if let Some(rest) = name.strip_prefix(SNAPSHOT_PREFIX) {
        VersionId::parse(rest).is_ok()
    } else if let Some(rest) = name.strip_prefix(SHARD_PREFIX) {
        ShardKey::parse(rest).is_ok()
    } else {
        false
    };

    if !controlled {
        return Err(Error::MalformedEntity(format!(
            "Relation name '{}' is not a snapshot, staging or shard relation",
            name
        )));
    }

    Ok(())
}

/// Validated name of the published relation for `version`.
pub fn snapshot_table(version: &VersionId) -> Result<String> {
    let name = version.table_name();
    validate_relation_name(&name)?;
    Ok(name)
}

/// Validated name of the staging relation for `version`.
pub fn staging_table(version: &VersionId) -> Result<String> {
    let name = version.staging_table_name();
    validate_relation_name(&name)?;
    Ok(name)
}

/// Validated name of the shard relation for `shard`.
pub fn shard_table(shard: &ShardKey) -> Result<String> {
    let name = shard.table_name();
    validate_relation_name(&name)?;
    Ok(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_controlled_names_are_valid() {
        assert!(validate_relation_name("pharmacy_2020_0204_183000").is_ok());
        assert!(validate_relation_name("staging_pharmacy_2020_0204_183000").is_ok());
        assert!(validate_relation_name("feedback_2020_0204").is_ok());
    }

    #[test]
    fn test_empty_name() {
        match validate_relation_name("") {
            Err(Error::MalformedEntity(msg)) => assert!(msg.contains("empty")),
            _ => panic!("Expected MalformedEntity for empty name"),
        }
    }

    #[test]
    fn test_too_long() {
        let long_name = format!("pharmacy_{}", "a".repeat(60));
        match validate_relation_name(&long_name) {
            Err(Error::MalformedEntity(msg)) => assert!(msg.contains("63 character limit")),
            _ => panic!("Expected MalformedEntity for long name"),
        }
    }

    #[test]
    fn test_invalid_characters() {
        let invalid_names = vec![
            "pharmacy-2020",
            "pharmacy.2020",
            "Pharmacy_2020_0204_183000",
            "feedback_2020_0204;",
            "feedback_2020_0204'",
            "feedback_2020_0204\"",
        ];

        for name in invalid_names {
            match validate_relation_name(name) {
                Err(Error::MalformedEntity(msg)) => {
                    assert!(msg.contains("invalid character"), "Name: {}, Error: {}", name, msg)
                }
                _ => panic!("Expected MalformedEntity for: {}", name),
            }
        }
    }

    #[test]
    fn test_uncontrolled_names_rejected() {
        for name in ["pharmacies", "options", "snapshot_registry", "pharmacy_latest", "feedback_today"] {
            assert!(
                validate_relation_name(name).is_err(),
                "Expected error for: {}",
                name
            );
        }
    }

    #[test]
    fn test_sql_injection_attempts() {
        let injection_attempts = vec![
            "feedback_2020_0204; DROP TABLE options; --",
            "pharmacy_2020_0204_183000' OR '1'='1",
        ];

        for name in injection_attempts {
            assert!(validate_relation_name(name).is_err(), "Expected error for: {}", name);
        }
    }

    #[test]
    fn test_helpers_produce_valid_names() {
        let v = VersionId::parse("2020_0204_183000").unwrap();
        assert_eq!(snapshot_table(&v).unwrap(), "pharmacy_2020_0204_183000");
        assert_eq!(staging_table(&v).unwrap(), "staging_pharmacy_2020_0204_183000");
        let k = ShardKey::parse("2020_0204").unwrap();
        assert_eq!(shard_table(&k).unwrap(), "feedback_2020_0204");
    }
}
