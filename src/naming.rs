//! Backup folder naming
//!
//! A backup folder is named `<logicalName>_[<timestamp>]`, the timestamp
//! formatted as `YYYY-MM-DDThh.mm.ss±hhmm` (no `:` anywhere, so the name is
//! safe as a path segment on every provider). The logical name is
//! everything before the final `_[`, so names with embedded underscores or
//! numeric discriminators round-trip unchanged.

use chrono::{DateTime, FixedOffset, TimeZone};
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// chrono format of the bracketed timestamp
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H.%M.%S%z";

/// chrono format written to backup folder descriptions, offset with a colon
pub const DESCRIPTION_FORMAT: &str = "%Y-%m-%dT%H.%M.%S%:z";

static BACKUP_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?P<name>.+)_\[(?P<ts>\d{4}-\d{2}-\d{2}T\d{2}\.\d{2}\.\d{2}[+-]\d{4})\]$")
        .expect("backup name pattern is valid")
});

/// Why a folder name is not a backup name
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NameError {
    #[error("\"{0}\" does not match the backup name pattern")]
    NoMatch(String),
    #[error("\"{name}\" has an unparseable timestamp: {reason}")]
    BadTimestamp { name: String, reason: String },
}

/// A decoded backup folder name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupName {
    pub logical_name: String,
    pub timestamp: DateTime<FixedOffset>,
}

/// Format a timestamp the way it appears inside backup names
pub fn format_timestamp<Tz: TimeZone>(timestamp: &DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    timestamp.format(TIMESTAMP_FORMAT).to_string().replace(':', "")
}

/// Format a timestamp for a backup folder description (`+02:00` offsets)
pub fn format_description<Tz: TimeZone>(timestamp: &DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    timestamp.format(DESCRIPTION_FORMAT).to_string()
}

/// Parse a timestamp in the backup-name format
pub fn parse_timestamp(value: &str) -> Result<DateTime<FixedOffset>, chrono::ParseError> {
    DateTime::parse_from_str(value, TIMESTAMP_FORMAT)
}

/// Build the backup folder name for `logical_name` taken at `timestamp`
pub fn backup_name<Tz: TimeZone>(logical_name: &str, timestamp: &DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    format!("{}_[{}]", logical_name, format_timestamp(timestamp))
}

/// Split a backup folder name into logical name and timestamp
pub fn decode_backup_name(folder_name: &str) -> Result<BackupName, NameError> {
    let captures = BACKUP_NAME
        .captures(folder_name)
        .ok_or_else(|| NameError::NoMatch(folder_name.to_string()))?;

    let timestamp =
        parse_timestamp(&captures["ts"]).map_err(|e| NameError::BadTimestamp {
            name: folder_name.to_string(),
            reason: e.to_string(),
        })?;

    Ok(BackupName {
        logical_name: captures["name"].to_string(),
        timestamp,
    })
}

/// Whether `folder_name` decodes as a backup name
pub fn is_backup_name(folder_name: &str) -> bool {
    decode_backup_name(folder_name).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, TimeZone};

    fn ts(offset_secs: i32) -> DateTime<FixedOffset> {
        FixedOffset::east_opt(offset_secs)
            .unwrap()
            .with_ymd_and_hms(2024, 1, 5, 10, 0, 0)
            .unwrap()
    }

    #[test]
    fn test_encode_format() {
        assert_eq!(backup_name("Farm1", &ts(0)), "Farm1_[2024-01-05T10.00.00+0000]");
        assert_eq!(
            backup_name("Farm_123456", &ts(-5 * 3600)),
            "Farm_123456_[2024-01-05T10.00.00-0500]"
        );
        assert_eq!(
            backup_name("Farm", &ts(5 * 3600 + 1800)),
            "Farm_[2024-01-05T10.00.00+0530]"
        );
    }

    #[test]
    fn test_description_keeps_offset_colon() {
        assert_eq!(format_description(&ts(2 * 3600)), "2024-01-05T10.00.00+02:00");
        assert_eq!(format_description(&ts(-5 * 3600 - 1800)), "2024-01-05T10.00.00-05:30");
        assert_eq!(
            format_description(&ts(2 * 3600)).replace(':', ""),
            format_timestamp(&ts(2 * 3600))
        );
    }

    #[test]
    fn test_decode_keeps_embedded_underscores() {
        let decoded = decode_backup_name("My_Farm_123456_[2024-01-05T10.00.00+0200]").unwrap();
        assert_eq!(decoded.logical_name, "My_Farm_123456");
        assert_eq!(decoded.timestamp, ts(2 * 3600));
    }

    #[test]
    fn test_decode_rejects_non_backups() {
        assert!(matches!(
            decode_backup_name("Farm1_random"),
            Err(NameError::NoMatch(_))
        ));
        assert!(matches!(
            decode_backup_name("_[2024-01-05T10.00.00+0000]"),
            Err(NameError::NoMatch(_))
        ));
        assert!(matches!(
            decode_backup_name("Farm1_[2024-01-05T10:00:00+00:00]"),
            Err(NameError::NoMatch(_))
        ));
        assert!(matches!(
            decode_backup_name("Farm1_[2024-01-05T10.00.00+0000]x"),
            Err(NameError::NoMatch(_))
        ));
    }

    #[test]
    fn test_decode_rejects_impossible_dates() {
        assert!(matches!(
            decode_backup_name("Farm1_[2024-13-45T10.00.00+0000]"),
            Err(NameError::BadTimestamp { .. })
        ));
    }

    #[test]
    fn test_round_trip_with_nested_brackets() {
        let name = backup_name("Farm_[old]", &ts(0));
        let decoded = decode_backup_name(&name).unwrap();
        assert_eq!(decoded.logical_name, "Farm_[old]");
    }
}
