//! Shared SQLite helpers: declarative table definitions, schema validation and
//! `user_version`-based migrations.

mod versioned_schema;

pub use versioned_schema::{
    open_in_memory, open_versioned, Column, SqlType, Table, VersionedSchema, BASE_DB_VERSION,
};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use serde::de::DeserializeOwned;

/// Fixed-width RFC 3339 (millisecond precision, `Z` suffix), so stored
/// timestamps compare correctly as text.
pub fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_datetime(row: &rusqlite::Row, column: &str) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(column)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e)))
}

pub fn parse_optional_datetime(
    row: &rusqlite::Row,
    column: &str,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(column)?;
    raw.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e)))
    })
    .transpose()
}

/// Decode a JSON text column.
pub fn json_column<T: DeserializeOwned>(row: &rusqlite::Row, column: &str) -> rusqlite::Result<T> {
    let raw: String = row.get(column)?;
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_formatted_datetimes_sort_as_text() {
        let earlier = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap();
        let later = earlier + chrono::Duration::milliseconds(1);
        assert_eq!(format_datetime(&earlier), "2026-01-02T03:04:05.000Z");
        assert!(format_datetime(&earlier) < format_datetime(&later));
    }
}
