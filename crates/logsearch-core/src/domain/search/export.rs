//! Result set serialization for download
//!
//! CSV columns are fixed: `timestamp,level,service,correlation_id,message`.
//! A field containing a comma, quote, CR or LF is wrapped in double quotes
//! with inner quotes doubled. Rows end with CRLF.

use super::entity::{ExportFormat, LogEntryRef};
use crate::error::Result;
use chrono::SecondsFormat;

/// Header row of CSV exports
pub const CSV_COLUMNS: [&str; 5] = ["timestamp", "level", "service", "correlation_id", "message"];

pub fn export(entries: &[LogEntryRef], format: ExportFormat) -> Result<Vec<u8>> {
    match format {
        ExportFormat::Json => export_as_json(entries),
        ExportFormat::Csv => Ok(export_as_csv(entries)),
    }
}

/// Pretty-printed JSON array of entries
pub fn export_as_json(entries: &[LogEntryRef]) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec_pretty(entries)?)
}

pub fn export_as_csv(entries: &[LogEntryRef]) -> Vec<u8> {
    let mut out = String::new();
    write_record(&mut out, CSV_COLUMNS);

    for entry in entries {
        let timestamp = entry.timestamp.to_rfc3339_opts(SecondsFormat::AutoSi, true);
        write_record(
            &mut out,
            [
                timestamp.as_str(),
                entry.level.as_str(),
                entry.service.as_str(),
                entry.correlation_id.as_deref().unwrap_or(""),
                entry.message.as_str(),
            ],
        );
    }
    out.into_bytes()
}

fn write_record<'a>(out: &mut String, fields: impl IntoIterator<Item = &'a str>) {
    for (i, field) in fields.into_iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        write_field(out, field);
    }
    out.push_str("\r\n");
}

fn write_field(out: &mut String, field: &str) {
    if field.contains([',', '"', '\n', '\r']) {
        out.push('"');
        out.push_str(&field.replace('"', "\"\""));
        out.push('"');
    } else {
        out.push_str(field);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn entry(id: i64, message: &str) -> LogEntryRef {
        LogEntryRef {
            id,
            timestamp: Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 0).unwrap(),
            level: "error".to_string(),
            service: "api".to_string(),
            message: message.to_string(),
            correlation_id: None,
            metadata: None,
        }
    }

    #[test]
    fn test_csv_header_and_plain_row() {
        let csv = String::from_utf8(export_as_csv(&[entry(1, "upstream timeout")])).unwrap();
        assert_eq!(
            csv,
            "timestamp,level,service,correlation_id,message\r\n\
             2024-01-15T10:30:00Z,error,api,,upstream timeout\r\n"
        );
    }

    #[test]
    fn test_csv_quotes_special_fields() {
        let csv = String::from_utf8(export_as_csv(&[
            entry(1, "a, b"),
            entry(2, "say \"hi\""),
            entry(3, "line\nbreak"),
        ]))
        .unwrap();
        assert!(csv.contains(",\"a, b\"\r\n"));
        assert!(csv.contains(",\"say \"\"hi\"\"\"\r\n"));
        assert!(csv.contains(",\"line\nbreak\"\r\n"));
    }

    #[test]
    fn test_empty_export_is_header_only() {
        let csv = String::from_utf8(export_as_csv(&[])).unwrap();
        assert_eq!(csv, "timestamp,level,service,correlation_id,message\r\n");
        assert_eq!(export_as_json(&[]).unwrap(), b"[]");
    }

    #[test]
    fn test_json_round_trip() {
        let entries = vec![entry(1, "a, b"), entry(2, "c")];
        let bytes = export(&entries, ExportFormat::Json).unwrap();
        let parsed: Vec<LogEntryRef> = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed, entries);
    }
}
