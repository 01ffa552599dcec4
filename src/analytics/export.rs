//! Export rendering for `/analytics/export`

use super::record::AnalyticsRecord;
use chrono::SecondsFormat;
use std::fmt::Write;

const CSV_HEADER: &str =
    "ID,Timestamp,Model,ClientIP,Prompt,Response,InputTokens,OutputTokens,Latency,Status\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExportFormat {
    #[default]
    Json,
    Csv,
}

impl ExportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Json => "json",
            ExportFormat::Csv => "csv",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            ExportFormat::Json => "application/json",
            ExportFormat::Csv => "text/csv; charset=utf-8",
        }
    }

    /// Unknown values fall back to JSON
    pub fn parse_lenient(value: Option<&str>) -> Self {
        match value.map(|v| v.trim().to_ascii_lowercase()) {
            Some(v) if v == "csv" => ExportFormat::Csv,
            _ => ExportFormat::Json,
        }
    }
}

/// Render records in the requested format
pub fn render(records: &[AnalyticsRecord], format: ExportFormat) -> Result<String, serde_json::Error> {
    match format {
        ExportFormat::Json => serde_json::to_string(records),
        ExportFormat::Csv => Ok(to_csv(records)),
    }
}

/// Render a single record
pub fn render_one(record: &AnalyticsRecord, format: ExportFormat) -> Result<String, serde_json::Error> {
    match format {
        ExportFormat::Json => serde_json::to_string(record),
        ExportFormat::Csv => Ok(to_csv(std::slice::from_ref(record))),
    }
}

/// `attachment; filename=...` for a full export or a single message
pub fn content_disposition(format: ExportFormat, message_id: Option<i64>) -> String {
    match message_id {
        Some(id) => format!("attachment; filename=message_{}.{}", id, format.extension()),
        None => format!("attachment; filename=analytics_export.{}", format.extension()),
    }
}

fn to_csv(records: &[AnalyticsRecord]) -> String {
    let mut out = String::from(CSV_HEADER);
    for r in records {
        // writing to a String cannot fail
        let _ = writeln!(
            out,
            "{},{},{},{},{},{},{},{},{:.3},{}",
            r.id,
            r.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
            quote(&r.model),
            quote(&r.client_ip),
            quote(&r.prompt),
            quote(&r.response),
            r.input_tokens,
            r.output_tokens,
            r.latency,
            r.status,
        );
    }
    out
}

/// RFC 4180 quoting: wrap in quotes, double embedded quotes
fn quote(field: &str) -> String {
    format!("\"{}\"", field.replace('"', "\"\""))
}
