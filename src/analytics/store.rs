//! SQLite persistence for analytics records (synchronous)
//!
//! Callers on the async side go through [`super::writer::Analytics`], which
//! owns one connection for the single writer and one for reads.

use super::query::{EnhancedStats, IpStat, ModelStat, SearchFilter, TOP_N, TrendPoint};
use super::record::{AnalyticsRecord, RecordStatus};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde_json::{Map, Value};
use std::path::Path;
use std::time::Duration;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS interactions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp INTEGER NOT NULL,
    model TEXT NOT NULL DEFAULT '',
    endpoint TEXT NOT NULL DEFAULT '',
    prompt TEXT NOT NULL DEFAULT '',
    category TEXT NOT NULL DEFAULT '',
    response TEXT NOT NULL DEFAULT '',
    latency REAL NOT NULL DEFAULT 0,
    load_duration REAL NOT NULL DEFAULT 0,
    total_duration REAL NOT NULL DEFAULT 0,
    time_to_first_token REAL NOT NULL DEFAULT 0,
    input_tokens INTEGER NOT NULL DEFAULT 0,
    output_tokens INTEGER NOT NULL DEFAULT 0,
    tokens_per_second REAL NOT NULL DEFAULT 0,
    status_code INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL DEFAULT 'success',
    error TEXT NOT NULL DEFAULT '',
    client_ip TEXT NOT NULL DEFAULT '',
    user_agent TEXT NOT NULL DEFAULT '',
    metadata TEXT NOT NULL DEFAULT '{}'
);
CREATE INDEX IF NOT EXISTS idx_interactions_timestamp ON interactions(timestamp);
CREATE INDEX IF NOT EXISTS idx_interactions_model ON interactions(model);
CREATE INDEX IF NOT EXISTS idx_interactions_category ON interactions(category);
";

const SELECT_COLUMNS: &str = "SELECT id, timestamp, model, endpoint, prompt, category, response, \
    latency, load_duration, total_duration, time_to_first_token, input_tokens, output_tokens, \
    tokens_per_second, status_code, status, error, client_ip, user_agent, metadata \
    FROM interactions";

/// One SQLite connection plus the queries run against it
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path`
    ///
    /// Enables WAL journaling and a busy timeout, then ensures the schema.
    pub fn open(path: &Path, busy_timeout: Duration) -> rusqlite::Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        if !mode.eq_ignore_ascii_case("wal") {
            tracing::warn!(journal_mode = %mode, "SQLite did not switch to WAL journaling");
        }
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.execute_batch(SCHEMA)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Insert a record, returning its id
    pub fn insert(&self, record: &AnalyticsRecord) -> rusqlite::Result<i64> {
        let conn = self.conn.lock();
        let metadata = serde_json::to_string(&record.metadata).unwrap_or_else(|_| "{}".into());

        conn.execute(
            "INSERT INTO interactions (
                timestamp, model, endpoint, prompt, category, response,
                latency, load_duration, total_duration, time_to_first_token,
                input_tokens, output_tokens, tokens_per_second,
                status_code, status, error, client_ip, user_agent, metadata
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)",
            params![
                record.timestamp.timestamp_millis(),
                record.model,
                record.endpoint,
                record.prompt,
                record.category,
                record.response,
                record.latency,
                record.load_duration,
                record.total_duration,
                record.time_to_first_token,
                record.input_tokens as i64,
                record.output_tokens as i64,
                record.tokens_per_second,
                i64::from(record.status_code),
                record.status.as_str(),
                record.error,
                record.client_ip,
                record.user_agent,
                metadata,
            ],
        )?;

        Ok(conn.last_insert_rowid())
    }

    /// Delete every record strictly older than `cutoff`
    pub fn delete_older_than(&self, cutoff: DateTime<Utc>) -> rusqlite::Result<usize> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM interactions WHERE timestamp < ?1",
            params![cutoff.timestamp_millis()],
        )
    }

    /// Newest-first search
    pub fn search(&self, filter: &SearchFilter) -> rusqlite::Result<Vec<AnalyticsRecord>> {
        let conn = self.conn.lock();

        let mut where_clauses = Vec::new();
        let mut args: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

        if let Some(ref model) = filter.model {
            where_clauses.push(format!("model = ?{}", args.len() + 1));
            args.push(Box::new(model.clone()));
        }
        if let Some(ref search) = filter.search {
            where_clauses.push(format!("prompt LIKE ?{} ESCAPE '\\'", args.len() + 1));
            args.push(Box::new(format!("%{}%", escape_like(search))));
        }
        if let Some(start) = filter.start {
            where_clauses.push(format!("timestamp >= ?{}", args.len() + 1));
            args.push(Box::new(start.timestamp_millis()));
        }
        if let Some(end) = filter.end {
            where_clauses.push(format!("timestamp <= ?{}", args.len() + 1));
            args.push(Box::new(end.timestamp_millis()));
        }

        let where_sql = if where_clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", where_clauses.join(" AND "))
        };

        let sql = format!(
            "{}{} ORDER BY timestamp DESC, id DESC LIMIT ?{}",
            SELECT_COLUMNS,
            where_sql,
            args.len() + 1
        );
        args.push(Box::new(i64::try_from(filter.limit).unwrap_or(i64::MAX)));

        let mut stmt = conn.prepare(&sql)?;
        let records = stmt
            .query_map(
                rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())),
                row_to_record,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    pub fn get(&self, id: i64) -> rusqlite::Result<Option<AnalyticsRecord>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("{} WHERE id = ?1", SELECT_COLUMNS),
            params![id],
            row_to_record,
        )
        .optional()
    }

    /// Distinct non-empty model names, sorted
    pub fn models(&self) -> rusqlite::Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT DISTINCT model FROM interactions WHERE model != '' ORDER BY model")?;
        let models = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(models)
    }

    pub fn count(&self) -> rusqlite::Result<u64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM interactions", [], |row| row.get(0))?;
        Ok(count.max(0) as u64)
    }

    /// Aggregate statistics over the last `hours` hours before `now`
    pub fn aggregate(&self, hours: u32, now: DateTime<Utc>) -> rusqlite::Result<EnhancedStats> {
        let conn = self.conn.lock();
        let start = cutoff_before(now, chrono::Duration::hours(i64::from(hours)));
        let since = start.timestamp_millis();

        let (total, unique_ips, unique_models, avg_latency, avg_input, avg_output, successes): (
            i64,
            i64,
            i64,
            f64,
            f64,
            f64,
            i64,
        ) = conn.query_row(
            "SELECT COUNT(*),
                    COUNT(DISTINCT client_ip),
                    COUNT(DISTINCT model),
                    COALESCE(AVG(latency), 0.0),
                    COALESCE(AVG(input_tokens), 0.0),
                    COALESCE(AVG(output_tokens), 0.0),
                    COALESCE(SUM(CASE WHEN status_code < 400 THEN 1 ELSE 0 END), 0)
             FROM interactions WHERE timestamp >= ?1",
            params![since],
            |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                ))
            },
        )?;

        let avg_tokens_per_second: f64 = conn.query_row(
            "SELECT COALESCE(AVG(CAST(output_tokens AS REAL) / latency), 0.0)
             FROM interactions
             WHERE timestamp >= ?1 AND latency > 0 AND output_tokens > 0",
            params![since],
            |row| row.get(0),
        )?;

        let top_ips = {
            let mut stmt = conn.prepare(
                "SELECT client_ip, COUNT(*) AS n, AVG(latency) * 1000.0, COALESCE(SUM(output_tokens), 0)
                 FROM interactions WHERE timestamp >= ?1
                 GROUP BY client_ip ORDER BY n DESC, client_ip ASC LIMIT ?2",
            )?;
            stmt.query_map(params![since, TOP_N as i64], |row| {
                Ok(IpStat {
                    ip: row.get(0)?,
                    request_count: row.get::<_, i64>(1)?.max(0) as u64,
                    avg_latency_ms: row.get(2)?,
                    total_tokens: row.get::<_, i64>(3)?.max(0) as u64,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?
        };

        let top_models = {
            let mut stmt = conn.prepare(
                "SELECT model, COUNT(*) AS n, AVG(latency) * 1000.0, COALESCE(SUM(output_tokens), 0)
                 FROM interactions WHERE timestamp >= ?1
                 GROUP BY model ORDER BY n DESC, model ASC LIMIT ?2",
            )?;
            stmt.query_map(params![since, TOP_N as i64], |row| {
                Ok(ModelStat {
                    model: row.get(0)?,
                    request_count: row.get::<_, i64>(1)?.max(0) as u64,
                    avg_latency_ms: row.get(2)?,
                    total_tokens: row.get::<_, i64>(3)?.max(0) as u64,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?
        };

        let recent_trend = {
            let mut stmt = conn.prepare(
                "SELECT (timestamp / 3600000) * 3600 AS hour, COUNT(*), AVG(latency) * 1000.0
                 FROM interactions WHERE timestamp >= ?1
                 GROUP BY hour ORDER BY hour ASC",
            )?;
            stmt.query_map(params![since], |row| {
                Ok(TrendPoint {
                    timestamp: row.get(0)?,
                    request_count: row.get::<_, i64>(1)?.max(0) as u64,
                    avg_latency: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?
        };

        let total = total.max(0) as u64;
        let (success_rate, error_rate, requests_per_minute) = if total > 0 {
            let success = successes.max(0) as f64 / total as f64 * 100.0;
            (
                success,
                100.0 - success,
                total as f64 / (f64::from(hours) * 60.0),
            )
        } else {
            (0.0, 0.0, 0.0)
        };

        Ok(EnhancedStats {
            total_requests: total,
            unique_ips: unique_ips.max(0) as u64,
            unique_models: unique_models.max(0) as u64,
            avg_response_time_ms: avg_latency * 1000.0,
            avg_input_tokens: avg_input,
            avg_output_tokens: avg_output,
            avg_tokens_per_second,
            requests_per_minute,
            success_rate_percent: success_rate,
            error_rate_percent: error_rate,
            top_ips,
            top_models,
            recent_trend,
            time_range_hours: hours,
            data_start_time: start.to_rfc3339(),
            data_end_time: now.to_rfc3339(),
        })
    }
}

/// `now - span`, clamped to the earliest representable instant
pub fn cutoff_before(now: DateTime<Utc>, span: chrono::Duration) -> DateTime<Utc> {
    now.checked_sub_signed(span).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<AnalyticsRecord> {
    let millis: i64 = row.get(1)?;
    let status: String = row.get(15)?;
    let metadata: String = row.get(19)?;

    Ok(AnalyticsRecord {
        id: row.get(0)?,
        timestamp: DateTime::<Utc>::from_timestamp_millis(millis).unwrap_or_default(),
        model: row.get(2)?,
        endpoint: row.get(3)?,
        prompt: row.get(4)?,
        category: row.get(5)?,
        response: row.get(6)?,
        latency: row.get(7)?,
        load_duration: row.get(8)?,
        total_duration: row.get(9)?,
        time_to_first_token: row.get(10)?,
        input_tokens: row.get::<_, i64>(11)?.max(0) as u64,
        output_tokens: row.get::<_, i64>(12)?.max(0) as u64,
        tokens_per_second: row.get(13)?,
        status_code: u16::try_from(row.get::<_, i64>(14)?).unwrap_or(0),
        status: RecordStatus::from_db(&status),
        error: row.get(16)?,
        client_ip: row.get(17)?,
        user_agent: row.get(18)?,
        metadata: serde_json::from_str::<Map<String, Value>>(&metadata).unwrap_or_default(),
    })
}

fn escape_like(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics::record::sample_record;

    fn open_store(dir: &tempfile::TempDir) -> SqliteStore {
        SqliteStore::open(&dir.path().join("test.db"), Duration::from_secs(5))
            .expect("store should open")
    }

    fn record_at(model: &str, prompt: &str, ts: DateTime<Utc>) -> AnalyticsRecord {
        let mut record = sample_record();
        record.model = model.to_string();
        record.prompt = prompt.to_string();
        record.timestamp = ts;
        record
    }

    #[test]
    fn test_insert_and_get_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);

        let record = sample_record();
        let id = store.insert(&record).unwrap();
        assert!(id > 0);

        let loaded = store.get(id).unwrap().expect("record should exist");
        assert_eq!(loaded.id, id);
        assert_eq!(loaded.model, "phi4");
        assert_eq!(loaded.output_tokens, 10);
        assert_eq!(loaded.status, RecordStatus::Success);
        assert_eq!(
            loaded.timestamp.timestamp_millis(),
            record.timestamp.timestamp_millis()
        );
        assert_eq!(loaded.metadata["endpoint"], "generate");
    }

    #[test]
    fn test_get_missing_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        assert!(store.get(42).unwrap().is_none());
    }

    #[test]
    fn test_search_filters_and_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        let now = Utc::now();

        store
            .insert(&record_at("phi4", "Summarize the article", now - chrono::Duration::minutes(3)))
            .unwrap();
        store
            .insert(&record_at("llama3", "Translate this", now - chrono::Duration::minutes(2)))
            .unwrap();
        store
            .insert(&record_at("phi4", "Explain 100% of it", now - chrono::Duration::minutes(1)))
            .unwrap();

        let all = store.search(&SearchFilter::default()).unwrap();
        assert_eq!(all.len(), 3);
        assert!(all[0].timestamp >= all[1].timestamp);
        assert!(all[1].timestamp >= all[2].timestamp);

        let phi = store
            .search(&SearchFilter {
                model: Some("phi4".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(phi.len(), 2);

        let text = store
            .search(&SearchFilter {
                search: Some("article".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(text.len(), 1);
        assert_eq!(text[0].prompt, "Summarize the article");

        // wildcard characters match literally
        let percent = store
            .search(&SearchFilter {
                search: Some("100%".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(percent.len(), 1);

        let limited = store
            .search(&SearchFilter {
                limit: 1,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(limited.len(), 1);
        assert!(limited[0].prompt.starts_with("Explain"));

        let windowed = store
            .search(&SearchFilter {
                start: Some(now - chrono::Duration::seconds(150)),
                end: Some(now),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(windowed.len(), 2);
    }

    #[test]
    fn test_delete_older_than() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        let now = Utc::now();

        store
            .insert(&record_at("old", "p", now - chrono::Duration::days(8)))
            .unwrap();
        store.insert(&record_at("new", "p", now)).unwrap();

        let deleted = store
            .delete_older_than(now - chrono::Duration::days(7))
            .unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(store.models().unwrap(), vec!["new".to_string()]);
    }

    #[test]
    fn test_models_are_distinct_and_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        let now = Utc::now();
        for model in ["phi4", "llama3", "phi4", ""] {
            store.insert(&record_at(model, "p", now)).unwrap();
        }
        assert_eq!(
            store.models().unwrap(),
            vec!["llama3".to_string(), "phi4".to_string()]
        );
        assert_eq!(store.count().unwrap(), 4);
    }

    #[test]
    fn test_aggregate_empty_window() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);

        let stats = store.aggregate(1, Utc::now()).unwrap();
        assert_eq!(stats.total_requests, 0);
        assert!(stats.top_ips.is_empty());
        assert!(stats.top_models.is_empty());
        assert!(stats.recent_trend.is_empty());
        assert_eq!(stats.time_range_hours, 1);
        assert_eq!(stats.success_rate_percent, 0.0);
    }

    #[test]
    fn test_aggregate_window_past_calendar_range_is_clamped() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        store.insert(&record_at("phi4", "p", Utc::now())).unwrap();

        let stats = store.aggregate(u32::MAX, Utc::now()).unwrap();
        assert_eq!(stats.total_requests, 1);
        assert_eq!(stats.time_range_hours, u32::MAX);
    }

    #[test]
    fn test_cutoff_before_saturates() {
        let now = Utc::now();
        assert_eq!(
            cutoff_before(now, chrono::Duration::days(7)),
            now - chrono::Duration::days(7)
        );
        assert_eq!(
            cutoff_before(now, chrono::Duration::days(200_000_000)),
            DateTime::<Utc>::MIN_UTC
        );
    }

    #[test]
    fn test_aggregate_counts_and_groups() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        let now = Utc::now();

        let mut a = record_at("phi4", "p", now - chrono::Duration::minutes(5));
        a.client_ip = "10.0.0.1".to_string();
        a.latency = 1.0;
        a.output_tokens = 10;
        let mut b = record_at("phi4", "p", now - chrono::Duration::minutes(4));
        b.client_ip = "10.0.0.1".to_string();
        b.latency = 2.0;
        b.output_tokens = 20;
        let mut c = record_at("llama3", "p", now - chrono::Duration::minutes(3));
        c.client_ip = "10.0.0.2".to_string();
        c.latency = 3.0;
        c.output_tokens = 0;
        c.status_code = 502;
        c.status = RecordStatus::Error;
        // outside the window
        let d = record_at("mistral", "p", now - chrono::Duration::hours(3));

        for r in [&a, &b, &c, &d] {
            store.insert(r).unwrap();
        }

        let stats = store.aggregate(1, now).unwrap();
        assert_eq!(stats.total_requests, 3);
        assert_eq!(stats.unique_ips, 2);
        assert_eq!(stats.unique_models, 2);
        assert!((stats.avg_response_time_ms - 2000.0).abs() < 1e-6);
        assert!((stats.success_rate_percent - 200.0 / 3.0).abs() < 1e-6);
        assert!((stats.error_rate_percent - 100.0 / 3.0).abs() < 1e-6);
        // (10/1 + 20/2) / 2
        assert!((stats.avg_tokens_per_second - 10.0).abs() < 1e-6);
        assert!((stats.requests_per_minute - 3.0 / 60.0).abs() < 1e-9);

        assert_eq!(stats.top_models[0].model, "phi4");
        assert_eq!(stats.top_models[0].request_count, 2);
        assert_eq!(stats.top_models[0].total_tokens, 30);
        assert!((stats.top_models[0].avg_latency_ms - 1500.0).abs() < 1e-6);
        assert_eq!(stats.top_ips[0].ip, "10.0.0.1");

        let trend_total: u64 = stats.recent_trend.iter().map(|p| p.request_count).sum();
        assert_eq!(trend_total, 3);
        for point in &stats.recent_trend {
            assert_eq!(point.timestamp % 3600, 0);
        }
    }

    #[test]
    fn test_escape_like() {
        assert_eq!(escape_like("a%b_c\\d"), "a\\%b\\_c\\\\d");
    }
}
