//! Query parameters and result shapes for the analytics API

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Default number of records returned by a search
pub const DEFAULT_SEARCH_LIMIT: usize = 100;

/// Default window for enhanced stats, in hours
pub const DEFAULT_STATS_HOURS: u32 = 24;

/// Widest enhanced-stats window, in hours (ten years)
pub const MAX_STATS_HOURS: u32 = 24 * 366 * 10;

/// Size of the top-clients and top-models lists
pub const TOP_N: usize = 10;

/// Raw search query string
///
/// Every field is kept as text so that malformed numbers fall back to their
/// defaults instead of rejecting the request.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchParams {
    pub model: Option<String>,
    pub search: Option<String>,
    pub prompt_search: Option<String>,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub limit: Option<String>,
}

/// Validated search filter
#[derive(Debug, Clone, PartialEq)]
pub struct SearchFilter {
    /// Exact model match
    pub model: Option<String>,
    /// Substring of the stored prompt
    pub search: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub limit: usize,
}

impl Default for SearchFilter {
    fn default() -> Self {
        Self {
            model: None,
            search: None,
            start: None,
            end: None,
            limit: DEFAULT_SEARCH_LIMIT,
        }
    }
}

impl From<SearchParams> for SearchFilter {
    fn from(params: SearchParams) -> Self {
        let search = non_empty(params.search).or_else(|| non_empty(params.prompt_search));
        Self {
            model: non_empty(params.model),
            search,
            start: params.start_time.as_deref().and_then(parse_unix_seconds),
            end: params.end_time.as_deref().and_then(parse_unix_seconds),
            limit: params
                .limit
                .as_deref()
                .and_then(|l| l.trim().parse::<usize>().ok())
                .filter(|l| *l > 0)
                .unwrap_or(DEFAULT_SEARCH_LIMIT),
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

fn parse_unix_seconds(value: &str) -> Option<DateTime<Utc>> {
    let secs = value.trim().parse::<i64>().ok()?;
    Utc.timestamp_opt(secs, 0).single()
}

/// `?hours=N` for enhanced stats
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StatsParams {
    pub hours: Option<String>,
}

impl StatsParams {
    pub fn hours(&self) -> u32 {
        self.hours
            .as_deref()
            .and_then(|h| h.trim().parse::<u32>().ok())
            .filter(|h| *h > 0)
            .map(|h| h.min(MAX_STATS_HOURS))
            .unwrap_or(DEFAULT_STATS_HOURS)
    }
}

/// `/analytics/stats` body
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BasicStats {
    pub backend: String,
    pub data_dir: String,
    pub enabled: bool,
    pub queue_size: usize,
    pub dropped_records: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_records: Option<u64>,
}

/// `/analytics/stats/enhanced` body
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EnhancedStats {
    pub total_requests: u64,
    pub unique_ips: u64,
    pub unique_models: u64,
    pub avg_response_time_ms: f64,
    pub avg_input_tokens: f64,
    pub avg_output_tokens: f64,
    pub avg_tokens_per_second: f64,
    pub requests_per_minute: f64,
    pub success_rate_percent: f64,
    pub error_rate_percent: f64,
    pub top_ips: Vec<IpStat>,
    pub top_models: Vec<ModelStat>,
    pub recent_trend: Vec<TrendPoint>,
    pub time_range_hours: u32,
    pub data_start_time: String,
    pub data_end_time: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IpStat {
    pub ip: String,
    pub request_count: u64,
    pub avg_latency_ms: f64,
    pub total_tokens: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelStat {
    pub model: String,
    pub request_count: u64,
    pub avg_latency_ms: f64,
    pub total_tokens: u64,
}

/// One hourly bucket; `timestamp` is the hour start in unix seconds
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrendPoint {
    pub timestamp: i64,
    pub request_count: u64,
    pub avg_latency: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_defaults() {
        let filter = SearchFilter::from(SearchParams::default());
        assert_eq!(filter, SearchFilter::default());
        assert_eq!(filter.limit, 100);
    }

    #[test]
    fn test_filter_parses_all_fields() {
        let filter = SearchFilter::from(SearchParams {
            model: Some("phi4".to_string()),
            search: None,
            prompt_search: Some("article".to_string()),
            start_time: Some("1700000000".to_string()),
            end_time: Some("1700003600".to_string()),
            limit: Some("5".to_string()),
        });
        assert_eq!(filter.model.as_deref(), Some("phi4"));
        assert_eq!(filter.search.as_deref(), Some("article"));
        assert_eq!(filter.start.unwrap().timestamp(), 1_700_000_000);
        assert_eq!(filter.end.unwrap().timestamp(), 1_700_003_600);
        assert_eq!(filter.limit, 5);
    }

    #[test]
    fn test_search_takes_precedence_over_prompt_search() {
        let filter = SearchFilter::from(SearchParams {
            search: Some("a".to_string()),
            prompt_search: Some("b".to_string()),
            ..Default::default()
        });
        assert_eq!(filter.search.as_deref(), Some("a"));
    }

    #[test]
    fn test_invalid_numbers_fall_back_to_defaults() {
        let filter = SearchFilter::from(SearchParams {
            start_time: Some("yesterday".to_string()),
            limit: Some("-3".to_string()),
            ..Default::default()
        });
        assert!(filter.start.is_none());
        assert_eq!(filter.limit, DEFAULT_SEARCH_LIMIT);

        let filter = SearchFilter::from(SearchParams {
            limit: Some("0".to_string()),
            ..Default::default()
        });
        assert_eq!(filter.limit, DEFAULT_SEARCH_LIMIT);
    }

    #[test]
    fn test_stats_hours() {
        assert_eq!(StatsParams::default().hours(), 24);
        assert_eq!(StatsParams { hours: Some("1".into()) }.hours(), 1);
        assert_eq!(StatsParams { hours: Some("0".into()) }.hours(), 24);
        assert_eq!(StatsParams { hours: Some("abc".into()) }.hours(), 24);
    }

    #[test]
    fn test_stats_hours_are_capped() {
        let huge = StatsParams {
            hours: Some("4000000000".into()),
        };
        assert_eq!(huge.hours(), MAX_STATS_HOURS);
        let exact = StatsParams {
            hours: Some(MAX_STATS_HOURS.to_string()),
        };
        assert_eq!(exact.hours(), MAX_STATS_HOURS);
    }
}
