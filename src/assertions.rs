//! Response-level and aggregate-level assertions.
//!
//! Predicates are boolean checks carrying a failure message; they are
//! reported, never fatal to the engine. Groups combine predicates with AND
//! (all must pass) or OR (any may pass) and produce an aggregated failure
//! report. Aggregate predicates run over a metrics snapshot, optionally
//! fail-fast.

use crate::extractor::extract_json_path;
use crate::metrics::MetricsSnapshot;
use crate::response::ResponseRecord;
use regex::Regex;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// User-supplied response predicate.
pub type ResponseCheckFn = Arc<dyn Fn(&ResponseRecord) -> Result<(), String> + Send + Sync>;

/// User-supplied snapshot predicate.
pub type SnapshotCheckFn = Arc<dyn Fn(&MetricsSnapshot) -> Result<(), String> + Send + Sync>;

/// A predicate over a single response record.
#[derive(Clone)]
pub enum ResponseAssertion {
    /// Status equals the expected code.
    StatusIs(u16),

    /// Status is one of the expected codes.
    StatusIn(Vec<u16>),

    /// Response time is under the threshold.
    ResponseTimeUnder(Duration),

    /// Body contains the substring.
    BodyContains { needle: String, case_sensitive: bool },

    /// Body matches the regex.
    BodyMatches(String),

    /// JSON path resolves to a value.
    JsonPathExists(String),

    /// JSON path resolves to the expected value. Numeric comparisons are
    /// tolerant: `7` matches `7.0`.
    JsonPathEquals { path: String, expected: Value },

    /// Header is present.
    HeaderPresent(String),

    /// Header equals the expected value.
    HeaderEquals { name: String, expected: String },

    /// Named user callback.
    Custom { name: String, check: ResponseCheckFn },
}

impl fmt::Debug for ResponseAssertion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StatusIs(code) => write!(f, "StatusIs({code})"),
            Self::StatusIn(codes) => write!(f, "StatusIn({codes:?})"),
            Self::ResponseTimeUnder(d) => write!(f, "ResponseTimeUnder({d:?})"),
            Self::BodyContains { needle, case_sensitive } => {
                write!(f, "BodyContains({needle:?}, case_sensitive={case_sensitive})")
            }
            Self::BodyMatches(p) => write!(f, "BodyMatches({p:?})"),
            Self::JsonPathExists(p) => write!(f, "JsonPathExists({p:?})"),
            Self::JsonPathEquals { path, expected } => {
                write!(f, "JsonPathEquals({path:?}, {expected})")
            }
            Self::HeaderPresent(name) => write!(f, "HeaderPresent({name:?})"),
            Self::HeaderEquals { name, expected } => {
                write!(f, "HeaderEquals({name:?}, {expected:?})")
            }
            Self::Custom { name, .. } => write!(f, "Custom({name:?})"),
        }
    }
}

/// Tolerant equality: numbers compare as f64, everything else exactly.
fn json_values_equal(actual: &Value, expected: &Value) -> bool {
    match (actual.as_f64(), expected.as_f64()) {
        (Some(a), Some(e)) => (a - e).abs() < 1e-9,
        _ => actual == expected,
    }
}

impl ResponseAssertion {
    /// Check the predicate, returning the failure message on failure.
    pub fn check(&self, response: &ResponseRecord) -> Result<(), String> {
        match self {
            Self::StatusIs(expected) => {
                if response.status_code == *expected {
                    Ok(())
                } else {
                    Err(format!(
                        "status code mismatch: expected {}, got {}",
                        expected, response.status_code
                    ))
                }
            }

            Self::StatusIn(expected) => {
                if expected.contains(&response.status_code) {
                    Ok(())
                } else {
                    Err(format!(
                        "status code {} not in {:?}",
                        response.status_code, expected
                    ))
                }
            }

            Self::ResponseTimeUnder(threshold) => {
                let actual_ms = response.response_time_us / 1_000;
                let threshold_ms = threshold.as_millis() as u64;
                if actual_ms <= threshold_ms {
                    Ok(())
                } else {
                    Err(format!(
                        "response time {actual_ms}ms exceeds threshold {threshold_ms}ms"
                    ))
                }
            }

            Self::BodyContains { needle, case_sensitive } => {
                let found = if *case_sensitive {
                    response.body.contains(needle.as_str())
                } else {
                    response
                        .body
                        .to_lowercase()
                        .contains(&needle.to_lowercase())
                };
                if found {
                    Ok(())
                } else {
                    Err(format!("body does not contain '{needle}'"))
                }
            }

            Self::BodyMatches(pattern) => {
                let re = Regex::new(pattern)
                    .map_err(|e| format!("invalid regex '{pattern}': {e}"))?;
                if re.is_match(&response.body) {
                    Ok(())
                } else {
                    Err(format!("body does not match /{pattern}/"))
                }
            }

            Self::JsonPathExists(path) => extract_json_path(&response.body, path)
                .map(|_| ())
                .map_err(|e| format!("JSON path '{path}' failed: {e}")),

            Self::JsonPathEquals { path, expected } => {
                let actual = extract_json_path(&response.body, path)
                    .map_err(|e| format!("JSON path '{path}' failed: {e}"))?;
                if json_values_equal(&actual, expected) {
                    Ok(())
                } else {
                    Err(format!(
                        "JSON path '{path}' mismatch: expected {expected}, got {actual}"
                    ))
                }
            }

            Self::HeaderPresent(name) => {
                if crate::request::header_from_blob(&response.headers, name).is_some() {
                    Ok(())
                } else {
                    Err(format!("header '{name}' not found"))
                }
            }

            Self::HeaderEquals { name, expected } => {
                match crate::request::header_from_blob(&response.headers, name) {
                    Some(actual) if actual == *expected => Ok(()),
                    Some(actual) => Err(format!(
                        "header '{name}' mismatch: expected '{expected}', got '{actual}'"
                    )),
                    None => Err(format!("header '{name}' not found")),
                }
            }

            Self::Custom { name, check } => {
                check(response).map_err(|msg| format!("custom check '{name}' failed: {msg}"))
            }
        }
    }
}

/// Outcome of one predicate run, for reporting.
#[derive(Debug, Clone)]
pub struct AssertionOutcome {
    pub description: String,
    pub passed: bool,
    pub message: Option<String>,
}

/// Run every predicate against one response.
pub fn run_response_assertions(
    assertions: &[ResponseAssertion],
    response: &ResponseRecord,
) -> Vec<AssertionOutcome> {
    assertions
        .iter()
        .map(|assertion| {
            let description = format!("{assertion:?}");
            match assertion.check(response) {
                Ok(()) => {
                    debug!(assertion = %description, "Assertion passed");
                    AssertionOutcome {
                        description,
                        passed: true,
                        message: None,
                    }
                }
                Err(msg) => AssertionOutcome {
                    description,
                    passed: false,
                    message: Some(msg),
                },
            }
        })
        .collect()
}

/// How a group combines its predicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupMode {
    /// Succeeds iff all predicates succeed.
    All,
    /// Succeeds iff any predicate succeeds.
    Any,
}

/// A combined set of response predicates.
#[derive(Debug, Clone)]
pub struct AssertionGroup {
    pub name: String,
    pub mode: GroupMode,
    pub assertions: Vec<ResponseAssertion>,
}

impl AssertionGroup {
    pub fn all(name: impl Into<String>, assertions: Vec<ResponseAssertion>) -> Self {
        Self {
            name: name.into(),
            mode: GroupMode::All,
            assertions,
        }
    }

    pub fn any(name: impl Into<String>, assertions: Vec<ResponseAssertion>) -> Self {
        Self {
            name: name.into(),
            mode: GroupMode::Any,
            assertions,
        }
    }

    /// Check the group; on failure the report lists every failed
    /// predicate's message.
    pub fn check(&self, response: &ResponseRecord) -> Result<(), Vec<String>> {
        let failures: Vec<String> = self
            .assertions
            .iter()
            .filter_map(|a| a.check(response).err())
            .collect();

        match self.mode {
            GroupMode::All if failures.is_empty() => Ok(()),
            GroupMode::Any if failures.len() < self.assertions.len() => Ok(()),
            GroupMode::Any if self.assertions.is_empty() => Ok(()),
            _ => Err(failures),
        }
    }
}

/// A predicate over a metrics snapshot.
#[derive(Clone)]
pub enum MetricsAssertion {
    /// Throughput is at least the given requests/second.
    ThroughputAtLeast(f64),

    /// Average response time is at most the given milliseconds.
    AvgResponseTimeUnder(f64),

    /// Maximum response time is at most the given milliseconds.
    MaxResponseTimeUnder(f64),

    /// Error rate is at most the given percentage.
    ErrorRateBelow(f64),

    /// Success rate is at least the given percentage.
    SuccessRateAtLeast(f64),

    /// At least this many requests completed.
    TotalRequestsAtLeast(u64),

    /// Named user callback.
    Custom { name: String, check: SnapshotCheckFn },
}

impl fmt::Debug for MetricsAssertion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ThroughputAtLeast(v) => write!(f, "ThroughputAtLeast({v})"),
            Self::AvgResponseTimeUnder(v) => write!(f, "AvgResponseTimeUnder({v}ms)"),
            Self::MaxResponseTimeUnder(v) => write!(f, "MaxResponseTimeUnder({v}ms)"),
            Self::ErrorRateBelow(v) => write!(f, "ErrorRateBelow({v}%)"),
            Self::SuccessRateAtLeast(v) => write!(f, "SuccessRateAtLeast({v}%)"),
            Self::TotalRequestsAtLeast(v) => write!(f, "TotalRequestsAtLeast({v})"),
            Self::Custom { name, .. } => write!(f, "Custom({name:?})"),
        }
    }
}

impl MetricsAssertion {
    pub fn check(&self, snapshot: &MetricsSnapshot) -> Result<(), String> {
        match self {
            Self::ThroughputAtLeast(min_rps) => {
                if snapshot.requests_per_second >= *min_rps {
                    Ok(())
                } else {
                    Err(format!(
                        "throughput {:.2} rps below required {:.2} rps",
                        snapshot.requests_per_second, min_rps
                    ))
                }
            }
            Self::AvgResponseTimeUnder(max_ms) => {
                if snapshot.avg_response_time_ms <= *max_ms {
                    Ok(())
                } else {
                    Err(format!(
                        "average response time {:.2}ms exceeds {:.2}ms",
                        snapshot.avg_response_time_ms, max_ms
                    ))
                }
            }
            Self::MaxResponseTimeUnder(max_ms) => {
                let actual_ms = snapshot.max_response_time_us as f64 / 1000.0;
                if actual_ms <= *max_ms {
                    Ok(())
                } else {
                    Err(format!(
                        "max response time {actual_ms:.2}ms exceeds {max_ms:.2}ms"
                    ))
                }
            }
            Self::ErrorRateBelow(max_percent) => {
                let actual = snapshot.error_rate_percent();
                if actual <= *max_percent {
                    Ok(())
                } else {
                    Err(format!(
                        "error rate {actual:.2}% exceeds {max_percent:.2}%"
                    ))
                }
            }
            Self::SuccessRateAtLeast(min_percent) => {
                let actual = snapshot.success_rate_percent();
                if actual >= *min_percent {
                    Ok(())
                } else {
                    Err(format!(
                        "success rate {actual:.2}% below {min_percent:.2}%"
                    ))
                }
            }
            Self::TotalRequestsAtLeast(min_total) => {
                if snapshot.total_requests >= *min_total {
                    Ok(())
                } else {
                    Err(format!(
                        "total requests {} below {}",
                        snapshot.total_requests, min_total
                    ))
                }
            }
            Self::Custom { name, check } => {
                check(snapshot).map_err(|msg| format!("custom check '{name}' failed: {msg}"))
            }
        }
    }
}

/// Run aggregate predicates against a snapshot.
///
/// Returns `(ok, failures)`. With `fail_fast`, evaluation stops at the
/// first failure.
pub fn run_metrics_assertions(
    snapshot: &MetricsSnapshot,
    assertions: &[MetricsAssertion],
    fail_fast: bool,
) -> (bool, Vec<String>) {
    let mut failures = Vec::new();
    for assertion in assertions {
        if let Err(msg) = assertion.check(snapshot) {
            failures.push(msg);
            if fail_fast {
                break;
            }
        }
    }
    (failures.is_empty(), failures)
}

/// A combined set of aggregate predicates.
#[derive(Debug, Clone)]
pub struct MetricsAssertionGroup {
    pub name: String,
    pub mode: GroupMode,
    pub assertions: Vec<MetricsAssertion>,
}

impl MetricsAssertionGroup {
    pub fn all(name: impl Into<String>, assertions: Vec<MetricsAssertion>) -> Self {
        Self {
            name: name.into(),
            mode: GroupMode::All,
            assertions,
        }
    }

    pub fn any(name: impl Into<String>, assertions: Vec<MetricsAssertion>) -> Self {
        Self {
            name: name.into(),
            mode: GroupMode::Any,
            assertions,
        }
    }

    pub fn check(&self, snapshot: &MetricsSnapshot) -> Result<(), Vec<String>> {
        let failures: Vec<String> = self
            .assertions
            .iter()
            .filter_map(|a| a.check(snapshot).err())
            .collect();

        match self.mode {
            GroupMode::All if failures.is_empty() => Ok(()),
            GroupMode::Any if failures.len() < self.assertions.len() => Ok(()),
            GroupMode::Any if self.assertions.is_empty() => Ok(()),
            _ => Err(failures),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricsAggregator;
    use crate::request::Protocol;
    use serde_json::json;

    fn response_201() -> ResponseRecord {
        ResponseRecord::ok(Protocol::Http, 201, 120_000)
            .with_body(r#"{"user":{"id":7}}"#)
            .with_headers("Content-Type: application/json\n")
    }

    #[test]
    fn test_assertion_batch_passes() {
        let response = response_201();
        let assertions = vec![
            ResponseAssertion::StatusIs(201),
            ResponseAssertion::JsonPathEquals {
                path: "user.id".to_string(),
                expected: json!(7),
            },
            ResponseAssertion::ResponseTimeUnder(Duration::from_millis(500)),
        ];

        let outcomes = run_response_assertions(&assertions, &response);
        assert!(outcomes.iter().all(|o| o.passed));
    }

    #[test]
    fn test_status_failure_message_shape() {
        let mut response = response_201();
        response.status_code = 500;

        let outcomes = run_response_assertions(
            &[
                ResponseAssertion::StatusIs(201),
                ResponseAssertion::JsonPathEquals {
                    path: "user.id".to_string(),
                    expected: json!(7),
                },
                ResponseAssertion::ResponseTimeUnder(Duration::from_millis(500)),
            ],
            &response,
        );

        assert!(!outcomes[0].passed);
        assert!(outcomes[1].passed);
        assert!(outcomes[2].passed);
        let msg = outcomes[0].message.as_ref().unwrap();
        assert!(msg.contains("expected 201, got 500"), "got: {msg}");
    }

    #[test]
    fn test_status_in_set() {
        let response = response_201();
        assert!(ResponseAssertion::StatusIn(vec![200, 201]).check(&response).is_ok());
        assert!(ResponseAssertion::StatusIn(vec![200, 204]).check(&response).is_err());
    }

    #[test]
    fn test_body_contains_case_flag() {
        let response = ResponseRecord::ok(Protocol::Http, 200, 1).with_body("Hello World");

        assert!(ResponseAssertion::BodyContains {
            needle: "hello".to_string(),
            case_sensitive: false,
        }
        .check(&response)
        .is_ok());

        assert!(ResponseAssertion::BodyContains {
            needle: "hello".to_string(),
            case_sensitive: true,
        }
        .check(&response)
        .is_err());
    }

    #[test]
    fn test_body_matches_regex() {
        let response = ResponseRecord::ok(Protocol::Http, 200, 1).with_body("Order #42");
        assert!(ResponseAssertion::BodyMatches(r"Order #\d+".to_string())
            .check(&response)
            .is_ok());
        assert!(ResponseAssertion::BodyMatches(r"Ticket #\d+".to_string())
            .check(&response)
            .is_err());
    }

    #[test]
    fn test_json_path_numeric_tolerance() {
        let response = ResponseRecord::ok(Protocol::Http, 200, 1).with_body(r#"{"n": 7.0}"#);
        assert!(ResponseAssertion::JsonPathEquals {
            path: "n".to_string(),
            expected: json!(7),
        }
        .check(&response)
        .is_ok());
    }

    #[test]
    fn test_header_predicates() {
        let response = response_201();
        assert!(ResponseAssertion::HeaderPresent("content-type".to_string())
            .check(&response)
            .is_ok());
        assert!(ResponseAssertion::HeaderEquals {
            name: "Content-Type".to_string(),
            expected: "application/json".to_string(),
        }
        .check(&response)
        .is_ok());
        assert!(ResponseAssertion::HeaderEquals {
            name: "Content-Type".to_string(),
            expected: "text/html".to_string(),
        }
        .check(&response)
        .is_err());
    }

    #[test]
    fn test_custom_response_assertion() {
        let response = response_201();
        let assertion = ResponseAssertion::Custom {
            name: "body-not-empty".to_string(),
            check: Arc::new(|r: &ResponseRecord| {
                if r.body.is_empty() {
                    Err("body is empty".to_string())
                } else {
                    Ok(())
                }
            }),
        };
        assert!(assertion.check(&response).is_ok());
    }

    #[test]
    fn test_and_group_requires_all() {
        let response = response_201();
        let group = AssertionGroup::all(
            "strict",
            vec![
                ResponseAssertion::StatusIs(201),
                ResponseAssertion::StatusIs(200),
            ],
        );

        let failures = group.check(&response).unwrap_err();
        assert_eq!(failures.len(), 1);
        assert!(failures[0].contains("expected 200, got 201"));
    }

    #[test]
    fn test_or_group_accepts_any() {
        let response = response_201();
        let group = AssertionGroup::any(
            "lenient",
            vec![
                ResponseAssertion::StatusIs(200),
                ResponseAssertion::StatusIs(201),
            ],
        );
        assert!(group.check(&response).is_ok());

        let group = AssertionGroup::any(
            "hopeless",
            vec![
                ResponseAssertion::StatusIs(400),
                ResponseAssertion::StatusIs(500),
            ],
        );
        assert_eq!(group.check(&response).unwrap_err().len(), 2);
    }

    fn snapshot_with(successes: u64, failures: u64, each_us: u64) -> MetricsSnapshot {
        let metrics = MetricsAggregator::new(1);
        for _ in 0..successes {
            metrics.record(each_us, true);
        }
        for _ in 0..failures {
            metrics.record(each_us, false);
        }
        metrics.snapshot()
    }

    #[test]
    fn test_metrics_assertions_pass_and_fail() {
        let snap = snapshot_with(99, 1, 10_000);

        let assertions = vec![
            MetricsAssertion::ErrorRateBelow(2.0),
            MetricsAssertion::SuccessRateAtLeast(95.0),
            MetricsAssertion::AvgResponseTimeUnder(50.0),
            MetricsAssertion::TotalRequestsAtLeast(100),
        ];
        let (ok, failures) = run_metrics_assertions(&snap, &assertions, false);
        assert!(ok, "failures: {failures:?}");

        let assertions = vec![
            MetricsAssertion::ErrorRateBelow(0.5),
            MetricsAssertion::TotalRequestsAtLeast(1_000),
        ];
        let (ok, failures) = run_metrics_assertions(&snap, &assertions, false);
        assert!(!ok);
        assert_eq!(failures.len(), 2);
    }

    #[test]
    fn test_metrics_fail_fast_stops_early() {
        let snap = snapshot_with(1, 9, 10_000);

        let assertions = vec![
            MetricsAssertion::ErrorRateBelow(1.0),
            MetricsAssertion::SuccessRateAtLeast(99.0),
        ];
        let (ok, failures) = run_metrics_assertions(&snap, &assertions, true);
        assert!(!ok);
        assert_eq!(failures.len(), 1);
    }

    #[test]
    fn test_metrics_and_group_chaining() {
        // 100 requests, 1s busy each, all successful -> 1 rps, 1000ms avg
        let snap = snapshot_with(100, 0, 1_000_000);

        let group = MetricsAssertionGroup::all(
            "sla",
            vec![
                MetricsAssertion::ThroughputAtLeast(0.5),
                MetricsAssertion::ErrorRateBelow(1.0),
                MetricsAssertion::AvgResponseTimeUnder(2_000.0),
            ],
        );
        assert!(group.check(&snap).is_ok());

        let group = MetricsAssertionGroup::all(
            "sla",
            vec![
                MetricsAssertion::ThroughputAtLeast(10.0),
                MetricsAssertion::ErrorRateBelow(1.0),
            ],
        );
        let failures = group.check(&snap).unwrap_err();
        assert_eq!(failures.len(), 1);
        assert!(failures[0].contains("throughput"));
    }

    #[test]
    fn test_metrics_or_group() {
        let snap = snapshot_with(10, 0, 1_000);
        let group = MetricsAssertionGroup::any(
            "either",
            vec![
                MetricsAssertion::TotalRequestsAtLeast(1_000_000),
                MetricsAssertion::SuccessRateAtLeast(99.0),
            ],
        );
        assert!(group.check(&snap).is_ok());
    }

    #[test]
    fn test_custom_metrics_assertion() {
        let snap = snapshot_with(5, 0, 1_000);
        let assertion = MetricsAssertion::Custom {
            name: "min-sample".to_string(),
            check: Arc::new(|s: &MetricsSnapshot| {
                if s.total_requests >= 5 {
                    Ok(())
                } else {
                    Err("not enough samples".to_string())
                }
            }),
        };
        assert!(assertion.check(&snap).is_ok());
    }
}
