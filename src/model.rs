// Metric model - the wire and storage representation of one measurement
//
// A metric is either a counter (integer delta, accumulated on update) or a
// gauge (float value, replaced on update). The Rust type makes the
// "exactly one of delta/value" invariant unrepresentable to break; the
// loosely typed `MetricRecord` only exists at the JSON boundary.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::MetricError;

/// Reserved name of the agent's poll counter.
pub const POLL_COUNT: &str = "PollCount";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Counter,
    Gauge,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
        }
    }
}

impl FromStr for MetricKind {
    type Err = MetricError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "counter" => Ok(MetricKind::Counter),
            "gauge" => Ok(MetricKind::Gauge),
            other => Err(MetricError::InvalidMetricType(other.to_string())),
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MetricValue {
    Counter(i64),
    Gauge(f64),
}

impl MetricValue {
    pub fn kind(&self) -> MetricKind {
        match self {
            MetricValue::Counter(_) => MetricKind::Counter,
            MetricValue::Gauge(_) => MetricKind::Gauge,
        }
    }

    /// Parses a plain-text value literal for the given kind.
    pub fn parse(kind: MetricKind, raw: &str) -> Result<Self, MetricError> {
        let wrong = || MetricError::WrongMetricValue(raw.to_string());
        match kind {
            MetricKind::Counter => raw.parse().map(MetricValue::Counter).map_err(|_| wrong()),
            MetricKind::Gauge => {
                let value: f64 = raw.parse().map_err(|_| wrong())?;
                // Not representable in the JSON snapshot or the wire schema
                if !value.is_finite() {
                    return Err(wrong());
                }
                Ok(MetricValue::Gauge(value))
            }
        }
    }

    /// Applies the accumulation rule: counters add, gauges replace.
    ///
    /// Mixing kinds replaces the value outright; callers key storage by
    /// `(id, kind)` so that never happens in practice.
    pub fn accumulate(&mut self, incoming: MetricValue) {
        *self = match (*self, incoming) {
            (MetricValue::Counter(stored), MetricValue::Counter(delta)) => {
                MetricValue::Counter(stored.saturating_add(delta))
            }
            (_, other) => other,
        };
    }
}

impl fmt::Display for MetricValue {
    /// Canonical text form shared by every backend: integers as-is, floats
    /// in their shortest round-trip form without exponent.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricValue::Counter(delta) => write!(f, "{}", delta),
            MetricValue::Gauge(value) => write!(f, "{}", value),
        }
    }
}

/// One named measurement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "MetricRecord", into = "MetricRecord")]
pub struct Metric {
    pub id: String,
    pub value: MetricValue,
}

impl Metric {
    pub fn counter(id: impl Into<String>, delta: i64) -> Self {
        Metric {
            id: id.into(),
            value: MetricValue::Counter(delta),
        }
    }

    pub fn gauge(id: impl Into<String>, value: f64) -> Self {
        Metric {
            id: id.into(),
            value: MetricValue::Gauge(value),
        }
    }

    /// Builds a metric from the three path segments of `/update/{type}/{name}/{value}`.
    pub fn parse(kind: &str, id: &str, raw_value: &str) -> Result<Self, MetricError> {
        let kind: MetricKind = kind.parse()?;
        if id.is_empty() {
            return Err(MetricError::MissingName);
        }
        Ok(Metric {
            id: id.to_string(),
            value: MetricValue::parse(kind, raw_value)?,
        })
    }

    pub fn kind(&self) -> MetricKind {
        self.value.kind()
    }
}

/// JSON shape: `{"id", "type", "delta"?, "value"?}`.
///
/// Used directly for lookups (`POST /value`), where neither `delta` nor
/// `value` is present yet.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    pub id: String,

    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
}

impl TryFrom<MetricRecord> for Metric {
    type Error = MetricError;

    fn try_from(record: MetricRecord) -> Result<Self, Self::Error> {
        let kind: MetricKind = record.kind.parse()?;
        if record.id.is_empty() {
            return Err(MetricError::MissingName);
        }

        let value = match (kind, record.delta, record.value) {
            (MetricKind::Counter, Some(delta), None) => MetricValue::Counter(delta),
            (MetricKind::Gauge, None, Some(value)) if value.is_finite() => {
                MetricValue::Gauge(value)
            }
            _ => {
                return Err(MetricError::WrongMetricValue(format!(
                    "{} metric '{}' must carry exactly {}",
                    kind,
                    record.id,
                    if kind == MetricKind::Counter {
                        "a delta"
                    } else {
                        "a finite value"
                    }
                )))
            }
        };

        Ok(Metric {
            id: record.id,
            value,
        })
    }
}

impl From<Metric> for MetricRecord {
    fn from(metric: Metric) -> Self {
        let kind = metric.kind().as_str().to_string();
        let (delta, value) = match metric.value {
            MetricValue::Counter(delta) => (Some(delta), None),
            MetricValue::Gauge(value) => (None, Some(value)),
        };
        MetricRecord {
            id: metric.id,
            kind,
            delta,
            value,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_carries_only_the_field_for_its_kind() {
        let json = serde_json::to_string(&Metric::counter("PollCount", 5)).unwrap();
        assert_eq!(json, r#"{"id":"PollCount","type":"counter","delta":5}"#);

        let json = serde_json::to_string(&Metric::gauge("Alloc", 1.5)).unwrap();
        assert_eq!(json, r#"{"id":"Alloc","type":"gauge","value":1.5}"#);
    }

    #[test]
    fn test_decoding_rejects_unknown_type() {
        let record: MetricRecord =
            serde_json::from_str(r#"{"id":"h","type":"histogram","value":1.0}"#).unwrap();
        assert_eq!(
            Metric::try_from(record),
            Err(MetricError::InvalidMetricType("histogram".into()))
        );
    }

    #[test]
    fn test_decoding_rejects_mismatched_fields() {
        for raw in [
            r#"{"id":"c","type":"counter","value":1.0}"#,
            r#"{"id":"c","type":"counter"}"#,
            r#"{"id":"g","type":"gauge","delta":1}"#,
            r#"{"id":"g","type":"gauge","delta":1,"value":2.0}"#,
        ] {
            let decoded: Result<Metric, _> = serde_json::from_str(raw);
            assert!(decoded.is_err(), "{} should be rejected", raw);
        }
    }

    #[test]
    fn test_parse_path_segments() {
        assert_eq!(
            Metric::parse("counter", "hits", "42").unwrap(),
            Metric::counter("hits", 42)
        );
        assert_eq!(
            Metric::parse("gauge", "temp", "-0.25").unwrap(),
            Metric::gauge("temp", -0.25)
        );
        assert!(matches!(
            Metric::parse("counter", "hits", "4.2"),
            Err(MetricError::WrongMetricValue(_))
        ));
        assert!(matches!(
            Metric::parse("gauge", "temp", "NaN"),
            Err(MetricError::WrongMetricValue(_))
        ));
        assert!(matches!(
            Metric::parse("histogram", "x", "1"),
            Err(MetricError::InvalidMetricType(_))
        ));
        assert_eq!(Metric::parse("gauge", "", "1"), Err(MetricError::MissingName));
    }

    #[test]
    fn test_accumulation_rule() {
        let mut counter = MetricValue::Counter(3);
        counter.accumulate(MetricValue::Counter(4));
        assert_eq!(counter, MetricValue::Counter(7));

        let mut gauge = MetricValue::Gauge(3.0);
        gauge.accumulate(MetricValue::Gauge(1.5));
        assert_eq!(gauge, MetricValue::Gauge(1.5));
    }

    #[test]
    fn test_canonical_text_form() {
        assert_eq!(MetricValue::Counter(-12).to_string(), "-12");
        assert_eq!(MetricValue::Gauge(0.1).to_string(), "0.1");
        assert_eq!(MetricValue::Gauge(3.0).to_string(), "3");
        assert_eq!(MetricValue::Gauge(1e21).to_string(), "1000000000000000000000");
    }
}
