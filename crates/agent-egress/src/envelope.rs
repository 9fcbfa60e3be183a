// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Telemetry records carried through the egress pipeline.
//!
//! An [`Envelope`] is opaque to most of the pipeline. The transponder only
//! touches its tags and the counter aggregator only looks inside counters.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Structured tag value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TagValue {
    Text(String),
    Integer(i64),
    Decimal(f64),
}

impl fmt::Display for TagValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(text) => write!(f, "{text}"),
            Self::Integer(value) => write!(f, "{value}"),
            Self::Decimal(value) => write!(f, "{value}"),
        }
    }
}

impl From<&str> for TagValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for TagValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for TagValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<f64> for TagValue {
    fn from(value: f64) -> Self {
        Self::Decimal(value)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogType {
    Out,
    Err,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Log {
    pub payload: Vec<u8>,
    pub log_type: LogType,
}

/// Monotonic counter. `delta` is the increment since the last emission,
/// `total` is the running sum stamped by the counter aggregator.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Counter {
    pub name: String,
    pub delta: u64,
    pub total: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GaugeValue {
    pub unit: String,
    pub value: f64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Gauge {
    pub metrics: HashMap<String, GaugeValue>,
}

/// Duration between two nanosecond timestamps.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Timer {
    pub name: String,
    pub start: i64,
    pub stop: i64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub title: String,
    pub body: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Payload {
    Log(Log),
    Counter(Counter),
    Gauge(Gauge),
    Timer(Timer),
    Event(Event),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Nanoseconds since the unix epoch.
    pub timestamp: i64,
    pub source_id: String,
    #[serde(default)]
    pub instance_id: String,
    #[serde(default)]
    pub tags: HashMap<String, TagValue>,
    /// Legacy string-only tags, kept consistent with `tags` before egress.
    #[serde(default)]
    pub deprecated_tags: HashMap<String, String>,
    pub message: Payload,
}

impl Envelope {
    pub fn new(source_id: impl Into<String>, message: Payload) -> Self {
        Self {
            timestamp: now_nanos(),
            source_id: source_id.into(),
            instance_id: String::new(),
            tags: HashMap::new(),
            deprecated_tags: HashMap::new(),
            message,
        }
    }

    pub fn counter(source_id: impl Into<String>, name: impl Into<String>, delta: u64) -> Self {
        Self::new(
            source_id,
            Payload::Counter(Counter {
                name: name.into(),
                delta,
                total: 0,
            }),
        )
    }

    pub fn log(source_id: impl Into<String>, line: impl Into<Vec<u8>>) -> Self {
        Self::new(
            source_id,
            Payload::Log(Log {
                payload: line.into(),
                log_type: LogType::Out,
            }),
        )
    }

    #[must_use]
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<TagValue>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn as_counter(&self) -> Option<&Counter> {
        match &self.message {
            Payload::Counter(counter) => Some(counter),
            _ => None,
        }
    }

    pub fn as_counter_mut(&mut self) -> Option<&mut Counter> {
        match &mut self.message {
            Payload::Counter(counter) => Some(counter),
            _ => None,
        }
    }
}

fn now_nanos() -> i64 {
    std::time::UNIX_EPOCH
        .elapsed()
        .map(|elapsed| i64::try_from(elapsed.as_nanos()).unwrap_or(i64::MAX))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_value_display() {
        assert_eq!(TagValue::from("prod").to_string(), "prod");
        assert_eq!(TagValue::from(42i64).to_string(), "42");
        assert_eq!(TagValue::from(1.5f64).to_string(), "1.5");
    }

    #[test]
    fn test_counter_accessors() {
        let mut envelope = Envelope::counter("app", "requests", 3);
        assert_eq!(envelope.as_counter().map(|c| c.delta), Some(3));

        if let Some(counter) = envelope.as_counter_mut() {
            counter.total = 10;
        }
        assert_eq!(envelope.as_counter().map(|c| c.total), Some(10));

        let log = Envelope::log("app", "hello");
        assert!(log.as_counter().is_none());
    }

    #[test]
    fn test_envelope_json_shape() {
        let envelope = Envelope::counter("app", "requests", 1).with_tag("env", "prod");
        let json = serde_json::to_value(&envelope).expect("serialize envelope");

        assert_eq!(json["source_id"], "app");
        assert_eq!(json["tags"]["env"]["text"], "prod");
        assert_eq!(json["message"]["counter"]["name"], "requests");
    }
}
