// Live channel messages - Decoding of frames pushed by the bench backend
use super::metric::{MetricKey, Snapshot, parse_metric_value};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use thiserror::Error;

const ENVELOPE_KEYS: &[&str] = &["deviceId", "testStationId", "difference"];
const LIFECYCLE_KEYS: &[&str] = &["initialData", "startTime", "lastData", "endTime"];

#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Metrics(MetricUpdate),
    Lifecycle(LifecycleMessage),
    Control(ControlMessage),
    Error(ErrorMessage),
}

/// Raw readings, or a single backend-computed delta when `difference` names a key
#[derive(Debug, Clone, PartialEq)]
pub struct MetricUpdate {
    pub values: Snapshot,
    pub difference: Option<MetricKey>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LifecycleMessage {
    pub initial_data: Option<Snapshot>,
    pub start_time: Option<DateTime<Utc>>,
    pub last_data: Option<Snapshot>,
    pub end_time: Option<DateTime<Utc>>,
}

impl LifecycleMessage {
    fn is_empty(&self) -> bool {
        self.initial_data.is_none()
            && self.start_time.is_none()
            && self.last_data.is_none()
            && self.end_time.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage {
    StopPolling,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorMessage {
    pub error: String,
    pub retry: Option<bool>,
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("frame is neither an object nor an array")]
    Shape,
}

/// Decode one text frame into zero or more messages, preserving their order
pub fn decode_frame(text: &str) -> Result<Vec<InboundMessage>, DecodeError> {
    let value: Value = serde_json::from_str(text)?;
    let mut messages = Vec::new();

    match value {
        Value::Object(object) => decode_object(&object, &mut messages),
        Value::Array(items) => {
            for (idx, item) in items.iter().enumerate() {
                match item.as_object() {
                    Some(object) => decode_object(object, &mut messages),
                    None => tracing::warn!("Skipping array element {} that is not an object", idx),
                }
            }
        }
        _ => return Err(DecodeError::Shape),
    }

    Ok(messages)
}

fn decode_object(object: &Map<String, Value>, out: &mut Vec<InboundMessage>) {
    if let Some(error) = object.get("error") {
        let error = match error {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        let retry = object.get("retry").and_then(|v| match v {
            Value::Bool(b) => Some(*b),
            Value::Number(n) => n.as_f64().map(|n| n != 0.0),
            _ => None,
        });
        out.push(InboundMessage::Error(ErrorMessage { error, retry }));
        return;
    }

    if let Some(stop) = object.get("stopPolling") {
        let mut lifecycle = decode_lifecycle(object);
        if let Value::Object(inner) = stop {
            let nested = decode_lifecycle(inner);
            lifecycle.initial_data = lifecycle.initial_data.or(nested.initial_data);
            lifecycle.start_time = lifecycle.start_time.or(nested.start_time);
            lifecycle.last_data = lifecycle.last_data.or(nested.last_data);
            lifecycle.end_time = lifecycle.end_time.or(nested.end_time);
        }
        if !lifecycle.is_empty() {
            out.push(InboundMessage::Lifecycle(lifecycle));
        }
        out.push(InboundMessage::Control(ControlMessage::StopPolling));
        return;
    }

    if LIFECYCLE_KEYS.iter().any(|k| object.contains_key(*k)) {
        let lifecycle = decode_lifecycle(object);
        if lifecycle.is_empty() {
            tracing::warn!("Dropping lifecycle message without usable fields");
        } else {
            out.push(InboundMessage::Lifecycle(lifecycle));
        }
        return;
    }

    match object.get("difference") {
        Some(Value::String(key)) => match object.get(key).and_then(parse_metric_value) {
            Some(delta) => {
                let key = MetricKey::new(key.as_str());
                let mut values = Snapshot::new();
                values.insert(key.clone(), delta);
                out.push(InboundMessage::Metrics(MetricUpdate {
                    values,
                    difference: Some(key),
                }));
            }
            None => tracing::warn!("Dropping difference message without a value for {}", key),
        },
        Some(other) => tracing::warn!("Dropping message with invalid difference tag: {}", other),
        None => {
            let values = Snapshot::from_raw(
                object
                    .iter()
                    .filter(|(k, _)| !ENVELOPE_KEYS.contains(&k.as_str())),
            );
            if !values.is_empty() {
                out.push(InboundMessage::Metrics(MetricUpdate {
                    values,
                    difference: None,
                }));
            }
        }
    }
}

fn decode_lifecycle(object: &Map<String, Value>) -> LifecycleMessage {
    LifecycleMessage {
        initial_data: object.get("initialData").and_then(decode_snapshot),
        start_time: object.get("startTime").and_then(parse_instant),
        last_data: object.get("lastData").and_then(decode_snapshot),
        end_time: object.get("endTime").and_then(parse_instant),
    }
}

fn decode_snapshot(value: &Value) -> Option<Snapshot> {
    value.as_object().map(|object| Snapshot::from_raw(object))
}

/// Instants travel as epoch milliseconds; RFC 3339 strings are accepted too
pub fn parse_instant(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .and_then(DateTime::from_timestamp_millis),
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .ok()
            .and_then(DateTime::from_timestamp_millis)
            .or_else(|| {
                DateTime::parse_from_rfc3339(s)
                    .ok()
                    .map(|dt| dt.with_timezone(&Utc))
            }),
        _ => None,
    }
}
