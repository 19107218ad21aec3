// src/events/event.rs

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// A cloud-event style message carried by the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub source: String,
    #[serde(default)]
    pub subject: Option<String>,
    pub time: DateTime<Utc>,
    #[serde(default)]
    pub data: Value,
    /// Extension attributes (e.g. `orderid`), used for correlation keys.
    #[serde(flatten)]
    pub extensions: BTreeMap<String, Value>,
}

impl Event {
    pub fn new(event_type: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            event_type: event_type.into(),
            source: source.into(),
            subject: None,
            time: Utc::now(),
            data: Value::Null,
            extensions: BTreeMap::new(),
        }
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    pub fn with_extension(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extensions.insert(name.into(), value.into());
        self
    }

    pub fn with_time(mut self, time: DateTime<Utc>) -> Self {
        self.time = time;
        self
    }

    /// Resolve an attribute by name as a string.
    ///
    /// `id`, `type`, `source`, `subject` and `time` are the envelope fields;
    /// `data.a.b` walks into the payload; anything else is an extension.
    pub fn attribute(&self, name: &str) -> Option<String> {
        match name {
            "id" => Some(self.id.clone()),
            "type" => Some(self.event_type.clone()),
            "source" => Some(self.source.clone()),
            "subject" => self.subject.clone(),
            "time" => Some(self.time.to_rfc3339()),
            _ => {
                if let Some(path) = name.strip_prefix("data.") {
                    let mut current = &self.data;
                    for segment in path.split('.') {
                        current = current.get(segment)?;
                    }
                    value_as_string(current)
                } else {
                    self.extensions.get(name).and_then(value_as_string)
                }
            }
        }
    }
}

fn value_as_string(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn attributes_resolve_envelope_data_and_extensions() {
        let e = Event::new("com.acme.order.paid", "/shop")
            .with_subject("order-7")
            .with_data(json!({"order": {"id": 7, "region": "eu-west"}}))
            .with_extension("orderid", "7");

        assert_eq!(e.attribute("type").as_deref(), Some("com.acme.order.paid"));
        assert_eq!(e.attribute("subject").as_deref(), Some("order-7"));
        assert_eq!(e.attribute("data.order.id").as_deref(), Some("7"));
        assert_eq!(e.attribute("data.order.region").as_deref(), Some("eu-west"));
        assert_eq!(e.attribute("orderid").as_deref(), Some("7"));
        assert_eq!(e.attribute("missing"), None);
        assert_eq!(e.attribute("data.order.nope"), None);
    }

    #[test]
    fn serializes_type_and_flattened_extensions() {
        let e = Event::new("a", "/src").with_extension("orderid", "42");
        let v = serde_json::to_value(&e).unwrap();
        assert_eq!(v["type"], "a");
        assert_eq!(v["orderid"], "42");
    }
}
