// ── Payload codecs ──
//
// A codec turns a device uplink payload into sensor readings. Codecs are
// looked up by MIME type from the device meta (`codec`).

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value as JsonValue;

use crate::error::CoreError;
use crate::model::{Device, EntityKind, Value};

pub const DEFAULT_CODEC: &str = "application/json";

/// One decoded reading.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub kind: EntityKind,
    pub id: String,
    pub value: Value,
}

pub trait Codec: Send + Sync {
    fn mime(&self) -> &str;

    fn decode(&self, device: &Device, payload: &[u8]) -> Result<Vec<Reading>, CoreError>;
}

/// Read a value body: either a bare JSON value or `{value, time}`.
pub fn parse_value(json: JsonValue, default_time: DateTime<Utc>) -> Value {
    if let JsonValue::Object(map) = &json {
        if map.contains_key("value") && map.keys().all(|k| k == "value" || k == "time") {
            let time = map
                .get("time")
                .and_then(JsonValue::as_str)
                .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
                .map_or(default_time, |t| t.with_timezone(&Utc));
            let value = map.get("value").cloned().unwrap_or(JsonValue::Null);
            return Value::new(value, time);
        }
    }
    Value::new(json, default_time)
}

/// `{"<sensor id>": <value>, ...}`; each member follows [`parse_value`].
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn mime(&self) -> &str {
        DEFAULT_CODEC
    }

    fn decode(&self, _device: &Device, payload: &[u8]) -> Result<Vec<Reading>, CoreError> {
        let JsonValue::Object(members) = serde_json::from_slice(payload)? else {
            return Err(CoreError::validation("expected a JSON object of sensor values"));
        };
        let now = Utc::now();
        Ok(members
            .into_iter()
            .map(|(id, json)| Reading {
                kind: EntityKind::Sensor,
                id,
                value: parse_value(json, now),
            })
            .collect())
    }
}

/// Registry of codecs by MIME type.
pub struct Codecs {
    codecs: DashMap<String, Arc<dyn Codec>>,
}

impl Default for Codecs {
    fn default() -> Self {
        let codecs = Self {
            codecs: DashMap::new(),
        };
        codecs.register(Arc::new(JsonCodec));
        codecs
    }
}

impl Codecs {
    pub fn register(&self, codec: Arc<dyn Codec>) {
        self.codecs.insert(codec.mime().to_owned(), codec);
    }

    pub fn get(&self, mime: &str) -> Result<Arc<dyn Codec>, CoreError> {
        self.codecs
            .get(mime)
            .map(|c| Arc::clone(c.value()))
            .ok_or_else(|| CoreError::UnsupportedCodec {
                mime: mime.to_owned(),
            })
    }

    /// Decode with the device's codec, falling back to JSON.
    pub fn decode(&self, device: &Device, payload: &[u8]) -> Result<Vec<Reading>, CoreError> {
        let mime = device.meta.codec().unwrap_or(DEFAULT_CODEC);
        self.get(mime)?.decode(device, payload)
    }
}
