// ── Broker ↔ sync bridge ──
//
// Local MQTT publishes are turned into synthetic HTTP requests (method
// `PUBLISH`, URI `/{topic}`) and only delivered when the handler answers
// 2xx. HTTP value writes are echoed onto the broker, and cloud messages
// reach local subscribers through `Downstream`.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::{debug, warn};
use wazigate_mqtt::{Broker, Message, PublishFilter, QoS};

use crate::clouds::{Action, Clouds};
use crate::codec::{Codecs, parse_value};
use crate::error::CoreError;
use crate::model::{EntityKind, Value};
use crate::store::Store;

pub const METHOD_PUBLISH: &str = "PUBLISH";

// ── Request / Response ───────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub method: String,
    /// Path with optional query.
    pub uri: String,
    pub headers: BTreeMap<String, Vec<String>>,
    pub body: Bytes,
    /// Originating MQTT client id or peer address.
    pub remote: Option<String>,
}

impl Request {
    pub fn new(method: impl Into<String>, uri: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            method: method.into(),
            uri: uri.into(),
            headers: BTreeMap::new(),
            body: body.into(),
            remote: None,
        }
    }

    /// Synthetic request for a client publish.
    pub fn from_publish(client_id: &str, msg: &Message) -> Self {
        Self {
            remote: Some(client_id.to_owned()),
            ..Self::new(METHOD_PUBLISH, format!("/{}", msg.topic), msg.payload.clone())
        }
    }

    /// URI without query, split on `/`, empty segments dropped.
    pub fn segments(&self) -> Vec<&str> {
        let path = self.uri.split(['?', '#']).next().unwrap_or_default();
        path.split('/').filter(|s| !s.is_empty()).collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub status: u16,
    pub headers: BTreeMap<String, Vec<String>>,
    pub body: Bytes,
}

impl Response {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: BTreeMap::new(),
            body: Bytes::new(),
        }
    }

    pub fn text(status: u16, body: impl Into<String>) -> Self {
        let mut resp = Self::new(status);
        resp.headers.insert(
            "Content-Type".to_owned(),
            vec!["text/plain; charset=utf-8".to_owned()],
        );
        resp.body = Bytes::from(body.into());
        resp
    }

    pub fn json<T: Serialize>(status: u16, body: &T) -> Self {
        match serde_json::to_vec(body) {
            Ok(raw) => {
                let mut resp = Self::new(status);
                resp.headers.insert(
                    "Content-Type".to_owned(),
                    vec!["application/json; charset=utf-8".to_owned()],
                );
                resp.body = Bytes::from(raw);
                resp
            }
            Err(e) => Self::text(500, e.to_string()),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

impl From<CoreError> for Response {
    fn from(err: CoreError) -> Self {
        Self::text(err.code(), err.to_string())
    }
}

// ── Capabilities ─────────────────────────────────────────────────────

/// Serves synthetic and tunnelled HTTP requests.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, req: Request) -> Response;
}

/// Publishes messages to local subscribers.
pub trait Downstream: Send + Sync {
    fn publish(&self, msg: &Message) -> usize;
}

impl Downstream for Broker {
    fn publish(&self, msg: &Message) -> usize {
        Broker::publish(self, None, msg)
    }
}

/// Broker publish filter that routes client publishes through a handler.
pub struct BridgeFilter {
    handler: Arc<dyn Handler>,
}

impl BridgeFilter {
    pub fn new(handler: Arc<dyn Handler>) -> Self {
        Self { handler }
    }
}

#[async_trait]
impl PublishFilter for BridgeFilter {
    async fn filter(&self, client_id: &str, msg: &Message) -> bool {
        let resp = self.handler.handle(Request::from_publish(client_id, msg)).await;
        if !resp.is_success() {
            debug!(
                client_id,
                topic = %msg.topic,
                status = resp.status,
                "publish not accepted by handler"
            );
        }
        resp.is_success()
    }
}

// ── ValueRouter ──────────────────────────────────────────────────────

/// Default handler: writes values and decoded uplinks to the store.
pub struct ValueRouter {
    store: Arc<dyn Store>,
    codecs: Arc<Codecs>,
    clouds: Clouds,
    downstream: Arc<dyn Downstream>,
    local_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route<'a> {
    Values {
        device: &'a str,
        kind: EntityKind,
        id: &'a str,
        many: bool,
    },
    Uplink {
        device: &'a str,
    },
}

impl ValueRouter {
    pub fn new(
        store: Arc<dyn Store>,
        codecs: Arc<Codecs>,
        clouds: Clouds,
        downstream: Arc<dyn Downstream>,
        local_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            codecs,
            clouds,
            downstream,
            local_id: local_id.into(),
        }
    }

    fn route<'a>(&'a self, segments: &[&'a str]) -> Option<Route<'a>> {
        let (device, rest) = match segments {
            ["devices", device] => return Some(Route::Uplink { device: *device }),
            ["devices", device, rest @ ..] => (*device, rest),
            rest => (self.local_id.as_str(), rest),
        };
        let [collection, id, leaf] = rest else {
            return None;
        };
        let kind = match *collection {
            "sensors" => EntityKind::Sensor,
            "actuators" => EntityKind::Actuator,
            _ => return None,
        };
        let many = match *leaf {
            "value" => false,
            "values" => true,
            _ => return None,
        };
        Some(Route::Values {
            device,
            kind,
            id: *id,
            many,
        })
    }

    async fn write_values(
        &self,
        device: &str,
        kind: EntityKind,
        id: &str,
        values: &[Value],
    ) -> Result<(), CoreError> {
        self.store.post_values(kind, device, id, values).await?;
        if kind == EntityKind::Sensor {
            self.clouds.flag_sensor(device, id, Action::SYNC).await;
        }
        Ok(())
    }

    async fn post_values(
        &self,
        req: &Request,
        device: &str,
        kind: EntityKind,
        id: &str,
        many: bool,
    ) -> Result<usize, CoreError> {
        let json: JsonValue = serde_json::from_slice(&req.body)?;
        let now = Utc::now();
        let values = match (many, json) {
            (false, json) => vec![parse_value(json, now)],
            (true, JsonValue::Array(items)) => {
                items.into_iter().map(|j| parse_value(j, now)).collect()
            }
            (true, _) => return Err(CoreError::validation("expected a JSON array of values")),
        };
        self.write_values(device, kind, id, &values).await?;

        // Echo HTTP writes to MQTT subscribers; PUBLISH is delivered by
        // the broker itself once we answer 2xx.
        if req.method != METHOD_PUBLISH {
            let leaf = if many { "values" } else { "value" };
            let topic = format!("devices/{device}/{}/{id}/{leaf}", kind.collection());
            let msg = Message::new(topic, req.body.clone()).with_qos(QoS::AtMostOnce);
            self.downstream.publish(&msg);
        }
        Ok(values.len())
    }

    async fn uplink(&self, req: &Request, device_id: &str) -> Result<usize, CoreError> {
        let device = self.store.get_device(device_id).await?;
        let readings = self.codecs.decode(&device, &req.body)?;
        for reading in &readings {
            self.write_values(
                device_id,
                reading.kind,
                &reading.id,
                std::slice::from_ref(&reading.value),
            )
            .await?;
        }
        Ok(readings.len())
    }
}

#[async_trait]
impl Handler for ValueRouter {
    async fn handle(&self, req: Request) -> Response {
        let segments = req.segments();
        let method = req.method.as_str();
        let result = match self.route(&segments) {
            Some(Route::Values {
                device,
                kind,
                id,
                many,
            }) if matches!(method, "POST" | "PUT" | METHOD_PUBLISH) => {
                self.post_values(&req, device, kind, id, many).await
            }
            Some(Route::Uplink { device }) if matches!(method, "POST" | METHOD_PUBLISH) => {
                self.uplink(&req, device).await
            }
            Some(_) => return Response::text(405, "method not allowed"),
            None => return Response::text(404, "not found"),
        };

        match result {
            Ok(n) => {
                debug!(method, uri = %req.uri, values = n, "values written");
                Response::new(200)
            }
            Err(e) => {
                warn!(method, uri = %req.uri, error = %e, "request failed");
                Response::from(e)
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn segments_ignore_query_and_slashes() {
        let req = Request::new("GET", "/devices//d1/sensors?limit=1", Bytes::new());
        assert_eq!(req.segments(), vec!["devices", "d1", "sensors"]);
    }

    #[test]
    fn publish_becomes_synthetic_request() {
        let msg = Message::new("devices/d1/sensors/s1/value", "21");
        let req = Request::from_publish("client-1", &msg);
        assert_eq!(req.method, "PUBLISH");
        assert_eq!(req.uri, "/devices/d1/sensors/s1/value");
        assert_eq!(req.remote.as_deref(), Some("client-1"));
    }

    #[test]
    fn error_responses_carry_code() {
        let resp = Response::from(CoreError::DeviceNotFound { id: "d".into() });
        assert_eq!(resp.status, 404);
        assert!(!resp.is_success());
    }
}
