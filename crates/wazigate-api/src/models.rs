// Wire types of the cloud REST contract.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Body of `POST /auth/token`.
#[derive(Debug, Clone, Serialize)]
pub struct TokenRequest<'a> {
    pub username: &'a str,
    pub password: &'a str,
}

/// Gateway registration document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gateway {
    pub id: String,
    pub name: String,
    pub visibility: Visibility,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Public,
    Private,
}

/// A value as the cloud reports it.
///
/// Older records only carry `date_received`; [`RemoteValue::time`] falls
/// back to it.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RemoteValue {
    #[serde(default)]
    pub value: JsonValue,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub date_received: Option<DateTime<Utc>>,
}

impl RemoteValue {
    pub fn time(&self) -> Option<DateTime<Utc>> {
        self.timestamp.or(self.date_received)
    }
}

/// Sensor or actuator inside a remote device document.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RemoteEntity {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub value: Option<RemoteValue>,
}

/// `GET /devices/{id}` answer.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RemoteDevice {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub sensors: Vec<RemoteEntity>,
    #[serde(default)]
    pub actuators: Vec<RemoteEntity>,
}

impl RemoteDevice {
    pub fn sensor(&self, id: &str) -> Option<&RemoteEntity> {
        self.sensors.iter().find(|s| s.id == id)
    }

    pub fn actuator(&self, id: &str) -> Option<&RemoteEntity> {
        self.actuators.iter().find(|a| a.id == id)
    }
}

/// `{id, name}` pair used when creating sensors and actuators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewEntity {
    pub id: String,
    pub name: String,
}

/// Body of `POST /devices`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewDevice {
    pub id: String,
    pub name: String,
    pub gateway_id: String,
    pub sensors: Vec<NewEntity>,
    pub actuators: Vec<NewEntity>,
}

/// One element of a value push.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValuePoint {
    pub value: JsonValue,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn remote_value_time_falls_back_to_date_received() {
        let value: RemoteValue = serde_json::from_value(json!({
            "value": 21.5,
            "date_received": "2024-03-01T10:00:00Z"
        }))
        .unwrap();
        assert_eq!(
            value.time(),
            Some(Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap())
        );
    }

    #[test]
    fn new_device_serializes_gateway_id() {
        let device = NewDevice {
            id: "d1".into(),
            name: "Device".into(),
            gateway_id: "gw".into(),
            sensors: vec![NewEntity {
                id: "s1".into(),
                name: "Temp".into(),
            }],
            actuators: vec![],
        };
        assert_eq!(
            serde_json::to_value(&device).unwrap(),
            json!({
                "id": "d1",
                "name": "Device",
                "gateway_id": "gw",
                "sensors": [{ "id": "s1", "name": "Temp" }],
                "actuators": []
            })
        );
    }
}
