// ── Domain model ──
//
// Devices own ordered lists of sensors and actuators. Each sensor and
// actuator keeps its latest value and the time it was recorded; the full
// history lives in the store.

use std::fmt;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

pub use wazigate_api::EntityKind;

// ── Meta ─────────────────────────────────────────────────────────────

/// Free-form entity metadata with a few recognized keys.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Meta(pub Map<String, JsonValue>);

impl Meta {
    pub const DO_NOT_SYNC: &'static str = "doNotSync";
    pub const SYNC_INTERVAL: &'static str = "syncInterval";
    pub const CODEC: &'static str = "codec";

    pub fn get(&self, key: &str) -> Option<&JsonValue> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: JsonValue) {
        self.0.insert(key.into(), value);
    }

    /// `doNotSync` suppresses cloud replication. Accepts booleans and
    /// numbers.
    pub fn do_not_sync(&self) -> bool {
        match self.get(Self::DO_NOT_SYNC) {
            Some(JsonValue::Bool(b)) => *b,
            Some(JsonValue::Number(n)) => n.as_f64().is_some_and(|n| n != 0.0),
            _ => false,
        }
    }

    /// `syncInterval` as a duration string (`"30s"`, `"1m 30s"`).
    pub fn sync_interval(&self) -> Option<Duration> {
        self.get(Self::SYNC_INTERVAL)
            .and_then(JsonValue::as_str)
            .and_then(|s| humantime::parse_duration(s).ok())
    }

    pub fn codec(&self) -> Option<&str> {
        self.get(Self::CODEC).and_then(JsonValue::as_str)
    }
}

// ── Entities ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sensor {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
    /// Time of the latest value.
    #[serde(default)]
    pub time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub value: Option<JsonValue>,
    #[serde(default)]
    pub meta: Meta,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Actuator {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
    #[serde(default)]
    pub time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub value: Option<JsonValue>,
    #[serde(default)]
    pub meta: Meta,
}

impl Sensor {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            created: now,
            modified: now,
            time: None,
            value: None,
            meta: Meta::default(),
        }
    }
}

impl Actuator {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            created: now,
            modified: now,
            time: None,
            value: None,
            meta: Meta::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub sensors: Vec<Sensor>,
    #[serde(default)]
    pub actuators: Vec<Actuator>,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
    #[serde(default)]
    pub meta: Meta,
}

impl Device {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            sensors: Vec::new(),
            actuators: Vec::new(),
            created: now,
            modified: now,
            meta: Meta::default(),
        }
    }

    pub fn with_sensor(mut self, sensor: Sensor) -> Self {
        self.sensors.push(sensor);
        self
    }

    pub fn with_actuator(mut self, actuator: Actuator) -> Self {
        self.actuators.push(actuator);
        self
    }

    pub fn sensor(&self, id: &str) -> Option<&Sensor> {
        self.sensors.iter().find(|s| s.id == id)
    }

    pub fn actuator(&self, id: &str) -> Option<&Actuator> {
        self.actuators.iter().find(|a| a.id == id)
    }

    /// Latest value and meta of a sensor or actuator.
    pub fn entity_state(&self, kind: EntityKind, id: &str) -> Option<EntityState<'_>> {
        match kind {
            EntityKind::Sensor => self.sensor(id).map(|s| EntityState {
                name: &s.name,
                time: s.time,
                value: s.value.as_ref(),
                meta: &s.meta,
            }),
            EntityKind::Actuator => self.actuator(id).map(|a| EntityState {
                name: &a.name,
                time: a.time,
                value: a.value.as_ref(),
                meta: &a.meta,
            }),
        }
    }

    /// Record `value` as the latest reading, creating the sensor or
    /// actuator when it does not exist yet. Older values leave the latest
    /// reading untouched.
    pub(crate) fn record(&mut self, kind: EntityKind, id: &str, value: &Value) {
        let (time, latest) = match kind {
            EntityKind::Sensor => {
                if self.sensor(id).is_none() {
                    self.sensors.push(Sensor::new(id, id));
                }
                let Some(s) = self.sensors.iter_mut().find(|s| s.id == id) else {
                    return;
                };
                (&mut s.time, &mut s.value)
            }
            EntityKind::Actuator => {
                if self.actuator(id).is_none() {
                    self.actuators.push(Actuator::new(id, id));
                }
                let Some(a) = self.actuators.iter_mut().find(|a| a.id == id) else {
                    return;
                };
                (&mut a.time, &mut a.value)
            }
        };
        if time.is_none_or(|t| t <= value.time) {
            *time = Some(value.time);
            *latest = Some(value.value.clone());
        }
    }
}

/// Borrowed view of a sensor or actuator.
#[derive(Debug, Clone, Copy)]
pub struct EntityState<'a> {
    pub name: &'a str,
    pub time: Option<DateTime<Utc>>,
    pub value: Option<&'a JsonValue>,
    pub meta: &'a Meta,
}

/// One recorded value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Value {
    pub value: JsonValue,
    pub time: DateTime<Utc>,
}

impl Value {
    pub fn new(value: JsonValue, time: DateTime<Utc>) -> Self {
        Self { value, time }
    }

    pub fn now(value: JsonValue) -> Self {
        Self::new(value, Utc::now())
    }
}

// ── ObjectId ─────────────────────────────────────────────────────────

/// 12-byte value identifier: 4-byte big-endian Unix seconds, 5 bytes
/// unique to this process, 3-byte counter.
///
/// Byte order equals chronological order at one-second resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId([u8; 12]);

fn process_unique() -> &'static [u8; 5] {
    static UNIQUE: OnceLock<[u8; 5]> = OnceLock::new();
    UNIQUE.get_or_init(|| {
        let random = uuid::Uuid::new_v4();
        let mut out = [0u8; 5];
        out.copy_from_slice(&random.as_bytes()[..5]);
        out
    })
}

fn next_counter() -> u32 {
    static COUNTER: OnceLock<AtomicU32> = OnceLock::new();
    COUNTER
        .get_or_init(|| {
            let random = uuid::Uuid::new_v4();
            let b = random.as_bytes();
            AtomicU32::new(u32::from_be_bytes([0, b[5], b[6], b[7]]))
        })
        .fetch_add(1, Ordering::Relaxed)
        & 0x00FF_FFFF
}

impl ObjectId {
    pub fn from_time(time: DateTime<Utc>) -> Self {
        // Clamp to the 32-bit range the leading bytes can hold.
        let secs = u32::try_from(time.timestamp().max(0)).unwrap_or(u32::MAX);
        let mut id = [0u8; 12];
        id[..4].copy_from_slice(&secs.to_be_bytes());
        id[4..9].copy_from_slice(process_unique());
        id[9..].copy_from_slice(&next_counter().to_be_bytes()[1..]);
        Self(id)
    }

    /// Seconds since the Unix epoch encoded in the leading bytes.
    pub fn timestamp(&self) -> u32 {
        u32::from_be_bytes([self.0[0], self.0[1], self.0[2], self.0[3]])
    }

    pub fn as_bytes(&self) -> &[u8; 12] {
        &self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}
