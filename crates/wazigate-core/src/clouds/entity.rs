// Dirty-set keys and their status.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::{self, Deserializer, SeqAccess, Visitor};
use serde::ser::{SerializeSeq, Serializer};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::model::EntityKind;

// ── Entity ───────────────────────────────────────────────────────────

/// A device, or a sensor or actuator of a device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Entity {
    pub device: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sensor: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub actuator: String,
}

impl Entity {
    pub fn device(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            sensor: String::new(),
            actuator: String::new(),
        }
    }

    pub fn sensor(device: impl Into<String>, sensor: impl Into<String>) -> Self {
        Self {
            sensor: sensor.into(),
            ..Self::device(device)
        }
    }

    pub fn actuator(device: impl Into<String>, actuator: impl Into<String>) -> Self {
        Self {
            actuator: actuator.into(),
            ..Self::device(device)
        }
    }

    pub fn child(device: impl Into<String>, kind: EntityKind, id: impl Into<String>) -> Self {
        match kind {
            EntityKind::Sensor => Self::sensor(device, id),
            EntityKind::Actuator => Self::actuator(device, id),
        }
    }

    pub fn is_device(&self) -> bool {
        self.sensor.is_empty() && self.actuator.is_empty()
    }

    /// Sensor or actuator part, `None` for a device.
    pub fn kind(&self) -> Option<(EntityKind, &str)> {
        if !self.sensor.is_empty() {
            Some((EntityKind::Sensor, &self.sensor))
        } else if !self.actuator.is_empty() {
            Some((EntityKind::Actuator, &self.actuator))
        } else {
            None
        }
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind() {
            None => write!(f, "/devices/{}", self.device),
            Some((kind, id)) => write!(f, "/devices/{}/{}/{id}", self.device, kind.collection()),
        }
    }
}

// ── Action ───────────────────────────────────────────────────────────

/// Set of pending actions on an entity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Action(u8);

impl Action {
    pub const NONE: Self = Self(0);
    /// Processing failed; skipped until the next initial sync.
    pub const ERROR: Self = Self(1);
    /// Values are outstanding.
    pub const SYNC: Self = Self(1 << 1);
    /// The name changed.
    pub const MODIFY: Self = Self(1 << 2);
    /// The remote entity does not exist yet.
    pub const CREATE: Self = Self(1 << 3);

    const NAMES: [(Self, &'static str); 4] = [
        (Self::CREATE, "create"),
        (Self::MODIFY, "modify"),
        (Self::SYNC, "sync"),
        (Self::ERROR, "error"),
    ];

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }

    fn names(self) -> impl Iterator<Item = &'static str> {
        Self::NAMES
            .into_iter()
            .filter(move |(flag, _)| self.contains(*flag))
            .map(|(_, name)| name)
    }

    fn from_name(name: &str) -> Option<Self> {
        Self::NAMES
            .into_iter()
            .find(|(_, n)| *n == name)
            .map(|(flag, _)| flag)
    }
}

impl BitOr for Action {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for Action {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, name) in self.names().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            f.write_str(name)?;
        }
        Ok(())
    }
}

impl Serialize for Action {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(None)?;
        for name in self.names() {
            seq.serialize_element(name)?;
        }
        seq.end()
    }
}

impl<'de> Deserialize<'de> for Action {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct ActionVisitor;

        impl<'de> Visitor<'de> for ActionVisitor {
            type Value = Action;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a list of action names")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Action, A::Error> {
                let mut action = Action::NONE;
                while let Some(name) = seq.next_element::<String>()? {
                    action |= Action::from_name(&name).ok_or_else(|| {
                        de::Error::unknown_variant(&name, &["create", "modify", "sync", "error"])
                    })?;
                }
                Ok(action)
            }
        }

        deserializer.deserialize_seq(ActionVisitor)
    }
}

// ── Status ───────────────────────────────────────────────────────────

/// Sync state of one dirty entity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Status {
    /// Time the cloud holds values up to; `None` before any value.
    pub remote: Option<DateTime<Utc>>,
    pub action: Action,
    /// Earliest time the worker may process the entity.
    #[serde(skip)]
    pub wakeup: Instant,
    /// Minimum gap between two value pushes.
    #[serde(with = "secs")]
    pub sleep: Duration,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Status {
    pub fn new(action: Action, remote: Option<DateTime<Utc>>) -> Self {
        Self {
            remote,
            action,
            wakeup: Instant::now(),
            sleep: Duration::ZERO,
            error: None,
        }
    }

    /// A CREATE entry means the remote entity does not exist.
    pub fn exists(&self) -> bool {
        !self.action.contains(Action::CREATE)
    }
}

mod secs {
    use std::time::Duration;

    use serde::Serializer;

    #[allow(clippy::trivially_copy_pass_by_ref)]
    pub(super) fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }
}
