// ── Store capability ──
//
// The document database behind the gateway is external; the core only
// needs device documents and value series. `MemoryStore` backs tests and
// embedders without a database.

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use indexmap::IndexMap;
use tracing::debug;

use crate::error::CoreError;
use crate::model::{Device, EntityKind, ObjectId, Value};

/// Selects a window of values.
///
/// `from` is exclusive and `to` inclusive, so a query resumed from the
/// time of the last value it returned never repeats it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValuesQuery {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    /// Maximum number of values.
    pub limit: Option<usize>,
    /// Maximum encoded JSON size in bytes. At least one value is returned
    /// when any matches.
    pub size: Option<usize>,
}

impl ValuesQuery {
    pub fn after(from: Option<DateTime<Utc>>) -> Self {
        Self {
            from,
            ..Self::default()
        }
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn get_devices(&self) -> Result<Vec<Device>, CoreError>;

    /// Fails with [`CoreError::DeviceNotFound`].
    async fn get_device(&self, id: &str) -> Result<Device, CoreError>;

    /// Insert or replace a device document.
    async fn put_device(&self, device: Device) -> Result<(), CoreError>;

    /// Remove a device and every value recorded for it.
    async fn delete_device(&self, id: &str) -> Result<(), CoreError>;

    /// Append values to a sensor or actuator series and update its latest
    /// reading. The device must exist; the sensor or actuator is created
    /// on first write.
    async fn post_values(
        &self,
        kind: EntityKind,
        device: &str,
        id: &str,
        values: &[Value],
    ) -> Result<(), CoreError>;

    async fn get_values(
        &self,
        kind: EntityKind,
        device: &str,
        id: &str,
        query: &ValuesQuery,
    ) -> Result<Vec<Value>, CoreError>;
}

// ── MemoryStore ──────────────────────────────────────────────────────

type SeriesKey = (EntityKind, String, String);

/// In-process [`Store`].
#[derive(Default)]
pub struct MemoryStore {
    devices: RwLock<IndexMap<String, Device>>,
    series: DashMap<SeriesKey, BTreeMap<(DateTime<Utc>, ObjectId), serde_json::Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn devices(&self) -> std::sync::RwLockReadGuard<'_, IndexMap<String, Device>> {
        self.devices.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn devices_mut(&self) -> std::sync::RwLockWriteGuard<'_, IndexMap<String, Device>> {
        self.devices.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_devices(&self) -> Result<Vec<Device>, CoreError> {
        Ok(self.devices().values().cloned().collect())
    }

    async fn get_device(&self, id: &str) -> Result<Device, CoreError> {
        self.devices()
            .get(id)
            .cloned()
            .ok_or_else(|| CoreError::DeviceNotFound { id: id.to_owned() })
    }

    async fn put_device(&self, device: Device) -> Result<(), CoreError> {
        if device.id.is_empty() {
            return Err(CoreError::validation("device id must not be empty"));
        }
        self.devices_mut().insert(device.id.clone(), device);
        Ok(())
    }

    async fn delete_device(&self, id: &str) -> Result<(), CoreError> {
        if self.devices_mut().shift_remove(id).is_none() {
            return Err(CoreError::DeviceNotFound { id: id.to_owned() });
        }
        self.series.retain(|(_, device, _), _| device != id);
        debug!(device = id, "device deleted with its values");
        Ok(())
    }

    async fn post_values(
        &self,
        kind: EntityKind,
        device: &str,
        id: &str,
        values: &[Value],
    ) -> Result<(), CoreError> {
        {
            let mut devices = self.devices_mut();
            let doc = devices
                .get_mut(device)
                .ok_or_else(|| CoreError::DeviceNotFound {
                    id: device.to_owned(),
                })?;
            for value in values {
                doc.record(kind, id, value);
            }
            doc.modified = Utc::now();
        }

        let mut series = self
            .series
            .entry((kind, device.to_owned(), id.to_owned()))
            .or_default();
        for value in values {
            series.insert(
                (value.time, ObjectId::from_time(value.time)),
                value.value.clone(),
            );
        }
        Ok(())
    }

    async fn get_values(
        &self,
        kind: EntityKind,
        device: &str,
        id: &str,
        query: &ValuesQuery,
    ) -> Result<Vec<Value>, CoreError> {
        let Some(series) = self.series.get(&(kind, device.to_owned(), id.to_owned())) else {
            return Ok(Vec::new());
        };

        let limit = query.limit.unwrap_or(usize::MAX);
        let mut size = 0usize;
        let mut out = Vec::new();
        for ((time, _), value) in series.iter() {
            if query.from.is_some_and(|from| *time <= from) {
                continue;
            }
            if query.to.is_some_and(|to| *time > to) || out.len() >= limit {
                break;
            }
            if let Some(max) = query.size {
                size += serde_json::to_string(value).map_or(0, |s| s.len());
                if size > max && !out.is_empty() {
                    break;
                }
            }
            out.push(Value::new(value.clone(), *time));
        }
        Ok(out)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap() + Duration::seconds(secs)
    }

    async fn seeded() -> MemoryStore {
        let store = MemoryStore::new();
        store.put_device(Device::new("d1", "Device")).await.unwrap();
        let values: Vec<Value> = (0..5).map(|i| Value::new(json!(i), at(i))).collect();
        store
            .post_values(EntityKind::Sensor, "d1", "s1", &values)
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn from_is_exclusive() {
        let store = seeded().await;
        let values = store
            .get_values(EntityKind::Sensor, "d1", "s1", &ValuesQuery::after(Some(at(2))))
            .await
            .unwrap();
        let times: Vec<_> = values.iter().map(|v| v.time).collect();
        assert_eq!(times, vec![at(3), at(4)]);
    }

    #[tokio::test]
    async fn limit_and_size_bound_the_result() {
        let store = seeded().await;
        let limited = store
            .get_values(
                EntityKind::Sensor,
                "d1",
                "s1",
                &ValuesQuery {
                    limit: Some(2),
                    ..ValuesQuery::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(limited.len(), 2);

        let sized = store
            .get_values(
                EntityKind::Sensor,
                "d1",
                "s1",
                &ValuesQuery {
                    size: Some(1),
                    ..ValuesQuery::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(sized.len(), 1);
    }

    #[tokio::test]
    async fn post_values_updates_latest_reading() {
        let store = seeded().await;
        let device = store.get_device("d1").await.unwrap();
        let s1 = device.sensor("s1").unwrap();
        assert_eq!(s1.value, Some(json!(4)));
        assert_eq!(s1.time, Some(at(4)));
    }

    #[tokio::test]
    async fn actuator_series_is_separate() {
        let store = seeded().await;
        let values = store
            .get_values(EntityKind::Actuator, "d1", "s1", &ValuesQuery::default())
            .await
            .unwrap();
        assert!(values.is_empty());
    }

    #[tokio::test]
    async fn delete_cascades_to_values() {
        let store = seeded().await;
        store.delete_device("d1").await.unwrap();
        assert!(matches!(
            store.get_device("d1").await,
            Err(CoreError::DeviceNotFound { .. })
        ));
        assert!(store
            .get_values(EntityKind::Sensor, "d1", "s1", &ValuesQuery::default())
            .await
            .unwrap()
            .is_empty());
        assert!(matches!(
            store
                .post_values(EntityKind::Sensor, "d1", "s1", &[Value::now(json!(1))])
                .await,
            Err(CoreError::DeviceNotFound { .. })
        ));
    }
}
