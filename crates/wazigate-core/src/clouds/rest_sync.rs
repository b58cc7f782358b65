// ── REST sync loop ──
//
// authenticate → initial sync → persistent sync, falling back to backoff
// and a fresh initial sync on errors. The MQTT loop is started after the
// first successful initial sync of a run.

use chrono::TimeDelta;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use wazigate_api::{Gateway, NewDevice, NewEntity, RemoteValue, ValuePoint, Visibility, id_compat};

use super::backoff::Backoff;
use super::cloud::Cloud;
use super::dirty::{Flag, Next};
use super::entity::{Action, Entity, Status};
use crate::error::CoreError;
use crate::model::{Device, EntityKind};
use crate::store::ValuesQuery;

/// Largest number of values pushed in one request.
pub const PUSH_LIMIT: usize = 30_000;
/// Largest encoded size of values pushed in one request.
pub const PUSH_SIZE: usize = 1 << 20;

/// Local values this much newer than the cloud's are outstanding.
fn clock_slack() -> TimeDelta {
    TimeDelta::seconds(1)
}

pub(crate) async fn run(cloud: Cloud, cancel: CancellationToken) {
    let id = cloud.id();
    let mut backoff = Backoff::new();
    let mut mqtt_started = false;

    if !authenticate(&cloud, &cancel, &mut backoff).await {
        return;
    }

    'initial: loop {
        loop {
            cloud.dirty().reset();
            let result = tokio::select! {
                biased;
                () = cancel.cancelled() => return,
                r = initial_sync(&cloud) => r,
            };
            match result {
                Ok(()) => break,
                Err(e) => {
                    warn!(cloud = %id, error = %e, "initial sync failed");
                    cloud.record_error(&e);
                    if e.is_auth_error() {
                        if !authenticate(&cloud, &cancel, &mut backoff).await {
                            return;
                        }
                    } else if !backoff.wait(&cancel).await {
                        return;
                    }
                }
            }
        }
        backoff.reset();
        info!(cloud = %id, dirty = cloud.dirty().len(), "initial sync done");

        if !mqtt_started {
            cloud.spawn_mqtt(&cancel);
            mqtt_started = true;
        }

        loop {
            let result = tokio::select! {
                biased;
                () = cancel.cancelled() => return,
                r = persistent_step(&cloud) => r,
            };
            let Err(e) = result else {
                backoff.reset();
                continue;
            };
            if e.is_auth_error() {
                if !authenticate(&cloud, &cancel, &mut backoff).await {
                    return;
                }
            } else if e.is_network() {
                if !backoff.wait(&cancel).await {
                    return;
                }
            } else {
                if !backoff.wait(&cancel).await {
                    return;
                }
                continue 'initial;
            }
        }
    }
}

/// Authenticate until it succeeds. Returns `false` when cancelled.
async fn authenticate(cloud: &Cloud, cancel: &CancellationToken, backoff: &mut Backoff) -> bool {
    loop {
        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => return false,
            r = cloud.authenticate() => r,
        };
        match result {
            Ok(()) => {
                backoff.reset();
                return true;
            }
            Err(e) => {
                warn!(cloud = %cloud.id(), error = %e, "authentication failed");
                if !backoff.wait(cancel).await {
                    return false;
                }
            }
        }
    }
}

// ── Initial sync ─────────────────────────────────────────────────────

/// Register the gateway and seed the dirty set from a comparison of the
/// local and remote catalogs.
pub async fn initial_sync(cloud: &Cloud) -> Result<(), CoreError> {
    let ctx = cloud.context();
    let api = cloud.api()?;

    let name = match ctx.store.get_device(&ctx.local_id).await {
        Ok(device) => device.name,
        Err(_) => format!("Gateway {}", ctx.local_id),
    };
    api.register_gateway(&Gateway {
        id: ctx.local_id.clone(),
        name,
        visibility: Visibility::Public,
    })
    .await?;
    cloud.set_registered(true);

    cloud.clear_devices();
    for device in ctx.store.get_devices().await? {
        cloud.include_device(&device.id).await;
        if device.meta.do_not_sync() {
            continue;
        }
        match api.get_device(&device.id).await? {
            None => cloud.flag(
                Entity::device(&device.id),
                Flag::set(Action::CREATE),
                Some(&device.meta),
            ),
            Some(remote) => {
                for sensor in &device.sensors {
                    let entity = Entity::sensor(&device.id, &sensor.id);
                    let meta = Some(&sensor.meta);
                    let Some(remote_sensor) = remote.sensor(&id_compat(&sensor.id)) else {
                        cloud.flag(entity, Flag::set(Action::CREATE), meta);
                        continue;
                    };
                    let remote_time = remote_sensor.value.as_ref().and_then(RemoteValue::time);
                    let outdated = match (sensor.time, remote_time) {
                        (Some(local), Some(remote)) => local - remote > clock_slack(),
                        (Some(_), None) => true,
                        (None, _) => false,
                    };
                    if outdated {
                        let flag = Flag::Set {
                            action: Action::SYNC,
                            remote: remote_time,
                        };
                        cloud.flag(entity, flag, meta);
                    }
                }
                for actuator in &device.actuators {
                    if remote.actuator(&id_compat(&actuator.id)).is_none() {
                        let entity = Entity::actuator(&device.id, &actuator.id);
                        cloud.flag(entity, Flag::set(Action::CREATE), Some(&actuator.meta));
                    }
                }
            }
        }
    }
    Ok(())
}

// ── Persistent sync ──────────────────────────────────────────────────

/// Wait for the next ready entity and process it.
async fn persistent_step(cloud: &Cloud) -> Result<(), CoreError> {
    let (entity, status) = loop {
        match cloud.dirty().next(Instant::now()) {
            Next::Ready(entity, status) => break (entity, status),
            Next::Idle(wake) => {
                tokio::select! {
                    () = cloud.dirty().notified() => {}
                    () = tokio::time::sleep_until(wake) => {}
                }
            }
        }
    };

    debug!(cloud = %cloud.id(), %entity, action = %status.action, "processing");
    match process_entity(cloud, &entity, &status).await {
        Ok(()) => Ok(()),
        Err(e) if e.is_network() => {
            warn!(cloud = %cloud.id(), %entity, error = %e, "cloud unreachable");
            Err(e)
        }
        Err(e) if e.is_auth_error() => {
            debug!(cloud = %cloud.id(), "token rejected, authenticating again");
            cloud.authenticate().await?;
            match process_entity(cloud, &entity, &status).await {
                Ok(()) => Ok(()),
                Err(e) => fail(cloud, &entity, e),
            }
        }
        Err(e) => fail(cloud, &entity, e),
    }
}

/// Park a failed entity. Local and server failures also end the
/// persistent phase.
fn fail(cloud: &Cloud, entity: &Entity, err: CoreError) -> Result<(), CoreError> {
    warn!(cloud = %cloud.id(), %entity, error = %err, "sync failed");
    if err.is_network() {
        return Err(err);
    }
    cloud.record_error(&err);
    cloud.flag(entity.clone(), Flag::Error(err.to_string()), None);
    if err.is_local() || err.code() >= 500 {
        Err(err)
    } else {
        Ok(())
    }
}

/// Push one entity's outstanding actions to the cloud.
pub async fn process_entity(
    cloud: &Cloud,
    entity: &Entity,
    status: &Status,
) -> Result<(), CoreError> {
    let ctx = cloud.context();
    let device = ctx.store.get_device(&entity.device).await?;
    match entity.kind() {
        None => process_device(cloud, &device, status).await,
        Some((kind, id)) => process_child(cloud, &device, entity, kind, id, status).await,
    }
}

async fn process_device(cloud: &Cloud, device: &Device, status: &Status) -> Result<(), CoreError> {
    let ctx = cloud.context();
    let api = cloud.api()?;
    let entity = Entity::device(&device.id);

    if status.action.contains(Action::CREATE) {
        let new_device = NewDevice {
            id: device.id.clone(),
            name: device.name.clone(),
            gateway_id: ctx.local_id.clone(),
            sensors: device
                .sensors
                .iter()
                .filter(|s| !s.meta.do_not_sync())
                .map(|s| NewEntity {
                    id: s.id.clone(),
                    name: s.name.clone(),
                })
                .collect(),
            actuators: device
                .actuators
                .iter()
                .filter(|a| !a.meta.do_not_sync())
                .map(|a| NewEntity {
                    id: a.id.clone(),
                    name: a.name.clone(),
                })
                .collect(),
        };
        api.create_device(&new_device).await?;
        info!(cloud = %cloud.id(), device = %device.id, "device created");
        cloud.flag(entity, Flag::Clear(Action::CREATE | Action::MODIFY | Action::SYNC), None);

        for sensor in device.sensors.iter().filter(|s| s.time.is_some()) {
            cloud.flag(
                Entity::sensor(&device.id, &sensor.id),
                Flag::set(Action::SYNC),
                Some(&sensor.meta),
            );
        }
        return Ok(());
    }

    if status.action.contains(Action::MODIFY) {
        api.set_device_name(&device.id, &device.name).await?;
        if device.id == ctx.local_id {
            api.set_gateway_name(&device.id, &device.name).await?;
        }
    }
    cloud.flag(entity, Flag::Clear(Action::MODIFY | Action::SYNC), None);
    Ok(())
}

async fn process_child(
    cloud: &Cloud,
    device: &Device,
    entity: &Entity,
    kind: EntityKind,
    id: &str,
    status: &Status,
) -> Result<(), CoreError> {
    let api = cloud.api()?;
    let state = device
        .entity_state(kind, id)
        .ok_or_else(|| CoreError::NotFound {
            entity_type: kind.collection(),
            identifier: entity.to_string(),
        })?;

    if status.action.contains(Action::CREATE) {
        let new_entity = NewEntity {
            id: id.to_owned(),
            name: state.name.to_owned(),
        };
        api.create_entity(&device.id, kind, &new_entity).await?;
        info!(cloud = %cloud.id(), %entity, "entity created");
        if kind == EntityKind::Sensor && state.time.is_some() {
            cloud.flag(entity.clone(), Flag::set(Action::SYNC), Some(state.meta));
        }
        cloud.flag(entity.clone(), Flag::Clear(Action::CREATE | Action::MODIFY), None);
        return Ok(());
    }

    if status.action.contains(Action::MODIFY) {
        api.set_entity_name(&device.id, kind, id, state.name).await?;
        cloud.flag(entity.clone(), Flag::Clear(Action::MODIFY), None);
    }

    if status.action.contains(Action::SYNC) {
        if kind == EntityKind::Actuator {
            // Actuator values flow from the cloud to the gateway.
            cloud.flag(entity.clone(), Flag::Clear(Action::SYNC), None);
            return Ok(());
        }
        push_values(cloud, device, entity, id, status).await?;
    }
    Ok(())
}

/// Push values newer than the entity's remote time, then advance it.
async fn push_values(
    cloud: &Cloud,
    device: &Device,
    entity: &Entity,
    sensor: &str,
    status: &Status,
) -> Result<(), CoreError> {
    let ctx = cloud.context();
    let query = ValuesQuery {
        from: status.remote,
        to: None,
        limit: Some(PUSH_LIMIT),
        size: Some(PUSH_SIZE),
    };
    let values = ctx
        .store
        .get_values(EntityKind::Sensor, &device.id, sensor, &query)
        .await?;
    let meta = device.sensor(sensor).map(|s| &s.meta);

    let Some(last) = values.last().map(|v| v.time) else {
        cloud.flag(entity.clone(), Flag::Clear(Action::SYNC), meta);
        return Ok(());
    };
    let points: Vec<ValuePoint> = values
        .iter()
        .map(|v| ValuePoint {
            value: v.value.clone(),
            timestamp: v.time,
        })
        .collect();
    cloud
        .api()?
        .push_values(&device.id, sensor, &points)
        .await?;
    debug!(cloud = %cloud.id(), %entity, count = points.len(), "values pushed");
    cloud.flag(entity.clone(), Flag::Advance { remote: Some(last) }, meta);
    Ok(())
}
