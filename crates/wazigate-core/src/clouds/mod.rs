//! Per-cloud synchronization.
//!
//! Each [`Cloud`] mirrors local devices, sensors and actuators to one
//! remote endpoint. A REST loop reconciles the catalogs and drains the
//! cloud's [`DirtySet`]; an MQTT loop streams actuator values and tunnel
//! requests back down. [`Clouds`] owns every configured cloud and its
//! `clouds.json` record.

pub mod backoff;
pub mod cloud;
pub mod dirty;
pub mod entity;
mod mqtt_sync;
pub mod registry;
pub mod rest_sync;
pub mod tunnel;

pub use backoff::{Backoff, RETRY_SCHEDULE};
pub use cloud::{Cloud, CloudConfig, CloudContext, CloudSnapshot, Credentials};
pub use dirty::{DirtySet, Flag, Next, Transition};
pub use entity::{Action, Entity, Status};
pub use registry::Clouds;
