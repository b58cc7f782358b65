//! Domain core of the Wazigate edge gateway.
//!
//! - [`model`]: devices, sensors, actuators and their values.
//! - [`store`] and [`codec`]: the persistence and payload-decoding
//!   capabilities the gateway is built on.
//! - [`clouds`]: the clouds registry and the per-cloud sync engine.
//! - [`bridge`]: turns local MQTT publishes into routed requests and
//!   republishes cloud messages on the local broker.
//! - [`gateway`]: the context struct wiring all of the above together.

pub mod bridge;
pub mod clouds;
pub mod codec;
pub mod error;
pub mod gateway;
pub mod local_id;
pub mod model;
pub mod store;

pub use bridge::{BridgeFilter, Downstream, Handler, Request, Response, ValueRouter};
pub use clouds::{Action, Cloud, CloudConfig, CloudContext, Clouds, Entity};
pub use codec::{Codec, Codecs, JsonCodec};
pub use error::CoreError;
pub use gateway::{Gateway, GatewayOptions, RouterParts};
pub use model::{Actuator, Device, EntityKind, Meta, Sensor, Value};
pub use store::{MemoryStore, Store, ValuesQuery};
