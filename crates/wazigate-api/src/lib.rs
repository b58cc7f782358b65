// wazigate-api: async client for the Waziup cloud REST API.

pub mod client;
pub mod error;
pub mod models;
pub mod transport;

pub use client::{CloudClient, EntityKind, encode_values};
pub use error::Error;
pub use models::{
    Gateway, NewDevice, NewEntity, RemoteDevice, RemoteEntity, RemoteValue, ValuePoint, Visibility,
};
pub use transport::{TransportConfig, id_compat, mqtt_addr, rest_addr};
