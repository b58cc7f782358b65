//! Embeddable MQTT 3.1 / 3.1.1 broker for the Wazigate edge.
//!
//! The crate is organised bottom-up:
//!
//! - [`packet`] and [`codec`]: the 14 control packets and their framing.
//! - [`topic`]: the subscription trie with wildcard matching and retained
//!   messages.
//! - [`broker`]: handshake policy, session registry and publish routing.
//!   Client sessions are served over any byte stream (TCP, TLS) or over
//!   WebSocket frames ([`ws`]).
//! - [`queue`]: a crash-durable outbound packet queue that spills to disk
//!   while no writer is attached.
//! - [`client`]: an outbound client that sends through a [`queue::Queue`],
//!   used to hold the link to a cloud broker.

pub mod broker;
pub mod client;
pub mod codec;
pub mod error;
pub mod message;
pub mod packet;
pub mod queue;
mod session;
pub mod topic;
pub mod ws;

pub use broker::{Authenticator, Broker, BrokerOptions, PublishFilter};
pub use client::{Client, ClientOptions, Inbox};
pub use codec::MqttCodec;
pub use error::Error;
pub use message::Message;
pub use packet::{ConnectReturnCode, Packet, QoS};
pub use queue::{PacketWriter, Queue};
pub use session::Session;
pub use topic::{Receiver, Subscription, TopicTree};
