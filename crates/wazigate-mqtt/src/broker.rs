// MQTT broker: handshake policy, session registry and topic routing

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::{Sink, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::codec::MqttCodec;
use crate::error::Error;
use crate::message::Message;
use crate::packet::{Connect, ConnectReturnCode, MAX_REMAINING_LENGTH, Packet, QoS};
use crate::session;
use crate::topic::{Receiver, Subscription, TopicTree, validate_topic_name};

/// Longest client identifier the broker accepts, in bytes.
pub const MAX_CLIENT_ID_LEN: usize = 128;

// ── Options & capabilities ───────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct BrokerOptions {
    /// Outbound QoS > 0 packets a client may leave unacknowledged.
    pub max_pending: usize,
    /// Close a client connection after this long without a packet.
    pub read_timeout: Option<Duration>,
    pub max_packet_size: usize,
}

impl Default for BrokerOptions {
    fn default() -> Self {
        Self {
            max_pending: 256,
            read_timeout: None,
            max_packet_size: MAX_REMAINING_LENGTH,
        }
    }
}

/// Decides whether a CONNECT's credentials are acceptable.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Return [`ConnectReturnCode::Accepted`] to admit the client.
    async fn authenticate(
        &self,
        client_id: &str,
        username: Option<&str>,
        password: Option<&[u8]>,
    ) -> ConnectReturnCode;
}

/// Inspects client publishes before they reach subscribers.
///
/// Returning `false` drops the message.
#[async_trait]
pub trait PublishFilter: Send + Sync {
    async fn filter(&self, client_id: &str, msg: &Message) -> bool;
}

// ── Broker ───────────────────────────────────────────────────────────

struct SessionHandle {
    generation: u64,
    cancel: CancellationToken,
}

struct BrokerInner {
    tree: RwLock<TopicTree>,
    sessions: DashMap<String, SessionHandle>,
    generation: AtomicU64,
    options: BrokerOptions,
    authenticator: OnceLock<Arc<dyn Authenticator>>,
    filter: OnceLock<Arc<dyn PublishFilter>>,
    shutdown: CancellationToken,
}

/// Cheaply cloneable handle to a running broker.
#[derive(Clone)]
pub struct Broker {
    inner: Arc<BrokerInner>,
}

impl Default for Broker {
    fn default() -> Self {
        Self::new(BrokerOptions::default())
    }
}

impl Broker {
    pub fn new(options: BrokerOptions) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                tree: RwLock::new(TopicTree::new()),
                sessions: DashMap::new(),
                generation: AtomicU64::new(0),
                options,
                authenticator: OnceLock::new(),
                filter: OnceLock::new(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn options(&self) -> &BrokerOptions {
        &self.inner.options
    }

    /// Install the CONNECT authenticator. Only the first call has effect.
    pub fn set_authenticator(&self, authenticator: Arc<dyn Authenticator>) {
        if self.inner.authenticator.set(authenticator).is_err() {
            warn!("authenticator already installed; ignoring");
        }
    }

    /// Install the client publish filter. Only the first call has effect.
    pub fn set_publish_filter(&self, filter: Arc<dyn PublishFilter>) {
        if self.inner.filter.set(filter).is_err() {
            warn!("publish filter already installed; ignoring");
        }
    }

    /// Number of connected clients.
    pub fn client_count(&self) -> usize {
        self.inner.sessions.len()
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Refuse new connections and cancel every active session.
    pub fn shutdown(&self) {
        info!(clients = self.client_count(), "broker shutting down");
        self.inner.shutdown.cancel();
    }

    // ── Routing ──────────────────────────────────────────────────────

    /// Route `msg` to matching subscribers and return the number of
    /// subscriptions hit. `sender` is `None` for messages injected by the
    /// gateway itself.
    pub fn publish(&self, sender: Option<&str>, msg: &Message) -> usize {
        if let Err(e) = validate_topic_name(&msg.topic) {
            warn!(sender = sender.unwrap_or("-"), error = %e, "dropping publish");
            return 0;
        }
        let hits = if msg.retain {
            let mut tree = self.inner.tree.write().unwrap_or_else(PoisonError::into_inner);
            tree.retain(msg);
            tree.publish(msg)
        } else {
            let tree = self.inner.tree.read().unwrap_or_else(PoisonError::into_inner);
            tree.publish(msg)
        };
        trace!(sender = sender.unwrap_or("-"), topic = %msg.topic, hits, "published");
        hits
    }

    /// Route a publish received from a connected client, passing it
    /// through the publish filter first.
    pub async fn publish_from(&self, client_id: &str, msg: &Message) -> usize {
        if msg.topic.starts_with("$SYS/") {
            debug!(client_id, topic = %msg.topic, "ignoring client publish to $SYS");
            return 0;
        }
        if let Some(filter) = self.inner.filter.get() {
            if !filter.filter(client_id, msg).await {
                debug!(client_id, topic = %msg.topic, "publish rejected by filter");
                return 0;
            }
        }
        self.publish(Some(client_id), msg)
    }

    pub fn subscribe(
        &self,
        filter: &str,
        receiver: Arc<dyn Receiver>,
        qos: QoS,
    ) -> Result<Subscription, Error> {
        let mut tree = self.inner.tree.write().unwrap_or_else(PoisonError::into_inner);
        tree.subscribe(filter, receiver, qos)
    }

    /// Subscribe one receiver to several filters under a single lock.
    pub fn subscribe_all(
        &self,
        filters: &[(&str, QoS)],
        receiver: &Arc<dyn Receiver>,
    ) -> Vec<Result<Subscription, Error>> {
        let mut tree = self.inner.tree.write().unwrap_or_else(PoisonError::into_inner);
        filters
            .iter()
            .map(|(filter, qos)| tree.subscribe(filter, Arc::clone(receiver), *qos))
            .collect()
    }

    pub fn unsubscribe(&self, sub: &Subscription) -> bool {
        let mut tree = self.inner.tree.write().unwrap_or_else(PoisonError::into_inner);
        tree.unsubscribe(sub)
    }

    /// `true` if the topic tree holds nothing beyond its root.
    pub fn is_idle(&self) -> bool {
        self.inner
            .tree
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }

    // ── Connections ──────────────────────────────────────────────────

    /// Serve one client over a byte stream (TCP, TLS, in-memory duplex).
    pub async fn serve<IO>(&self, io: IO) -> Result<(), Error>
    where
        IO: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let codec = MqttCodec::with_max_packet_size(self.inner.options.max_packet_size);
        let (sink, stream) = Framed::new(io, codec).split();
        self.serve_stream(stream, sink).await
    }

    /// Serve one client over an already-framed packet stream and sink.
    pub async fn serve_stream<St, Si>(&self, stream: St, sink: Si) -> Result<(), Error>
    where
        St: Stream<Item = Result<Packet, Error>> + Unpin + Send,
        Si: Sink<Packet, Error = Error> + Unpin + Send + 'static,
    {
        session::run(self.clone(), stream, sink).await
    }

    /// Apply the handshake policy to a CONNECT and return the effective
    /// client id, or the CONNACK code to refuse with.
    pub(crate) async fn accept(&self, connect: &Connect) -> Result<String, ConnectReturnCode> {
        if !connect.is_supported_protocol() {
            return Err(ConnectReturnCode::UnacceptableProtocolVersion);
        }
        let client_id = if connect.client_id.is_empty() {
            if !connect.clean_session {
                return Err(ConnectReturnCode::IdentifierRejected);
            }
            uuid::Uuid::new_v4().simple().to_string()
        } else if connect.client_id.len() > MAX_CLIENT_ID_LEN {
            return Err(ConnectReturnCode::IdentifierRejected);
        } else {
            connect.client_id.clone()
        };
        if self.is_shutdown() {
            return Err(ConnectReturnCode::ServerUnavailable);
        }
        if let Some(auth) = self.inner.authenticator.get() {
            let code = auth
                .authenticate(
                    &client_id,
                    connect.username.as_deref(),
                    connect.password.as_deref(),
                )
                .await;
            if code != ConnectReturnCode::Accepted {
                return Err(code);
            }
        }
        Ok(client_id)
    }

    /// Track a connected session, cancelling any older one with the same id.
    pub(crate) fn register(&self, client_id: &str) -> (u64, CancellationToken) {
        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed);
        let cancel = self.inner.shutdown.child_token();
        let handle = SessionHandle {
            generation,
            cancel: cancel.clone(),
        };
        if let Some(old) = self.inner.sessions.insert(client_id.to_owned(), handle) {
            info!(client_id, "taking over existing session");
            old.cancel.cancel();
        }
        (generation, cancel)
    }

    pub(crate) fn unregister(&self, client_id: &str, generation: u64) {
        self.inner
            .sessions
            .remove_if(client_id, |_, handle| handle.generation == generation);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::packet::PROTOCOL_MQTT_31;

    #[tokio::test]
    async fn handshake_policy() {
        let broker = Broker::default();

        let ok = Connect::new("client");
        assert_eq!(broker.accept(&ok).await.unwrap(), "client");

        let mut legacy = Connect::new("legacy");
        legacy.protocol_name = PROTOCOL_MQTT_31.0.into();
        legacy.protocol_level = PROTOCOL_MQTT_31.1;
        assert!(broker.accept(&legacy).await.is_ok());

        let mut bad_level = Connect::new("c");
        bad_level.protocol_level = 5;
        assert_eq!(
            broker.accept(&bad_level).await,
            Err(ConnectReturnCode::UnacceptableProtocolVersion)
        );

        let mut anonymous = Connect::new("");
        assert_eq!(broker.accept(&anonymous).await.unwrap().len(), 32);
        anonymous.clean_session = false;
        assert_eq!(
            broker.accept(&anonymous).await,
            Err(ConnectReturnCode::IdentifierRejected)
        );

        let long = Connect::new("x".repeat(MAX_CLIENT_ID_LEN + 1));
        assert_eq!(
            broker.accept(&long).await,
            Err(ConnectReturnCode::IdentifierRejected)
        );

        broker.shutdown();
        assert_eq!(
            broker.accept(&ok).await,
            Err(ConnectReturnCode::ServerUnavailable)
        );
    }

    struct DenyAll;

    #[async_trait]
    impl Authenticator for DenyAll {
        async fn authenticate(&self, _: &str, _: Option<&str>, _: Option<&[u8]>) -> ConnectReturnCode {
            ConnectReturnCode::NotAuthorized
        }
    }

    #[tokio::test]
    async fn authenticator_can_refuse() {
        let broker = Broker::default();
        broker.set_authenticator(Arc::new(DenyAll));
        assert_eq!(
            broker.accept(&Connect::new("c")).await,
            Err(ConnectReturnCode::NotAuthorized)
        );
    }

    #[test]
    fn invalid_publish_topic_hits_nothing() {
        let broker = Broker::default();
        assert_eq!(broker.publish(None, &Message::new("a/+", "x")), 0);
        assert_eq!(broker.publish(None, &Message::new("", "x")), 0);
    }

    #[test]
    fn takeover_cancels_older_session() {
        let broker = Broker::default();
        let (first_gen, first) = broker.register("c");
        let (second_gen, second) = broker.register("c");
        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());

        // The stale session must not evict its successor.
        broker.unregister("c", first_gen);
        assert_eq!(broker.client_count(), 1);
        broker.unregister("c", second_gen);
        assert_eq!(broker.client_count(), 0);
    }
}
