// Outbound MQTT client
//
// Used by the cloud session to hold a connection to a remote broker.
// Everything the client sends goes through a durable `Queue`, so packets
// produced while the link is down are delivered after the next dial.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::codec::MqttCodec;
use crate::error::Error;
use crate::message::Message;
use crate::packet::{
    Connect, ConnectReturnCode, Packet, Publish, QoS, SubAck, Subscribe, Unsubscribe,
};
use crate::queue::Queue;
use crate::session::PACKET_ID_WRAP;

const CONNACK_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// `host:port` of the remote broker.
    pub addr: String,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<Bytes>,
    pub keep_alive: u16,
    /// Treat the link as dead after this long without a packet.
    pub read_timeout: Option<Duration>,
}

impl ClientOptions {
    pub fn new(addr: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            client_id: client_id.into(),
            username: None,
            password: None,
            keep_alive: 0,
            read_timeout: None,
        }
    }
}

/// Messages delivered by the remote broker. Yields `None` once the
/// connection is gone.
pub struct Inbox {
    rx: mpsc::UnboundedReceiver<Message>,
}

impl Inbox {
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }
}

struct ClientInner {
    id: String,
    queue: Arc<Queue>,
    state: Mutex<ClientState>,
    closed: CancellationToken,
}

#[derive(Default)]
struct ClientState {
    counter: u16,
    pending: HashMap<u16, Packet>,
}

/// Handle to a connected client. Cloning shares the connection.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

type PacketStream = SplitStream<Framed<TcpStream, MqttCodec>>;

impl Client {
    /// Connect to a remote broker and attach `queue` as the outbound path.
    pub async fn dial(options: &ClientOptions, queue: Arc<Queue>) -> Result<(Self, Inbox), Error> {
        debug!(addr = %options.addr, client_id = %options.client_id, "dialing MQTT broker");
        let stream = TcpStream::connect(&options.addr).await?;
        let mut framed = Framed::new(stream, MqttCodec::new());

        let mut connect = Connect::new(options.client_id.clone());
        connect.keep_alive = options.keep_alive;
        connect.username.clone_from(&options.username);
        connect.password.clone_from(&options.password);
        framed.send(Packet::Connect(connect)).await?;

        let ack = tokio::time::timeout(CONNACK_TIMEOUT, framed.next())
            .await
            .map_err(|_| Error::Timeout {
                timeout_secs: CONNACK_TIMEOUT.as_secs(),
            })?;
        match ack.transpose()? {
            Some(Packet::ConnAck(ack)) if ack.code == ConnectReturnCode::Accepted => {}
            Some(Packet::ConnAck(ack)) => return Err(Error::ConnectionRefused(ack.code)),
            Some(other) => {
                return Err(Error::protocol(format!(
                    "expected CONNACK, got {}",
                    other.packet_type()
                )));
            }
            None => return Err(Error::Closed),
        }

        let (sink, stream) = framed.split();
        queue.serve_writer(Box::new(sink)).await?;
        info!(addr = %options.addr, client_id = %options.client_id, "MQTT connected");

        let inner = Arc::new(ClientInner {
            id: options.client_id.clone(),
            queue,
            state: Mutex::new(ClientState::default()),
            closed: CancellationToken::new(),
        });
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(read_loop(Arc::clone(&inner), stream, tx, options.read_timeout));

        Ok((Self { inner }, Inbox { rx }))
    }

    pub fn client_id(&self) -> &str {
        &self.inner.id
    }

    pub fn is_connected(&self) -> bool {
        !self.inner.closed.is_cancelled()
    }

    /// Allocate a packet id and record the packet built with it as pending.
    async fn send_tracked(&self, build: impl FnOnce(u16) -> Packet) -> Result<(), Error> {
        let packet = {
            let mut state = self.inner.state();
            state.counter += 1;
            if state.counter >= PACKET_ID_WRAP {
                state.counter = 1;
            }
            let id = state.counter;
            let packet = build(id);
            state.pending.insert(id, packet.clone());
            packet
        };
        self.inner.queue.write_packet(&packet).await
    }

    pub async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), Error> {
        self.subscribe_all(&[(topic.to_owned(), qos)]).await
    }

    /// Subscribe to several topics with a single SUBSCRIBE packet.
    pub async fn subscribe_all(&self, topics: &[(String, QoS)]) -> Result<(), Error> {
        if topics.is_empty() {
            return Ok(());
        }
        self.send_tracked(|packet_id| {
            Packet::Subscribe(Subscribe {
                packet_id,
                topics: topics.to_vec(),
            })
        })
        .await
    }

    pub async fn unsubscribe(&self, topic: &str) -> Result<(), Error> {
        self.send_tracked(|packet_id| {
            Packet::Unsubscribe(Unsubscribe {
                packet_id,
                topics: vec![topic.to_owned()],
            })
        })
        .await
    }

    pub async fn publish(&self, msg: &Message) -> Result<(), Error> {
        if msg.qos > QoS::AtMostOnce {
            self.send_tracked(|id| Packet::Publish(Publish::from_message(msg, Some(id))))
                .await
        } else {
            let packet = Packet::Publish(Publish::from_message(msg, None));
            self.inner.queue.write_packet(&packet).await
        }
    }

    /// Packets sent with an id that the peer has not acknowledged yet.
    pub fn pending_len(&self) -> usize {
        self.inner.state().pending.len()
    }

    /// Send DISCONNECT (if the link is up) and stop the reader.
    pub async fn disconnect(&self) {
        if self.inner.closed.is_cancelled() {
            return;
        }
        if let Err(e) = self.inner.queue.send_direct(&Packet::Disconnect).await {
            debug!(client_id = %self.inner.id, error = %e, "DISCONNECT not sent");
        }
        self.inner.queue.detach().await;
        self.inner.closed.cancel();
    }
}

impl ClientInner {
    fn state(&self) -> MutexGuard<'_, ClientState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn acknowledge(&self, packet_id: u16) {
        self.state().pending.remove(&packet_id);
    }
}

async fn read_loop(
    inner: Arc<ClientInner>,
    mut stream: PacketStream,
    tx: mpsc::UnboundedSender<Message>,
    read_timeout: Option<Duration>,
) {
    let result = loop {
        let next = tokio::select! {
            biased;
            () = inner.closed.cancelled() => break Ok(()),
            next = next_with_timeout(&mut stream, read_timeout) => next,
        };
        let packet = match next {
            Ok(Some(packet)) => packet,
            Ok(None) => break Err(Error::Closed),
            Err(e) => break Err(e),
        };
        trace!(client_id = %inner.id, "← {packet}");

        let reply = match packet {
            Packet::Publish(publish) => {
                let reply = match (publish.qos, publish.packet_id) {
                    (QoS::AtLeastOnce, Some(id)) => Some(Packet::PubAck(id)),
                    (QoS::ExactlyOnce, Some(id)) => Some(Packet::PubRec(id)),
                    _ => None,
                };
                if tx.send(publish.to_message()).is_err() {
                    debug!(client_id = %inner.id, "inbox dropped");
                }
                reply
            }
            Packet::PubAck(id)
            | Packet::PubComp(id)
            | Packet::UnsubAck(id)
            | Packet::SubAck(SubAck { packet_id: id, .. }) => {
                inner.acknowledge(id);
                None
            }
            Packet::PubRec(id) => {
                inner.state().pending.insert(id, Packet::PubRel(id));
                Some(Packet::PubRel(id))
            }
            Packet::PubRel(id) => Some(Packet::PubComp(id)),
            Packet::PingResp => None,
            other => {
                break Err(Error::protocol(format!(
                    "unexpected {} from broker",
                    other.packet_type()
                )));
            }
        };

        if let Some(reply) = reply {
            if let Err(e) = inner.queue.send_direct(&reply).await {
                break Err(e);
            }
        }
    };

    if let Err(e) = &result {
        warn!(client_id = %inner.id, error = %e, "MQTT connection lost");
    }
    inner.queue.detach().await;
    inner.closed.cancel();
}

async fn next_with_timeout(
    stream: &mut PacketStream,
    timeout: Option<Duration>,
) -> Result<Option<Packet>, Error> {
    let next = match timeout {
        Some(limit) => tokio::time::timeout(limit, stream.next())
            .await
            .map_err(|_| Error::Timeout {
                timeout_secs: limit.as_secs(),
            })?,
        None => stream.next().await,
    };
    next.transpose()
}
