// Per-connection client session
//
// One task reads and dispatches inbound packets; a second task owns the
// write half and drains an unbounded channel, so every sender (acks from
// the read loop, deliveries from the topic tree) is serialized through it.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::broker::Broker;
use crate::error::Error;
use crate::message::Message;
use crate::packet::{
    ConnAck, ConnectReturnCode, Packet, Publish, QoS, SubAck, SubscribeReturnCode,
};
use crate::topic::{Receiver, Subscription, validate_topic_name};

/// Packet identifiers wrap back to 1 when the counter reaches this value.
pub const PACKET_ID_WRAP: u16 = 65_000;

/// How long a closing session waits for its writer to flush.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

// ── Session ──────────────────────────────────────────────────────────

pub struct Session {
    id: String,
    max_pending: usize,
    state: Mutex<SessionState>,
}

struct SessionState {
    tx: Option<mpsc::UnboundedSender<Packet>>,
    pending: HashMap<u16, Packet>,
    counter: u16,
    subscriptions: HashMap<String, Subscription>,
    inbound_qos2: HashSet<u16>,
}

impl SessionState {
    fn next_packet_id(&mut self) -> u16 {
        loop {
            self.counter += 1;
            if self.counter >= PACKET_ID_WRAP {
                self.counter = 1;
            }
            if !self.pending.contains_key(&self.counter) {
                return self.counter;
            }
        }
    }

    fn write(&self, packet: Packet) -> Result<(), Error> {
        self.tx
            .as_ref()
            .ok_or(Error::Closed)?
            .send(packet)
            .map_err(|_| Error::Closed)
    }
}

impl Session {
    /// Create a session and the receiving end of its outbound channel.
    pub fn new(id: impl Into<String>, max_pending: usize) -> (Arc<Self>, mpsc::UnboundedReceiver<Packet>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = Arc::new(Self {
            id: id.into(),
            max_pending,
            state: Mutex::new(SessionState {
                tx: Some(tx),
                pending: HashMap::new(),
                counter: 0,
                subscriptions: HashMap::new(),
                inbound_qos2: HashSet::new(),
            }),
        });
        (session, rx)
    }

    pub fn client_id(&self) -> &str {
        &self.id
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a packet for the peer. Packets sent with QoS > 0 are kept in
    /// the pending window until acknowledged.
    pub fn send(&self, packet: Packet) -> Result<(), Error> {
        let mut state = self.state();
        if packet.qos() > QoS::AtMostOnce {
            let id = packet
                .packet_id()
                .ok_or_else(|| Error::protocol("QoS > 0 packet without packet id"))?;
            if state.pending.len() >= self.max_pending {
                return Err(Error::MaxPendingExceeded {
                    max: self.max_pending,
                });
            }
            state.pending.insert(id, packet.clone());
        }
        state.write(packet)
    }

    /// Wrap `msg` in a PUBLISH, allocating a packet id when needed.
    pub fn publish_message(&self, msg: &Message) -> Result<(), Error> {
        let mut state = self.state();
        let packet_id = if msg.qos > QoS::AtMostOnce {
            if state.pending.len() >= self.max_pending {
                return Err(Error::MaxPendingExceeded {
                    max: self.max_pending,
                });
            }
            Some(state.next_packet_id())
        } else {
            None
        };
        let packet = Packet::Publish(Publish::from_message(msg, packet_id));
        if let Some(id) = packet_id {
            state.pending.insert(id, packet.clone());
        }
        state.write(packet)
    }

    /// Queue a packet outside the pending window (acks, pings).
    fn write(&self, packet: Packet) -> Result<(), Error> {
        self.state().write(packet)
    }

    pub fn pending_len(&self) -> usize {
        self.state().pending.len()
    }

    fn acknowledge(&self, packet_id: u16) {
        if self.state().pending.remove(&packet_id).is_none() {
            debug!(client_id = %self.id, packet_id, "ack for unknown packet id");
        }
    }

    /// PUBREC: the PUBLISH is replaced by a PUBREL that stays pending until
    /// PUBCOMP.
    fn release(&self, packet_id: u16) -> Result<(), Error> {
        let mut state = self.state();
        state.pending.insert(packet_id, Packet::PubRel(packet_id));
        state.write(Packet::PubRel(packet_id))
    }

    /// Record an inbound QoS 2 packet id. Returns `false` for a redelivery.
    fn begin_qos2(&self, packet_id: u16) -> bool {
        self.state().inbound_qos2.insert(packet_id)
    }

    fn end_qos2(&self, packet_id: u16) {
        self.state().inbound_qos2.remove(&packet_id);
    }

    fn add_subscription(&self, sub: Subscription) -> Option<Subscription> {
        self.state().subscriptions.insert(sub.topic.clone(), sub)
    }

    fn remove_subscription(&self, topic: &str) -> Option<Subscription> {
        self.state().subscriptions.remove(topic)
    }

    fn take_subscriptions(&self) -> Vec<Subscription> {
        self.state().subscriptions.drain().map(|(_, s)| s).collect()
    }

    /// Drop the outbound sender; the writer exits once the channel drains.
    fn close(&self) {
        self.state().tx = None;
    }
}

impl Receiver for Session {
    fn id(&self) -> &str {
        &self.id
    }

    fn publish(&self, msg: &Message) {
        if let Err(e) = self.publish_message(msg) {
            warn!(client_id = %self.id, topic = %msg.topic, error = %e, "dropping delivery");
        }
    }
}

// ── Connection lifecycle ─────────────────────────────────────────────

/// Run one client connection from CONNECT to close.
///
/// Returns `Ok(())` after a clean DISCONNECT. Any other ending publishes
/// the client's will, if it declared one.
pub(crate) async fn run<St, Si>(broker: Broker, mut stream: St, mut sink: Si) -> Result<(), Error>
where
    St: Stream<Item = Result<Packet, Error>> + Unpin + Send,
    Si: Sink<Packet, Error = Error> + Unpin + Send + 'static,
{
    let read_timeout = broker.options().read_timeout;

    let connect = match next_packet(&mut stream, read_timeout).await? {
        Some(Packet::Connect(connect)) => connect,
        Some(other) => {
            return Err(Error::protocol(format!(
                "expected CONNECT, got {}",
                other.packet_type()
            )));
        }
        None => return Err(Error::Closed),
    };
    trace!(client_id = %connect.client_id, keep_alive = connect.keep_alive, "← CONNECT");

    let client_id = match broker.accept(&connect).await {
        Ok(id) => id,
        Err(code) => {
            debug!(client_id = %connect.client_id, %code, "rejecting connection");
            sink.send(Packet::ConnAck(ConnAck {
                session_present: false,
                code,
            }))
            .await?;
            let _ = sink.close().await;
            return Err(Error::ConnectionRefused(code));
        }
    };

    sink.send(Packet::ConnAck(ConnAck {
        session_present: false,
        code: ConnectReturnCode::Accepted,
    }))
    .await?;

    let (session, rx) = Session::new(client_id.clone(), broker.options().max_pending);
    let (generation, cancel) = broker.register(&client_id);
    let writer = tokio::spawn(write_loop(sink, rx, client_id.clone()));
    info!(client_id = %client_id, "client connected");

    let result = read_loop(&broker, &session, &mut stream, &cancel, read_timeout).await;

    for sub in session.take_subscriptions() {
        broker.unsubscribe(&sub);
    }
    session.close();
    broker.unregister(&client_id, generation);
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer).await.is_err() {
        debug!(client_id = %client_id, "writer did not drain in time");
    }

    match &result {
        Ok(()) => info!(client_id = %client_id, "client disconnected"),
        Err(e) => {
            info!(client_id = %client_id, error = %e, "client connection lost");
            if let Some(will) = &connect.will {
                // Wills are the broker's own publish and skip the filter.
                let hits = broker.publish(Some(&client_id), will);
                debug!(client_id = %client_id, topic = %will.topic, hits, "published will");
            }
        }
    }
    result
}

async fn next_packet<St>(stream: &mut St, timeout: Option<Duration>) -> Result<Option<Packet>, Error>
where
    St: Stream<Item = Result<Packet, Error>> + Unpin,
{
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

async fn write_loop<Si>(mut sink: Si, mut rx: mpsc::UnboundedReceiver<Packet>, client_id: String)
where
    Si: Sink<Packet, Error = Error> + Unpin,
{
    while let Some(packet) = rx.recv().await {
        trace!(client_id = %client_id, "→ {packet}");
        if let Err(e) = sink.send(packet).await {
            debug!(client_id = %client_id, error = %e, "write failed");
            return;
        }
    }
    let _ = sink.close().await;
}

async fn read_loop<St>(
    broker: &Broker,
    session: &Arc<Session>,
    stream: &mut St,
    cancel: &CancellationToken,
    read_timeout: Option<Duration>,
) -> Result<(), Error>
where
    St: Stream<Item = Result<Packet, Error>> + Unpin + Send,
{
    loop {
        let packet = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(Error::Closed),
            next = next_packet(stream, read_timeout) => match next? {
                Some(packet) => packet,
                None => return Err(Error::Closed),
            },
        };
        trace!(client_id = %session.client_id(), "← {packet}");

        if handle_packet(broker, session, packet).await? {
            return Ok(());
        }
    }
}

/// Dispatch one inbound packet. Returns `true` on DISCONNECT.
async fn handle_packet(broker: &Broker, session: &Arc<Session>, packet: Packet) -> Result<bool, Error> {
    match packet {
        Packet::Publish(publish) => {
            let msg = publish.to_message();
            if let Err(e) = validate_topic_name(&msg.topic) {
                warn!(client_id = %session.client_id(), error = %e, "dropping publish");
                return Ok(false);
            }
            match (publish.qos, publish.packet_id) {
                (QoS::AtMostOnce, _) => deliver(broker, session, &msg).await,
                (QoS::AtLeastOnce, Some(id)) => {
                    session.write(Packet::PubAck(id))?;
                    deliver(broker, session, &msg).await;
                }
                (QoS::ExactlyOnce, Some(id)) => {
                    session.write(Packet::PubRec(id))?;
                    if session.begin_qos2(id) {
                        deliver(broker, session, &msg).await;
                    }
                }
                _ => return Err(Error::protocol("PUBLISH with QoS > 0 lacks a packet id")),
            }
        }
        Packet::PubAck(id) | Packet::PubComp(id) => session.acknowledge(id),
        Packet::PubRec(id) => session.release(id)?,
        Packet::PubRel(id) => {
            session.end_qos2(id);
            session.write(Packet::PubComp(id))?;
        }
        Packet::Subscribe(subscribe) => {
            let mut return_codes = Vec::with_capacity(subscribe.topics.len());
            for (filter, qos) in &subscribe.topics {
                let receiver: Arc<dyn Receiver> = Arc::clone(session) as Arc<dyn Receiver>;
                match broker.subscribe(filter, receiver, *qos) {
                    Ok(sub) => {
                        if let Some(old) = session.add_subscription(sub) {
                            broker.unsubscribe(&old);
                        }
                        return_codes.push(SubscribeReturnCode::Granted(*qos));
                    }
                    Err(e) => {
                        warn!(client_id = %session.client_id(), error = %e, "subscription refused");
                        return_codes.push(SubscribeReturnCode::Failure);
                    }
                }
            }
            session.write(Packet::SubAck(SubAck {
                packet_id: subscribe.packet_id,
                return_codes,
            }))?;
        }
        Packet::Unsubscribe(unsubscribe) => {
            for topic in &unsubscribe.topics {
                if let Some(sub) = session.remove_subscription(topic) {
                    broker.unsubscribe(&sub);
                }
            }
            session.write(Packet::UnsubAck(unsubscribe.packet_id))?;
        }
        Packet::PingReq => session.write(Packet::PingResp)?,
        Packet::Disconnect => return Ok(true),
        other => {
            return Err(Error::protocol(format!(
                "unexpected {} from client",
                other.packet_type()
            )));
        }
    }
    Ok(false)
}

async fn deliver(broker: &Broker, session: &Session, msg: &Message) {
    let hits = broker.publish_from(session.client_id(), msg).await;
    trace!(client_id = %session.client_id(), topic = %msg.topic, hits, "delivered");
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn pending_window_is_bounded() {
        let (session, _rx) = Session::new("c", 3);
        let msg = Message::new("t", "x").with_qos(QoS::AtLeastOnce);
        for _ in 0..3 {
            session.publish_message(&msg).unwrap();
        }
        let err = session.publish_message(&msg).unwrap_err();
        assert!(matches!(err, Error::MaxPendingExceeded { max: 3 }));

        // QoS 0 bypasses the window.
        session.publish_message(&Message::new("t", "x")).unwrap();
        assert_eq!(session.pending_len(), 3);
    }

    #[test]
    fn send_rejects_when_window_full() {
        let (session, _rx) = Session::new("c", 1);
        let publish = |id| {
            Packet::Publish(Publish {
                dup: false,
                qos: QoS::AtLeastOnce,
                retain: false,
                topic: "t".into(),
                packet_id: Some(id),
                payload: bytes::Bytes::new(),
            })
        };
        session.send(publish(1)).unwrap();
        assert!(matches!(
            session.send(publish(2)),
            Err(Error::MaxPendingExceeded { .. })
        ));
        session.acknowledge(1);
        session.send(publish(2)).unwrap();
    }

    #[test]
    fn packet_ids_wrap_and_skip_zero() {
        let (session, _rx) = Session::new("c", 10);
        let mut state = session.state();
        state.counter = PACKET_ID_WRAP - 2;
        assert_eq!(state.next_packet_id(), PACKET_ID_WRAP - 1);
        assert_eq!(state.next_packet_id(), 1);
        assert_eq!(state.next_packet_id(), 2);
    }

    #[test]
    fn pubrec_replaces_pending_publish_with_pubrel() {
        let (session, mut rx) = Session::new("c", 10);
        session
            .publish_message(&Message::new("t", "x").with_qos(QoS::ExactlyOnce))
            .unwrap();
        let Packet::Publish(p) = rx.try_recv().unwrap() else {
            panic!("expected PUBLISH");
        };
        let id = p.packet_id.unwrap();

        session.release(id).unwrap();
        assert_eq!(rx.try_recv().unwrap(), Packet::PubRel(id));
        assert_eq!(session.pending_len(), 1);

        session.acknowledge(id);
        assert_eq!(session.pending_len(), 0);
    }

    #[test]
    fn closed_session_refuses_writes() {
        let (session, _rx) = Session::new("c", 10);
        session.close();
        assert!(matches!(session.write(Packet::PingResp), Err(Error::Closed)));
    }
}
