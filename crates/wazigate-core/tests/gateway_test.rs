#![allow(clippy::unwrap_used)]
// Ordinary MQTT clients against a started gateway: its broker with the
// bridge filter installed, served over loopback TCP.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use pretty_assertions::assert_eq;
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;

use wazigate_core::model::{Device, Sensor};
use wazigate_core::store::{MemoryStore, Store};
use wazigate_core::{Gateway, GatewayOptions};
use wazigate_mqtt::packet::Connect;
use wazigate_mqtt::{
    Client, ClientOptions, ConnectReturnCode, Inbox, Message, MqttCodec, Packet, QoS, Queue,
};

// ── Helpers ─────────────────────────────────────────────────────────

async fn serve(dir: &Path) -> (Gateway, Arc<MemoryStore>, String) {
    let store = Arc::new(MemoryStore::new());
    store
        .put_device(Device::new("d1", "Node").with_sensor(Sensor::new("s1", "Temp")))
        .await
        .unwrap();
    let options = GatewayOptions {
        local_id: Some("gw".into()),
        clouds_file: dir.join("clouds.json"),
        session_dir: dir.join("session"),
        ..GatewayOptions::default()
    };
    let gateway = Gateway::start(options, store.clone() as Arc<dyn Store>)
        .await
        .unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let broker = gateway.broker().clone();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let broker = broker.clone();
            tokio::spawn(async move {
                let _ = broker.serve(stream).await;
            });
        }
    });
    (gateway, store, addr)
}

async fn dial(dir: &Path, addr: &str, id: &str) -> (Client, Inbox) {
    let queue = Arc::new(Queue::open(dir.join("clients"), id).await.unwrap());
    Client::dial(&ClientOptions::new(addr, id), queue).await.unwrap()
}

/// Subscribe and wait for the SUBACK.
async fn subscribe(client: &Client, filter: &str) {
    client.subscribe(filter, QoS::AtLeastOnce).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while client.pending_len() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

async fn next(inbox: &mut Inbox) -> Message {
    tokio::time::timeout(Duration::from_secs(5), inbox.recv())
        .await
        .unwrap()
        .unwrap()
}

// ── Scenarios ───────────────────────────────────────────────────────

#[tokio::test]
async fn test_value_publish_is_stored_and_delivered() {
    let dir = tempfile::tempdir().unwrap();
    let (gateway, store, addr) = serve(dir.path()).await;

    let (sub, mut inbox) = dial(dir.path(), &addr, "dashboard").await;
    subscribe(&sub, "devices/+/sensors/#").await;

    let (node, _) = dial(dir.path(), &addr, "node-1").await;
    node.publish(&Message::new("devices/d1/sensors/s1/value", "21.5").with_qos(QoS::AtLeastOnce))
        .await
        .unwrap();

    let got = next(&mut inbox).await;
    assert_eq!(got.topic, "devices/d1/sensors/s1/value");
    assert_eq!(got.payload.as_ref(), b"21.5");
    let device = store.get_device("d1").await.unwrap();
    assert_eq!(device.sensor("s1").unwrap().value, Some(json!(21.5)));

    node.disconnect().await;
    sub.disconnect().await;
    gateway.shutdown().await;
}

#[tokio::test]
async fn test_will_of_severed_client_is_delivered() {
    let dir = tempfile::tempdir().unwrap();
    let (gateway, _, addr) = serve(dir.path()).await;

    let (sub, mut inbox) = dial(dir.path(), &addr, "watcher").await;
    subscribe(&sub, "c/status").await;

    let mut connect = Connect::new("c");
    connect.will = Some(Message::new("c/status", "offline").with_qos(QoS::AtLeastOnce));
    let mut conn = Framed::new(TcpStream::connect(&addr).await.unwrap(), MqttCodec::new());
    conn.send(Packet::Connect(connect)).await.unwrap();
    let Some(Ok(Packet::ConnAck(ack))) = conn.next().await else {
        panic!("expected CONNACK");
    };
    assert_eq!(ack.code, ConnectReturnCode::Accepted);

    // The bridge has no route for this topic, so a live publish is dropped.
    conn.send(Packet::Publish(wazigate_mqtt::packet::Publish::from_message(
        &Message::new("c/status", "online"),
        None,
    )))
    .await
    .unwrap();

    drop(conn);

    let will = next(&mut inbox).await;
    assert_eq!(will.topic, "c/status");
    assert_eq!(will.payload.as_ref(), b"offline");

    sub.disconnect().await;
    gateway.shutdown().await;
}
