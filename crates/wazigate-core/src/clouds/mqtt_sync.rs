// ── MQTT session loop ──
//
// Holds the link to the cloud broker: actuator values for tracked devices
// are republished locally, tunnel requests are served through the bridge
// handler. Redials with the shared backoff schedule.

use bytes::Bytes;
use secrecy::ExposeSecret;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use wazigate_mqtt::{Client, ClientOptions, Message, QoS};

use super::backoff::Backoff;
use super::cloud::{Cloud, actuator_filter};
use super::tunnel;
use crate::bridge::Response;
use crate::error::CoreError;

pub(crate) async fn run(cloud: Cloud, cancel: CancellationToken) {
    let id = cloud.id();
    let mut backoff = Backoff::new();

    loop {
        if cancel.is_cancelled() {
            break;
        }
        match session(&cloud, &cancel, &mut backoff).await {
            Ok(()) if cancel.is_cancelled() => break,
            Ok(()) => info!(cloud = %id, "MQTT session closed"),
            Err(e) => warn!(cloud = %id, error = %e, "MQTT session failed"),
        }
        if !backoff.wait(&cancel).await {
            break;
        }
    }
    debug!(cloud = %id, "MQTT loop exiting");
}

/// Dial, subscribe and pump messages until the link drops.
async fn session(
    cloud: &Cloud,
    cancel: &CancellationToken,
    backoff: &mut Backoff,
) -> Result<(), CoreError> {
    let ctx = cloud.context();
    let creds = cloud.credentials();
    let mut options = ClientOptions::new(cloud.mqtt_addr()?, ctx.local_id.clone());
    options.username = Some(creds.username.clone());
    options.password = Some(Bytes::from(creds.token.expose_secret().to_owned()));
    options.read_timeout = ctx.read_timeout;

    let queue = cloud.queue().await?;
    let (client, mut inbox) = tokio::select! {
        biased;
        () = cancel.cancelled() => return Ok(()),
        dialed = Client::dial(&options, queue) => dialed?,
    };
    backoff.reset();
    let _attached = Attached::new(cloud, &client);

    let mut topics: Vec<(String, QoS)> = cloud
        .tracked_devices()
        .iter()
        .map(|device| (actuator_filter(device), QoS::AtLeastOnce))
        .collect();
    topics.push((
        format!("devices/{}/{}/+", ctx.local_id, tunnel::TUNNEL_DOWN),
        QoS::AtMostOnce,
    ));
    client.subscribe_all(&topics).await?;

    loop {
        let msg = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                client.disconnect().await;
                break;
            }
            msg = inbox.recv() => msg,
        };
        let Some(msg) = msg else { break };

        if let Some(reference) = tunnel::reference(&msg.topic) {
            let reference = reference.to_owned();
            tokio::spawn(serve_tunnel(cloud.clone(), client.clone(), reference, msg));
        } else {
            debug!(topic = %msg.topic, "cloud message");
            ctx.downstream.publish(&msg);
        }
    }

    Ok(())
}

/// Publishes `client` as the cloud's live session until dropped, so every
/// exit path of [`session`] clears the slot.
struct Attached<'a> {
    cloud: &'a Cloud,
}

impl<'a> Attached<'a> {
    fn new(cloud: &'a Cloud, client: &Client) -> Self {
        cloud.set_mqtt_client(Some(client.clone()));
        Self { cloud }
    }
}

impl Drop for Attached<'_> {
    fn drop(&mut self) {
        self.cloud.set_mqtt_client(None);
    }
}

async fn serve_tunnel(cloud: Cloud, client: Client, reference: String, msg: Message) {
    let req = match tunnel::decode_request(&msg.payload) {
        Ok(req) => req,
        Err(e) => {
            warn!(topic = %msg.topic, error = %e, "dropping malformed tunnel frame");
            return;
        }
    };
    let ctx = cloud.context();
    debug!(method = %req.method, uri = %req.uri, "tunnel request");
    let resp = match ctx.handler() {
        Some(handler) => handler.handle(req).await,
        None => Response::text(503, "no handler"),
    };

    let topic = format!("devices/{}/{}/{reference}", ctx.local_id, tunnel::TUNNEL_UP);
    let reply = Message::new(topic, tunnel::encode_response(&resp));
    if let Err(e) = client.publish(&reply).await {
        warn!(cloud = %cloud.id(), error = %e, "tunnel reply not sent");
    }
}
