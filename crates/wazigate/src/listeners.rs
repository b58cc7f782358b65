// ── Broker listeners ──
//
// One accept loop per configured address. Each accepted connection is
// served on its own task until the peer leaves or the loop is cancelled.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use wazigate_config::{Config, bind_addr};
use wazigate_mqtt::Broker;

use crate::error::CliError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Tcp,
    Tls,
    WebSocket,
    SecureWebSocket,
}

impl Transport {
    fn is_secure(self) -> bool {
        matches!(self, Self::Tls | Self::SecureWebSocket)
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Tcp => "mqtt",
            Self::Tls => "mqtts",
            Self::WebSocket => "ws",
            Self::SecureWebSocket => "wss",
        })
    }
}

/// Addresses to bind, in config order. Disabled listeners are skipped,
/// as are the TLS ones when no certificate is configured.
pub fn planned(config: &Config, tls: bool) -> Vec<(Transport, String)> {
    [
        (Transport::Tcp, &config.mqtt_addr),
        (Transport::Tls, &config.mqtts_addr),
        (Transport::WebSocket, &config.http_addr),
        (Transport::SecureWebSocket, &config.https_addr),
    ]
    .into_iter()
    .filter(|(kind, _)| tls || !kind.is_secure())
    .filter_map(|(kind, addr)| bind_addr(addr).map(|addr| (kind, addr)))
    .collect()
}

/// Bind every planned listener, then spawn its accept loop.
///
/// All addresses are bound before any loop starts, so a port clash
/// fails startup without leaving half the listeners running.
pub async fn bind_all(
    config: &Config,
    broker: &Broker,
    tls: Option<TlsAcceptor>,
    cancel: &CancellationToken,
) -> Result<Vec<JoinHandle<()>>, CliError> {
    if tls.is_none() && config.tls().is_none() {
        debug!("no TLS certificate configured, secure listeners disabled");
    }
    let mut bound = Vec::new();
    for (kind, addr) in planned(config, tls.is_some()) {
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| CliError::Bind {
                addr: addr.clone(),
                source,
            })?;
        info!(transport = %kind, addr = %addr, "listening");
        bound.push((kind, listener));
    }

    Ok(bound
        .into_iter()
        .map(|(kind, listener)| {
            tokio::spawn(accept_loop(
                listener,
                kind,
                broker.clone(),
                tls.clone(),
                cancel.clone(),
            ))
        })
        .collect())
}

async fn accept_loop(
    listener: TcpListener,
    kind: Transport,
    broker: Broker,
    tls: Option<TlsAcceptor>,
    cancel: CancellationToken,
) {
    loop {
        let (stream, peer) = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(transport = %kind, error = %e, "accept failed");
                    continue;
                }
            },
        };
        let _ = stream.set_nodelay(true);
        let broker = broker.clone();
        let tls = tls.clone();
        tokio::spawn(async move {
            debug!(transport = %kind, %peer, "connection accepted");
            let result = serve(&broker, kind, tls.as_ref(), stream).await;
            match result {
                Ok(()) => debug!(transport = %kind, %peer, "connection closed"),
                Err(e) if e.is_protocol() => {
                    warn!(transport = %kind, %peer, error = %e, "protocol violation");
                }
                Err(e) => debug!(transport = %kind, %peer, error = %e, "connection ended"),
            }
        });
    }
    debug!(transport = %kind, "listener stopped");
}

async fn serve(
    broker: &Broker,
    kind: Transport,
    tls: Option<&TlsAcceptor>,
    stream: TcpStream,
) -> Result<(), wazigate_mqtt::Error> {
    match (kind, tls) {
        (Transport::Tcp, _) => broker.serve(stream).await,
        (Transport::WebSocket, _) => broker.serve_websocket(stream).await,
        (Transport::Tls, Some(tls)) => broker.serve(tls.accept(stream).await?).await,
        (Transport::SecureWebSocket, Some(tls)) => {
            broker.serve_websocket(tls.accept(stream).await?).await
        }
        (_, None) => Err(wazigate_mqtt::Error::Closed),
    }
}

// ── TLS ──────────────────────────────────────────────────────────────

/// Build the acceptor shared by the `mqtts` and `wss` listeners.
pub fn tls_acceptor(crt: &Path, key: &Path) -> Result<TlsAcceptor, CliError> {
    let tls_err = |path: &Path, reason: String| CliError::Tls {
        path: path.display().to_string(),
        reason,
    };

    let certs = CertificateDer::pem_file_iter(crt)
        .map_err(|e| tls_err(crt, e.to_string()))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| tls_err(crt, e.to_string()))?;
    if certs.is_empty() {
        return Err(tls_err(crt, "no certificate found".into()));
    }
    let key = PrivateKeyDer::from_pem_file(key).map_err(|e| tls_err(key, e.to_string()))?;

    let config = rustls::ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .and_then(|b| b.with_no_client_auth().with_single_cert(certs, key))
    .map_err(|e| tls_err(crt, e.to_string()))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::time::Duration;
    use wazigate_mqtt::{Client, ClientOptions, Message, QoS, Queue};

    fn config(mqtt: &str) -> Config {
        Config {
            mqtt_addr: mqtt.into(),
            mqtts_addr: ":8883".into(),
            http_addr: String::new(),
            https_addr: ":443".into(),
            ..Config::default()
        }
    }

    #[test]
    fn secure_listeners_need_a_certificate() {
        let cfg = config(":1883");
        let plan = planned(&cfg, false);
        assert_eq!(plan, vec![(Transport::Tcp, "0.0.0.0:1883".to_owned())]);

        let plan = planned(&cfg, true);
        let kinds: Vec<Transport> = plan.iter().map(|(k, _)| *k).collect();
        assert_eq!(kinds, vec![Transport::Tcp, Transport::Tls, Transport::SecureWebSocket]);
    }

    #[test]
    fn missing_certificate_is_a_tls_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = tls_acceptor(&dir.path().join("gw.crt"), &dir.path().join("gw.key"))
            .err()
            .unwrap();
        assert!(matches!(err, CliError::Tls { .. }));
    }

    #[test]
    fn empty_certificate_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let crt = dir.path().join("gw.crt");
        std::fs::write(&crt, "").unwrap();
        let err = tls_acceptor(&crt, &dir.path().join("gw.key")).err().unwrap();
        assert!(err.to_string().contains("no certificate"));
    }

    #[tokio::test]
    async fn tcp_listener_serves_clients_until_cancelled() {
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = probe.local_addr().unwrap();
        drop(probe);

        let broker = Broker::default();
        let cancel = CancellationToken::new();
        let tasks = bind_all(&config(&addr.to_string()), &broker, None, &cancel)
            .await
            .unwrap();
        assert_eq!(tasks.len(), 1);

        let dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(Queue::open(dir.path(), "probe").await.unwrap());
        let (client, _inbox) = Client::dial(&ClientOptions::new(addr.to_string(), "probe"), queue)
            .await
            .unwrap();
        client
            .publish(&Message::new("a/b", "1").with_qos(QoS::AtLeastOnce))
            .await
            .unwrap();
        client.disconnect().await;

        cancel.cancel();
        for task in tasks {
            tokio::time::timeout(Duration::from_secs(5), task)
                .await
                .unwrap()
                .unwrap();
        }
    }

    #[tokio::test]
    async fn port_clash_fails_startup() {
        let held = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = held.local_addr().unwrap().to_string();
        let err = bind_all(&config(&addr), &Broker::default(), None, &CancellationToken::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, CliError::Bind { .. }));
    }
}
