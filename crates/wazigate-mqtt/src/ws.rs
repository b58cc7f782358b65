// MQTT over WebSocket
//
// Each binary frame carries a slice of the MQTT byte stream; frames are
// buffered and decoded with the same codec as TCP. Text frames are a
// protocol violation.

use std::pin::Pin;

use async_stream::try_stream;
use bytes::BytesMut;
use futures_util::{Sink, SinkExt, Stream, StreamExt, future};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode, header};
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
use tokio_util::codec::Decoder;
use tracing::debug;

use crate::broker::Broker;
use crate::codec::MqttCodec;
use crate::error::Error;
use crate::packet::Packet;

/// Accepted `Sec-WebSocket-Protocol` values, in order of preference.
pub const SUBPROTOCOLS: [&str; 2] = ["mqttv3.1", "mqtt"];

/// Pick the first offered subprotocol the broker speaks.
pub fn select_subprotocol(offered: &str) -> Option<&'static str> {
    let offered: Vec<&str> = offered.split(',').map(str::trim).collect();
    SUBPROTOCOLS
        .iter()
        .find(|p| offered.iter().any(|o| o.eq_ignore_ascii_case(p)))
        .copied()
}

fn negotiate(req: &Request, mut resp: Response) -> Result<Response, ErrorResponse> {
    let offered = req
        .headers()
        .get(header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    if let Some(protocol) = select_subprotocol(offered) {
        resp.headers_mut()
            .insert(header::SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(protocol));
        Ok(resp)
    } else {
        debug!(offered, "rejecting WebSocket without MQTT subprotocol");
        let mut err = ErrorResponse::new(Some("unsupported WebSocket subprotocol".to_owned()));
        *err.status_mut() = StatusCode::BAD_REQUEST;
        Err(err)
    }
}

/// Decode MQTT packets out of a stream of WebSocket messages.
pub fn packet_stream<S>(mut ws: S) -> Pin<Box<dyn Stream<Item = Result<Packet, Error>> + Send>>
where
    S: Stream<Item = Result<WsMessage, tungstenite::Error>> + Unpin + Send + 'static,
{
    Box::pin(try_stream! {
        let mut codec = MqttCodec::new();
        let mut buf = BytesMut::new();
        while let Some(frame) = ws.next().await {
            match frame.map_err(Error::from)? {
                WsMessage::Binary(data) => {
                    buf.extend_from_slice(&data);
                    while let Some(packet) = codec.decode(&mut buf)? {
                        yield packet;
                    }
                }
                WsMessage::Text(_) => {
                    Err(Error::protocol("text frames are not allowed"))?;
                }
                WsMessage::Close(_) => break,
                WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_) => {}
            }
        }
    })
}

/// Encode each packet into one binary WebSocket message.
pub fn packet_sink<S>(ws: S) -> impl Sink<Packet, Error = Error> + Unpin + Send
where
    S: Sink<WsMessage, Error = tungstenite::Error> + Unpin + Send,
{
    ws.with(|packet: Packet| {
        let mut buf = BytesMut::with_capacity(packet.encoded_len());
        future::ready(
            packet
                .encode(&mut buf)
                .map(|()| WsMessage::Binary(buf.freeze())),
        )
    })
}

impl Broker {
    /// Run the WebSocket upgrade on `io` and serve the MQTT client behind it.
    pub async fn serve_websocket<IO>(&self, io: IO) -> Result<(), Error>
    where
        IO: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let ws = tokio_tungstenite::accept_hdr_async(io, negotiate).await?;
        let (sink, stream) = ws.split();
        self.serve_stream(packet_stream(stream), packet_sink(sink)).await
    }
}
