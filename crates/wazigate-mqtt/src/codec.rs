// tokio-util framing for MQTT packets

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::Error;
use crate::packet::{FixedHeader, MAX_REMAINING_LENGTH, Packet, read_variable_length};

/// Frames a byte stream into [`Packet`]s.
///
/// Use with `tokio_util::codec::Framed` on TCP, TLS or in-memory duplex
/// streams. WebSocket transports feed binary frames through the same
/// decoder.
#[derive(Debug, Clone, Copy)]
pub struct MqttCodec {
    max_packet_size: usize,
}

impl Default for MqttCodec {
    fn default() -> Self {
        Self {
            max_packet_size: MAX_REMAINING_LENGTH,
        }
    }
}

impl MqttCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject packets whose remaining length exceeds `max`.
    pub fn with_max_packet_size(max: usize) -> Self {
        Self {
            max_packet_size: max.min(MAX_REMAINING_LENGTH),
        }
    }
}

/// Upper bound on buffer growth per partial read; larger bodies grow as
/// their bytes arrive.
const MAX_RESERVE: usize = 64 * 1024;

impl Decoder for MqttCodec {
    type Item = Packet;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Packet>, Error> {
        let Some(&control) = src.first() else {
            return Ok(None);
        };
        let Some((length, length_bytes)) = read_variable_length(&src[1..])? else {
            return Ok(None);
        };
        if length > self.max_packet_size {
            return Err(Error::PacketTooLarge {
                length,
                max: self.max_packet_size,
            });
        }

        // Validate the type before waiting for the body so garbage fails fast.
        let header = FixedHeader::from_control_byte(control, length)?;

        let total = 1 + length_bytes + length;
        if src.len() < total {
            src.reserve((total - src.len()).min(MAX_RESERVE));
            return Ok(None);
        }

        src.advance(1 + length_bytes);
        let body = src.split_to(length).freeze();
        Packet::decode(header, body).map(Some)
    }
}

impl Encoder<Packet> for MqttCodec {
    type Error = Error;

    fn encode(&mut self, packet: Packet, dst: &mut BytesMut) -> Result<(), Error> {
        packet.encode(dst)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::packet::{Publish, QoS};
    use bytes::Bytes;

    #[test]
    fn decodes_across_partial_reads() {
        let packet = Packet::Publish(Publish {
            dup: false,
            qos: QoS::AtLeastOnce,
            retain: false,
            topic: "a/b".into(),
            packet_id: Some(42),
            payload: Bytes::from_static(b"hello"),
        });
        let mut wire = BytesMut::new();
        packet.encode(&mut wire).unwrap();
        Packet::PingReq.encode(&mut wire).unwrap();

        let mut codec = MqttCodec::new();
        let mut buf = BytesMut::new();
        let mut decoded = Vec::new();
        for byte in wire.iter() {
            buf.extend_from_slice(&[*byte]);
            while let Some(p) = codec.decode(&mut buf).unwrap() {
                decoded.push(p);
            }
        }
        assert_eq!(decoded, vec![packet, Packet::PingReq]);
        assert!(buf.is_empty());
    }

    #[test]
    fn oversize_packet_is_rejected_before_body_arrives() {
        let mut codec = MqttCodec::with_max_packet_size(16);
        let mut buf = BytesMut::from(&[0x30, 0x20][..]);
        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, Error::PacketTooLarge { length: 32, max: 16 }));
    }

    #[test]
    fn large_declared_length_does_not_preallocate() {
        let mut codec = MqttCodec::new();
        // PUBLISH announcing a ~200 MiB body.
        let mut buf = BytesMut::from(&[0x30, 0xFF, 0xFF, 0xFF, 0x5F][..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert!(buf.capacity() <= 2 * MAX_RESERVE, "capacity {}", buf.capacity());
    }

    #[test]
    fn reserved_type_is_rejected() {
        let mut codec = MqttCodec::new();
        let mut buf = BytesMut::from(&[0xF0, 0x00][..]);
        assert!(codec.decode(&mut buf).unwrap_err().is_protocol());
    }
}
