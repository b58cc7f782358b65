// MQTT 3.1 / 3.1.1 control packets
//
// One struct per packet type plus the `Packet` sum type. Builders are the
// plain constructors; parsing and serialization live on `Packet` and share
// the fixed-header and string helpers at the bottom of this file.

use std::fmt;
use std::io::{Read, Write};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::Error;
use crate::message::Message;

/// Largest remaining length a 4-byte variable integer can carry.
pub const MAX_REMAINING_LENGTH: usize = 0x0FFF_FFFF;

/// Protocol name/level pairs accepted by the broker.
pub const PROTOCOL_MQTT_311: (&str, u8) = ("MQTT", 4);
pub const PROTOCOL_MQTT_31: (&str, u8) = ("MQIsdp", 3);

// ── Quality of service ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, strum::Display)]
#[repr(u8)]
pub enum QoS {
    #[default]
    #[strum(serialize = "0")]
    AtMostOnce = 0,
    #[strum(serialize = "1")]
    AtLeastOnce = 1,
    #[strum(serialize = "2")]
    ExactlyOnce = 2,
}

impl QoS {
    pub fn from_u8(value: u8) -> Result<Self, Error> {
        match value {
            0 => Ok(Self::AtMostOnce),
            1 => Ok(Self::AtLeastOnce),
            2 => Ok(Self::ExactlyOnce),
            n => Err(Error::protocol(format!("invalid QoS level {n}"))),
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

// ── Packet type ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "UPPERCASE")]
pub enum PacketType {
    Connect = 1,
    ConnAck = 2,
    Publish = 3,
    PubAck = 4,
    PubRec = 5,
    PubRel = 6,
    PubComp = 7,
    Subscribe = 8,
    SubAck = 9,
    Unsubscribe = 10,
    UnsubAck = 11,
    PingReq = 12,
    PingResp = 13,
    Disconnect = 14,
}

impl PacketType {
    /// Types 0 and 15 are reserved and rejected.
    pub fn from_nibble(nibble: u8) -> Result<Self, Error> {
        Ok(match nibble {
            1 => Self::Connect,
            2 => Self::ConnAck,
            3 => Self::Publish,
            4 => Self::PubAck,
            5 => Self::PubRec,
            6 => Self::PubRel,
            7 => Self::PubComp,
            8 => Self::Subscribe,
            9 => Self::SubAck,
            10 => Self::Unsubscribe,
            11 => Self::UnsubAck,
            12 => Self::PingReq,
            13 => Self::PingResp,
            14 => Self::Disconnect,
            n => return Err(Error::protocol(format!("reserved packet type {n}"))),
        })
    }
}

// ── Fixed header ─────────────────────────────────────────────────────

/// Control byte plus remaining length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedHeader {
    pub packet_type: PacketType,
    pub dup: bool,
    pub qos: QoS,
    pub retain: bool,
    pub remaining_length: usize,
}

impl FixedHeader {
    fn new(packet_type: PacketType, remaining_length: usize) -> Self {
        // SUBSCRIBE, UNSUBSCRIBE and PUBREL carry the fixed flags 0b0010.
        let qos = match packet_type {
            PacketType::Subscribe | PacketType::Unsubscribe | PacketType::PubRel => {
                QoS::AtLeastOnce
            }
            _ => QoS::AtMostOnce,
        };
        Self {
            packet_type,
            dup: false,
            qos,
            retain: false,
            remaining_length,
        }
    }

    pub fn control_byte(&self) -> u8 {
        let mut byte = (self.packet_type as u8) << 4;
        if self.dup {
            byte |= 0x08;
        }
        byte |= self.qos.as_u8() << 1;
        if self.retain {
            byte |= 0x01;
        }
        byte
    }

    /// Parse a control byte; the remaining length is filled in by the caller.
    pub fn from_control_byte(byte: u8, remaining_length: usize) -> Result<Self, Error> {
        let packet_type = PacketType::from_nibble(byte >> 4)?;
        if packet_type != PacketType::Publish {
            // Flags of other packet types are fixed; tolerate deviations.
            return Ok(Self::new(packet_type, remaining_length));
        }
        Ok(Self {
            packet_type,
            dup: byte & 0x08 != 0,
            qos: QoS::from_u8((byte >> 1) & 0x03)?,
            retain: byte & 0x01 != 0,
            remaining_length,
        })
    }

    /// Size of the header on the wire (control byte + length bytes).
    pub fn len(&self) -> usize {
        1 + variable_length_size(self.remaining_length)
    }

    pub fn is_empty(&self) -> bool {
        false
    }
}

// ── CONNECT ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    pub protocol_name: String,
    pub protocol_level: u8,
    pub clean_session: bool,
    pub keep_alive: u16,
    pub client_id: String,
    pub will: Option<Message>,
    pub username: Option<String>,
    pub password: Option<Bytes>,
}

impl Connect {
    /// A 3.1.1 CONNECT with a clean session and no will.
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            protocol_name: PROTOCOL_MQTT_311.0.to_owned(),
            protocol_level: PROTOCOL_MQTT_311.1,
            clean_session: true,
            keep_alive: 0,
            client_id: client_id.into(),
            will: None,
            username: None,
            password: None,
        }
    }

    pub fn is_supported_protocol(&self) -> bool {
        let pair = (self.protocol_name.as_str(), self.protocol_level);
        pair == PROTOCOL_MQTT_311 || pair == PROTOCOL_MQTT_31
    }

    fn flags(&self) -> u8 {
        let mut flags = 0u8;
        if self.clean_session {
            flags |= 0x02;
        }
        if let Some(will) = &self.will {
            flags |= 0x04;
            flags |= will.qos.as_u8() << 3;
            if will.retain {
                flags |= 0x20;
            }
        }
        if self.password.is_some() {
            flags |= 0x40;
        }
        if self.username.is_some() {
            flags |= 0x80;
        }
        flags
    }
}

// ── CONNACK ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[repr(u8)]
pub enum ConnectReturnCode {
    #[strum(serialize = "accepted")]
    Accepted = 0,
    #[strum(serialize = "unacceptable protocol version")]
    UnacceptableProtocolVersion = 1,
    #[strum(serialize = "identifier rejected")]
    IdentifierRejected = 2,
    #[strum(serialize = "server unavailable")]
    ServerUnavailable = 3,
    #[strum(serialize = "bad user name or password")]
    BadUsernameOrPassword = 4,
    #[strum(serialize = "not authorized")]
    NotAuthorized = 5,
}

impl ConnectReturnCode {
    pub fn from_u8(value: u8) -> Result<Self, Error> {
        Ok(match value {
            0 => Self::Accepted,
            1 => Self::UnacceptableProtocolVersion,
            2 => Self::IdentifierRejected,
            3 => Self::ServerUnavailable,
            4 => Self::BadUsernameOrPassword,
            5 => Self::NotAuthorized,
            n => return Err(Error::protocol(format!("unknown CONNACK code {n}"))),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnAck {
    pub session_present: bool,
    pub code: ConnectReturnCode,
}

// ── PUBLISH ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    pub dup: bool,
    pub qos: QoS,
    pub retain: bool,
    pub topic: String,
    /// Present iff `qos > 0`.
    pub packet_id: Option<u16>,
    pub payload: Bytes,
}

impl Publish {
    pub fn from_message(msg: &Message, packet_id: Option<u16>) -> Self {
        Self {
            dup: false,
            qos: msg.qos,
            retain: msg.retain,
            topic: msg.topic.clone(),
            packet_id,
            payload: msg.payload.clone(),
        }
    }

    pub fn to_message(&self) -> Message {
        Message {
            topic: self.topic.clone(),
            payload: self.payload.clone(),
            qos: self.qos,
            retain: self.retain,
        }
    }
}

// ── SUBSCRIBE / SUBACK / UNSUBSCRIBE ─────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribe {
    pub packet_id: u16,
    pub topics: Vec<(String, QoS)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeReturnCode {
    Granted(QoS),
    Failure,
}

impl SubscribeReturnCode {
    fn as_u8(self) -> u8 {
        match self {
            Self::Granted(qos) => qos.as_u8(),
            Self::Failure => 0x80,
        }
    }

    fn from_u8(value: u8) -> Result<Self, Error> {
        match value {
            0x80 => Ok(Self::Failure),
            n => QoS::from_u8(n).map(Self::Granted),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubAck {
    pub packet_id: u16,
    pub return_codes: Vec<SubscribeReturnCode>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unsubscribe {
    pub packet_id: u16,
    pub topics: Vec<String>,
}

// ── Packet ───────────────────────────────────────────────────────────

/// Any of the 14 MQTT 3.1.1 control packets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect(Connect),
    ConnAck(ConnAck),
    Publish(Publish),
    PubAck(u16),
    PubRec(u16),
    PubRel(u16),
    PubComp(u16),
    Subscribe(Subscribe),
    SubAck(SubAck),
    Unsubscribe(Unsubscribe),
    UnsubAck(u16),
    PingReq,
    PingResp,
    Disconnect,
}

impl Packet {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Self::Connect(_) => PacketType::Connect,
            Self::ConnAck(_) => PacketType::ConnAck,
            Self::Publish(_) => PacketType::Publish,
            Self::PubAck(_) => PacketType::PubAck,
            Self::PubRec(_) => PacketType::PubRec,
            Self::PubRel(_) => PacketType::PubRel,
            Self::PubComp(_) => PacketType::PubComp,
            Self::Subscribe(_) => PacketType::Subscribe,
            Self::SubAck(_) => PacketType::SubAck,
            Self::Unsubscribe(_) => PacketType::Unsubscribe,
            Self::UnsubAck(_) => PacketType::UnsubAck,
            Self::PingReq => PacketType::PingReq,
            Self::PingResp => PacketType::PingResp,
            Self::Disconnect => PacketType::Disconnect,
        }
    }

    /// Packet identifier, for the packet types that carry one.
    pub fn packet_id(&self) -> Option<u16> {
        match self {
            Self::Publish(p) => p.packet_id,
            Self::PubAck(id)
            | Self::PubRec(id)
            | Self::PubRel(id)
            | Self::PubComp(id)
            | Self::UnsubAck(id) => Some(*id),
            Self::Subscribe(s) => Some(s.packet_id),
            Self::SubAck(s) => Some(s.packet_id),
            Self::Unsubscribe(u) => Some(u.packet_id),
            _ => None,
        }
    }

    /// QoS the packet is sent with. Only PUBLISH carries a meaningful level.
    pub fn qos(&self) -> QoS {
        match self {
            Self::Publish(p) => p.qos,
            _ => QoS::AtMostOnce,
        }
    }

    pub fn header(&self) -> FixedHeader {
        let mut header = FixedHeader::new(self.packet_type(), self.body_len());
        if let Self::Publish(p) = self {
            header.dup = p.dup;
            header.qos = p.qos;
            header.retain = p.retain;
        }
        header
    }

    /// Total encoded size including the fixed header.
    pub fn encoded_len(&self) -> usize {
        self.header().len() + self.body_len()
    }

    fn body_len(&self) -> usize {
        match self {
            Self::Connect(c) => {
                let mut len = string_len(&c.protocol_name) + 1 + 1 + 2 + string_len(&c.client_id);
                if let Some(will) = &c.will {
                    len += string_len(&will.topic) + 2 + will.payload.len();
                }
                if let Some(username) = &c.username {
                    len += string_len(username);
                }
                if let Some(password) = &c.password {
                    len += 2 + password.len();
                }
                len
            }
            Self::ConnAck(_)
            | Self::PubAck(_)
            | Self::PubRec(_)
            | Self::PubRel(_)
            | Self::PubComp(_)
            | Self::UnsubAck(_) => 2,
            Self::Publish(p) => {
                string_len(&p.topic) + p.packet_id.map_or(0, |_| 2) + p.payload.len()
            }
            Self::Subscribe(s) => {
                2 + s.topics.iter().map(|(t, _)| string_len(t) + 1).sum::<usize>()
            }
            Self::SubAck(s) => 2 + s.return_codes.len(),
            Self::Unsubscribe(u) => 2 + u.topics.iter().map(|t| string_len(t)).sum::<usize>(),
            Self::PingReq | Self::PingResp | Self::Disconnect => 0,
        }
    }

    // ── Serialization ────────────────────────────────────────────────

    /// Append the wire form of this packet to `dst`.
    pub fn encode(&self, dst: &mut BytesMut) -> Result<(), Error> {
        let header = self.header();
        if header.remaining_length > MAX_REMAINING_LENGTH {
            return Err(Error::PacketTooLarge {
                length: header.remaining_length,
                max: MAX_REMAINING_LENGTH,
            });
        }
        dst.reserve(header.len() + header.remaining_length);
        dst.put_u8(header.control_byte());
        write_variable_length(header.remaining_length, dst);

        match self {
            Self::Connect(c) => {
                put_string(dst, &c.protocol_name)?;
                dst.put_u8(c.protocol_level);
                dst.put_u8(c.flags());
                dst.put_u16(c.keep_alive);
                put_string(dst, &c.client_id)?;
                if let Some(will) = &c.will {
                    put_string(dst, &will.topic)?;
                    put_bytes(dst, &will.payload)?;
                }
                if let Some(username) = &c.username {
                    put_string(dst, username)?;
                }
                if let Some(password) = &c.password {
                    put_bytes(dst, password)?;
                }
            }
            Self::ConnAck(ack) => {
                dst.put_u8(u8::from(ack.session_present));
                dst.put_u8(ack.code as u8);
            }
            Self::Publish(p) => {
                put_string(dst, &p.topic)?;
                if let Some(id) = p.packet_id {
                    dst.put_u16(id);
                }
                dst.put_slice(&p.payload);
            }
            Self::PubAck(id)
            | Self::PubRec(id)
            | Self::PubRel(id)
            | Self::PubComp(id)
            | Self::UnsubAck(id) => dst.put_u16(*id),
            Self::Subscribe(s) => {
                dst.put_u16(s.packet_id);
                for (topic, qos) in &s.topics {
                    put_string(dst, topic)?;
                    dst.put_u8(qos.as_u8());
                }
            }
            Self::SubAck(s) => {
                dst.put_u16(s.packet_id);
                for code in &s.return_codes {
                    dst.put_u8(code.as_u8());
                }
            }
            Self::Unsubscribe(u) => {
                dst.put_u16(u.packet_id);
                for topic in &u.topics {
                    put_string(dst, topic)?;
                }
            }
            Self::PingReq | Self::PingResp | Self::Disconnect => {}
        }
        Ok(())
    }

    /// Serialize into a blocking writer, returning the number of bytes written.
    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<usize, Error> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode(&mut buf)?;
        w.write_all(&buf)?;
        Ok(buf.len())
    }

    /// Read exactly one packet from a blocking reader.
    ///
    /// Returns `Ok(None)` on a clean end of stream before the first byte.
    pub fn read_from<R: Read>(r: &mut R) -> Result<Option<Self>, Error> {
        let mut first = [0u8; 1];
        if r.read(&mut first)? == 0 {
            return Ok(None);
        }
        let mut length = 0usize;
        let mut shift = 0u32;
        loop {
            let mut byte = [0u8; 1];
            r.read_exact(&mut byte)?;
            length |= usize::from(byte[0] & 0x7F) << shift;
            if byte[0] & 0x80 == 0 {
                break;
            }
            shift += 7;
            if shift >= 28 {
                return Err(Error::protocol("remaining length exceeds 4 bytes"));
            }
        }
        let header = FixedHeader::from_control_byte(first[0], length)?;
        let mut body = vec![0u8; length];
        r.read_exact(&mut body)?;
        Self::decode(header, Bytes::from(body)).map(Some)
    }

    // ── Parsing ──────────────────────────────────────────────────────

    /// Parse a packet body given its already-decoded fixed header.
    pub fn decode(header: FixedHeader, mut body: Bytes) -> Result<Self, Error> {
        let packet = match header.packet_type {
            PacketType::Connect => Self::Connect(decode_connect(&mut body)?),
            PacketType::ConnAck => {
                let session_present = get_u8(&mut body)? & 0x01 != 0;
                let code = ConnectReturnCode::from_u8(get_u8(&mut body)?)?;
                Self::ConnAck(ConnAck {
                    session_present,
                    code,
                })
            }
            PacketType::Publish => {
                let topic = get_string(&mut body)?;
                let packet_id = if header.qos > QoS::AtMostOnce {
                    Some(get_u16(&mut body)?)
                } else {
                    None
                };
                Self::Publish(Publish {
                    dup: header.dup,
                    qos: header.qos,
                    retain: header.retain,
                    topic,
                    packet_id,
                    payload: body.split_to(body.len()),
                })
            }
            PacketType::PubAck => Self::PubAck(get_u16(&mut body)?),
            PacketType::PubRec => Self::PubRec(get_u16(&mut body)?),
            PacketType::PubRel => Self::PubRel(get_u16(&mut body)?),
            PacketType::PubComp => Self::PubComp(get_u16(&mut body)?),
            PacketType::Subscribe => {
                let packet_id = get_u16(&mut body)?;
                let mut topics = Vec::new();
                while body.has_remaining() {
                    let topic = get_string(&mut body)?;
                    let qos = QoS::from_u8(get_u8(&mut body)? & 0x03)?;
                    topics.push((topic, qos));
                }
                if topics.is_empty() {
                    return Err(Error::protocol("SUBSCRIBE without topics"));
                }
                Self::Subscribe(Subscribe { packet_id, topics })
            }
            PacketType::SubAck => {
                let packet_id = get_u16(&mut body)?;
                let mut return_codes = Vec::with_capacity(body.len());
                while body.has_remaining() {
                    return_codes.push(SubscribeReturnCode::from_u8(body.get_u8())?);
                }
                Self::SubAck(SubAck {
                    packet_id,
                    return_codes,
                })
            }
            PacketType::Unsubscribe => {
                let packet_id = get_u16(&mut body)?;
                let mut topics = Vec::new();
                while body.has_remaining() {
                    topics.push(get_string(&mut body)?);
                }
                Self::Unsubscribe(Unsubscribe { packet_id, topics })
            }
            PacketType::UnsubAck => Self::UnsubAck(get_u16(&mut body)?),
            PacketType::PingReq => Self::PingReq,
            PacketType::PingResp => Self::PingResp,
            PacketType::Disconnect => Self::Disconnect,
        };

        if body.has_remaining() {
            return Err(Error::protocol(format!(
                "{} has {} trailing bytes",
                header.packet_type,
                body.remaining()
            )));
        }
        Ok(packet)
    }
}

fn decode_connect(body: &mut Bytes) -> Result<Connect, Error> {
    let protocol_name = get_string(body)?;
    let protocol_level = get_u8(body)?;
    let flags = get_u8(body)?;
    if flags & 0x01 != 0 {
        return Err(Error::protocol("CONNECT reserved flag is set"));
    }
    let keep_alive = get_u16(body)?;
    let client_id = get_string(body)?;

    let will = if flags & 0x04 != 0 {
        let topic = get_string(body)?;
        let payload = get_bytes(body)?;
        Some(Message {
            topic,
            payload,
            qos: QoS::from_u8((flags >> 3) & 0x03)?,
            retain: flags & 0x20 != 0,
        })
    } else {
        if flags & 0x38 != 0 {
            return Err(Error::protocol("CONNECT will flags set without a will"));
        }
        None
    };

    let username = if flags & 0x80 != 0 {
        Some(get_string(body)?)
    } else {
        None
    };
    let password = if flags & 0x40 != 0 {
        Some(get_bytes(body)?)
    } else {
        None
    };

    Ok(Connect {
        protocol_name,
        protocol_level,
        clean_session: flags & 0x02 != 0,
        keep_alive,
        client_id,
        will,
        username,
        password,
    })
}

// ── Stringify (for logs) ─────────────────────────────────────────────

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect(c) => write!(
                f,
                "CONNECT ({} v{}, c{}, k{}, id={:?}, will={}, user={:?})",
                c.protocol_name,
                c.protocol_level,
                u8::from(c.clean_session),
                c.keep_alive,
                c.client_id,
                c.will.as_ref().map_or("none".into(), |w| format!("{:?}", w.topic)),
                c.username.as_deref().unwrap_or(""),
            ),
            Self::ConnAck(ack) => write!(
                f,
                "CONNACK (s{}, {})",
                u8::from(ack.session_present),
                ack.code
            ),
            Self::Publish(p) => write!(
                f,
                "PUBLISH (d{}, q{}, r{}, m{}, {:?}, ... ({} bytes))",
                u8::from(p.dup),
                p.qos,
                u8::from(p.retain),
                p.packet_id.unwrap_or(0),
                p.topic,
                p.payload.len()
            ),
            Self::Subscribe(s) => {
                write!(f, "SUBSCRIBE (m{})", s.packet_id)?;
                for (topic, qos) in &s.topics {
                    write!(f, " {topic:?}@{qos}")?;
                }
                Ok(())
            }
            Self::SubAck(s) => {
                write!(f, "SUBACK (m{})", s.packet_id)?;
                for code in &s.return_codes {
                    match code {
                        SubscribeReturnCode::Granted(qos) => write!(f, " q{qos}")?,
                        SubscribeReturnCode::Failure => write!(f, " failure")?,
                    }
                }
                Ok(())
            }
            Self::Unsubscribe(u) => {
                write!(f, "UNSUBSCRIBE (m{})", u.packet_id)?;
                for topic in &u.topics {
                    write!(f, " {topic:?}")?;
                }
                Ok(())
            }
            Self::PubAck(id)
            | Self::PubRec(id)
            | Self::PubRel(id)
            | Self::PubComp(id)
            | Self::UnsubAck(id) => write!(f, "{} (m{id})", self.packet_type()),
            Self::PingReq | Self::PingResp | Self::Disconnect => {
                write!(f, "{}", self.packet_type())
            }
        }
    }
}

// ── Wire helpers ─────────────────────────────────────────────────────

/// Number of bytes the variable-length encoding of `len` occupies.
pub fn variable_length_size(len: usize) -> usize {
    match len {
        0..=127 => 1,
        128..=16_383 => 2,
        16_384..=2_097_151 => 3,
        _ => 4,
    }
}

/// 7 bits per byte, high bit set on every byte but the last.
pub fn write_variable_length(mut len: usize, dst: &mut BytesMut) {
    loop {
        #[allow(clippy::cast_possible_truncation, clippy::as_conversions)]
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        dst.put_u8(byte);
        if len == 0 {
            break;
        }
    }
}

/// Decode a variable-length integer from the start of `src` without
/// consuming it. Returns `(value, bytes_used)`, or `None` if more input is
/// needed.
pub fn read_variable_length(src: &[u8]) -> Result<Option<(usize, usize)>, Error> {
    let mut value = 0usize;
    for (i, byte) in src.iter().enumerate().take(4) {
        value |= usize::from(byte & 0x7F) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
    }
    if src.len() >= 4 {
        return Err(Error::protocol("remaining length exceeds 4 bytes"));
    }
    Ok(None)
}

fn string_len(s: &str) -> usize {
    2 + s.len()
}

fn put_string(dst: &mut BytesMut, s: &str) -> Result<(), Error> {
    put_bytes(dst, s.as_bytes())
}

fn put_bytes(dst: &mut BytesMut, b: &[u8]) -> Result<(), Error> {
    let len = u16::try_from(b.len())
        .map_err(|_| Error::protocol(format!("field of {} bytes exceeds 65535", b.len())))?;
    dst.put_u16(len);
    dst.put_slice(b);
    Ok(())
}

fn get_u8(src: &mut Bytes) -> Result<u8, Error> {
    if src.remaining() < 1 {
        return Err(Error::protocol("unexpected end of packet"));
    }
    Ok(src.get_u8())
}

fn get_u16(src: &mut Bytes) -> Result<u16, Error> {
    if src.remaining() < 2 {
        return Err(Error::protocol("unexpected end of packet"));
    }
    Ok(src.get_u16())
}

fn get_bytes(src: &mut Bytes) -> Result<Bytes, Error> {
    let len = usize::from(get_u16(src)?);
    if src.remaining() < len {
        return Err(Error::protocol("length-prefixed field overruns packet"));
    }
    Ok(src.split_to(len))
}

fn get_string(src: &mut Bytes) -> Result<String, Error> {
    let raw = get_bytes(src)?;
    String::from_utf8(raw.to_vec()).map_err(|_| Error::protocol("string is not valid UTF-8"))
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn round_trip(packet: &Packet) {
        let mut first = BytesMut::new();
        packet.encode(&mut first).unwrap();
        assert_eq!(first.len(), packet.encoded_len());

        let parsed = Packet::read_from(&mut first.as_ref()).unwrap().unwrap();
        assert_eq!(&parsed, packet);

        let mut second = BytesMut::new();
        parsed.encode(&mut second).unwrap();
        assert_eq!(first, second, "re-encoding changed bytes for {packet}");
    }

    fn will() -> Message {
        Message {
            topic: "c/status".into(),
            payload: Bytes::from_static(b"offline"),
            qos: QoS::AtLeastOnce,
            retain: true,
        }
    }

    #[test]
    fn all_packet_types_round_trip() {
        let mut connect = Connect::new("client-1");
        connect.keep_alive = 60;
        connect.will = Some(will());
        connect.username = Some("user".into());
        connect.password = Some(Bytes::from_static(b"secret"));

        let mut legacy = Connect::new("legacy");
        legacy.protocol_name = PROTOCOL_MQTT_31.0.into();
        legacy.protocol_level = PROTOCOL_MQTT_31.1;
        legacy.clean_session = false;

        let packets = vec![
            Packet::Connect(connect),
            Packet::Connect(legacy),
            Packet::ConnAck(ConnAck {
                session_present: false,
                code: ConnectReturnCode::Accepted,
            }),
            Packet::ConnAck(ConnAck {
                session_present: true,
                code: ConnectReturnCode::NotAuthorized,
            }),
            Packet::Publish(Publish {
                dup: false,
                qos: QoS::AtMostOnce,
                retain: false,
                topic: "a/b".into(),
                packet_id: None,
                payload: Bytes::new(),
            }),
            Packet::Publish(Publish {
                dup: true,
                qos: QoS::ExactlyOnce,
                retain: true,
                topic: "devices/d1/sensors/s1/value".into(),
                packet_id: Some(7),
                payload: Bytes::from(vec![0xAB; 70_000]),
            }),
            Packet::PubAck(1),
            Packet::PubRec(2),
            Packet::PubRel(3),
            Packet::PubComp(65_000),
            Packet::Subscribe(Subscribe {
                packet_id: 10,
                topics: vec![("a/+".into(), QoS::AtLeastOnce), ("#".into(), QoS::ExactlyOnce)],
            }),
            Packet::SubAck(SubAck {
                packet_id: 10,
                return_codes: vec![
                    SubscribeReturnCode::Granted(QoS::AtLeastOnce),
                    SubscribeReturnCode::Failure,
                ],
            }),
            Packet::Unsubscribe(Unsubscribe {
                packet_id: 11,
                topics: vec!["a/+".into(), "#".into()],
            }),
            Packet::UnsubAck(11),
            Packet::PingReq,
            Packet::PingResp,
            Packet::Disconnect,
        ];

        for packet in &packets {
            round_trip(packet);
        }
    }

    #[test]
    fn fixed_header_flags() {
        let sub = Packet::Subscribe(Subscribe {
            packet_id: 1,
            topics: vec![("x".into(), QoS::AtMostOnce)],
        });
        assert_eq!(sub.header().control_byte(), 0x82);
        assert_eq!(Packet::PubRel(1).header().control_byte(), 0x62);
        assert_eq!(Packet::PingReq.header().control_byte(), 0xC0);
        assert_eq!(Packet::Disconnect.header().control_byte(), 0xE0);
    }

    #[test]
    fn reserved_packet_types_are_rejected() {
        assert!(FixedHeader::from_control_byte(0x00, 0).is_err());
        assert!(FixedHeader::from_control_byte(0xF0, 0).is_err());
    }

    #[test]
    fn publish_with_qos_three_is_rejected() {
        let err = FixedHeader::from_control_byte(0x36, 0).unwrap_err();
        assert!(err.is_protocol());
        // Non-PUBLISH flags are not checked.
        let header = FixedHeader::from_control_byte(0xC6, 0).unwrap();
        assert_eq!(header.packet_type, PacketType::PingReq);
    }

    #[test]
    fn variable_length_boundaries() {
        for (value, expected) in [
            (0usize, vec![0x00]),
            (127, vec![0x7F]),
            (128, vec![0x80, 0x01]),
            (16_383, vec![0xFF, 0x7F]),
            (16_384, vec![0x80, 0x80, 0x01]),
            (2_097_151, vec![0xFF, 0xFF, 0x7F]),
            (2_097_152, vec![0x80, 0x80, 0x80, 0x01]),
            (MAX_REMAINING_LENGTH, vec![0xFF, 0xFF, 0xFF, 0x7F]),
        ] {
            let mut buf = BytesMut::new();
            write_variable_length(value, &mut buf);
            assert_eq!(buf.as_ref(), expected.as_slice(), "encoding {value}");
            assert_eq!(variable_length_size(value), expected.len());
            assert_eq!(
                read_variable_length(&buf).unwrap(),
                Some((value, expected.len()))
            );
        }
    }

    #[test]
    fn variable_length_longer_than_four_bytes_is_rejected() {
        assert!(read_variable_length(&[0xFF, 0xFF, 0xFF, 0xFF, 0x01]).is_err());
        assert_eq!(read_variable_length(&[0xFF, 0xFF]).unwrap(), None);
    }

    #[test]
    fn truncated_body_is_a_protocol_error() {
        let header = FixedHeader::from_control_byte(0x40, 1).unwrap();
        let err = Packet::decode(header, Bytes::from_static(&[0x01])).unwrap_err();
        assert!(err.is_protocol());
    }

    #[test]
    fn stringify_for_logs() {
        let publish = Packet::Publish(Publish {
            dup: false,
            qos: QoS::AtLeastOnce,
            retain: true,
            topic: "a/b".into(),
            packet_id: Some(7),
            payload: Bytes::from_static(b"23.5"),
        });
        insta::assert_snapshot!(publish.to_string(), @r#"PUBLISH (d0, q1, r1, m7, "a/b", ... (4 bytes))"#);
        insta::assert_snapshot!(Packet::PubRec(7).to_string(), @"PUBREC (m7)");

        let suback = Packet::SubAck(SubAck {
            packet_id: 3,
            return_codes: vec![
                SubscribeReturnCode::Granted(QoS::ExactlyOnce),
                SubscribeReturnCode::Failure,
            ],
        });
        insta::assert_snapshot!(suback.to_string(), @"SUBACK (m3) q2 failure");
    }
}
