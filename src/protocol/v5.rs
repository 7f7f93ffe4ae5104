//! MQTT 5.0 (v5) protocol implementation.


use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::types::{ConnectFlags, ConnectReasonCodeV5, PacketType, Properties, QoS};

use super::codec::{
    read_binary_slice, read_fixed_header, read_string_slice, read_u16, write_binary,
    write_fixed_header, write_string, write_u16, variable_int_len,
};
use super::properties::{properties_body_len, read_properties, write_properties};

/// MQTT 5.0 packet.
#[derive(Debug, Clone)]
pub enum Packet {
    Connect(Connect),
    ConnAck(ConnAck),
    Publish(Publish),
    Subscribe(Subscribe),
    SubAck(SubAck),
    Unsubscribe(Unsubscribe),
    UnsubAck(UnsubAck),
    PingReq,
    PingResp,
    Disconnect(Disconnect),
}

/// CONNECT packet.
#[derive(Debug, Clone)]
pub struct Connect {
    pub client_id: String,
    pub keep_alive: u16,
    pub clean_start: bool,
    pub username: Option<String>,
    pub password: Option<Vec<u8>>,
    pub will: Option<Will>,
    pub properties: Properties,
}

/// Last Will and Testament.
#[derive(Debug, Clone)]
pub struct Will {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
    pub properties: Properties,
}

/// CONNACK packet.
#[derive(Debug, Clone)]
pub struct ConnAck {
    pub session_present: bool,
    pub code: ConnectReasonCodeV5,
    pub properties: Properties,
}

/// PUBLISH packet.
#[derive(Debug, Clone)]
pub struct Publish {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub dup: bool,
    pub pkid: u16,
    pub properties: Properties,
}

/// SUBSCRIBE packet.
#[derive(Debug, Clone)]
pub struct Subscribe {
    pub pkid: u16,
    pub filters: Vec<SubscribeFilter>,
    pub properties: Properties,
}

/// Subscribe filter.
#[derive(Debug, Clone)]
pub struct SubscribeFilter {
    pub path: String,
    pub qos: QoS,
    pub no_local: bool,
    pub retain_as_published: bool,
    pub retain_handling: RetainHandling,
}

/// Retain handling options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum RetainHandling {
    #[default]
    SendOnSubscribe = 0,
    SendOnSubscribeIfNew = 1,
    DoNotSend = 2,
}

/// SUBACK packet.
#[derive(Debug, Clone)]
pub struct SubAck {
    pub pkid: u16,
    pub return_codes: Vec<SubscribeReasonCode>,
    pub properties: Properties,
}

/// Subscribe reason code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeReasonCode {
    Success(QoS),
    UnspecifiedError,
    ImplementationSpecificError,
    NotAuthorized,
    TopicFilterInvalid,
    PacketIdentifierInUse,
    QuotaExceeded,
    SharedSubscriptionsNotSupported,
    SubscriptionIdentifiersNotSupported,
    WildcardSubscriptionsNotSupported,
}

impl SubscribeReasonCode {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => SubscribeReasonCode::Success(QoS::AtMostOnce),
            1 => SubscribeReasonCode::Success(QoS::AtLeastOnce),
            2 => SubscribeReasonCode::Success(QoS::ExactlyOnce),
            128 => SubscribeReasonCode::UnspecifiedError,
            131 => SubscribeReasonCode::ImplementationSpecificError,
            135 => SubscribeReasonCode::NotAuthorized,
            143 => SubscribeReasonCode::TopicFilterInvalid,
            145 => SubscribeReasonCode::PacketIdentifierInUse,
            151 => SubscribeReasonCode::QuotaExceeded,
            158 => SubscribeReasonCode::SharedSubscriptionsNotSupported,
            161 => SubscribeReasonCode::SubscriptionIdentifiersNotSupported,
            162 => SubscribeReasonCode::WildcardSubscriptionsNotSupported,
            _ => SubscribeReasonCode::UnspecifiedError,
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            SubscribeReasonCode::Success(QoS::AtMostOnce) => 0,
            SubscribeReasonCode::Success(QoS::AtLeastOnce) => 1,
            SubscribeReasonCode::Success(QoS::ExactlyOnce) => 2,
            SubscribeReasonCode::UnspecifiedError => 128,
            SubscribeReasonCode::ImplementationSpecificError => 131,
            SubscribeReasonCode::NotAuthorized => 135,
            SubscribeReasonCode::TopicFilterInvalid => 143,
            SubscribeReasonCode::PacketIdentifierInUse => 145,
            SubscribeReasonCode::QuotaExceeded => 151,
            SubscribeReasonCode::SharedSubscriptionsNotSupported => 158,
            SubscribeReasonCode::SubscriptionIdentifiersNotSupported => 161,
            SubscribeReasonCode::WildcardSubscriptionsNotSupported => 162,
        }
    }

    pub fn is_failure(&self) -> bool {
        !matches!(self, SubscribeReasonCode::Success(_))
    }
}

/// UNSUBSCRIBE packet.
#[derive(Debug, Clone)]
pub struct Unsubscribe {
    pub pkid: u16,
    pub filters: Vec<String>,
    pub properties: Properties,
}

/// UNSUBACK packet.
#[derive(Debug, Clone)]
pub struct UnsubAck {
    pub pkid: u16,
    pub reasons: Vec<UnsubAckReason>,
    pub properties: Properties,
}

/// UnsubAck reason codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum UnsubAckReason {
    Success = 0,
    NoSubscriptionExisted = 17,
    UnspecifiedError = 128,
    ImplementationSpecificError = 131,
    NotAuthorized = 135,
    TopicFilterInvalid = 143,
    PacketIdentifierInUse = 145,
}

impl UnsubAckReason {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => UnsubAckReason::Success,
            17 => UnsubAckReason::NoSubscriptionExisted,
            131 => UnsubAckReason::ImplementationSpecificError,
            135 => UnsubAckReason::NotAuthorized,
            143 => UnsubAckReason::TopicFilterInvalid,
            145 => UnsubAckReason::PacketIdentifierInUse,
            _ => UnsubAckReason::UnspecifiedError,
        }
    }
}

/// DISCONNECT packet.
#[derive(Debug, Clone)]
pub struct Disconnect {
    pub reason_code: DisconnectReasonCode,
    pub properties: Properties,
}

/// Disconnect reason codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum DisconnectReasonCode {
    #[default]
    NormalDisconnection = 0,
    DisconnectWithWillMessage = 4,
    UnspecifiedError = 128,
    MalformedPacket = 129,
    ProtocolError = 130,
    ImplementationSpecificError = 131,
    NotAuthorized = 135,
    ServerBusy = 137,
    ServerShuttingDown = 139,
    KeepAliveTimeout = 141,
    SessionTakenOver = 142,
    TopicFilterInvalid = 143,
    TopicNameInvalid = 144,
    ReceiveMaximumExceeded = 147,
    TopicAliasInvalid = 148,
    PacketTooLarge = 149,
    MessageRateTooHigh = 150,
    QuotaExceeded = 151,
    AdministrativeAction = 152,
    PayloadFormatInvalid = 153,
    RetainNotSupported = 154,
    QoSNotSupported = 155,
    UseAnotherServer = 156,
    ServerMoved = 157,
    SharedSubscriptionsNotSupported = 158,
    ConnectionRateExceeded = 159,
    MaximumConnectTime = 160,
    SubscriptionIdentifiersNotSupported = 161,
    WildcardSubscriptionsNotSupported = 162,
}

impl DisconnectReasonCode {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => Self::NormalDisconnection,
            4 => Self::DisconnectWithWillMessage,
            128 => Self::UnspecifiedError,
            129 => Self::MalformedPacket,
            130 => Self::ProtocolError,
            131 => Self::ImplementationSpecificError,
            135 => Self::NotAuthorized,
            137 => Self::ServerBusy,
            139 => Self::ServerShuttingDown,
            141 => Self::KeepAliveTimeout,
            142 => Self::SessionTakenOver,
            143 => Self::TopicFilterInvalid,
            144 => Self::TopicNameInvalid,
            147 => Self::ReceiveMaximumExceeded,
            148 => Self::TopicAliasInvalid,
            149 => Self::PacketTooLarge,
            150 => Self::MessageRateTooHigh,
            151 => Self::QuotaExceeded,
            152 => Self::AdministrativeAction,
            153 => Self::PayloadFormatInvalid,
            154 => Self::RetainNotSupported,
            155 => Self::QoSNotSupported,
            156 => Self::UseAnotherServer,
            157 => Self::ServerMoved,
            158 => Self::SharedSubscriptionsNotSupported,
            159 => Self::ConnectionRateExceeded,
            160 => Self::MaximumConnectTime,
            161 => Self::SubscriptionIdentifiersNotSupported,
            162 => Self::WildcardSubscriptionsNotSupported,
            _ => return None,
        })
    }
}

fn props_wire_len(p: &Properties) -> usize {
    let body = properties_body_len(p);
    variable_int_len(body as u32) + body
}

// ============================================================================
// Packet parsing / serialization
// ============================================================================

impl Packet {
    /// Parse a packet from buffer.
    pub fn read(buf: &[u8], max_size: usize) -> Result<(Packet, usize)> {
        let header = read_fixed_header(buf)?;
        let total_len = header.header_length + header.remaining_length as usize;

        if total_len > max_size {
            return Err(Error::PacketTooLarge(total_len as u32));
        }

        if buf.len() < total_len {
            return Err(Error::Incomplete { needed: total_len - buf.len() });
        }

        let payload = &buf[header.header_length..total_len];

        let packet = match header.packet_type {
            PacketType::Connect => Packet::Connect(Connect::read(payload)?),
            PacketType::ConnAck => Packet::ConnAck(ConnAck::read(payload)?),
            PacketType::Publish => Packet::Publish(Publish::read(header.flags, payload)?),
            PacketType::Subscribe => Packet::Subscribe(Subscribe::read(payload)?),
            PacketType::SubAck => Packet::SubAck(SubAck::read(payload)?),
            PacketType::Unsubscribe => Packet::Unsubscribe(Unsubscribe::read(payload)?),
            PacketType::UnsubAck => Packet::UnsubAck(UnsubAck::read(payload)?),
            PacketType::PingReq => Packet::PingReq,
            PacketType::PingResp => Packet::PingResp,
            PacketType::Disconnect => Packet::Disconnect(Disconnect::read(payload)?),
            _ => {
                return Err(Error::ProtocolViolation(format!(
                    "{:?} is not valid in MQTT 5.0",
                    header.packet_type
                )))
            }
        };

        Ok((packet, total_len))
    }

    /// Write packet to buffer.
    pub fn write(&self, buf: &mut [u8]) -> Result<usize> {
        match self {
            Packet::Connect(p) => p.write(buf),
            Packet::ConnAck(p) => p.write(buf),
            Packet::Publish(p) => p.write(buf),
            Packet::Subscribe(p) => p.write(buf),
            Packet::SubAck(p) => p.write(buf),
            Packet::Unsubscribe(p) => p.write(buf),
            Packet::UnsubAck(p) => p.write(buf),
            Packet::PingReq => write_simple_packet(buf, PacketType::PingReq),
            Packet::PingResp => write_simple_packet(buf, PacketType::PingResp),
            Packet::Disconnect(p) => p.write(buf),
        }
    }

    /// Calculate packet size.
    pub fn size(&self) -> usize {
        match self {
            Packet::Connect(p) => p.size(),
            Packet::ConnAck(p) => p.size(),
            Packet::Publish(p) => p.size(),
            Packet::Subscribe(p) => p.size(),
            Packet::SubAck(p) => p.size(),
            Packet::Unsubscribe(p) => p.size(),
            Packet::UnsubAck(p) => p.size(),
            Packet::PingReq | Packet::PingResp => 2,
            Packet::Disconnect(p) => p.size(),
        }
    }
}

fn write_simple_packet(buf: &mut [u8], packet_type: PacketType) -> Result<usize> {
    if buf.len() < 2 {
        return Err(Error::InvalidPacket(format!(
            "buffer too small: need 2, have {}",
            buf.len()
        )));
    }
    write_fixed_header(buf, packet_type, 0, 0)
        .ok_or_else(|| Error::InvalidPacket("buffer too small".into()))
}

impl Connect {
    pub fn read(buf: &[u8]) -> Result<Self> {
        let mut pos = 0;

        let (name, len) = read_string_slice(buf)?;
        if name != "MQTT" {
            return Err(Error::InvalidPacket(format!("bad protocol name {name:?}")));
        }
        pos += len;

        if buf.len() < pos + 1 {
            return Err(Error::Incomplete { needed: 1 });
        }
        let protocol_level = buf[pos];
        if protocol_level != 5 {
            return Err(Error::ProtocolViolation(format!(
                "unsupported protocol level {protocol_level}"
            )));
        }
        pos += 1;

        if buf.len() < pos + 1 {
            return Err(Error::Incomplete { needed: 1 });
        }
        let flags = ConnectFlags::decode(buf[pos])
            .ok_or_else(|| Error::ProtocolViolation("invalid connect flags".into()))?;
        pos += 1;

        let keep_alive = read_u16(&buf[pos..]).ok_or(Error::Incomplete { needed: 2 })?;
        pos += 2;

        let (properties, len) = read_properties(&buf[pos..])?;
        pos += len;

        let (client_id, len) = read_string_slice(&buf[pos..])?;
        let client_id = client_id.to_string();
        pos += len;

        let will = if flags.will {
            let (will_properties, len) = read_properties(&buf[pos..])?;
            pos += len;

            let (topic, len) = read_string_slice(&buf[pos..])?;
            pos += len;
            let (payload, len) = read_binary_slice(&buf[pos..])?;
            pos += len;

            Some(Will {
                topic: topic.to_string(),
                payload: payload.to_vec(),
                qos: flags.will_qos,
                retain: flags.will_retain,
                properties: will_properties,
            })
        } else {
            None
        };

        let username = if flags.username {
            let (u, len) = read_string_slice(&buf[pos..])?;
            pos += len;
            Some(u.to_string())
        } else {
            None
        };

        let password = if flags.password {
            let (p, len) = read_binary_slice(&buf[pos..])?;
            let _ = pos + len;
            Some(p.to_vec())
        } else {
            None
        };

        Ok(Connect {
            client_id,
            keep_alive,
            clean_start: flags.clean_session,
            username,
            password,
            will,
            properties,
        })
    }

    pub fn write(&self, buf: &mut [u8]) -> Result<usize> {
        let remaining_len = self.remaining_length();
        let header_len = 1 + variable_int_len(remaining_len as u32);
        let total = header_len + remaining_len;

        if buf.len() < total {
            return Err(Error::InvalidPacket(format!(
                "buffer too small: need {total}, have {}",
                buf.len()
            )));
        }

        let mut pos = write_fixed_header(buf, PacketType::Connect, 0, remaining_len as u32)
            .ok_or_else(|| Error::InvalidPacket("buffer too small".into()))?;

        pos += write_string(&mut buf[pos..], "MQTT")
            .ok_or_else(|| Error::InvalidPacket("buffer too small".into()))?;

        buf[pos] = 5;
        pos += 1;

        let mut flags = ConnectFlags {
            clean_session: self.clean_start,
            username: self.username.is_some(),
            password: self.password.is_some(),
            ..Default::default()
        };
        if let Some(ref will) = self.will {
            flags.will = true;
            flags.will_qos = will.qos;
            flags.will_retain = will.retain;
        }
        buf[pos] = flags.encode();
        pos += 1;

        write_u16(&mut buf[pos..], self.keep_alive)
            .ok_or_else(|| Error::InvalidPacket("buffer too small".into()))?;
        pos += 2;

        pos += write_properties(&mut buf[pos..], &self.properties)?;

        pos += write_string(&mut buf[pos..], &self.client_id)
            .ok_or_else(|| Error::InvalidPacket("buffer too small".into()))?;

        if let Some(ref will) = self.will {
            pos += write_properties(&mut buf[pos..], &will.properties)?;
            pos += write_string(&mut buf[pos..], &will.topic)
                .ok_or_else(|| Error::InvalidPacket("buffer too small".into()))?;
            pos += write_binary(&mut buf[pos..], &will.payload)
                .ok_or_else(|| Error::InvalidPacket("buffer too small".into()))?;
        }

        if let Some(ref username) = self.username {
            pos += write_string(&mut buf[pos..], username)
                .ok_or_else(|| Error::InvalidPacket("buffer too small".into()))?;
        }

        if let Some(ref password) = self.password {
            pos += write_binary(&mut buf[pos..], password)
                .ok_or_else(|| Error::InvalidPacket("buffer too small".into()))?;
        }

        Ok(pos)
    }

    fn remaining_length(&self) -> usize {
        let mut len = 2 + 4 + 1 + 1 + 2; // protocol name + level + flags + keep_alive
        len += props_wire_len(&self.properties);
        len += 2 + self.client_id.len();

        if let Some(ref will) = self.will {
            len += props_wire_len(&will.properties);
            len += 2 + will.topic.len();
            len += 2 + will.payload.len();
        }
        if let Some(ref username) = self.username {
            len += 2 + username.len();
        }
        if let Some(ref password) = self.password {
            len += 2 + password.len();
        }

        len
    }

    pub fn size(&self) -> usize {
        let remaining = self.remaining_length();
        1 + variable_int_len(remaining as u32) + remaining
    }
}

impl ConnAck {
    pub fn read(buf: &[u8]) -> Result<Self> {
        if buf.len() < 2 {
            return Err(Error::Incomplete { needed: 2 - buf.len() });
        }

        let session_present = buf[0] & 0x01 != 0;
        let code = ConnectReasonCodeV5::from_u8(buf[1])
            .ok_or_else(|| Error::InvalidPacket(format!("unknown connack reason code {}", buf[1])))?;

        let (properties, _) = if buf.len() > 2 {
            read_properties(&buf[2..])?
        } else {
            (Properties::default(), 0)
        };

        Ok(ConnAck {
            session_present,
            code,
            properties,
        })
    }

    pub fn write(&self, buf: &mut [u8]) -> Result<usize> {
        let remaining_len = 2 + props_wire_len(&self.properties);
        let header_len = 1 + variable_int_len(remaining_len as u32);
        let total = header_len + remaining_len;

        if buf.len() < total {
            return Err(Error::InvalidPacket(format!(
                "buffer too small: need {total}, have {}",
                buf.len()
            )));
        }

        let mut pos = write_fixed_header(buf, PacketType::ConnAck, 0, remaining_len as u32)
            .ok_or_else(|| Error::InvalidPacket("buffer too small".into()))?;

        buf[pos] = if self.session_present { 0x01 } else { 0x00 };
        buf[pos + 1] = self.code as u8;
        pos += 2;

        pos += write_properties(&mut buf[pos..], &self.properties)?;

        Ok(pos)
    }

    pub fn size(&self) -> usize {
        let remaining = 2 + props_wire_len(&self.properties);
        1 + variable_int_len(remaining as u32) + remaining
    }
}

impl Publish {
    pub fn read(flags: u8, buf: &[u8]) -> Result<Self> {
        let dup = flags & 0x08 != 0;
        let qos = QoS::from_u8((flags >> 1) & 0x03)
            .ok_or_else(|| Error::ProtocolViolation(format!("invalid qos bits {}", (flags >> 1) & 0x03)))?;
        let retain = flags & 0x01 != 0;

        let mut pos = 0;

        let (topic, len) = read_string_slice(buf)?;
        let topic = topic.to_string();
        pos += len;

        let pkid = if qos != QoS::AtMostOnce {
            let id = read_u16(&buf[pos..]).ok_or(Error::Incomplete { needed: 2 })?;
            pos += 2;
            id
        } else {
            0
        };

        let (properties, len) = read_properties(&buf[pos..])?;
        pos += len;

        let payload = Bytes::copy_from_slice(&buf[pos..]);

        Ok(Publish {
            topic,
            payload,
            qos,
            retain,
            dup,
            pkid,
            properties,
        })
    }

    pub fn write(&self, buf: &mut [u8]) -> Result<usize> {
        let remaining_len = self.remaining_length();
        let header_len = 1 + variable_int_len(remaining_len as u32);
        let total = header_len + remaining_len;

        if buf.len() < total {
            return Err(Error::InvalidPacket(format!(
                "buffer too small: need {total}, have {}",
                buf.len()
            )));
        }

        let mut header_flags = (self.qos as u8) << 1;
        if self.dup {
            header_flags |= 0x08;
        }
        if self.retain {
            header_flags |= 0x01;
        }

        let mut pos = write_fixed_header(buf, PacketType::Publish, header_flags, remaining_len as u32)
            .ok_or_else(|| Error::InvalidPacket("buffer too small".into()))?;

        pos += write_string(&mut buf[pos..], &self.topic)
            .ok_or_else(|| Error::InvalidPacket("buffer too small".into()))?;

        if self.qos != QoS::AtMostOnce {
            write_u16(&mut buf[pos..], self.pkid)
                .ok_or_else(|| Error::InvalidPacket("buffer too small".into()))?;
            pos += 2;
        }

        pos += write_properties(&mut buf[pos..], &self.properties)?;

        buf[pos..pos + self.payload.len()].copy_from_slice(&self.payload);
        pos += self.payload.len();

        Ok(pos)
    }

    fn remaining_length(&self) -> usize {
        let mut len = 2 + self.topic.len() + self.payload.len();
        if self.qos != QoS::AtMostOnce {
            len += 2;
        }
        len += props_wire_len(&self.properties);
        len
    }

    pub fn size(&self) -> usize {
        let remaining = self.remaining_length();
        1 + variable_int_len(remaining as u32) + remaining
    }
}

impl Subscribe {
    pub fn read(buf: &[u8]) -> Result<Self> {
        if buf.len() < 2 {
            return Err(Error::Incomplete { needed: 2 });
        }

        let pkid = read_u16(buf).ok_or(Error::Incomplete { needed: 2 })?;
        let mut pos = 2;

        let (properties, len) = read_properties(&buf[pos..])?;
        pos += len;

        let mut filters = Vec::new();
        while pos < buf.len() {
            let (path, len) = read_string_slice(&buf[pos..])?;
            pos += len;

            if pos >= buf.len() {
                return Err(Error::Incomplete { needed: 1 });
            }
            let options = buf[pos];
            let qos = QoS::from_u8(options & 0x03)
                .ok_or_else(|| Error::ProtocolViolation(format!("invalid qos bits in subscribe options {options}")))?;
            let no_local = options & 0x04 != 0;
            let retain_as_published = options & 0x08 != 0;
            let retain_handling = match (options >> 4) & 0x03 {
                0 => RetainHandling::SendOnSubscribe,
                1 => RetainHandling::SendOnSubscribeIfNew,
                2 => RetainHandling::DoNotSend,
                other => {
                    return Err(Error::ProtocolViolation(format!(
                        "invalid retain handling {other}"
                    )))
                }
            };
            pos += 1;

            filters.push(SubscribeFilter {
                path: path.to_string(),
                qos,
                no_local,
                retain_as_published,
                retain_handling,
            });
        }

        Ok(Subscribe { pkid, filters, properties })
    }

    pub fn write(&self, buf: &mut [u8]) -> Result<usize> {
        let remaining_len = self.remaining_length();
        let header_len = 1 + variable_int_len(remaining_len as u32);
        let total = header_len + remaining_len;

        if buf.len() < total {
            return Err(Error::InvalidPacket(format!(
                "buffer too small: need {total}, have {}",
                buf.len()
            )));
        }

        let mut pos = write_fixed_header(buf, PacketType::Subscribe, 0x02, remaining_len as u32)
            .ok_or_else(|| Error::InvalidPacket("buffer too small".into()))?;

        write_u16(&mut buf[pos..], self.pkid)
            .ok_or_else(|| Error::InvalidPacket("buffer too small".into()))?;
        pos += 2;

        pos += write_properties(&mut buf[pos..], &self.properties)?;

        for filter in &self.filters {
            pos += write_string(&mut buf[pos..], &filter.path)
                .ok_or_else(|| Error::InvalidPacket("buffer too small".into()))?;
            let mut options = filter.qos as u8;
            if filter.no_local {
                options |= 0x04;
            }
            if filter.retain_as_published {
                options |= 0x08;
            }
            options |= (filter.retain_handling as u8) << 4;
            buf[pos] = options;
            pos += 1;
        }

        Ok(pos)
    }

    fn remaining_length(&self) -> usize {
        let mut len = 2; // pkid
        len += props_wire_len(&self.properties);
        for filter in &self.filters {
            len += 2 + filter.path.len() + 1;
        }
        len
    }

    pub fn size(&self) -> usize {
        let remaining = self.remaining_length();
        1 + variable_int_len(remaining as u32) + remaining
    }
}

impl SubAck {
    pub fn read(buf: &[u8]) -> Result<Self> {
        if buf.len() < 2 {
            return Err(Error::Incomplete { needed: 2 });
        }

        let pkid = read_u16(buf).ok_or(Error::Incomplete { needed: 2 })?;
        let mut pos = 2;

        let (properties, len) = read_properties(&buf[pos..])?;
        pos += len;

        let return_codes: Vec<_> = buf[pos..].iter().map(|&b| SubscribeReasonCode::from_u8(b)).collect();

        Ok(SubAck { pkid, return_codes, properties })
    }

    pub fn write(&self, buf: &mut [u8]) -> Result<usize> {
        let remaining_len = self.remaining_length();
        let header_len = 1 + variable_int_len(remaining_len as u32);
        let total = header_len + remaining_len;

        if buf.len() < total {
            return Err(Error::InvalidPacket(format!(
                "buffer too small: need {total}, have {}",
                buf.len()
            )));
        }

        let mut pos = write_fixed_header(buf, PacketType::SubAck, 0, remaining_len as u32)
            .ok_or_else(|| Error::InvalidPacket("buffer too small".into()))?;

        write_u16(&mut buf[pos..], self.pkid)
            .ok_or_else(|| Error::InvalidPacket("buffer too small".into()))?;
        pos += 2;

        pos += write_properties(&mut buf[pos..], &self.properties)?;

        for code in &self.return_codes {
            buf[pos] = code.to_u8();
            pos += 1;
        }

        Ok(pos)
    }

    fn remaining_length(&self) -> usize {
        2 + props_wire_len(&self.properties) + self.return_codes.len()
    }

    pub fn size(&self) -> usize {
        let remaining = self.remaining_length();
        1 + variable_int_len(remaining as u32) + remaining
    }
}

impl Unsubscribe {
    pub fn read(buf: &[u8]) -> Result<Self> {
        if buf.len() < 2 {
            return Err(Error::Incomplete { needed: 2 });
        }

        let pkid = read_u16(buf).ok_or(Error::Incomplete { needed: 2 })?;
        let mut pos = 2;

        let (properties, len) = read_properties(&buf[pos..])?;
        pos += len;

        let mut filters = Vec::new();
        while pos < buf.len() {
            let (topic, len) = read_string_slice(&buf[pos..])?;
            filters.push(topic.to_string());
            pos += len;
        }

        Ok(Unsubscribe { pkid, filters, properties })
    }

    pub fn write(&self, buf: &mut [u8]) -> Result<usize> {
        let remaining_len = self.remaining_length();
        let header_len = 1 + variable_int_len(remaining_len as u32);
        let total = header_len + remaining_len;

        if buf.len() < total {
            return Err(Error::InvalidPacket(format!(
                "buffer too small: need {total}, have {}",
                buf.len()
            )));
        }

        let mut pos = write_fixed_header(buf, PacketType::Unsubscribe, 0x02, remaining_len as u32)
            .ok_or_else(|| Error::InvalidPacket("buffer too small".into()))?;

        write_u16(&mut buf[pos..], self.pkid)
            .ok_or_else(|| Error::InvalidPacket("buffer too small".into()))?;
        pos += 2;

        pos += write_properties(&mut buf[pos..], &self.properties)?;

        for filter in &self.filters {
            pos += write_string(&mut buf[pos..], filter)
                .ok_or_else(|| Error::InvalidPacket("buffer too small".into()))?;
        }

        Ok(pos)
    }

    fn remaining_length(&self) -> usize {
        let mut len = 2;
        len += props_wire_len(&self.properties);
        for filter in &self.filters {
            len += 2 + filter.len();
        }
        len
    }

    pub fn size(&self) -> usize {
        let remaining = self.remaining_length();
        1 + variable_int_len(remaining as u32) + remaining
    }
}

impl UnsubAck {
    pub fn read(buf: &[u8]) -> Result<Self> {
        if buf.len() < 2 {
            return Err(Error::Incomplete { needed: 2 });
        }

        let pkid = read_u16(buf).ok_or(Error::Incomplete { needed: 2 })?;
        let mut pos = 2;

        let (properties, len) = read_properties(&buf[pos..])?;
        pos += len;

        let reasons: Vec<_> = buf[pos..].iter().map(|&b| UnsubAckReason::from_u8(b)).collect();

        Ok(UnsubAck { pkid, reasons, properties })
    }

    pub fn write(&self, buf: &mut [u8]) -> Result<usize> {
        let remaining_len = self.remaining_length();
        let header_len = 1 + variable_int_len(remaining_len as u32);
        let total = header_len + remaining_len;

        if buf.len() < total {
            return Err(Error::InvalidPacket(format!(
                "buffer too small: need {total}, have {}",
                buf.len()
            )));
        }

        let mut pos = write_fixed_header(buf, PacketType::UnsubAck, 0, remaining_len as u32)
            .ok_or_else(|| Error::InvalidPacket("buffer too small".into()))?;

        write_u16(&mut buf[pos..], self.pkid)
            .ok_or_else(|| Error::InvalidPacket("buffer too small".into()))?;
        pos += 2;

        pos += write_properties(&mut buf[pos..], &self.properties)?;

        for reason in &self.reasons {
            buf[pos] = *reason as u8;
            pos += 1;
        }

        Ok(pos)
    }

    fn remaining_length(&self) -> usize {
        2 + props_wire_len(&self.properties) + self.reasons.len()
    }

    pub fn size(&self) -> usize {
        let remaining = self.remaining_length();
        1 + variable_int_len(remaining as u32) + remaining
    }
}

impl Disconnect {
    pub fn read(buf: &[u8]) -> Result<Self> {
        if buf.is_empty() {
            return Ok(Disconnect {
                reason_code: DisconnectReasonCode::NormalDisconnection,
                properties: Properties::default(),
            });
        }

        let reason_code = DisconnectReasonCode::from_u8(buf[0])
            .ok_or_else(|| Error::InvalidPacket(format!("unknown disconnect reason code {}", buf[0])))?;

        let properties = if buf.len() > 1 {
            read_properties(&buf[1..])?.0
        } else {
            Properties::default()
        };

        Ok(Disconnect {
            reason_code,
            properties,
        })
    }

    /// Whether this DISCONNECT is emitted with a fully empty variable
    /// header — the reason byte and property block are both omitted when
    /// the reason is success and there are no properties to carry.
    fn is_empty_body(&self) -> bool {
        self.reason_code == DisconnectReasonCode::NormalDisconnection && self.properties.is_empty()
    }

    pub fn write(&self, buf: &mut [u8]) -> Result<usize> {
        let remaining_len = self.remaining_length();
        let header_len = 1 + variable_int_len(remaining_len as u32);
        let total = header_len + remaining_len;

        if buf.len() < total {
            return Err(Error::InvalidPacket(format!(
                "buffer too small: need {total}, have {}",
                buf.len()
            )));
        }

        let mut pos = write_fixed_header(buf, PacketType::Disconnect, 0, remaining_len as u32)
            .ok_or_else(|| Error::InvalidPacket("buffer too small".into()))?;

        if self.is_empty_body() {
            return Ok(pos);
        }

        buf[pos] = self.reason_code as u8;
        pos += 1;

        pos += write_properties(&mut buf[pos..], &self.properties)?;

        Ok(pos)
    }

    fn remaining_length(&self) -> usize {
        if self.is_empty_body() {
            0
        } else {
            1 + props_wire_len(&self.properties)
        }
    }

    pub fn size(&self) -> usize {
        let remaining = self.remaining_length();
        1 + variable_int_len(remaining as u32) + remaining
    }
}

// ============================================================================
// Helper functions for creating packets
// ============================================================================

/// Create a CONNECT packet.
pub fn create_connect(
    client_id: &str,
    username: Option<&str>,
    password: Option<&[u8]>,
    keep_alive: u16,
    clean_start: bool,
    session_expiry: Option<u32>,
) -> Packet {
    let mut properties = Properties::default();
    properties.session_expiry_interval = session_expiry;

    Packet::Connect(Connect {
        client_id: client_id.to_string(),
        keep_alive,
        clean_start,
        username: username.map(|s| s.to_string()),
        password: password.map(|p| p.to_vec()),
        will: None,
        properties,
    })
}

/// Create a CONNACK packet.
pub fn create_connack(session_present: bool, code: ConnectReasonCodeV5) -> Packet {
    Packet::ConnAck(ConnAck {
        session_present,
        code,
        properties: Properties::default(),
    })
}

/// Create a PUBLISH packet (QoS 0).
pub fn create_publish(topic: &str, payload: &[u8], retain: bool) -> Packet {
    Packet::Publish(Publish {
        topic: topic.to_string(),
        payload: Bytes::copy_from_slice(payload),
        qos: QoS::AtMostOnce,
        retain,
        dup: false,
        pkid: 0,
        properties: Properties::default(),
    })
}

/// Create a SUBSCRIBE packet.
pub fn create_subscribe(pkid: u16, topics: &[&str]) -> Packet {
    let filters = topics.iter().map(|t| SubscribeFilter {
        path: t.to_string(),
        qos: QoS::AtMostOnce,
        no_local: false,
        retain_as_published: false,
        retain_handling: RetainHandling::SendOnSubscribe,
    }).collect();

    Packet::Subscribe(Subscribe { pkid, filters, properties: Properties::default() })
}

/// Create a SUBACK packet.
pub fn create_suback(pkid: u16, return_codes: Vec<SubscribeReasonCode>) -> Packet {
    Packet::SubAck(SubAck { pkid, return_codes, properties: Properties::default() })
}

/// Create an UNSUBSCRIBE packet.
pub fn create_unsubscribe(pkid: u16, topics: &[&str]) -> Packet {
    let filters = topics.iter().map(|t| t.to_string()).collect();
    Packet::Unsubscribe(Unsubscribe { pkid, filters, properties: Properties::default() })
}

/// Create an UNSUBACK packet.
pub fn create_unsuback(pkid: u16) -> Packet {
    Packet::UnsubAck(UnsubAck {
        pkid,
        reasons: vec![UnsubAckReason::Success],
        properties: Properties::default(),
    })
}

/// Create a PINGREQ packet.
pub fn create_pingreq() -> Packet {
    Packet::PingReq
}

/// Create a PINGRESP packet.
pub fn create_pingresp() -> Packet {
    Packet::PingResp
}

/// Create a DISCONNECT packet with the given reason.
pub fn create_disconnect(reason_code: DisconnectReasonCode) -> Packet {
    Packet::Disconnect(Disconnect {
        reason_code,
        properties: Properties::default(),
    })
}

/// Read a single v5 packet from an async byte stream, buffering as needed.
pub async fn read_packet<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut BytesMut,
    max_size: usize,
) -> Result<Packet> {
    loop {
        if !buf.is_empty() {
            match Packet::read(buf, max_size) {
                Ok((packet, consumed)) => {
                    let _ = buf.split_to(consumed);
                    return Ok(packet);
                }
                Err(Error::Incomplete { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        let mut tmp = [0u8; 4096];
        let n = reader.read(&mut tmp).await?;
        if n == 0 {
            return Err(Error::Closed);
        }
        buf.extend_from_slice(&tmp[..n]);
    }
}

/// Write a single v5 packet to an async byte stream.
pub async fn write_packet<W: AsyncWrite + Unpin>(writer: &mut W, packet: Packet) -> Result<()> {
    let mut buf = vec![0u8; packet.size()];
    let written = packet.write(&mut buf)?;
    writer.write_all(&buf[..written]).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connack_roundtrip() {
        let mut properties = Properties::default();
        properties.session_expiry_interval = Some(60);

        let connack = ConnAck {
            session_present: true,
            code: ConnectReasonCodeV5::Success,
            properties,
        };

        let mut buf = vec![0u8; 32];
        let written = connack.write(&mut buf).unwrap();

        let header = read_fixed_header(&buf).unwrap();
        assert_eq!(header.packet_type, PacketType::ConnAck);

        let parsed = ConnAck::read(&buf[header.header_length..written]).unwrap();
        assert_eq!(parsed.session_present, true);
        assert_eq!(parsed.code, ConnectReasonCodeV5::Success);
        assert_eq!(parsed.properties.session_expiry_interval, Some(60));
    }

    #[test]
    fn test_publish_roundtrip_with_properties() {
        let mut properties = Properties::default();
        properties.topic_alias = Some(5);
        properties.content_type = Some("text/plain".into());

        let publish = Publish {
            topic: "a/b".to_string(),
            payload: Bytes::from_static(b"hello"),
            qos: QoS::AtMostOnce,
            retain: false,
            dup: false,
            pkid: 0,
            properties,
        };

        let mut buf = vec![0u8; publish.size()];
        let written = Packet::Publish(publish.clone()).write(&mut buf).unwrap();

        let (packet, consumed) = Packet::read(&buf, 4096).unwrap();
        assert_eq!(written, consumed);

        if let Packet::Publish(p) = packet {
            assert_eq!(p.topic, "a/b");
            assert_eq!(p.payload.as_ref(), b"hello");
            assert_eq!(p.properties.topic_alias, Some(5));
            assert_eq!(p.properties.content_type.as_deref(), Some("text/plain"));
        } else {
            panic!("expected Publish packet");
        }
    }

    #[test]
    fn test_disconnect_with_reason_roundtrip() {
        let mut properties = Properties::default();
        properties.reason_string = Some("alias invalid".into());

        let disconnect = Disconnect {
            reason_code: DisconnectReasonCode::TopicAliasInvalid,
            properties,
        };

        let mut buf = vec![0u8; disconnect.size()];
        let written = disconnect.write(&mut buf).unwrap();

        let header = read_fixed_header(&buf).unwrap();
        let parsed = Disconnect::read(&buf[header.header_length..written]).unwrap();
        assert_eq!(parsed.reason_code, DisconnectReasonCode::TopicAliasInvalid);
        assert_eq!(parsed.properties.reason_string.as_deref(), Some("alias invalid"));
    }

    #[test]
    fn test_empty_disconnect_roundtrip() {
        let (packet, consumed) = Packet::read(&[0xE0, 0x00], 1024).unwrap();
        assert_eq!(consumed, 2);
        if let Packet::Disconnect(d) = packet {
            assert_eq!(d.reason_code, DisconnectReasonCode::NormalDisconnection);
        } else {
            panic!("expected Disconnect packet");
        }
    }

    #[test]
    fn test_normal_disconnect_writes_empty_body() {
        let disconnect = Disconnect {
            reason_code: DisconnectReasonCode::NormalDisconnection,
            properties: Properties::default(),
        };

        let mut buf = vec![0u8; disconnect.size()];
        let written = disconnect.write(&mut buf).unwrap();

        // Fixed header (0xE0, remaining length 0) only, no reason byte or properties.
        assert_eq!(written, 2);
        assert_eq!(&buf[..2], &[0xE0, 0x00]);
    }
}
