//! Common types for mqtt0.

use bytes::Bytes;

/// MQTT protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProtocolVersion {
    /// MQTT 3.1.1
    #[default]
    V4,
    /// MQTT 5.0
    V5,
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolVersion::V4 => write!(f, "MQTT 3.1.1"),
            ProtocolVersion::V5 => write!(f, "MQTT 5.0"),
        }
    }
}

/// Quality of Service level.
///
/// This crate's broker and client only ever construct `AtMostOnce`, but the
/// codec must still encode and decode `AtLeastOnce`/`ExactlyOnce` bit-exactly
/// — "packets with QoS>0 encode correctly but the broker does not ack, so
/// callers must not use them."
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QoS {
    /// At most once delivery (fire and forget). The only level this crate emits.
    #[default]
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl QoS {
    /// Decode the two QoS bits out of a PUBLISH flags byte or a SUBSCRIBE option byte.
    pub fn from_u8(bits: u8) -> Option<Self> {
        match bits {
            0 => Some(QoS::AtMostOnce),
            1 => Some(QoS::AtLeastOnce),
            2 => Some(QoS::ExactlyOnce),
            _ => None,
        }
    }
}

/// MQTT control packet type, shared by v3.1.1 and v5.0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
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
    /// v5 only; this crate never emits one but must recognize it on read.
    Auth = 15,
}

impl PacketType {
    /// Decode the high nibble of the fixed header's first byte.
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            1 => PacketType::Connect,
            2 => PacketType::ConnAck,
            3 => PacketType::Publish,
            4 => PacketType::PubAck,
            5 => PacketType::PubRec,
            6 => PacketType::PubRel,
            7 => PacketType::PubComp,
            8 => PacketType::Subscribe,
            9 => PacketType::SubAck,
            10 => PacketType::Unsubscribe,
            11 => PacketType::UnsubAck,
            12 => PacketType::PingReq,
            13 => PacketType::PingResp,
            14 => PacketType::Disconnect,
            15 => PacketType::Auth,
            _ => return None,
        })
    }
}

/// A decoded fixed header: packet type, flags nibble, and remaining length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedHeader {
    pub packet_type: PacketType,
    pub flags: u8,
    pub remaining_length: u32,
    /// Total byte length of the fixed header itself (type+flags byte plus
    /// the variable-length remaining-length field).
    pub header_length: usize,
}

impl FixedHeader {
    /// Total on-wire length of the packet this header describes.
    pub fn frame_length(&self) -> usize {
        self.header_length + self.remaining_length as usize
    }
}

/// Decoded CONNECT flags byte, shared by v4 and v5 (the bit layout is identical;
/// v5 calls bit 1 "Clean Start" instead of "Clean Session").
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectFlags {
    pub username: bool,
    pub password: bool,
    pub will_retain: bool,
    pub will_qos: QoS,
    pub will: bool,
    pub clean_session: bool,
}

impl ConnectFlags {
    /// Decode a CONNECT flags byte. Bit 0 is reserved and must be zero.
    pub fn decode(byte: u8) -> Option<Self> {
        if byte & 0x01 != 0 {
            return None;
        }
        let will_qos = QoS::from_u8((byte >> 3) & 0x03)?;
        Some(ConnectFlags {
            username: byte & 0x80 != 0,
            password: byte & 0x40 != 0,
            will_retain: byte & 0x20 != 0,
            will_qos,
            will: byte & 0x04 != 0,
            clean_session: byte & 0x02 != 0,
        })
    }

    pub fn encode(&self) -> u8 {
        let mut b = 0u8;
        if self.username {
            b |= 0x80;
        }
        if self.password {
            b |= 0x40;
        }
        if self.will_retain {
            b |= 0x20;
        }
        b |= (self.will_qos as u8) << 3;
        if self.will {
            b |= 0x04;
        }
        if self.clean_session {
            b |= 0x02;
        }
        b
    }
}

/// MQTT 3.1.1 CONNACK return code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectReturnCodeV4 {
    Success = 0,
    UnacceptableProtocolVersion = 1,
    IdentifierRejected = 2,
    ServerUnavailable = 3,
    BadUsernameOrPassword = 4,
    NotAuthorized = 5,
}

impl ConnectReturnCodeV4 {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => Self::Success,
            1 => Self::UnacceptableProtocolVersion,
            2 => Self::IdentifierRejected,
            3 => Self::ServerUnavailable,
            4 => Self::BadUsernameOrPassword,
            5 => Self::NotAuthorized,
            _ => return None,
        })
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// MQTT 5.0 CONNACK reason code (the subset relevant to a QoS-0 broker).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectReasonCodeV5 {
    Success = 0,
    UnspecifiedError = 128,
    MalformedPacket = 129,
    ProtocolError = 130,
    ImplementationSpecificError = 131,
    UnsupportedProtocolVersion = 132,
    ClientIdentifierNotValid = 133,
    BadUserNameOrPassword = 134,
    NotAuthorized = 135,
    ServerUnavailable = 136,
    ServerBusy = 137,
    Banned = 138,
    BadAuthenticationMethod = 140,
    TopicNameInvalid = 144,
    PacketTooLarge = 149,
    QuotaExceeded = 151,
    PayloadFormatInvalid = 153,
    RetainNotSupported = 154,
    QoSNotSupported = 155,
    UseAnotherServer = 156,
    ServerMoved = 157,
    ConnectionRateExceeded = 159,
}

impl ConnectReasonCodeV5 {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => Self::Success,
            128 => Self::UnspecifiedError,
            129 => Self::MalformedPacket,
            130 => Self::ProtocolError,
            131 => Self::ImplementationSpecificError,
            132 => Self::UnsupportedProtocolVersion,
            133 => Self::ClientIdentifierNotValid,
            134 => Self::BadUserNameOrPassword,
            135 => Self::NotAuthorized,
            136 => Self::ServerUnavailable,
            137 => Self::ServerBusy,
            138 => Self::Banned,
            140 => Self::BadAuthenticationMethod,
            144 => Self::TopicNameInvalid,
            149 => Self::PacketTooLarge,
            151 => Self::QuotaExceeded,
            153 => Self::PayloadFormatInvalid,
            154 => Self::RetainNotSupported,
            155 => Self::QoSNotSupported,
            156 => Self::UseAnotherServer,
            157 => Self::ServerMoved,
            159 => Self::ConnectionRateExceeded,
            _ => return None,
        })
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// A single flat record holding every MQTT 5.0 property as an optional
/// value, per the design note that "a single wide record with every
/// property as an optional value is adequate." One `Properties` value is
/// reused across CONNECT, CONNACK, PUBLISH, SUBSCRIBE, and DISCONNECT —
/// each packet type only ever populates the subset the spec allows it to
/// carry; the codec does not enforce which fields belong to which packet.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Properties {
    pub payload_format_indicator: Option<bool>,
    pub message_expiry_interval: Option<u32>,
    pub content_type: Option<String>,
    pub response_topic: Option<String>,
    pub correlation_data: Option<Vec<u8>>,
    pub subscription_identifier: Option<u32>,
    pub session_expiry_interval: Option<u32>,
    pub assigned_client_identifier: Option<String>,
    pub server_keep_alive: Option<u16>,
    pub authentication_method: Option<String>,
    pub authentication_data: Option<Vec<u8>>,
    pub request_problem_information: Option<bool>,
    pub will_delay_interval: Option<u32>,
    pub request_response_information: Option<bool>,
    pub response_information: Option<String>,
    pub server_reference: Option<String>,
    pub reason_string: Option<String>,
    pub receive_maximum: Option<u16>,
    pub topic_alias_maximum: Option<u16>,
    pub topic_alias: Option<u16>,
    pub maximum_qos: Option<QoS>,
    pub retain_available: Option<bool>,
    pub user_properties: Vec<(String, String)>,
    pub maximum_packet_size: Option<u32>,
    pub wildcard_subscription_available: Option<bool>,
    pub subscription_identifier_available: Option<bool>,
    pub shared_subscription_available: Option<bool>,
}

impl Properties {
    pub fn is_empty(&self) -> bool {
        self == &Properties::default()
    }
}

/// MQTT message.
#[derive(Debug, Clone)]
pub struct Message {
    /// Topic name.
    pub topic: String,
    /// Message payload.
    pub payload: Bytes,
    /// Retain flag.
    pub retain: bool,
}

impl Message {
    /// Create a new message.
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            retain: false,
        }
    }

    /// Set retain flag.
    pub fn with_retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }
}

/// Authentication and authorization for MQTT clients.
pub trait Authenticator: Send + Sync {
    /// Authenticate a client connection.
    ///
    /// Called when a client sends CONNECT packet.
    /// Returns true to allow the connection.
    fn authenticate(&self, client_id: &str, username: &str, password: &[u8]) -> bool;

    /// Check ACL permissions.
    ///
    /// Called when a client publishes or subscribes.
    /// - `write=true`: client is publishing to the topic
    /// - `write=false`: client is subscribing to the topic
    ///
    /// Returns true to allow the operation.
    fn acl(&self, client_id: &str, topic: &str, write: bool) -> bool;
}

/// Allow-all authenticator (default).
#[derive(Debug, Default, Clone)]
pub struct AllowAll;

impl Authenticator for AllowAll {
    fn authenticate(&self, _client_id: &str, _username: &str, _password: &[u8]) -> bool {
        true
    }

    fn acl(&self, _client_id: &str, _topic: &str, _write: bool) -> bool {
        true
    }
}

/// Message handler trait.
pub trait Handler: Send + Sync {
    /// Handle an incoming message.
    ///
    /// This is called for every message received by the broker,
    /// after it has been routed to subscribers.
    fn handle(&self, client_id: &str, msg: &Message);
}

/// Function-based handler.
impl<F> Handler for F
where
    F: Fn(&str, &Message) + Send + Sync,
{
    fn handle(&self, client_id: &str, msg: &Message) {
        self(client_id, msg)
    }
}
