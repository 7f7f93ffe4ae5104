//! Error types for mqtt0.

use std::io;

/// Result type alias for mqtt0.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for mqtt0 operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// IO error from the underlying transport.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Operation attempted on a closed client or connection.
    #[error("connection closed")]
    Closed,

    /// Operation-level deadline elapsed (dial, recv).
    #[error("timeout: {0}")]
    Timeout(String),

    /// Broker rejected CONNECT, or the CONNACK/reason code was not success.
    #[error("authentication failed")]
    AuthFailed,

    /// SUBACK/UNSUBACK carried a failure code, or a publish/subscribe was denied by ACL.
    #[error("acl denied: {0}")]
    AclDenied(String),

    /// Byte stream did not decode to a valid packet; the connection is terminated.
    #[error("invalid packet: {0}")]
    InvalidPacket(String),

    /// Illegal header, flags, or property; the connection is terminated.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// `remaining_length` exceeded `max_packet_size`; the connection is terminated.
    #[error("packet too large: {0} bytes")]
    PacketTooLarge(u32),

    /// Forbidden topic filter pattern (`#` not last, empty `$share` group, etc).
    #[error("invalid topic: {0}")]
    InvalidTopic(String),

    /// `Broker::serve` was called while already running.
    #[error("broker already running")]
    AlreadyRunning,

    /// Invalid configuration (bad transport URL, out-of-range option).
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Not enough bytes buffered yet to decode a full packet.
    ///
    /// Internal to the framed reader loop; never returned from a public API.
    #[error("incomplete packet, need {needed} more bytes")]
    Incomplete { needed: usize },
}
