//! QoS 0 MQTT client (mqtt0c).
//!
//! A lightweight MQTT client that supports both MQTT 3.1.1 (v4) and MQTT 5.0 (v5),
//! dialing over TCP, TLS, or WebSocket depending on the scheme of the configured
//! broker URL.

use bytes::BytesMut;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::protocol::{self, MAX_PACKET_SIZE};
use crate::transport::{self, Transport};
use crate::types::{Message, ProtocolVersion};

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Broker URL (`tcp://host:1883`, `tls://host:8883`, `mqtts://host:8883`,
    /// `ws://host:80/mqtt`, `wss://host:443/mqtt`). A bare `host:port` is
    /// treated as `tcp://host:port`.
    pub addr: String,
    /// Client ID.
    pub client_id: String,
    /// Username for authentication.
    pub username: Option<String>,
    /// Password for authentication.
    pub password: Option<Vec<u8>>,
    /// Keep alive interval in seconds.
    pub keep_alive: u16,
    /// Clean session flag (v4) / Clean start flag (v5).
    pub clean_session: bool,
    /// Maximum packet size.
    pub max_packet_size: usize,
    /// Protocol version.
    pub protocol_version: ProtocolVersion,
    /// Session expiry interval in seconds (v5 only).
    /// - None: use broker default
    /// - Some(0): session ends immediately on disconnect
    /// - Some(n): session persists for n seconds after disconnect
    /// - Some(0xFFFFFFFF): session never expires
    pub session_expiry: Option<u32>,
    /// Enable automatic keep-alive (sends PINGREQ at keep_alive/2 intervals).
    /// Default: true (like Go's autopaho).
    pub auto_keepalive: bool,
    /// Deadline for dial + CONNECT/CONNACK handshake.
    pub connect_timeout: Duration,
}

impl ClientConfig {
    /// Create a new client config (defaults to MQTT 3.1.1).
    pub fn new(addr: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            client_id: client_id.into(),
            username: None,
            password: None,
            keep_alive: 60,
            clean_session: true,
            max_packet_size: MAX_PACKET_SIZE,
            protocol_version: ProtocolVersion::V4,
            session_expiry: None,
            auto_keepalive: true, // Default: auto ping like Go's autopaho
            connect_timeout: Duration::from_secs(30),
        }
    }

    /// Set credentials.
    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<Vec<u8>>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Set keep alive interval.
    pub fn with_keep_alive(mut self, seconds: u16) -> Self {
        self.keep_alive = seconds;
        self
    }

    /// Set clean session flag.
    pub fn with_clean_session(mut self, clean: bool) -> Self {
        self.clean_session = clean;
        self
    }

    /// Set protocol version.
    pub fn with_protocol(mut self, version: ProtocolVersion) -> Self {
        self.protocol_version = version;
        self
    }

    /// Set session expiry interval (MQTT 5.0 only).
    pub fn with_session_expiry(mut self, seconds: u32) -> Self {
        self.session_expiry = Some(seconds);
        self
    }

    /// Enable or disable automatic keep-alive pings.
    pub fn with_auto_keepalive(mut self, enabled: bool) -> Self {
        self.auto_keepalive = enabled;
        self
    }

    /// Set the deadline for dial + CONNECT/CONNACK handshake.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

/// Which protocol version a connected client is speaking. Distinct from
/// `ProtocolVersion` in `ClientConfig` only in that it is fixed for the
/// lifetime of the connection once the handshake has completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientState {
    V4,
    V5,
}

/// Shared state for the background keep-alive task.
struct KeepaliveState {
    writer: Arc<Mutex<WriteHalf<Transport>>>,
    running: Arc<AtomicBool>,
    interval: Duration,
    state: ClientState,
}

/// QoS 0 MQTT client supporting both v4 and v5.
pub struct Client {
    reader: Mutex<ReadHalf<Transport>>,
    writer: Arc<Mutex<WriteHalf<Transport>>>,
    read_buf: Mutex<BytesMut>,
    client_id: String,
    next_pkid: AtomicU16,
    max_packet_size: usize,
    state: ClientState,
    running: Arc<AtomicBool>,
}

impl Client {
    /// Connect to a broker and complete the CONNECT/CONNACK handshake.
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        let connect_timeout = config.connect_timeout;
        let handshake = async move {
            match config.protocol_version {
                ProtocolVersion::V4 => Self::connect_v4(config).await,
                ProtocolVersion::V5 => Self::connect_v5(config).await,
            }
        };
        tokio::time::timeout(connect_timeout, handshake)
            .await
            .map_err(|_| Error::Timeout("connect".to_string()))?
    }

    async fn dial(addr: &str) -> Result<Transport> {
        if addr.contains("://") {
            transport::dial(addr).await
        } else {
            transport::dial(&format!("tcp://{addr}")).await
        }
    }

    async fn connect_v4(config: ClientConfig) -> Result<Self> {
        use crate::protocol::v4::Packet;

        let stream = Self::dial(&config.addr).await?;
        let (mut reader, mut writer) = tokio::io::split(stream);

        let connect_packet = protocol::v4::create_connect(
            &config.client_id,
            config.username.as_deref(),
            config.password.as_deref(),
            config.keep_alive,
            config.clean_session,
        );
        protocol::v4::write_packet(&mut writer, connect_packet).await?;

        let mut read_buf = BytesMut::with_capacity(4096);
        let packet = protocol::v4::read_packet(&mut reader, &mut read_buf, config.max_packet_size).await?;

        match packet {
            Packet::ConnAck(connack) if connack.code.is_success() => {
                debug!("Client {} connected (v4)", config.client_id);
            }
            Packet::ConnAck(connack) => {
                warn!("Broker rejected CONNECT: {:?}", connack.code);
                return Err(Error::AuthFailed);
            }
            other => {
                return Err(Error::ProtocolViolation(format!(
                    "expected CONNACK, got {:?}",
                    other
                )));
            }
        }

        let running = Arc::new(AtomicBool::new(true));
        let writer = Arc::new(Mutex::new(writer));

        let client = Client {
            reader: Mutex::new(reader),
            writer: Arc::clone(&writer),
            read_buf: Mutex::new(read_buf),
            client_id: config.client_id,
            next_pkid: AtomicU16::new(1),
            max_packet_size: config.max_packet_size,
            state: ClientState::V4,
            running: Arc::clone(&running),
        };

        if config.auto_keepalive && config.keep_alive > 0 {
            let interval = Duration::from_secs((config.keep_alive as u64 / 2).max(1));
            tokio::spawn(Self::keepalive_task(KeepaliveState {
                writer,
                running,
                interval,
                state: ClientState::V4,
            }));
        }

        Ok(client)
    }

    async fn connect_v5(config: ClientConfig) -> Result<Self> {
        use crate::protocol::v5::Packet;

        let stream = Self::dial(&config.addr).await?;
        let (mut reader, mut writer) = tokio::io::split(stream);

        let connect_packet = protocol::v5::create_connect(
            &config.client_id,
            config.username.as_deref(),
            config.password.as_deref(),
            config.keep_alive,
            config.clean_session,
            config.session_expiry,
        );
        protocol::v5::write_packet(&mut writer, connect_packet).await?;

        let mut read_buf = BytesMut::with_capacity(4096);
        let packet = protocol::v5::read_packet(&mut reader, &mut read_buf, config.max_packet_size).await?;

        match packet {
            Packet::ConnAck(connack) if connack.code.is_success() => {
                debug!("Client {} connected (v5)", config.client_id);
            }
            Packet::ConnAck(connack) => {
                warn!("Broker rejected CONNECT: {:?}", connack.code);
                return Err(Error::AuthFailed);
            }
            other => {
                return Err(Error::ProtocolViolation(format!(
                    "expected CONNACK, got {:?}",
                    other
                )));
            }
        }

        let running = Arc::new(AtomicBool::new(true));
        let writer = Arc::new(Mutex::new(writer));

        let client = Client {
            reader: Mutex::new(reader),
            writer: Arc::clone(&writer),
            read_buf: Mutex::new(read_buf),
            client_id: config.client_id,
            next_pkid: AtomicU16::new(1),
            max_packet_size: config.max_packet_size,
            state: ClientState::V5,
            running: Arc::clone(&running),
        };

        if config.auto_keepalive && config.keep_alive > 0 {
            let interval = Duration::from_secs((config.keep_alive as u64 / 2).max(1));
            tokio::spawn(Self::keepalive_task(KeepaliveState {
                writer,
                running,
                interval,
                state: ClientState::V5,
            }));
        }

        Ok(client)
    }

    /// Publish a message with `retain=false`.
    pub async fn publish(&self, topic: &str, payload: &[u8]) -> Result<()> {
        self.publish_with_retain(topic, payload, false).await
    }

    /// Publish a message with an explicit retain flag.
    pub async fn publish_with_retain(&self, topic: &str, payload: &[u8], retain: bool) -> Result<()> {
        let mut writer = self.writer.lock().await;
        match self.state {
            ClientState::V4 => {
                let packet = protocol::v4::create_publish(topic, payload, retain);
                protocol::v4::write_packet(&mut *writer, packet).await
            }
            ClientState::V5 => {
                let packet = protocol::v5::create_publish(topic, payload, retain);
                protocol::v5::write_packet(&mut *writer, packet).await
            }
        }
    }

    /// Subscribe to one or more topic filters. Returns `Ok` if at least one
    /// filter was granted; `Err(Error::AclDenied)` only if every filter failed.
    pub async fn subscribe(&self, topics: &[&str]) -> Result<()> {
        match self.state {
            ClientState::V4 => self.subscribe_v4(topics).await,
            ClientState::V5 => self.subscribe_v5(topics).await,
        }
    }

    async fn subscribe_v4(&self, topics: &[&str]) -> Result<()> {
        use crate::protocol::v4::{Packet, SubscribeReasonCode};

        let pkid = self.next_pkid();
        let packet = protocol::v4::create_subscribe(pkid, topics);

        // Hold both the writer and reader/read_buf locks across the
        // request/ack round trip so no other task's packets interleave.
        let mut writer = self.writer.lock().await;
        protocol::v4::write_packet(&mut *writer, packet).await?;

        let mut reader = self.reader.lock().await;
        let mut read_buf = self.read_buf.lock().await;
        loop {
            let response = protocol::v4::read_packet(&mut *reader, &mut read_buf, self.max_packet_size).await?;
            if let Packet::SubAck(suback) = response {
                if suback.pkid != pkid {
                    continue;
                }
                let all_failed = suback
                    .return_codes
                    .iter()
                    .all(|c| matches!(c, SubscribeReasonCode::Failure));
                return if all_failed {
                    Err(Error::AclDenied(format!("subscribe denied: {:?}", topics)))
                } else {
                    Ok(())
                };
            }
            trace!("Ignoring packet while waiting for SUBACK: {:?}", response);
        }
    }

    async fn subscribe_v5(&self, topics: &[&str]) -> Result<()> {
        use crate::protocol::v5::Packet;

        let pkid = self.next_pkid();
        let packet = protocol::v5::create_subscribe(pkid, topics);

        let mut writer = self.writer.lock().await;
        protocol::v5::write_packet(&mut *writer, packet).await?;

        let mut reader = self.reader.lock().await;
        let mut read_buf = self.read_buf.lock().await;
        loop {
            let response = protocol::v5::read_packet(&mut *reader, &mut read_buf, self.max_packet_size).await?;
            if let Packet::SubAck(suback) = response {
                if suback.pkid != pkid {
                    continue;
                }
                let all_failed = suback.return_codes.iter().all(|c| c.is_failure());
                return if all_failed {
                    Err(Error::AclDenied(format!("subscribe denied: {:?}", topics)))
                } else {
                    Ok(())
                };
            }
            trace!("Ignoring packet while waiting for SUBACK: {:?}", response);
        }
    }

    /// Unsubscribe from one or more topic filters.
    pub async fn unsubscribe(&self, topics: &[&str]) -> Result<()> {
        match self.state {
            ClientState::V4 => self.unsubscribe_v4(topics).await,
            ClientState::V5 => self.unsubscribe_v5(topics).await,
        }
    }

    async fn unsubscribe_v4(&self, topics: &[&str]) -> Result<()> {
        use crate::protocol::v4::Packet;

        let pkid = self.next_pkid();
        let packet = protocol::v4::create_unsubscribe(pkid, topics);

        let mut writer = self.writer.lock().await;
        protocol::v4::write_packet(&mut *writer, packet).await?;

        let mut reader = self.reader.lock().await;
        let mut read_buf = self.read_buf.lock().await;
        loop {
            let response = protocol::v4::read_packet(&mut *reader, &mut read_buf, self.max_packet_size).await?;
            if let Packet::UnsubAck(unsuback) = response {
                if unsuback.pkid == pkid {
                    return Ok(());
                }
            }
            trace!("Ignoring packet while waiting for UNSUBACK: {:?}", response);
        }
    }

    async fn unsubscribe_v5(&self, topics: &[&str]) -> Result<()> {
        use crate::protocol::v5::Packet;

        let pkid = self.next_pkid();
        let packet = protocol::v5::create_unsubscribe(pkid, topics);

        let mut writer = self.writer.lock().await;
        protocol::v5::write_packet(&mut *writer, packet).await?;

        let mut reader = self.reader.lock().await;
        let mut read_buf = self.read_buf.lock().await;
        loop {
            let response = protocol::v5::read_packet(&mut *reader, &mut read_buf, self.max_packet_size).await?;
            if let Packet::UnsubAck(unsuback) = response {
                if unsuback.pkid == pkid {
                    return Ok(());
                }
            }
            trace!("Ignoring packet while waiting for UNSUBACK: {:?}", response);
        }
    }

    /// Wait for the next application message (PUBLISH), transparently
    /// handling PINGRESP and any packet types not relevant to the caller.
    pub async fn recv(&self) -> Result<Message> {
        match self.state {
            ClientState::V4 => self.recv_v4().await,
            ClientState::V5 => self.recv_v5().await,
        }
    }

    async fn recv_v4(&self) -> Result<Message> {
        use crate::protocol::v4::Packet;

        let mut reader = self.reader.lock().await;
        let mut read_buf = self.read_buf.lock().await;
        loop {
            match protocol::v4::read_packet(&mut *reader, &mut read_buf, self.max_packet_size).await? {
                Packet::Publish(publish) => {
                    return Ok(Message {
                        topic: publish.topic,
                        payload: publish.payload,
                        retain: publish.retain,
                    });
                }
                Packet::PingResp => continue,
                Packet::Disconnect => return Err(Error::Closed),
                other => {
                    trace!("Ignoring packet in recv: {:?}", other);
                }
            }
        }
    }

    async fn recv_v5(&self) -> Result<Message> {
        use crate::protocol::v5::Packet;

        let mut reader = self.reader.lock().await;
        let mut read_buf = self.read_buf.lock().await;
        loop {
            match protocol::v5::read_packet(&mut *reader, &mut read_buf, self.max_packet_size).await? {
                Packet::Publish(publish) => {
                    return Ok(Message {
                        topic: publish.topic,
                        payload: publish.payload,
                        retain: publish.retain,
                    });
                }
                Packet::PingResp => continue,
                Packet::Disconnect(_) => return Err(Error::Closed),
                other => {
                    trace!("Ignoring packet in recv: {:?}", other);
                }
            }
        }
    }

    /// Wait for the next message with a deadline.
    pub async fn recv_timeout(&self, timeout: Duration) -> Result<Message> {
        tokio::time::timeout(timeout, self.recv())
            .await
            .map_err(|_| Error::Timeout("recv".to_string()))?
    }

    /// Send a PINGREQ.
    pub async fn ping(&self) -> Result<()> {
        let mut writer = self.writer.lock().await;
        match self.state {
            ClientState::V4 => protocol::v4::write_packet(&mut *writer, protocol::v4::create_pingreq()).await,
            ClientState::V5 => protocol::v5::write_packet(&mut *writer, protocol::v5::create_pingreq()).await,
        }
    }

    /// Send DISCONNECT and stop the keep-alive task. Idempotent: a second
    /// call is a no-op rather than re-emitting DISCONNECT on an already
    /// shut-down writer.
    pub async fn disconnect(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let mut writer = self.writer.lock().await;
        match self.state {
            ClientState::V4 => {
                protocol::v4::write_packet(&mut *writer, protocol::v4::create_disconnect()).await?;
            }
            ClientState::V5 => {
                use crate::protocol::v5::DisconnectReasonCode;
                protocol::v5::write_packet(
                    &mut *writer,
                    protocol::v5::create_disconnect(DisconnectReasonCode::NormalDisconnection),
                )
                .await?;
            }
        }
        writer.shutdown().await.ok();
        Ok(())
    }

    /// Whether the client's keep-alive task (if any) still believes the
    /// connection is alive.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// The client ID this connection authenticated with.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    fn next_pkid(&self) -> u16 {
        let pkid = self.next_pkid.fetch_add(1, Ordering::SeqCst);
        if pkid == 0 {
            self.next_pkid.fetch_add(1, Ordering::SeqCst)
        } else {
            pkid
        }
    }

    async fn keepalive_task(state: KeepaliveState) {
        let mut ticker = tokio::time::interval(state.interval);
        ticker.tick().await; // first tick fires immediately
        loop {
            ticker.tick().await;
            if !state.running.load(Ordering::SeqCst) {
                break;
            }
            let mut writer = state.writer.lock().await;
            let result = match state.state {
                ClientState::V4 => protocol::v4::write_packet(&mut *writer, protocol::v4::create_pingreq()).await,
                ClientState::V5 => protocol::v5::write_packet(&mut *writer, protocol::v5::create_pingreq()).await,
            };
            drop(writer);
            if result.is_err() {
                state.running.store(false, Ordering::SeqCst);
                break;
            }
        }
    }
}
