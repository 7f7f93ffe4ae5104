//! QoS 0 MQTT broker (mqtt0d).
//!
//! A lightweight MQTT broker that supports both MQTT 3.1.1 (v4) and MQTT 5.0 (v5),
//! with full control over authentication and ACL.
//!
//! The broker automatically detects the protocol version from the CONNECT packet.

use bytes::{Bytes, BytesMut};
use parking_lot::RwLock;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncReadExt, ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, trace, warn};

use crate::error::{Error, Result};
use crate::protocol::{self, MAX_PACKET_SIZE};
use crate::trie::{filter_matches, Trie};
use crate::types::{AllowAll, Authenticator, Handler, Message, ProtocolVersion};

/// Callback type alias.
type Callback = Arc<dyn Fn(&str) + Send + Sync>;

/// Broker configuration.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Listen address (host:port).
    pub addr: String,
    /// Maximum packet size.
    pub max_packet_size: usize,
    /// Largest `TopicAlias` a v5 client may register (default 65535).
    pub max_topic_alias: u16,
    /// Optional cap on topic name/filter length in bytes; `None` disables the check.
    pub max_topic_length: Option<usize>,
    /// Optional cap on live subscriptions per client; `None` disables the check.
    pub max_subscriptions_per_client: Option<usize>,
    /// Whether to publish `$SYS/brokers/<clientID>/{connected,disconnected}` events.
    pub enable_sys_events: bool,
}

impl BrokerConfig {
    /// Create a new broker config with documented defaults.
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            max_packet_size: MAX_PACKET_SIZE,
            max_topic_alias: 65535,
            max_topic_length: None,
            max_subscriptions_per_client: None,
            enable_sys_events: true,
        }
    }

    /// Set the maximum packet size.
    pub fn with_max_packet_size(mut self, n: usize) -> Self {
        self.max_packet_size = n;
        self
    }

    /// Set the maximum v5 topic alias value.
    pub fn with_max_topic_alias(mut self, n: u16) -> Self {
        self.max_topic_alias = n;
        self
    }

    /// Cap topic name/filter length.
    pub fn with_max_topic_length(mut self, n: usize) -> Self {
        self.max_topic_length = Some(n);
        self
    }

    /// Cap live subscriptions per client.
    pub fn with_max_subscriptions_per_client(mut self, n: usize) -> Self {
        self.max_subscriptions_per_client = Some(n);
        self
    }

    /// Enable or disable `$SYS` event emission.
    pub fn with_sys_events(mut self, enabled: bool) -> Self {
        self.enable_sys_events = enabled;
        self
    }
}

/// Builder for Broker.
pub struct BrokerBuilder {
    config: BrokerConfig,
    authenticator: Option<Arc<dyn Authenticator>>,
    handler: Option<Arc<dyn Handler>>,
    on_connect: Option<Callback>,
    on_disconnect: Option<Callback>,
}

impl BrokerBuilder {
    /// Create a new broker builder.
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config,
            authenticator: None,
            handler: None,
            on_connect: None,
            on_disconnect: None,
        }
    }

    /// Set the authenticator.
    pub fn authenticator<A: Authenticator + 'static>(mut self, auth: A) -> Self {
        self.authenticator = Some(Arc::new(auth));
        self
    }

    /// Set the message handler.
    pub fn handler<H: Handler + 'static>(mut self, handler: H) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    /// Set the on_connect callback.
    pub fn on_connect<F: Fn(&str) + Send + Sync + 'static>(mut self, f: F) -> Self {
        self.on_connect = Some(Arc::new(f));
        self
    }

    /// Set the on_disconnect callback.
    pub fn on_disconnect<F: Fn(&str) + Send + Sync + 'static>(mut self, f: F) -> Self {
        self.on_disconnect = Some(Arc::new(f));
        self
    }

    /// Build the broker.
    pub fn build(self) -> Broker {
        Broker {
            config: self.config,
            authenticator: self.authenticator.unwrap_or_else(|| Arc::new(AllowAll)),
            handler: self.handler,
            on_connect: self.on_connect,
            on_disconnect: self.on_disconnect,
            subscriptions: Arc::new(Trie::new()),
            shared_groups: Arc::new(RwLock::new(HashMap::new())),
            clients: Arc::new(RwLock::new(HashMap::new())),
            client_subscriptions: Arc::new(RwLock::new(HashMap::new())),
            running: Arc::new(AtomicBool::new(false)),
        }
    }
}

/// Client handle for message delivery, stored as a trie/shared-group value.
#[derive(Clone)]
struct ClientHandle {
    client_id: String,
    tx: mpsc::Sender<Message>,
}

impl PartialEq for ClientHandle {
    fn eq(&self, other: &Self) -> bool {
        self.client_id == other.client_id
    }
}

/// A `$share/<group>/<filter>` member list with a round-robin cursor.
struct SharedGroup {
    members: Vec<ClientHandle>,
    cursor: usize,
}

/// QoS 0 MQTT broker supporting both v4 and v5.
pub struct Broker {
    config: BrokerConfig,
    authenticator: Arc<dyn Authenticator>,
    handler: Option<Arc<dyn Handler>>,
    on_connect: Option<Callback>,
    on_disconnect: Option<Callback>,
    subscriptions: Arc<Trie<ClientHandle>>,
    shared_groups: Arc<RwLock<HashMap<(String, String), SharedGroup>>>,
    /// Presence map used only for duplicate-client-ID takeover signalling.
    clients: Arc<RwLock<HashMap<String, Arc<Notify>>>>,
    /// Verbatim subscribed filters per client (including the `$share/...` form), for cleanup.
    client_subscriptions: Arc<RwLock<HashMap<String, Vec<String>>>>,
    running: Arc<AtomicBool>,
}

impl Broker {
    /// Create a new broker with the given config.
    pub fn new(config: BrokerConfig) -> Self {
        BrokerBuilder::new(config).build()
    }

    /// Create a builder for this broker.
    pub fn builder(config: BrokerConfig) -> BrokerBuilder {
        BrokerBuilder::new(config)
    }

    /// Start the broker. Resolves only on listener error; each accepted
    /// connection is handled on its own spawned task.
    pub async fn serve(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyRunning);
        }

        let listener = TcpListener::bind(&self.config.addr).await?;
        info!("Broker listening on {}", self.config.addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            debug!("Accepted connection from {}", addr);

            let ctx = BrokerContext {
                authenticator: Arc::clone(&self.authenticator),
                handler: self.handler.clone(),
                on_connect: self.on_connect.clone(),
                on_disconnect: self.on_disconnect.clone(),
                subscriptions: Arc::clone(&self.subscriptions),
                shared_groups: Arc::clone(&self.shared_groups),
                clients: Arc::clone(&self.clients),
                client_subscriptions: Arc::clone(&self.client_subscriptions),
                max_packet_size: self.config.max_packet_size,
                max_topic_alias: self.config.max_topic_alias,
                max_topic_length: self.config.max_topic_length,
                max_subscriptions_per_client: self.config.max_subscriptions_per_client,
                enable_sys_events: self.config.enable_sys_events,
            };

            tokio::spawn(async move {
                if let Err(e) = ctx.handle_connection(stream).await {
                    debug!("Connection error: {}", e);
                }
            });
        }
    }

    /// Publish a broker-originated message (bypasses ACL; `$SYS` events use the same path).
    pub async fn publish(&self, topic: &str, payload: &[u8]) -> Result<()> {
        let msg = Message::new(topic, Bytes::copy_from_slice(payload));
        route_message(&self.subscriptions, &self.shared_groups, &msg);
        Ok(())
    }
}

/// `$share/<group>/<topic-filter>` → `(group, topic-filter)`, or `None` if the
/// syntax is malformed (empty group/filter, or a `/` inside the group name) —
/// malformed forms fall through and are treated as a normal subscription.
fn parse_shared(filter: &str) -> Option<(String, String)> {
    let rest = filter.strip_prefix("$share/")?;
    let (group, topic) = rest.split_once('/')?;
    if group.is_empty() || topic.is_empty() || group.contains('/') {
        return None;
    }
    Some((group.to_string(), topic.to_string()))
}

/// Whether `topic` falls under the reserved `$SYS` prefix.
fn is_sys_topic(topic: &str) -> bool {
    topic == "$SYS" || topic.starts_with("$SYS/")
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Deliver `msg` to every normal-trie subscriber and, for each shared group
/// whose filter matches the topic, to the next member in round-robin order.
/// Sends are non-blocking: a full outbound queue drops the message and logs.
fn route_message(
    subscriptions: &Trie<ClientHandle>,
    shared_groups: &RwLock<HashMap<(String, String), SharedGroup>>,
    msg: &Message,
) {
    let topic = &msg.topic;

    subscriptions.with_values(topic, |handles| {
        for handle in handles {
            if handle.tx.try_send(msg.clone()).is_err() {
                warn!(
                    "outbound queue full for {}, dropping message on {}",
                    handle.client_id, topic
                );
            }
        }
    });

    let mut groups = shared_groups.write();
    for ((group, filter), state) in groups.iter_mut() {
        if state.members.is_empty() || !filter_matches(filter, topic) {
            continue;
        }
        let idx = state.cursor % state.members.len();
        state.cursor = state.cursor.wrapping_add(1);
        let handle = &state.members[idx];
        if handle.tx.try_send(msg.clone()).is_err() {
            warn!(
                "outbound queue full for shared group {}/{}, dropping message on {}",
                group, filter, topic
            );
        }
    }
}

/// Outcome of handling a v5 PUBLISH, distinguishing an invalid topic alias
/// (which must close the connection) from ordinary delivery/drop.
enum PublishOutcome {
    Delivered,
    AliasInvalid,
}

/// Internal broker context for handling connections. Cheap to clone (every
/// field is an `Arc` or `Copy` config value) — one is built per accepted
/// connection.
#[derive(Clone)]
struct BrokerContext {
    authenticator: Arc<dyn Authenticator>,
    handler: Option<Arc<dyn Handler>>,
    on_connect: Option<Callback>,
    on_disconnect: Option<Callback>,
    subscriptions: Arc<Trie<ClientHandle>>,
    shared_groups: Arc<RwLock<HashMap<(String, String), SharedGroup>>>,
    clients: Arc<RwLock<HashMap<String, Arc<Notify>>>>,
    client_subscriptions: Arc<RwLock<HashMap<String, Vec<String>>>>,
    max_packet_size: usize,
    max_topic_alias: u16,
    max_topic_length: Option<usize>,
    max_subscriptions_per_client: Option<usize>,
    enable_sys_events: bool,
}

impl BrokerContext {
    async fn handle_connection(&self, stream: TcpStream) -> Result<()> {
        let peer_addr = stream.peer_addr().map(|a| a.to_string()).unwrap_or_default();
        let (mut reader, writer) = tokio::io::split(stream);
        let mut read_buf = BytesMut::with_capacity(4096);

        // Read initial bytes to detect protocol version.
        let mut peek_buf = [0u8; 16];
        let n = reader.read(&mut peek_buf).await?;
        if n == 0 {
            return Err(Error::Closed);
        }
        read_buf.extend_from_slice(&peek_buf[..n]);

        let protocol_version = self.detect_protocol_version(&read_buf)?;
        debug!("Detected protocol version: {} from {}", protocol_version, peer_addr);

        match protocol_version {
            ProtocolVersion::V4 => self.handle_connection_v4(reader, writer, read_buf, peer_addr).await,
            ProtocolVersion::V5 => self.handle_connection_v5(reader, writer, read_buf, peer_addr).await,
        }
    }

    /// Detect protocol version from CONNECT packet.
    ///
    /// CONNECT packet structure:
    /// - Fixed header: 1+ bytes (0x10 for CONNECT)
    /// - Remaining length: 1-4 bytes
    /// - Protocol Name Length: 2 bytes
    /// - Protocol Name: "MQTT" (4 bytes)
    /// - Protocol Level: 1 byte (4 for v3.1.1, 5 for v5.0)
    fn detect_protocol_version(&self, buf: &[u8]) -> Result<ProtocolVersion> {
        if buf.len() < 2 {
            return Err(Error::ProtocolViolation("insufficient data".to_string()));
        }

        if buf[0] != 0x10 {
            return Err(Error::ProtocolViolation("expected CONNECT packet".to_string()));
        }

        let mut multiplier = 1usize;
        let mut header_len = 1usize;

        for &byte in buf.iter().skip(1) {
            header_len += 1;
            if byte & 0x80 == 0 {
                break;
            }
            multiplier *= 128;
            if multiplier > 128 * 128 * 128 * 128 {
                return Err(Error::ProtocolViolation("malformed remaining length".to_string()));
            }
        }

        // Protocol level offset: header_len + 2 (name length) + 4 (name "MQTT")
        let protocol_level_offset = header_len + 2 + 4;
        if buf.len() <= protocol_level_offset {
            // Not enough data yet; assume v4 (corrected once the full CONNECT is decoded).
            return Ok(ProtocolVersion::V4);
        }

        let protocol_level = buf[protocol_level_offset];
        match protocol_level {
            4 => Ok(ProtocolVersion::V4),
            5 => Ok(ProtocolVersion::V5),
            _ => Err(Error::ProtocolViolation(format!(
                "unsupported protocol level: {}",
                protocol_level
            ))),
        }
    }

    async fn handle_connection_v4(
        &self,
        mut reader: ReadHalf<TcpStream>,
        mut writer: WriteHalf<TcpStream>,
        mut read_buf: BytesMut,
        peer_addr: String,
    ) -> Result<()> {
        use crate::protocol::v4::Packet;
        use crate::types::ConnectReturnCodeV4;

        let packet = protocol::v4::read_packet(&mut reader, &mut read_buf, self.max_packet_size).await?;

        let (client_id, username, keep_alive) = match packet {
            Packet::Connect(connect) => {
                let client_id = connect.client_id.clone();
                let keep_alive = connect.keep_alive;
                let username = connect.username.clone().unwrap_or_default();
                let password = connect.password.as_deref().unwrap_or(&[]);

                if !self.authenticator.authenticate(&client_id, &username, password) {
                    warn!("Authentication failed for {} (v4)", client_id);
                    let connack = protocol::v4::create_connack(false, ConnectReturnCodeV4::NotAuthorized);
                    protocol::v4::write_packet(&mut writer, Packet::ConnAck(connack)).await?;
                    return Err(Error::AuthFailed);
                }

                debug!(
                    "Client {} authenticated (v4) from {}, keep_alive={}s",
                    client_id, peer_addr, keep_alive
                );

                let connack = protocol::v4::create_connack(false, ConnectReturnCodeV4::Success);
                protocol::v4::write_packet(&mut writer, Packet::ConnAck(connack)).await?;

                (client_id, username, keep_alive)
            }
            other => {
                return Err(Error::ProtocolViolation(format!(
                    "expected CONNECT, got {:?}",
                    other
                )));
            }
        };

        self.run_client_v4(&client_id, &username, &peer_addr, keep_alive, reader, writer, read_buf)
            .await
    }

    async fn handle_connection_v5(
        &self,
        mut reader: ReadHalf<TcpStream>,
        mut writer: WriteHalf<TcpStream>,
        mut read_buf: BytesMut,
        peer_addr: String,
    ) -> Result<()> {
        use crate::protocol::v5::Packet;
        use crate::types::{ConnectReasonCodeV5, Properties};

        let packet = protocol::v5::read_packet(&mut reader, &mut read_buf, self.max_packet_size).await?;

        let (client_id, username, keep_alive) = match packet {
            Packet::Connect(connect) => {
                let client_id = connect.client_id.clone();
                let keep_alive = connect.keep_alive;
                let username = connect.username.clone().unwrap_or_default();
                let password = connect.password.as_deref().unwrap_or(&[]);

                if let Some(expiry) = connect.properties.session_expiry_interval {
                    debug!("Client {} requesting session_expiry={}s", client_id, expiry);
                }

                if !self.authenticator.authenticate(&client_id, &username, password) {
                    warn!("Authentication failed for {} (v5)", client_id);
                    let connack = protocol::v5::create_connack(false, ConnectReasonCodeV5::NotAuthorized);
                    protocol::v5::write_packet(&mut writer, connack).await?;
                    return Err(Error::AuthFailed);
                }

                debug!(
                    "Client {} authenticated (v5) from {}, keep_alive={}s",
                    client_id, peer_addr, keep_alive
                );

                let mut ack_properties = Properties::default();
                ack_properties.topic_alias_maximum = Some(self.max_topic_alias);
                let connack = Packet::ConnAck(crate::protocol::v5::ConnAck {
                    session_present: false,
                    code: ConnectReasonCodeV5::Success,
                    properties: ack_properties,
                });
                protocol::v5::write_packet(&mut writer, connack).await?;

                (client_id, username, keep_alive)
            }
            other => {
                return Err(Error::ProtocolViolation(format!(
                    "expected CONNECT, got {:?}",
                    other
                )));
            }
        };

        self.run_client_v5(&client_id, &username, &peer_addr, keep_alive, reader, writer, read_buf)
            .await
    }

    async fn run_client_v4(
        &self,
        client_id: &str,
        username: &str,
        peer_addr: &str,
        keep_alive: u16,
        reader: ReadHalf<TcpStream>,
        writer: WriteHalf<TcpStream>,
        read_buf: BytesMut,
    ) -> Result<()> {
        let (tx, rx) = mpsc::channel::<Message>(100);
        let shutdown = Arc::new(Notify::new());
        self.register_client(client_id, Arc::clone(&shutdown));

        if let Some(ref on_connect) = self.on_connect {
            on_connect(client_id);
        }
        if self.enable_sys_events {
            self.emit_sys_connected(client_id, username, peer_addr, ProtocolVersion::V4, keep_alive);
        }

        info!("Client {} connected (MQTT 3.1.1) from {}", client_id, peer_addr);

        let client_handle = ClientHandle {
            client_id: client_id.to_string(),
            tx,
        };

        let shutdown_token = Arc::clone(&shutdown);
        let result = self
            .client_loop_v4(client_id, keep_alive, &client_handle, reader, writer, read_buf, rx, shutdown)
            .await;

        self.cleanup_client(client_id, &shutdown_token);
        if self.enable_sys_events {
            let reason = if result.is_ok() { "normal" } else { "error" };
            self.emit_sys_disconnected(client_id, username, reason);
        }
        if let Some(ref on_disconnect) = self.on_disconnect {
            on_disconnect(client_id);
        }

        info!("Client {} disconnected", client_id);
        result
    }

    async fn run_client_v5(
        &self,
        client_id: &str,
        username: &str,
        peer_addr: &str,
        keep_alive: u16,
        reader: ReadHalf<TcpStream>,
        writer: WriteHalf<TcpStream>,
        read_buf: BytesMut,
    ) -> Result<()> {
        let (tx, rx) = mpsc::channel::<Message>(100);
        let shutdown = Arc::new(Notify::new());
        self.register_client(client_id, Arc::clone(&shutdown));

        if let Some(ref on_connect) = self.on_connect {
            on_connect(client_id);
        }
        if self.enable_sys_events {
            self.emit_sys_connected(client_id, username, peer_addr, ProtocolVersion::V5, keep_alive);
        }

        info!("Client {} connected (MQTT 5.0) from {}", client_id, peer_addr);

        let client_handle = ClientHandle {
            client_id: client_id.to_string(),
            tx,
        };

        let shutdown_token = Arc::clone(&shutdown);
        let result = self
            .client_loop_v5(client_id, keep_alive, &client_handle, reader, writer, read_buf, rx, shutdown)
            .await;

        self.cleanup_client(client_id, &shutdown_token);
        if self.enable_sys_events {
            let reason = if result.is_ok() { "normal" } else { "error" };
            self.emit_sys_disconnected(client_id, username, reason);
        }
        if let Some(ref on_disconnect) = self.on_disconnect {
            on_disconnect(client_id);
        }

        info!("Client {} disconnected", client_id);
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn client_loop_v4(
        &self,
        client_id: &str,
        keep_alive: u16,
        client_handle: &ClientHandle,
        mut reader: ReadHalf<TcpStream>,
        mut writer: WriteHalf<TcpStream>,
        mut read_buf: BytesMut,
        mut rx: mpsc::Receiver<Message>,
        shutdown: Arc<Notify>,
    ) -> Result<()> {
        use crate::protocol::v4::Packet;
        use std::time::Duration;

        // MQTT spec: disconnect if no packet received within 1.5 x keep_alive.
        // keep_alive == 0 disables the timeout.
        let timeout_duration = if keep_alive > 0 {
            Some(Duration::from_secs((keep_alive as u64 * 3) / 2))
        } else {
            None
        };

        loop {
            let select_future = async {
                tokio::select! {
                    _ = shutdown.notified() => {
                        debug!("Client {} connection taken over by a new session", client_id);
                        Ok::<bool, Error>(true)
                    }

                    msg = rx.recv() => {
                        match msg {
                            Some(msg) => {
                                let publish = protocol::v4::create_publish(&msg.topic, &msg.payload, msg.retain);
                                protocol::v4::write_packet(&mut writer, publish).await?;
                                Ok::<bool, Error>(false)
                            }
                            None => Ok::<bool, Error>(true),
                        }
                    }

                    result = protocol::v4::read_packet(&mut reader, &mut read_buf, self.max_packet_size) => {
                        let packet = result?;

                        match packet {
                            Packet::Publish(publish) => {
                                self.handle_publish_v4(client_id, publish).await?;
                            }
                            Packet::Subscribe(subscribe) => {
                                let return_codes = self.handle_subscribe_v4(client_id, client_handle, &subscribe.filters);
                                let suback = protocol::v4::create_suback(subscribe.pkid, return_codes);
                                protocol::v4::write_packet(&mut writer, suback).await?;
                            }
                            Packet::Unsubscribe(unsubscribe) => {
                                self.handle_unsubscribe(client_id, &unsubscribe.topics);
                                let unsuback = protocol::v4::create_unsuback(unsubscribe.pkid);
                                protocol::v4::write_packet(&mut writer, Packet::UnsubAck(unsuback)).await?;
                            }
                            Packet::PingReq => {
                                protocol::v4::write_packet(&mut writer, protocol::v4::create_pingresp()).await?;
                            }
                            Packet::Disconnect => {
                                return Ok::<bool, Error>(true);
                            }
                            _ => {
                                trace!("Ignoring packet from {}: {:?}", client_id, packet);
                            }
                        }
                        Ok::<bool, Error>(false)
                    }
                }
            };

            let should_exit = if let Some(timeout) = timeout_duration {
                match tokio::time::timeout(timeout, select_future).await {
                    Ok(result) => result?,
                    Err(_) => {
                        warn!("Client {} keep-alive timeout ({}s), disconnecting", client_id, keep_alive);
                        return Err(Error::Timeout("keep-alive".to_string()));
                    }
                }
            } else {
                select_future.await?
            };

            if should_exit {
                return Ok(());
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn client_loop_v5(
        &self,
        client_id: &str,
        keep_alive: u16,
        client_handle: &ClientHandle,
        mut reader: ReadHalf<TcpStream>,
        mut writer: WriteHalf<TcpStream>,
        mut read_buf: BytesMut,
        mut rx: mpsc::Receiver<Message>,
        shutdown: Arc<Notify>,
    ) -> Result<()> {
        use crate::protocol::v5::{DisconnectReasonCode, Packet};
        use std::time::Duration;

        let timeout_duration = if keep_alive > 0 {
            Some(Duration::from_secs((keep_alive as u64 * 3) / 2))
        } else {
            None
        };

        // Per-connection alias -> topic table; life-scoped to this connection.
        let mut alias_table: HashMap<u16, String> = HashMap::new();

        loop {
            let select_future = async {
                tokio::select! {
                    _ = shutdown.notified() => {
                        debug!("Client {} connection taken over by a new session", client_id);
                        Ok::<bool, Error>(true)
                    }

                    msg = rx.recv() => {
                        match msg {
                            Some(msg) => {
                                let publish = protocol::v5::create_publish(&msg.topic, &msg.payload, msg.retain);
                                protocol::v5::write_packet(&mut writer, publish).await?;
                                Ok::<bool, Error>(false)
                            }
                            None => Ok::<bool, Error>(true),
                        }
                    }

                    result = protocol::v5::read_packet(&mut reader, &mut read_buf, self.max_packet_size) => {
                        let packet = result?;

                        match packet {
                            Packet::Publish(publish) => {
                                match self.handle_publish_v5(client_id, publish, &mut alias_table).await? {
                                    PublishOutcome::Delivered => {}
                                    PublishOutcome::AliasInvalid => {
                                        let disconnect = protocol::v5::create_disconnect(DisconnectReasonCode::TopicAliasInvalid);
                                        protocol::v5::write_packet(&mut writer, disconnect).await.ok();
                                        return Ok::<bool, Error>(true);
                                    }
                                }
                            }
                            Packet::Subscribe(subscribe) => {
                                let return_codes = self.handle_subscribe_v5(client_id, client_handle, &subscribe.filters);
                                let suback = protocol::v5::create_suback(subscribe.pkid, return_codes);
                                protocol::v5::write_packet(&mut writer, suback).await?;
                            }
                            Packet::Unsubscribe(unsubscribe) => {
                                self.handle_unsubscribe(client_id, &unsubscribe.filters);
                                let unsuback = protocol::v5::create_unsuback(unsubscribe.pkid);
                                protocol::v5::write_packet(&mut writer, unsuback).await?;
                            }
                            Packet::PingReq => {
                                protocol::v5::write_packet(&mut writer, protocol::v5::create_pingresp()).await?;
                            }
                            Packet::Disconnect(_) => {
                                return Ok::<bool, Error>(true);
                            }
                            _ => {
                                trace!("Ignoring packet from {}: {:?}", client_id, packet);
                            }
                        }
                        Ok::<bool, Error>(false)
                    }
                }
            };

            let should_exit = if let Some(timeout) = timeout_duration {
                match tokio::time::timeout(timeout, select_future).await {
                    Ok(result) => result?,
                    Err(_) => {
                        warn!("Client {} keep-alive timeout ({}s), disconnecting", client_id, keep_alive);
                        return Err(Error::Timeout("keep-alive".to_string()));
                    }
                }
            } else {
                select_future.await?
            };

            if should_exit {
                return Ok(());
            }
        }
    }

    async fn handle_publish_v4(&self, client_id: &str, publish: crate::protocol::v4::Publish) -> Result<()> {
        let topic = publish.topic.clone();

        if is_sys_topic(&topic) {
            warn!("Client {} attempted to publish to reserved topic {}", client_id, topic);
            return Ok(());
        }

        if let Some(max_len) = self.max_topic_length {
            if topic.len() > max_len {
                warn!("Client {} published to an over-length topic ({} bytes)", client_id, topic.len());
                return Ok(());
            }
        }

        if !self.authenticator.acl(client_id, &topic, true) {
            warn!("ACL denied publish from {} to {}", client_id, topic);
            return Ok(());
        }

        trace!("Client {} published to {} (v4)", client_id, topic);

        let msg = Message {
            topic: topic.clone(),
            payload: publish.payload,
            retain: publish.retain,
        };

        self.dispatch_to_handler(client_id, &msg);
        route_message(&self.subscriptions, &self.shared_groups, &msg);
        Ok(())
    }

    async fn handle_publish_v5(
        &self,
        client_id: &str,
        publish: crate::protocol::v5::Publish,
        alias_table: &mut HashMap<u16, String>,
    ) -> Result<PublishOutcome> {
        let mut topic = publish.topic.clone();

        if let Some(alias) = publish.properties.topic_alias {
            if alias == 0 || alias > self.max_topic_alias {
                warn!("Client {} sent out-of-range topic alias {}", client_id, alias);
                return Ok(PublishOutcome::AliasInvalid);
            }
            if !topic.is_empty() {
                alias_table.insert(alias, topic.clone());
            } else {
                match alias_table.get(&alias) {
                    Some(resolved) => topic = resolved.clone(),
                    None => {
                        trace!("Client {} referenced unregistered topic alias {}", client_id, alias);
                        return Ok(PublishOutcome::Delivered);
                    }
                }
            }
        }

        if is_sys_topic(&topic) {
            warn!("Client {} attempted to publish to reserved topic {}", client_id, topic);
            return Ok(PublishOutcome::Delivered);
        }

        if let Some(max_len) = self.max_topic_length {
            if topic.len() > max_len {
                warn!("Client {} published to an over-length topic ({} bytes)", client_id, topic.len());
                return Ok(PublishOutcome::Delivered);
            }
        }

        if !self.authenticator.acl(client_id, &topic, true) {
            warn!("ACL denied publish from {} to {}", client_id, topic);
            return Ok(PublishOutcome::Delivered);
        }

        trace!("Client {} published to {} (v5)", client_id, topic);

        let msg = Message {
            topic: topic.clone(),
            payload: publish.payload,
            retain: publish.retain,
        };

        self.dispatch_to_handler(client_id, &msg);
        route_message(&self.subscriptions, &self.shared_groups, &msg);
        Ok(PublishOutcome::Delivered)
    }

    /// Invoke the user-supplied `Handler`, if any, behind a `catch_unwind`
    /// boundary so a panicking callback cannot take down the broker.
    fn dispatch_to_handler(&self, client_id: &str, msg: &Message) {
        if let Some(ref handler) = self.handler {
            let handler = Arc::clone(handler);
            let client_id = client_id.to_string();
            let msg = msg.clone();
            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                handler.handle(&client_id, &msg);
            }));
            if outcome.is_err() {
                warn!("message handler panicked while processing a message from {}", client_id);
            }
        }
    }

    fn handle_subscribe_v4(
        &self,
        client_id: &str,
        client_handle: &ClientHandle,
        filters: &[crate::protocol::v4::SubscribeFilter],
    ) -> Vec<crate::protocol::v4::SubscribeReasonCode> {
        use crate::protocol::v4::SubscribeReasonCode;
        use crate::types::QoS;

        let mut return_codes = Vec::with_capacity(filters.len());

        for filter in filters {
            let raw = &filter.path;
            let (topic, group) = match parse_shared(raw) {
                Some((group, topic)) => (topic, Some(group)),
                None => (raw.clone(), None),
            };

            if !self.authenticator.acl(client_id, &topic, false) {
                warn!("ACL denied subscribe from {} to {}", client_id, raw);
                return_codes.push(SubscribeReasonCode::Failure);
                continue;
            }

            if self.at_subscription_limit(client_id) {
                warn!("Client {} exceeded its subscription limit", client_id);
                return_codes.push(SubscribeReasonCode::Failure);
                continue;
            }

            if let Err(e) = self.add_subscription(client_handle, &topic, group.clone()) {
                warn!("Failed to subscribe {} to {}: {}", client_id, raw, e);
                return_codes.push(SubscribeReasonCode::Failure);
                continue;
            }

            self.client_subscriptions
                .write()
                .entry(client_id.to_string())
                .or_default()
                .push(raw.clone());

            debug!("Client {} subscribed to {} (v4)", client_id, raw);
            return_codes.push(SubscribeReasonCode::Success(QoS::AtMostOnce));
        }

        return_codes
    }

    fn handle_subscribe_v5(
        &self,
        client_id: &str,
        client_handle: &ClientHandle,
        filters: &[crate::protocol::v5::SubscribeFilter],
    ) -> Vec<crate::protocol::v5::SubscribeReasonCode> {
        use crate::protocol::v5::SubscribeReasonCode;
        use crate::types::QoS;

        let mut return_codes = Vec::with_capacity(filters.len());

        for filter in filters {
            let raw = &filter.path;
            let (topic, group) = match parse_shared(raw) {
                Some((group, topic)) => (topic, Some(group)),
                None => (raw.clone(), None),
            };

            if !self.authenticator.acl(client_id, &topic, false) {
                warn!("ACL denied subscribe from {} to {}", client_id, raw);
                return_codes.push(SubscribeReasonCode::NotAuthorized);
                continue;
            }

            if self.at_subscription_limit(client_id) {
                warn!("Client {} exceeded its subscription limit", client_id);
                return_codes.push(SubscribeReasonCode::UnspecifiedError);
                continue;
            }

            if let Err(e) = self.add_subscription(client_handle, &topic, group.clone()) {
                warn!("Failed to subscribe {} to {}: {}", client_id, raw, e);
                return_codes.push(SubscribeReasonCode::TopicFilterInvalid);
                continue;
            }

            self.client_subscriptions
                .write()
                .entry(client_id.to_string())
                .or_default()
                .push(raw.clone());

            debug!("Client {} subscribed to {} (v5)", client_id, raw);
            return_codes.push(SubscribeReasonCode::Success(QoS::AtMostOnce));
        }

        return_codes
    }

    fn at_subscription_limit(&self, client_id: &str) -> bool {
        match self.max_subscriptions_per_client {
            Some(max) => self
                .client_subscriptions
                .read()
                .get(client_id)
                .map(|subs| subs.len() >= max)
                .unwrap_or(false),
            None => false,
        }
    }

    /// Insert into the normal trie, or into a shared group's member list.
    fn add_subscription(&self, client_handle: &ClientHandle, topic: &str, group: Option<String>) -> Result<()> {
        match group {
            Some(group) => {
                self.shared_groups
                    .write()
                    .entry((group, topic.to_string()))
                    .or_insert_with(|| SharedGroup { members: Vec::new(), cursor: 0 })
                    .members
                    .push(client_handle.clone());
                Ok(())
            }
            None => self.subscriptions.insert(topic, client_handle.clone()),
        }
    }

    fn handle_unsubscribe(&self, client_id: &str, topics: &[String]) {
        self.remove_subscriptions(client_id, topics);

        let mut client_subs = self.client_subscriptions.write();
        if let Some(subs_list) = client_subs.get_mut(client_id) {
            subs_list.retain(|t| !topics.contains(t));
        }
    }

    /// Remove `client_id`'s entries for the given verbatim filters (each
    /// possibly in `$share/...` form) from the trie or the relevant shared group.
    fn remove_subscriptions(&self, client_id: &str, filters: &[String]) {
        for raw in filters {
            match parse_shared(raw) {
                Some((group, topic)) => {
                    let mut groups = self.shared_groups.write();
                    let key = (group, topic);
                    if let Some(state) = groups.get_mut(&key) {
                        state.members.retain(|h| h.client_id != client_id);
                        if state.members.is_empty() {
                            groups.remove(&key);
                        }
                    }
                }
                None => {
                    self.subscriptions.remove(raw, |h| h.client_id == client_id);
                }
            }
            debug!("Client {} unsubscribed from {}", client_id, raw);
        }
    }

    /// Register `client_id`'s takeover notifier. If a prior connection for the
    /// same client ID is live, wake it (closing its loop) and synchronously
    /// prune its trie/shared-group subscriptions before returning, so the new
    /// connection starts from a clean slate.
    fn register_client(&self, client_id: &str, shutdown: Arc<Notify>) {
        let previous = self.clients.write().insert(client_id.to_string(), shutdown);
        if let Some(old) = previous {
            debug!("Client {} taking over an existing connection", client_id);
            old.notify_one();
        }
        if let Some(old_filters) = self.client_subscriptions.write().remove(client_id) {
            self.remove_subscriptions(client_id, &old_filters);
        }
    }

    /// Tear down `client_id`'s registration, but only if `shutdown` is still
    /// the registered connection's notifier. A superseded connection's own
    /// trailing cleanup must not run here — it would delete its successor's
    /// `clients` entry and prune the successor's live subscriptions out of
    /// the trie/shared groups.
    fn cleanup_client(&self, client_id: &str, shutdown: &Arc<Notify>) {
        let is_current = {
            let mut clients = self.clients.write();
            match clients.get(client_id) {
                Some(registered) if Arc::ptr_eq(registered, shutdown) => {
                    clients.remove(client_id);
                    true
                }
                _ => false,
            }
        };

        if !is_current {
            debug!(
                "Client {} was superseded by a newer connection, skipping stale cleanup",
                client_id
            );
            return;
        }

        if let Some(filters) = self.client_subscriptions.write().remove(client_id) {
            let count = filters.len();
            self.remove_subscriptions(client_id, &filters);
            debug!("Cleaned up {} subscriptions for client {}", count, client_id);
        }
    }

    fn emit_sys_connected(&self, client_id: &str, username: &str, peer_addr: &str, proto: ProtocolVersion, keep_alive: u16) {
        let proto_ver = match proto {
            ProtocolVersion::V4 => 4u8,
            ProtocolVersion::V5 => 5u8,
        };
        let payload = json!({
            "clientid": client_id,
            "username": username,
            "ipaddress": peer_addr,
            "proto_ver": proto_ver,
            "keepalive": keep_alive,
            "connected_at": now_unix(),
        })
        .to_string();

        let msg = Message::new(format!("$SYS/brokers/{}/connected", client_id), Bytes::from(payload));
        route_message(&self.subscriptions, &self.shared_groups, &msg);
    }

    fn emit_sys_disconnected(&self, client_id: &str, username: &str, reason: &str) {
        let payload = json!({
            "clientid": client_id,
            "username": username,
            "reason": reason,
            "disconnected_at": now_unix(),
        })
        .to_string();

        let msg = Message::new(format!("$SYS/brokers/{}/disconnected", client_id), Bytes::from(payload));
        route_message(&self.subscriptions, &self.shared_groups, &msg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broker_config() {
        let config = BrokerConfig::new("127.0.0.1:1883");
        assert_eq!(config.addr, "127.0.0.1:1883");
        assert_eq!(config.max_topic_alias, 65535);
        assert!(config.enable_sys_events);
        assert!(config.max_topic_length.is_none());
        assert!(config.max_subscriptions_per_client.is_none());
    }

    #[test]
    fn test_broker_config_builders() {
        let config = BrokerConfig::new("127.0.0.1:1883")
            .with_max_topic_alias(16)
            .with_max_topic_length(128)
            .with_max_subscriptions_per_client(4)
            .with_sys_events(false);
        assert_eq!(config.max_topic_alias, 16);
        assert_eq!(config.max_topic_length, Some(128));
        assert_eq!(config.max_subscriptions_per_client, Some(4));
        assert!(!config.enable_sys_events);
    }

    #[test]
    fn test_broker_builder() {
        struct TestAuth;
        impl Authenticator for TestAuth {
            fn authenticate(&self, _: &str, _: &str, _: &[u8]) -> bool {
                true
            }
            fn acl(&self, _: &str, _: &str, _: bool) -> bool {
                true
            }
        }

        let broker = Broker::builder(BrokerConfig::new("127.0.0.1:1883"))
            .authenticator(TestAuth)
            .on_connect(|id| println!("Connected: {}", id))
            .on_disconnect(|id| println!("Disconnected: {}", id))
            .build();

        assert_eq!(broker.config.addr, "127.0.0.1:1883");
    }

    #[test]
    fn test_parse_shared_valid() {
        let (group, topic) = parse_shared("$share/workers/sensor/temp").unwrap();
        assert_eq!(group, "workers");
        assert_eq!(topic, "sensor/temp");
    }

    #[test]
    fn test_parse_shared_rejects_malformed() {
        assert!(parse_shared("$share//sensor/temp").is_none()); // empty group
        assert!(parse_shared("$share/workers/").is_none()); // empty filter
        assert!(parse_shared("$share/a/b/sensor").is_none()); // slash in group
        assert!(parse_shared("sensor/temp").is_none()); // not shared at all
    }

    #[test]
    fn test_is_sys_topic() {
        assert!(is_sys_topic("$SYS/brokers/x/connected"));
        assert!(is_sys_topic("$SYS"));
        assert!(!is_sys_topic("sensor/temp"));
        assert!(!is_sys_topic("$share/g/sensor"));
    }

    #[tokio::test]
    async fn test_route_message_shared_group_round_robin() {
        let subscriptions: Trie<ClientHandle> = Trie::new();
        let shared_groups: RwLock<HashMap<(String, String), SharedGroup>> = RwLock::new(HashMap::new());

        let (tx1, mut rx1) = mpsc::channel(10);
        let (tx2, mut rx2) = mpsc::channel(10);
        let h1 = ClientHandle { client_id: "c1".to_string(), tx: tx1 };
        let h2 = ClientHandle { client_id: "c2".to_string(), tx: tx2 };

        shared_groups.write().insert(
            ("grp".to_string(), "test/topic".to_string()),
            SharedGroup { members: vec![h1, h2], cursor: 0 },
        );

        for i in 0..4 {
            let msg = Message::new("test/topic", Bytes::from(format!("m{i}")));
            route_message(&subscriptions, &shared_groups, &msg);
        }

        let mut c1 = 0;
        let mut c2 = 0;
        while rx1.try_recv().is_ok() {
            c1 += 1;
        }
        while rx2.try_recv().is_ok() {
            c2 += 1;
        }
        assert_eq!(c1 + c2, 4);
        assert_eq!(c1, 2);
        assert_eq!(c2, 2);
    }

    fn test_context() -> BrokerContext {
        BrokerContext {
            authenticator: Arc::new(crate::types::AllowAll),
            handler: None,
            on_connect: None,
            on_disconnect: None,
            subscriptions: Arc::new(Trie::new()),
            shared_groups: Arc::new(RwLock::new(HashMap::new())),
            clients: Arc::new(RwLock::new(HashMap::new())),
            client_subscriptions: Arc::new(RwLock::new(HashMap::new())),
            max_packet_size: MAX_PACKET_SIZE,
            max_topic_alias: 5,
            max_topic_length: None,
            max_subscriptions_per_client: None,
            enable_sys_events: false,
        }
    }

    fn v5_publish(topic: &str, payload: &[u8], alias: Option<u16>) -> crate::protocol::v5::Publish {
        let mut properties = crate::types::Properties::default();
        properties.topic_alias = alias;
        crate::protocol::v5::Publish {
            topic: topic.to_string(),
            payload: Bytes::copy_from_slice(payload),
            qos: crate::types::QoS::AtMostOnce,
            retain: false,
            dup: false,
            pkid: 0,
            properties,
        }
    }

    #[tokio::test]
    async fn test_topic_alias_registers_and_resolves() {
        let ctx = test_context();
        let mut alias_table = HashMap::new();

        let outcome = ctx
            .handle_publish_v5("c1", v5_publish("alias/test/one", b"msg1", Some(1)), &mut alias_table)
            .await
            .unwrap();
        assert!(matches!(outcome, PublishOutcome::Delivered));
        assert_eq!(alias_table.get(&1).map(String::as_str), Some("alias/test/one"));

        // Second publish references the alias with an empty topic; it must
        // resolve to the topic registered above rather than being dropped.
        let outcome = ctx
            .handle_publish_v5("c1", v5_publish("", b"msg2", Some(1)), &mut alias_table)
            .await
            .unwrap();
        assert!(matches!(outcome, PublishOutcome::Delivered));
    }

    #[tokio::test]
    async fn test_topic_alias_out_of_range_is_invalid() {
        let ctx = test_context();
        let mut alias_table = HashMap::new();

        let outcome = ctx
            .handle_publish_v5("c1", v5_publish("alias/test/one", b"msg", Some(10)), &mut alias_table)
            .await
            .unwrap();
        assert!(matches!(outcome, PublishOutcome::AliasInvalid));
    }

    #[tokio::test]
    async fn test_sys_topic_not_delivered_to_wildcard_via_normal_trie() {
        let subscriptions: Trie<ClientHandle> = Trie::new();
        let shared_groups: RwLock<HashMap<(String, String), SharedGroup>> = RwLock::new(HashMap::new());

        let (tx, mut rx) = mpsc::channel(10);
        let handle = ClientHandle { client_id: "c1".to_string(), tx };
        subscriptions.insert("#", handle).unwrap();

        let msg = Message::new("$SYS/brokers/x/connected", Bytes::from_static(b"{}"));
        route_message(&subscriptions, &shared_groups, &msg);

        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stale_cleanup_does_not_clobber_takeover() {
        let ctx = test_context();

        let old_shutdown = Arc::new(Notify::new());
        ctx.register_client("dup", Arc::clone(&old_shutdown));
        let (tx, _rx) = mpsc::channel(10);
        let old_handle = ClientHandle { client_id: "dup".to_string(), tx };
        ctx.add_subscription(&old_handle, "topic/old", None).unwrap();
        ctx.client_subscriptions
            .write()
            .insert("dup".to_string(), vec!["topic/old".to_string()]);

        // New connection for the same client ID takes over, as `accept_loop` would do.
        let new_shutdown = Arc::new(Notify::new());
        ctx.register_client("dup", Arc::clone(&new_shutdown));
        let (tx2, mut rx2) = mpsc::channel(10);
        let new_handle = ClientHandle { client_id: "dup".to_string(), tx: tx2 };
        ctx.add_subscription(&new_handle, "topic/new", None).unwrap();
        ctx.client_subscriptions
            .write()
            .insert("dup".to_string(), vec!["topic/new".to_string()]);

        // The superseded connection's task finally unwinds and runs its own
        // cleanup, but with the *old* shutdown token — it must be a no-op.
        ctx.cleanup_client("dup", &old_shutdown);

        assert!(ctx.clients.read().contains_key("dup"));
        assert!(ctx.client_subscriptions.read().contains_key("dup"));

        let msg = Message::new("topic/new", Bytes::from_static(b"hi"));
        route_message(&ctx.subscriptions, &ctx.shared_groups, &msg);
        assert!(rx2.try_recv().is_ok());

        // The real (current) connection's cleanup still works.
        ctx.cleanup_client("dup", &new_shutdown);
        assert!(!ctx.clients.read().contains_key("dup"));
        assert!(!ctx.client_subscriptions.read().contains_key("dup"));
    }
}
