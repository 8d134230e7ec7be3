//! One live client connection and its command multiplexer.
//!
//! A [`Connection`] owns both directions of one keyed stream: the read loop
//! runs as its own task and dispatches inbound commands, while the write
//! path is externally driven and serialized behind a mutex (at most one
//! write in flight per connection). The two directions share no codec
//! state, so reads and writes may execute concurrently.
//!
//! Lifecycle: `Accepted → Handshaking → Ready → Closing → Closed`. The
//! first two states belong to the acceptor that still owns the raw socket;
//! a `Connection` is constructed once the external handshake has produced
//! session keys and therefore starts out `Ready`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::{Mutex, mpsc, watch};
use wireline_proto::command::RESERVED_MASK;
use wireline_proto::{Command, CommandKind, CommandReader, CommandWriter, Message, SessionKeys};

use crate::cache::MessageCache;
use crate::error::ServerError;
use crate::hooks::EventHandler;
use crate::rpc::{ForwardRequest, MessageContainer};

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ConnState {
    /// Socket accepted; no keys yet.
    Accepted = 0,
    /// External handshake in progress.
    Handshaking = 1,
    /// Keys installed; command traffic flowing.
    Ready = 2,
    /// Close initiated; loops draining.
    Closing = 3,
    /// Both loops done; the registry no longer sees this connection.
    Closed = 4,
}

impl ConnState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Accepted,
            1 => Self::Handshaking,
            2 => Self::Ready,
            3 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// Identity snapshot of a connection, handed to event hooks.
#[derive(Debug, Clone)]
pub struct ConnInfo {
    /// Unique per-connection id.
    pub uniq_id: String,
    /// Service the connection authenticated into.
    pub service: String,
    /// Authenticated username.
    pub username: String,
    /// Peer address, when the transport has one.
    pub remote_addr: Option<SocketAddr>,
    /// Presence visibility flag at snapshot time.
    pub visible: bool,
}

/// A push-subscription change posted by a connection.
#[derive(Debug, Clone)]
pub struct SubscribeRequest {
    /// Service of the subscribing connection.
    pub service: String,
    /// Username of the subscribing connection.
    pub username: String,
    /// Opaque push parameters from the command header.
    pub params: HashMap<String, String>,
    /// `true` to subscribe, `false` to unsubscribe.
    pub subscribe: bool,
}

/// References a service center installs on a connection before serving it.
#[derive(Clone)]
pub(crate) struct ServiceLinks {
    pub(crate) cache: Arc<dyn MessageCache>,
    pub(crate) forward_tx: mpsc::Sender<ForwardRequest>,
    pub(crate) subscribe_tx: mpsc::Sender<SubscribeRequest>,
}

/// One live connection. Generic over the byte stream so production TCP and
/// in-memory test streams share every code path.
pub struct Connection<S> {
    uniq_id: String,
    service: String,
    username: String,
    remote_addr: Option<SocketAddr>,
    visible: AtomicBool,
    compress_threshold: AtomicI32,
    state: AtomicU8,
    writer: Mutex<CommandWriter<WriteHalf<S>>>,
    reader: StdMutex<Option<CommandReader<ReadHalf<S>>>>,
    links: StdMutex<Option<ServiceLinks>>,
    close_tx: watch::Sender<bool>,
}

/// A per-connection id: high-resolution timestamp plus random entropy.
fn new_uniq_id() -> String {
    let nanos = SystemTime::now().duration_since(UNIX_EPOCH).map_or(0, |d| d.as_nanos());
    format!("{nanos:x}-{:08x}", rand::random::<u32>())
}

/// Usernames must be non-empty and free of `:` and newline, which are
/// delimiters in cache keys and cluster RPC lines.
pub(crate) fn validate_username(username: &str) -> Result<(), ServerError> {
    if username.is_empty() || username.contains(':') || username.contains('\n') {
        return Err(ServerError::InvalidUsername(username.to_owned()));
    }
    Ok(())
}

/// Parse the wire TTL form: bare seconds or a single `s`/`m`/`h`/`d`
/// suffix.
pub(crate) fn parse_ttl(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    let split = raw.find(|c: char| !c.is_ascii_digit()).unwrap_or(raw.len());
    let (digits, unit) = raw.split_at(split);
    let value: u64 = digits.parse().ok()?;
    let seconds = match unit {
        "" | "s" => value,
        "m" => value.checked_mul(60)?,
        "h" => value.checked_mul(3600)?,
        "d" => value.checked_mul(86_400)?,
        _ => return None,
    };
    Some(Duration::from_secs(seconds))
}

impl<S> Connection<S> {
    /// Unique connection id.
    pub fn uniq_id(&self) -> &str {
        &self.uniq_id
    }

    /// Service this connection belongs to.
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Authenticated username.
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Peer address, when the transport has one.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// Current presence visibility.
    pub fn visible(&self) -> bool {
        self.visible.load(Ordering::Relaxed)
    }

    /// Current compression threshold snapshot. 0 disables compression.
    pub fn compress_threshold(&self) -> i32 {
        self.compress_threshold.load(Ordering::Relaxed)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnState {
        ConnState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Identity snapshot for hooks and results.
    pub fn info(&self) -> ConnInfo {
        ConnInfo {
            uniq_id: self.uniq_id.clone(),
            service: self.service.clone(),
            username: self.username.clone(),
            remote_addr: self.remote_addr,
            visible: self.visible(),
        }
    }

    pub(crate) fn install(&self, links: ServiceLinks) {
        *self.links.lock().unwrap_or_else(PoisonError::into_inner) = Some(links);
    }

    fn take_reader(&self) -> Option<CommandReader<ReadHalf<S>>> {
        self.reader.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    fn reader_taken(&self) -> bool {
        self.reader.lock().unwrap_or_else(PoisonError::into_inner).is_none()
    }

    fn linked(&self) -> Option<ServiceLinks> {
        self.links.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn set_state(&self, state: ConnState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Wrap a handshake-completed stream into a `Ready` connection.
    ///
    /// The stream is split; the read half waits for
    /// the serving task, the write half sits behind the write mutex.
    pub fn new(
        stream: S,
        keys: &SessionKeys,
        service: impl Into<String>,
        username: impl Into<String>,
        remote_addr: Option<SocketAddr>,
    ) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        let reader = CommandReader::new(read_half, &keys.read_cipher, &keys.read_mac);
        let writer = CommandWriter::new(write_half, &keys.write_cipher, &keys.write_mac);
        let (close_tx, _) = watch::channel(false);

        Self {
            uniq_id: new_uniq_id(),
            service: service.into(),
            username: username.into(),
            remote_addr,
            visible: AtomicBool::new(true),
            compress_threshold: AtomicI32::new(0),
            state: AtomicU8::new(ConnState::Ready as u8),
            writer: Mutex::new(writer),
            reader: StdMutex::new(Some(reader)),
            links: StdMutex::new(None),
            close_tx,
        }
    }

    /// Deliver a message to this connection as a `MessageWithId` command.
    ///
    /// Takes the current compression threshold snapshot; writes are
    /// serialized, at most one in flight.
    ///
    /// # Errors
    ///
    /// [`ServerError::PeerWrite`] on any codec or transport failure. The
    /// caller should close the connection; the write stream cannot be
    /// resynchronized.
    pub async fn send_message(
        &self,
        message: &Message,
        id: &str,
        extra_header: Option<&HashMap<String, String>>,
    ) -> Result<(), ServerError> {
        let mut cmd = Command::new(CommandKind::MessageWithId);
        if !id.is_empty() {
            cmd.params.push(id.to_owned());
        }
        if let Some(extra) = extra_header {
            cmd.header.extend(extra.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        cmd.message = Some(message.clone());

        let threshold = self.compress_threshold.load(Ordering::Relaxed);
        let mut writer = self.writer.lock().await;
        writer
            .write_command(&cmd, threshold)
            .await
            .map_err(|e| ServerError::PeerWrite(e.to_string()))
    }

    /// Initiate close: signal the read loop and shut the write half down
    /// after a best-effort flush. Idempotent.
    pub async fn close(&self) {
        if self.state() < ConnState::Closing {
            self.set_state(ConnState::Closing);
        }
        let _ = self.close_tx.send(true);

        {
            let mut writer = self.writer.lock().await;
            let _ = writer.shutdown().await;
        }

        // Without a serving task there is nobody else to finish the
        // transition.
        if !self.reader_taken() {
            self.set_state(ConnState::Closed);
        }
    }

    /// Run the read loop until the peer closes, a fatal error occurs, or
    /// close is signalled. Returns the terminal reason; `None` is an
    /// orderly close.
    pub(crate) async fn run_read_loop(
        self: &Arc<Self>,
        hooks: &Arc<dyn EventHandler>,
    ) -> Option<ServerError> {
        let Some(mut reader) = self.take_reader() else {
            return Some(ServerError::ProtocolViolation(
                "connection is already being served".to_owned(),
            ));
        };
        let Some(links) = self.linked() else {
            return Some(ServerError::ProtocolViolation(
                "connection served without service links".to_owned(),
            ));
        };
        let mut close_rx = self.close_tx.subscribe();
        // A close signalled before this task subscribed would otherwise be
        // missed: a fresh receiver starts with the current value marked seen.
        if *close_rx.borrow_and_update() {
            self.set_state(ConnState::Closed);
            return None;
        }

        loop {
            let cmd = tokio::select! {
                result = reader.read_command() => match result {
                    Ok(Some(cmd)) => cmd,
                    Ok(None) => {
                        tracing::debug!(conn = %self.uniq_id, "peer closed");
                        self.set_state(ConnState::Closed);
                        return None;
                    },
                    Err(err) => {
                        let err = ServerError::from(err);
                        hooks.on_error(Some(&self.info()), &err).await;
                        self.set_state(ConnState::Closed);
                        return Some(err);
                    },
                },
                _ = close_rx.changed() => {
                    self.set_state(ConnState::Closed);
                    return None;
                },
            };

            if let Err(err) = self.dispatch(cmd, &links, hooks).await {
                hooks.on_error(Some(&self.info()), &err).await;
                self.set_state(ConnState::Closed);
                return Some(err);
            }
        }
    }

    /// Handle one inbound command. An `Err` is fatal to the connection.
    async fn dispatch(
        &self,
        cmd: Command,
        links: &ServiceLinks,
        hooks: &Arc<dyn EventHandler>,
    ) -> Result<(), ServerError> {
        match CommandKind::from_u8(cmd.kind) {
            Some(CommandKind::Data) => {
                if let Some(message) = cmd.message {
                    hooks.on_message(&self.info(), &message).await;
                }
            },

            Some(CommandKind::Forward) => {
                let req = self.parse_forward(cmd)?;
                if links.forward_tx.send(req).await.is_err() {
                    return Err(ServerError::Io(std::io::Error::new(
                        std::io::ErrorKind::BrokenPipe,
                        "forward channel closed",
                    )));
                }
            },

            Some(kind @ (CommandKind::Subscribe | CommandKind::Unsubscribe)) => {
                let req = SubscribeRequest {
                    service: self.service.clone(),
                    username: self.username.clone(),
                    params: cmd.header,
                    subscribe: kind == CommandKind::Subscribe,
                };
                if links.subscribe_tx.send(req).await.is_err() {
                    return Err(ServerError::Io(std::io::Error::new(
                        std::io::ErrorKind::BrokenPipe,
                        "subscribe channel closed",
                    )));
                }
            },

            Some(CommandKind::SetCompressThreshold) => {
                let raw = cmd.params.first().ok_or_else(|| {
                    ServerError::ProtocolViolation(
                        "set-compress-threshold without a value".to_owned(),
                    )
                })?;
                let threshold: i32 = raw.parse().map_err(|_| {
                    ServerError::ProtocolViolation(format!("bad compression threshold {raw:?}"))
                })?;
                self.compress_threshold.store(threshold, Ordering::Relaxed);
            },

            Some(CommandKind::MessageRetrieve) => {
                let id = cmd.params.first().ok_or_else(|| {
                    ServerError::ProtocolViolation("message-retrieve without an id".to_owned())
                })?;
                match links.cache.get(&self.service, &self.username, id).await {
                    Ok(Some(container)) => self.deliver_container(&container).await?,
                    Ok(None) => {
                        tracing::debug!(conn = %self.uniq_id, %id, "cached message not found");
                    },
                    Err(err) => {
                        hooks.on_error(Some(&self.info()), &ServerError::Cache(err)).await;
                    },
                }
            },

            Some(CommandKind::RetrieveAll) => {
                match links.cache.get_all(&self.service, &self.username, &cmd.params).await {
                    Ok(containers) => {
                        for container in &containers {
                            self.deliver_container(container).await?;
                        }
                    },
                    Err(err) => {
                        hooks.on_error(Some(&self.info()), &ServerError::Cache(err)).await;
                    },
                }
            },

            Some(CommandKind::SetVisibility) => {
                let flag = matches!(cmd.params.first().map(String::as_str), Some("1" | "true"));
                self.visible.store(flag, Ordering::Relaxed);
            },

            Some(CommandKind::MessageWithId) => {
                // Delivery commands only flow server -> client.
                tracing::debug!(conn = %self.uniq_id, "ignoring inbound delivery command");
            },

            None => {
                if cmd.kind & RESERVED_MASK != 0 {
                    return Err(ServerError::ProtocolViolation(format!(
                        "unsupported reserved command {:#04x}",
                        cmd.kind
                    )));
                }
                tracing::debug!(conn = %self.uniq_id, kind = cmd.kind, "ignoring unknown command");
            },
        }
        Ok(())
    }

    /// Wire params: `[ttl, receiver, service?]`; the message rides along.
    fn parse_forward(&self, cmd: Command) -> Result<ForwardRequest, ServerError> {
        if cmd.params.len() < 2 {
            return Err(ServerError::ProtocolViolation(
                "forward request needs ttl and receiver".to_owned(),
            ));
        }
        let ttl = parse_ttl(&cmd.params[0]).ok_or_else(|| {
            ServerError::ProtocolViolation(format!("bad forward ttl {:?}", cmd.params[0]))
        })?;
        let receiver = cmd.params[1].clone();
        if receiver.is_empty() {
            return Err(ServerError::ProtocolViolation(
                "forward request has an empty receiver".to_owned(),
            ));
        }
        let receiver_service = cmd
            .params
            .get(2)
            .filter(|s| !s.is_empty())
            .cloned()
            .unwrap_or_else(|| self.service.clone());

        Ok(ForwardRequest {
            receiver,
            receiver_service,
            ttl,
            dont_push: false,
            dont_ask: false,
            container: MessageContainer {
                id: String::new(),
                sender: self.username.clone(),
                sender_service: self.service.clone(),
                message: cmd.message.unwrap_or_default(),
            },
        })
    }

    /// Re-deliver a cached message, carrying the original sender identity
    /// in the command header.
    async fn deliver_container(&self, container: &MessageContainer) -> Result<(), ServerError> {
        let mut extra = HashMap::new();
        if !container.sender.is_empty() {
            extra.insert("sender".to_owned(), container.sender.clone());
        }
        if !container.sender_service.is_empty() {
            extra.insert("sender-service".to_owned(), container.sender_service.clone());
        }
        let extra = if extra.is_empty() { None } else { Some(&extra) };
        self.send_message(&container.message, &container.id, extra).await
    }
}

impl<S> std::fmt::Debug for Connection<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("uniq_id", &self.uniq_id)
            .field("service", &self.service)
            .field("username", &self.username)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
