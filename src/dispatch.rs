use std::collections::{HashSet, VecDeque};

use log::{debug, warn};
use tokio::sync::{mpsc, oneshot};

use crate::error::ClientError;
use crate::resp::{encode_command, MessageBuffer, RespValue};

/// Commands a client may still issue while in subscribed mode.
const SUBSCRIBED_ALLOWED_COMMANDS: [&str; 9] = [
    "subscribe",
    "ssubscribe",
    "psubscribe",
    "unsubscribe",
    "sunsubscribe",
    "punsubscribe",
    "ping",
    "reset",
    "quit",
];

fn allowed_while_subscribed(command: &str) -> bool {
    SUBSCRIBED_ALLOWED_COMMANDS
        .iter()
        .any(|allowed| command.eq_ignore_ascii_case(allowed))
}

pub type ReplySender = oneshot::Sender<Result<RespValue, ClientError>>;

/// A command written to the socket whose reply has not yet arrived.
/// `command: None` marks the connection handshake, which has no
/// user-visible command string.
struct PendingCommand {
    command: Option<String>,
    parameters: Vec<String>,
    reply: ReplySender,
}

/// Out-of-band notifications surfaced to the caller, mirroring the
/// connection's `ready`/`message`/`pmessage`/`invalidate`/`error`/`end`/
/// `close` events.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// Handshake completed; carries the server's hello reply map.
    Ready(RespValue),
    /// Pub/sub message on a subscribed channel.
    Message { channel: String, payload: RespValue },
    /// Pub/sub message delivered through a pattern subscription.
    PatternMessage {
        pattern: String,
        channel: String,
        payload: RespValue,
    },
    /// Client-side caching invalidation; the listed keys must be dropped
    /// from any local cache.
    Invalidate(Vec<String>),
    /// Transport or protocol failure; the connection is going down.
    Error(String),
    /// Peer closed its write side.
    End,
    Close { had_error: bool },
}

/// Per-connection protocol state machine. Owns the pending-command FIFO,
/// classifies every decoded value as a reply or a push, tracks the
/// subscribed-mode state, and gates commands before any bytes are written.
///
/// The dispatcher never touches a socket; the connection task feeds it
/// inbound bytes and writes whatever `submit`/`start_handshake` return.
/// Each connection owns exactly one dispatcher, so no state is shared
/// across connections.
pub struct Dispatcher {
    buffer: MessageBuffer,
    pending: VecDeque<PendingCommand>,
    ready: bool,
    subscribed: bool,
    subscribed_channels: HashSet<String>,
    events: mpsc::UnboundedSender<ClientEvent>,
}

impl Dispatcher {
    pub fn new(events: mpsc::UnboundedSender<ClientEvent>) -> Self {
        Self {
            buffer: MessageBuffer::new(),
            pending: VecDeque::new(),
            ready: false,
            subscribed: false,
            subscribed_channels: HashSet::new(),
            events,
        }
    }

    pub fn ready(&self) -> bool {
        self.ready
    }

    pub fn subscribed(&self) -> bool {
        self.subscribed
    }

    pub fn subscribed_channels(&self) -> &HashSet<String> {
        &self.subscribed_channels
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Enqueues the handshake entry and returns the protocol-negotiation
    /// request selecting RESP protocol version 3.
    pub fn start_handshake(&mut self) -> Vec<u8> {
        let (reply, _discard) = oneshot::channel();
        self.pending.push_back(PendingCommand {
            command: None,
            parameters: Vec::new(),
            reply,
        });
        encode_command("HELLO", &["3"])
    }

    /// Gates, encodes, and enqueues one command. Returns the bytes to
    /// write, or `None` when the command was rejected by the subscribed-
    /// mode gate (the reply sender has then already been consumed and
    /// nothing may be written).
    pub fn submit(
        &mut self,
        command: String,
        parameters: Vec<String>,
        reply: ReplySender,
    ) -> Option<Vec<u8>> {
        if self.subscribed && !allowed_while_subscribed(&command) {
            debug!("gate rejected command {} while subscribed", command);
            let _ = reply.send(Err(ClientError::UnexpectedCommand { command }));
            return None;
        }
        let bytes = encode_command(&command, &parameters);
        self.pending.push_back(PendingCommand {
            command: Some(command),
            parameters,
            reply,
        });
        Some(bytes)
    }

    /// Feeds inbound socket bytes through the decoder and dispatches every
    /// value that completed. A decode error or a reply arriving against an
    /// empty pending queue is fatal for the connection.
    pub fn ingest(&mut self, data: &[u8]) -> Result<(), ClientError> {
        self.buffer.add_data(data);
        loop {
            match self.buffer.try_decode() {
                Ok(Some(value)) => self.dispatch(value)?,
                Ok(None) => return Ok(()),
                Err(e) => return Err(ClientError::Protocol(e.to_string())),
            }
        }
    }

    fn dispatch(&mut self, value: RespValue) -> Result<(), ClientError> {
        if let RespValue::Push(items) = value {
            self.route_push(items);
            return Ok(());
        }
        // Replies resolve strictly in write order; the peer answering a
        // command we never sent is a framing bug or peer misbehavior.
        let pending = self.pending.pop_front().ok_or_else(|| {
            ClientError::Protocol("reply received with no pending command".to_string())
        })?;
        // The handshake entry has no caller awaiting it; a server that
        // rejects HELLO (e.g. a RESP2-only peer answering -NOPROTO)
        // leaves the connection unusable, so the rejection is fatal
        // instead of being routed into the discarded handshake reply.
        if !self.ready && pending.command.is_none() {
            if let RespValue::Error(message) = value {
                return Err(ClientError::Protocol(format!(
                    "handshake rejected: {}",
                    message
                )));
            }
        }
        if !self.ready && is_handshake_reply(&value) {
            self.ready = true;
            let _ = self.events.send(ClientEvent::Ready(value.clone()));
            let _ = pending.reply.send(Ok(value));
            return Ok(());
        }
        match value {
            RespValue::Error(message) => {
                let _ = pending.reply.send(Err(ClientError::Server(message)));
            }
            other => {
                let _ = pending.reply.send(Ok(other));
            }
        }
        Ok(())
    }

    /// Routes one push message. Pushes are never correlated with pending
    /// commands, so pipelined replies stay aligned no matter where a push
    /// interleaves.
    fn route_push(&mut self, items: Vec<RespValue>) {
        let mut items = items.into_iter();
        let kind = match items.next() {
            Some(RespValue::Text(kind)) => kind,
            other => {
                warn!("push message without a text kind: {:?}", other);
                return;
            }
        };
        match kind.as_str() {
            "message" => {
                let channel = match items.next().as_ref().and_then(RespValue::as_text) {
                    Some(channel) => channel.to_string(),
                    None => {
                        warn!("message push without channel");
                        return;
                    }
                };
                let payload = items.next().unwrap_or(RespValue::Null);
                let _ = self.events.send(ClientEvent::Message { channel, payload });
            }
            "pmessage" => {
                let pattern = match items.next().as_ref().and_then(RespValue::as_text) {
                    Some(pattern) => pattern.to_string(),
                    None => {
                        warn!("pmessage push without pattern");
                        return;
                    }
                };
                let channel = match items.next().as_ref().and_then(RespValue::as_text) {
                    Some(channel) => channel.to_string(),
                    None => {
                        warn!("pmessage push without channel");
                        return;
                    }
                };
                let payload = items.next().unwrap_or(RespValue::Null);
                let _ = self.events.send(ClientEvent::PatternMessage {
                    pattern,
                    channel,
                    payload,
                });
            }
            "invalidate" => {
                // A null payload means the server flushed everything it
                // was tracking; surfaced as an empty key list.
                let keys = match items.next() {
                    Some(RespValue::Array(keys)) => keys
                        .iter()
                        .filter_map(|key| key.as_text().map(str::to_string))
                        .collect(),
                    _ => Vec::new(),
                };
                let _ = self.events.send(ClientEvent::Invalidate(keys));
            }
            "subscribe" | "ssubscribe" | "psubscribe" => {
                self.apply_subscription_ack(true, items.next(), items.next());
            }
            "unsubscribe" | "sunsubscribe" | "punsubscribe" => {
                self.apply_subscription_ack(false, items.next(), items.next());
            }
            other => {
                debug!("ignoring push of kind {}", other);
            }
        }
    }

    fn apply_subscription_ack(
        &mut self,
        subscribing: bool,
        channel: Option<RespValue>,
        count: Option<RespValue>,
    ) {
        let channel = match channel.as_ref().and_then(RespValue::as_text) {
            Some(channel) => channel.to_string(),
            None => {
                warn!("subscription ack without channel");
                return;
            }
        };
        let count = match count.as_ref().and_then(RespValue::as_integer) {
            Some(count) => count,
            None => {
                warn!("subscription ack without channel count");
                return;
            }
        };
        if subscribing {
            self.subscribed_channels.insert(channel);
            if count > 0 {
                self.subscribed = true;
            }
        } else {
            self.subscribed_channels.remove(&channel);
            if count == 0 {
                self.subscribed = false;
            }
        }
    }

    /// Rejects every outstanding command so no caller is left waiting
    /// after the connection goes down.
    pub fn fail_all(&mut self) {
        for pending in self.pending.drain(..) {
            if let Some(command) = &pending.command {
                debug!(
                    "rejecting pending command {} {:?}: connection closed",
                    command, pending.parameters
                );
            }
            let _ = pending.reply.send(Err(ClientError::ConnectionClosed));
        }
    }

    pub fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }
}

fn is_handshake_reply(value: &RespValue) -> bool {
    let has_server = value
        .map_get("server")
        .and_then(RespValue::as_text)
        .is_some();
    let proto = value.map_get("proto").and_then(RespValue::as_integer);
    has_server && proto == Some(3)
}
