use std::future::Future;

use anyhow::Result as AnyhowResult;
use log::error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};

use crate::dispatch::{ClientEvent, Dispatcher, ReplySender};
use crate::error::ClientError;
use crate::resp::RespValue;

enum ConnectionMessage {
    Send {
        command: String,
        parameters: Vec<String>,
        reply: ReplySender,
    },
    Shutdown,
}

/// Owns the socket and the per-connection dispatcher. Encoding/writing and
/// decoding/dispatch all run inside this single task, so client state is
/// never mutated from two execution contexts.
struct ConnectionHandler {
    stream: TcpStream,
    dispatcher: Dispatcher,
    receiver: mpsc::UnboundedReceiver<ConnectionMessage>,
}

impl ConnectionHandler {
    fn new(
        stream: TcpStream,
        dispatcher: Dispatcher,
        receiver: mpsc::UnboundedReceiver<ConnectionMessage>,
    ) -> Self {
        Self {
            stream,
            dispatcher,
            receiver,
        }
    }

    async fn run(mut self) -> AnyhowResult<()> {
        let hello = self.dispatcher.start_handshake();
        self.write(&hello).await?;

        let mut buffer = [0u8; 8192];
        let mut had_error = false;

        loop {
            tokio::select! {
                result = self.stream.read(&mut buffer) => {
                    match result {
                        Ok(0) => {
                            self.dispatcher.emit(ClientEvent::End);
                            break;
                        }
                        Ok(n) => {
                            if let Err(e) = self.dispatcher.ingest(&buffer[..n]) {
                                self.dispatcher.emit(ClientEvent::Error(e.to_string()));
                                had_error = true;
                                break;
                            }
                        }
                        Err(e) => {
                            self.dispatcher.emit(ClientEvent::Error(e.to_string()));
                            had_error = true;
                            break;
                        }
                    }
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(ConnectionMessage::Send { command, parameters, reply }) => {
                            // A gated command yields no bytes; its reply
                            // sender was already rejected.
                            if let Some(bytes) = self.dispatcher.submit(command, parameters, reply) {
                                if let Err(e) = self.write(&bytes).await {
                                    self.dispatcher.emit(ClientEvent::Error(e.to_string()));
                                    had_error = true;
                                    break;
                                }
                            }
                        }
                        Some(ConnectionMessage::Shutdown) | None => {
                            break;
                        }
                    }
                }
            }
        }

        self.dispatcher.fail_all();
        self.dispatcher.emit(ClientEvent::Close { had_error });
        Ok(())
    }

    async fn write(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.stream.write_all(bytes).await?;
        self.stream.flush().await
    }
}

/// Handle to one connection. Cloning shares the same connection; separate
/// `connect` calls are fully isolated from each other.
#[derive(Debug, Clone)]
pub struct Client {
    sender: mpsc::UnboundedSender<ConnectionMessage>,
}

/// Opens a TCP connection and spawns its connection task. The returned
/// receiver carries ready/message/pmessage/invalidate/error/end/close
/// notifications; the handshake reply arrives as `ClientEvent::Ready`.
pub async fn connect(
    host: &str,
    port: u16,
) -> Result<(Client, mpsc::UnboundedReceiver<ClientEvent>), ClientError> {
    let stream = TcpStream::connect((host, port)).await?;
    stream.set_nodelay(true)?;

    let (sender, receiver) = mpsc::unbounded_channel();
    let (events_tx, events_rx) = mpsc::unbounded_channel();

    let handler = ConnectionHandler::new(stream, Dispatcher::new(events_tx), receiver);
    tokio::spawn(async move {
        if let Err(e) = handler.run().await {
            error!("connection handler error: {}", e);
        }
    });

    Ok((Client { sender }, events_rx))
}

impl Client {
    /// Issues one command. The command is submitted immediately, so
    /// several `exec` calls may be made without awaiting earlier results;
    /// their futures resolve in exactly the order the calls were made
    /// (the peer replies in request order). Push messages interleaving
    /// with the replies do not disturb that correlation.
    pub fn exec(
        &self,
        command: &str,
        parameters: &[&str],
    ) -> impl Future<Output = Result<RespValue, ClientError>> {
        let (reply, receiver) = oneshot::channel();
        let submitted = self
            .sender
            .send(ConnectionMessage::Send {
                command: command.to_string(),
                parameters: parameters.iter().map(|s| s.to_string()).collect(),
                reply,
            })
            .is_ok();

        async move {
            if !submitted {
                return Err(ClientError::ConnectionClosed);
            }
            match receiver.await {
                Ok(result) => result,
                Err(_) => Err(ClientError::ConnectionClosed),
            }
        }
    }

    /// Tears the connection down. All outstanding commands are rejected
    /// with `ClientError::ConnectionClosed`.
    pub fn close(&self) {
        let _ = self.sender.send(ConnectionMessage::Shutdown);
    }
}
