use thiserror::Error;

/// Error code for commands refused by the subscribed-mode gate.
pub const ERR_UNEXPECTED_COMMAND: &str = "ERR_UNEXPECTED_COMMAND";

#[derive(Debug, Error)]
pub enum ClientError {
    /// The command is not allowed while the connection is in subscribed
    /// mode. Nothing was written to the socket.
    #[error("ERR_UNEXPECTED_COMMAND: command \"{command}\" is not allowed while subscribed")]
    UnexpectedCommand { command: String },

    /// The server replied to the command with an error value.
    #[error("server error: {0}")]
    Server(String),

    /// The peer violated the protocol (bad framing, reply with no pending
    /// command). Fatal for the connection.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The connection was torn down before the command's reply arrived.
    #[error("connection closed")]
    ConnectionClosed,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ClientError {
    /// Stable error code, where one exists.
    pub fn code(&self) -> Option<&'static str> {
        match self {
            ClientError::UnexpectedCommand { .. } => Some(ERR_UNEXPECTED_COMMAND),
            _ => None,
        }
    }
}
