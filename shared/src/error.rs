//! Error types shared by the tunnel server and client.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Control channel read/write failed; fatal to every stream on the tunnel
    #[error("Transport error: {0}")]
    Transport(String),

    /// Per-stream deadline elapsed; carries what was being waited on
    #[error("{0} timed out")]
    Timeout(&'static str),

    /// Local target (HTTP/TCP/WS) failed on the private side
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// No tunnel available or routing was ambiguous
    #[error("Routing error: {0}")]
    Routing(String),

    /// Unknown or malformed frame
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Invalid or incomplete configuration
    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
