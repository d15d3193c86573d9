//! Error types for the relay engine.
//!
//! One structured enum carries every failure from the innermost buffer
//! fault up through flow teardown to engine shutdown, so every layer
//! shares a vocabulary instead of passing around ad-hoc strings.

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the relay engine and its components.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O failure (socket, fd, file).
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// Fatal initialization failure: address parse, reactor create, netif add.
    #[error("initialization error: {message}")]
    Init { message: String },

    /// Per-flow setup failure (socket, fcntl, connect, reactor-add).
    #[error("flow setup error: {message}")]
    FlowSetup { message: String },

    /// Per-flow relay failure: bad read/write, SOCKS rejection, fatal stack error.
    #[error("flow relay error: {message}")]
    FlowRelay { message: String },

    /// A `StreamBuffer` write would exceed its fixed capacity.
    ///
    /// This is the backpressure signal: callers propagate it upward
    /// instead of growing the buffer or panicking.
    #[error("buffer full")]
    BufferFull,

    /// A `StreamBuffer` read would consume more than is available.
    #[error("short read: requested {requested}, available {available}")]
    ShortRead { requested: usize, available: usize },

    /// The embedded TCP/IP stack rejected an operation for a reason
    /// other than "send buffer full" (which is backpressure, not an error).
    #[error("stack error: {message}")]
    Stack { message: String },

    /// Configuration parse or validation failure.
    #[error("configuration error: {message}")]
    Config { message: String },

    /// The SOCKS4 server did not grant the CONNECT request.
    #[error("SOCKS4 request rejected (reply byte 1 = 0x{0:02x})")]
    SocksRejected(u8),

    /// A DNS relay query could not be admitted (table at capacity) or matched.
    #[error("DNS relay error: {message}")]
    Dns { message: String },
}

impl Error {
    pub fn init<S: Into<String>>(message: S) -> Self {
        Self::Init { message: message.into() }
    }

    pub fn flow_setup<S: Into<String>>(message: S) -> Self {
        Self::FlowSetup { message: message.into() }
    }

    pub fn flow_relay<S: Into<String>>(message: S) -> Self {
        Self::FlowRelay { message: message.into() }
    }

    pub fn stack<S: Into<String>>(message: S) -> Self {
        Self::Stack { message: message.into() }
    }

    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config { message: message.into() }
    }

    pub fn dns<S: Into<String>>(message: S) -> Self {
        Self::Dns { message: message.into() }
    }
}
