//! The error-kind taxonomy shared by the codec, the upstream client, the
//! session store, and the dispatcher.
//!
//! Kinds are concrete variants rather than strings so callers can match on
//! them (e.g. the dispatcher treats `RetryCooldown` as "this candidate is
//! unavailable, try the next one" while `MalformedFrame` is fatal for the
//! whole connection).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("stream closed before {expected} bytes could be read (got {got})")]
    StreamClosed { expected: usize, got: usize },

    #[error(transparent)]
    Codec(#[from] passport_protocol::CodecError),

    #[error("response sequence id did not match request")]
    SequenceMismatch,

    #[error("connect to {host}:{port} refused, cooldown active for another {remaining_secs}s")]
    RetryCooldown {
        host: String,
        port: u16,
        remaining_secs: u64,
    },

    #[error("connect to {host}:{port} did not complete within {timeout_secs}s")]
    ConnectTimeout {
        host: String,
        port: u16,
        timeout_secs: u64,
    },

    #[error("no response from {host}:{port} within {timeout_secs}s")]
    ResponseTimeout {
        host: String,
        port: u16,
        timeout_secs: u64,
    },

    #[error("all candidate upstreams failed for this request")]
    DispatchExhausted,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("session store error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("session store integrity check failed: {0}")]
    IntegrityCheckFailed(String),
}

pub type ProxyResult<T> = Result<T, ProxyError>;
