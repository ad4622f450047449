// Copyright 2020 Joyent, Inc.

//! Error types for the Fast client.
//!
//! All failures are represented by [`FastError`]. Errors that stem from
//! another error keep a reference to it, and the human-readable message of
//! the outer error embeds the message of its cause, e.g.
//! `request failed: client detached from transport`. Structured fields
//! (`reason`, `msgid`, `rpc_msgid`, `timeout`) are available through
//! accessors so callers never need to parse messages.

use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

/// Why a message was rejected as a protocol violation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProtocolReason {
    /// A response arrived for a msgid with no outstanding request.
    UnknownMsgid,
    /// A `null` entry was found in a response's data array.
    NullValue { ignore_null_values: bool },
    /// The payload's `d` field has the wrong shape for the message status.
    BadData,
    /// The frame header or payload encoding could not be parsed.
    BadFrame,
    /// The transport ended while a response was expected.
    UnexpectedEnd,
}

impl ProtocolReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolReason::UnknownMsgid => "unknown_msgid",
            ProtocolReason::NullValue { .. } => "null_value",
            ProtocolReason::BadData => "bad_data",
            ProtocolReason::BadFrame => "bad_frame",
            ProtocolReason::UnexpectedEnd => "unexpected_end",
        }
    }
}

impl fmt::Display for ProtocolReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FastErrorKind {
    Protocol,
    Transport,
    Request,
    Abandoned,
    Timeout,
    Server,
}

#[derive(Clone, Debug, Error)]
pub enum FastError {
    /// The peer violated the Fast protocol.
    #[error("{message}")]
    Protocol {
        reason: ProtocolReason,
        msgid: Option<u32>,
        message: String,
    },

    /// The transport failed, ended, or was detached from the client.
    #[error("{message}")]
    Transport {
        message: String,
        #[source]
        cause: Option<Arc<io::Error>>,
    },

    /// The failure delivered to one specific request.
    #[error("request failed: {cause}")]
    Request {
        rpc_msgid: u32,
        #[source]
        cause: Arc<FastError>,
    },

    /// The caller abandoned the request.
    #[error("request abandoned")]
    Abandoned,

    /// The request's deadline elapsed before it completed.
    #[error("request timed out after {} ms", .timeout.as_millis())]
    Timeout { timeout: Duration },

    /// The server completed the request with an ERROR message.
    #[error("{name}: {message}")]
    Server {
        name: String,
        message: String,
        info: Value,
    },
}

impl FastError {
    pub fn unknown_msgid(msgid: u32) -> FastError {
        FastError::Protocol {
            reason: ProtocolReason::UnknownMsgid,
            msgid: Some(msgid),
            message: format!(
                "fast protocol: received message with unknown msgid {}",
                msgid
            ),
        }
    }

    pub fn null_value(msgid: u32, ignore_null_values: bool) -> FastError {
        FastError::Protocol {
            reason: ProtocolReason::NullValue { ignore_null_values },
            msgid: Some(msgid),
            message: String::from("server sent \"null\" value"),
        }
    }

    pub fn bad_data(msgid: u32, message: String) -> FastError {
        FastError::Protocol {
            reason: ProtocolReason::BadData,
            msgid: Some(msgid),
            message: format!("fast protocol: {}", message),
        }
    }

    pub fn bad_frame(message: String) -> FastError {
        FastError::Protocol {
            reason: ProtocolReason::BadFrame,
            msgid: None,
            message: format!("fast protocol: {}", message),
        }
    }

    pub fn unexpected_end() -> FastError {
        FastError::Protocol {
            reason: ProtocolReason::UnexpectedEnd,
            msgid: None,
            message: String::from("unexpected end of transport stream"),
        }
    }

    /// The cause delivered to requests that were outstanding when the caller
    /// detached the client.
    pub fn client_detached() -> FastError {
        FastError::Transport {
            message: String::from("client detached from transport"),
            cause: None,
        }
    }

    /// The cause delivered to requests issued after the client detached.
    pub fn transport_detached() -> FastError {
        FastError::Transport {
            message: String::from("transport detached"),
            cause: None,
        }
    }

    pub fn request(rpc_msgid: u32, cause: Arc<FastError>) -> FastError {
        FastError::Request { rpc_msgid, cause }
    }

    /// Build a server error from the `d` object of an ERROR message.
    pub fn server(info: Value) -> FastError {
        let field = |key: &str| {
            info.get(key)
                .and_then(Value::as_str)
                .map(String::from)
                .unwrap_or_default()
        };
        FastError::Server {
            name: field("name"),
            message: field("message"),
            info,
        }
    }

    pub fn kind(&self) -> FastErrorKind {
        match self {
            FastError::Protocol { .. } => FastErrorKind::Protocol,
            FastError::Transport { .. } => FastErrorKind::Transport,
            FastError::Request { .. } => FastErrorKind::Request,
            FastError::Abandoned => FastErrorKind::Abandoned,
            FastError::Timeout { .. } => FastErrorKind::Timeout,
            FastError::Server { .. } => FastErrorKind::Server,
        }
    }

    pub fn reason(&self) -> Option<ProtocolReason> {
        match self {
            FastError::Protocol { reason, .. } => Some(*reason),
            _ => None,
        }
    }

    /// The msgid named by a protocol error, if any.
    pub fn msgid(&self) -> Option<u32> {
        match self {
            FastError::Protocol { msgid, .. } => *msgid,
            _ => None,
        }
    }

    pub fn rpc_msgid(&self) -> Option<u32> {
        match self {
            FastError::Request { rpc_msgid, .. } => Some(*rpc_msgid),
            _ => None,
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        match self {
            FastError::Timeout { timeout } => Some(*timeout),
            _ => None,
        }
    }

    /// The error this one wraps, when it wraps another `FastError`.
    pub fn cause(&self) -> Option<&FastError> {
        match self {
            FastError::Request { cause, .. } => Some(cause),
            _ => None,
        }
    }

    /// The underlying I/O error of a transport failure.
    pub fn io_cause(&self) -> Option<&io::Error> {
        match self {
            FastError::Transport { cause, .. } => cause.as_deref(),
            _ => None,
        }
    }
}

impl From<io::Error> for FastError {
    fn from(err: io::Error) -> FastError {
        FastError::Transport {
            message: format!("unexpected error on transport: {}", err),
            cause: Some(Arc::new(err)),
        }
    }
}
