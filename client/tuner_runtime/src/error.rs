use crate::param::ParamId;
use thiserror::Error;

/// A frame that could not be applied. The frame is skipped and existing
/// state is left exactly as it was before the frame arrived.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame too large: {len} > {max}")]
    FrameTooLarge { len: usize, max: usize },

    #[error("msgpack decode failed: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("json decode failed: {0}")]
    DecodeText(#[from] serde_json::Error),

    #[error("msgpack encode failed: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("unrecognized message shape: {0}")]
    UnknownShape(String),

    #[error("malformed {what}: {reason}")]
    Malformed { what: &'static str, reason: String },

    #[error("malformed parameter {id}: {reason}")]
    MalformedParam { id: ParamId, reason: String },

    #[error("duplicate parameter id {0} in node description")]
    DuplicateParamId(ParamId),

    #[error("patch references unknown parameter id {0}")]
    UnknownParamId(ParamId),

    #[error("patch for parameter {0} tries to replace its children")]
    PatchReplacesChildren(ParamId),

    #[error("{0} received while no node is connected")]
    NoCurrentNode(&'static str),

    #[error("telemetry scope index {index} out of range ({len} scopes)")]
    ScopeOutOfRange { index: usize, len: usize },

    #[error("telemetry for scope '{scope}' has {got} series, expected {expected}")]
    SeriesCountMismatch {
        scope: String,
        expected: usize,
        got: usize,
    },

    #[error("telemetry for scope '{scope}': series {series} has {got} samples, time axis has {expected}")]
    SampleCountMismatch {
        scope: String,
        series: usize,
        expected: usize,
        got: usize,
    },

    #[error("telemetry for scope '{scope}' goes back in time: {time} after {previous}")]
    TimeNotMonotonic {
        scope: String,
        previous: f64,
        time: f64,
    },
}

impl ProtocolError {
    pub(crate) fn malformed(what: &'static str, reason: impl Into<String>) -> Self {
        Self::Malformed {
            what,
            reason: reason.into(),
        }
    }
}

/// Terminal failures of the socket. The core never retries.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] Box<tungstenite::Error>),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection closed")]
    Closed,
}

impl From<tungstenite::Error> for TransportError {
    fn from(err: tungstenite::Error) -> Self {
        match err {
            tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
                Self::Closed
            }
            tungstenite::Error::Io(io) => Self::Io(io),
            other => Self::WebSocket(Box::new(other)),
        }
    }
}

/// A local edit that does not fit the parameter it targets.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParamError {
    #[error("parameter {id} expects a {expected} value")]
    KindMismatch { id: ParamId, expected: &'static str },

    #[error("parameter {id} expects {expected} components, got {got}")]
    VectorLength {
        id: ParamId,
        expected: usize,
        got: usize,
    },

    #[error("value is not one of the options of parameter {id}")]
    NotAnOption { id: ParamId },

    #[error("parameter {id} is a group and has no value of its own")]
    GroupHasNoValue { id: ParamId },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid websocket url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
}
