use thiserror::Error;

/// Errors raised while pulling frames out of a byte stream.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
}

/// Errors raised by a transport worker's connect/read/write cycle.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to open transport: {0}")]
    OpenFailed(String),
    #[error("read failed: {0}")]
    ReadFailed(String),
    #[error("write failed: {0}")]
    WriteFailed(String),
    #[error("frame dropped: {0}")]
    Malformed(#[from] FrameError),
    #[error("out queue full, packet dropped")]
    QueueFull,
}

/// Errors raised while decoding an inbound MQTT command payload.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("invalid command JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("unknown command shape: {0}")]
    UnknownShape(String),
    #[error("unresolvable MAV_CMD: {0}")]
    UnknownMavCmd(String),
    #[error("missing target device_id or sysid")]
    NoTarget,
}

/// Errors raised by the mission upload/download state machines.
#[derive(Debug, Error)]
pub enum MissionError {
    #[error("mission FSM timed out after {0:?} of inactivity")]
    Timeout(std::time::Duration),
    #[error("unexpected seq {got}, expected one of the outstanding holes")]
    UnexpectedSeq { got: u16 },
    #[error("canonical hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },
    #[error("mission aborted: {0}")]
    Aborted(String),
}
