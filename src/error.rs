//! Error taxonomy shared by every bridge component.

use std::io;

use thiserror::Error;

/// Failures produced while encoding or decoding wire frames.
#[derive(Error, Debug)]
pub enum CodecError {
    /// A frame's length prefix exceeded the per-channel cap.
    #[error("frame of {len} bytes exceeds the {cap} byte channel cap")]
    FrameTooLarge {
        /// Length announced by the prefix.
        len: u64,
        /// Cap configured for the channel.
        cap: u64,
    },

    /// The payload could not be (de)serialised: truncated body, unknown
    /// discriminant, or a string that is not valid UTF-8.
    #[error("malformed payload: {0}")]
    Payload(#[from] bincode::Error),
}

/// Top level error type for every bridge operation.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// A frame failed to encode or decode.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// The underlying socket or shared memory file failed.
    #[error("transport failure: {0}")]
    Transport(#[from] io::Error),

    /// The foreign host did not connect every channel in time.
    #[error("timed out waiting for the foreign host process to connect")]
    HandshakeTimeout,

    /// The foreign host exited before the handshake completed.
    #[error("foreign host process exited during startup with status {0}")]
    HostExited(i32),

    /// The remote side answered with a response shape the request does not
    /// allow.
    #[error("protocol violation: {0}")]
    Protocol(&'static str),

    /// A message referenced an instance id with no live object behind it.
    #[error("unknown instance id {0}")]
    UnknownInstance(u64),
}

/// Bridge result alias.
pub type Result<T> = std::result::Result<T, BridgeError>;

impl BridgeError {
    /// Whether the channel that produced this error is unusable from now on.
    ///
    /// Codec and transport failures poison the channel; everything else
    /// stays local to the call in progress.
    pub fn is_fatal(&self) -> bool {
        matches!(self, BridgeError::Codec(_) | BridgeError::Transport(_))
    }
}
