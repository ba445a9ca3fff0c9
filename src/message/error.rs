//! Codec errors.

/// An error while translating a buffer from the backend.
///
/// Once raised, message-boundary synchronization is lost and the caller
/// must close the connection.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// The backend sent a message type this driver does not recognize.
    #[error("unknown backend message type 0x{0:02x}")]
    UnknownMessage(u8),

    /// The backend requested an authentication scheme this driver does not
    /// recognize.
    #[error("unknown authentication request code {0}")]
    UnknownAuth(i32),

    /// The length field of a frame cannot be valid.
    #[error("impossible length {len} for message type 0x{msgtype:02x}")]
    InvalidLength { msgtype: u8, len: i32 },

    /// A message body did not match its documented layout.
    #[error("malformed {0} message")]
    Malformed(&'static str),
}
