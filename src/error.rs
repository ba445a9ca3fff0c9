//! Driver error types.
use bytes::{Buf, Bytes};

use crate::{ext::BytesExt, message::ProtocolError};

/// A specialized [`Result`] type for driver operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// All possible errors from this library.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Establishing a connection failed.
    #[error("connect failed: {0}")]
    Connect(#[from] ConnectError),

    /// Read or write on a broken or closed socket, or an unrecognized
    /// backend message. The connection is unusable afterwards.
    #[error("connection closed")]
    Closed,

    /// Decoding a backend message failed; message-boundary sync is lost.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The backend reported an error. Recoverable unless FATAL.
    #[error(transparent)]
    Db(#[from] Box<PgError>),

    /// An operation was started while another one owns the wire, or after
    /// the connection was closed.
    #[error("cannot lock connection: connection is {0}")]
    Lock(&'static str),

    /// The connection lock was released without being held.
    #[error("cannot unlock connection: connection is IDLE")]
    Unlock,

    /// Cancellation was observed before the backend had time to respond.
    #[error("operation cancelled")]
    Cancelled,

    /// Client-side argument validation failed.
    #[error("{0}")]
    InvalidArgument(&'static str),

    /// The SCRAM exchange was violated by either side.
    #[error(transparent)]
    Sasl(#[from] crate::scram::SaslError),

    /// The external configuration surface could not be parsed.
    #[error(transparent)]
    Config(#[from] crate::config::ConfigParseError),

    /// Caller-supplied I/O failed: a copy source or sink, or a notice /
    /// notification hook. Does not affect the connection itself.
    #[error("io: {0}")]
    Io(#[source] std::io::Error),
}

impl Error {
    /// The backend error, when this is a server-reported failure.
    pub fn as_db_error(&self) -> Option<&PgError> {
        match self {
            Self::Connect(ConnectError::Db(err)) => Some(err),
            Self::Db(err) => Some(err),
            _ => None,
        }
    }
}

/// An error while establishing a connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    /// Opening the TCP or Unix socket failed.
    #[error("socket: {0}")]
    Io(#[from] std::io::Error),

    /// The socket did not open within `connect_timeout`.
    #[error("connect timeout")]
    Timeout,

    /// The server refused TLS and the ssl mode does not allow plaintext.
    #[error("server refused TLS")]
    TlsRefused,

    /// TLS was requested for this host but no upgrade function is
    /// configured.
    #[error("tls requested but no upgrade function configured")]
    TlsMissingUpgrade,

    /// The TLS sentinel reply was neither `S` nor `N`.
    #[error("unexpected TLS reply 0x{0:02x}")]
    UnexpectedTlsReply(u8),

    /// A message that cannot occur at this point of the startup flow.
    #[error("unexpected {message} during {phase}")]
    UnexpectedMessage {
        message: &'static str,
        phase: &'static str,
    },

    /// The startup flow did not settle within its iteration bound.
    #[error("startup did not settle during {0}")]
    Unsettled(&'static str),

    /// The server requested an authentication scheme without a usable
    /// password.
    #[error("password required for authentication")]
    PasswordRequired,

    /// SASL negotiation offered no supported mechanism.
    #[error("no supported SASL mechanism in {0:?}")]
    NoSaslMechanism(Vec<String>),

    /// The server rejected the credentials or failed the session.
    #[error(transparent)]
    Db(Box<PgError>),

    /// Startup-phase wire error.
    #[error(transparent)]
    Protocol(ProtocolError),

    /// SCRAM exchange failure.
    #[error(transparent)]
    Sasl(crate::scram::SaslError),

    /// The connection dropped mid-startup.
    #[error("connection closed during startup")]
    Closed,

    /// An `after_connect` or `validate_connect` hook rejected the session.
    #[error("connect hook: {0}")]
    Hook(#[source] Box<Error>),

    /// The session does not satisfy the requested
    /// `target_session_attrs`.
    #[error("server does not satisfy target_session_attrs={0}")]
    SessionAttrs(&'static str),
}

impl ConnectError {
    /// Credential rejections abort host fallback instead of advancing to
    /// the next candidate.
    pub(crate) fn is_auth_rejection(&self) -> bool {
        matches!(&self, Self::Db(err) if err.code == "28P01" || err.code == "28000")
    }
}

impl From<Error> for ConnectError {
    fn from(err: Error) -> Self {
        match err {
            Error::Db(db) => Self::Db(db),
            Error::Protocol(p) => Self::Protocol(p),
            Error::Sasl(s) => Self::Sasl(s),
            Error::Closed => Self::Closed,
            Error::Connect(c) => c,
            other => Self::Hook(Box::new(other)),
        }
    }
}

/// A server-reported error or notice.
///
/// `ErrorResponse` and `NoticeResponse` share this field layout; a notice
/// is simply not raised as an error.
#[derive(Debug, Clone, Default)]
pub struct PgError {
    /// `ERROR`, `FATAL`, `PANIC`, or a notice severity.
    pub severity: String,
    /// The SQLSTATE code.
    pub code: String,
    /// Primary human-readable message.
    pub message: String,
    pub detail: Option<String>,
    pub hint: Option<String>,
    /// 1-based character offset into the query string.
    pub position: Option<u32>,
    pub internal_position: Option<u32>,
    pub internal_query: Option<String>,
    /// Call stack context of the error.
    pub where_: Option<String>,
    pub schema_name: Option<String>,
    pub table_name: Option<String>,
    pub column_name: Option<String>,
    pub data_type_name: Option<String>,
    pub constraint_name: Option<String>,
    /// Source file of the reporting server code.
    pub file: Option<String>,
    pub line: Option<u32>,
    pub routine: Option<String>,
}

/// An asynchronous warning. The frontend should display the message.
pub type Notice = PgError;

impl PgError {
    /// FATAL and PANIC responses terminate the session on the server side.
    pub fn is_fatal(&self) -> bool {
        self.severity == "FATAL" || self.severity == "PANIC"
    }

    /// Decode the field list of an `ErrorResponse` / `NoticeResponse`.
    ///
    /// Fields can appear in any order; unrecognized field types are
    /// silently ignored as the protocol requires.
    pub(crate) fn parse(mut body: Bytes) -> Self {
        let mut err = PgError::default();
        let mut localized_severity = None;

        while body.remaining() > 0 {
            let field = body.get_u8();
            if field == 0 {
                break;
            }
            let Some(value) = body.get_nul_string() else {
                break;
            };
            match field {
                b'S' => localized_severity = Some(value),
                b'V' => err.severity = value,
                b'C' => err.code = value,
                b'M' => err.message = value,
                b'D' => err.detail = Some(value),
                b'H' => err.hint = Some(value),
                b'P' => err.position = value.parse().ok(),
                b'p' => err.internal_position = value.parse().ok(),
                b'q' => err.internal_query = Some(value),
                b'W' => err.where_ = Some(value),
                b's' => err.schema_name = Some(value),
                b't' => err.table_name = Some(value),
                b'c' => err.column_name = Some(value),
                b'd' => err.data_type_name = Some(value),
                b'n' => err.constraint_name = Some(value),
                b'F' => err.file = Some(value),
                b'L' => err.line = value.parse().ok(),
                b'R' => err.routine = Some(value),
                _ => {}
            }
        }

        // 'V' is the non-localized severity, present since 9.6; prefer it
        if err.severity.is_empty() {
            err.severity = localized_severity.unwrap_or_default();
        }
        err
    }
}

impl std::error::Error for PgError { }

impl std::fmt::Display for PgError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {} (SQLSTATE {})", self.severity, self.message, self.code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_prefers_nonlocalized_severity() {
        let body = Bytes::from_static(b"SFEHLER\0VFATAL\0C28P01\0Mnope\0\0");
        let err = PgError::parse(body);
        assert_eq!(err.severity, "FATAL");
        assert!(err.is_fatal());
    }

    #[test]
    fn display_carries_sqlstate() {
        let err = PgError {
            severity: "ERROR".into(),
            code: "57014".into(),
            message: "canceling statement due to user request".into(),
            ..Default::default()
        };
        assert!(err.to_string().contains("SQLSTATE 57014"));
    }

    #[test]
    fn auth_rejection_classification() {
        let mut err = PgError { code: "28P01".into(), ..Default::default() };
        assert!(ConnectError::Db(Box::new(err.clone())).is_auth_rejection());
        err.code = "08006".into();
        assert!(!ConnectError::Db(Box::new(err)).is_auth_rejection());
    }
}
