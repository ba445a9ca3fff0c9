//! Low-level PostgreSQL v3 wire protocol driver.
//!
//! A single-connection, non-pooled frontend: it issues simple and
//! extended queries, streams results and bulk COPY data, transports
//! asynchronous notifications, and handles session-level events. It is
//! intended to sit under a higher-level query builder or pool; it is not
//! a pool itself.
//!
//! # Examples
//!
//! Simple protocol:
//!
//! ```no_run
//! use postwire::Connection;
//!
//! # async fn app() -> postwire::Result<()> {
//! let mut conn = Connection::connect("host=localhost user=postgres").await?;
//!
//! let mut reader = conn.exec("select 'Hello, world'", None).await?;
//! let results = reader.read_all().await?;
//!
//! assert_eq!(results[0].tag.as_str(), "SELECT 1");
//! assert_eq!(results[0].rows[0][0].as_deref(), Some(&b"Hello, world"[..]));
//! # Ok(())
//! # }
//! ```
//!
//! Extended protocol with parameters:
//!
//! ```no_run
//! use postwire::Connection;
//!
//! # async fn app() -> postwire::Result<()> {
//! let mut conn = Connection::connect_env().await?;
//!
//! let mut reader = conn
//!     .exec_params("select $1::text as msg", &[Some(&b"Hello, world"[..])], &[], &[], &[], None)
//!     .await?;
//! let result = reader.result().await?;
//!
//! assert_eq!(result.fields[0].name, "msg");
//! # Ok(())
//! # }
//! ```
//!
//! Cancelling a slow query:
//!
//! ```no_run
//! use postwire::{CancellationToken, Connection};
//!
//! # async fn app() -> postwire::Result<()> {
//! # let mut conn = Connection::connect_env().await?;
//! let token = CancellationToken::new();
//! let handle = token.clone();
//! # let _ = handle;
//! let err = conn
//!     .exec("select pg_sleep(60)", Some(token))
//!     .await?
//!     .read_all()
//!     .await
//!     .unwrap_err();
//! // the server reports SQLSTATE 57014 once the cancel lands
//! # let _ = err;
//! # Ok(())
//! # }
//! ```
mod ext;

// Protocol
pub mod message;
mod scram;

// Connection
pub mod config;
mod connect;
mod connection;
mod net;

// Operations
mod copy;
mod extended;
mod simple;
mod statement;

mod error;

pub use config::{
    Config, ConfigParseError, ConnectHook, HostConfig, Hooks, NoticeHook, NotificationHook,
    SslMode, TargetSessionAttrs, TlsConfig, TlsUpgrade,
};
pub use connection::{Connection, Status};
pub use error::{ConnectError, Error, Notice, PgError, Result};
pub use extended::ExtendedResultReader;
pub use message::{BackendMessage, FieldDescription, Format, Notification, Oid, ProtocolError};
pub use net::{RawStream, RemoteAddr, Stream};
pub use scram::SaslError;
pub use simple::{MultiResultReader, QueryResult, ResultReaderSimple};
pub use statement::{CommandTag, StatementDescription};

// The cancellation handle accepted by every cancellable operation.
pub use tokio_util::sync::CancellationToken;
