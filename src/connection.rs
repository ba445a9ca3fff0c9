//! Connection core: status machine, receive primitive, recovery.
use std::{collections::HashMap, time::Duration};

use bytes::BytesMut;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio_util::sync::CancellationToken;

use crate::{
    config::{Config, Hooks},
    error::{Error, Result},
    message::{
        frontend::{self, FrontendMessage},
        BackendMessage, MessageReader, Notification,
    },
    net::{RemoteAddr, Stream},
};

/// Lifecycle status of a [`Connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// No operation owns the wire; the server has sent `ReadyForQuery`.
    Idle,
    /// A reader currently owns the wire.
    Busy,
    /// Terminal; no operation resets it.
    Closed,
}

/// A single PostgreSQL session.
///
/// The connection is exclusive-use: each operation locks the wire until
/// its reader is consumed or closed, and the connection is not safe for
/// concurrent use. A higher-level pool is expected to own it.
pub struct Connection {
    pub(crate) reader: MessageReader<ReadHalf<Stream>>,
    pub(crate) writer: WriteHalf<Stream>,
    pub(crate) write_buf: BytesMut,

    status: Status,
    /// `ReadyForQuery` messages owed to the wire by readers that were
    /// dropped before completion; drained before the next operation.
    pending_sync: u32,

    process_id: i32,
    secret_key: i32,
    tx_status: u8,
    parameters: HashMap<String, String>,

    remote: RemoteAddr,
    connect_timeout: Duration,
    pub(crate) hooks: Hooks,
}

impl Connection {
    pub(crate) fn new(stream: Stream, remote: RemoteAddr, config: &Config) -> Self {
        let (read, write) = tokio::io::split(stream);
        Self {
            reader: MessageReader::new(read, config.min_read_buffer_size),
            writer: write,
            write_buf: BytesMut::with_capacity(1024),
            status: Status::Idle,
            pending_sync: 0,
            process_id: 0,
            secret_key: 0,
            tx_status: 0,
            parameters: HashMap::new(),
            remote,
            connect_timeout: config.connect_timeout,
            hooks: config.hooks.clone(),
        }
    }

    /// Current lifecycle status.
    pub fn status(&self) -> Status {
        self.status
    }

    /// Backend process ID, for `CancelRequest`.
    pub fn process_id(&self) -> i32 {
        self.process_id
    }

    /// Backend secret key, for `CancelRequest`.
    pub fn secret_key(&self) -> i32 {
        self.secret_key
    }

    /// The transaction status byte of the last `ReadyForQuery`:
    /// `I` idle, `T` in transaction, `E` in failed transaction.
    pub fn tx_status(&self) -> u8 {
        self.tx_status
    }

    /// A server parameter reported via `ParameterStatus`.
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(String::as_str)
    }

    pub(crate) fn set_backend_key(&mut self, process_id: i32, secret_key: i32) {
        self.process_id = process_id;
        self.secret_key = secret_key;
    }

    // ===== wire primitives =====

    /// Buffer a frontend message; [`flush`][Self::flush] sends it.
    pub(crate) fn send<F: FrontendMessage>(&mut self, message: &F) {
        frontend::write(message, &mut self.write_buf);
    }

    /// Write all buffered messages to the socket.
    ///
    /// A write failure closes the connection: the position inside the
    /// request group is unknowable afterwards.
    pub(crate) async fn flush(&mut self) -> Result<()> {
        if self.write_buf.is_empty() {
            return Ok(());
        }
        let buf = self.write_buf.split();
        match self.writer.write_all(&buf).await {
            Ok(()) => Ok(()),
            Err(err) => {
                tracing::debug!("socket write failed: {err}");
                self.close_now();
                Err(Error::Closed)
            }
        }
    }

    /// Read the next backend message, applying the standard side effects
    /// before returning it:
    ///
    /// - `ParameterStatus` updates the parameter map;
    /// - `ReadyForQuery` updates the transaction status;
    /// - `NoticeResponse` / `NotificationResponse` dispatch to the
    ///   configured hooks;
    /// - `ErrorResponse` closes the connection when FATAL, then surfaces
    ///   as [`Error::Db`];
    /// - any codec or stream failure closes the connection.
    pub async fn receive_message(
        &mut self,
        cancel: Option<&CancellationToken>,
    ) -> Result<BackendMessage> {
        let (msgtype, body) = match self.reader.receive(cancel).await {
            Ok(frame) => frame,
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(err) => {
                self.close_now();
                return Err(err);
            }
        };
        self.handle_frame(msgtype, body)
    }

    /// Decode one raw frame and apply the standard side effects.
    ///
    /// Split out of [`receive_message`][Self::receive_message] for the
    /// COPY driver, which reads frames while concurrently forwarding its
    /// source.
    pub(crate) fn handle_frame(
        &mut self,
        msgtype: u8,
        body: bytes::Bytes,
    ) -> Result<BackendMessage> {
        let message = match BackendMessage::decode(msgtype, body) {
            Ok(message) => message,
            Err(err) => {
                self.close_now();
                return Err(err.into());
            }
        };
        tracing::trace!("(B) {}", message.name());

        match message {
            BackendMessage::ParameterStatus { name, value } => {
                let message = BackendMessage::ParameterStatus {
                    name: name.clone(),
                    value: value.clone(),
                };
                self.parameters.insert(name, value);
                Ok(message)
            }
            BackendMessage::ReadyForQuery(status) => {
                self.tx_status = status;
                Ok(BackendMessage::ReadyForQuery(status))
            }
            BackendMessage::NoticeResponse(notice) => {
                match &self.hooks.on_notice {
                    Some(hook) => hook((*notice).clone())
                        .map_err(|err| Error::Io(std::io::Error::other(err)))?,
                    None => tracing::warn!("{notice}"),
                }
                Ok(BackendMessage::NoticeResponse(notice))
            }
            BackendMessage::NotificationResponse(notification) => {
                if let Some(hook) = &self.hooks.on_notification {
                    hook(notification.clone())
                        .map_err(|err| Error::Io(std::io::Error::other(err)))?;
                }
                Ok(BackendMessage::NotificationResponse(notification))
            }
            BackendMessage::ErrorResponse(err) => {
                if err.is_fatal() {
                    self.close_now();
                }
                Err(Error::Db(err))
            }
            message => Ok(message),
        }
    }

    // ===== status machine =====

    pub(crate) fn lock(&mut self) -> Result<()> {
        match self.status {
            Status::Idle => {
                self.status = Status::Busy;
                Ok(())
            }
            Status::Busy => Err(Error::Lock("BUSY")),
            Status::Closed => Err(Error::Lock("CLOSED")),
        }
    }

    pub(crate) fn unlock(&mut self) -> Result<()> {
        match self.status {
            Status::Busy => {
                self.status = Status::Idle;
                Ok(())
            }
            Status::Closed => Ok(()),
            Status::Idle => Err(Error::Unlock),
        }
    }

    /// Record one `ReadyForQuery` owed by a reader that could not drain
    /// the wire itself.
    pub(crate) fn defer_sync(&mut self) {
        self.pending_sync += 1;
    }

    /// Drain messages owed by previously dropped readers.
    async fn drain_deferred(&mut self) -> Result<()> {
        while self.pending_sync > 0 {
            match self.receive_message(None).await {
                Ok(BackendMessage::ReadyForQuery(_)) => self.pending_sync -= 1,
                Ok(_) => {}
                Err(Error::Db(err)) if self.status != Status::Closed => {
                    tracing::trace!("absorbed while resynchronizing: {err}");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Common operation prologue: consult the token, resynchronize, lock.
    pub(crate) async fn begin_op(&mut self, cancel: &CancelState) -> Result<()> {
        if cancel.is_cancelled_now() {
            return Err(Error::Cancelled);
        }
        self.drain_deferred().await?;
        self.lock()
    }

    /// Drain messages until `ReadyForQuery` after a non-fatal error.
    ///
    /// Non-fatal errors during the drain are silently absorbed; a FATAL
    /// one already closed the connection and stops the drain. Not
    /// cancellable.
    pub(crate) async fn restore(&mut self) {
        loop {
            match self.receive_message(None).await {
                Ok(BackendMessage::ReadyForQuery(_)) => return,
                Ok(_) => {}
                Err(Error::Db(err)) if self.status != Status::Closed => {
                    tracing::trace!("absorbed while restoring: {err}");
                }
                Err(_) => return,
            }
        }
    }

    pub(crate) fn close_now(&mut self) {
        self.status = Status::Closed;
    }

    /// Gracefully close the connection. Idempotent.
    ///
    /// Best-effort sends `Terminate` and shuts the socket down; errors on
    /// the way out are ignored.
    pub async fn close(&mut self) {
        if self.status == Status::Closed {
            return;
        }
        self.status = Status::Closed;
        self.write_buf.clear();
        frontend::write(&frontend::Terminate, &mut self.write_buf);
        let buf = self.write_buf.split();
        let _ = self.writer.write_all(&buf).await;
        let _ = self.writer.shutdown().await;
    }

    // ===== cancellation side channel =====

    pub(crate) fn cancel_key(&self) -> CancelKey {
        CancelKey {
            remote: self.remote.clone(),
            process_id: self.process_id,
            secret_key: self.secret_key,
        }
    }

    /// Attempt to interrupt the query currently running on this session.
    ///
    /// Opens a new socket to the same remote address and sends a single
    /// `CancelRequest`. Success is neither guaranteed nor observable; the
    /// outstanding query must still be awaited on this connection.
    pub async fn cancel_request(&self, timeout: Option<Duration>) -> Result<()> {
        self.cancel_key()
            .send(timeout.unwrap_or(self.connect_timeout))
            .await
    }

    /// Wait until a `NotificationResponse` arrives, processing other
    /// messages normally.
    pub async fn wait_for_notification(
        &mut self,
        cancel: Option<CancellationToken>,
    ) -> Result<Notification> {
        let cancel = CancelState::new(cancel);
        self.begin_op(&cancel).await?;

        loop {
            match self.receive_message(cancel.active()).await {
                Ok(BackendMessage::NotificationResponse(notification)) => {
                    self.unlock()?;
                    return Ok(notification);
                }
                Ok(_) => {}
                Err(Error::Cancelled) => {
                    // nothing outstanding on the wire; safe to stop here
                    self.unlock()?;
                    return Err(Error::Cancelled);
                }
                Err(Error::Db(err)) if self.status != Status::Closed => {
                    self.restore().await;
                    self.unlock()?;
                    return Err(Error::Db(err));
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Receive with the cancellation contract of data operations: the
    /// first observed cancellation fires a best-effort `CancelRequest` on
    /// a secondary socket, after which the drain continues uninterrupted.
    pub(crate) async fn receive_for_op(&mut self, cancel: &mut CancelState) -> Result<BackendMessage> {
        loop {
            match self.receive_message(cancel.active()).await {
                Err(Error::Cancelled) => {
                    cancel.mark_fired();
                    let key = self.cancel_key();
                    if let Err(err) = key.send(self.connect_timeout).await {
                        tracing::debug!("cancel request failed: {err}");
                    }
                }
                other => return other,
            }
        }
    }

}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("status", &self.status)
            .field("process_id", &self.process_id)
            .field("tx_status", &(self.tx_status as char))
            .field("remote", &self.remote)
            .finish()
    }
}

/// Everything needed to send a `CancelRequest` out of band.
#[derive(Debug, Clone)]
pub(crate) struct CancelKey {
    remote: RemoteAddr,
    process_id: i32,
    secret_key: i32,
}

impl CancelKey {
    pub(crate) async fn send(&self, timeout: Duration) -> Result<()> {
        let mut stream = Stream::connect(&self.remote, timeout)
            .await
            .map_err(|_| Error::Closed)?;
        let mut buf = BytesMut::with_capacity(16);
        frontend::CancelRequest {
            process_id: self.process_id,
            secret_key: self.secret_key,
        }
        .write(&mut buf);
        stream.write_all(&buf).await.map_err(|_| Error::Closed)?;
        let _ = stream.shutdown().await;
        Ok(())
    }
}

/// Cancellation bookkeeping for one operation: the token is consulted at
/// every suspension until the one-shot cancel packet has been fired.
pub(crate) struct CancelState {
    token: Option<CancellationToken>,
    fired: bool,
}

impl CancelState {
    pub(crate) fn new(token: Option<CancellationToken>) -> Self {
        Self { token, fired: false }
    }

    pub(crate) fn is_cancelled_now(&self) -> bool {
        self.token.as_ref().is_some_and(|t| t.is_cancelled())
    }

    /// The token, while it still may interrupt a read.
    pub(crate) fn active(&self) -> Option<&CancellationToken> {
        if self.fired {
            return None;
        }
        self.token.as_ref()
    }

    pub(crate) fn mark_fired(&mut self) {
        self.fired = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use tokio::io::AsyncWriteExt;

    async fn pair() -> (Connection, tokio::io::DuplexStream) {
        let (local, peer) = tokio::io::duplex(4096);
        let config = Config::new("test");
        let conn = Connection::new(
            Stream::boxed(local),
            RemoteAddr::new("127.0.0.1", 5432),
            &config,
        );
        (conn, peer)
    }

    #[tokio::test]
    async fn lock_transitions() {
        let (mut conn, _peer) = pair().await;
        assert_eq!(conn.status(), Status::Idle);

        conn.lock().unwrap();
        assert_eq!(conn.status(), Status::Busy);
        assert!(matches!(conn.lock(), Err(Error::Lock("BUSY"))));

        conn.unlock().unwrap();
        assert_eq!(conn.status(), Status::Idle);
        assert!(matches!(conn.unlock(), Err(Error::Unlock)));
    }

    #[tokio::test]
    async fn close_is_idempotent_and_terminal() {
        let (mut conn, _peer) = pair().await;
        conn.close().await;
        assert_eq!(conn.status(), Status::Closed);
        conn.close().await;
        assert_eq!(conn.status(), Status::Closed);

        assert!(matches!(conn.lock(), Err(Error::Lock("CLOSED"))));
        // unlock from closed is a no-op
        conn.unlock().unwrap();
    }

    #[tokio::test]
    async fn receive_message_side_effects() {
        let (mut conn, mut peer) = pair().await;

        // ParameterStatus
        peer.write_all(b"S\x00\x00\x00\x16TimeZone\0UTC/Zulu\0").await.unwrap();
        let msg = conn.receive_message(None).await.unwrap();
        assert!(matches!(msg, BackendMessage::ParameterStatus { .. }));
        assert_eq!(conn.parameter("TimeZone"), Some("UTC/Zulu"));

        // ReadyForQuery records the transaction status
        peer.write_all(b"Z\x00\x00\x00\x05T").await.unwrap();
        conn.receive_message(None).await.unwrap();
        assert_eq!(conn.tx_status(), b'T');
    }

    #[tokio::test]
    async fn fatal_error_closes_before_raising() {
        let (mut conn, mut peer) = pair().await;

        peer.write_all(b"E\x00\x00\x00\x21VFATAL\0C28P01\0Mbad password\0\0")
            .await
            .unwrap();
        let err = conn.receive_message(None).await.unwrap_err();
        let db = err.as_db_error().unwrap();
        assert_eq!(db.code, "28P01");
        assert_eq!(conn.status(), Status::Closed);
    }

    #[tokio::test]
    async fn non_fatal_error_keeps_connection_open() {
        let (mut conn, mut peer) = pair().await;

        peer.write_all(b"E\x00\x00\x00\x25VERROR\0C22012\0Mdivision by zero\0\0")
            .await
            .unwrap();
        let err = conn.receive_message(None).await.unwrap_err();
        assert_eq!(err.as_db_error().unwrap().code, "22012");
        assert_eq!(conn.status(), Status::Idle);
    }

    #[tokio::test]
    async fn unknown_message_closes_connection() {
        let (mut conn, mut peer) = pair().await;

        peer.write_all(b"!\x00\x00\x00\x04").await.unwrap();
        let err = conn.receive_message(None).await.unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
        assert_eq!(conn.status(), Status::Closed);
    }
}
