//! Bulk COPY drivers over the simple protocol.
use std::io;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::{
    connection::{CancelState, Connection, Status},
    error::{Error, PgError, Result},
    message::{frontend, BackendMessage},
    statement::CommandTag,
};

/// What woke the COPY IN forwarder.
enum Event {
    Frame(u8, Bytes),
    WireErr(Error),
    Read(usize),
    SourceErr(io::Error),
    Cancelled,
}

impl Connection {
    /// Execute a `COPY ... FROM STDIN` statement, streaming `source` to
    /// the backend.
    ///
    /// The source is read concurrently with the wire so a mid-copy server
    /// error stops the transfer early. Exactly one of `CopyDone` or
    /// `CopyFail` terminates the stream: `CopyDone` at source EOF,
    /// `CopyFail` on a source error or cancellation. Statements that turn
    /// out not to be a copy are executed normally and their tag returned.
    pub async fn copy_from<R>(
        &mut self,
        sql: &str,
        mut source: R,
        cancel: Option<CancellationToken>,
    ) -> Result<CommandTag>
    where
        R: AsyncRead + Unpin,
    {
        let mut cancel = CancelState::new(cancel);
        self.begin_op(&cancel).await?;

        self.send(&frontend::Query { sql });
        self.flush().await?;

        let mut tag: Option<CommandTag> = None;
        loop {
            match self.receive_for_op(&mut cancel).await {
                Ok(BackendMessage::CopyInResponse(_)) => break,
                Ok(BackendMessage::CommandComplete(t)) => tag = Some(t),
                Ok(BackendMessage::ReadyForQuery(_)) => {
                    self.unlock()?;
                    return Ok(tag.unwrap_or_default());
                }
                Ok(_) => {}
                Err(Error::Db(err)) if self.status() != Status::Closed => {
                    self.restore().await;
                    self.unlock()?;
                    return Err(Error::Db(err));
                }
                Err(err) => return Err(err),
            }
        }

        let mut chunk = BytesMut::with_capacity(8192);
        let mut source_err: Option<io::Error> = None;
        let mut db_err: Option<Box<PgError>> = None;

        'forward: loop {
            let token = cancel.active().cloned();
            let armed = token.clone();
            let event = {
                let reader = &mut self.reader;
                tokio::select! {
                    biased;
                    _ = async move { armed.expect("guarded by branch condition").cancelled().await },
                        if token.is_some() => Event::Cancelled,
                    frame = reader.receive(None) => match frame {
                        Ok((msgtype, body)) => Event::Frame(msgtype, body),
                        Err(err) => Event::WireErr(err),
                    },
                    read = source.read_buf(&mut chunk) => match read {
                        Ok(read) => Event::Read(read),
                        Err(err) => Event::SourceErr(err),
                    },
                }
            };

            match event {
                Event::Frame(msgtype, body) => match self.handle_frame(msgtype, body) {
                    // notices and parameter reports interleave freely
                    Ok(_) => {}
                    // the backend gave up; stop forwarding and drain
                    Err(Error::Db(err)) => {
                        if self.status() == Status::Closed {
                            return Err(Error::Db(err));
                        }
                        db_err = Some(err);
                        break 'forward;
                    }
                    Err(err) => return Err(err),
                },
                Event::WireErr(err) => {
                    self.close_now();
                    return Err(err);
                }
                Event::Read(0) => {
                    self.send(&frontend::CopyDone);
                    self.flush().await?;
                    break 'forward;
                }
                Event::Read(_) => {
                    self.send(&frontend::CopyData { data: &chunk });
                    self.flush().await?;
                    chunk.clear();
                }
                Event::SourceErr(err) => {
                    self.send(&frontend::CopyFail { message: &err.to_string() });
                    self.flush().await?;
                    source_err = Some(err);
                    break 'forward;
                }
                Event::Cancelled => {
                    cancel.mark_fired();
                    self.send(&frontend::CopyFail { message: "COPY canceled" });
                    self.flush().await?;
                    break 'forward;
                }
            }
        }

        loop {
            match self.receive_message(None).await {
                Ok(BackendMessage::CommandComplete(t)) => tag = Some(t),
                Ok(BackendMessage::ReadyForQuery(_)) => break,
                Ok(_) => {}
                Err(Error::Db(err)) if self.status() != Status::Closed => {
                    db_err.get_or_insert(err);
                }
                Err(err) => return Err(err),
            }
        }
        self.unlock()?;

        match (source_err, db_err) {
            (Some(err), _) => Err(Error::Io(err)),
            (None, Some(err)) => Err(Error::Db(err)),
            (None, None) => Ok(tag.unwrap_or_default()),
        }
    }

    /// Execute a `COPY ... TO STDOUT` statement, writing every received
    /// chunk to `sink`.
    ///
    /// A sink failure triggers a best-effort cancel request, after which
    /// the wire is still drained to `ReadyForQuery` before the sink error
    /// is re-raised.
    pub async fn copy_to<W>(
        &mut self,
        sql: &str,
        mut sink: W,
        cancel: Option<CancellationToken>,
    ) -> Result<CommandTag>
    where
        W: AsyncWrite + Unpin,
    {
        let mut cancel = CancelState::new(cancel);
        self.begin_op(&cancel).await?;

        self.send(&frontend::Query { sql });
        self.flush().await?;

        let mut tag: Option<CommandTag> = None;
        let mut db_err: Option<Box<PgError>> = None;
        let mut sink_err: Option<io::Error> = None;

        loop {
            match self.receive_for_op(&mut cancel).await {
                Ok(BackendMessage::CopyOutResponse(_) | BackendMessage::CopyDone) => {}
                Ok(BackendMessage::CopyData(data)) => {
                    if sink_err.is_some() {
                        continue;
                    }
                    if let Err(err) = sink.write_all(&data).await {
                        // ask the server to stop producing, then drain
                        if let Err(cancel_err) = self.cancel_request(None).await {
                            tracing::debug!("cancel request failed: {cancel_err}");
                        }
                        sink_err = Some(err);
                    }
                }
                Ok(BackendMessage::CommandComplete(t)) => tag = Some(t),
                Ok(BackendMessage::ReadyForQuery(_)) => break,
                Ok(_) => {}
                Err(Error::Db(err)) if self.status() != Status::Closed => {
                    db_err.get_or_insert(err);
                }
                Err(err) => return Err(err),
            }
        }
        self.unlock()?;

        if sink_err.is_none() {
            if let Err(err) = sink.flush().await {
                sink_err = Some(err);
            }
        }

        match (sink_err, db_err) {
            (Some(err), _) => Err(Error::Io(err)),
            (None, Some(err)) => Err(Error::Db(err)),
            (None, None) => Ok(tag.unwrap_or_default()),
        }
    }
}
