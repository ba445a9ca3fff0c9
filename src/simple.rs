//! Simple query protocol: one `Query` message, many results.
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::{
    connection::{CancelState, Connection, Status},
    error::{Error, Result},
    message::{frontend, BackendMessage, FieldDescription},
    statement::CommandTag,
};

/// One fully-materialized statement result.
#[derive(Debug, Clone)]
pub struct QueryResult {
    /// Result columns; empty for row-less statements.
    pub fields: Vec<FieldDescription>,
    /// Raw row values; `None` is NULL.
    pub rows: Vec<Vec<Option<Bytes>>>,
    /// The completion tag.
    pub tag: CommandTag,
}

impl Connection {
    /// Execute a query string, which may contain multiple statements,
    /// via the simple protocol.
    ///
    /// Returns immediately after the request is on the wire; rows stream
    /// through the returned reader.
    pub async fn exec(
        &mut self,
        sql: &str,
        cancel: Option<CancellationToken>,
    ) -> Result<MultiResultReader<'_>> {
        let cancel = CancelState::new(cancel);
        self.begin_op(&cancel).await?;

        self.send(&frontend::Query { sql });
        self.flush().await?;

        Ok(MultiResultReader {
            conn: self,
            cancel,
            state: State::Between,
            fields: Vec::new(),
            row: Vec::new(),
            tag: None,
            partial: Vec::new(),
            released: false,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Waiting for the next result to begin.
    Between,
    /// Inside a result, rows pending.
    InRows,
    /// Inside a result that already concluded with a tag.
    Concluded,
    /// `ReadyForQuery` consumed or the error path ran; the wire is
    /// released.
    Done,
}

/// Reader over the results of one simple-protocol query.
///
/// Owns the connection lock until every result is consumed, the reader is
/// closed, or an error path resynchronizes the wire.
pub struct MultiResultReader<'c> {
    conn: &'c mut Connection,
    cancel: CancelState,
    state: State,
    fields: Vec<FieldDescription>,
    row: Vec<Option<Bytes>>,
    tag: Option<CommandTag>,
    partial: Vec<QueryResult>,
    released: bool,
}

impl<'c> MultiResultReader<'c> {
    /// Advance to the next result.
    ///
    /// Returns `false` once the query cycle completed; the connection is
    /// idle again at that point. An unconsumed current result is drained
    /// first so the wire stays aligned.
    pub async fn next_result(&mut self) -> Result<bool> {
        self.finish_current().await?;
        if self.state == State::Done {
            return Ok(false);
        }

        loop {
            match self.recv().await {
                Ok(BackendMessage::RowDescription(fields)) => {
                    self.fields = fields;
                    self.row.clear();
                    self.tag = None;
                    self.state = State::InRows;
                    return Ok(true);
                }
                // a statement that produces no rows at all
                Ok(BackendMessage::CommandComplete(tag)) => {
                    self.fields.clear();
                    self.row.clear();
                    self.tag = Some(tag);
                    self.state = State::Concluded;
                    return Ok(true);
                }
                Ok(BackendMessage::EmptyQueryResponse) => {}
                Ok(BackendMessage::ReadyForQuery(_)) => {
                    self.state = State::Done;
                    self.release();
                    return Ok(false);
                }
                Ok(_) => {}
                Err(err) => return Err(self.fail(err).await),
            }
        }
    }

    /// Reader over the rows of the current result.
    pub fn result_reader(&mut self) -> ResultReaderSimple<'_, 'c> {
        ResultReaderSimple { outer: self }
    }

    /// Drive every remaining result to completion and collect them.
    ///
    /// On error the results read so far stay available through
    /// [`partial_results`][Self::partial_results].
    pub async fn read_all(&mut self) -> Result<Vec<QueryResult>> {
        let mut results = Vec::new();
        loop {
            match self.next_result().await {
                Ok(true) => match self.result_reader().result().await {
                    Ok(result) => results.push(result),
                    Err(err) => {
                        self.partial = results;
                        return Err(err);
                    }
                },
                Ok(false) => return Ok(results),
                Err(err) => {
                    self.partial = results;
                    return Err(err);
                }
            }
        }
    }

    /// Results accumulated before [`read_all`][Self::read_all] failed.
    pub fn partial_results(&mut self) -> Vec<QueryResult> {
        std::mem::take(&mut self.partial)
    }

    /// Drain the wire to `ReadyForQuery` and release the connection.
    ///
    /// Double close is a no-op.
    pub async fn close(&mut self) {
        if self.state == State::Done {
            return;
        }
        self.state = State::Done;
        self.conn.restore().await;
        self.release();
    }

    /// Drain an unconsumed current result up to its `CommandComplete`.
    async fn finish_current(&mut self) -> Result<()> {
        loop {
            match self.state {
                State::InRows => match self.recv().await {
                    Ok(BackendMessage::DataRow(_)) => {}
                    Ok(BackendMessage::CommandComplete(tag)) => {
                        self.tag = Some(tag);
                        self.state = State::Concluded;
                    }
                    Ok(_) => {}
                    Err(err) => return Err(self.fail(err).await),
                },
                State::Concluded => {
                    self.state = State::Between;
                    return Ok(());
                }
                State::Between | State::Done => return Ok(()),
            }
        }
    }

    async fn recv(&mut self) -> Result<BackendMessage> {
        self.conn.receive_for_op(&mut self.cancel).await
    }

    /// Error epilogue: resynchronize after a recoverable server error,
    /// then hand the wire back.
    async fn fail(&mut self, err: Error) -> Error {
        if matches!(err, Error::Db(_)) && self.conn.status() != Status::Closed {
            self.conn.restore().await;
        }
        self.state = State::Done;
        self.release();
        err
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            let _ = self.conn.unlock();
        }
    }
}

impl Drop for MultiResultReader<'_> {
    fn drop(&mut self) {
        // the drain this reader still owes happens before the next
        // operation locks the wire
        if self.state != State::Done {
            self.conn.defer_sync();
        }
        self.release();
    }
}

impl std::fmt::Debug for MultiResultReader<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiResultReader")
            .field("state", &self.state)
            .field("fields", &self.fields.len())
            .finish()
    }
}

/// Reader over the rows of a single result within a
/// [`MultiResultReader`].
pub struct ResultReaderSimple<'a, 'c> {
    outer: &'a mut MultiResultReader<'c>,
}

impl ResultReaderSimple<'_, '_> {
    /// Advance to the next row. Returns `false` once the result
    /// concluded; the command tag is available afterwards.
    pub async fn next_row(&mut self) -> Result<bool> {
        if self.outer.state != State::InRows {
            return Ok(false);
        }
        loop {
            match self.outer.recv().await {
                Ok(BackendMessage::DataRow(values)) => {
                    self.outer.row = values;
                    return Ok(true);
                }
                Ok(BackendMessage::CommandComplete(tag)) => {
                    self.outer.tag = Some(tag);
                    self.outer.state = State::Concluded;
                    return Ok(false);
                }
                Ok(_) => {}
                Err(err) => return Err(self.outer.fail(err).await),
            }
        }
    }

    /// Raw values of the current row.
    pub fn row_values(&self) -> &[Option<Bytes>] {
        &self.outer.row
    }

    /// Column descriptions of this result.
    pub fn field_descriptions(&self) -> &[FieldDescription] {
        &self.outer.fields
    }

    /// The completion tag, once the result concluded.
    pub fn command_tag(&self) -> Option<&CommandTag> {
        self.outer.tag.as_ref()
    }

    /// Collect the remaining rows into a [`QueryResult`].
    pub async fn result(&mut self) -> Result<QueryResult> {
        let fields = self.outer.fields.clone();
        let mut rows = Vec::new();
        while self.next_row().await? {
            rows.push(std::mem::take(&mut self.outer.row));
        }
        Ok(QueryResult {
            fields,
            rows,
            tag: self.outer.tag.clone().unwrap_or_default(),
        })
    }

    /// Drain the remaining rows so the outer reader stays usable.
    pub async fn close(&mut self) -> Result<()> {
        while self.next_row().await? { }
        Ok(())
    }
}
