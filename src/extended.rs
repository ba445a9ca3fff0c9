//! Extended query protocol: `Parse`/`Bind`/`Describe`/`Execute`/`Sync`.
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::{
    connection::{CancelState, Connection, Status},
    error::{Error, Result},
    message::{frontend, BackendMessage, FieldDescription, Format, Oid},
    statement::{CommandTag, StatementDescription},
};

/// The Parse and Bind messages count parameters with an `Int16`.
const MAX_PARAMS: usize = 65535;

fn check_param_count(count: usize) -> Result<()> {
    if count > MAX_PARAMS {
        return Err(Error::InvalidArgument(
            "Extended protocol limited to 65535 parameters",
        ));
    }
    Ok(())
}

fn check_arguments(params: &[Option<&[u8]>], param_formats: &[Format]) -> Result<()> {
    check_param_count(params.len())?;
    if !matches!(param_formats.len(), 0 | 1) && param_formats.len() != params.len() {
        return Err(Error::InvalidArgument(
            "param_formats length must be 0, 1, or the parameter count",
        ));
    }
    Ok(())
}

impl Connection {
    /// Create a named prepared statement and describe it.
    ///
    /// The statement lives on the server until closed or the session
    /// ends. OIDs left zero are inferred by the server and reported back
    /// in the returned description.
    pub async fn prepare(
        &mut self,
        name: &str,
        sql: &str,
        param_oids: &[Oid],
        cancel: Option<CancellationToken>,
    ) -> Result<StatementDescription> {
        check_param_count(param_oids.len())?;
        let mut cancel = CancelState::new(cancel);
        self.begin_op(&cancel).await?;

        self.send(&frontend::Parse { name, sql, param_oids });
        self.send(&frontend::Describe { kind: b'S', name });
        self.send(&frontend::Sync);
        self.flush().await?;

        let mut description = StatementDescription {
            name: name.to_string(),
            sql: sql.to_string(),
            param_oids: param_oids.to_vec(),
            fields: Vec::new(),
        };

        loop {
            match self.receive_for_op(&mut cancel).await {
                Ok(BackendMessage::ParseComplete) => {}
                Ok(BackendMessage::ParameterDescription(oids)) => {
                    description.param_oids = oids;
                }
                Ok(BackendMessage::RowDescription(fields)) => description.fields = fields,
                Ok(BackendMessage::NoData) => {}
                Ok(BackendMessage::ReadyForQuery(_)) => {
                    self.unlock()?;
                    return Ok(description);
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
    }

    /// Parse, bind and execute `sql` in one request group.
    ///
    /// The returned reader has already consumed the responses up to the
    /// row description.
    #[allow(clippy::too_many_arguments)]
    pub async fn exec_params(
        &mut self,
        sql: &str,
        params: &[Option<&[u8]>],
        param_oids: &[Oid],
        param_formats: &[Format],
        result_formats: &[Format],
        cancel: Option<CancellationToken>,
    ) -> Result<ExtendedResultReader<'_>> {
        check_arguments(params, param_formats)?;
        let cancel = CancelState::new(cancel);
        self.begin_op(&cancel).await?;

        self.send(&frontend::Parse { name: "", sql, param_oids });
        self.send(&frontend::Bind {
            portal: "",
            statement: "",
            param_formats,
            params,
            result_formats,
        });
        self.send(&frontend::Describe { kind: b'P', name: "" });
        self.send(&frontend::Execute { portal: "", max_rows: 0 });
        self.send(&frontend::Sync);
        self.flush().await?;

        let mut reader = ExtendedResultReader::new(self, cancel);
        reader.read_until_row_description().await?;
        Ok(reader)
    }

    /// Bind and execute a previously prepared statement.
    pub async fn exec_prepared(
        &mut self,
        name: &str,
        params: &[Option<&[u8]>],
        param_formats: &[Format],
        result_formats: &[Format],
        cancel: Option<CancellationToken>,
    ) -> Result<ExtendedResultReader<'_>> {
        check_arguments(params, param_formats)?;
        let cancel = CancelState::new(cancel);
        self.begin_op(&cancel).await?;

        self.send(&frontend::Bind {
            portal: "",
            statement: name,
            param_formats,
            params,
            result_formats,
        });
        self.send(&frontend::Describe { kind: b'P', name: "" });
        self.send(&frontend::Execute { portal: "", max_rows: 0 });
        self.send(&frontend::Sync);
        self.flush().await?;

        let mut reader = ExtendedResultReader::new(self, cancel);
        reader.read_until_row_description().await?;
        Ok(reader)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Consuming `ParseComplete`/`BindComplete` up to the description.
    Describing,
    /// Streaming rows until the execute phase terminates.
    InRows,
    /// `ReadyForQuery` consumed; the wire is released.
    Done,
}

/// Reader over the single result of an extended-protocol execution.
pub struct ExtendedResultReader<'c> {
    conn: &'c mut Connection,
    cancel: CancelState,
    state: State,
    fields: Vec<FieldDescription>,
    row: Vec<Option<Bytes>>,
    tag: Option<CommandTag>,
    released: bool,
}

impl<'c> ExtendedResultReader<'c> {
    fn new(conn: &'c mut Connection, cancel: CancelState) -> Self {
        Self {
            conn,
            cancel,
            state: State::Describing,
            fields: Vec::new(),
            row: Vec::new(),
            tag: None,
            released: false,
        }
    }

    /// Consume acknowledgements up to `RowDescription` or `NoData`.
    pub(crate) async fn read_until_row_description(&mut self) -> Result<()> {
        while self.state == State::Describing {
            match self.recv().await {
                Ok(BackendMessage::ParseComplete | BackendMessage::BindComplete) => {}
                Ok(BackendMessage::RowDescription(fields)) => {
                    self.fields = fields;
                    self.state = State::InRows;
                }
                Ok(BackendMessage::NoData) => self.state = State::InRows,
                Ok(BackendMessage::EmptyQueryResponse) => self.state = State::InRows,
                Ok(_) => {}
                Err(err) => return Err(self.fail(err).await),
            }
        }
        Ok(())
    }

    /// Advance to the next row.
    ///
    /// Returns `false` once the result concluded; by then the command tag
    /// is recorded, `ReadyForQuery` was consumed and the connection is
    /// idle again.
    pub async fn next_row(&mut self) -> Result<bool> {
        loop {
            if self.state == State::Done {
                return Ok(false);
            }
            match self.recv().await {
                Ok(BackendMessage::DataRow(values)) => {
                    self.row = values;
                    return Ok(true);
                }
                Ok(BackendMessage::CommandComplete(tag)) => self.tag = Some(tag),
                // a zero-row result
                Ok(BackendMessage::EmptyQueryResponse) => {}
                // row-count limits are not used here; treated as conclusion
                Ok(BackendMessage::PortalSuspended) => {}
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

    /// Raw values of the current row.
    pub fn row_values(&self) -> &[Option<Bytes>] {
        &self.row
    }

    /// Column descriptions, empty when the statement returns no rows.
    pub fn field_descriptions(&self) -> &[FieldDescription] {
        &self.fields
    }

    /// The completion tag, once the result concluded.
    pub fn command_tag(&self) -> Option<&CommandTag> {
        self.tag.as_ref()
    }

    /// Collect the remaining rows into a [`QueryResult`].
    pub async fn result(&mut self) -> Result<crate::QueryResult> {
        let fields = self.fields.clone();
        let mut rows = Vec::new();
        while self.next_row().await? {
            rows.push(std::mem::take(&mut self.row));
        }
        Ok(crate::QueryResult {
            fields,
            rows,
            tag: self.tag.clone().unwrap_or_default(),
        })
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

    async fn recv(&mut self) -> Result<BackendMessage> {
        self.conn.receive_for_op(&mut self.cancel).await
    }

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

impl Drop for ExtendedResultReader<'_> {
    fn drop(&mut self) {
        if self.state != State::Done {
            self.conn.defer_sync();
        }
        self.release();
    }
}

impl std::fmt::Debug for ExtendedResultReader<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtendedResultReader")
            .field("state", &self.state)
            .field("fields", &self.fields.len())
            .finish()
    }
}
