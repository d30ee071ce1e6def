use crate::auth::SandboxCredentials;
use crate::conn::Session;
use crate::engine::{Engine, EngineSession};
use crate::error::{
    EngineError, ER_ACCESS_DENIED_ERROR, ER_BAD_DB_ERROR, ER_DB_CREATE_EXISTS, ER_DB_DROP_EXISTS,
    ER_UNKNOWN_SYSTEM_VARIABLE,
};
use crate::model::{Cell, ResultSet};
use async_trait::async_trait;
use opensrv_mysql::{
    AsyncMysqlShim, Column, ColumnFlags, ColumnType, ErrorKind, InitWriter, OkResponse,
    ParamParser, QueryResultWriter, StatementMetaWriter, StatusFlags,
};
use rand::rngs::OsRng;
use rand::RngCore;
use std::sync::Arc;
use tracing::debug;

pub struct SandboxBackend {
    credentials: Arc<SandboxCredentials>,
    session: EngineSession,
    salt: [u8; 20],
    conn_id: u32,
}

impl SandboxBackend {
    pub fn new(engine: &Engine, credentials: Arc<SandboxCredentials>, conn_id: u32) -> Self {
        let mut salt = [0u8; 20];
        OsRng.fill_bytes(&mut salt);
        Self {
            credentials,
            session: engine.attach(),
            salt,
            conn_id,
        }
    }

    fn err_to_kind(err: &EngineError) -> ErrorKind {
        match err.code() {
            Some(ER_BAD_DB_ERROR) => ErrorKind::ER_BAD_DB_ERROR,
            Some(ER_DB_CREATE_EXISTS) => ErrorKind::ER_DB_CREATE_EXISTS,
            Some(ER_DB_DROP_EXISTS) => ErrorKind::ER_DB_DROP_EXISTS,
            Some(ER_ACCESS_DENIED_ERROR) => ErrorKind::ER_ACCESS_DENIED_ERROR,
            Some(ER_UNKNOWN_SYSTEM_VARIABLE) => ErrorKind::ER_UNKNOWN_SYSTEM_VARIABLE,
            _ => ErrorKind::ER_UNKNOWN_ERROR,
        }
    }

    fn err_msg(err: &EngineError) -> String {
        match err {
            EngineError::Server { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}

/// Column type for a result column, taken from its non-NULL values.
fn column_type(rs: &ResultSet, idx: usize) -> (ColumnType, ColumnFlags) {
    let mut cells = rs
        .rows
        .iter()
        .filter_map(|row| row.get(idx))
        .filter(|c| !c.is_null())
        .peekable();
    let Some(&first) = cells.peek() else {
        return (ColumnType::MYSQL_TYPE_VAR_STRING, ColumnFlags::empty());
    };
    let kind = std::mem::discriminant(first);
    if !cells.all(|c| std::mem::discriminant(c) == kind) {
        return (ColumnType::MYSQL_TYPE_VAR_STRING, ColumnFlags::empty());
    }
    match first {
        Cell::Int(_) => (ColumnType::MYSQL_TYPE_LONGLONG, ColumnFlags::empty()),
        Cell::UInt(_) => (ColumnType::MYSQL_TYPE_LONGLONG, ColumnFlags::UNSIGNED_FLAG),
        Cell::Float(_) => (ColumnType::MYSQL_TYPE_DOUBLE, ColumnFlags::empty()),
        Cell::Bytes(_) => (ColumnType::MYSQL_TYPE_BLOB, ColumnFlags::BINARY_FLAG),
        _ => (ColumnType::MYSQL_TYPE_VAR_STRING, ColumnFlags::empty()),
    }
}

#[async_trait]
impl<W> AsyncMysqlShim<W> for SandboxBackend
where
    W: tokio::io::AsyncWrite + Unpin + Send,
{
    type Error = EngineError;

    fn version(&self) -> String {
        self.session.engine_version()
    }

    fn connect_id(&self) -> u32 {
        self.conn_id
    }

    fn salt(&self) -> [u8; 20] {
        self.salt
    }

    async fn authenticate(
        &self,
        auth_plugin: &str,
        username: &[u8],
        salt: &[u8],
        auth_data: &[u8],
    ) -> bool {
        self.credentials
            .verify(auth_plugin, username, salt, auth_data)
    }

    async fn on_prepare<'a>(
        &'a mut self,
        _query: &'a str,
        info: StatementMetaWriter<'a, W>,
    ) -> Result<(), EngineError> {
        info.error(
            ErrorKind::ER_NOT_SUPPORTED_YET,
            b"prepared statements are not supported",
        )
        .await?;
        Ok(())
    }

    async fn on_execute<'a>(
        &'a mut self,
        _id: u32,
        _params: ParamParser<'a>,
        results: QueryResultWriter<'a, W>,
    ) -> Result<(), EngineError> {
        results
            .error(
                ErrorKind::ER_NOT_SUPPORTED_YET,
                b"prepared statements are not supported",
            )
            .await?;
        Ok(())
    }

    async fn on_close<'a>(&'a mut self, _stmt: u32)
    where
        W: 'async_trait,
    {
    }

    async fn on_init<'a>(
        &'a mut self,
        db: &'a str,
        writer: InitWriter<'a, W>,
    ) -> Result<(), EngineError> {
        // Handshake databases may be catalog-qualified: blog_7.wordpress
        match self.session.init_db(db) {
            Ok(()) => writer.ok().await?,
            Err(err) => {
                writer
                    .error(Self::err_to_kind(&err), Self::err_msg(&err).as_bytes())
                    .await?
            }
        }
        Ok(())
    }

    async fn on_query<'a>(
        &'a mut self,
        query: &'a str,
        results: QueryResultWriter<'a, W>,
    ) -> Result<(), EngineError> {
        debug!(conn = self.conn_id, catalog = %self.session.catalog(), %query, "query");
        match self.session.execute(query) {
            Ok(rs) if !rs.has_rows() => {
                let ok = OkResponse {
                    affected_rows: rs.affected_rows,
                    last_insert_id: rs.last_insert_id.unwrap_or(0),
                    status_flags: StatusFlags::SERVER_STATUS_AUTOCOMMIT,
                    ..Default::default()
                };
                results.completed(ok).await?;
            }
            Ok(rs) => {
                let columns: Vec<Column> = rs
                    .columns
                    .iter()
                    .enumerate()
                    .map(|(i, name)| {
                        let (coltype, colflags) = column_type(&rs, i);
                        Column {
                            table: String::new(),
                            column: name.clone(),
                            coltype,
                            colflags,
                        }
                    })
                    .collect();

                let mut rw = results.start(&columns).await?;
                for row in &rs.rows {
                    for (i, cell) in row.iter().enumerate() {
                        let coltype = columns
                            .get(i)
                            .map(|c| c.coltype)
                            .unwrap_or(ColumnType::MYSQL_TYPE_VAR_STRING);
                        match (coltype, cell) {
                            // Any Option<T>::None encodes NULL.
                            (_, Cell::Null) => rw.write_col(None::<u8>)?,
                            (ColumnType::MYSQL_TYPE_LONGLONG, Cell::Int(n)) => rw.write_col(*n)?,
                            (ColumnType::MYSQL_TYPE_LONGLONG, Cell::UInt(n)) => rw.write_col(*n)?,
                            (ColumnType::MYSQL_TYPE_DOUBLE, Cell::Float(f)) => rw.write_col(*f)?,
                            (_, Cell::Bytes(b)) => rw.write_col(b.as_slice())?,
                            (_, other) => rw.write_col(other.to_string())?,
                        }
                    }
                    rw.end_row().await?;
                }
                rw.finish().await?;
            }
            Err(err) => {
                let kind = Self::err_to_kind(&err);
                let msg = Self::err_msg(&err);
                results.error(kind, msg.as_bytes()).await?;
            }
        }

        Ok(())
    }
}
