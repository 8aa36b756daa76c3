//! # Database Drivers
//!
//! Schema introspection, streaming table dumps and restores behind
//! [`DatabaseDriver`]. Every driver speaks the same dump format, PostgreSQL's COPY
//! text format (see [`copy_text`]), so dumps round-trip through the masking layer
//! unchanged regardless of the engine.

pub mod copy_text;
pub mod memory;
mod mysql;
mod postgres;

pub use memory::{MemoryConnector, MemoryDatabase};
pub use mysql::MySqlDriver;
pub use postgres::PostgresDriver;

use crate::crd::DatabaseEngine;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use k8s_openapi::api::core::v1::Secret;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Stream of dump chunks. Chunks are not aligned to rows.
pub type RowStream = BoxStream<'static, Result<Bytes, DatabaseError>>;

/// Database driver errors
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),
    #[error("mysql error: {0}")]
    Mysql(#[from] sqlx::Error),
    #[error("invalid dump data for table {table}: {source}")]
    Format {
        table: String,
        source: copy_text::CopyTextError,
    },
    #[error("table {0} does not exist")]
    UnknownTable(String),
    #[error("invalid connection info: {0}")]
    Connection(String),
}

/// Schema-qualified table name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableName {
    pub schema: String,
    pub name: String,
}

impl TableName {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
        }
    }

    /// Parse a `schema.table` name as produced by [`Display`](std::fmt::Display)
    pub fn parse_qualified(qualified: &str) -> Option<Self> {
        let (schema, name) = qualified.split_once('.')?;
        (!schema.is_empty() && !name.is_empty()).then(|| Self::new(schema, name))
    }

    /// Whether a rule's table reference (bare or `schema.table`) names this table
    pub fn matches(&self, reference: &str) -> bool {
        match reference.split_once('.') {
            Some((schema, name)) => schema == self.schema && name == self.name,
            None => reference == self.name,
        }
    }
}

impl std::fmt::Display for TableName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSchema {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
    pub primary_key: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    pub name: TableName,
    /// Columns in ordinal order
    pub columns: Vec<ColumnSchema>,
}

impl TableSchema {
    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }
}

/// One table's rows in COPY text format
pub struct TableDump {
    pub table: TableName,
    /// Column order of every row in `rows`
    pub columns: Vec<String>,
    pub rows: RowStream,
}

impl std::fmt::Debug for TableDump {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableDump")
            .field("table", &self.table)
            .field("columns", &self.columns)
            .finish_non_exhaustive()
    }
}

/// Schema introspection, dump and restore for one database
#[async_trait]
pub trait DatabaseDriver: Send + Sync {
    /// User tables with their columns, system schemas excluded
    async fn schema(&self) -> Result<Vec<TableSchema>, DatabaseError>;

    /// Start streaming every row of `table`
    async fn dump_table(&self, table: &TableSchema) -> Result<TableDump, DatabaseError>;

    /// Replace the contents of `dump.table` with the dump rows, atomically.
    /// Returns the number of rows written.
    async fn restore(&self, dump: TableDump) -> Result<u64, DatabaseError>;

    /// Most tables this driver can dump and restore at once, if it is limited
    fn max_concurrent_tables(&self) -> Option<usize> {
        None
    }
}

/// Opens drivers for a given engine and connection
#[async_trait]
pub trait DatabaseConnector: Send + Sync {
    async fn connect(
        &self,
        engine: DatabaseEngine,
        connection: &ConnectionInfo,
    ) -> Result<Arc<dyn DatabaseDriver>, DatabaseError>;
}

/// Connector for real database servers
#[derive(Debug, Clone, Copy, Default)]
pub struct EngineConnector {
    /// Masking concurrency the drivers are sized for, zero for no limit
    max_concurrent_tables: usize,
}

impl EngineConnector {
    pub fn new(max_concurrent_tables: usize) -> Self {
        Self {
            max_concurrent_tables,
        }
    }
}

#[async_trait]
impl DatabaseConnector for EngineConnector {
    async fn connect(
        &self,
        engine: DatabaseEngine,
        connection: &ConnectionInfo,
    ) -> Result<Arc<dyn DatabaseDriver>, DatabaseError> {
        let driver: Arc<dyn DatabaseDriver> = match engine {
            DatabaseEngine::Postgres => Arc::new(PostgresDriver::new(connection)),
            DatabaseEngine::Mysql => Arc::new(
                MySqlDriver::connect(connection, self.max_concurrent_tables).await?,
            ),
        };
        Ok(driver)
    }
}

/// Host, port and credentials of a database
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub dbname: String,
}

impl std::fmt::Debug for ConnectionInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionInfo")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("dbname", &self.dbname)
            .finish_non_exhaustive()
    }
}

/// Read a key from a Secret, preferring `stringData` over `data`
pub fn secret_value(secret: &Secret, key: &str) -> Option<String> {
    if let Some(value) = secret.string_data.as_ref().and_then(|d| d.get(key)) {
        return Some(value.clone());
    }
    secret
        .data
        .as_ref()
        .and_then(|d| d.get(key))
        .and_then(|bytes| String::from_utf8(bytes.0.clone()).ok())
}

impl ConnectionInfo {
    /// Parse a connection Secret with `host`, `port`, `user`, `password`, `dbname` keys
    pub fn from_secret(secret: &Secret) -> Result<Self, DatabaseError> {
        let require = |key: &str| {
            secret_value(secret, key)
                .ok_or_else(|| DatabaseError::Connection(format!("secret is missing key '{key}'")))
        };
        let port = require("port")?;
        Ok(Self {
            host: require("host")?,
            port: port
                .parse()
                .map_err(|_| DatabaseError::Connection(format!("invalid port '{port}'")))?,
            user: require("user")?,
            password: require("password")?,
            dbname: require("dbname")?,
        })
    }

    /// Parse a libpq-style keyword string: `host=db port=5432 user=app password=x dbname=orders`
    pub fn parse_keywords(input: &str) -> Result<Self, DatabaseError> {
        let mut fields = BTreeMap::new();
        for pair in input.split_whitespace() {
            let (key, value) = pair.split_once('=').ok_or_else(|| {
                DatabaseError::Connection(format!("expected key=value, got '{pair}'"))
            })?;
            fields.insert(key.to_string(), value.to_string());
        }
        let secret = Secret {
            string_data: Some(fields),
            ..Secret::default()
        };
        Self::from_secret(&secret)
    }

    /// Secret `stringData` for this connection
    pub fn to_string_data(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("host".to_string(), self.host.clone()),
            ("port".to_string(), self.port.to_string()),
            ("user".to_string(), self.user.clone()),
            ("password".to_string(), self.password.clone()),
            ("dbname".to_string(), self.dbname.clone()),
        ])
    }
}
