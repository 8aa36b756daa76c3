//! # In-Memory Database
//!
//! Tables held in process, dumped and restored in COPY text format.

use super::copy_text::{decode_row, encode_row, CopyTextError, LineBuffer};
use super::{
    ConnectionInfo, DatabaseConnector, DatabaseDriver, DatabaseError, TableDump, TableSchema,
};
use crate::crd::DatabaseEngine;
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

pub type Row = Vec<Option<String>>;

#[derive(Debug, Clone)]
struct MemoryTable {
    schema: TableSchema,
    rows: Vec<Row>,
}

/// A database kept entirely in memory
#[derive(Debug, Default)]
pub struct MemoryDatabase {
    tables: Mutex<BTreeMap<String, MemoryTable>>,
    restores: AtomicUsize,
    /// Split dumps into chunks of this many bytes instead of one chunk per row
    chunk_size: Option<usize>,
    /// Pause before every dump chunk
    dump_delay: Option<Duration>,
    /// Tables whose dump stream breaks after the first chunk
    broken_dumps: BTreeSet<String>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(self, schema: TableSchema, rows: Vec<Row>) -> Self {
        self.tables()
            .insert(schema.name.to_string(), MemoryTable { schema, rows });
        self
    }

    pub fn with_chunk_size(mut self, bytes: usize) -> Self {
        self.chunk_size = Some(bytes.max(1));
        self
    }

    pub fn with_dump_delay(mut self, delay: Duration) -> Self {
        self.dump_delay = Some(delay);
        self
    }

    /// Make the dump stream of `table` (`schema.table`) fail partway through
    pub fn with_broken_dump(mut self, table: &str) -> Self {
        self.broken_dumps.insert(table.to_string());
        self
    }

    fn tables(&self) -> MutexGuard<'_, BTreeMap<String, MemoryTable>> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Rows of a table by qualified name (`schema.table`)
    pub fn rows(&self, table: &str) -> Option<Vec<Row>> {
        self.tables().get(table).map(|t| t.rows.clone())
    }

    /// Number of restore calls that reached this database
    pub fn restore_calls(&self) -> usize {
        self.restores.load(Ordering::SeqCst)
    }
}

fn encode_rows(rows: &[Row], columns: usize, chunk_size: Option<usize>) -> Vec<Bytes> {
    let lines: Vec<String> = rows
        .iter()
        .map(|row| {
            let mut line = String::new();
            encode_row(&row[..columns.min(row.len())], &mut line);
            line
        })
        .collect();

    match chunk_size {
        None => lines.into_iter().map(Bytes::from).collect(),
        Some(size) => {
            let all = Bytes::from(lines.concat());
            (0..all.len())
                .step_by(size)
                .map(|start| all.slice(start..(start + size).min(all.len())))
                .collect()
        }
    }
}

#[async_trait]
impl DatabaseDriver for MemoryDatabase {
    async fn schema(&self) -> Result<Vec<TableSchema>, DatabaseError> {
        Ok(self.tables().values().map(|t| t.schema.clone()).collect())
    }

    async fn dump_table(&self, table: &TableSchema) -> Result<TableDump, DatabaseError> {
        let qualified = table.name.to_string();
        let stored = self
            .tables()
            .get(&qualified)
            .cloned()
            .ok_or_else(|| DatabaseError::UnknownTable(qualified.clone()))?;
        let columns = stored.schema.column_names();
        let mut chunks: Vec<Result<Bytes, DatabaseError>> =
            encode_rows(&stored.rows, columns.len(), self.chunk_size)
                .into_iter()
                .map(Ok)
                .collect();
        if self.broken_dumps.contains(&qualified) {
            let at = chunks.len().min(1);
            chunks.insert(
                at,
                Err(DatabaseError::Connection(format!(
                    "connection lost while dumping {qualified}"
                ))),
            );
        }

        let delay = self.dump_delay;
        let rows = futures::stream::iter(chunks)
            .then(move |chunk| async move {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                chunk
            })
            .boxed();

        Ok(TableDump {
            table: stored.schema.name.clone(),
            columns,
            rows,
        })
    }

    async fn restore(&self, dump: TableDump) -> Result<u64, DatabaseError> {
        self.restores.fetch_add(1, Ordering::SeqCst);
        let TableDump {
            table,
            columns,
            mut rows,
        } = dump;
        let format_error = |source: CopyTextError| DatabaseError::Format {
            table: table.to_string(),
            source,
        };

        // Collect everything first so a failed restore leaves the table untouched
        let mut lines = LineBuffer::new();
        let mut restored: Vec<Row> = Vec::new();
        while let Some(chunk) = rows.next().await {
            for line in lines.push(&chunk?) {
                let row = decode_row(&line).map_err(format_error)?;
                if row.len() != columns.len() {
                    return Err(format_error(CopyTextError::ColumnCount {
                        expected: columns.len(),
                        actual: row.len(),
                    }));
                }
                restored.push(row);
            }
        }
        lines.finish().map_err(format_error)?;

        let mut tables = self.tables();
        let target = tables
            .get_mut(&table.to_string())
            .ok_or_else(|| DatabaseError::UnknownTable(table.to_string()))?;
        let written = restored.len() as u64;
        target.rows = restored;
        Ok(written)
    }
}

/// Connector handing out the same in-memory database for every connection
#[derive(Debug)]
pub struct MemoryConnector {
    database: Arc<MemoryDatabase>,
    connections: Mutex<Vec<(DatabaseEngine, ConnectionInfo)>>,
}

impl MemoryConnector {
    pub fn new(database: Arc<MemoryDatabase>) -> Self {
        Self {
            database,
            connections: Mutex::new(Vec::new()),
        }
    }

    /// Every connection opened so far
    pub fn connections(&self) -> Vec<(DatabaseEngine, ConnectionInfo)> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl DatabaseConnector for MemoryConnector {
    async fn connect(
        &self,
        engine: DatabaseEngine,
        connection: &ConnectionInfo,
    ) -> Result<Arc<dyn DatabaseDriver>, DatabaseError> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((engine, connection.clone()));
        let driver: Arc<dyn DatabaseDriver> = Arc::clone(&self.database) as _;
        Ok(driver)
    }
}
