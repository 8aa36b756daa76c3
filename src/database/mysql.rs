//! # MySQL Driver
//!
//! Dumps select every column cast to CHAR and encode the rows in COPY text format,
//! so MySQL dumps flow through the same masking path as PostgreSQL ones.
//!
//! A table in flight holds one pooled connection for its dump and, when masking in
//! place, a second one for its restore. The pool is sized for that and the driver
//! reports its table limit so the pipeline never runs more tables than it has
//! connections for.

use super::copy_text::{decode_row, encode_row, CopyTextError, LineBuffer};
use super::{
    ColumnSchema, ConnectionInfo, DatabaseDriver, DatabaseError, TableDump, TableName,
    TableSchema,
};
use crate::constants::DEFAULT_MASKING_MAX_CONCURRENT_TABLES;
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions, MySqlRow};
use sqlx::Row;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

const SCHEMA_QUERY: &str = r"
SELECT CAST(c.TABLE_SCHEMA AS CHAR) AS table_schema,
       CAST(c.TABLE_NAME AS CHAR) AS table_name,
       CAST(c.COLUMN_NAME AS CHAR) AS column_name,
       CAST(c.DATA_TYPE AS CHAR) AS data_type,
       CAST(c.IS_NULLABLE = 'YES' AS SIGNED) AS nullable,
       CAST(c.COLUMN_KEY = 'PRI' AS SIGNED) AS primary_key
FROM information_schema.COLUMNS c
JOIN information_schema.TABLES t
  ON t.TABLE_SCHEMA = c.TABLE_SCHEMA
 AND t.TABLE_NAME = c.TABLE_NAME
WHERE t.TABLE_TYPE = 'BASE TABLE'
  AND c.TABLE_SCHEMA = DATABASE()
ORDER BY c.TABLE_NAME, c.ORDINAL_POSITION
";

/// Rows buffered between the dump query and its consumer
const DUMP_BUFFER_ROWS: usize = 256;

/// Dump plus restore
const CONNECTIONS_PER_TABLE: u32 = 2;

/// Driver for one MySQL database
#[derive(Debug, Clone)]
pub struct MySqlDriver {
    pool: MySqlPool,
    /// Tables served at once
    tables: usize,
}

/// Tables served at once for a configured limit, where zero means no limit
fn table_limit(max_concurrent_tables: usize) -> usize {
    if max_concurrent_tables == 0 {
        DEFAULT_MASKING_MAX_CONCURRENT_TABLES
    } else {
        max_concurrent_tables
    }
}

/// Pool size for `tables` tables in flight, plus one for schema queries
fn pool_size(tables: usize) -> u32 {
    u32::try_from(tables)
        .unwrap_or(u32::MAX)
        .saturating_mul(CONNECTIONS_PER_TABLE)
        .saturating_add(1)
}

fn quote_ident(identifier: &str) -> String {
    format!("`{}`", identifier.replace('`', "``"))
}

fn quote_table(table: &TableName) -> String {
    format!("{}.{}", quote_ident(&table.schema), quote_ident(&table.name))
}

fn encode_mysql_row(row: &MySqlRow, width: usize) -> Result<Bytes, DatabaseError> {
    let mut values: Vec<Option<String>> = Vec::with_capacity(width);
    for i in 0..width {
        values.push(row.try_get(i)?);
    }
    let mut line = String::new();
    encode_row(&values, &mut line);
    Ok(Bytes::from(line))
}

impl MySqlDriver {
    /// Connect with a pool large enough for `max_concurrent_tables` tables
    pub async fn connect(
        connection: &ConnectionInfo,
        max_concurrent_tables: usize,
    ) -> Result<Self, DatabaseError> {
        let tables = table_limit(max_concurrent_tables);
        let options = MySqlConnectOptions::new()
            .host(&connection.host)
            .port(connection.port)
            .username(&connection.user)
            .password(&connection.password)
            .database(&connection.dbname);
        let pool = MySqlPoolOptions::new()
            .max_connections(pool_size(tables))
            .connect_with(options)
            .await?;
        debug!(
            "MySQL pool for {} sized for {} table(s) at once",
            connection.dbname, tables
        );
        Ok(Self { pool, tables })
    }
}

#[async_trait]
impl DatabaseDriver for MySqlDriver {
    fn max_concurrent_tables(&self) -> Option<usize> {
        Some(self.tables)
    }

    async fn schema(&self) -> Result<Vec<TableSchema>, DatabaseError> {
        let rows = sqlx::query(SCHEMA_QUERY).fetch_all(&self.pool).await?;

        let mut tables: Vec<TableSchema> = Vec::new();
        for row in rows {
            let name = TableName::new(
                row.try_get::<String, _>("table_schema")?,
                row.try_get::<String, _>("table_name")?,
            );
            let column = ColumnSchema {
                name: row.try_get("column_name")?,
                data_type: row.try_get("data_type")?,
                nullable: row.try_get::<i64, _>("nullable")? != 0,
                primary_key: row.try_get::<i64, _>("primary_key")? != 0,
            };
            match tables.last_mut() {
                Some(table) if table.name == name => table.columns.push(column),
                _ => tables.push(TableSchema {
                    name,
                    columns: vec![column],
                }),
            }
        }
        Ok(tables)
    }

    async fn dump_table(&self, table: &TableSchema) -> Result<TableDump, DatabaseError> {
        let columns = table.column_names();
        let select = format!(
            "SELECT {} FROM {}",
            columns
                .iter()
                .map(|c| format!("CAST({} AS CHAR)", quote_ident(c)))
                .collect::<Vec<_>>()
                .join(", "),
            quote_table(&table.name)
        );
        let width = columns.len();
        let pool = self.pool.clone();
        let (tx, rx) = tokio::sync::mpsc::channel(DUMP_BUFFER_ROWS);

        tokio::spawn(async move {
            let mut rows = sqlx::query(&select).fetch(&pool);
            while let Some(row) = rows.next().await {
                let item = row
                    .map_err(DatabaseError::from)
                    .and_then(|row| encode_mysql_row(&row, width));
                let failed = item.is_err();
                // A closed receiver means the consumer gave up
                if tx.send(item).await.is_err() || failed {
                    break;
                }
            }
        });

        Ok(TableDump {
            table: table.name.clone(),
            columns,
            rows: ReceiverStream::new(rx).boxed(),
        })
    }

    async fn restore(&self, dump: TableDump) -> Result<u64, DatabaseError> {
        let TableDump {
            table,
            columns,
            mut rows,
        } = dump;
        let target = quote_table(&table);
        let insert = format!(
            "INSERT INTO {target} ({}) VALUES ({})",
            columns
                .iter()
                .map(|c| quote_ident(c))
                .collect::<Vec<_>>()
                .join(", "),
            vec!["?"; columns.len()].join(", ")
        );
        let format_error = |source: CopyTextError| DatabaseError::Format {
            table: table.to_string(),
            source,
        };

        let mut transaction = self.pool.begin().await?;
        sqlx::query("SET FOREIGN_KEY_CHECKS = 0")
            .execute(&mut *transaction)
            .await?;
        sqlx::query(&format!("DELETE FROM {target}"))
            .execute(&mut *transaction)
            .await?;

        let mut lines = LineBuffer::new();
        let mut written = 0u64;
        while let Some(chunk) = rows.next().await {
            for line in lines.push(&chunk?) {
                let values = decode_row(&line).map_err(format_error)?;
                if values.len() != columns.len() {
                    return Err(format_error(CopyTextError::ColumnCount {
                        expected: columns.len(),
                        actual: values.len(),
                    }));
                }
                let mut query = sqlx::query(&insert);
                for value in values {
                    query = query.bind(value);
                }
                query.execute(&mut *transaction).await?;
                written += 1;
            }
        }
        lines.finish().map_err(format_error)?;

        sqlx::query("SET FOREIGN_KEY_CHECKS = 1")
            .execute(&mut *transaction)
            .await?;
        transaction.commit().await?;

        debug!("Restored {} rows into {}", written, table);
        Ok(written)
    }
}
