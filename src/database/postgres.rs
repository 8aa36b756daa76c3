//! # PostgreSQL Driver
//!
//! Streams tables with `COPY ... TO STDOUT` and restores them with
//! `COPY ... FROM STDIN`. Each dump and restore uses its own connection so tables
//! can be transferred concurrently.

use super::{
    ColumnSchema, ConnectionInfo, DatabaseDriver, DatabaseError, TableDump, TableName,
    TableSchema,
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use pg_escape::quote_identifier;
use tokio_postgres::{Client, Config, NoTls};
use tracing::{debug, warn};

const SCHEMA_QUERY: &str = r"
SELECT c.table_schema::text AS table_schema,
       c.table_name::text AS table_name,
       c.column_name::text AS column_name,
       c.data_type::text AS data_type,
       c.is_nullable = 'YES' AS nullable,
       EXISTS (
           SELECT 1
           FROM information_schema.table_constraints tc
           JOIN information_schema.key_column_usage kcu
             ON tc.constraint_name = kcu.constraint_name
            AND tc.table_schema = kcu.table_schema
            AND tc.table_name = kcu.table_name
           WHERE tc.constraint_type = 'PRIMARY KEY'
             AND tc.table_schema = c.table_schema
             AND tc.table_name = c.table_name
             AND kcu.column_name = c.column_name
       ) AS primary_key
FROM information_schema.columns c
JOIN information_schema.tables t
  ON t.table_schema = c.table_schema
 AND t.table_name = c.table_name
WHERE t.table_type = 'BASE TABLE'
  AND c.table_schema NOT IN ('pg_catalog', 'information_schema')
ORDER BY c.table_schema, c.table_name, c.ordinal_position
";

/// Driver for one PostgreSQL database
#[derive(Clone)]
pub struct PostgresDriver {
    config: Config,
}

impl std::fmt::Debug for PostgresDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresDriver")
            .field("host", &self.config.get_hosts())
            .field("dbname", &self.config.get_dbname())
            .finish_non_exhaustive()
    }
}

fn quote_table(table: &TableName) -> String {
    format!(
        "{}.{}",
        quote_identifier(&table.schema),
        quote_identifier(&table.name)
    )
}

fn quote_columns(columns: &[String]) -> String {
    columns
        .iter()
        .map(|c| quote_identifier(c).into_owned())
        .collect::<Vec<_>>()
        .join(", ")
}

impl PostgresDriver {
    pub fn new(connection: &ConnectionInfo) -> Self {
        let mut config = Config::new();
        config
            .host(&connection.host)
            .port(connection.port)
            .user(&connection.user)
            .password(&connection.password)
            .dbname(&connection.dbname)
            .application_name("vandal");
        Self { config }
    }

    async fn connect(&self) -> Result<Client, DatabaseError> {
        let (client, connection) = self.config.connect(NoTls).await?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!("Postgres connection closed with error: {}", e);
            }
        });
        Ok(client)
    }
}

#[async_trait]
impl DatabaseDriver for PostgresDriver {
    async fn schema(&self) -> Result<Vec<TableSchema>, DatabaseError> {
        let client = self.connect().await?;
        let rows = client.query(SCHEMA_QUERY, &[]).await?;

        let mut tables: Vec<TableSchema> = Vec::new();
        for row in rows {
            let name = TableName::new(
                row.try_get::<_, String>("table_schema")?,
                row.try_get::<_, String>("table_name")?,
            );
            let column = ColumnSchema {
                name: row.try_get("column_name")?,
                data_type: row.try_get("data_type")?,
                nullable: row.try_get("nullable")?,
                primary_key: row.try_get("primary_key")?,
            };
            match tables.last_mut() {
                Some(table) if table.name == name => table.columns.push(column),
                _ => tables.push(TableSchema {
                    name,
                    columns: vec![column],
                }),
            }
        }
        debug!("Discovered {} tables", tables.len());
        Ok(tables)
    }

    async fn dump_table(&self, table: &TableSchema) -> Result<TableDump, DatabaseError> {
        let client = self.connect().await?;
        let columns = table.column_names();
        let statement = format!(
            "COPY {} ({}) TO STDOUT",
            quote_table(&table.name),
            quote_columns(&columns)
        );
        let stream = client.copy_out(statement.as_str()).await?;

        // The client moves into the stream so the connection lives as long as the dump
        let rows = stream
            .map(move |chunk| {
                let _connection = &client;
                chunk.map_err(DatabaseError::from)
            })
            .boxed();

        Ok(TableDump {
            table: table.name.clone(),
            columns,
            rows,
        })
    }

    async fn restore(&self, dump: TableDump) -> Result<u64, DatabaseError> {
        let TableDump {
            table,
            columns,
            mut rows,
        } = dump;
        let target = quote_table(&table);

        let mut client = self.connect().await?;
        let transaction = client.transaction().await?;
        // Skip foreign key triggers while the table is rewritten
        transaction
            .batch_execute("SET LOCAL session_replication_role = replica")
            .await?;
        transaction
            .batch_execute(&format!("DELETE FROM {target}"))
            .await?;

        let statement = format!("COPY {target} ({}) FROM STDIN", quote_columns(&columns));
        let sink = transaction.copy_in::<_, Bytes>(statement.as_str()).await?;
        futures::pin_mut!(sink);
        while let Some(chunk) = rows.next().await {
            sink.send(chunk?).await?;
        }
        let written = sink.as_mut().finish().await?;
        transaction.commit().await?;

        debug!("Restored {} rows into {}", written, table);
        Ok(written)
    }
}
