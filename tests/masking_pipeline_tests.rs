//! # Masking Pipeline Tests
//!
//! Dump → mask → restore between in-memory databases: rule application, fail-fast
//! behaviour, cancellation and the per-run table concurrency limit.

mod common;

use async_trait::async_trait;
use common::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use vandal_controller::database::{
    ColumnSchema, DatabaseDriver, DatabaseError, MemoryDatabase, TableDump, TableName,
    TableSchema,
};
use vandal_controller::masking::{MaskingError, MaskingPipeline, MaskingReport, Transformer};

fn orders_table(name: &str) -> TableSchema {
    TableSchema {
        name: TableName::new("public", name),
        columns: ["id", "card"]
            .into_iter()
            .map(|column| ColumnSchema {
                name: column.to_string(),
                data_type: "text".to_string(),
                nullable: column != "id",
                primary_key: column == "id",
            })
            .collect(),
    }
}

fn order(id: u32, card: &str) -> Vec<Option<String>> {
    vec![Some(id.to_string()), Some(card.to_string())]
}

fn source_database() -> MemoryDatabase {
    MemoryDatabase::new().with_table(users_table(), users())
}

fn empty_sink() -> Arc<MemoryDatabase> {
    Arc::new(MemoryDatabase::new().with_table(users_table(), Vec::new()))
}

/// Tracks how many restores run at the same time
struct CountingSink {
    inner: Arc<MemoryDatabase>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    limit: Option<usize>,
}

impl CountingSink {
    fn new(inner: Arc<MemoryDatabase>) -> Self {
        Self {
            inner,
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            limit: None,
        }
    }

    fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

#[async_trait]
impl DatabaseDriver for CountingSink {
    async fn schema(&self) -> Result<Vec<TableSchema>, DatabaseError> {
        self.inner.schema().await
    }

    async fn dump_table(&self, table: &TableSchema) -> Result<TableDump, DatabaseError> {
        self.inner.dump_table(table).await
    }

    async fn restore(&self, dump: TableDump) -> Result<u64, DatabaseError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let result = self.inner.restore(dump).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn max_concurrent_tables(&self) -> Option<usize> {
        self.limit
    }
}

#[tokio::test]
async fn test_rules_mask_only_their_columns() {
    let source = Arc::new(source_database());
    let sink = empty_sink();
    let pipeline = MaskingPipeline::new(
        source.clone(),
        sink.clone(),
        &[rule("users", "email", "hash"), rule("users", "nickname", "redact")],
    )
    .expect("known rules");

    let report = pipeline
        .run(&CancellationToken::new())
        .await
        .expect("masking succeeds");

    assert_eq!(report, MaskingReport { tables: 1, rows: 3 });
    assert_eq!(
        sink.rows("public.users"),
        Some(vec![
            user(1, Some(&Transformer::Hash.apply("alice@example.com")), "REDACTED"),
            user(2, None, "REDACTED"),
            user(3, Some(&Transformer::Hash.apply("carol@example.com")), "REDACTED"),
        ])
    );
    // The source is only read
    assert_eq!(source.rows("public.users"), Some(users()));
}

#[tokio::test]
async fn test_hashing_is_stable_across_runs() {
    let source: Arc<MemoryDatabase> = Arc::new(source_database());
    let rules = [rule("users", "email", "hash")];
    let first = empty_sink();
    let second = empty_sink();

    for sink in [&first, &second] {
        MaskingPipeline::new(source.clone(), sink.clone(), &rules)
            .expect("known rules")
            .run(&CancellationToken::new())
            .await
            .expect("masking succeeds");
    }

    assert_eq!(first.rows("public.users"), second.rows("public.users"));
}

#[tokio::test]
async fn test_chunked_dumps_with_escapes_are_masked() {
    let source = Arc::new(
        MemoryDatabase::new()
            .with_table(
                users_table(),
                vec![
                    user(1, Some("tab\there@example.com"), "line\nbreak"),
                    user(2, Some("back\\slash@example.com"), "\\N"),
                ],
            )
            .with_chunk_size(3),
    );
    let sink = empty_sink();

    MaskingPipeline::new(source, sink.clone(), &[rule("users", "email", "redact")])
        .expect("known rules")
        .run(&CancellationToken::new())
        .await
        .expect("masking succeeds");

    assert_eq!(
        sink.rows("public.users"),
        Some(vec![
            user(1, Some("REDACTED"), "line\nbreak"),
            user(2, Some("REDACTED"), "\\N"),
        ])
    );
}

#[tokio::test]
async fn test_unknown_rule_fails_before_reading() {
    let source = Arc::new(source_database());
    let sink = empty_sink();

    let result = MaskingPipeline::new(
        source,
        sink.clone(),
        &[rule("users", "email", "hash"), rule("users", "nickname", "shuffle")],
    );

    assert!(matches!(result, Err(MaskingError::UnknownRule(ref name)) if name == "shuffle"));
    assert_eq!(sink.restore_calls(), 0);
}

#[tokio::test]
async fn test_cancelled_token_stops_before_any_table() {
    let sink = empty_sink();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let result = MaskingPipeline::new(
        Arc::new(source_database()),
        sink.clone(),
        &[rule("users", "email", "hash")],
    )
    .expect("known rules")
    .run(&cancel)
    .await;

    assert!(matches!(result, Err(MaskingError::Cancelled)));
    assert_eq!(sink.restore_calls(), 0);
    assert_eq!(sink.rows("public.users"), Some(Vec::new()));
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_interrupts_a_running_table() {
    let source = Arc::new(source_database().with_dump_delay(Duration::from_secs(60)));
    let sink = empty_sink();
    let cancel = CancellationToken::new();
    let pipeline = MaskingPipeline::new(source, sink.clone(), &[rule("users", "email", "hash")])
        .expect("known rules");

    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        canceller.cancel();
    });
    let result = pipeline.run(&cancel).await;

    assert!(matches!(result, Err(MaskingError::Cancelled)));
    assert_eq!(sink.rows("public.users"), Some(Vec::new()));
}

#[tokio::test]
async fn test_broken_dump_fails_the_run_and_leaves_the_table() {
    let source = Arc::new(
        MemoryDatabase::new()
            .with_table(users_table(), users())
            .with_table(orders_table("orders"), vec![order(1, "4111111111111111")])
            .with_broken_dump("public.users"),
    );
    let sink = Arc::new(
        MemoryDatabase::new()
            .with_table(users_table(), vec![user(9, Some("old@example.com"), "old")])
            .with_table(orders_table("orders"), Vec::new()),
    );

    let result = MaskingPipeline::new(source, sink.clone(), &[rule("users", "email", "hash")])
        .expect("known rules")
        .run(&CancellationToken::new())
        .await;

    assert!(matches!(
        result,
        Err(MaskingError::Database(DatabaseError::Connection(_)))
    ));
    assert_eq!(
        sink.rows("public.users"),
        Some(vec![user(9, Some("old@example.com"), "old")])
    );
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_tables_respect_the_limit() {
    let mut source = MemoryDatabase::new().with_dump_delay(Duration::from_millis(100));
    let mut sink = MemoryDatabase::new();
    for name in ["orders", "refunds", "invoices", "payouts", "carts"] {
        let rows = (1..=4).map(|id| order(id, "4111111111111111")).collect();
        source = source.with_table(orders_table(name), rows);
        sink = sink.with_table(orders_table(name), Vec::new());
    }
    let sink = Arc::new(CountingSink::new(Arc::new(sink)));

    let report = MaskingPipeline::new(
        Arc::new(source),
        sink.clone(),
        &[rule("card", "card", "hash"), rule("orders", "card", "creditCard")],
    )
    .expect("known rules")
    .with_max_concurrent_tables(2)
    .run(&CancellationToken::new())
    .await
    .expect("masking succeeds");

    assert_eq!(report, MaskingReport { tables: 5, rows: 20 });
    assert_eq!(sink.peak.load(Ordering::SeqCst), 2);
    assert_eq!(
        sink.inner.rows("public.orders").map(|rows| rows[0].clone()),
        Some(order(1, &Transformer::CreditCard.apply("4111111111111111")))
    );
    assert_eq!(
        sink.inner.rows("public.refunds").map(|rows| rows[0].clone()),
        Some(order(1, "4111111111111111"))
    );
}

#[tokio::test]
async fn test_skipped_tables_stay_untouched_and_progress_reports_the_rest() {
    let source = MemoryDatabase::new()
        .with_table(orders_table("orders"), vec![order(1, "4111111111111111")])
        .with_table(orders_table("refunds"), vec![order(2, "4111111111111111")]);
    let sink = Arc::new(
        MemoryDatabase::new()
            .with_table(orders_table("orders"), vec![order(7, "already-masked")])
            .with_table(orders_table("refunds"), Vec::new()),
    );
    let (progress, mut finished) = mpsc::unbounded_channel();

    let report = MaskingPipeline::new(
        Arc::new(source),
        sink.clone(),
        &[rule("orders", "card", "creditCard"), rule("refunds", "card", "creditCard")],
    )
    .expect("known rules")
    .skipping([TableName::new("public", "orders")])
    .with_progress(progress)
    .run(&CancellationToken::new())
    .await
    .expect("masking succeeds");

    assert_eq!(report, MaskingReport { tables: 1, rows: 1 });
    assert_eq!(
        sink.rows("public.orders"),
        Some(vec![order(7, "already-masked")])
    );
    assert_eq!(sink.restore_calls(), 1);
    assert_eq!(finished.try_recv().ok(), Some(TableName::new("public", "refunds")));
    assert!(finished.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_driver_limit_applies_without_a_configured_limit() {
    let mut source = MemoryDatabase::new().with_dump_delay(Duration::from_millis(100));
    let mut sink = MemoryDatabase::new();
    for name in ["orders", "refunds", "invoices"] {
        let rows = (1..=3).map(|id| order(id, "4111111111111111")).collect();
        source = source.with_table(orders_table(name), rows);
        sink = sink.with_table(orders_table(name), Vec::new());
    }
    let sink = Arc::new(CountingSink::new(Arc::new(sink)).with_limit(1));

    let report = MaskingPipeline::new(Arc::new(source), sink.clone(), &[rule("orders", "card", "hash")])
        .expect("known rules")
        .run(&CancellationToken::new())
        .await
        .expect("masking succeeds");

    assert_eq!(report, MaskingReport { tables: 3, rows: 9 });
    assert_eq!(sink.peak.load(Ordering::SeqCst), 1);
}
