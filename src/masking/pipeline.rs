//! # Masking Pipeline
//!
//! Runs dump → mask → restore for every table of the source database, one task per
//! table. The first table error cancels the rest and fails the run.
//!
//! Each table's restore commits on its own, so a failed run can leave some tables
//! rewritten. Callers that mask in place report finished tables through
//! [`MaskingPipeline::with_progress`] and pass them back to
//! [`MaskingPipeline::skipping`] on the next attempt.

use super::{MaskingError, MaskingPlan, MaskingStream};
use crate::crd::MaskingRule;
use crate::database::{DatabaseDriver, TableDump, TableName, TableSchema};
use crate::observability;
use futures::StreamExt;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Summary of a completed run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaskingReport {
    pub tables: usize,
    pub rows: u64,
}

pub struct MaskingPipeline {
    source: Arc<dyn DatabaseDriver>,
    sink: Arc<dyn DatabaseDriver>,
    plan: Arc<MaskingPlan>,
    max_concurrent_tables: usize,
    /// Tables left out of the run
    skip: BTreeSet<TableName>,
    /// Receives every table as soon as its restore committed
    progress: Option<mpsc::UnboundedSender<TableName>>,
}

impl MaskingPipeline {
    /// Compile `rules` and build a pipeline. Fails with [`MaskingError::UnknownRule`]
    /// before anything is read from `source`.
    pub fn new(
        source: Arc<dyn DatabaseDriver>,
        sink: Arc<dyn DatabaseDriver>,
        rules: &[MaskingRule],
    ) -> Result<Self, MaskingError> {
        Ok(Self::from_plan(source, sink, MaskingPlan::compile(rules)?))
    }

    pub fn from_plan(
        source: Arc<dyn DatabaseDriver>,
        sink: Arc<dyn DatabaseDriver>,
        plan: MaskingPlan,
    ) -> Self {
        Self {
            source,
            sink,
            plan: Arc::new(plan),
            max_concurrent_tables: 0,
            skip: BTreeSet::new(),
            progress: None,
        }
    }

    /// Limit how many tables are in flight at once. Zero means unbounded, unless
    /// the source or sink driver declares a limit of its own.
    #[must_use]
    pub fn with_max_concurrent_tables(mut self, limit: usize) -> Self {
        self.max_concurrent_tables = limit;
        self
    }

    /// Leave `tables` untouched, as finished by an earlier run
    #[must_use]
    pub fn skipping(mut self, tables: impl IntoIterator<Item = TableName>) -> Self {
        self.skip.extend(tables);
        self
    }

    /// Report each table on `progress` once its restore committed, including
    /// tables that finished before another table failed the run
    #[must_use]
    pub fn with_progress(mut self, progress: mpsc::UnboundedSender<TableName>) -> Self {
        self.progress = Some(progress);
        self
    }

    /// The tightest of the configured limit and the drivers' own limits
    fn table_limit(&self) -> Option<usize> {
        [
            (self.max_concurrent_tables > 0).then_some(self.max_concurrent_tables),
            self.source.max_concurrent_tables(),
            self.sink.max_concurrent_tables(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    pub async fn run(&self, cancel: &CancellationToken) -> Result<MaskingReport, MaskingError> {
        if cancel.is_cancelled() {
            return Err(MaskingError::Cancelled);
        }
        let started = Instant::now();
        let mut tables = self.source.schema().await?;
        if !self.skip.is_empty() {
            let before = tables.len();
            tables.retain(|table| !self.skip.contains(&table.name));
            info!(
                "⏭️  Skipping {} table(s) masked by an earlier run",
                before - tables.len()
            );
        }
        info!(
            "🎭 Masking {} table(s) with {} rule(s)",
            tables.len(),
            self.plan.len()
        );

        let token = cancel.child_token();
        let limiter = self
            .table_limit()
            .map(|limit| Arc::new(Semaphore::new(limit.max(1))));

        let mut tasks = JoinSet::new();
        for table in tables {
            let source = Arc::clone(&self.source);
            let sink = Arc::clone(&self.sink);
            let plan = Arc::clone(&self.plan);
            let token = token.clone();
            let limiter = limiter.clone();
            tasks.spawn(async move {
                tokio::select! {
                    biased;
                    () = token.cancelled() => Err(MaskingError::Cancelled),
                    result = async {
                        let _permit = match limiter {
                            Some(limiter) => Some(
                                limiter
                                    .acquire_owned()
                                    .await
                                    .map_err(|_| MaskingError::Cancelled)?,
                            ),
                            None => None,
                        };
                        let rows = mask_table(source.as_ref(), sink.as_ref(), &plan, &table).await?;
                        Ok((table.name, rows))
                    } => result,
                }
            });
        }

        let mut report = MaskingReport::default();
        while let Some(joined) = tasks.join_next().await {
            let error = match joined {
                Ok(Ok((table, rows))) => {
                    if let Some(progress) = &self.progress {
                        let _ = progress.send(table);
                    }
                    report.tables += 1;
                    report.rows += rows;
                    continue;
                }
                Ok(Err(error)) => error,
                Err(join_error) => MaskingError::Task(join_error.to_string()),
            };
            warn!("❌ Masking failed, cancelling remaining tables: {}", error);
            token.cancel();
            tasks.abort_all();
            // Tables that committed before the abort still count as masked
            while let Some(joined) = tasks.join_next().await {
                if let (Ok(Ok((table, _))), Some(progress)) = (joined, &self.progress) {
                    let _ = progress.send(table);
                }
            }
            observability::metrics::increment_masking_failures_total();
            return Err(error);
        }

        observability::metrics::observe_masking_duration(started.elapsed().as_secs_f64());
        info!(
            "✅ Masked {} table(s), {} row(s) in {:?}",
            report.tables,
            report.rows,
            started.elapsed()
        );
        Ok(report)
    }
}

async fn mask_table(
    source: &dyn DatabaseDriver,
    sink: &dyn DatabaseDriver,
    plan: &MaskingPlan,
    table: &TableSchema,
) -> Result<u64, MaskingError> {
    let dump = source.dump_table(table).await?;
    let transformers = plan.for_columns(&dump.table, &dump.columns);
    let masked_columns = transformers.iter().filter(|t| t.is_some()).count();
    debug!(
        "Masking {} ({} of {} column(s) transformed)",
        dump.table,
        masked_columns,
        dump.columns.len()
    );

    let masked = TableDump {
        table: dump.table.clone(),
        columns: dump.columns,
        rows: MaskingStream::new(dump.table, dump.rows, transformers).boxed(),
    };
    let rows = sink.restore(masked).await?;
    observability::metrics::increment_masked_rows_total(rows);
    Ok(rows)
}
