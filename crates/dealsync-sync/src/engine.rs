use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dealsync_adapters::{BitrixClient, DealFieldCatalog, DealListQuery, ListPage};
use dealsync_core::{
    Checkpoint, Cursor, DealRow, FieldMapping, RawDeal, ReferenceMap, SyncCounters, SyncStats,
};
use dealsync_storage::{sleep_or_cancel, CheckpointStore, SelectError};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::{partition_stream, EndpointMode};
use crate::error::SyncError;
use crate::resolver::ReferenceResolver;
use crate::sink::DealSink;

/// Pagination, retry and throttling knobs for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchSettings {
    /// Lower bound on the deal creation date for a fresh run.
    pub created_since: String,
    pub max_attempts: u32,
    pub retry_delay: Duration,
    pub page_delay: Duration,
    pub large_volume_delay: Duration,
    /// Once this many records have been processed, pages are spaced by `large_volume_delay`.
    pub large_volume_threshold: u64,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            created_since: "2023-11-01".to_string(),
            max_attempts: 20,
            retry_delay: Duration::from_secs(30),
            page_delay: Duration::from_secs(2),
            large_volume_delay: Duration::from_secs(30),
            large_volume_threshold: 20_000,
        }
    }
}

impl FetchSettings {
    fn delay_after(&self, records_processed: u64) -> Duration {
        if records_processed >= self.large_volume_threshold {
            self.large_volume_delay
        } else {
            self.page_delay
        }
    }
}

/// States of one pagination stream. Each state owns the last committed checkpoint.
#[derive(Debug)]
enum FetchState {
    Init,
    FetchPage(Checkpoint),
    RetryWait(Checkpoint),
    ResolveAndCommit(Checkpoint, ListPage<RawDeal>),
    Done(Checkpoint),
    Aborted(Checkpoint, SelectError),
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamSummary {
    pub stream: String,
    pub run_id: Uuid,
    pub resumed: bool,
    pub pages_committed: u64,
    pub records_processed: u64,
    pub final_cursor: Cursor,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub streams: Vec<StreamSummary>,
    pub stats: SyncStats,
}

/// Fetch → resolve → upsert → checkpoint, page by page.
pub struct SyncEngine {
    client: BitrixClient,
    sink: Arc<dyn DealSink>,
    checkpoints: Arc<dyn CheckpointStore>,
    resolver: ReferenceResolver,
    settings: FetchSettings,
    mode: EndpointMode,
    stream: String,
}

impl SyncEngine {
    pub fn new(
        client: BitrixClient,
        sink: Arc<dyn DealSink>,
        checkpoints: Arc<dyn CheckpointStore>,
        mapping: FieldMapping,
        settings: FetchSettings,
    ) -> Result<Self, SyncError> {
        mapping.validate()?;
        Ok(Self {
            client,
            sink,
            checkpoints,
            resolver: ReferenceResolver::new(mapping, ", "),
            settings,
            mode: EndpointMode::Mirrors,
            stream: "deals".to_string(),
        })
    }

    pub fn with_streams(mut self, mode: EndpointMode, stream: impl Into<String>) -> Self {
        self.mode = mode;
        self.stream = stream.into();
        self
    }

    pub fn with_picklist_delimiter(mut self, delimiter: impl Into<String>) -> Self {
        self.resolver = ReferenceResolver::new(self.resolver.mapping().clone(), delimiter);
        self
    }

    fn mapping(&self) -> &FieldMapping {
        self.resolver.mapping()
    }

    fn counters(&self) -> &Arc<SyncCounters> {
        self.client.selector().counters()
    }

    pub async fn run(&self, cancel: &CancellationToken) -> Result<SyncRunSummary, SyncError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let baseline = self.counters().snapshot();
        let span = info_span!("sync_run", %run_id, stream = %self.stream);

        async move {
            info!(mode = ?self.mode, endpoints = self.client.selector().endpoints().len(), "sync run starting");

            let catalog = self.remote_catalog(cancel).await?;
            let refs = self
                .resolver
                .load(&self.client, catalog.as_ref(), cancel)
                .await
                .map_err(|_| self.cancelled(&self.stream, None))?;

            let mut streams = Vec::new();
            for (stream, client) in self.streams() {
                let summary = self
                    .run_stream(&stream, &client, &refs, run_id, cancel)
                    .instrument(info_span!("stream", %stream))
                    .await?;
                streams.push(summary);
            }

            let stats = self.counters().snapshot().since(&baseline);
            info!(
                pages = stats.pages_fetched,
                upserted = stats.records_upserted,
                skipped = stats.records_skipped,
                retries = stats.fetch_retries,
                rate_limit_waits = stats.rate_limit_waits,
                endpoint_failures = stats.endpoint_failures,
                "sync run complete"
            );
            Ok(SyncRunSummary {
                run_id,
                started_at,
                finished_at: Utc::now(),
                streams,
                stats,
            })
        }
        .instrument(span)
        .await
    }

    /// Validates the mapping against `crm.deal.fields`. An unreachable catalog is skipped.
    async fn remote_catalog(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Option<DealFieldCatalog>, SyncError> {
        match self.client.deal_fields(cancel).await {
            Ok(catalog) => {
                self.mapping()
                    .validate_against_remote(&catalog.names(), |field| catalog.is_enumeration(field))?;
                Ok(Some(catalog))
            }
            Err(SelectError::Cancelled) => Err(self.cancelled(&self.stream, None)),
            Err(err) => {
                warn!(error = %err, "field catalog unavailable; skipping remote mapping validation");
                Ok(None)
            }
        }
    }

    fn streams(&self) -> Vec<(String, BitrixClient)> {
        match self.mode {
            EndpointMode::Mirrors => vec![(self.stream.clone(), self.client.clone())],
            EndpointMode::Partitions => (0..self.client.selector().endpoints().len())
                .filter_map(|index| {
                    self.client
                        .for_endpoint(index)
                        .map(|client| (partition_stream(&self.stream, index), client))
                })
                .collect(),
        }
    }

    fn cancelled(&self, stream: &str, last_cursor: Option<Cursor>) -> SyncError {
        SyncError::Cancelled {
            stream: stream.to_string(),
            last_cursor,
        }
    }

    async fn starting_checkpoint(
        &self,
        stream: &str,
        run_id: Uuid,
    ) -> Result<(Checkpoint, bool), SyncError> {
        let stored = self
            .checkpoints
            .load(stream)
            .await
            .map_err(|error| SyncError::Checkpoint {
                stream: stream.to_string(),
                error,
            })?;
        match stored {
            Some(checkpoint) if !checkpoint.completed => {
                info!(
                    run_id = %checkpoint.run_id,
                    cursor = %checkpoint.cursor,
                    pages = checkpoint.pages_committed,
                    records = checkpoint.records_processed,
                    "resuming from checkpoint"
                );
                Ok((checkpoint, true))
            }
            Some(previous) => {
                info!(previous_run = %previous.run_id, "previous run completed; starting fresh");
                Ok((Checkpoint::begin(run_id, Cursor::start()), false))
            }
            None => Ok((Checkpoint::begin(run_id, Cursor::start()), false)),
        }
    }

    async fn save_checkpoint(&self, stream: &str, checkpoint: &Checkpoint) -> Result<(), SyncError> {
        self.checkpoints
            .save(stream, checkpoint)
            .await
            .map_err(|error| SyncError::Checkpoint {
                stream: stream.to_string(),
                error,
            })
    }

    async fn run_stream(
        &self,
        stream: &str,
        client: &BitrixClient,
        refs: &ReferenceMap,
        run_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<StreamSummary, SyncError> {
        let select = self.mapping().select_fields();
        let counters = Arc::clone(self.counters());
        let mut resumed = false;
        let mut attempts = 0u32;
        let mut state = FetchState::Init;

        loop {
            state = match state {
                FetchState::Init => {
                    let (checkpoint, was_resumed) = self.starting_checkpoint(stream, run_id).await?;
                    resumed = was_resumed;
                    FetchState::FetchPage(checkpoint)
                }

                FetchState::FetchPage(checkpoint) => {
                    if cancel.is_cancelled() {
                        return Err(self.cancelled(stream, Some(checkpoint.cursor)));
                    }
                    let query = DealListQuery {
                        select: select.clone(),
                        created_since: self.settings.created_since.clone(),
                        cursor: checkpoint.cursor.clone(),
                    };
                    match client.list_deals(&query, cancel).await {
                        Ok(page) => {
                            attempts = 0;
                            counters.page_fetched();
                            if page.items.is_empty() {
                                FetchState::Done(checkpoint.finish(0))
                            } else {
                                FetchState::ResolveAndCommit(checkpoint, page)
                            }
                        }
                        Err(SelectError::Cancelled) => {
                            return Err(self.cancelled(stream, Some(checkpoint.cursor)));
                        }
                        Err(err) => {
                            attempts += 1;
                            warn!(
                                cursor = %checkpoint.cursor,
                                attempt = attempts,
                                max_attempts = self.settings.max_attempts,
                                error = %err,
                                "page fetch failed"
                            );
                            if attempts >= self.settings.max_attempts {
                                FetchState::Aborted(checkpoint, err)
                            } else if matches!(err, SelectError::RateLimited { .. }) {
                                // The selector already waited out the rate limit.
                                counters.fetch_retry();
                                FetchState::FetchPage(checkpoint)
                            } else {
                                FetchState::RetryWait(checkpoint)
                            }
                        }
                    }
                }

                FetchState::RetryWait(checkpoint) => {
                    counters.fetch_retry();
                    if !sleep_or_cancel(self.settings.retry_delay, cancel).await {
                        return Err(self.cancelled(stream, Some(checkpoint.cursor)));
                    }
                    FetchState::FetchPage(checkpoint)
                }

                FetchState::ResolveAndCommit(checkpoint, page) => {
                    let page_records = page.items.len() as u64;
                    let rows = self.project_page(refs, page.items);
                    let written = self.sink.upsert_page(&rows).await.map_err(|error| {
                        SyncError::Store {
                            context: format!("stream `{stream}` page at cursor {}", checkpoint.cursor),
                            error,
                        }
                    })?;
                    counters.records_upserted(written);

                    match page.next {
                        Some(next) if next != checkpoint.cursor => {
                            let advanced = checkpoint.advance(next, page_records).map_err(|err| {
                                SyncError::Checkpoint {
                                    stream: stream.to_string(),
                                    error: err.into(),
                                }
                            })?;
                            self.save_checkpoint(stream, &advanced).await?;
                            info!(
                                cursor = %advanced.cursor,
                                pages = advanced.pages_committed,
                                records = advanced.records_processed,
                                written,
                                "page committed"
                            );
                            let delay = self.settings.delay_after(advanced.records_processed);
                            if !sleep_or_cancel(delay, cancel).await {
                                return Err(self.cancelled(stream, Some(advanced.cursor)));
                            }
                            FetchState::FetchPage(advanced)
                        }
                        Some(next) => {
                            warn!(cursor = %next, "remote repeated the current cursor; ending stream");
                            FetchState::Done(checkpoint.finish(page_records))
                        }
                        None => FetchState::Done(checkpoint.finish(page_records)),
                    }
                }

                FetchState::Done(checkpoint) => {
                    self.save_checkpoint(stream, &checkpoint).await?;
                    info!(
                        pages = checkpoint.pages_committed,
                        records = checkpoint.records_processed,
                        "stream complete"
                    );
                    return Ok(StreamSummary {
                        stream: stream.to_string(),
                        run_id: checkpoint.run_id,
                        resumed,
                        pages_committed: checkpoint.pages_committed,
                        records_processed: checkpoint.records_processed,
                        final_cursor: checkpoint.cursor,
                    });
                }

                FetchState::Aborted(checkpoint, last_error) => {
                    error!(
                        attempts,
                        cursor = %checkpoint.cursor,
                        error = %last_error,
                        "fetch attempts exhausted; aborting stream"
                    );
                    return Err(SyncError::Aborted {
                        stream: stream.to_string(),
                        attempts,
                        last_cursor: checkpoint.cursor,
                        last_error,
                    });
                }
            };
        }
    }

    fn project_page(&self, refs: &ReferenceMap, deals: Vec<RawDeal>) -> Vec<DealRow> {
        let mut rows = Vec::with_capacity(deals.len());
        let mut skipped = 0u64;
        for deal in deals {
            let resolved = self.resolver.resolve(refs, deal);
            match self.mapping().project(&resolved) {
                Ok(row) => rows.push(row),
                Err(err) => {
                    skipped += 1;
                    warn!(error = %err, "skipping record without a usable id");
                }
            }
        }
        if skipped > 0 {
            self.counters().records_skipped(skipped);
        }
        rows
    }
}
