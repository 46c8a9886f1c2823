use std::sync::Arc;
use std::time::Duration;

use dealsync_adapters::BitrixClient;
use dealsync_core::{DealId, DealRow, FieldMapping, ReferenceMap};
use dealsync_storage::SelectError;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

use crate::error::SyncError;
use crate::resolver::ReferenceResolver;
use crate::sink::DealSink;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SingleDealOutcome {
    Synced(DealRow),
    /// The CRM no longer has the deal; nothing was written.
    Missing,
}

#[derive(Debug)]
struct CachedReferences {
    loaded_at: Instant,
    refs: Arc<ReferenceMap>,
}

/// Re-syncs one deal at a time, reusing reference data until it is `ttl` old.
pub struct DealUpdater {
    client: BitrixClient,
    sink: Arc<dyn DealSink>,
    resolver: ReferenceResolver,
    ttl: Duration,
    cache: RwLock<Option<CachedReferences>>,
    reload: Mutex<()>,
}

impl DealUpdater {
    pub fn new(
        client: BitrixClient,
        sink: Arc<dyn DealSink>,
        mapping: FieldMapping,
        picklist_delimiter: impl Into<String>,
        ttl: Duration,
    ) -> Result<Self, SyncError> {
        mapping.validate()?;
        Ok(Self {
            client,
            sink,
            resolver: ReferenceResolver::new(mapping, picklist_delimiter),
            ttl,
            cache: RwLock::new(None),
            reload: Mutex::new(()),
        })
    }

    /// Reference data no older than `ttl`. While one request reloads it, others keep
    /// using the previous map; only the very first load makes callers wait.
    pub async fn references(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Arc<ReferenceMap>, SyncError> {
        let stale = match self.cache.read().await.as_ref() {
            Some(cached) if cached.loaded_at.elapsed() < self.ttl => {
                return Ok(Arc::clone(&cached.refs))
            }
            Some(cached) => Some(Arc::clone(&cached.refs)),
            None => None,
        };

        let _reloading = match (self.reload.try_lock(), stale) {
            (Ok(guard), _) => guard,
            (Err(_), Some(stale)) => return Ok(stale),
            (Err(_), None) => self.reload.lock().await,
        };
        // A reload may have finished while we waited for the lock.
        if let Some(cached) = self.cache.read().await.as_ref() {
            if cached.loaded_at.elapsed() < self.ttl {
                return Ok(Arc::clone(&cached.refs));
            }
        }

        let catalog = match self.client.deal_fields(cancel).await {
            Ok(catalog) => Some(catalog),
            Err(SelectError::Cancelled) => return Err(SelectError::Cancelled.into()),
            Err(err) => {
                warn!(error = %err, "field catalog unavailable; picklists stay raw");
                None
            }
        };
        let refs = Arc::new(self.resolver.load(&self.client, catalog.as_ref(), cancel).await?);
        *self.cache.write().await = Some(CachedReferences {
            loaded_at: Instant::now(),
            refs: Arc::clone(&refs),
        });
        Ok(refs)
    }

    /// Fetches the full deal, resolves it with cached reference data and upserts it.
    pub async fn sync_deal(
        &self,
        id: DealId,
        cancel: &CancellationToken,
    ) -> Result<SingleDealOutcome, SyncError> {
        async move {
            let Some(deal) = self.client.get_deal(id, cancel).await? else {
                warn!("deal not found remotely; skipping");
                return Ok(SingleDealOutcome::Missing);
            };
            let refs = self.references(cancel).await?;
            let resolved = self.resolver.resolve(&refs, deal);
            let row = self.resolver.mapping().project(&resolved)?;
            self.sink
                .upsert_one(&row)
                .await
                .map_err(|error| SyncError::Store {
                    context: format!("deal {id}"),
                    error,
                })?;
            self.client.selector().counters().records_upserted(1);
            info!("deal synced");
            Ok(SingleDealOutcome::Synced(row))
        }
        .instrument(info_span!("sync_deal", deal_id = id))
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use dealsync_core::SyncCounters;
    use dealsync_storage::testing::{Scripted, ScriptedTransport};
    use dealsync_storage::{EndpointSelector, HttpResponse, RateLimitPolicy};
    use serde_json::json;

    #[derive(Default)]
    struct RecordingSink {
        rows: Mutex<Vec<DealRow>>,
    }

    #[async_trait]
    impl DealSink for RecordingSink {
        async fn upsert_page(&self, rows: &[DealRow]) -> anyhow::Result<u64> {
            self.rows.lock().unwrap().extend_from_slice(rows);
            Ok(rows.len() as u64)
        }
    }

    fn updater(transport: Arc<ScriptedTransport>, sink: Arc<RecordingSink>) -> DealUpdater {
        let selector = EndpointSelector::new(
            vec!["https://crm.example/rest/1/hook".to_string()],
            transport,
            RateLimitPolicy::default(),
            Arc::new(SyncCounters::default()),
        );
        DealUpdater::new(
            BitrixClient::new(selector),
            sink,
            FieldMapping::default(),
            ", ",
            Duration::from_secs(600),
        )
        .expect("updater")
    }

    fn script(transport: &ScriptedTransport) {
        transport.always(
            "crm.dealcategory.list",
            Scripted::ok(json!({"result": [{"ID": "1", "NAME": "Retail"}]})),
        );
        transport.always(
            "crm.dealcategory.default.get",
            Scripted::ok(json!({"result": {"ID": "0", "NAME": "General"}})),
        );
        transport.always(
            "crm.dealcategory.stage.list?id=1",
            Scripted::ok(json!({"result": [{"STATUS_ID": "C1:WON", "NAME": "Won"}]})),
        );
        transport.always("crm.dealcategory.stage.list?id=0", Scripted::ok(json!({"result": []})));
        transport.always(
            "crm.deal.get?id=12",
            Scripted::ok(json!({"result": {
                "ID": "12",
                "TITLE": "Warehouse lease",
                "CATEGORY_ID": "1",
                "STAGE_ID": "C1:WON",
                "DATE_CREATE": "2024-02-01T09:00:00+00:00"
            }})),
        );
        transport.always(
            "crm.deal.get?id=13",
            Scripted::Reply(HttpResponse::json(
                400,
                &json!({"error": "", "error_description": "Not found"}),
            )),
        );
    }

    #[tokio::test(start_paused = true)]
    async fn syncs_one_deal_and_caches_references() {
        let transport = Arc::new(ScriptedTransport::new());
        script(&transport);
        let sink = Arc::new(RecordingSink::default());
        let updater = updater(Arc::clone(&transport), Arc::clone(&sink));
        let cancel = CancellationToken::new();

        let outcome = updater.sync_deal(12, &cancel).await.expect("sync");
        let SingleDealOutcome::Synced(row) = outcome else {
            panic!("expected a synced row");
        };
        assert_eq!(row.stage.as_deref(), Some("Won"));
        assert_eq!(row.category.as_deref(), Some("Retail"));

        updater.sync_deal(12, &cancel).await.expect("second sync");
        assert_eq!(transport.count_matching("crm.dealcategory.list"), 1);
        assert_eq!(sink.rows.lock().unwrap().len(), 2);

        tokio::time::advance(Duration::from_secs(601)).await;
        updater.sync_deal(12, &cancel).await.expect("after ttl");
        assert_eq!(transport.count_matching("crm.dealcategory.list"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn throttled_reload_does_not_block_other_pushes() {
        let transport = Arc::new(ScriptedTransport::new());
        script(&transport);
        let updater = updater(Arc::clone(&transport), Arc::new(RecordingSink::default()));
        let cancel = CancellationToken::new();
        updater.sync_deal(12, &cancel).await.expect("warm cache");

        tokio::time::advance(Duration::from_secs(601)).await;
        transport.enqueue("crm.dealcategory.list", Scripted::rate_limited(Some("30")));
        let started = Instant::now();
        let (reloading, concurrent) = tokio::join!(
            async { updater.sync_deal(12, &cancel).await.map(|_| Instant::now()) },
            async { updater.sync_deal(12, &cancel).await.map(|_| Instant::now()) },
        );

        assert!(reloading.expect("reloading push") - started >= Duration::from_secs(30));
        assert!(concurrent.expect("concurrent push") - started < Duration::from_secs(1));
        assert_eq!(transport.count_matching("crm.dealcategory.list"), 3);
    }

    #[tokio::test]
    async fn missing_deal_writes_nothing() {
        let transport = Arc::new(ScriptedTransport::new());
        script(&transport);
        let sink = Arc::new(RecordingSink::default());
        let outcome = updater(Arc::clone(&transport), Arc::clone(&sink))
            .sync_deal(13, &CancellationToken::new())
            .await
            .expect("lookup");
        assert_eq!(outcome, SingleDealOutcome::Missing);
        assert!(sink.rows.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unreachable_crm_is_a_fetch_error() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.always("crm.deal.get", Scripted::status(503));
        let err = updater(transport, Arc::new(RecordingSink::default()))
            .sync_deal(12, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Fetch(SelectError::Exhausted { .. })), "got {err}");
    }
}
