use std::sync::Arc;

use dealsync_adapters::{BitrixClient, DealListQuery};
use dealsync_core::{Cursor, SyncCounters};
use dealsync_storage::testing::{Scripted, ScriptedTransport};
use dealsync_storage::{EndpointError, EndpointSelector, RateLimitPolicy, SelectError};
use serde_json::json;
use tokio_util::sync::CancellationToken;

const PRIMARY: &str = "https://crm.example/rest/1/primary";
const MIRROR: &str = "https://crm.example/rest/1/mirror";

fn client(transport: Arc<ScriptedTransport>) -> BitrixClient {
    BitrixClient::new(EndpointSelector::new(
        vec![PRIMARY.to_string(), MIRROR.to_string()],
        transport,
        RateLimitPolicy::default(),
        Arc::new(SyncCounters::default()),
    ))
}

#[tokio::test]
async fn deal_list_sends_filter_and_cursor() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.always(
        "crm.deal.list",
        Scripted::ok(json!({"result": [{"ID": "7", "TITLE": "Roof"}], "next": 100})),
    );

    let query = DealListQuery {
        select: vec!["ID".into(), "TITLE".into()],
        created_since: "2023-11-01".into(),
        cursor: Cursor::new("50"),
    };
    let page = client(Arc::clone(&transport))
        .list_deals(&query, &CancellationToken::new())
        .await
        .expect("page");
    assert_eq!(page.items.len(), 1);
    assert_eq!(page.next, Some(Cursor::new("100")));

    let requests = transport.requests();
    assert_eq!(requests.len(), 1);
    let target = &requests[0].target;
    assert!(target.starts_with(&format!("{PRIMARY}/crm.deal.list?")));
    assert!(target.contains("filter[>=DATE_CREATE]=2023-11-01"));
    assert!(target.contains("start=50"));
}

#[tokio::test]
async fn categories_follow_next_across_pages() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.enqueue(
        "crm.dealcategory.list?start=0",
        Scripted::ok(json!({"result": [{"ID": "1", "NAME": "Retail"}], "next": 1})),
    );
    transport.enqueue(
        "crm.dealcategory.list?start=1",
        Scripted::ok(json!({"result": [{"ID": "2", "NAME": "Wholesale"}]})),
    );

    let categories = client(Arc::clone(&transport))
        .list_categories(&CancellationToken::new())
        .await
        .expect("categories");
    let names = categories.iter().map(|c| c.name.as_str()).collect::<Vec<_>>();
    assert_eq!(names, vec!["Retail", "Wholesale"]);
    assert_eq!(transport.requests().len(), 2);
}

#[tokio::test]
async fn stage_list_is_scoped_by_category() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.always(
        "crm.dealcategory.stage.list?id=4",
        Scripted::ok(json!({"result": [{"STATUS_ID": "C4:WON", "NAME": "Won"}]})),
    );
    let stages = client(Arc::clone(&transport))
        .list_stages("4", &CancellationToken::new())
        .await
        .expect("stages");
    assert_eq!(stages[0].status_id, "C4:WON");
}

#[tokio::test]
async fn missing_deal_is_none() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.always(
        "crm.deal.get",
        Scripted::Reply(dealsync_storage::HttpResponse::json(
            400,
            &json!({"error": "", "error_description": "Not found"}),
        )),
    );
    let deal = client(Arc::clone(&transport))
        .get_deal(99, &CancellationToken::new())
        .await
        .expect("lookup");
    assert!(deal.is_none());
}

#[tokio::test]
async fn deal_get_falls_over_to_mirror() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.enqueue(&format!("{PRIMARY}/crm.deal.get"), Scripted::status(502));
    transport.enqueue(
        &format!("{MIRROR}/crm.deal.get?id=5"),
        Scripted::ok(json!({"result": {"ID": "5", "TITLE": "Solar"}})),
    );
    let deal = client(Arc::clone(&transport))
        .get_deal(5, &CancellationToken::new())
        .await
        .expect("lookup")
        .expect("found");
    assert_eq!(deal.external_id("ID"), Some(5));
}

#[tokio::test]
async fn api_errors_exhaust_every_endpoint() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.always(
        "crm.deal.fields",
        Scripted::Reply(dealsync_storage::HttpResponse::json(
            401,
            &json!({"error": "INVALID_CREDENTIALS", "error_description": "bad token"}),
        )),
    );
    let err = client(Arc::clone(&transport))
        .deal_fields(&CancellationToken::new())
        .await
        .unwrap_err();
    let SelectError::Exhausted { failures } = err else {
        panic!("expected exhaustion");
    };
    assert_eq!(failures.len(), 2);
    assert!(matches!(&failures[0].error, EndpointError::Api { code, .. } if code == "INVALID_CREDENTIALS"));
}

#[tokio::test]
async fn single_endpoint_client_never_touches_others() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.always(
        "crm.dealcategory.default.get",
        Scripted::ok(json!({"result": {"ID": 0, "NAME": "General"}})),
    );
    let mirror_only = client(Arc::clone(&transport)).for_endpoint(1).expect("endpoint 1");
    let category = mirror_only
        .default_category(&CancellationToken::new())
        .await
        .expect("default");
    assert_eq!(category.name, "General");
    assert_eq!(transport.count_matching(PRIMARY), 0);
    assert!(client(transport).for_endpoint(2).is_none());
}
