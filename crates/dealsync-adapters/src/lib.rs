//! Bitrix24 REST method adapter: request descriptors for the deal/category/stage/field
//! methods and decoders for their `{"result": ..., "next": ...}` envelopes.

use std::collections::{BTreeMap, BTreeSet};

use dealsync_core::{scalar_text, Cursor, DealId, RawDeal};
use dealsync_storage::{api_error, ApiRequest, EndpointError, EndpointSelector, SelectError};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub const CRATE_NAME: &str = "dealsync-adapters";

pub const DEAL_LIST: &str = "crm.deal.list";
pub const DEAL_GET: &str = "crm.deal.get";
pub const DEAL_FIELDS: &str = "crm.deal.fields";
pub const CATEGORY_LIST: &str = "crm.dealcategory.list";
pub const CATEGORY_DEFAULT: &str = "crm.dealcategory.default.get";
pub const STAGE_LIST: &str = "crm.dealcategory.stage.list";

/// Remote field that the date lower bound filters on.
pub const CREATED_FILTER_FIELD: &str = "DATE_CREATE";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("response is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("response has no `result`")]
    MissingResult,
    #[error("unexpected {context} shape: {detail}")]
    Shape {
        context: &'static str,
        detail: String,
    },
}

impl From<AdapterError> for EndpointError {
    fn from(err: AdapterError) -> Self {
        EndpointError::Malformed(err.to_string())
    }
}

fn shape(context: &'static str, detail: impl Into<String>) -> AdapterError {
    AdapterError::Shape {
        context,
        detail: detail.into(),
    }
}

/// One page of a list method.
#[derive(Debug, Clone, PartialEq)]
pub struct ListPage<T> {
    pub items: Vec<T>,
    pub next: Option<Cursor>,
    pub total: Option<u64>,
}

/// `crm.deal.list` parameters for one page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DealListQuery {
    pub select: Vec<String>,
    /// Lower bound (inclusive) on the creation date, `YYYY-MM-DD`.
    pub created_since: String,
    pub cursor: Cursor,
}

impl DealListQuery {
    pub fn to_request(&self) -> ApiRequest {
        let mut request = ApiRequest::new(DEAL_LIST);
        for field in &self.select {
            request = request.param("select[]", field.clone());
        }
        request
            .param(format!("filter[>={CREATED_FILTER_FIELD}]"), self.created_since.clone())
            .param("order[ID]", "ASC")
            .param("start", self.cursor.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Category {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stage {
    pub status_id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PicklistItem {
    pub id: String,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FieldDefinition {
    pub field_type: String,
    pub is_multiple: bool,
    pub items: Vec<PicklistItem>,
}

impl FieldDefinition {
    pub fn is_enumeration(&self) -> bool {
        self.field_type == "enumeration"
    }
}

/// Result of `crm.deal.fields`, keyed by remote field id.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DealFieldCatalog {
    pub fields: BTreeMap<String, FieldDefinition>,
}

impl DealFieldCatalog {
    pub fn names(&self) -> BTreeSet<String> {
        self.fields.keys().cloned().collect()
    }

    pub fn get(&self, field: &str) -> Option<&FieldDefinition> {
        self.fields.get(field)
    }

    pub fn is_enumeration(&self, field: &str) -> bool {
        self.get(field).is_some_and(FieldDefinition::is_enumeration)
    }
}

/// Splits the envelope, surfacing `{"error": ...}` bodies as API errors.
fn envelope(body: &[u8]) -> Result<Map<String, Value>, EndpointError> {
    let value: Value = serde_json::from_slice(body).map_err(AdapterError::from)?;
    if let Some(err) = api_error(body) {
        return Err(err);
    }
    match value {
        Value::Object(map) => Ok(map),
        other => Err(shape("envelope", format!("expected object, got {other}")).into()),
    }
}

fn take_result(map: &mut Map<String, Value>) -> Result<Value, AdapterError> {
    map.remove("result").ok_or(AdapterError::MissingResult)
}

pub fn parse_list_page<T, F>(body: &[u8], item: F) -> Result<ListPage<T>, EndpointError>
where
    F: Fn(Value) -> Result<T, AdapterError>,
{
    let mut map = envelope(body)?;
    let items = match take_result(&mut map)? {
        Value::Array(values) => values
            .into_iter()
            .map(item)
            .collect::<Result<Vec<_>, _>>()?,
        Value::Null => Vec::new(),
        other => return Err(shape("result", format!("expected array, got {other}")).into()),
    };
    let next = map.get("next").and_then(Cursor::from_json);
    let total = map.get("total").and_then(|t| match t {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    });
    Ok(ListPage { items, next, total })
}

fn raw_deal(value: Value) -> Result<RawDeal, AdapterError> {
    RawDeal::from_value(value).ok_or_else(|| shape("deal", "expected object"))
}

fn text_field(value: &Value, key: &str, context: &'static str) -> Result<String, AdapterError> {
    value
        .get(key)
        .and_then(scalar_text)
        .ok_or_else(|| shape(context, format!("missing `{key}`")))
}

fn category(value: Value) -> Result<Category, AdapterError> {
    Ok(Category {
        id: text_field(&value, "ID", "category")?,
        name: text_field(&value, "NAME", "category")?,
    })
}

fn stage(value: Value) -> Result<Stage, AdapterError> {
    Ok(Stage {
        status_id: text_field(&value, "STATUS_ID", "stage")?,
        name: text_field(&value, "NAME", "stage")?,
    })
}

pub fn parse_deal_page(body: &[u8]) -> Result<ListPage<RawDeal>, EndpointError> {
    parse_list_page(body, raw_deal)
}

pub fn parse_category_page(body: &[u8]) -> Result<ListPage<Category>, EndpointError> {
    parse_list_page(body, category)
}

pub fn parse_stage_page(body: &[u8]) -> Result<ListPage<Stage>, EndpointError> {
    parse_list_page(body, stage)
}

pub fn parse_default_category(body: &[u8]) -> Result<Category, EndpointError> {
    let mut map = envelope(body)?;
    Ok(category(take_result(&mut map)?)?)
}

pub fn parse_deal(body: &[u8]) -> Result<RawDeal, EndpointError> {
    let mut map = envelope(body)?;
    Ok(raw_deal(take_result(&mut map)?)?)
}

pub fn parse_field_catalog(body: &[u8]) -> Result<DealFieldCatalog, EndpointError> {
    let mut map = envelope(body)?;
    let Value::Object(fields) = take_result(&mut map)? else {
        return Err(shape("field catalog", "expected object").into());
    };

    let mut catalog = DealFieldCatalog::default();
    for (name, definition) in fields {
        let items = definition
            .get("items")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| {
                        Some(PicklistItem {
                            id: item.get("ID").and_then(scalar_text)?,
                            label: item.get("VALUE").and_then(scalar_text)?,
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        catalog.fields.insert(
            name,
            FieldDefinition {
                field_type: definition
                    .get("type")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                is_multiple: definition
                    .get("isMultiple")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
                items,
            },
        );
    }
    Ok(catalog)
}

/// Typed calls to the CRM over an [`EndpointSelector`].
#[derive(Debug, Clone)]
pub struct BitrixClient {
    selector: EndpointSelector,
}

impl BitrixClient {
    pub fn new(selector: EndpointSelector) -> Self {
        Self { selector }
    }

    pub fn selector(&self) -> &EndpointSelector {
        &self.selector
    }

    /// Client bound to a single endpoint, used when endpoints are partitions.
    pub fn for_endpoint(&self, index: usize) -> Option<Self> {
        self.selector.single(index).map(Self::new)
    }

    pub async fn list_deals(
        &self,
        query: &DealListQuery,
        cancel: &CancellationToken,
    ) -> Result<ListPage<RawDeal>, SelectError> {
        let selected = self
            .selector
            .call(&query.to_request(), cancel, parse_deal_page)
            .await?;
        debug!(
            endpoint = selected.endpoint,
            cursor = %query.cursor,
            records = selected.value.items.len(),
            "deal page fetched"
        );
        Ok(selected.value)
    }

    /// `Ok(None)` when the CRM reports the deal does not exist.
    pub async fn get_deal(
        &self,
        id: DealId,
        cancel: &CancellationToken,
    ) -> Result<Option<RawDeal>, SelectError> {
        let request = ApiRequest::new(DEAL_GET).param("id", id.to_string());
        match self.selector.call(&request, cancel, parse_deal).await {
            Ok(selected) => Ok(Some(selected.value)),
            Err(SelectError::Exhausted { failures })
                if failures.iter().any(|f| f.error.is_not_found()) =>
            {
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    pub async fn list_categories(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<Category>, SelectError> {
        self.collect_pages(ApiRequest::new(CATEGORY_LIST), cancel, parse_category_page)
            .await
    }

    pub async fn default_category(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Category, SelectError> {
        let request = ApiRequest::new(CATEGORY_DEFAULT);
        Ok(self
            .selector
            .call(&request, cancel, parse_default_category)
            .await?
            .value)
    }

    pub async fn list_stages(
        &self,
        category_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<Stage>, SelectError> {
        let request = ApiRequest::new(STAGE_LIST).param("id", category_id);
        self.collect_pages(request, cancel, parse_stage_page).await
    }

    pub async fn deal_fields(
        &self,
        cancel: &CancellationToken,
    ) -> Result<DealFieldCatalog, SelectError> {
        let request = ApiRequest::new(DEAL_FIELDS);
        Ok(self
            .selector
            .call(&request, cancel, parse_field_catalog)
            .await?
            .value)
    }

    async fn collect_pages<T, F>(
        &self,
        base: ApiRequest,
        cancel: &CancellationToken,
        decode: F,
    ) -> Result<Vec<T>, SelectError>
    where
        F: Fn(&[u8]) -> Result<ListPage<T>, EndpointError>,
    {
        let mut items = Vec::new();
        let mut cursor = Cursor::start();
        loop {
            let mut request = base.clone();
            request.set_param("start", cursor.as_str());
            let page = self.selector.call(&request, cancel, &decode).await?.value;
            items.extend(page.items);
            match page.next {
                Some(next) if next != cursor => cursor = next,
                _ => break,
            }
        }
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn body(value: Value) -> Vec<u8> {
        value.to_string().into_bytes()
    }

    #[test]
    fn deal_query_builds_list_parameters() {
        let query = DealListQuery {
            select: vec!["ID".into(), "TITLE".into()],
            created_since: "2023-11-01".into(),
            cursor: Cursor::new("100"),
        };
        let request = query.to_request();
        assert_eq!(request.method, DEAL_LIST);
        let pairs = request
            .params
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>();
        assert_eq!(
            pairs,
            vec![
                "select[]=ID",
                "select[]=TITLE",
                "filter[>=DATE_CREATE]=2023-11-01",
                "order[ID]=ASC",
                "start=100"
            ]
        );
    }

    #[test]
    fn list_page_reads_next_and_total() {
        let page = parse_deal_page(&body(json!({
            "result": [{"ID": "1"}, {"ID": "2"}],
            "next": 50,
            "total": "120",
            "time": {"start": 1.0}
        })))
        .expect("page");
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.next, Some(Cursor::new("50")));
        assert_eq!(page.total, Some(120));

        let last = parse_deal_page(&body(json!({"result": [{"ID": "3"}]}))).expect("page");
        assert_eq!(last.next, None);
    }

    #[test]
    fn envelope_errors_are_api_errors() {
        let err = parse_deal_page(&body(json!({
            "error": "INVALID_CREDENTIALS",
            "error_description": "Invalid request credentials"
        })))
        .unwrap_err();
        assert_eq!(
            err,
            EndpointError::Api {
                code: "INVALID_CREDENTIALS".into(),
                description: "Invalid request credentials".into()
            }
        );
    }

    #[test]
    fn malformed_bodies_are_rejected() {
        assert!(matches!(parse_deal_page(b"<html>"), Err(EndpointError::Malformed(_))));
        assert!(matches!(
            parse_deal_page(&body(json!({"total": 0}))),
            Err(EndpointError::Malformed(_))
        ));
        assert!(matches!(
            parse_deal_page(&body(json!({"result": [1, 2]}))),
            Err(EndpointError::Malformed(_))
        ));
    }

    #[test]
    fn categories_and_stages_decode_numeric_ids() {
        let categories =
            parse_category_page(&body(json!({"result": [{"ID": 3, "NAME": "Corporate", "SORT": 100}]})))
                .expect("categories");
        assert_eq!(
            categories.items,
            vec![Category {
                id: "3".into(),
                name: "Corporate".into()
            }]
        );
        let default = parse_default_category(&body(json!({"result": {"ID": 0, "NAME": "General"}})))
            .expect("default");
        assert_eq!(default.id, "0");

        let stages = parse_stage_page(&body(json!({
            "result": [{"NAME": "New", "SORT": 10, "STATUS_ID": "C3:NEW"}]
        })))
        .expect("stages");
        assert_eq!(stages.items[0].status_id, "C3:NEW");
    }

    #[test]
    fn field_catalog_lists_enumeration_items() {
        let catalog = parse_field_catalog(&body(json!({
            "result": {
                "TITLE": {"type": "string", "isMultiple": false},
                "UF_CRM_CONTACT": {
                    "type": "enumeration",
                    "isMultiple": true,
                    "items": [{"ID": "45", "VALUE": "Alice"}, {"ID": 46, "VALUE": "Bob"}]
                }
            }
        })))
        .expect("catalog");
        assert!(catalog.is_enumeration("UF_CRM_CONTACT"));
        assert!(!catalog.is_enumeration("TITLE"));
        assert!(!catalog.is_enumeration("MISSING"));
        let items = &catalog.get("UF_CRM_CONTACT").expect("field").items;
        assert_eq!(items[1], PicklistItem { id: "46".into(), label: "Bob".into() });
        assert_eq!(catalog.names().len(), 2);
    }
}
