//! Core domain model for deal synchronization: raw payloads, the persisted row, the
//! field mapping table, pagination cursors, checkpoints and run-scoped reference data.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "dealsync-core";

/// External (remote) deal identifier. Unique across the store.
pub type DealId = i64;

/// As-fetched deal payload keyed by remote field identifier.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawDeal(Map<String, Value>);

impl RawDeal {
    pub fn new(fields: Map<String, Value>) -> Self {
        Self(fields)
    }

    /// Wraps a JSON object; any other JSON value is rejected.
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(fields) => Some(Self(fields)),
            _ => None,
        }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn set(&mut self, field: &str, value: Value) {
        self.0.insert(field.to_string(), value);
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Numeric external id; the CRM sends it either as a JSON number or a numeric string.
    pub fn external_id(&self, id_field: &str) -> Option<DealId> {
        match self.0.get(id_field)? {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

/// Renders a scalar JSON value as text. Arrays, objects and null yield `None`.
pub fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn column_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::Array(items) => Some(
            items
                .iter()
                .filter_map(scalar_text)
                .collect::<Vec<_>>()
                .join(", "),
        ),
        Value::Object(_) => Some(value.to_string()),
        scalar => scalar_text(scalar),
    }
}

/// Parses the CRM's ISO-8601 timestamps (`2023-11-01T10:00:00+03:00`), falling back to
/// bare dates at midnight UTC.
pub fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// Destination column in the `deals` table (the key column `id` is implicit).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DealColumn {
    Title,
    Stage,
    Category,
    PostalCode,
    Contact,
    CreatedAt,
}

impl DealColumn {
    pub const ALL: [DealColumn; 6] = [
        DealColumn::Title,
        DealColumn::Stage,
        DealColumn::Category,
        DealColumn::PostalCode,
        DealColumn::Contact,
        DealColumn::CreatedAt,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DealColumn::Title => "title",
            DealColumn::Stage => "stage",
            DealColumn::Category => "category",
            DealColumn::PostalCode => "postal_code",
            DealColumn::Contact => "contact",
            DealColumn::CreatedAt => "created_at",
        }
    }

    fn is_timestamp(&self) -> bool {
        matches!(self, DealColumn::CreatedAt)
    }
}

impl fmt::Display for DealColumn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a mapped source field is interpreted before it lands in its column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    #[default]
    Text,
    Category,
    Stage,
    Picklist,
    Timestamp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnMapping {
    pub column: DealColumn,
    pub source_field: String,
    #[serde(default)]
    pub kind: FieldKind,
}

impl ColumnMapping {
    pub fn new(column: DealColumn, source_field: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            column,
            source_field: source_field.into(),
            kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MappingError {
    #[error("id field must not be empty")]
    EmptyIdField,
    #[error("column `{0}` is mapped more than once")]
    DuplicateColumn(DealColumn),
    #[error("column `{0}` is not mapped")]
    MissingColumn(DealColumn),
    #[error("source field `{0}` is mapped more than once")]
    DuplicateSourceField(String),
    #[error("column `{column}` cannot hold a {kind:?} field")]
    KindMismatch { column: DealColumn, kind: FieldKind },
    #[error("more than one {0:?} field is mapped")]
    DuplicateRole(FieldKind),
    #[error("a stage field requires a category field to scope it")]
    StageWithoutCategory,
    #[error("remote catalog does not know fields: {}", .0.join(", "))]
    UnknownRemoteFields(Vec<String>),
    #[error("field `{0}` is mapped as a picklist but is not an enumeration remotely")]
    NotAPicklist(String),
}

/// Explicit source-field → column table driving the projection of raw deals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMapping {
    pub id_field: String,
    pub columns: Vec<ColumnMapping>,
}

impl Default for FieldMapping {
    fn default() -> Self {
        Self {
            id_field: "ID".to_string(),
            columns: vec![
                ColumnMapping::new(DealColumn::Title, "TITLE", FieldKind::Text),
                ColumnMapping::new(DealColumn::Stage, "STAGE_ID", FieldKind::Stage),
                ColumnMapping::new(DealColumn::Category, "CATEGORY_ID", FieldKind::Category),
                ColumnMapping::new(DealColumn::PostalCode, "UF_CRM_1700661314351", FieldKind::Text),
                ColumnMapping::new(DealColumn::Contact, "UF_CRM_1698698407472", FieldKind::Picklist),
                ColumnMapping::new(DealColumn::CreatedAt, "DATE_CREATE", FieldKind::Timestamp),
            ],
        }
    }
}

impl FieldMapping {
    /// Structural checks that need no remote data.
    pub fn validate(&self) -> Result<(), MappingError> {
        if self.id_field.trim().is_empty() {
            return Err(MappingError::EmptyIdField);
        }

        let mut columns = BTreeSet::new();
        let mut sources = BTreeSet::new();
        sources.insert(self.id_field.as_str());
        for mapping in &self.columns {
            if !columns.insert(mapping.column) {
                return Err(MappingError::DuplicateColumn(mapping.column));
            }
            if !sources.insert(mapping.source_field.as_str()) {
                return Err(MappingError::DuplicateSourceField(mapping.source_field.clone()));
            }
            if mapping.column.is_timestamp() != (mapping.kind == FieldKind::Timestamp) {
                return Err(MappingError::KindMismatch {
                    column: mapping.column,
                    kind: mapping.kind,
                });
            }
        }
        if let Some(missing) = DealColumn::ALL.iter().find(|c| !columns.contains(*c)) {
            return Err(MappingError::MissingColumn(*missing));
        }

        for role in [FieldKind::Category, FieldKind::Stage] {
            if self.columns.iter().filter(|m| m.kind == role).count() > 1 {
                return Err(MappingError::DuplicateRole(role));
            }
        }
        if self.field_of_kind(FieldKind::Stage).is_some()
            && self.field_of_kind(FieldKind::Category).is_none()
        {
            return Err(MappingError::StageWithoutCategory);
        }
        Ok(())
    }

    /// Checks mapped fields against the remote field catalog. `is_enumeration` answers
    /// whether a known remote field is a picklist.
    pub fn validate_against_remote<F>(
        &self,
        remote_fields: &BTreeSet<String>,
        is_enumeration: F,
    ) -> Result<(), MappingError>
    where
        F: Fn(&str) -> bool,
    {
        let unknown = self
            .select_fields()
            .into_iter()
            .filter(|f| !remote_fields.contains(f))
            .collect::<Vec<_>>();
        if !unknown.is_empty() {
            return Err(MappingError::UnknownRemoteFields(unknown));
        }
        if let Some(field) = self.picklist_fields().find(|f| !is_enumeration(f)) {
            return Err(MappingError::NotAPicklist(field.to_string()));
        }
        Ok(())
    }

    /// Remote fields to request: the id field followed by every mapped source field.
    pub fn select_fields(&self) -> Vec<String> {
        std::iter::once(self.id_field.clone())
            .chain(self.columns.iter().map(|m| m.source_field.clone()))
            .collect()
    }

    pub fn field_of_kind(&self, kind: FieldKind) -> Option<&str> {
        self.columns
            .iter()
            .find(|m| m.kind == kind)
            .map(|m| m.source_field.as_str())
    }

    pub fn picklist_fields(&self) -> impl Iterator<Item = &str> {
        self.columns
            .iter()
            .filter(|m| m.kind == FieldKind::Picklist)
            .map(|m| m.source_field.as_str())
    }

    /// Flattens a (resolved) raw deal into the fixed column set.
    pub fn project(&self, deal: &RawDeal) -> Result<DealRow, ProjectionError> {
        let id = deal
            .external_id(&self.id_field)
            .ok_or_else(|| ProjectionError::MissingId {
                field: self.id_field.clone(),
            })?;

        let mut row = DealRow::new(id);
        for mapping in &self.columns {
            let value = deal.get(&mapping.source_field);
            if mapping.column.is_timestamp() {
                row.created_at = value
                    .and_then(scalar_text)
                    .and_then(|text| parse_timestamp(&text));
            } else {
                row.set_text(mapping.column, value.and_then(column_text));
            }
        }
        Ok(row)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProjectionError {
    #[error("record has no numeric `{field}`")]
    MissingId { field: String },
}

/// Resolved, flattened projection of a deal, keyed by its external id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DealRow {
    pub id: DealId,
    pub title: Option<String>,
    pub stage: Option<String>,
    pub category: Option<String>,
    pub postal_code: Option<String>,
    pub contact: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
}

impl DealRow {
    pub fn new(id: DealId) -> Self {
        Self {
            id,
            title: None,
            stage: None,
            category: None,
            postal_code: None,
            contact: None,
            created_at: None,
        }
    }

    fn set_text(&mut self, column: DealColumn, value: Option<String>) {
        match column {
            DealColumn::Title => self.title = value,
            DealColumn::Stage => self.stage = value,
            DealColumn::Category => self.category = value,
            DealColumn::PostalCode => self.postal_code = value,
            DealColumn::Contact => self.contact = value,
            DealColumn::CreatedAt => {}
        }
    }
}

/// Opaque pagination position returned by the remote list endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cursor(String);

impl Cursor {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Position of the first page.
    pub fn start() -> Self {
        Self("0".to_string())
    }

    /// Reads a `next` value. Null, `false`, empty strings and zero mean "no next page".
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) if n.as_u64() != Some(0) => Some(Self(n.to_string())),
            Value::String(s) if !s.trim().is_empty() && s.trim() != "0" => {
                Some(Self(s.trim().to_string()))
            }
            _ => None,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn numeric(&self) -> Option<u64> {
        self.0.parse().ok()
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CheckpointError {
    #[error("checkpoint for run {run_id} would regress: {previous} -> {next}")]
    Regression {
        run_id: Uuid,
        previous: String,
        next: String,
    },
}

/// Durable progress marker for one pagination stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub run_id: Uuid,
    /// Position of the next page to fetch (or of the final page once completed).
    pub cursor: Cursor,
    pub pages_committed: u64,
    pub records_processed: u64,
    pub completed: bool,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn begin(run_id: Uuid, cursor: Cursor) -> Self {
        Self {
            run_id,
            cursor,
            pages_committed: 0,
            records_processed: 0,
            completed: false,
            updated_at: Utc::now(),
        }
    }

    /// Progress after a committed page that points at `next`.
    pub fn advance(&self, next: Cursor, page_records: u64) -> Result<Self, CheckpointError> {
        let advanced = Self {
            run_id: self.run_id,
            cursor: next,
            pages_committed: self.pages_committed + 1,
            records_processed: self.records_processed + page_records,
            completed: false,
            updated_at: Utc::now(),
        };
        advanced.ensure_follows(self)?;
        Ok(advanced)
    }

    /// Terminal progress. A final page with records counts as committed.
    pub fn finish(&self, page_records: u64) -> Self {
        Self {
            run_id: self.run_id,
            cursor: self.cursor.clone(),
            pages_committed: self.pages_committed + u64::from(page_records > 0),
            records_processed: self.records_processed + page_records,
            completed: true,
            updated_at: Utc::now(),
        }
    }

    /// Monotonicity within one run. Checkpoints of different runs are unrelated.
    pub fn ensure_follows(&self, previous: &Checkpoint) -> Result<(), CheckpointError> {
        if self.run_id != previous.run_id {
            return Ok(());
        }
        let cursor_regressed = matches!(
            (previous.cursor.numeric(), self.cursor.numeric()),
            (Some(before), Some(after)) if after < before
        );
        if cursor_regressed
            || (previous.completed && !self.completed)
            || self.pages_committed < previous.pages_committed
            || self.records_processed < previous.records_processed
        {
            return Err(CheckpointError::Regression {
                run_id: self.run_id,
                previous: previous.describe(),
                next: self.describe(),
            });
        }
        Ok(())
    }

    fn describe(&self) -> String {
        format!(
            "cursor={} pages={} records={}{}",
            self.cursor,
            self.pages_committed,
            self.records_processed,
            if self.completed { " (completed)" } else { "" }
        )
    }
}

/// Reference data resolved once per sync run: category names, category-scoped stage
/// names and picklist option labels per field.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReferenceMap {
    categories: HashMap<String, String>,
    stages: HashMap<String, HashMap<String, String>>,
    picklists: HashMap<String, HashMap<String, String>>,
}

impl ReferenceMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_category(&mut self, id: impl Into<String>, name: impl Into<String>) {
        self.categories.insert(id.into(), name.into());
    }

    pub fn insert_stage(
        &mut self,
        category_id: impl Into<String>,
        stage_id: impl Into<String>,
        name: impl Into<String>,
    ) {
        self.stages
            .entry(category_id.into())
            .or_default()
            .insert(stage_id.into(), name.into());
    }

    /// Registers a picklist field so that unresolved ids are distinguishable from an
    /// undefined field.
    pub fn define_picklist(&mut self, field: impl Into<String>) {
        self.picklists.entry(field.into()).or_default();
    }

    pub fn insert_picklist_option(
        &mut self,
        field: impl Into<String>,
        option_id: impl Into<String>,
        label: impl Into<String>,
    ) {
        self.picklists
            .entry(field.into())
            .or_default()
            .insert(option_id.into(), label.into());
    }

    pub fn category_name(&self, category_id: &str) -> Option<&str> {
        self.categories.get(category_id).map(String::as_str)
    }

    pub fn stage_name(&self, category_id: &str, stage_id: &str) -> Option<&str> {
        self.stages
            .get(category_id)
            .and_then(|stages| stages.get(stage_id))
            .map(String::as_str)
    }

    pub fn picklist(&self, field: &str) -> Option<&HashMap<String, String>> {
        self.picklists.get(field)
    }

    pub fn category_ids(&self) -> impl Iterator<Item = &str> {
        self.categories.keys().map(String::as_str)
    }

    pub fn category_count(&self) -> usize {
        self.categories.len()
    }

    pub fn stage_count(&self) -> usize {
        self.stages.values().map(HashMap::len).sum()
    }

    pub fn picklist_option_count(&self) -> usize {
        self.picklists.values().map(HashMap::len).sum()
    }
}

/// Live run counters, shared between the selector and the fetcher.
#[derive(Debug, Default)]
pub struct SyncCounters {
    pages_fetched: AtomicU64,
    records_upserted: AtomicU64,
    records_skipped: AtomicU64,
    fetch_retries: AtomicU64,
    rate_limit_waits: AtomicU64,
    endpoint_failures: AtomicU64,
}

impl SyncCounters {
    pub fn page_fetched(&self) {
        self.pages_fetched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn records_upserted(&self, count: u64) {
        self.records_upserted.fetch_add(count, Ordering::Relaxed);
    }

    pub fn records_skipped(&self, count: u64) {
        self.records_skipped.fetch_add(count, Ordering::Relaxed);
    }

    pub fn fetch_retry(&self) {
        self.fetch_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn rate_limit_wait(&self) {
        self.rate_limit_waits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn endpoint_failure(&self) {
        self.endpoint_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> SyncStats {
        SyncStats {
            pages_fetched: self.pages_fetched.load(Ordering::Relaxed),
            records_upserted: self.records_upserted.load(Ordering::Relaxed),
            records_skipped: self.records_skipped.load(Ordering::Relaxed),
            fetch_retries: self.fetch_retries.load(Ordering::Relaxed),
            rate_limit_waits: self.rate_limit_waits.load(Ordering::Relaxed),
            endpoint_failures: self.endpoint_failures.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStats {
    pub pages_fetched: u64,
    pub records_upserted: u64,
    pub records_skipped: u64,
    pub fetch_retries: u64,
    pub rate_limit_waits: u64,
    pub endpoint_failures: u64,
}

impl SyncStats {
    /// What was counted after `earlier` was taken.
    pub fn since(&self, earlier: &SyncStats) -> SyncStats {
        SyncStats {
            pages_fetched: self.pages_fetched.saturating_sub(earlier.pages_fetched),
            records_upserted: self.records_upserted.saturating_sub(earlier.records_upserted),
            records_skipped: self.records_skipped.saturating_sub(earlier.records_skipped),
            fetch_retries: self.fetch_retries.saturating_sub(earlier.fetch_retries),
            rate_limit_waits: self.rate_limit_waits.saturating_sub(earlier.rate_limit_waits),
            endpoint_failures: self.endpoint_failures.saturating_sub(earlier.endpoint_failures),
        }
    }
}
