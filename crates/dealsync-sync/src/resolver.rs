use dealsync_adapters::{BitrixClient, DealFieldCatalog};
use dealsync_core::{scalar_text, FieldKind, FieldMapping, RawDeal, ReferenceMap};
use dealsync_storage::SelectError;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Builds the run-scoped [`ReferenceMap`] and translates raw ids in fetched deals.
#[derive(Debug, Clone)]
pub struct ReferenceResolver {
    mapping: FieldMapping,
    delimiter: String,
}

impl ReferenceResolver {
    pub fn new(mapping: FieldMapping, delimiter: impl Into<String>) -> Self {
        Self {
            mapping,
            delimiter: delimiter.into(),
        }
    }

    pub fn mapping(&self) -> &FieldMapping {
        &self.mapping
    }

    /// Fetches categories (including the default pipeline), their stages and the picklist
    /// options of mapped picklist fields. Failed fetches degrade to empty sub-maps; only
    /// cancellation is returned as an error.
    pub async fn load(
        &self,
        client: &BitrixClient,
        catalog: Option<&DealFieldCatalog>,
        cancel: &CancellationToken,
    ) -> Result<ReferenceMap, SelectError> {
        let mut refs = ReferenceMap::new();

        if self.mapping.field_of_kind(FieldKind::Category).is_some() {
            match client.list_categories(cancel).await {
                Ok(categories) => {
                    for category in categories {
                        refs.insert_category(category.id, category.name);
                    }
                }
                Err(SelectError::Cancelled) => return Err(SelectError::Cancelled),
                Err(err) => warn!(error = %err, "category list unavailable; names stay raw"),
            }
            match client.default_category(cancel).await {
                Ok(category) => refs.insert_category(category.id, category.name),
                Err(SelectError::Cancelled) => return Err(SelectError::Cancelled),
                Err(err) => warn!(error = %err, "default category unavailable"),
            }
        }

        if self.mapping.field_of_kind(FieldKind::Stage).is_some() {
            let category_ids = refs.category_ids().map(str::to_string).collect::<Vec<_>>();
            for category_id in category_ids {
                match client.list_stages(&category_id, cancel).await {
                    Ok(stages) => {
                        for stage in stages {
                            refs.insert_stage(category_id.as_str(), stage.status_id, stage.name);
                        }
                    }
                    Err(SelectError::Cancelled) => return Err(SelectError::Cancelled),
                    Err(err) => warn!(
                        category = %category_id,
                        error = %err,
                        "stage list unavailable; stage ids stay raw"
                    ),
                }
            }
        }

        for field in self.mapping.picklist_fields() {
            let Some(definition) = catalog.and_then(|c| c.get(field)) else {
                warn!(field, "no definition for picklist field; ids stay raw");
                continue;
            };
            refs.define_picklist(field);
            for item in &definition.items {
                refs.insert_picklist_option(field, item.id.as_str(), item.label.as_str());
            }
        }

        info!(
            categories = refs.category_count(),
            stages = refs.stage_count(),
            picklist_options = refs.picklist_option_count(),
            "reference data loaded"
        );
        Ok(refs)
    }

    /// Replaces category, stage and picklist ids with display names. Anything that does
    /// not resolve keeps its raw value.
    pub fn resolve(&self, refs: &ReferenceMap, mut deal: RawDeal) -> RawDeal {
        let category_field = self.mapping.field_of_kind(FieldKind::Category);
        let raw_category = category_field
            .and_then(|field| deal.get(field))
            .and_then(scalar_text);

        if let Some(stage_field) = self.mapping.field_of_kind(FieldKind::Stage) {
            let stage_name = raw_category.as_deref().and_then(|category| {
                deal.get(stage_field)
                    .and_then(scalar_text)
                    .and_then(|stage| refs.stage_name(category, &stage).map(str::to_string))
            });
            if let Some(name) = stage_name {
                deal.set(stage_field, Value::String(name));
            }
        }

        if let (Some(field), Some(category)) = (category_field, raw_category.as_deref()) {
            if let Some(name) = refs.category_name(category) {
                deal.set(field, Value::String(name.to_string()));
            }
        }

        for field in self.mapping.picklist_fields() {
            let joined = deal
                .get(field)
                .and_then(|value| self.join_picklist(refs, field, value));
            if let Some(joined) = joined {
                deal.set(field, Value::String(joined));
            }
        }
        deal
    }

    /// Labels of the ids that resolve, joined; when none resolve the raw ids are joined.
    fn join_picklist(&self, refs: &ReferenceMap, field: &str, value: &Value) -> Option<String> {
        let ids = match value {
            Value::Array(items) => items.iter().filter_map(scalar_text).collect::<Vec<_>>(),
            Value::Null => return None,
            scalar => scalar_text(scalar).into_iter().collect(),
        };
        if ids.is_empty() {
            return None;
        }

        let labels = refs
            .picklist(field)
            .map(|options| {
                ids.iter()
                    .filter_map(|id| options.get(id).cloned())
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        if labels.is_empty() {
            Some(ids.join(&self.delimiter))
        } else {
            Some(labels.join(&self.delimiter))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn refs() -> ReferenceMap {
        let mut refs = ReferenceMap::new();
        refs.insert_category("0", "General");
        refs.insert_category("1", "Retail");
        refs.insert_stage("0", "NEW", "Fresh");
        refs.insert_stage("1", "C1:NEW", "New lead");
        refs.define_picklist("UF_CRM_1698698407472");
        refs.insert_picklist_option("UF_CRM_1698698407472", "45", "Alice");
        refs.insert_picklist_option("UF_CRM_1698698407472", "46", "Bob");
        refs
    }

    fn resolver() -> ReferenceResolver {
        ReferenceResolver::new(FieldMapping::default(), ", ")
    }

    fn deal(value: Value) -> RawDeal {
        RawDeal::from_value(value).expect("object")
    }

    #[test]
    fn stage_is_looked_up_within_its_own_category() {
        let resolved = resolver().resolve(
            &refs(),
            deal(json!({"ID": "1", "CATEGORY_ID": "1", "STAGE_ID": "C1:NEW"})),
        );
        assert_eq!(resolved.get("CATEGORY_ID"), Some(&json!("Retail")));
        assert_eq!(resolved.get("STAGE_ID"), Some(&json!("New lead")));

        let cross = resolver().resolve(
            &refs(),
            deal(json!({"ID": "2", "CATEGORY_ID": "0", "STAGE_ID": "C1:NEW"})),
        );
        assert_eq!(cross.get("CATEGORY_ID"), Some(&json!("General")));
        assert_eq!(cross.get("STAGE_ID"), Some(&json!("C1:NEW")));
    }

    #[test]
    fn unknown_ids_pass_through_unchanged() {
        let resolved = resolver().resolve(
            &refs(),
            deal(json!({"ID": "3", "CATEGORY_ID": "9", "STAGE_ID": "C9:LOST"})),
        );
        assert_eq!(resolved.get("CATEGORY_ID"), Some(&json!("9")));
        assert_eq!(resolved.get("STAGE_ID"), Some(&json!("C9:LOST")));
    }

    #[test]
    fn picklists_join_labels_and_drop_unknown_options() {
        let resolved = resolver().resolve(
            &refs(),
            deal(json!({"ID": "4", "UF_CRM_1698698407472": ["45", 99, "46"]})),
        );
        assert_eq!(resolved.get("UF_CRM_1698698407472"), Some(&json!("Alice, Bob")));

        let unresolved = resolver().resolve(
            &refs(),
            deal(json!({"ID": "5", "UF_CRM_1698698407472": ["98", "99"]})),
        );
        assert_eq!(unresolved.get("UF_CRM_1698698407472"), Some(&json!("98, 99")));

        let empty = resolver().resolve(&refs(), deal(json!({"ID": "6", "UF_CRM_1698698407472": []})));
        assert_eq!(empty.get("UF_CRM_1698698407472"), Some(&json!([])));
    }

    #[test]
    fn undefined_picklist_keeps_raw_ids() {
        let resolved = ReferenceResolver::new(FieldMapping::default(), " | ").resolve(
            &ReferenceMap::new(),
            deal(json!({"ID": "7", "UF_CRM_1698698407472": ["45", "46"]})),
        );
        assert_eq!(resolved.get("UF_CRM_1698698407472"), Some(&json!("45 | 46")));
    }
}
