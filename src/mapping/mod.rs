//! Source↔destination identifier translation
//!
//! Mappings arrive as `{sourceId, destinationId}` pairs where either side
//! is a bare data-element ID or a compound
//! `dataElementId.categoryOptionComboId`. Expansion qualifies every pair:
//! bare sides fan out across their category-option-combos, and the two
//! sides are joined destination-first by combo ID, falling back to combo
//! name. Combinations with no match are dropped; the result is
//! deduplicated and fully compound.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use thiserror::Error;

use crate::config::{AttributeComboSelector, IdMapping};
use crate::dhis::models::{CategoryOptionDetail, ComboRef, DataValue};
use crate::dhis::{DhisClient, UpstreamError};

#[derive(Debug, Error)]
pub enum MappingError {
    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    #[error("category option {option} does not belong to attribute {attribute}")]
    OptionOutsideAttribute { option: String, attribute: String },
}

impl MappingError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, MappingError::Upstream(err) if err.is_retryable())
    }
}

/// Metadata lookups the engine needs from an instance
#[async_trait]
pub trait ComboLookup: Send + Sync {
    /// Category-option-combos of a data element's category combo
    async fn option_combos(&self, data_element: &str) -> Result<Vec<ComboRef>, UpstreamError>;

    /// A category option with its parent categories and combos
    async fn category_option(&self, id: &str) -> Result<CategoryOptionDetail, UpstreamError>;
}

#[async_trait]
impl ComboLookup for DhisClient {
    async fn option_combos(&self, data_element: &str) -> Result<Vec<ComboRef>, UpstreamError> {
        self.data_element_combos(data_element).await
    }

    async fn category_option(&self, id: &str) -> Result<CategoryOptionDetail, UpstreamError> {
        DhisClient::category_option(self, id).await
    }
}

/// A fully-qualified pair; both sides are compound
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QualifiedMapping {
    pub source_id: String,
    pub destination_id: String,
}

/// Split an identifier into its data element and optional combo part.
pub fn split_compound(id: &str) -> (&str, Option<&str>) {
    match id.split_once('.') {
        Some((data_element, combo)) if !combo.is_empty() => (data_element, Some(combo)),
        _ => (id, None),
    }
}

struct SideEntry {
    key: String,
    combo_id: String,
    combo_name: String,
}

pub struct MappingEngine<'a> {
    source: &'a dyn ComboLookup,
    destination: &'a dyn ComboLookup,
}

impl<'a> MappingEngine<'a> {
    pub fn new(source: &'a dyn ComboLookup, destination: &'a dyn ComboLookup) -> Self {
        Self {
            source,
            destination,
        }
    }

    pub async fn expand(
        &self,
        mappings: &[IdMapping],
    ) -> Result<Vec<QualifiedMapping>, MappingError> {
        let mut out = Vec::new();
        let mut seen = HashSet::new();

        for mapping in mappings {
            if mapping.is_compound() {
                let qualified = QualifiedMapping {
                    source_id: mapping.source_id.clone(),
                    destination_id: mapping.destination_id.clone(),
                };
                if seen.insert(qualified.clone()) {
                    out.push(qualified);
                }
                continue;
            }

            let source_entries = side_entries(self.source, &mapping.source_id).await?;
            let destination_entries =
                side_entries(self.destination, &mapping.destination_id).await?;

            for destination in &destination_entries {
                let matched = source_entries
                    .iter()
                    .find(|source| source.combo_id == destination.combo_id)
                    .or_else(|| {
                        source_entries
                            .iter()
                            .find(|source| source.combo_name == destination.combo_name)
                    });

                if let Some(source) = matched {
                    let qualified = QualifiedMapping {
                        source_id: source.key.clone(),
                        destination_id: destination.key.clone(),
                    };
                    if seen.insert(qualified.clone()) {
                        out.push(qualified);
                    }
                }
            }
        }

        Ok(out)
    }
}

/// Expansion of one side: all combos for a bare ID, the single named
/// combo for a compound one.
async fn side_entries(
    lookup: &dyn ComboLookup,
    id: &str,
) -> Result<Vec<SideEntry>, MappingError> {
    let (data_element, combo_filter) = split_compound(id);
    let combos = lookup.option_combos(data_element).await?;

    Ok(combos
        .into_iter()
        .filter(|combo| combo_filter.map_or(true, |wanted| combo.id == wanted))
        .map(|combo| SideEntry {
            key: format!("{data_element}.{}", combo.id),
            combo_id: combo.id,
            combo_name: combo.name,
        })
        .collect())
}

/// Lookup structure applied to downloaded values
#[derive(Debug, Default)]
pub struct TranslationTable {
    bare: HashMap<String, String>,
    compound: HashMap<(String, String), (String, String)>,
}

impl TranslationTable {
    pub fn build(mappings: &[IdMapping], expanded: &[QualifiedMapping]) -> Self {
        let mut bare = HashMap::new();
        for mapping in mappings {
            let (source_de, _) = split_compound(&mapping.source_id);
            let (destination_de, _) = split_compound(&mapping.destination_id);
            bare.insert(source_de.to_string(), destination_de.to_string());
        }

        let mut compound = HashMap::new();
        for qualified in expanded {
            let (source_de, source_combo) = split_compound(&qualified.source_id);
            let (destination_de, destination_combo) = split_compound(&qualified.destination_id);
            if let (Some(source_combo), Some(destination_combo)) = (source_combo, destination_combo)
            {
                compound.insert(
                    (source_de.to_string(), source_combo.to_string()),
                    (destination_de.to_string(), destination_combo.to_string()),
                );
            }
        }

        Self { bare, compound }
    }

    /// Source data-element IDs to query, deduplicated, in mapping order.
    pub fn source_data_elements(mappings: &[IdMapping]) -> Vec<String> {
        let mut out = Vec::new();
        let mut seen = HashSet::new();
        for mapping in mappings {
            let (data_element, _) = split_compound(&mapping.source_id);
            if seen.insert(data_element.to_string()) {
                out.push(data_element.to_string());
            }
        }
        out
    }

    /// Rewrite a value's identifiers to the destination side. Returns
    /// false when no mapping covers the value.
    pub fn rewrite(&self, value: &mut DataValue) -> bool {
        if let Some(combo) = value.category_option_combo.clone() {
            if let Some((destination_de, destination_combo)) = self
                .compound
                .get(&(value.data_element.clone(), combo))
            {
                value.data_element = destination_de.clone();
                value.category_option_combo = Some(destination_combo.clone());
                return true;
            }
        }

        if let Some(destination_de) = self.bare.get(&value.data_element) {
            value.data_element = destination_de.clone();
            return true;
        }
        false
    }
}

/// Replicate each value once per category-option-combo of the selected
/// category option, stamping `attributeOptionCombo`. Fails when the
/// option does not belong to the attribute.
pub async fn attribute_fan_out(
    lookup: &dyn ComboLookup,
    selector: &AttributeComboSelector,
    values: Vec<DataValue>,
) -> Result<Vec<DataValue>, MappingError> {
    let option = lookup.category_option(&selector.category_option_id).await?;

    if !option
        .categories
        .iter()
        .any(|category| category.id == selector.attribute_id)
    {
        return Err(MappingError::OptionOutsideAttribute {
            option: selector.category_option_id.clone(),
            attribute: selector.attribute_id.clone(),
        });
    }

    let mut out = Vec::with_capacity(values.len() * option.category_option_combos.len().max(1));
    for value in values {
        for combo in &option.category_option_combos {
            let mut replica = value.clone();
            replica.attribute_option_combo = Some(combo.id.clone());
            out.push(replica);
        }
    }
    Ok(out)
}
