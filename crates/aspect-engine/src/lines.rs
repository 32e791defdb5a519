//! Repeated-row ("line") support.
//!
//! A line collection owns a schema of property definitions. Every row gets
//! one row-value aspect per property, named `collection_property_rowid`, and
//! formula or reference properties get a per-row linked aspect built by
//! substituting composed row names into the schema's template text. Row data
//! itself lives in the scope under the collection's name.

use crate::aspect::{Aspect, AspectBody, FormulaData, LinkedAspect, ReferenceData};
use crate::error::EngineError;
use crate::registry::Registry;
use crate::scope::{property_aspect_name, proper_name, row_value_aspect_name};
use aspect_model::{AspectKind, LineSchema, Supplemental, Value};
use regex::Regex;

/// Collections currently registered, in definition order.
pub fn collection_names(reg: &Registry) -> Vec<String> {
    reg.names()
        .iter()
        .filter(|name| collection_schema(reg, name).is_some())
        .cloned()
        .collect()
}

fn collection_schema(reg: &Registry, collection: &str) -> Option<LineSchema> {
    match reg.get(collection).map(|aspect| &aspect.body) {
        Some(AspectBody::LineCollection(data)) => Some(data.schema.clone()),
        _ => None,
    }
}

/// Make sure a row and its row-value aspects exist.
///
/// Idempotent: aspects already registered are left alone, and row values
/// already present in the scope (from a load) win over schema defaults.
/// Returns the names of the row-value aspects created.
pub fn ensure_line(
    reg: &mut Registry,
    collection: &str,
    row_id: &str,
) -> Result<Vec<String>, EngineError> {
    let collection = proper_name(collection);
    let row_id = proper_name(row_id);
    let Some(schema) = collection_schema(reg, &collection) else {
        log::warn!("'{collection}' is not a line collection; row '{row_id}' ignored");
        return Ok(Vec::new());
    };
    let mut created = Vec::new();
    for prop in schema.properties() {
        let short = proper_name(&prop.name);
        let template = property_aspect_name(&collection, &short);
        let row_name = row_value_aspect_name(&template, &row_id);
        if reg.contains(&row_name) {
            continue;
        }
        let linked = match (&prop.kind, &prop.supplemental) {
            (AspectKind::Formula, Supplemental::Text(text)) => {
                let formula = row_formula(reg, &collection, &schema, &row_id, &row_name, text)?;
                Some(LinkedAspect::Formula(formula))
            }
            (AspectKind::Reference, Supplemental::Text(slot)) => {
                let slot = row_slot_name(&collection, &schema, &row_id, slot);
                Some(LinkedAspect::Reference(ReferenceData::new(slot)))
            }
            _ => None,
        };
        let is_direct = linked.is_none();
        let mut aspect = Aspect::new_line_value(
            row_name.clone(),
            collection.clone(),
            template,
            short.clone(),
            row_id.clone(),
            linked,
        );
        aspect.apply_definition(prop.effective_data_type(), prop.default_value.clone());
        let loaded = reg.scope().row_value(&collection, &row_id, &short).cloned();
        let initial = loaded
            .clone()
            .or_else(|| aspect.default_value().cloned())
            .unwrap_or(Value::Number(0.0));
        let initial = aspect.data_type().coerce(initial);
        aspect.set_initial_value(initial.clone());
        reg.insert(aspect);
        if is_direct && loaded.is_none() {
            reg.scope_mut()
                .set_row_value(&collection, &row_id, &short, initial);
        }
        created.push(row_name);
    }
    if !reg.scope().has_row(&collection, &row_id) {
        reg.scope_mut().ensure_rows(&collection).entry(row_id).or_default();
    }
    Ok(created)
}

/// Delete a row: its storage and every row-value aspect derived from it.
/// Returns whether the row existed.
pub fn delete_line(reg: &mut Registry, collection: &str, row_id: &str) -> bool {
    let collection = proper_name(collection);
    let row_id = proper_name(row_id);
    let Some(schema) = collection_schema(reg, &collection) else {
        log::warn!("deleteLine: '{collection}' is not a line collection");
        return false;
    };
    let existed = reg.scope_mut().delete_row(&collection, &row_id);
    if !existed {
        log::warn!("deleteLine: no row '{row_id}' in '{collection}'");
    }
    for prop in schema.properties() {
        let template = property_aspect_name(&collection, &proper_name(&prop.name));
        reg.remove(&row_value_aspect_name(&template, &row_id));
    }
    existed
}

/// Register row-value aspects for every row found in the scope after a bulk
/// load. Returns the (collection, row id) pairs seen, in row order.
pub fn adopt_loaded_lines(reg: &mut Registry) -> Result<Vec<(String, String)>, EngineError> {
    let mut rows = Vec::new();
    for collection in collection_names(reg) {
        let ids: Vec<String> = reg
            .scope()
            .rows(&collection)
            .map(|map| map.keys().cloned().collect())
            .unwrap_or_default();
        for row_id in ids {
            ensure_line(reg, &collection, &row_id)?;
            rows.push((collection.clone(), row_id));
        }
    }
    Ok(rows)
}

/// Remove every row of every collection. Returns the (collection, row id)
/// pairs removed so the caller can announce the deletions.
pub fn reset_lines(reg: &mut Registry) -> Vec<(String, String)> {
    let mut removed = Vec::new();
    for collection in collection_names(reg) {
        let ids: Vec<String> = reg
            .scope()
            .rows(&collection)
            .map(|map| map.keys().cloned().collect())
            .unwrap_or_default();
        for row_id in ids {
            if delete_line(reg, &collection, &row_id) {
                removed.push((collection.clone(), row_id));
            }
        }
    }
    removed
}

/// Rewrite a schema template formula for one row: every property name,
/// short or composed, becomes that row's row-value aspect name. Names the
/// schema does not own pass through untouched.
fn row_formula(
    reg: &Registry,
    collection: &str,
    schema: &LineSchema,
    row_id: &str,
    name: &str,
    text: &str,
) -> Result<FormulaData, EngineError> {
    let mut transformed = text.to_string();
    for prop in schema.properties() {
        let short = proper_name(&prop.name);
        let composed = property_aspect_name(collection, &short);
        let row_name = row_value_aspect_name(&composed, row_id);
        for pattern in [&composed, &short] {
            let re = Regex::new(&format!(r"\b{}\b", regex::escape(pattern)))
                .expect("escaped literal is a valid pattern");
            transformed = re.replace_all(&transformed, row_name.as_str()).into_owned();
        }
    }
    reg.build_formula(name, &transformed)
}

/// Resolve a schema reference slot for one row: a sibling property name maps
/// to that row's row-value aspect, anything else is a plain aspect name.
fn row_slot_name(collection: &str, schema: &LineSchema, row_id: &str, slot: &str) -> String {
    let slot = proper_name(slot.trim());
    let is_sibling = schema
        .properties()
        .iter()
        .any(|prop| proper_name(&prop.name) == slot);
    if is_sibling {
        row_value_aspect_name(&property_aspect_name(collection, &slot), row_id)
    } else {
        slot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aspect_model::AspectDef;

    #[test]
    fn row_slot_resolves_siblings_only() {
        let mut schema = LineSchema::new();
        schema.add_property(AspectDef::direct("kind"));
        assert_eq!(row_slot_name("items", &schema, "3", "kind"), "items_kind_3");
        assert_eq!(row_slot_name("items", &schema, "3", "hp-max"), "hp_max");
    }
}
