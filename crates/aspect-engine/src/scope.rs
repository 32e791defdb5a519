use ahash::AHashMap;
use aspect_model::{RowMap, Value};

/// Rewrite an external name into the form stored and resolved internally.
///
/// Markup-facing names may contain `-`, which formula grammars treat as an
/// operator; internal names use `_` instead.
pub fn proper_name(name: &str) -> String {
    name.replace('-', "_")
}

/// Composed name of the column-template aspect for a collection property:
/// `collection_property`.
pub fn property_aspect_name(collection: &str, property: &str) -> String {
    format!("{collection}_{property}")
}

/// Composed name of a per-row value aspect: `collection_property_rowid`.
pub fn row_value_aspect_name(property_aspect: &str, row_id: &str) -> String {
    format!("{property_aspect}_{row_id}")
}

/// The flat name -> value map all formulas read and write through.
///
/// A line collection's entry is its row map itself; every other aspect keeps
/// a plain value under its own name. The registry and line manager are the
/// only mutators.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    values: AHashMap<String, Value>,
}

impl Scope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn value_or_empty(&self, name: &str) -> Value {
        self.values.get(name).cloned().unwrap_or(Value::Empty)
    }

    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        self.values.insert(name.into(), value);
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.values.remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.values.iter()
    }

    /// Row storage of a line collection, if present.
    pub fn rows(&self, collection: &str) -> Option<&RowMap> {
        self.values.get(collection).and_then(Value::as_rows)
    }

    pub fn rows_mut(&mut self, collection: &str) -> Option<&mut RowMap> {
        match self.values.get_mut(collection) {
            Some(Value::Rows(rows)) => Some(rows),
            _ => None,
        }
    }

    /// Make sure `collection` holds row storage, replacing any scalar left
    /// behind by an earlier reset or load.
    pub fn ensure_rows(&mut self, collection: &str) -> &mut RowMap {
        let entry = self
            .values
            .entry(collection.to_string())
            .or_insert_with(|| Value::Rows(RowMap::new()));
        if !matches!(entry, Value::Rows(_)) {
            *entry = Value::Rows(RowMap::new());
        }
        match entry {
            Value::Rows(rows) => rows,
            _ => unreachable!("entry was just coerced to rows"),
        }
    }

    pub fn has_row(&self, collection: &str, row_id: &str) -> bool {
        self.rows(collection)
            .map(|rows| rows.contains_key(row_id))
            .unwrap_or(false)
    }

    /// Write one property value into a collection's row, creating the row on
    /// first use.
    pub fn set_row_value(&mut self, collection: &str, row_id: &str, property: &str, value: Value) {
        let rows = self.ensure_rows(collection);
        rows.entry(row_id.to_string())
            .or_default()
            .insert(property.to_string(), value);
    }

    pub fn row_value(&self, collection: &str, row_id: &str, property: &str) -> Option<&Value> {
        self.rows(collection)?.get(row_id)?.get(property)
    }

    pub fn delete_row(&mut self, collection: &str, row_id: &str) -> bool {
        match self.rows_mut(collection) {
            Some(rows) => rows.remove(row_id).is_some(),
            None => false,
        }
    }
}
