use crate::aspect::ChangedEntry;
use crate::error::EngineError;
use crate::expr::ExprEvaluator;
use crate::lines;
use crate::registry::Registry;
use crate::scope::{property_aspect_name, proper_name, row_value_aspect_name};
use crate::storage::{MemoryStorage, StorageProvider, ValueMap};
use aspect_model::{AspectDef, ChangeNotice, LineOp, Value};

/// Context key used when a caller passes none.
pub const DEFAULT_CONTEXT: &str = "default";

/// Callback invoked once per outgoing change notice.
pub type ChangeListener = Box<dyn FnMut(&ChangeNotice)>;

/// The outward face of the engine.
///
/// Owns the registry, the line subsystem, persistence, and the notification
/// stream. Every mutation entry point follows the same shape: apply the edit,
/// run one propagation pass, persist what changed, announce what changed.
/// While a bulk load is in progress both persistence and notifications are
/// suppressed; loads are announced wholesale once the data is in place.
pub struct AspectSystem {
    registry: Registry,
    storage: Box<dyn StorageProvider>,
    listener: Option<ChangeListener>,
    context_key: String,
    loading: u32,
}

impl AspectSystem {
    pub fn new(evaluator: Box<dyn ExprEvaluator>, storage: Box<dyn StorageProvider>) -> Self {
        Self {
            registry: Registry::new(evaluator),
            storage,
            listener: None,
            context_key: DEFAULT_CONTEXT.to_string(),
            loading: 0,
        }
    }

    /// Convenience constructor with in-memory persistence.
    pub fn with_memory_storage(evaluator: Box<dyn ExprEvaluator>) -> Self {
        Self::new(evaluator, Box::new(MemoryStorage::new()))
    }

    pub fn set_listener(&mut self, listener: ChangeListener) {
        self.listener = Some(listener);
    }

    pub fn context_key(&self) -> &str {
        &self.context_key
    }

    pub fn is_loading(&self) -> bool {
        self.loading > 0
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Register a batch of aspect definitions.
    ///
    /// Notifications and persistence stay quiet for the duration; the
    /// resolution order is rebuilt once at the end.
    pub fn load_definitions(&mut self, defs: &[AspectDef]) -> Result<(), EngineError> {
        self.loading += 1;
        let result = (|| {
            for def in defs {
                self.registry.define(def)?;
            }
            Ok(())
        })();
        self.loading -= 1;
        self.registry.set_resolution_order();
        result
    }

    /// Install lookup tables readable from formulas. Lookups are plain scope
    /// entries: never persisted, never reset, never propagated.
    pub fn add_lookup_values(&mut self, values: impl IntoIterator<Item = (String, Value)>) {
        self.registry.add_lookup_values(values);
    }

    /// Current value of an aspect, by external name.
    pub fn value(&mut self, name: &str) -> Option<Value> {
        self.registry.value_of(&proper_name(name))
    }

    /// Current value of one row property.
    pub fn value_of_line(&mut self, collection: &str, row_id: &str, property: &str) -> Option<Value> {
        self.registry
            .scope()
            .row_value(&proper_name(collection), &proper_name(row_id), &proper_name(property))
            .cloned()
    }

    /// Row ids of a collection, in row order.
    pub fn line_ids(&self, collection: &str) -> Vec<String> {
        self.registry
            .scope()
            .rows(&proper_name(collection))
            .map(|rows| rows.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Apply an external edit to a direct-value aspect and propagate it.
    pub fn set_value(&mut self, name: &str, value: impl Into<Value>) {
        let name = proper_name(name);
        if !self.registry.set_aspect_value(&name, value.into()) {
            return;
        }
        let seed = self.registry.entry_for(&name);
        let entries = self.registry.propagate_change(vec![seed]);
        self.finish(&entries, false);
    }

    /// Apply an external edit to one row property and propagate it.
    ///
    /// The column template and the collection itself are folded into the
    /// changed set so filters and row aggregates recalculate.
    pub fn set_value_of_line(
        &mut self,
        collection: &str,
        row_id: &str,
        property: &str,
        value: impl Into<Value>,
    ) {
        let collection = proper_name(collection);
        let template = property_aspect_name(&collection, &proper_name(property));
        let name = row_value_aspect_name(&template, &proper_name(row_id));
        if !self.registry.set_aspect_value(&name, value.into()) {
            return;
        }
        let seeds = vec![
            self.registry.entry_for(&name),
            ChangedEntry::plain(template),
            ChangedEntry::plain(collection),
        ];
        let entries = self.registry.propagate_change(seeds);
        self.finish(&entries, false);
    }

    /// Add a row to a line collection. A no-op when the row already exists.
    pub fn add_line(&mut self, collection: &str, row_id: &str) -> Result<(), EngineError> {
        let created = lines::ensure_line(&mut self.registry, collection, row_id)?;
        if created.is_empty() {
            return Ok(());
        }
        let collection = proper_name(collection);
        let display = self.display_name(&collection);
        self.notify(ChangeNotice::line_op(display, proper_name(row_id), LineOp::Add));
        // Seeds are treated as settled by the scan, so the collection's row
        // count is refreshed here.
        self.registry.recalc(&collection);
        let mut seeds = vec![ChangedEntry::plain(collection)];
        for name in &created {
            // Linked row aspects need their first calculation before the
            // propagation scan can treat them as settled.
            self.registry.recalc(name);
            seeds.push(self.registry.entry_for(name));
        }
        let entries = self.registry.propagate_change(seeds);
        self.finish(&entries, false);
        Ok(())
    }

    /// Delete a row and everything derived from it.
    pub fn delete_line(&mut self, collection: &str, row_id: &str) {
        if !lines::delete_line(&mut self.registry, collection, row_id) {
            return;
        }
        let collection = proper_name(collection);
        let display = self.display_name(&collection);
        self.notify(ChangeNotice::line_op(display, proper_name(row_id), LineOp::Delete));
        self.registry.recalc(&collection);
        let entries = self
            .registry
            .propagate_change(vec![ChangedEntry::plain(collection)]);
        self.finish(&entries, false);
    }

    /// Load a stored context and recalculate everything.
    ///
    /// An empty or unreadable blob falls back to the empty-data path; a
    /// decode failure is reported but never fatal. Rows dropped from the
    /// previous context are announced first, then the loaded rows, then
    /// values, so consumers can tear down and rebuild in order.
    pub fn load_data(&mut self, context_key: &str) -> Result<(), EngineError> {
        let key = if context_key.trim().is_empty() {
            DEFAULT_CONTEXT
        } else {
            context_key
        };
        self.context_key = key.to_string();
        let data = match self.storage.load(key) {
            Ok(map) => map,
            Err(e) => {
                log::error!("failed to load context '{key}': {e}");
                ValueMap::new()
            }
        };
        if data.is_empty() {
            self.set_empty_data();
            return Ok(());
        }
        self.loading += 1;
        let result: Result<_, EngineError> = (|| {
            let removed = lines::reset_lines(&mut self.registry);
            self.registry.reset_values();
            for (name, value) in data {
                self.registry.scope_mut().set(name, value);
            }
            self.registry.adopt_scope_values();
            let added = lines::adopt_loaded_lines(&mut self.registry)?;
            Ok((removed, added))
        })();
        self.loading -= 1;
        let (removed, added) = result?;
        for (collection, row_id) in removed {
            let display = self.display_name(&collection);
            self.notify(ChangeNotice::line_op(display, row_id, LineOp::Delete));
        }
        for (collection, row_id) in added {
            let display = self.display_name(&collection);
            self.notify(ChangeNotice::line_op(display, row_id, LineOp::Add));
        }
        let entries = self.registry.recalculate();
        self.finish(&entries, true);
        Ok(())
    }

    /// Reset to defaults without touching storage.
    pub fn set_empty_data(&mut self) {
        self.reset_state();
        let entries = self.registry.recalculate();
        self.finish(&entries, true);
    }

    /// Reset to defaults and return to the default context. Stored contexts
    /// are left intact so they can be reloaded later.
    pub fn reset_data(&mut self) {
        self.context_key = DEFAULT_CONTEXT.to_string();
        self.set_empty_data();
    }

    /// Persist the full current state under the active context key.
    pub fn save_data(&mut self) {
        if self.is_loading() {
            return;
        }
        let data = self.registry.persistable_values();
        if let Err(e) = self.storage.store(&self.context_key, &data) {
            log::error!("failed to save context '{}': {e}", self.context_key);
        }
    }

    /// Re-announce the current value of one aspect. For a line collection
    /// this re-announces every row value as well.
    pub fn resend(&mut self, name: &str) {
        let name = proper_name(name);
        self.resend_internal(&name, None);
    }

    /// Re-announce one row of a line collection.
    pub fn resend_line(&mut self, collection: &str, row_id: &str) {
        let collection = proper_name(collection);
        let row_id = proper_name(row_id);
        self.resend_internal(&collection, Some(&row_id));
    }

    fn resend_internal(&mut self, name: &str, row_id: Option<&str>) {
        use crate::aspect::AspectBody;
        let Some(aspect) = self.registry.get(name) else {
            return;
        };
        if aspect.is_template() {
            return;
        }
        let is_collection = matches!(aspect.body, AspectBody::LineCollection(_));
        let mut notices = vec![aspect.to_notice()];
        if is_collection {
            for other in self.registry.names().to_vec() {
                let Some(candidate) = self.registry.get(&other) else {
                    continue;
                };
                if let AspectBody::LineValue(value) = &candidate.body {
                    if value.collection == name && row_id.map_or(true, |r| value.row_id == r) {
                        notices.push(candidate.to_notice());
                    }
                }
            }
        }
        for notice in notices {
            self.notify(notice);
        }
    }

    /// Announce every aspect's current value. Used after loads so late
    /// listeners see a full picture.
    pub fn send_all_values(&mut self) {
        let names: Vec<String> = self.registry.names().to_vec();
        for name in names {
            self.resend(&name);
        }
    }

    fn reset_state(&mut self) {
        let removed = lines::reset_lines(&mut self.registry);
        for (collection, row_id) in removed {
            let display = self.display_name(&collection);
            self.notify(ChangeNotice::line_op(display, row_id, LineOp::Delete));
        }
        self.registry.reset_values();
    }

    fn display_name(&self, name: &str) -> String {
        self.registry
            .get(name)
            .map(|aspect| aspect.original_name().to_string())
            .unwrap_or_else(|| name.to_string())
    }

    /// Persist and announce the outcome of one propagation pass.
    fn finish(&mut self, entries: &[ChangedEntry], skip_save: bool) {
        if !skip_save {
            self.save_changes(entries);
        }
        if self.is_loading() {
            return;
        }
        let notices: Vec<ChangeNotice> = entries
            .iter()
            .filter_map(|entry| {
                let aspect = self.registry.get(&entry.name)?;
                if aspect.is_template() {
                    return None;
                }
                Some(aspect.to_notice())
            })
            .collect();
        for notice in notices {
            self.notify(notice);
        }
    }

    /// Incremental save: fold only the changed persistable items into the
    /// stored blob. Falls back to a full snapshot if the blob is unreadable.
    fn save_changes(&mut self, entries: &[ChangedEntry]) {
        if self.is_loading() {
            return;
        }
        let mut data = match self.storage.load(&self.context_key) {
            Ok(map) => map,
            Err(e) => {
                log::error!(
                    "failed to read context '{}' for incremental save, snapshotting: {e}",
                    self.context_key
                );
                self.registry.persistable_values()
            }
        };
        let mut dirty = false;
        for entry in entries {
            if let Some((key, value)) = self.registry.persist_item(&entry.name) {
                if data.get(&key) != Some(&value) {
                    data.insert(key, value);
                    dirty = true;
                }
            }
        }
        if dirty {
            if let Err(e) = self.storage.store(&self.context_key, &data) {
                log::error!("failed to save context '{}': {e}", self.context_key);
            }
        }
    }

    fn notify(&mut self, notice: ChangeNotice) {
        if self.is_loading() {
            return;
        }
        if let Some(listener) = &mut self.listener {
            listener(&notice);
        }
    }
}
