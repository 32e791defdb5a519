use crate::aspect::{
    Aspect, AspectBody, ChangedEntry, ChangedSet, FormulaData, LinkedAspect, ERROR_WEIGHT,
    LINE_PROPERTY_WEIGHT, LINE_VALUE_EXTRA_WEIGHT, REFERENCE_EXTRA_WEIGHT,
};
use crate::error::EngineError;
use crate::expr::ExprEvaluator;
use crate::scope::{property_aspect_name, proper_name, Scope};
use crate::storage::ValueMap;
use ahash::AHashMap;
use aspect_model::{AspectDef, AspectKind, DefinitionError, RowMap, Supplemental, Value};

/// Upper bound on weight-stabilization rounds inside one propagation pass.
/// A re-targeting reference can invalidate the order at most once per hop of
/// the longest reference chain; anything deeper than this is pathological.
const MAX_WEIGHT_ROUNDS: usize = 8;

/// The dependency graph: every registered aspect, the shared scope, and the
/// weight-sorted order value resolution walks.
pub struct Registry {
    aspects: AHashMap<String, Aspect>,
    insertion: Vec<String>,
    resolution_order: Vec<String>,
    order_dirty: bool,
    scope: Scope,
    evaluator: Box<dyn ExprEvaluator>,
}

impl Registry {
    pub fn new(evaluator: Box<dyn ExprEvaluator>) -> Self {
        Self {
            aspects: AHashMap::new(),
            insertion: Vec::new(),
            resolution_order: Vec::new(),
            order_dirty: false,
            scope: Scope::new(),
            evaluator,
        }
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn scope_mut(&mut self) -> &mut Scope {
        &mut self.scope
    }

    pub fn evaluator(&self) -> &dyn ExprEvaluator {
        self.evaluator.as_ref()
    }

    pub fn get(&self, name: &str) -> Option<&Aspect> {
        self.aspects.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Aspect> {
        self.aspects.get_mut(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.aspects.contains_key(name)
    }

    /// Registered names in definition order.
    pub fn names(&self) -> &[String] {
        &self.insertion
    }

    /// Register an aspect, replacing any earlier definition of the same name.
    /// Replacement keeps the original position in definition order.
    pub fn insert(&mut self, mut aspect: Aspect) {
        let name = aspect.name().to_string();
        aspect.initialize(&mut self.scope);
        if self.aspects.insert(name.clone(), aspect).is_none() {
            self.insertion.push(name);
        }
        self.order_dirty = true;
    }

    /// Drop an aspect and its scope entry. Used when rows are deleted.
    pub fn remove(&mut self, name: &str) -> bool {
        if self.aspects.remove(name).is_none() {
            return false;
        }
        self.insertion.retain(|n| n != name);
        self.scope.remove(name);
        self.order_dirty = true;
        true
    }

    /// Build and register the aspect(s) described by a definition.
    ///
    /// A line collection definition also registers one column-template aspect
    /// per schema property.
    pub fn define(&mut self, def: &AspectDef) -> Result<(), EngineError> {
        def.validate()?;
        let proper = proper_name(&def.name);
        let mut aspect = match (&def.kind, &def.supplemental) {
            (AspectKind::Direct, _) => Aspect::new_direct(proper.clone(), def.name.clone()),
            (AspectKind::Formula, Supplemental::Text(text)) => {
                let formula = self.build_formula(&proper, text)?;
                Aspect::new_formula(proper.clone(), def.name.clone(), formula)
            }
            (AspectKind::Reference, Supplemental::Text(slot)) => {
                Aspect::new_reference(proper.clone(), def.name.clone(), proper_name(slot))
            }
            (AspectKind::LineCollection, Supplemental::Schema(schema)) => {
                Aspect::new_collection(proper.clone(), def.name.clone(), schema.clone())
            }
            (AspectKind::LineFilter, Supplemental::Filter(filter)) => {
                let collection = proper_name(&filter.collection);
                let predicate = self.build_formula(&proper, &filter.predicate)?;
                Aspect::new_line_filter(proper, collection, predicate)
            }
            _ => {
                // validate() rejects these pairings; kept as a hard stop for
                // definitions constructed without going through it.
                return Err(DefinitionError::MissingSupplemental {
                    name: def.name.clone(),
                    kind: def.kind,
                    what: "supplemental data",
                }
                .into());
            }
        };
        aspect.apply_definition(def.effective_data_type(), def.default_value.clone());
        if aspect.is_direct_value() {
            if let Some(default) = aspect.default_value().cloned() {
                aspect.set_initial_value(default);
            }
        }
        let column_templates = match (&def.kind, &def.supplemental) {
            (AspectKind::LineCollection, Supplemental::Schema(schema)) => {
                let collection = aspect.name().to_string();
                schema
                    .properties()
                    .iter()
                    .map(|prop| {
                        let short = proper_name(&prop.name);
                        let name = property_aspect_name(&collection, &short);
                        Aspect::new_line_property(name, collection.clone(), short)
                    })
                    .collect()
            }
            _ => Vec::new(),
        };
        self.insert(aspect);
        for template in column_templates {
            self.insert(template);
        }
        Ok(())
    }

    pub(crate) fn build_formula(&self, name: &str, text: &str) -> Result<FormulaData, EngineError> {
        let members = self
            .evaluator
            .referenced_names(text)
            .map_err(|source| EngineError::Formula {
                name: name.to_string(),
                source,
            })?;
        Ok(FormulaData {
            text: text.to_string(),
            members,
        })
    }

    /// Current value of an aspect, calculating it if needed.
    pub fn value_of(&mut self, name: &str) -> Option<Value> {
        let aspect = self.aspects.get_mut(name)?;
        Some(aspect.get_value(&mut self.scope, self.evaluator.as_ref(), false))
    }

    /// Force-recalculate one aspect.
    pub fn recalc(&mut self, name: &str) -> Option<Value> {
        let aspect = self.aspects.get_mut(name)?;
        Some(aspect.get_value(&mut self.scope, self.evaluator.as_ref(), true))
    }

    /// Apply an external edit to a direct-value aspect.
    ///
    /// The value is coerced to the aspect's data type first. Returns whether
    /// anything actually changed; unchanged edits are absorbed silently and
    /// misdirected ones (unknown or computed aspects) are reported.
    pub fn set_aspect_value(&mut self, name: &str, value: Value) -> bool {
        let Some(aspect) = self.aspects.get_mut(name) else {
            log::warn!("setValue: unknown aspect '{name}'");
            return false;
        };
        if !aspect.is_direct_value() {
            log::warn!("setValue ignored: '{name}' is not a direct-value aspect");
            return false;
        }
        let value = aspect.data_type().coerce(value);
        if *aspect.value() == value {
            return false;
        }
        aspect.set_value(value, &mut self.scope);
        true
    }

    /// Recompute stale weights and sort the resolution order.
    ///
    /// The sort is stable over definition order, so equal-weight aspects
    /// resolve in the order they were defined.
    pub fn set_resolution_order(&mut self) {
        let mut memo: AHashMap<String, u32> = AHashMap::new();
        for (name, aspect) in &self.aspects {
            if aspect.weight_state().is_calculated() {
                memo.insert(name.clone(), aspect.weight());
            }
        }
        let names = self.insertion.clone();
        let mut visiting = Vec::new();
        for name in &names {
            self.weight_of(name, &mut memo, &mut visiting);
        }
        for name in &names {
            if let (Some(aspect), Some(weight)) = (self.aspects.get_mut(name), memo.get(name)) {
                aspect.set_weight(*weight);
                aspect.mark_weight_calculated();
            }
        }
        let mut order = names;
        order.sort_by_key(|name| memo.get(name).copied().unwrap_or(0));
        self.resolution_order = order;
        self.order_dirty = false;
    }

    fn ensure_order(&mut self) {
        if self.order_dirty {
            self.set_resolution_order();
        }
    }

    pub fn resolution_order(&mut self) -> &[String] {
        self.ensure_order();
        &self.resolution_order
    }

    /// Recursive weight with memoization and cycle detection.
    ///
    /// A cycle is reported once per offending aspect and every participant is
    /// capped at the error weight, pushing the whole cycle to the end of the
    /// resolution order instead of failing.
    fn weight_of(
        &self,
        name: &str,
        memo: &mut AHashMap<String, u32>,
        visiting: &mut Vec<String>,
    ) -> u32 {
        if let Some(weight) = memo.get(name) {
            return *weight;
        }
        if visiting.iter().any(|n| n == name) {
            log::error!("circular dependency through aspect '{name}'");
            return ERROR_WEIGHT;
        }
        let Some(aspect) = self.aspects.get(name) else {
            // Not an aspect; plain scope entries (lookup tables) cost nothing.
            return 0;
        };
        visiting.push(name.to_string());
        let weight = match &aspect.body {
            AspectBody::Direct | AspectBody::LineCollection(_) => 0,
            AspectBody::LineProperty(_) => LINE_PROPERTY_WEIGHT,
            AspectBody::Formula(formula) => self.formula_weight(formula, memo, visiting),
            AspectBody::Reference(reference) => {
                let slot = self.weight_of(&reference.target_slot, memo, visiting);
                let resolved = reference
                    .resolved_slot
                    .as_deref()
                    .map(|target| self.weight_of(target, memo, visiting))
                    .unwrap_or(0);
                REFERENCE_EXTRA_WEIGHT.saturating_add(slot.max(resolved))
            }
            AspectBody::LineValue(value) => {
                let linked = match &value.linked {
                    Some(LinkedAspect::Formula(formula)) => {
                        self.formula_weight(formula, memo, visiting)
                    }
                    Some(LinkedAspect::Reference(reference)) => {
                        let slot = self.weight_of(&reference.target_slot, memo, visiting);
                        let resolved = reference
                            .resolved_slot
                            .as_deref()
                            .map(|target| self.weight_of(target, memo, visiting))
                            .unwrap_or(0);
                        REFERENCE_EXTRA_WEIGHT.saturating_add(slot.max(resolved))
                    }
                    None => 0,
                };
                LINE_VALUE_EXTRA_WEIGHT.saturating_add(linked)
            }
            AspectBody::LineFilter(filter) => self.formula_weight(&filter.predicate, memo, visiting),
        };
        visiting.pop();
        let weight = weight.min(ERROR_WEIGHT);
        memo.insert(name.to_string(), weight);
        weight
    }

    /// Formula weight: one more than the combined weight of its members, with
    /// an extra point per member that is not a live aspect (lookup entries
    /// and unresolved names alike).
    fn formula_weight(
        &self,
        formula: &FormulaData,
        memo: &mut AHashMap<String, u32>,
        visiting: &mut Vec<String>,
    ) -> u32 {
        let mut weight: u32 = 1;
        for member in &formula.members {
            let member_weight = if self.aspects.contains_key(member) {
                self.weight_of(member, memo, visiting)
            } else {
                1
            };
            weight = weight.saturating_add(member_weight);
        }
        weight
    }

    /// Single-pass change propagation.
    ///
    /// Walks the resolution order once, recalculating every aspect that
    /// refers to something already changed. If a recalculation moved an
    /// aspect's weight (a reference re-targeted), the order is rebuilt and
    /// the walk repeats with the moved aspects folded into the changed set,
    /// up to a fixed number of rounds.
    pub fn propagate_change(&mut self, seeds: Vec<ChangedEntry>) -> Vec<ChangedEntry> {
        let mut changed = ChangedSet::new();
        for seed in seeds {
            let template = seed.property_aspect.clone();
            changed.push(seed);
            // A changed row value implicates its column template, so
            // aggregates and filters over the whole column recalculate.
            if let Some(template) = template {
                changed.push(ChangedEntry::plain(template));
            }
        }
        if changed.is_empty() {
            return Vec::new();
        }
        self.ensure_order();
        for round in 0.. {
            let mut moved: Vec<String> = Vec::new();
            let order = self.resolution_order.clone();
            for name in order {
                if changed.contains(&name) {
                    continue;
                }
                let mut value_changed = false;
                let mut weight_moved = false;
                match self.aspects.get_mut(&name) {
                    Some(aspect) => {
                        if !aspect.refers_to(&changed) {
                            continue;
                        }
                        let old = aspect.value().clone();
                        let new =
                            aspect.get_value(&mut self.scope, self.evaluator.as_ref(), true);
                        if aspect.weight_changed() {
                            aspect.clear_weight_changed();
                            aspect.invalidate_weight();
                            weight_moved = true;
                        }
                        value_changed = new != old;
                    }
                    None => continue,
                }
                if weight_moved {
                    moved.push(name.clone());
                }
                if value_changed || weight_moved {
                    let entry = self.entry_for(&name);
                    let template = entry.property_aspect.clone();
                    changed.push(entry);
                    if let Some(template) = template {
                        changed.push(ChangedEntry::plain(template));
                    }
                }
            }
            if moved.is_empty() {
                break;
            }
            if round + 1 >= MAX_WEIGHT_ROUNDS {
                log::error!(
                    "weight stabilization did not settle after {MAX_WEIGHT_ROUNDS} rounds; \
                     {} aspect(s) still moving",
                    moved.len()
                );
                break;
            }
            self.order_dirty = true;
            self.ensure_order();
        }
        changed.into_entries()
    }

    pub(crate) fn entry_for(&self, name: &str) -> ChangedEntry {
        match self.aspects.get(name).map(|aspect| &aspect.body) {
            Some(AspectBody::LineValue(value)) => ChangedEntry {
                name: name.to_string(),
                property_aspect: Some(value.property_aspect.clone()),
                row_id: Some(value.row_id.clone()),
            },
            _ => ChangedEntry::plain(name),
        }
    }

    /// Force-recalculate everything in resolution order. Used after a bulk
    /// load; returns one entry per aspect so callers can notify all values.
    pub fn recalculate(&mut self) -> Vec<ChangedEntry> {
        self.order_dirty = true;
        self.ensure_order();
        let order = self.resolution_order.clone();
        let mut entries = Vec::with_capacity(order.len());
        for name in order {
            if let Some(aspect) = self.aspects.get_mut(&name) {
                aspect.get_value(&mut self.scope, self.evaluator.as_ref(), true);
            }
            entries.push(self.entry_for(&name));
        }
        entries
    }

    /// Restore every aspect to its default value. Lookup-table entries in the
    /// scope survive; they are not aspects.
    pub fn reset_values(&mut self) {
        let names = self.insertion.clone();
        for name in names {
            if let Some(aspect) = self.aspects.get_mut(&name) {
                aspect.reset(&mut self.scope);
            }
        }
        self.order_dirty = true;
    }

    /// Adopt values bulk-loaded into the scope.
    pub fn adopt_scope_values(&mut self) {
        let names = self.insertion.clone();
        for name in names {
            if let Some(aspect) = self.aspects.get_mut(&name) {
                aspect.initialize_from_scope(&self.scope);
            }
        }
    }

    /// Install externally-provided constants (lookup tables) into the scope.
    /// They are readable from formulas but never persisted or reset.
    pub fn add_lookup_values(&mut self, values: impl IntoIterator<Item = (String, Value)>) {
        for (name, value) in values {
            self.scope.set(proper_name(&name), value);
        }
    }

    /// What a single changed aspect contributes to the persisted context, if
    /// anything. Row-value changes persist their whole collection's row map.
    pub(crate) fn persist_item(&self, name: &str) -> Option<(String, Value)> {
        let aspect = self.aspects.get(name)?;
        match &aspect.body {
            AspectBody::Direct => Some((name.to_string(), aspect.value().clone())),
            AspectBody::LineCollection(_) => Some((
                name.to_string(),
                Value::Rows(self.scope.rows(name).cloned().unwrap_or_default()),
            )),
            AspectBody::LineValue(value) => Some((
                value.collection.clone(),
                Value::Rows(self.scope.rows(&value.collection).cloned().unwrap_or_default()),
            )),
            _ => None,
        }
    }

    /// Snapshot of everything persistable: direct values plus each line
    /// collection's row map.
    pub fn persistable_values(&self) -> ValueMap {
        let mut out = ValueMap::new();
        for name in &self.insertion {
            let Some(aspect) = self.aspects.get(name) else {
                continue;
            };
            if !aspect.can_persist() {
                continue;
            }
            let value = if aspect.is_line_aspect() {
                Value::Rows(self.scope.rows(name).cloned().unwrap_or_else(RowMap::new))
            } else {
                aspect.value().clone()
            };
            out.insert(name.clone(), value);
        }
        out
    }
}
