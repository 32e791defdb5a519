use crate::expr::ExprEvaluator;
use crate::scope::Scope;
use ahash::AHashSet;
use aspect_model::{ChangeNotice, DataType, LineOp, LineSchema, Value};
use std::collections::BTreeSet;

/// Weight added by a reference on top of its target's weight.
pub(crate) const REFERENCE_EXTRA_WEIGHT: u32 = 100;
/// Fixed weight of a column-template aspect.
pub(crate) const LINE_PROPERTY_WEIGHT: u32 = 100;
/// Weight added by a row value on top of its linked aspect's weight.
pub(crate) const LINE_VALUE_EXTRA_WEIGHT: u32 = 10;
/// Sentinel weight for broken aspects (unresolved or circular). Broken
/// aspects sort after everything healthy instead of crashing resolution.
pub(crate) const ERROR_WEIGHT: u32 = 1000;

/// Cache state for a computed quantity (value or weight).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalcState {
    NotCalculated,
    Calculated,
    /// Sticky: once set, the quantity is recomputed on every request and the
    /// state can never be overwritten.
    AlwaysCalculate,
}

/// One cached quantity's state machine.
///
/// Transitions: NotCalculated <-> Calculated freely; any -> AlwaysCalculate
/// one-way.
#[derive(Debug, Clone, Copy)]
pub struct CalcFlag(CalcState);

impl CalcFlag {
    pub fn new(state: CalcState) -> Self {
        Self(state)
    }

    pub fn is_calculated(&self) -> bool {
        self.0 == CalcState::Calculated
    }

    pub fn state(&self) -> CalcState {
        self.0
    }

    pub fn set(&mut self, state: CalcState) {
        if self.0 != CalcState::AlwaysCalculate {
            self.0 = state;
        }
    }
}

/// A changed aspect, as seen by `refers_to` during propagation.
///
/// Row values carry their column-template name and row id so per-row
/// formulas can match on "same row".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangedEntry {
    pub name: String,
    pub property_aspect: Option<String>,
    pub row_id: Option<String>,
}

impl ChangedEntry {
    pub fn plain(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            property_aspect: None,
            row_id: None,
        }
    }
}

/// Ordered, deduplicated set of changed aspects accumulated by one
/// propagation pass.
#[derive(Debug, Default)]
pub struct ChangedSet {
    entries: Vec<ChangedEntry>,
    names: AHashSet<String>,
}

impl ChangedSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry unless its name is already present.
    pub fn push(&mut self, entry: ChangedEntry) -> bool {
        if self.names.contains(&entry.name) {
            return false;
        }
        self.names.insert(entry.name.clone());
        self.entries.push(entry);
        true
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChangedEntry> {
        self.entries.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn into_entries(self) -> Vec<ChangedEntry> {
        self.entries
    }
}

/// Formula payload: the text handed to the expression subsystem plus the
/// names it references.
#[derive(Debug, Clone)]
pub struct FormulaData {
    pub text: String,
    pub members: BTreeSet<String>,
}

impl FormulaData {
    fn refers_to(&self, changed: &ChangedSet, row_ctx: Option<&str>) -> bool {
        changed.iter().any(|entry| {
            if self.members.contains(&entry.name) {
                return true;
            }
            match (row_ctx, &entry.property_aspect, &entry.row_id) {
                (Some(row), Some(prop), Some(entry_row)) => {
                    entry_row == row && self.members.contains(prop)
                }
                _ => false,
            }
        })
    }
}

/// Two-slot indirection of a reference: the name of the aspect holding the
/// target name, and the target name last resolved through it.
#[derive(Debug, Clone)]
pub struct ReferenceData {
    pub target_slot: String,
    pub resolved_slot: Option<String>,
    pub weight_changed: bool,
}

impl ReferenceData {
    pub(crate) fn new(target_slot: String) -> Self {
        Self {
            target_slot,
            resolved_slot: None,
            weight_changed: false,
        }
    }

    pub fn is_name_referred(&self, name: &str) -> bool {
        self.target_slot == name || self.resolved_slot.as_deref() == Some(name)
    }

    fn refers_to(&self, changed: &ChangedSet, row_ctx: Option<&str>) -> bool {
        changed.iter().any(|entry| {
            if self.is_name_referred(&entry.name) {
                return true;
            }
            match (row_ctx, &entry.property_aspect, &entry.row_id) {
                (Some(row), Some(prop), Some(entry_row)) => {
                    entry_row == row && self.is_name_referred(prop)
                }
                _ => false,
            }
        })
    }

    /// Resolve the indirection against the scope.
    ///
    /// Returns `None` when the cached value may be kept (same resolved target,
    /// no force). Self-reference and a non-name target slot degrade to a zero
    /// sentinel rather than recursing or failing.
    fn resolve(&mut self, own_name: &str, scope: &Scope, force: bool) -> Option<Value> {
        if self.is_name_referred(own_name) {
            log::error!("circular reference: '{own_name}' resolves to itself");
            return Some(Value::Number(0.0));
        }
        let slot_value = scope.value_or_empty(&self.target_slot);
        let Some(resolved) = slot_value.as_name().map(str::to_string) else {
            log::warn!(
                "reference '{own_name}': slot '{}' does not hold an aspect name",
                self.target_slot
            );
            return Some(Value::Number(0.0));
        };
        if self.resolved_slot.as_deref() == Some(resolved.as_str()) && !force {
            return None;
        }
        if resolved == own_name {
            log::error!("circular reference: '{own_name}' resolves to itself");
            return Some(Value::Number(0.0));
        }
        if self.resolved_slot.as_deref() != Some(resolved.as_str()) {
            // Re-targeting moves this aspect in the dependency graph; flag it
            // so the registry re-runs weight stabilization.
            self.weight_changed = true;
        }
        self.resolved_slot = Some(resolved.clone());
        Some(scope.value_or_empty(&resolved))
    }
}

/// Line collection payload: the property schema. Row storage lives in the
/// scope under the collection's own name.
#[derive(Debug, Clone)]
pub struct CollectionData {
    pub schema: LineSchema,
}

/// Column-template payload.
#[derive(Debug, Clone)]
pub struct PropertyData {
    pub collection: String,
    pub property: String,
}

/// Per-row formula or reference built by substituting the row id into the
/// column's template text. Direct columns have no linked aspect.
#[derive(Debug, Clone)]
pub enum LinkedAspect {
    Formula(FormulaData),
    Reference(ReferenceData),
}

/// Row-value payload: one cell of one row.
#[derive(Debug, Clone)]
pub struct LineValueData {
    pub collection: String,
    pub property_aspect: String,
    pub property: String,
    pub row_id: String,
    pub linked: Option<LinkedAspect>,
}

/// Line-filter payload: backing collection, predicate, and the composed
/// property names the predicate reads (pre-split for row overlaying).
#[derive(Debug, Clone)]
pub struct FilterData {
    pub collection: String,
    pub predicate: FormulaData,
    /// (composed scope name, short property name) pairs.
    pub line_properties: Vec<(String, String)>,
}

impl FilterData {
    fn new(collection: String, predicate: FormulaData) -> Self {
        let prefix = format!("{collection}_");
        let mut members = predicate.members.clone();
        members.insert(collection.clone());
        let line_properties = members
            .iter()
            .filter_map(|member| {
                member
                    .strip_prefix(&prefix)
                    .map(|short| (member.clone(), short.to_string()))
            })
            .collect();
        let predicate = FormulaData {
            text: predicate.text,
            members,
        };
        Self {
            collection,
            predicate,
            line_properties,
        }
    }
}

/// Kind-specific state of an aspect.
#[derive(Debug, Clone)]
pub enum AspectBody {
    Direct,
    Formula(FormulaData),
    Reference(ReferenceData),
    LineCollection(CollectionData),
    LineProperty(PropertyData),
    LineValue(LineValueData),
    LineFilter(FilterData),
}

/// A named node in the dependency graph: computed or stored state plus the
/// caches and weight the resolution order relies on.
#[derive(Debug, Clone)]
pub struct Aspect {
    name: String,
    original_name: String,
    default_value: Option<Value>,
    data_type: DataType,
    value: Value,
    weight: u32,
    value_state: CalcFlag,
    weight_state: CalcFlag,
    pub(crate) body: AspectBody,
}

impl Aspect {
    fn new(
        name: String,
        original_name: String,
        value: Value,
        value_state: CalcState,
        weight_state: CalcState,
        weight: u32,
        body: AspectBody,
    ) -> Self {
        Self {
            name,
            original_name,
            default_value: None,
            data_type: DataType::Unset,
            value,
            weight,
            value_state: CalcFlag::new(value_state),
            weight_state: CalcFlag::new(weight_state),
            body,
        }
    }

    pub fn new_direct(name: String, original_name: String) -> Self {
        Self::new(
            name,
            original_name,
            Value::Number(0.0),
            CalcState::Calculated,
            CalcState::Calculated,
            0,
            AspectBody::Direct,
        )
    }

    pub fn new_formula(name: String, original_name: String, formula: FormulaData) -> Self {
        Self::new(
            name,
            original_name,
            Value::Number(0.0),
            CalcState::NotCalculated,
            CalcState::NotCalculated,
            0,
            AspectBody::Formula(formula),
        )
    }

    pub fn new_reference(name: String, original_name: String, target_slot: String) -> Self {
        Self::new(
            name,
            original_name,
            Value::Number(0.0),
            CalcState::AlwaysCalculate,
            CalcState::AlwaysCalculate,
            REFERENCE_EXTRA_WEIGHT,
            AspectBody::Reference(ReferenceData::new(target_slot)),
        )
    }

    pub fn new_collection(name: String, original_name: String, schema: LineSchema) -> Self {
        Self::new(
            name,
            original_name,
            Value::Number(0.0),
            CalcState::Calculated,
            CalcState::Calculated,
            0,
            AspectBody::LineCollection(CollectionData { schema }),
        )
    }

    pub fn new_line_property(name: String, collection: String, property: String) -> Self {
        let value = Value::Text(name.clone());
        Self::new(
            name,
            property.clone(),
            value,
            CalcState::Calculated,
            CalcState::NotCalculated,
            LINE_PROPERTY_WEIGHT,
            AspectBody::LineProperty(PropertyData {
                collection,
                property,
            }),
        )
    }

    pub fn new_line_value(
        name: String,
        collection: String,
        property_aspect: String,
        property: String,
        row_id: String,
        linked: Option<LinkedAspect>,
    ) -> Self {
        let value_state = if linked.is_some() {
            CalcState::AlwaysCalculate
        } else {
            CalcState::Calculated
        };
        Self::new(
            name,
            property.clone(),
            Value::Number(0.0),
            value_state,
            CalcState::NotCalculated,
            LINE_VALUE_EXTRA_WEIGHT,
            AspectBody::LineValue(LineValueData {
                collection,
                property_aspect,
                property,
                row_id,
                linked,
            }),
        )
    }

    pub fn new_line_filter(name: String, collection: String, predicate: FormulaData) -> Self {
        Self::new(
            name.clone(),
            name,
            Value::Ids(Vec::new()),
            CalcState::NotCalculated,
            CalcState::NotCalculated,
            0,
            AspectBody::LineFilter(FilterData::new(collection, predicate)),
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn original_name(&self) -> &str {
        &self.original_name
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }

    pub(crate) fn set_weight(&mut self, weight: u32) {
        self.weight = weight;
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    pub fn default_value(&self) -> Option<&Value> {
        self.default_value.as_ref()
    }

    /// Apply definition attributes common to all kinds: declared data type
    /// (with numeric inference) and the coerced default value.
    pub fn apply_definition(&mut self, data_type: DataType, default_value: Option<Value>) {
        self.data_type = data_type;
        self.default_value = default_value.map(|v| data_type.coerce(v));
    }

    /// Seed the stored value before the aspect enters a registry. Later
    /// mutations go through `set_value` so the scope stays in sync.
    pub(crate) fn set_initial_value(&mut self, value: Value) {
        self.value = value;
    }

    pub fn is_direct_value(&self) -> bool {
        match &self.body {
            AspectBody::Direct => true,
            AspectBody::LineValue(v) => v.linked.is_none(),
            _ => false,
        }
    }

    pub fn can_persist(&self) -> bool {
        matches!(
            self.body,
            AspectBody::Direct | AspectBody::LineCollection(_)
        )
    }

    /// Column templates hold their own name as value; there is nothing to
    /// announce for them.
    pub fn is_template(&self) -> bool {
        matches!(self.body, AspectBody::LineProperty(_))
    }

    pub fn is_line_aspect(&self) -> bool {
        matches!(
            self.body,
            AspectBody::LineCollection(_)
                | AspectBody::LineProperty(_)
                | AspectBody::LineValue(_)
                | AspectBody::LineFilter(_)
        )
    }

    pub(crate) fn weight_state(&self) -> &CalcFlag {
        &self.weight_state
    }

    pub(crate) fn mark_weight_calculated(&mut self) {
        self.weight_state.set(CalcState::Calculated);
    }

    pub(crate) fn invalidate_weight(&mut self) {
        self.weight_state.set(CalcState::NotCalculated);
    }

    /// Whether value resolution moved this aspect in the dependency graph
    /// (a reference picked a new target).
    pub(crate) fn weight_changed(&self) -> bool {
        match &self.body {
            AspectBody::Reference(r) => r.weight_changed,
            AspectBody::LineValue(v) => match &v.linked {
                Some(LinkedAspect::Reference(r)) => r.weight_changed,
                _ => false,
            },
            _ => false,
        }
    }

    pub(crate) fn clear_weight_changed(&mut self) {
        match &mut self.body {
            AspectBody::Reference(r) => r.weight_changed = false,
            AspectBody::LineValue(v) => {
                if let Some(LinkedAspect::Reference(r)) = &mut v.linked {
                    r.weight_changed = false;
                }
            }
            _ => {}
        }
    }

    /// Does this aspect's computed value depend on anything in `changed`?
    pub fn refers_to(&self, changed: &ChangedSet) -> bool {
        match &self.body {
            AspectBody::Formula(f) => f.refers_to(changed, None),
            AspectBody::Reference(r) => r.refers_to(changed, None),
            AspectBody::LineValue(v) => match &v.linked {
                Some(LinkedAspect::Formula(f)) => f.refers_to(changed, Some(&v.row_id)),
                Some(LinkedAspect::Reference(r)) => r.refers_to(changed, Some(&v.row_id)),
                None => false,
            },
            AspectBody::LineFilter(fd) => changed.iter().any(|e| {
                fd.predicate.members.contains(&e.name)
                    || e.property_aspect
                        .as_deref()
                        .is_some_and(|p| fd.predicate.members.contains(p))
            }),
            _ => false,
        }
    }

    /// Lazily (re)calculate and return the current value.
    ///
    /// The value is pushed into the scope under this aspect's name, except
    /// for line collections whose scope entry is their row storage.
    pub fn get_value(&mut self, scope: &mut Scope, ev: &dyn ExprEvaluator, force: bool) -> Value {
        if !self.value_state.is_calculated() || force {
            if self.calculate_value(scope, ev, force) {
                self.value_state.set(CalcState::Calculated);
            }
            if !matches!(self.body, AspectBody::LineCollection(_)) {
                scope.set(self.name.clone(), self.value.clone());
            }
        }
        self.value.clone()
    }

    fn calculate_value(&mut self, scope: &mut Scope, ev: &dyn ExprEvaluator, force: bool) -> bool {
        match &mut self.body {
            AspectBody::Direct | AspectBody::LineProperty(_) => true,
            AspectBody::Formula(f) => match ev.evaluate(&f.text, scope) {
                Ok(value) => {
                    self.value = value;
                    true
                }
                Err(e) => {
                    log::error!("formula error in '{}': {e}", self.name);
                    self.value = Value::Number(0.0);
                    false
                }
            },
            AspectBody::Reference(r) => {
                if let Some(value) = r.resolve(&self.name, scope, force) {
                    self.value = value;
                }
                true
            }
            AspectBody::LineCollection(_) => {
                let count = scope.rows(&self.name).map(|rows| rows.len()).unwrap_or(0);
                self.value = Value::Number(count as f64);
                true
            }
            AspectBody::LineValue(v) => {
                if let Some(linked) = &mut v.linked {
                    let value = match linked {
                        LinkedAspect::Formula(f) => match ev.evaluate(&f.text, scope) {
                            Ok(value) => value,
                            Err(e) => {
                                log::error!("row formula error in '{}': {e}", self.name);
                                Value::Number(0.0)
                            }
                        },
                        LinkedAspect::Reference(r) => match r.resolve(&self.name, scope, force) {
                            Some(value) => value,
                            None => self.value.clone(),
                        },
                    };
                    scope.set_row_value(&v.collection, &v.row_id, &v.property, value.clone());
                    self.value = value;
                }
                true
            }
            AspectBody::LineFilter(fd) => {
                self.value = calculate_filter(fd, &self.name, scope, ev);
                true
            }
        }
    }

    /// Set a new value from an external edit. Only meaningful for
    /// direct-value aspects; misuse is reported and ignored.
    pub fn set_value(&mut self, new_value: Value, scope: &mut Scope) {
        if !self.is_direct_value() {
            log::warn!("setValue ignored: '{}' is not a direct-value aspect", self.name);
            return;
        }
        if let AspectBody::LineValue(v) = &self.body {
            if self.value == new_value {
                return;
            }
            scope.set_row_value(&v.collection, &v.row_id, &v.property, new_value.clone());
        }
        self.value = new_value.clone();
        scope.set(self.name.clone(), new_value);
    }

    /// Seed the scope entry for this aspect.
    pub fn initialize(&mut self, scope: &mut Scope) {
        if matches!(self.body, AspectBody::LineCollection(_)) {
            scope.ensure_rows(&self.name);
            return;
        }
        scope.set(self.name.clone(), self.value.clone());
    }

    /// Adopt the value currently held in the scope (after a bulk load).
    pub fn initialize_from_scope(&mut self, scope: &Scope) {
        match &self.body {
            AspectBody::LineCollection(_) => {
                let count = scope.rows(&self.name).map(|rows| rows.len()).unwrap_or(0);
                self.value = Value::Number(count as f64);
            }
            AspectBody::LineValue(v) => {
                if let Some(value) = scope.row_value(&v.collection, &v.row_id, &v.property) {
                    self.value = self.data_type.coerce(value.clone());
                }
            }
            _ => {
                if let Some(value) = scope.get(&self.name) {
                    self.value = self.data_type.coerce(value.clone());
                }
            }
        }
    }

    /// Restore the default value and re-seed the scope.
    pub fn reset(&mut self, scope: &mut Scope) {
        match &self.body {
            AspectBody::LineCollection(_) => {
                scope.set(self.name.clone(), Value::Rows(Default::default()));
                self.value = Value::Number(0.0);
            }
            AspectBody::LineProperty(_) => {
                self.value = Value::Text(self.name.clone());
                scope.set(self.name.clone(), self.value.clone());
            }
            AspectBody::LineFilter(_) => {
                self.value = Value::Ids(Vec::new());
                scope.set(self.name.clone(), self.value.clone());
            }
            _ => {
                self.value = self
                    .default_value
                    .clone()
                    .unwrap_or(Value::Number(0.0));
                scope.set(self.name.clone(), self.value.clone());
            }
        }
        self.value_state.set(CalcState::Calculated);
    }

    /// Build the externally-visible change record for this aspect.
    pub fn to_notice(&self) -> ChangeNotice {
        match &self.body {
            AspectBody::LineValue(v) => ChangeNotice::row_change(
                v.collection.clone(),
                v.property.clone(),
                v.row_id.clone(),
                self.value.clone(),
            ),
            AspectBody::LineFilter(_) => {
                ChangeNotice::value_change(self.original_name.clone(), self.value.clone())
                    .with_line_op(LineOp::Filter)
            }
            _ => ChangeNotice::value_change(self.original_name.clone(), self.value.clone()),
        }
    }
}

/// Evaluate a filter predicate once per row of the backing collection.
///
/// Each row's property values are overlaid into a private copy of the scope
/// under their composed names; matching row ids are collected in row order.
fn calculate_filter(fd: &FilterData, name: &str, scope: &Scope, ev: &dyn ExprEvaluator) -> Value {
    let Some(rows) = scope.rows(&fd.collection) else {
        log::warn!("filter '{name}': collection '{}' has no row storage", fd.collection);
        return Value::Ids(Vec::new());
    };
    let mut local = scope.clone();
    let mut ids = Vec::new();
    for (row_id, values) in rows {
        for (scope_name, short) in &fd.line_properties {
            let value = values.get(short).cloned().unwrap_or(Value::Empty);
            local.set(scope_name.clone(), value);
        }
        match ev.evaluate(&fd.predicate.text, &local) {
            Ok(value) if value.is_truthy() => ids.push(row_id.clone()),
            Ok(_) => {}
            Err(e) => log::error!("filter '{name}': predicate failed for row '{row_id}': {e}"),
        }
    }
    Value::Ids(ids)
}
