use crate::error::ExprError;
use crate::scope::Scope;
use aspect_model::Value;
use std::collections::BTreeSet;

/// Boundary to the (external) expression subsystem.
///
/// The engine never interprets formula text itself: it asks the evaluator for
/// the set of names a formula references (to build dependency weights) and
/// for the formula's value against the current scope. Domain primitives such
/// as row aggregates or lookup tables belong to implementations of this
/// trait, not to the engine.
pub trait ExprEvaluator {
    /// Evaluate `text` against the given scope.
    fn evaluate(&self, text: &str, scope: &Scope) -> Result<Value, ExprError>;

    /// The set of names `text` syntactically references.
    ///
    /// A parse failure here is a definition error: the engine refuses to
    /// register a formula it cannot analyze.
    fn referenced_names(&self, text: &str) -> Result<BTreeSet<String>, ExprError>;
}
