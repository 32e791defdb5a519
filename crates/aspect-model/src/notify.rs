use crate::value::Value;
use serde::{Deserialize, Serialize};

/// Structural marker attached to a change notice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineOp {
    /// A row was added to a line collection.
    Add,
    /// A row was removed from a line collection.
    Delete,
    /// A line filter re-evaluated its row-id list.
    Filter,
}

/// Externally-visible record of a single aspect change.
///
/// Plain value updates carry only `name` and `value`. Row-level updates also
/// carry the short property name and row id. Structural events (row add/delete,
/// filter refresh) are tagged through `line_op`; consumers diff filter id lists
/// themselves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeNotice {
    pub name: String,
    pub property: Option<String>,
    pub row_id: Option<String>,
    pub value: Value,
    pub line_op: Option<LineOp>,
}

impl ChangeNotice {
    pub fn value_change(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            property: None,
            row_id: None,
            value,
            line_op: None,
        }
    }

    pub fn row_change(
        collection: impl Into<String>,
        property: impl Into<String>,
        row_id: impl Into<String>,
        value: Value,
    ) -> Self {
        Self {
            name: collection.into(),
            property: Some(property.into()),
            row_id: Some(row_id.into()),
            value,
            line_op: None,
        }
    }

    pub fn line_op(
        collection: impl Into<String>,
        row_id: impl Into<String>,
        op: LineOp,
    ) -> Self {
        Self {
            name: collection.into(),
            property: None,
            row_id: Some(row_id.into()),
            value: Value::Empty,
            line_op: Some(op),
        }
    }

    pub fn with_line_op(mut self, op: LineOp) -> Self {
        self.line_op = Some(op);
        self
    }
}
