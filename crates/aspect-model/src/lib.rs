#![forbid(unsafe_code)]

//! Core in-memory data model shared by the aspect engine and its hosts.
//!
//! This crate is deliberately free of resolution logic: it defines the
//! runtime [`Value`] representation (JSON-stable for persistence), the
//! [`AspectDef`] definition input handed to the engine by the (external)
//! binding layer, and the [`ChangeNotice`] records the engine emits back.

mod def;
mod notify;
mod value;

pub use def::{AspectDef, AspectKind, DefinitionError, LineFilterDef, LineSchema, Supplemental};
pub use notify::{ChangeNotice, LineOp};
pub use value::{DataType, RowMap, RowValues, Value};
