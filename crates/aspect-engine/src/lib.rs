//! Reactive value-resolution engine over named aspects.
//!
//! An aspect is a named value: entered directly, computed by a formula,
//! resolved through a reference, or derived from repeated rows. The engine
//! keeps every aspect's value consistent by sorting aspects into a
//! weight-based resolution order and running a single propagation pass over
//! that order whenever something changes. [`system::AspectSystem`] is the
//! entry point; expression evaluation and persistence plug in through the
//! [`expr::ExprEvaluator`] and [`storage::StorageProvider`] traits.

#![forbid(unsafe_code)]

pub mod aspect;
pub mod error;
pub mod expr;
pub mod lines;
pub mod registry;
pub mod scope;
pub mod storage;
pub mod system;

pub use aspect::{Aspect, CalcState, ChangedEntry};
pub use error::{EngineError, ExprError, StorageError};
pub use expr::ExprEvaluator;
pub use registry::Registry;
pub use scope::{proper_name, property_aspect_name, row_value_aspect_name, Scope};
pub use storage::{MemoryStorage, StorageProvider, ValueMap};
pub use system::{AspectSystem, ChangeListener, DEFAULT_CONTEXT};
