//! KLL (Keyboard Layout Language) compiler.
//!
//! The compiler parses `.kll` files assigned to context roles, merges the
//! contexts in priority order, reduces the mapping table, and emits
//! firmware tables plus a json report and a canonicalized kll round-trip.

pub mod context;
pub mod emitters;
pub mod expression;
pub mod layouts;
pub mod organization;
pub mod parser;
pub mod stages;
mod test;
pub mod types;

pub use context::{Context, ContextKind, MergeContext};
pub use expression::{Expression, MapExpression, Operator};
pub use layouts::{Layout, Layouts};
pub use parser::{classify, parse_int, parse_string, RawExpression};
pub use stages::{CompilerOptions, ControlStage};
