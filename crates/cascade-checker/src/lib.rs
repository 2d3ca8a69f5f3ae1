//! Cascade semantic core: structural type inference, row-polymorphic
//! effect inference, and space isolation analysis.
//!
//! ```text
//! AST → name registration → type/effect inference → space census → Checked
//! ```
//!
//! [`check_program`] runs the whole pipeline over a parsed
//! [`Program`](cascade_types::ast::Program) and returns every
//! expression's inferred type and effect row together with the
//! diagnostics, in source order.

pub mod effects;
pub mod env;
pub mod infer;
pub mod space;
pub mod subtype;
pub mod ty;
pub mod unify;

pub use effects::{EffectLabel, EffectRow, Subsumption};
pub use infer::{check_program, Annotated, Checked, MAX_TYPE_DEPTH};
pub use space::{SpaceDescriptor, SpaceRegistry};
pub use subtype::SubtypeOutcome;
pub use ty::{Bound, Predicate, Type, TypeScheme};
pub use unify::{Substitution, UnifyError, MAX_UNIFY_DEPTH};
