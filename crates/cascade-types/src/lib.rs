//! Shared types for the Cascade checker.
//!
//! This crate defines the AST node types, source spans, and the structured
//! diagnostic model shared between the parser front-end and the semantic
//! core.

mod diag;
mod span;
pub mod ast;

pub use diag::{DiagKind, Diagnostic, Diagnostics, Severity, MAX_DIAGNOSTICS};
pub use span::{SourceFile, Span};
