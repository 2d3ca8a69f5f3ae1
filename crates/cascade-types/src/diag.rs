use crate::Span;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Maximum number of diagnostics stored before the collection stops
/// retaining new ones. Totals keep counting past the cap.
pub const MAX_DIAGNOSTICS: usize = 32;

/// Diagnostic severity.
///
/// The checker currently emits only `Error`. Warnings are reserved for
/// lint-grade findings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

/// The closed taxonomy of checker diagnostics.
///
/// Tooling dispatches on the serialized kind name, so the kebab-case
/// renderings here are a stable contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DiagKind {
    /// A name was used that no scope or global table defines.
    UnboundIdentifier,
    /// A value's inferred type is not a subtype of what its context requires.
    MismatchType,
    /// An inferred effect row is not subsumed by the declared contract row.
    MismatchEffect,
    /// An isolation, atomicity, or capability rule of a space was broken.
    SpaceViolation,
    /// A refinement predicate could not be decided; rejected conservatively.
    PredicateUnverifiable,
    /// A type, alias chain, or embed graph has no finite expansion, or a
    /// resolution budget was exhausted.
    NonTerminatingType,
}

impl DiagKind {
    /// Stable machine-readable name, matching the serde rendering.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UnboundIdentifier => "unbound-identifier",
            Self::MismatchType => "mismatch-type",
            Self::MismatchEffect => "mismatch-effect",
            Self::SpaceViolation => "space-violation",
            Self::PredicateUnverifiable => "predicate-unverifiable",
            Self::NonTerminatingType => "non-terminating-type",
        }
    }
}

impl fmt::Display for DiagKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A structured checker diagnostic.
///
/// Reporting front-ends render these fields directly; they must never
/// have to parse free-form message strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[error("{span}: {kind}: {message}")]
pub struct Diagnostic {
    /// Which rule was broken.
    pub kind: DiagKind,
    /// Diagnostic severity.
    pub severity: Severity,
    /// Human-readable description.
    pub message: String,
    /// Source location.
    #[serde(flatten)]
    pub span: Span,
    /// Rendering of the type/effect the context required, when one exists.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected: Option<String>,
    /// Rendering of what was actually inferred, when one exists.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual: Option<String>,
    /// Optional fix suggestion.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

impl Diagnostic {
    /// Create a new error-severity diagnostic.
    pub fn new(kind: DiagKind, message: impl Into<String>, span: Span) -> Self {
        Self {
            kind,
            severity: Severity::Error,
            message: message.into(),
            span,
            expected: None,
            actual: None,
            suggestion: None,
        }
    }

    /// Attach expected/actual renderings.
    pub fn with_expected_actual(
        mut self,
        expected: impl Into<String>,
        actual: impl Into<String>,
    ) -> Self {
        self.expected = Some(expected.into());
        self.actual = Some(actual.into());
        self
    }

    /// Attach a fix suggestion.
    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }
}

/// Ordered diagnostic collection for one checked program.
///
/// Storage is capped at [`MAX_DIAGNOSTICS`]; `total_errors` and
/// `total_warnings` keep counting past the cap so callers can tell the
/// difference between "32 problems" and "hundreds".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Diagnostics {
    pub diagnostics: Vec<Diagnostic>,
    pub total_errors: usize,
    pub total_warnings: usize,
}

impl Diagnostics {
    /// Create an empty collection.
    pub fn new() -> Self {
        Self {
            diagnostics: Vec::new(),
            total_errors: 0,
            total_warnings: 0,
        }
    }

    /// Check whether any error-severity diagnostic was recorded.
    pub fn has_errors(&self) -> bool {
        self.total_errors > 0
    }

    /// Add a diagnostic, respecting the storage cap.
    pub fn push(&mut self, diag: Diagnostic) {
        match diag.severity {
            Severity::Error => self.total_errors += 1,
            Severity::Warning => self.total_warnings += 1,
        }
        if self.diagnostics.len() < MAX_DIAGNOSTICS {
            self.diagnostics.push(diag);
        }
    }

    /// Number of stored diagnostics.
    pub fn len(&self) -> usize {
        self.diagnostics.len()
    }

    /// True when nothing was recorded at all.
    pub fn is_empty(&self) -> bool {
        self.total_errors == 0 && self.total_warnings == 0
    }

    /// Iterate over stored diagnostics in emission order.
    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics.iter()
    }

    /// Count stored diagnostics of one kind.
    pub fn count_of(&self, kind: DiagKind) -> usize {
        self.diagnostics.iter().filter(|d| d.kind == kind).count()
    }

    /// Render the collection as pretty JSON for tooling.
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|e| {
            format!("{{\"serialization_error\":\"{e}\"}}")
        })
    }
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names_are_kebab_case() {
        assert_eq!(DiagKind::UnboundIdentifier.as_str(), "unbound-identifier");
        assert_eq!(DiagKind::MismatchType.as_str(), "mismatch-type");
        assert_eq!(DiagKind::MismatchEffect.as_str(), "mismatch-effect");
        assert_eq!(DiagKind::SpaceViolation.as_str(), "space-violation");
        assert_eq!(
            DiagKind::PredicateUnverifiable.as_str(),
            "predicate-unverifiable"
        );
        assert_eq!(DiagKind::NonTerminatingType.as_str(), "non-terminating-type");
    }

    #[test]
    fn test_serde_kind_matches_as_str() {
        for kind in [
            DiagKind::UnboundIdentifier,
            DiagKind::MismatchType,
            DiagKind::MismatchEffect,
            DiagKind::SpaceViolation,
            DiagKind::PredicateUnverifiable,
            DiagKind::NonTerminatingType,
        ] {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
        }
    }

    #[test]
    fn test_diagnostic_creation() {
        let d = Diagnostic::new(
            DiagKind::MismatchType,
            "expected `Int`, found `String`",
            Span::new(4, 9, 4, 16),
        );
        assert_eq!(d.kind, DiagKind::MismatchType);
        assert_eq!(d.severity, Severity::Error);
        assert!(d.suggestion.is_none());
    }

    #[test]
    fn test_diagnostic_builders() {
        let d = Diagnostic::new(
            DiagKind::MismatchEffect,
            "body performs effects the declaration does not allow",
            Span::new(2, 1, 2, 30),
        )
        .with_expected_actual("Pure", "[IO]")
        .with_suggestion("declare the effect: `with IO`");
        assert_eq!(d.expected.as_deref(), Some("Pure"));
        assert_eq!(d.actual.as_deref(), Some("[IO]"));
        assert_eq!(d.suggestion.as_deref(), Some("declare the effect: `with IO`"));
    }

    #[test]
    fn test_diagnostic_display() {
        let d = Diagnostic::new(
            DiagKind::UnboundIdentifier,
            "unknown name `frobnicate`",
            Span::new(7, 3, 7, 13),
        );
        assert_eq!(format!("{d}"), "7:3: unbound-identifier: unknown name `frobnicate`");
    }

    #[test]
    fn test_diagnostic_json_round_trip() {
        let d = Diagnostic::new(
            DiagKind::SpaceViolation,
            "view `current` mutates state of space `Counter`",
            Span::new(12, 5, 12, 22),
        )
        .with_suggestion("move the assignment into a transform");

        let json = serde_json::to_string_pretty(&d).unwrap();
        assert!(json.contains("\"space-violation\""));
        assert!(json.contains("\"start_line\": 12"));
        assert!(json.contains("\"suggestion\""));
        assert!(!json.contains("\"expected\""));

        let back: Diagnostic = serde_json::from_str(&json).unwrap();
        assert_eq!(back, d);
    }

    #[test]
    fn test_diagnostics_cap_keeps_counting() {
        let mut diags = Diagnostics::new();
        for i in 0..(MAX_DIAGNOSTICS + 9) {
            diags.push(Diagnostic::new(
                DiagKind::UnboundIdentifier,
                format!("unknown name `x{i}`"),
                Span::point(i as u32 + 1, 1),
            ));
        }
        assert_eq!(diags.len(), MAX_DIAGNOSTICS);
        assert_eq!(diags.total_errors, MAX_DIAGNOSTICS + 9);
        assert!(diags.has_errors());
    }

    #[test]
    fn test_diagnostics_empty() {
        let diags = Diagnostics::new();
        assert!(diags.is_empty());
        assert!(!diags.has_errors());
        assert_eq!(diags.count_of(DiagKind::MismatchType), 0);
    }

    #[test]
    fn test_diagnostics_preserve_emission_order() {
        let mut diags = Diagnostics::new();
        diags.push(Diagnostic::new(
            DiagKind::MismatchType,
            "first",
            Span::point(1, 1),
        ));
        diags.push(Diagnostic::new(
            DiagKind::SpaceViolation,
            "second",
            Span::point(2, 1),
        ));
        let kinds: Vec<_> = diags.iter().map(|d| d.kind).collect();
        assert_eq!(kinds, vec![DiagKind::MismatchType, DiagKind::SpaceViolation]);
    }

    #[test]
    fn test_diagnostics_json_determinism() {
        let build = || {
            let mut diags = Diagnostics::new();
            diags.push(
                Diagnostic::new(
                    DiagKind::MismatchEffect,
                    "undeclared effect `IO`",
                    Span::new(3, 1, 3, 20),
                )
                .with_expected_actual("Pure", "[IO]"),
            );
            diags.to_json()
        };
        let first = build();
        for i in 0..100 {
            assert_eq!(first, build(), "Determinism failure at iteration {i}");
        }
    }
}
