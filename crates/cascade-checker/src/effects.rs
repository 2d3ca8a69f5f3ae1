//! Effect rows: sorted label sets with an optional open tail.
//!
//! `Pure` is the closed empty row and the bottom of the join semilattice.
//! Open tails make rows polymorphic: `[IO | e]` means "IO plus whatever
//! `e` turns out to be".

use std::fmt;

use crate::subtype::{self, SubtypeOutcome};
use crate::ty::{RowVarId, Type};
use crate::unify::Substitution;

// ══════════════════════════════════════════════════════════════════════════════
// Rows
// ══════════════════════════════════════════════════════════════════════════════

/// One effect label: a name plus an optional type payload.
#[derive(Debug, Clone, PartialEq)]
pub struct EffectLabel {
    pub name: String,
    pub payload: Option<Type>,
}

impl EffectLabel {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            payload: None,
        }
    }

    pub fn with_payload(name: impl Into<String>, payload: Type) -> Self {
        Self {
            name: name.into(),
            payload: Some(payload),
        }
    }
}

/// A row of effects. Labels are kept sorted by name; `tail` is present
/// when the row is open.
#[derive(Debug, Clone, PartialEq)]
pub struct EffectRow {
    pub labels: Vec<EffectLabel>,
    pub tail: Option<RowVarId>,
}

impl EffectRow {
    /// The empty closed row.
    pub fn pure() -> Self {
        Self {
            labels: Vec::new(),
            tail: None,
        }
    }

    /// A closed row over the given labels.
    pub fn closed(mut labels: Vec<EffectLabel>) -> Self {
        labels.sort_by(|a, b| a.name.cmp(&b.name));
        labels.dedup();
        Self { labels, tail: None }
    }

    /// An open row with the given tail variable.
    pub fn open(labels: Vec<EffectLabel>, tail: RowVarId) -> Self {
        let mut row = Self::closed(labels);
        row.tail = Some(tail);
        row
    }

    pub fn is_pure(&self) -> bool {
        self.labels.is_empty() && self.tail.is_none()
    }

    pub fn get(&self, name: &str) -> Option<&EffectLabel> {
        self.labels.iter().find(|l| l.name == name)
    }

    pub fn has(&self, name: &str) -> bool {
        self.get(name).is_some()
    }
}

impl fmt::Display for EffectRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_pure() {
            return write!(f, "Pure");
        }
        write!(f, "[")?;
        for (i, label) in self.labels.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", label.name)?;
            if let Some(payload) = &label.payload {
                write!(f, "({payload})")?;
            }
        }
        if let Some(tail) = self.tail {
            if self.labels.is_empty() {
                write!(f, "| {tail}")?;
            } else {
                write!(f, " | {tail}")?;
            }
        }
        write!(f, "]")
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// Union
// ══════════════════════════════════════════════════════════════════════════════

/// A label carried by both sides of a union with incompatible payloads.
#[derive(Debug, Clone, PartialEq)]
pub struct LabelConflict {
    pub label: String,
    pub left: Option<Type>,
    pub right: Option<Type>,
}

/// The merged row plus any payload conflicts discovered on the way.
#[derive(Debug, Clone, PartialEq)]
pub struct UnionOutcome {
    pub row: EffectRow,
    pub conflicts: Vec<LabelConflict>,
}

/// Join two rows: the union of their labels, open if either side is.
///
/// The same label with two different payload types is a conflict; the
/// left payload is kept so checking can continue. When both sides are
/// open the left tail wins — a tail that never gets constrained resolves
/// to the empty remainder, so nothing the checker acts on is lost.
pub fn union(a: &EffectRow, b: &EffectRow) -> UnionOutcome {
    let mut labels: Vec<EffectLabel> = a.labels.clone();
    let mut conflicts = Vec::new();
    for rb in &b.labels {
        match labels.iter().find(|la| la.name == rb.name) {
            Some(la) => {
                if la.payload != rb.payload {
                    conflicts.push(LabelConflict {
                        label: rb.name.clone(),
                        left: la.payload.clone(),
                        right: rb.payload.clone(),
                    });
                }
            }
            None => labels.push(rb.clone()),
        }
    }
    labels.sort_by(|x, y| x.name.cmp(&y.name));
    let tail = a.tail.or(b.tail);
    UnionOutcome {
        row: EffectRow { labels, tail },
        conflicts,
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// Subsumption
// ══════════════════════════════════════════════════════════════════════════════

/// The verdict of a subsumption check.
#[derive(Debug, Clone, PartialEq)]
pub enum Subsumption {
    Holds,
    /// Labels of the actual row the declared row cannot absorb.
    MissingLabels(Vec<String>),
    /// Same label on both sides, incompatible payloads.
    PayloadConflict {
        label: String,
        declared: Option<Type>,
        actual: Option<Type>,
    },
}

impl Subsumption {
    pub fn holds(&self) -> bool {
        matches!(self, Subsumption::Holds)
    }
}

/// Check that every effect of `actual` is allowed by `declared`.
///
/// Tails are resolved through the substitution first. An unresolved tail
/// on the actual side is bound to the declared remainder, so an
/// effect-polymorphic call inside the body solves against the context.
///
/// `flexible_declared` controls the declared tail: at use sites (function
/// rows compared during subtyping) the tail is an instantiation variable
/// and absorbs leftover labels; in a declaration's own contract check it
/// is rigid — a body must not impose concrete effects on a row the caller
/// chooses.
pub fn is_subsumed(
    actual: &EffectRow,
    declared: &EffectRow,
    subst: &mut Substitution,
    flexible_declared: bool,
) -> Subsumption {
    let actual = subst.apply_row(actual);
    let declared = subst.apply_row(declared);

    let mut leftover: Vec<EffectLabel> = Vec::new();
    for label in &actual.labels {
        match declared.get(&label.name) {
            Some(d) => match (&label.payload, &d.payload) {
                (None, None) => {}
                (Some(a), Some(dp)) => {
                    if subtype::check(a, dp, subst) != SubtypeOutcome::Holds {
                        return Subsumption::PayloadConflict {
                            label: label.name.clone(),
                            declared: d.payload.clone(),
                            actual: label.payload.clone(),
                        };
                    }
                }
                _ => {
                    return Subsumption::PayloadConflict {
                        label: label.name.clone(),
                        declared: d.payload.clone(),
                        actual: label.payload.clone(),
                    };
                }
            },
            None => leftover.push(label.clone()),
        }
    }

    if !leftover.is_empty() {
        match declared.tail {
            Some(tail) if flexible_declared => {
                let bound = match actual.tail {
                    Some(ta) if ta != tail => EffectRow::open(leftover, ta),
                    _ => EffectRow::closed(leftover),
                };
                subst.bind_row(tail, bound);
                return Subsumption::Holds;
            }
            _ => {
                return Subsumption::MissingLabels(
                    leftover.into_iter().map(|l| l.name).collect(),
                );
            }
        }
    }

    // All labels accounted for; solve the actual tail against whatever
    // room the declared row leaves.
    if let Some(ta) = actual.tail {
        if actual.tail == declared.tail {
            return Subsumption::Holds;
        }
        let remainder: Vec<EffectLabel> = declared
            .labels
            .iter()
            .filter(|d| !actual.has(&d.name))
            .cloned()
            .collect();
        let bound = match declared.tail {
            Some(td) => EffectRow::open(remainder, td),
            None => EffectRow::closed(remainder),
        };
        subst.bind_row(ta, bound);
    }
    Subsumption::Holds
}

#[cfg(test)]
mod tests {
    use super::*;

    fn io() -> EffectLabel {
        EffectLabel::new("IO")
    }

    fn state(ty: Type) -> EffectLabel {
        EffectLabel::with_payload("State", ty)
    }

    #[test]
    fn pure_is_bottom() {
        let rows = [
            EffectRow::pure(),
            EffectRow::closed(vec![io()]),
            EffectRow::closed(vec![io(), state(Type::Int)]),
            EffectRow::open(vec![io()], RowVarId(0)),
        ];
        let mut subst = Substitution::new();
        for row in &rows {
            assert!(is_subsumed(&EffectRow::pure(), row, &mut subst, false).holds());
        }
    }

    #[test]
    fn union_is_idempotent() {
        let row = EffectRow::closed(vec![io(), state(Type::Int)]);
        let out = union(&row, &row);
        assert!(out.conflicts.is_empty());
        assert_eq!(out.row, row);
    }

    #[test]
    fn union_merges_sorted() {
        let a = EffectRow::closed(vec![EffectLabel::new("Net")]);
        let b = EffectRow::closed(vec![io()]);
        let out = union(&a, &b);
        let names: Vec<_> = out.row.labels.iter().map(|l| l.name.as_str()).collect();
        assert_eq!(names, vec!["IO", "Net"]);
    }

    #[test]
    fn union_flags_payload_conflict() {
        let a = EffectRow::closed(vec![state(Type::Int)]);
        let b = EffectRow::closed(vec![state(Type::String)]);
        let out = union(&a, &b);
        assert_eq!(out.conflicts.len(), 1);
        assert_eq!(out.conflicts[0].label, "State");
        // Left payload is kept for recovery.
        assert_eq!(out.row.get("State").unwrap().payload, Some(Type::Int));
    }

    #[test]
    fn union_subsumes_both_sides() {
        let a = EffectRow::closed(vec![io()]);
        let b = EffectRow::closed(vec![state(Type::Int)]);
        let joined = union(&a, &b).row;
        let mut subst = Substitution::new();
        assert!(is_subsumed(&a, &joined, &mut subst, false).holds());
        assert!(is_subsumed(&b, &joined, &mut subst, false).holds());
    }

    #[test]
    fn missing_label_reported_by_name() {
        let actual = EffectRow::closed(vec![io(), EffectLabel::new("Net")]);
        let declared = EffectRow::closed(vec![io()]);
        let mut subst = Substitution::new();
        match is_subsumed(&actual, &declared, &mut subst, false) {
            Subsumption::MissingLabels(names) => assert_eq!(names, vec!["Net".to_string()]),
            other => panic!("expected missing labels, got {other:?}"),
        }
    }

    #[test]
    fn rigid_declared_tail_rejects_concrete_leftovers() {
        // Body does IO, but the contract says "only whatever `e` is".
        let mut subst = Substitution::new();
        let e = subst.fresh_row_var();
        let actual = EffectRow::closed(vec![io()]);
        let declared = EffectRow::open(vec![], e);
        assert!(!is_subsumed(&actual, &declared, &mut subst, false).holds());
    }

    #[test]
    fn flexible_declared_tail_absorbs_leftovers() {
        let mut subst = Substitution::new();
        let e = subst.fresh_row_var();
        let actual = EffectRow::closed(vec![io()]);
        let declared = EffectRow::open(vec![], e);
        assert!(is_subsumed(&actual, &declared, &mut subst, true).holds());
        // The tail picked up the leftover label.
        let resolved = subst.apply_row(&EffectRow::open(vec![], e));
        assert!(resolved.has("IO"));
    }

    #[test]
    fn actual_tail_solves_against_declared_remainder() {
        let mut subst = Substitution::new();
        let t = subst.fresh_row_var();
        let actual = EffectRow::open(vec![io()], t);
        let declared = EffectRow::closed(vec![io(), EffectLabel::new("Net")]);
        assert!(is_subsumed(&actual, &declared, &mut subst, false).holds());
        let resolved = subst.apply_row(&EffectRow::open(vec![], t));
        assert!(resolved.has("Net"));
        assert!(resolved.tail.is_none());
    }

    #[test]
    fn shared_polymorphic_tail_holds() {
        let mut subst = Substitution::new();
        let e = subst.fresh_row_var();
        let actual = EffectRow::open(vec![io()], e);
        let declared = EffectRow::open(vec![io()], e);
        assert!(is_subsumed(&actual, &declared, &mut subst, false).holds());
    }

    #[test]
    fn payload_conflict_detected_in_subsumption() {
        let actual = EffectRow::closed(vec![state(Type::Int)]);
        let declared = EffectRow::closed(vec![state(Type::String)]);
        let mut subst = Substitution::new();
        assert!(matches!(
            is_subsumed(&actual, &declared, &mut subst, false),
            Subsumption::PayloadConflict { .. }
        ));
    }

    #[test]
    fn display_forms() {
        assert_eq!(EffectRow::pure().to_string(), "Pure");
        assert_eq!(
            EffectRow::closed(vec![io(), state(Type::Int)]).to_string(),
            "[IO, State(Int)]"
        );
        assert_eq!(
            EffectRow::open(vec![io()], RowVarId(2)).to_string(),
            "[IO | e2]"
        );
        assert_eq!(EffectRow::open(vec![], RowVarId(0)).to_string(), "[| e0]");
    }
}
