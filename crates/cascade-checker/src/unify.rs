//! Substitution and unification over types and effect rows.
//!
//! One [`Substitution`] lives per checked declaration; its bindings are
//! discarded when the declaration's results are finalized, while the
//! variable counters keep running so ids stay unique program-wide.

use std::collections::HashMap;

use cascade_types::Span;
use thiserror::Error;

use crate::effects::{EffectLabel, EffectRow};
use crate::ty::{Bound, RowVarId, Type, TypeScheme, TypeVarId};

/// Structural recursion budget. Exhaustion means the types have no
/// tractable finite resolution and surfaces as `non-terminating-type`.
pub const MAX_UNIFY_DEPTH: usize = 128;

/// Why two types refuse to unify.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum UnifyError {
    #[error("type would contain itself: `{0}`")]
    Occurs(String),
    #[error("unification exceeded the depth budget")]
    DepthExceeded,
    #[error("cannot unify `{0}` with `{1}`")]
    Mismatch(String, String),
    #[error("effect label `{0}` carries conflicting payloads")]
    RowPayload(String),
    #[error("effect row lacks label `{0}`")]
    RowMissing(String),
}

/// A bound obligation waiting for its variable to resolve.
#[derive(Debug, Clone)]
struct PendingBound {
    var: TypeVarId,
    bound: Bound,
    span: Span,
}

// ══════════════════════════════════════════════════════════════════════════════
// Substitution
// ══════════════════════════════════════════════════════════════════════════════

/// Bindings for inference variables plus the fresh-variable counters.
#[derive(Debug, Default)]
pub struct Substitution {
    types: HashMap<TypeVarId, Type>,
    rows: HashMap<RowVarId, EffectRow>,
    next_type: u32,
    next_row: u32,
    pending_bounds: Vec<PendingBound>,
}

impl Substitution {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fresh_type_var(&mut self) -> TypeVarId {
        let id = TypeVarId(self.next_type);
        self.next_type += 1;
        id
    }

    pub fn fresh_type(&mut self) -> Type {
        Type::Var(self.fresh_type_var())
    }

    pub fn fresh_row_var(&mut self) -> RowVarId {
        let id = RowVarId(self.next_row);
        self.next_row += 1;
        id
    }

    /// Drop all bindings and obligations, keeping the counters.
    pub fn clear_bindings(&mut self) {
        self.types.clear();
        self.rows.clear();
        self.pending_bounds.clear();
    }

    /// Follow variable bindings at the root only.
    pub fn resolve_shallow(&self, ty: &Type) -> Type {
        let mut cur = ty.clone();
        while let Type::Var(v) = cur {
            match self.types.get(&v) {
                Some(bound) => cur = bound.clone(),
                None => return Type::Var(v),
            }
        }
        cur
    }

    /// Deep application of the substitution.
    pub fn apply(&self, ty: &Type) -> Type {
        match self.resolve_shallow(ty) {
            Type::Apply { ctor, args } => Type::Apply {
                ctor,
                args: args.iter().map(|a| self.apply(a)).collect(),
            },
            Type::Fn(fn_ty) => Type::fun(
                fn_ty.params.iter().map(|p| self.apply(p)).collect(),
                self.apply(&fn_ty.ret),
                self.apply_row(&fn_ty.effects),
            ),
            Type::Record(fields) => Type::Record(
                fields
                    .iter()
                    .map(|f| crate::ty::Field {
                        name: f.name.clone(),
                        ty: self.apply(&f.ty),
                    })
                    .collect(),
            ),
            Type::Sum(variants) => Type::Sum(
                variants
                    .iter()
                    .map(|v| crate::ty::Variant {
                        name: v.name.clone(),
                        payload: self.apply(&v.payload),
                    })
                    .collect(),
            ),
            Type::Refine(r) => Type::refine(self.apply(&r.base), r.binder.clone(), r.predicate.clone()),
            other => other,
        }
    }

    /// Resolve a row: fold bound tails in, apply payloads.
    pub fn apply_row(&self, row: &EffectRow) -> EffectRow {
        let mut labels: Vec<EffectLabel> = row
            .labels
            .iter()
            .map(|l| EffectLabel {
                name: l.name.clone(),
                payload: l.payload.as_ref().map(|p| self.apply(p)),
            })
            .collect();
        let mut tail = row.tail;
        // Tail chains are short; the cap is purely protective.
        let mut hops = 0;
        while let Some(v) = tail {
            if hops > 64 {
                break;
            }
            hops += 1;
            match self.rows.get(&v) {
                Some(bound) => {
                    for l in &bound.labels {
                        if !labels.iter().any(|have| have.name == l.name) {
                            labels.push(EffectLabel {
                                name: l.name.clone(),
                                payload: l.payload.as_ref().map(|p| self.apply(p)),
                            });
                        }
                    }
                    tail = bound.tail;
                    if tail == Some(v) {
                        tail = None;
                    }
                }
                None => break,
            }
        }
        labels.sort_by(|a, b| a.name.cmp(&b.name));
        EffectRow { labels, tail }
    }

    fn occurs_in(&self, var: TypeVarId, ty: &Type) -> bool {
        match self.resolve_shallow(ty) {
            Type::Var(v) => v == var,
            Type::Apply { args, .. } => args.iter().any(|a| self.occurs_in(var, a)),
            Type::Fn(fn_ty) => {
                fn_ty.params.iter().any(|p| self.occurs_in(var, p))
                    || self.occurs_in(var, &fn_ty.ret)
                    || fn_ty.effects.labels.iter().any(|l| {
                        l.payload
                            .as_ref()
                            .is_some_and(|p| self.occurs_in(var, p))
                    })
            }
            Type::Record(fields) => fields.iter().any(|f| self.occurs_in(var, &f.ty)),
            Type::Sum(variants) => variants.iter().any(|v| self.occurs_in(var, &v.payload)),
            Type::Refine(r) => self.occurs_in(var, &r.base),
            _ => false,
        }
    }

    fn bind_type(&mut self, var: TypeVarId, ty: Type) -> Result<(), UnifyError> {
        if let Type::Var(v) = ty {
            if v == var {
                return Ok(());
            }
        }
        if self.occurs_in(var, &ty) {
            return Err(UnifyError::Occurs(self.apply(&ty).to_string()));
        }
        self.types.insert(var, ty);
        Ok(())
    }

    /// Bind a row variable. A self-referential tail collapses to the
    /// closed labels, which is the least solution.
    pub fn bind_row(&mut self, var: RowVarId, row: EffectRow) {
        let row = if row.tail == Some(var) {
            EffectRow::closed(row.labels)
        } else {
            row
        };
        self.rows.insert(var, row);
    }

    // ── Unification ──

    /// Make two types equal, binding variables as needed.
    pub fn unify(&mut self, a: &Type, b: &Type) -> Result<(), UnifyError> {
        self.unify_at(a, b, 0)
    }

    fn unify_at(&mut self, a: &Type, b: &Type, depth: usize) -> Result<(), UnifyError> {
        if depth > MAX_UNIFY_DEPTH {
            return Err(UnifyError::DepthExceeded);
        }
        let a = self.resolve_shallow(a);
        let b = self.resolve_shallow(b);
        match (&a, &b) {
            (Type::Var(x), Type::Var(y)) if x == y => Ok(()),
            (Type::Var(x), _) => self.bind_type(*x, b),
            (_, Type::Var(y)) => self.bind_type(*y, a),
            (Type::Error, _) | (_, Type::Error) => Ok(()),
            (Type::Unit, Type::Unit)
            | (Type::Bool, Type::Bool)
            | (Type::Int, Type::Int)
            | (Type::Real, Type::Real)
            | (Type::String, Type::String) => Ok(()),
            (
                Type::Apply { ctor: ca, args: aa },
                Type::Apply { ctor: cb, args: ab },
            ) => {
                if ca != cb || aa.len() != ab.len() {
                    return Err(UnifyError::Mismatch(a.to_string(), b.to_string()));
                }
                for (x, y) in aa.iter().zip(ab.iter()) {
                    self.unify_at(x, y, depth + 1)?;
                }
                Ok(())
            }
            (Type::Fn(fa), Type::Fn(fb)) => {
                if fa.params.len() != fb.params.len() {
                    return Err(UnifyError::Mismatch(a.to_string(), b.to_string()));
                }
                for (x, y) in fa.params.iter().zip(fb.params.iter()) {
                    self.unify_at(x, y, depth + 1)?;
                }
                self.unify_at(&fa.ret, &fb.ret, depth + 1)?;
                self.unify_rows_at(&fa.effects, &fb.effects, depth + 1)
            }
            (Type::Record(ra), Type::Record(rb)) => {
                if ra.len() != rb.len()
                    || ra.iter().zip(rb.iter()).any(|(x, y)| x.name != y.name)
                {
                    return Err(UnifyError::Mismatch(a.to_string(), b.to_string()));
                }
                for (x, y) in ra.iter().zip(rb.iter()) {
                    self.unify_at(&x.ty, &y.ty, depth + 1)?;
                }
                Ok(())
            }
            (Type::Sum(va), Type::Sum(vb)) => {
                if va.len() != vb.len()
                    || va.iter().zip(vb.iter()).any(|(x, y)| x.name != y.name)
                {
                    return Err(UnifyError::Mismatch(a.to_string(), b.to_string()));
                }
                for (x, y) in va.iter().zip(vb.iter()) {
                    self.unify_at(&x.payload, &y.payload, depth + 1)?;
                }
                Ok(())
            }
            (Type::Refine(ra), Type::Refine(rb)) => {
                if ra.predicate != rb.predicate {
                    return Err(UnifyError::Mismatch(a.to_string(), b.to_string()));
                }
                self.unify_at(&ra.base, &rb.base, depth + 1)
            }
            (Type::Space(na), Type::Space(nb)) if na == nb => Ok(()),
            _ => Err(UnifyError::Mismatch(a.to_string(), b.to_string())),
        }
    }

    /// Make two rows equal, routing unmatched labels into open tails.
    pub fn unify_rows(&mut self, a: &EffectRow, b: &EffectRow) -> Result<(), UnifyError> {
        self.unify_rows_at(a, b, 0)
    }

    fn unify_rows_at(
        &mut self,
        a: &EffectRow,
        b: &EffectRow,
        depth: usize,
    ) -> Result<(), UnifyError> {
        if depth > MAX_UNIFY_DEPTH {
            return Err(UnifyError::DepthExceeded);
        }
        let ra = self.apply_row(a);
        let rb = self.apply_row(b);

        for la in &ra.labels {
            if let Some(lb) = rb.get(&la.name) {
                match (&la.payload, &lb.payload) {
                    (None, None) => {}
                    (Some(x), Some(y)) => self.unify_at(x, y, depth + 1)?,
                    _ => return Err(UnifyError::RowPayload(la.name.clone())),
                }
            }
        }

        let only_a: Vec<EffectLabel> = ra
            .labels
            .iter()
            .filter(|l| !rb.has(&l.name))
            .cloned()
            .collect();
        let only_b: Vec<EffectLabel> = rb
            .labels
            .iter()
            .filter(|l| !ra.has(&l.name))
            .cloned()
            .collect();

        match (ra.tail, rb.tail) {
            (None, None) => {
                if let Some(l) = only_a.first().or(only_b.first()) {
                    return Err(UnifyError::RowMissing(l.name.clone()));
                }
                Ok(())
            }
            (Some(ta), None) => {
                if let Some(l) = only_a.first() {
                    return Err(UnifyError::RowMissing(l.name.clone()));
                }
                self.bind_row(ta, EffectRow::closed(only_b));
                Ok(())
            }
            (None, Some(tb)) => {
                if let Some(l) = only_b.first() {
                    return Err(UnifyError::RowMissing(l.name.clone()));
                }
                self.bind_row(tb, EffectRow::closed(only_a));
                Ok(())
            }
            (Some(ta), Some(tb)) => {
                if ta == tb {
                    if let Some(l) = only_a.first().or(only_b.first()) {
                        return Err(UnifyError::RowMissing(l.name.clone()));
                    }
                    return Ok(());
                }
                let rest = self.fresh_row_var();
                self.bind_row(ta, EffectRow::open(only_b, rest));
                self.bind_row(tb, EffectRow::open(only_a, rest));
                Ok(())
            }
        }
    }

    // ── Schemes & bounds ──

    /// Instantiate a scheme with fresh variables, registering its bound
    /// obligations for later checking.
    pub fn instantiate(&mut self, scheme: &TypeScheme, span: Span) -> Type {
        if scheme.is_mono() {
            return scheme.ty.clone();
        }
        let tmap: HashMap<TypeVarId, TypeVarId> = scheme
            .type_vars
            .iter()
            .map(|v| (*v, self.fresh_type_var()))
            .collect();
        let rmap: HashMap<RowVarId, RowVarId> = scheme
            .row_vars
            .iter()
            .map(|v| (*v, self.fresh_row_var()))
            .collect();
        for (v, bound) in &scheme.bounds {
            if let Some(fresh) = tmap.get(v) {
                self.pending_bounds.push(PendingBound {
                    var: *fresh,
                    bound: *bound,
                    span,
                });
            }
        }
        rename_type(&scheme.ty, &tmap, &rmap)
    }

    /// Drain bound obligations whose variable resolved to a concrete type
    /// that fails the bound. Unconstrained variables pass vacuously.
    pub fn bound_failures(&mut self) -> Vec<(Bound, Type, Span)> {
        let pending = std::mem::take(&mut self.pending_bounds);
        let mut failures = Vec::new();
        for p in pending {
            let resolved = self.apply(&Type::Var(p.var));
            if !p.bound.admits(&resolved) {
                failures.push((p.bound, resolved, p.span));
            }
        }
        failures
    }
}

/// Structurally rename quantified variables with their fresh copies.
fn rename_type(
    ty: &Type,
    tmap: &HashMap<TypeVarId, TypeVarId>,
    rmap: &HashMap<RowVarId, RowVarId>,
) -> Type {
    match ty {
        Type::Var(v) => match tmap.get(v) {
            Some(fresh) => Type::Var(*fresh),
            None => Type::Var(*v),
        },
        Type::Apply { ctor, args } => Type::Apply {
            ctor: ctor.clone(),
            args: args.iter().map(|a| rename_type(a, tmap, rmap)).collect(),
        },
        Type::Fn(fn_ty) => {
            let effects = EffectRow {
                labels: fn_ty
                    .effects
                    .labels
                    .iter()
                    .map(|l| EffectLabel {
                        name: l.name.clone(),
                        payload: l.payload.as_ref().map(|p| rename_type(p, tmap, rmap)),
                    })
                    .collect(),
                tail: fn_ty.effects.tail.map(|t| *rmap.get(&t).unwrap_or(&t)),
            };
            Type::fun(
                fn_ty
                    .params
                    .iter()
                    .map(|p| rename_type(p, tmap, rmap))
                    .collect(),
                rename_type(&fn_ty.ret, tmap, rmap),
                effects,
            )
        }
        Type::Record(fields) => Type::Record(
            fields
                .iter()
                .map(|f| crate::ty::Field {
                    name: f.name.clone(),
                    ty: rename_type(&f.ty, tmap, rmap),
                })
                .collect(),
        ),
        Type::Sum(variants) => Type::Sum(
            variants
                .iter()
                .map(|v| crate::ty::Variant {
                    name: v.name.clone(),
                    payload: rename_type(&v.payload, tmap, rmap),
                })
                .collect(),
        ),
        Type::Refine(r) => Type::refine(
            rename_type(&r.base, tmap, rmap),
            r.binder.clone(),
            r.predicate.clone(),
        ),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ty::Field;

    #[test]
    fn binds_and_resolves_chains() {
        let mut s = Substitution::new();
        let a = s.fresh_type_var();
        let b = s.fresh_type_var();
        s.unify(&Type::Var(a), &Type::Var(b)).unwrap();
        s.unify(&Type::Var(b), &Type::Int).unwrap();
        assert_eq!(s.apply(&Type::Var(a)), Type::Int);
    }

    #[test]
    fn occurs_check_rejects_infinite_type() {
        let mut s = Substitution::new();
        let a = s.fresh_type_var();
        let list_of_a = Type::Apply {
            ctor: "List".to_string(),
            args: vec![Type::Var(a)],
        };
        assert!(matches!(
            s.unify(&Type::Var(a), &list_of_a),
            Err(UnifyError::Occurs(_))
        ));
    }

    #[test]
    fn record_unification_requires_same_fields() {
        let mut s = Substitution::new();
        let a = Type::record(vec![Field {
            name: "x".to_string(),
            ty: Type::Int,
        }]);
        let b = Type::record(vec![Field {
            name: "y".to_string(),
            ty: Type::Int,
        }]);
        assert!(s.unify(&a, &b).is_err());
        assert!(s.unify(&a, &a.clone()).is_ok());
    }

    #[test]
    fn error_absorbs() {
        let mut s = Substitution::new();
        assert!(s.unify(&Type::Error, &Type::Int).is_ok());
        assert!(s.unify(&Type::String, &Type::Error).is_ok());
    }

    #[test]
    fn fn_unification_solves_params() {
        let mut s = Substitution::new();
        let v = s.fresh_type_var();
        let template = Type::fun(vec![Type::Var(v)], Type::Bool, EffectRow::pure());
        let concrete = Type::fun(vec![Type::Int], Type::Bool, EffectRow::pure());
        s.unify(&template, &concrete).unwrap();
        assert_eq!(s.apply(&Type::Var(v)), Type::Int);
    }

    #[test]
    fn row_unification_through_open_tails() {
        let mut s = Substitution::new();
        let ta = s.fresh_row_var();
        let a = EffectRow::open(vec![EffectLabel::new("IO")], ta);
        let b = EffectRow::closed(vec![EffectLabel::new("IO"), EffectLabel::new("Net")]);
        s.unify_rows(&a, &b).unwrap();
        let resolved = s.apply_row(&EffectRow::open(vec![], ta));
        assert!(resolved.has("Net"));
    }

    #[test]
    fn closed_rows_must_match_exactly() {
        let mut s = Substitution::new();
        let a = EffectRow::closed(vec![EffectLabel::new("IO")]);
        let b = EffectRow::pure();
        assert!(matches!(
            s.unify_rows(&a, &b),
            Err(UnifyError::RowMissing(_))
        ));
    }

    #[test]
    fn instantiation_is_fresh_each_time() {
        let mut s = Substitution::new();
        let q = s.fresh_type_var();
        let scheme = TypeScheme {
            type_vars: vec![q],
            row_vars: vec![],
            bounds: vec![],
            ty: Type::fun(vec![Type::Var(q)], Type::Var(q), EffectRow::pure()),
        };
        let one = s.instantiate(&scheme, Span::point(1, 1));
        let two = s.instantiate(&scheme, Span::point(1, 1));
        assert_ne!(one, two);
        // Constraining one instantiation leaves the other alone.
        if let Type::Fn(f) = &one {
            s.unify(&f.params[0], &Type::Int).unwrap();
        }
        if let Type::Fn(f) = &two {
            assert!(matches!(s.apply(&f.params[0]), Type::Var(_)));
        }
    }

    #[test]
    fn bound_failure_surfaces_after_resolution() {
        let mut s = Substitution::new();
        let q = s.fresh_type_var();
        let scheme = TypeScheme {
            type_vars: vec![q],
            row_vars: vec![],
            bounds: vec![(q, Bound::Ord)],
            ty: Type::fun(vec![Type::Var(q)], Type::Bool, EffectRow::pure()),
        };
        let inst = s.instantiate(&scheme, Span::point(2, 5));
        if let Type::Fn(f) = &inst {
            s.unify(&f.params[0], &Type::record(vec![])).unwrap();
        }
        let failures = s.bound_failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, Bound::Ord);
    }

    #[test]
    fn unconstrained_bound_passes() {
        let mut s = Substitution::new();
        let q = s.fresh_type_var();
        let scheme = TypeScheme {
            type_vars: vec![q],
            row_vars: vec![],
            bounds: vec![(q, Bound::Show)],
            ty: Type::Var(q),
        };
        s.instantiate(&scheme, Span::point(1, 1));
        assert!(s.bound_failures().is_empty());
    }

    #[test]
    fn depth_budget_trips_on_pathological_nesting() {
        let mut s = Substitution::new();
        let deep = (0..MAX_UNIFY_DEPTH + 10).fold(Type::Int, |t, _| {
            Type::record(vec![Field {
                name: "f".to_string(),
                ty: t,
            }])
        });
        assert_eq!(
            s.unify(&deep, &deep.clone()),
            Err(UnifyError::DepthExceeded)
        );
    }

    #[test]
    fn clear_bindings_keeps_counters() {
        let mut s = Substitution::new();
        let a = s.fresh_type_var();
        s.unify(&Type::Var(a), &Type::Int).unwrap();
        s.clear_bindings();
        assert!(matches!(s.apply(&Type::Var(a)), Type::Var(_)));
        let b = s.fresh_type_var();
        assert_ne!(a, b);
    }
}
