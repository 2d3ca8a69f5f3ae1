//! The subtype judgment over semantic types.
//!
//! Verdicts are three-way: refinement predicates outside the decidable
//! fragment produce [`SubtypeOutcome::Unverifiable`] so the caller can
//! report `predicate-unverifiable` instead of silently deciding.

use crate::effects::{self, Subsumption};
use crate::ty::{CmpOp, Field, Predicate, Type, Variant};
use crate::unify::Substitution;

/// The verdict of a subtype check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubtypeOutcome {
    Holds,
    Fails,
    /// The relation hinges on a predicate the checker cannot decide.
    Unverifiable,
}

impl SubtypeOutcome {
    pub fn holds(self) -> bool {
        matches!(self, SubtypeOutcome::Holds)
    }

    /// Combine component verdicts: any failure fails, otherwise any
    /// undecided component leaves the whole undecided.
    fn and(self, other: SubtypeOutcome) -> SubtypeOutcome {
        use SubtypeOutcome::*;
        match (self, other) {
            (Fails, _) | (_, Fails) => Fails,
            (Unverifiable, _) | (_, Unverifiable) => Unverifiable,
            _ => Holds,
        }
    }
}

/// Is `s` a subtype of `t`?
///
/// Primitives are reflexive only — there is no numeric widening. Records
/// use width and depth subtyping, sums are covariant in their variant
/// set, functions are contravariant in parameters and covariant in
/// return and effects. `Error` is compatible in both directions so one
/// failure is reported once. Unresolved variables collapse to equality
/// via unification.
pub fn check(s: &Type, t: &Type, subst: &mut Substitution) -> SubtypeOutcome {
    let s = subst.resolve_shallow(s);
    let t = subst.resolve_shallow(t);
    if s == t {
        return SubtypeOutcome::Holds;
    }
    match (&s, &t) {
        (Type::Error, _) | (_, Type::Error) => SubtypeOutcome::Holds,
        (Type::Var(_), _) | (_, Type::Var(_)) => match subst.unify(&s, &t) {
            Ok(()) => SubtypeOutcome::Holds,
            Err(_) => SubtypeOutcome::Fails,
        },
        (Type::Refine(a), Type::Refine(b)) => check(&a.base, &b.base, subst)
            .and(implies(&a.predicate, &b.predicate)),
        // Refining only narrows, so the subset sits inside anything its
        // base sits inside.
        (Type::Refine(a), _) => check(&a.base, &t, subst),
        // Base-to-refined needs the predicate to hold for every value of
        // `s`; without value information that is undecidable.
        (_, Type::Refine(b)) => match check(&s, &b.base, subst) {
            SubtypeOutcome::Fails => SubtypeOutcome::Fails,
            _ => SubtypeOutcome::Unverifiable,
        },
        (Type::Record(sf), Type::Record(tf)) => {
            let mut out = SubtypeOutcome::Holds;
            for want in tf {
                match sf.iter().find(|have| have.name == want.name) {
                    Some(have) => out = out.and(check(&have.ty, &want.ty, subst)),
                    None => return SubtypeOutcome::Fails,
                }
                if out == SubtypeOutcome::Fails {
                    return out;
                }
            }
            out
        }
        (Type::Sum(sv), Type::Sum(tv)) => {
            let mut out = SubtypeOutcome::Holds;
            for have in sv {
                match tv.iter().find(|want| want.name == have.name) {
                    Some(want) => out = out.and(check(&have.payload, &want.payload, subst)),
                    None => return SubtypeOutcome::Fails,
                }
                if out == SubtypeOutcome::Fails {
                    return out;
                }
            }
            out
        }
        (Type::Fn(a), Type::Fn(b)) => {
            if a.params.len() != b.params.len() {
                return SubtypeOutcome::Fails;
            }
            let mut out = SubtypeOutcome::Holds;
            for (ap, bp) in a.params.iter().zip(b.params.iter()) {
                out = out.and(check(bp, ap, subst));
                if out == SubtypeOutcome::Fails {
                    return out;
                }
            }
            out = out.and(check(&a.ret, &b.ret, subst));
            if out == SubtypeOutcome::Fails {
                return out;
            }
            match effects::is_subsumed(&a.effects, &b.effects, subst, true) {
                Subsumption::Holds => out,
                _ => SubtypeOutcome::Fails,
            }
        }
        (Type::Apply { ctor: ca, args: aa }, Type::Apply { ctor: cb, args: ab }) => {
            if ca != cb || aa.len() != ab.len() {
                return SubtypeOutcome::Fails;
            }
            let mut out = SubtypeOutcome::Holds;
            for (x, y) in aa.iter().zip(ab.iter()) {
                out = out.and(check(x, y, subst));
                if out == SubtypeOutcome::Fails {
                    return out;
                }
            }
            out
        }
        _ => SubtypeOutcome::Fails,
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// Refinement Reasoning
// ══════════════════════════════════════════════════════════════════════════════

/// Does the predicate accept this known integer?
///
/// `None` when the predicate falls outside the decidable fragment.
pub fn predicate_accepts_int(pred: &Predicate, value: i64) -> Option<bool> {
    match pred {
        Predicate::Cmp(op, c) => Some(match op {
            CmpOp::Lt => value < *c,
            CmpOp::Le => value <= *c,
            CmpOp::Gt => value > *c,
            CmpOp::Ge => value >= *c,
            CmpOp::Eq => value == *c,
            CmpOp::Ne => value != *c,
        }),
        Predicate::And(a, b) => {
            Some(predicate_accepts_int(a, value)? && predicate_accepts_int(b, value)?)
        }
        Predicate::Opaque(_) => None,
    }
}

/// Does `p` imply `q`? Decided by interval containment where both sides
/// normalize to intervals; syntactic equality always implies.
fn implies(p: &Predicate, q: &Predicate) -> SubtypeOutcome {
    if p == q {
        return SubtypeOutcome::Holds;
    }
    match (interval_of(p), interval_of(q)) {
        (Some(ip), Some(iq)) => {
            if ip.is_empty() || iq.contains(&ip) {
                SubtypeOutcome::Holds
            } else {
                SubtypeOutcome::Fails
            }
        }
        _ => SubtypeOutcome::Unverifiable,
    }
}

/// An inclusive integer interval. Widened to `i128` so the `i64`
/// endpoints can be shifted without overflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct IntRange {
    lo: i128,
    hi: i128,
}

impl IntRange {
    fn is_empty(&self) -> bool {
        self.lo > self.hi
    }

    fn contains(&self, other: &IntRange) -> bool {
        self.lo <= other.lo && other.hi <= self.hi
    }

    fn intersect(self, other: IntRange) -> IntRange {
        IntRange {
            lo: self.lo.max(other.lo),
            hi: self.hi.min(other.hi),
        }
    }
}

fn interval_of(pred: &Predicate) -> Option<IntRange> {
    const FULL: IntRange = IntRange {
        lo: i128::MIN,
        hi: i128::MAX,
    };
    match pred {
        Predicate::Cmp(op, c) => {
            let c = *c as i128;
            Some(match op {
                CmpOp::Lt => IntRange { lo: FULL.lo, hi: c - 1 },
                CmpOp::Le => IntRange { lo: FULL.lo, hi: c },
                CmpOp::Gt => IntRange { lo: c + 1, hi: FULL.hi },
                CmpOp::Ge => IntRange { lo: c, hi: FULL.hi },
                CmpOp::Eq => IntRange { lo: c, hi: c },
                // A punctured line is not an interval.
                CmpOp::Ne => return None,
            })
        }
        Predicate::And(a, b) => Some(interval_of(a)?.intersect(interval_of(b)?)),
        Predicate::Opaque(_) => None,
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// Join
// ══════════════════════════════════════════════════════════════════════════════

/// Least common supertype of two branch types, or `None` when no
/// reasonable join exists.
///
/// Records join on their field intersection, sums on their variant
/// union. Primitives do not widen, so `Int` and `Real` have no join.
pub fn join(a: &Type, b: &Type, subst: &mut Substitution) -> Option<Type> {
    let a = subst.resolve_shallow(a);
    let b = subst.resolve_shallow(b);
    if a == b {
        return Some(a);
    }
    match (&a, &b) {
        // A failed branch adopts the healthy branch's type.
        (Type::Error, _) => Some(b.clone()),
        (_, Type::Error) => Some(a.clone()),
        (Type::Var(_), _) | (_, Type::Var(_)) => {
            subst.unify(&a, &b).ok()?;
            Some(subst.apply(&a))
        }
        (Type::Record(fa), Type::Record(fb)) => {
            let mut fields = Vec::new();
            for f in fa {
                if let Some(g) = fb.iter().find(|g| g.name == f.name) {
                    fields.push(Field {
                        name: f.name.clone(),
                        ty: join(&f.ty, &g.ty, subst)?,
                    });
                }
            }
            Some(Type::record(fields))
        }
        (Type::Sum(va), Type::Sum(vb)) => {
            let mut variants: Vec<Variant> = va.clone();
            for v in vb {
                match variants.iter_mut().find(|have| have.name == v.name) {
                    Some(have) => {
                        have.payload = join(&have.payload, &v.payload, subst)?;
                    }
                    None => variants.push(v.clone()),
                }
            }
            Some(Type::sum(variants))
        }
        (Type::Fn(fa), Type::Fn(fb)) => {
            if fa.params.len() != fb.params.len() {
                return None;
            }
            for (x, y) in fa.params.iter().zip(fb.params.iter()) {
                subst.unify(x, y).ok()?;
            }
            let ret = join(&fa.ret, &fb.ret, subst)?;
            let joined = effects::union(&fa.effects, &fb.effects);
            if !joined.conflicts.is_empty() {
                return None;
            }
            let params = fa.params.iter().map(|p| subst.apply(p)).collect();
            Some(Type::fun(params, ret, joined.row))
        }
        (Type::Apply { ctor: ca, args: aa }, Type::Apply { ctor: cb, args: ab })
            if ca == cb && aa.len() == ab.len() =>
        {
            let args: Option<Vec<Type>> = aa
                .iter()
                .zip(ab.iter())
                .map(|(x, y)| join(x, y, subst))
                .collect();
            Some(Type::Apply {
                ctor: ca.clone(),
                args: args?,
            })
        }
        // Differing refinements widen to the joined base.
        (Type::Refine(ra), Type::Refine(rb)) => join(&ra.base, &rb.base, subst),
        (Type::Refine(ra), _) => join(&ra.base, &b, subst),
        (_, Type::Refine(rb)) => join(&a, &rb.base, subst),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effects::{EffectLabel, EffectRow};

    fn field(name: &str, ty: Type) -> Field {
        Field {
            name: name.to_string(),
            ty,
        }
    }

    fn variant(name: &str, payload: Type) -> Variant {
        Variant {
            name: name.to_string(),
            payload,
        }
    }

    fn person() -> Type {
        Type::record(vec![field("name", Type::String), field("age", Type::Int)])
    }

    fn named() -> Type {
        Type::record(vec![field("name", Type::String)])
    }

    fn holds(s: &Type, t: &Type) -> bool {
        check(s, t, &mut Substitution::new()).holds()
    }

    #[test]
    fn reflexivity_over_constructed_types() {
        let samples = vec![
            Type::Unit,
            Type::Bool,
            Type::Int,
            Type::Real,
            Type::String,
            person(),
            Type::sum(vec![variant("Some", Type::Int), variant("None", Type::Unit)]),
            Type::fun(
                vec![Type::Int],
                Type::Bool,
                EffectRow::closed(vec![EffectLabel::new("IO")]),
            ),
            Type::refine(Type::Int, "x", Predicate::Cmp(CmpOp::Gt, 0)),
            Type::refine(Type::Real, "x", Predicate::Opaque("x > y".to_string())),
            Type::Space("Counter".to_string()),
            Type::Apply {
                ctor: "Tree".to_string(),
                args: vec![Type::Int],
            },
        ];
        for ty in &samples {
            assert!(holds(ty, ty), "`{ty}` should be a subtype of itself");
        }
    }

    #[test]
    fn no_numeric_widening() {
        assert!(!holds(&Type::Int, &Type::Real));
        assert!(!holds(&Type::Real, &Type::Int));
    }

    #[test]
    fn record_width_subtyping() {
        assert!(holds(&person(), &named()));
        assert!(!holds(&named(), &person()));
    }

    #[test]
    fn record_depth_subtyping() {
        let deep = Type::record(vec![field("p", person())]);
        let shallow = Type::record(vec![field("p", named())]);
        assert!(holds(&deep, &shallow));
        assert!(!holds(&shallow, &deep));
    }

    #[test]
    fn record_transitivity() {
        let a = Type::record(vec![
            field("name", Type::String),
            field("age", Type::Int),
            field("email", Type::String),
        ]);
        let b = person();
        let c = named();
        assert!(holds(&a, &b));
        assert!(holds(&b, &c));
        assert!(holds(&a, &c));
    }

    #[test]
    fn sum_variant_subset() {
        let small = Type::sum(vec![variant("Circle", Type::Real)]);
        let big = Type::sum(vec![
            variant("Circle", Type::Real),
            variant("Square", Type::Real),
        ]);
        assert!(holds(&small, &big));
        assert!(!holds(&big, &small));
    }

    #[test]
    fn sum_partial_overlap_is_unrelated() {
        let left = Type::sum(vec![variant("A", Type::Unit), variant("B", Type::Unit)]);
        let right = Type::sum(vec![variant("B", Type::Unit), variant("C", Type::Unit)]);
        assert!(!holds(&left, &right));
        assert!(!holds(&right, &left));
    }

    #[test]
    fn fn_param_contravariance() {
        let takes_named = Type::fun(vec![named()], Type::Int, EffectRow::pure());
        let takes_person = Type::fun(vec![person()], Type::Int, EffectRow::pure());
        assert!(holds(&takes_named, &takes_person));
        assert!(!holds(&takes_person, &takes_named));
    }

    #[test]
    fn fn_return_covariance() {
        let returns_person = Type::fun(vec![], person(), EffectRow::pure());
        let returns_named = Type::fun(vec![], named(), EffectRow::pure());
        assert!(holds(&returns_person, &returns_named));
        assert!(!holds(&returns_named, &returns_person));
    }

    #[test]
    fn fn_effect_covariance() {
        let pure = Type::fun(vec![], Type::Unit, EffectRow::pure());
        let io = Type::fun(
            vec![],
            Type::Unit,
            EffectRow::closed(vec![EffectLabel::new("IO")]),
        );
        assert!(holds(&pure, &io));
        assert!(!holds(&io, &pure));
    }

    #[test]
    fn error_is_compatible_both_ways() {
        assert!(holds(&Type::Error, &Type::Int));
        assert!(holds(&Type::Int, &Type::Error));
    }

    #[test]
    fn refinement_interval_implication() {
        let pos = Type::refine(Type::Int, "x", Predicate::Cmp(CmpOp::Gt, 0));
        let nonneg = Type::refine(Type::Int, "x", Predicate::Cmp(CmpOp::Ge, 0));
        assert!(holds(&pos, &nonneg));
        assert!(!holds(&nonneg, &pos));
    }

    #[test]
    fn refinement_conjunction_narrows() {
        let digit = Type::refine(
            Type::Int,
            "x",
            Predicate::And(
                Box::new(Predicate::Cmp(CmpOp::Ge, 0)),
                Box::new(Predicate::Cmp(CmpOp::Le, 9)),
            ),
        );
        let nonneg = Type::refine(Type::Int, "x", Predicate::Cmp(CmpOp::Ge, 0));
        assert!(holds(&digit, &nonneg));
        assert!(!holds(&nonneg, &digit));
    }

    #[test]
    fn refinement_widens_to_base() {
        let pos = Type::refine(Type::Int, "x", Predicate::Cmp(CmpOp::Gt, 0));
        assert!(holds(&pos, &Type::Int));
    }

    #[test]
    fn base_into_refinement_is_unverifiable() {
        let pos = Type::refine(Type::Int, "x", Predicate::Cmp(CmpOp::Gt, 0));
        assert_eq!(
            check(&Type::Int, &pos, &mut Substitution::new()),
            SubtypeOutcome::Unverifiable
        );
        // Wrong base still plainly fails.
        assert_eq!(
            check(&Type::String, &pos, &mut Substitution::new()),
            SubtypeOutcome::Fails
        );
    }

    #[test]
    fn opaque_predicates_compare_syntactically() {
        let a = Type::refine(Type::Int, "x", Predicate::Opaque("f(x)".to_string()));
        let b = Type::refine(Type::Int, "x", Predicate::Opaque("g(x)".to_string()));
        assert!(holds(&a, &a.clone()));
        assert_eq!(
            check(&a, &b, &mut Substitution::new()),
            SubtypeOutcome::Unverifiable
        );
    }

    #[test]
    fn predicate_membership_for_literals() {
        let pred = Predicate::And(
            Box::new(Predicate::Cmp(CmpOp::Ge, 0)),
            Box::new(Predicate::Cmp(CmpOp::Lt, 10)),
        );
        assert_eq!(predicate_accepts_int(&pred, 5), Some(true));
        assert_eq!(predicate_accepts_int(&pred, 10), Some(false));
        assert_eq!(predicate_accepts_int(&pred, -1), Some(false));
        assert_eq!(
            predicate_accepts_int(&Predicate::Opaque("?".to_string()), 1),
            None
        );
        assert_eq!(predicate_accepts_int(&Predicate::Cmp(CmpOp::Ne, 0), 1), Some(true));
    }

    #[test]
    fn var_collapses_to_equality() {
        let mut subst = Substitution::new();
        let v = subst.fresh_type();
        assert!(check(&v, &Type::Int, &mut subst).holds());
        assert_eq!(subst.apply(&v), Type::Int);
    }

    #[test]
    fn join_records_intersect_fields() {
        let mut subst = Substitution::new();
        let joined = join(&person(), &named(), &mut subst).unwrap();
        assert_eq!(joined, named());
    }

    #[test]
    fn join_sums_union_variants() {
        let mut subst = Substitution::new();
        let a = Type::sum(vec![variant("Circle", Type::Real)]);
        let b = Type::sum(vec![variant("Square", Type::Real)]);
        let joined = join(&a, &b, &mut subst).unwrap();
        assert_eq!(
            joined,
            Type::sum(vec![
                variant("Circle", Type::Real),
                variant("Square", Type::Real),
            ])
        );
        assert!(holds(&a, &joined));
        assert!(holds(&b, &joined));
    }

    #[test]
    fn join_has_no_numeric_bridge() {
        let mut subst = Substitution::new();
        assert_eq!(join(&Type::Int, &Type::Real, &mut subst), None);
    }

    #[test]
    fn join_absorbs_error() {
        let mut subst = Substitution::new();
        assert_eq!(join(&Type::Error, &Type::Int, &mut subst), Some(Type::Int));
    }
}
