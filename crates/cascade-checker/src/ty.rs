//! Internal type representation for the Cascade checker.
//!
//! [`Type`] is the semantic type used during checking. It is distinct from
//! [`cascade_types::ast::TypeExpr`], which is the syntactic form produced
//! by the parser. Records and sums keep their members sorted by name, so
//! structural equality is plain `==`.

use std::collections::BTreeSet;
use std::fmt;

use cascade_types::ast;

use crate::effects::EffectRow;

// ══════════════════════════════════════════════════════════════════════════════
// Inference Variables
// ══════════════════════════════════════════════════════════════════════════════

/// An inference variable standing for an unknown type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TypeVarId(pub u32);

impl fmt::Display for TypeVarId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// An inference variable standing for an unknown effect-row tail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RowVarId(pub u32);

impl fmt::Display for RowVarId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "e{}", self.0)
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// Type
// ══════════════════════════════════════════════════════════════════════════════

/// A semantic type in Cascade.
#[derive(Debug, Clone, PartialEq)]
pub enum Type {
    // ── Primitives ──
    Unit,
    Bool,
    Int,
    Real,
    String,

    // ── Inference ──
    /// An unresolved inference variable.
    Var(TypeVarId),
    /// Checking failed somewhere below. Compatible with everything so a
    /// single failure is reported exactly once.
    Error,

    // ── Composites ──
    /// A declared constructor applied to arguments: `Option[Int]`.
    /// Only recursive constructors survive to this form; everything else
    /// expands structurally during conversion.
    Apply { ctor: String, args: Vec<Type> },
    /// `(T1, T2) -> R with E`
    Fn(Box<FnType>),
    /// `{ field: Type, ... }` — structural record, fields sorted by name.
    Record(Vec<Field>),
    /// Structural sum, variants sorted by name. Payload-less variants
    /// carry `Unit`.
    Sum(Vec<Variant>),
    /// `{ binder: Base | predicate }` — set-refinement type.
    Refine(Box<Refinement>),
    /// A reference to a declared space. Spaces are isolation units, so
    /// their identity is nominal.
    Space(String),
}

/// A field in a structural record type.
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name: String,
    pub ty: Type,
}

/// A variant in a structural sum type.
#[derive(Debug, Clone, PartialEq)]
pub struct Variant {
    pub name: String,
    pub payload: Type,
}

/// A function type: parameters, return type, and the latent effect row
/// released at each call site.
#[derive(Debug, Clone, PartialEq)]
pub struct FnType {
    pub params: Vec<Type>,
    pub ret: Type,
    pub effects: EffectRow,
}

/// A set-refinement: the subset of `base` whose values satisfy `predicate`
/// when bound to `binder`.
#[derive(Debug, Clone, PartialEq)]
pub struct Refinement {
    pub base: Type,
    pub binder: String,
    pub predicate: Predicate,
}

impl Type {
    /// Build a record type; fields are sorted so equality is structural.
    pub fn record(mut fields: Vec<Field>) -> Type {
        fields.sort_by(|a, b| a.name.cmp(&b.name));
        Type::Record(fields)
    }

    /// Build a sum type; variants are sorted so equality is structural.
    pub fn sum(mut variants: Vec<Variant>) -> Type {
        variants.sort_by(|a, b| a.name.cmp(&b.name));
        Type::Sum(variants)
    }

    /// Build a function type.
    pub fn fun(params: Vec<Type>, ret: Type, effects: EffectRow) -> Type {
        Type::Fn(Box::new(FnType {
            params,
            ret,
            effects,
        }))
    }

    /// Build a refinement over `base`.
    pub fn refine(base: Type, binder: impl Into<String>, predicate: Predicate) -> Type {
        Type::Refine(Box::new(Refinement {
            base,
            binder: binder.into(),
            predicate,
        }))
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Type::Error)
    }

    /// Look up a record field by name. `None` on non-records too.
    pub fn record_field(&self, name: &str) -> Option<&Field> {
        match self {
            Type::Record(fields) => fields.iter().find(|f| f.name == name),
            _ => None,
        }
    }

    /// Collect free type variables, in sorted order.
    pub fn free_type_vars(&self, out: &mut BTreeSet<TypeVarId>) {
        match self {
            Type::Var(v) => {
                out.insert(*v);
            }
            Type::Apply { args, .. } => {
                for a in args {
                    a.free_type_vars(out);
                }
            }
            Type::Fn(fn_ty) => {
                for p in &fn_ty.params {
                    p.free_type_vars(out);
                }
                fn_ty.ret.free_type_vars(out);
                for label in &fn_ty.effects.labels {
                    if let Some(payload) = &label.payload {
                        payload.free_type_vars(out);
                    }
                }
            }
            Type::Record(fields) => {
                for f in fields {
                    f.ty.free_type_vars(out);
                }
            }
            Type::Sum(variants) => {
                for v in variants {
                    v.payload.free_type_vars(out);
                }
            }
            Type::Refine(r) => r.base.free_type_vars(out),
            _ => {}
        }
    }

    /// Collect free effect-row variables, in sorted order.
    pub fn free_row_vars(&self, out: &mut BTreeSet<RowVarId>) {
        match self {
            Type::Apply { args, .. } => {
                for a in args {
                    a.free_row_vars(out);
                }
            }
            Type::Fn(fn_ty) => {
                for p in &fn_ty.params {
                    p.free_row_vars(out);
                }
                fn_ty.ret.free_row_vars(out);
                if let Some(tail) = fn_ty.effects.tail {
                    out.insert(tail);
                }
                for label in &fn_ty.effects.labels {
                    if let Some(payload) = &label.payload {
                        payload.free_row_vars(out);
                    }
                }
            }
            Type::Record(fields) => {
                for f in fields {
                    f.ty.free_row_vars(out);
                }
            }
            Type::Sum(variants) => {
                for v in variants {
                    v.payload.free_row_vars(out);
                }
            }
            Type::Refine(r) => r.base.free_row_vars(out),
            _ => {}
        }
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// Refinement Predicates
// ══════════════════════════════════════════════════════════════════════════════

/// A refinement predicate, normalized from the source expression.
///
/// Comparisons of the binder against integer literals and conjunctions of
/// those form the decidable fragment; everything else is kept opaque and
/// can only be discharged by syntactic equality.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// `binder <op> constant`
    Cmp(CmpOp, i64),
    /// Conjunction of two predicates.
    And(Box<Predicate>, Box<Predicate>),
    /// Outside the decidable fragment; the rendering is kept for messages.
    Opaque(String),
}

/// Comparison operators usable in refinement predicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl CmpOp {
    pub fn as_str(self) -> &'static str {
        match self {
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
            CmpOp::Eq => "==",
            CmpOp::Ne => "!=",
        }
    }
}

impl Predicate {
    /// Normalize a source predicate over `binder`.
    ///
    /// Comparisons between the binder and an integer literal map into the
    /// decidable fragment; any other shape becomes [`Predicate::Opaque`].
    pub fn from_expr(expr: &ast::Expr, binder: &str) -> Predicate {
        use ast::{BinOp, ExprKind};
        if let ExprKind::Binary { left, op, right } = &expr.kind {
            if *op == BinOp::And {
                return Predicate::And(
                    Box::new(Predicate::from_expr(left, binder)),
                    Box::new(Predicate::from_expr(right, binder)),
                );
            }
            let cmp = match op {
                BinOp::Less => Some(CmpOp::Lt),
                BinOp::LessEq => Some(CmpOp::Le),
                BinOp::Greater => Some(CmpOp::Gt),
                BinOp::GreaterEq => Some(CmpOp::Ge),
                BinOp::Eq => Some(CmpOp::Eq),
                BinOp::NotEq => Some(CmpOp::Ne),
                _ => None,
            };
            if let Some(cmp) = cmp {
                match (&left.kind, &right.kind) {
                    (ExprKind::Identifier(name), ExprKind::IntLit(c)) if name == binder => {
                        return Predicate::Cmp(cmp, *c);
                    }
                    (ExprKind::IntLit(c), ExprKind::Identifier(name)) if name == binder => {
                        return Predicate::Cmp(flip(cmp), *c);
                    }
                    _ => {}
                }
            }
        }
        Predicate::Opaque(render(expr))
    }

    /// Render with the binder on the left, for messages.
    pub fn render(&self, binder: &str) -> String {
        match self {
            Predicate::Cmp(op, c) => format!("{binder} {} {c}", op.as_str()),
            Predicate::And(a, b) => {
                format!("{} and {}", a.render(binder), b.render(binder))
            }
            Predicate::Opaque(src) => src.clone(),
        }
    }
}

/// Mirror a comparison so the binder sits on the left.
fn flip(op: CmpOp) -> CmpOp {
    match op {
        CmpOp::Lt => CmpOp::Gt,
        CmpOp::Le => CmpOp::Ge,
        CmpOp::Gt => CmpOp::Lt,
        CmpOp::Ge => CmpOp::Le,
        CmpOp::Eq => CmpOp::Eq,
        CmpOp::Ne => CmpOp::Ne,
    }
}

/// Best-effort source rendering of a predicate expression.
fn render(expr: &ast::Expr) -> String {
    use ast::ExprKind;
    match &expr.kind {
        ExprKind::UnitLit => "()".to_string(),
        ExprKind::BoolLit(b) => b.to_string(),
        ExprKind::IntLit(n) => n.to_string(),
        ExprKind::RealLit(r) => r.to_string(),
        ExprKind::StringLit(s) => format!("{s:?}"),
        ExprKind::Identifier(name) => name.clone(),
        ExprKind::Binary { left, op, right } => {
            format!("{} {} {}", render(left), op.as_str(), render(right))
        }
        ExprKind::Unary { op, operand } => match op {
            ast::UnaryOp::Neg => format!("-{}", render(operand)),
            ast::UnaryOp::Not => format!("not {}", render(operand)),
        },
        ExprKind::Paren(inner) => format!("({})", render(inner)),
        ExprKind::FieldAccess { object, field } => {
            format!("{}.{}", render(object), field.name)
        }
        ExprKind::Call { name, .. } => format!("{}(..)", name.name),
        _ => "..".to_string(),
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// Type Schemes & Bounds
// ══════════════════════════════════════════════════════════════════════════════

/// A quantified type: `[T: Ord, e] (T, T) -> Bool with [| e]`.
///
/// Instantiated fresh at every use site.
#[derive(Debug, Clone, PartialEq)]
pub struct TypeScheme {
    pub type_vars: Vec<TypeVarId>,
    pub row_vars: Vec<RowVarId>,
    /// Constraint bounds on quantified type variables.
    pub bounds: Vec<(TypeVarId, Bound)>,
    pub ty: Type,
}

impl TypeScheme {
    /// A monomorphic scheme.
    pub fn mono(ty: Type) -> Self {
        Self {
            type_vars: Vec::new(),
            row_vars: Vec::new(),
            bounds: Vec::new(),
            ty,
        }
    }

    pub fn is_mono(&self) -> bool {
        self.type_vars.is_empty() && self.row_vars.is_empty()
    }
}

/// The built-in constraint bounds usable on generic parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bound {
    Ord,
    Eq,
    Show,
}

impl Bound {
    pub fn from_name(name: &str) -> Option<Bound> {
        match name {
            "Ord" => Some(Bound::Ord),
            "Eq" => Some(Bound::Eq),
            "Show" => Some(Bound::Show),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Bound::Ord => "Ord",
            Bound::Eq => "Eq",
            Bound::Show => "Show",
        }
    }

    /// Whether a concrete type satisfies this bound.
    ///
    /// Callers resolve the type first; `Var` here means the use never
    /// constrained it, which counts as satisfied.
    pub fn admits(self, ty: &Type) -> bool {
        match ty {
            Type::Error | Type::Var(_) => true,
            Type::Unit | Type::Bool | Type::Int | Type::Real | Type::String => true,
            Type::Refine(r) => self.admits(&r.base),
            Type::Record(fields) => match self {
                // Records have no ordering.
                Bound::Ord => false,
                _ => fields.iter().all(|f| self.admits(&f.ty)),
            },
            Type::Sum(variants) => match self {
                Bound::Ord => false,
                _ => variants.iter().all(|v| self.admits(&v.payload)),
            },
            Type::Apply { args, .. } => match self {
                Bound::Ord => false,
                _ => args.iter().all(|a| self.admits(a)),
            },
            Type::Fn(_) | Type::Space(_) => false,
        }
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// Display
// ══════════════════════════════════════════════════════════════════════════════

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Unit => write!(f, "Unit"),
            Type::Bool => write!(f, "Bool"),
            Type::Int => write!(f, "Int"),
            Type::Real => write!(f, "Real"),
            Type::String => write!(f, "String"),
            Type::Var(v) => write!(f, "{v}"),
            Type::Error => write!(f, "<error>"),
            Type::Apply { ctor, args } => {
                if args.is_empty() {
                    return write!(f, "{ctor}");
                }
                write!(f, "{ctor}[")?;
                for (i, a) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{a}")?;
                }
                write!(f, "]")
            }
            Type::Fn(fn_ty) => {
                write!(f, "(")?;
                for (i, p) in fn_ty.params.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{p}")?;
                }
                write!(f, ") -> {}", fn_ty.ret)?;
                if !fn_ty.effects.is_pure() {
                    write!(f, " with {}", fn_ty.effects)?;
                }
                Ok(())
            }
            Type::Record(fields) => {
                if fields.is_empty() {
                    return write!(f, "{{}}");
                }
                write!(f, "{{ ")?;
                for (i, field) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", field.name, field.ty)?;
                }
                write!(f, " }}")
            }
            Type::Sum(variants) => {
                for (i, v) in variants.iter().enumerate() {
                    if i > 0 {
                        write!(f, " | ")?;
                    }
                    if v.payload == Type::Unit {
                        write!(f, "{}", v.name)?;
                    } else {
                        write!(f, "{}({})", v.name, v.payload)?;
                    }
                }
                Ok(())
            }
            Type::Refine(r) => {
                write!(
                    f,
                    "{{ {}: {} | {} }}",
                    r.binder,
                    r.base,
                    r.predicate.render(&r.binder)
                )
            }
            Type::Space(name) => write!(f, "space {name}"),
        }
    }
}

impl fmt::Display for TypeScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.is_mono() {
            write!(f, "[")?;
            let mut first = true;
            for v in &self.type_vars {
                if !first {
                    write!(f, ", ")?;
                }
                first = false;
                write!(f, "{v}")?;
                for (bv, b) in &self.bounds {
                    if bv == v {
                        write!(f, ": {}", b.as_str())?;
                    }
                }
            }
            for r in &self.row_vars {
                if !first {
                    write!(f, ", ")?;
                }
                first = false;
                write!(f, "{r}")?;
            }
            write!(f, "] ")?;
        }
        write!(f, "{}", self.ty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cascade_types::Span;

    fn field(name: &str, ty: Type) -> Field {
        Field {
            name: name.to_string(),
            ty,
        }
    }

    #[test]
    fn record_fields_are_canonically_sorted() {
        let a = Type::record(vec![field("b", Type::Int), field("a", Type::String)]);
        let b = Type::record(vec![field("a", Type::String), field("b", Type::Int)]);
        assert_eq!(a, b);
    }

    #[test]
    fn sum_variants_are_canonically_sorted() {
        let a = Type::sum(vec![
            Variant {
                name: "Some".to_string(),
                payload: Type::Int,
            },
            Variant {
                name: "None".to_string(),
                payload: Type::Unit,
            },
        ]);
        let b = Type::sum(vec![
            Variant {
                name: "None".to_string(),
                payload: Type::Unit,
            },
            Variant {
                name: "Some".to_string(),
                payload: Type::Int,
            },
        ]);
        assert_eq!(a, b);
    }

    #[test]
    fn display_record() {
        let t = Type::record(vec![field("name", Type::String), field("age", Type::Int)]);
        assert_eq!(t.to_string(), "{ age: Int, name: String }");
    }

    #[test]
    fn display_fn_pure_omits_effects() {
        let t = Type::fun(vec![Type::Int, Type::Int], Type::Int, EffectRow::pure());
        assert_eq!(t.to_string(), "(Int, Int) -> Int");
    }

    #[test]
    fn display_refinement() {
        let t = Type::refine(Type::Int, "x", Predicate::Cmp(CmpOp::Gt, 0));
        assert_eq!(t.to_string(), "{ x: Int | x > 0 }");
    }

    #[test]
    fn display_sum_with_unit_payload() {
        let t = Type::sum(vec![
            Variant {
                name: "Circle".to_string(),
                payload: Type::Real,
            },
            Variant {
                name: "Point".to_string(),
                payload: Type::Unit,
            },
        ]);
        assert_eq!(t.to_string(), "Circle(Real) | Point");
    }

    #[test]
    fn predicate_normalizes_binder_comparison() {
        let sp = Span::point(1, 1);
        let expr = ast::Expr::new(
            ast::ExprKind::Binary {
                left: Box::new(ast::Expr::new(
                    ast::ExprKind::Identifier("x".to_string()),
                    sp,
                )),
                op: ast::BinOp::Greater,
                right: Box::new(ast::Expr::new(ast::ExprKind::IntLit(0), sp)),
            },
            sp,
        );
        assert_eq!(Predicate::from_expr(&expr, "x"), Predicate::Cmp(CmpOp::Gt, 0));
    }

    #[test]
    fn predicate_flips_literal_on_left() {
        let sp = Span::point(1, 1);
        let expr = ast::Expr::new(
            ast::ExprKind::Binary {
                left: Box::new(ast::Expr::new(ast::ExprKind::IntLit(10), sp)),
                op: ast::BinOp::GreaterEq,
                right: Box::new(ast::Expr::new(
                    ast::ExprKind::Identifier("n".to_string()),
                    sp,
                )),
            },
            sp,
        );
        // `10 >= n` reads as `n <= 10`.
        assert_eq!(Predicate::from_expr(&expr, "n"), Predicate::Cmp(CmpOp::Le, 10));
    }

    #[test]
    fn predicate_outside_fragment_is_opaque() {
        let sp = Span::point(1, 1);
        let expr = ast::Expr::new(
            ast::ExprKind::Binary {
                left: Box::new(ast::Expr::new(
                    ast::ExprKind::Identifier("x".to_string()),
                    sp,
                )),
                op: ast::BinOp::Greater,
                right: Box::new(ast::Expr::new(
                    ast::ExprKind::Identifier("y".to_string()),
                    sp,
                )),
            },
            sp,
        );
        assert!(matches!(
            Predicate::from_expr(&expr, "x"),
            Predicate::Opaque(_)
        ));
    }

    #[test]
    fn bound_admits() {
        assert!(Bound::Ord.admits(&Type::Int));
        assert!(Bound::Ord.admits(&Type::String));
        assert!(!Bound::Ord.admits(&Type::record(vec![])));
        assert!(Bound::Eq.admits(&Type::record(vec![field("a", Type::Int)])));
        assert!(!Bound::Eq.admits(&Type::fun(vec![], Type::Unit, EffectRow::pure())));
        assert!(!Bound::Show.admits(&Type::Space("Counter".to_string())));
    }

    #[test]
    fn free_vars_collected_in_order() {
        let t = Type::fun(
            vec![Type::Var(TypeVarId(3)), Type::Var(TypeVarId(1))],
            Type::Var(TypeVarId(3)),
            EffectRow::pure(),
        );
        let mut vars = BTreeSet::new();
        t.free_type_vars(&mut vars);
        assert_eq!(vars.into_iter().collect::<Vec<_>>(), vec![TypeVarId(1), TypeVarId(3)]);
    }
}
