//! AST node types for the Cascade language.
//!
//! Every node carries a [`Span`] for diagnostics.
//! Large recursive types are boxed to keep enum sizes reasonable.
//! Source order is preserved everywhere — no maps in this module.

use crate::Span;

// ══════════════════════════════════════════════════════════════════════════════
// Top Level
// ══════════════════════════════════════════════════════════════════════════════

/// A complete Cascade program: an ordered list of top-level declarations.
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub decls: Vec<Decl>,
    pub span: Span,
}

/// A top-level declaration.
#[derive(Debug, Clone, PartialEq)]
pub enum Decl {
    /// `type Name = ...`
    Type(TypeDecl),
    /// `effect Name(Payload)`
    Effect(EffectDecl),
    /// `space Name { ... }`
    Space(SpaceDecl),
    /// `let name(params) -> Ret with E = body`
    Fn(FnDecl),
    /// `let name: Type = value`
    Let(LetDecl),
}

impl Decl {
    /// The span of the whole declaration.
    pub fn span(&self) -> Span {
        match self {
            Decl::Type(d) => d.span,
            Decl::Effect(d) => d.span,
            Decl::Space(d) => d.span,
            Decl::Fn(d) => d.span,
            Decl::Let(d) => d.span,
        }
    }

    /// The declared name.
    pub fn name(&self) -> &Ident {
        match self {
            Decl::Type(d) => &d.name,
            Decl::Effect(d) => &d.name,
            Decl::Space(d) => &d.name,
            Decl::Fn(d) => &d.name,
            Decl::Let(d) => &d.name,
        }
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// Identifiers
// ══════════════════════════════════════════════════════════════════════════════

/// A spanned identifier.
#[derive(Debug, Clone, PartialEq)]
pub struct Ident {
    pub name: String,
    pub span: Span,
}

impl Ident {
    pub fn new(name: impl Into<String>, span: Span) -> Self {
        Self {
            name: name.into(),
            span,
        }
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// Type Declarations
// ══════════════════════════════════════════════════════════════════════════════

/// `type Name[Params] = ...`
#[derive(Debug, Clone, PartialEq)]
pub struct TypeDecl {
    pub name: Ident,
    /// Generic parameters: `type Option[T] = ...`
    pub params: Vec<Ident>,
    pub body: TypeDeclBody,
    pub span: Span,
}

/// The body of a type declaration — either a sum type or a type alias.
#[derive(Debug, Clone, PartialEq)]
pub enum TypeDeclBody {
    /// `type Shape = Circle(Real) | Square(Real)`
    Sum(Vec<VariantDef>),
    /// `type Meters = Int`
    Alias(TypeExpr),
}

/// A sum type variant: `Circle(Real)` or `None` (no payload).
#[derive(Debug, Clone, PartialEq)]
pub struct VariantDef {
    pub name: Ident,
    pub payload: Option<TypeExpr>,
    pub span: Span,
}

// ══════════════════════════════════════════════════════════════════════════════
// Effect Declarations
// ══════════════════════════════════════════════════════════════════════════════

/// `effect Emit(String)` — declares an effect label and its payload shape.
///
/// `Mutate` and `State` are built in; every other label used in a `with`
/// row must be declared.
#[derive(Debug, Clone, PartialEq)]
pub struct EffectDecl {
    pub name: Ident,
    pub payload: Option<TypeExpr>,
    pub span: Span,
}

// ══════════════════════════════════════════════════════════════════════════════
// Space Declarations
// ══════════════════════════════════════════════════════════════════════════════

/// `space Name [kind] { state... embeds... invariants... transforms... views... }`
#[derive(Debug, Clone, PartialEq)]
pub struct SpaceDecl {
    pub name: Ident,
    pub kind: SpaceKind,
    pub state: Vec<StateField>,
    pub embeds: Vec<EmbedField>,
    pub invariants: Vec<InvariantDecl>,
    pub transforms: Vec<TransformDecl>,
    pub views: Vec<ViewDecl>,
    pub span: Span,
}

/// The concurrency kind of a space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpaceKind {
    /// Single-threaded ownership; operations never cross a space boundary.
    Isolated,
    /// Reachable from multiple call sites; transforms race unless tagged.
    Shared,
    /// Shared semantics across process boundaries.
    Distributed,
}

impl SpaceKind {
    /// Keyword rendering for messages.
    pub fn as_str(self) -> &'static str {
        match self {
            SpaceKind::Isolated => "isolated",
            SpaceKind::Shared => "shared",
            SpaceKind::Distributed => "distributed",
        }
    }
}

/// A state field: `count: Int = 0` (default optional).
#[derive(Debug, Clone, PartialEq)]
pub struct StateField {
    pub name: Ident,
    pub type_ann: TypeExpr,
    pub default: Option<Expr>,
    pub span: Span,
}

/// An embedded child space: `embed wheels: Wheel`
#[derive(Debug, Clone, PartialEq)]
pub struct EmbedField {
    pub name: Ident,
    pub space: Ident,
    pub span: Span,
}

/// `invariant name { condition }` — a pure boolean over the space's state.
#[derive(Debug, Clone, PartialEq)]
pub struct InvariantDecl {
    pub name: Ident,
    pub condition: Expr,
    pub span: Span,
}

/// `transform name(params) -> Ret with E { body }`
///
/// The checker adds the implicit `Mutate<SpaceName>` label to whatever
/// row the body infers; the written `with` row is the declared contract.
#[derive(Debug, Clone, PartialEq)]
pub struct TransformDecl {
    pub name: Ident,
    /// `concurrent transform ...` — safe to invoke from racing call sites.
    pub concurrent: bool,
    pub params: Vec<Param>,
    pub ret: Option<TypeExpr>,
    pub effects: Option<EffectRowAnn>,
    pub body: Expr,
    pub span: Span,
}

/// `view name(params) -> Ret = body` — read-only observation.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewDecl {
    pub name: Ident,
    pub params: Vec<Param>,
    pub ret: Option<TypeExpr>,
    pub effects: Option<EffectRowAnn>,
    pub body: Expr,
    pub span: Span,
}

// ══════════════════════════════════════════════════════════════════════════════
// Functions & Bindings
// ══════════════════════════════════════════════════════════════════════════════

/// `let name[T: Bound](params) -> Ret with E where pred = body`
#[derive(Debug, Clone, PartialEq)]
pub struct FnDecl {
    pub name: Ident,
    pub type_params: Vec<TypeParam>,
    pub params: Vec<Param>,
    pub ret: Option<TypeExpr>,
    /// Declared effect contract. `None` means "expose whatever is inferred".
    pub effects: Option<EffectRowAnn>,
    /// Refinement obligations over the parameters.
    pub where_clause: Option<Expr>,
    pub body: Expr,
    pub span: Span,
}

/// A generic type parameter with optional bounds: `T: Ord`
#[derive(Debug, Clone, PartialEq)]
pub struct TypeParam {
    pub name: Ident,
    pub bounds: Vec<Ident>,
    pub span: Span,
}

/// A parameter: `name: Type`
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: Ident,
    pub type_ann: TypeExpr,
    pub span: Span,
}

/// A top-level value binding: `let pi: Real = 3.14`
#[derive(Debug, Clone, PartialEq)]
pub struct LetDecl {
    pub name: Ident,
    pub type_ann: Option<TypeExpr>,
    pub value: Expr,
    pub span: Span,
}

// ══════════════════════════════════════════════════════════════════════════════
// Statements
// ══════════════════════════════════════════════════════════════════════════════

/// A statement inside a block expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    /// `let name: Type = expr` or `var name: Type = expr`
    Let(LetStmt),
    /// `target = expr` or `path.to.field = expr`
    Assign(AssignStmt),
    /// A bare expression (value discarded).
    Expr(Expr),
}

impl Stmt {
    pub fn span(&self) -> Span {
        match self {
            Stmt::Let(s) => s.span,
            Stmt::Assign(s) => s.span,
            Stmt::Expr(e) => e.span,
        }
    }
}

/// `let name = expr` / `var name = expr`
#[derive(Debug, Clone, PartialEq)]
pub struct LetStmt {
    /// `var` bindings may be reassigned; `let` bindings may not.
    pub mutable: bool,
    pub name: Ident,
    pub type_ann: Option<TypeExpr>,
    pub value: Expr,
    pub span: Span,
}

/// `target = value`
#[derive(Debug, Clone, PartialEq)]
pub struct AssignStmt {
    /// Path segments: `count` is `["count"]`, `engine.rpm` is `["engine", "rpm"]`.
    pub target: Vec<Ident>,
    pub value: Expr,
    pub span: Span,
}

// ══════════════════════════════════════════════════════════════════════════════
// Expressions
// ══════════════════════════════════════════════════════════════════════════════

/// An expression node. Uses `Box` for recursive variants.
#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    pub kind: ExprKind,
    pub span: Span,
}

impl Expr {
    pub fn new(kind: ExprKind, span: Span) -> Self {
        Self { kind, span }
    }
}

/// The kind of expression.
#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    // ── Literals ──
    /// `()`
    UnitLit,
    /// `true` / `false`
    BoolLit(bool),
    /// `42`
    IntLit(i64),
    /// `3.14`
    RealLit(f64),
    /// `"hello"`
    StringLit(String),
    /// `{ field: expr, ... }`
    RecordLit(Vec<FieldInit>),

    // ── Identifiers & Calls ──
    /// `my_var`, `count`
    Identifier(String),
    /// `name(args...)` — function call or sum variant construction
    Call { name: Ident, args: Vec<Expr> },
    /// `expr.method(args...)` — space transform/view invocation
    MethodCall {
        object: Box<Expr>,
        method: Ident,
        args: Vec<Expr>,
    },
    /// `expr.field`
    FieldAccess { object: Box<Expr>, field: Ident },

    // ── Operators ──
    /// `a + b`, `a == b`, `a and b`, etc.
    Binary {
        left: Box<Expr>,
        op: BinOp,
        right: Box<Expr>,
    },
    /// `-x`, `not x`
    Unary { op: UnaryOp, operand: Box<Expr> },

    // ── Control Flow ──
    /// `if cond { ... } [else { ... }]` — an expression; missing else is Unit
    If {
        condition: Box<Expr>,
        then_branch: Box<Expr>,
        else_branch: Option<Box<Expr>>,
    },
    /// `match expr { arms... }`
    Match {
        subject: Box<Expr>,
        arms: Vec<MatchArm>,
    },

    // ── Structure ──
    /// `{ stmts...; tail }` — value is the tail, or Unit without one
    Block {
        stmts: Vec<Stmt>,
        tail: Option<Box<Expr>>,
    },
    /// `with [E] expr` — checks the body's row against a declared contract
    WithEffects {
        declared: EffectRowAnn,
        body: Box<Expr>,
    },
    /// `fn(params) expr`
    Lambda {
        params: Vec<LambdaParam>,
        body: Box<Expr>,
    },
    /// `(expr)`
    Paren(Box<Expr>),
}

/// An entry in a record literal: `field: expr`
#[derive(Debug, Clone, PartialEq)]
pub struct FieldInit {
    pub name: Ident,
    pub value: Expr,
    pub span: Span,
}

/// A lambda parameter; the annotation may be inferred from context.
#[derive(Debug, Clone, PartialEq)]
pub struct LambdaParam {
    pub name: Ident,
    pub type_ann: Option<TypeExpr>,
    pub span: Span,
}

/// `Pattern -> expr`
#[derive(Debug, Clone, PartialEq)]
pub struct MatchArm {
    pub pattern: Pattern,
    pub body: Expr,
    pub span: Span,
}

/// A pattern in a match arm.
#[derive(Debug, Clone, PartialEq)]
pub enum Pattern {
    /// `VariantName` or `VariantName(binding)`
    Variant {
        name: Ident,
        binding: Option<Ident>,
    },
    /// `_` wildcard
    Wildcard(Span),
}

impl Pattern {
    pub fn span(&self) -> Span {
        match self {
            Pattern::Variant { name, binding } => match binding {
                Some(b) => name.span.merge(b.span),
                None => name.span,
            },
            Pattern::Wildcard(span) => *span,
        }
    }
}

// ── Binary Operators ──────────────────────────────────────────────────────────

/// Binary operators (in precedence order, lowest first).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    // Logical
    Or,
    And,
    // Comparison
    Eq,
    NotEq,
    Less,
    Greater,
    LessEq,
    GreaterEq,
    // Arithmetic
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

impl BinOp {
    /// Returns the operator symbol for messages.
    pub fn as_str(&self) -> &'static str {
        match self {
            BinOp::Or => "or",
            BinOp::And => "and",
            BinOp::Eq => "==",
            BinOp::NotEq => "!=",
            BinOp::Less => "<",
            BinOp::Greater => ">",
            BinOp::LessEq => "<=",
            BinOp::GreaterEq => ">=",
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Mod => "%",
        }
    }
}

/// Unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    /// `-x`
    Neg,
    /// `not x`
    Not,
}

// ══════════════════════════════════════════════════════════════════════════════
// Type & Effect Annotations
// ══════════════════════════════════════════════════════════════════════════════

/// A type annotation in Cascade source.
#[derive(Debug, Clone, PartialEq)]
pub struct TypeExpr {
    pub kind: TypeExprKind,
    pub span: Span,
}

impl TypeExpr {
    pub fn new(kind: TypeExprKind, span: Span) -> Self {
        Self { kind, span }
    }
}

/// The kind of written type.
#[derive(Debug, Clone, PartialEq)]
pub enum TypeExprKind {
    /// `Unit`
    Unit,
    /// `Bool`
    Bool,
    /// `Int`
    Int,
    /// `Real`
    Real,
    /// `String`
    String,
    /// A bare name: declared type, generic parameter, or space — resolution
    /// decides which.
    Named(String),
    /// `Name[Args...]` — applied type constructor
    Apply {
        name: Ident,
        args: Vec<TypeExpr>,
    },
    /// `{ name: String, age: Int }` — structural record type
    Record(Vec<TypeFieldAnn>),
    /// `(T1, T2) -> R with E` — function type
    Fn {
        params: Vec<TypeExpr>,
        ret: Box<TypeExpr>,
        effects: Option<EffectRowAnn>,
    },
    /// `{ x: Int | x > 0 }` — set-refinement type
    Refine {
        base: Box<TypeExpr>,
        binder: Ident,
        predicate: Box<Expr>,
    },
}

/// A field in a record type annotation: `name: Type`
#[derive(Debug, Clone, PartialEq)]
pub struct TypeFieldAnn {
    pub name: Ident,
    pub type_ann: TypeExpr,
    pub span: Span,
}

/// A written effect row: `[IO, State(Int) | e]`, or `[]` for Pure.
#[derive(Debug, Clone, PartialEq)]
pub struct EffectRowAnn {
    pub labels: Vec<EffectLabelAnn>,
    /// Open tail variable, when the row is effect-polymorphic.
    pub tail: Option<Ident>,
    pub span: Span,
}

impl EffectRowAnn {
    /// The written form of `Pure`: no labels, closed.
    pub fn pure(span: Span) -> Self {
        Self {
            labels: Vec::new(),
            tail: None,
            span,
        }
    }
}

/// One label in a written effect row: `IO` or `State(Int)`.
#[derive(Debug, Clone, PartialEq)]
pub struct EffectLabelAnn {
    pub name: Ident,
    pub payload: Option<TypeExpr>,
    pub span: Span,
}
