//! Bidirectional type and effect inference over the program graph.
//!
//! Entry point: [`check_program`].
//!
//! Diagnostic kinds emitted:
//! - `unbound-identifier`: unknown names, types, effects, and operations
//! - `mismatch-type`: subtype failures, arity errors, redeclarations,
//!   non-exhaustive matches, unresolved inference
//! - `mismatch-effect`: declared-row contract violations, payload conflicts
//! - `space-violation`: state mutated or reached outside its capability
//! - `predicate-unverifiable`: refinement obligations outside the decidable
//!   fragment
//! - `non-terminating-type`: alias cycles and expansion budget exhaustion

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use cascade_types::ast::{self, BinOp, UnaryOp};
use cascade_types::{DiagKind, Diagnostic, Diagnostics, Span};

use crate::effects::{self, EffectLabel, EffectRow, Subsumption};
use crate::env::{BindingKind, ScopeKind, TypeEnv};
use crate::space::{
    self, CallOrigin, EmbedInfo, OpInfo, SpaceDescriptor, SpaceEvent, SpaceRegistry,
    StateFieldInfo,
};
use crate::subtype::{self, SubtypeOutcome};
use crate::ty::{Bound, Field, Predicate, RowVarId, Type, TypeScheme, TypeVarId, Variant};
use crate::unify::Substitution;

/// Structural expansion budget for declared type constructors. A type
/// that has not reached a base case by this depth never will.
pub const MAX_TYPE_DEPTH: usize = 64;

// ══════════════════════════════════════════════════════════════════════════════
// Output
// ══════════════════════════════════════════════════════════════════════════════

/// The `(type, effect row)` pair inferred for one expression node.
#[derive(Debug, Clone, PartialEq)]
pub struct Annotated {
    pub ty: Type,
    pub effects: EffectRow,
}

/// The result of checking a whole program: every expression span mapped
/// to its inferred type and row, the checked top-level signatures, and
/// the ordered diagnostics.
#[derive(Debug)]
pub struct Checked {
    pub annotations: BTreeMap<Span, Annotated>,
    pub signatures: BTreeMap<String, TypeScheme>,
    pub diagnostics: Diagnostics,
}

impl Checked {
    pub fn annotation(&self, span: Span) -> Option<&Annotated> {
        self.annotations.get(&span)
    }

    pub fn signature(&self, name: &str) -> Option<&TypeScheme> {
        self.signatures.get(name)
    }

    pub fn is_ok(&self) -> bool {
        !self.diagnostics.has_errors()
    }

    /// Render the annotated program for the external reporter. Keys are
    /// ordered, so equal inputs render byte-identically.
    pub fn to_json(&self) -> String {
        let annotations: Vec<serde_json::Value> = self
            .annotations
            .iter()
            .map(|(span, ann)| {
                serde_json::json!({
                    "span": span,
                    "type": ann.ty.to_string(),
                    "effects": ann.effects.to_string(),
                })
            })
            .collect();
        let signatures: serde_json::Map<String, serde_json::Value> = self
            .signatures
            .iter()
            .map(|(name, scheme)| {
                (name.clone(), serde_json::Value::String(scheme.to_string()))
            })
            .collect();
        let doc = serde_json::json!({
            "annotations": annotations,
            "signatures": signatures,
            "diagnostics": self.diagnostics,
        });
        serde_json::to_string_pretty(&doc).unwrap_or_else(|_| String::from("{}"))
    }
}

/// Check a complete program graph.
pub fn check_program(program: &ast::Program) -> Checked {
    let mut checker = Checker::new();
    checker.run(program);
    checker.finish()
}

// ══════════════════════════════════════════════════════════════════════════════
// Registration records
// ══════════════════════════════════════════════════════════════════════════════

/// A declared type constructor.
#[derive(Debug, Clone)]
struct TypeCtor {
    params: Vec<TypeVarId>,
    body: CtorBody,
    /// Self-reachable through the mention graph. Recursive sums stay
    /// nominal; everything else expands structurally at use sites.
    recursive: bool,
    /// An alias that can only expand forever. Diagnosed once at the
    /// declaration; uses collapse silently to `Error`.
    poisoned: bool,
    span: Span,
}

#[derive(Debug, Clone)]
enum CtorBody {
    Alias(Type),
    Sum(Vec<Variant>),
}

/// Generic parameters in scope while converting one signature.
#[derive(Debug, Clone, Default)]
struct SigCtx {
    type_params: HashMap<String, TypeVarId>,
    row_params: HashMap<String, RowVarId>,
}

/// The pieces of a transform or view declaration the body check needs.
struct OpDeclRef<'a> {
    name: &'a str,
    params: &'a [ast::Param],
    ret_annotated: bool,
    effects_span: Option<Span>,
    body: &'a ast::Expr,
    is_transform: bool,
    span: Span,
}

// ══════════════════════════════════════════════════════════════════════════════
// Checker
// ══════════════════════════════════════════════════════════════════════════════

struct Checker {
    env: TypeEnv,
    subst: Substitution,
    diags: Diagnostics,
    /// Top-level value bindings: functions and lets.
    globals: HashMap<String, TypeScheme>,
    /// Saved signature contexts so bodies can resolve their own generics.
    sig_ctxs: HashMap<String, SigCtx>,
    /// Declared type constructors, plus their declaration order.
    ctors: HashMap<String, TypeCtor>,
    ctor_order: Vec<String>,
    /// Variant name → declaring sum constructors, in declaration order.
    variant_owners: HashMap<String, Vec<String>>,
    /// Declared effect labels → payload contract.
    effect_sigs: HashMap<String, Option<Type>>,
    /// Space names, known before descriptors are complete.
    space_names: HashSet<String>,
    spaces: SpaceRegistry,
    events: Vec<SpaceEvent>,
    annotations: BTreeMap<Span, Annotated>,
    signatures: BTreeMap<String, TypeScheme>,
    /// Annotation spans recorded while checking the current declaration.
    pending_spans: Vec<Span>,
    /// Generic parameters of the declaration being checked, with bounds.
    rigid_bounds: HashMap<TypeVarId, Vec<Bound>>,
    /// Signature context of the declaration being checked.
    sig_ctx: SigCtx,
    /// Declarations skipped because their name is already taken.
    dup_decls: HashSet<Span>,
}

impl Checker {
    fn new() -> Self {
        Checker {
            env: TypeEnv::new(),
            subst: Substitution::new(),
            diags: Diagnostics::new(),
            globals: HashMap::new(),
            sig_ctxs: HashMap::new(),
            ctors: HashMap::new(),
            ctor_order: Vec::new(),
            variant_owners: HashMap::new(),
            effect_sigs: HashMap::new(),
            space_names: HashSet::new(),
            spaces: SpaceRegistry::new(),
            events: Vec::new(),
            annotations: BTreeMap::new(),
            signatures: BTreeMap::new(),
            pending_spans: Vec::new(),
            rigid_bounds: HashMap::new(),
            sig_ctx: SigCtx::default(),
            dup_decls: HashSet::new(),
        }
    }

    fn run(&mut self, program: &ast::Program) {
        self.declare_names(program);
        self.register_ctor_bodies(program);
        self.analyze_ctor_cycles();
        self.register_effect_payloads(program);
        self.register_spaces(program);
        self.register_globals(program);
        for decl in &program.decls {
            match decl {
                ast::Decl::Fn(fd) => self.check_fn_decl(fd),
                ast::Decl::Let(ld) => self.check_let_decl(ld),
                ast::Decl::Space(sd) => self.check_space_decl(sd),
                ast::Decl::Type(_) | ast::Decl::Effect(_) => continue,
            }
            self.finalize_decl(decl);
        }
        space::check_all(&self.spaces, &self.events, &mut self.diags);
    }

    fn finish(self) -> Checked {
        Checked {
            annotations: self.annotations,
            signatures: self.signatures,
            diagnostics: self.diags,
        }
    }

    // ══════════════════════════════════════════════════════════════════════
    // Registration
    // ══════════════════════════════════════════════════════════════════════

    /// First pass: claim names so later passes can resolve forward
    /// references. Types and spaces share one namespace.
    fn declare_names(&mut self, program: &ast::Program) {
        let mut seen: HashMap<String, Span> = HashMap::new();
        for decl in &program.decls {
            match decl {
                ast::Decl::Type(td) => {
                    let name = td.name.name.clone();
                    if seen.contains_key(&name) {
                        self.error(
                            DiagKind::MismatchType,
                            format!("type or space '{}' is already declared", name),
                            td.name.span,
                        );
                        self.dup_decls.insert(td.span);
                        continue;
                    }
                    seen.insert(name.clone(), td.name.span);
                    let params: Vec<TypeVarId> =
                        td.params.iter().map(|_| self.subst.fresh_type_var()).collect();
                    self.ctors.insert(
                        name.clone(),
                        TypeCtor {
                            params,
                            body: CtorBody::Alias(Type::Error),
                            recursive: false,
                            poisoned: false,
                            span: td.name.span,
                        },
                    );
                    self.ctor_order.push(name);
                }
                ast::Decl::Effect(ed) => {
                    let name = ed.name.name.clone();
                    if name == "Mutate" || name == "State" {
                        self.error(
                            DiagKind::MismatchType,
                            format!("effect '{}' is built in and cannot be redeclared", name),
                            ed.name.span,
                        );
                        self.dup_decls.insert(ed.span);
                        continue;
                    }
                    if self.effect_sigs.contains_key(&name) {
                        self.error(
                            DiagKind::MismatchType,
                            format!("effect '{}' is already declared", name),
                            ed.name.span,
                        );
                        self.dup_decls.insert(ed.span);
                        continue;
                    }
                    self.effect_sigs.insert(name, None);
                }
                ast::Decl::Space(sd) => {
                    let name = sd.name.name.clone();
                    if seen.contains_key(&name) {
                        self.error(
                            DiagKind::MismatchType,
                            format!("type or space '{}' is already declared", name),
                            sd.name.span,
                        );
                        self.dup_decls.insert(sd.span);
                        continue;
                    }
                    seen.insert(name.clone(), sd.name.span);
                    self.space_names.insert(name);
                }
                ast::Decl::Fn(_) | ast::Decl::Let(_) => {}
            }
        }
    }

    /// Second pass: convert constructor bodies. References to other
    /// constructors stay nominal here; expansion happens at use sites.
    fn register_ctor_bodies(&mut self, program: &ast::Program) {
        for decl in &program.decls {
            let ast::Decl::Type(td) = decl else { continue };
            if self.dup_decls.contains(&td.span) {
                continue;
            }
            let name = td.name.name.clone();
            let param_ids = match self.ctors.get(&name) {
                Some(ctor) => ctor.params.clone(),
                None => continue,
            };
            let mut ctx = SigCtx::default();
            for (ident, id) in td.params.iter().zip(param_ids) {
                if ctx.type_params.insert(ident.name.clone(), id).is_some() {
                    self.error(
                        DiagKind::MismatchType,
                        format!("type parameter '{}' already declared", ident.name),
                        ident.span,
                    );
                }
            }
            let body = match &td.body {
                ast::TypeDeclBody::Alias(ann) => {
                    CtorBody::Alias(self.convert_type_inner(ann, &mut ctx, false))
                }
                ast::TypeDeclBody::Sum(defs) => {
                    let mut names: HashSet<String> = HashSet::new();
                    let mut variants = Vec::new();
                    for def in defs {
                        if !names.insert(def.name.name.clone()) {
                            self.error(
                                DiagKind::MismatchType,
                                format!("variant '{}' already declared", def.name.name),
                                def.name.span,
                            );
                            continue;
                        }
                        let payload = match &def.payload {
                            Some(ann) => self.convert_type_inner(ann, &mut ctx, false),
                            None => Type::Unit,
                        };
                        variants.push(Variant {
                            name: def.name.name.clone(),
                            payload,
                        });
                    }
                    for v in &variants {
                        self.variant_owners
                            .entry(v.name.clone())
                            .or_default()
                            .push(name.clone());
                    }
                    variants.sort_by(|a, b| a.name.cmp(&b.name));
                    CtorBody::Sum(variants)
                }
            };
            if let Some(ctor) = self.ctors.get_mut(&name) {
                ctor.body = body;
            }
        }
    }

    /// Mark recursive constructors and poison aliases that can only
    /// expand forever. Expansion stops at recursive sums, so an alias is
    /// infinite exactly when it reaches itself without passing one.
    fn analyze_ctor_cycles(&mut self) {
        let mut graph: HashMap<String, BTreeSet<String>> = HashMap::new();
        for name in &self.ctor_order {
            let Some(ctor) = self.ctors.get(name) else { continue };
            let mut mentions = BTreeSet::new();
            match &ctor.body {
                CtorBody::Alias(ty) => collect_ctor_mentions(ty, &mut mentions),
                CtorBody::Sum(variants) => {
                    for v in variants {
                        collect_ctor_mentions(&v.payload, &mut mentions);
                    }
                }
            }
            mentions.retain(|m| self.ctors.contains_key(m));
            graph.insert(name.clone(), mentions);
        }
        let recursive: HashSet<String> = self
            .ctor_order
            .iter()
            .filter(|name| reaches_self(name, &graph))
            .cloned()
            .collect();
        let mut pruned = graph.clone();
        for name in &recursive {
            let is_sum = matches!(
                self.ctors.get(name).map(|c| &c.body),
                Some(CtorBody::Sum(_))
            );
            if is_sum {
                if let Some(edges) = pruned.get_mut(name) {
                    edges.clear();
                }
            }
        }
        for name in self.ctor_order.clone() {
            let Some(ctor) = self.ctors.get(&name) else { continue };
            let is_alias = matches!(ctor.body, CtorBody::Alias(_));
            let span = ctor.span;
            if recursive.contains(&name) {
                if let Some(c) = self.ctors.get_mut(&name) {
                    c.recursive = true;
                }
            }
            if is_alias && reaches_self(&name, &pruned) {
                self.error(
                    DiagKind::NonTerminatingType,
                    format!(
                        "type alias '{}' expands forever; break the cycle with a sum type",
                        name
                    ),
                    span,
                );
                if let Some(c) = self.ctors.get_mut(&name) {
                    c.poisoned = true;
                    c.body = CtorBody::Alias(Type::Error);
                }
            }
        }
    }

    fn register_effect_payloads(&mut self, program: &ast::Program) {
        for decl in &program.decls {
            let ast::Decl::Effect(ed) = decl else { continue };
            if self.dup_decls.contains(&ed.span) {
                continue;
            }
            let payload = ed.payload.as_ref().map(|ann| {
                let mut ctx = SigCtx::default();
                self.convert_type_inner(ann, &mut ctx, true)
            });
            if let Some(slot) = self.effect_sigs.get_mut(&ed.name.name) {
                *slot = payload;
            }
        }
    }

    fn register_spaces(&mut self, program: &ast::Program) {
        for decl in &program.decls {
            let ast::Decl::Space(sd) = decl else { continue };
            if self.dup_decls.contains(&sd.span) {
                continue;
            }
            let name = sd.name.name.clone();
            let mut members: HashMap<String, Span> = HashMap::new();
            let mut state = Vec::new();
            for field in &sd.state {
                if members
                    .insert(field.name.name.clone(), field.name.span)
                    .is_some()
                {
                    self.error(
                        DiagKind::MismatchType,
                        format!(
                            "member '{}' already declared in space '{}'",
                            field.name.name, name
                        ),
                        field.name.span,
                    );
                    self.dup_decls.insert(field.span);
                    continue;
                }
                let mut ctx = SigCtx::default();
                let ty = self.convert_type_inner(&field.type_ann, &mut ctx, true);
                state.push(StateFieldInfo {
                    name: field.name.name.clone(),
                    ty,
                    span: field.span,
                });
            }
            let mut embeds = Vec::new();
            for embed in &sd.embeds {
                if members
                    .insert(embed.name.name.clone(), embed.name.span)
                    .is_some()
                {
                    self.error(
                        DiagKind::MismatchType,
                        format!(
                            "member '{}' already declared in space '{}'",
                            embed.name.name, name
                        ),
                        embed.name.span,
                    );
                    continue;
                }
                if !self.space_names.contains(&embed.space.name) {
                    self.error(
                        DiagKind::UnboundIdentifier,
                        format!("unknown space '{}'", embed.space.name),
                        embed.space.span,
                    );
                    continue;
                }
                embeds.push(EmbedInfo {
                    field: embed.name.name.clone(),
                    target: embed.space.name.clone(),
                    span: embed.span,
                });
            }
            let mut ops: HashMap<String, Span> = HashMap::new();
            let mut transforms = Vec::new();
            for t in &sd.transforms {
                if ops.insert(t.name.name.clone(), t.name.span).is_some() {
                    self.error(
                        DiagKind::MismatchType,
                        format!(
                            "operation '{}' already declared in space '{}'",
                            t.name.name, name
                        ),
                        t.name.span,
                    );
                    self.dup_decls.insert(t.span);
                    continue;
                }
                let (params, ret, effects) =
                    self.op_signature(&name, &t.params, t.ret.as_ref(), t.effects.as_ref(), true);
                transforms.push(OpInfo {
                    name: t.name.name.clone(),
                    params,
                    ret,
                    effects,
                    concurrent: t.concurrent,
                    span: t.span,
                });
            }
            let mut views = Vec::new();
            for v in &sd.views {
                if ops.insert(v.name.name.clone(), v.name.span).is_some() {
                    self.error(
                        DiagKind::MismatchType,
                        format!(
                            "operation '{}' already declared in space '{}'",
                            v.name.name, name
                        ),
                        v.name.span,
                    );
                    self.dup_decls.insert(v.span);
                    continue;
                }
                let (params, ret, effects) =
                    self.op_signature(&name, &v.params, v.ret.as_ref(), v.effects.as_ref(), false);
                views.push(OpInfo {
                    name: v.name.name.clone(),
                    params,
                    ret,
                    effects,
                    concurrent: false,
                    span: v.span,
                });
            }
            let desc = SpaceDescriptor {
                name: name.clone(),
                kind: sd.kind,
                span: sd.span,
                state,
                embeds,
                transforms,
                views,
            };
            self.spaces.register(desc);
        }
    }

    /// Convert a transform or view signature. Missing pieces become
    /// provisional inference variables, solved when the body is checked.
    fn op_signature(
        &mut self,
        space: &str,
        params: &[ast::Param],
        ret: Option<&ast::TypeExpr>,
        effects_ann: Option<&ast::EffectRowAnn>,
        is_transform: bool,
    ) -> (Vec<Type>, Type, EffectRow) {
        let mut ctx = SigCtx::default();
        let params: Vec<Type> = params
            .iter()
            .map(|p| self.convert_type_inner(&p.type_ann, &mut ctx, true))
            .collect();
        let ret = match ret {
            Some(ann) => self.convert_type_inner(ann, &mut ctx, true),
            None => self.subst.fresh_type(),
        };
        let effects = match effects_ann {
            Some(ann) => {
                let declared = self.convert_row(ann, &mut ctx);
                if is_transform {
                    // the implicit self-mutation is part of the contract
                    let mutate = EffectRow::closed(vec![EffectLabel::with_payload(
                        "Mutate",
                        Type::Space(space.to_string()),
                    )]);
                    self.join_rows(&declared, &mutate, ann.span)
                } else {
                    declared
                }
            }
            None => {
                let head = if is_transform {
                    vec![EffectLabel::with_payload(
                        "Mutate",
                        Type::Space(space.to_string()),
                    )]
                } else {
                    Vec::new()
                };
                EffectRow::open(head, self.subst.fresh_row_var())
            }
        };
        (params, ret, effects)
    }

    /// Final registration pass: top-level value signatures. Unannotated
    /// returns and rows get fresh placeholders, solved once the owning
    /// body is checked; callers that run earlier see them unresolved and
    /// report a cannot-infer at their own declaration.
    fn register_globals(&mut self, program: &ast::Program) {
        for decl in &program.decls {
            match decl {
                ast::Decl::Fn(fd) => {
                    let name = fd.name.name.clone();
                    if self.globals.contains_key(&name) {
                        self.error(
                            DiagKind::MismatchType,
                            format!("function or binding '{}' is already declared", name),
                            fd.name.span,
                        );
                        self.dup_decls.insert(fd.span);
                        continue;
                    }
                    let mut ctx = SigCtx::default();
                    let mut type_vars = Vec::new();
                    let mut bounds = Vec::new();
                    for tp in &fd.type_params {
                        if ctx.type_params.contains_key(&tp.name.name) {
                            self.error(
                                DiagKind::MismatchType,
                                format!("type parameter '{}' already declared", tp.name.name),
                                tp.name.span,
                            );
                            continue;
                        }
                        let id = self.subst.fresh_type_var();
                        ctx.type_params.insert(tp.name.name.clone(), id);
                        type_vars.push(id);
                        for b in &tp.bounds {
                            match Bound::from_name(&b.name) {
                                Some(bound) => bounds.push((id, bound)),
                                None => self.error(
                                    DiagKind::UnboundIdentifier,
                                    format!("unknown bound '{}'", b.name),
                                    b.span,
                                ),
                            }
                        }
                    }
                    if !fd.type_params.is_empty()
                        && (fd.ret.is_none() || fd.effects.is_none())
                    {
                        self.error(
                            DiagKind::MismatchType,
                            format!(
                                "generic function '{}' needs explicit return and effect annotations",
                                name
                            ),
                            fd.name.span,
                        );
                    }
                    let mut params: Vec<Type> = fd
                        .params
                        .iter()
                        .map(|p| self.convert_type_inner(&p.type_ann, &mut ctx, true))
                        .collect();
                    if let Some(clause) = &fd.where_clause {
                        self.lift_where_clause(clause, fd, &mut params);
                    }
                    let ret = match &fd.ret {
                        Some(ann) => self.convert_type_inner(ann, &mut ctx, true),
                        None => self.subst.fresh_type(),
                    };
                    let row = match &fd.effects {
                        Some(ann) => self.convert_row(ann, &mut ctx),
                        None => EffectRow::open(Vec::new(), self.subst.fresh_row_var()),
                    };
                    let mut row_vars: Vec<RowVarId> = ctx.row_params.values().copied().collect();
                    row_vars.sort();
                    let scheme = TypeScheme {
                        type_vars,
                        row_vars,
                        bounds,
                        ty: Type::fun(params, ret, row),
                    };
                    self.sig_ctxs.insert(name.clone(), ctx);
                    self.globals.insert(name, scheme);
                }
                ast::Decl::Let(ld) => {
                    let name = ld.name.name.clone();
                    if self.globals.contains_key(&name) {
                        self.error(
                            DiagKind::MismatchType,
                            format!("function or binding '{}' is already declared", name),
                            ld.name.span,
                        );
                        self.dup_decls.insert(ld.span);
                        continue;
                    }
                    let ty = match &ld.type_ann {
                        Some(ann) => {
                            let mut ctx = SigCtx::default();
                            self.convert_type_inner(ann, &mut ctx, true)
                        }
                        None => self.subst.fresh_type(),
                    };
                    self.globals.insert(name, TypeScheme::mono(ty));
                }
                _ => {}
            }
        }
    }

    /// A where-clause conjunct over exactly one parameter becomes a
    /// refinement of that parameter's type.
    fn lift_where_clause(
        &mut self,
        clause: &ast::Expr,
        fd: &ast::FnDecl,
        params: &mut [Type],
    ) {
        let param_names: Vec<&str> = fd.params.iter().map(|p| p.name.name.as_str()).collect();
        for conjunct in split_conjuncts(clause) {
            let mut mentioned = BTreeSet::new();
            collect_idents(conjunct, &mut mentioned);
            let hits: Vec<usize> = param_names
                .iter()
                .enumerate()
                .filter(|(_, n)| mentioned.contains(**n))
                .map(|(i, _)| i)
                .collect();
            if hits.len() != 1 {
                self.diag(
                    Diagnostic::new(
                        DiagKind::PredicateUnverifiable,
                        format!(
                            "where-clause constraint must mention exactly one parameter, found {}",
                            hits.len()
                        ),
                        conjunct.span,
                    )
                    .with_suggestion("split the constraint so each part names one parameter"),
                );
                continue;
            }
            let index = hits[0];
            let binder = param_names[index].to_string();
            let predicate = Predicate::from_expr(conjunct, &binder);
            let base = params[index].clone();
            params[index] = Type::refine(base, binder, predicate);
        }
    }

    // ══════════════════════════════════════════════════════════════════════
    // Annotation conversion
    // ══════════════════════════════════════════════════════════════════════

    fn convert_type_inner(
        &mut self,
        ann: &ast::TypeExpr,
        ctx: &mut SigCtx,
        expand: bool,
    ) -> Type {
        match &ann.kind {
            ast::TypeExprKind::Unit => Type::Unit,
            ast::TypeExprKind::Bool => Type::Bool,
            ast::TypeExprKind::Int => Type::Int,
            ast::TypeExprKind::Real => Type::Real,
            ast::TypeExprKind::String => Type::String,
            ast::TypeExprKind::Named(name) => {
                if let Some(&var) = ctx.type_params.get(name) {
                    return Type::Var(var);
                }
                if self.ctors.contains_key(name) {
                    return self.resolve_ctor(name, Vec::new(), ann.span, expand);
                }
                if self.space_names.contains(name) {
                    return Type::Space(name.clone());
                }
                self.error(
                    DiagKind::UnboundIdentifier,
                    format!("unknown type '{}'", name),
                    ann.span,
                );
                Type::Error
            }
            ast::TypeExprKind::Apply { name, args } => {
                if ctx.type_params.contains_key(&name.name) {
                    self.error(
                        DiagKind::MismatchType,
                        format!("type parameter '{}' does not take arguments", name.name),
                        name.span,
                    );
                    return Type::Error;
                }
                if !self.ctors.contains_key(&name.name) {
                    self.error(
                        DiagKind::UnboundIdentifier,
                        format!("unknown type '{}'", name.name),
                        name.span,
                    );
                    for arg in args {
                        self.convert_type_inner(arg, ctx, expand);
                    }
                    return Type::Error;
                }
                let args: Vec<Type> = args
                    .iter()
                    .map(|a| self.convert_type_inner(a, ctx, expand))
                    .collect();
                self.resolve_ctor(&name.name, args, ann.span, expand)
            }
            ast::TypeExprKind::Record(fields) => {
                let mut seen: HashSet<String> = HashSet::new();
                let mut out = Vec::new();
                for f in fields {
                    if !seen.insert(f.name.name.clone()) {
                        self.error(
                            DiagKind::MismatchType,
                            format!("field '{}' already declared in this record", f.name.name),
                            f.name.span,
                        );
                        continue;
                    }
                    out.push(Field {
                        name: f.name.name.clone(),
                        ty: self.convert_type_inner(&f.type_ann, ctx, expand),
                    });
                }
                Type::record(out)
            }
            ast::TypeExprKind::Fn {
                params,
                ret,
                effects,
            } => {
                let params = params
                    .iter()
                    .map(|p| self.convert_type_inner(p, ctx, expand))
                    .collect();
                let ret = self.convert_type_inner(ret, ctx, expand);
                let row = match effects {
                    Some(ann) => self.convert_row(ann, ctx),
                    None => EffectRow::pure(),
                };
                Type::fun(params, ret, row)
            }
            ast::TypeExprKind::Refine {
                base,
                binder,
                predicate,
            } => {
                let base = self.convert_type_inner(base, ctx, expand);
                Type::refine(
                    base,
                    binder.name.clone(),
                    Predicate::from_expr(predicate, &binder.name),
                )
            }
        }
    }

    fn resolve_ctor(&mut self, name: &str, args: Vec<Type>, span: Span, expand: bool) -> Type {
        let Some(ctor) = self.ctors.get(name) else {
            return Type::Error;
        };
        if ctor.poisoned {
            return Type::Error;
        }
        let arity = ctor.params.len();
        if args.len() != arity {
            self.error(
                DiagKind::MismatchType,
                format!(
                    "type '{}' expects {} argument{}, got {}",
                    name,
                    arity,
                    plural(arity),
                    args.len()
                ),
                span,
            );
            return Type::Error;
        }
        let nominal = Type::Apply {
            ctor: name.to_string(),
            args,
        };
        if expand {
            self.expand_type(nominal, span, MAX_TYPE_DEPTH)
        } else {
            nominal
        }
    }

    /// Structurally expand non-recursive constructor applications.
    /// Recursive sums stay nominal; `depth` only shrinks on expansion
    /// steps, so it bounds constructor unrolling, not term size.
    fn expand_type(&mut self, ty: Type, span: Span, depth: usize) -> Type {
        if depth == 0 {
            self.error(
                DiagKind::NonTerminatingType,
                "type expansion exceeded the recursion budget; the type never reaches a base case",
                span,
            );
            return Type::Error;
        }
        match ty {
            Type::Apply { ctor, args } => {
                let args: Vec<Type> = args
                    .into_iter()
                    .map(|a| self.expand_type(a, span, depth))
                    .collect();
                let Some(decl) = self.ctors.get(&ctor).cloned() else {
                    return Type::Apply { ctor, args };
                };
                if decl.poisoned {
                    return Type::Error;
                }
                if args.len() != decl.params.len() {
                    return Type::Error;
                }
                if decl.recursive && matches!(decl.body, CtorBody::Sum(_)) {
                    return Type::Apply { ctor, args };
                }
                let map: HashMap<TypeVarId, Type> =
                    decl.params.iter().copied().zip(args).collect();
                let body = match decl.body {
                    CtorBody::Alias(t) => t,
                    CtorBody::Sum(vs) => Type::Sum(vs),
                };
                self.expand_type(substitute(&body, &map), span, depth - 1)
            }
            Type::Record(fields) => Type::Record(
                fields
                    .into_iter()
                    .map(|f| Field {
                        name: f.name,
                        ty: self.expand_type(f.ty, span, depth),
                    })
                    .collect(),
            ),
            Type::Sum(variants) => Type::Sum(
                variants
                    .into_iter()
                    .map(|v| Variant {
                        name: v.name,
                        payload: self.expand_type(v.payload, span, depth),
                    })
                    .collect(),
            ),
            Type::Fn(f) => {
                let f = *f;
                let params = f
                    .params
                    .into_iter()
                    .map(|p| self.expand_type(p, span, depth))
                    .collect();
                let ret = self.expand_type(f.ret, span, depth);
                let labels = f
                    .effects
                    .labels
                    .into_iter()
                    .map(|l| EffectLabel {
                        name: l.name,
                        payload: l.payload.map(|p| self.expand_type(p, span, depth)),
                    })
                    .collect();
                Type::fun(
                    params,
                    ret,
                    EffectRow {
                        labels,
                        tail: f.effects.tail,
                    },
                )
            }
            Type::Refine(r) => {
                let r = *r;
                Type::refine(self.expand_type(r.base, span, depth), r.binder, r.predicate)
            }
            leaf => leaf,
        }
    }

    fn convert_row(&mut self, ann: &ast::EffectRowAnn, ctx: &mut SigCtx) -> EffectRow {
        let mut labels: Vec<EffectLabel> = Vec::new();
        for label in &ann.labels {
            let name = label.name.name.as_str();
            let converted = match name {
                "Mutate" => Some(self.convert_mutate_label(label, ctx)),
                "State" => match &label.payload {
                    Some(p) => {
                        let ty = self.convert_type_inner(p, ctx, true);
                        Some(EffectLabel::with_payload("State", ty))
                    }
                    None => {
                        self.error(
                            DiagKind::MismatchType,
                            "effect 'State' needs a payload type",
                            label.span,
                        );
                        Some(EffectLabel::with_payload("State", Type::Error))
                    }
                },
                _ => match self.effect_sigs.get(name).cloned() {
                    Some(contract) => match (&contract, &label.payload) {
                        (None, None) => Some(EffectLabel::new(name)),
                        (Some(want), Some(p)) => {
                            let ty = self.convert_type_inner(p, ctx, true);
                            if ty != *want && !ty.is_error() && !want.is_error() {
                                self.error(
                                    DiagKind::MismatchType,
                                    format!("effect '{}' carries '{}', not '{}'", name, want, ty),
                                    label.span,
                                );
                            }
                            Some(EffectLabel::with_payload(name, ty))
                        }
                        (None, Some(_)) => {
                            self.error(
                                DiagKind::MismatchType,
                                format!("effect '{}' does not carry a payload", name),
                                label.span,
                            );
                            Some(EffectLabel::new(name))
                        }
                        (Some(want), None) => {
                            self.error(
                                DiagKind::MismatchType,
                                format!("effect '{}' carries a payload of type '{}'", name, want),
                                label.span,
                            );
                            Some(EffectLabel::with_payload(name, Type::Error))
                        }
                    },
                    None => {
                        self.error(
                            DiagKind::UnboundIdentifier,
                            format!("unknown effect '{}'", name),
                            label.name.span,
                        );
                        None
                    }
                },
            };
            if let Some(l) = converted {
                labels.push(l);
            }
        }
        match &ann.tail {
            Some(ident) => {
                let var = match ctx.row_params.get(&ident.name) {
                    Some(&v) => v,
                    None => {
                        let v = self.subst.fresh_row_var();
                        ctx.row_params.insert(ident.name.clone(), v);
                        v
                    }
                };
                EffectRow::open(labels, var)
            }
            None => EffectRow::closed(labels),
        }
    }

    fn convert_mutate_label(
        &mut self,
        label: &ast::EffectLabelAnn,
        ctx: &mut SigCtx,
    ) -> EffectLabel {
        match &label.payload {
            Some(p) => {
                let ty = self.convert_type_inner(p, ctx, true);
                match &ty {
                    Type::Space(_) | Type::Error => EffectLabel::with_payload("Mutate", ty),
                    _ => {
                        self.error(
                            DiagKind::MismatchType,
                            format!("effect 'Mutate' takes a space, got '{}'", ty),
                            label.span,
                        );
                        EffectLabel::with_payload("Mutate", Type::Error)
                    }
                }
            }
            None => {
                self.error(
                    DiagKind::MismatchType,
                    "effect 'Mutate' needs a space payload",
                    label.span,
                );
                EffectLabel::with_payload("Mutate", Type::Error)
            }
        }
    }

    /// Convert an annotation written inside a body, resolving the
    /// enclosing declaration's generic parameters.
    fn convert_local(&mut self, ann: &ast::TypeExpr) -> Type {
        let mut ctx = std::mem::take(&mut self.sig_ctx);
        let ty = self.convert_type_inner(ann, &mut ctx, true);
        self.sig_ctx = ctx;
        ty
    }

    fn convert_row_local(&mut self, ann: &ast::EffectRowAnn) -> EffectRow {
        let mut ctx = std::mem::take(&mut self.sig_ctx);
        let row = self.convert_row(ann, &mut ctx);
        self.sig_ctx = ctx;
        row
    }

    // ══════════════════════════════════════════════════════════════════════
    // Declaration checking
    // ══════════════════════════════════════════════════════════════════════

    fn check_fn_decl(&mut self, fd: &ast::FnDecl) {
        if self.dup_decls.contains(&fd.span) {
            return;
        }
        let name = fd.name.name.clone();
        let Some(scheme) = self.globals.get(&name).cloned() else {
            return;
        };
        let Type::Fn(fn_ty) = scheme.ty.clone() else {
            return;
        };
        for var in &scheme.type_vars {
            self.rigid_bounds.entry(*var).or_default();
        }
        for (var, bound) in &scheme.bounds {
            self.rigid_bounds.entry(*var).or_default().push(*bound);
        }
        self.sig_ctx = self.sig_ctxs.get(&name).cloned().unwrap_or_default();
        self.env.push_scope(ScopeKind::Function);
        for (param, ty) in fd.params.iter().zip(fn_ty.params.iter()) {
            if !self
                .env
                .define(&param.name.name, ty.clone(), BindingKind::Param)
            {
                self.error(
                    DiagKind::MismatchType,
                    format!("parameter '{}' already declared", param.name.name),
                    param.name.span,
                );
            }
        }
        let body_row = if fd.ret.is_some() {
            self.check_expr(&fd.body, &fn_ty.ret).1
        } else {
            let (ty, row) = self.infer_expr(&fd.body, None);
            if let Err(err) = self.subst.unify(&fn_ty.ret, &ty) {
                self.error(DiagKind::MismatchType, err.to_string(), fd.body.span);
            }
            row
        };
        self.env.pop_scope();
        if let Some(ann) = &fd.effects {
            self.check_row_contract(&body_row, &fn_ty.effects, ann.span, "body");
        } else if let Some(tail) = fn_ty.effects.tail {
            // solve the provisional row with what the body actually does
            let applied = self.subst.apply_row(&body_row);
            self.subst.bind_row(tail, applied);
        }
        // the solved signature becomes visible to later declarations
        let solved = TypeScheme {
            ty: self.subst.apply(&scheme.ty),
            ..scheme
        };
        self.globals.insert(name.clone(), solved.clone());
        self.signatures.insert(name, solved);
    }

    fn check_let_decl(&mut self, ld: &ast::LetDecl) {
        if self.dup_decls.contains(&ld.span) {
            return;
        }
        let name = ld.name.name.clone();
        let Some(scheme) = self.globals.get(&name).cloned() else {
            return;
        };
        self.sig_ctx = SigCtx::default();
        let final_ty = if ld.type_ann.is_some() {
            let declared = scheme.ty.clone();
            self.check_expr(&ld.value, &declared);
            declared
        } else {
            let (ty, _row) = self.infer_expr(&ld.value, None);
            if let Err(err) = self.subst.unify(&scheme.ty, &ty) {
                self.error(DiagKind::MismatchType, err.to_string(), ld.value.span);
            }
            ty
        };
        let solved = TypeScheme::mono(self.subst.apply(&final_ty));
        self.globals.insert(name.clone(), solved.clone());
        self.signatures.insert(name, solved);
    }

    fn check_space_decl(&mut self, sd: &ast::SpaceDecl) {
        if self.dup_decls.contains(&sd.span) {
            return;
        }
        let name = sd.name.name.clone();
        let (state, embeds) = match self.spaces.get(&name) {
            Some(desc) => (desc.state.clone(), desc.embeds.clone()),
            None => return,
        };
        self.sig_ctx = SigCtx::default();

        // ── state field initializers ──
        for field in &sd.state {
            if self.dup_decls.contains(&field.span) {
                continue;
            }
            let Some(default) = &field.default else { continue };
            let field_ty = state
                .iter()
                .find(|f| f.name == field.name.name)
                .map(|f| f.ty.clone())
                .unwrap_or(Type::Error);
            self.env.push_space_scope(ScopeKind::StateInit, &name);
            let (_, row) = self.check_expr(default, &field_ty);
            self.env.pop_scope();
            let applied = self.subst.apply_row(&row);
            if !applied.labels.is_empty() {
                let list = label_list(&applied);
                self.error(
                    DiagKind::MismatchEffect,
                    format!(
                        "state initializer for '{}' must be pure; it has effect{} {}",
                        field.name.name,
                        plural(applied.labels.len()),
                        list
                    ),
                    default.span,
                );
            }
        }

        // ── invariants ──
        for inv in &sd.invariants {
            self.env.push_space_scope(ScopeKind::Invariant, &name);
            for f in &state {
                self.env.define(&f.name, f.ty.clone(), BindingKind::State);
            }
            for e in &embeds {
                self.env
                    .define(&e.field, Type::Space(e.target.clone()), BindingKind::Embed);
            }
            let (_, row) = self.check_expr(&inv.condition, &Type::Bool);
            self.env.pop_scope();
            let applied = self.subst.apply_row(&row);
            if !applied.labels.is_empty() {
                let list = label_list(&applied);
                self.error(
                    DiagKind::MismatchEffect,
                    format!(
                        "invariant '{}' must be pure; it has effect{} {}",
                        inv.name.name,
                        plural(applied.labels.len()),
                        list
                    ),
                    inv.span,
                );
            }
        }

        // ── transforms and views ──
        for t in &sd.transforms {
            if self.dup_decls.contains(&t.span) {
                continue;
            }
            self.check_op(
                &name,
                &state,
                &embeds,
                OpDeclRef {
                    name: &t.name.name,
                    params: &t.params,
                    ret_annotated: t.ret.is_some(),
                    effects_span: t.effects.as_ref().map(|e| e.span),
                    body: &t.body,
                    is_transform: true,
                    span: t.span,
                },
            );
        }
        for v in &sd.views {
            if self.dup_decls.contains(&v.span) {
                continue;
            }
            self.check_op(
                &name,
                &state,
                &embeds,
                OpDeclRef {
                    name: &v.name.name,
                    params: &v.params,
                    ret_annotated: v.ret.is_some(),
                    effects_span: v.effects.as_ref().map(|e| e.span),
                    body: &v.body,
                    is_transform: false,
                    span: v.span,
                },
            );
        }
    }

    fn check_op(
        &mut self,
        space: &str,
        state: &[StateFieldInfo],
        embeds: &[EmbedInfo],
        decl: OpDeclRef<'_>,
    ) {
        let info = {
            let Some(desc) = self.spaces.get(space) else { return };
            let found = if decl.is_transform {
                desc.transform(decl.name)
            } else {
                desc.view(decl.name)
            };
            match found {
                Some(info) => info.clone(),
                None => return,
            }
        };
        let kind = if decl.is_transform {
            ScopeKind::Transform
        } else {
            ScopeKind::View
        };
        self.env.push_space_scope(kind, space);
        for f in state {
            self.env.define(&f.name, f.ty.clone(), BindingKind::State);
        }
        for e in embeds {
            self.env
                .define(&e.field, Type::Space(e.target.clone()), BindingKind::Embed);
        }
        for (param, ty) in decl.params.iter().zip(info.params.iter()) {
            if !self
                .env
                .define(&param.name.name, ty.clone(), BindingKind::Param)
            {
                self.error(
                    DiagKind::MismatchType,
                    format!("parameter '{}' already declared", param.name.name),
                    param.name.span,
                );
            }
        }
        let body_row = if decl.ret_annotated {
            self.check_expr(decl.body, &info.ret).1
        } else {
            let (ty, row) = self.infer_expr(decl.body, None);
            if let Err(err) = self.subst.unify(&info.ret, &ty) {
                self.error(DiagKind::MismatchType, err.to_string(), decl.body.span);
            }
            row
        };
        self.env.pop_scope();
        let full_row = if decl.is_transform {
            // transforms mutate their own space whether or not the body
            // says so explicitly
            let mutate = EffectRow::closed(vec![EffectLabel::with_payload(
                "Mutate",
                Type::Space(space.to_string()),
            )]);
            self.join_rows(&body_row, &mutate, decl.span)
        } else {
            body_row
        };
        if let Some(ann_span) = decl.effects_span {
            self.check_row_contract(&full_row, &info.effects, ann_span, "body");
        } else if let Some(tail) = info.effects.tail {
            let applied = self.subst.apply_row(&full_row);
            let leftovers: Vec<EffectLabel> = applied
                .labels
                .iter()
                .filter(|l| !info.effects.labels.iter().any(|h| h.name == l.name))
                .cloned()
                .collect();
            let rest = applied.tail;
            self.subst.bind_row(
                tail,
                EffectRow {
                    labels: leftovers,
                    tail: rest,
                },
            );
        }
        // expose the checked signature to later callers and the census
        let final_ret = self.subst.apply(&info.ret);
        let exposed = if decl.effects_span.is_some() {
            info.effects.clone()
        } else {
            full_row
        };
        let final_row = close_row(self.subst.apply_row(&exposed));
        if let Some(desc) = self.spaces.get_mut(space) {
            let list = if decl.is_transform {
                &mut desc.transforms
            } else {
                &mut desc.views
            };
            if let Some(op) = list.iter_mut().find(|o| o.name == decl.name) {
                op.ret = final_ret;
                op.effects = final_row;
            }
        }
    }

    /// Per-declaration epilogue: report failed bounds, resolve this
    /// declaration's annotations, then drop its speculative bindings.
    fn finalize_decl(&mut self, decl: &ast::Decl) {
        for (bound, ty, span) in self.subst.bound_failures() {
            self.error(
                DiagKind::MismatchType,
                format!("type '{}' does not satisfy the '{}' bound", ty, bound.as_str()),
                span,
            );
        }
        let spans: Vec<Span> = self.pending_spans.drain(..).collect();
        let rigid: HashSet<TypeVarId> = self.rigid_bounds.keys().copied().collect();
        let mut dangling = false;
        for span in spans {
            if let Some(ann) = self.annotations.get(&span).cloned() {
                let ty = self.subst.apply(&ann.ty);
                let (ty, had_vars) = erase_free_vars(ty, &rigid);
                dangling |= had_vars;
                let row = close_row(self.subst.apply_row(&ann.effects));
                let (row, row_had_vars) = erase_free_row_vars(row, &rigid);
                dangling |= row_had_vars;
                self.annotations.insert(span, Annotated { ty, effects: row });
            }
        }
        if dangling {
            self.diag(
                Diagnostic::new(
                    DiagKind::MismatchType,
                    format!(
                        "cannot fully infer types in '{}'; add type annotations",
                        decl.name().name
                    ),
                    decl.name().span,
                )
                .with_suggestion("annotate the declaration's parameters or return type"),
            );
        }
        self.subst.clear_bindings();
        self.rigid_bounds.clear();
        self.sig_ctx = SigCtx::default();
    }

    // ══════════════════════════════════════════════════════════════════════
    // Expression inference
    // ══════════════════════════════════════════════════════════════════════

    /// Infer the type and row of an expression, checking it against
    /// `expected` when present. Every expression node gets an annotation.
    fn infer_expr(&mut self, expr: &ast::Expr, expected: Option<&Type>) -> (Type, EffectRow) {
        let (ty, row) = self.infer_expr_inner(expr, expected);
        let ty = match expected {
            Some(want) => match subtype::check(&ty, want, &mut self.subst) {
                SubtypeOutcome::Holds => ty,
                SubtypeOutcome::Fails => {
                    let want_s = self.subst.apply(want).to_string();
                    let got_s = self.subst.apply(&ty).to_string();
                    self.diag(
                        Diagnostic::new(
                            DiagKind::MismatchType,
                            format!("type mismatch: expected '{}', found '{}'", want_s, got_s),
                            expr.span,
                        )
                        .with_expected_actual(want_s, got_s),
                    );
                    Type::Error
                }
                SubtypeOutcome::Unverifiable => {
                    let want_s = self.subst.apply(want).to_string();
                    let got_s = self.subst.apply(&ty).to_string();
                    self.diag(
                        Diagnostic::new(
                            DiagKind::PredicateUnverifiable,
                            format!("cannot verify that '{}' satisfies '{}'", got_s, want_s),
                            expr.span,
                        )
                        .with_expected_actual(want_s, got_s)
                        .with_suggestion("narrow the value or widen the expected type"),
                    );
                    self.subst.apply(want)
                }
            },
            None => ty,
        };
        self.record_annotation(expr.span, ty.clone(), row.clone());
        (ty, row)
    }

    fn check_expr(&mut self, expr: &ast::Expr, want: &Type) -> (Type, EffectRow) {
        self.infer_expr(expr, Some(want))
    }

    fn infer_expr_inner(
        &mut self,
        expr: &ast::Expr,
        expected: Option<&Type>,
    ) -> (Type, EffectRow) {
        let span = expr.span;
        match &expr.kind {
            ast::ExprKind::UnitLit => (Type::Unit, EffectRow::pure()),
            ast::ExprKind::BoolLit(_) => (Type::Bool, EffectRow::pure()),
            ast::ExprKind::IntLit(n) => (self.int_literal_type(*n, expected, span), EffectRow::pure()),
            ast::ExprKind::RealLit(_) => (Type::Real, EffectRow::pure()),
            ast::ExprKind::StringLit(_) => (Type::String, EffectRow::pure()),
            ast::ExprKind::RecordLit(inits) => self.check_record_lit(inits, expected, span),
            ast::ExprKind::Identifier(name) => self.resolve_identifier(name, span, expected),
            ast::ExprKind::Call { name, args } => self.check_call(name, args, span, expected),
            ast::ExprKind::MethodCall {
                object,
                method,
                args,
            } => self.check_method_call(object, method, args, span),
            ast::ExprKind::FieldAccess { object, field } => self.check_field_access(object, field),
            ast::ExprKind::Binary { left, op, right } => self.check_binary(left, *op, right, span),
            ast::ExprKind::Unary { op, operand } => self.check_unary(*op, operand, span),
            ast::ExprKind::If {
                condition,
                then_branch,
                else_branch,
            } => self.check_if(condition, then_branch, else_branch.as_deref(), expected, span),
            ast::ExprKind::Match { subject, arms } => self.check_match(subject, arms, expected, span),
            ast::ExprKind::Block { stmts, tail } => {
                self.check_block(stmts, tail.as_deref(), expected, span)
            }
            ast::ExprKind::WithEffects { declared, body } => {
                self.check_with_effects(declared, body, expected)
            }
            ast::ExprKind::Lambda { params, body } => self.check_lambda(params, body, expected),
            ast::ExprKind::Paren(inner) => self.infer_expr(inner, expected),
        }
    }

    /// Integer literals default to `Int`. Under an expected `Real` they
    /// denote a real; under an expected refinement of `Int` the predicate
    /// is evaluated right here.
    fn int_literal_type(&mut self, value: i64, expected: Option<&Type>, span: Span) -> Type {
        let Some(want) = expected else {
            return Type::Int;
        };
        match self.subst.resolve_shallow(want) {
            Type::Real => Type::Real,
            Type::Refine(r) if r.base == Type::Int => {
                match subtype::predicate_accepts_int(&r.predicate, value) {
                    Some(true) => Type::Refine(r),
                    Some(false) => {
                        self.error(
                            DiagKind::MismatchType,
                            format!(
                                "value {} does not satisfy '{}'",
                                value,
                                Type::Refine(r.clone())
                            ),
                            span,
                        );
                        Type::Error
                    }
                    None => {
                        self.diag(
                            Diagnostic::new(
                                DiagKind::PredicateUnverifiable,
                                format!(
                                    "cannot decide whether {} satisfies '{}'",
                                    value,
                                    Type::Refine(r.clone())
                                ),
                                span,
                            )
                            .with_suggestion("widen the expected type or simplify the predicate"),
                        );
                        Type::Refine(r)
                    }
                }
            }
            _ => Type::Int,
        }
    }

    fn check_record_lit(
        &mut self,
        inits: &[ast::FieldInit],
        expected: Option<&Type>,
        span: Span,
    ) -> (Type, EffectRow) {
        let want_fields: Option<Vec<Field>> = expected.and_then(|w| match self.subst.apply(w) {
            Type::Record(fields) => Some(fields),
            _ => None,
        });
        let mut seen: HashSet<String> = HashSet::new();
        let mut fields = Vec::new();
        let mut row = EffectRow::pure();
        for init in inits {
            if !seen.insert(init.name.name.clone()) {
                self.error(
                    DiagKind::MismatchType,
                    format!("field '{}' already set in this record", init.name.name),
                    init.name.span,
                );
                continue;
            }
            let want_ty = want_fields
                .as_ref()
                .and_then(|fs| fs.iter().find(|f| f.name == init.name.name))
                .map(|f| f.ty.clone());
            let (ty, value_row) = self.infer_expr(&init.value, want_ty.as_ref());
            row = self.join_rows(&row, &value_row, span);
            fields.push(Field {
                name: init.name.name.clone(),
                ty,
            });
        }
        (Type::record(fields), row)
    }

    /// Name resolution order: lexical scope, own-space operations,
    /// top-level bindings, bare sum variants, space names.
    fn resolve_identifier(
        &mut self,
        name: &str,
        span: Span,
        expected: Option<&Type>,
    ) -> (Type, EffectRow) {
        if let Some(binding) = self.env.lookup(name) {
            return (binding.ty.clone(), EffectRow::pure());
        }
        if let Some(space) = self.env.current_space().map(str::to_string) {
            let hit = self.spaces.get(&space).and_then(|desc| {
                desc.transform(name)
                    .cloned()
                    .map(|op| (op, true))
                    .or_else(|| desc.view(name).cloned().map(|op| (op, false)))
            });
            if let Some((op, is_transform)) = hit {
                if is_transform {
                    let origin = self.call_origin();
                    self.events.push(SpaceEvent::TransformRef {
                        space,
                        op: name.to_string(),
                        origin,
                        span,
                    });
                }
                return (Type::fun(op.params, op.ret, op.effects), EffectRow::pure());
            }
        }
        if let Some(scheme) = self.globals.get(name).cloned() {
            return (self.subst.instantiate(&scheme, span), EffectRow::pure());
        }
        if let Some(owners) = self.variant_owners.get(name).cloned() {
            return self.bare_variant(name, &owners, span, expected);
        }
        if self.space_names.contains(name) {
            return (Type::Space(name.to_string()), EffectRow::pure());
        }
        if self.env.in_state_init() {
            let is_sibling_state = self
                .env
                .current_space()
                .and_then(|s| self.spaces.get(s))
                .map(|d| d.state_field(name).is_some())
                .unwrap_or(false);
            if is_sibling_state {
                self.error(
                    DiagKind::UnboundIdentifier,
                    format!(
                        "state field '{}' cannot be read in another field's initializer",
                        name
                    ),
                    span,
                );
                return (Type::Error, EffectRow::pure());
            }
        }
        self.error(
            DiagKind::UnboundIdentifier,
            format!("undefined name '{}'", name),
            span,
        );
        (Type::Error, EffectRow::pure())
    }

    fn bare_variant(
        &mut self,
        name: &str,
        owners: &[String],
        span: Span,
        expected: Option<&Type>,
    ) -> (Type, EffectRow) {
        if let Some(want) = expected {
            let resolved = self.subst.apply(want);
            let hit = match &resolved {
                Type::Sum(vs) => vs.iter().find(|v| v.name == name).map(|v| v.payload.clone()),
                Type::Apply { ctor, args } => self
                    .unfold_sum(ctor, args, span)
                    .and_then(|vs| vs.into_iter().find(|v| v.name == name).map(|v| v.payload)),
                _ => None,
            };
            if let Some(payload) = hit {
                if payload != Type::Unit {
                    self.error(
                        DiagKind::MismatchType,
                        format!("variant '{}' takes a payload; construct it with an argument", name),
                        span,
                    );
                    return (Type::Error, EffectRow::pure());
                }
                return (resolved, EffectRow::pure());
            }
        }
        if owners.len() > 1 {
            let list: Vec<String> = owners.iter().map(|o| format!("'{}'", o)).collect();
            self.diag(
                Diagnostic::new(
                    DiagKind::MismatchType,
                    format!(
                        "variant '{}' is declared by {} types; annotate the expected type",
                        name,
                        owners.len()
                    ),
                    span,
                )
                .with_suggestion(format!("one of {}", list.join(", "))),
            );
            return (Type::Error, EffectRow::pure());
        }
        let Some((result, variants)) = self.sum_instance(&owners[0], span) else {
            return (Type::Error, EffectRow::pure());
        };
        let Some(variant) = variants.into_iter().find(|v| v.name == name) else {
            return (Type::Error, EffectRow::pure());
        };
        if variant.payload != Type::Unit {
            self.error(
                DiagKind::MismatchType,
                format!("variant '{}' takes a payload; construct it with an argument", name),
                span,
            );
            return (Type::Error, EffectRow::pure());
        }
        (result, EffectRow::pure())
    }

    /// Instantiate a sum constructor with fresh arguments: the resulting
    /// value type plus its variants, payloads expanded for checking.
    fn sum_instance(&mut self, owner: &str, span: Span) -> Option<(Type, Vec<Variant>)> {
        let ctor = self.ctors.get(owner)?.clone();
        let CtorBody::Sum(variants) = &ctor.body else {
            return None;
        };
        let fresh: Vec<Type> = ctor.params.iter().map(|_| self.subst.fresh_type()).collect();
        let map: HashMap<TypeVarId, Type> = ctor
            .params
            .iter()
            .copied()
            .zip(fresh.iter().cloned())
            .collect();
        let variants: Vec<Variant> = variants
            .iter()
            .map(|v| Variant {
                name: v.name.clone(),
                payload: self.expand_type(substitute(&v.payload, &map), span, MAX_TYPE_DEPTH),
            })
            .collect();
        let result = if ctor.recursive {
            Type::Apply {
                ctor: owner.to_string(),
                args: fresh,
            }
        } else {
            Type::sum(variants.clone())
        };
        Some((result, variants))
    }

    /// One level of a recursive sum: variants with the application's
    /// arguments substituted in.
    fn unfold_sum(&mut self, ctor: &str, args: &[Type], span: Span) -> Option<Vec<Variant>> {
        let decl = self.ctors.get(ctor)?.clone();
        let CtorBody::Sum(variants) = &decl.body else {
            return None;
        };
        if decl.params.len() != args.len() {
            return None;
        }
        let map: HashMap<TypeVarId, Type> = decl
            .params
            .iter()
            .copied()
            .zip(args.iter().cloned())
            .collect();
        Some(
            variants
                .iter()
                .map(|v| Variant {
                    name: v.name.clone(),
                    payload: self.expand_type(substitute(&v.payload, &map), span, MAX_TYPE_DEPTH),
                })
                .collect(),
        )
    }

    fn check_call(
        &mut self,
        name: &ast::Ident,
        args: &[ast::Expr],
        span: Span,
        expected: Option<&Type>,
    ) -> (Type, EffectRow) {
        let fname = name.name.as_str();
        if let Some(ty) = self.env.lookup(fname).map(|b| b.ty.clone()) {
            return self.call_value(fname, &ty, args, span);
        }
        if let Some(space) = self.env.current_space().map(str::to_string) {
            let op = self
                .spaces
                .get(&space)
                .and_then(|d| d.operation(fname))
                .cloned();
            if let Some(op) = op {
                let origin = self.call_origin();
                self.events.push(SpaceEvent::OpInvoked {
                    space,
                    op: fname.to_string(),
                    origin,
                    span,
                });
                return self.call_op(&op, args, span, None);
            }
        }
        if let Some(scheme) = self.globals.get(fname).cloned() {
            let fn_ty = self.subst.instantiate(&scheme, span);
            return self.call_value(fname, &fn_ty, args, span);
        }
        if let Some(owners) = self.variant_owners.get(fname).cloned() {
            return self.variant_call(fname, &owners, args, span, expected);
        }
        if self.space_names.contains(fname) {
            self.error(
                DiagKind::MismatchType,
                format!("space '{}' is not callable", fname),
                name.span,
            );
            let row = self.infer_args_blind(args, span);
            return (Type::Error, row);
        }
        self.error(
            DiagKind::UnboundIdentifier,
            format!("undefined function '{}'", fname),
            name.span,
        );
        let row = self.infer_args_blind(args, span);
        (Type::Error, row)
    }

    fn call_value(
        &mut self,
        name: &str,
        fn_ty: &Type,
        args: &[ast::Expr],
        span: Span,
    ) -> (Type, EffectRow) {
        match self.subst.resolve_shallow(fn_ty) {
            Type::Fn(sig) => {
                if sig.params.len() != args.len() {
                    self.error(
                        DiagKind::MismatchType,
                        format!(
                            "function '{}' expects {} argument{}, got {}",
                            name,
                            sig.params.len(),
                            plural(sig.params.len()),
                            args.len()
                        ),
                        span,
                    );
                    let row = self.infer_args_blind(args, span);
                    return (Type::Error, row);
                }
                let mut row = EffectRow::pure();
                for (arg, param) in args.iter().zip(sig.params.iter()) {
                    let (_, arg_row) = self.check_expr(arg, param);
                    row = self.join_rows(&row, &arg_row, span);
                }
                // calling releases the latent row
                let row = self.join_rows(&row, &sig.effects, span);
                (sig.ret.clone(), row)
            }
            Type::Error => {
                let row = self.infer_args_blind(args, span);
                (Type::Error, row)
            }
            Type::Var(_) => {
                // unknown callee: shape a function type from the call site
                let mut row = EffectRow::pure();
                let mut params = Vec::new();
                for arg in args {
                    let (ty, arg_row) = self.infer_expr(arg, None);
                    params.push(ty);
                    row = self.join_rows(&row, &arg_row, span);
                }
                let ret = self.subst.fresh_type();
                let latent = EffectRow::open(Vec::new(), self.subst.fresh_row_var());
                let wanted = Type::fun(params, ret.clone(), latent.clone());
                if let Err(err) = self.subst.unify(fn_ty, &wanted) {
                    self.error(DiagKind::MismatchType, err.to_string(), span);
                    return (Type::Error, row);
                }
                let row = self.join_rows(&row, &latent, span);
                (ret, row)
            }
            other => {
                self.error(
                    DiagKind::MismatchType,
                    format!("'{}' is not callable; it has type '{}'", name, other),
                    span,
                );
                let row = self.infer_args_blind(args, span);
                (Type::Error, row)
            }
        }
    }

    fn call_op(
        &mut self,
        op: &OpInfo,
        args: &[ast::Expr],
        span: Span,
        absorb_into: Option<&str>,
    ) -> (Type, EffectRow) {
        if op.params.len() != args.len() {
            self.error(
                DiagKind::MismatchType,
                format!(
                    "operation '{}' expects {} argument{}, got {}",
                    op.name,
                    op.params.len(),
                    plural(op.params.len()),
                    args.len()
                ),
                span,
            );
            let row = self.infer_args_blind(args, span);
            return (Type::Error, row);
        }
        let mut row = EffectRow::pure();
        for (arg, param) in args.iter().zip(op.params.iter()) {
            let (_, arg_row) = self.check_expr(arg, param);
            row = self.join_rows(&row, &arg_row, span);
        }
        let mut released = op.effects.clone();
        if let Some(outer) = absorb_into {
            // composition: mutating an embedded space is mutating the
            // composite's own transitive state
            for label in &mut released.labels {
                if label.name == "Mutate" {
                    label.payload = Some(Type::Space(outer.to_string()));
                }
            }
        }
        let row = self.join_rows(&row, &released, span);
        (op.ret.clone(), row)
    }

    fn variant_call(
        &mut self,
        name: &str,
        owners: &[String],
        args: &[ast::Expr],
        span: Span,
        expected: Option<&Type>,
    ) -> (Type, EffectRow) {
        let target: Option<(Type, Vec<Variant>)> = {
            let directed = expected.and_then(|w| {
                let resolved = self.subst.apply(w);
                match &resolved {
                    Type::Sum(vs) if vs.iter().any(|v| v.name == name) => {
                        Some((resolved.clone(), vs.clone()))
                    }
                    Type::Apply { ctor, args: targs } => {
                        let vs = self.unfold_sum(ctor, targs, span)?;
                        if vs.iter().any(|v| v.name == name) {
                            Some((resolved.clone(), vs))
                        } else {
                            None
                        }
                    }
                    _ => None,
                }
            });
            match directed {
                Some(hit) => Some(hit),
                None if owners.len() == 1 => self.sum_instance(&owners[0], span),
                None => None,
            }
        };
        let Some((result, variants)) = target else {
            if owners.len() > 1 {
                let list: Vec<String> = owners.iter().map(|o| format!("'{}'", o)).collect();
                self.diag(
                    Diagnostic::new(
                        DiagKind::MismatchType,
                        format!(
                            "variant '{}' is declared by {} types; annotate the expected type",
                            name,
                            owners.len()
                        ),
                        span,
                    )
                    .with_suggestion(format!("one of {}", list.join(", "))),
                );
            }
            let row = self.infer_args_blind(args, span);
            return (Type::Error, row);
        };
        let Some(variant) = variants.into_iter().find(|v| v.name == name) else {
            let row = self.infer_args_blind(args, span);
            return (Type::Error, row);
        };
        if variant.payload == Type::Unit {
            if !args.is_empty() {
                self.error(
                    DiagKind::MismatchType,
                    format!(
                        "variant '{}' carries no payload, got {} argument{}",
                        name,
                        args.len(),
                        plural(args.len())
                    ),
                    span,
                );
                let row = self.infer_args_blind(args, span);
                return (Type::Error, row);
            }
            return (result, EffectRow::pure());
        }
        if args.len() != 1 {
            self.error(
                DiagKind::MismatchType,
                format!(
                    "variant '{}' takes exactly one argument, got {}",
                    name,
                    args.len()
                ),
                span,
            );
            let row = self.infer_args_blind(args, span);
            return (Type::Error, row);
        }
        let (_, row) = self.check_expr(&args[0], &variant.payload);
        (result, row)
    }

    fn check_method_call(
        &mut self,
        object: &ast::Expr,
        method: &ast::Ident,
        args: &[ast::Expr],
        span: Span,
    ) -> (Type, EffectRow) {
        let (obj_ty, obj_row) = self.infer_expr(object, None);
        match self.subst.resolve_shallow(&obj_ty) {
            Type::Space(space) => {
                let Some(op) = self
                    .spaces
                    .get(&space)
                    .and_then(|d| d.operation(&method.name))
                    .cloned()
                else {
                    self.error(
                        DiagKind::UnboundIdentifier,
                        format!("space '{}' has no operation '{}'", space, method.name),
                        method.span,
                    );
                    let row = self.infer_args_blind(args, span);
                    return (Type::Error, self.join_rows(&obj_row, &row, span));
                };
                let origin = self.call_origin();
                self.events.push(SpaceEvent::OpInvoked {
                    space: space.clone(),
                    op: method.name.clone(),
                    origin,
                    span,
                });
                let absorb = self.env.current_space().map(str::to_string).filter(|cur| {
                    cur != &space
                        && self
                            .spaces
                            .get(cur)
                            .map(|d| d.embeds.iter().any(|e| e.target == space))
                            .unwrap_or(false)
                });
                let (ret, row) = self.call_op(&op, args, span, absorb.as_deref());
                (ret, self.join_rows(&obj_row, &row, span))
            }
            Type::Error => {
                let row = self.infer_args_blind(args, span);
                (Type::Error, self.join_rows(&obj_row, &row, span))
            }
            Type::Var(_) => {
                self.error(
                    DiagKind::MismatchType,
                    "cannot invoke an operation on a value of unknown type; annotate it",
                    span,
                );
                let row = self.infer_args_blind(args, span);
                (Type::Error, self.join_rows(&obj_row, &row, span))
            }
            other => {
                self.error(
                    DiagKind::MismatchType,
                    format!("type '{}' has no operations; only spaces receive invocations", other),
                    span,
                );
                let row = self.infer_args_blind(args, span);
                (Type::Error, self.join_rows(&obj_row, &row, span))
            }
        }
    }

    fn check_field_access(&mut self, object: &ast::Expr, field: &ast::Ident) -> (Type, EffectRow) {
        let (obj_ty, obj_row) = self.infer_expr(object, None);
        let base = self.value_base(&obj_ty);
        match &base {
            Type::Record(fields) => match fields.iter().find(|f| f.name == field.name) {
                Some(f) => (f.ty.clone(), obj_row),
                None => {
                    self.error(
                        DiagKind::MismatchType,
                        format!("record '{}' has no field '{}'", base, field.name),
                        field.span,
                    );
                    (Type::Error, obj_row)
                }
            },
            Type::Space(space) => {
                let space = space.clone();
                self.space_member(&space, field, obj_row)
            }
            Type::Error => (Type::Error, obj_row),
            Type::Var(_) => {
                self.error(
                    DiagKind::MismatchType,
                    "cannot access a field on a value of unknown type; annotate it",
                    field.span,
                );
                (Type::Error, obj_row)
            }
            other => {
                self.error(
                    DiagKind::MismatchType,
                    format!("type '{}' has no fields", other),
                    field.span,
                );
                (Type::Error, obj_row)
            }
        }
    }

    /// Member access on a space value: state reads stay inside the
    /// owning space's bodies, operations become first-class functions,
    /// embeds surface the embedded space.
    fn space_member(
        &mut self,
        space: &str,
        field: &ast::Ident,
        obj_row: EffectRow,
    ) -> (Type, EffectRow) {
        let (state_ty, transform, view, embed_target) = {
            let Some(desc) = self.spaces.get(space) else {
                self.error(
                    DiagKind::UnboundIdentifier,
                    format!("unknown space '{}'", space),
                    field.span,
                );
                return (Type::Error, obj_row);
            };
            (
                desc.state_field(&field.name).map(|f| f.ty.clone()),
                desc.transform(&field.name).cloned(),
                desc.view(&field.name).cloned(),
                desc.embed(&field.name).map(|e| e.target.clone()),
            )
        };
        if let Some(ty) = state_ty {
            let inside = self.env.current_space() == Some(space);
            if !inside {
                self.diag(
                    Diagnostic::new(
                        DiagKind::SpaceViolation,
                        format!(
                            "state '{}' of space '{}' is reached directly; go through a transform or view",
                            field.name, space
                        ),
                        field.span,
                    )
                    .with_suggestion(format!("expose '{}' through a view", field.name)),
                );
            }
            return (ty, obj_row);
        }
        if let Some(op) = transform {
            let origin = self.call_origin();
            self.events.push(SpaceEvent::TransformRef {
                space: space.to_string(),
                op: field.name.clone(),
                origin,
                span: field.span,
            });
            return (Type::fun(op.params, op.ret, op.effects), obj_row);
        }
        if let Some(op) = view {
            return (Type::fun(op.params, op.ret, op.effects), obj_row);
        }
        if let Some(target) = embed_target {
            return (Type::Space(target), obj_row);
        }
        self.error(
            DiagKind::UnboundIdentifier,
            format!("space '{}' has no member '{}'", space, field.name),
            field.span,
        );
        (Type::Error, obj_row)
    }

    fn check_binary(
        &mut self,
        left: &ast::Expr,
        op: BinOp,
        right: &ast::Expr,
        span: Span,
    ) -> (Type, EffectRow) {
        if matches!(op, BinOp::And | BinOp::Or) {
            let (_, left_row) = self.check_expr(left, &Type::Bool);
            let (_, right_row) = self.check_expr(right, &Type::Bool);
            let row = self.join_rows(&left_row, &right_row, span);
            return (Type::Bool, row);
        }
        let (left_ty, left_row) = self.infer_expr(left, None);
        let (right_ty, right_row) = self.infer_expr(right, None);
        let row = self.join_rows(&left_row, &right_row, span);
        let lt = self.value_base(&left_ty);
        let rt = self.value_base(&right_ty);
        if lt.is_error() || rt.is_error() {
            let is_arith = matches!(
                op,
                BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Mod
            );
            let ty = if is_arith { Type::Error } else { Type::Bool };
            return (ty, row);
        }
        match op {
            BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Mod => {
                // concatenation rides on `+`
                if op == BinOp::Add && lt == Type::String && rt == Type::String {
                    return (Type::String, row);
                }
                (self.arith_result(op, &lt, &rt, span), row)
            }
            BinOp::Eq | BinOp::NotEq => {
                if self.subst.unify(&lt, &rt).is_err() {
                    self.error(
                        DiagKind::MismatchType,
                        format!(
                            "cannot compare '{}' and '{}' for equality",
                            self.subst.apply(&lt),
                            self.subst.apply(&rt)
                        ),
                        span,
                    );
                    return (Type::Bool, row);
                }
                match self.value_base(&lt) {
                    Type::Fn(_) => {
                        self.error(DiagKind::MismatchType, "functions are not comparable", span);
                    }
                    Type::Space(_) => {
                        self.error(DiagKind::MismatchType, "spaces are not comparable", span);
                    }
                    Type::Var(v)
                        if self.is_rigid(v)
                            && !self.has_bound(v, Bound::Eq)
                            && !self.has_bound(v, Bound::Ord) =>
                    {
                        self.diag(
                            Diagnostic::new(
                                DiagKind::MismatchType,
                                format!(
                                    "cannot compare values of type '{}'",
                                    self.type_param_name(v)
                                ),
                                span,
                            )
                            .with_suggestion("add an 'Eq' bound to the type parameter"),
                        );
                    }
                    _ => {}
                }
                (Type::Bool, row)
            }
            BinOp::Less | BinOp::Greater | BinOp::LessEq | BinOp::GreaterEq => {
                if self.subst.unify(&lt, &rt).is_err() {
                    self.error(
                        DiagKind::MismatchType,
                        format!(
                            "cannot compare '{}' and '{}'",
                            self.subst.apply(&lt),
                            self.subst.apply(&rt)
                        ),
                        span,
                    );
                    return (Type::Bool, row);
                }
                match self.value_base(&lt) {
                    Type::Int | Type::Real | Type::String | Type::Error => {}
                    Type::Var(v) if self.is_rigid(v) => {
                        if !self.has_bound(v, Bound::Ord) {
                            self.diag(
                                Diagnostic::new(
                                    DiagKind::MismatchType,
                                    format!(
                                        "cannot order values of type '{}'",
                                        self.type_param_name(v)
                                    ),
                                    span,
                                )
                                .with_suggestion("add an 'Ord' bound to the type parameter"),
                            );
                        }
                    }
                    Type::Var(_) => {
                        // unconstrained comparison defaults to Int
                        self.subst.unify(&lt, &Type::Int).ok();
                    }
                    other => {
                        self.error(
                            DiagKind::MismatchType,
                            format!("cannot order values of type '{}'", other),
                            span,
                        );
                    }
                }
                (Type::Bool, row)
            }
            BinOp::And | BinOp::Or => (Type::Bool, row),
        }
    }

    fn arith_result(&mut self, op: BinOp, lt: &Type, rt: &Type, span: Span) -> Type {
        match (lt, rt) {
            (Type::Int, Type::Int) => Type::Int,
            (Type::Real, Type::Real) => Type::Real,
            (Type::Int, Type::Real) | (Type::Real, Type::Int) => {
                self.error(
                    DiagKind::MismatchType,
                    format!(
                        "cannot mix 'Int' and 'Real' in '{}'; convert one side explicitly",
                        op.as_str()
                    ),
                    span,
                );
                Type::Error
            }
            (Type::Var(v), Type::Int | Type::Real) if !self.is_rigid(*v) => {
                self.subst.unify(lt, rt).ok();
                rt.clone()
            }
            (Type::Int | Type::Real, Type::Var(v)) if !self.is_rigid(*v) => {
                self.subst.unify(lt, rt).ok();
                lt.clone()
            }
            (Type::Var(a), Type::Var(b)) if !self.is_rigid(*a) && !self.is_rigid(*b) => {
                // unconstrained arithmetic defaults to Int
                self.subst.unify(lt, rt).ok();
                self.subst.unify(lt, &Type::Int).ok();
                Type::Int
            }
            _ => {
                self.error(
                    DiagKind::MismatchType,
                    format!("cannot apply '{}' to '{}' and '{}'", op.as_str(), lt, rt),
                    span,
                );
                Type::Error
            }
        }
    }

    fn check_unary(&mut self, op: UnaryOp, operand: &ast::Expr, span: Span) -> (Type, EffectRow) {
        match op {
            UnaryOp::Not => {
                let (_, row) = self.check_expr(operand, &Type::Bool);
                (Type::Bool, row)
            }
            UnaryOp::Neg => {
                let (ty, row) = self.infer_expr(operand, None);
                let ty = match self.value_base(&ty) {
                    Type::Int => Type::Int,
                    Type::Real => Type::Real,
                    Type::Error => Type::Error,
                    Type::Var(v) if !self.is_rigid(v) => {
                        self.subst.unify(&Type::Var(v), &Type::Int).ok();
                        Type::Int
                    }
                    other => {
                        self.error(
                            DiagKind::MismatchType,
                            format!("unary '-' requires a numeric operand, got '{}'", other),
                            span,
                        );
                        Type::Error
                    }
                };
                (ty, row)
            }
        }
    }

    fn check_if(
        &mut self,
        condition: &ast::Expr,
        then_branch: &ast::Expr,
        else_branch: Option<&ast::Expr>,
        expected: Option<&Type>,
        span: Span,
    ) -> (Type, EffectRow) {
        let (_, cond_row) = self.check_expr(condition, &Type::Bool);
        match else_branch {
            Some(els) => {
                let (then_ty, then_row) = self.infer_expr(then_branch, expected);
                let (else_ty, else_row) = self.infer_expr(els, expected);
                let row = self.join_rows(&cond_row, &then_row, span);
                let row = self.join_rows(&row, &else_row, span);
                let ty = match subtype::join(&then_ty, &else_ty, &mut self.subst) {
                    Some(ty) => ty,
                    None => {
                        self.error(
                            DiagKind::MismatchType,
                            format!(
                                "if branches disagree: '{}' versus '{}'",
                                self.subst.apply(&then_ty),
                                self.subst.apply(&else_ty)
                            ),
                            span,
                        );
                        Type::Error
                    }
                };
                (ty, row)
            }
            None => {
                // no else: the whole expression is Unit and the branch
                // value is discarded
                let (_, then_row) = self.infer_expr(then_branch, None);
                let row = self.join_rows(&cond_row, &then_row, span);
                (Type::Unit, row)
            }
        }
    }

    fn check_match(
        &mut self,
        subject: &ast::Expr,
        arms: &[ast::MatchArm],
        expected: Option<&Type>,
        span: Span,
    ) -> (Type, EffectRow) {
        let (subject_ty, subject_row) = self.infer_expr(subject, None);
        let resolved = self.subst.apply(&subject_ty);
        let variants: Option<Vec<Variant>> = match &resolved {
            Type::Sum(vs) => Some(vs.clone()),
            Type::Apply { ctor, args } => self.unfold_sum(ctor, args, span),
            Type::Error => None,
            Type::Var(_) => {
                self.error(
                    DiagKind::MismatchType,
                    "cannot match on a value of unknown type; annotate the subject",
                    subject.span,
                );
                None
            }
            _ => {
                self.error(
                    DiagKind::MismatchType,
                    format!("cannot match on '{}'; the subject must be a sum type", resolved),
                    subject.span,
                );
                None
            }
        };
        if arms.is_empty() {
            self.error(DiagKind::MismatchType, "match needs at least one arm", span);
            return (Type::Error, subject_row);
        }
        let mut row = subject_row;
        let mut result: Option<Type> = None;
        let mut covered: BTreeSet<String> = BTreeSet::new();
        let mut has_wildcard = false;
        for arm in arms {
            self.env.push_scope(ScopeKind::Block);
            match &arm.pattern {
                ast::Pattern::Variant { name, binding } => {
                    if !covered.insert(name.name.clone()) {
                        self.error(
                            DiagKind::MismatchType,
                            format!("variant '{}' is matched twice", name.name),
                            name.span,
                        );
                    }
                    let payload = variants
                        .as_ref()
                        .and_then(|vs| vs.iter().find(|v| v.name == name.name))
                        .map(|v| v.payload.clone());
                    match payload {
                        Some(payload) => {
                            if let Some(b) = binding {
                                if payload == Type::Unit {
                                    self.error(
                                        DiagKind::MismatchType,
                                        format!(
                                            "variant '{}' carries no payload to bind",
                                            name.name
                                        ),
                                        b.span,
                                    );
                                    self.env.define(&b.name, Type::Error, BindingKind::Let);
                                } else {
                                    self.env.define(&b.name, payload, BindingKind::Let);
                                }
                            }
                        }
                        None => {
                            if variants.is_some() {
                                self.error(
                                    DiagKind::MismatchType,
                                    format!("'{}' has no variant '{}'", resolved, name.name),
                                    name.span,
                                );
                            }
                            if let Some(b) = binding {
                                self.env.define(&b.name, Type::Error, BindingKind::Let);
                            }
                        }
                    }
                }
                ast::Pattern::Wildcard(_) => {
                    has_wildcard = true;
                }
            }
            let (body_ty, body_row) = self.infer_expr(&arm.body, expected);
            self.env.pop_scope();
            row = self.join_rows(&row, &body_row, span);
            result = match result {
                None => Some(body_ty),
                Some(prev) => match subtype::join(&prev, &body_ty, &mut self.subst) {
                    Some(joined) => Some(joined),
                    None => {
                        self.error(
                            DiagKind::MismatchType,
                            format!(
                                "match arms disagree: '{}' versus '{}'",
                                self.subst.apply(&prev),
                                self.subst.apply(&body_ty)
                            ),
                            arm.body.span,
                        );
                        Some(Type::Error)
                    }
                },
            };
        }
        if !has_wildcard {
            if let Some(vs) = &variants {
                let missing: Vec<String> = vs
                    .iter()
                    .filter(|v| !covered.contains(&v.name))
                    .map(|v| format!("'{}'", v.name))
                    .collect();
                if !missing.is_empty() {
                    self.diag(
                        Diagnostic::new(
                            DiagKind::MismatchType,
                            format!(
                                "non-exhaustive match: missing variant{} {}",
                                plural(missing.len()),
                                missing.join(", ")
                            ),
                            span,
                        )
                        .with_suggestion("add the missing arms or a '_' arm"),
                    );
                }
            }
        }
        (result.unwrap_or(Type::Error), row)
    }

    fn check_block(
        &mut self,
        stmts: &[ast::Stmt],
        tail: Option<&ast::Expr>,
        expected: Option<&Type>,
        span: Span,
    ) -> (Type, EffectRow) {
        self.env.push_scope(ScopeKind::Block);
        let mut row = EffectRow::pure();
        for stmt in stmts {
            match stmt {
                ast::Stmt::Let(ls) => {
                    let declared = ls.type_ann.as_ref().map(|ann| self.convert_local(ann));
                    let (inferred, value_row) = self.infer_expr(&ls.value, declared.as_ref());
                    row = self.join_rows(&row, &value_row, stmt.span());
                    let ty = declared.unwrap_or(inferred);
                    let kind = if ls.mutable {
                        BindingKind::Var
                    } else {
                        BindingKind::Let
                    };
                    if !self.env.define(&ls.name.name, ty, kind) {
                        self.error(
                            DiagKind::MismatchType,
                            format!("variable '{}' is already declared in this scope", ls.name.name),
                            ls.name.span,
                        );
                    }
                }
                ast::Stmt::Assign(assign) => {
                    let assign_row = self.check_assign(assign);
                    row = self.join_rows(&row, &assign_row, assign.span);
                }
                ast::Stmt::Expr(e) => {
                    let (_, expr_row) = self.infer_expr(e, None);
                    row = self.join_rows(&row, &expr_row, e.span);
                }
            }
        }
        let (ty, tail_row) = match tail {
            Some(t) => self.infer_expr(t, expected),
            None => (Type::Unit, EffectRow::pure()),
        };
        let row = self.join_rows(&row, &tail_row, span);
        self.env.pop_scope();
        (ty, row)
    }

    /// Assignment legality depends on what the head of the path names:
    /// state in a transform adds `Mutate`, a `var` adds `State`, and
    /// everything else is some flavor of violation.
    fn check_assign(&mut self, stmt: &ast::AssignStmt) -> EffectRow {
        let Some(head) = stmt.target.first() else {
            return EffectRow::pure();
        };
        let Some(binding) = self.env.lookup(&head.name).cloned() else {
            self.error(
                DiagKind::UnboundIdentifier,
                format!("undefined name '{}'", head.name),
                head.span,
            );
            let (_, row) = self.infer_expr(&stmt.value, None);
            return row;
        };
        match binding.kind {
            BindingKind::State => {
                let target_ty = self.walk_path(&binding.ty, &stmt.target[1..]);
                if self.env.in_transform() {
                    let (_, value_row) = self.check_expr(&stmt.value, &target_ty);
                    let space = self
                        .env
                        .current_space()
                        .map(str::to_string)
                        .unwrap_or_default();
                    let mutate = EffectRow::closed(vec![EffectLabel::with_payload(
                        "Mutate",
                        Type::Space(space),
                    )]);
                    self.join_rows(&value_row, &mutate, stmt.span)
                } else {
                    let context = if self.env.in_view() {
                        "a view"
                    } else if self.env.in_state_init() {
                        "a state initializer"
                    } else {
                        "an invariant"
                    };
                    self.diag(
                        Diagnostic::new(
                            DiagKind::SpaceViolation,
                            format!(
                                "cannot assign to state '{}' in {}; only transforms mutate state",
                                head.name, context
                            ),
                            stmt.span,
                        )
                        .with_suggestion("move the mutation into a transform"),
                    );
                    // the violation is the whole story; no label is added
                    let (_, value_row) = self.check_expr(&stmt.value, &target_ty);
                    value_row
                }
            }
            BindingKind::Var => {
                let target_ty = self.walk_path(&binding.ty, &stmt.target[1..]);
                let (_, value_row) = self.check_expr(&stmt.value, &target_ty);
                let state = EffectRow::closed(vec![EffectLabel::with_payload(
                    "State",
                    self.subst.apply(&binding.ty),
                )]);
                self.join_rows(&value_row, &state, stmt.span)
            }
            BindingKind::Let | BindingKind::Param => {
                self.diag(
                    Diagnostic::new(
                        DiagKind::MismatchType,
                        format!("cannot assign to immutable binding '{}'", head.name),
                        head.span,
                    )
                    .with_suggestion(format!("declare '{}' with 'var'", head.name)),
                );
                let (_, row) = self.infer_expr(&stmt.value, None);
                row
            }
            BindingKind::Embed => {
                self.error(
                    DiagKind::SpaceViolation,
                    format!("cannot reassign embedded space '{}'", head.name),
                    head.span,
                );
                let (_, row) = self.infer_expr(&stmt.value, None);
                row
            }
        }
    }

    /// Resolve the remaining segments of an assignment path through
    /// record fields.
    fn walk_path(&mut self, root: &Type, rest: &[ast::Ident]) -> Type {
        let mut ty = self.subst.apply(root);
        for seg in rest {
            let base = self.value_base(&ty);
            match &base {
                Type::Record(fields) => match fields.iter().find(|f| f.name == seg.name) {
                    Some(f) => ty = f.ty.clone(),
                    None => {
                        self.error(
                            DiagKind::MismatchType,
                            format!("record '{}' has no field '{}'", base, seg.name),
                            seg.span,
                        );
                        return Type::Error;
                    }
                },
                Type::Error => return Type::Error,
                other => {
                    self.error(
                        DiagKind::MismatchType,
                        format!("type '{}' has no field '{}'", other, seg.name),
                        seg.span,
                    );
                    return Type::Error;
                }
            }
        }
        ty
    }

    fn check_with_effects(
        &mut self,
        declared: &ast::EffectRowAnn,
        body: &ast::Expr,
        expected: Option<&Type>,
    ) -> (Type, EffectRow) {
        let contract = self.convert_row_local(declared);
        let (ty, row) = self.infer_expr(body, expected);
        self.check_row_contract(&row, &contract, declared.span, "body");
        // outward, the expression has exactly the declared row
        (ty, contract)
    }

    fn check_lambda(
        &mut self,
        params: &[ast::LambdaParam],
        body: &ast::Expr,
        expected: Option<&Type>,
    ) -> (Type, EffectRow) {
        let expected_fn = expected.and_then(|w| match self.subst.resolve_shallow(w) {
            Type::Fn(f) => Some(*f),
            _ => None,
        });
        self.env.push_scope(ScopeKind::Lambda);
        let mut param_tys = Vec::new();
        for (i, p) in params.iter().enumerate() {
            let ty = match &p.type_ann {
                Some(ann) => self.convert_local(ann),
                None => expected_fn
                    .as_ref()
                    .and_then(|f| f.params.get(i))
                    .cloned()
                    .unwrap_or_else(|| self.subst.fresh_type()),
            };
            if !self.env.define(&p.name.name, ty.clone(), BindingKind::Param) {
                self.error(
                    DiagKind::MismatchType,
                    format!("parameter '{}' already declared", p.name.name),
                    p.name.span,
                );
            }
            param_tys.push(ty);
        }
        let ret_want = expected_fn.as_ref().map(|f| f.ret.clone());
        let (body_ty, body_row) = self.infer_expr(body, ret_want.as_ref());
        self.env.pop_scope();
        // building a closure is pure; the body's row is latent
        (Type::fun(param_tys, body_ty, body_row), EffectRow::pure())
    }

    // ══════════════════════════════════════════════════════════════════════
    // Shared machinery
    // ══════════════════════════════════════════════════════════════════════

    fn infer_args_blind(&mut self, args: &[ast::Expr], span: Span) -> EffectRow {
        let mut row = EffectRow::pure();
        for arg in args {
            let (_, arg_row) = self.infer_expr(arg, None);
            row = self.join_rows(&row, &arg_row, span);
        }
        row
    }

    fn call_origin(&self) -> CallOrigin {
        match self.env.current_space() {
            Some(space) => CallOrigin::SpaceBody {
                space: space.to_string(),
                in_transform: self.env.in_transform(),
            },
            None => CallOrigin::Function,
        }
    }

    /// Union two rows, reporting payload conflicts as `mismatch-effect`.
    fn join_rows(&mut self, a: &EffectRow, b: &EffectRow, span: Span) -> EffectRow {
        let a = self.subst.apply_row(a);
        let b = self.subst.apply_row(b);
        let outcome = effects::union(&a, &b);
        for conflict in outcome.conflicts {
            self.diag(Diagnostic::new(
                DiagKind::MismatchEffect,
                format!(
                    "effect '{}' appears with conflicting payloads '{}' and '{}'",
                    conflict.label,
                    fmt_payload(&conflict.left),
                    fmt_payload(&conflict.right)
                ),
                span,
            ));
        }
        outcome.row
    }

    fn check_row_contract(
        &mut self,
        actual: &EffectRow,
        declared: &EffectRow,
        span: Span,
        what: &str,
    ) {
        match effects::is_subsumed(actual, declared, &mut self.subst, false) {
            Subsumption::Holds => {}
            Subsumption::MissingLabels(labels) => {
                let list: Vec<String> = labels.iter().map(|l| format!("'{}'", l)).collect();
                self.diag(
                    Diagnostic::new(
                        DiagKind::MismatchEffect,
                        format!(
                            "{} has effect{} outside the declared row: {}",
                            what,
                            plural(labels.len()),
                            list.join(", ")
                        ),
                        span,
                    )
                    .with_expected_actual(
                        self.subst.apply_row(declared).to_string(),
                        self.subst.apply_row(actual).to_string(),
                    ),
                );
            }
            Subsumption::PayloadConflict {
                label,
                declared: declared_payload,
                actual: actual_payload,
            } => {
                self.diag(
                    Diagnostic::new(
                        DiagKind::MismatchEffect,
                        format!(
                            "effect '{}' carries '{}' here but the declared row expects '{}'",
                            label,
                            fmt_payload(&actual_payload),
                            fmt_payload(&declared_payload)
                        ),
                        span,
                    )
                    .with_expected_actual(
                        self.subst.apply_row(declared).to_string(),
                        self.subst.apply_row(actual).to_string(),
                    ),
                );
            }
        }
    }

    /// Deep-resolve a type and strip refinements; what is left is how
    /// the value behaves under operators.
    fn value_base(&mut self, ty: &Type) -> Type {
        let mut current = self.subst.apply(ty);
        loop {
            match current {
                Type::Refine(r) => current = r.base,
                other => return other,
            }
        }
    }

    fn is_rigid(&self, var: TypeVarId) -> bool {
        self.rigid_bounds.contains_key(&var)
    }

    fn has_bound(&self, var: TypeVarId, bound: Bound) -> bool {
        self.rigid_bounds
            .get(&var)
            .map(|bs| bs.contains(&bound))
            .unwrap_or(false)
    }

    fn type_param_name(&self, var: TypeVarId) -> String {
        self.sig_ctx
            .type_params
            .iter()
            .find(|(_, &v)| v == var)
            .map(|(name, _)| name.clone())
            .unwrap_or_else(|| Type::Var(var).to_string())
    }

    fn record_annotation(&mut self, span: Span, ty: Type, effects: EffectRow) {
        self.annotations.insert(span, Annotated { ty, effects });
        self.pending_spans.push(span);
    }

    fn diag(&mut self, diag: Diagnostic) {
        self.diags.push(diag);
    }

    fn error(&mut self, kind: DiagKind, message: impl Into<String>, span: Span) {
        self.diags.push(Diagnostic::new(kind, message, span));
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// Helpers
// ══════════════════════════════════════════════════════════════════════════════

fn plural(n: usize) -> &'static str {
    if n == 1 {
        ""
    } else {
        "s"
    }
}

fn fmt_payload(payload: &Option<Type>) -> String {
    match payload {
        Some(ty) => ty.to_string(),
        None => String::from("nothing"),
    }
}

fn label_list(row: &EffectRow) -> String {
    let names: Vec<String> = row.labels.iter().map(|l| format!("'{}'", l.name)).collect();
    names.join(", ")
}

fn close_row(row: EffectRow) -> EffectRow {
    EffectRow::closed(row.labels)
}

/// Replace mapped variables throughout a type. Used for constructor
/// expansion, which must not touch the substitution.
fn substitute(ty: &Type, map: &HashMap<TypeVarId, Type>) -> Type {
    match ty {
        Type::Var(v) => map.get(v).cloned().unwrap_or_else(|| ty.clone()),
        Type::Apply { ctor, args } => Type::Apply {
            ctor: ctor.clone(),
            args: args.iter().map(|a| substitute(a, map)).collect(),
        },
        Type::Fn(f) => {
            let labels = f
                .effects
                .labels
                .iter()
                .map(|l| EffectLabel {
                    name: l.name.clone(),
                    payload: l.payload.as_ref().map(|p| substitute(p, map)),
                })
                .collect();
            Type::fun(
                f.params.iter().map(|p| substitute(p, map)).collect(),
                substitute(&f.ret, map),
                EffectRow {
                    labels,
                    tail: f.effects.tail,
                },
            )
        }
        Type::Record(fields) => Type::Record(
            fields
                .iter()
                .map(|f| Field {
                    name: f.name.clone(),
                    ty: substitute(&f.ty, map),
                })
                .collect(),
        ),
        Type::Sum(variants) => Type::Sum(
            variants
                .iter()
                .map(|v| Variant {
                    name: v.name.clone(),
                    payload: substitute(&v.payload, map),
                })
                .collect(),
        ),
        Type::Refine(r) => Type::refine(substitute(&r.base, map), r.binder.clone(), r.predicate.clone()),
        _ => ty.clone(),
    }
}

fn collect_ctor_mentions(ty: &Type, out: &mut BTreeSet<String>) {
    match ty {
        Type::Apply { ctor, args } => {
            out.insert(ctor.clone());
            for arg in args {
                collect_ctor_mentions(arg, out);
            }
        }
        Type::Fn(f) => {
            for p in &f.params {
                collect_ctor_mentions(p, out);
            }
            collect_ctor_mentions(&f.ret, out);
            for label in &f.effects.labels {
                if let Some(payload) = &label.payload {
                    collect_ctor_mentions(payload, out);
                }
            }
        }
        Type::Record(fields) => {
            for f in fields {
                collect_ctor_mentions(&f.ty, out);
            }
        }
        Type::Sum(variants) => {
            for v in variants {
                collect_ctor_mentions(&v.payload, out);
            }
        }
        Type::Refine(r) => collect_ctor_mentions(&r.base, out),
        _ => {}
    }
}

fn reaches_self(start: &str, graph: &HashMap<String, BTreeSet<String>>) -> bool {
    let mut stack: Vec<&str> = graph
        .get(start)
        .into_iter()
        .flatten()
        .map(String::as_str)
        .collect();
    let mut seen: HashSet<&str> = HashSet::new();
    while let Some(node) = stack.pop() {
        if node == start {
            return true;
        }
        if !seen.insert(node) {
            continue;
        }
        if let Some(next) = graph.get(node) {
            stack.extend(next.iter().map(String::as_str));
        }
    }
    false
}

/// Split a where-clause into its `and`-separated conjuncts.
fn split_conjuncts(expr: &ast::Expr) -> Vec<&ast::Expr> {
    fn walk<'a>(e: &'a ast::Expr, out: &mut Vec<&'a ast::Expr>) {
        match &e.kind {
            ast::ExprKind::Binary {
                left,
                op: BinOp::And,
                right,
            } => {
                walk(left, out);
                walk(right, out);
            }
            ast::ExprKind::Paren(inner) => walk(inner, out),
            _ => out.push(e),
        }
    }
    let mut out = Vec::new();
    walk(expr, &mut out);
    out
}

/// Every identifier an expression mentions, shadowing ignored. Good
/// enough to attribute where-clause conjuncts to parameters.
fn collect_idents(expr: &ast::Expr, out: &mut BTreeSet<String>) {
    match &expr.kind {
        ast::ExprKind::Identifier(name) => {
            out.insert(name.clone());
        }
        ast::ExprKind::RecordLit(inits) => {
            for init in inits {
                collect_idents(&init.value, out);
            }
        }
        ast::ExprKind::Call { args, .. } => {
            for arg in args {
                collect_idents(arg, out);
            }
        }
        ast::ExprKind::MethodCall { object, args, .. } => {
            collect_idents(object, out);
            for arg in args {
                collect_idents(arg, out);
            }
        }
        ast::ExprKind::FieldAccess { object, .. } => collect_idents(object, out),
        ast::ExprKind::Binary { left, right, .. } => {
            collect_idents(left, out);
            collect_idents(right, out);
        }
        ast::ExprKind::Unary { operand, .. } => collect_idents(operand, out),
        ast::ExprKind::If {
            condition,
            then_branch,
            else_branch,
        } => {
            collect_idents(condition, out);
            collect_idents(then_branch, out);
            if let Some(e) = else_branch {
                collect_idents(e, out);
            }
        }
        ast::ExprKind::Match { subject, arms } => {
            collect_idents(subject, out);
            for arm in arms {
                collect_idents(&arm.body, out);
            }
        }
        ast::ExprKind::Block { stmts, tail } => {
            for stmt in stmts {
                match stmt {
                    ast::Stmt::Let(ls) => collect_idents(&ls.value, out),
                    ast::Stmt::Assign(a) => collect_idents(&a.value, out),
                    ast::Stmt::Expr(e) => collect_idents(e, out),
                }
            }
            if let Some(t) = tail {
                collect_idents(t, out);
            }
        }
        ast::ExprKind::WithEffects { body, .. } => collect_idents(body, out),
        ast::ExprKind::Lambda { body, .. } => collect_idents(body, out),
        ast::ExprKind::Paren(inner) => collect_idents(inner, out),
        _ => {}
    }
}

/// Unresolved inference variables become `Error` at finalization; the
/// flag drives the one cannot-infer diagnostic per declaration. The
/// declaration's own generic parameters are not inference leftovers and
/// survive as they are.
fn erase_free_vars(ty: Type, rigid: &HashSet<TypeVarId>) -> (Type, bool) {
    match ty {
        Type::Var(v) if rigid.contains(&v) => (Type::Var(v), false),
        Type::Var(_) => (Type::Error, true),
        Type::Apply { ctor, args } => {
            let mut flagged = false;
            let args = args
                .into_iter()
                .map(|a| {
                    let (t, f) = erase_free_vars(a, rigid);
                    flagged |= f;
                    t
                })
                .collect();
            (Type::Apply { ctor, args }, flagged)
        }
        Type::Fn(f) => {
            let f = *f;
            let mut flagged = false;
            let params = f
                .params
                .into_iter()
                .map(|p| {
                    let (t, fl) = erase_free_vars(p, rigid);
                    flagged |= fl;
                    t
                })
                .collect();
            let (ret, ret_flag) = erase_free_vars(f.ret, rigid);
            flagged |= ret_flag;
            let (effects, row_flag) = erase_free_row_vars(f.effects, rigid);
            flagged |= row_flag;
            (Type::fun(params, ret, effects), flagged)
        }
        Type::Record(fields) => {
            let mut flagged = false;
            let fields = fields
                .into_iter()
                .map(|f| {
                    let (t, fl) = erase_free_vars(f.ty, rigid);
                    flagged |= fl;
                    Field { name: f.name, ty: t }
                })
                .collect();
            (Type::Record(fields), flagged)
        }
        Type::Sum(variants) => {
            let mut flagged = false;
            let variants = variants
                .into_iter()
                .map(|v| {
                    let (t, fl) = erase_free_vars(v.payload, rigid);
                    flagged |= fl;
                    Variant {
                        name: v.name,
                        payload: t,
                    }
                })
                .collect();
            (Type::Sum(variants), flagged)
        }
        Type::Refine(r) => {
            let r = *r;
            let (base, flagged) = erase_free_vars(r.base, rigid);
            (Type::refine(base, r.binder, r.predicate), flagged)
        }
        leaf => (leaf, false),
    }
}

fn erase_free_row_vars(row: EffectRow, rigid: &HashSet<TypeVarId>) -> (EffectRow, bool) {
    let mut flagged = false;
    let labels = row
        .labels
        .into_iter()
        .map(|l| EffectLabel {
            name: l.name,
            payload: l.payload.map(|p| {
                let (t, f) = erase_free_vars(p, rigid);
                flagged |= f;
                t
            }),
        })
        .collect();
    (
        EffectRow {
            labels,
            tail: row.tail,
        },
        flagged,
    )
}
