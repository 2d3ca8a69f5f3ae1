//! Space descriptors and the concurrency-domain census.
//!
//! Inference registers one descriptor per `space` declaration and records
//! an event for every operation call and first-class transform reference.
//! Once every body has been checked, the census walks descriptors and
//! events to enforce isolation, transform atomicity, and the `concurrent`
//! tagging rules. When it is ambiguous whether two call sites can race,
//! they race.

use std::collections::HashMap;

use cascade_types::ast::SpaceKind;
use cascade_types::{DiagKind, Diagnostic, Diagnostics, Span};

use crate::effects::EffectRow;
use crate::ty::Type;

// ══════════════════════════════════════════════════════════════════════════════
// Descriptors
// ══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
pub struct StateFieldInfo {
    pub name: String,
    pub ty: Type,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub struct EmbedInfo {
    pub field: String,
    pub target: String,
    pub span: Span,
}

/// A transform or view signature. `effects` starts as the declared row
/// and is replaced by the checked row once the body has been inferred.
#[derive(Debug, Clone)]
pub struct OpInfo {
    pub name: String,
    pub params: Vec<Type>,
    pub ret: Type,
    pub effects: EffectRow,
    pub concurrent: bool,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub struct SpaceDescriptor {
    pub name: String,
    pub kind: SpaceKind,
    pub span: Span,
    pub state: Vec<StateFieldInfo>,
    pub embeds: Vec<EmbedInfo>,
    pub transforms: Vec<OpInfo>,
    pub views: Vec<OpInfo>,
}

impl SpaceDescriptor {
    pub fn state_field(&self, name: &str) -> Option<&StateFieldInfo> {
        self.state.iter().find(|f| f.name == name)
    }

    pub fn embed(&self, name: &str) -> Option<&EmbedInfo> {
        self.embeds.iter().find(|e| e.field == name)
    }

    pub fn transform(&self, name: &str) -> Option<&OpInfo> {
        self.transforms.iter().find(|t| t.name == name)
    }

    pub fn view(&self, name: &str) -> Option<&OpInfo> {
        self.views.iter().find(|v| v.name == name)
    }

    /// Transform or view, transforms shadowing nothing since name
    /// clashes are rejected at registration.
    pub fn operation(&self, name: &str) -> Option<&OpInfo> {
        self.transform(name).or_else(|| self.view(name))
    }
}

/// All registered spaces, in declaration order.
#[derive(Debug, Default)]
pub struct SpaceRegistry {
    spaces: HashMap<String, SpaceDescriptor>,
    order: Vec<String>,
}

impl SpaceRegistry {
    pub fn new() -> Self {
        SpaceRegistry::default()
    }

    /// Returns `false` if a space with this name is already registered.
    pub fn register(&mut self, desc: SpaceDescriptor) -> bool {
        if self.spaces.contains_key(&desc.name) {
            return false;
        }
        self.order.push(desc.name.clone());
        self.spaces.insert(desc.name.clone(), desc);
        true
    }

    pub fn contains(&self, name: &str) -> bool {
        self.spaces.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&SpaceDescriptor> {
        self.spaces.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut SpaceDescriptor> {
        self.spaces.get_mut(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SpaceDescriptor> {
        self.order.iter().filter_map(|name| self.spaces.get(name))
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// Events
// ══════════════════════════════════════════════════════════════════════════════

/// Where an operation call or transform reference textually sits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallOrigin {
    /// Inside the body of some space operation.
    SpaceBody { space: String, in_transform: bool },
    /// Inside a free function or top-level binding.
    Function,
}

/// Recorded during inference, consumed by the census.
#[derive(Debug, Clone)]
pub enum SpaceEvent {
    /// `target.op(...)` or a bare `op(...)` inside the space's own body.
    OpInvoked {
        space: String,
        op: String,
        origin: CallOrigin,
        span: Span,
    },
    /// A transform mentioned as a value rather than called.
    TransformRef {
        space: String,
        op: String,
        origin: CallOrigin,
        span: Span,
    },
}

impl SpaceEvent {
    fn space(&self) -> &str {
        match self {
            SpaceEvent::OpInvoked { space, .. } | SpaceEvent::TransformRef { space, .. } => space,
        }
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// Census
// ══════════════════════════════════════════════════════════════════════════════

/// Run every descriptor-level and cross-space rule.
pub fn check_all(registry: &SpaceRegistry, events: &[SpaceEvent], diags: &mut Diagnostics) {
    detect_embed_cycles(registry, diags);
    for desc in registry.iter() {
        for diag in check_space(desc, registry, events) {
            diags.push(diag);
        }
    }
}

/// Rules local to one descriptor plus the event census filtered to it.
pub fn check_space(
    desc: &SpaceDescriptor,
    registry: &SpaceRegistry,
    events: &[SpaceEvent],
) -> Vec<Diagnostic> {
    let mut out = Vec::new();
    check_embeds(desc, registry, &mut out);
    check_view_rows(desc, &mut out);
    let own: Vec<&SpaceEvent> = events.iter().filter(|e| e.space() == desc.name).collect();
    check_isolation(desc, &own, &mut out);
    check_atomicity(desc, &own, &mut out);
    out
}

/// An embed cycle means an infinite descriptor. Reported once, at the
/// edge that closes the cycle.
fn detect_embed_cycles(registry: &SpaceRegistry, diags: &mut Diagnostics) {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Gray,
        Black,
    }

    fn visit(
        name: &str,
        registry: &SpaceRegistry,
        marks: &mut HashMap<String, Mark>,
        diags: &mut Diagnostics,
    ) {
        marks.insert(name.to_string(), Mark::Gray);
        if let Some(desc) = registry.get(name) {
            for embed in &desc.embeds {
                if !registry.contains(&embed.target) {
                    continue;
                }
                match marks.get(&embed.target) {
                    None => visit(&embed.target, registry, marks, diags),
                    Some(Mark::Gray) => diags.push(Diagnostic::new(
                        DiagKind::NonTerminatingType,
                        format!(
                            "embedding '{}' here creates a cycle; the descriptor of '{}' would be infinite",
                            embed.target, name
                        ),
                        embed.span,
                    )),
                    Some(Mark::Black) => {}
                }
            }
        }
        marks.insert(name.to_string(), Mark::Black);
    }

    let mut marks = HashMap::new();
    for desc in registry.iter() {
        if !marks.contains_key(&desc.name) {
            visit(&desc.name, registry, &mut marks, diags);
        }
    }
}

fn check_embeds(desc: &SpaceDescriptor, registry: &SpaceRegistry, out: &mut Vec<Diagnostic>) {
    for embed in &desc.embeds {
        // Unknown targets were already reported at registration.
        let Some(target) = registry.get(&embed.target) else {
            continue;
        };
        if desc.kind == SpaceKind::Isolated {
            out.push(
                Diagnostic::new(
                    DiagKind::SpaceViolation,
                    format!(
                        "isolated space '{}' cannot embed '{}'",
                        desc.name, target.name
                    ),
                    embed.span,
                )
                .with_suggestion(format!(
                    "declare '{}' as shared to allow composition",
                    desc.name
                )),
            );
        } else if target.kind == SpaceKind::Isolated {
            out.push(
                Diagnostic::new(
                    DiagKind::SpaceViolation,
                    format!("cannot embed isolated space '{}'", target.name),
                    embed.span,
                )
                .with_suggestion(format!(
                    "declare '{}' as shared to allow composition",
                    target.name
                )),
            );
        }
    }
}

fn check_view_rows(desc: &SpaceDescriptor, out: &mut Vec<Diagnostic>) {
    for view in &desc.views {
        if view.effects.has("Mutate") {
            out.push(Diagnostic::new(
                DiagKind::SpaceViolation,
                format!(
                    "view '{}' of space '{}' must be read-only but its body has effect 'Mutate'",
                    view.name, desc.name
                ),
                view.span,
            ));
        }
    }
}

/// Isolated spaces: state capability never crosses a space boundary.
/// Free functions may still drive them.
fn check_isolation(desc: &SpaceDescriptor, events: &[&SpaceEvent], out: &mut Vec<Diagnostic>) {
    if desc.kind != SpaceKind::Isolated {
        return;
    }
    for event in events {
        match event {
            SpaceEvent::OpInvoked {
                op,
                origin: CallOrigin::SpaceBody { space: other, .. },
                span,
                ..
            } if other != &desc.name => {
                out.push(
                    Diagnostic::new(
                        DiagKind::SpaceViolation,
                        format!(
                            "operation '{}' of isolated space '{}' cannot be invoked from the body of space '{}'",
                            op, desc.name, other
                        ),
                        *span,
                    )
                    .with_suggestion("drive the isolated space from a function instead".to_string()),
                );
            }
            SpaceEvent::TransformRef {
                op,
                origin: CallOrigin::SpaceBody { space: other, .. },
                span,
                ..
            } if other != &desc.name => {
                out.push(Diagnostic::new(
                    DiagKind::SpaceViolation,
                    format!(
                        "transform '{}' of isolated space '{}' cannot be captured in the body of space '{}'",
                        op, desc.name, other
                    ),
                    *span,
                ));
            }
            _ => {}
        }
    }
}

fn check_atomicity(desc: &SpaceDescriptor, events: &[&SpaceEvent], out: &mut Vec<Diagnostic>) {
    // A transform calling a transform of its own space re-enters the
    // atomic unit, whatever the space kind.
    for event in events {
        if let SpaceEvent::OpInvoked {
            op,
            origin:
                CallOrigin::SpaceBody {
                    space,
                    in_transform: true,
                },
            span,
            ..
        } = event
        {
            if space == &desc.name && desc.transform(op).is_some() {
                out.push(
                    Diagnostic::new(
                        DiagKind::SpaceViolation,
                        format!(
                            "transform '{}' re-enters the atomic unit of space '{}'",
                            op, desc.name
                        ),
                        *span,
                    )
                    .with_suggestion(
                        "extract the shared steps into a view or a free function".to_string(),
                    ),
                );
            }
        }
    }

    if !matches!(desc.kind, SpaceKind::Shared | SpaceKind::Distributed) {
        return;
    }

    // Untagged transforms of a shared space: any use pattern that could
    // race demands the `concurrent` tag. Each cause is reported once.
    for transform in &desc.transforms {
        if transform.concurrent {
            continue;
        }
        let mut sites = 0usize;
        let mut external: Option<Span> = None;
        let mut first_ref: Option<Span> = None;
        for event in events {
            match event {
                SpaceEvent::OpInvoked {
                    op, origin, span, ..
                } if op == &transform.name => {
                    sites += 1;
                    let from_outside = match origin {
                        CallOrigin::SpaceBody { space, .. } => space != &desc.name,
                        CallOrigin::Function => true,
                    };
                    if from_outside && external.is_none() {
                        external = Some(*span);
                    }
                }
                SpaceEvent::TransformRef { op, span, .. } if op == &transform.name => {
                    sites += 1;
                    if first_ref.is_none() {
                        first_ref = Some(*span);
                    }
                }
                _ => {}
            }
        }
        let tag_hint = format!("tag 'transform {}' with 'concurrent'", transform.name);
        if let Some(span) = external {
            out.push(
                Diagnostic::new(
                    DiagKind::SpaceViolation,
                    format!(
                        "transform '{}' of {} space '{}' is invoked from outside the space but is not tagged 'concurrent'",
                        transform.name,
                        desc.kind.as_str(),
                        desc.name
                    ),
                    span,
                )
                .with_suggestion(tag_hint.clone()),
            );
        }
        if sites >= 2 {
            out.push(
                Diagnostic::new(
                    DiagKind::SpaceViolation,
                    format!(
                        "transform '{}' of {} space '{}' has {} call sites but is not tagged 'concurrent'",
                        transform.name,
                        desc.kind.as_str(),
                        desc.name,
                        sites
                    ),
                    transform.span,
                )
                .with_suggestion(tag_hint.clone()),
            );
        }
        if let Some(span) = first_ref {
            out.push(
                Diagnostic::new(
                    DiagKind::SpaceViolation,
                    format!(
                        "transform '{}' of {} space '{}' is used as a value; its call sites cannot be serialized",
                        transform.name,
                        desc.kind.as_str(),
                        desc.name
                    ),
                    span,
                )
                .with_suggestion(tag_hint),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effects::EffectLabel;

    fn at(line: u32) -> Span {
        Span::point(line, 1)
    }

    fn space(name: &str, kind: SpaceKind) -> SpaceDescriptor {
        SpaceDescriptor {
            name: name.to_string(),
            kind,
            span: at(1),
            state: vec![],
            embeds: vec![],
            transforms: vec![],
            views: vec![],
        }
    }

    fn op(name: &str, concurrent: bool, effects: EffectRow, line: u32) -> OpInfo {
        OpInfo {
            name: name.to_string(),
            params: vec![],
            ret: Type::Unit,
            effects,
            concurrent,
            span: at(line),
        }
    }

    fn embed(field: &str, target: &str, line: u32) -> EmbedInfo {
        EmbedInfo {
            field: field.to_string(),
            target: target.to_string(),
            span: at(line),
        }
    }

    fn mutate_row(space: &str) -> EffectRow {
        EffectRow::closed(vec![EffectLabel::with_payload(
            "Mutate",
            Type::Space(space.to_string()),
        )])
    }

    fn census(registry: &SpaceRegistry, events: &[SpaceEvent]) -> Diagnostics {
        let mut diags = Diagnostics::new();
        check_all(registry, events, &mut diags);
        diags
    }

    #[test]
    fn quiet_space_produces_no_diagnostics() {
        let mut registry = SpaceRegistry::new();
        let mut counter = space("Counter", SpaceKind::Isolated);
        counter.transforms.push(op("increment", false, mutate_row("Counter"), 3));
        counter.views.push(op("current", false, EffectRow::pure(), 4));
        registry.register(counter);
        let diags = census(&registry, &[]);
        assert!(diags.is_empty(), "got: {:?}", diags);
    }

    #[test]
    fn duplicate_space_rejected_by_registry() {
        let mut registry = SpaceRegistry::new();
        assert!(registry.register(space("Counter", SpaceKind::Isolated)));
        assert!(!registry.register(space("Counter", SpaceKind::Shared)));
    }

    #[test]
    fn embed_cycle_reported_once() {
        let mut registry = SpaceRegistry::new();
        let mut a = space("A", SpaceKind::Shared);
        a.embeds.push(embed("b", "B", 2));
        let mut b = space("B", SpaceKind::Shared);
        b.embeds.push(embed("a", "A", 7));
        registry.register(a);
        registry.register(b);
        let diags = census(&registry, &[]);
        assert_eq!(diags.count_of(DiagKind::NonTerminatingType), 1);
    }

    #[test]
    fn self_embed_is_a_cycle() {
        let mut registry = SpaceRegistry::new();
        let mut a = space("A", SpaceKind::Shared);
        a.embeds.push(embed("inner", "A", 2));
        registry.register(a);
        let diags = census(&registry, &[]);
        assert_eq!(diags.count_of(DiagKind::NonTerminatingType), 1);
    }

    #[test]
    fn embed_chain_without_cycle_is_fine() {
        let mut registry = SpaceRegistry::new();
        let mut a = space("A", SpaceKind::Shared);
        a.embeds.push(embed("b", "B", 2));
        let mut b = space("B", SpaceKind::Shared);
        b.embeds.push(embed("c", "C", 2));
        registry.register(a);
        registry.register(b);
        registry.register(space("C", SpaceKind::Shared));
        let diags = census(&registry, &[]);
        assert!(diags.is_empty());
    }

    #[test]
    fn isolated_space_cannot_embed() {
        let mut registry = SpaceRegistry::new();
        let mut a = space("A", SpaceKind::Isolated);
        a.embeds.push(embed("b", "B", 4));
        registry.register(a);
        registry.register(space("B", SpaceKind::Shared));
        let diags = census(&registry, &[]);
        assert_eq!(diags.count_of(DiagKind::SpaceViolation), 1);
    }

    #[test]
    fn isolated_space_cannot_be_embedded() {
        let mut registry = SpaceRegistry::new();
        let mut a = space("A", SpaceKind::Shared);
        a.embeds.push(embed("b", "B", 4));
        registry.register(a);
        registry.register(space("B", SpaceKind::Isolated));
        let diags = census(&registry, &[]);
        assert_eq!(diags.count_of(DiagKind::SpaceViolation), 1);
    }

    #[test]
    fn isolated_ops_unreachable_from_other_space_bodies() {
        let mut registry = SpaceRegistry::new();
        let mut vault = space("Vault", SpaceKind::Isolated);
        vault.transforms.push(op("deposit", false, mutate_row("Vault"), 3));
        registry.register(vault);
        registry.register(space("Lobby", SpaceKind::Shared));
        let events = vec![SpaceEvent::OpInvoked {
            space: "Vault".to_string(),
            op: "deposit".to_string(),
            origin: CallOrigin::SpaceBody {
                space: "Lobby".to_string(),
                in_transform: true,
            },
            span: at(12),
        }];
        let diags = census(&registry, &events);
        assert_eq!(diags.count_of(DiagKind::SpaceViolation), 1);
    }

    #[test]
    fn functions_may_drive_isolated_spaces() {
        let mut registry = SpaceRegistry::new();
        let mut vault = space("Vault", SpaceKind::Isolated);
        vault.transforms.push(op("deposit", false, mutate_row("Vault"), 3));
        registry.register(vault);
        let events = vec![SpaceEvent::OpInvoked {
            space: "Vault".to_string(),
            op: "deposit".to_string(),
            origin: CallOrigin::Function,
            span: at(12),
        }];
        let diags = census(&registry, &events);
        assert!(diags.is_empty(), "got: {:?}", diags);
    }

    #[test]
    fn isolated_transform_cannot_be_captured_elsewhere() {
        let mut registry = SpaceRegistry::new();
        let mut vault = space("Vault", SpaceKind::Isolated);
        vault.transforms.push(op("deposit", false, mutate_row("Vault"), 3));
        registry.register(vault);
        registry.register(space("Lobby", SpaceKind::Shared));
        let events = vec![SpaceEvent::TransformRef {
            space: "Vault".to_string(),
            op: "deposit".to_string(),
            origin: CallOrigin::SpaceBody {
                space: "Lobby".to_string(),
                in_transform: false,
            },
            span: at(9),
        }];
        let diags = census(&registry, &events);
        assert_eq!(diags.count_of(DiagKind::SpaceViolation), 1);
    }

    #[test]
    fn transform_reentry_is_flagged() {
        let mut registry = SpaceRegistry::new();
        let mut counter = space("Counter", SpaceKind::Isolated);
        counter.transforms.push(op("increment", false, mutate_row("Counter"), 3));
        counter.transforms.push(op("reset", false, mutate_row("Counter"), 5));
        registry.register(counter);
        let events = vec![SpaceEvent::OpInvoked {
            space: "Counter".to_string(),
            op: "increment".to_string(),
            origin: CallOrigin::SpaceBody {
                space: "Counter".to_string(),
                in_transform: true,
            },
            span: at(6),
        }];
        let diags = census(&registry, &events);
        assert_eq!(diags.count_of(DiagKind::SpaceViolation), 1);
    }

    #[test]
    fn transform_may_call_own_views() {
        let mut registry = SpaceRegistry::new();
        let mut counter = space("Counter", SpaceKind::Isolated);
        counter.transforms.push(op("increment", false, mutate_row("Counter"), 3));
        counter.views.push(op("current", false, EffectRow::pure(), 4));
        registry.register(counter);
        let events = vec![SpaceEvent::OpInvoked {
            space: "Counter".to_string(),
            op: "current".to_string(),
            origin: CallOrigin::SpaceBody {
                space: "Counter".to_string(),
                in_transform: true,
            },
            span: at(6),
        }];
        let diags = census(&registry, &events);
        assert!(diags.is_empty(), "got: {:?}", diags);
    }

    #[test]
    fn shared_external_call_requires_concurrent_tag() {
        let mut registry = SpaceRegistry::new();
        let mut board = space("Board", SpaceKind::Shared);
        board.transforms.push(op("post", false, mutate_row("Board"), 3));
        registry.register(board);
        let events = vec![SpaceEvent::OpInvoked {
            space: "Board".to_string(),
            op: "post".to_string(),
            origin: CallOrigin::Function,
            span: at(20),
        }];
        let diags = census(&registry, &events);
        assert_eq!(diags.count_of(DiagKind::SpaceViolation), 1);
        let diag = diags.iter().next().unwrap();
        assert!(diag.suggestion.as_deref().unwrap_or("").contains("concurrent"));
    }

    #[test]
    fn concurrent_tag_quiets_the_census() {
        let mut registry = SpaceRegistry::new();
        let mut board = space("Board", SpaceKind::Shared);
        board.transforms.push(op("post", true, mutate_row("Board"), 3));
        registry.register(board);
        let events = vec![
            SpaceEvent::OpInvoked {
                space: "Board".to_string(),
                op: "post".to_string(),
                origin: CallOrigin::Function,
                span: at(20),
            },
            SpaceEvent::OpInvoked {
                space: "Board".to_string(),
                op: "post".to_string(),
                origin: CallOrigin::Function,
                span: at(24),
            },
            SpaceEvent::TransformRef {
                space: "Board".to_string(),
                op: "post".to_string(),
                origin: CallOrigin::Function,
                span: at(30),
            },
        ];
        let diags = census(&registry, &events);
        assert!(diags.is_empty(), "got: {:?}", diags);
    }

    #[test]
    fn multiple_sites_need_the_tag_even_inside_the_space() {
        let mut registry = SpaceRegistry::new();
        let mut board = space("Board", SpaceKind::Shared);
        board.transforms.push(op("post", false, mutate_row("Board"), 3));
        registry.register(board);
        let origin = CallOrigin::SpaceBody {
            space: "Board".to_string(),
            in_transform: false,
        };
        let events = vec![
            SpaceEvent::OpInvoked {
                space: "Board".to_string(),
                op: "post".to_string(),
                origin: origin.clone(),
                span: at(8),
            },
            SpaceEvent::OpInvoked {
                space: "Board".to_string(),
                op: "post".to_string(),
                origin,
                span: at(9),
            },
        ];
        let diags = census(&registry, &events);
        // One for the site count; the internal origins are not external.
        assert_eq!(diags.count_of(DiagKind::SpaceViolation), 1);
    }

    #[test]
    fn first_class_reference_counts_as_racing() {
        let mut registry = SpaceRegistry::new();
        let mut board = space("Board", SpaceKind::Distributed);
        board.transforms.push(op("post", false, mutate_row("Board"), 3));
        registry.register(board);
        let events = vec![SpaceEvent::TransformRef {
            space: "Board".to_string(),
            op: "post".to_string(),
            origin: CallOrigin::Function,
            span: at(15),
        }];
        let diags = census(&registry, &events);
        assert_eq!(diags.count_of(DiagKind::SpaceViolation), 1);
    }

    #[test]
    fn view_with_mutate_row_is_rejected() {
        let mut registry = SpaceRegistry::new();
        let mut counter = space("Counter", SpaceKind::Isolated);
        counter.views.push(op("current", false, mutate_row("Counter"), 4));
        registry.register(counter);
        let diags = census(&registry, &[]);
        assert_eq!(diags.count_of(DiagKind::SpaceViolation), 1);
    }

    #[test]
    fn distributed_is_checked_like_shared() {
        let mut registry = SpaceRegistry::new();
        let mut ledger = space("Ledger", SpaceKind::Distributed);
        ledger.transforms.push(op("append", false, mutate_row("Ledger"), 3));
        registry.register(ledger);
        let events = vec![SpaceEvent::OpInvoked {
            space: "Ledger".to_string(),
            op: "append".to_string(),
            origin: CallOrigin::Function,
            span: at(11),
        }];
        let diags = census(&registry, &events);
        assert_eq!(diags.count_of(DiagKind::SpaceViolation), 1);
    }
}
