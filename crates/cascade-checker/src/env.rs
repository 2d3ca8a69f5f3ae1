//! Lexical environment for the checker: a stack of scopes tracking
//! bindings, mutability, and the enclosing space context.

use std::collections::HashMap;

use crate::ty::Type;

/// What kind of construct opened the scope. Capability checks walk the
/// stack, so a lambda nested in a transform still mutates state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    /// Top-level declarations.
    Module,
    /// A free function body.
    Function,
    /// A space transform body.
    Transform,
    /// A space view body.
    View,
    /// A space invariant condition.
    Invariant,
    /// A state field initializer.
    StateInit,
    /// A block expression.
    Block,
    /// A lambda body.
    Lambda,
}

/// How a name was introduced. Assignability is derived from this plus
/// the enclosing scope kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingKind {
    /// `let` binding, immutable.
    Let,
    /// `var` binding, assignable.
    Var,
    /// Function, transform, or lambda parameter.
    Param,
    /// Space state field, assignable only inside a transform.
    State,
    /// Space embed field, never assignable.
    Embed,
}

#[derive(Debug, Clone)]
pub struct Binding {
    pub ty: Type,
    pub kind: BindingKind,
}

#[derive(Debug)]
struct Scope {
    kind: ScopeKind,
    /// Name of the space whose body this scope belongs to, if any.
    space: Option<String>,
    bindings: HashMap<String, Binding>,
}

/// The scope stack. The root module scope is always present.
#[derive(Debug)]
pub struct TypeEnv {
    scopes: Vec<Scope>,
}

impl TypeEnv {
    pub fn new() -> Self {
        TypeEnv {
            scopes: vec![Scope {
                kind: ScopeKind::Module,
                space: None,
                bindings: HashMap::new(),
            }],
        }
    }

    pub fn push_scope(&mut self, kind: ScopeKind) {
        let space = self.current_space().map(str::to_string);
        self.scopes.push(Scope {
            kind,
            space,
            bindings: HashMap::new(),
        });
    }

    /// Push a scope that roots a space body. Inner scopes inherit the
    /// space name through `push_scope`.
    pub fn push_space_scope(&mut self, kind: ScopeKind, space: &str) {
        self.scopes.push(Scope {
            kind,
            space: Some(space.to_string()),
            bindings: HashMap::new(),
        });
    }

    pub fn pop_scope(&mut self) {
        // The root module scope is never popped.
        if self.scopes.len() > 1 {
            self.scopes.pop();
        }
    }

    /// Define a name in the current scope. Returns `false` if the name
    /// is already defined there.
    pub fn define(&mut self, name: &str, ty: Type, kind: BindingKind) -> bool {
        let scope = self.scopes.last_mut().expect("no scope");
        if scope.bindings.contains_key(name) {
            return false;
        }
        scope.bindings.insert(name.to_string(), Binding { ty, kind });
        true
    }

    /// Look a name up through the scope stack, innermost first.
    pub fn lookup(&self, name: &str) -> Option<&Binding> {
        self.scopes
            .iter()
            .rev()
            .find_map(|scope| scope.bindings.get(name))
    }

    pub fn defined_in_current_scope(&self, name: &str) -> bool {
        self.scopes
            .last()
            .map(|scope| scope.bindings.contains_key(name))
            .unwrap_or(false)
    }

    /// Are we anywhere inside a transform body?
    pub fn in_transform(&self) -> bool {
        self.scopes.iter().any(|s| s.kind == ScopeKind::Transform)
    }

    /// Are we anywhere inside a view body?
    pub fn in_view(&self) -> bool {
        self.scopes.iter().any(|s| s.kind == ScopeKind::View)
    }

    /// Are we anywhere inside an invariant condition or a state field
    /// initializer?
    pub fn in_pure_space_context(&self) -> bool {
        self.scopes
            .iter()
            .any(|s| matches!(s.kind, ScopeKind::Invariant | ScopeKind::StateInit))
    }

    /// Are we anywhere inside a state field initializer?
    pub fn in_state_init(&self) -> bool {
        self.scopes.iter().any(|s| s.kind == ScopeKind::StateInit)
    }

    /// The space whose body encloses the current position, if any.
    pub fn current_space(&self) -> Option<&str> {
        self.scopes
            .iter()
            .rev()
            .find_map(|s| s.space.as_deref())
    }
}

impl Default for TypeEnv {
    fn default() -> Self {
        TypeEnv::new()
    }
}
