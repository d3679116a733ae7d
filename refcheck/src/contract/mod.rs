//! Contract model and registry
//!
//! The loader turns raw annotation text into the types below. Once built,
//! the registry is shared read-only by every verification worker.

mod loader;

pub use loader::{load_units, parse_ghost, LoadOutcome};

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use thiserror::Error;

use crate::ast::{simple_name, Location, MethodKind, Span, TypeRef};
use crate::predicate::Predicate;

/// Result type alias for loading
pub type LoadResult<T> = std::result::Result<T, LoadError>;

/// Where a load error was found
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeclContext {
    pub file: String,
    /// Owning declaration, e.g. `LightBulb.turnOn`
    pub decl: String,
    pub loc: Location,
}

/// Contract loading error
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LoadError {
    #[error("unknown state `{state}` for type `{ty}`")]
    UnknownState {
        state: String,
        ty: String,
        ctx: DeclContext,
    },

    #[error("ghost `{ghost}` {reason}")]
    UnknownGhost {
        ghost: String,
        reason: String,
        ctx: DeclContext,
    },

    #[error("alias `{alias}` {reason}")]
    UnresolvedAlias {
        alias: String,
        reason: String,
        ctx: DeclContext,
    },

    #[error("retrofit target `{target}` does not resolve to a known type")]
    UnresolvedRetrofitTarget { target: String, ctx: DeclContext },

    #[error("malformed predicate: {message}")]
    MalformedPredicate {
        message: String,
        /// The annotation text the span points into
        text: String,
        span: Span,
        ctx: DeclContext,
    },

    #[error("ghost `{ghost}` of `{ty}` is not initialised by {ctor}")]
    UninitializedGhost {
        ghost: String,
        ty: String,
        /// `any constructor`, or the constructor missing the initialisation
        ctor: String,
        ctx: DeclContext,
    },
}

impl LoadError {
    pub fn malformed(text: &str, message: impl Into<String>, span: Span) -> Self {
        Self::MalformedPredicate {
            message: message.into(),
            text: text.to_string(),
            span,
            ctx: DeclContext::default(),
        }
    }

    pub fn unknown_state(state: &str, ty: &str) -> Self {
        Self::UnknownState {
            state: state.to_string(),
            ty: ty.to_string(),
            ctx: DeclContext::default(),
        }
    }

    pub fn unknown_ghost(ghost: &str, reason: impl Into<String>) -> Self {
        Self::UnknownGhost {
            ghost: ghost.to_string(),
            reason: reason.into(),
            ctx: DeclContext::default(),
        }
    }

    pub fn unresolved_alias(alias: &str, reason: impl Into<String>) -> Self {
        Self::UnresolvedAlias {
            alias: alias.to_string(),
            reason: reason.into(),
            ctx: DeclContext::default(),
        }
    }

    fn ctx_mut(&mut self) -> &mut DeclContext {
        match self {
            Self::UnknownState { ctx, .. }
            | Self::UnknownGhost { ctx, .. }
            | Self::UnresolvedAlias { ctx, .. }
            | Self::UnresolvedRetrofitTarget { ctx, .. }
            | Self::MalformedPredicate { ctx, .. }
            | Self::UninitializedGhost { ctx, .. } => ctx,
        }
    }

    pub fn context(&self) -> &DeclContext {
        match self {
            Self::UnknownState { ctx, .. }
            | Self::UnknownGhost { ctx, .. }
            | Self::UnresolvedAlias { ctx, .. }
            | Self::UnresolvedRetrofitTarget { ctx, .. }
            | Self::MalformedPredicate { ctx, .. }
            | Self::UninitializedGhost { ctx, .. } => ctx,
        }
    }

    /// Attach the owning declaration; fields already set are kept
    pub fn in_decl(mut self, file: &str, decl: &str, loc: Location) -> Self {
        let ctx = self.ctx_mut();
        if ctx.file.is_empty() {
            ctx.file = file.to_string();
        }
        if ctx.decl.is_empty() {
            ctx.decl = decl.to_string();
        }
        if !ctx.loc.is_known() {
            ctx.loc = loc;
        }
        self
    }

    /// Variant name, as it appears in reports
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::UnknownState { .. } => "UnknownState",
            Self::UnknownGhost { .. } => "UnknownGhost",
            Self::UnresolvedAlias { .. } => "UnresolvedAlias",
            Self::UnresolvedRetrofitTarget { .. } => "UnresolvedRetrofitTarget",
            Self::MalformedPredicate { .. } => "MalformedPredicate",
            Self::UninitializedGhost { .. } => "UninitializedGhost",
        }
    }

    /// Render the error, with an annotation snippet for malformed predicates
    pub fn render(&self) -> String {
        use ariadne::{Color, Config, Label, Report, ReportKind, Source};

        let Self::MalformedPredicate {
            message, text, span, ctx,
        } = self
        else {
            return self.to_string();
        };

        let name = if ctx.decl.is_empty() { "annotation" } else { ctx.decl.as_str() };
        let range = span.start.min(text.len())..span.end.min(text.len());
        let mut out = Vec::new();
        let written = Report::build(ReportKind::Error, (name, range.clone()))
            .with_config(Config::default().with_color(false))
            .with_message("malformed predicate")
            .with_label(
                Label::new((name, range))
                    .with_message(message)
                    .with_color(Color::Red),
            )
            .finish()
            .write((name, Source::from(text.as_str())), &mut out);
        match written {
            Ok(()) => String::from_utf8_lossy(&out).into_owned(),
            Err(_) => self.to_string(),
        }
    }
}

/// Maps names appearing in annotations to fully-qualified type names
pub trait TypeResolver {
    fn resolve(&self, name: &str) -> Option<String>;
}

/// Resolver over the types the front end reported
#[derive(Debug, Clone, Default)]
pub struct KnownTypes {
    names: BTreeSet<String>,
}

impl KnownTypes {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
        }
    }

    /// Every external and locally declared type of the given units
    pub fn from_units(units: &[crate::ast::CompilationUnit]) -> Self {
        let mut names = BTreeSet::new();
        for unit in units {
            names.extend(unit.external_types.iter().cloned());
            names.extend(unit.types.iter().map(|t| t.name.clone()));
        }
        Self { names }
    }
}

impl TypeResolver for KnownTypes {
    fn resolve(&self, name: &str) -> Option<String> {
        if self.names.contains(name) {
            return Some(name.to_string());
        }
        unique_by_simple_name(self.names.iter(), name, String::as_str).cloned()
    }
}

fn unique_by_simple_name<'a, T, I, F>(items: I, name: &str, key: F) -> Option<&'a T>
where
    I: Iterator<Item = &'a T>,
    F: Fn(&T) -> &str,
    T: ?Sized + 'a,
{
    let wanted = simple_name(name);
    let mut matches = items.filter(|item| simple_name(key(*item)) == wanted);
    let first = matches.next()?;
    match matches.next() {
        Some(_) => None,
        None => Some(first),
    }
}

/// Ordered named states of one type
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct StateSet {
    states: Vec<String>,
}

impl StateSet {
    pub fn new<I, S>(states: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut seen = BTreeSet::new();
        let states = states
            .into_iter()
            .map(Into::into)
            .filter(|s: &String| seen.insert(s.clone()))
            .collect();
        Self { states }
    }

    pub fn contains(&self, state: &str) -> bool {
        self.states.iter().any(|s| s == state)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.states.iter().map(String::as_str)
    }

    pub fn all(&self) -> BTreeSet<String> {
        self.states.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

/// Shadow value attached to every instance of a type
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GhostVar {
    pub name: String,
    pub sort: TypeRef,
    /// 0 reads the receiver implicitly, 1 takes the object as argument
    pub arity: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParamContract {
    pub name: String,
    pub ty: TypeRef,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refinement: Option<Predicate>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldContract {
    pub name: String,
    pub ty: TypeRef,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refinement: Option<Predicate>,
    pub is_static: bool,
}

/// Contract of a method, static method or constructor
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MethodContract {
    /// Fully-qualified owning type
    pub owner: String,
    pub name: String,
    pub kind: MethodKind,
    pub params: Vec<ParamContract>,
    pub ret_ty: TypeRef,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ret_refinement: Option<Predicate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<Predicate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<Predicate>,
    /// Refinements of local variables declared in the body
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub locals: BTreeMap<String, Predicate>,
    pub loc: Location,
}

impl MethodContract {
    /// `Owner.name` with the simple owner name
    pub fn display_name(&self) -> String {
        format!("{}.{}", simple_name(&self.owner), self.name)
    }

    /// Key used for exclusion
    pub fn decl_id(&self) -> String {
        match self.kind {
            MethodKind::Constructor => constructor_id(&self.owner),
            MethodKind::Method | MethodKind::Static => method_id(&self.owner, &self.name),
        }
    }

    pub fn has_receiver(&self) -> bool {
        self.kind != MethodKind::Static
    }
}

pub fn method_id(owner: &str, name: &str) -> String {
    format!("{owner}.{name}")
}

pub fn constructor_id(owner: &str) -> String {
    format!("{owner}.<init>")
}

/// Everything known about one type
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TypeContracts {
    pub name: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub type_params: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub states: Option<StateSet>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub ghosts: BTreeMap<String, GhostVar>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, FieldContract>,
    pub methods: Vec<MethodContract>,
    pub constructors: Vec<MethodContract>,
    pub is_retrofit: bool,
}

impl TypeContracts {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_params: Vec::new(),
            states: None,
            ghosts: BTreeMap::new(),
            fields: BTreeMap::new(),
            methods: Vec::new(),
            constructors: Vec::new(),
            is_retrofit: false,
        }
    }

    pub fn has_state(&self, state: &str) -> bool {
        self.states.as_ref().is_some_and(|s| s.contains(state))
    }

    pub fn method(&self, name: &str, arity: usize) -> Option<&MethodContract> {
        self.methods
            .iter()
            .find(|m| m.name == name && m.params.len() == arity)
    }

    pub fn constructor(&self, arity: usize) -> Option<&MethodContract> {
        self.constructors.iter().find(|m| m.params.len() == arity)
    }
}

/// All loaded contracts, keyed by fully-qualified type name
#[derive(Debug, Clone, Default, Serialize)]
pub struct ContractRegistry {
    types: BTreeMap<String, TypeContracts>,
    excluded: BTreeSet<String>,
}

impl ContractRegistry {
    pub(crate) fn from_parts(
        types: BTreeMap<String, TypeContracts>,
        excluded: BTreeSet<String>,
    ) -> Self {
        Self { types, excluded }
    }

    /// Exact name first, then a unique simple-name match
    pub fn type_contracts(&self, name: &str) -> Option<&TypeContracts> {
        if let Some(found) = self.types.get(name) {
            return Some(found);
        }
        unique_by_simple_name(self.types.values(), name, |t| t.name.as_str())
    }

    pub fn method(&self, ty: &str, name: &str, arity: usize) -> Option<&MethodContract> {
        self.type_contracts(ty)?.method(name, arity)
    }

    pub fn constructor(&self, ty: &str, arity: usize) -> Option<&MethodContract> {
        self.type_contracts(ty)?.constructor(arity)
    }

    pub fn field(&self, ty: &str, name: &str) -> Option<&FieldContract> {
        self.type_contracts(ty)?.fields.get(name)
    }

    /// True if `decl` (a type, `Type.method` or `Type.<init>`) failed to load
    pub fn is_excluded(&self, decl: &str) -> bool {
        self.excluded.contains(decl)
    }

    /// True if a call to `name` on `ty` must be skipped
    pub fn is_call_excluded(&self, ty: &str, name: Option<&str>) -> bool {
        let full = self
            .type_contracts(ty)
            .map(|t| t.name.clone())
            .unwrap_or_else(|| ty.to_string());
        let member = match name {
            Some(name) => method_id(&full, name),
            None => constructor_id(&full),
        };
        self.is_excluded(&full) || self.is_excluded(&member)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_set_dedups_and_keeps_order() {
        let set = StateSet::new(["on", "off", "on"]);
        assert_eq!(set.iter().collect::<Vec<_>>(), vec!["on", "off"]);
        assert_eq!(set.len(), 2);
        assert!(set.contains("off"));
        assert!(!set.contains("broken"));
    }

    #[test]
    fn test_known_types_simple_name_must_be_unique() {
        let known = KnownTypes::new(["java.net.Socket", "java.util.List", "java.awt.List"]);
        assert_eq!(known.resolve("Socket").as_deref(), Some("java.net.Socket"));
        assert_eq!(known.resolve("java.util.List").as_deref(), Some("java.util.List"));
        assert_eq!(known.resolve("List"), None);
        assert_eq!(known.resolve("Missing"), None);
    }

    #[test]
    fn test_registry_lookup_by_simple_name() {
        let mut types = BTreeMap::new();
        types.insert("java.net.Socket".to_string(), TypeContracts::new("java.net.Socket"));
        let mut excluded = BTreeSet::new();
        excluded.insert(method_id("java.net.Socket", "close"));
        let registry = ContractRegistry::from_parts(types, excluded);

        assert!(registry.type_contracts("Socket").is_some());
        assert!(registry.type_contracts("java.net.Socket").is_some());
        assert!(registry.is_call_excluded("Socket", Some("close")));
        assert!(!registry.is_call_excluded("Socket", Some("connect")));
        assert!(!registry.is_call_excluded("Socket", None));
    }

    #[test]
    fn test_error_context_is_filled_once() {
        let err = LoadError::unknown_state("of", "LightBulb")
            .in_decl("LightBulb.java", "LightBulb.turnOn", Location::new(8, 5))
            .in_decl("Other.java", "Other", Location::new(1, 1));
        assert_eq!(err.context().decl, "LightBulb.turnOn");
        assert_eq!(err.context().loc, Location::new(8, 5));
        assert_eq!(err.kind_name(), "UnknownState");
        assert_eq!(err.to_string(), "unknown state `of` for type `LightBulb`");
    }

    #[test]
    fn test_uninitialized_ghost_message() {
        let err = LoadError::UninitializedGhost {
            ghost: "size".to_string(),
            ty: "Stack".to_string(),
            ctor: "any constructor".to_string(),
            ctx: DeclContext::default(),
        };
        assert_eq!(
            err.to_string(),
            "ghost `size` of `Stack` is not initialised by any constructor"
        );
    }

    #[test]
    fn test_render_malformed_points_into_annotation() {
        let err = LoadError::malformed("x > @", "unexpected character", Span::new(4, 5))
            .in_decl("A.java", "A.m", Location::new(2, 3));
        let rendered = err.render();
        assert!(rendered.contains("malformed predicate"));
        assert!(rendered.contains("unexpected character"));
        assert!(rendered.contains("x > @"));
    }
}
