//! Contract loader
//!
//! Loading runs in three passes over the compilation units:
//!
//! 1. type skeletons (state sets, ghosts, type parameters) are collected for
//!    local types and retrofit targets;
//! 2. aliases are parsed and validated, so recursive or malformed aliases are
//!    reported once at their definition;
//! 3. every field, method and constructor annotation is parsed and resolved
//!    against those skeletons.
//!
//! A failing declaration is excluded from the registry and recorded in
//! `LoadOutcome::errors`; everything else still loads.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, warn};

use crate::ast::{
    Annotation, CompilationUnit, FieldDecl, GhostDecl, Location, MethodDecl, MethodKind, Span,
    Spanned, Stmt, TypeRef, ValueKind,
};
use crate::lexer::{tokenize, Token};
use crate::predicate::{
    parse_alias, parse_predicate, respan, substitute_vars, AliasDef, Pred, PredExpr, Predicate,
};

use super::{
    constructor_id, method_id, ContractRegistry, FieldContract, GhostVar, LoadError, LoadResult,
    MethodContract, ParamContract, StateSet, TypeContracts, TypeResolver,
};

/// Result of loading a batch of compilation units
#[derive(Debug, Clone)]
pub struct LoadOutcome {
    pub registry: ContractRegistry,
    pub errors: Vec<LoadError>,
}

impl LoadOutcome {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Load and validate every contract declared in `units`
pub fn load_units(units: &[CompilationUnit], resolver: &dyn TypeResolver) -> LoadOutcome {
    let mut loader = Loader::default();
    loader.collect_types(units, resolver);
    loader.collect_aliases(units);
    loader.resolve_members(units);
    loader.check_ghost_initialisation();

    debug!(
        types = loader.types.len(),
        errors = loader.errors.len(),
        "contracts loaded"
    );
    LoadOutcome {
        registry: ContractRegistry::from_parts(loader.types, loader.excluded),
        errors: loader.errors,
    }
}

/// Parse the raw ghost declaration form `"int size"` (sort defaults to `int`)
pub fn parse_ghost(text: &str) -> LoadResult<GhostVar> {
    let tokens = tokenize(text)?;
    let (sort, name) = match tokens.as_slice() {
        [(Token::Ident(name), _)] => ("int".to_string(), name.clone()),
        [(Token::Ident(sort), _), (Token::Ident(name), _)] => (sort.clone(), name.clone()),
        [] => {
            return Err(LoadError::malformed(text, "empty ghost declaration", Span::new(0, 0)));
        }
        [.., (_, last)] => {
            let span = tokens[0].1.merge(*last);
            return Err(LoadError::malformed(
                text,
                "expected a ghost declaration of the form `sort name`",
                span,
            ));
        }
    };
    Ok(GhostVar {
        name,
        sort: TypeRef::simple(sort),
        arity: 1,
    })
}

/// A load failure together with the declaration it excludes
type Excludable<T> = Result<T, (LoadError, String)>;

/// Where a predicate is being resolved
struct Scope<'a> {
    owner: Option<&'a TypeContracts>,
    /// Variables the predicate may mention; `None` allows any local
    vars: Option<&'a [String]>,
    /// `from`/`to` predicates report unknown names as unknown states
    transition: bool,
}

#[derive(Default)]
struct Loader {
    aliases: BTreeMap<String, AliasDef>,
    /// Aliases that failed validation, with the reason
    broken: BTreeMap<String, String>,
    types: BTreeMap<String, TypeContracts>,
    /// Declaring file of each type
    files: BTreeMap<String, String>,
    excluded: BTreeSet<String>,
    errors: Vec<LoadError>,
}

impl Loader {
    fn fail(&mut self, error: LoadError, exclude: Option<String>) {
        warn!(kind = error.kind_name(), decl = %error.context().decl, "{error}");
        if let Some(decl) = exclude {
            self.excluded.insert(decl);
        }
        self.errors.push(error);
    }

    // ========================================================================
    // Aliases
    // ========================================================================

    fn collect_aliases(&mut self, units: &[CompilationUnit]) {
        let mut defined: Vec<(String, &Annotation, &str)> = Vec::new();
        for unit in units {
            let type_aliases = unit.types.iter().flat_map(|t| t.aliases.iter());
            for annotation in unit.aliases.iter().chain(type_aliases) {
                match parse_alias(&annotation.text) {
                    Ok(alias) => {
                        if self.aliases.contains_key(&alias.name) {
                            let err = LoadError::unresolved_alias(
                                &alias.name,
                                "is declared more than once",
                            )
                            .in_decl(&unit.file, &format!("alias {}", alias.name), annotation.loc);
                            self.fail(err, None);
                            continue;
                        }
                        defined.push((alias.name.clone(), annotation, unit.file.as_str()));
                        self.aliases.insert(alias.name.clone(), alias);
                    }
                    Err(err) => {
                        let err = err.in_decl(&unit.file, "alias", annotation.loc);
                        self.fail(err, None);
                    }
                }
            }
        }

        // Validate each body on its own so recursion is caught at the definition
        for (name, annotation, file) in defined {
            let Some(alias) = self.aliases.get(&name) else {
                continue;
            };
            let params: Vec<String> = alias.params.iter().map(|(_, p)| p.clone()).collect();
            let scope = Scope {
                owner: None,
                vars: Some(&params),
                transition: false,
            };
            let mut stack = vec![name.clone()];
            let checked = self.resolve(&alias.body, &scope, &annotation.text, &mut stack);
            if let Err(err) = checked {
                let reason = match &err {
                    LoadError::UnresolvedAlias { alias, .. } if *alias == name => {
                        "is recursive".to_string()
                    }
                    other => format!("is invalid: {other}"),
                };
                let err = err.in_decl(file, &format!("alias {name}"), annotation.loc);
                self.fail(err, None);
                self.broken.insert(name, reason);
            }
        }
        for name in self.broken.keys() {
            self.aliases.remove(name);
        }
    }

    // ========================================================================
    // Type skeletons
    // ========================================================================

    fn collect_types(&mut self, units: &[CompilationUnit], resolver: &dyn TypeResolver) {
        for unit in units {
            for decl in &unit.types {
                let mut ty = self
                    .types
                    .remove(&decl.name)
                    .unwrap_or_else(|| TypeContracts::new(&decl.name));
                ty.type_params = decl.type_params.clone();
                if !decl.state_set.is_empty() {
                    ty.states = Some(StateSet::new(decl.state_set.iter().cloned()));
                }
                self.add_ghosts(&mut ty, &decl.ghosts, &unit.file, decl.loc);
                self.files.insert(decl.name.clone(), unit.file.clone());
                self.types.insert(decl.name.clone(), ty);
            }

            for retrofit in &unit.retrofits {
                let Some(full) = resolver.resolve(&retrofit.target) else {
                    let err = LoadError::UnresolvedRetrofitTarget {
                        target: retrofit.target.clone(),
                        ctx: Default::default(),
                    }
                    .in_decl(&unit.file, &retrofit.target, retrofit.loc);
                    self.fail(err, Some(retrofit.target.clone()));
                    // Keep a placeholder so calls on the type find the exclusion
                    self.types
                        .entry(retrofit.target.clone())
                        .or_insert_with(|| TypeContracts::new(&retrofit.target));
                    continue;
                };
                let mut ty = self
                    .types
                    .remove(&full)
                    .unwrap_or_else(|| TypeContracts::new(&full));
                ty.is_retrofit = true;
                if !retrofit.type_params.is_empty() {
                    ty.type_params = retrofit.type_params.clone();
                }
                if !retrofit.state_set.is_empty() {
                    ty.states = Some(StateSet::new(retrofit.state_set.iter().cloned()));
                }
                self.add_ghosts(&mut ty, &retrofit.ghosts, &unit.file, retrofit.loc);
                self.files.insert(full.clone(), unit.file.clone());
                self.types.insert(full, ty);
            }

            // Owners that carry no type-level declarations still get an entry
            for method in &unit.methods {
                if self.owner_name(&method.owner).is_none() && !method.owner.is_empty() {
                    self.types
                        .insert(method.owner.clone(), TypeContracts::new(&method.owner));
                }
            }
        }
    }

    fn add_ghosts(&mut self, ty: &mut TypeContracts, decls: &[GhostDecl], file: &str, loc: Location) {
        for decl in decls {
            let parsed = match decl {
                GhostDecl::Raw(text) => parse_ghost(text),
                GhostDecl::Structured { name, sort, arity } => Ok(GhostVar {
                    name: name.clone(),
                    sort: sort.clone(),
                    arity: *arity,
                }),
            };
            let checked = parsed.and_then(|ghost| check_ghost(ty, ghost));
            match checked {
                Ok(ghost) => {
                    ty.ghosts.insert(ghost.name.clone(), ghost);
                }
                Err(err) => {
                    let err = err.in_decl(file, &ty.name, loc);
                    self.fail(err, Some(ty.name.clone()));
                }
            }
        }
    }

    /// Full name of a method owner; an empty owner never resolves
    fn owner_name(&self, owner: &str) -> Option<String> {
        if owner.is_empty() {
            return None;
        }
        if self.types.contains_key(owner) {
            return Some(owner.to_string());
        }
        let wanted = crate::ast::simple_name(owner);
        let mut matches = self
            .types
            .keys()
            .filter(|name| crate::ast::simple_name(name) == wanted);
        let first = matches.next()?;
        matches.next().is_none().then(|| first.clone())
    }

    // ========================================================================
    // Members
    // ========================================================================

    fn resolve_members(&mut self, units: &[CompilationUnit]) {
        let mut loaded: Vec<(String, Excludable<MethodContract>)> = Vec::new();
        let mut fields: Vec<(String, Excludable<FieldContract>)> = Vec::new();

        for unit in units {
            for decl in &unit.types {
                for field in &decl.fields {
                    fields.push((decl.name.clone(), self.load_field(&unit.file, &decl.name, field)));
                }
            }
            for retrofit in &unit.retrofits {
                let Some(owner) = self.owner_name(&retrofit.target) else {
                    continue;
                };
                if self.excluded.contains(&owner) {
                    continue;
                }
                for field in &retrofit.fields {
                    fields.push((owner.clone(), self.load_field(&unit.file, &owner, field)));
                }
                for method in &retrofit.methods {
                    let owner = if method.owner.is_empty() {
                        owner.clone()
                    } else {
                        self.owner_name(&method.owner).unwrap_or_else(|| owner.clone())
                    };
                    loaded.push((owner.clone(), self.load_method(&unit.file, &owner, method)));
                }
            }
            for method in &unit.methods {
                let Some(owner) = self.owner_name(&method.owner) else {
                    warn!(method = %method.name, file = %unit.file, "method without an owning type ignored");
                    continue;
                };
                loaded.push((owner.clone(), self.load_method(&unit.file, &owner, method)));
            }
        }

        for (owner, result) in fields {
            match result {
                Ok(field) => {
                    if let Some(ty) = self.types.get_mut(&owner) {
                        ty.fields.insert(field.name.clone(), field);
                    }
                }
                Err((err, decl_id)) => self.fail(err, Some(decl_id)),
            }
        }

        for (owner, result) in loaded {
            match result {
                Ok(contract) => {
                    let Some(ty) = self.types.get_mut(&owner) else {
                        continue;
                    };
                    match contract.kind {
                        MethodKind::Constructor => ty.constructors.push(contract),
                        MethodKind::Method | MethodKind::Static => ty.methods.push(contract),
                    }
                }
                Err((err, decl_id)) => self.fail(err, Some(decl_id)),
            }
        }
    }

    fn load_field(&self, file: &str, owner: &str, field: &FieldDecl) -> Excludable<FieldContract> {
        let decl = format!("{}.{}", crate::ast::simple_name(owner), field.name);
        let scope = Scope {
            owner: self.types.get(owner),
            vars: Some(&[]),
            transition: false,
        };
        let refinement = field
            .refinement
            .as_ref()
            .map(|a| self.load_predicate(a, &scope))
            .transpose()
            .map_err(|e| (e.in_decl(file, &decl, field.loc), method_id(owner, &field.name)))?;
        Ok(FieldContract {
            name: field.name.clone(),
            ty: field.ty.clone(),
            refinement,
            is_static: field.is_static,
        })
    }

    fn load_method(
        &self,
        file: &str,
        owner: &str,
        decl: &MethodDecl,
    ) -> Excludable<MethodContract> {
        let decl_id = match decl.kind {
            MethodKind::Constructor => constructor_id(owner),
            MethodKind::Method | MethodKind::Static => method_id(owner, &decl.name),
        };
        let display = format!("{}.{}", crate::ast::simple_name(owner), decl.name);
        let located = |err: LoadError, annotation: Option<&Annotation>| {
            let loc = match annotation {
                Some(a) if a.loc.is_known() => a.loc,
                _ => decl.loc,
            };
            (err.in_decl(file, &display, loc), decl_id.clone())
        };

        let owner_ty = self.types.get(owner);
        let names: Vec<String> = decl.params.iter().map(|p| p.name.clone()).collect();
        let scope = Scope {
            owner: owner_ty,
            vars: Some(&names),
            transition: false,
        };
        let transition = Scope {
            owner: owner_ty,
            vars: Some(&names),
            transition: true,
        };

        let mut params = Vec::with_capacity(decl.params.len());
        for param in &decl.params {
            let refinement = match &param.refinement {
                Some(a) => Some(self.load_predicate(a, &scope).map_err(|e| located(e, Some(a)))?),
                None => None,
            };
            params.push(ParamContract {
                name: param.name.clone(),
                ty: param.ty.clone(),
                refinement,
            });
        }

        let load_opt = |annotation: Option<&Annotation>, scope: &Scope| match annotation {
            Some(a) => self
                .load_predicate(a, scope)
                .map(Some)
                .map_err(|e| located(e, Some(a))),
            None => Ok(None),
        };
        let ret_refinement = load_opt(decl.refinement.as_ref(), &scope)?;
        let state = decl.state.as_ref();
        let from = load_opt(state.and_then(|s| s.from.as_ref()), &transition)?;
        let to = load_opt(state.and_then(|s| s.to.as_ref()), &transition)?;

        let mut locals = BTreeMap::new();
        if let Some(body) = &decl.body {
            let local_scope = Scope {
                owner: owner_ty,
                vars: None,
                transition: false,
            };
            let mut refined = Vec::new();
            collect_refined_locals(body, &mut refined);
            for (name, annotation) in refined {
                let predicate = self
                    .load_predicate(annotation, &local_scope)
                    .map_err(|e| located(e, Some(annotation)))?;
                locals.insert(name.to_string(), predicate);
            }
        }

        Ok(MethodContract {
            owner: owner.to_string(),
            name: decl.name.clone(),
            kind: decl.kind,
            params,
            ret_ty: decl.ret_ty.clone(),
            ret_refinement,
            from,
            to,
            locals,
            loc: decl.loc,
        })
    }

    fn load_predicate(&self, annotation: &Annotation, scope: &Scope) -> LoadResult<Predicate> {
        let text = annotation.text.as_str();
        let parsed = parse_predicate(text)?;
        let mut stack = Vec::new();
        let resolved = self.resolve(&parsed, scope, text, &mut stack)?;
        Ok(Predicate::new(text, resolved))
    }

    // ========================================================================
    // Name resolution
    // ========================================================================

    /// Turn every application into a state atom, ghost read or expanded alias
    fn resolve(
        &self,
        pred: &Pred,
        scope: &Scope,
        text: &str,
        stack: &mut Vec<String>,
    ) -> LoadResult<Pred> {
        stacker::maybe_grow(crate::STACK_RED_ZONE, crate::STACK_GROW_SIZE, || match &pred.node {
            PredExpr::Var(name) => {
                if let Some(vars) = scope.vars
                    && !vars.contains(name)
                {
                    return Err(LoadError::malformed(
                        text,
                        format!("unknown variable `{name}`"),
                        pred.span,
                    ));
                }
                Ok(pred.clone())
            }
            PredExpr::Positional(index) => match scope.vars.and_then(|v| v.get(*index)) {
                Some(name) => Ok(Spanned::new(PredExpr::Var(name.clone()), pred.span)),
                None => Err(LoadError::malformed(
                    text,
                    format!("positional reference `#{index}` does not name a parameter"),
                    pred.span,
                )),
            },
            PredExpr::App { name, args } => self.resolve_app(pred, name, args, scope, text, stack),
            other => {
                let mut failure = None;
                let node = other.map_children(|child| match self.resolve(child, scope, text, stack) {
                    Ok(resolved) => resolved,
                    Err(err) => {
                        failure.get_or_insert(err);
                        child.clone()
                    }
                });
                match failure {
                    Some(err) => Err(err),
                    None => Ok(Spanned::new(node, pred.span)),
                }
            }
        })
    }

    fn resolve_app(
        &self,
        pred: &Pred,
        name: &str,
        args: &[Pred],
        scope: &Scope,
        text: &str,
        stack: &mut Vec<String>,
    ) -> LoadResult<Pred> {
        let on_receiver = args.first().is_some_and(|a| targets_receiver(&a.node));

        if let Some(owner) = scope.owner {
            if owner.has_state(name) {
                return self.state_atom(pred, name, args, scope, text, stack);
            }
            if let Some(ghost) = owner.ghosts.get(name) {
                return self.ghost_read(pred, ghost, args, scope, text, stack);
            }
        }

        if let Some(alias) = self.aliases.get(name) {
            if stack.iter().any(|s| s == name) {
                return Err(LoadError::unresolved_alias(name, "is recursive"));
            }
            if alias.params.len() != args.len() {
                return Err(LoadError::unresolved_alias(
                    name,
                    format!(
                        "expects {} argument(s), found {}",
                        alias.params.len(),
                        args.len()
                    ),
                ));
            }
            let bindings: BTreeMap<String, Pred> = alias
                .params
                .iter()
                .map(|(_, p)| p.clone())
                .zip(args.iter().cloned())
                .collect();
            let body = respan(&alias.body, pred.span);
            let expanded = substitute_vars(&body, &bindings);
            stack.push(name.to_string());
            let resolved = self.resolve(&expanded, scope, text, stack);
            stack.pop();
            return resolved;
        }
        if let Some(reason) = self.broken.get(name) {
            return Err(LoadError::unresolved_alias(name, reason.clone()));
        }

        // States and ghosts of other types, read through a parameter
        if !on_receiver || scope.owner.is_none() {
            for ty in self.types.values() {
                if ty.has_state(name) {
                    return self.state_atom(pred, name, args, scope, text, stack);
                }
                if let Some(ghost) = ty.ghosts.get(name) {
                    return self.ghost_read(pred, ghost, args, scope, text, stack);
                }
            }
        }

        match scope.owner {
            Some(owner) if scope.transition && owner.states.is_some() => {
                Err(LoadError::unknown_state(name, &owner.name))
            }
            Some(owner) => Err(LoadError::unknown_ghost(
                name,
                format!("is not declared on `{}`", owner.name),
            )),
            None => Err(LoadError::unknown_ghost(name, "is not declared on any type")),
        }
    }

    fn state_atom(
        &self,
        pred: &Pred,
        name: &str,
        args: &[Pred],
        scope: &Scope,
        text: &str,
        stack: &mut Vec<String>,
    ) -> LoadResult<Pred> {
        let [target] = args else {
            return Err(LoadError::malformed(
                text,
                format!("state `{name}` takes exactly one argument"),
                pred.span,
            ));
        };
        let target = self.resolve(target, scope, text, stack)?;
        Ok(Spanned::new(
            PredExpr::State {
                name: name.to_string(),
                target: Box::new(target),
            },
            pred.span,
        ))
    }

    fn ghost_read(
        &self,
        pred: &Pred,
        ghost: &GhostVar,
        args: &[Pred],
        scope: &Scope,
        text: &str,
        stack: &mut Vec<String>,
    ) -> LoadResult<Pred> {
        if args.len() != ghost.arity {
            return Err(LoadError::unknown_ghost(
                &ghost.name,
                format!("expects {} argument(s), found {}", ghost.arity, args.len()),
            ));
        }
        let target = match args.first() {
            Some(arg) => self.resolve(arg, scope, text, stack)?,
            None => Spanned::new(PredExpr::This, pred.span),
        };
        Ok(Spanned::new(
            PredExpr::Ghost {
                name: ghost.name.clone(),
                target: Box::new(target),
            },
            pred.span,
        ))
    }

    // ========================================================================
    // Ghost initialisation
    // ========================================================================

    fn check_ghost_initialisation(&mut self) {
        let mut failures = Vec::new();
        for ty in self.types.values() {
            if ty.ghosts.is_empty() || self.excluded.contains(&ty.name) {
                continue;
            }
            if ty.constructors.is_empty() {
                for ghost in ty.ghosts.keys() {
                    failures.push((ty.name.clone(), ghost.clone(), None, Location::default()));
                }
                continue;
            }
            for ctor in &ty.constructors {
                let initialised = ctor
                    .to
                    .as_ref()
                    .map(Predicate::ghosts_on_this)
                    .unwrap_or_default();
                for ghost in ty.ghosts.keys() {
                    if !initialised.contains(ghost) {
                        failures.push((ty.name.clone(), ghost.clone(), Some(ctor.display_name()), ctor.loc));
                    }
                }
            }
        }

        for (ty, ghost, ctor, loc) in failures {
            let by = match &ctor {
                Some(name) => format!("constructor `{name}`"),
                None => "any constructor".to_string(),
            };
            let decl = ctor.unwrap_or_else(|| format!("{}.<init>", crate::ast::simple_name(&ty)));
            let err = LoadError::UninitializedGhost {
                ghost,
                ty: ty.clone(),
                ctor: by,
                ctx: Default::default(),
            }
            .in_decl(self.files.get(&ty).map_or("", String::as_str), &decl, loc);
            if let Some(contracts) = self.types.get_mut(&ty) {
                contracts.constructors.clear();
            }
            self.fail(err, Some(constructor_id(&ty)));
        }
    }
}

fn check_ghost(ty: &TypeContracts, ghost: GhostVar) -> LoadResult<GhostVar> {
    if ghost.arity > 1 {
        return Err(LoadError::unknown_ghost(
            &ghost.name,
            format!("has arity {}, only 0 or 1 is supported", ghost.arity),
        ));
    }
    let is_param = ty.type_params.contains(&ghost.sort.name);
    if !is_param && ghost.sort.value_kind(&Default::default()) == ValueKind::Object {
        return Err(LoadError::unknown_ghost(
            &ghost.name,
            format!("has non-scalar sort `{}`", ghost.sort),
        ));
    }
    Ok(ghost)
}

fn targets_receiver(expr: &PredExpr) -> bool {
    match expr {
        PredExpr::This => true,
        PredExpr::Old(inner) => targets_receiver(&inner.node),
        _ => false,
    }
}

fn collect_refined_locals<'a>(body: &'a [Stmt], out: &mut Vec<(&'a str, &'a Annotation)>) {
    for stmt in body {
        match stmt {
            Stmt::Let {
                name,
                refinement: Some(annotation),
                ..
            } => out.push((name, annotation)),
            Stmt::If {
                then_branch,
                else_branch,
                ..
            } => {
                collect_refined_locals(then_branch, out);
                collect_refined_locals(else_branch, out);
            }
            Stmt::While { body, .. } => collect_refined_locals(body, out),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{ParamDecl, RetrofitDecl, StateAnnotation, TypeDecl};
    use crate::contract::KnownTypes;

    fn method(owner: &str, name: &str, kind: MethodKind) -> MethodDecl {
        MethodDecl {
            owner: owner.to_string(),
            name: name.to_string(),
            kind,
            params: Vec::new(),
            ret_ty: TypeRef::void(),
            refinement: None,
            state: None,
            body: None,
            loc: Location::new(1, 1),
        }
    }

    fn with_state(mut m: MethodDecl, from: Option<&str>, to: Option<&str>) -> MethodDecl {
        m.state = Some(StateAnnotation::new(from, to));
        m
    }

    fn light_bulb() -> CompilationUnit {
        CompilationUnit {
            file: "LightBulb.java".to_string(),
            types: vec![TypeDecl {
                name: "LightBulb".to_string(),
                state_set: vec!["on".to_string(), "off".to_string()],
                ..Default::default()
            }],
            methods: vec![
                with_state(method("LightBulb", "LightBulb", MethodKind::Constructor), None, Some("off(this)")),
                with_state(method("LightBulb", "turnOn", MethodKind::Method), Some("off(this)"), Some("on(this)")),
                with_state(method("LightBulb", "turnOff", MethodKind::Method), Some("on(this)"), Some("off(this)")),
            ],
            ..Default::default()
        }
    }

    fn load(units: &[CompilationUnit]) -> LoadOutcome {
        load_units(units, &KnownTypes::from_units(units))
    }

    #[test]
    fn test_load_state_machine() {
        let outcome = load(&[light_bulb()]);
        assert!(outcome.is_clean(), "{:?}", outcome.errors);
        let bulb = outcome.registry.type_contracts("LightBulb").unwrap();
        assert_eq!(bulb.states.as_ref().unwrap().len(), 2);
        let turn_on = outcome.registry.method("LightBulb", "turnOn", 0).unwrap();
        assert!(turn_on.from.as_ref().unwrap().mentions_state());
        assert_eq!(turn_on.to.as_ref().unwrap().to_string(), "on(this)");
        assert!(outcome.registry.constructor("LightBulb", 0).is_some());
    }

    #[test]
    fn test_unknown_state_excludes_only_that_method() {
        let mut unit = light_bulb();
        unit.methods.push(with_state(
            method("LightBulb", "blink", MethodKind::Method),
            Some("of(this)"),
            None,
        ));
        let outcome = load(&[unit]);
        assert_eq!(outcome.errors.len(), 1);
        assert!(matches!(outcome.errors[0], LoadError::UnknownState { ref state, .. } if state == "of"));
        assert_eq!(outcome.errors[0].context().decl, "LightBulb.blink");
        assert!(outcome.registry.is_excluded("LightBulb.blink"));
        assert!(outcome.registry.method("LightBulb", "turnOn", 0).is_some());
    }

    #[test]
    fn test_unknown_ghost() {
        let mut unit = light_bulb();
        let mut m = method("LightBulb", "brightness", MethodKind::Method);
        m.ret_ty = TypeRef::simple("int");
        m.refinement = Some(Annotation::new("_ <= watts(this)"));
        unit.methods.push(m);
        let outcome = load(&[unit]);
        assert!(matches!(
            &outcome.errors[..],
            [LoadError::UnknownGhost { ghost, .. }] if ghost == "watts"
        ));
    }

    fn stack_unit(ctor_to: Option<&str>) -> CompilationUnit {
        let mut push = method("Stack", "push", MethodKind::Method);
        push.params = vec![ParamDecl::new("x", "int")];
        let push = with_state(push, None, Some("size(this) == size(old(this)) + 1"));
        let mut methods = vec![push];
        if let Some(to) = ctor_to {
            methods.push(with_state(method("Stack", "Stack", MethodKind::Constructor), None, Some(to)));
        }
        CompilationUnit {
            file: "Stack.java".to_string(),
            types: vec![TypeDecl {
                name: "Stack".to_string(),
                ghosts: vec![GhostDecl::Raw("int size".to_string())],
                ..Default::default()
            }],
            methods,
            ..Default::default()
        }
    }

    #[test]
    fn test_ghost_update_resolves() {
        let outcome = load(&[stack_unit(Some("size(this) == 0"))]);
        assert!(outcome.is_clean(), "{:?}", outcome.errors);
        let push = outcome.registry.method("Stack", "push", 1).unwrap();
        let to = push.to.as_ref().unwrap();
        assert!(to.ghosts_on_this().contains("size"));
        assert!(!to.mentions_state());
    }

    #[test]
    fn test_uninitialized_ghost_without_constructor() {
        let outcome = load(&[stack_unit(None)]);
        assert!(matches!(
            &outcome.errors[..],
            [LoadError::UninitializedGhost { ghost, ctor, .. }] if ghost == "size" && ctor == "any constructor"
        ));
        assert!(outcome.registry.is_call_excluded("Stack", None));
        assert!(!outcome.registry.is_call_excluded("Stack", Some("push")));
    }

    #[test]
    fn test_uninitialized_ghost_with_silent_constructor() {
        let outcome = load(&[stack_unit(Some("true"))]);
        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(outcome.errors[0].kind_name(), "UninitializedGhost");
        assert!(outcome.registry.constructor("Stack", 0).is_none());
    }

    #[test]
    fn test_alias_expansion() {
        let mut unit = light_bulb();
        unit.aliases = vec![Annotation::new("Percent(int x) { 0 <= x && x <= 100 }")];
        let mut dim = method("LightBulb", "dim", MethodKind::Method);
        dim.params = vec![ParamDecl::refined("level", "int", "Percent(_)")];
        unit.methods.push(dim);
        let outcome = load(&[unit]);
        assert!(outcome.is_clean(), "{:?}", outcome.errors);
        let dim = outcome.registry.method("LightBulb", "dim", 1).unwrap();
        let refinement = dim.params[0].refinement.as_ref().unwrap();
        assert_eq!(refinement.to_string(), "0 <= _ && _ <= 100");
        assert_eq!(refinement.source, "Percent(_)");
    }

    #[test]
    fn test_recursive_alias_rejected() {
        let mut unit = light_bulb();
        unit.aliases = vec![Annotation::new("Loop(int x) { x > 0 && Loop(x) }")];
        let mut dim = method("LightBulb", "dim", MethodKind::Method);
        dim.params = vec![ParamDecl::refined("level", "int", "Loop(_)")];
        unit.methods.push(dim);
        let outcome = load(&[unit]);
        let kinds: Vec<_> = outcome.errors.iter().map(|e| e.kind_name()).collect();
        assert_eq!(kinds, vec!["UnresolvedAlias", "UnresolvedAlias"]);
        assert_eq!(outcome.errors[0].context().decl, "alias Loop");
        assert!(outcome.errors[1].to_string().contains("is recursive"));
        assert!(outcome.registry.is_excluded("LightBulb.dim"));
    }

    #[test]
    fn test_alias_arity_mismatch() {
        let mut unit = light_bulb();
        unit.aliases = vec![Annotation::new("Between(int x, int lo, int hi) { lo <= x && x <= hi }")];
        let mut dim = method("LightBulb", "dim", MethodKind::Method);
        dim.params = vec![ParamDecl::refined("level", "int", "Between(_, 0)")];
        unit.methods.push(dim);
        let outcome = load(&[unit]);
        assert!(outcome.errors[0].to_string().contains("expects 3 argument(s), found 2"));
    }

    #[test]
    fn test_unresolved_retrofit_target() {
        let unit = CompilationUnit {
            file: "Main.java".to_string(),
            retrofits: vec![RetrofitDecl {
                target: "java.net.Sockett".to_string(),
                state_set: vec!["unconnected".to_string()],
                ..Default::default()
            }],
            ..Default::default()
        };
        let outcome = load(&[unit]);
        assert_eq!(outcome.errors[0].kind_name(), "UnresolvedRetrofitTarget");
        assert!(outcome.registry.is_call_excluded("java.net.Sockett", Some("connect")));
    }

    #[test]
    fn test_retrofit_methods_default_owner() {
        let mut connect = with_state(method("", "connect", MethodKind::Method), Some("bound(this)"), Some("connected(this)"));
        connect.params = vec![ParamDecl::new("addr", "java.net.SocketAddress")];
        let unit = CompilationUnit {
            file: "Main.java".to_string(),
            external_types: vec!["java.net.Socket".to_string()],
            retrofits: vec![RetrofitDecl {
                target: "java.net.Socket".to_string(),
                state_set: ["unconnected", "bound", "connected", "closed"].map(String::from).to_vec(),
                methods: vec![connect],
                ..Default::default()
            }],
            ..Default::default()
        };
        let outcome = load(&[unit]);
        assert!(outcome.is_clean(), "{:?}", outcome.errors);
        let socket = outcome.registry.type_contracts("Socket").unwrap();
        assert!(socket.is_retrofit);
        assert_eq!(socket.methods[0].owner, "java.net.Socket");
    }

    #[test]
    fn test_positional_and_unknown_variables() {
        let mut unit = light_bulb();
        let mut set = method("LightBulb", "set", MethodKind::Method);
        set.params = vec![ParamDecl::new("a", "int"), ParamDecl::refined("b", "int", "_ > #0")];
        unit.methods.push(set);
        let mut bad = method("LightBulb", "bad", MethodKind::Method);
        bad.params = vec![ParamDecl::refined("a", "int", "_ > missing")];
        unit.methods.push(bad);
        let outcome = load(&[unit]);
        let set = outcome.registry.method("LightBulb", "set", 2).unwrap();
        assert_eq!(set.params[1].refinement.as_ref().unwrap().to_string(), "_ > a");
        assert!(matches!(
            &outcome.errors[..],
            [LoadError::MalformedPredicate { message, .. }] if message == "unknown variable `missing`"
        ));
    }

    #[test]
    fn test_malformed_predicate_keeps_annotation_location() {
        let mut unit = light_bulb();
        let mut m = method("LightBulb", "m", MethodKind::Method);
        m.refinement = Some(Annotation::at("_ >", Location::new(9, 14)));
        unit.methods.push(m);
        let outcome = load(&[unit]);
        let ctx = outcome.errors[0].context();
        assert_eq!(ctx.loc, Location::new(9, 14));
        assert_eq!(ctx.file, "LightBulb.java");
    }

    #[test]
    fn test_local_refinements_loaded() {
        let mut unit = light_bulb();
        let mut m = method("LightBulb", "run", MethodKind::Method);
        m.body = Some(vec![Stmt::Let {
            name: "n".to_string(),
            ty: TypeRef::simple("int"),
            init: None,
            refinement: Some(Annotation::new("_ >= 0")),
            loc: Location::new(3, 5),
        }]);
        unit.methods.push(m);
        let outcome = load(&[unit]);
        let run = outcome.registry.method("LightBulb", "run", 0).unwrap();
        assert_eq!(run.locals["n"].to_string(), "_ >= 0");
    }

    #[test]
    fn test_parse_ghost_forms() {
        assert_eq!(parse_ghost("int size").unwrap().sort, TypeRef::simple("int"));
        assert_eq!(parse_ghost_name("count"), "count");
        assert!(parse_ghost("").is_err());
        assert!(parse_ghost("int size extra").is_err());
    }

    fn parse_ghost_name(text: &str) -> String {
        parse_ghost(text).unwrap().name
    }
}
