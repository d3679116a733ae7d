//! Front-end input surface
//!
//! A `CompilationUnit` is what the host-language front end produces for one
//! source file: the declared types with their raw annotation text, the
//! retrofit declarations for external types, and every method with its
//! resolved body.

mod expr;
mod span;
mod types;

pub use expr::*;
pub use span::*;
pub use types::*;

use serde::{Deserialize, Serialize};

/// One source file as seen by the front end
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompilationUnit {
    /// Host source path, used in diagnostics
    pub file: String,
    /// Fully-qualified names of external types visible to this unit
    #[serde(default)]
    pub external_types: Vec<String>,
    /// Unit-wide refinement aliases (`Name(int x) { body }`)
    #[serde(default)]
    pub aliases: Vec<Annotation>,
    #[serde(default)]
    pub types: Vec<TypeDecl>,
    #[serde(default)]
    pub retrofits: Vec<RetrofitDecl>,
    #[serde(default)]
    pub methods: Vec<MethodDecl>,
}

impl CompilationUnit {
    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}

/// Raw annotation text with the location of the annotation itself
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    pub text: String,
    #[serde(default)]
    pub loc: Location,
}

impl Annotation {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            loc: Location::default(),
        }
    }

    pub fn at(text: impl Into<String>, loc: Location) -> Self {
        Self {
            text: text.into(),
            loc,
        }
    }
}

/// A locally declared type
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TypeDecl {
    pub name: String,
    #[serde(default)]
    pub type_params: Vec<String>,
    #[serde(default)]
    pub state_set: Vec<String>,
    #[serde(default)]
    pub ghosts: Vec<GhostDecl>,
    #[serde(default)]
    pub aliases: Vec<Annotation>,
    #[serde(default)]
    pub fields: Vec<FieldDecl>,
    #[serde(default)]
    pub loc: Location,
}

/// Contracts attached out-of-band to an external type
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetrofitDecl {
    /// Fully-qualified external type name
    pub target: String,
    #[serde(default)]
    pub type_params: Vec<String>,
    #[serde(default)]
    pub state_set: Vec<String>,
    #[serde(default)]
    pub ghosts: Vec<GhostDecl>,
    #[serde(default)]
    pub fields: Vec<FieldDecl>,
    /// Method contracts; `owner` may be left empty and defaults to `target`
    #[serde(default)]
    pub methods: Vec<MethodDecl>,
    #[serde(default)]
    pub loc: Location,
}

/// Ghost variable declaration.
///
/// Accepts either the structured form `{"name": "size", "sort": "int"}` or
/// the raw annotation string `"int size"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GhostDecl {
    Structured {
        name: String,
        #[serde(default = "default_ghost_sort")]
        sort: TypeRef,
        #[serde(default = "default_ghost_arity")]
        arity: usize,
    },
    Raw(String),
}

fn default_ghost_sort() -> TypeRef {
    TypeRef::simple("int")
}

fn default_ghost_arity() -> usize {
    1
}

/// Field with an optional refinement on its value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDecl {
    pub name: String,
    pub ty: TypeRef,
    #[serde(default)]
    pub refinement: Option<Annotation>,
    #[serde(default, rename = "static")]
    pub is_static: bool,
    #[serde(default)]
    pub loc: Location,
}

/// Kind of a declared method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MethodKind {
    /// Instance method with a receiver
    #[default]
    Method,
    /// Static method, no receiver
    Static,
    Constructor,
}

/// Method, constructor or static method declaration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodDecl {
    /// Declaring type (local type name or retrofit target)
    #[serde(default)]
    pub owner: String,
    pub name: String,
    #[serde(default)]
    pub kind: MethodKind,
    #[serde(default)]
    pub params: Vec<ParamDecl>,
    #[serde(default = "TypeRef::void")]
    pub ret_ty: TypeRef,
    /// Refinement on the return value
    #[serde(default)]
    pub refinement: Option<Annotation>,
    #[serde(default)]
    pub state: Option<StateAnnotation>,
    /// Absent for retrofit declarations and abstract methods
    #[serde(default)]
    pub body: Option<Vec<Stmt>>,
    #[serde(default)]
    pub loc: Location,
}

impl MethodDecl {
    /// Display name `Owner.name`
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", simple_name(&self.owner), self.name)
    }
}

/// Method parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamDecl {
    pub name: String,
    pub ty: TypeRef,
    #[serde(default)]
    pub refinement: Option<Annotation>,
}

impl ParamDecl {
    pub fn new(name: &str, ty: &str) -> Self {
        Self {
            name: name.to_string(),
            ty: TypeRef::parse(ty).unwrap_or_else(|_| TypeRef::simple(ty)),
            refinement: None,
        }
    }

    pub fn refined(name: &str, ty: &str, refinement: &str) -> Self {
        Self {
            refinement: Some(Annotation::new(refinement)),
            ..Self::new(name, ty)
        }
    }
}

/// `from`/`to` state refinement
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateAnnotation {
    #[serde(default)]
    pub from: Option<Annotation>,
    #[serde(default)]
    pub to: Option<Annotation>,
}

impl StateAnnotation {
    pub fn new(from: Option<&str>, to: Option<&str>) -> Self {
        Self {
            from: from.map(Annotation::new),
            to: to.map(Annotation::new),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_defaults() {
        let unit = CompilationUnit::from_json(r#"{"file": "Empty.java"}"#).unwrap();
        assert_eq!(unit.file, "Empty.java");
        assert!(unit.types.is_empty());
        assert!(unit.methods.is_empty());
    }

    #[test]
    fn test_ghost_decl_forms() {
        let ghosts: Vec<GhostDecl> =
            serde_json::from_str(r#"["int count", {"name": "size"}]"#).unwrap();
        assert_eq!(ghosts[0], GhostDecl::Raw("int count".to_string()));
        assert_eq!(
            ghosts[1],
            GhostDecl::Structured {
                name: "size".to_string(),
                sort: TypeRef::simple("int"),
                arity: 1,
            }
        );
    }

    #[test]
    fn test_method_defaults() {
        let method: MethodDecl = serde_json::from_str(
            r#"{"owner": "LightBulb", "name": "turnOn", "state": {"from": {"text": "off(this)"}}}"#,
        )
        .unwrap();
        assert_eq!(method.kind, MethodKind::Method);
        assert_eq!(method.ret_ty, TypeRef::void());
        assert!(method.body.is_none());
        assert_eq!(method.state.as_ref().unwrap().from.as_ref().unwrap().text, "off(this)");
        assert_eq!(method.qualified_name(), "LightBulb.turnOn");
    }
}
