//! Host type references
//!
//! The front end resolves every declared type to a (possibly generic) name such
//! as `java.util.ArrayList<Integer>`. Only the value category matters to the
//! verifier: scalars flow into the solver, object references into the state
//! tracker.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A resolved type reference, e.g. `java.util.Stack<Integer>`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TypeRef {
    pub name: String,
    pub args: Vec<TypeRef>,
}

/// Value category of a host type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Int,
    Real,
    Bool,
    /// No value (`void`)
    Void,
    /// Object reference, tracked by the state tracker
    Object,
}

/// Type-parameter bindings of a generic instantiation (`E` -> `Integer`)
pub type TypeBindings = BTreeMap<String, TypeRef>;

impl TypeRef {
    pub fn simple(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
        }
    }

    pub fn generic(name: impl Into<String>, args: Vec<TypeRef>) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }

    pub fn void() -> Self {
        Self::simple("void")
    }

    /// Parse `a.b.C<D, E<F>>`
    pub fn parse(text: &str) -> Result<Self, String> {
        let mut chars = text.char_indices().peekable();
        let parsed = parse_type_ref(text, &mut chars)?;
        if let Some((i, _)) = chars.find(|(_, c)| !c.is_whitespace()) {
            return Err(format!("unexpected trailing input at offset {i} in type `{text}`"));
        }
        Ok(parsed)
    }

    /// Last segment of a qualified name (`java.net.Socket` -> `Socket`)
    pub fn simple_name(&self) -> &str {
        simple_name(&self.name)
    }

    /// Value category after applying type-parameter bindings
    pub fn value_kind(&self, bindings: &TypeBindings) -> ValueKind {
        if self.args.is_empty()
            && let Some(bound) = bindings.get(&self.name)
        {
            return bound.value_kind(&TypeBindings::new());
        }
        match self.simple_name() {
            "int" | "long" | "short" | "byte" | "char" | "Integer" | "Long" | "Short" | "Byte"
            | "Character" => ValueKind::Int,
            "double" | "float" | "Double" | "Float" => ValueKind::Real,
            "boolean" | "Boolean" => ValueKind::Bool,
            "void" | "Void" => ValueKind::Void,
            _ => ValueKind::Object,
        }
    }

    /// Bind `params` to this reference's type arguments positionally
    pub fn bindings_for(&self, params: &[String]) -> TypeBindings {
        params
            .iter()
            .cloned()
            .zip(self.args.iter().cloned())
            .collect()
    }
}

/// Last segment of a dotted name
pub fn simple_name(name: &str) -> &str {
    name.rsplit('.').next().unwrap_or(name)
}

fn parse_type_ref(
    text: &str,
    chars: &mut std::iter::Peekable<std::str::CharIndices<'_>>,
) -> Result<TypeRef, String> {
    while chars.next_if(|(_, c)| c.is_whitespace()).is_some() {}
    let mut name = String::new();
    while let Some((_, c)) = chars.next_if(|(_, c)| c.is_alphanumeric() || matches!(*c, '_' | '.' | '$')) {
        name.push(c);
    }
    if name.is_empty() {
        return Err(format!("expected a type name in `{text}`"));
    }
    while chars.next_if(|(_, c)| c.is_whitespace()).is_some() {}
    let mut args = Vec::new();
    if chars.next_if(|(_, c)| *c == '<').is_some() {
        // Diamond `<>`: the front end did not infer arguments
        if chars.next_if(|(_, c)| *c == '>').is_none() {
            loop {
                args.push(parse_type_ref(text, chars)?);
                while chars.next_if(|(_, c)| c.is_whitespace()).is_some() {}
                match chars.next() {
                    Some((_, ',')) => continue,
                    Some((_, '>')) => break,
                    _ => return Err(format!("unterminated type arguments in `{text}`")),
                }
            }
        }
    }
    // Array suffixes are opaque references
    while chars.next_if(|(_, c)| *c == '[').is_some() {
        if chars.next_if(|(_, c)| *c == ']').is_none() {
            return Err(format!("malformed array type in `{text}`"));
        }
        name.push_str("[]");
    }
    Ok(TypeRef { name, args })
}

impl TryFrom<String> for TypeRef {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        TypeRef::parse(&value)
    }
}

impl From<TypeRef> for String {
    fn from(value: TypeRef) -> Self {
        value.to_string()
    }
}

impl std::fmt::Display for TypeRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)?;
        if !self.args.is_empty() {
            write!(f, "<")?;
            for (i, arg) in self.args.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{arg}")?;
            }
            write!(f, ">")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple() {
        let t = TypeRef::parse("int").unwrap();
        assert_eq!(t, TypeRef::simple("int"));
        assert_eq!(t.value_kind(&TypeBindings::new()), ValueKind::Int);
    }

    #[test]
    fn test_parse_nested_generic() {
        let t = TypeRef::parse("java.util.Map<String, java.util.List<Integer>>").unwrap();
        assert_eq!(t.name, "java.util.Map");
        assert_eq!(t.args.len(), 2);
        assert_eq!(t.args[1].args[0], TypeRef::simple("Integer"));
        assert_eq!(t.to_string(), "java.util.Map<String, java.util.List<Integer>>");
    }

    #[test]
    fn test_parse_diamond_has_no_args() {
        let t = TypeRef::parse("Stack<>").unwrap();
        assert!(t.args.is_empty());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(TypeRef::parse("").is_err());
        assert!(TypeRef::parse("List<int").is_err());
        assert!(TypeRef::parse("a b").is_err());
    }

    #[test]
    fn test_simple_name() {
        assert_eq!(TypeRef::simple("java.net.Socket").simple_name(), "Socket");
        assert_eq!(simple_name("Socket"), "Socket");
    }

    #[test]
    fn test_value_kind_through_bindings() {
        let list = TypeRef::parse("java.util.ArrayList<Integer>").unwrap();
        let bindings = list.bindings_for(&["E".to_string()]);
        assert_eq!(TypeRef::simple("E").value_kind(&bindings), ValueKind::Int);
        assert_eq!(TypeRef::simple("E").value_kind(&TypeBindings::new()), ValueKind::Object);
        assert_eq!(TypeRef::simple("double").value_kind(&bindings), ValueKind::Real);
        assert_eq!(TypeRef::void().value_kind(&bindings), ValueKind::Void);
    }

    #[test]
    fn test_serde_as_string() {
        let t: TypeRef = serde_json::from_str("\"java.util.Stack<Integer>\"").unwrap();
        assert_eq!(t.args, vec![TypeRef::simple("Integer")]);
        assert_eq!(serde_json::to_string(&t).unwrap(), "\"java.util.Stack<Integer>\"");
    }
}
