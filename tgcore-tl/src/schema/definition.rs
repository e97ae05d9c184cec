use std::fmt;
use std::str::FromStr;

use super::{Category, Flag, Parameter, ParameterType, SchemaError, Type, crc32};

/// One constructor or function line of a schema.
///
/// `user#12345 id:long first_name:string = User` becomes a definition with
/// `name = "user"`, `id = 0x12345`, two params and `ty = User`.
#[derive(Clone, Debug, PartialEq)]
pub struct Definition {
    /// Namespace parts; empty in the global namespace.
    pub namespace: Vec<String>,
    /// The unqualified name.
    pub name: String,
    /// Explicit `#id`, or the CRC32 of the normalized definition text.
    pub id: u32,
    /// Ordered parameters, `{X:Type}` declarations excluded.
    pub params: Vec<Parameter>,
    /// Result type (constructors) or return type (functions).
    pub ty: Type,
    pub category: Category,
}

impl Definition {
    pub fn full_name(&self) -> String {
        let mut s = String::new();
        for ns in &self.namespace {
            s.push_str(ns);
            s.push('.');
        }
        s.push_str(&self.name);
        s
    }
}

/// CRC32 id of a definition written without `#id`.
///
/// Braces around generic declarations are dropped and runs of whitespace
/// collapse to a single space before hashing.
fn derive_id(raw: &str) -> u32 {
    let stripped: String = raw.chars().filter(|c| !matches!(c, '{' | '}' | ';')).collect();
    let normalized = stripped.split_whitespace().collect::<Vec<_>>().join(" ");
    crc32(normalized.as_bytes())
}

impl fmt::Display for Definition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{:08x}", self.full_name(), self.id)?;
        for p in &self.params {
            write!(f, " {p}")?;
        }
        write!(f, " = {}", self.ty)
    }
}

impl FromStr for Definition {
    type Err = SchemaError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let raw = raw.trim().trim_end_matches(';').trim();
        if raw.is_empty() {
            return Err(SchemaError::Empty);
        }

        let (lhs, result) = raw.split_once('=').ok_or(SchemaError::MissingType)?;
        if result.trim().is_empty() {
            return Err(SchemaError::MissingType);
        }
        let mut ty = Type::parse(result)?;

        let mut tokens = lhs.split_whitespace();
        let head = tokens.next().ok_or_else(|| SchemaError::BadName(String::new()))?;
        let (full_name, explicit_id) = match head.split_once('#') {
            Some((name, id)) => (name, Some(id)),
            None => (head, None),
        };
        let mut path: Vec<String> = full_name.split('.').map(String::from).collect();
        let name = path.pop().unwrap_or_default();
        if name.is_empty() || path.iter().any(String::is_empty) {
            return Err(SchemaError::BadName(full_name.to_owned()));
        }

        let id = match explicit_id {
            Some(hex) => u32::from_str_radix(hex, 16).map_err(SchemaError::BadId)?,
            None => derive_id(raw),
        };

        // `{X:Type}` declarations introduce generics; everything else is a
        // parameter whose references must already be declared.
        let mut generics: Vec<&str> = Vec::new();
        let mut flag_words: Vec<String> = Vec::new();
        let mut params = Vec::new();
        for token in tokens {
            if let Some(decl) = token.strip_prefix('{') {
                let generic = decl.strip_suffix(":Type}").ok_or_else(|| SchemaError::BadParameter(token.to_owned()))?;
                generics.push(generic);
                continue;
            }

            let param = Parameter::parse(token)?;
            match &param.ty {
                ParameterType::Flags => flag_words.push(param.name.clone()),
                ParameterType::Normal { ty, flag } => {
                    if ty.generic_ref && !generics.contains(&ty.name.as_str()) {
                        return Err(SchemaError::Undeclared(ty.name.clone()));
                    }
                    if let Some(Flag { name, .. }) = flag {
                        if !flag_words.contains(name) {
                            return Err(SchemaError::Undeclared(name.clone()));
                        }
                    }
                }
            }
            params.push(param);
        }

        if generics.contains(&ty.name.as_str()) {
            ty.generic_ref = true;
        }

        Ok(Self { namespace: path, name, id, params, ty, category: Category::Types })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_id_matches_published_constructor() {
        let def: Definition = "boolFalse = Bool".parse().unwrap();
        assert_eq!(def.id, 0xbc79_9737);
        let def: Definition =
            "message msg_id:long seqno:int bytes:int body:Object = Message".parse().unwrap();
        assert_eq!(def.id, 0x5bb8_e511);
    }

    #[test]
    fn generic_return_is_marked() {
        let def: Definition = "invokeWithLayer#da9b0d0d {X:Type} layer:int query:!X = X".parse().unwrap();
        assert!(def.ty.generic_ref);
        assert_eq!(def.params.len(), 2);
    }

    #[test]
    fn undeclared_generic_is_rejected() {
        let err = "wrap#2 query:!X = X".parse::<Definition>().unwrap_err();
        assert_eq!(err, SchemaError::Undeclared("X".into()));
        let err = "wrap#2 {X:Object} query:!X = X".parse::<Definition>().unwrap_err();
        assert_eq!(err, SchemaError::BadParameter("{X:Object}".into()));
    }

    #[test]
    fn undeclared_flag_word_is_rejected() {
        let err = "foo#1 bar:flags.0?int = Foo".parse::<Definition>().unwrap_err();
        assert_eq!(err, SchemaError::Undeclared("flags".into()));
    }
}
