use std::fmt;

use super::SchemaError;

/// A type expression such as `auth.SentCode`, `Vector<long>` or `!X`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Type {
    /// Dotted name, namespace included: `auth.SentCode`.
    pub name: String,
    /// Lowercase last component: no constructor id on the wire.
    pub bare: bool,
    /// `!X`, naming a `{X:Type}` declaration.
    pub generic_ref: bool,
    /// `T` in `Vector<T>`.
    pub generic_arg: Option<Box<Type>>,
}

impl Type {
    pub fn parse(expr: &str) -> Result<Self, SchemaError> {
        let expr = expr.trim();
        let bad = || SchemaError::BadType(expr.to_owned());

        let (generic_ref, rest) = match expr.strip_prefix('!') {
            Some(rest) => (true, rest),
            None => (false, expr),
        };
        let (name, generic_arg) = match rest.find('<') {
            Some(open) => {
                let inner = rest[open + 1..].strip_suffix('>').ok_or_else(bad)?;
                (&rest[..open], Some(Box::new(Self::parse(inner)?)))
            }
            None => (rest, None),
        };
        if name.split('.').any(str::is_empty) {
            return Err(bad());
        }
        let last = name.rsplit('.').next().unwrap_or(name);
        Ok(Self {
            name: name.to_owned(),
            bare: last.starts_with(|c: char| c.is_ascii_lowercase()),
            generic_ref,
            generic_arg,
        })
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.generic_ref {
            f.write_str("!")?;
        }
        f.write_str(&self.name)?;
        match &self.generic_arg {
            Some(arg) => write!(f, "<{arg}>"),
            None => Ok(()),
        }
    }
}

/// A flag reference, e.g. `flags.3` in `username:flags.3?string`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Flag {
    /// Name of the `#` field holding the bit.
    pub name: String,
    /// Bit index, 0-based.
    pub index: u32,
}

/// The kind of a single parameter.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ParameterType {
    /// A `name:#` flags word.
    Flags,
    /// A typed parameter, present only when `flag` is set (if any).
    Normal { ty: Type, flag: Option<Flag> },
}

impl ParameterType {
    fn parse(spec: &str) -> Result<Self, SchemaError> {
        if spec == "#" {
            return Ok(Self::Flags);
        }
        let Some((flag, ty)) = spec.split_once('?') else {
            return Ok(Self::Normal { ty: Type::parse(spec)?, flag: None });
        };

        let bad = || SchemaError::BadParameter(spec.to_owned());
        let (word, index) = flag.split_once('.').ok_or_else(bad)?;
        let index: u32 = index.parse().map_err(|_| bad())?;
        if word.is_empty() || index >= 32 || ty.contains('?') {
            return Err(bad());
        }
        Ok(Self::Normal { ty: Type::parse(ty)?, flag: Some(Flag { name: word.to_owned(), index }) })
    }
}

impl fmt::Display for ParameterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Flags => f.write_str("#"),
            Self::Normal { ty, flag: Some(flag) } => write!(f, "{}.{}?{ty}", flag.name, flag.index),
            Self::Normal { ty, flag: None } => write!(f, "{ty}"),
        }
    }
}

/// One `name:type` token of a definition.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Parameter {
    pub name: String,
    pub ty: ParameterType,
}

impl Parameter {
    /// `flags:#`, `id:long` or `photo:flags.0?InputPhoto`. Generic
    /// declarations are the definition parser's business.
    pub fn parse(token: &str) -> Result<Self, SchemaError> {
        let Some((name, ty)) = token.split_once(':') else {
            return Err(SchemaError::Unsupported(token.to_owned()));
        };
        if name.is_empty() || ty.is_empty() {
            return Err(SchemaError::BadParameter(token.to_owned()));
        }
        Ok(Self { name: name.to_owned(), ty: ParameterType::parse(ty)? })
    }
}

impl fmt::Display for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.ty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_generic() {
        let ty = Type::parse("Vector<auth.SentCode>").unwrap();
        assert_eq!(ty.name, "Vector");
        let arg = ty.generic_arg.unwrap();
        assert_eq!(arg.name, "auth.SentCode");
        assert!(!arg.bare);
        assert!(Type::parse("auth.sentCode").unwrap().bare);
    }

    #[test]
    fn malformed_types_are_rejected() {
        assert_eq!(Type::parse("Vector<long"), Err(SchemaError::BadType("Vector<long".into())));
        assert_eq!(Type::parse("auth..X"), Err(SchemaError::BadType("auth..X".into())));
    }

    #[test]
    fn flag_bits_stay_in_one_word() {
        assert!(Parameter::parse("x:flags.31?int").is_ok());
        assert_eq!(Parameter::parse("x:flags.32?int"), Err(SchemaError::BadParameter("flags.32?int".into())));
        assert_eq!(Parameter::parse("["), Err(SchemaError::Unsupported("[".into())));
    }
}
