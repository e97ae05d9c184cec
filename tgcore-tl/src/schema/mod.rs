//! Parser for [Type Language] schema text.
//!
//! Converts raw `.tl` text into [`Definition`]s, which the
//! [`Registry`](crate::Registry) then resolves into decodable layouts.
//!
//! ```
//! use tgcore_tl::schema::parse_schema;
//!
//! let src = "user#12345 id:long name:string = User;";
//! let defs = parse_schema(src).collect::<Result<Vec<_>, _>>().unwrap();
//! assert_eq!(defs[0].full_name(), "user");
//! ```
//!
//! [Type Language]: https://core.telegram.org/mtproto/TL

mod definition;
mod parameter;

use std::fmt;
use std::num::ParseIntError;
use std::str::FromStr;

pub use definition::Definition;
pub use parameter::{Flag, Parameter, ParameterType, Type};

/// Why a definition was rejected. Offending tokens are carried verbatim.
#[derive(Clone, Debug, PartialEq)]
pub enum SchemaError {
    /// Nothing before the `;`.
    Empty,
    /// No `= Type`, or nothing on its left.
    MissingType,
    /// Empty name or namespace component.
    BadName(String),
    /// The `#id` literal is not hexadecimal.
    BadId(ParseIntError),
    BadType(String),
    BadParameter(String),
    /// A `!X` or flags word used before its declaration.
    Undeclared(String),
    /// Syntax the registry has no use for, such as `[ t ]` repetitions.
    Unsupported(String),
}

impl fmt::Display for SchemaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => f.write_str("empty definition"),
            Self::MissingType => f.write_str("missing `= Type`"),
            Self::BadName(name) => write!(f, "malformed name `{name}`"),
            Self::BadId(e) => write!(f, "invalid constructor id: {e}"),
            Self::BadType(ty) => write!(f, "malformed type `{ty}`"),
            Self::BadParameter(token) => write!(f, "malformed parameter `{token}`"),
            Self::Undeclared(name) => write!(f, "`{name}` is used before it is declared"),
            Self::Unsupported(token) => write!(f, "unsupported syntax at `{token}`"),
        }
    }
}

impl std::error::Error for SchemaError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::BadId(e) => Some(e),
            _ => None,
        }
    }
}

/// Whether a [`Definition`] is a data constructor or an RPC function.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Category {
    /// Declared before `---functions---` (or after `---types---`).
    Types,
    /// Declared after `---functions---`.
    Functions,
}

/// Parses a complete schema, yielding definitions one by one.
///
/// Blank lines and `//` comments are skipped, definitions may span several
/// lines (they end at `;`), and the `---functions---` / `---types---`
/// markers switch the [`Category`] of what follows.
pub fn parse_schema(contents: &str) -> impl Iterator<Item = Result<Definition, SchemaError>> + '_ {
    SchemaIter { lines: contents.lines(), category: Category::Types, pending: String::new() }
}

struct SchemaIter<'a> {
    lines:    std::str::Lines<'a>,
    category: Category,
    pending:  String,
}

impl Iterator for SchemaIter<'_> {
    type Item = Result<Definition, SchemaError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let line = self.lines.next()?;
            let line = match line.split_once("//") {
                Some((code, _comment)) => code.trim(),
                None => line.trim(),
            };
            if line.is_empty() {
                continue;
            }

            match line {
                "---functions---" => { self.category = Category::Functions; continue; }
                "---types---"     => { self.category = Category::Types;     continue; }
                _ => {}
            }

            if !self.pending.is_empty() {
                self.pending.push(' ');
            }
            self.pending.push_str(line);

            if !line.ends_with(';') {
                continue;
            }

            let raw = std::mem::take(&mut self.pending);
            let raw = raw.trim_end_matches(';').trim();
            if raw.is_empty() {
                continue;
            }

            let category = self.category;
            return Some(Definition::from_str(raw).map(|mut d| {
                d.category = category;
                d
            }));
        }
    }
}

/// Standard CRC-32 (IEEE 802.3, reflected, polynomial `0xEDB88320`).
///
/// Used both to derive constructor ids and by the full transport framing.
pub fn crc32(data: &[u8]) -> u32 {
    const TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut bit = 0;
            while bit < 8 {
                crc = if crc & 1 != 0 { (crc >> 1) ^ 0xEDB8_8320 } else { crc >> 1 };
                bit += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    let mut crc = 0xFFFF_FFFFu32;
    for &byte in data {
        crc = TABLE[((crc ^ u32::from(byte)) & 0xff) as usize] ^ (crc >> 8);
    }
    !crc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc32_check_value() {
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
        assert_eq!(crc32(b""), 0);
    }

    #[test]
    fn trailing_comment_is_ignored() {
        let src = "boolTrue#997275b5 = Bool; // yes";
        let defs: Vec<_> = parse_schema(src).collect::<Result<_, _>>().unwrap();
        assert_eq!(defs.len(), 1);
    }
}
