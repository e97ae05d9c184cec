//! Constructor layouts resolved once from schema definitions, and the
//! schema-driven decoder that walks them.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, LazyLock};

use crate::deserialize::{Buffer, Cursor, Deserializable, Error, Result};
use crate::object::{ObjectBuilder, TlObject, TlValue};
use crate::schema::{self, Category, Definition, ParameterType, Type};

/// Service-level MTProto schema shipped with the crate.
pub const MTPROTO_SCHEMA: &str = include_str!("../tl/mtproto.tl");
/// API schema shipped with the crate.
pub const API_SCHEMA: &str = include_str!("../tl/api.tl");

/// The wire shape of a single field.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Kind {
    Int,
    Long,
    Double,
    Int128,
    Int256,
    Bytes,
    String,
    Bool,
    /// Flag-only marker; occupies no bytes.
    True,
    /// A `#` flags word.
    Flags,
    /// `Vector<T>`: constructor id, count, items.
    Vector(Box<Kind>),
    /// `vector<T>`: count and items only.
    BareVector(Box<Kind>),
    /// Any constructor of the named type, prefixed by its id.
    Boxed(String),
    /// The named constructor's fields without an id.
    Bare(String),
    /// `Object` or `!X`: any constructor, resolved by id.
    Any,
}

impl Kind {
    pub fn from_type(ty: &Type) -> Self {
        if ty.generic_ref {
            return Self::Any;
        }
        let name = ty.name.clone();
        match (name.as_str(), &ty.generic_arg) {
            ("Vector", Some(arg)) => Self::Vector(Box::new(Self::from_type(arg))),
            ("vector", Some(arg)) => Self::BareVector(Box::new(Self::from_type(arg))),
            ("int", _) => Self::Int,
            ("long", _) => Self::Long,
            ("double", _) => Self::Double,
            ("int128", _) => Self::Int128,
            ("int256", _) => Self::Int256,
            ("bytes", _) => Self::Bytes,
            ("string", _) => Self::String,
            ("Bool", _) => Self::Bool,
            ("true", _) => Self::True,
            ("Object", _) => Self::Any,
            _ if ty.bare => Self::Bare(name),
            _ => Self::Boxed(name),
        }
    }

    /// Smallest possible encoding, used to bound vector counts.
    fn min_size(&self) -> usize {
        match self {
            Self::Long | Self::Double => 8,
            Self::Int128 => 16,
            Self::Int256 => 32,
            Self::True | Self::Bare(_) => 0,
            _ => 4,
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int => f.write_str("int"),
            Self::Long => f.write_str("long"),
            Self::Double => f.write_str("double"),
            Self::Int128 => f.write_str("int128"),
            Self::Int256 => f.write_str("int256"),
            Self::Bytes => f.write_str("bytes"),
            Self::String => f.write_str("string"),
            Self::Bool => f.write_str("Bool"),
            Self::True => f.write_str("true"),
            Self::Flags => f.write_str("#"),
            Self::Vector(item) => write!(f, "Vector<{item}>"),
            Self::BareVector(item) => write!(f, "vector<{item}>"),
            Self::Boxed(name) | Self::Bare(name) => f.write_str(name),
            Self::Any => f.write_str("Object"),
        }
    }
}

/// Which bit of which flags word controls an optional field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FlagRef {
    /// Index of the flags field within the constructor.
    pub field: usize,
    pub bit: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Field {
    pub name: String,
    pub kind: Kind,
    pub flag: Option<FlagRef>,
}

/// Reads the fields of a constructor whose id has already been consumed.
pub type DecodeFn = fn(&Registry, &Arc<Constructor>, Buffer) -> Result<TlObject>;

/// A resolved constructor or function layout.
pub struct Constructor {
    pub id: u32,
    /// Full name including namespace, e.g. `auth.sentCode`.
    pub name: String,
    /// Result type for constructors, return type for functions.
    pub ty: String,
    pub category: Category,
    pub fields: Vec<Field>,
    /// What a function answers with. `None` for constructors.
    pub returns: Option<Kind>,
    decode: DecodeFn,
}

impl Constructor {
    pub fn is_function(&self) -> bool {
        self.category == Category::Functions
    }

    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    /// Bits of the flags word at `index` that belong to optional fields.
    pub fn flag_mask(&self, index: usize) -> u32 {
        self.fields
            .iter()
            .filter_map(|f| f.flag)
            .filter(|flag| flag.field == index)
            .fold(0, |mask, flag| mask | (1 << flag.bit))
    }

    fn from_definition(def: &Definition) -> Self {
        let mut fields: Vec<Field> = Vec::with_capacity(def.params.len());
        for param in &def.params {
            let (kind, flag) = match &param.ty {
                ParameterType::Flags => (Kind::Flags, None),
                ParameterType::Normal { ty, flag } => {
                    let flag = flag.as_ref().and_then(|flag| {
                        fields
                            .iter()
                            .position(|f| f.kind == Kind::Flags && f.name == flag.name)
                            .map(|field| FlagRef { field, bit: flag.index })
                    });
                    (Kind::from_type(ty), flag)
                }
            };
            fields.push(Field { name: param.name.clone(), kind, flag });
        }

        let name = def.full_name();
        let decode: DecodeFn = match name.as_str() {
            "rpc_result" => decode_rpc_result,
            "mt_message" => decode_mt_message,
            _ => decode_fields,
        };

        Self {
            id: def.id,
            ty: def.ty.to_string(),
            returns: (def.category == Category::Functions).then(|| Kind::from_type(&def.ty)),
            category: def.category,
            fields,
            name,
            decode,
        }
    }
}

impl fmt::Debug for Constructor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Constructor")
            .field("id", &format_args!("{:#010x}", self.id))
            .field("name", &self.name)
            .field("ty", &self.ty)
            .field("fields", &self.fields)
            .finish()
    }
}

fn decode_fields(reg: &Registry, ctor: &Arc<Constructor>, buf: Buffer) -> Result<TlObject> {
    let mut values = Vec::with_capacity(ctor.fields.len());
    for field in &ctor.fields {
        let value = match field.flag {
            Some(FlagRef { field: index, bit }) => {
                let word = match values.get(index) {
                    Some(TlValue::Flags(word)) => *word,
                    _ => 0,
                };
                if word & (1 << bit) == 0 {
                    TlValue::Absent
                } else {
                    reg.read_value(&field.kind, buf)?
                }
            }
            None => reg.read_value(&field.kind, buf)?,
        };
        values.push(value);
    }
    Ok(TlObject::from_parts(Arc::clone(ctor), values))
}

/// The result's type depends on the request, so the body stays raw.
fn decode_rpc_result(_: &Registry, ctor: &Arc<Constructor>, buf: Buffer) -> Result<TlObject> {
    let req_msg_id = i64::deserialize(buf)?;
    let result = buf.read_rest().to_vec();
    Ok(TlObject::from_parts(
        Arc::clone(ctor),
        vec![TlValue::Long(req_msg_id), TlValue::Raw(result)],
    ))
}

/// A container item: the body is bounded by its declared length.
fn decode_mt_message(_: &Registry, ctor: &Arc<Constructor>, buf: Buffer) -> Result<TlObject> {
    let msg_id = i64::deserialize(buf)?;
    let seqno = i32::deserialize(buf)?;
    let len = i32::deserialize(buf)?;
    let body = usize::try_from(len)
        .ok()
        .filter(|&len| len % 4 == 0 && len <= buf.remaining())
        .ok_or(Error::InvalidLength)?;
    let body = buf.read_slice(body)?.to_vec();
    Ok(TlObject::from_parts(
        Arc::clone(ctor),
        vec![TlValue::Long(msg_id), TlValue::Int(seqno), TlValue::Int(len), TlValue::Raw(body)],
    ))
}

/// All known constructors and functions, indexed by id, name and type.
#[derive(Default)]
pub struct Registry {
    by_id: HashMap<u32, Arc<Constructor>>,
    by_name: HashMap<String, u32>,
    by_type: HashMap<String, Vec<u32>>,
}

static EMBEDDED: LazyLock<Arc<Registry>> = LazyLock::new(|| {
    Arc::new(
        Registry::from_schemas(&[MTPROTO_SCHEMA, API_SCHEMA])
            .expect("embedded schema files are valid TL"),
    )
});

impl Registry {
    /// The process-wide registry built from the bundled schema files.
    pub fn embedded() -> Arc<Self> {
        Arc::clone(&EMBEDDED)
    }

    pub fn from_schema(source: &str) -> std::result::Result<Self, schema::SchemaError> {
        Self::from_schemas(&[source])
    }

    /// Later sources override earlier definitions that share an id or name.
    pub fn from_schemas(sources: &[&str]) -> std::result::Result<Self, schema::SchemaError> {
        let mut registry = Self::default();
        for source in sources {
            for def in schema::parse_schema(source) {
                registry.insert(Constructor::from_definition(&def?));
            }
        }
        Ok(registry)
    }

    fn insert(&mut self, ctor: Constructor) {
        if ctor.category == Category::Types {
            let ids = self.by_type.entry(ctor.ty.clone()).or_default();
            if !ids.contains(&ctor.id) {
                ids.push(ctor.id);
            }
        }
        self.by_name.insert(ctor.name.clone(), ctor.id);
        self.by_id.insert(ctor.id, Arc::new(ctor));
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn constructor(&self, id: u32) -> Option<&Arc<Constructor>> {
        self.by_id.get(&id)
    }

    pub fn by_name(&self, name: &str) -> Option<&Arc<Constructor>> {
        self.by_name.get(name).and_then(|id| self.by_id.get(id))
    }

    /// Constructors whose result type is `ty`, in schema order.
    pub fn constructors_of<'a>(&'a self, ty: &str) -> impl Iterator<Item = &'a Arc<Constructor>> + 'a {
        self.by_type
            .get(ty)
            .into_iter()
            .flatten()
            .filter_map(|id| self.by_id.get(id))
    }

    /// Start building a constructor or function call by name.
    pub fn builder(&self, name: &str) -> Result<ObjectBuilder> {
        self.by_name(name)
            .map(|ctor| ObjectBuilder::new(Arc::clone(ctor)))
            .ok_or_else(|| Error::UnknownType { name: name.into() })
    }

    /// Resolve a type expression such as `Vector<User>` or `auth.SentCode`.
    pub fn resolve(&self, expr: &str) -> Result<Kind> {
        let ty = Type::parse(expr).map_err(|_| Error::UnknownType { name: expr.into() })?;
        let kind = Kind::from_type(&ty);
        self.check_known(&kind)?;
        Ok(kind)
    }

    fn check_known(&self, kind: &Kind) -> Result<()> {
        match kind {
            Kind::Vector(item) | Kind::BareVector(item) => self.check_known(item),
            Kind::Boxed(name) if !self.by_type.contains_key(name) => {
                Err(Error::UnknownType { name: name.clone() })
            }
            Kind::Bare(name) if !self.by_name.contains_key(name) => {
                Err(Error::UnknownType { name: name.clone() })
            }
            _ => Ok(()),
        }
    }

    /// Decode exactly one value. With an expected type expression,
    /// constructors of any other type are rejected.
    pub fn decode(&self, bytes: &[u8], expected: Option<&str>) -> Result<TlValue> {
        let kind = match expected {
            Some(expr) => self.resolve(expr)?,
            None => Kind::Any,
        };
        self.decode_as(bytes, &kind)
    }

    pub fn decode_as(&self, bytes: &[u8], kind: &Kind) -> Result<TlValue> {
        let mut cursor = Cursor::from_slice(bytes);
        let value = self.read_value(kind, &mut cursor)?;
        ensure_consumed(&cursor)?;
        Ok(value)
    }

    /// Decode exactly one boxed object of any type.
    pub fn decode_object(&self, bytes: &[u8]) -> Result<TlObject> {
        let mut cursor = Cursor::from_slice(bytes);
        let object = self.read_object(&mut cursor, None)?;
        ensure_consumed(&cursor)?;
        Ok(object)
    }

    pub fn read_object(&self, buf: Buffer, expected: Option<&str>) -> Result<TlObject> {
        let id = u32::deserialize(buf)?;
        let ctor = self.by_id.get(&id).ok_or(Error::UnknownConstructor { id })?;
        if let Some(ty) = expected {
            if ctor.ty != ty || ctor.is_function() {
                return Err(Error::UnexpectedConstructor { id, expected: ty.into() });
            }
        }
        (ctor.decode)(self, ctor, buf)
    }

    pub fn read_value(&self, kind: &Kind, buf: Buffer) -> Result<TlValue> {
        Ok(match kind {
            Kind::Int => TlValue::Int(i32::deserialize(buf)?),
            Kind::Long => TlValue::Long(i64::deserialize(buf)?),
            Kind::Double => TlValue::Double(f64::deserialize(buf)?),
            Kind::Int128 => TlValue::Int128(<[u8; 16]>::deserialize(buf)?),
            Kind::Int256 => TlValue::Int256(<[u8; 32]>::deserialize(buf)?),
            Kind::Bytes => TlValue::Bytes(Vec::<u8>::deserialize(buf)?),
            Kind::String => TlValue::String(String::deserialize(buf)?),
            Kind::Bool => TlValue::Bool(bool::deserialize(buf)?),
            Kind::True => TlValue::True,
            Kind::Flags => TlValue::Flags(u32::deserialize(buf)?),
            Kind::Vector(item) => {
                let id = u32::deserialize(buf)?;
                if id != crate::VECTOR_ID {
                    return Err(Error::UnexpectedConstructor { id, expected: kind.to_string() });
                }
                TlValue::Vector(self.read_items(item, buf)?)
            }
            Kind::BareVector(item) => TlValue::BareVector(self.read_items(item, buf)?),
            Kind::Boxed(ty) => TlValue::Object(self.read_object(buf, Some(ty))?),
            Kind::Bare(name) => {
                let ctor = self
                    .by_name(name)
                    .ok_or_else(|| Error::UnknownType { name: name.clone() })?;
                TlValue::BareObject((ctor.decode)(self, ctor, buf)?)
            }
            Kind::Any => TlValue::Object(self.read_object(buf, None)?),
        })
    }

    fn read_items(&self, item: &Kind, buf: Buffer) -> Result<Vec<TlValue>> {
        let count = buf.read_count(item.min_size())?;
        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            items.push(self.read_value(item, buf)?);
        }
        Ok(items)
    }

    /// What the server answers `call` with. Wrappers such as
    /// `invokeWithLayer` answer with whatever their inner query answers.
    pub fn return_kind(&self, call: &TlObject) -> Option<Kind> {
        let ctor = call.constructor();
        match ctor.returns.as_ref()? {
            Kind::Any => ctor.fields.iter().zip(call.values()).find_map(|(field, value)| {
                match (&field.kind, value) {
                    (Kind::Any, TlValue::Object(inner)) => self.return_kind(inner),
                    _ => None,
                }
            }),
            kind => Some(kind.clone()),
        }
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("constructors", &self.by_id.len())
            .field("types", &self.by_type.len())
            .finish()
    }
}

fn ensure_consumed(cursor: &Cursor<'_>) -> Result<()> {
    match cursor.remaining() {
        0 => Ok(()),
        remaining => Err(Error::TrailingBytes { remaining }),
    }
}
