//! Dynamic TL values: [`TlValue`], [`TlObject`] and the [`ObjectBuilder`].

use std::fmt;
use std::sync::Arc;

use crate::deserialize::{Error, Result};
use crate::registry::{Constructor, Kind, Registry};
use crate::serialize::Serializable;

/// Any value a TL field can hold.
#[derive(Clone, PartialEq)]
pub enum TlValue {
    Int(i32),
    Long(i64),
    Double(f64),
    Int128([u8; 16]),
    Int256([u8; 32]),
    Bytes(Vec<u8>),
    String(String),
    Bool(bool),
    /// A set `true` flag.
    True,
    Flags(u32),
    Vector(Vec<TlValue>),
    BareVector(Vec<TlValue>),
    Object(TlObject),
    BareObject(TlObject),
    /// Already-encoded bytes whose type is decided elsewhere.
    Raw(Vec<u8>),
    /// An optional field whose flag bit is clear.
    Absent,
}

impl TlValue {
    pub fn is_absent(&self) -> bool {
        matches!(self, Self::Absent)
    }

    pub fn as_int(&self) -> Option<i32> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_long(&self) -> Option<i64> {
        match self {
            Self::Long(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(b) | Self::Raw(b) => Some(b),
            Self::String(s) => Some(s.as_bytes()),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            Self::True => Some(true),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&TlObject> {
        match self {
            Self::Object(o) | Self::BareObject(o) => Some(o),
            _ => None,
        }
    }

    pub fn as_vector(&self) -> Option<&[TlValue]> {
        match self {
            Self::Vector(v) | Self::BareVector(v) => Some(v),
            _ => None,
        }
    }

    pub fn into_object(self) -> Option<TlObject> {
        match self {
            Self::Object(o) | Self::BareObject(o) => Some(o),
            _ => None,
        }
    }

    pub fn into_vector(self) -> Option<Vec<TlValue>> {
        match self {
            Self::Vector(v) | Self::BareVector(v) => Some(v),
            _ => None,
        }
    }
}

impl Serializable for TlValue {
    fn serialize(&self, buf: &mut impl Extend<u8>) {
        match self {
            Self::Int(v) => v.serialize(buf),
            Self::Long(v) => v.serialize(buf),
            Self::Double(v) => v.serialize(buf),
            Self::Int128(v) => v.serialize(buf),
            Self::Int256(v) => v.serialize(buf),
            Self::Bytes(v) => v.serialize(buf),
            Self::String(v) => v.serialize(buf),
            Self::Bool(v) => v.serialize(buf),
            Self::Flags(v) => v.serialize(buf),
            Self::True | Self::Absent => {}
            Self::Vector(items) => {
                crate::VECTOR_ID.serialize(buf);
                serialize_items(items, buf);
            }
            Self::BareVector(items) => serialize_items(items, buf),
            Self::Object(o) => o.serialize(buf),
            Self::BareObject(o) => o.serialize_fields(buf),
            Self::Raw(bytes) => buf.extend(bytes.iter().copied()),
        }
    }

    fn serialized_len(&self) -> usize {
        match self {
            Self::Int(_) | Self::Bool(_) | Self::Flags(_) => 4,
            Self::Long(_) | Self::Double(_) => 8,
            Self::Int128(_) => 16,
            Self::Int256(_) => 32,
            Self::Bytes(v) => v.serialized_len(),
            Self::String(v) => v.serialized_len(),
            Self::True | Self::Absent => 0,
            Self::Vector(items) => 8 + items.iter().map(Self::serialized_len).sum::<usize>(),
            Self::BareVector(items) => 4 + items.iter().map(Self::serialized_len).sum::<usize>(),
            Self::Object(o) => o.serialized_len(),
            Self::BareObject(o) => o.fields_len(),
            Self::Raw(bytes) => bytes.len(),
        }
    }
}

fn serialize_items(items: &[TlValue], buf: &mut impl Extend<u8>) {
    (items.len() as i32).serialize(buf);
    for item in items {
        item.serialize(buf);
    }
}

impl fmt::Debug for TlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Long(v) => write!(f, "{v}"),
            Self::Double(v) => write!(f, "{v}"),
            Self::Int128(v) => write!(f, "int128({:02x?})", &v[..4]),
            Self::Int256(v) => write!(f, "int256({:02x?})", &v[..4]),
            Self::Bytes(v) => write!(f, "bytes[{}]", v.len()),
            Self::String(v) => write!(f, "{v:?}"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::True => f.write_str("true"),
            Self::Flags(v) => write!(f, "{v:#x}"),
            Self::Vector(v) | Self::BareVector(v) => f.debug_list().entries(v).finish(),
            Self::Object(o) | Self::BareObject(o) => fmt::Debug::fmt(o, f),
            Self::Raw(v) => write!(f, "raw[{}]", v.len()),
            Self::Absent => f.write_str("-"),
        }
    }
}

macro_rules! value_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {$(
        impl From<$ty> for TlValue {
            fn from(v: $ty) -> Self {
                Self::$variant(v.into())
            }
        }
    )*};
}

value_from! {
    i32 => Int,
    i64 => Long,
    f64 => Double,
    bool => Bool,
    [u8; 16] => Int128,
    [u8; 32] => Int256,
    Vec<u8> => Bytes,
    &[u8] => Bytes,
    String => String,
    &str => String,
    &String => String,
    TlObject => Object,
    Vec<TlValue> => Vector,
}

/// A constructor instance: its layout plus one value per field.
#[derive(Clone)]
pub struct TlObject {
    ctor: Arc<Constructor>,
    values: Vec<TlValue>,
}

impl TlObject {
    /// Start building `name` from the embedded schema.
    pub fn builder(name: &str) -> Result<ObjectBuilder> {
        Registry::embedded().builder(name)
    }

    pub(crate) fn from_parts(ctor: Arc<Constructor>, values: Vec<TlValue>) -> Self {
        Self { ctor, values }
    }

    pub fn constructor(&self) -> &Arc<Constructor> {
        &self.ctor
    }

    pub fn id(&self) -> u32 {
        self.ctor.id
    }

    pub fn name(&self) -> &str {
        &self.ctor.name
    }

    pub fn ty(&self) -> &str {
        &self.ctor.ty
    }

    pub fn values(&self) -> &[TlValue] {
        &self.values
    }

    /// The field's value, or `None` when it does not exist or is absent.
    pub fn get(&self, field: &str) -> Option<&TlValue> {
        let index = self.ctor.field_index(field)?;
        self.values.get(index).filter(|v| !v.is_absent())
    }

    pub fn has(&self, field: &str) -> bool {
        self.get(field).is_some()
    }

    fn required(&self, field: &str) -> Result<&TlValue> {
        self.get(field).ok_or_else(|| Error::MissingField {
            ctor: self.ctor.name.clone(),
            field: field.into(),
        })
    }

    fn typed<'a, T>(&'a self, field: &str, expected: &str, f: impl FnOnce(&'a TlValue) -> Option<T>) -> Result<T> {
        f(self.required(field)?).ok_or_else(|| Error::TypeMismatch {
            field: format!("{}.{field}", self.ctor.name),
            expected: expected.into(),
        })
    }

    pub fn int(&self, field: &str) -> Result<i32> {
        self.typed(field, "int", TlValue::as_int)
    }

    pub fn long(&self, field: &str) -> Result<i64> {
        self.typed(field, "long", TlValue::as_long)
    }

    pub fn string(&self, field: &str) -> Result<&str> {
        self.typed(field, "string", TlValue::as_str)
    }

    pub fn bytes(&self, field: &str) -> Result<&[u8]> {
        self.typed(field, "bytes", TlValue::as_bytes)
    }

    pub fn int128(&self, field: &str) -> Result<[u8; 16]> {
        self.typed(field, "int128", |v| match v {
            TlValue::Int128(v) => Some(*v),
            _ => None,
        })
    }

    pub fn object(&self, field: &str) -> Result<&TlObject> {
        self.typed(field, "object", TlValue::as_object)
    }

    pub fn vector(&self, field: &str) -> Result<&[TlValue]> {
        self.typed(field, "vector", TlValue::as_vector)
    }

    /// A `true` flag or `Bool` field; absent counts as `false`.
    pub fn flag(&self, field: &str) -> bool {
        self.get(field).and_then(TlValue::as_bool).unwrap_or(false)
    }

    pub fn opt_int(&self, field: &str) -> Option<i32> {
        self.get(field).and_then(TlValue::as_int)
    }

    pub fn opt_long(&self, field: &str) -> Option<i64> {
        self.get(field).and_then(TlValue::as_long)
    }

    pub fn opt_string(&self, field: &str) -> Option<&str> {
        self.get(field).and_then(TlValue::as_str)
    }

    pub fn opt_object(&self, field: &str) -> Option<&TlObject> {
        self.get(field).and_then(TlValue::as_object)
    }

    /// The flags word at `index` as it goes on the wire: bits of unknown
    /// meaning are kept, bits owned by optional fields follow presence.
    fn flags_word(&self, index: usize) -> u32 {
        let stored = match self.values.get(index) {
            Some(TlValue::Flags(word)) => *word,
            _ => 0,
        };
        let present = self
            .ctor
            .fields
            .iter()
            .zip(&self.values)
            .filter_map(|(field, value)| field.flag.filter(|_| !value.is_absent()))
            .filter(|flag| flag.field == index)
            .fold(0, |word, flag| word | (1 << flag.bit));
        (stored & !self.ctor.flag_mask(index)) | present
    }

    pub(crate) fn serialize_fields(&self, buf: &mut impl Extend<u8>) {
        for (index, (field, value)) in self.ctor.fields.iter().zip(&self.values).enumerate() {
            if field.kind == Kind::Flags {
                self.flags_word(index).serialize(buf);
            } else {
                value.serialize(buf);
            }
        }
    }

    pub(crate) fn fields_len(&self) -> usize {
        self.values.iter().map(TlValue::serialized_len).sum()
    }
}

impl Serializable for TlObject {
    fn serialize(&self, buf: &mut impl Extend<u8>) {
        self.ctor.id.serialize(buf);
        self.serialize_fields(buf);
    }

    fn serialized_len(&self) -> usize {
        4 + self.fields_len()
    }
}

impl PartialEq for TlObject {
    fn eq(&self, other: &Self) -> bool {
        self.ctor.id == other.ctor.id
            && self.values.len() == other.values.len()
            && self.ctor.fields.iter().enumerate().all(|(i, field)| {
                if field.kind == Kind::Flags {
                    self.flags_word(i) == other.flags_word(i)
                } else {
                    self.values[i] == other.values[i]
                }
            })
    }
}

impl fmt::Debug for TlObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct(&self.ctor.name);
        for (field, value) in self.ctor.fields.iter().zip(&self.values) {
            if field.kind != Kind::Flags && !value.is_absent() {
                s.field(&field.name, value);
            }
        }
        s.finish()
    }
}

/// Builds a [`TlObject`] field by field.
///
/// ```
/// use tgcore_tl::{Serializable, TlObject};
///
/// let ping = TlObject::builder("ping")?.set("ping_id", 7i64).build()?;
/// assert_eq!(ping.to_bytes().len(), 12);
/// # Ok::<(), tgcore_tl::Error>(())
/// ```
pub struct ObjectBuilder {
    ctor: Arc<Constructor>,
    values: Vec<Option<TlValue>>,
    error: Option<Error>,
}

impl ObjectBuilder {
    pub(crate) fn new(ctor: Arc<Constructor>) -> Self {
        let values = vec![None; ctor.fields.len()];
        Self { ctor, values, error: None }
    }

    /// Set a field. Strings convert to `bytes` and back, `bool` sets or
    /// clears a `true` flag, objects are checked against the field's type.
    /// The first error is reported by [`build`](Self::build).
    pub fn set(mut self, field: &str, value: impl Into<TlValue>) -> Self {
        if self.error.is_some() {
            return self;
        }
        let Some(index) = self.ctor.field_index(field) else {
            self.error = Some(Error::MissingField { ctor: self.ctor.name.clone(), field: field.into() });
            return self;
        };
        let kind = &self.ctor.fields[index].kind;
        match coerce(kind, value.into()) {
            Some(value) => self.values[index] = Some(value),
            None => {
                self.error = Some(Error::TypeMismatch {
                    field: format!("{}.{field}", self.ctor.name),
                    expected: kind.to_string(),
                });
            }
        }
        self
    }

    pub fn set_opt<V: Into<TlValue>>(self, field: &str, value: Option<V>) -> Self {
        match value {
            Some(value) => self.set(field, value),
            None => self,
        }
    }

    /// Validate and produce the object. Flags words are derived from which
    /// optional fields are present; fields sharing a flag bit must be set
    /// together (`true` markers follow their siblings).
    pub fn build(self) -> Result<TlObject> {
        if let Some(err) = self.error {
            return Err(err);
        }
        let ctor = self.ctor;
        let mut values: Vec<TlValue> =
            self.values.into_iter().map(|v| v.unwrap_or(TlValue::Absent)).collect();

        let mut present = vec![0u32; values.len()];
        for (field, value) in ctor.fields.iter().zip(&values) {
            if let Some(flag) = field.flag.filter(|_| !value.is_absent()) {
                present[flag.field] |= 1 << flag.bit;
            }
        }

        for (index, field) in ctor.fields.iter().enumerate() {
            let missing = || Error::MissingField { ctor: ctor.name.clone(), field: field.name.clone() };
            match (field.flag, &field.kind) {
                (Some(flag), kind) => {
                    let bit_set = present[flag.field] & (1 << flag.bit) != 0;
                    if bit_set && values[index].is_absent() {
                        if *kind != Kind::True {
                            return Err(missing());
                        }
                        values[index] = TlValue::True;
                    }
                }
                (None, Kind::Flags) => {
                    let stored = match values[index] {
                        TlValue::Flags(word) => word,
                        _ => 0,
                    };
                    values[index] = TlValue::Flags((stored & !ctor.flag_mask(index)) | present[index]);
                }
                (None, Kind::True) => values[index] = TlValue::True,
                (None, _) if values[index].is_absent() => return Err(missing()),
                (None, _) => {}
            }
        }

        Ok(TlObject { ctor, values })
    }
}

fn coerce(kind: &Kind, value: TlValue) -> Option<TlValue> {
    use TlValue as V;
    Some(match (kind, value) {
        (_, V::Absent) => V::Absent,
        (Kind::Int, v @ V::Int(_)) => v,
        (Kind::Long, v @ V::Long(_)) => v,
        (Kind::Long, V::Int(v)) => V::Long(v.into()),
        (Kind::Double, v @ V::Double(_)) => v,
        (Kind::Double, V::Int(v)) => V::Double(v.into()),
        (Kind::Int128, v @ V::Int128(_)) => v,
        (Kind::Int256, v @ V::Int256(_)) => v,
        (Kind::Bytes, v @ V::Bytes(_)) => v,
        (Kind::Bytes, V::String(s)) => V::Bytes(s.into_bytes()),
        (Kind::String, v @ V::String(_)) => v,
        (Kind::String, V::Bytes(b)) => V::String(String::from_utf8(b).ok()?),
        (Kind::Bool, v @ V::Bool(_)) => v,
        (Kind::True, V::True | V::Bool(true)) => V::True,
        (Kind::True, V::Bool(false)) => V::Absent,
        (Kind::Flags, v @ V::Flags(_)) => v,
        (Kind::Flags, V::Int(v)) => V::Flags(v as u32),
        (Kind::Vector(item), V::Vector(items) | V::BareVector(items)) => V::Vector(coerce_items(item, items)?),
        (Kind::BareVector(item), V::Vector(items) | V::BareVector(items)) => {
            V::BareVector(coerce_items(item, items)?)
        }
        (Kind::Boxed(ty), V::Object(o) | V::BareObject(o)) if o.ty() == ty && !o.ctor.is_function() => {
            V::Object(o)
        }
        (Kind::Bare(name), V::Object(o) | V::BareObject(o)) if o.name() == name => V::BareObject(o),
        (Kind::Any, v @ (V::Object(_) | V::Raw(_))) => v,
        _ => return None,
    })
}

fn coerce_items(item: &Kind, items: Vec<TlValue>) -> Option<Vec<TlValue>> {
    items.into_iter().map(|v| coerce(item, v).filter(|v| !v.is_absent())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_follow_presence() {
        let obj = TlObject::builder("auth.sentCode")
            .unwrap()
            .set("type", TlObject::builder("auth.sentCodeTypeSms").unwrap().set("length", 5).build().unwrap())
            .set("phone_code_hash", "abc")
            .set("timeout", 60)
            .build()
            .unwrap();
        let bytes = obj.to_bytes();
        let flags = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
        assert_eq!(flags, 1 << 2);
        assert_eq!(bytes.len(), obj.serialized_len());
    }

    #[test]
    fn true_marker_follows_shared_bit() {
        let auth = TlObject::builder("auth.authorization")
            .unwrap()
            .set("otherwise_relogin_days", 3)
            .set("user", TlObject::builder("userEmpty").unwrap().set("id", 1i64).build().unwrap())
            .build()
            .unwrap();
        assert!(auth.flag("setup_password_required"));
    }

    #[test]
    fn missing_required_field() {
        let err = TlObject::builder("ping").unwrap().build().unwrap_err();
        assert_eq!(err, Error::MissingField { ctor: "ping".into(), field: "ping_id".into() });
    }

    #[test]
    fn wrong_object_type_is_rejected() {
        let peer = TlObject::builder("inputPeerSelf").unwrap().build().unwrap();
        let err = TlObject::builder("auth.signIn")
            .unwrap()
            .set("phone_number", peer)
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::TypeMismatch { .. }));
    }
}
