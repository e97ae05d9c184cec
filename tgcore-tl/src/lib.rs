//! Type Language codec for MTProto.
//!
//! Unlike a code-generated binding, this crate resolves the schema at
//! runtime into a [`Registry`] of constructor layouts and works on dynamic
//! [`TlObject`] values:
//!
//! | Module            | Contents                                               |
//! |-------------------|--------------------------------------------------------|
//! | [`schema`]        | Parser for `.tl` text                                  |
//! | [`registry`]      | Resolved layouts, schema-driven decoding               |
//! | [`object`]        | [`TlValue`], [`TlObject`], [`ObjectBuilder`]           |
//! | [`serialize`]     | [`Serializable`] and primitive encodings               |
//! | [`deserialize`]   | [`Deserializable`], [`Cursor`], the codec [`Error`]    |
//!
//! ```
//! use tgcore_tl::{Registry, Serializable, TlObject};
//!
//! let call = TlObject::builder("help.getNearestDc")?.build()?;
//! let bytes = call.to_bytes();
//! assert_eq!(Registry::embedded().decode_object(&bytes)?, call);
//! # Ok::<(), tgcore_tl::Error>(())
//! ```

#![deny(unsafe_code)]

pub mod deserialize;
pub mod object;
pub mod registry;
pub mod schema;
pub mod serialize;

pub use deserialize::{Buffer, Cursor, Deserializable, Error};
pub use object::{ObjectBuilder, TlObject, TlValue};
pub use registry::{Constructor, Field, FlagRef, Kind, Registry};
pub use serialize::Serializable;

/// API layer of the bundled `api.tl`.
pub const LAYER: i32 = 166;

/// `vector t:Type # [ t ] = Vector t`
pub const VECTOR_ID: u32 = 0x1cb5_c415;
pub const BOOL_TRUE: u32 = 0x9972_75b5;
pub const BOOL_FALSE: u32 = 0xbc79_9737;

/// Something that can be sent as an RPC call.
///
/// Implemented by [`TlObject`] for raw function objects and by the typed
/// request structs in the client crate.
pub trait RemoteCall {
    /// The function object to serialize.
    fn to_function(&self) -> Result<TlObject, Error>;
}

impl RemoteCall for TlObject {
    fn to_function(&self) -> Result<TlObject, Error> {
        if self.constructor().is_function() {
            Ok(self.clone())
        } else {
            Err(Error::UnexpectedConstructor { id: self.id(), expected: "a function".into() })
        }
    }
}
