//! Payload serialization: the [`Message`] trait and the type registry.
//!
//! Payloads travel as `(type-name, bytes)` tuples. Encoding is always done
//! at a typed call site, so it is a plain generic function; decoding
//! happens on the receive path where only the wire-level type name is
//! known, so the registry keeps one erased decode closure per registered
//! type.

use std::any::Any;
use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::protocol::{PackrpcError, Result};

/// A serializable RPC payload with a stable wire-level type name.
///
/// The type name is what appears in the frame's `arg_type` field and what
/// the receiving side uses to pick a decoder. Names share the 63-byte wire
/// limit with method names.
pub trait Message: Serialize + DeserializeOwned + Send + 'static {
    const TYPE_NAME: &'static str;
}

/// Serialize a message into its wire tuple.
pub fn marshal<M: Message>(msg: &M) -> Result<(String, Vec<u8>)> {
    Ok((M::TYPE_NAME.to_string(), serde_json::to_vec(msg)?))
}

type DecodeFn = Box<dyn Fn(&[u8]) -> Result<Box<dyn Any + Send>> + Send + Sync>;

/// Maps wire-level type names to decode closures producing erased values.
///
/// Populated by the service builder for argument types and lazily by typed
/// client calls for reply types.
#[derive(Default)]
pub struct TypeRegistry {
    decoders: HashMap<&'static str, DecodeFn>,
}

impl TypeRegistry {
    pub fn new() -> TypeRegistry {
        TypeRegistry::default()
    }

    /// Register the decoder for `M` under its type name. Re-registering the
    /// same type is a no-op.
    pub fn insert<M: Message>(&mut self) {
        self.decoders.entry(M::TYPE_NAME).or_insert_with(|| {
            Box::new(|bytes| {
                let value: M = serde_json::from_slice(bytes)?;
                Ok(Box::new(value))
            })
        });
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.decoders.contains_key(type_name)
    }

    /// Decode `bytes` as the named type. Unknown names fail with
    /// `ParamUndefined`.
    pub fn decode(&self, type_name: &str, bytes: &[u8]) -> Result<Box<dyn Any + Send>> {
        match self.decoders.get(type_name) {
            Some(decode) => decode(bytes),
            None => Err(PackrpcError::ParamUndefined(type_name.to_string())),
        }
    }

    /// Move every decoder of `other` into this registry.
    pub fn absorb(&mut self, other: TypeRegistry) {
        for (name, decode) in other.decoders {
            self.decoders.entry(name).or_insert(decode);
        }
    }
}
