//! Type-preserving cache serialization.
//!
//! Cached payloads are JSON envelopes carrying a type discriminator next to
//! the value:
//!
//! ```json
//! {"@type": "dict", "@v": 1, "value": {"dictId": 3, ...}}
//! ```
//!
//! Decoding resolves the discriminator against a closed registry of types
//! declared at build time via [`Cacheable`]. A payload whose discriminator
//! is not registered fails with
//! [`StoreError::DeserializationTypeMismatch`]; nothing is ever coerced
//! into a generic map shape.

use crate::error::{StoreError, StoreResult};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use std::any::Any;
use std::collections::HashMap;
use std::sync::RwLock;

const TYPE_FIELD: &str = "@type";
const VERSION_FIELD: &str = "@v";
const VALUE_FIELD: &str = "value";
const ENVELOPE_VERSION: u64 = 1;

/// A type that can round-trip through the cache with its concrete type
/// preserved.
///
/// `TYPE_TAG` is the discriminator written into the envelope. Tags are part
/// of the stored data: renaming a type must not change its tag, or existing
/// entries stop resolving.
pub trait Cacheable: Serialize + DeserializeOwned + Any + Send + Sync {
    const TYPE_TAG: &'static str;
}

type DecodeFn = fn(JsonValue) -> StoreResult<Box<dyn Any + Send>>;

struct RegisteredType {
    type_id: std::any::TypeId,
    decode: DecodeFn,
}

fn decode_erased<T: Cacheable>(value: JsonValue) -> StoreResult<Box<dyn Any + Send>> {
    let decoded: T = serde_json::from_value(value)
        .map_err(|e| StoreError::cache(format!("Failed to decode cached value: {}", e)))?;
    Ok(Box::new(decoded))
}

/// Object-safe view of a [`Cacheable`] value, for call sites that hold
/// heterogeneous cached values behind `dyn`.
pub trait CacheValue: Send + Sync {
    fn type_tag(&self) -> &'static str;
    fn encode(&self) -> StoreResult<JsonValue>;
    fn as_any(&self) -> &dyn Any;
}

impl<T: Cacheable> CacheValue for T {
    fn type_tag(&self) -> &'static str {
        T::TYPE_TAG
    }

    fn encode(&self) -> StoreResult<JsonValue> {
        serde_json::to_value(self)
            .map_err(|e| StoreError::cache(format!("Failed to encode cached value: {}", e)))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Envelope codec over a closed registry of cacheable types.
pub struct CacheCodec {
    decoders: RwLock<HashMap<&'static str, RegisteredType>>,
}

impl Default for CacheCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheCodec {
    pub fn new() -> Self {
        Self {
            decoders: RwLock::new(HashMap::new()),
        }
    }

    /// Register a type's discriminator. Idempotent; registering two types
    /// under the same tag is a configuration error.
    pub fn register<T: Cacheable>(&self) -> StoreResult<()> {
        let mut guard = self
            .decoders
            .write()
            .map_err(|_| StoreError::internal("Type registry lock poisoned"))?;
        if let Some(existing) = guard.get(T::TYPE_TAG) {
            if existing.type_id != std::any::TypeId::of::<T>() {
                return Err(StoreError::configuration(format!(
                    "Discriminator '{}' is already registered to a different type",
                    T::TYPE_TAG
                )));
            }
            return Ok(());
        }
        guard.insert(
            T::TYPE_TAG,
            RegisteredType {
                type_id: std::any::TypeId::of::<T>(),
                decode: decode_erased::<T>,
            },
        );
        Ok(())
    }

    /// Tags currently registered.
    pub fn registered_tags(&self) -> Vec<&'static str> {
        match self.decoders.read() {
            Ok(guard) => guard.keys().copied().collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Encode a value into its envelope bytes.
    ///
    /// The value's type is registered as a side effect, so anything this
    /// codec wrote it can also read back.
    pub fn serialize<T: Cacheable>(&self, value: &T) -> StoreResult<Vec<u8>> {
        self.register::<T>()?;
        self.serialize_value(value)
    }

    /// Encode an erased value into its envelope bytes.
    ///
    /// The caller is responsible for having registered the concrete type.
    pub fn serialize_value(&self, value: &dyn CacheValue) -> StoreResult<Vec<u8>> {
        let envelope = serde_json::json!({
            TYPE_FIELD: value.type_tag(),
            VERSION_FIELD: ENVELOPE_VERSION,
            VALUE_FIELD: value.encode()?,
        });
        serde_json::to_vec(&envelope)
            .map_err(|e| StoreError::cache(format!("Failed to encode envelope: {}", e)))
    }

    /// Decode envelope bytes into the concrete type named by the
    /// discriminator, behind `dyn Any`.
    pub fn deserialize(&self, bytes: &[u8]) -> StoreResult<Box<dyn Any + Send>> {
        let (tag, value) = self.open_envelope(bytes)?;
        let decoder = {
            let guard = self
                .decoders
                .read()
                .map_err(|_| StoreError::internal("Type registry lock poisoned"))?;
            guard.get(tag.as_str()).map(|entry| entry.decode)
        };
        match decoder {
            Some(decode) => decode(value),
            None => Err(StoreError::type_mismatch(tag)),
        }
    }

    /// Decode envelope bytes directly as `T`.
    ///
    /// The stored discriminator must be `T`'s tag; anything else is a
    /// [`StoreError::DeserializationTypeMismatch`].
    pub fn decode_as<T: Cacheable>(&self, bytes: &[u8]) -> StoreResult<T> {
        let (tag, value) = self.open_envelope(bytes)?;
        if tag != T::TYPE_TAG {
            return Err(StoreError::type_mismatch(tag));
        }
        serde_json::from_value(value)
            .map_err(|e| StoreError::cache(format!("Failed to decode cached value: {}", e)))
    }

    fn open_envelope(&self, bytes: &[u8]) -> StoreResult<(String, JsonValue)> {
        let parsed: JsonValue = serde_json::from_slice(bytes)
            .map_err(|e| StoreError::cache(format!("Malformed cache envelope: {}", e)))?;
        let object = parsed
            .as_object()
            .ok_or_else(|| StoreError::cache("Cache envelope is not an object"))?;
        let tag = object
            .get(TYPE_FIELD)
            .and_then(JsonValue::as_str)
            .ok_or_else(|| StoreError::cache("Cache envelope has no type discriminator"))?
            .to_string();
        let version = object
            .get(VERSION_FIELD)
            .and_then(JsonValue::as_u64)
            .ok_or_else(|| StoreError::cache("Cache envelope has no version"))?;
        if version != ENVELOPE_VERSION {
            return Err(StoreError::cache(format!(
                "Unsupported cache envelope version {}",
                version
            )));
        }
        let value = object
            .get(VALUE_FIELD)
            .cloned()
            .ok_or_else(|| StoreError::cache("Cache envelope has no value"))?;
        Ok((tag, value))
    }
}
