//! Serializer/deserializer registry keyed by name.
//!
//! The registry is assembled once at start-up through [`CodecRegistryBuilder`]
//! and is read-only afterwards; pipelines resolve their codec when they are built.

use std::collections::HashMap;
use std::sync::Arc;

use crate::message::Payload;

pub const BYTES_CODEC: &str = "bytes";
pub const TEXT_CODEC: &str = "text";
pub const JSON_CODEC: &str = "json";

/// Error type for codec lookups and conversions
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Serializer not found: {0}")]
    UnknownSerializer(String),

    #[error("Deserializer not found: {0}")]
    UnknownDeserializer(String),

    #[error("Payload is not valid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("JSON conversion failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Custom(String),
}

/// Turns a payload into the bytes put on the wire
pub trait Serializer: Send + Sync {
    fn serialize(&self, payload: &Payload) -> Result<Vec<u8>, CodecError>;
}

/// Turns a received body into a payload
pub trait Deserializer: Send + Sync {
    fn deserialize(&self, body: &[u8]) -> Result<Payload, CodecError>;
}

impl<F> Serializer for F
where
    F: Fn(&Payload) -> Result<Vec<u8>, CodecError> + Send + Sync,
{
    fn serialize(&self, payload: &Payload) -> Result<Vec<u8>, CodecError> {
        self(payload)
    }
}

impl<F> Deserializer for F
where
    F: Fn(&[u8]) -> Result<Payload, CodecError> + Send + Sync,
{
    fn deserialize(&self, body: &[u8]) -> Result<Payload, CodecError> {
        self(body)
    }
}

/// Serializes each payload according to its variant
#[derive(Debug, Default, Clone, Copy)]
pub struct PassThrough;

impl Serializer for PassThrough {
    fn serialize(&self, payload: &Payload) -> Result<Vec<u8>, CodecError> {
        Ok(payload.to_bytes().into_owned())
    }
}

/// Keeps the body as raw bytes
#[derive(Debug, Default, Clone, Copy)]
pub struct BytesCodec;

impl Serializer for BytesCodec {
    fn serialize(&self, payload: &Payload) -> Result<Vec<u8>, CodecError> {
        Ok(payload.to_bytes().into_owned())
    }
}

impl Deserializer for BytesCodec {
    fn deserialize(&self, body: &[u8]) -> Result<Payload, CodecError> {
        Ok(Payload::Bytes(body.to_vec()))
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TextCodec;

impl Serializer for TextCodec {
    fn serialize(&self, payload: &Payload) -> Result<Vec<u8>, CodecError> {
        match payload {
            Payload::Bytes(bytes) => Ok(String::from_utf8(bytes.clone())?.into_bytes()),
            other => Ok(other.to_bytes().into_owned()),
        }
    }
}

impl Deserializer for TextCodec {
    fn deserialize(&self, body: &[u8]) -> Result<Payload, CodecError> {
        Ok(Payload::Text(String::from_utf8(body.to_vec())?))
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl Serializer for JsonCodec {
    fn serialize(&self, payload: &Payload) -> Result<Vec<u8>, CodecError> {
        match payload {
            Payload::Json(value) => Ok(serde_json::to_vec(value)?),
            Payload::Text(text) => Ok(serde_json::to_vec(text)?),
            Payload::Bytes(bytes) => {
                // Bytes must already hold a JSON document
                let value: serde_json::Value = serde_json::from_slice(bytes)?;
                Ok(serde_json::to_vec(&value)?)
            }
        }
    }
}

impl Deserializer for JsonCodec {
    fn deserialize(&self, body: &[u8]) -> Result<Payload, CodecError> {
        Ok(Payload::Json(serde_json::from_slice(body)?))
    }
}

/// Registry of named serializers and deserializers
#[derive(Clone)]
pub struct CodecRegistry {
    serializers: HashMap<String, Arc<dyn Serializer>>,
    deserializers: HashMap<String, Arc<dyn Deserializer>>,
}

impl CodecRegistry {
    /// Create a registry without any codec, not even the built-in ones
    pub fn empty() -> Self {
        Self {
            serializers: HashMap::new(),
            deserializers: HashMap::new(),
        }
    }

    /// Start from the built-in codecs
    ///
    /// # Example
    ///
    /// ```ignore
    /// use relaygate::codec::{CodecRegistry, CodecError};
    /// use relaygate::message::Payload;
    ///
    /// let codecs = CodecRegistry::builder()
    ///     .register_deserializer("upper", |body: &[u8]| -> Result<Payload, CodecError> {
    ///         Ok(Payload::Text(String::from_utf8(body.to_vec())?.to_uppercase()))
    ///     })
    ///     .build();
    /// ```
    pub fn builder() -> CodecRegistryBuilder {
        CodecRegistryBuilder::new()
    }

    pub fn has_serializer(&self, name: &str) -> bool {
        self.serializers.contains_key(name)
    }

    pub fn has_deserializer(&self, name: &str) -> bool {
        self.deserializers.contains_key(name)
    }

    /// Resolve a serializer; `None` selects the pass-through serializer
    pub fn serializer(&self, name: Option<&str>) -> Result<Arc<dyn Serializer>, CodecError> {
        match name {
            None => Ok(Arc::new(PassThrough)),
            Some(name) => self
                .serializers
                .get(name)
                .cloned()
                .ok_or_else(|| CodecError::UnknownSerializer(name.to_string())),
        }
    }

    /// Resolve a deserializer; `None` selects the identity deserializer
    pub fn deserializer(&self, name: Option<&str>) -> Result<Arc<dyn Deserializer>, CodecError> {
        match name {
            None => Ok(Arc::new(BytesCodec)),
            Some(name) => self
                .deserializers
                .get(name)
                .cloned()
                .ok_or_else(|| CodecError::UnknownDeserializer(name.to_string())),
        }
    }

    pub fn list_serializers(&self) -> Vec<String> {
        let mut names: Vec<_> = self.serializers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn list_deserializers(&self) -> Vec<String> {
        let mut names: Vec<_> = self.deserializers.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        CodecRegistryBuilder::new().build()
    }
}

/// Collects codecs before the registry is frozen
pub struct CodecRegistryBuilder {
    registry: CodecRegistry,
}

impl CodecRegistryBuilder {
    pub fn new() -> Self {
        Self::empty()
            .register_serializer(BYTES_CODEC, BytesCodec)
            .register_serializer(TEXT_CODEC, TextCodec)
            .register_serializer(JSON_CODEC, JsonCodec)
            .register_deserializer(BYTES_CODEC, BytesCodec)
            .register_deserializer(TEXT_CODEC, TextCodec)
            .register_deserializer(JSON_CODEC, JsonCodec)
    }

    pub fn empty() -> Self {
        Self {
            registry: CodecRegistry::empty(),
        }
    }

    /// Register a serializer, replacing any previous one with the same name
    pub fn register_serializer(mut self, name: impl Into<String>, serializer: impl Serializer + 'static) -> Self {
        self.registry.serializers.insert(name.into(), Arc::new(serializer));
        self
    }

    /// Register a deserializer, replacing any previous one with the same name
    pub fn register_deserializer(
        mut self,
        name: impl Into<String>,
        deserializer: impl Deserializer + 'static,
    ) -> Self {
        self.registry.deserializers.insert(name.into(), Arc::new(deserializer));
        self
    }

    pub fn build(self) -> CodecRegistry {
        self.registry
    }
}

impl Default for CodecRegistryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_builtin_codecs_registered() {
        let codecs = CodecRegistry::default();

        assert_eq!(codecs.list_serializers(), vec!["bytes", "json", "text"]);
        assert_eq!(codecs.list_deserializers(), vec!["bytes", "json", "text"]);
        assert!(!codecs.has_serializer("protobuf"));
    }

    #[test]
    fn test_default_deserializer_is_identity() {
        let codecs = CodecRegistry::default();
        let payload = codecs.deserializer(None).unwrap().deserialize(b"\x00\x01raw").unwrap();
        assert_eq!(payload, Payload::Bytes(b"\x00\x01raw".to_vec()));
    }

    #[test]
    fn test_default_serializer_follows_payload() {
        let serializer = CodecRegistry::default().serializer(None).unwrap();

        assert_eq!(serializer.serialize(&Payload::from("hi")).unwrap(), b"hi");
        assert_eq!(serializer.serialize(&Payload::Bytes(vec![1, 2])).unwrap(), vec![1, 2]);
        assert_eq!(serializer.serialize(&Payload::Json(json!([1, 2]))).unwrap(), b"[1,2]");
    }

    #[test]
    fn test_json_codec() {
        let codecs = CodecRegistry::default();

        let payload = codecs
            .deserializer(Some("json"))
            .unwrap()
            .deserialize(br#"{"price": 10}"#)
            .unwrap();
        assert_eq!(payload.as_json(), Some(&json!({"price": 10})));

        assert!(codecs.deserializer(Some("json")).unwrap().deserialize(b"{oops").is_err());

        let serializer = codecs.serializer(Some("json")).unwrap();
        assert_eq!(serializer.serialize(&Payload::from("quoted")).unwrap(), br#""quoted""#);
        assert!(serializer.serialize(&Payload::Bytes(b"not json".to_vec())).is_err());
    }

    #[test]
    fn test_text_codec_rejects_invalid_utf8() {
        let codecs = CodecRegistry::default();
        let result = codecs.deserializer(Some("text")).unwrap().deserialize(&[0xff, 0xfe]);
        assert!(matches!(result, Err(CodecError::Utf8(_))));
    }

    #[test]
    fn test_unknown_names() {
        let codecs = CodecRegistry::default();
        assert!(matches!(
            codecs.serializer(Some("avro")),
            Err(CodecError::UnknownSerializer(_))
        ));
        assert!(matches!(
            codecs.deserializer(Some("avro")),
            Err(CodecError::UnknownDeserializer(_))
        ));
    }

    #[test]
    fn test_register_custom_codecs() {
        let codecs = CodecRegistry::builder()
            .register_deserializer("upper", |body: &[u8]| -> Result<Payload, CodecError> {
                Ok(Payload::Text(String::from_utf8(body.to_vec())?.to_uppercase()))
            })
            .register_serializer("reversed", |payload: &Payload| -> Result<Vec<u8>, CodecError> {
                let mut bytes = payload.to_bytes().into_owned();
                bytes.reverse();
                Ok(bytes)
            })
            .build();

        let payload = codecs.deserializer(Some("upper")).unwrap().deserialize(b"abc").unwrap();
        assert_eq!(payload, Payload::from("ABC"));
        let bytes = codecs.serializer(Some("reversed")).unwrap().serialize(&payload).unwrap();
        assert_eq!(bytes, b"CBA");
        assert!(codecs.has_serializer("json"));
    }
}
