//! Self-describing persisted encoding.
//!
//! Every encoded object is a `TypedBlob`: a type tag plus an opaque payload.
//! A tree node's payload is a postcard-encoded list of blobs, its children
//! first and its network last. Network payloads are decoded through an
//! explicit `DecoderRegistry` owned by the caller.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// Errors that can occur during encoding.
#[derive(Debug, Error)]
pub enum EncodeError {
    /// Postcard encoding error.
    #[error("encoding error: {0}")]
    Encoding(#[from] postcard::Error),
}

/// Errors that can occur during decoding. Persisted data is untrusted, so
/// every malformed input ends up here rather than in a panic.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Postcard decoding error (truncated or corrupt bytes).
    #[error("decoding error: {0}")]
    Decoding(#[from] postcard::Error),

    /// A node encoding must contain at least its network.
    #[error("invalid node slice: empty element list")]
    EmptyList,

    /// A non-final element of a node encoding was not a node.
    #[error("invalid node slice: element {index} has tag {tag:?}, expected a node")]
    ExpectedNode { index: usize, tag: String },

    /// No decoder is registered for the network tag.
    #[error("unknown network type {0:?}")]
    UnknownNetworkTag(String),

    /// A dense layer's parameter buffers do not match its declared shape.
    #[error("layer {layer} has parameters of the wrong shape")]
    ParameterShape { layer: usize },

    /// Consecutive dense layers disagree on their sizes.
    #[error("layer {layer} expects input size {expected}, found {found}")]
    LayerSize {
        layer: usize,
        expected: usize,
        found: usize,
    },

    /// A network must contain at least one dense layer to have known sizes.
    #[error("network has no dense layer")]
    NoDenseLayer,

    /// Nodes nested deeper than the decode limit.
    #[error("node nesting exceeds {0} levels")]
    TooDeep(usize),

    /// The decoded tree is inconsistent with its own networks.
    #[error("invalid tree structure: {0}")]
    Structure(#[from] crate::node::StructureError),
}

/// A type tag plus its payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypedBlob {
    pub tag: String,
    pub payload: Vec<u8>,
}

impl TypedBlob {
    pub fn new(tag: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            tag: tag.into(),
            payload,
        }
    }
}

/// Encodes a list of blobs (count-prefixed).
pub fn encode_list(list: &[TypedBlob]) -> Result<Vec<u8>, EncodeError> {
    Ok(postcard::to_allocvec(list)?)
}

pub fn decode_list(bytes: &[u8]) -> Result<Vec<TypedBlob>, DecodeError> {
    Ok(postcard::from_bytes(bytes)?)
}

/// Decodes a network payload.
pub type DecodeFn<N> = fn(&[u8]) -> Result<N, DecodeError>;

/// Maps network type tags to decoders. Passed explicitly into every decode
/// call; there is no process-wide registration.
pub struct DecoderRegistry<N> {
    decoders: HashMap<String, DecodeFn<N>>,
}

impl<N> DecoderRegistry<N> {
    pub fn new() -> Self {
        Self {
            decoders: HashMap::new(),
        }
    }

    /// Registers `decode` for `tag`, replacing any earlier entry.
    pub fn register(&mut self, tag: impl Into<String>, decode: DecodeFn<N>) -> &mut Self {
        self.decoders.insert(tag.into(), decode);
        self
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.decoders.contains_key(tag)
    }

    /// Decodes a network blob with the decoder registered for its tag.
    pub fn decode(&self, blob: &TypedBlob) -> Result<N, DecodeError> {
        let decode = self
            .decoders
            .get(&blob.tag)
            .ok_or_else(|| DecodeError::UnknownNetworkTag(blob.tag.clone()))?;
        decode(&blob.payload)
    }
}

impl<N> Default for DecoderRegistry<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<N> fmt::Debug for DecoderRegistry<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut tags: Vec<&String> = self.decoders.keys().collect();
        tags.sort();
        f.debug_struct("DecoderRegistry").field("tags", &tags).finish()
    }
}

impl DecoderRegistry<crate::network::Network> {
    /// Registry knowing the default `Network`.
    pub fn with_default_network() -> Self {
        let mut registry = Self::new();
        registry.register(crate::network::Network::TYPE_TAG, crate::network::Network::decode);
        registry
    }
}
