//! vigil-core: identity index, capture debouncing and face inference.
//!
//! Faces are detected and embedded with ONNX Runtime models. Embeddings are
//! matched against a catalog of enrolled members through an angular
//! random-projection forest, with a k-NN majority vote deciding identity.

pub mod catalog;
pub mod debounce;
pub mod detector;
pub mod extractor;
pub mod forest;
pub mod persist;
pub mod resolver;
pub mod store;
pub mod types;

pub use catalog::{parse_catalog, CatalogEntry, CatalogError};
pub use debounce::{CaptureDebouncer, DebounceConfig, Decision};
pub use detector::{OnnxPresenceDetector, PresenceDetector};
pub use extractor::{EmbeddingExtractor, OnnxExtractor};
pub use forest::{ForestConfig, IndexError, Neighbor};
pub use resolver::{IdentityResolver, Resolution, ResolverConfig};
pub use store::{Generation, IdentityIndex};
pub use types::{
    BoundingBox, CaptureEvent, Embedding, IdentificationResult, IdentityRecord, MemberId, PresenceSample,
};
