//! Governed invocation of registry tools with caching, redaction and
//! normalization of results.

pub mod cache;
pub mod normalizer;
pub mod pipeline;
pub mod redact;

pub use cache::{cache_key, CacheConfig, ResultCache};
pub use normalizer::{normalize, EvidenceEvent};
pub use pipeline::{BatchOutcome, InvocationRequest, Invoker};
pub use redact::{NoopRedactor, RedactionError, Redactor};
