pub mod converter;
pub mod models;
pub mod normalizer;
pub mod provider;
pub mod sse;

pub mod mock;

pub use mock::{MockProvider, MockResponse};
pub use models::ModelCatalog;
pub use normalizer::{BlockNormalizer, NormalizeError, NormalizedStream, NormalizerConfig, UsageHandle};
pub use provider::AnthropicProvider;
