pub mod cache;
pub mod descriptor;
pub mod error;
pub mod http;
pub mod models;
pub mod normalize;
pub mod orchestrator;
pub mod pipeline;
pub mod primitives;
pub mod registry;
pub mod subtitles;
pub mod walker;

pub use cache::{CacheKey, ResultCache};
pub use descriptor::{ProviderDescriptor, load_descriptors, parse_descriptors};
pub use error::{AggregateResolutionError, DecodeError, ProviderAttempt, ResolutionError};
pub use http::{DynHttpClient, HttpClient, ReqwestHttpClient};
pub use models::{MediaType, ProviderHealth, ResolutionRequest, ResolutionResult, Subtitle};
pub use orchestrator::{ResolutionOrchestrator, ResolverConfig};
pub use pipeline::{DecodePipeline, DecodeStep, ResultValidator};
pub use registry::{BreakerConfig, ProviderRegistry};
pub use subtitles::{DynSubtitleService, HttpSubtitleService, SubtitleService};
pub use walker::HopChainWalker;
