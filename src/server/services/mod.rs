pub mod playback_proxy_services;
pub mod resolver_services;

pub use playback_proxy_services::DynPlaybackProxy;
pub use resolver_services::ResolverServices;
