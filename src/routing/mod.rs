//! Route selection machinery: alias resolution, cooldown suppression,
//! fallback aliasing, load balancing, and retry policy.
//!
//! Everything here is synchronous and I/O-free; the dispatch engine composes
//! these pieces around the upstream client.

pub mod balancer;
pub mod cooldown;
pub mod fallback;
pub mod resolver;
pub mod retry;

pub use balancer::LoadBalancer;
pub use cooldown::CooldownRegistry;
pub use fallback::FallbackStrategy;
pub use resolver::RouteResolver;
pub use retry::RetryStrategy;
