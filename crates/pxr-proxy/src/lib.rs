//! Proxy routing: host policy, pool resolution, endpoint selection with
//! binding overrides, circuit-breaker accounting, and the rendezvous
//! bindings recomputer.

pub mod breaker;
pub mod rendezvous;
pub mod routing;

pub use breaker::BreakerConfig;
pub use routing::{
    host_from_url, resolve_pool_id_for_host, select_proxy_uri_for_url, should_use_proxy_for_host,
    ProxySelectError, ProxyUri,
};
