//! HTTP daemon: public image-serving endpoints, the admin API, and the
//! streaming proxy, all over the shared [`state::AppContext`].
//!
//! `main.rs` stays thin: it resolves settings, opens the store, optionally
//! spawns the embedded worker, and serves the router built here.

pub mod api;
pub mod mirror;
pub mod routes;
pub mod state;
pub mod stream;

pub use routes::build_router;
