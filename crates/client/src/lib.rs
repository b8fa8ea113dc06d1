// feedsync-client: realtime synchronization core for the social feed client.

pub mod api;
pub mod cache;
pub mod config;
pub mod realtime;
pub mod reconcile;
pub mod registry;
pub mod session;
