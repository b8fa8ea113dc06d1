// feedsync-common: wire protocol and domain types shared across feedsync crates

pub mod protocol;
pub mod types;
