// Wire protocol for the realtime push channel.

pub mod envelope;
