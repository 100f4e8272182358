// tandem-client library: sync engine, relay connection and client runtime.

pub mod config;
pub mod engine;
pub mod relay;
pub mod runtime;
