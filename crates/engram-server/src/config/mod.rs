// crates/engram-server/src/config/mod.rs
// Configuration module

mod env;

pub use env::{Endpoints, ServiceConfig};
