// crates/engram-server/src/db/mod.rs
// Database layer: pools, schema, per-project stores

pub mod messages;
pub mod pool;
pub mod projects;
pub mod schema;

pub use pool::DatabasePool;
pub use projects::ProjectDatabases;
