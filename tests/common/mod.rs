//! Shared helpers for integration tests.

pub mod containers;

#[allow(unused_imports)]
pub use containers::{redis_container, redis_url, TestMongo, TestRedis};
