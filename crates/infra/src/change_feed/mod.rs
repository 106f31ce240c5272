//! Durable change-feed implementations.
//!
//! The change-feed traits and the in-memory feed live in `jobsweep-events`.
//! This module provides infrastructure-backed implementations (Redis).

#[cfg(feature = "redis")]
pub mod redis_streams;

#[cfg(feature = "redis")]
pub use redis_streams::{RedisStreamsChangeFeed, RedisStreamsError};
