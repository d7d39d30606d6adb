//! Client-side rate limiting with an approximated sliding window, shared
//! across limiter instances through a central counting datastore.
//!
//! Each [`Limiter`] admits events locally against two fixed windows and lets
//! its current window reconcile with the [`Datastore`] through a
//! [`Synchronizer`], either inline ([`BlockingSynchronizer`]) or on a worker
//! thread ([`NonblockingSynchronizer`]).

pub mod config;
pub mod datastore;
pub mod error;
pub mod handlers;
pub mod health;
pub mod limiter;
pub mod metrics;
pub mod redis;
pub mod server;
pub mod synchronizer;
pub mod window;

pub use config::{Cli, LimiterConfig, SyncMode};
pub use datastore::{Datastore, MemoryDatastore};
pub use error::{LimiterError, LimiterResult};
pub use limiter::{Limiter, WindowSnapshot};
pub use crate::redis::RedisDatastore;
pub use server::create_app;
pub use synchronizer::{
    BlockingSynchronizer, NonblockingSynchronizer, SyncRequest, SyncResponse, Synchronizer,
};
pub use window::{LocalWindow, StopFn, SyncWindow, Window};
