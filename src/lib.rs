#![doc = include_str!("../README.md")]
#![forbid(unsafe_code)]
#![deny(elided_lifetimes_in_paths, unreachable_pub)]
#![warn(
    missing_docs,
    clippy::doc_link_with_quotes,
    clippy::doc_markdown,
    clippy::missing_errors_doc
)]

pub mod config;
mod connection;
#[cfg(test)]
mod dummy;
pub mod error;
mod metrics;
mod pool;
mod reaper;
mod resource;

pub use crate::{
    config::{ConfigBuilder, ConnectionConfig, PoolConfig, PoolConfigError},
    connection::{ConnError, Connection, ConnectionFactory},
    error::Error,
    metrics::PoolState,
    pool::{Pool, ShutdownSummary},
    resource::PooledConnection,
};
