//! Warden - supervision decorators for pooled infrastructure
//!
//! Instruments message-broker clients, thread pools and relational pools
//! and publishes their live statistics on a management bus:
//!
//! - `advice`: counting decorators around a broker client
//! - `caching`: session-caching connection factory with runtime tunables
//! - `listener`: message-driven consumers with managed start/stop
//! - `leak`: open-resource tracking and leak reports for broker clients
//! - `profiling`: per-fingerprint invocation statistics
//! - `executor`, `datasource`: managed pools
//! - `management`: structured names and the bus objects are published on

pub mod advice;
pub mod broker;
pub mod caching;
pub mod config;
pub mod datasource;
pub mod executor;
pub mod leak;
pub mod listener;
pub mod management;
pub mod profiling;
pub mod utils;
