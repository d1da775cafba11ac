//! Host-side helpers.

pub mod bootstrap;
