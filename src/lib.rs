//! Census statistics pipeline: resolve a geography scope, batch-fetch
//! variables for every instance, join boundaries for the same vintage, derive
//! columns and hand the result to a sink.

pub mod boundaries;
pub mod census_api;
pub mod config;
pub mod domain;
pub mod error;
pub mod fetcher;
pub mod geography;
pub mod geometry;
pub mod joiner;
pub mod logging;
pub mod pipeline;
pub mod resolver;
pub mod sink;
pub mod source;
pub mod store;
pub mod transform;
