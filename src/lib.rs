pub mod archive;
pub mod candidates;
pub mod cloud;
pub mod config;
pub mod domain;
pub mod error;
pub mod fs_util;
pub mod output;
pub mod params;
pub mod probe;
pub mod resolver;
pub mod retrieval;
pub mod sidecar;
pub mod store;
