//! Library crate for proxy-probe-rs exposing the probing engine and its collaborators.
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod probe;
pub mod runner;
pub mod server;
pub mod sink;
pub mod source;
pub mod types;
