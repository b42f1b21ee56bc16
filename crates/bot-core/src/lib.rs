//! Core of the civbot agent: planning state machine, command registry and oracle adapters.
//!
//! Binaries (the runner, headless experiments) share this crate and supply their own world
//! connection.

pub mod agent;
pub mod config;
pub mod llm;
