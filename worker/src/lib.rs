//! Modkeeper worker - the background half of the desktop mod manager
//!
//! Hosts the local message bus server, turns finished downloads into
//! interactive install workflows and keeps install statistics in SQLite.

pub mod app_state;
pub mod bus;
pub mod config;
pub mod downloads;
pub mod persistence;
pub mod pipeline;
pub mod settings;
