//! Modkeeper launcher
//!
//! Starts the worker and the desktop shell on a shared rendezvous port,
//! restarts the worker when it crashes and tears everything down when the UI
//! goes away.

pub mod config;
pub mod supervisor;
