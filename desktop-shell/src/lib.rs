//! Modkeeper desktop shell
//!
//! Connects to the worker's message bus, answers install prompts and surfaces
//! status and connection notifications.

pub mod bus_client;
pub mod config;
pub mod notifications;
pub mod prompt;

pub use bus_client::{BusClient, ClientEvent, LinkState};
