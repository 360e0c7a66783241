//! dgw-client: device-side library for the control gateway.
//!
//! Maintains a persistent, authenticated connection to the gateway with
//! automatic reconnection, answers heartbeats, and dispatches operator
//! commands to a user-supplied handler whose outcome is acknowledged back.

pub mod client;

pub use client::{
    ClientConfig, CommandHandler, CommandOutcome, ConnectedCallback, DeviceClient,
};
