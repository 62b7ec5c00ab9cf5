//! Utilities for testing code on top of a session without a real MQTT server. They are used by
//!  this crate's own tests, and they are exported for application testing.

pub mod broker;
pub mod broken_writer;
