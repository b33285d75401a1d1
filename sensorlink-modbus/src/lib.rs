//! Modbus RTU sensor polling station.
//!
//! Polls a fixed set of sensors sharing one serial bus, decodes their
//! registers through declarative protocol tables, and uploads one snapshot
//! per cycle to an HTTP collector.
//!
//! # Data flow
//!
//! ```text
//! protocol table -> device -> read_value -> CycleController -> uplink
//! ```
//!
//! - [`protocol`] - register descriptors and built-in device tables
//! - [`device`] - bus address bound to a table
//! - [`reader`] - one live read, decoded to a raw value
//! - [`poller`] - schedule state and the cycle controller
//! - [`transport`] / [`uplink`] - bus and network collaborators

pub mod config;
pub mod device;
pub mod poller;
pub mod protocol;
pub mod reader;
pub mod transport;
pub mod uplink;
