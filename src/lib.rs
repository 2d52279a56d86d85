#![deny(missing_docs)]
#![doc = include_str!("../README.md")]

/// Possible errors in this library.
pub mod error;

/// Subject/subscriber primitive used by events, devices, and connections.
pub mod publisher;

/// The fan-out connection: one transport, many observers.
pub mod connection;

/// The observer future surface shared by commands and events.
pub mod observer;

/// Commands: observers that write a CMD string and parse its output.
pub mod command;

/// Events: long-lived observers matching patterns against inbound text.
pub mod event;

/// Runners drive observers to completion under deadlines.
pub mod runner;

/// Periodic/deferred callback service used by timeouts and housekeeping.
pub mod scheduler;

/// Per-target operational state machine with hop transitions.
pub mod device;

/// Registry mapping device name -> live device.
pub mod factory;

/// Pre-parsed configuration structures.
pub mod config;

/// Logging/tracing setup.
pub mod logging;

/// The built-in command catalog.
pub mod cmd;

/// Mocked wire driver, for tests without real transports.
pub mod mock;
