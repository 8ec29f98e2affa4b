//! ==============================================================================
//! plant sensor node
//! ==============================================================================
//!
//! polls four hub-port sensors (temperature, illuminance, humidity and the
//! soil-moisture voltage ratio) and pushes readings that changed to an http
//! endpoint as flat json.
//!
//! modules:
//!     - config.rs:  sensor-node.toml schema and loader
//!     - domain.rs:  Reading, Payload, unit conversion, soil classification
//!     - filter.rs:  per-sensor deadband
//!     - hal.rs:     channel abstraction (phidget22 bridge + mock)
//!     - sensors.rs: opens the bank, guards every handle
//!     - uplink.rs:  http POST wrapper
//!     - runtime.rs: polling tasks, uplink task, shutdown
//!
//! ==============================================================================

pub mod config;
pub mod domain;
pub mod filter;
pub mod hal;
pub mod runtime;
pub mod sensors;
pub mod uplink;
