//! Domain types and error taxonomy shared by every other crate in the
//! workspace. Nothing here spawns a process, opens a socket, or knows
//! about HTTP — see `switchboard-runtime` and `switchboard-proxy` for that.

#![deny(unsafe_code)]

pub mod domain;
pub mod error;

pub use domain::{Config, ConfigError, Event, EventSink, GroupConfig, LogStream, ModelConfig, NoopEventSink};
pub use error::{CoreError, ProcessState, StopMode};
