//! Lifecycle and log events emitted by `switchboard-runtime`, consumed by
//! whatever transport `switchboard-proxy` (or an out-of-scope metrics
//! collector) wires up. This crate only defines the vocabulary; nothing
//! here knows how an event reaches a client.

use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::error::ProcessState;

/// Which child stream a [`Event::Log`] chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogStream {
    Stdout,
    Stderr,
}

/// One out-of-band notification. Delivery is best-effort: a slow or
/// absent subscriber never blocks the producer (see
/// [`crate::ports::EventSink`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    /// A `Process` moved from one state to another.
    StateChanged {
        model: String,
        from: ProcessState,
        to: ProcessState,
        #[serde(with = "humantime_serde_opt")]
        at: SystemTime,
    },
    /// A chunk of child stdout/stderr, forwarded as it's read.
    Log {
        model: String,
        stream: LogStream,
        data: String,
    },
}

// `SystemTime` has no native serde support without an extra crate; events are
// consumed as SSE frames rendered through `serde_json`, so a minimal
// RFC3339-ish shim is enough and avoids pulling in `chrono` just for this.
mod humantime_serde_opt {
    use std::time::{SystemTime, UNIX_EPOCH};

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(t: &SystemTime, s: S) -> Result<S::Ok, S::Error> {
        let secs = t
            .duration_since(UNIX_EPOCH)
            .map_err(serde::ser::Error::custom)?
            .as_secs_f64();
        s.serialize_f64(secs)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<SystemTime, D::Error> {
        let secs = f64::deserialize(d)?;
        Ok(UNIX_EPOCH + std::time::Duration::from_secs_f64(secs))
    }
}
