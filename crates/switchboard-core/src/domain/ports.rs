//! Port traits: the seams that keep `switchboard-runtime`'s domain logic
//! decoupled from any particular transport. A `Process`/`ProcessGroup`/
//! `ProxyManager` only ever emits through `&dyn EventSink`; who's actually
//! listening (an SSE endpoint, a metrics collector, nobody at all in a
//! unit test) is a composition-root concern.

use crate::domain::event::Event;

/// Receives lifecycle and log events. Implementations must not block the
/// caller — a full or absent subscriber should drop events rather than
/// apply backpressure to the request path emitting them.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: Event);
}

/// An `EventSink` that discards everything. Used where no observer is
/// wired up (unit tests, `ProxyManager`s constructed without an event
/// bus).
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn emit(&self, _event: Event) {}
}
