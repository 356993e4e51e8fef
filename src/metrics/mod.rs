//! Metrics for floe.
//!
//! - `events`: the `InternalEvent` trait and one struct per measurable occurrence
//! - `server`: Prometheus recorder plus the `/metrics` and `/health` endpoints

pub mod events;
pub mod server;

pub use server::init;

/// Emit an internal event.
///
/// Calls `InternalEvent::emit()` on the event, which records the matching
/// metric. Without an installed recorder this is a cheap no-op.
///
/// ```ignore
/// use floe::metrics::events::RecordsLoaded;
///
/// emit!(RecordsLoaded { table: "clicks".into(), count: 150 });
/// ```
#[macro_export]
macro_rules! emit {
    ($event:expr) => {
        $crate::metrics::events::InternalEvent::emit($event)
    };
}
