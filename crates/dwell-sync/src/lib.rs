//! Host application bridge for dwell.
//!
//! Delivers engine messages to the host over an unreliable channel:
//! - `Bridge`: breaker-guarded sends with timeouts and a debounced outbox
//! - `CircuitBreaker`: closed / open / half-open, driven by an injected clock
//! - `RetryQueue`: bounded backoff queue for critical messages

pub mod breaker;
mod bridge;
pub mod channel;
mod outbox;
pub mod retry;

pub use breaker::{CircuitBreaker, CircuitState};
pub use bridge::{Bridge, SendOutcome};
pub use channel::{Channel, ChannelError, HostChannel, HttpChannel, JsonLinesChannel};
pub use outbox::Outbox;
pub use retry::{RetryQueue, SyncQueueItem, backoff};
