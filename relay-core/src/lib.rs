//! Streaming-delivery and concurrency-control engine for chatrelay.
//!
//! Generation output arrives as a lazy stream of text fragments and leaves as
//! full-text pushes to a rate-limited messaging surface. The dispatcher owns
//! the per-session state machine; the governor and thread lock hold the only
//! state shared between concurrent sessions.

mod buffer;
mod config;
mod delivery;
mod dispatcher;
mod error;
mod events;
mod fence;
mod governor;
mod lock;
mod producer;
mod session;
mod types;
mod watchdog;

pub use buffer::StreamBuffer;
pub use config::StreamingConfig;
pub use delivery::{DeliverySink, FailureKind, PushAck, PushKind, PushUpdate};
pub use dispatcher::{DispatchRequest, SessionOutcome, SessionReport, StreamDispatcher};
pub use error::{ConfigError, DispatchError, LockBusy, ProducerError, PushError};
pub use events::{EventBus, EventKind, RelayEvent};
pub use fence::{FenceKind, OpenRegion, balance, unclosed_region};
pub use governor::{
    CircuitState, CircuitTransition, DenyReason, DestinationStatus, GovernorPolicy, PushPermit,
    RateGovernor,
};
pub use lock::{HeldLock, LeaseNotice, LeaseReceiver, ReleasedLock, ThreadLock};
pub use producer::FragmentStream;
pub use session::{SessionState, StreamSession};
pub use types::{DestinationId, SessionToken, ThreadId};
pub use watchdog::LockWatchdog;
