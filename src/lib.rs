// src/lib.rs
// Public library surface for integration tests (and potential reuse).

pub mod api;
pub mod bus;
pub mod config;
pub mod delivery;
pub mod metrics;
pub mod payment;
pub mod poller;
pub mod source;
pub mod store;

// ---- Re-exports for stable public API ----
pub use crate::api::{create_router, AppState};
pub use crate::bus::{EventBus, PollerSignal};
pub use crate::payment::{Payment, WebhookEnvelope};
pub use crate::poller::{PollerHandle, PollerState, SessionPoller, TriggerOutcome};
pub use crate::store::PaymentStore;
