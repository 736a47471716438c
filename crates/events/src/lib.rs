//! `postrelay-events` — outcome event distribution.
//!
//! The lifecycle manager never calls the notification collaborator
//! directly: terminal outcomes are committed to the job store first, then
//! emitted here as [`OutcomeEvent`]s. Delivery failure is logged by the
//! publisher and never rolls back the outcome write.

pub mod bus;
pub mod in_memory_bus;
pub mod outcome;

pub use bus::{EventBus, Subscription};
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
pub use outcome::{OutcomeEvent, TenantScoped};
