//! Event fan-out: an in-process bus for pipeline milestones and the
//! webhook publisher that notifies subscribers of received
//! certificates.

pub mod bus;
pub mod delivery;
pub mod publisher;

pub use bus::{spawn_logging_listener, EventBus, VaultEvent};
pub use delivery::{sign_body, WebhookDeliverer, SIGNATURE_HEADER};
pub use publisher::EventPublisher;
