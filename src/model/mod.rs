//! Entity model for the local mirror.

pub mod batch;
pub mod certificate;
pub mod meter;
pub mod subscription;
pub mod technology;
pub mod user;

pub use batch::{
    Batch, BatchState, ComposedBatch, ComposedRetire, ComposedTarget, BatchTransaction,
    RetireSubject, SplitTarget, TransactionDetail, TransactionKind,
};
pub use certificate::{Certificate, NewCertificate};
pub use meter::Meter;
pub use subscription::{Subscription, WebhookEvent};
pub use technology::Technology;
pub use user::{NewUser, User};
