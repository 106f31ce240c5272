//! Change events and the handler capability.
//!
//! Mechanics only: what an observed metadata mutation looks like, how it is
//! received and acknowledged, and the contract handlers implement. Concrete
//! stores, handlers and the dispatcher live in `jobsweep-infra`.

pub mod change;
pub mod handler;
pub mod in_memory;
pub mod notification;
pub mod source;

pub use change::{ChangeEvent, ChangeKind};
pub use handler::{ChangeHandler, HandlerError, HandlerOutcome};
pub use in_memory::{InMemoryChangeFeed, InMemoryFeedError};
pub use notification::{
    InMemoryNotifier, JobFailedNotice, LoggingNotifier, NotifyError, Notifier,
};
pub use source::{ChangePublisher, ChangeSource, Delivery, DeliveryReceipt};
