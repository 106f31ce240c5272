//! Infrastructure layer: metadata store, change feeds, handlers, dispatch.
//!
//! Wiring, leaf first:
//!
//! ```text
//! MetadataStore --(PublishingMetadataStore)--> ChangePublisher
//!                                                   |
//!                  StaleJobSweeper --(Rescan)-------+
//!                                                   v
//!                                              ChangeSource --> Dispatcher --> HandlerRegistry
//!                                                                                  |
//!                         MarkFailedToEnqueueHandler <-----------------------------+
//!                                  |
//!                                  +--> MetadataStore::conditional_update
//! ```

pub mod change_feed;
pub mod config;
pub mod delivery_failures;
pub mod dispatcher;
pub mod handlers;
pub mod metadata_store;
pub mod sweeper;


pub use config::{ChangeStreamConfig, CleanupConfig, ConfigError, MetadataStoreConfig};
pub use delivery_failures::{
    DeliveryFailureSink, InMemoryDeliveryFailures, LoggingDeliveryFailures,
    PermanentDeliveryFailure,
};
pub use dispatcher::{
    DeliveryReport, Dispatcher, DispatcherConfig, DispatcherHandle, DispatcherStats, Health,
    PairResolution, RetryPolicy,
};
pub use handlers::{
    HandlerRegistry, MarkFailedToEnqueueConfig, MarkFailedToEnqueueHandler, RegistryError,
};
pub use metadata_store::{
    InMemoryMetadataStore, MetadataStore, MetadataStoreError, PostgresMetadataStore,
    PublishingMetadataStore, UpdateOutcome,
};
pub use sweeper::{StaleJobSweeper, SweepError, SweeperConfig};
