//! Alertmanager configuration storage

mod model;
mod persister;
mod store;

pub use model::{
    zero_time, GettableApiAlertingConfig, GettableApiReceiver, GettableGrafanaReceiver,
    GettableUserConfig, PostableApiAlertingConfig, PostableApiReceiver, PostableGrafanaReceiver,
    PostableUserConfig, Route, DEFAULT_RECEIVER,
};
pub use persister::{ConfigPersister, InMemoryPersister, PostgresPersister, StoredConfig};
pub use store::{ActiveConfig, ConfigStore, ValidationReport};
