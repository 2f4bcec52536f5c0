//! # Vigil
//!
//! Alert rule evaluation, state tracking and notification routing.
//!
//! Vigil evaluates alert rules on a fixed cadence, tracks every
//! (rule, label set) instance through a pending/firing state machine, and
//! routes the resulting notifications through an Alertmanager-compatible
//! routing tree. Several replicas can run side by side; a lease-based dedup
//! layer keeps delivery to one replica per notification.
//!
//! ## Architecture
//!
//! - **Scheduler**: one worker per rule group, ticks aligned to the group interval
//! - **State**: per-instance state machine with `for` hysteresis and resend
//! - **Routing**: matchers, route tree, aggregation groups and timed flushes
//! - **Dedup**: lease coordination over Redis for HA deployments
//! - **Config store**: validated, atomically published Alertmanager configuration
//! - **Live queries**: cancelable ad-hoc evaluation for rule editing
//! - **API**: REST API for configuration, evaluation and instance administration
//!
//! ## Wiring
//!
//! ```ignore
//! let store = Arc::new(ConfigStore::open(Arc::new(PostgresPersister::connect(&config.database).await?)).await?);
//! let dispatcher = Arc::new(Dispatcher::new(store.clone(), Arc::new(HttpNotifier::new(&config.notifier)?), config.notifier.flush_tick));
//! let coordinator = Arc::new(RedisCoordinator::new(&config.redis)?);
//! let sender = with_dedup(dispatcher.clone(), coordinator, &config.dedup);
//! let state = Arc::new(StateManager::new(config.state.clone()));
//! let scheduler = Scheduler::new(evaluator, state, sender, config.scheduler.clone());
//! scheduler.start(cancel.clone());
//! tokio::spawn(async move { dispatcher.run(cancel).await });
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

pub mod api;
pub mod config;
pub mod configstore;
pub mod dedup;
pub mod error;
pub mod evaluation;
pub mod live;
pub mod logging;
pub mod models;
pub mod notify;
pub mod routing;
pub mod scheduler;
pub mod state;

pub use config::Config;
pub use error::{Error, Result};

/// Re-exports for convenience
pub mod prelude {
    pub use crate::configstore::{ConfigStore, PostableUserConfig};
    pub use crate::config::Config;
    pub use crate::dedup::DedupLayer;
    pub use crate::error::{Error, Result};
    pub use crate::evaluation::{Evaluator, QueryExecutor};
    pub use crate::models::*;
    pub use crate::routing::Dispatcher;
    pub use crate::scheduler::{AlertSender, Scheduler};
    pub use crate::state::StateManager;
}
