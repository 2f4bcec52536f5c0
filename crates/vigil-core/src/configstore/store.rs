//! Validated, atomically published Alertmanager configuration

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::error::{Error, Result};
use crate::notify::{validate_settings, Integration, NotifierType};
use crate::routing::RouteTree;

use super::model::{GettableApiReceiver, GettableUserConfig, PostableGrafanaReceiver, PostableUserConfig};
use super::persister::ConfigPersister;

/// Findings that do not prevent a configuration from being saved
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ValidationReport {
    /// Receivers no route delivers to
    pub unused_receivers: Vec<String>,
}

/// The configuration currently in effect
#[derive(Debug)]
pub struct ActiveConfig {
    /// Version reported by the persister
    pub version: i64,
    /// Full configuration, secrets included
    pub config: PostableUserConfig,
    /// Compiled routing tree
    pub tree: RouteTree,
    integrations: HashMap<String, Vec<Integration>>,
}

impl ActiveConfig {
    /// Integrations of a receiver; empty when the receiver does not exist
    pub fn integrations(&self, receiver: &str) -> &[Integration] {
        self.integrations
            .get(receiver)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

/// Owns the Alertmanager configuration.
///
/// Saving runs validate, secret merge, apply and commit under one write lock.
/// Readers always see either the previous or the new configuration.
pub struct ConfigStore {
    persister: Arc<dyn ConfigPersister>,
    active: ArcSwap<ActiveConfig>,
    write_lock: Mutex<()>,
}

impl ConfigStore {
    /// Load the latest committed configuration, saving the default one on a blank start
    pub async fn open(persister: Arc<dyn ConfigPersister>) -> Result<Self> {
        let active = match persister.load().await? {
            Some(stored) => match Self::apply(&stored.config) {
                Ok(mut active) => {
                    active.version = stored.version;
                    info!(version = stored.version, "Loaded alerting configuration");
                    active
                }
                Err(e) => {
                    error!(version = stored.version, error = %e, "Stored configuration cannot be applied, using default");
                    Self::apply(&PostableUserConfig::default_config())?
                }
            },
            None => {
                let default = PostableUserConfig::default_config();
                let mut active = Self::apply(&default)?;
                active.version = persister.save(&default).await?;
                info!(version = active.version, "Saved default alerting configuration");
                active
            }
        };

        Ok(Self {
            persister,
            active: ArcSwap::from_pointee(active),
            write_lock: Mutex::new(()),
        })
    }

    /// Snapshot of the configuration in effect
    pub fn active(&self) -> Arc<ActiveConfig> {
        self.active.load_full()
    }

    /// The configuration in effect with secrets redacted
    pub fn read(&self) -> GettableUserConfig {
        self.active.load().config.redacted()
    }

    /// The routing tree in effect
    pub fn route_tree(&self) -> RouteTree {
        self.active.load().tree.clone()
    }

    /// One receiver of the configuration in effect, secrets redacted
    pub fn receiver(&self, name: &str) -> Option<GettableApiReceiver> {
        self.active.load().config.receiver(name).map(Into::into)
    }

    /// Structural checks: receiver names, integration types and the routing tree
    pub fn validate(config: &PostableUserConfig) -> Result<ValidationReport> {
        let am = &config.alertmanager_config;
        let route = am
            .route
            .as_ref()
            .ok_or_else(|| Error::config_validation("no route provided in config"))?;

        let mut names = BTreeSet::new();
        let mut uids = BTreeSet::new();
        for receiver in &am.receivers {
            if receiver.name.is_empty() {
                return Err(Error::config_validation("receiver name must not be empty"));
            }
            if !names.insert(receiver.name.as_str()) {
                return Err(Error::config_validation(format!(
                    "duplicate receiver name {:?}",
                    receiver.name
                )));
            }

            for integration in &receiver.grafana_managed_receiver_configs {
                if integration.name.is_empty() {
                    return Err(Error::config_validation(format!(
                        "integration of receiver {:?} has no name",
                        receiver.name
                    )));
                }
                integration.kind.parse::<NotifierType>()?;
                if !integration.uid.is_empty() && !uids.insert(integration.uid.as_str()) {
                    return Err(Error::config_validation(format!(
                        "integration uid {:?} is not unique",
                        integration.uid
                    )));
                }
            }
        }

        let tree = RouteTree::build(route, names.iter().copied())?;
        let referenced = tree.referenced_receivers();

        let unused_receivers: Vec<String> = names
            .iter()
            .filter(|n| !referenced.contains(**n))
            .map(|n| n.to_string())
            .collect();
        for name in &unused_receivers {
            warn!(receiver = %name, "Receiver is not referenced by any route");
        }

        Ok(ValidationReport { unused_receivers })
    }

    /// Build everything the configuration needs at runtime without publishing it
    pub fn apply(config: &PostableUserConfig) -> Result<ActiveConfig> {
        let am = &config.alertmanager_config;
        let route = am
            .route
            .as_ref()
            .ok_or_else(|| Error::config_validation("no route provided in config"))?;

        let mut integrations = HashMap::new();
        for receiver in &am.receivers {
            let built = receiver
                .grafana_managed_receiver_configs
                .iter()
                .map(build_integration)
                .collect::<Result<Vec<_>>>()?;
            integrations.insert(receiver.name.clone(), built);
        }

        let tree = RouteTree::build(route, am.receivers.iter().map(|r| r.name.as_str()))?;

        Ok(ActiveConfig {
            version: 0,
            config: config.clone(),
            tree,
            integrations,
        })
    }

    /// Validate, merge secrets, apply, commit and publish a new configuration.
    ///
    /// Any failure leaves the configuration in effect untouched.
    pub async fn save(&self, config: PostableUserConfig) -> Result<ValidationReport> {
        let _guard = self.write_lock.lock().await;

        let report = Self::validate(&config)?;
        let current = self.active.load_full();
        let merged = merge_secrets(config, &current.config);
        let active = Self::apply(&merged)?;

        self.commit(active).await?;
        metrics::counter!("vigil_config_saves_total").increment(1);
        Ok(report)
    }

    /// Remove a receiver that no route references
    pub async fn delete_receiver(&self, name: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        let current = self.active.load_full();
        if current.config.receiver(name).is_none() {
            return Err(Error::not_found("Receiver", name));
        }
        if current.tree.referenced_receivers().contains(name) {
            return Err(Error::config_validation(format!(
                "receiver {name:?} is referenced by the routing tree"
            )));
        }

        let mut config = current.config.clone();
        config.alertmanager_config.receivers.retain(|r| r.name != name);
        let active = Self::apply(&config)?;

        self.commit(active).await?;
        info!(receiver = %name, "Receiver deleted");
        Ok(())
    }

    async fn commit(&self, mut active: ActiveConfig) -> Result<()> {
        active.version = self.persister.save(&active.config).await?;
        info!(
            version = active.version,
            receivers = active.config.alertmanager_config.receivers.len(),
            "Alerting configuration committed"
        );
        self.active.store(Arc::new(active));
        Ok(())
    }
}

fn build_integration(r: &PostableGrafanaReceiver) -> Result<Integration> {
    let kind: NotifierType = r.kind.parse()?;

    validate_settings(kind, &r.settings, &r.secure_settings).map_err(|e| {
        let reason = match e {
            Error::Validation(msg) => msg,
            other => other.to_string(),
        };
        Error::config_apply(format!(
            "failed to validate receiver {:?} of type {:?}: {reason}",
            r.name, r.kind
        ))
    })?;

    Ok(Integration {
        uid: r.uid.clone(),
        name: r.name.clone(),
        kind,
        disable_resolve_message: r.disable_resolve_message,
        settings: r.settings.clone(),
        secure_settings: r.secure_settings.clone(),
    })
}

/// Carry prior secrets into `config`.
///
/// A non-empty submitted value replaces the secret; an empty or omitted one
/// keeps the prior value. Integrations are matched by uid, else by receiver
/// and integration name, and only when the type is unchanged.
fn merge_secrets(mut config: PostableUserConfig, prior: &PostableUserConfig) -> PostableUserConfig {
    let by_uid: HashMap<&str, &PostableGrafanaReceiver> = prior
        .alertmanager_config
        .receivers
        .iter()
        .flat_map(|r| r.grafana_managed_receiver_configs.iter())
        .filter(|i| !i.uid.is_empty())
        .map(|i| (i.uid.as_str(), i))
        .collect();

    for receiver in &mut config.alertmanager_config.receivers {
        for integration in &mut receiver.grafana_managed_receiver_configs {
            let previous = by_uid
                .get(integration.uid.as_str())
                .copied()
                .filter(|_| !integration.uid.is_empty())
                .or_else(|| {
                    prior.receiver(&receiver.name).and_then(|r| {
                        r.grafana_managed_receiver_configs
                            .iter()
                            .find(|i| i.name == integration.name)
                    })
                })
                .filter(|p| p.kind == integration.kind);

            let Some(previous) = previous else {
                continue;
            };

            let mut merged: BTreeMap<String, String> = previous.secure_settings.clone();
            for (key, value) in std::mem::take(&mut integration.secure_settings) {
                if !value.is_empty() || !merged.contains_key(&key) {
                    merged.insert(key, value);
                }
            }
            integration.secure_settings = merged;
        }
    }

    config
}
