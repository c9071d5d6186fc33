//! Target validation settings
//!
//! Whether usage data may downgrade breaking changes for a target, and with
//! which window, threshold, fan-out targets and excluded clients. Resolution
//! fails safe: disabled validation, an empty fan-out or an unreadable
//! settings store all resolve to `None`, meaning every coordinate counts as
//! used.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{RegistryError, Result};
use crate::usage::TargetId;

pub const DEFAULT_PERCENTAGE: f64 = 0.0;
pub const DEFAULT_PERIOD_DAYS: u32 = 30;
pub const MAX_PERIOD_DAYS: u32 = 366;

/// Stored validation settings of one target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationSettings {
    pub enabled: bool,
    pub percentage: f64,
    pub period_days: u32,
    /// Targets whose usage is pooled
    #[serde(default)]
    pub target_ids: Vec<TargetId>,
    #[serde(default)]
    pub excluded_clients: Vec<String>,
}

impl ValidationSettings {
    /// Defaults for a target that has just been enabled: its own usage only
    pub fn enabled_defaults(target: &TargetId) -> Self {
        Self {
            enabled: true,
            percentage: DEFAULT_PERCENTAGE,
            period_days: DEFAULT_PERIOD_DAYS,
            target_ids: vec![target.clone()],
            excluded_clients: Vec::new(),
        }
    }
}

/// Settings in effect for one validation run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedValidation {
    pub targets: Vec<TargetId>,
    pub percentage: f64,
    pub period_days: u32,
    pub excluded_clients: Vec<String>,
}

/// Persistence of validation settings
#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn get(&self, target: &TargetId) -> Result<Option<ValidationSettings>>;
    async fn put(&self, target: &TargetId, settings: ValidationSettings) -> Result<()>;
}

#[derive(Default)]
pub struct MemorySettingsStore {
    settings: RwLock<HashMap<TargetId, ValidationSettings>>,
}

impl MemorySettingsStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SettingsStore for MemorySettingsStore {
    async fn get(&self, target: &TargetId) -> Result<Option<ValidationSettings>> {
        Ok(self.settings.read().get(target).cloned())
    }

    async fn put(&self, target: &TargetId, settings: ValidationSettings) -> Result<()> {
        self.settings.write().insert(target.clone(), settings);
        Ok(())
    }
}

/// Reads and mutates validation settings on top of a [`SettingsStore`]
#[derive(Clone)]
pub struct SettingsResolver {
    store: Arc<dyn SettingsStore>,
}

impl SettingsResolver {
    pub fn new(store: Arc<dyn SettingsStore>) -> Self {
        Self { store }
    }

    /// Settings in effect for `target`, or `None` when usage must be ignored
    pub async fn resolve(&self, target: &TargetId) -> Option<ResolvedValidation> {
        let settings = match self.store.get(target).await {
            Ok(Some(settings)) => settings,
            Ok(None) => return None,
            Err(e) => {
                warn!(target_id = %target, error = %e, "validation settings unavailable, treating all fields as used");
                return None;
            }
        };

        if !settings.enabled {
            debug!(target_id = %target, "usage validation disabled");
            return None;
        }

        if settings.target_ids.is_empty() {
            debug!(target_id = %target, "no targets to read usage from");
            return None;
        }

        Some(ResolvedValidation {
            targets: settings.target_ids,
            percentage: settings.percentage,
            period_days: settings.period_days,
            excluded_clients: settings.excluded_clients,
        })
    }

    pub async fn get(&self, target: &TargetId) -> Result<Option<ValidationSettings>> {
        self.store.get(target).await
    }

    /// Turn usage validation on or off; enabling a target without stored
    /// settings stores the defaults
    pub async fn set_target_validation(
        &self,
        target: &TargetId,
        enabled: bool,
    ) -> Result<ValidationSettings> {
        let settings = match self.store.get(target).await? {
            Some(mut settings) => {
                settings.enabled = enabled;
                settings
            }
            None => ValidationSettings {
                enabled,
                ..ValidationSettings::enabled_defaults(target)
            },
        };
        self.store.put(target, settings.clone()).await?;
        debug!(target_id = %target, enabled, "target validation toggled");
        Ok(settings)
    }

    /// Replace the settings of `target`; this also enables validation
    pub async fn update_target_validation_settings(
        &self,
        target: &TargetId,
        percentage: f64,
        period_days: u32,
        target_ids: Vec<TargetId>,
        excluded_clients: Vec<String>,
    ) -> Result<ValidationSettings> {
        if !(0.0..=100.0).contains(&percentage) {
            return Err(RegistryError::InvalidSettings(format!(
                "percentage must be between 0 and 100, got {}",
                percentage
            )));
        }
        if !(1..=MAX_PERIOD_DAYS).contains(&period_days) {
            return Err(RegistryError::InvalidSettings(format!(
                "period must be between 1 and {} days, got {}",
                MAX_PERIOD_DAYS, period_days
            )));
        }

        let mut excluded_clients = excluded_clients;
        excluded_clients.retain(|c| !c.is_empty());
        excluded_clients.sort();
        excluded_clients.dedup();

        let settings = ValidationSettings {
            enabled: true,
            percentage,
            period_days,
            target_ids,
            excluded_clients,
        };
        self.store.put(target, settings.clone()).await?;
        debug!(target_id = %target, percentage, period_days, "target validation settings updated");
        Ok(settings)
    }
}
