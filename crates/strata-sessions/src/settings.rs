use std::path::PathBuf;
use std::time::Duration;

use strata_config::{AutoloadConfig, ExecutionMode};
use strata_storage::StoragePolicy;

/// Process-wide knobs shared by every session a factory builds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSettings {
    pub storage: StoragePolicy,
    pub idle_threshold: Duration,
    pub watch_retries: u32,
    pub execution_mode: ExecutionMode,
    pub update_suppression_path: Option<PathBuf>,
    pub maintenance_interval: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from_autoload(&AutoloadConfig::default())
    }
}

impl SessionSettings {
    pub fn from_autoload(config: &AutoloadConfig) -> Self {
        Self {
            storage: StoragePolicy {
                path_template: config.db_path.trim().to_owned(),
                can_create: config.db_can_create,
                group: config.db_group.trim().to_owned(),
                permission_bits: config.db_perms.clone(),
                include_repo_options_in_cache_breaker: config
                    .include_repo_options_in_cache_breaker,
            },
            idle_threshold: config.idle_threshold(),
            watch_retries: config.watch_retries,
            execution_mode: config.execution_mode,
            update_suppression_path: config.update_suppression_path(),
            maintenance_interval: config.maintenance_interval(),
        }
    }
}
