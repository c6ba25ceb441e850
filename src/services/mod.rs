//! Service modules shipped with the broker.

pub mod fake;

use std::sync::Arc;

use crate::config::CatalogConfig;
use crate::service::Module;

/// Modules enabled by the catalog configuration
pub fn enabled_modules(config: &CatalogConfig) -> Vec<Arc<dyn Module>> {
    let mut modules: Vec<Arc<dyn Module>> = Vec::new();
    if config.enable_fake_service {
        modules.push(Arc::new(fake::FakeModule::new()));
    }
    modules
}
