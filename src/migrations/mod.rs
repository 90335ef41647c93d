//! Bundled container migrations.
//!
//! Each migration lives in its own module and is registered in `builtin()`.
//! File names carry no version; the version is the `VERSION` constant.

pub mod nginx_security_conf;
pub mod php_config_volume;

use crate::docker::ContainerRuntime;
use crate::migration::ContainerMigration;
use std::sync::Arc;

pub use nginx_security_conf::UpdateNginxSecurityConf;
pub use php_config_volume::AddPhpConfigVolume;

/// Every bundled migration, in any order (the runner sorts by version)
pub fn builtin(runtime: Arc<dyn ContainerRuntime>) -> Vec<Box<dyn ContainerMigration>> {
    vec![
        Box::new(AddPhpConfigVolume::new(Arc::clone(&runtime))),
        Box::new(UpdateNginxSecurityConf::new(runtime)),
    ]
}
