//! Skill registry and skill implementations.
//!
//! Skills are resolved by hierarchical identifier through a `SkillRegistry`.
//! Identifiers not registered in-process are looked up by the registry's
//! loaders, e.g. a `DirectoryLoader` reading `skill.toml` manifests.

pub mod builtin;
pub mod command;
pub mod func;
pub mod loader;
pub mod manifest;
pub mod registry;

pub use command::CommandSkill;
pub use func::FnSkill;
pub use loader::{discover, DirectoryLoader};
pub use manifest::SkillManifest;
pub use registry::SkillRegistry;

use std::path::PathBuf;

use tracing::info;

use skillchain_core::config::SkillsConfig;

/// Build a registry from configuration: builtins (if enabled) plus one
/// `DirectoryLoader` per configured directory.
pub fn registry_from_config(config: &SkillsConfig, dirs: Vec<PathBuf>) -> SkillRegistry {
    let mut registry = if config.builtins {
        SkillRegistry::with_builtins()
    } else {
        SkillRegistry::new()
    };
    for dir in dirs {
        info!(path = %dir.display(), "Adding skill directory");
        registry.add_loader(std::sync::Arc::new(DirectoryLoader::new(dir)));
    }
    registry
}
