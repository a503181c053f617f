use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::{debug, warn};

use skillchain_core::error::{Result, SkillchainError};
use skillchain_core::traits::{Skill, SkillLoader};

use crate::command::CommandSkill;
use crate::manifest::{Prerequisites, SkillManifest};

const MANIFEST_FILE: &str = "skill.toml";

/// Loads command skills from a directory tree, one directory level per
/// identifier segment: `a.b.c` lives at `<root>/a/b/c/skill.toml`.
pub struct DirectoryLoader {
    root: PathBuf,
}

impl DirectoryLoader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory expected to hold the manifest for `fqsn`.
    pub fn skill_dir(&self, fqsn: &str) -> PathBuf {
        fqsn.split('.').fold(self.root.clone(), |dir, seg| dir.join(seg))
    }

    async fn load_manifest(&self, fqsn: &str) -> Result<Option<Arc<dyn Skill>>> {
        let skill_dir = self.skill_dir(fqsn);
        let manifest_path = skill_dir.join(MANIFEST_FILE);

        let content = match tokio::fs::read_to_string(&manifest_path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %manifest_path.display(), "No skill manifest");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let manifest: SkillManifest = toml::from_str(&content).map_err(|e| {
            SkillchainError::Config(format!(
                "Failed to parse skill manifest {}: {}",
                manifest_path.display(),
                e
            ))
        })?;

        if manifest.name != fqsn {
            return Err(SkillchainError::Config(format!(
                "Skill manifest {} declares name '{}', expected '{}'",
                manifest_path.display(),
                manifest.name,
                fqsn
            )));
        }

        // Check prerequisites before creating the skill
        if let Err(reason) = check_prerequisites(&manifest.prerequisites) {
            warn!(
                skill = %manifest.name,
                reason = %reason,
                "Skipping skill: prerequisites not met"
            );
            return Ok(None);
        }

        Ok(Some(Arc::new(CommandSkill::new(manifest, skill_dir))))
    }
}

impl SkillLoader for DirectoryLoader {
    fn name(&self) -> &str {
        "directory"
    }

    fn load(&self, fqsn: &str) -> BoxFuture<'_, Result<Option<Arc<dyn Skill>>>> {
        let fqsn = fqsn.to_string();
        Box::pin(async move { self.load_manifest(&fqsn).await })
    }
}

/// List every skill identifier found under `root`, sorted.
pub fn discover(root: &Path) -> Vec<String> {
    let mut found = Vec::new();
    walk(root, &mut Vec::new(), &mut found);
    found.sort();
    found
}

fn walk(dir: &Path, segments: &mut Vec<String>, found: &mut Vec<String>) {
    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) => {
            debug!(path = %dir.display(), error = %e, "Cannot read skills directory");
            return;
        }
    };

    if !segments.is_empty() && dir.join(MANIFEST_FILE).is_file() {
        found.push(segments.join("."));
    }

    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
            segments.push(name.to_string());
            walk(&path, segments, found);
            segments.pop();
        }
    }
}

/// Check that a skill's prerequisites are met.
/// Returns Ok(()) if all checks pass, or Err with a description of what failed.
fn check_prerequisites(prereqs: &Prerequisites) -> std::result::Result<(), String> {
    // Check required binaries
    for bin in &prereqs.required_binaries {
        if which(bin).is_none() {
            return Err(format!("required binary '{}' not found on PATH", bin));
        }
    }

    // Check required environment variables
    for var in &prereqs.required_env {
        if std::env::var(var).is_err() {
            return Err(format!("required env var '{}' is not set", var));
        }
    }

    // Check required OS
    if let Some(ref required_os) = prereqs.required_os {
        let current_os = std::env::consts::OS;
        let matches = match required_os.as_str() {
            "linux" => current_os == "linux",
            "macos" | "darwin" => current_os == "macos",
            "windows" => current_os == "windows",
            other => {
                return Err(format!("unknown required_os value: '{}'", other));
            }
        };
        if !matches {
            return Err(format!(
                "requires OS '{}', but running on '{}'",
                required_os, current_os
            ));
        }
    }

    Ok(())
}

/// Simple `which` implementation: searches PATH for a binary.
fn which(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var("PATH").ok()?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}
