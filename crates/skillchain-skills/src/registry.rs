use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::OnceCell;
use tracing::{debug, info};

use skillchain_core::error::{Result, SkillchainError};
use skillchain_core::traits::{Skill, SkillLoader};
use skillchain_core::types::is_valid_identifier;

type SkillCell = Arc<OnceCell<Arc<dyn Skill>>>;

/// Registry of skills, resolved lazily by hierarchical identifier.
///
/// The first `resolve` for an identifier asks each loader in turn; the result
/// is cached. Concurrent resolutions of the same identifier share one load.
/// Failed loads are not cached.
pub struct SkillRegistry {
    loaders: Vec<Arc<dyn SkillLoader>>,
    cache: Mutex<HashMap<String, SkillCell>>,
}

impl SkillRegistry {
    pub fn new() -> Self {
        Self {
            loaders: Vec::new(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Create a registry with the builtin skills registered.
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        for (fqsn, skill) in crate::builtin::builtins() {
            registry.insert(fqsn, skill);
        }
        registry
    }

    /// Append a loader; loaders are consulted in insertion order.
    pub fn with_loader(mut self, loader: impl SkillLoader) -> Self {
        self.loaders.push(Arc::new(loader));
        self
    }

    /// Append a shared loader.
    pub fn add_loader(&mut self, loader: Arc<dyn SkillLoader>) {
        self.loaders.push(loader);
    }

    /// Register a skill instance directly under `fqsn`.
    pub fn register(&self, fqsn: &str, skill: Arc<dyn Skill>) -> Result<()> {
        if !is_valid_identifier(fqsn) {
            return Err(SkillchainError::InvalidIdentifier(fqsn.to_string()));
        }
        self.insert(fqsn.to_string(), skill);
        Ok(())
    }

    fn insert(&self, fqsn: String, skill: Arc<dyn Skill>) {
        debug!(skill = %fqsn, "Registered skill");
        let cell = Arc::new(OnceCell::new_with(Some(skill)));
        self.lock_cache().insert(fqsn, cell);
    }

    /// Resolve a skill, loading it on first reference.
    pub async fn resolve(&self, fqsn: &str) -> Result<Arc<dyn Skill>> {
        if !is_valid_identifier(fqsn) {
            return Err(SkillchainError::InvalidIdentifier(fqsn.to_string()));
        }

        let cell = self
            .lock_cache()
            .entry(fqsn.to_string())
            .or_default()
            .clone();

        let resolved = cell.get_or_try_init(|| self.load(fqsn)).await.cloned();
        if resolved.is_err() {
            let mut cache = self.lock_cache();
            let stale = cache
                .get(fqsn)
                .is_some_and(|c| Arc::ptr_eq(c, &cell) && !c.initialized());
            if stale {
                cache.remove(fqsn);
            }
        }
        resolved
    }

    async fn load(&self, fqsn: &str) -> Result<Arc<dyn Skill>> {
        for loader in &self.loaders {
            if let Some(skill) = loader.load(fqsn).await? {
                info!(skill = %fqsn, loader = %loader.name(), "Loaded skill");
                return Ok(skill);
            }
        }
        Err(SkillchainError::SkillNotFound(fqsn.to_string()))
    }

    /// Whether `fqsn` has been loaded (or registered) already.
    pub fn is_loaded(&self, fqsn: &str) -> bool {
        self.lock_cache()
            .get(fqsn)
            .is_some_and(|cell| cell.initialized())
    }

    /// Identifiers currently held in the cache.
    pub fn loaded(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .lock_cache()
            .iter()
            .filter(|(_, cell)| cell.initialized())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, HashMap<String, SkillCell>> {
        self.cache.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for SkillRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skillchain_test_utils::{CountingLoader, MockSkill};

    #[tokio::test]
    async fn resolve_registered_skill() {
        let registry = SkillRegistry::new();
        registry
            .register("energy.extraction.glossary", Arc::new(MockSkill::new("energy.extraction.glossary")))
            .unwrap();
        let skill = registry.resolve("energy.extraction.glossary").await.unwrap();
        assert_eq!(skill.name(), "energy.extraction.glossary");
        assert!(registry.is_loaded("energy.extraction.glossary"));
    }

    #[tokio::test]
    async fn resolve_unknown_is_not_found() {
        let registry = SkillRegistry::with_builtins();
        let err = registry.resolve("no.such.skill").await.err().unwrap();
        assert!(matches!(err, SkillchainError::SkillNotFound(ref s) if s == "no.such.skill"));
        assert!(!registry.is_loaded("no.such.skill"));
    }

    #[tokio::test]
    async fn resolve_rejects_bad_identifier() {
        let registry = SkillRegistry::new();
        let err = registry.resolve("bad..name").await.err().unwrap();
        assert!(matches!(err, SkillchainError::InvalidIdentifier(_)));
        assert!(registry
            .register("", Arc::new(MockSkill::new("x")))
            .is_err());
    }

    #[tokio::test]
    async fn resolve_is_memoized() {
        let loader = CountingLoader::new().with_skill(MockSkill::new("a.b"));
        let loads = loader.load_counter();
        let registry = SkillRegistry::new().with_loader(loader);

        registry.resolve("a.b").await.unwrap();
        registry.resolve("a.b").await.unwrap();
        assert_eq!(loads.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(registry.loaded(), vec!["a.b".to_string()]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_resolution_is_single_flight() {
        let loader = CountingLoader::new()
            .with_skill(MockSkill::new("slow.skill"))
            .with_delay_ms(50);
        let loads = loader.load_counter();
        let registry = Arc::new(SkillRegistry::new().with_loader(loader));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                tokio::spawn(async move { registry.resolve("slow.skill").await.map(|_| ()) })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(loads.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_load_is_retried() {
        let loader = CountingLoader::new();
        let loads = loader.load_counter();
        let registry = SkillRegistry::new().with_loader(loader);

        assert!(registry.resolve("missing.one").await.is_err());
        assert!(registry.resolve("missing.one").await.is_err());
        assert_eq!(loads.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failed_lookups_leave_no_cache_entry() {
        let registry = SkillRegistry::with_builtins();
        let before = registry.lock_cache().len();
        for name in ["missing.one", "missing.two", "missing.one"] {
            assert!(registry.resolve(name).await.is_err());
        }
        assert_eq!(registry.lock_cache().len(), before);
        assert!(!registry.lock_cache().contains_key("missing.one"));
    }

    #[tokio::test]
    async fn loaders_consulted_in_order() {
        let first = CountingLoader::new();
        let first_loads = first.load_counter();
        let second = CountingLoader::new().with_skill(MockSkill::new("x.y"));
        let registry = SkillRegistry::new().with_loader(first).with_loader(second);

        registry.resolve("x.y").await.unwrap();
        assert_eq!(first_loads.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn independent_registries_do_not_share_cache() {
        let a = SkillRegistry::with_builtins();
        let b = SkillRegistry::new();
        assert!(a.resolve("builtin.passthrough").await.is_ok());
        assert!(b.resolve("builtin.passthrough").await.is_err());
    }
}
