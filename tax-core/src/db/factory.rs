use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::memory::MemoryRepository;
use super::repository::{RepositoryError, TaxRepository};

/// Backend-agnostic connection configuration.
///
/// `backend` must match the [`RepositoryFactory::backend_name`] of a
/// registered factory.  `connection_string` is passed through to that
/// factory unchanged; its meaning is entirely backend-specific.
///
/// | backend    | connection_string examples          |
/// |------------|-------------------------------------|
/// | `sqlite`   | `taxes.db`, `:memory:`              |
/// | `memory`   | ignored                             |
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DbConfig {
    /// Lowercase identifier matching a registered factory (e.g. `"sqlite"`).
    pub backend: String,
    /// Opaque value forwarded to the factory's `create` method.
    pub connection_string: String,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            backend: "sqlite".to_string(),
            connection_string: ":memory:".to_string(),
        }
    }
}

/// One implementation per database backend.  Each backend crate exports a
/// single unit struct that implements this trait and is registered with a
/// [`RepositoryRegistry`] at startup.
#[async_trait]
pub trait RepositoryFactory: Send + Sync {
    /// Unique, lowercase identifier for this backend.
    fn backend_name(&self) -> &'static str;

    /// Open (or create) a connection and return a ready-to-use repository.
    /// Implementations are free to run migrations or warm connection pools
    /// inside this method.
    async fn create(&self, config: &DbConfig) -> Result<Box<dyn TaxRepository>, RepositoryError>;
}

/// Registry of [`RepositoryFactory`] instances, keyed by backend name.
///
/// Typical lifetime:
/// 1. Create with `RepositoryRegistry::new()`.
/// 2. Call `register` once per known backend.
/// 3. Call `create` whenever a new repository is needed.
pub struct RepositoryRegistry {
    factories: HashMap<&'static str, Box<dyn RepositoryFactory>>,
}

impl RepositoryRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a backend factory.
    ///
    /// If a factory with the same [`RepositoryFactory::backend_name`] is
    /// already present it is silently replaced.
    pub fn register(&mut self, factory: Box<dyn RepositoryFactory>) {
        self.factories.insert(factory.backend_name(), factory);
    }

    /// Names of every registered backend, sorted alphabetically.
    pub fn available_backends(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.factories.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Dispatch to the factory that matches `config.backend` and return
    /// the repository it produces.
    ///
    /// # Errors
    /// * [`RepositoryError::Configuration`]: no factory is registered for
    ///   the requested backend name.
    /// * Any error the chosen factory itself returns.
    pub async fn create(
        &self,
        config: &DbConfig,
    ) -> Result<Box<dyn TaxRepository>, RepositoryError> {
        let factory = self
            .factories
            .get(config.backend.as_str())
            .ok_or_else(|| {
                RepositoryError::Configuration(format!(
                    "unknown backend '{}'; available: {:?}",
                    config.backend,
                    self.available_backends()
                ))
            })?;

        factory.create(config).await
    }
}

/// Factory for the volatile [`MemoryRepository`] backend.
pub struct MemoryRepositoryFactory;

#[async_trait]
impl RepositoryFactory for MemoryRepositoryFactory {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn create(
        &self,
        _config: &DbConfig,
    ) -> Result<Box<dyn TaxRepository>, RepositoryError> {
        Ok(Box::new(MemoryRepository::new()))
    }
}

impl Default for RepositoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// tests
// ─────────────────────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;

    use super::{
        DbConfig, MemoryRepository, MemoryRepositoryFactory, RepositoryError, RepositoryFactory,
        RepositoryRegistry, TaxRepository,
    };
    use crate::db::repository::TaxStore;
    use crate::models::Owner;

    // ── stub factory ─────────────────────────────────────────────────────
    /// A factory whose `create` flips an `AtomicBool` and returns an empty
    /// [`MemoryRepository`].  The flag lets tests prove that `create` was
    /// actually called.
    struct StubFactory {
        name: &'static str,
        called: Arc<AtomicBool>,
    }

    #[async_trait]
    impl RepositoryFactory for StubFactory {
        fn backend_name(&self) -> &'static str {
            self.name
        }
        async fn create(
            &self,
            _config: &DbConfig,
        ) -> Result<Box<dyn TaxRepository>, RepositoryError> {
            self.called.store(true, Ordering::SeqCst);
            Ok(Box::new(MemoryRepository::new()))
        }
    }

    /// A factory that always returns a `Connection` error, used to verify
    /// that the registry surfaces errors from the underlying factory.
    struct FailingFactory;

    #[async_trait]
    impl RepositoryFactory for FailingFactory {
        fn backend_name(&self) -> &'static str {
            "failing"
        }
        async fn create(
            &self,
            _config: &DbConfig,
        ) -> Result<Box<dyn TaxRepository>, RepositoryError> {
            Err(RepositoryError::Connection(
                "intentional failure".to_string(),
            ))
        }
    }

    fn stub_factory(name: &'static str) -> (Box<dyn RepositoryFactory>, Arc<AtomicBool>) {
        let flag = Arc::new(AtomicBool::new(false));
        (
            Box::new(StubFactory {
                name,
                called: flag.clone(),
            }),
            flag,
        )
    }

    fn config(backend: &str) -> DbConfig {
        DbConfig {
            backend: backend.to_string(),
            connection_string: ":memory:".to_string(),
        }
    }

    // ── DbConfig ─────────────────────────────────────────────────────────
    #[test]
    fn dbconfig_default_is_sqlite_memory() {
        let cfg = DbConfig::default();
        assert_eq!(cfg.backend, "sqlite");
        assert_eq!(cfg.connection_string, ":memory:");
    }

    // ── registry construction ────────────────────────────────────────────
    #[test]
    fn new_registry_has_no_backends() {
        assert!(RepositoryRegistry::new().available_backends().is_empty());
    }

    #[test]
    fn available_backends_is_sorted() {
        let mut reg = RepositoryRegistry::new();
        // Register in reverse alphabetical order on purpose.
        let (f1, _) = stub_factory("sqlite");
        reg.register(f1);
        reg.register(Box::new(MemoryRepositoryFactory));
        assert_eq!(reg.available_backends(), vec!["memory", "sqlite"]);
    }

    #[test]
    fn duplicate_registration_replaces_previous() {
        let mut reg = RepositoryRegistry::new();
        let (old, _) = stub_factory("sqlite");
        let (new, _) = stub_factory("sqlite");
        reg.register(old);
        reg.register(new);
        assert_eq!(reg.available_backends(), vec!["sqlite"]);
    }

    // ── dispatch ─────────────────────────────────────────────────────────
    #[tokio::test]
    async fn create_calls_matching_factory_only() {
        let mut reg = RepositoryRegistry::new();
        let (sqlite_factory, sqlite_called) = stub_factory("sqlite");
        let (postgres_factory, postgres_called) = stub_factory("postgres");
        reg.register(sqlite_factory);
        reg.register(postgres_factory);

        let result = reg.create(&config("sqlite")).await;

        assert!(result.is_ok(), "expected Ok, got {:#?}", result.err());
        assert!(sqlite_called.load(Ordering::SeqCst));
        assert!(!postgres_called.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn memory_backend_yields_working_repository() {
        let mut reg = RepositoryRegistry::new();
        reg.register(Box::new(MemoryRepositoryFactory));

        let repo = reg.create(&config("memory")).await.expect("memory backend");

        assert!(
            repo.find_taxes_by_owner(&Owner::System)
                .await
                .expect("query")
                .is_empty()
        );
    }

    // ── unknown backend ──────────────────────────────────────────────────
    #[tokio::test]
    async fn configuration_error_names_requested_and_available_backends() {
        let mut reg = RepositoryRegistry::new();
        let (f, _) = stub_factory("sqlite");
        reg.register(f);

        match reg.create(&config("postgres")).await {
            Err(RepositoryError::Configuration(msg)) => {
                assert!(msg.contains("postgres"), "error should name the requested backend");
                assert!(msg.contains("sqlite"), "error should list available backends");
            }
            Err(other) => panic!("expected Configuration error, got {other:#?}"),
            Ok(_) => panic!("expected Configuration error, got a repository"),
        }
    }

    // ── factory errors propagate ─────────────────────────────────────────
    #[tokio::test]
    async fn create_propagates_factory_error() {
        let mut reg = RepositoryRegistry::new();
        reg.register(Box::new(FailingFactory));

        assert!(matches!(
            reg.create(&config("failing")).await,
            Err(RepositoryError::Connection(msg)) if msg == "intentional failure"
        ));
    }
}
