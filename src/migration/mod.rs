//! Ordered, idempotent schema migrations gated by the persisted schema
//! version.

use tracing::info;

use crate::kv::{StoreError, Storer};

mod source_v1;
mod v1_short_ids;

pub use source_v1::migrate_source_document;

pub trait Migration {
    fn version(&self) -> i64;
    fn description(&self) -> &str;
    fn up(&self, store: &dyn Storer) -> Result<(), StoreError>;
}

pub struct MigrationRegistry {
    migrations: Vec<Box<dyn Migration>>,
}

impl MigrationRegistry {
    /// Registry with every known migration registered.
    pub fn new() -> Self {
        let mut registry = Self {
            migrations: Vec::new(),
        };
        registry.register(Box::new(v1_short_ids::ShortIdBackfill));
        registry
    }

    pub fn register(&mut self, migration: Box<dyn Migration>) {
        self.migrations.push(migration);
    }

    /// Run every migration newer than the persisted schema version, in
    /// ascending order, recording each version as it completes. Migrations
    /// must tolerate partial completion of a previous attempt.
    pub fn apply(&mut self, store: &dyn Storer) -> Result<(), StoreError> {
        info!("applying database migrations");
        self.migrations
            .sort_by_key(|migration| migration.version());

        let current = store.get_schema_version()?;
        info!("current database version: {}", current);

        for migration in &self.migrations {
            if migration.version() > current {
                info!(
                    "running migration {}: {}",
                    migration.version(),
                    migration.description()
                );
                migration.up(store)?;
                store.set_schema_version(migration.version())?;
                info!("migration {} successful", migration.version());
            }
        }

        info!("migrations are up to date");
        Ok(())
    }
}

impl Default for MigrationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::embedded::EmbeddedStore;
    use std::cell::RefCell;
    use tempfile::TempDir;

    struct Recorded {
        version: i64,
        log: std::rc::Rc<RefCell<Vec<i64>>>,
    }

    impl Migration for Recorded {
        fn version(&self) -> i64 {
            self.version
        }
        fn description(&self) -> &str {
            "recorded"
        }
        fn up(&self, _store: &dyn Storer) -> Result<(), StoreError> {
            self.log.borrow_mut().push(self.version);
            Ok(())
        }
    }

    #[test]
    fn apply_runs_pending_migrations_in_order() {
        let dir = TempDir::new().expect("tempdir");
        let store = EmbeddedStore::open(dir.path().join("callout.db")).expect("store");
        let log = std::rc::Rc::new(RefCell::new(Vec::new()));

        let mut registry = MigrationRegistry {
            migrations: Vec::new(),
        };
        registry.register(Box::new(Recorded {
            version: 3,
            log: log.clone(),
        }));
        registry.register(Box::new(Recorded {
            version: 2,
            log: log.clone(),
        }));

        registry.apply(&store).expect("apply");
        assert_eq!(*log.borrow(), vec![2, 3]);
        assert_eq!(store.get_schema_version().expect("version"), 3);

        // A second apply is a no-op.
        registry.apply(&store).expect("re-apply");
        assert_eq!(*log.borrow(), vec![2, 3]);
    }

    #[test]
    fn apply_skips_versions_at_or_below_current() {
        let dir = TempDir::new().expect("tempdir");
        let store = EmbeddedStore::open(dir.path().join("callout.db")).expect("store");
        store.set_schema_version(2).expect("seed version");
        let log = std::rc::Rc::new(RefCell::new(Vec::new()));

        let mut registry = MigrationRegistry {
            migrations: Vec::new(),
        };
        registry.register(Box::new(Recorded {
            version: 2,
            log: log.clone(),
        }));

        registry.apply(&store).expect("apply");
        assert!(log.borrow().is_empty());
    }
}
