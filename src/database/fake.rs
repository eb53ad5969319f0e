//! Recording connections with failure injection, for unit tests.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use thiserror::Error;

use super::{Connection, ConnectionProvider, ConnectionSource, DatabaseError, DatabaseInfo, Operation};
use crate::config::{DatabaseConfig, DatabaseSettings};

#[derive(Debug, Error)]
#[error("injected {operation} failure on {label}")]
pub(crate) struct InjectedFailure {
    operation: Operation,
    label: String,
}

#[derive(Debug, Default)]
struct Shared {
    journal: Mutex<Vec<String>>,
    failures: Mutex<HashSet<(String, Operation)>>,
    stalls: Mutex<HashSet<(String, Operation)>>,
    created: Mutex<Vec<String>>,
}

/// Provider whose connections append `"<operation> <label>"` to a shared journal.
///
/// The label is `primary` or the secondary database name.
#[derive(Debug, Clone, Default)]
pub(crate) struct FakeProvider {
    shared: Arc<Shared>,
}

impl FakeProvider {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Makes `operation` fail for the database labelled `label`.
    pub(crate) fn fail(&self, label: &str, operation: Operation) {
        self.shared
            .failures
            .lock()
            .unwrap()
            .insert((label.to_owned(), operation));
    }

    /// Makes `operation` never complete for the database labelled `label`. The
    /// journal entry is still written.
    pub(crate) fn stall(&self, label: &str, operation: Operation) {
        self.shared
            .stalls
            .lock()
            .unwrap()
            .insert((label.to_owned(), operation));
    }

    pub(crate) fn journal(&self) -> Vec<String> {
        self.shared.journal.lock().unwrap().clone()
    }

    /// Labels of every connection object created, in creation order.
    pub(crate) fn created(&self) -> Vec<String> {
        self.shared.created.lock().unwrap().clone()
    }

    /// A source with a transactional primary plus the given secondaries.
    pub(crate) fn source(&self, secondaries: &[(&str, bool)]) -> ConnectionSource<FakeProvider> {
        let mut config = DatabaseConfig::new().with_primary(DatabaseSettings::new("primary"));
        for (name, automatic) in secondaries {
            let settings = DatabaseSettings::new(*name);
            let settings = if *automatic {
                settings
            } else {
                settings.without_automatic_transactions()
            };
            config = config.with_secondary(*name, settings);
        }
        ConnectionSource::new(config, self.clone())
    }
}

impl ConnectionProvider for FakeProvider {
    type Connection = FakeConnection;

    fn create(&self, info: &DatabaseInfo) -> Result<FakeConnection, DatabaseError> {
        let label = info.identity.secondary_name().unwrap_or("primary").to_owned();
        self.shared.created.lock().unwrap().push(label.clone());
        Ok(FakeConnection {
            label,
            shared: Arc::clone(&self.shared),
        })
    }
}

#[derive(Debug)]
pub(crate) struct FakeConnection {
    label: String,
    shared: Arc<Shared>,
}

impl FakeConnection {
    async fn perform(&self, operation: Operation) -> Result<(), InjectedFailure> {
        self.shared
            .journal
            .lock()
            .unwrap()
            .push(format!("{operation} {}", self.label));
        let key = (self.label.clone(), operation);
        let stalled = self.shared.stalls.lock().unwrap().contains(&key);
        if stalled {
            std::future::pending::<()>().await;
        }
        let failing = self
            .shared
            .failures
            .lock()
            .unwrap()
            .contains(&key);
        if failing {
            Err(InjectedFailure {
                operation,
                label: self.label.clone(),
            })
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Connection for FakeConnection {
    type Error = InjectedFailure;

    async fn open(&mut self) -> Result<(), InjectedFailure> {
        self.perform(Operation::Open).await
    }

    async fn begin_transaction(&mut self) -> Result<(), InjectedFailure> {
        self.perform(Operation::BeginTransaction).await
    }

    async fn commit_transaction(&mut self) -> Result<(), InjectedFailure> {
        self.perform(Operation::CommitTransaction).await
    }

    async fn rollback_transaction(&mut self) -> Result<(), InjectedFailure> {
        self.perform(Operation::RollbackTransaction).await
    }

    async fn close(&mut self) -> Result<(), InjectedFailure> {
        self.perform(Operation::Close).await
    }

    async fn pre_execute_commit_time_validation(&mut self) -> Result<(), InjectedFailure> {
        self.perform(Operation::CommitTimeValidation).await
    }
}
