use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::credentials::{check_new_account, hash_password, new_salt, verify_password};
use super::{AuthProvider, DocumentStore, SnapshotStream, server_now};
use crate::domain::document::{
    CollectionPath, Document, DocumentPath, Fields, Snapshot, resolve_server_timestamps,
};
use crate::domain::task::User;
use crate::error::BackendError;

/// A write as received by the store, kept for inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Add { collection: String, fields: Fields },
    Update { doc: String, fields: Fields },
    Delete { doc: String },
}

type Push = Result<Snapshot, BackendError>;

struct Listener {
    collection: CollectionPath,
    tx: mpsc::UnboundedSender<Push>,
}

#[derive(Default)]
struct StoreState {
    collections: HashMap<CollectionPath, Vec<Document>>,
    listeners: Vec<Listener>,
    commands: Vec<Command>,
    offline: bool,
    paused: bool,
    held: Vec<CollectionPath>,
}

impl StoreState {
    fn snapshot(&self, collection: &CollectionPath) -> Snapshot {
        Snapshot {
            documents: self.collections.get(collection).cloned().unwrap_or_default(),
        }
    }

    fn push(&mut self, collection: &CollectionPath, item: Push) {
        self.listeners.retain(|l| !l.tx.is_closed());
        for listener in self.listeners.iter().filter(|l| &l.collection == collection) {
            // A receiver dropped after the retain above is harmless.
            let _ = listener.tx.send(item.clone());
        }
    }

    fn publish(&mut self, collection: &CollectionPath) {
        if self.paused {
            if !self.held.contains(collection) {
                self.held.push(collection.clone());
            }
            return;
        }
        let snapshot = self.snapshot(collection);
        self.push(collection, Ok(snapshot));
    }

    fn check_online(&self) -> Result<(), BackendError> {
        if self.offline {
            return Err(BackendError::Unavailable("store is offline".into()));
        }
        Ok(())
    }
}

/// Process-local document store. Every write fans out a fresh snapshot to
/// the listeners of the written collection.
#[derive(Default)]
pub struct InMemoryDocumentStore {
    state: Mutex<StoreState>,
}

impl InMemoryDocumentStore {
    fn state(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
impl InMemoryDocumentStore {
    pub fn commands(&self) -> Vec<Command> {
        self.state().commands.clone()
    }

    /// Subscriptions whose stream is still alive.
    pub fn listener_count(&self) -> usize {
        self.state()
            .listeners
            .iter()
            .filter(|l| !l.tx.is_closed())
            .count()
    }

    /// While offline every write fails with `Unavailable`; feeds keep serving.
    pub fn set_offline(&self, offline: bool) {
        self.state().offline = offline;
    }

    /// Holds snapshot pushes back until `resume_feeds`, like a slow link.
    pub fn pause_feeds(&self) {
        self.state().paused = true;
    }

    pub fn resume_feeds(&self) {
        let mut state = self.state();
        state.paused = false;
        for collection in std::mem::take(&mut state.held) {
            state.publish(&collection);
        }
    }

    pub fn inject_feed_error(&self, collection: &CollectionPath, error: BackendError) {
        self.state().push(collection, Err(error));
    }

    pub fn documents(&self, collection: &CollectionPath) -> Vec<Document> {
        self.state().snapshot(collection).documents
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    fn subscribe(&self, collection: &CollectionPath) -> SnapshotStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state();
        let _ = tx.send(Ok(state.snapshot(collection)));
        state.listeners.push(Listener {
            collection: collection.clone(),
            tx,
        });
        stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) }).boxed()
    }

    async fn add(
        &self,
        collection: &CollectionPath,
        fields: Fields,
    ) -> Result<String, BackendError> {
        let mut state = self.state();
        state.commands.push(Command::Add {
            collection: collection.to_string(),
            fields: fields.clone(),
        });
        state.check_online()?;

        let id = Uuid::new_v4().simple().to_string();
        let fields = resolve_server_timestamps(fields, server_now());
        state
            .collections
            .entry(collection.clone())
            .or_default()
            .push(Document {
                id: id.clone(),
                fields,
            });
        state.publish(collection);
        Ok(id)
    }

    async fn update(&self, doc: &DocumentPath, fields: Fields) -> Result<(), BackendError> {
        let mut state = self.state();
        state.commands.push(Command::Update {
            doc: doc.to_string(),
            fields: fields.clone(),
        });
        state.check_online()?;

        let now = server_now();
        let existing = state
            .collections
            .get_mut(doc.collection())
            .and_then(|docs| docs.iter_mut().find(|d| d.id == doc.id()))
            .ok_or_else(|| BackendError::NotFound(doc.to_string()))?;
        existing
            .fields
            .extend(resolve_server_timestamps(fields, now));
        state.publish(doc.collection());
        Ok(())
    }

    async fn delete(&self, doc: &DocumentPath) -> Result<(), BackendError> {
        let mut state = self.state();
        state.commands.push(Command::Delete {
            doc: doc.to_string(),
        });
        state.check_online()?;

        if let Some(docs) = state.collections.get_mut(doc.collection()) {
            docs.retain(|d| d.id != doc.id());
        }
        state.publish(doc.collection());
        Ok(())
    }
}

struct Account {
    uid: String,
    salt: String,
    password_hash: String,
}

#[derive(Default)]
struct AuthState {
    accounts: HashMap<String, Account>,
    current: Option<User>,
}

impl AuthState {
    fn register(&mut self, email: &str, password: &str) -> User {
        let salt = new_salt();
        let account = Account {
            uid: Uuid::new_v4().simple().to_string(),
            password_hash: hash_password(&salt, password),
            salt,
        };
        let user = User {
            uid: account.uid.clone(),
            email: email.to_owned(),
        };
        self.accounts.insert(email.to_owned(), account);
        self.current = Some(user.clone());
        user
    }
}

/// Process-local auth provider; the session ends with the process.
#[derive(Default)]
pub struct InMemoryAuth {
    state: Mutex<AuthState>,
}

impl InMemoryAuth {
    /// Starts with one registered account that is already signed in.
    pub fn with_account(email: &str, password: &str) -> Self {
        let auth = Self::default();
        auth.state().register(email, password);
        auth
    }

    fn state(&self) -> MutexGuard<'_, AuthState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl AuthProvider for InMemoryAuth {
    fn current_user(&self) -> Option<User> {
        self.state().current.clone()
    }

    async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<User, BackendError> {
        let mut state = self.state();
        let account = state
            .accounts
            .get(email)
            .filter(|a| verify_password(&a.salt, password, &a.password_hash))
            .ok_or(BackendError::InvalidCredentials)?;
        let user = User {
            uid: account.uid.clone(),
            email: email.to_owned(),
        };
        state.current = Some(user.clone());
        Ok(user)
    }

    async fn create_user(&self, email: &str, password: &str) -> Result<User, BackendError> {
        check_new_account(email, password)?;
        let mut state = self.state();
        if state.accounts.contains_key(email) {
            return Err(BackendError::EmailAlreadyInUse(email.to_owned()));
        }
        Ok(state.register(email, password))
    }

    fn sign_out(&self) {
        self.state().current = None;
    }
}
