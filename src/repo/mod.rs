use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::domain::document::{CollectionPath, DocumentPath, Fields, Snapshot};
use crate::domain::task::User;
use crate::error::BackendError;

pub mod credentials;
pub mod memory;
pub mod sqlite;

pub type SnapshotStream = BoxStream<'static, Result<Snapshot, BackendError>>;

/// Hierarchical document database with live collection subscriptions.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Current snapshot first, then a full snapshot after every change.
    /// Dropping the stream ends the subscription.
    fn subscribe(&self, collection: &CollectionPath) -> SnapshotStream;
    /// Creates a document with a backend-assigned id and returns that id.
    async fn add(&self, collection: &CollectionPath, fields: Fields)
    -> Result<String, BackendError>;
    /// Merges `fields` into an existing document.
    async fn update(&self, doc: &DocumentPath, fields: Fields) -> Result<(), BackendError>;
    async fn delete(&self, doc: &DocumentPath) -> Result<(), BackendError>;
}

#[async_trait]
pub trait AuthProvider: Send + Sync {
    fn current_user(&self) -> Option<User>;
    async fn sign_in_with_password(&self, email: &str, password: &str)
    -> Result<User, BackendError>;
    /// Registers the account and signs it in.
    async fn create_user(&self, email: &str, password: &str) -> Result<User, BackendError>;
    fn sign_out(&self);
}

pub(crate) fn server_now() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}
