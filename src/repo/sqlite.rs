use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use log::{debug, warn};
use rusqlite::{Connection, OptionalExtension, params};
use tokio::sync::watch;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use uuid::Uuid;

use super::credentials::{check_new_account, hash_password, new_salt, verify_password};
use super::{AuthProvider, DocumentStore, SnapshotStream, server_now};
use crate::domain::document::{
    CollectionPath, Document, DocumentPath, Fields, Snapshot, resolve_server_timestamps,
};
use crate::domain::task::User;
use crate::error::BackendError;

/// Document store and auth provider backed by one SQLite file.
///
/// Subscriptions re-read their collection every `poll_interval` so that
/// writes from other processes show up; writes made through this handle
/// wake them immediately.
pub struct SqliteBackend {
    conn: Arc<Mutex<Connection>>,
    revision: watch::Sender<u64>,
    poll_interval: Duration,
}

impl SqliteBackend {
    pub fn open_default(poll_interval: Duration) -> Result<Self> {
        let path = default_db_path()?;
        Self::open(path, poll_interval)
    }

    pub fn open(path: impl AsRef<Path>, poll_interval: Duration) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create db dir {}", parent.display()))?;
        }
        let conn =
            Connection::open(path).with_context(|| format!("failed to open db {}", path.display()))?;
        init_schema(&conn)?;
        let (revision, _) = watch::channel(0);
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            revision,
            poll_interval,
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        lock(&self.conn)
    }

    /// Runs `work` on the blocking pool with the connection locked.
    async fn with_conn<T, F>(&self, work: F) -> Result<T, BackendError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, BackendError> + Send + 'static,
    {
        blocking(Arc::clone(&self.conn), work).await
    }

    fn mark_changed(&self) {
        self.revision.send_modify(|rev| *rev += 1);
    }

    fn start_session(conn: &Connection, uid: &str) -> Result<(), BackendError> {
        conn.execute(
            "INSERT OR REPLACE INTO session (slot, uid) VALUES (0, ?1)",
            params![uid],
        )?;
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for SqliteBackend {
    fn subscribe(&self, collection: &CollectionPath) -> SnapshotStream {
        let poll = Poll {
            conn: Arc::clone(&self.conn),
            collection: collection.to_string(),
            revision: self.revision.subscribe(),
            every: self.poll_interval,
            ticker: None,
            last: None,
            primed: false,
        };
        stream::unfold(poll, |mut poll| async move {
            loop {
                if poll.primed {
                    poll.wait().await;
                }
                poll.primed = true;

                let collection = poll.collection.clone();
                let read = blocking(Arc::clone(&poll.conn), move |conn| {
                    read_collection(conn, &collection)
                })
                .await;
                match read {
                    Ok(documents) if poll.last.as_ref() == Some(&documents) => continue,
                    Ok(documents) => {
                        poll.last = Some(documents.clone());
                        return Some((Ok(Snapshot { documents }), poll));
                    }
                    Err(e) => return Some((Err(e), poll)),
                }
            }
        })
        .boxed()
    }

    async fn add(
        &self,
        collection: &CollectionPath,
        fields: Fields,
    ) -> Result<String, BackendError> {
        let id = Uuid::new_v4().simple().to_string();
        let fields = resolve_server_timestamps(fields, server_now());
        let encoded = serde_json::to_string(&fields)?;
        let collection = collection.clone();
        let row_id = id.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO documents (collection, id, fields) VALUES (?1, ?2, ?3)",
                params![collection.as_str(), row_id, encoded],
            )?;
            Ok(())
        })
        .await?;
        self.mark_changed();
        Ok(id)
    }

    async fn update(&self, doc: &DocumentPath, fields: Fields) -> Result<(), BackendError> {
        let doc = doc.clone();
        let fields = resolve_server_timestamps(fields, server_now());
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let stored: Option<String> = tx
                .query_row(
                    "SELECT fields FROM documents WHERE collection = ?1 AND id = ?2",
                    params![doc.collection().as_str(), doc.id()],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(stored) = stored else {
                return Err(BackendError::NotFound(doc.to_string()));
            };
            let mut merged: Fields = serde_json::from_str(&stored)?;
            merged.extend(fields);
            tx.execute(
                "UPDATE documents SET fields = ?1 WHERE collection = ?2 AND id = ?3",
                params![
                    serde_json::to_string(&merged)?,
                    doc.collection().as_str(),
                    doc.id()
                ],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await?;
        self.mark_changed();
        Ok(())
    }

    async fn delete(&self, doc: &DocumentPath) -> Result<(), BackendError> {
        let doc = doc.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM documents WHERE collection = ?1 AND id = ?2",
                params![doc.collection().as_str(), doc.id()],
            )?;
            Ok(())
        })
        .await?;
        self.mark_changed();
        Ok(())
    }
}

#[async_trait]
impl AuthProvider for SqliteBackend {
    fn current_user(&self) -> Option<User> {
        self.conn()
            .query_row(
                "SELECT a.uid, a.email FROM session s JOIN accounts a ON a.uid = s.uid WHERE s.slot = 0",
                [],
                |row| {
                    Ok(User {
                        uid: row.get(0)?,
                        email: row.get(1)?,
                    })
                },
            )
            .optional()
            .unwrap_or_else(|e| {
                warn!("failed to read session: {e}");
                None
            })
    }

    async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<User, BackendError> {
        let email = email.to_owned();
        let password = password.to_owned();
        self.with_conn(move |conn| {
            let account: Option<(String, String, String)> = conn
                .query_row(
                    "SELECT uid, salt, password_hash FROM accounts WHERE email = ?1",
                    params![email],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()?;
            let Some((uid, salt, password_hash)) = account else {
                return Err(BackendError::InvalidCredentials);
            };
            if !verify_password(&salt, &password, &password_hash) {
                return Err(BackendError::InvalidCredentials);
            }
            Self::start_session(conn, &uid)?;
            debug!("signed in {email}");
            Ok(User { uid, email })
        })
        .await
    }

    async fn create_user(&self, email: &str, password: &str) -> Result<User, BackendError> {
        check_new_account(email, password)?;
        let email = email.to_owned();
        let password = password.to_owned();
        self.with_conn(move |conn| {
            let taken = conn
                .query_row(
                    "SELECT 1 FROM accounts WHERE email = ?1",
                    params![email],
                    |_| Ok(()),
                )
                .optional()?
                .is_some();
            if taken {
                return Err(BackendError::EmailAlreadyInUse(email));
            }

            let uid = Uuid::new_v4().simple().to_string();
            let salt = new_salt();
            conn.execute(
                "INSERT INTO accounts (uid, email, salt, password_hash, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![uid, email, salt, hash_password(&salt, &password), server_now()],
            )?;
            Self::start_session(conn, &uid)?;
            debug!("created account {email}");
            Ok(User { uid, email })
        })
        .await
    }

    fn sign_out(&self) {
        if let Err(e) = self.conn().execute("DELETE FROM session", []) {
            warn!("failed to clear session: {e}");
        }
    }
}

struct Poll {
    conn: Arc<Mutex<Connection>>,
    collection: String,
    revision: watch::Receiver<u64>,
    every: Duration,
    ticker: Option<Interval>,
    last: Option<Vec<Document>>,
    primed: bool,
}

impl Poll {
    async fn wait(&mut self) {
        let every = self.every;
        let ticker = self.ticker.get_or_insert_with(|| {
            let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });
        tokio::select! {
            _ = ticker.tick() => {}
            Ok(()) = self.revision.changed() => {}
        }
    }
}

fn lock(conn: &Mutex<Connection>) -> MutexGuard<'_, Connection> {
    conn.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn blocking<T, F>(conn: Arc<Mutex<Connection>>, work: F) -> Result<T, BackendError>
where
    T: Send + 'static,
    F: FnOnce(&mut Connection) -> Result<T, BackendError> + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let mut conn = lock(&conn);
        work(&mut conn)
    })
    .await
    .map_err(|e| BackendError::Unavailable(format!("database task failed: {e}")))?
}

fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
PRAGMA journal_mode=WAL;
CREATE TABLE IF NOT EXISTS documents (
  seq INTEGER PRIMARY KEY AUTOINCREMENT,
  collection TEXT NOT NULL,
  id TEXT NOT NULL,
  fields TEXT NOT NULL,
  UNIQUE (collection, id)
);
CREATE TABLE IF NOT EXISTS accounts (
  uid TEXT PRIMARY KEY,
  email TEXT NOT NULL UNIQUE,
  salt TEXT NOT NULL,
  password_hash TEXT NOT NULL,
  created_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS session (
  slot INTEGER PRIMARY KEY CHECK (slot = 0),
  uid TEXT NOT NULL REFERENCES accounts(uid)
);
"#,
    )
    .context("failed to initialize schema")?;
    Ok(())
}

fn read_collection(conn: &Connection, collection: &str) -> Result<Vec<Document>, BackendError> {
    let mut stmt = conn
        .prepare_cached("SELECT id, fields FROM documents WHERE collection = ?1 ORDER BY seq ASC")?;
    let rows = stmt.query_map(params![collection], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;
    let mut documents = Vec::new();
    for row in rows {
        let (id, fields) = row?;
        documents.push(Document {
            id,
            fields: serde_json::from_str(&fields)?,
        });
    }
    Ok(documents)
}

fn default_db_path() -> Result<PathBuf> {
    let base = dirs::data_dir().context("failed to resolve data dir")?;
    Ok(base.join("taskfeed").join("taskfeed.sqlite"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::tasks::TaskStore;
    use crate::domain::document::FieldValue;
    use crate::error::TaskError;
    use crate::usecase::identity::fixed::FixedIdentity;

    const FAST: Duration = Duration::from_millis(20);

    fn title(t: &str) -> Fields {
        Fields::from([
            ("title".to_string(), FieldValue::from(t)),
            ("createdAt".to_string(), FieldValue::ServerTimestamp),
        ])
    }

    async fn next_snapshot(feed: &mut SnapshotStream) -> Snapshot {
        tokio::time::timeout(Duration::from_secs(2), feed.next())
            .await
            .expect("feed timed out")
            .expect("feed ended")
            .expect("feed error")
    }

    #[tokio::test]
    async fn documents_survive_reopen() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let tasks = CollectionPath::user_tasks("u1");
        let id = {
            let db = SqliteBackend::open(tmp.path(), FAST).unwrap();
            db.add(&tasks, title("milk")).await.unwrap()
        };

        let db = SqliteBackend::open(tmp.path(), FAST).unwrap();
        let mut feed = db.subscribe(&tasks);
        let snap = next_snapshot(&mut feed).await;
        assert_eq!(snap.documents.len(), 1);
        assert_eq!(snap.documents[0].id, id);
        assert!(matches!(
            snap.documents[0].fields["createdAt"],
            FieldValue::Timestamp(_)
        ));
    }

    #[tokio::test]
    async fn local_writes_wake_subscribers() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        // Long poll interval: only the write notification can wake the feed.
        let db = SqliteBackend::open(tmp.path(), Duration::from_secs(3600)).unwrap();
        let tasks = CollectionPath::user_tasks("u1");
        let mut feed = db.subscribe(&tasks);
        assert!(next_snapshot(&mut feed).await.documents.is_empty());

        let id = db.add(&tasks, title("milk")).await.unwrap();
        let done = Fields::from([("done".to_string(), FieldValue::Bool(true))]);
        db.update(&tasks.doc(&id), done).await.unwrap();

        let mut snap = next_snapshot(&mut feed).await;
        if !snap.documents[0].fields.contains_key("done") {
            snap = next_snapshot(&mut feed).await;
        }
        assert_eq!(snap.documents[0].fields["done"], FieldValue::Bool(true));
        assert_eq!(snap.documents[0].fields["title"], FieldValue::from("milk"));

        db.delete(&tasks.doc(&id)).await.unwrap();
        assert!(next_snapshot(&mut feed).await.documents.is_empty());
    }

    #[tokio::test]
    async fn writes_from_another_handle_are_polled() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let reader = SqliteBackend::open(tmp.path(), FAST).unwrap();
        let writer = SqliteBackend::open(tmp.path(), FAST).unwrap();
        let tasks = CollectionPath::user_tasks("u1");

        let mut feed = reader.subscribe(&tasks);
        assert!(next_snapshot(&mut feed).await.documents.is_empty());

        writer.add(&tasks, title("from elsewhere")).await.unwrap();
        let snap = next_snapshot(&mut feed).await;
        assert_eq!(snap.documents.len(), 1);
    }

    #[tokio::test]
    async fn undecodable_rows_are_pushed_as_errors_and_the_feed_recovers() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let db = SqliteBackend::open(tmp.path(), FAST).unwrap();
        let tasks = CollectionPath::user_tasks("u1");
        let mut feed = db.subscribe(&tasks);
        assert!(next_snapshot(&mut feed).await.documents.is_empty());

        db.conn()
            .execute(
                "INSERT INTO documents (collection, id, fields) VALUES (?1, 'bad', 'nope')",
                params![tasks.as_str()],
            )
            .unwrap();
        db.mark_changed();
        let pushed = tokio::time::timeout(Duration::from_secs(2), feed.next())
            .await
            .expect("feed timed out")
            .expect("feed ended");
        assert!(matches!(pushed, Err(BackendError::Codec(_))));

        db.conn()
            .execute("DELETE FROM documents WHERE id = 'bad'", [])
            .unwrap();
        let id = db.add(&tasks, title("ok")).await.unwrap();
        let snap = next_snapshot(&mut feed).await;
        assert_eq!(snap.documents.len(), 1);
        assert_eq!(snap.documents[0].id, id);
    }

    #[tokio::test]
    async fn task_store_keeps_its_list_through_a_read_failure() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let db = Arc::new(SqliteBackend::open(tmp.path(), FAST).unwrap());
        let tasks = CollectionPath::user_tasks("u1");
        db.add(&tasks, title("milk")).await.unwrap();

        let mut store = TaskStore::new(db.clone(), Arc::new(FixedIdentity::signed_in("u1")));
        let mut list = store.tasks();
        let mut errors = store.errors();
        assert!(store.load());
        tokio::time::timeout(Duration::from_secs(2), list.wait_for(|l| l.len() == 1))
            .await
            .expect("list timed out")
            .unwrap();

        db.conn()
            .execute(
                "INSERT INTO documents (collection, id, fields) VALUES (?1, 'bad', 'nope')",
                params![tasks.as_str()],
            )
            .unwrap();
        db.mark_changed();
        let reported = tokio::time::timeout(Duration::from_secs(2), errors.wait_for(Option::is_some))
            .await
            .expect("error timed out")
            .unwrap()
            .clone();
        assert!(matches!(
            reported,
            Some(TaskError::Feed(BackendError::Codec(_)))
        ));
        assert_eq!(store.current().len(), 1);
        assert_eq!(store.current()[0].title, "milk");
    }

    #[tokio::test]
    async fn update_of_missing_document_is_not_found() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let db = SqliteBackend::open(tmp.path(), FAST).unwrap();
        let doc = CollectionPath::user_tasks("u1").doc("nope");
        let err = db.update(&doc, Fields::new()).await.unwrap_err();
        assert_eq!(err, BackendError::NotFound("users/u1/tasks/nope".into()));
    }

    #[tokio::test]
    async fn session_persists_until_sign_out() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let user = {
            let db = SqliteBackend::open(tmp.path(), FAST).unwrap();
            db.create_user("a@example.com", "secret1").await.unwrap()
        };

        let db = SqliteBackend::open(tmp.path(), FAST).unwrap();
        assert_eq!(db.current_user(), Some(user.clone()));
        db.sign_out();
        assert!(db.current_user().is_none());

        let err = db
            .sign_in_with_password("a@example.com", "nope-nope")
            .await
            .unwrap_err();
        assert_eq!(err, BackendError::InvalidCredentials);
        let again = db
            .sign_in_with_password("a@example.com", "secret1")
            .await
            .unwrap();
        assert_eq!(again, user);
    }
}
