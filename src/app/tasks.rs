use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::StreamExt;
use log::{debug, warn};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::domain::document::{CollectionPath, FieldValue, Fields};
use crate::domain::task::{Task, TaskId};
use crate::error::{BackendError, TaskError, WriteOp};
use crate::repo::DocumentStore;
use crate::usecase::feed::{self, CREATED_AT_FIELD, DONE_FIELD, TITLE_FIELD};
use crate::usecase::identity::IdentityGate;

pub type TaskList = Arc<Vec<Task>>;

/// State shared with the subscription task and with in-flight writes.
struct Shared {
    /// Bumped whenever the subscription is replaced or torn down. Only the
    /// subscription holding the current value may publish.
    generation: Mutex<u64>,
    tasks: watch::Sender<TaskList>,
    errors: watch::Sender<Option<TaskError>>,
}

impl Shared {
    fn generation(&self) -> MutexGuard<'_, u64> {
        self.generation.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn report(&self, err: TaskError) {
        warn!("{err}");
        self.errors.send_replace(Some(err));
    }
}

/// Handle on a write that has already been sent. Awaiting it is optional:
/// dropping it leaves the write running.
#[must_use = "drop the handle explicitly to fire and forget"]
pub struct PendingWrite<T> {
    op: WriteOp,
    handle: JoinHandle<Result<T, TaskError>>,
}

impl<T> PendingWrite<T> {
    pub async fn wait(self) -> Result<T, TaskError> {
        match self.handle.await {
            Ok(result) => result,
            Err(e) => {
                warn!("{} task ended abnormally: {e}", self.op);
                Err(TaskError::Interrupted { op: self.op })
            }
        }
    }
}

/// Observable task list of the signed-in user.
///
/// The list is written only by the live feed; `add`, `toggle` and `delete`
/// send commands and their effect shows up with the next pushed snapshot.
/// Without a signed-in user every operation does nothing.
pub struct TaskStore {
    backend: Arc<dyn DocumentStore>,
    identity: Arc<dyn IdentityGate>,
    shared: Arc<Shared>,
    subscription: Option<JoinHandle<()>>,
}

impl TaskStore {
    pub fn new(backend: Arc<dyn DocumentStore>, identity: Arc<dyn IdentityGate>) -> Self {
        let (tasks, _) = watch::channel(TaskList::default());
        let (errors, _) = watch::channel(None);
        Self {
            backend,
            identity,
            shared: Arc::new(Shared {
                generation: Mutex::new(0),
                tasks,
                errors,
            }),
            subscription: None,
        }
    }

    pub fn tasks(&self) -> watch::Receiver<TaskList> {
        self.shared.tasks.subscribe()
    }

    #[cfg(test)]
    pub fn current(&self) -> TaskList {
        self.shared.tasks.borrow().clone()
    }

    /// Last failure of the feed or of any write.
    pub fn errors(&self) -> watch::Receiver<Option<TaskError>> {
        self.shared.errors.subscribe()
    }

    pub fn clear_error(&self) {
        self.shared.errors.send_replace(None);
    }

    #[cfg(test)]
    pub fn is_loaded(&self) -> bool {
        self.subscription.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Starts following the current user's tasks, replacing any earlier
    /// subscription. Returns `false` when nobody is signed in.
    pub fn load(&mut self) -> bool {
        let Some(uid) = self.identity.current_user_id() else {
            debug!("load skipped: not signed in");
            return false;
        };
        let generation = self.retire_subscription();
        let mut tasks = feed::subscribe(&*self.backend, &uid);
        let shared = Arc::clone(&self.shared);
        debug!("subscribing to tasks of {uid} (generation {generation})");

        self.subscription = Some(tokio::spawn(async move {
            while let Some(pushed) = tasks.next().await {
                let current = shared.generation();
                if *current != generation {
                    break;
                }
                match pushed {
                    Ok(list) => {
                        shared.tasks.send_replace(Arc::new(list));
                    }
                    // The previous list stays visible.
                    Err(e) => shared.report(TaskError::Feed(e)),
                }
            }
            debug!("task subscription {generation} ended");
        }));
        true
    }

    /// Stops the subscription and empties the list, e.g. on sign-out.
    pub fn unload(&mut self) {
        self.retire_subscription();
        self.shared.tasks.send_replace(TaskList::default());
    }

    /// Creates a task; resolves to the id the backend assigned.
    pub fn add(&self, title: impl Into<String>) -> Option<PendingWrite<TaskId>> {
        let uid = self.signed_in(WriteOp::Add)?;
        let fields = Fields::from([
            (TITLE_FIELD.to_string(), FieldValue::Text(title.into())),
            (DONE_FIELD.to_string(), FieldValue::Bool(false)),
            (CREATED_AT_FIELD.to_string(), FieldValue::ServerTimestamp),
        ]);
        let backend = Arc::clone(&self.backend);
        let collection = CollectionPath::user_tasks(&uid);
        Some(self.spawn_write(WriteOp::Add, async move {
            backend.add(&collection, fields).await
        }))
    }

    pub fn toggle(&self, task: &Task) -> Option<PendingWrite<()>> {
        let uid = self.signed_in(WriteOp::Toggle)?;
        let fields = Fields::from([(DONE_FIELD.to_string(), FieldValue::Bool(!task.done))]);
        let backend = Arc::clone(&self.backend);
        let doc = CollectionPath::user_tasks(&uid).doc(&task.id);
        Some(self.spawn_write(WriteOp::Toggle, async move {
            backend.update(&doc, fields).await
        }))
    }

    pub fn delete(&self, task: &Task) -> Option<PendingWrite<()>> {
        let uid = self.signed_in(WriteOp::Delete)?;
        let backend = Arc::clone(&self.backend);
        let doc = CollectionPath::user_tasks(&uid).doc(&task.id);
        Some(self.spawn_write(WriteOp::Delete, async move { backend.delete(&doc).await }))
    }

    fn signed_in(&self, op: WriteOp) -> Option<String> {
        let uid = self.identity.current_user_id();
        if uid.is_none() {
            debug!("{op} skipped: not signed in");
        }
        uid
    }

    fn spawn_write<T, F>(&self, op: WriteOp, write: F) -> PendingWrite<T>
    where
        T: Send + 'static,
        F: Future<Output = Result<T, BackendError>> + Send + 'static,
    {
        let shared = Arc::clone(&self.shared);
        let handle = tokio::spawn(async move {
            match write.await {
                Ok(value) => {
                    debug!("{op} acknowledged");
                    Ok(value)
                }
                Err(source) => {
                    let err = TaskError::Write { op, source };
                    shared.report(err.clone());
                    Err(err)
                }
            }
        });
        PendingWrite { op, handle }
    }

    /// Invalidates the running subscription and returns the new generation.
    fn retire_subscription(&mut self) -> u64 {
        let next = {
            let mut generation = self.shared.generation();
            *generation += 1;
            *generation
        };
        if let Some(old) = self.subscription.take() {
            old.abort();
            debug!("task subscription replaced");
        }
        next
    }
}

impl Drop for TaskStore {
    fn drop(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            subscription.abort();
        }
    }
}
