//! Live task list of one user, derived from the document store's snapshots.

use futures::StreamExt;
use futures::stream::BoxStream;

use crate::domain::document::{CollectionPath, Document, FieldValue};
use crate::domain::task::Task;
use crate::error::BackendError;
use crate::repo::DocumentStore;

pub const TITLE_FIELD: &str = "title";
pub const DONE_FIELD: &str = "done";
pub const CREATED_AT_FIELD: &str = "createdAt";

pub type TaskFeed = BoxStream<'static, Result<Vec<Task>, BackendError>>;

/// Every item is the complete task list at that moment, or an error on its
/// own. Dropping the stream cancels the backend subscription.
pub fn subscribe(store: &dyn DocumentStore, uid: &str) -> TaskFeed {
    store
        .subscribe(&CollectionPath::user_tasks(uid))
        .map(|pushed| {
            pushed.map(|snapshot| snapshot.documents.iter().map(to_task).collect::<Vec<_>>())
        })
        .boxed()
}

/// Missing, null or mistyped fields fall back to their defaults one by one;
/// a document is never skipped.
pub fn to_task(doc: &Document) -> Task {
    let title = doc
        .fields
        .get(TITLE_FIELD)
        .and_then(FieldValue::as_text)
        .unwrap_or_default();
    let done = doc
        .fields
        .get(DONE_FIELD)
        .and_then(FieldValue::as_bool)
        .unwrap_or(false);
    Task::new(doc.id.clone(), title, done)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::document::Fields;
    use crate::repo::memory::InMemoryDocumentStore;

    fn doc(id: &str, fields: Vec<(&str, FieldValue)>) -> Document {
        Document {
            id: id.into(),
            fields: fields
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect::<Fields>(),
        }
    }

    #[test]
    fn fields_default_independently() {
        let full = doc(
            "a",
            vec![("title", "milk".into()), ("done", FieldValue::Bool(true))],
        );
        assert_eq!(to_task(&full), Task::new("a", "milk", true));

        let no_title = doc("b", vec![("done", FieldValue::Bool(true))]);
        assert_eq!(to_task(&no_title), Task::new("b", "", true));

        let no_done = doc("c", vec![("title", "eggs".into())]);
        assert_eq!(to_task(&no_done), Task::new("c", "eggs", false));

        let nulls = doc(
            "d",
            vec![("title", FieldValue::Null), ("done", FieldValue::Null)],
        );
        assert_eq!(to_task(&nulls), Task::new("d", "", false));

        let mistyped = doc(
            "e",
            vec![("title", FieldValue::Integer(7)), ("done", "yes".into())],
        );
        assert_eq!(to_task(&mistyped), Task::new("e", "", false));
    }

    #[tokio::test]
    async fn errors_arrive_without_a_task_list() {
        let store = InMemoryDocumentStore::default();
        let mut feed = subscribe(&store, "u1");
        assert_eq!(feed.next().await.unwrap(), Ok(vec![]));

        let err = BackendError::PermissionDenied("rules".into());
        store.inject_feed_error(&CollectionPath::user_tasks("u1"), err.clone());
        assert_eq!(feed.next().await.unwrap(), Err(err));
    }

    #[tokio::test]
    async fn snapshots_keep_backend_order() {
        let store = InMemoryDocumentStore::default();
        let tasks = CollectionPath::user_tasks("u1");
        for title in ["b", "c", "a"] {
            let fields = Fields::from([(TITLE_FIELD.to_string(), FieldValue::from(title))]);
            store.add(&tasks, fields).await.unwrap();
        }

        let mut feed = subscribe(&store, "u1");
        let titles: Vec<String> = feed
            .next()
            .await
            .unwrap()
            .unwrap()
            .into_iter()
            .map(|t| t.title)
            .collect();
        assert_eq!(titles, ["b", "c", "a"]);
    }
}
