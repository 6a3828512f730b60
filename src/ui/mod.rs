use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use clap::Subcommand;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::sync::watch;

use crate::app::auth::{AuthModel, AuthState};
use crate::app::tasks::{TaskList, TaskStore};
use crate::domain::task::Task;
use crate::error::TaskError;

const NOT_SIGNED_IN: &str = "not signed in; run `taskfeed login` or `taskfeed signup` first";

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create an account and sign in
    Signup {
        #[arg(long)]
        email: String,
        #[arg(long, env = "TASKFEED_PASSWORD", hide_env_values = true)]
        password: String,
    },
    /// Sign in with email and password
    Login {
        #[arg(long)]
        email: String,
        #[arg(long, env = "TASKFEED_PASSWORD", hide_env_values = true)]
        password: String,
    },
    /// Sign out and forget the session
    Logout,
    /// Show the signed-in account
    Whoami,
    /// Print the current task list
    List,
    /// Add a task
    Add { title: String },
    /// Flip a task between open and done (id or unique id prefix)
    Toggle { id: String },
    /// Delete a task (id or unique id prefix)
    Delete { id: String },
    /// Follow the task list live until Ctrl-C
    Watch,
}

/// View-models for one invocation.
pub struct Session {
    pub auth: AuthModel,
    pub tasks: TaskStore,
    /// Upper bound on waiting for the first snapshot.
    pub wait: Duration,
}

pub async fn run(mut session: Session, command: Command) -> Result<()> {
    match command {
        Command::Signup { email, password } => {
            let user = session.auth.signup(&email, &password).await?;
            println!("Signed up as {} ({})", user.email, user.uid);
        }
        Command::Login { email, password } => {
            let user = session.auth.login(&email, &password).await?;
            println!("Signed in as {} ({})", user.email, user.uid);
        }
        Command::Logout => {
            session.tasks.unload();
            session.auth.sign_out();
            println!("Signed out");
        }
        Command::Whoami => match session.auth.current() {
            AuthState::SignedIn(user) => println!("{} ({})", user.email, user.uid),
            _ => println!("Not signed in"),
        },
        Command::List => {
            let tasks = first_snapshot(&mut session).await?;
            print!("{}", render_list(&tasks));
        }
        Command::Add { title } => {
            let title = title.trim();
            if title.is_empty() {
                bail!("Cannot add an empty task");
            }
            let pending = session.tasks.add(title).ok_or_else(|| anyhow!(NOT_SIGNED_IN))?;
            let id = pending.wait().await?;
            println!("Added {id}");
        }
        Command::Toggle { id } => {
            let tasks = first_snapshot(&mut session).await?;
            let task = resolve_task(&tasks, &id)?;
            let pending = session.tasks.toggle(task).ok_or_else(|| anyhow!(NOT_SIGNED_IN))?;
            pending.wait().await?;
            let now = if task.done { "open" } else { "done" };
            println!("Marked {} as {now}", task.title);
        }
        Command::Delete { id } => {
            let tasks = first_snapshot(&mut session).await?;
            let task = resolve_task(&tasks, &id)?;
            let pending = session.tasks.delete(task).ok_or_else(|| anyhow!(NOT_SIGNED_IN))?;
            pending.wait().await?;
            println!("Deleted {}", task.title);
        }
        Command::Watch => follow(&mut session).await?,
    }
    Ok(())
}

async fn first_snapshot(session: &mut Session) -> Result<TaskList> {
    let mut tasks = session.tasks.tasks();
    let mut errors = session.tasks.errors();
    if !session.tasks.load() {
        bail!(NOT_SIGNED_IN);
    }

    tokio::time::timeout(session.wait, next_push(&mut tasks, &mut errors))
        .await
        .context("timed out waiting for the task list")?
}

/// Next list published by the store, or the error that came instead.
async fn next_push(
    tasks: &mut watch::Receiver<TaskList>,
    errors: &mut watch::Receiver<Option<TaskError>>,
) -> Result<TaskList> {
    tokio::select! {
        changed = tasks.changed() => {
            changed.context("task store closed")?;
            Ok(tasks.borrow_and_update().clone())
        }
        changed = errors.changed() => {
            changed.context("task store closed")?;
            let err = errors.borrow_and_update().clone();
            Err(err.map_or_else(|| anyhow!("task feed failed"), anyhow::Error::from))
        }
    }
}

async fn follow(session: &mut Session) -> Result<()> {
    let mut tasks = session.tasks.tasks();
    let mut errors = session.tasks.errors();
    if !session.tasks.load() {
        bail!(NOT_SIGNED_IN);
    }
    println!("Watching tasks (Ctrl-C to stop)");

    loop {
        tokio::select! {
            changed = tasks.changed() => {
                changed.context("task store closed")?;
                let list = tasks.borrow_and_update().clone();
                println!("[{}] {} open / {} total", stamp(), open_count(&list), list.len());
                print!("{}", render_list(&list));
            }
            changed = errors.changed() => {
                changed.context("task store closed")?;
                let err = errors.borrow_and_update().clone();
                if let Some(err) = err {
                    eprintln!("[{}] {err}", stamp());
                    session.tasks.clear_error();
                }
            }
            signal = tokio::signal::ctrl_c() => {
                signal.context("failed to listen for Ctrl-C")?;
                break;
            }
        }
    }
    session.tasks.unload();
    Ok(())
}

/// Exact id first, then a unique prefix.
fn resolve_task<'a>(tasks: &'a [Task], query: &str) -> Result<&'a Task> {
    let query = query.trim();
    if let Some(task) = tasks.iter().find(|t| t.id == query) {
        return Ok(task);
    }
    let mut matches = tasks.iter().filter(|t| !query.is_empty() && t.id.starts_with(query));
    match (matches.next(), matches.next()) {
        (Some(task), None) => Ok(task),
        (Some(_), Some(_)) => bail!("id prefix {query:?} matches more than one task"),
        (None, _) => bail!("no task with id {query:?}"),
    }
}

fn open_count(tasks: &[Task]) -> usize {
    tasks.iter().filter(|t| !t.done).count()
}

fn render_list(tasks: &[Task]) -> String {
    if tasks.is_empty() {
        return "No tasks yet\n".to_string();
    }
    tasks
        .iter()
        .map(|task| {
            let mark = if task.done { 'x' } else { ' ' };
            format!("[{mark}] {}  {}\n", task.id, task.title)
        })
        .collect()
}

fn stamp() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "-".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<Task> {
        vec![
            Task::new("abc123", "milk", false),
            Task::new("abd456", "eggs", true),
        ]
    }

    #[test]
    fn render_marks_done_tasks() {
        let out = render_list(&sample());
        assert_eq!(out, "[ ] abc123  milk\n[x] abd456  eggs\n");
        assert_eq!(render_list(&[]), "No tasks yet\n");
        assert_eq!(open_count(&sample()), 1);
    }

    #[test]
    fn resolves_exact_ids_and_unique_prefixes() {
        let tasks = sample();
        assert_eq!(resolve_task(&tasks, "abd456").unwrap().title, "eggs");
        assert_eq!(resolve_task(&tasks, "abc").unwrap().title, "milk");

        let ambiguous = resolve_task(&tasks, "ab").unwrap_err().to_string();
        assert!(ambiguous.contains("more than one"));
        assert!(resolve_task(&tasks, "zzz").is_err());
        assert!(resolve_task(&tasks, "").is_err());
    }
}
