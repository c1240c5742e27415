//! Task executors.

use std::cell::Cell;

use tokio::sync::mpsc;

use super::{Task, TaskCompletion, TaskHandle, TaskId};

/// Dispatches tasks off the event loop.
///
/// Completions of tasks that were not canceled are reported exactly once;
/// canceled tasks report nothing.
pub trait TaskExecutor {
    fn execute(&self, task: Box<dyn Task>) -> TaskHandle;
}

/// Runs tasks on the tokio runtime and sends completions over a channel.
///
/// Must be used from within a runtime context.
pub struct TokioTaskExecutor {
    next_id: Cell<u64>,
    completions: mpsc::UnboundedSender<TaskCompletion>,
}

impl TokioTaskExecutor {
    /// Create an executor and the receiver the event loop drains.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TaskCompletion>) {
        let (completions, rx) = mpsc::unbounded_channel();
        (
            Self {
                next_id: Cell::new(0),
                completions,
            },
            rx,
        )
    }
}

impl TaskExecutor for TokioTaskExecutor {
    fn execute(&self, mut task: Box<dyn Task>) -> TaskHandle {
        let id = TaskId(self.next_id.get() + 1);
        self.next_id.set(id.0);

        let handle = TaskHandle::new(id);
        let token = handle.token().clone();
        let completions = self.completions.clone();

        tokio::spawn(async move {
            let result = task.execute(&token).await;
            if token.is_canceled() {
                tracing::debug!(task = task.name(), %id, "suppressing completion of canceled task");
                if let Ok(output) = result {
                    task.discard(output);
                }
                return;
            }
            if let Err(e) = completions.send(TaskCompletion { id, result }) {
                tracing::debug!(task = task.name(), %id, "event loop gone, discarding output");
                if let Ok(output) = e.0.result {
                    task.discard(output);
                }
            }
        });

        handle
    }
}

/// Executor driven explicitly by tests.
pub mod manual {
    use super::*;
    use std::cell::RefCell;
    use std::collections::VecDeque;

    use crate::error::SyncError;
    use crate::task::CancelToken;

    struct Queued {
        id: TaskId,
        token: CancelToken,
        task: Box<dyn Task>,
    }

    /// Queues dispatched tasks until the test runs them.
    #[derive(Default)]
    pub struct ManualTaskExecutor {
        next_id: Cell<u64>,
        queue: RefCell<VecDeque<Queued>>,
    }

    impl ManualTaskExecutor {
        pub fn new() -> Self {
            Self::default()
        }

        /// Number of dispatched tasks not yet run.
        pub fn pending(&self) -> usize {
            self.queue.borrow().len()
        }

        /// Names of queued tasks, oldest first.
        pub fn pending_names(&self) -> Vec<&'static str> {
            self.queue.borrow().iter().map(|q| q.task.name()).collect()
        }

        /// Run the oldest queued task.
        ///
        /// Returns `None` when the queue is empty or the task was canceled.
        pub async fn run_next(&self) -> Option<TaskCompletion> {
            let Queued { id, token, mut task } = self.queue.borrow_mut().pop_front()?;
            let result = task.execute(&token).await;
            if token.is_canceled() {
                if let Ok(output) = result {
                    task.discard(output);
                }
                return None;
            }
            Some(TaskCompletion { id, result })
        }

        /// Run every queued task, including ones queued while running.
        pub async fn run_all(&self) -> Vec<TaskCompletion> {
            let mut completions = Vec::new();
            while self.pending() > 0 {
                if let Some(completion) = self.run_next().await {
                    completions.push(completion);
                }
            }
            completions
        }

        /// Complete the oldest queued task with `error` without running it.
        pub fn fail_next(&self, error: SyncError) -> Option<TaskCompletion> {
            let Queued { id, token, .. } = self.queue.borrow_mut().pop_front()?;
            if token.is_canceled() {
                return None;
            }
            Some(TaskCompletion {
                id,
                result: Err(error),
            })
        }
    }

    impl TaskExecutor for ManualTaskExecutor {
        fn execute(&self, task: Box<dyn Task>) -> TaskHandle {
            let id = TaskId(self.next_id.get() + 1);
            self.next_id.set(id.0);
            let handle = TaskHandle::new(id);
            self.queue.borrow_mut().push_back(Queued {
                id,
                token: handle.token().clone(),
                task,
            });
            handle
        }
    }
}

#[cfg(test)]
mod tests {
    use super::manual::ManualTaskExecutor;
    use super::*;
    use crate::error::Result;
    use crate::task::{CancelToken, TaskOutput};
    use async_trait::async_trait;
    use std::path::PathBuf;

    struct WriteFile(PathBuf);

    #[async_trait]
    impl Task for WriteFile {
        fn name(&self) -> &'static str {
            "write-file"
        }

        async fn execute(&mut self, _token: &CancelToken) -> Result<TaskOutput> {
            std::fs::write(&self.0, b"data")?;
            Ok(TaskOutput::SnapshotSaved {
                file: Some(self.0.clone()),
            })
        }
    }

    #[tokio::test]
    async fn test_tokio_executor_reports_completion() {
        let dir = tempfile::tempdir().unwrap();
        let (executor, mut completions) = TokioTaskExecutor::new();

        let handle = executor.execute(Box::new(WriteFile(dir.path().join("a"))));
        let completion = completions.recv().await.unwrap();

        assert_eq!(completion.id, handle.id());
        assert!(matches!(
            completion.result,
            Ok(TaskOutput::SnapshotSaved { file: Some(_) })
        ));
    }

    #[tokio::test]
    async fn test_tokio_executor_suppresses_canceled_completion() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("canceled");
        let (executor, mut completions) = TokioTaskExecutor::new();

        let canceled = executor.execute(Box::new(WriteFile(file.clone())));
        canceled.cancel();
        let kept = executor.execute(Box::new(WriteFile(dir.path().join("kept"))));

        let completion = completions.recv().await.unwrap();
        assert_eq!(completion.id, kept.id());
        // Ordering of spawned tasks is not guaranteed, so wait for the discard.
        for _ in 0..100 {
            if !file.exists() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert!(!file.exists());
    }

    #[tokio::test]
    async fn test_manual_executor_runs_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let executor = ManualTaskExecutor::new();

        let first = executor.execute(Box::new(WriteFile(dir.path().join("1"))));
        let second = executor.execute(Box::new(WriteFile(dir.path().join("2"))));
        assert_eq!(executor.pending_names(), vec!["write-file", "write-file"]);

        let completions = executor.run_all().await;
        let ids: Vec<_> = completions.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![first.id(), second.id()]);
    }

    #[tokio::test]
    async fn test_manual_executor_discards_canceled_output() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("gone");
        let executor = ManualTaskExecutor::new();

        executor.execute(Box::new(WriteFile(file.clone()))).cancel();
        assert!(executor.run_next().await.is_none());
        assert!(!file.exists());
        assert_eq!(executor.pending(), 0);
    }
}
