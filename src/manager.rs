use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::sync::mpsc::{self, UnboundedReceiver};

use crate::buffer::BufferSettings;
use crate::client::{PromptBuilder, TokenSource};
use crate::task::{Notification, Task, TaskContext, TaskEvent, TaskHandle, TaskId, TaskKind};

/// Worker slots. One for the live task, one so a cancelled task can drain
/// while its replacement starts.
pub const MAX_CONCURRENT_TASKS: usize = 2;

/// Caller-side callbacks for the current task.
pub trait TaskHandlers {
    fn on_content(&mut self, text: &str);
    fn on_progress(&mut self, message: &str);
    fn on_error(&mut self, message: &str);
    fn on_finished(&mut self);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRecord {
    pub id: TaskId,
    pub kind: TaskKind,
    pub input_chars: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskStats {
    pub total_tasks: usize,
    pub reviews: usize,
    pub followups: usize,
    pub has_current_task: bool,
}

/// Runs at most one generation at a time.
///
/// Starting a task cancels and forgets the previous one. Workers run on tokio
/// tasks and report back over a channel; the caller drains it and passes each
/// event to [`deliver`](TaskManager::deliver), which drops anything from a
/// task that is no longer current.
pub struct TaskManager<S> {
    ctx: TaskContext<S>,
    workers: Arc<Semaphore>,
    current: Option<TaskHandle>,
    next_id: TaskId,
    history: Vec<TaskRecord>,
}

impl<S: TokenSource> TaskManager<S> {
    pub fn new(
        source: Arc<S>,
        prompts: PromptBuilder,
        buffer: BufferSettings,
    ) -> (Self, UnboundedReceiver<TaskEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let manager = Self {
            ctx: TaskContext {
                source,
                prompts,
                buffer,
                events,
            },
            workers: Arc::new(Semaphore::new(MAX_CONCURRENT_TASKS)),
            current: None,
            next_id: 1,
            history: Vec::new(),
        };
        (manager, rx)
    }

    /// Cancel whatever is running and start reviewing `code`.
    pub fn start_review(&mut self, code: impl Into<String>) -> TaskHandle {
        let code = code.into();
        let id = self.claim_id();
        let input_chars = code.chars().count();
        let (task, handle) = Task::review(id, code, self.ctx.clone());
        self.launch(task, handle, input_chars)
    }

    /// Cancel whatever is running and ask `question` about `original_review`.
    pub fn start_followup(
        &mut self,
        original_review: impl Into<String>,
        question: impl Into<String>,
    ) -> TaskHandle {
        let original_review = original_review.into();
        let question = question.into();
        let id = self.claim_id();
        // Follow-ups are sized by the question alone.
        let input_chars = question.chars().count();
        let (task, handle) = Task::followup(id, original_review, question, self.ctx.clone());
        self.launch(task, handle, input_chars)
    }

    /// Cancel the current task, if any, and forget it. Returns true if there
    /// was one.
    pub fn cancel_current(&mut self) -> bool {
        match self.current.take() {
            Some(handle) => {
                handle.cancel();
                true
            }
            None => false,
        }
    }

    pub fn current(&self) -> Option<&TaskHandle> {
        self.current.as_ref()
    }

    pub fn is_current(&self, id: TaskId) -> bool {
        self.current.as_ref().is_some_and(|h| h.id() == id)
    }

    /// Route one event to `handlers`. Returns false if the event was dropped
    /// because its task is no longer current.
    pub fn deliver<H: TaskHandlers + ?Sized>(&self, event: TaskEvent, handlers: &mut H) -> bool {
        if !self.is_current(event.task_id) {
            tracing::trace!(task_id = event.task_id, "dropping event from stale task");
            return false;
        }
        match event.notification {
            Notification::Content(text) => handlers.on_content(&text),
            Notification::Progress(message) => handlers.on_progress(&message),
            Notification::Error(message) => handlers.on_error(&message),
            Notification::Finished => handlers.on_finished(),
        }
        true
    }

    pub fn stats(&self) -> TaskStats {
        let reviews = self
            .history
            .iter()
            .filter(|r| r.kind == TaskKind::Review)
            .count();
        TaskStats {
            total_tasks: self.history.len(),
            reviews,
            followups: self.history.len() - reviews,
            has_current_task: self
                .current
                .as_ref()
                .is_some_and(|h| !h.state().is_terminal()),
        }
    }

    pub fn history(&self) -> &[TaskRecord] {
        &self.history
    }

    pub async fn test_connection(&self) -> bool {
        self.ctx.source.test_connection().await
    }

    fn claim_id(&mut self) -> TaskId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn launch(&mut self, task: Task<S>, handle: TaskHandle, input_chars: usize) -> TaskHandle {
        if self.cancel_current() {
            tracing::debug!(replaced_by = handle.id(), "cancelled previous task");
        }

        self.history.push(TaskRecord {
            id: handle.id(),
            kind: handle.kind(),
            input_chars,
        });

        let workers = self.workers.clone();
        let events = self.ctx.events.clone();
        let watch = handle.clone();
        tokio::spawn(async move {
            let Ok(_permit) = workers.acquire_owned().await else {
                return;
            };
            // Run in its own tokio task so a panic surfaces as a JoinError
            // here instead of vanishing.
            match tokio::spawn(task.run()).await {
                Ok(state) => {
                    tracing::debug!(task_id = watch.id(), ?state, "worker exited");
                }
                Err(join_err) if join_err.is_panic() => {
                    tracing::error!(task_id = watch.id(), "task worker panicked: {join_err}");
                    if watch.mark_failed() {
                        let _ = events.send(TaskEvent {
                            task_id: watch.id(),
                            notification: Notification::Error(
                                "internal error while generating the response".to_string(),
                            ),
                        });
                    }
                }
                Err(_) => {}
            }
        });

        self.current = Some(handle.clone());
        handle
    }
}
