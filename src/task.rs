use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use futures_util::StreamExt;
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::buffer::{BufferSettings, ContentSink, Streamer};
use crate::client::{PromptBuilder, RequestPayload, TokenSource};
use crate::error::ReviewError;

pub type TaskId = u64;

/// Lifecycle of one task. Moves forward only:
/// `Created → Running → {Finished | Failed | Cancelled}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskState {
    Created = 0,
    Running = 1,
    Cancelled = 2,
    Finished = 3,
    Failed = 4,
}

impl TaskState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Created,
            1 => Self::Running,
            2 => Self::Cancelled,
            3 => Self::Finished,
            _ => Self::Failed,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Cancelled | Self::Finished | Self::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Review,
    FollowUp,
}

impl TaskKind {
    /// Tokens between progress notifications.
    pub fn progress_every(self) -> usize {
        match self {
            Self::Review => 50,
            Self::FollowUp => 30,
        }
    }

    fn started_message(self) -> &'static str {
        match self {
            Self::Review => "Starting code review...",
            Self::FollowUp => "Processing follow-up question...",
        }
    }

    fn progress_message(self, tokens: usize) -> String {
        match self {
            Self::Review => format!("Received {tokens} tokens..."),
            Self::FollowUp => format!("Processing response... ({tokens} tokens)"),
        }
    }

    fn completed_message(self) -> &'static str {
        match self {
            Self::Review => "Code review completed",
            Self::FollowUp => "Follow-up completed",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Review => f.write_str("review"),
            Self::FollowUp => f.write_str("followup"),
        }
    }
}

/// What the caller hears about a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    Content(String),
    Progress(String),
    Error(String),
    Finished,
}

/// A notification tagged with the task that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskEvent {
    pub task_id: TaskId,
    pub notification: Notification,
}

#[derive(Debug, Clone)]
enum TaskInput {
    Review {
        code: String,
    },
    FollowUp {
        original_review: String,
        question: String,
    },
}

impl TaskInput {
    fn kind(&self) -> TaskKind {
        match self {
            Self::Review { .. } => TaskKind::Review,
            Self::FollowUp { .. } => TaskKind::FollowUp,
        }
    }

    fn payload(&self, prompts: &PromptBuilder) -> Result<RequestPayload, ReviewError> {
        match self {
            Self::Review { code } => prompts.review(code),
            Self::FollowUp {
                original_review,
                question,
            } => prompts.followup(original_review, question),
        }
    }

    /// Text written to the output before any model tokens.
    fn preamble(&self) -> Option<String> {
        match self {
            Self::Review { .. } => None,
            Self::FollowUp { question, .. } => {
                Some(format!("\n\n---\n\n**Follow-up:** {question}\n\n"))
            }
        }
    }
}

/// State and cancellation shared between the worker and the coordinator.
#[derive(Debug)]
struct Shared {
    state: AtomicU8,
    cancel: CancellationToken,
}

impl Shared {
    fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, from: TaskState, to: TaskState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn cancel(&self) -> bool {
        self.cancel.cancel();
        self.transition(TaskState::Created, TaskState::Cancelled)
            || self.transition(TaskState::Running, TaskState::Cancelled)
    }
}

/// Coordinator-side view of a task: observe its state, or cancel it.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    id: TaskId,
    kind: TaskKind,
    shared: Arc<Shared>,
}

impl TaskHandle {
    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    pub fn state(&self) -> TaskState {
        self.shared.state()
    }

    /// Request cancellation. Idempotent; has no effect on a task that already
    /// finished or failed. Returns true if this call cancelled the task.
    pub fn cancel(&self) -> bool {
        let cancelled = self.shared.cancel();
        if cancelled {
            tracing::info!(task_id = self.id, kind = %self.kind, "task cancelled");
        }
        cancelled
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    /// Force a running task into `Failed`, for when its worker died.
    pub(crate) fn mark_failed(&self) -> bool {
        self.shared.transition(TaskState::Running, TaskState::Failed)
            || self.shared.transition(TaskState::Created, TaskState::Failed)
    }
}

/// Everything a task needs besides its own input.
pub struct TaskContext<S> {
    pub source: Arc<S>,
    pub prompts: PromptBuilder,
    pub buffer: BufferSettings,
    pub events: UnboundedSender<TaskEvent>,
}

impl<S> Clone for TaskContext<S> {
    fn clone(&self) -> Self {
        Self {
            source: self.source.clone(),
            prompts: self.prompts.clone(),
            buffer: self.buffer,
            events: self.events.clone(),
        }
    }
}

/// One end-to-end generation. Consumed by [`Task::run`]; never reused.
pub struct Task<S> {
    id: TaskId,
    input: TaskInput,
    shared: Arc<Shared>,
    ctx: TaskContext<S>,
}

impl<S: TokenSource> Task<S> {
    pub fn review(id: TaskId, code: String, ctx: TaskContext<S>) -> (Self, TaskHandle) {
        tracing::info!(task_id = id, chars = code.chars().count(), "created review task");
        Self::new(id, TaskInput::Review { code }, ctx)
    }

    pub fn followup(
        id: TaskId,
        original_review: String,
        question: String,
        ctx: TaskContext<S>,
    ) -> (Self, TaskHandle) {
        tracing::info!(
            task_id = id,
            question = %question.chars().take(50).collect::<String>(),
            "created follow-up task"
        );
        Self::new(
            id,
            TaskInput::FollowUp {
                original_review,
                question,
            },
            ctx,
        )
    }

    fn new(id: TaskId, input: TaskInput, ctx: TaskContext<S>) -> (Self, TaskHandle) {
        let shared = Arc::new(Shared {
            state: AtomicU8::new(TaskState::Created as u8),
            cancel: CancellationToken::new(),
        });
        let handle = TaskHandle {
            id,
            kind: input.kind(),
            shared: shared.clone(),
        };
        (
            Self {
                id,
                input,
                shared,
                ctx,
            },
            handle,
        )
    }

    /// Drive the task to a terminal state and return it.
    ///
    /// Emits at most one terminal notification: `Finished` or `Error`, never
    /// both, and neither when cancelled.
    pub async fn run(self) -> TaskState {
        let Self {
            id,
            input,
            shared,
            ctx,
        } = self;
        let kind = input.kind();

        if !shared.transition(TaskState::Created, TaskState::Running) {
            tracing::debug!(task_id = id, "task cancelled before it started");
            return shared.state();
        }

        let notifier = Notifier {
            task_id: id,
            events: ctx.events.clone(),
            cancel: shared.cancel.clone(),
        };

        let payload = match input.payload(&ctx.prompts) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(task_id = id, "rejected task input: {e}");
                if shared.transition(TaskState::Running, TaskState::Failed) {
                    notifier.error(e.user_message());
                }
                return shared.state();
            }
        };

        notifier.progress(kind.started_message());

        let mut buffer = BufferGuard::new(ctx.buffer.build());
        buffer.set_sink(notifier.content_sink());
        buffer.start();
        if let Some(preamble) = input.preamble() {
            buffer.add_token(preamble);
        }

        let outcome = stream_into(
            ctx.source.as_ref(),
            payload,
            &mut *buffer,
            &shared.cancel,
            &notifier,
            kind,
        )
        .await;

        // Flush before any terminal notification so content arrives first.
        drop(buffer);

        match outcome {
            Ok(tokens) => {
                if shared.transition(TaskState::Running, TaskState::Finished) {
                    notifier.progress(kind.completed_message());
                    notifier.finished();
                    tracing::info!(task_id = id, %kind, tokens, "task completed");
                }
            }
            Err(e) if e.is_cancelled() || shared.cancel.is_cancelled() => {
                shared.transition(TaskState::Running, TaskState::Cancelled);
                tracing::info!(task_id = id, %kind, "task stopped after cancellation");
            }
            Err(e) => {
                if shared.transition(TaskState::Running, TaskState::Failed) {
                    tracing::error!(task_id = id, %kind, "task failed: {e}");
                    notifier.error(e.user_message());
                }
            }
        }

        shared.state()
    }
}

/// Pull tokens into the buffer until the stream ends, fails, or the task is
/// cancelled. Returns the number of tokens forwarded.
async fn stream_into<S: TokenSource>(
    source: &S,
    payload: RequestPayload,
    buffer: &mut dyn Streamer,
    cancel: &CancellationToken,
    notifier: &Notifier,
    kind: TaskKind,
) -> Result<usize, ReviewError> {
    // Pending content (the follow-up preamble) must still flush while the
    // request is connecting or backing off.
    let open = source.open_stream(payload, cancel.clone());
    tokio::pin!(open);
    let mut tokens = loop {
        let deadline = buffer.flush_deadline();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ReviewError::Cancelled),
            opened = &mut open => break opened?,
            _ = idle_flush(deadline) => buffer.flush_if_due(Instant::now()),
        }
    };
    let mut count = 0usize;

    loop {
        let deadline = buffer.flush_deadline();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ReviewError::Cancelled),
            _ = idle_flush(deadline) => buffer.flush_if_due(Instant::now()),
            next = tokens.next() => match next {
                None => return Ok(count),
                Some(Err(e)) => return Err(e),
                Some(Ok(token)) => {
                    if cancel.is_cancelled() {
                        return Err(ReviewError::Cancelled);
                    }
                    buffer.add_token(token);
                    count += 1;
                    if count % kind.progress_every() == 0 {
                        notifier.progress(&kind.progress_message(count));
                    }
                }
            },
        }
    }
}

async fn idle_flush(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Stops the buffer when dropped, so every exit path flushes exactly once.
struct BufferGuard(Box<dyn Streamer>);

impl BufferGuard {
    fn new(streamer: Box<dyn Streamer>) -> Self {
        Self(streamer)
    }
}

impl std::ops::Deref for BufferGuard {
    type Target = dyn Streamer;

    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl std::ops::DerefMut for BufferGuard {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.0.as_mut()
    }
}

impl Drop for BufferGuard {
    fn drop(&mut self) {
        self.0.stop();
    }
}

/// Sends a task's notifications. Content and progress are dropped once the
/// task is cancelled.
#[derive(Clone)]
struct Notifier {
    task_id: TaskId,
    events: UnboundedSender<TaskEvent>,
    cancel: CancellationToken,
}

impl Notifier {
    fn send(&self, notification: Notification) {
        // The receiver going away just means nobody is listening any more.
        let _ = self.events.send(TaskEvent {
            task_id: self.task_id,
            notification,
        });
    }

    fn progress(&self, text: &str) {
        if !self.cancel.is_cancelled() {
            self.send(Notification::Progress(text.to_string()));
        }
    }

    fn error(&self, message: String) {
        self.send(Notification::Error(message));
    }

    fn finished(&self) {
        self.send(Notification::Finished);
    }

    fn content_sink(&self) -> ContentSink {
        let notifier = self.clone();
        Box::new(move |chunk| {
            if notifier.cancel.is_cancelled() {
                tracing::debug!(
                    task_id = notifier.task_id,
                    chars = chunk.len(),
                    "dropping content flushed after cancellation"
                );
                return;
            }
            notifier.send(Notification::Content(chunk));
        })
    }
}
