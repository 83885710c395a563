//! Record types for scheduled tasks.

use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a scheduled task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    /// Generate a fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for TaskId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

/// Distribution platform a task targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Reddit,
    Quora,
    Forum,
    Linkedin,
}

impl Platform {
    /// All known platforms, in declaration order. Used to build the
    /// default rate-limit table.
    pub const ALL: [Platform; 4] = [
        Platform::Reddit,
        Platform::Quora,
        Platform::Forum,
        Platform::Linkedin,
    ];
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Platform::Reddit => "reddit",
            Platform::Quora => "quora",
            Platform::Forum => "forum",
            Platform::Linkedin => "linkedin",
        };
        write!(f, "{name}")
    }
}

/// Kind of entity a task executes against. The entity id itself is opaque
/// and only interpreted by the handler registered for this kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    RedditPost,
    Article,
    GenericTask,
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            EntityKind::RedditPost => "reddit_post",
            EntityKind::Article => "article",
            EntityKind::GenericTask => "generic_task",
        };
        write!(f, "{name}")
    }
}

/// Dispatch tie-break priority. A higher priority wins among tasks due at
/// the same instant; it never preempts an earlier-scheduled task.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

/// Current status of a scheduled task.
///
/// Valid transitions are enforced by the scheduler's lifecycle module;
/// the store only guarantees that a transition is applied atomically
/// against the expected prior status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for its scheduled time.
    #[default]
    Pending,
    /// Currently executing.
    Running,
    /// Executed successfully.
    Completed,
    /// Last execution attempt failed; may retry if `next_retry_at` is set.
    Failed,
    /// Held back by the caller; excluded from dispatch.
    Paused,
    /// Cancelled by the caller or by retry exhaustion.
    Cancelled,
}

impl TaskStatus {
    /// Terminal states accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Cancelled)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Paused => "paused",
            TaskStatus::Cancelled => "cancelled",
        };
        write!(f, "{name}")
    }
}

/// How often a recurring template fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecurrenceFrequency {
    Once,
    Daily,
    Weekly,
    Monthly,
}

/// Recurrence pattern attached to a template task.
///
/// Lives only on the template; instances spawned from it carry
/// `parent_schedule_id` instead. Occurrences are computed in the declared
/// timezone and normalized to UTC instants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecurrencePattern {
    pub frequency: RecurrenceFrequency,
    /// Local wall-clock time each occurrence fires at.
    pub time_of_day: NaiveTime,
    /// IANA timezone name, e.g. "America/New_York".
    pub timezone: String,
    /// ISO weekday numbers (1 = Monday .. 7 = Sunday); weekly only.
    #[serde(default)]
    pub days_of_week: Vec<u8>,
    /// Day of month (1..=31, clamped to shorter months); monthly only.
    pub day_of_month: Option<u8>,
    /// No occurrence is generated after this instant.
    pub ends_at: Option<DateTime<Utc>>,
    /// Total occurrence cap, counting the template's own run.
    pub max_occurrences: Option<u32>,
}

/// Structured error reported by an execution handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionError {
    pub code: String,
    pub message: String,
    /// Whether the failure is worth another attempt.
    pub retryable: bool,
}

/// Outcome of a single execution attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub duration_ms: u64,
    /// Id assigned by the external platform, on success.
    pub external_id: Option<String>,
    /// URL of the published content, on success.
    pub external_url: Option<String>,
    pub error: Option<ExecutionError>,
}

impl ExecutionResult {
    /// A successful attempt.
    pub fn success(duration_ms: u64) -> Self {
        Self {
            success: true,
            duration_ms,
            external_id: None,
            external_url: None,
            error: None,
        }
    }

    /// A failed attempt with a structured error.
    pub fn failure(
        code: impl Into<String>,
        message: impl Into<String>,
        retryable: bool,
        duration_ms: u64,
    ) -> Self {
        Self {
            success: false,
            duration_ms,
            external_id: None,
            external_url: None,
            error: Some(ExecutionError {
                code: code.into(),
                message: message.into(),
                retryable,
            }),
        }
    }

    /// Attach the external reference produced by the platform.
    pub fn with_external(mut self, id: impl Into<String>, url: Option<String>) -> Self {
        self.external_id = Some(id.into());
        self.external_url = url;
        self
    }

    /// Whether the error, if any, is retryable.
    pub fn is_retryable(&self) -> bool {
        self.error.as_ref().is_some_and(|e| e.retryable)
    }
}

/// One entry in a task's execution history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    /// 1-based attempt number.
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub result: ExecutionResult,
}

/// A scheduled unit of work tied to one external entity and a target time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub id: TaskId,
    pub customer_id: String,
    pub platform: Platform,
    pub entity_kind: EntityKind,
    /// Opaque reference resolved by the matching execution handler.
    pub entity_id: String,
    pub scheduled_for: DateTime<Utc>,
    pub status: TaskStatus,
    pub priority: Priority,
    /// Attempts made so far; never exceeds `max_retries`.
    pub retry_count: u32,
    pub max_retries: u32,
    /// When a failed task becomes eligible for its next attempt.
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Present only on recurring templates.
    pub recurrence: Option<RecurrencePattern>,
    /// Present only on instances spawned from a recurring template.
    pub parent_schedule_id: Option<TaskId>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub notes: Option<String>,
    /// Why the task was cancelled, once it is.
    pub cancel_reason: Option<String>,
    /// When the final (successful or exhausting) execution happened.
    pub executed_at: Option<DateTime<Utc>>,
    /// Execution history, one record per attempt.
    #[serde(default)]
    pub attempts: Vec<ExecutionRecord>,
    pub created_by: Option<String>,
    pub updated_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScheduledTask {
    /// Create a new pending task with default priority and empty history.
    pub fn new(
        customer_id: impl Into<String>,
        platform: Platform,
        entity_kind: EntityKind,
        entity_id: impl Into<String>,
        scheduled_for: DateTime<Utc>,
        max_retries: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: TaskId::new(),
            customer_id: customer_id.into(),
            platform,
            entity_kind,
            entity_id: entity_id.into(),
            scheduled_for,
            status: TaskStatus::Pending,
            priority: Priority::Normal,
            retry_count: 0,
            max_retries,
            next_retry_at: None,
            recurrence: None,
            parent_schedule_id: None,
            tags: Vec::new(),
            notes: None,
            cancel_reason: None,
            executed_at: None,
            attempts: Vec::new(),
            created_by: None,
            updated_by: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether this task is a recurring template.
    pub fn is_template(&self) -> bool {
        self.recurrence.is_some()
    }

    /// Whether this task was spawned from a recurring template.
    pub fn is_instance(&self) -> bool {
        self.parent_schedule_id.is_some()
    }

    /// Whether this task is eligible for dispatch at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Pending
            && self.scheduled_for <= now
            && self.next_retry_at.is_none_or(|at| at <= now)
    }

    /// Whether this failed task is eligible to re-enter the pending queue.
    pub fn is_retry_due(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Failed && self.next_retry_at.is_some_and(|at| at <= now)
    }
}
