use thiserror::Error;

/// Reasons a workflow specification (or a run's parameter bindings) is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("task name must be specified")]
    EmptyTaskName,

    #[error("task '{0}': task image must be specified")]
    MissingImage(String),

    #[error("task '{0}': must provide a script or a command")]
    MissingCommand(String),

    #[error("duplicate task name: {0}")]
    DuplicateTask(String),

    #[error("parameter has an empty name")]
    EmptyParameterName,

    #[error("parameter '{0}' cannot have both defaultValue and defaultFromSecret")]
    ParameterHasBothSources(String),

    #[error("parameter '{0}' must have either defaultValue or defaultFromSecret")]
    ParameterHasNoSource(String),

    #[error("parameter '{parameter}' selected in task '{task}' does not exist")]
    UnknownParameter { task: String, parameter: String },

    #[error("task '{task}' references unknown reusable task '{reference}'")]
    UnknownTaskRef { task: String, reference: String },

    #[error("cyclic dependency detected at task '{0}'")]
    CycleDetected(String),

    #[error("task {task} has runAfter dependency on non-existent task {dependency}")]
    UnknownDependency { task: String, dependency: String },

    #[error("not all tasks are connected")]
    Disconnected,

    #[error("no starting task found (a task with no runAfter dependencies)")]
    NoStartingTask,

    #[error("invalid schedule '{schedule}': {reason}")]
    InvalidSchedule { schedule: String, reason: String },

    #[error("run parameter '{0}' is not declared by the definition")]
    UndeclaredRunParameter(String),

    #[error("run parameter '{0}' mixes a secret reference with a literal value")]
    ParameterSourceMismatch(String),

    #[error("malformed specification: {0}")]
    Malformed(String),
}

/// Errors from persistence backends (used by the `DagStore` trait in dagrun-core).
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),
}

/// Errors reported by the unit-of-work substrate.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubstrateError {
    #[error("unit '{0}' already exists")]
    AlreadyExists(String),

    #[error("unit '{0}' not found")]
    NotFound(String),

    #[error("substrate error: {0}")]
    Other(String),
}

/// Engine-level error taxonomy.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed spec or bindings. Never retried.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Unknown definition, instance or task run.
    #[error("not found: {0}")]
    NotFound(String),

    /// Connection or transaction failure; retried on the next tick or event.
    #[error("transient store error: {0}")]
    TransientStore(String),

    /// No free unit name after the configured number of attempts.
    #[error("failed to create unit due to naming collisions after {attempts} attempts")]
    AllocationCollision { attempts: u32 },

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error(transparent)]
    Substrate(#[from] SubstrateError),
}

impl From<RepositoryError> for EngineError {
    fn from(e: RepositoryError) -> Self {
        match e {
            RepositoryError::NotFound(what) => EngineError::NotFound(what),
            RepositoryError::Conflict(msg) => EngineError::AlreadyExists(msg),
            RepositoryError::Connection => {
                EngineError::TransientStore("database connection error".to_string())
            }
            RepositoryError::Query(msg) => EngineError::TransientStore(msg),
        }
    }
}
