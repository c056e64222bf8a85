use thiserror::Error;

/// Main error type for the ParamFit system
#[derive(Error, Debug)]
pub enum PfError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Evaluation error: {0}")]
    Evaluation(#[from] EvaluationError),

    #[error("Algorithm error: {0}")]
    Algorithm(#[from] AlgorithmError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Configuration errors. All of these are fatal at construction time,
/// before any job is submitted.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Unrecognized variable type: {kind}")]
    UnknownVariableKind { kind: String },

    #[error("Variable {name}: expected {expected} parameters, got {got}")]
    WrongArity {
        name: String,
        expected: usize,
        got: usize,
    },

    #[error("Variable {name}: invalid bounds [{low}, {high}]")]
    InvalidBounds { name: String, low: f64, high: f64 },

    #[error("Variable {name}: {message}")]
    InvalidVariable { name: String, message: String },

    #[error("Duplicate variable declaration: {name}")]
    DuplicateVariable { name: String },

    #[error("No free variables declared")]
    NoVariables,

    #[error("Invalid setting {key}: {message}")]
    InvalidSetting { key: String, message: String },
}

/// Errors around a single evaluation job.
#[derive(Error, Debug)]
pub enum EvaluationError {
    #[error("Result for job {job_id} was already scored")]
    AlreadyScored { job_id: u64 },

    #[error("Result reached the algorithm without a score")]
    Unscored,

    #[error("Objective returned {score} for job {job_id}")]
    NonFiniteScore { job_id: u64, score: f64 },

    #[error("Parameter set is missing variable {name}")]
    MissingVariable { name: String },

    #[error("No simulated output {model}.{suffix} to compare against")]
    MissingOutput { model: String, suffix: String },

    #[error("Simulated output {table} has no column {column}")]
    MissingColumn { table: String, column: String },

    #[error("Simulated output {table} has no point at {x}")]
    MissingPoint { table: String, x: f64 },
}

/// Internal-consistency errors raised by optimization strategies.
#[derive(Error, Debug)]
pub enum AlgorithmError {
    #[error("Result does not match any pending parameter set: {params}")]
    UnknownParameterSet { params: String },

    #[error("Could not find a unique parameter set after {attempts} perturbations")]
    CollisionRetriesExhausted { attempts: usize },
}

/// Result type alias for ParamFit operations
pub type PfResult<T> = Result<T, PfError>;

/// Macro for creating invalid-setting configuration errors
#[macro_export]
macro_rules! config_error {
    ($key:expr, $($arg:tt)*) => {
        $crate::PfError::Config($crate::ConfigError::InvalidSetting {
            key: $key.to_string(),
            message: format!($($arg)*),
        })
    };
}

/// Macro for creating internal errors
#[macro_export]
macro_rules! internal_error {
    ($($arg:tt)*) => {
        $crate::PfError::Internal(format!($($arg)*))
    };
}
