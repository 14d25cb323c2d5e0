use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum TrackdeskError {
    // API errors
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("rate limited, retry after {retry_after_seconds}s")]
    RateLimited { retry_after_seconds: u32 },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("service shutting down")]
    ShuttingDown,

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Rule errors
    #[error("rule not found: {0}")]
    RuleNotFound(Uuid),

    #[error("rule validation failed: {0}")]
    Validation(RuleValidationError),

    // Collaborator errors
    #[error("rule store unavailable: {0}")]
    RuleStoreUnavailable(String),

    #[error("field resolution failed for {field}: {reason}")]
    FieldResolutionFailed { field: String, reason: String },

    #[error("event recorder failed: {0}")]
    RecorderFailed(String),

    // Storage errors
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    // Config errors
    #[error("configuration error: {0}")]
    Config(String),

    // Internal errors
    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RuleValidationError {
    #[error("rule name is required")]
    EmptyName,

    #[error("rule name exceeds {max} characters")]
    NameTooLong { max: usize },

    #[error("priority {priority} out of bounds (min={min}, max={max})")]
    PriorityOutOfBounds { priority: i32, min: i32, max: i32 },

    #[error("too many conditions: {count} (max={max})")]
    TooManyConditions { count: usize, max: usize },

    #[error("condition[{index}]: field is required")]
    EmptyConditionField { index: usize },

    #[error("condition[{index}]: unsupported operator")]
    UnsupportedOperator { index: usize },

    #[error("condition[{index}]: {operator} requires {expected}")]
    InvalidConditionValue {
        index: usize,
        operator: String,
        expected: String,
    },

    #[error("condition[{index}]: invalid regex: {message}")]
    InvalidRegex { index: usize, message: String },

    #[error("rule must carry exactly one action, got {count}")]
    ActionCount { count: usize },

    #[error("unknown action type")]
    UnknownAction,

    #[error("redirect action requires a redirectUrl parameter")]
    MissingRedirectUrl,
}

pub type Result<T> = std::result::Result<T, TrackdeskError>;

impl TrackdeskError {
    pub fn status_code(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Self::InvalidRequest(_) | Self::Json(_) => StatusCode::BAD_REQUEST,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::NotFound(_) | Self::RuleNotFound(_) => StatusCode::NOT_FOUND,
            Self::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::ShuttingDown | Self::RuleStoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::FieldResolutionFailed { .. } => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether the error came from a collaborator the engine depends on,
    /// as opposed to a caller or configuration mistake.
    pub fn is_collaborator_failure(&self) -> bool {
        matches!(
            self,
            Self::RuleStoreUnavailable(_) | Self::FieldResolutionFailed { .. }
        )
    }
}

impl From<RuleValidationError> for TrackdeskError {
    fn from(err: RuleValidationError) -> Self {
        Self::Validation(err)
    }
}
