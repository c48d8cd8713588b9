pub mod catalog;
pub mod executor;
pub mod parser;
pub mod plan;
pub mod scanner;

pub use catalog::{ActionBlueprint, ActionKind, BodyKind, ParamSpec, catalog, format_action_docs};
pub use executor::{ActionExecutor, ActionResult, PlanOutcome, PlanRunner, format_result};
pub use parser::{Action, ActionParser, EditOp, FileEdit, ParsedAction, infer_dependencies};
pub use plan::{ActionGroup, ExecutionPlan};
pub use scanner::{NestingError, ScannedTag, TagScanner};

/// Failure of a single action. Never thrown across a plan; carried in its result.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ActionError {
    /// Malformed or unrecognized tag.
    #[error("{0}")]
    Format(String),
    /// A required field is missing or has an unusable value.
    #[error("{0}")]
    Validation(String),
    /// The underlying file/command/search/fetch operation failed.
    #[error("{0}")]
    Operation(String),
}

impl ActionError {
    pub fn unknown_type(tag: &str) -> Self {
        ActionError::Format(format!("Unknown action type: {tag}"))
    }

    pub fn missing_field(tag: &str, field: &str) -> Self {
        ActionError::Validation(format!("Missing required field <{field}> in <{tag}>"))
    }
}
