//! Error types for E2E scenarios

use thiserror::Error;

#[derive(Error, Debug)]
pub enum E2eError {
    #[error("Navigation to {url} failed: {reason}")]
    Navigation { url: String, reason: String },

    #[error("Mock handler for {method} {url} failed: {reason}")]
    InterceptionHandler {
        method: String,
        url: String,
        reason: String,
    },

    #[error("Selector '{selector}' matched {count} elements; choose first, last or an index")]
    AmbiguousSelector { selector: String, count: usize },

    #[error("Timed out after {timeout_ms} ms waiting for {condition} (last observed: {last_observed})")]
    AssertionTimeout {
        condition: String,
        timeout_ms: u64,
        last_observed: String,
    },

    #[error("Element '{selector}' is not actionable: {reason}")]
    Interaction { selector: String, reason: String },

    #[error("Internal executor error: {0}")]
    ExecutorInternal(String),

    #[error("Session store error: {0}")]
    Session(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Scenario parse error: {0}")]
    SpecParse(String),

    #[error("Invalid route pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Playwright not found. Install with: npm i -D playwright && npx playwright install")]
    PlaywrightNotFound,

    #[error("Browser bridge error: {0}")]
    Bridge(String),

    #[error("Application at {url} not reachable after {attempts} attempts")]
    AppUnreachable { url: String, attempts: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("URL error: {0}")]
    Url(#[from] url::ParseError),
}

impl E2eError {
    /// Errors that abort the run instead of becoming a failed verdict.
    pub fn is_fatal(&self) -> bool {
        matches!(self, E2eError::ExecutorInternal(_))
    }

    /// Short taxonomy label used in reports and CLI diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            E2eError::Navigation { .. } => "NavigationError",
            E2eError::InterceptionHandler { .. } => "InterceptionHandlerError",
            E2eError::AmbiguousSelector { .. } => "AmbiguousSelectorError",
            E2eError::AssertionTimeout { .. } => "AssertionTimeoutError",
            E2eError::Interaction { .. } => "InteractionError",
            E2eError::ExecutorInternal(_) => "ExecutorInternalError",
            E2eError::Session(_) => "SessionError",
            E2eError::Config(_) => "ConfigError",
            E2eError::SpecParse(_) => "SpecParseError",
            E2eError::InvalidPattern { .. } => "InvalidPatternError",
            E2eError::PlaywrightNotFound | E2eError::Bridge(_) => "BrowserError",
            E2eError::AppUnreachable { .. } => "AppUnreachableError",
            E2eError::Io(_)
            | E2eError::Json(_)
            | E2eError::Yaml(_)
            | E2eError::Http(_)
            | E2eError::Image(_)
            | E2eError::Url(_) => "IoError",
        }
    }
}

pub type E2eResult<T> = Result<T, E2eError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_internal_errors_are_fatal() {
        assert!(E2eError::ExecutorInternal("boom".into()).is_fatal());
        assert!(!E2eError::AssertionTimeout {
            condition: "visible(#x)".into(),
            timeout_ms: 10,
            last_observed: "0 matches".into(),
        }
        .is_fatal());
        assert!(!E2eError::Bridge("closed".into()).is_fatal());
    }

    #[test]
    fn ambiguous_selector_message_names_the_count() {
        let err = E2eError::AmbiguousSelector {
            selector: "text=Corpus".into(),
            count: 3,
        };
        assert!(err.to_string().contains("3 elements"));
        assert_eq!(err.kind(), "AmbiguousSelectorError");
    }
}
