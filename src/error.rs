use std::fmt;

use log::error;
use thiserror::Error;

use crate::output::styling::Tone;

#[derive(Error, Debug)]
pub enum GclError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Remote include could not be fetched {url}: {reason}")]
    RemoteInclude { url: String, reason: String },

    #[error("Project include could not be fetched {{ project: {project}, ref: {ref_}, file: {file} }}")]
    ProjectInclude {
        project: String,
        ref_: String,
        file: String,
    },

    #[error("`{command}` exited with code {code}")]
    Command { command: String, code: i32 },

    #[error("Invalid regular expression: {0}")]
    Regex(#[from] regex::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, GclError>;

/// A fatal parse failure tagged with the document path it happened at.
///
/// Constructing one writes it to the diagnostic log right away, so cascading
/// failures still show which part of the pipeline was being processed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    message: String,
    path: String,
}

impl ParseError {
    pub(crate) fn new(path: String, message: impl Into<String>) -> Self {
        let message = message.into();
        if path.is_empty() {
            error!("{}", Tone::Failure.paint(&message));
        } else {
            error!(
                "{}\n  {}",
                Tone::Failure.paint(&message),
                Tone::Trail.paint(format!("… in {path}"))
            );
        }
        Self { message, path }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.path.is_empty() {
            write!(f, "{}", self.message)
        } else {
            write!(f, "{}\n  … in {}", self.message, self.path)
        }
    }
}

impl std::error::Error for ParseError {}

impl GclError {
    /// Returns the parse failure if this error already carries a document path.
    pub fn as_parse(&self) -> Option<&ParseError> {
        match self {
            Self::Parse(err) => Some(err),
            _ => None,
        }
    }
}
