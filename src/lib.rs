//! Local resolution of GitLab CI pipelines.
//!
//! [`Parser`] loads a pipeline file, fetches its includes, merges the
//! documents and expands `extends`, `!reference` and job defaults into
//! typed [`job::Job`]s whose `rules` have been evaluated.

pub mod cli;
pub mod config;
pub mod error;
pub mod fetch;
pub mod git_data;
pub mod job;
pub mod local_projects;
pub mod output;
pub mod parser;
pub mod rules;
pub mod utils;

pub use error::{GclError, Result};
pub use parser::{Parser, ParserOptions};
pub use rules::Rules;
