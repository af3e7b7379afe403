mod lexer;
mod parser;

use std::fmt;
use std::str::FromStr;

use log::debug;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{GclError, Result};
use crate::parser::context::ParseContext;

use parser::Parser;

/// Why a rule expression could not be evaluated.
#[derive(Error, Debug)]
pub enum ExpressionError {
    #[error("unexpected character '{0}' at offset {1}")]
    UnexpectedChar(char, usize),

    #[error("unterminated string starting at offset {0}")]
    UnterminatedString(usize),

    #[error("unterminated regular expression starting at offset {0}")]
    UnterminatedRegex(usize),

    #[error("unterminated variable starting at offset {0}")]
    UnterminatedVariable(usize),

    #[error("unknown regular expression flag '{0}' at offset {1}")]
    UnknownFlag(char, usize),

    #[error("unexpected word '{0}' at offset {1}")]
    UnknownWord(String, usize),

    #[error("unexpected {0}")]
    UnexpectedToken(String),

    #[error("unexpected end of expression")]
    UnexpectedEnd,

    #[error(transparent)]
    Regex(#[from] regex::Error),
}

/// One entry of a job's `rules:` list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    /// Condition; a rule without one always matches
    #[serde(rename = "if", default, skip_serializing_if = "Option::is_none")]
    pub if_: Option<String>,
    /// Overrides the job's `when` on match
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<String>,
    /// Overrides the job's `allow_failure` on match
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_failure: Option<bool>,
}

/// A single rule or a (possibly nested) collection of rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RuleSet {
    Many(Vec<RuleSet>),
    Single(Rule),
}

/// The rule a rule set settled on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuleOutcome {
    pub result: bool,
    pub rule: Rule,
}

/// GitLab release whose rule semantics are reproduced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GitlabVersion {
    pub major: u32,
    pub minor: u32,
}

impl GitlabVersion {
    /// First release accepting nested collections of rules.
    pub const NESTED_RULES: Self = Self::new(14, 2);

    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }
}

impl Default for GitlabVersion {
    fn default() -> Self {
        Self::new(13, 12)
    }
}

impl fmt::Display for GitlabVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl FromStr for GitlabVersion {
    type Err = GclError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || GclError::Config(format!("invalid GitLab version '{s}', expected <major>.<minor>"));
        let (major, minor) = s.trim().split_once('.').ok_or_else(invalid)?;
        Ok(Self::new(
            major.parse().map_err(|_| invalid())?,
            minor.parse().map_err(|_| invalid())?,
        ))
    }
}

impl Serialize for GitlabVersion {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for GitlabVersion {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Evaluates `rules:` against the variables bound in a [`ParseContext`].
#[derive(Debug, Clone, Copy, Default)]
pub struct Rules {
    version: GitlabVersion,
}

impl Rules {
    pub fn new(version: GitlabVersion) -> Self {
        Self { version }
    }

    pub fn version(&self) -> GitlabVersion {
        self.version
    }

    /// Finds the first matching rule.
    ///
    /// From 14.2 on, collections may nest and no match yields `None`. Before
    /// that, the set must be a flat list and no match falls back to the last
    /// rule with `result: false`; an empty list yields `None`.
    pub fn evaluate(&self, ctx: &ParseContext, rules: &RuleSet) -> Result<Option<RuleOutcome>> {
        if self.version >= GitlabVersion::NESTED_RULES {
            return self.first_match(ctx, rules);
        }

        let RuleSet::Many(list) = rules else {
            return Err(ctx.fail("rules must be an array"));
        };
        for entry in list {
            let RuleSet::Single(rule) = entry else {
                return Err(ctx.fail(format!(
                    "GitLab CI v{} doesn't support nested collections of rules",
                    self.version
                )));
            };
            if let Some(outcome) = self.evaluate_rule(ctx, rule)? {
                return Ok(Some(outcome));
            }
        }

        Ok(list.last().and_then(|last| match last {
            RuleSet::Single(rule) => Some(RuleOutcome {
                result: false,
                rule: rule.clone(),
            }),
            RuleSet::Many(_) => None,
        }))
    }

    fn first_match(&self, ctx: &ParseContext, rules: &RuleSet) -> Result<Option<RuleOutcome>> {
        match rules {
            RuleSet::Single(rule) => self.evaluate_rule(ctx, rule),
            RuleSet::Many(list) => {
                for entry in list {
                    if let Some(outcome) = self.first_match(ctx, entry)? {
                        return Ok(Some(outcome));
                    }
                }
                Ok(None)
            }
        }
    }

    fn evaluate_rule(&self, ctx: &ParseContext, rule: &Rule) -> Result<Option<RuleOutcome>> {
        let result = Self::evaluate_if(ctx, rule.if_.as_deref().unwrap_or("true"))?;
        Ok(result.then(|| RuleOutcome {
            result,
            rule: rule.clone(),
        }))
    }

    /// Evaluates one `if:` expression; unset variables are `null`.
    pub fn evaluate_if(ctx: &ParseContext, expression: &str) -> Result<bool> {
        let ctx = ctx.descend_with_value("if", "rules", expression);
        let expr = lexer::tokenize(expression)
            .and_then(|tokens| Parser::new(tokens).parse())
            .map_err(|e| ctx.fail(format!("Invalid rule expression: {e}")))?;

        let lookup = |name: &str| ctx.resolve(name);
        let value = expr
            .evaluate(&lookup)
            .map_err(|e| ctx.fail(format!("Invalid rule expression: {e}")))?;

        debug!("{expression} evaluated to {value}");
        Ok(value.is_truthy())
    }
}
