use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{GclError, ParseError, Result};

/// Flat variable mapping consulted by rule expressions.
pub type Variables = HashMap<String, String>;

/// Offending value attached to a frame for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameValue {
    Text(String),
    Pointer(Vec<String>),
}

impl From<&str> for FrameValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<Vec<String>> for FrameValue {
    fn from(value: Vec<String>) -> Self {
        Self::Pointer(value)
    }
}

impl fmt::Display for FrameValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(text) => write!(f, "'{text}'"),
            Self::Pointer(segments) => write!(f, "{}", segments.join(" ⋯ ")),
        }
    }
}

#[derive(Debug)]
struct Frame {
    parent: Option<Arc<Frame>>,
    kind: Option<&'static str>,
    name: Option<String>,
    value: Option<FrameValue>,
    scope: Option<Variables>,
}

/// Where in the pipeline document processing currently is.
///
/// Contexts form a persistent parent-linked chain: descending creates a new
/// child frame and leaves the parent untouched, so contexts can be cloned
/// freely across concurrent branches. Rendering walks the chain root to leaf.
#[derive(Debug, Clone, Default)]
pub struct ParseContext {
    frame: Option<Arc<Frame>>,
}

impl ParseContext {
    pub fn root() -> Self {
        Self::default()
    }

    fn child(
        &self,
        kind: Option<&'static str>,
        name: Option<String>,
        value: Option<FrameValue>,
        scope: Option<Variables>,
    ) -> Self {
        Self {
            frame: Some(Arc::new(Frame {
                parent: self.frame.clone(),
                kind,
                name,
                value,
                scope,
            })),
        }
    }

    /// Child context scoped to a key, job or include name.
    pub fn descend(&self, name: impl Into<String>) -> Self {
        self.child(None, Some(name.into()), None, None)
    }

    /// Child context that also displays the value being processed.
    pub fn descend_with_value(
        &self,
        kind: &'static str,
        name: impl Into<String>,
        value: impl Into<FrameValue>,
    ) -> Self {
        self.child(Some(kind), Some(name.into()), Some(value.into()), None)
    }

    /// Child context layering a variable scope over the parents' scopes.
    pub fn bind(&self, variables: Variables) -> Self {
        self.child(None, None, None, Some(variables))
    }

    /// Looks a variable up, nearest bound scope first.
    pub fn resolve(&self, name: &str) -> Option<&str> {
        let mut frame = self.frame.as_deref();
        while let Some(current) = frame {
            if let Some(value) = current.scope.as_ref().and_then(|scope| scope.get(name)) {
                return Some(value.as_str());
            }
            frame = current.parent.as_deref();
        }
        None
    }

    /// Builds a path-tagged failure at this context.
    pub fn fail(&self, message: impl Into<String>) -> GclError {
        GclError::Parse(ParseError::new(self.to_string(), message))
    }

    pub fn require<T>(&self, value: Option<T>, message: impl Into<String>) -> Result<T> {
        value.ok_or_else(|| self.fail(message))
    }

    pub fn assert(&self, test: bool, message: impl Into<String>) -> Result<()> {
        if test {
            Ok(())
        } else {
            Err(self.fail(message))
        }
    }

    /// Tags an error with this context unless it already carries a path.
    pub fn wrap(&self, err: GclError) -> GclError {
        match err {
            GclError::Parse(_) => err,
            other => self.fail(other.to_string()),
        }
    }

    pub fn run<T>(&self, f: impl FnOnce(&ParseContext) -> Result<T>) -> Result<T> {
        f(self).map_err(|err| self.wrap(err))
    }
}

impl fmt::Display for ParseContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut named = Vec::new();
        let mut frame = self.frame.as_deref();
        while let Some(current) = frame {
            if current.name.is_some() {
                named.push(current);
            }
            frame = current.parent.as_deref();
        }

        for (i, current) in named.iter().rev().enumerate() {
            if i > 0 {
                f.write_str(" ⋯ ")?;
            }
            if let Some(kind) = current.kind {
                write!(f, "[{kind}] ")?;
            }
            if let Some(name) = &current.name {
                f.write_str(name)?;
            }
            if let Some(value) = &current.value {
                write!(f, " ⟵ {value}")?;
            }
        }
        Ok(())
    }
}
