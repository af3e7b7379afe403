use std::path::Path;
use std::sync::OnceLock;

use log::debug;
use regex::Regex;

use crate::error::{GclError, Result};

use super::value::Value;

struct AnnotationPatterns {
    interactive: Regex,
    inject_ssh_agent: Regex,
    no_artifacts_to_source: Regex,
    description: Regex,
    job_line: Regex,
}

fn patterns() -> &'static AnnotationPatterns {
    static PATTERNS: OnceLock<AnnotationPatterns> = OnceLock::new();
    PATTERNS.get_or_init(|| AnnotationPatterns {
        interactive: Regex::new(r"#\s?@\s?[Ii]nteractive").expect("valid regex"),
        inject_ssh_agent: Regex::new(r"#\s?@\s?[Ii]njectSSHAgent").expect("valid regex"),
        no_artifacts_to_source: Regex::new(r"(?i)#\s?@\s?NoArtifactsToSource").expect("valid regex"),
        description: Regex::new(r"#\s?@\s?[Dd]escription (?P<description>.*)").expect("valid regex"),
        job_line: Regex::new(r"\w:").expect("valid regex"),
    })
}

/// Comment annotations seen since the last job key.
#[derive(Default)]
struct PendingAnnotations {
    interactive: bool,
    inject_ssh_agent: bool,
    no_artifacts_to_source: bool,
    description: Option<String>,
}

impl PendingAnnotations {
    fn observe(&mut self, line: &str) {
        let patterns = patterns();
        self.interactive |= patterns.interactive.is_match(line);
        self.inject_ssh_agent |= patterns.inject_ssh_agent.is_match(line);
        self.no_artifacts_to_source |= patterns.no_artifacts_to_source.is_match(line);
        if self.description.is_none() {
            self.description = patterns
                .description
                .captures(line)
                .and_then(|caps| caps.name("description"))
                .map(|m| m.as_str().trim_end().to_string());
        }
    }

    fn any(&self) -> bool {
        self.interactive
            || self.inject_ssh_agent
            || self.no_artifacts_to_source
            || self.description.is_some()
    }

    fn drain_into(&mut self, lines: &mut Vec<String>) {
        if self.interactive {
            lines.push("  interactive: true".to_string());
        }
        if self.inject_ssh_agent {
            lines.push("  injectSSHAgent: true".to_string());
        }
        if self.no_artifacts_to_source {
            lines.push("  artifactsToSource: false".to_string());
        }
        if let Some(description) = self.description.take() {
            let quoted = serde_json::Value::String(description).to_string();
            lines.push(format!("  description: {quoted}"));
        }
        *self = Self::default();
    }
}

/// Rewrites `#@Interactive`-style annotations into fields of the job that follows them.
fn apply_annotations(content: &str) -> String {
    let job_line = &patterns().job_line;
    let mut lines = Vec::new();
    let mut pending = PendingAnnotations::default();

    for line in content.lines() {
        pending.observe(line);
        lines.push(line.to_string());
        if pending.any() && job_line.is_match(line) {
            pending.drain_into(&mut lines);
        }
    }

    lines.join("\n")
}

/// Parses one pipeline document.
///
/// An empty document is an empty mapping; a non-mapping root is rejected.
pub fn parse_document(content: &str) -> Result<Value> {
    let blank = content.lines().all(|line| {
        let line = line.trim();
        line.is_empty() || line.starts_with('#') || line == "---"
    });
    if blank {
        return Ok(Value::default());
    }

    let annotated = apply_annotations(content);
    let raw: serde_yaml::Value = serde_yaml::from_str(&annotated)?;
    match Value::from(raw) {
        Value::Null => Ok(Value::default()),
        doc @ Value::Mapping(_) => Ok(doc),
        other => Err(GclError::Config(format!(
            "pipeline document must be a mapping, found {}",
            other.type_name()
        ))),
    }
}

/// Loads a pipeline document from disk; a missing file is an empty mapping.
pub async fn load_yaml(path: &Path) -> Result<Value> {
    if !tokio::fs::try_exists(path).await? {
        debug!("No pipeline document at {}", path.display());
        return Ok(Value::default());
    }

    let content = tokio::fs::read_to_string(path).await?;
    parse_document(&content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_annotations_are_injected_into_next_job() {
        let doc = parse_document(
            "# @Description Builds the thing\n#@Interactive\nbuild:\n  script: [make]\n\ntest:\n  script: [make test]\n",
        )
        .unwrap();

        let build = doc.get("build").unwrap();
        assert_eq!(build.get("interactive"), Some(&Value::Bool(true)));
        assert_eq!(build.get("description"), Some(&Value::from("Builds the thing")));

        let test = doc.get("test").unwrap();
        assert!(test.get("interactive").is_none());
        assert!(test.get("description").is_none());
    }

    #[test]
    fn test_ssh_and_artifact_annotations() {
        let doc = parse_document("#@InjectSSHAgent\n#@noartifactstosource\ndeploy:\n  script: [ssh host]\n").unwrap();

        let deploy = doc.get("deploy").unwrap();
        assert_eq!(deploy.get("injectSSHAgent"), Some(&Value::Bool(true)));
        assert_eq!(deploy.get("artifactsToSource"), Some(&Value::Bool(false)));
    }

    #[test]
    fn test_empty_document_is_empty_mapping() {
        assert_eq!(parse_document("").unwrap(), Value::default());
        assert_eq!(parse_document("# only a comment\n").unwrap(), Value::default());
    }

    #[test]
    fn test_non_mapping_root_is_rejected() {
        assert!(parse_document("- a\n- b\n").is_err());
    }

    #[tokio::test]
    async fn test_missing_file_loads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let doc = load_yaml(&dir.path().join("absent.yml")).await.unwrap();
        assert_eq!(doc, Value::default());
    }
}
