use anyhow::{Context, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::rules::GitlabVersion;

/// Configuration file structure for gitlab-ci-local.
///
/// Holds defaults for the pipeline parse and the output, so that repeated
/// runs in one checkout don't need the same flags. Files are looked up in the
/// working directory unless a path is given.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    /// Pipeline parsing options
    #[serde(default)]
    pub parser: ParserConfig,

    /// Variables applied to every job, above everything the pipeline declares
    #[serde(default)]
    pub variables: IndexMap<String, String>,

    /// Output format preferences
    #[serde(default)]
    pub output: OutputConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ParserConfig {
    /// Pipeline file, relative to the working directory
    #[serde(default = "default_file")]
    pub file: String,

    /// Re-download remote, template and project includes even when cached
    #[serde(default)]
    pub fetch_includes: bool,

    /// GitLab release whose rule semantics are reproduced
    #[serde(default)]
    pub gitlab_version: GitlabVersion,

    /// Directory holding `.gitlab-ci-local/projects.yml`; the user's home if unset
    pub home: Option<PathBuf>,

    /// Value of `CI_PIPELINE_IID`
    #[serde(default)]
    pub pipeline_iid: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct OutputConfig {
    /// Default output format
    #[serde(default)]
    pub format: OutputFormat,

    /// Pretty-print JSON output
    #[serde(default)]
    pub pretty: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Job table
    #[default]
    List,
    /// Expanded pipeline as YAML
    Preview,
    /// Jobs as JSON
    Json,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            file: default_file(),
            fetch_includes: false,
            gitlab_version: GitlabVersion::default(),
            home: None,
            pipeline_iid: 0,
        }
    }
}

fn default_file() -> String {
    ".gitlab-ci.yml".to_string()
}

impl Config {
    /// Load configuration from a file.
    ///
    /// Searches for configuration files in this order:
    /// 1. Specified path
    /// 2. `<dir>/gcl.toml`
    /// 3. `<dir>/gcl.json`
    /// 4. `<dir>/gcl.yaml`
    /// 5. `<dir>/gcl.yml`
    ///
    /// Returns default configuration if no file is found.
    pub fn load(path: Option<&Path>, dir: &Path) -> Result<Self> {
        if let Some(path) = path {
            return Self::load_from_path(path);
        }

        let candidates = ["gcl.toml", "gcl.json", "gcl.yaml", "gcl.yml"];

        for candidate in &candidates {
            let path = dir.join(candidate);
            if path.exists() {
                return Self::load_from_path(&path);
            }
        }

        Ok(Self::default())
    }

    /// Load configuration from a specific file path.
    fn load_from_path(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let extension = path.extension().and_then(|ext| ext.to_str()).unwrap_or("");

        match extension {
            "toml" => toml::from_str(&contents)
                .with_context(|| format!("Failed to parse TOML config: {}", path.display())),
            "json" => serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse JSON config: {}", path.display())),
            "yaml" | "yml" => serde_yaml::from_str(&contents)
                .with_context(|| format!("Failed to parse YAML config: {}", path.display())),
            _ => toml::from_str(&contents)
                .or_else(|_| serde_json::from_str(&contents))
                .or_else(|_| serde_yaml::from_str(&contents))
                .with_context(|| format!("Failed to parse config file: {}", path.display())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.parser.file, ".gitlab-ci.yml");
        assert!(!config.parser.fetch_includes);
        assert_eq!(config.parser.gitlab_version, GitlabVersion::new(13, 12));
        assert_eq!(config.output.format, OutputFormat::List);
        assert!(config.variables.is_empty());
    }

    #[test]
    fn test_load_toml_config() {
        let mut temp_file = NamedTempFile::with_suffix(".toml").unwrap();
        let toml_content = r#"
[parser]
file = "ci/pipeline.yml"
fetch-includes = true
gitlab-version = "14.2"
pipeline-iid = 42

[variables]
DEPLOY_ENV = "staging"

[output]
format = "json"
pretty = true
"#;
        write!(temp_file, "{toml_content}").unwrap();

        let config = Config::load_from_path(temp_file.path()).unwrap();
        assert_eq!(config.parser.file, "ci/pipeline.yml");
        assert!(config.parser.fetch_includes);
        assert_eq!(config.parser.gitlab_version, GitlabVersion::new(14, 2));
        assert_eq!(config.parser.pipeline_iid, 42);
        assert_eq!(config.variables["DEPLOY_ENV"], "staging");
        assert_eq!(config.output.format, OutputFormat::Json);
        assert!(config.output.pretty);
    }

    #[test]
    fn test_load_json_config() {
        let mut temp_file = NamedTempFile::with_suffix(".json").unwrap();
        let json_content = r#"{
  "parser": {
    "home": "/srv/ci-home"
  },
  "output": {
    "format": "preview"
  }
}"#;
        write!(temp_file, "{json_content}").unwrap();

        let config = Config::load_from_path(temp_file.path()).unwrap();
        assert_eq!(config.parser.home, Some(PathBuf::from("/srv/ci-home")));
        assert_eq!(config.parser.file, ".gitlab-ci.yml");
        assert_eq!(config.output.format, OutputFormat::Preview);
    }

    #[test]
    fn test_invalid_version_is_rejected() {
        let mut temp_file = NamedTempFile::with_suffix(".yml").unwrap();
        write!(temp_file, "parser:\n  gitlab-version: latest\n").unwrap();

        assert!(Config::load_from_path(temp_file.path()).is_err());
    }

    #[test]
    fn test_load_from_directory_candidates() {
        let temp_dir = tempfile::tempdir().unwrap();
        std::fs::write(
            temp_dir.path().join("gcl.yml"),
            "variables:\n  FROM_FILE: \"yes\"\n",
        )
        .unwrap();

        let config = Config::load(None, temp_dir.path()).unwrap();
        assert_eq!(config.variables["FROM_FILE"], "yes");

        let empty_dir = tempfile::tempdir().unwrap();
        assert_eq!(Config::load(None, empty_dir.path()).unwrap(), Config::default());
    }
}
