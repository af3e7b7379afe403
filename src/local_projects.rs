use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use log::{debug, warn};

use crate::error::{GclError, Result};

/// Local checkouts that stand in for remote projects in `include: project:`.
///
/// Read from `<home>/.gitlab-ci-local/projects.yml`, a flat mapping of
/// project path to local directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalProjects {
    projects: IndexMap<String, PathBuf>,
}

impl LocalProjects {
    pub async fn init(home: &Path) -> Result<Self> {
        let projects_file = home.join(".gitlab-ci-local").join("projects.yml");
        if !tokio::fs::try_exists(&projects_file).await? {
            warn!(
                "No local project aliases at {}, fetching project includes remotely",
                projects_file.display()
            );
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(&projects_file).await?;
        let projects = Self::parse(&content, home)?;
        debug!("Loaded {} local project aliases", projects.projects.len());
        Ok(projects)
    }

    fn parse(content: &str, home: &Path) -> Result<Self> {
        let raw: serde_yaml::Value = serde_yaml::from_str(content)?;
        let entries = match raw {
            serde_yaml::Value::Null => return Ok(Self::default()),
            serde_yaml::Value::Mapping(map) => map,
            _ => {
                return Err(GclError::Config(
                    "projects.yml must map project names to local paths".to_string(),
                ))
            }
        };

        let home = home.to_string_lossy();
        let home = home.trim_end_matches('/');
        let mut projects = IndexMap::new();
        for (name, path) in entries {
            let serde_yaml::Value::String(name) = name else {
                return Err(GclError::Config("project name must be a string".to_string()));
            };
            let serde_yaml::Value::String(path) = path else {
                return Err(GclError::Config(format!(
                    "project local path must be a string for {name}"
                )));
            };
            let path = match path.strip_prefix("~/") {
                Some(rest) => format!("{home}/{rest}"),
                None => path,
            };
            projects.insert(normalize_project_key(&name), PathBuf::from(path));
        }

        Ok(Self { projects })
    }

    pub fn get(&self, project: &str) -> Option<&Path> {
        self.projects.get(project).map(PathBuf::as_path)
    }

    pub fn insert(&mut self, project: impl Into<String>, path: impl Into<PathBuf>) {
        self.projects.insert(project.into(), path.into());
    }
}

/// Accepts `group:project` as an alias spelling of `group/project`.
fn normalize_project_key(key: &str) -> String {
    if !key.contains(':') {
        return key.to_string();
    }
    let normalized = key.replacen(':', "/", 1);
    warn!("Interpreting '{key}' as '{normalized}'");
    normalized
}
