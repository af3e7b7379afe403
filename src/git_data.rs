use std::path::Path;
use std::sync::OnceLock;

use log::warn;
use regex::Regex;
use serde::Serialize;

use crate::error::{GclError, Result};
use crate::fetch::CommandRunner;
use crate::parser::context::Variables;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GitUser {
    pub login: String,
    pub email: String,
    pub name: String,
    pub id: String,
}

impl Default for GitUser {
    fn default() -> Self {
        Self {
            login: "local".to_string(),
            email: "local@gitlab.com".to_string(),
            name: "Bob Local".to_string(),
            id: "1000".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GitRemote {
    pub port: String,
    pub host: String,
    pub group: String,
    pub project: String,
    pub default_branch: String,
}

impl Default for GitRemote {
    fn default() -> Self {
        Self {
            port: "22".to_string(),
            host: "gitlab.com".to_string(),
            group: "fallback.group".to_string(),
            project: "fallback.project".to_string(),
            default_branch: "main".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GitCommit {
    pub ref_name: String,
    pub sha: String,
    pub short_sha: String,
}

impl Default for GitCommit {
    fn default() -> Self {
        Self {
            ref_name: "main".to_string(),
            sha: "0".repeat(40),
            short_sha: "0".repeat(8),
        }
    }
}

/// Repository metadata used for predefined variables and project includes.
///
/// Every lookup degrades to a fixed fallback with a warning, so parsing works
/// outside a git checkout.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GitData {
    pub user: GitUser,
    pub remote: GitRemote,
    pub commit: GitCommit,
}

fn remote_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?://|@)(?P<host>[^:/]*)(:(?P<port>\d+)/|:|/)(?P<group>.*)/(?P<project>.*?)(?:\r?\n|\.git|\s)")
            .expect("valid regex")
    })
}

fn default_branch_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"ref: refs/.*?/(?P<default>\w+)\s+HEAD").expect("valid regex"))
}

impl GitData {
    /// Collects commit, remote and user data concurrently.
    pub async fn init(cwd: &Path, runner: &dyn CommandRunner) -> Self {
        let (commit, remote, user) = tokio::join!(
            Self::commit_data(cwd, runner),
            Self::remote_data(cwd, runner),
            Self::user_data(cwd, runner),
        );

        Self {
            user,
            remote,
            commit,
        }
    }

    async fn commit_data(cwd: &Path, runner: &dyn CommandRunner) -> GitCommit {
        let (ref_name, sha, short_sha) = tokio::join!(
            runner.run_checked("git", &["rev-parse", "--abbrev-ref", "HEAD"], cwd),
            runner.run_checked("git", &["rev-parse", "HEAD"], cwd),
            runner.run_checked("git", &["rev-parse", "--short", "HEAD"], cwd),
        );

        match (ref_name, sha, short_sha) {
            (Ok(ref_name), Ok(sha), Ok(short_sha)) => GitCommit {
                ref_name: ref_name.trim_end().to_string(),
                sha: sha.trim_end().to_string(),
                short_sha: short_sha.trim_end().to_string(),
            },
            _ => {
                warn!("Using fallback git commit data");
                GitCommit::default()
            }
        }
    }

    async fn remote_data(cwd: &Path, runner: &dyn CommandRunner) -> GitRemote {
        match Self::try_remote_data(cwd, runner).await {
            Ok(remote) => remote,
            Err(e) => {
                warn!("Using fallback git remote data: {e}");
                GitRemote::default()
            }
        }
    }

    async fn try_remote_data(cwd: &Path, runner: &dyn CommandRunner) -> Result<GitRemote> {
        let remotes = runner.run_checked("git", &["remote", "-v"], cwd).await?;
        let caps = remote_pattern().captures(&remotes).ok_or_else(|| {
            GclError::Config("git remote -v didn't provide valid matches".to_string())
        })?;

        let symref = runner
            .run_checked("git", &["ls-remote", "--symref", "origin", "HEAD"], cwd)
            .await?;
        let default_branch = default_branch_pattern()
            .captures(&symref)
            .and_then(|caps| caps.name("default"))
            .ok_or_else(|| {
                GclError::Config("git ls-remote HEAD didn't provide valid matches".to_string())
            })?;

        Ok(GitRemote {
            port: caps
                .name("port")
                .map_or_else(|| "22".to_string(), |m| m.as_str().to_string()),
            host: caps["host"].to_string(),
            group: caps["group"].to_string(),
            project: caps["project"].to_string(),
            default_branch: default_branch.as_str().to_string(),
        })
    }

    async fn user_data(cwd: &Path, runner: &dyn CommandRunner) -> GitUser {
        let mut user = GitUser::default();
        let (name, email, uid) = tokio::join!(
            runner.run_checked("git", &["config", "user.name"], cwd),
            runner.run_checked("git", &["config", "user.email"], cwd),
            runner.run_checked("id", &["-u"], cwd),
        );

        match name {
            Ok(name) => user.name = name.trim_end().to_string(),
            Err(_) => warn!("Using fallback git user.name"),
        }
        match email {
            Ok(email) => {
                let email = email.trim_end();
                user.login = email.split('@').next().unwrap_or(email).to_string();
                user.email = email.to_string();
            }
            Err(_) => warn!("Using fallback git user.email"),
        }
        match uid {
            Ok(uid) => user.id = uid.trim_end().to_string(),
            Err(_) => warn!("Using fallback linux user id"),
        }

        user
    }

    pub fn project_path(&self) -> String {
        format!("{}/{}", self.remote.group, self.remote.project)
    }

    pub fn project_path_slug(&self) -> String {
        format!("{}-{}", self.remote.group.replace('/', "-"), self.remote.project)
    }

    pub fn registry(&self) -> String {
        format!("local-registry.{}", self.remote.host)
    }

    /// Predefined CI variables derived from repository metadata.
    pub fn variables(&self) -> Variables {
        [
            ("CI_COMMIT_REF_NAME", self.commit.ref_name.clone()),
            ("CI_COMMIT_BRANCH", self.commit.ref_name.clone()),
            ("CI_COMMIT_REF_SLUG", self.commit.ref_name.replace(['/', '_', '.'], "-").to_lowercase()),
            ("CI_COMMIT_SHA", self.commit.sha.clone()),
            ("CI_COMMIT_SHORT_SHA", self.commit.short_sha.clone()),
            ("CI_DEFAULT_BRANCH", self.remote.default_branch.clone()),
            ("CI_PROJECT_NAME", self.remote.project.clone()),
            ("CI_PROJECT_NAMESPACE", self.remote.group.clone()),
            ("CI_PROJECT_PATH", self.project_path()),
            ("CI_PROJECT_PATH_SLUG", self.project_path_slug()),
            ("CI_REGISTRY", self.registry()),
            ("CI_REGISTRY_IMAGE", format!("{}/{}", self.registry(), self.project_path())),
            ("CI_SERVER_HOST", self.remote.host.clone()),
            ("GITLAB_USER_LOGIN", self.user.login.clone()),
            ("GITLAB_USER_EMAIL", self.user.email.clone()),
            ("GITLAB_USER_NAME", self.user.name.clone()),
            ("GITLAB_USER_ID", self.user.id.clone()),
        ]
        .into_iter()
        .map(|(key, value)| (key.to_string(), value))
        .collect()
    }
}
