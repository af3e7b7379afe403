use std::collections::HashSet;
use std::path::{Path, PathBuf};

use async_recursion::async_recursion;
use indexmap::IndexMap;
use log::{debug, info};
use tokio::sync::Mutex;
use url::Url;

use crate::error::{GclError, Result};
use crate::fetch::{CommandRunner, RemoteClient};
use crate::git_data::GitData;
use crate::local_projects::LocalProjects;

use super::cache::IncludeCache;
use super::context::ParseContext;
use super::loader::load_yaml;
use super::value::Value;

const MAX_INCLUDE_DEPTH: usize = 100;

/// One entry of an `include:` list after shorthand normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IncludeDirective {
    Local(String),
    ProjectFile {
        project: String,
        ref_: Option<String>,
        files: Vec<String>,
    },
    Template(String),
    Remote(String),
}

impl IncludeDirective {
    /// Normalizes an `include` value (absent, one entry or a list) into directives.
    pub fn expand(ctx: &ParseContext, include: Option<&Value>) -> Result<Vec<Self>> {
        let entries = match include {
            None | Some(Value::Null) => return Ok(Vec::new()),
            Some(Value::Sequence(entries)) => entries.iter().collect(),
            Some(entry) => vec![entry],
        };

        let ctx = ctx.descend("include");
        entries
            .into_iter()
            .map(|entry| Self::from_value(&ctx, entry))
            .collect()
    }

    fn from_value(ctx: &ParseContext, entry: &Value) -> Result<Self> {
        let malformed = || ctx.fail(format!("Didn't understand include {entry}"));

        match entry {
            Value::String(target) if is_url(target) => Self::remote(ctx, target),
            Value::String(path) => Ok(Self::Local(path.clone())),
            Value::Mapping(_) => {
                if let Some(local) = entry.get("local") {
                    return local
                        .as_str()
                        .map(|path| Self::Local(path.to_string()))
                        .ok_or_else(malformed);
                }
                if let Some(project) = entry.get("project") {
                    let project = project.as_str().ok_or_else(malformed)?;
                    let files = match entry.get("file") {
                        Some(Value::String(file)) => vec![file.clone()],
                        Some(Value::Sequence(files)) => files
                            .iter()
                            .map(|file| file.as_str().map(str::to_string))
                            .collect::<Option<Vec<_>>>()
                            .ok_or_else(malformed)?,
                        _ => return Err(malformed()),
                    };
                    return Ok(Self::ProjectFile {
                        project: project.to_string(),
                        ref_: entry.get("ref").and_then(Value::scalar_string),
                        files,
                    });
                }
                if let Some(template) = entry.get("template") {
                    return template
                        .as_str()
                        .map(|name| Self::Template(name.to_string()))
                        .ok_or_else(malformed);
                }
                if let Some(remote) = entry.get("remote") {
                    let remote = remote.as_str().ok_or_else(malformed)?;
                    return Self::remote(ctx, remote);
                }
                Err(malformed())
            }
            _ => Err(malformed()),
        }
    }

    fn remote(ctx: &ParseContext, target: &str) -> Result<Self> {
        Url::parse(target)
            .map(|_| Self::Remote(target.to_string()))
            .map_err(|e| ctx.fail(format!("Invalid remote include URL {target}: {e}")))
    }

    /// A `local` include inside a project file is local to that project.
    fn scoped_to(self, project: &str, ref_: &str) -> Self {
        match self {
            Self::Local(path) => Self::ProjectFile {
                project: project.to_string(),
                ref_: Some(ref_.to_string()),
                files: vec![path.trim_start_matches('/').to_string()],
            },
            other => other,
        }
    }

    fn context(&self, ctx: &ParseContext) -> ParseContext {
        match self {
            Self::Local(path) => ctx.descend_with_value("include", "local", path.as_str()),
            Self::ProjectFile { project, .. } => {
                ctx.descend_with_value("include", "project", project.as_str())
            }
            Self::Template(name) => ctx.descend_with_value("include", "template", name.as_str()),
            Self::Remote(url) => ctx.descend_with_value("include", "remote", url.as_str()),
        }
    }
}

fn is_url(target: &str) -> bool {
    target.starts_with("https:") || target.starts_with("http:")
}

/// Raw URL of a template shipped with GitLab.
pub fn template_url(name: &str) -> String {
    format!("https://gitlab.com/gitlab-org/gitlab/-/raw/master/lib/gitlab/ci/templates/{name}")
}

fn shell_quote(text: &str) -> String {
    format!("'{}'", text.replace('\'', r"'\''"))
}

/// Something that must be on disk before a recursion level can be loaded.
enum FetchTarget {
    Local(PathBuf, String),
    Project {
        project: String,
        ref_: String,
        files: Vec<String>,
    },
    Remote(String),
}

/// Resolves `include:` directives into an ordered list of raw documents.
pub struct IncludeResolver<'a> {
    cwd: PathBuf,
    cache: IncludeCache,
    git_data: &'a GitData,
    local_projects: &'a LocalProjects,
    client: &'a RemoteClient,
    runner: &'a dyn CommandRunner,
    /// `(project, ref)` directories filled during this parse
    fetched: Mutex<HashSet<(String, String)>>,
}

impl<'a> IncludeResolver<'a> {
    pub fn new(
        cwd: &Path,
        fetch_includes: bool,
        git_data: &'a GitData,
        local_projects: &'a LocalProjects,
        client: &'a RemoteClient,
        runner: &'a dyn CommandRunner,
    ) -> Self {
        Self {
            cwd: cwd.to_path_buf(),
            cache: IncludeCache::new(cwd, fetch_includes),
            git_data,
            local_projects,
            client,
            runner,
            fetched: Mutex::new(HashSet::new()),
        }
    }

    /// Returns every document `document` includes, transitively and in
    /// declaration order, followed by `document` itself.
    pub async fn resolve(&self, ctx: &ParseContext, document: Value) -> Result<Vec<Value>> {
        let directives = IncludeDirective::expand(ctx, document.get("include"))?;
        self.resolve_level(ctx, document, directives, 0).await
    }

    #[async_recursion]
    async fn resolve_level(
        &self,
        ctx: &ParseContext,
        document: Value,
        directives: Vec<IncludeDirective>,
        depth: usize,
    ) -> Result<Vec<Value>> {
        ctx.assert(
            depth < MAX_INCLUDE_DEPTH,
            "circular dependency detected in `include`",
        )?;
        let depth = depth + 1;

        self.ensure_all(ctx, &directives).await?;

        let mut documents = Vec::new();
        for directive in directives {
            let include_ctx = directive.context(ctx);
            match &directive {
                IncludeDirective::Local(path) => {
                    let doc = load_yaml(&self.local_path(path))
                        .await
                        .map_err(|e| include_ctx.wrap(e))?;
                    let inner = IncludeDirective::expand(&include_ctx, doc.get("include"))?;
                    documents.extend(self.resolve_level(&include_ctx, doc, inner, depth).await?);
                }
                IncludeDirective::ProjectFile {
                    project,
                    ref_,
                    files,
                } => {
                    let ref_ = self.ref_or_default(ref_.as_deref());
                    for file in files {
                        let path = self.cache.project_file(&self.git_data.remote.host, project, &ref_, file);
                        if !tokio::fs::try_exists(&path).await? {
                            return Err(include_ctx.wrap(GclError::ProjectInclude {
                                project: project.clone(),
                                ref_: ref_.clone(),
                                file: file.clone(),
                            }));
                        }
                        let doc = load_yaml(&path).await.map_err(|e| include_ctx.wrap(e))?;
                        let inner = IncludeDirective::expand(&include_ctx, doc.get("include"))?
                            .into_iter()
                            .map(|inner| inner.scoped_to(project, &ref_))
                            .collect();
                        documents.extend(self.resolve_level(&include_ctx, doc, inner, depth).await?);
                    }
                }
                IncludeDirective::Template(name) => {
                    let url = template_url(name);
                    let doc = load_yaml(&self.cache.remote_path(&url))
                        .await
                        .map_err(|e| include_ctx.wrap(e))?;
                    let inner = IncludeDirective::expand(&include_ctx, doc.get("include"))?;
                    documents.extend(self.resolve_level(&include_ctx, doc, inner, depth).await?);
                }
                IncludeDirective::Remote(url) => {
                    let doc = load_yaml(&self.cache.remote_path(url))
                        .await
                        .map_err(|e| include_ctx.wrap(e))?;
                    let inner = IncludeDirective::expand(&include_ctx, doc.get("include"))?;
                    documents.extend(self.resolve_level(&include_ctx, doc, inner, depth).await?);
                }
            }
        }

        documents.push(document);
        Ok(documents)
    }

    fn local_path(&self, path: &str) -> PathBuf {
        self.cwd.join(path.trim_start_matches('/'))
    }

    fn ref_or_default(&self, ref_: Option<&str>) -> String {
        ref_.map_or_else(|| self.git_data.remote.default_branch.clone(), str::to_string)
    }

    /// Makes every directive's source available on disk, concurrently.
    ///
    /// Project fetches are grouped by `(project, ref)`; each pair is fetched once.
    async fn ensure_all(&self, ctx: &ParseContext, directives: &[IncludeDirective]) -> Result<()> {
        let mut projects: IndexMap<(String, String), Vec<String>> = IndexMap::new();
        let mut targets = Vec::new();

        for directive in directives {
            match directive {
                IncludeDirective::Local(path) => {
                    targets.push(FetchTarget::Local(self.local_path(path), path.clone()));
                }
                IncludeDirective::ProjectFile {
                    project,
                    ref_,
                    files,
                } => {
                    let key = (project.clone(), self.ref_or_default(ref_.as_deref()));
                    let requested = projects.entry(key).or_default();
                    for file in files {
                        if !requested.contains(file) {
                            requested.push(file.clone());
                        }
                    }
                }
                IncludeDirective::Template(name) => targets.push(FetchTarget::Remote(template_url(name))),
                IncludeDirective::Remote(url) => {
                    let duplicate = targets
                        .iter()
                        .any(|t| matches!(t, FetchTarget::Remote(existing) if existing == url));
                    if !duplicate {
                        targets.push(FetchTarget::Remote(url.clone()));
                    }
                }
            }
        }

        targets.extend(
            projects
                .into_iter()
                .map(|((project, ref_), files)| FetchTarget::Project {
                    project,
                    ref_,
                    files,
                }),
        );

        futures::future::try_join_all(targets.iter().map(|target| self.ensure(ctx, target))).await?;
        Ok(())
    }

    async fn ensure(&self, ctx: &ParseContext, target: &FetchTarget) -> Result<()> {
        match target {
            FetchTarget::Local(path, declared) => {
                if tokio::fs::try_exists(path).await? {
                    Ok(())
                } else {
                    Err(ctx.fail(format!("Local include file cannot be found {declared}")))
                }
            }
            FetchTarget::Remote(url) => self
                .ensure_remote(url)
                .await
                .map_err(|e| ctx.descend_with_value("include", "remote", url.as_str()).wrap(e)),
            FetchTarget::Project {
                project,
                ref_,
                files,
            } => self
                .ensure_project(project, ref_, files)
                .await
                .map_err(|e| ctx.descend_with_value("include", "project", project.as_str()).wrap(e)),
        }
    }

    async fn ensure_remote(&self, url: &str) -> Result<()> {
        let target = self.cache.remote_path(url);
        if self.cache.is_fresh(&[target.clone()]).await? {
            return Ok(());
        }

        info!("Downloading remote include {url}");
        let parsed = Url::parse(url).map_err(|e| GclError::RemoteInclude {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        let content = self
            .client
            .fetch(&parsed)
            .await
            .map_err(|e| match e {
                err @ GclError::RemoteInclude { .. } => err,
                other => GclError::RemoteInclude {
                    url: url.to_string(),
                    reason: other.to_string(),
                },
            })?;
        self.cache.store(&target, &content).await
    }

    async fn ensure_project(&self, project: &str, ref_: &str, files: &[String]) -> Result<()> {
        let host = &self.git_data.remote.host;
        let ref_dir = self.cache.ref_dir(host, project, ref_);
        let key = (project.to_string(), ref_.to_string());

        if self.fetched.lock().await.contains(&key) {
            // Keep what this parse already extracted; archive only the missing files.
            let mut missing = Vec::new();
            for file in files {
                if !tokio::fs::try_exists(self.cache.project_file(host, project, ref_, file)).await? {
                    missing.push(file.clone());
                }
            }
            let linked = tokio::fs::symlink_metadata(&ref_dir)
                .await
                .is_ok_and(|meta| meta.file_type().is_symlink());
            if missing.is_empty() || linked {
                return Ok(());
            }
            return self.archive(project, ref_, &missing, &ref_dir).await;
        }

        let paths: Vec<PathBuf> = files
            .iter()
            .map(|file| self.cache.project_file(host, project, ref_, file))
            .collect();
        if self.cache.is_fresh(&paths).await? {
            self.fetched.lock().await.insert(key);
            return Ok(());
        }

        self.cache.unlink_stale(&ref_dir).await?;

        if let Some(local_path) = self.local_projects.get(project) {
            debug!("Using local checkout {} for {project}", local_path.display());
            self.cache.link(local_path, &ref_dir).await?;
        } else {
            self.cache.empty_dir(&ref_dir).await?;
            self.archive(project, ref_, files, &ref_dir).await?;
        }
        self.fetched.lock().await.insert(key);
        Ok(())
    }

    /// Extracts `files` of `project@ref_` into `ref_dir` over ssh.
    async fn archive(&self, project: &str, ref_: &str, files: &[String], ref_dir: &Path) -> Result<()> {
        info!("Fetching {} file(s) from {project}@{ref_}", files.len());
        let normalized: Vec<String> = files
            .iter()
            .map(|file| shell_quote(file.trim_start_matches('/')))
            .collect();
        let script = format!(
            "git archive --remote={} {} {} | tar -f - -xC {}",
            shell_quote(&format!(
                "ssh://git@{}:{}/{project}.git",
                self.git_data.remote.host, self.git_data.remote.port
            )),
            shell_quote(ref_),
            normalized.join(" "),
            shell_quote(&ref_dir.to_string_lossy()),
        );

        let output = self.runner.run("sh", &["-c", &script], &self.cwd).await?;
        if output.exit_code != 0 {
            return Err(GclError::ProjectInclude {
                project: project.to_string(),
                ref_: ref_.to_string(),
                file: files.join(", "),
            });
        }
        Ok(())
    }
}
