pub mod cache;
pub mod context;
pub mod expanders;
pub mod includes;
pub mod loader;
pub mod value;

use std::path::PathBuf;
use std::time::Instant;

use indexmap::IndexMap;
use log::{debug, info};

use crate::error::Result;
use crate::fetch::{CommandRunner, RemoteClient};
use crate::git_data::GitData;
use crate::job::{Job, JobEnvironment};
use crate::local_projects::LocalProjects;
use crate::rules::{GitlabVersion, Rules};

use context::ParseContext;
use expanders::is_real_job;
use includes::IncludeResolver;
use loader::load_yaml;
use value::{merge_documents, Mapping, Value};

/// Per-checkout overrides merged after the main pipeline file.
pub const LOCAL_OVERRIDE_FILE: &str = ".gitlab-ci-local.yml";

const DEFAULT_STAGES: [&str; 5] = [".pre", "build", "test", "deploy", ".post"];

/// Inputs of a pipeline parse.
#[derive(Debug, Clone)]
pub struct ParserOptions {
    /// Repository checkout the pipeline lives in
    pub cwd: PathBuf,
    /// Pipeline file, relative to `cwd`
    pub file: String,
    /// Directory holding `.gitlab-ci-local/projects.yml`
    pub home: PathBuf,
    /// Re-download includes even when cached
    pub fetch_includes: bool,
    pub pipeline_iid: u64,
    /// Highest-precedence variables, usually from the command line
    pub variables: IndexMap<String, String>,
    pub gitlab_version: GitlabVersion,
}

impl Default for ParserOptions {
    fn default() -> Self {
        Self {
            cwd: PathBuf::from("."),
            file: ".gitlab-ci.yml".to_string(),
            home: dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")),
            fetch_includes: false,
            pipeline_iid: 0,
            variables: IndexMap::new(),
            gitlab_version: GitlabVersion::default(),
        }
    }
}

/// A resolved pipeline: the expanded document, its stages and its jobs.
#[derive(Debug)]
pub struct Parser {
    gitlab_data: Value,
    stages: Vec<String>,
    jobs: IndexMap<String, Job>,
    job_name_pad: usize,
    git_data: GitData,
}

fn default_stages_document() -> Value {
    let stages = DEFAULT_STAGES.iter().map(|stage| Value::from(*stage)).collect();
    Value::Mapping(Mapping::from([("stages".to_string(), Value::Sequence(stages))]))
}

impl Parser {
    /// Loads, resolves and expands the pipeline of `options.cwd`.
    pub async fn create(options: &ParserOptions, runner: &dyn CommandRunner) -> Result<Self> {
        let client = RemoteClient::new()?;
        Self::create_with_client(options, runner, &client).await
    }

    pub async fn create_with_client(
        options: &ParserOptions,
        runner: &dyn CommandRunner,
        client: &RemoteClient,
    ) -> Result<Self> {
        let started = Instant::now();
        let git_data = GitData::init(&options.cwd, runner).await;
        let local_projects = LocalProjects::init(&options.home).await?;
        let resolver = IncludeResolver::new(
            &options.cwd,
            options.fetch_includes,
            &git_data,
            &local_projects,
            client,
            runner,
        );

        let ctx = ParseContext::root();
        let mut documents = vec![default_stages_document()];
        for file in [options.file.as_str(), LOCAL_OVERRIDE_FILE] {
            let file_ctx = ctx.descend(file);
            let document = load_yaml(&options.cwd.join(file))
                .await
                .map_err(|e| file_ctx.wrap(e))?;
            documents.extend(resolver.resolve(&file_ctx, document).await?);
        }
        debug!("Merging {} pipeline documents", documents.len());

        let parser = Self::from_document(merge_documents(&documents), git_data, options)?;
        info!(
            "Parsing and downloads finished in {:.2?}, {} jobs",
            started.elapsed(),
            parser.jobs.len()
        );
        Ok(parser)
    }

    /// Expands an already merged document into jobs; performs no I/O.
    pub fn from_document(mut gitlab_data: Value, git_data: GitData, options: &ParserOptions) -> Result<Self> {
        let ctx = ParseContext::root();
        expanders::expand_all(&ctx, &mut gitlab_data)?;

        let stages = Self::normalize_stages(&ctx, &mut gitlab_data)?;
        Self::validate_variables(&ctx, &gitlab_data)?;

        let env = JobEnvironment {
            globals: &gitlab_data,
            git_data: &git_data,
            pipeline_iid: options.pipeline_iid,
            overrides: &options.variables,
            rules: Rules::new(options.gitlab_version),
        };

        let mut jobs = IndexMap::new();
        let mut job_name_pad = 0;
        if let Some(map) = gitlab_data.as_mapping() {
            for (name, definition) in map.iter().filter(|(name, _)| is_real_job(name)) {
                let job_ctx = ctx.descend(name.as_str());
                let job = Job::new(&job_ctx, name, definition, &env)?;
                job_ctx.assert(
                    stages.contains(&job.stage),
                    format!("stage:{} not found for {}", job.stage, job.name),
                )?;
                job_name_pad = job_name_pad.max(name.chars().count());
                jobs.insert(name.clone(), job);
            }
        }

        Ok(Self {
            gitlab_data,
            stages,
            jobs,
            job_name_pad,
            git_data,
        })
    }

    /// Checks `stages` is a list of names and brackets it with `.pre` and `.post`.
    fn normalize_stages(ctx: &ParseContext, gitlab_data: &mut Value) -> Result<Vec<String>> {
        let ctx = ctx.descend("stages");
        let declared = ctx.require(
            gitlab_data.get("stages").and_then(Value::as_sequence),
            "stages must be an array",
        )?;
        let mut stages = declared
            .iter()
            .map(|stage| ctx.require(stage.scalar_string(), format!("invalid stage {stage}")))
            .collect::<Result<Vec<_>>>()?;

        if !stages.iter().any(|stage| stage == ".pre") {
            stages.insert(0, ".pre".to_string());
        }
        if !stages.iter().any(|stage| stage == ".post") {
            stages.push(".post".to_string());
        }

        if let Some(map) = gitlab_data.as_mapping_mut() {
            let listed = stages.iter().map(|stage| Value::from(stage.as_str())).collect();
            map.insert("stages".to_string(), Value::Sequence(listed));
        }
        Ok(stages)
    }

    /// Job variables must be a mapping of names to strings or numbers.
    fn validate_variables(ctx: &ParseContext, gitlab_data: &Value) -> Result<()> {
        let Some(map) = gitlab_data.as_mapping() else {
            return Ok(());
        };
        for (name, definition) in map.iter().filter(|(name, _)| is_real_job(name)) {
            let Some(variables) = definition.get("variables") else {
                continue;
            };
            let job_ctx = ctx.descend(name.as_str()).descend("variables");
            let Some(variables) = variables.as_mapping() else {
                return Err(job_ctx.fail(format!(
                    "{name} has invalid variables hash of key value pairs. variables={variables}"
                )));
            };
            for (key, value) in variables {
                job_ctx.assert(
                    matches!(value, Value::String(_) | Value::Number(_)),
                    format!("{name} has invalid variables hash of key value pairs. {key}={value}"),
                )?;
            }
        }
        Ok(())
    }

    /// The fully expanded pipeline document.
    pub fn gitlab_data(&self) -> &Value {
        &self.gitlab_data
    }

    /// Stage names in order, always starting with `.pre` and ending with `.post`.
    pub fn stages(&self) -> &[String] {
        &self.stages
    }

    pub fn jobs(&self) -> &IndexMap<String, Job> {
        &self.jobs
    }

    /// Length of the longest job name, for aligned output.
    pub fn job_name_pad(&self) -> usize {
        self.job_name_pad
    }

    pub fn git_data(&self) -> &GitData {
        &self.git_data
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use async_trait::async_trait;

    use super::*;
    use crate::fetch::CommandOutput;
    use crate::job::When;

    /// Behaves like a machine without a git checkout.
    struct NoGit;

    #[async_trait]
    impl CommandRunner for NoGit {
        async fn run(&self, _program: &str, _args: &[&str], _cwd: &Path) -> Result<CommandOutput> {
            Ok(CommandOutput {
                stdout: String::new(),
                exit_code: 128,
            })
        }
    }

    fn expand(text: &str) -> Result<Parser> {
        let document = merge_documents(&[default_stages_document(), loader::parse_document(text).unwrap()]);
        Parser::from_document(document, GitData::default(), &ParserOptions::default())
    }

    fn message(err: crate::error::GclError) -> String {
        err.as_parse().unwrap().message().to_string()
    }

    #[test]
    fn test_default_stages() {
        let parser = expand("build:\n  stage: build\n  script: [make]\n").unwrap();
        assert_eq!(parser.stages(), [".pre", "build", "test", "deploy", ".post"]);
        assert_eq!(parser.jobs()["build"].stage, "build");
    }

    #[test]
    fn test_stages_gain_pre_and_post() {
        let parser = expand("stages: [lint, ship]\nlint:\n  stage: lint\n  script: [x]\n").unwrap();
        assert_eq!(parser.stages(), [".pre", "lint", "ship", ".post"]);
        assert_eq!(
            parser.gitlab_data().get("stages"),
            loader::parse_document("s: [.pre, lint, ship, .post]").unwrap().get("s")
        );
    }

    #[test]
    fn test_unknown_stage_fails() {
        let err = expand("stages: [build]\njob:\n  script: [x]\n").unwrap_err();
        assert_eq!(message(err), "stage:test not found for job");
    }

    #[test]
    fn test_stages_must_be_an_array() {
        let err = expand("stages: build\njob:\n  script: [x]\n").unwrap_err();
        assert_eq!(message(err), "stages must be an array");
    }

    #[test]
    fn test_invalid_job_variables() {
        let err = expand("job:\n  script: [x]\n  variables:\n    NESTED: {a: b}\n").unwrap_err();
        assert_eq!(
            message(err),
            r#"job has invalid variables hash of key value pairs. NESTED={"a":"b"}"#
        );
    }

    #[test]
    fn test_jobs_keep_document_order_and_rules() {
        let parser = expand(
            "variables:\n  DEPLOY: 'false'\nzeta:\n  script: [z]\nalpha:\n  stage: deploy\n  script: [a]\n  rules:\n    - if: $DEPLOY == 'true'\n",
        )
        .unwrap();

        let names: Vec<&String> = parser.jobs().keys().collect();
        assert_eq!(names, ["zeta", "alpha"]);
        assert_eq!(parser.jobs()["alpha"].when, When::Never);
        assert_eq!(parser.jobs()["zeta"].when, When::OnSuccess);
        assert_eq!(parser.job_name_pad(), 5);
    }

    #[tokio::test]
    async fn test_create_from_checkout() {
        let cwd = tempfile::tempdir().unwrap();
        let home = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(cwd.path().join("ci")).unwrap();
        std::fs::write(
            cwd.path().join(".gitlab-ci.yml"),
            "include: ci/templates.yml\nvariables:\n  IMAGE: alpine\n# @Description Compiles the project\nbuild:\n  extends: .base\n  stage: build\n  script: [make]\n",
        )
        .unwrap();
        std::fs::write(
            cwd.path().join("ci/templates.yml"),
            "default:\n  before_script: [echo setup]\n.base:\n  image: $IMAGE\n  tags: [docker]\n",
        )
        .unwrap();
        std::fs::write(
            cwd.path().join(LOCAL_OVERRIDE_FILE),
            "build:\n  variables:\n    LOCAL: 'yes'\n",
        )
        .unwrap();

        let options = ParserOptions {
            cwd: cwd.path().to_path_buf(),
            home: home.path().to_path_buf(),
            ..ParserOptions::default()
        };
        let parser = Parser::create(&options, &NoGit).await.unwrap();

        let build = &parser.jobs()["build"];
        assert_eq!(build.before_script, vec!["echo setup"]);
        assert_eq!(build.script, vec!["make"]);
        assert_eq!(build.image.as_ref().unwrap().name, "$IMAGE");
        assert_eq!(build.variables["LOCAL"], "yes");
        assert_eq!(build.variables["IMAGE"], "alpine");
        assert_eq!(build.description.as_deref(), Some("Compiles the project"));
        assert_eq!(parser.git_data(), &GitData::default());
    }

    #[tokio::test]
    async fn test_create_reports_missing_script() {
        let cwd = tempfile::tempdir().unwrap();
        let home = tempfile::tempdir().unwrap();
        std::fs::write(cwd.path().join(".gitlab-ci.yml"), "build:\n  stage: build\n").unwrap();

        let options = ParserOptions {
            cwd: cwd.path().to_path_buf(),
            home: home.path().to_path_buf(),
            ..ParserOptions::default()
        };
        let err = Parser::create(&options, &NoGit).await.unwrap_err();
        assert_eq!(message(err), "job must have script specified");
    }
}
