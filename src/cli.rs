use anyhow::{Context, Result};
use clap::{Parser as ClapParser, Subcommand};
use indexmap::IndexMap;
use log::info;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::config::{Config, OutputFormat};
use crate::fetch::ShellRunner;
use crate::output::{self, ParseProgress};
use crate::parser::context::ParseContext;
use crate::parser::{Parser, ParserOptions};
use crate::rules::{GitlabVersion, Rules};

#[derive(ClapParser)]
#[command(name = "gitlab-ci-local")]
#[command(author, version, about = "Resolve GitLab CI pipelines locally", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Repository checkout holding the pipeline
    #[arg(long, global = true, default_value = ".")]
    cwd: PathBuf,

    /// Pipeline file, relative to --cwd
    #[arg(short, long, global = true)]
    file: Option<String>,

    /// Configuration file; gcl.{toml,json,yaml,yml} in --cwd otherwise
    #[arg(short, long, global = true, env = "GCL_CONFIG")]
    config: Option<PathBuf>,

    /// Re-download remote, template and project includes
    #[arg(long, global = true, default_value_t = false)]
    fetch_includes: bool,

    /// Directory holding .gitlab-ci-local/projects.yml
    #[arg(long, global = true, env = "GCL_HOME")]
    home: Option<PathBuf>,

    /// Variable applied to every job, may be repeated
    #[arg(long = "variable", global = true, value_parser = parse_variable)]
    variables: Vec<(String, String)>,

    /// GitLab release whose rule semantics are reproduced, e.g. 14.2
    #[arg(long, global = true)]
    gitlab_version: Option<GitlabVersion>,

    /// Write output to a file instead of stdout
    #[arg(short, long, global = true)]
    output: Option<PathBuf>,

    #[arg(short, long, global = true, default_value_t = false)]
    pretty: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Table of resolved jobs
    List,
    /// Fully expanded pipeline as YAML
    Preview,
    /// Resolved jobs as JSON
    Json,
    /// Evaluate a rules `if:` expression against --variable values
    EvalIf { expression: String },
}

fn parse_variable(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, found '{raw}'")),
    }
}

impl Cli {
    /// Merges configuration below the command line flags.
    fn parser_options(&self, config: &Config) -> ParserOptions {
        let defaults = ParserOptions::default();

        let mut variables: IndexMap<String, String> = config.variables.clone();
        variables.extend(self.variables.iter().cloned());

        ParserOptions {
            cwd: self.cwd.clone(),
            file: self.file.clone().unwrap_or_else(|| config.parser.file.clone()),
            home: self
                .home
                .clone()
                .or_else(|| config.parser.home.clone())
                .unwrap_or(defaults.home),
            fetch_includes: self.fetch_includes || config.parser.fetch_includes,
            pipeline_iid: config.parser.pipeline_iid,
            variables,
            gitlab_version: self.gitlab_version.unwrap_or(config.parser.gitlab_version),
        }
    }

    fn format(&self, config: &Config) -> OutputFormat {
        match self.command {
            Some(Commands::List) => OutputFormat::List,
            Some(Commands::Preview) => OutputFormat::Preview,
            Some(Commands::Json) => OutputFormat::Json,
            Some(Commands::EvalIf { .. }) | None => config.output.format,
        }
    }

    async fn resolve(options: &ParserOptions) -> Result<Parser> {
        info!("Resolving pipeline {}", options.cwd.join(&options.file).display());

        let progress = ParseProgress::start(&options.file);
        match Parser::create(options, &ShellRunner).await {
            Ok(parser) => {
                progress.finish(parser.jobs().len());
                Ok(parser)
            }
            Err(e) => {
                progress.fail();
                Err(e).context("Failed to resolve pipeline")
            }
        }
    }

    fn write_output(&self, render: impl FnOnce(&mut dyn Write) -> Result<()>) -> Result<()> {
        if let Some(output_path) = &self.output {
            let mut file = std::fs::File::create(output_path)
                .with_context(|| format!("Failed to create {}", output_path.display()))?;
            render(&mut file)?;
            info!("Output written to: {}", output_path.display());
        } else {
            render(&mut std::io::stdout().lock())?;
        }
        Ok(())
    }

    fn execute_eval_if(options: &ParserOptions, expression: &str) -> Result<()> {
        let ctx = ParseContext::root().bind(options.variables.clone().into_iter().collect());
        let result = Rules::evaluate_if(&ctx, expression)?;
        println!("{result}");
        Ok(())
    }

    pub async fn execute(&self) -> Result<()> {
        let config = Config::load(self.config.as_deref(), Path::new(&self.cwd))?;
        let options = self.parser_options(&config);

        if let Some(Commands::EvalIf { expression }) = &self.command {
            return Self::execute_eval_if(&options, expression);
        }

        let parser = Self::resolve(&options).await?;
        let pretty = self.pretty || config.output.pretty;

        match self.format(&config) {
            OutputFormat::List => {
                if self.output.is_some() {
                    let rendered = output::render_job_list(&parser);
                    self.write_output(|out| Ok(write!(out, "{rendered}")?))
                } else {
                    output::print_job_list(&parser);
                    Ok(())
                }
            }
            OutputFormat::Preview => self.write_output(|out| output::export_preview(&parser, out)),
            OutputFormat::Json => self.write_output(|out| output::export_json(&parser, pretty, out)),
        }
    }
}
