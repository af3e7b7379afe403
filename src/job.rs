use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use indexmap::IndexMap;
use log::warn;
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::Result;
use crate::git_data::GitData;
use crate::parser::context::{ParseContext, Variables};
use crate::parser::value::Value;
use crate::rules::{RuleOutcome, RuleSet, Rules};
use crate::utils::expand_variables;

/// When a job runs relative to the rest of its pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum When {
    #[default]
    OnSuccess,
    OnFailure,
    Always,
    Manual,
    Delayed,
    Never,
}

impl When {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OnSuccess => "on_success",
            Self::OnFailure => "on_failure",
            Self::Always => "always",
            Self::Manual => "manual",
            Self::Delayed => "delayed",
            Self::Never => "never",
        }
    }
}

impl fmt::Display for When {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for When {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "on_success" => Ok(Self::OnSuccess),
            "on_failure" => Ok(Self::OnFailure),
            "always" => Ok(Self::Always),
            "manual" => Ok(Self::Manual),
            "delayed" => Ok(Self::Delayed),
            "never" => Ok(Self::Never),
            other => Err(format!("unknown when '{other}'")),
        }
    }
}

/// Accepts `"a b"` as well as `["a", "b"]`.
fn string_or_seq<'de, D>(deserializer: D) -> std::result::Result<Option<Vec<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(Option::<OneOrMany>::deserialize(deserializer)?.map(|value| match value {
        OneOrMany::One(single) => vec![single],
        OneOrMany::Many(many) => many,
    }))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    pub name: String,
    #[serde(default, deserialize_with = "string_or_seq", skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub name: String,
    #[serde(default, deserialize_with = "string_or_seq", skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<Vec<String>>,
    #[serde(default, deserialize_with = "string_or_seq", skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

/// A fully expanded job, ready for scheduling.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Job {
    /// Key of the job in the pipeline document
    pub name: String,
    /// Stage the job belongs to, `test` unless declared
    pub stage: String,
    pub before_script: Vec<String>,
    pub script: Vec<String>,
    pub after_script: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<Image>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub services: Vec<Service>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifacts: Option<Value>,
    /// Explicit `needs`, by job name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub needs: Option<Vec<String>>,
    /// Trigger jobs start a downstream pipeline instead of running a script
    pub trigger: bool,
    /// Final variable mapping the job's rules were evaluated against
    pub variables: IndexMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rules: Option<RuleSet>,
    pub when: When,
    pub allow_failure: bool,
    pub interactive: bool,
    pub inject_ssh_agent: bool,
    pub artifacts_to_source: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Everything a job needs from the surrounding pipeline.
pub struct JobEnvironment<'a> {
    /// The merged, expanded pipeline document
    pub globals: &'a Value,
    pub git_data: &'a GitData,
    pub pipeline_iid: u64,
    /// Variables from the command line or configuration; they win over everything
    pub overrides: &'a IndexMap<String, String>,
    pub rules: Rules,
}

impl Job {
    /// Builds a job from its expanded definition and evaluates its rules.
    pub fn new(ctx: &ParseContext, name: &str, definition: &Value, env: &JobEnvironment) -> Result<Self> {
        let stage = definition
            .get("stage")
            .and_then(Value::scalar_string)
            .unwrap_or_else(|| "test".to_string());

        let variables = Self::variables(ctx, name, &stage, definition, env)?;

        let rules = definition
            .get("rules")
            .map(|rules| ctx.descend("rules").run(|_| rules.to_typed::<RuleSet>()))
            .transpose()?;

        let declared_when = definition
            .get("when")
            .and_then(Value::as_str)
            .map(|when| Self::parse_when(&ctx.descend("when"), when))
            .transpose()?;
        let declared_allow_failure = definition.get("allow_failure").and_then(Value::as_bool);

        let (when, allow_failure) = match &rules {
            None => {
                let when = declared_when.unwrap_or_default();
                (when, declared_allow_failure.unwrap_or(when == When::Manual))
            }
            Some(rule_set) => {
                let scope = ctx.bind(variables.iter().map(|(k, v)| (k.clone(), v.clone())).collect());
                match env.rules.evaluate(&scope, rule_set)? {
                    Some(RuleOutcome { result: true, rule }) => {
                        let when = match rule.when.as_deref() {
                            Some(when) => Self::parse_when(&ctx.descend("rules"), when)?,
                            None => declared_when.unwrap_or_default(),
                        };
                        let allow_failure = rule
                            .allow_failure
                            .or(declared_allow_failure)
                            .unwrap_or(when == When::Manual);
                        (when, allow_failure)
                    }
                    _ => (When::Never, declared_allow_failure.unwrap_or(false)),
                }
            }
        };

        let image = definition
            .get("image")
            .map(|image| ctx.descend("image").run(|_| image.to_typed::<Image>()))
            .transpose()?;
        let services = definition
            .get("services")
            .map(|services| ctx.descend("services").run(|_| services.to_typed::<Vec<Service>>()))
            .transpose()?
            .unwrap_or_default();

        Ok(Self {
            name: name.to_string(),
            stage,
            before_script: Self::lines(ctx, definition, "before_script")?,
            script: Self::lines(ctx, definition, "script")?,
            after_script: Self::lines(ctx, definition, "after_script")?,
            image,
            services,
            artifacts: definition.get("artifacts").cloned(),
            needs: Self::needs(ctx, definition)?,
            trigger: definition.get("trigger").is_some(),
            variables,
            rules,
            when,
            allow_failure,
            interactive: definition.get("interactive").and_then(Value::as_bool).unwrap_or(false),
            inject_ssh_agent: definition.get("injectSSHAgent").and_then(Value::as_bool).unwrap_or(false),
            artifacts_to_source: definition.get("artifactsToSource").and_then(Value::as_bool).unwrap_or(true),
            description: definition.get("description").and_then(Value::scalar_string),
        })
    }

    fn parse_when(ctx: &ParseContext, when: &str) -> Result<When> {
        when.parse().map_err(|e: String| ctx.fail(e))
    }

    /// Predefined, then global, then the job's own (expanded), then overrides.
    fn variables(
        ctx: &ParseContext,
        name: &str,
        stage: &str,
        definition: &Value,
        env: &JobEnvironment,
    ) -> Result<IndexMap<String, String>> {
        let predefined: BTreeMap<String, String> = env
            .git_data
            .variables()
            .into_iter()
            .chain([
                ("CI_JOB_NAME".to_string(), name.to_string()),
                ("CI_JOB_STAGE".to_string(), stage.to_string()),
                ("CI_PIPELINE_IID".to_string(), env.pipeline_iid.to_string()),
                ("CI_PIPELINE_SOURCE".to_string(), "push".to_string()),
                ("GITLAB_CI".to_string(), "false".to_string()),
            ])
            .collect();

        let mut variables: IndexMap<String, String> = predefined.into_iter().collect();
        variables.extend(Self::global_variables(env.globals));

        let scope: Variables = variables.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        let own = Self::own_variables(&ctx.descend("variables"), definition)?;
        variables.extend(expand_variables(&own, &scope));

        variables.extend(env.overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(variables)
    }

    /// Top-level `variables`, accepting `{value: ...}` entries.
    fn global_variables(globals: &Value) -> IndexMap<String, String> {
        let Some(table) = globals.get("variables").and_then(Value::as_mapping) else {
            return IndexMap::new();
        };
        table
            .iter()
            .filter_map(|(key, value)| {
                let resolved = value
                    .scalar_string()
                    .or_else(|| value.get("value").and_then(Value::scalar_string));
                if resolved.is_none() {
                    warn!("Ignoring global variable {key}={value}");
                }
                resolved.map(|resolved| (key.clone(), resolved))
            })
            .collect()
    }

    fn own_variables(ctx: &ParseContext, definition: &Value) -> Result<IndexMap<String, String>> {
        let Some(table) = definition.get("variables") else {
            return Ok(IndexMap::new());
        };
        let table = ctx.require(table.as_mapping(), "variables must be a mapping")?;
        table
            .iter()
            .map(|(key, value)| {
                ctx.require(value.scalar_string(), format!("{key} must be a string or a number"))
                    .map(|value| (key.clone(), value))
            })
            .collect()
    }

    fn lines(ctx: &ParseContext, definition: &Value, field: &str) -> Result<Vec<String>> {
        let Some(lines) = definition.get(field) else {
            return Ok(Vec::new());
        };
        let ctx = ctx.descend(field);
        let lines = ctx.require(lines.as_sequence(), format!("{field} must be a list"))?;
        lines
            .iter()
            .map(|line| {
                ctx.require(
                    line.scalar_string(),
                    format!("{field} entries must be strings, found {}", line.type_name()),
                )
            })
            .collect()
    }

    fn needs(ctx: &ParseContext, definition: &Value) -> Result<Option<Vec<String>>> {
        let Some(needs) = definition.get("needs") else {
            return Ok(None);
        };
        let ctx = ctx.descend("needs");
        let needs = ctx.require(needs.as_sequence(), "needs must be a list")?;
        needs
            .iter()
            .map(|need| {
                let name = need
                    .as_str()
                    .or_else(|| need.get("job").and_then(Value::as_str));
                ctx.require(name.map(str::to_string), format!("invalid needs entry {need}"))
            })
            .collect::<Result<Vec<_>>>()
            .map(Some)
    }

    /// Whether the job would be started at all.
    pub fn is_runnable(&self) -> bool {
        self.when != When::Never
    }
}
