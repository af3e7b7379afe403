use log::debug;

use crate::error::Result;

use super::context::ParseContext;
use super::value::{merge_documents, Mapping, Value};

/// Top-level keys that configure the pipeline rather than name a job.
pub const RESERVED_KEYS: [&str; 13] = [
    "include",
    "local_configuration",
    "image",
    "services",
    "stages",
    "types",
    "before_script",
    "after_script",
    "default",
    "variables",
    "cache",
    "workflow",
    "artifacts",
];

const MAX_EXTENDS_DEPTH: usize = 11;
const MAX_REFERENCE_HOPS: usize = 10;

pub fn is_reserved(key: &str) -> bool {
    RESERVED_KEYS.contains(&key)
}

/// Hidden keys (leading `.`) are templates, not jobs.
pub fn is_real_job(key: &str) -> bool {
    !is_reserved(key) && !key.starts_with('.')
}

/// Runs `f` on every real job definition in document order.
fn for_each_real_job(
    ctx: &ParseContext,
    document: &mut Value,
    mut f: impl FnMut(&ParseContext, &mut Mapping) -> Result<()>,
) -> Result<()> {
    let Some(map) = document.as_mapping_mut() else {
        return Ok(());
    };
    for (name, definition) in map.iter_mut().filter(|(name, _)| is_real_job(name)) {
        let ctx = ctx.descend(name.as_str());
        let found = definition.type_name();
        let Value::Mapping(job) = definition else {
            return Err(ctx.fail(format!("job definition must be a mapping, found {found}")));
        };
        f(&ctx, job)?;
    }
    Ok(())
}

/// Pipeline-wide value of a job field: `default.<field>`, else the top-level key.
///
/// Only reserved keys are read from the top level; anything else there is a job.
fn document_default(document: &Value, field: &str) -> Option<Value> {
    document
        .get("default")
        .and_then(|defaults| defaults.get(field))
        .or_else(|| document.get(field).filter(|_| is_reserved(field)))
        .cloned()
}

/// Replaces every `!reference [...]` in the document with the value it points at.
pub fn reference(ctx: &ParseContext, document: &mut Value) -> Result<()> {
    let root = document.clone();
    resolve_children(ctx, &root, document, 0)
}

fn resolve_children(ctx: &ParseContext, root: &Value, node: &mut Value, hops: usize) -> Result<()> {
    match node {
        Value::Mapping(map) => {
            for (key, value) in map.iter_mut() {
                resolve_entry(ctx, root, key, value, hops)?;
            }
        }
        Value::Sequence(seq) => {
            for (index, value) in seq.iter_mut().enumerate() {
                resolve_entry(ctx, root, &index.to_string(), value, hops)?;
            }
        }
        _ => {}
    }
    Ok(())
}

fn resolve_entry(
    ctx: &ParseContext,
    root: &Value,
    key: &str,
    value: &mut Value,
    hops: usize,
) -> Result<()> {
    let Value::Reference(pointer) = value else {
        if value.contains_reference() {
            return resolve_children(&ctx.descend(key), root, value, hops);
        }
        return Ok(());
    };

    let segments: Vec<String> = pointer
        .iter()
        .map(|segment| segment.scalar_string().unwrap_or_else(|| segment.to_string()))
        .collect();
    let ctx = ctx.descend_with_value("reference", key, segments);

    let mut resolved = lookup(&ctx, root, pointer)?.clone();
    if resolved.contains_reference() {
        ctx.assert(
            hops < MAX_REFERENCE_HOPS,
            "circular dependency detected in `!reference`",
        )?;
        resolve_entry(&ctx, root, key, &mut resolved, hops + 1)?;
    }

    *value = flatten_sequence(&ctx, resolved)?;
    Ok(())
}

fn lookup<'a>(ctx: &ParseContext, root: &'a Value, pointer: &[Value]) -> Result<&'a Value> {
    let mut current = root;
    for segment in pointer {
        let segment = ctx.require(segment.scalar_string(), "undefined reference pointer")?;
        let next = match current {
            Value::Mapping(map) => map.get(&segment),
            Value::Sequence(seq) => segment.parse::<usize>().ok().and_then(|i| seq.get(i)),
            _ => None,
        };
        current = ctx.require(
            next.filter(|value| !value.is_null()),
            format!("undefined reference value: {segment}"),
        )?;
    }
    Ok(current)
}

/// Splices nested sequences into their parent, one level deep.
fn flatten_sequence(ctx: &ParseContext, value: Value) -> Result<Value> {
    let Value::Sequence(items) = value else {
        return Ok(value);
    };
    if !items.iter().any(|item| matches!(item, Value::Sequence(_))) {
        return Ok(Value::Sequence(items));
    }

    let mut flat = Vec::with_capacity(items.len());
    for item in items {
        match item {
            Value::Null => return Err(ctx.fail("undefined entry in expansion array")),
            Value::Sequence(inner) => flat.extend(inner),
            other => flat.push(other),
        }
    }
    Ok(Value::Sequence(flat))
}

/// Resolves `extends`: each real job becomes the deep merge of its ancestors
/// (furthest first) and its own definition.
pub fn job_extends(ctx: &ParseContext, document: &mut Value) -> Result<()> {
    let Some(map) = document.as_mapping_mut() else {
        return Ok(());
    };

    for (name, definition) in map.iter_mut().filter(|(name, _)| !is_reserved(name)) {
        let found = definition.type_name();
        let Value::Mapping(definition) = definition else {
            if is_real_job(name) {
                return Err(ctx
                    .descend(name.as_str())
                    .fail(format!("job definition must be a mapping, found {found}")));
            }
            continue;
        };
        let ctx = ctx.descend(name.as_str()).descend("extends");
        let parents = normalize_extends(&ctx, definition.get("extends"))?;
        definition.insert("extends".to_string(), Value::Sequence(parents));
    }

    let snapshot = document.clone();
    let Some(jobs) = snapshot.as_mapping() else {
        return Ok(());
    };
    let Some(map) = document.as_mapping_mut() else {
        return Ok(());
    };

    for (name, definition) in jobs.iter().filter(|(name, _)| is_real_job(name)) {
        let job_ctx = ctx.descend(name.as_str());
        let mut ancestors = Vec::new();
        collect_ancestors(&job_ctx, &snapshot, name, definition, &mut ancestors, 0)?;
        if !ancestors.is_empty() {
            debug!("{name} extends {} definition(s)", ancestors.len());
        }
        let merged = merge_documents(ancestors.into_iter().chain(std::iter::once(definition)));
        map.insert(name.clone(), merged);
    }

    for (_, definition) in map.iter_mut().filter(|(name, _)| !is_reserved(name)) {
        if let Some(definition) = definition.as_mapping_mut() {
            definition.shift_remove("extends");
        }
    }

    Ok(())
}

fn normalize_extends(ctx: &ParseContext, extends: Option<&Value>) -> Result<Vec<Value>> {
    match extends {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::String(parent)) => Ok(vec![Value::String(parent.clone())]),
        Some(Value::Sequence(parents)) => {
            for parent in parents {
                ctx.assert(
                    parent.as_str().is_some(),
                    format!("extends entries must be strings, found {}", parent.type_name()),
                )?;
            }
            Ok(parents.clone())
        }
        Some(other) => Err(ctx.fail(format!(
            "extends must be a string or a list of strings, found {}",
            other.type_name()
        ))),
    }
}

fn collect_ancestors<'a>(
    ctx: &ParseContext,
    document: &'a Value,
    name: &str,
    definition: &'a Value,
    ancestors: &mut Vec<&'a Value>,
    depth: usize,
) -> Result<()> {
    ctx.assert(
        depth < MAX_EXTENDS_DEPTH,
        format!("{name}: circular dependency detected in `extends`"),
    )?;

    let ctx = ctx.descend("extends");
    let parents = definition
        .get("extends")
        .and_then(Value::as_sequence)
        .map(Vec::as_slice)
        .unwrap_or_default();
    for parent_name in parents.iter().filter_map(Value::as_str) {
        let parent_ctx = ctx.descend(parent_name);
        let parent = parent_ctx.require(
            document.get(parent_name),
            format!("{parent_name} is extended from {name}, but is unspecified"),
        )?;
        collect_ancestors(&parent_ctx, document, parent_name, parent, ancestors, depth + 1)?;
        ancestors.push(parent);
    }
    Ok(())
}

/// `artifacts`: the job's own value, else the pipeline default.
pub fn artifacts(ctx: &ParseContext, document: &mut Value) -> Result<()> {
    let fallback = document_default(document, "artifacts");
    for_each_real_job(ctx, document, |_, job| {
        let missing = job.get("artifacts").map_or(true, Value::is_null);
        if let Some(fallback) = fallback.as_ref().filter(|_| missing) {
            job.insert("artifacts".to_string(), fallback.clone());
        }
        Ok(())
    })
}

/// `image`: defaulted like `artifacts`, then normalized to `{name, entrypoint?}`.
pub fn image(ctx: &ParseContext, document: &mut Value) -> Result<()> {
    let fallback = document_default(document, "image");
    for_each_real_job(ctx, document, |ctx, job| {
        let Some(image) = own_or(job, "image", &fallback) else {
            return Ok(());
        };
        let ctx = ctx.descend("image");
        let normalized = match image {
            Value::String(name) => Mapping::from([("name".to_string(), Value::String(name))]),
            Value::Mapping(fields) => pick(&fields, &["name", "entrypoint"]),
            other => {
                return Err(ctx.fail(format!(
                    "image must be a string or a mapping, found {}",
                    other.type_name()
                )))
            }
        };
        job.insert("image".to_string(), Value::Mapping(normalized));
        Ok(())
    })
}

/// `services`: defaulted like `artifacts`, then normalized to a list of
/// `{name, entrypoint?, command?, alias?}`.
pub fn services(ctx: &ParseContext, document: &mut Value) -> Result<()> {
    let fallback = document_default(document, "services");
    for_each_real_job(ctx, document, |ctx, job| {
        let Some(services) = own_or(job, "services", &fallback) else {
            return Ok(());
        };
        let ctx = ctx.descend("services");
        let Value::Sequence(entries) = services else {
            return Err(ctx.fail(format!("services must be a list, found {}", services.type_name())));
        };

        let mut normalized = Vec::with_capacity(entries.len());
        for (index, entry) in entries.into_iter().enumerate() {
            let ctx = ctx.descend(index.to_string());
            let service = match entry {
                Value::String(name) => Mapping::from([("name".to_string(), Value::String(name))]),
                Value::Mapping(fields) => {
                    ctx.require(fields.get("name").and_then(Value::as_str), "service must have a name")?;
                    pick(&fields, &["name", "entrypoint", "command", "alias"])
                }
                other => {
                    return Err(ctx.fail(format!(
                        "service must be a string or a mapping, found {}",
                        other.type_name()
                    )))
                }
            };
            normalized.push(Value::Mapping(service));
        }

        job.insert("services".to_string(), Value::Sequence(normalized));
        Ok(())
    })
}

fn own_or(job: &Mapping, field: &str, fallback: &Option<Value>) -> Option<Value> {
    job.get(field)
        .filter(|value| !value.is_null())
        .cloned()
        .or_else(|| fallback.clone())
}

/// Keeps only `keys`, in that order, dropping nulls.
fn pick(fields: &Mapping, keys: &[&str]) -> Mapping {
    keys.iter()
        .filter_map(|key| {
            fields
                .get(*key)
                .filter(|value| !value.is_null())
                .map(|value| ((*key).to_string(), value.clone()))
        })
        .collect()
}

pub fn before_scripts(ctx: &ParseContext, document: &mut Value) -> Result<()> {
    concat_scripts(ctx, document, "before_script")
}

pub fn after_scripts(ctx: &ParseContext, document: &mut Value) -> Result<()> {
    concat_scripts(ctx, document, "after_script")
}

/// `script` is concatenated like the hooks and required unless the job is a trigger.
pub fn scripts(ctx: &ParseContext, document: &mut Value) -> Result<()> {
    concat_scripts(ctx, document, "script")?;
    for_each_real_job(ctx, document, |ctx, job| {
        let has_script = matches!(job.get("script"), Some(Value::Sequence(lines)) if !lines.is_empty());
        let has_trigger = job.get("trigger").is_some_and(|trigger| !trigger.is_null());
        ctx.assert(has_script || has_trigger, "job must have script specified")
    })
}

/// Pipeline default lines first, then the job's own, one nesting level flattened.
fn concat_scripts(ctx: &ParseContext, document: &mut Value, field: &'static str) -> Result<()> {
    let fallback = document_default(document, field);
    for_each_real_job(ctx, document, |ctx, job| {
        let ctx = ctx.descend(field);
        let mut lines = as_lines(&ctx, fallback.as_ref())?;
        lines.extend(as_lines(&ctx, job.get(field))?);
        if lines.is_empty() {
            return Ok(());
        }
        let flat = flatten_sequence(&ctx, Value::Sequence(lines))?;
        job.insert(field.to_string(), flat);
        Ok(())
    })
}

fn as_lines(ctx: &ParseContext, value: Option<&Value>) -> Result<Vec<Value>> {
    match value {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Sequence(lines)) => Ok(lines.clone()),
        Some(line @ (Value::String(_) | Value::Number(_) | Value::Bool(_))) => Ok(vec![line.clone()]),
        Some(other) => Err(ctx.fail(format!(
            "script must be a string or a list, found {}",
            other.type_name()
        ))),
    }
}

/// Every expansion pass, in the order later passes rely on.
pub fn expand_all(ctx: &ParseContext, document: &mut Value) -> Result<()> {
    reference(ctx, document)?;
    job_extends(ctx, document)?;
    artifacts(ctx, document)?;
    image(ctx, document)?;
    services(ctx, document)?;
    before_scripts(ctx, document)?;
    after_scripts(ctx, document)?;
    scripts(ctx, document)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::loader::parse_document;

    fn yaml(text: &str) -> Value {
        parse_document(text).unwrap()
    }

    fn message(err: &crate::error::GclError) -> String {
        err.as_parse().unwrap().message().to_string()
    }

    #[test]
    fn test_real_job_names() {
        assert!(is_real_job("build"));
        assert!(!is_real_job(".template"));
        assert!(!is_real_job("variables"));
        assert!(!is_real_job("default"));
    }

    #[test]
    fn test_extends_simple() {
        let mut doc = yaml("test-job:\n  extends: [build-job]\nbuild-job:\n  script: ['echo \"Hello, world!\"']\n");
        job_extends(&ParseContext::root(), &mut doc).unwrap();

        assert_eq!(
            doc,
            yaml("test-job:\n  script: ['echo \"Hello, world!\"']\nbuild-job:\n  script: ['echo \"Hello, world!\"']\n")
        );
    }

    #[test]
    fn test_extends_union_and_precedence() {
        let mut doc = yaml(
            ".a:\n  image: a\n  stage: build\n  variables: {A: '1', SHARED: a}\n.b:\n  image: b\n  tags: [docker]\n  variables: {SHARED: b}\njob:\n  extends: [.a, .b]\n  stage: test\n  script: [run]\n",
        );
        job_extends(&ParseContext::root(), &mut doc).unwrap();

        let job = doc.get("job").unwrap();
        assert_eq!(job.get("image"), Some(&Value::from("b")));
        assert_eq!(job.get("stage"), Some(&Value::from("test")));
        assert_eq!(job.get("tags"), yaml("x: [docker]").get("x"));
        assert_eq!(job.get("variables"), yaml("v: {A: '1', SHARED: b}").get("v"));
        assert!(job.get("extends").is_none());
        assert!(doc.get(".a").unwrap().get("extends").is_none());
    }

    #[test]
    fn test_extends_string_and_transitive() {
        let mut doc = yaml(".base:\n  image: base\n.mid:\n  extends: .base\n  tags: [mid]\njob:\n  extends: .mid\n  script: [x]\n");
        job_extends(&ParseContext::root(), &mut doc).unwrap();

        let job = doc.get("job").unwrap();
        assert_eq!(job.get("image"), Some(&Value::from("base")));
        assert!(job.get("tags").is_some());
    }

    #[test]
    fn test_extends_cycle_names_job() {
        let mut doc = yaml("build-job:\n  extends: [test-job]\ntest-job:\n  extends: [build-job]\n");
        let err = job_extends(&ParseContext::root(), &mut doc).unwrap_err();
        assert_eq!(message(&err), "test-job: circular dependency detected in `extends`");
    }

    #[test]
    fn test_extends_unspecified_parent() {
        let mut doc = yaml("test-job:\n  extends: [build-job]\n");
        let err = job_extends(&ParseContext::root(), &mut doc).unwrap_err();
        assert_eq!(message(&err), "build-job is extended from test-job, but is unspecified");
    }

    #[test]
    fn test_extends_rejects_bad_shape() {
        let mut doc = yaml("job:\n  extends: {a: b}\n");
        let err = job_extends(&ParseContext::root(), &mut doc).unwrap_err();
        assert_eq!(
            message(&err),
            "extends must be a string or a list of strings, found mapping"
        );
    }

    #[test]
    fn test_reference_resolves_and_flattens() {
        let mut doc = yaml(
            ".setup:\n  script: [a, b]\n  vars: {X: '1'}\njob:\n  script:\n    - !reference [.setup, script]\n    - c\n  variables: !reference [.setup, vars]\n",
        );
        reference(&ParseContext::root(), &mut doc).unwrap();

        let job = doc.get("job").unwrap();
        assert_eq!(job.get("script"), yaml("s: [[a, b], c]").get("s"));
        assert_eq!(job.get("variables"), yaml("v: {X: '1'}").get("v"));
        assert!(!doc.contains_reference());
    }

    #[test]
    fn test_reference_to_reference_and_index() {
        let mut doc = yaml(
            ".one:\n  script: [first, second]\n.two:\n  script: !reference [.one, script]\njob:\n  script: !reference [.two, script]\n  image: !reference [.one, script, 1]\n",
        );
        reference(&ParseContext::root(), &mut doc).unwrap();

        let job = doc.get("job").unwrap();
        assert_eq!(job.get("script"), yaml("s: [first, second]").get("s"));
        assert_eq!(job.get("image"), Some(&Value::from("second")));
    }

    #[test]
    fn test_reference_is_idempotent() {
        let mut doc = yaml(".setup:\n  script: [a]\njob:\n  script: !reference [.setup, script]\n");
        reference(&ParseContext::root(), &mut doc).unwrap();
        let once = doc.clone();
        reference(&ParseContext::root(), &mut doc).unwrap();
        assert_eq!(doc, once);
    }

    #[test]
    fn test_reference_errors() {
        let mut doc = yaml("job:\n  script: !reference [.missing, script]\n");
        let err = reference(&ParseContext::root(), &mut doc).unwrap_err();
        assert_eq!(err.as_parse().unwrap().message(), "undefined reference value: .missing");
        assert_eq!(
            err.as_parse().unwrap().path(),
            "job ⋯ [reference] script ⟵ .missing ⋯ script"
        );

        let mut doc = yaml(".a:\n  x: !reference [.b, x]\n.b:\n  x: !reference [.a, x]\n");
        let err = reference(&ParseContext::root(), &mut doc).unwrap_err();
        assert_eq!(message(&err), "circular dependency detected in `!reference`");
    }

    #[test]
    fn test_image_and_services_defaults() {
        let mut doc = yaml(
            "image: alpine\ndefault:\n  services: [postgres, {name: redis, alias: cache}]\njob:\n  script: [x]\nown:\n  image: {name: node, entrypoint: ['']}\n  script: [x]\n",
        );
        image(&ParseContext::root(), &mut doc).unwrap();
        services(&ParseContext::root(), &mut doc).unwrap();

        let job = doc.get("job").unwrap();
        assert_eq!(job.get("image"), yaml("i: {name: alpine}").get("i"));
        assert_eq!(
            job.get("services"),
            yaml("s: [{name: postgres}, {name: redis, alias: cache}]").get("s")
        );
        assert_eq!(
            doc.get("own").unwrap().get("image"),
            yaml("i: {name: node, entrypoint: ['']}").get("i")
        );
    }

    #[test]
    fn test_services_must_be_a_list() {
        let mut doc = yaml("job:\n  services: postgres\n  script: [x]\n");
        let err = services(&ParseContext::root(), &mut doc).unwrap_err();
        assert_eq!(message(&err), "services must be a list, found string");
    }

    #[test]
    fn test_artifacts_default() {
        let mut doc = yaml("artifacts: {paths: [dist]}\njob:\n  script: [x]\nown:\n  artifacts: {paths: [out]}\n  script: [x]\n");
        artifacts(&ParseContext::root(), &mut doc).unwrap();

        assert_eq!(doc.get("job").unwrap().get("artifacts"), yaml("a: {paths: [dist]}").get("a"));
        assert_eq!(doc.get("own").unwrap().get("artifacts"), yaml("a: {paths: [out]}").get("a"));
    }

    #[test]
    fn test_before_script_default_comes_first() {
        let mut doc = yaml("default:\n  before_script: [b, c]\njob:\n  before_script: a\n  script: [x]\n");
        before_scripts(&ParseContext::root(), &mut doc).unwrap();

        assert_eq!(
            doc.get("job").unwrap().get("before_script"),
            yaml("s: [b, c, a]").get("s")
        );
    }

    #[test]
    fn test_top_level_hooks_and_nested_lines() {
        let mut doc = yaml("after_script: [cleanup]\njob:\n  after_script: [[one, two], three]\n  script: [x]\n");
        after_scripts(&ParseContext::root(), &mut doc).unwrap();

        assert_eq!(
            doc.get("job").unwrap().get("after_script"),
            yaml("s: [cleanup, one, two, three]").get("s")
        );
    }

    #[test]
    fn test_script_required_unless_trigger() {
        let mut doc = yaml("deploy:\n  trigger: group/downstream\n");
        scripts(&ParseContext::root(), &mut doc).unwrap();
        assert!(doc.get("deploy").unwrap().get("script").is_none());

        let mut doc = yaml("build:\n  stage: build\n");
        let err = scripts(&ParseContext::root(), &mut doc).unwrap_err();
        assert_eq!(message(&err), "job must have script specified");
        assert_eq!(err.as_parse().unwrap().path(), "build");

        let mut doc = yaml("lint:\n  script: []\n");
        let err = scripts(&ParseContext::root(), &mut doc).unwrap_err();
        assert_eq!(message(&err), "job must have script specified");
        assert_eq!(err.as_parse().unwrap().path(), "lint");
    }

    #[test]
    fn test_extends_rejects_scalar_job() {
        let mut doc = yaml("foo: bar
.hidden: text
");
        let err = job_extends(&ParseContext::root(), &mut doc).unwrap_err();
        assert_eq!(message(&err), "job definition must be a mapping, found string");
        assert_eq!(err.as_parse().unwrap().path(), "foo");
    }

    #[test]
    fn test_script_string_becomes_list() {
        let mut doc = yaml("job:\n  script: make\n");
        scripts(&ParseContext::root(), &mut doc).unwrap();
        assert_eq!(doc.get("job").unwrap().get("script"), yaml("s: [make]").get("s"));
    }

    #[test]
    fn test_expand_all_with_reference_into_extends() {
        let mut doc = yaml(
            ".install:\n  script: [npm ci]\n.node:\n  image: node\n  before_script:\n    - !reference [.install, script]\n    - npm run lint\ntest:\n  extends: .node\n  script: [npm test]\n",
        );
        expand_all(&ParseContext::root(), &mut doc).unwrap();

        let job = doc.get("test").unwrap();
        assert_eq!(job.get("before_script"), yaml("s: [npm ci, npm run lint]").get("s"));
        assert_eq!(job.get("image"), yaml("i: {name: node}").get("i"));
        assert_eq!(job.get("script"), yaml("s: [npm test]").get("s"));
    }
}
