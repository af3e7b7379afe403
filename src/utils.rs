use std::sync::OnceLock;

use indexmap::IndexMap;
use regex::{Captures, Regex};

use crate::parser::context::Variables;
use crate::parser::value::Value;

fn variable_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\$\{?(\w*)\}?").expect("valid regex"))
}

/// Substitutes `$NAME` and `${NAME}` in `text`; unknown names become empty.
pub fn expand_str(text: &str, variables: &Variables) -> String {
    variable_pattern()
        .replace_all(text, |caps: &Captures| {
            variables
                .get(&caps[1])
                .cloned()
                .unwrap_or_default()
        })
        .into_owned()
}

/// Like [`expand_str`], passing non-string values through unchanged.
pub fn expand_text(value: &Value, variables: &Variables) -> Value {
    match value {
        Value::String(text) => Value::String(expand_str(text, variables)),
        other => other.clone(),
    }
}

pub fn expand_variables(
    variables: &IndexMap<String, String>,
    envs: &Variables,
) -> IndexMap<String, String> {
    variables
        .iter()
        .map(|(key, value)| (key.clone(), expand_str(value, envs)))
        .collect()
}

/// Cache-relative path of a downloaded URL: the URL without its scheme.
pub fn fs_url(url: &str) -> &str {
    url.strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .unwrap_or(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Variables {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn test_expand_without_brackets() {
        assert_eq!(expand_str("$VAR", &vars(&[("VAR", "success")])), "success");
        assert_eq!(expand_str("$VAR", &vars(&[("OTHER", "x")])), "");
    }

    #[test]
    fn test_expand_with_brackets() {
        assert_eq!(expand_str("${VAR}", &vars(&[("VAR", "success")])), "success");
        assert_eq!(expand_str("${VAR}", &vars(&[("UNSET_VAR", "success")])), "");
    }

    #[test]
    fn test_expand_passes_non_strings_through() {
        assert_eq!(expand_text(&Value::Null, &Variables::new()), Value::Null);
        assert_eq!(
            expand_text(&Value::Bool(true), &Variables::new()),
            Value::Bool(true)
        );
        assert_eq!(
            expand_text(&Value::from("$VAR"), &vars(&[("VAR", "success")])),
            Value::from("success")
        );
    }

    #[test]
    fn test_expand_variables() {
        let variables: IndexMap<String, String> = [
            ("APP_ENV".to_string(), "$GITLAB_USER_LOGIN".to_string()),
            (
                "HOSTNAME".to_string(),
                "${GITLAB_USER_LOGIN}-stage.domain.com".to_string(),
            ),
        ]
        .into_iter()
        .collect();

        let expanded = expand_variables(&variables, &vars(&[("GITLAB_USER_LOGIN", "mjn")]));
        assert_eq!(expanded["APP_ENV"], "mjn");
        assert_eq!(expanded["HOSTNAME"], "mjn-stage.domain.com");

        let expanded = expand_variables(&variables, &vars(&[("NOT_GITLAB_USER_LOGIN", "mjn")]));
        assert_eq!(expanded["APP_ENV"], "");
        assert_eq!(expanded["HOSTNAME"], "-stage.domain.com");
    }

    #[test]
    fn test_fs_url() {
        assert_eq!(
            fs_url("https://gitlab.com/group/project/-/raw/main/ci.yml"),
            "gitlab.com/group/project/-/raw/main/ci.yml"
        );
        assert_eq!(fs_url("http://example.com/a.yml"), "example.com/a.yml");
    }
}
