use anyhow::Result;
use std::io::Write;

use crate::parser::Parser;

/// Writes the fully expanded pipeline document as YAML.
///
/// Every include, `extends`, `!reference` and default has been applied, so
/// the result can be read without knowing any of those mechanisms.
pub fn export_preview(parser: &Parser, output: &mut dyn Write) -> Result<()> {
    let yaml = serde_yaml::to_string(parser.gitlab_data())?;
    write!(output, "{yaml}")?;
    Ok(())
}

/// Writes the resolved jobs, keyed by name, as JSON.
pub fn export_json(parser: &Parser, pretty: bool, output: &mut dyn Write) -> Result<()> {
    let json = if pretty {
        serde_json::to_string_pretty(parser.jobs())?
    } else {
        serde_json::to_string(parser.jobs())?
    };
    writeln!(output, "{}", json)?;
    Ok(())
}
