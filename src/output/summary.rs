use std::fmt::Write;

use comfy_table::{Cell, Color as TableColor};

use crate::job::When;
use crate::parser::Parser;

use super::styling::Tone;
use super::tables::{allow_failure_cell, create_table, when_cell};

/// Prints the resolved jobs of a pipeline to stdout, grouped by stage.
pub fn print_job_list(parser: &Parser) {
    println!("{}", render_job_list(parser));
}

fn create_cyan_header(labels: &[&str]) -> Vec<Cell> {
    labels
        .iter()
        .map(|label| Cell::new(*label).fg(TableColor::Cyan))
        .collect()
}

/// Renders the job table.
///
/// Jobs follow stage order, then document order within a stage. Jobs whose
/// rules resolved to `never` are listed but counted separately.
pub fn render_job_list(parser: &Parser) -> String {
    let mut output = String::new();
    let jobs = parser.jobs();

    let skipped = jobs.values().filter(|job| job.when == When::Never).count();
    let _ = writeln!(
        output,
        "  {} {}\n  {} {}\n  {} {}\n",
        Tone::Label.paint("Project:"),
        Tone::Project.paint(parser.git_data().project_path()),
        Tone::Label.paint("Jobs:"),
        Tone::Value.paint(jobs.len() - skipped),
        Tone::Label.paint("Skipped by rules:"),
        Tone::Value.paint(skipped),
    );

    if jobs.is_empty() {
        let _ = writeln!(output, "{}", Tone::Value.paint("No jobs found."));
        return output;
    }

    let mut table = create_table();
    table.set_header(create_cyan_header(&[
        "Name",
        "Stage",
        "When",
        "Allow Failure",
        "Needs",
        "Description",
    ]));

    for stage in parser.stages() {
        for job in jobs.values().filter(|job| &job.stage == stage) {
            let needs = job
                .needs
                .as_ref()
                .map(|needs| needs.join("\n"))
                .unwrap_or_default();
            table.add_row(vec![
                Cell::new(format!("{:width$}", job.name, width = parser.job_name_pad())),
                Cell::new(&job.stage),
                when_cell(job.when),
                allow_failure_cell(job.allow_failure),
                Cell::new(needs),
                Cell::new(job.description.as_deref().unwrap_or("")),
            ]);
        }
    }

    let _ = writeln!(output, "{table}");
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git_data::GitData;
    use crate::parser::loader::parse_document;
    use crate::parser::ParserOptions;

    fn parse(text: &str) -> Parser {
        let document = parse_document(text).unwrap();
        Parser::from_document(document, GitData::default(), &ParserOptions::default()).unwrap()
    }

    #[test]
    fn test_render_job_list_empty_pipeline() {
        let parser = parse("stages: [build]\n");
        let output = render_job_list(&parser);
        assert!(output.contains("No jobs found."));
    }

    #[test]
    fn test_render_job_list_follows_stage_order() {
        let parser = parse(
            "stages: [build, test]\n\
             unit:\n  stage: test\n  script: [cargo test]\n\
             compile:\n  stage: build\n  script: [cargo build]\n",
        );
        let output = render_job_list(&parser);

        let compile = output.find("compile").unwrap();
        let unit = output.find("unit").unwrap();
        assert!(compile < unit);
        assert!(output.contains("on_success"));
    }

    #[test]
    fn test_render_job_list_shows_rule_outcome() {
        let parser = parse(
            "stages: [test]\n\
             nightly:\n  script: [x]\n  rules:\n    - if: $SCHEDULE\n\
             release:\n  script: [x]\n  when: manual\n  needs: [nightly]\n",
        );
        let output = render_job_list(&parser);

        assert!(output.contains("never"));
        assert!(output.contains("manual"));
        assert!(output.contains("true"));
        assert!(output.contains("Skipped by rules:"));
    }
}
