mod exports;
mod progress;
pub(crate) mod styling;
mod summary;
mod tables;

pub use exports::{export_json, export_preview};
pub use progress::ParseProgress;
pub use styling::Tone;
pub use summary::{print_job_list, render_job_list};

/// Prints the `gitlab-ci-local` banner to stderr.
pub fn print_banner() {
    eprintln!(
        r"
{} {}
  {}
",
        Tone::Title.paint("gitlab-ci-local"),
        Tone::Label.paint(env!("CARGO_PKG_VERSION")),
        Tone::Label.paint("Resolve GitLab CI pipelines locally")
    );
}
