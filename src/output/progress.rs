use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};

use super::styling::Tone;

/// Spinner shown while includes are fetched and the pipeline is expanded.
pub struct ParseProgress {
    pb: ProgressBar,
}

impl ParseProgress {
    pub fn start(file: &str) -> Self {
        let pb = create_spinner(Tone::Pending.paint(format!("Resolving {file}")).to_string());
        Self { pb }
    }

    pub fn finish(self, jobs: usize) {
        self.pb
            .finish_with_message(Tone::Done.paint(format!("Resolved {jobs} jobs ✓")).to_string());
        eprintln!();
    }

    pub fn fail(self) {
        self.pb
            .abandon_with_message(Tone::Failure.paint("Pipeline could not be resolved ✗").to_string());
        eprintln!();
    }
}

fn create_spinner(message: String) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_draw_target(ProgressDrawTarget::stderr());
    if let Ok(style) = ProgressStyle::default_spinner().template("  {msg} {spinner}") {
        pb.set_style(style);
    }
    pb.set_message(message);
    pb.enable_steady_tick(std::time::Duration::from_millis(100));
    pb
}
