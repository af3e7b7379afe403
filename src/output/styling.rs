use std::fmt::Display;

use console::{style, StyledObject};

/// Role of a piece of terminal text; every role has a single look.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tone {
    /// A parse failure
    Failure,
    /// The `… in <path>` trail under a failure
    Trail,
    /// A phase still running
    Pending,
    /// A phase that finished
    Done,
    /// Counts and other highlighted values
    Value,
    /// Project names
    Project,
    Label,
    Title,
}

impl Tone {
    pub fn paint(self, text: impl Display) -> StyledObject<String> {
        let styled = style(text.to_string());
        match self {
            Self::Failure => styled.bright().red(),
            Self::Trail => styled.yellow(),
            Self::Pending | Self::Value => styled.bright().yellow(),
            Self::Done => styled.bright().green(),
            Self::Project => styled.cyan(),
            Self::Label => styled.dim(),
            Self::Title => styled.magenta().bold(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tones_keep_text() {
        assert!(Tone::Label.paint("Jobs:").to_string().contains("Jobs:"));
        assert!(Tone::Value.paint(3).to_string().contains('3'));
    }

    #[test]
    fn test_failure_and_done_look_different() {
        let failure = Tone::Failure.paint("x").force_styling(true).to_string();
        let done = Tone::Done.paint("x").force_styling(true).to_string();
        assert_ne!(failure, done);
        assert_ne!(failure, "x");
    }
}
