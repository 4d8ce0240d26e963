use owo_colors::{OwoColorize, Style};
use std::sync::OnceLock;

static COLORS: OnceLock<bool> = OnceLock::new();

/// What a piece of CLI output stands for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tone {
    Heading,
    Good,
    Bad,
    Caution,
    Faint,
    /// Registry rows past their TTL
    Expired,
}

impl Tone {
    fn style(self) -> Style {
        match self {
            Tone::Heading => Style::new().cyan().bold(),
            Tone::Good => Style::new().green().bold(),
            Tone::Bad => Style::new().red().bold(),
            Tone::Caution => Style::new().yellow().bold(),
            Tone::Faint => Style::new().white().dimmed(),
            Tone::Expired => Style::new().bright_black().strikethrough(),
        }
    }
}

/// Colors only when stdout is a terminal that accepts them
fn colors() -> bool {
    *COLORS.get_or_init(|| console::Term::stdout().is_term() && console::colors_enabled())
}

pub fn paint(tone: Tone, text: &str) -> String {
    render(tone, text, colors())
}

fn render(tone: Tone, text: &str, colors: bool) -> String {
    if colors {
        text.style(tone.style()).to_string()
    } else {
        text.to_string()
    }
}
