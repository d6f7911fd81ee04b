//! Styling for plugin command output.

use std::fmt::Display;

use colored::{ColoredString, Colorize};

const RULE_WIDTH: usize = 50;

/// Output styles of the plugin commands.
pub(crate) struct Theme;

fn marked(marker: ColoredString, text: impl Display) -> String {
    format!("{marker} {text}")
}

impl Theme {
    pub(crate) fn header(text: &str) -> String {
        text.bold().cyan().to_string()
    }

    pub(crate) fn separator() -> String {
        "─".repeat(RULE_WIDTH).dimmed().to_string()
    }

    pub(crate) fn dimmed(text: &str) -> String {
        text.dimmed().to_string()
    }

    /// A completed lifecycle step.
    pub(crate) fn success(text: &str) -> String {
        marked("ok".green().bold(), text)
    }

    /// A plugin that could not be processed.
    pub(crate) fn error(text: &str) -> String {
        marked("failed".red().bold(), text.red())
    }

    pub(crate) fn warning(text: &str) -> String {
        marked("warn".yellow().bold(), text.yellow())
    }

    pub(crate) fn info(text: &str) -> String {
        marked("--".blue(), text)
    }

    /// Column value for a plugin's enabled flag.
    pub(crate) fn state(enabled: bool) -> String {
        if enabled {
            "enabled".green().to_string()
        } else {
            "disabled".dimmed().to_string()
        }
    }
}
