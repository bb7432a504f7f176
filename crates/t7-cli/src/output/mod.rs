//! Output formatting utilities for the CLI
//!
//! Colored status lines on stdout/stderr and human-readable renderings of
//! session outcomes.

use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};
use t7_core::{Failure, SessionState};
use t7_protocol::{ChannelId, Marker};

/// Describe how a boarding attempt ended
///
/// # Returns
/// The state, followed by the failure reason when there is one, e.g.
/// `"failed (Timeout)"`.
pub fn format_outcome(state: SessionState, failure: Option<Failure>) -> String {
    match failure {
        Some(failure) => format!("{} ({})", state, failure),
        None => state.to_string(),
    }
}

/// Hint printed after a detach, telling the user how to resume
pub fn format_resume_hint(target: &str, marker: Marker, channel: ChannelId) -> String {
    format!(
        "t7 connect {} --marker {} --pane {}",
        target,
        marker,
        channel.as_u32()
    )
}

fn print_colored(to_stderr: bool, color: Color, prefix: &str, msg: &str) {
    if to_stderr {
        let mut stderr = std::io::stderr();
        let _ = crossterm::execute!(
            stderr,
            SetForegroundColor(color),
            Print(prefix),
            ResetColor,
            Print(msg),
            Print("\r\n")
        );
    } else {
        let mut stdout = std::io::stdout();
        let _ = crossterm::execute!(
            stdout,
            SetForegroundColor(color),
            Print(prefix),
            ResetColor,
            Print(msg),
            Print("\r\n")
        );
    }
}

/// Print a success message in green with a checkmark prefix
///
/// Lines end in `\r\n` so they render correctly while the terminal is in
/// raw mode.
pub fn print_success(msg: &str) {
    print_colored(false, Color::Green, "✓ ", msg);
}

/// Print an error message in red to stderr
pub fn print_error(msg: &str) {
    print_colored(true, Color::Red, "✗ ", msg);
}

/// Print a warning message in yellow to stderr
pub fn print_warning(msg: &str) {
    print_colored(true, Color::Yellow, "⚠ ", msg);
}

/// Print an informational message in cyan
pub fn print_info(msg: &str) {
    print_colored(false, Color::Cyan, "ℹ ", msg);
}
