//! Status messages for the CLI
//!
//! Everything goes to stderr: in slave mode stdout is the transport, and in
//! master mode it is the remote terminal's screen.

use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};

/// Print an error message
pub fn print_error(msg: &str) {
    print_styled(Color::Red, "✗ ", msg);
}

/// Print a warning message
pub fn print_warning(msg: &str) {
    print_styled(Color::Yellow, "⚠ ", msg);
}

/// Print an informational message
pub fn print_info(msg: &str) {
    print_styled(Color::Cyan, "ℹ ", msg);
}

fn print_styled(color: Color, marker: &str, msg: &str) {
    let mut stderr = std::io::stderr();
    let _ = crossterm::execute!(
        stderr,
        SetForegroundColor(color),
        Print(marker),
        ResetColor,
        Print(msg),
        Print("\r\n")
    );
}
