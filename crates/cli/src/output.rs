// Output format auto-detection for the CLI.
//
// TTY → human-readable text. Piped/redirected → structured JSON.
// `--json` flag forces JSON output regardless of terminal.

use serde::Serialize;
use std::io::{self, IsTerminal, Write};

const ANSI_RED: &str = "\x1b[31m";
const ANSI_YELLOW: &str = "\x1b[33m";
const ANSI_RESET: &str = "\x1b[0m";

/// Output format for CLI commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable text (tables, colors, etc.).
    Human,
    /// Machine-readable JSON (one object per response).
    Json,
}

impl OutputFormat {
    /// Auto-detect format: JSON if `--json` was passed or stdout is not a TTY.
    pub fn detect(json_flag: bool) -> Self {
        if json_flag {
            return Self::Json;
        }
        Self::detect_from_terminal(io::stdout().is_terminal())
    }

    /// Testable variant that takes an explicit `is_tty` flag.
    pub fn detect_from_terminal(is_tty: bool) -> Self {
        if is_tty {
            Self::Human
        } else {
            Self::Json
        }
    }
}

/// Write a value to stdout in the selected format.
///
/// - `Human`: calls `human_fn` to produce a human-readable string.
/// - `Json`: serializes `value` as JSON.
pub fn print_output<T, F>(format: OutputFormat, value: &T, human_fn: F) -> io::Result<()>
where
    T: Serialize,
    F: FnOnce(&T) -> String,
{
    let mut out = io::stdout().lock();
    match format {
        OutputFormat::Human => {
            writeln!(out, "{}", human_fn(value))
        }
        OutputFormat::Json => {
            serde_json::to_writer(&mut out, value).map_err(io::Error::other)?;
            writeln!(out)
        }
    }
}

/// Write a value to a provided writer (useful for testing).
pub fn write_output<W, T, F>(
    writer: &mut W,
    format: OutputFormat,
    value: &T,
    human_fn: F,
) -> io::Result<()>
where
    W: Write,
    T: Serialize,
    F: FnOnce(&T) -> String,
{
    match format {
        OutputFormat::Human => {
            writeln!(writer, "{}", human_fn(value))
        }
        OutputFormat::Json => {
            serde_json::to_writer(&mut *writer, value).map_err(io::Error::other)?;
            writeln!(writer)
        }
    }
}

/// Write an error to stderr in the selected format.
pub fn print_error(format: OutputFormat, code: &str, message: &str) {
    let mut err = io::stderr().lock();
    match format {
        OutputFormat::Human => {
            let line =
                render_human_stderr_line("error", message, io::stderr().is_terminal(), ANSI_RED);
            let _ = writeln!(err, "{line}");
        }
        OutputFormat::Json => {
            let obj = serde_json::json!({
                "error": {
                    "code": code,
                    "message": message,
                }
            });
            let _ = serde_json::to_writer(&mut err, &obj);
            let _ = writeln!(err);
        }
    }
}

/// Write a warning to stderr in the selected format.
pub fn print_warning(format: OutputFormat, code: &str, message: &str) {
    let mut err = io::stderr().lock();
    match format {
        OutputFormat::Human => {
            let line = render_human_stderr_line(
                "warning",
                message,
                io::stderr().is_terminal(),
                ANSI_YELLOW,
            );
            let _ = writeln!(err, "{line}");
        }
        OutputFormat::Json => {
            let obj = serde_json::json!({
                "warning": {
                    "code": code,
                    "message": message,
                }
            });
            let _ = serde_json::to_writer(&mut err, &obj);
            let _ = writeln!(err);
        }
    }
}

/// Print a mapped, actionable error for a command failure.
pub fn print_anyhow_error(format: OutputFormat, error: &anyhow::Error) {
    let (code, message) = actionable_error(error);
    print_error(format, code, &message);
}

fn actionable_error(error: &anyhow::Error) -> (&'static str, String) {
    let message = format!("{error:#}");
    let lower = message.to_ascii_lowercase();

    if lower.contains("relay url") || lower.contains("relay_url") {
        return (
            "INVALID_RELAY_URL",
            format!("{message}. Use a ws:// or wss:// URL via --relay or TANDEM_RELAY_URL"),
        );
    }

    if lower.contains("timed out") {
        return (
            "NETWORK_TIMEOUT",
            "Timed out waiting for the relay. Check it is running: tandem-relay".to_string(),
        );
    }

    if lower.contains("connection refused") || lower.contains("failed to connect") {
        return (
            "RELAY_UNREACHABLE",
            "Relay is not reachable. Start it with: tandem-relay (or pass --relay)".to_string(),
        );
    }

    if lower.contains("config") && (lower.contains("parse") || lower.contains("i/o")) {
        let path = extract_quoted_path(&message).unwrap_or_else(|| "~/.tandem/config.toml".into());
        return ("CONFIG_ERROR", format!("Could not read configuration at {path}: {message}"));
    }

    if lower.contains("no such file") || lower.contains("not found") {
        let path = extract_quoted_path(&message).unwrap_or_else(|| "<file>".to_string());
        return ("FILE_NOT_FOUND", format!("File {path} not found"));
    }

    ("ERROR", message)
}

fn render_human_stderr_line(label: &str, message: &str, is_tty: bool, color: &str) -> String {
    if is_tty {
        format!("{color}{label}:{ANSI_RESET} {message}")
    } else {
        format!("{label}: {message}")
    }
}

fn extract_quoted_path(message: &str) -> Option<String> {
    let mut parts = message.split('`');
    let _before = parts.next()?;
    let candidate = parts.next()?.trim();
    if candidate.is_empty() {
        None
    } else {
        Some(candidate.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize)]
    struct Peer {
        user_id: String,
        label: String,
    }

    fn peer() -> Peer {
        Peer { user_id: "u1".into(), label: "Ada".into() }
    }

    #[test]
    fn detect_from_terminal_picks_human_for_tty_and_json_for_pipes() {
        assert_eq!(OutputFormat::detect_from_terminal(true), OutputFormat::Human);
        assert_eq!(OutputFormat::detect_from_terminal(false), OutputFormat::Json);
    }

    #[test]
    fn json_flag_forces_json() {
        assert_eq!(OutputFormat::detect(true), OutputFormat::Json);
    }

    #[test]
    fn write_output_human_uses_formatter() {
        let mut buf = Vec::new();
        write_output(&mut buf, OutputFormat::Human, &peer(), |p| format!("{} ({})", p.label, p.user_id))
            .unwrap();
        assert_eq!(String::from_utf8(buf).unwrap(), "Ada (u1)\n");
    }

    #[test]
    fn write_output_json_is_one_line_and_skips_formatter() {
        let mut buf = Vec::new();
        write_output(&mut buf, OutputFormat::Json, &peer(), |_| {
            unreachable!("human formatter should not run in JSON mode")
        })
        .unwrap();
        let output = String::from_utf8(buf).unwrap();
        assert_eq!(output.matches('\n').count(), 1);
        let parsed: serde_json::Value = serde_json::from_str(output.trim()).unwrap();
        assert_eq!(parsed["label"], "Ada");
    }

    #[test]
    fn stderr_writers_do_not_panic() {
        print_error(OutputFormat::Human, "TEST_ERR", "something broke");
        print_error(OutputFormat::Json, "TEST_ERR", "something broke");
        print_warning(OutputFormat::Json, "WARN", "heads up");
    }

    #[test]
    fn render_human_error_uses_color_for_tty() {
        let line = render_human_stderr_line("error", "boom", true, ANSI_RED);
        assert!(line.contains(ANSI_RED));
        assert!(line.contains(ANSI_RESET));
        assert!(line.contains("boom"));
    }

    #[test]
    fn render_human_warning_without_tty_is_plain() {
        let line = render_human_stderr_line("warning", "careful", false, ANSI_YELLOW);
        assert_eq!(line, "warning: careful");
    }

    // ── actionable_error ───────────────────────────────────────────

    #[test]
    fn refused_connection_points_at_relay() {
        let err = anyhow::anyhow!("failed to connect to relay: Connection refused (os error 111)");
        let (code, message) = actionable_error(&err);
        assert_eq!(code, "RELAY_UNREACHABLE");
        assert!(message.contains("tandem-relay"));
    }

    #[test]
    fn timeout_is_network_timeout() {
        let err = anyhow::anyhow!("timed out waiting for the active user list");
        let (code, _) = actionable_error(&err);
        assert_eq!(code, "NETWORK_TIMEOUT");
    }

    #[test]
    fn bad_relay_url_suggests_scheme() {
        let err = anyhow::anyhow!("invalid relay URL `http://x`");
        let (code, message) = actionable_error(&err);
        assert_eq!(code, "INVALID_RELAY_URL");
        assert!(message.contains("ws://"));
    }

    #[test]
    fn missing_file_names_the_path() {
        let err = anyhow::anyhow!("failed to read `notes/a.txt`: No such file or directory");
        let (code, message) = actionable_error(&err);
        assert_eq!(code, "FILE_NOT_FOUND");
        assert!(message.contains("notes/a.txt"));
    }

    #[test]
    fn unrecognized_errors_pass_through() {
        let err = anyhow::anyhow!("something odd");
        assert_eq!(actionable_error(&err), ("ERROR", "something odd".to_string()));
    }
}
