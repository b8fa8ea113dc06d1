// Rendering for command results and streamed push events.
//
// Terminal stdout gets human text; anything else gets one JSON object per
// line. `--json` forces JSON. Errors always go to stderr.

use serde::Serialize;
use serde_json::Value;
use std::io::{self, IsTerminal, Write};

const ANSI_RED: &str = "\x1b[31m";
const ANSI_RESET: &str = "\x1b[0m";

/// Width of the event tag column in human event lines.
const EVENT_TAG_WIDTH: usize = 22;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Human,
    /// JSON lines.
    Json,
}

impl OutputFormat {
    pub fn detect(json_flag: bool) -> Self {
        Self::resolve(json_flag, io::stdout().is_terminal())
    }

    fn resolve(json_flag: bool, stdout_is_tty: bool) -> Self {
        if json_flag || !stdout_is_tty {
            Self::Json
        } else {
            Self::Human
        }
    }
}

// ── Command results ─────────────────────────────────────────────────

pub fn print_output<T, F>(format: OutputFormat, value: &T, human_fn: F) -> io::Result<()>
where
    T: Serialize,
    F: FnOnce(&T) -> String,
{
    write_output(&mut io::stdout().lock(), format, value, human_fn)
}

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
        OutputFormat::Human => writeln!(writer, "{}", human_fn(value)),
        OutputFormat::Json => write_json_line(writer, value),
    }
}

fn write_json_line<W: Write, T: Serialize>(writer: &mut W, value: &T) -> io::Result<()> {
    serde_json::to_writer(&mut *writer, value).map_err(io::Error::other)?;
    writeln!(writer)
}

// ── Push events ─────────────────────────────────────────────────────

/// JSON form mirrors the inbound envelope.
#[derive(Serialize)]
struct EventLine<'a> {
    #[serde(rename = "type")]
    event_type: &'a str,
    data: &'a Value,
}

/// Print one push event as it arrives. Stdout is flushed per event so
/// piped consumers see it immediately.
pub fn print_event(format: OutputFormat, event_type: &str, data: &Value) -> io::Result<()> {
    let mut out = io::stdout().lock();
    write_event(&mut out, format, event_type, data)?;
    out.flush()
}

pub fn write_event<W: Write>(
    writer: &mut W,
    format: OutputFormat,
    event_type: &str,
    data: &Value,
) -> io::Result<()> {
    match format {
        OutputFormat::Human => {
            writeln!(writer, "{event_type:<width$} {data}", width = EVENT_TAG_WIDTH)
        }
        OutputFormat::Json => write_json_line(writer, &EventLine { event_type, data }),
    }
}

// ── Errors ──────────────────────────────────────────────────────────

pub fn print_error(format: OutputFormat, code: &str, message: &str) {
    let mut err = io::stderr().lock();
    let _ = write_error(&mut err, format, code, message, io::stderr().is_terminal());
}

fn write_error<W: Write>(
    writer: &mut W,
    format: OutputFormat,
    code: &str,
    message: &str,
    stderr_is_tty: bool,
) -> io::Result<()> {
    match format {
        OutputFormat::Human if stderr_is_tty => {
            writeln!(writer, "{ANSI_RED}error:{ANSI_RESET} {message}")
        }
        OutputFormat::Human => writeln!(writer, "error: {message}"),
        OutputFormat::Json => write_json_line(
            writer,
            &serde_json::json!({ "error": { "code": code, "message": message } }),
        ),
    }
}
