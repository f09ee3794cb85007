//! Output transformation for supervised runs.
//!
//! Lines captured from the remote process arrive as a single interleaved,
//! arrival-ordered stream. The transform is a stateless 1:1 mapping into
//! either the verbatim text (`Raw`) or one self-describing JSON record per
//! line (`Json`). Lines are never reordered, batched or dropped, and every
//! rendered line is flushed as soon as it is available so output can be
//! tailed live.

use std::io::{self, Write};
use std::str::FromStr;

use serde::Serialize;

use crate::error::Error;

/// Which remote stream a line arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// One line captured from the remote process.
///
/// `sequence` is assigned on arrival and increases monotonically across both
/// streams: it reflects interleaved arrival order, not per-stream order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutputLine {
    pub stream: StreamKind,
    pub sequence: u64,
    pub text: String,
}

/// Output rendering selected for one supervised run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    /// Pass the captured text through verbatim.
    #[default]
    Raw,
    /// One JSON object per line: `{"stream":…,"sequence":…,"text":…}`.
    Json,
}

impl FromStr for OutputFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "" => Ok(OutputFormat::Raw),
            "json" => Ok(OutputFormat::Json),
            other => Err(Error::Validation(format!(
                "unsupported log format {other:?} (expected \"\" or \"json\")"
            ))),
        }
    }
}

/// Render one line for the selected format.
pub fn render(line: &OutputLine, format: OutputFormat) -> String {
    match format {
        OutputFormat::Raw => line.text.clone(),
        OutputFormat::Json => {
            serde_json::to_string(line).expect("OutputLine always serializes")
        }
    }
}

/// Destination for rendered lines.
///
/// The supervisor writes every line through this the moment it arrives.
/// Implementations must flush per line.
pub trait LineSink: Send {
    fn write_line(&mut self, line: &OutputLine, rendered: &str) -> io::Result<()>;
}

/// The production sink: raw stdout lines go to stdout, raw stderr lines to
/// stderr, JSON records always to stdout.
#[derive(Debug, Clone, Copy)]
pub struct StandardStreams {
    format: OutputFormat,
}

impl StandardStreams {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }
}

impl LineSink for StandardStreams {
    fn write_line(&mut self, line: &OutputLine, rendered: &str) -> io::Result<()> {
        match (self.format, line.stream) {
            (OutputFormat::Raw, StreamKind::Stderr) => {
                let mut err = io::stderr().lock();
                writeln!(err, "{rendered}")?;
                err.flush()
            }
            _ => {
                let mut out = io::stdout().lock();
                writeln!(out, "{rendered}")?;
                out.flush()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(stream: StreamKind, sequence: u64, text: &str) -> OutputLine {
        OutputLine {
            stream,
            sequence,
            text: text.to_string(),
        }
    }

    #[test]
    fn raw_render_is_the_verbatim_text() {
        let rendered = render(&line(StreamKind::Stdout, 3, "hello  world"), OutputFormat::Raw);
        assert_eq!(rendered, "hello  world");
    }

    #[test]
    fn json_render_is_one_self_describing_record() {
        let rendered = render(&line(StreamKind::Stderr, 7, "boom"), OutputFormat::Json);
        assert_eq!(rendered, r#"{"stream":"stderr","sequence":7,"text":"boom"}"#);
    }

    #[test]
    fn format_parses_the_two_supported_selectors() {
        assert_eq!("".parse::<OutputFormat>().unwrap(), OutputFormat::Raw);
        assert_eq!("json".parse::<OutputFormat>().unwrap(), OutputFormat::Json);
        assert!(matches!(
            "xml".parse::<OutputFormat>(),
            Err(Error::Validation(_))
        ));
    }
}
