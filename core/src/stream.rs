//! Agent output capture.
//!
//! Each pipe is framed into lines by [`AgentLineCodec`] and exposed as a lazy
//! [`Stream`] of [`OutputItem`]s. Invalid UTF-8 never ends a stream: the offending line is
//! replaced by a warning describing what was dropped.

use crate::logs::LogLevel;
use crate::secrets::mask_sensitive_data;
use async_stream::stream;
use bytes::BytesMut;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use tokio::io::AsyncRead;
use tokio_util::codec::{Decoder, FramedRead};

/// Longest line kept in one piece; longer output is split.
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

const LOAD_PROGRESS_MARKER: &str = "llm_load_progress:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamOrigin {
    Stdout,
    Stderr,
}

impl fmt::Display for StreamOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamOrigin::Stdout => write!(f, "stdout"),
            StreamOrigin::Stderr => write!(f, "stderr"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadingPhase {
    Loading,
    Downloading,
}

/// Model load progress, 0 to 100.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadingProgress {
    pub percent: f32,
    pub phase: LoadingPhase,
}

impl LoadingProgress {
    /// From a 0..1 fraction as reported by the agent.
    pub fn from_fraction(fraction: f64, phase: LoadingPhase) -> Self {
        Self {
            percent: (fraction * 100.0).clamp(0.0, 100.0) as f32,
            phase,
        }
    }
}

/// Parse a progress report out of a captured line.
///
/// Recognizes `llm_load_progress: <fraction>` and tqdm-style `Loading ... 42%` or
/// `Downloading ... 42%` bars.
pub fn parse_loading_progress(line: &str) -> Option<LoadingProgress> {
    if let Some(idx) = line.find(LOAD_PROGRESS_MARKER) {
        let value = line[idx + LOAD_PROGRESS_MARKER.len()..].trim();
        if let Ok(fraction) = value.parse::<f64>() {
            return Some(LoadingProgress::from_fraction(fraction, LoadingPhase::Loading));
        }
    }

    let phase = if line.contains("Downloading") {
        LoadingPhase::Downloading
    } else if line.contains("Loading") {
        LoadingPhase::Loading
    } else {
        return None;
    };

    let pct_idx = line.find('%')?;
    let before = &line[..pct_idx];
    let digits = before
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .count();
    let percent = before[before.len() - digits..].parse::<f32>().ok()?;

    Some(LoadingProgress {
        percent: percent.clamp(0.0, 100.0),
        phase,
    })
}

/// A framed line before decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawLine {
    Text(String),
    /// Line dropped for invalid UTF-8; holds its byte length
    Malformed(usize),
}

/// Newline framing that tolerates invalid UTF-8 and `\r\n` endings.
#[derive(Debug)]
pub struct AgentLineCodec {
    next_index: usize,
    max_length: usize,
}

impl AgentLineCodec {
    pub fn new() -> Self {
        Self::with_max_length(MAX_LINE_LENGTH)
    }

    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            next_index: 0,
            max_length: max_length.max(1),
        }
    }

    fn finish(mut line: BytesMut) -> RawLine {
        if line.last() == Some(&b'\r') {
            line.truncate(line.len() - 1);
        }
        match String::from_utf8(line.to_vec()) {
            Ok(text) => RawLine::Text(text),
            Err(_) => RawLine::Malformed(line.len()),
        }
    }
}

/// Length of `bytes` without a trailing, incomplete UTF-8 sequence.
///
/// Invalid bytes earlier in the chunk leave it whole; that line is malformed either way.
fn char_boundary_before(bytes: &[u8]) -> usize {
    match std::str::from_utf8(bytes) {
        Err(e) if e.error_len().is_none() && e.valid_up_to() > 0 => e.valid_up_to(),
        _ => bytes.len(),
    }
}

impl Default for AgentLineCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for AgentLineCodec {
    type Item = RawLine;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let newline = src[self.next_index..].iter().position(|b| *b == b'\n');

        match newline {
            Some(offset) => {
                let idx = self.next_index + offset;
                self.next_index = 0;
                let mut line = src.split_to(idx + 1);
                line.truncate(idx);
                Ok(Some(Self::finish(line)))
            }
            None if src.len() >= self.max_length => {
                self.next_index = 0;
                let cut = char_boundary_before(&src[..self.max_length]);
                let line = src.split_to(cut);
                Ok(Some(Self::finish(line)))
            }
            None => {
                self.next_index = src.len();
                Ok(None)
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(line) = self.decode(src)? {
            return Ok(Some(line));
        }
        self.next_index = 0;
        if src.is_empty() {
            Ok(None)
        } else {
            let len = src.len();
            Ok(Some(Self::finish(src.split_to(len))))
        }
    }
}

/// One captured line, classified and redacted.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputLine {
    pub origin: StreamOrigin,
    pub level: LogLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum OutputItem {
    Line(OutputLine),
    /// Emitted when the whole-number percent changes
    Progress(LoadingProgress),
}

/// Lazy sequence of lines from one agent pipe. Ends when the pipe closes.
pub fn output_lines<R>(reader: R, origin: StreamOrigin) -> impl Stream<Item = OutputItem> + Send
where
    R: AsyncRead + Unpin + Send + 'static,
{
    stream! {
        let mut frames = FramedRead::new(reader, AgentLineCodec::new());
        let mut last_percent: Option<i32> = None;

        while let Some(frame) = frames.next().await {
            match frame {
                Ok(RawLine::Text(text)) => {
                    let text = text.trim_end();
                    if text.trim().is_empty() {
                        continue;
                    }

                    if let Some(progress) = parse_loading_progress(text) {
                        let percent = progress.percent as i32;
                        if last_percent != Some(percent) {
                            last_percent = Some(percent);
                            yield OutputItem::Progress(progress);
                        }
                        continue;
                    }

                    yield OutputItem::Line(OutputLine {
                        origin,
                        level: LogLevel::from_line(text),
                        message: mask_sensitive_data(text),
                    });
                }
                Ok(RawLine::Malformed(len)) => {
                    yield OutputItem::Line(OutputLine {
                        origin,
                        level: LogLevel::Warning,
                        message: format!(
                            "Dropped {} bytes of invalid UTF-8 from agent {}",
                            len, origin
                        ),
                    });
                }
                Err(e) => {
                    yield OutputItem::Line(OutputLine {
                        origin,
                        level: LogLevel::Error,
                        message: format!("Failed to read agent {}: {}", origin, e),
                    });
                    break;
                }
            }
        }
    }
}

/// Both pipes merged. Per-pipe order is kept; the two pipes interleave freely.
pub fn agent_output<O, E>(stdout: O, stderr: E) -> impl Stream<Item = OutputItem> + Send
where
    O: AsyncRead + Unpin + Send + 'static,
    E: AsyncRead + Unpin + Send + 'static,
{
    futures::stream::select(
        output_lines(stdout, StreamOrigin::Stdout),
        output_lines(stderr, StreamOrigin::Stderr),
    )
}
