//! SRT-style parsing and serialization.
//!
//! Blocks are split on blank lines, the leading index line is optional, and
//! cues with malformed timecodes are skipped with a warning rather than
//! failing the whole file.

use once_cell::sync::Lazy;
use regex::Regex;

use super::{Cue, Subtitle};

static TIME_RANGE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(\d{2}):(\d{2}):(\d{2}),(\d{3})\s*-->\s*(\d{2}):(\d{2}):(\d{2}),(\d{3})").unwrap()
});

static BLANK_LINE_SPLIT: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n[ \t]*\n+").unwrap());

/// Parse a widely-used timed subtitle format. Cue blocks are separated by
/// one or more blank lines; each block optionally begins with an integer
/// index line; malformed timecodes are skipped with a `tracing::warn!`.
pub fn parse(content: &str) -> Subtitle {
    let normalized = content.replace("\r\n", "\n");
    let mut cues = Vec::new();

    for block in split_blocks(&normalized) {
        let lines: Vec<&str> = block.lines().collect();
        if lines.is_empty() {
            continue;
        }

        let (time_line_idx, text_start_idx) = if lines[0].trim().parse::<u64>().is_ok() {
            (1usize, 2usize)
        } else {
            (0usize, 1usize)
        };

        let Some(time_line) = lines.get(time_line_idx) else {
            continue;
        };
        let Some(caps) = TIME_RANGE.captures(time_line) else {
            tracing::warn!(line = %time_line, "skipping cue with malformed timecode");
            continue;
        };

        let start = timecode_to_seconds(&caps, 1);
        let end = timecode_to_seconds(&caps, 5);
        let text = lines[text_start_idx.min(lines.len())..].join("\n");

        cues.push(Cue::new(start, end, text));
    }

    // Invariant: monotonically nondecreasing start across cues. Use a
    // stable sort so cues that already share a start time keep their
    // original relative order.
    cues.sort_by(|a, b| a.start.partial_cmp(&b.start).unwrap());

    Subtitle::new(cues)
}

fn split_blocks(content: &str) -> Vec<&str> {
    BLANK_LINE_SPLIT
        .split(content.trim())
        .map(str::trim)
        .filter(|b| !b.is_empty())
        .collect()
}

fn timecode_to_seconds(caps: &regex::Captures, group: usize) -> f64 {
    let h: f64 = caps[group].parse().unwrap_or(0.0);
    let m: f64 = caps[group + 1].parse().unwrap_or(0.0);
    let s: f64 = caps[group + 2].parse().unwrap_or(0.0);
    let ms: f64 = caps[group + 3].parse().unwrap_or(0.0);
    h * 3600.0 + m * 60.0 + s + ms / 1000.0
}

fn seconds_to_timecode(seconds: f64) -> String {
    let total_ms = (seconds.max(0.0) * 1000.0).round() as i64;
    let hours = total_ms / 3_600_000;
    let minutes = (total_ms % 3_600_000) / 60_000;
    let secs = (total_ms % 60_000) / 1000;
    let millis = total_ms % 1000;
    format!("{hours:02}:{minutes:02}:{secs:02},{millis:03}")
}

/// Inverse of `parse`: 1-based index, timecode line, text, blank line.
pub fn serialize(subtitle: &Subtitle) -> String {
    let mut out = String::new();
    for (i, cue) in subtitle.cues.iter().enumerate() {
        out.push_str(&format!("{}\n", i + 1));
        out.push_str(&format!(
            "{} --> {}\n",
            seconds_to_timecode(cue.start),
            seconds_to_timecode(cue.end)
        ));
        if !cue.text.is_empty() {
            out.push_str(&cue.text);
            out.push('\n');
        }
        out.push('\n');
    }
    out
}
