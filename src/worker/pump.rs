//! Line-multiplexed draining of a worker's stdout/stderr, progress regex
//! extraction, and tolerant JSON-result extraction.
//!
//! A dedicated reader thread per pipe, decoupled from the polling loop via
//! an `mpsc` channel, so a stalled consumer never blocks the child from
//! writing.

use std::io::{BufReader, Read};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, TryRecvError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;

static PROGRESS_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[[^\]]+\]\s+progress:\s+(\d+)/(\d+)").unwrap());

/// `(done, total)` parsed from a `[<tag>] progress: N/M` stderr line.
pub fn parse_progress_line(line: &str) -> Option<(u64, u64)> {
    let caps = PROGRESS_LINE.captures(line)?;
    let done: u64 = caps[1].parse().ok()?;
    let total: u64 = caps[2].parse().ok()?;
    Some((done, total))
}

/// Pumps a child's stderr into a channel line by line, decoding UTF-8 with
/// replacement for invalid bytes rather than failing on a partial
/// multi-byte sequence.
pub struct LinePump {
    rx: Option<Receiver<String>>,
    join: Option<JoinHandle<()>>,
}

impl LinePump {
    /// Spawn a reader thread over any pipe-like handle (`ChildStdout` and
    /// `ChildStderr` both qualify) that decodes and forwards complete lines.
    pub fn spawn(pipe: impl Read + Send + 'static) -> Self {
        let (tx, rx) = mpsc::channel::<String>();
        let join = thread::spawn(move || {
            let reader = BufReader::new(pipe);
            for line in decode_lossy_lines(reader) {
                if tx.send(line).is_err() {
                    break;
                }
            }
        });
        Self {
            rx: Some(rx),
            join: Some(join),
        }
    }

    pub fn recv_timeout(&mut self, timeout: Duration) -> Option<String> {
        let rx = self.rx.as_ref()?;
        match rx.recv_timeout(timeout) {
            Ok(line) => Some(line),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => {
                self.rx = None;
                None
            }
        }
    }

    pub fn drain_available(&mut self, mut on_line: impl FnMut(String)) {
        let Some(rx) = self.rx.as_ref() else {
            return;
        };
        loop {
            match rx.try_recv() {
                Ok(line) => on_line(line),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.rx = None;
                    break;
                }
            }
        }
    }

    pub fn join(&mut self) {
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

/// Reads raw bytes and splits on `\n`, decoding each line with
/// `String::from_utf8_lossy` rather than failing on invalid UTF-8.
fn decode_lossy_lines(mut reader: impl Read) -> Vec<String> {
    let mut buf = Vec::new();
    let _ = reader.read_to_end(&mut buf);
    String::from_utf8_lossy(&buf)
        .lines()
        .map(str::to_string)
        .collect()
}

/// Extracts the last balanced top-level JSON object found anywhere in
/// `output`, tolerant of a leading `<think>...</think>` block and
/// surrounding prose. Returns `None` if no balanced object is found.
pub fn extract_last_json_object(output: &str) -> Option<serde_json::Value> {
    let mut candidates = Vec::new();
    let bytes: Vec<char> = output.chars().collect();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == '{' {
            if let Some(end) = find_matching_brace(&bytes, i) {
                let candidate: String = bytes[i..=end].iter().collect();
                if let Ok(value) = serde_json::from_str::<serde_json::Value>(&candidate) {
                    candidates.push(value);
                }
                i = end + 1;
                continue;
            }
        }
        i += 1;
    }
    candidates.pop()
}

fn find_matching_brace(chars: &[char], open: usize) -> Option<usize> {
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escape = false;
    for (idx, &c) in chars.iter().enumerate().skip(open) {
        if in_string {
            if escape {
                escape = false;
            } else if c == '\\' {
                escape = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(idx);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_progress_line() {
        assert_eq!(parse_progress_line("[translate.en] progress: 3/10"), Some((3, 10)));
    }

    #[test]
    fn ignores_unrelated_line() {
        assert_eq!(parse_progress_line("loading model..."), None);
    }

    #[test]
    fn extracts_pure_json_last_line() {
        let output = "doing work\n{\"status\": \"ok\", \"count\": 3}\n";
        let value = extract_last_json_object(output).unwrap();
        assert_eq!(value["status"], "ok");
    }

    #[test]
    fn extracts_json_through_think_block_and_prose() {
        let output = "<think>planning the translation approach</think>\nHere is the result:\n{\"status\": \"ok\"}\nthanks!";
        let value = extract_last_json_object(output).unwrap();
        assert_eq!(value["status"], "ok");
    }

    #[test]
    fn picks_last_of_multiple_json_objects() {
        let output = "{\"status\": \"partial\"}\nsome log\n{\"status\": \"ok\"}";
        let value = extract_last_json_object(output).unwrap();
        assert_eq!(value["status"], "ok");
    }

    #[test]
    fn tolerates_braces_inside_string_values() {
        let output = "{\"message\": \"contains a { brace } inside\", \"status\": \"ok\"}";
        let value = extract_last_json_object(output).unwrap();
        assert_eq!(value["status"], "ok");
    }

    #[test]
    fn returns_none_when_no_json_present() {
        assert!(extract_last_json_object("no json here at all").is_none());
    }
}
