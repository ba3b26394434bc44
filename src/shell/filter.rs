//! Cleaning of raw shell output before it reaches a session log.
//!
//! Filtering is conservative: only the handshake marker and the progress
//! meter curl prints to stderr are dropped. Everything else passes through
//! verbatim.

use std::sync::OnceLock;

use regex::Regex;

/// Prefix of the readiness marker echoed during the handshake.
pub const HANDSHAKE_MARKER_PREFIX: &str = "__shell_ready_";

/// Clean one chunk of shell output.
///
/// Returns `None` when nothing displayable is left.
pub fn clean_output(chunk: &str) -> Option<String> {
    let mut dropped = false;
    let mut kept: Vec<String> = Vec::new();

    for line in chunk.split('\n') {
        match clean_line(line) {
            LineVerdict::Keep => kept.push(line.to_string()),
            LineVerdict::Rewrite(rest) => {
                dropped = true;
                kept.push(rest);
            }
            LineVerdict::Drop => dropped = true,
        }
    }

    if !dropped {
        return (!chunk.is_empty()).then(|| chunk.to_string());
    }

    let cleaned = kept.join("\n");
    if cleaned.trim().is_empty() {
        None
    } else {
        Some(cleaned)
    }
}

enum LineVerdict {
    Keep,
    Rewrite(String),
    Drop,
}

fn clean_line(line: &str) -> LineVerdict {
    if is_noise(line) {
        return LineVerdict::Drop;
    }

    // curl redraws its meter with carriage returns, so one "line" can hold
    // several meter rows followed by real output.
    if line.contains('\r') {
        let segments: Vec<&str> = line.split('\r').collect();
        let kept: Vec<&str> = segments
            .iter()
            .copied()
            .filter(|segment| !is_noise(segment))
            .collect();
        if kept.len() == segments.len() {
            return LineVerdict::Keep;
        }
        if kept.iter().all(|segment| segment.trim().is_empty()) {
            return LineVerdict::Drop;
        }
        return LineVerdict::Rewrite(kept.join("\r"));
    }

    LineVerdict::Keep
}

fn is_noise(line: &str) -> bool {
    line.contains(HANDSHAKE_MARKER_PREFIX) || is_progress_header(line) || is_transfer_stats(line)
}

fn is_progress_header(line: &str) -> bool {
    line.contains("% Total") && line.contains("% Received") && line.contains("% Xferd")
}

/// A row of curl's transfer table: eight numeric columns, three time
/// columns and an optional current speed.
fn is_transfer_stats(line: &str) -> bool {
    static STATS_ROW: OnceLock<Option<Regex>> = OnceLock::new();
    STATS_ROW
        .get_or_init(|| {
            Regex::new(
                r"^\s*(\d+(\.\d+)?[kMGTP]?\s+){8}(--:--:--|\d+:\d{2}:\d{2})\s+(--:--:--|\d+:\d{2}:\d{2})\s+(--:--:--|\d+:\d{2}:\d{2})(\s+\d+(\.\d+)?[kMGTP]?)?\s*$",
            )
            .ok()
        })
        .as_ref()
        .is_some_and(|re| re.is_match(line))
}
