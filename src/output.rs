//! Output Processor: per-agent ring of recent output, ANSI
//! stripping for analysis, trim-with-extraction, and completion/block signal
//! detection.
//!
//! No ring-buffer or signal-scan layer exists upstream to adapt; this module is
//! built fresh in the surrounding codebase's idiom (plain struct + methods +
//! `#[cfg(test)] mod tests`), reusing its canonical-regex vocabulary shared with
//! the rest of the orchestrator.

use regex::Regex;
use std::sync::OnceLock;

pub const TRIM_AT: usize = 300 * 1024;
pub const KEEP: usize = 128 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    Done,
    Blocked { reason: String },
}

/// Extracted facts handed to the Memory Store's `recordContextCompaction` on trim.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContextCompaction {
    pub file_paths: Vec<String>,
    pub errors: Vec<String>,
    pub approach_note: Option<String>,
}

pub(crate) fn file_path_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r#"(?i)(?:^|\s)((?:src|lib|app|pages|components|hooks|utils|test|tests|spec|config|public|assets|api|scripts|bin|deploy|docker|k8s|infra)/[^\s,)"']+\.[a-z]{1,5})"#,
        )
        .unwrap()
    })
}

fn error_marker_res() -> &'static [Regex; 4] {
    static RES: OnceLock<[Regex; 4]> = OnceLock::new();
    RES.get_or_init(|| {
        [
            Regex::new(r"Error:\s*(.{10,100})").unwrap(),
            Regex::new(r"error\[E\d+\]:\s*(.{10,100})").unwrap(),
            Regex::new(r"TS\d{4,5}:\s*(.{10,80})").unwrap(),
            Regex::new(r"FAIL\s+(.{10,80})").unwrap(),
        ]
    })
}

fn ansi_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\x1b\[[0-9;]*[a-zA-Z]").unwrap())
}

fn done_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"HOMER_DONE").unwrap())
}

fn blocked_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"HOMER_BLOCKED(?:\s*:\s*(.*))?").unwrap())
}

/// Strip ANSI escape sequences for analysis. The raw buffer is preserved untouched;
/// this is only used on the trailing-window scan and the extract-then-discard pass.
pub fn strip_ansi(s: &str) -> String {
    ansi_re().replace_all(s, "").to_string()
}

const SIGNAL_WINDOW: usize = 500;

/// Scan the ANSI-stripped last `SIGNAL_WINDOW` characters for exactly one signal,
/// earliest (leftmost) match wins.
pub fn detect_signal(raw_tail: &str) -> Option<Signal> {
    let stripped = strip_ansi(raw_tail);
    let window_start = stripped.len().saturating_sub(SIGNAL_WINDOW);
    let window = &stripped[floor_char_boundary(&stripped, window_start)..];

    let done_pos = done_re().find(window).map(|m| m.start());
    let blocked_match = blocked_re().captures(window);
    let blocked_pos = blocked_match.as_ref().map(|c| c.get(0).unwrap().start());

    match (done_pos, blocked_pos) {
        (Some(d), Some(b)) if b < d => Some(make_blocked(blocked_match.unwrap())),
        (Some(_), _) => Some(Signal::Done),
        (None, Some(_)) => Some(make_blocked(blocked_match.unwrap())),
        (None, None) => None,
    }
}

fn make_blocked(captures: regex::Captures) -> Signal {
    let reason = captures
        .get(1)
        .map(|m| m.as_str().trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "unknown".to_string());
    Signal::Blocked { reason }
}

fn floor_char_boundary(s: &str, idx: usize) -> usize {
    let mut i = idx;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

const APPROACH_MARKERS: &[&str] = &[
    "approach", "strategy", "plan", "trying", "attempt", "will", "going to", "let me",
];

/// Per-agent output buffer. Owns the append-only view plus a digest accumulated
/// across trims (so trimmed history is never fully lost, just compacted).
pub struct OutputBuffer {
    raw: String,
    verify_history_digest: String,
    /// Suppresses further signal detection until reset (agent returns to `working`).
    signaled: bool,
    touch_counts: std::collections::HashMap<String, u64>,
}

impl Default for OutputBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputBuffer {
    pub fn new() -> Self {
        Self {
            raw: String::new(),
            verify_history_digest: String::new(),
            signaled: false,
            touch_counts: std::collections::HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.raw.len()
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn touch_counts(&self) -> &std::collections::HashMap<String, u64> {
        &self.touch_counts
    }

    /// File paths mentioned anywhere in the buffer so far, merging what a prior trim
    /// already counted with a fresh scan of the untrimmed tail. Used by the
    /// supervisor to compute `filesTouched` for a verification round without waiting
    /// for a trim to occur.
    pub fn detect_file_paths(&self) -> Vec<String> {
        let mut seen: Vec<String> = self.touch_counts.keys().cloned().collect();
        let stripped = strip_ansi(&self.raw);
        for cap in file_path_re().captures_iter(&stripped) {
            let path = cap[1].to_string();
            if !seen.contains(&path) {
                seen.push(path);
            }
        }
        seen
    }

    /// Append bytes (lossily decoded) and trim if over the soft cap.
    /// Returns a `ContextCompaction` when a trim happened, for forwarding to Memory.
    pub fn append(&mut self, data: &[u8]) -> Option<ContextCompaction> {
        self.raw.push_str(&String::from_utf8_lossy(data));
        if self.raw.len() > TRIM_AT { self.trim() } else { None }
    }

    /// Scan the current tail for a signal. A no-op (returns None) once a signal has
    /// already fired for this working episode, until `reset_signal()` is called.
    pub fn scan_signal(&mut self) -> Option<Signal> {
        if self.signaled {
            return None;
        }
        let signal = detect_signal(&self.raw);
        if signal.is_some() {
            self.signaled = true;
        }
        signal
    }

    /// Called when status returns to `working` after a verify round, re-arming
    /// signal detection.
    pub fn reset_signal(&mut self) {
        self.signaled = false;
    }

    /// Extract-then-discard protocol, run within trim. Never drops the
    /// signal-bearing tail (the last `KEEP` bytes survive verbatim).
    fn trim(&mut self) -> Option<ContextCompaction> {
        let keep_at = self.raw.len().saturating_sub(KEEP);
        let keep_at = floor_char_boundary(&self.raw, keep_at);
        let (discard_prefix, tail) = self.raw.split_at(keep_at);

        let stripped_prefix = strip_ansi(discard_prefix);

        let mut file_paths = Vec::new();
        for cap in file_path_re().captures_iter(&stripped_prefix) {
            let path = cap[1].to_string();
            *self.touch_counts.entry(path.clone()).or_insert(0) += 1;
            if !file_paths.contains(&path) {
                file_paths.push(path);
            }
        }

        let mut errors = Vec::new();
        'outer: for re in error_marker_res() {
            for cap in re.captures_iter(&stripped_prefix) {
                let err = cap[1].trim().to_string();
                if !errors.contains(&err) {
                    errors.push(err);
                }
                if errors.len() >= 5 {
                    break 'outer;
                }
            }
        }

        let mut approach_lines = Vec::new();
        for line in stripped_prefix.lines() {
            let lower = line.to_lowercase();
            if APPROACH_MARKERS.iter().any(|m| lower.contains(m)) {
                approach_lines.push(line.trim().to_string());
                if approach_lines.len() >= 3 {
                    break;
                }
            }
        }
        let approach_note = if approach_lines.is_empty() { None } else { Some(approach_lines.join(" / ")) };

        let compaction = ContextCompaction { file_paths, errors, approach_note };

        if !self.verify_history_digest.is_empty() {
            self.raw = format!("{}{}", self.verify_history_digest, tail);
        } else {
            self.raw = tail.to_string();
        }

        Some(compaction)
    }

    /// Accumulate a short digest line surviving every trim (e.g. the verify feedback
    /// header), so trimmed context isn't wholly lost even past `KEEP`.
    pub fn push_digest_line(&mut self, line: &str) {
        self.verify_history_digest.push_str(line);
        self.verify_history_digest.push('\n');
    }
}
