//! Sandbox output parsing.
//!
//! The sandboxed process writes loosely-structured JSONL mixed with log
//! noise onto a shared stream. The contract is a narrow, versioned result
//! envelope (`{"type":"result",...}`); anything non-conforming takes the
//! degraded path: noise lines are filtered out and the remaining tail
//! becomes a human summary. Parsing never fails an execution.

use regex::Regex;
use serde::Deserialize;
use std::sync::OnceLock;
use tracing::debug;

/// Tool outputs kept for diagnostics are clipped to this many chars
const TOOL_OUTPUT_LIMIT: usize = 400;

/// One tool call recorded by the sandboxed agent (diagnostics only).
#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    pub command: String,
    /// Truncated
    pub output: String,
}

/// Everything recoverable from one run's captured output.
#[derive(Debug, Clone)]
pub struct ParsedOutput {
    pub success: bool,
    pub summary: String,
    pub files_modified: Vec<String>,
    pub commit_hash: Option<String>,
    pub models_used: Vec<String>,
    pub cost_usd: Option<f64>,
    pub turns: Option<u32>,
    pub sandbox_session_id: Option<String>,
    pub tool_invocations: Vec<ToolInvocation>,
    /// Bounded tail of the demultiplexed output, for diagnostics
    pub raw_tail: String,
}

/// Versioned result envelope — the sandbox-to-orchestrator contract.
#[derive(Debug, Deserialize)]
struct ResultEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    #[allow(dead_code)]
    version: Option<u32>,
    #[serde(default)]
    success: Option<bool>,
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    cost_usd: Option<f64>,
    #[serde(default)]
    turns: Option<u32>,
    #[serde(default)]
    models: Vec<String>,
    #[serde(default)]
    files_modified: Vec<String>,
    #[serde(default)]
    commit: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ToolEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    command: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    output: Option<String>,
}

/// Parses one run's raw captured output into a typed result.
pub fn parse_output(raw: &[u8], tail_limit: usize) -> ParsedOutput {
    let text = demux_stream(raw);
    let raw_tail = tail(&text, tail_limit);

    let tool_invocations = collect_tool_events(&text);
    let envelope = find_result_envelope(&text);

    match envelope {
        Some(envelope) => {
            let commit_hash = envelope.commit.or_else(|| extract_commit_hash(&text));
            let files_modified = if envelope.files_modified.is_empty() {
                extract_modified_files(&text)
            } else {
                envelope.files_modified
            };
            let summary = match envelope.summary {
                Some(s) if !s.trim().is_empty() => s,
                _ => fallback_summary(&text, tail_limit),
            };
            ParsedOutput {
                success: envelope.success.unwrap_or(true),
                summary,
                files_modified,
                commit_hash,
                models_used: envelope
                    .models
                    .iter()
                    .map(|m| friendly_model_name(m))
                    .collect(),
                cost_usd: envelope.cost_usd,
                turns: envelope.turns,
                sandbox_session_id: envelope.session_id,
                tool_invocations,
                raw_tail,
            }
        }
        None => {
            debug!("No result envelope in sandbox output, degrading to text summary");
            ParsedOutput {
                success: true,
                summary: fallback_summary(&text, tail_limit),
                files_modified: extract_modified_files(&text),
                commit_hash: extract_commit_hash(&text),
                models_used: Vec::new(),
                cost_usd: None,
                turns: None,
                sandbox_session_id: None,
                tool_invocations,
                raw_tail,
            }
        }
    }
}

// ── Stream demultiplexing ────────────────────────────────

/// Strips Docker's multiplexed stream framing: 8-byte headers of
/// `{stream_type, 0, 0, 0, len_be32}` in front of each payload chunk.
/// Output without framing passes through unchanged.
pub fn demux_stream(raw: &[u8]) -> String {
    let mut out = Vec::with_capacity(raw.len());
    let mut rest = raw;

    while rest.len() >= 8 {
        let looks_framed = matches!(rest[0], 0 | 1 | 2) && rest[1..4] == [0, 0, 0];
        if !looks_framed {
            break;
        }
        let len = u32::from_be_bytes([rest[4], rest[5], rest[6], rest[7]]) as usize;
        if rest.len() < 8 + len {
            // Truncated frame: keep what is there and stop
            out.extend_from_slice(&rest[8..]);
            rest = &[];
            break;
        }
        out.extend_from_slice(&rest[8..8 + len]);
        rest = &rest[8 + len..];
    }
    out.extend_from_slice(rest);

    String::from_utf8_lossy(&out).into_owned()
}

// ── Structured extraction ────────────────────────────────

/// Locates the final result envelope: the last line that decodes as a
/// JSON object with `"type": "result"`. Malformed lines are skipped.
fn find_result_envelope(text: &str) -> Option<ResultEnvelope> {
    text.lines().rev().find_map(|line| {
        let line = line.trim();
        if !line.starts_with('{') {
            return None;
        }
        serde_json::from_str::<ResultEnvelope>(line)
            .ok()
            .filter(|e| e.kind == "result")
    })
}

fn collect_tool_events(text: &str) -> Vec<ToolInvocation> {
    text.lines()
        .filter_map(|line| {
            let line = line.trim();
            if !line.starts_with('{') {
                return None;
            }
            let event: ToolEvent = serde_json::from_str(line).ok()?;
            if event.kind != "tool" {
                return None;
            }
            let command = event.command.or(event.name)?;
            let mut output = event.output.unwrap_or_default();
            if output.chars().count() > TOOL_OUTPUT_LIMIT {
                output = output.chars().take(TOOL_OUTPUT_LIMIT).collect::<String>() + "…";
            }
            Some(ToolInvocation { command, output })
        })
        .collect()
}

/// Maps provider model ids to the short names used in reply summaries.
pub fn friendly_model_name(id: &str) -> String {
    const FRIENDLY: &[(&str, &str)] = &[
        ("claude-opus", "Opus"),
        ("claude-sonnet", "Sonnet"),
        ("claude-haiku", "Haiku"),
    ];
    for (prefix, name) in FRIENDLY {
        if id.starts_with(prefix) {
            return name.to_string();
        }
    }
    id.to_string()
}

// ── Git scraping (best-effort) ───────────────────────────

fn commit_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // `git commit` porcelain: "[branch abc1234] message"
    RE.get_or_init(|| Regex::new(r"\[[^\]\s]+ ([0-9a-f]{7,40})\]").unwrap())
}

fn file_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // `git status` long format lines inside the output
    RE.get_or_init(|| {
        Regex::new(r"(?m)^\s*(?:modified|new file|deleted|renamed):\s+(.+?)\s*$").unwrap()
    })
}

fn extract_commit_hash(text: &str) -> Option<String> {
    commit_re()
        .captures_iter(text)
        .last()
        .map(|caps| caps[1].to_string())
}

fn extract_modified_files(text: &str) -> Vec<String> {
    let mut files: Vec<String> = Vec::new();
    for caps in file_re().captures_iter(text) {
        let file = caps[1].to_string();
        if !files.contains(&file) {
            files.push(file);
        }
    }
    files
}

// ── Degraded text path ───────────────────────────────────

const NOISE_PREFIXES: &[&str] = &[
    "Cloning into",
    "remote:",
    "Receiving objects",
    "Resolving deltas",
    "Updating files",
    "Switched to",
    "From ",
    "warning:",
    "hint:",
];

const NOISE_CONTAINS: &[&str] = &["credential helper", "credentials configured"];

fn is_noise_line(line: &str) -> bool {
    let trimmed = line.trim_start();
    if trimmed.starts_with('{') {
        // Structured events are not prose
        return true;
    }
    NOISE_PREFIXES.iter().any(|p| trimmed.starts_with(p))
        || NOISE_CONTAINS
            .iter()
            .any(|p| trimmed.to_ascii_lowercase().contains(p))
}

/// Filters SCM chatter and setup banners out of the output and keeps the
/// remaining tail as the human summary.
fn fallback_summary(text: &str, tail_limit: usize) -> String {
    let kept: Vec<&str> = text
        .lines()
        .filter(|l| !l.trim().is_empty() && !is_noise_line(l))
        .collect();
    let joined = kept.join("\n");
    let summary = tail(&joined, tail_limit);
    if summary.is_empty() {
        "Task finished with no textual output.".to_string()
    } else {
        summary
    }
}

/// Last `max_bytes` of `text`, cut on a char boundary.
pub fn tail(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let mut start = text.len() - max_bytes;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}
