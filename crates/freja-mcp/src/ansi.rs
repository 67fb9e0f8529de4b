// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::OnceLock;

use regex::Regex;

/// Strip ANSI escape sequences from CLI output before parsing. Agent
/// CLIs color their `mcp list` output even when piped.
pub fn strip_ansi(input: &str) -> String {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let re = PATTERN.get_or_init(|| {
        // CSI sequences plus the two-byte escapes some spinners emit.
        Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]|\x1b[@-Z\\-_]").expect("static regex")
    });
    re.replace_all(input, "").into_owned()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
