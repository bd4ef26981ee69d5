// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Agent output sanitization.
//!
//! LLM text is never written to context unvalidated. Rejected: control
//! characters outside `{\t, \n, \r}`, Unicode direction/bidi override
//! codepoints, and payloads above the configured byte limit.

use crate::domain::error::EngineError;

/// Default payload cap: 1 MiB.
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 1024 * 1024;

/// Codepoints that can reorder rendered text and smuggle content past review.
const BIDI_OVERRIDES: [char; 12] = [
    '\u{202A}', '\u{202B}', '\u{202C}', '\u{202D}', '\u{202E}', '\u{2066}', '\u{2067}',
    '\u{2068}', '\u{2069}', '\u{061C}', '\u{200E}', '\u{200F}',
];

pub fn validate_output(text: &str, max_bytes: usize) -> Result<(), EngineError> {
    if text.len() > max_bytes {
        return Err(EngineError::OutputValidation(format!(
            "output of {} bytes exceeds limit of {} bytes",
            text.len(),
            max_bytes
        )));
    }

    for ch in text.chars() {
        if ch.is_control() && !matches!(ch, '\t' | '\n' | '\r') {
            return Err(EngineError::OutputValidation(format!(
                "forbidden control character U+{:04X}",
                ch as u32
            )));
        }
        if BIDI_OVERRIDES.contains(&ch) {
            return Err(EngineError::OutputValidation(format!(
                "forbidden bidi override character U+{:04X}",
                ch as u32
            )));
        }
    }

    Ok(())
}
