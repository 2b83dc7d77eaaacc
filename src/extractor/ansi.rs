//! ANSI/CSI escape sequence stripping and output sanitization.
//!
//! Adapted verbatim from the host's `agents::ansi_stripper::strip_ansi`
//! (`examples/dario-valles-Ralph-UI/src-tauri/src/agents/ansi_stripper.rs`),
//! whose regex already matches CSI, OSC, DCS/SOS/PM/APC and Fe escape
//! sequences plus bare CR/BEL bytes.

use regex::Regex;
use std::sync::LazyLock;

static ANSI_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r"\x1b\[[0-9;]*[a-zA-Z]",    // CSI sequences (e.g. \x1b[0m, \x1b[1;32m)
        r"|\x1b\][^\x07]*\x07",      // OSC sequences terminated by BEL
        r"|\x1b\][^\x1b]*\x1b\\",    // OSC sequences terminated by ST
        r"|\x1b[PX^_][^\x1b]*\x1b\\", // DCS, SOS, PM, APC sequences
        r"|\x1b[@-Z\\-_]",           // Fe escape sequences
        r"|\x1b.",                   // other escape sequences
        r"|\x0d",                    // carriage return
        r"|\x07",                    // BEL character
    ))
    .expect("invalid ANSI regex pattern")
});

/// Strip ANSI/CSI escape sequences from agent output.
pub fn strip_ansi(input: &str) -> String {
    ANSI_REGEX.replace_all(input, "").to_string()
}

/// Maximum length of sanitized raw output retained on an iteration log
/// (spec.md §4.5, §8 property 10).
pub const MAX_RAW_OUTPUT_CHARS: usize = 50_000;

/// Strip escape sequences, then truncate to `MAX_RAW_OUTPUT_CHARS`,
/// appending the literal `"[truncated]"` marker if anything was cut.
pub fn sanitize_raw_output(input: &str) -> String {
    let clean = strip_ansi(input);
    if clean.chars().count() <= MAX_RAW_OUTPUT_CHARS {
        return clean;
    }
    let mut truncated: String = clean.chars().take(MAX_RAW_OUTPUT_CHARS).collect();
    truncated.push_str("[truncated]");
    truncated
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_csi_color_codes() {
        let input = "\x1b[31mred text\x1b[0m";
        assert_eq!(strip_ansi(input), "red text");
    }

    #[test]
    fn strips_carriage_returns_and_bel() {
        let input = "line1\r\nline2\x07done";
        assert_eq!(strip_ansi(input), "line1\nline2done");
    }

    #[test]
    fn leaves_plain_text_untouched() {
        assert_eq!(strip_ansi("plain output, nothing fancy"), "plain output, nothing fancy");
    }

    #[test]
    fn sanitize_truncates_long_output_with_marker() {
        let long = "a".repeat(MAX_RAW_OUTPUT_CHARS + 500);
        let result = sanitize_raw_output(&long);
        assert!(result.ends_with("[truncated]"));
        assert_eq!(result.len(), MAX_RAW_OUTPUT_CHARS + "[truncated]".len());
    }

    #[test]
    fn sanitize_leaves_short_output_untruncated() {
        let short = "short output";
        assert_eq!(sanitize_raw_output(short), short);
    }

    #[test]
    fn sanitize_removes_control_bytes_before_truncating() {
        let input = format!("\x1b[32m{}\x1b[0m", "x".repeat(100));
        let result = sanitize_raw_output(&input);
        assert!(!result.contains('\x1b'));
    }
}
