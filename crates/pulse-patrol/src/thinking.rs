//! Scrubbing of model reasoning from patrol output
//!
//! Different providers leak their internal reasoning in different shapes:
//! tagged blocks (`<think>`, `<thought>`, `<|reasoning|>`), function-call
//! markup emitted as text, end-of-thinking markers on their own line, and
//! plain "Let me check..." prose. [`clean_thinking_tokens`] removes all of
//! them and is shared with chat.

use lazy_static::lazy_static;
use regex::Regex;

/// Function-call markup leaked as text; everything from the first marker on
/// is dropped
const FUNCTION_CALL_MARKERS: [&str; 6] = [
    "<｜DSML｜",
    "</｜DSML｜",
    "<|DSML|",
    "</|DSML|",
    "<｜/DSML｜",
    "<|/DSML|",
];

/// A line carrying one of these is removed whole
const LINE_MARKERS: [&str; 6] = [
    "<｜end▁of▁thinking｜>",
    "<|end_of_thinking|>",
    "<|end▁of▁thinking|>",
    "</think>",
    "</thought>",
    "<|/reasoning|>",
];

/// A blank line followed by one of these starts a reasoning run
const REASONING_PREFIXES: [&str; 8] = [
    "Now, ",
    "Let's ",
    "Let me ",
    "I should ",
    "I'll ",
    "I need to ",
    "Checking ",
    "Looking at ",
];

/// A reasoning run ends at the first line that looks like real output
const CONTENT_PREFIXES: [&str; 5] = ["#", "[FINDING]", "**", "-", "1."];

lazy_static! {
    static ref BLOCKS: [Regex; 3] = [
        block(r"<think>", r"</think>"),
        block(r"<thought>", r"</thought>"),
        block(r"<\|reasoning\|>", r"<\|/reasoning\|>"),
    ];
    static ref BLANK_RUNS: Regex = Regex::new(r"\n{3,}").unwrap();
}

/// Closed blocks are removed with their body; an unclosed block runs to the end
fn block(open: &str, close: &str) -> Regex {
    Regex::new(&format!(r"(?is){}.*?(?:{}|\z)", open, close)).unwrap()
}

pub fn clean_thinking_tokens(content: &str) -> String {
    if content.is_empty() {
        return String::new();
    }

    let mut text = content.to_string();
    if let Some(idx) = FUNCTION_CALL_MARKERS.iter().filter_map(|m| text.find(m)).min() {
        text.truncate(idx);
    }

    for re in BLOCKS.iter() {
        text = re.replace_all(&text, "").into_owned();
    }

    let lines: Vec<&str> = text
        .lines()
        .filter(|line| !LINE_MARKERS.iter().any(|m| line.contains(m)))
        .collect();

    let mut kept = Vec::with_capacity(lines.len());
    let mut skipping = false;
    for (i, line) in lines.iter().enumerate() {
        let trimmed = line.trim();
        if skipping {
            if CONTENT_PREFIXES.iter().any(|p| trimmed.starts_with(p)) {
                skipping = false;
            } else {
                continue;
            }
        }
        if trimmed.is_empty() {
            if let Some(next) = lines.get(i + 1) {
                let next = next.trim();
                if REASONING_PREFIXES.iter().any(|p| next.starts_with(p)) {
                    skipping = true;
                    continue;
                }
            }
        }
        kept.push(*line);
    }

    let joined = kept.join("\n");
    BLANK_RUNS.replace_all(&joined, "\n\n").trim().to_string()
}
