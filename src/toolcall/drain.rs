//! Streaming safe-delta engine.
//!
//! The answer buffer grows chunk by chunk while a trigger sentinel may
//! appear at any future byte. The drain decides, on every chunk, the
//! longest prefix that is safe to forward: it never emits a byte that a
//! later chunk could turn into part of the sentinel, never splits a UTF-8
//! code point, and ignores sentinels that occur inside `<think>` blocks.

use crate::util::floor_utf8_char_boundary;

const THINK_OPEN: &str = "<think>";
const THINK_CLOSE: &str = "</think>";

/// Outcome of one drain step.
#[derive(Debug, PartialEq, Eq)]
pub struct DrainResult {
    /// The next safe slice of the answer, possibly empty.
    pub delta: String,
    /// Byte cursor after this step; always on a UTF-8 boundary.
    pub emitted: usize,
    /// Whether the trigger sentinel is visible outside any think block.
    pub has_trigger: bool,
}

/// Compute the next safe delta of `answer` past the `emitted` cursor.
///
/// Without function calling there is nothing to withhold. Otherwise the
/// slice stops at the last out-of-think trigger occurrence, or short of
/// the buffer end by `trigger.len() - 1` bytes so no emitted suffix can
/// later complete into the sentinel.
pub fn drain_safe_answer_delta(
    answer: &str,
    emitted: usize,
    has_function_calling: bool,
    trigger_signal: &str,
) -> DrainResult {
    if emitted >= answer.len() {
        return DrainResult {
            delta: String::new(),
            emitted,
            has_trigger: false,
        };
    }

    if !has_function_calling {
        let start = floor_utf8_char_boundary(answer, emitted);
        return DrainResult {
            delta: answer[start..].to_string(),
            emitted: answer.len(),
            has_trigger: false,
        };
    }

    let trigger_pos = find_last_trigger_outside_think(answer, trigger_signal);
    let has_trigger = trigger_pos.is_some();
    let safe_end = match trigger_pos {
        Some(pos) => pos,
        None => {
            let hold_back = trigger_signal.len().saturating_sub(1);
            answer.len().saturating_sub(hold_back)
        }
    };

    clamped_slice(answer, emitted, safe_end, has_trigger)
}

/// Final drain at stream completion: emit up to the trigger if present,
/// otherwise everything. Returns `(delta, new_cursor)`.
pub fn drain_safe_answer_tail(answer: &str, emitted: usize, trigger_signal: &str) -> (String, usize) {
    let end = find_last_trigger_outside_think(answer, trigger_signal).unwrap_or(answer.len());
    let result = clamped_slice(answer, emitted, end, false);
    (result.delta, result.emitted)
}

fn clamped_slice(answer: &str, emitted: usize, safe_end: usize, has_trigger: bool) -> DrainResult {
    if safe_end <= emitted {
        return DrainResult {
            delta: String::new(),
            emitted,
            has_trigger,
        };
    }

    let start = floor_utf8_char_boundary(answer, emitted);
    let end = floor_utf8_char_boundary(answer, safe_end);
    if end <= start {
        return DrainResult {
            delta: String::new(),
            emitted: start,
            has_trigger,
        };
    }

    DrainResult {
        delta: answer[start..end].to_string(),
        emitted: end,
        has_trigger,
    }
}

/// Byte position of the last occurrence of `trigger_signal` that lies at
/// think depth zero. The sentinel is ASCII, so the bytewise walk can step
/// one byte at a time without splitting characters.
pub fn find_last_trigger_outside_think(text: &str, trigger_signal: &str) -> Option<usize> {
    if text.is_empty() || trigger_signal.is_empty() {
        return None;
    }

    let bytes = text.as_bytes();
    let trigger = trigger_signal.as_bytes();
    let mut i = 0;
    let mut depth = 0usize;
    let mut last = None;

    while i < bytes.len() {
        if bytes[i..].starts_with(THINK_OPEN.as_bytes()) {
            depth += 1;
            i += THINK_OPEN.len();
        } else if bytes[i..].starts_with(THINK_CLOSE.as_bytes()) {
            depth = depth.saturating_sub(1);
            i += THINK_CLOSE.len();
        } else if depth == 0 && bytes[i..].starts_with(trigger) {
            last = Some(i);
            i += 1;
        } else {
            i += 1;
        }
    }

    last
}

/// Excise every balanced `<think>…</think>` region, honoring nesting. An
/// unterminated block stops the pass and the remainder is kept intact.
pub fn remove_think_blocks(text: &str) -> String {
    let mut text = text.to_string();

    loop {
        let Some(start) = text.find(THINK_OPEN) else {
            break;
        };

        let bytes = text.as_bytes();
        let mut pos = start + THINK_OPEN.len();
        let mut depth = 1usize;
        while pos < bytes.len() && depth > 0 {
            if bytes[pos..].starts_with(THINK_OPEN.as_bytes()) {
                depth += 1;
                pos += THINK_OPEN.len();
            } else if bytes[pos..].starts_with(THINK_CLOSE.as_bytes()) {
                depth -= 1;
                pos += THINK_CLOSE.len();
            } else {
                pos += 1;
            }
        }

        if depth != 0 {
            break;
        }
        text.replace_range(start..pos, "");
    }

    text
}

#[cfg(test)]
mod tests {
    use super::*;

    const TRIGGER: &str = "<Function_Test_Start/>";

    #[test]
    fn delta_stops_at_trigger() {
        let answer = "前缀内容<Function_Test_Start/><function_calls></function_calls>";
        let result = drain_safe_answer_delta(answer, 0, true, TRIGGER);
        assert!(result.has_trigger);
        assert_eq!(result.delta, "前缀内容");
        assert_eq!(result.emitted, "前缀内容".len());
    }

    #[test]
    fn delta_holds_back_potential_trigger_prefix() {
        let answer = "中文A";
        let result = drain_safe_answer_delta(answer, 0, true, "abc");
        assert!(!result.has_trigger);
        // Hold-back of len("abc") - 1 = 2 bytes lands inside 文, so the
        // cut clamps back to the boundary after 中.
        assert_eq!(result.delta, "中");
        assert_eq!(result.emitted, "中".len());
    }

    #[test]
    fn delta_without_function_calling_emits_everything() {
        let answer = "全部内容 including <Function_Test_Start/>";
        let result = drain_safe_answer_delta(answer, 0, false, TRIGGER);
        assert!(!result.has_trigger);
        assert_eq!(result.delta, answer);
        assert_eq!(result.emitted, answer.len());
    }

    #[test]
    fn delta_past_end_is_empty() {
        let result = drain_safe_answer_delta("abc", 3, true, TRIGGER);
        assert_eq!(result.delta, "");
        assert_eq!(result.emitted, 3);
    }

    #[test]
    fn trigger_inside_think_is_ignored() {
        let answer = format!("<think>{TRIGGER}</think>visible text");
        let result = drain_safe_answer_delta(&answer, 0, true, TRIGGER);
        assert!(!result.has_trigger);
        // Everything except the hold-back window is emitted.
        let expected_end = answer.len() - (TRIGGER.len() - 1);
        assert_eq!(result.emitted, expected_end);
    }

    #[test]
    fn last_trigger_wins() {
        let answer = format!("a{TRIGGER}b{TRIGGER}c");
        let pos = find_last_trigger_outside_think(&answer, TRIGGER).unwrap();
        assert_eq!(pos, 1 + TRIGGER.len() + 1);
    }

    #[test]
    fn tail_without_trigger_emits_suffix() {
        let answer = "中文ABC";
        let start = "中文".len();
        let (delta, end) = drain_safe_answer_tail(answer, start, TRIGGER);
        assert_eq!(delta, "ABC");
        assert_eq!(end, answer.len());
    }

    #[test]
    fn tail_with_trigger_stops_before_it() {
        let answer = "前缀文本<Function_Test_Start/><function_calls></function_calls>";
        let (delta, end) = drain_safe_answer_tail(answer, 0, TRIGGER);
        assert_eq!(delta, "前缀文本");
        assert_eq!(end, "前缀文本".len());
    }

    #[test]
    fn incremental_drains_concatenate_to_prefix() {
        let full = format!("回答 first part, 中文 second part {TRIGGER}<function_calls></function_calls>");
        let mut emitted = 0;
        let mut collected = String::new();

        // Feed the buffer in uneven slices, including cuts inside
        // multi-byte characters, and drain after each.
        for cut in [3, 7, 10, 21, 29, full.len()] {
            let cut = crate::util::floor_utf8_char_boundary(&full, cut);
            let visible = &full[..cut];
            let result = drain_safe_answer_delta(visible, emitted, true, TRIGGER);
            assert!(result.emitted >= emitted);
            assert!(full.is_char_boundary(result.emitted));
            collected.push_str(&result.delta);
            emitted = result.emitted;
        }

        let (tail, end) = drain_safe_answer_tail(&full, emitted, TRIGGER);
        collected.push_str(&tail);

        assert!(full.starts_with(&collected));
        assert_eq!(end, full.find(TRIGGER).unwrap());
        assert_eq!(collected, full[..end]);
        assert!(!collected.contains(TRIGGER));
    }

    #[test]
    fn remove_think_blocks_strips_balanced_regions() {
        assert_eq!(remove_think_blocks("a<think>x</think>b"), "ab");
        assert_eq!(
            remove_think_blocks("a<think>x<think>y</think>z</think>b"),
            "ab"
        );
        assert_eq!(remove_think_blocks("no think here"), "no think here");
    }

    #[test]
    fn remove_think_blocks_keeps_unterminated_region() {
        let text = "before<think>never closed";
        assert_eq!(remove_think_blocks(text), text);

        // A balanced block before the unterminated one is still removed.
        let text = "a<think>x</think>b<think>open";
        assert_eq!(remove_think_blocks(text), "ab<think>open");
    }

    #[test]
    fn empty_trigger_never_matches() {
        assert_eq!(find_last_trigger_outside_think("text", ""), None);
        assert_eq!(find_last_trigger_outside_think("", "<T/>"), None);
    }
}
