//! Static safety checks for user-supplied regex patterns
//!
//! The scan looks for the shapes behind catastrophic backtracking without
//! running the pattern: an unbounded quantifier applied to a group that
//! itself contains one (`(a+)+`, `(a*)*`, `(x{2,})+`), or to an alternation
//! whose branches overlap (`(a|aa)*`). It is not exhaustive; execution is
//! still bounded by a timeout.

use crate::error::{Error, Result};

/// Default ceiling on pattern length, in characters
pub const DEFAULT_MAX_REGEX_LENGTH: usize = 200;

/// Reject over-long, backtracking-prone or uncompilable patterns
pub fn validate_regex(pattern: &str, max_length: usize) -> Result<()> {
    let length = pattern.chars().count();
    if length > max_length {
        return Err(Error::UnsafeRegex(format!(
            "pattern is {} characters, the limit is {}",
            length, max_length
        )));
    }

    scan_for_nested_quantifiers(pattern)?;

    regex::Regex::new(pattern)
        .map_err(|e| Error::InvalidQuery(format!("regex /{}/ does not compile: {}", pattern, e)))?;
    Ok(())
}

struct Frame {
    start: usize,
    has_unbounded: bool,
}

fn scan_for_nested_quantifiers(pattern: &str) -> Result<()> {
    let chars: Vec<char> = pattern.chars().collect();
    // Bottom frame is the whole pattern
    let mut stack = vec![Frame {
        start: 0,
        has_unbounded: false,
    }];

    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '\\' => {
                i += 2;
                continue;
            }
            '[' => {
                i = skip_class(&chars, i);
                continue;
            }
            '(' => stack.push(Frame {
                start: i,
                has_unbounded: false,
            }),
            ')' if stack.len() > 1 => {
                let Some(group) = stack.pop() else { break };
                let quantified = is_unbounded_quantifier(&chars, i + 1);

                if quantified && group.has_unbounded {
                    return Err(Error::UnsafeRegex(format!(
                        "nested unbounded quantifier in '{}'",
                        chars[group.start..=i].iter().collect::<String>()
                    )));
                }
                if quantified && has_overlapping_alternatives(&chars[group.start + 1..i]) {
                    return Err(Error::UnsafeRegex(format!(
                        "repeated alternation with overlapping branches in '{}'",
                        chars[group.start..=i].iter().collect::<String>()
                    )));
                }
                if let Some(parent) = stack.last_mut() {
                    parent.has_unbounded |= group.has_unbounded || quantified;
                }
            }
            _ => {
                if is_unbounded_quantifier(&chars, i) {
                    if let Some(frame) = stack.last_mut() {
                        frame.has_unbounded = true;
                    }
                }
            }
        }
        i += 1;
    }
    Ok(())
}

/// Index just past the character class opening at `open`
fn skip_class(chars: &[char], open: usize) -> usize {
    let mut i = open + 1;
    if chars.get(i) == Some(&'^') {
        i += 1;
    }
    // Leading ']' is a literal
    if chars.get(i) == Some(&']') {
        i += 1;
    }
    while i < chars.len() {
        match chars[i] {
            '\\' => i += 2,
            ']' => return i + 1,
            _ => i += 1,
        }
    }
    i
}

/// `+`, `*` or `{n,}` starting at `at`
fn is_unbounded_quantifier(chars: &[char], at: usize) -> bool {
    match chars.get(at) {
        Some('+') | Some('*') => true,
        Some('{') => {
            let mut i = at + 1;
            let digits_start = i;
            while chars.get(i).is_some_and(|c| c.is_ascii_digit()) {
                i += 1;
            }
            i > digits_start && chars.get(i) == Some(&',') && chars.get(i + 1) == Some(&'}')
        }
        _ => false,
    }
}

/// Whether two top-level branches of a group body are equal or one is a
/// prefix of the other
fn has_overlapping_alternatives(body: &[char]) -> bool {
    let mut branches: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;
    let mut i = 0;

    // Non-capturing and flag prefixes are not part of any branch
    if body.first() == Some(&'?') {
        if let Some(colon) = body.iter().position(|c| *c == ':') {
            i = colon + 1;
        }
    }

    while i < body.len() {
        match body[i] {
            '\\' => {
                current.push('\\');
                if let Some(next) = body.get(i + 1) {
                    current.push(*next);
                }
                i += 2;
                continue;
            }
            '[' => {
                let end = skip_class(body, i);
                current.extend(&body[i..end.min(body.len())]);
                i = end;
                continue;
            }
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            '|' if depth == 0 => {
                branches.push(std::mem::take(&mut current));
                i += 1;
                continue;
            }
            _ => {}
        }
        current.push(body[i]);
        i += 1;
    }
    branches.push(current);

    if branches.len() < 2 {
        return false;
    }
    for (a_idx, a) in branches.iter().enumerate() {
        for b in branches.iter().skip(a_idx + 1) {
            if a.starts_with(b.as_str()) || b.starts_with(a.as_str()) {
                return true;
            }
        }
    }
    false
}
