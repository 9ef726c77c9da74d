//! Wildcard pattern matching with capture spans.
//!
//! Patterns contain literal characters and the wildcard `*`, which matches
//! any run of zero or more characters (newlines included). A pattern matches
//! only if it covers the entire subject string. There is no escape syntax:
//! every non-`*` character is literal.

use std::cell::Cell;

/// Maximum number of recursive calls for a single match. Protects against
/// adversarial patterns like `*a*a*a*...*a` that cause O(n^k) backtracking.
/// Counted as total work (calls), not stack depth, to bound actual CPU cost.
const MAX_MATCH_CALLS: usize = 100_000;

/// Check if a string contains the wildcard character.
///
/// Useful for callers that want to detect when a key argument is a pattern
/// and switch to pattern-matching mode.
///
/// ```
/// use skein_glob::contains_wildcard;
/// assert!(contains_wildcard("Age *"));
/// assert!(!contains_wildcard("Age 41"));
/// ```
pub fn contains_wildcard(s: &str) -> bool {
    s.contains('*')
}

/// Match a subject string against a wildcard pattern.
///
/// Returns true if the pattern matches the entire subject.
///
/// # Examples
/// ```
/// use skein_glob::wildcard_match;
///
/// assert!(wildcard_match("Age *", "Age 41"));
/// assert!(wildcard_match("*", ""));
/// assert!(!wildcard_match("Age *", "Name tom"));
/// ```
pub fn wildcard_match(pattern: &str, input: &str) -> bool {
    wildcard_captures(pattern, input).is_some()
}

/// Match and return what each `*` consumed, in pattern order.
///
/// Returns `None` on non-match. On match the vector has one entry per `*`
/// in the pattern; captures are addressed 1-based by callers. The leftmost
/// `*` takes the longest possible run, then the next, recursively
/// (greedy-left with backtracking).
///
/// # Examples
/// ```
/// use skein_glob::wildcard_captures;
///
/// assert_eq!(wildcard_captures("Age *", "Age 41"), Some(vec!["41".to_string()]));
/// assert_eq!(
///     wildcard_captures("*-*", "a-b-c"),
///     Some(vec!["a-b".to_string(), "c".to_string()])
/// );
/// assert_eq!(wildcard_captures("x*", "y"), None);
/// ```
pub fn wildcard_captures(pattern: &str, input: &str) -> Option<Vec<String>> {
    let pat_chars: Vec<char> = pattern.chars().collect();
    let input_chars: Vec<char> = input.chars().collect();
    let calls = Cell::new(0usize);
    let mut spans: Vec<(usize, usize)> = Vec::new();
    if match_bounded(&pat_chars, 0, &input_chars, 0, &mut spans, &calls) {
        Some(
            spans
                .iter()
                .map(|&(from, to)| input_chars[from..to].iter().collect())
                .collect(),
        )
    } else {
        None
    }
}

/// Work-bounded recursive matching with backtracking for `*`.
///
/// Returns `false` (non-match) if total recursive calls exceed
/// `MAX_MATCH_CALLS`, preventing runaway backtracking on adversarial
/// patterns. `spans` accumulates the half-open input range consumed by each
/// `*`; entries are popped again when a branch backtracks.
fn match_bounded(
    pattern: &[char],
    pi: usize,
    input: &[char],
    ii: usize,
    spans: &mut Vec<(usize, usize)>,
    calls: &Cell<usize>,
) -> bool {
    let count = calls.get() + 1;
    calls.set(count);
    if count > MAX_MATCH_CALLS {
        return false;
    }

    // Both exhausted - match!
    if pi >= pattern.len() && ii >= input.len() {
        return true;
    }

    // Pattern exhausted but input remains - no match
    if pi >= pattern.len() {
        return false;
    }

    match pattern[pi] {
        '*' => {
            // Longest first: the leftmost star prefers the longest run.
            for take in (0..=(input.len() - ii)).rev() {
                spans.push((ii, ii + take));
                if match_bounded(pattern, pi + 1, input, ii + take, spans, calls) {
                    return true;
                }
                spans.pop();
            }
            false
        }

        c => {
            // Literal character match
            if ii >= input.len() {
                return false;
            }
            if c == input[ii] {
                match_bounded(pattern, pi + 1, input, ii + 1, spans, calls)
            } else {
                false
            }
        }
    }
}
