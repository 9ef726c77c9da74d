//! skein-glob: `*`-wildcard matching with positional captures.
//!
//! Provides:
//! - **wildcard_match**: Whole-string matching where `*` spans any run of
//!   characters
//! - **wildcard_captures**: The same match, returning what each `*` consumed
//!   (1-based positional captures for replacement back-references)
//! - **contains_wildcard**: Detect whether a string is a pattern at all
//!
//! Matching is greedy-left with backtracking: the leftmost `*` prefers the
//! longest assignment, then the next, recursively.

pub mod glob;

pub use glob::{contains_wildcard, wildcard_captures, wildcard_match};
