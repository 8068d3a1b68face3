//! Regex-constrained partial matching for the `MatchPattern` operation
//! (§4.4.4).
//!
//! Python's `regex` module (used by `original_source/inference/beam.py`)
//! supports `partial=True` matching: given a short prefix, it can tell you
//! whether the prefix is already dead (no completion of the pattern can
//! start with it), a live partial match, or a full match. The standard
//! `regex` crate has no equivalent — it only ever reports full matches — so
//! this is built directly on `regex-automata`'s dense DFA, walking it byte
//! by byte and reading the automaton's own dead/match state classification
//! instead of asking a higher-level search API for a verdict.

use regex_automata::dfa::{dense, Automaton};
use regex_automata::Input;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchClass {
    /// No continuation of `candidate` can ever match the pattern.
    Dead,
    /// `candidate` does not yet match, but some continuation might.
    Partial,
    /// `candidate` matches the pattern in full.
    Full,
}

pub struct PatternMatcher {
    dfa: dense::DFA<Vec<u32>>,
}

impl PatternMatcher {
    pub fn compile(pattern: &str) -> Result<Self, dense::BuildError> {
        let dfa = dense::DFA::new(pattern)?;
        Ok(Self { dfa })
    }

    /// Classify `candidate` under partial-match semantics.
    pub fn classify(&self, candidate: &str) -> MatchClass {
        let input = Input::new(candidate).anchored(regex_automata::Anchored::Yes);
        let mut state = match self.dfa.start_state_forward(&input) {
            Ok(s) => s,
            Err(_) => return MatchClass::Dead,
        };
        for &byte in candidate.as_bytes() {
            state = self.dfa.next_state(state, byte);
            if self.dfa.is_dead_state(state) {
                return MatchClass::Dead;
            }
        }
        let eoi_state = self.dfa.next_eoi_state(state);
        if self.dfa.is_match_state(eoi_state) {
            MatchClass::Full
        } else {
            MatchClass::Partial
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dead_prefix_is_rejected_immediately() {
        let m = PatternMatcher::compile("abc").unwrap();
        assert_eq!(m.classify("z"), MatchClass::Dead);
    }

    #[test]
    fn partial_prefix_stays_alive() {
        let m = PatternMatcher::compile("abc").unwrap();
        assert_eq!(m.classify("ab"), MatchClass::Partial);
    }

    #[test]
    fn full_match_is_detected() {
        let m = PatternMatcher::compile("abc").unwrap();
        assert_eq!(m.classify("abc"), MatchClass::Full);
    }

    #[test]
    fn alternation_keeps_both_branches_alive_until_divergence() {
        let m = PatternMatcher::compile("cat|car").unwrap();
        assert_eq!(m.classify("ca"), MatchClass::Partial);
        assert_eq!(m.classify("cat"), MatchClass::Full);
        assert_eq!(m.classify("cab"), MatchClass::Dead);
    }
}
