//! `Sequence`, the scheduler-owned backing store for one resident (or
//! evicted) KV-cache slot, and the per-step runtime logic of §4.4: role-switch
//! prologues, completion sampling, regex-constrained matching, and failure
//! bookkeeping.

use rand::Rng;

use crate::engine::{EngineAdapter, SeqNum, TokenId};
use crate::error::EngineError;
use crate::op::Role;
use crate::pattern::{MatchClass, PatternMatcher};
use crate::sampling::{self, Candidate};

const END_MARKER: &str = "<|end|>";

/// The six fixed role-switch token runs (§4.4.1), tokenized once at engine
/// construction and cached for the process lifetime.
pub struct RolePrologues {
    null_system: Vec<TokenId>,
    null_user: Vec<TokenId>,
    null_assistant: Vec<TokenId>,
    end_system: Vec<TokenId>,
    end_user: Vec<TokenId>,
    end_assistant: Vec<TokenId>,
}

impl RolePrologues {
    pub fn compute(engine: &dyn EngineAdapter) -> Result<Self, EngineError> {
        Ok(Self {
            null_system: engine.tokenize("<|system|>\n")?,
            null_user: engine.tokenize("<|user|>\n")?,
            null_assistant: engine.tokenize("<|assistant|>\n")?,
            end_system: engine.tokenize("<|end|>\n<|system|>\n")?,
            end_user: engine.tokenize("<|end|>\n<|user|>\n")?,
            end_assistant: engine.tokenize("<|end|>\n<|assistant|>\n")?,
        })
    }

    /// The token run to prepend when switching from `from` to `to`. Empty
    /// when no switch is needed.
    pub fn run_for(&self, from: Option<Role>, to: Role) -> &[TokenId] {
        match from {
            None => match to {
                Role::System => &self.null_system,
                Role::User => &self.null_user,
                Role::Assistant => &self.null_assistant,
            },
            Some(r) if r == to => &[],
            Some(_) => match to {
                Role::System => &self.end_system,
                Role::User => &self.end_user,
                Role::Assistant => &self.end_assistant,
            },
        }
    }
}

/// Ongoing state of a `MatchPattern` operation for one sequence (§4.4.4).
#[derive(Debug, Clone, Default)]
pub struct MatchRuntime {
    pub current_match: String,
    pub logit_sum: f32,
}

/// The scheduler's view of one path through a program (§3).
#[derive(Debug, Clone, Default)]
pub struct Sequence {
    /// `None` means not currently resident in the engine's KV cache.
    pub seq_num: Option<SeqNum>,
    pub tokens: Vec<TokenId>,
    pub current_role: Option<Role>,
    pub logits: Option<Vec<f32>>,
    pub remaining: u32,
    pub done: bool,
    pub failure_count: u32,
    /// The path id backing this sequence's KV-cache parent, consumed
    /// (taken) the first time residency is allocated (§4.3 step 3). `None`
    /// both for a sequence with no parent and, after first allocation, for
    /// one whose parent copy has already happened.
    pub parent_path: Option<u64>,
    /// The leaf operation this sequence is currently backing; used by the
    /// scheduler to detect when the path has advanced to a new operation
    /// and per-operation scratch state needs resetting.
    pub current_operation_id: Option<crate::op::OperationId>,
    /// Accumulated decoded text for the in-progress `Completion` operation
    /// only; reset whenever a new `Completion` begins.
    pub completion_text: String,
    pub match_state: Option<MatchRuntime>,
}

impl Sequence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_parent_path(parent_path: Option<u64>) -> Self {
        Self {
            parent_path,
            ..Self::default()
        }
    }

    pub fn is_resident(&self) -> bool {
        self.seq_num.is_some()
    }

    /// Evict this sequence from the engine's KV cache (§4.4.5); `tokens`
    /// is preserved so the scheduler can replay it on rematerialization.
    pub fn evict(&mut self) {
        self.seq_num = None;
        self.logits = None;
        self.failure_count += 1;
    }

    pub fn begin_completion(&mut self, max_tokens: u32) {
        self.completion_text.clear();
        self.remaining = max_tokens;
    }

    pub fn begin_match_pattern(&mut self) {
        self.match_state = Some(MatchRuntime::default());
    }
}

pub struct CompletionStepOutcome {
    pub token: TokenId,
    pub candidates: Vec<Candidate>,
    pub terminated: bool,
}

/// Advance a resident `Completion` sequence by one sampled token (§4.4.2).
/// Requires `seq.logits` to be populated by the most recent decode.
pub fn sample_completion_step(
    seq: &mut Sequence,
    engine: &dyn EngineAdapter,
    temperature: f32,
    top_p_k: u32,
    rng: &mut impl Rng,
) -> CompletionStepOutcome {
    let logits = seq
        .logits
        .take()
        .expect("sample_completion_step requires populated logits");
    let (token, candidates) = sampling::sample_completion(&logits, temperature, top_p_k, rng);

    seq.tokens.push(token);
    seq.completion_text.push_str(&engine.token_to_piece(token));
    seq.remaining = seq.remaining.saturating_sub(1);

    let mut terminated = engine.is_end_of_generation(token);
    if !terminated && seq.completion_text.contains(END_MARKER) {
        seq.completion_text = seq.completion_text.replace(END_MARKER, "");
        terminated = true;
    }
    if seq.remaining == 0 {
        terminated = true;
    }

    CompletionStepOutcome {
        token,
        candidates,
        terminated,
    }
}

fn strip_whitespace(s: &str) -> String {
    s.chars().filter(|c| !c.is_whitespace()).collect()
}

pub enum MatchOutcome {
    Continue,
    Matched { logit_sum: f32 },
    Failed,
}

/// Advance a resident `MatchPattern` sequence by one step (§4.4.4): try
/// candidate tokens by descending logit until one keeps the accumulated
/// match alive or completes it; fail the operation if none do.
pub fn match_pattern_step(
    seq: &mut Sequence,
    engine: &dyn EngineAdapter,
    matcher: &PatternMatcher,
) -> MatchOutcome {
    let logits = seq
        .logits
        .take()
        .expect("match_pattern_step requires populated logits");
    let current = seq.match_state.get_or_insert_with(MatchRuntime::default).current_match.clone();

    let mut ranked: Vec<(TokenId, f32)> = logits
        .iter()
        .enumerate()
        .map(|(id, &logit)| (id as TokenId, logit))
        .collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1));

    for (token, logit) in ranked {
        let piece = engine.token_to_piece(token);
        let candidate = format!("{current}{piece}");
        if strip_whitespace(&candidate) == strip_whitespace(&current) {
            continue;
        }
        match matcher.classify(&candidate) {
            MatchClass::Dead => continue,
            MatchClass::Partial => {
                seq.tokens.push(token);
                let state = seq.match_state.get_or_insert_with(MatchRuntime::default);
                state.current_match = candidate;
                state.logit_sum += logit;
                return MatchOutcome::Continue;
            }
            MatchClass::Full => {
                seq.tokens.push(token);
                let state = seq.match_state.get_or_insert_with(MatchRuntime::default);
                state.current_match = candidate;
                state.logit_sum += logit;
                return MatchOutcome::Matched {
                    logit_sum: state.logit_sum,
                };
            }
        }
    }
    MatchOutcome::Failed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::reference::ReferenceEngine;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn role_prologues_distinguish_null_and_end_runs() {
        let engine = ReferenceEngine::new(512, 4096);
        let prologues = RolePrologues::compute(&engine).unwrap();
        assert_ne!(
            prologues.run_for(None, Role::User),
            prologues.run_for(Some(Role::System), Role::User)
        );
        assert!(prologues.run_for(Some(Role::User), Role::User).is_empty());
    }

    #[test]
    fn completion_step_terminates_on_engine_eog() {
        let engine = ReferenceEngine::new(512, 4096);
        let mut seq = Sequence::new();
        seq.begin_completion(20);
        let mut logits = vec![-10.0_f32; engine.vocab_size()];
        logits[crate::engine::reference::EOG_TOKEN as usize] = 1000.0;
        seq.logits = Some(logits);
        let mut rng = StdRng::seed_from_u64(3);
        let outcome = sample_completion_step(&mut seq, &engine, 1.0, 0, &mut rng);
        assert_eq!(outcome.token, crate::engine::reference::EOG_TOKEN);
        assert!(outcome.terminated);
    }

    #[test]
    fn completion_step_terminates_when_remaining_reaches_zero() {
        let engine = ReferenceEngine::new(512, 4096);
        let mut seq = Sequence::new();
        seq.begin_completion(1);
        seq.logits = Some(vec![0.0_f32; engine.vocab_size()]);
        let mut rng = StdRng::seed_from_u64(9);
        let outcome = sample_completion_step(&mut seq, &engine, 1.0, 0, &mut rng);
        assert!(outcome.terminated);
        assert_eq!(seq.remaining, 0);
    }

    #[test]
    fn match_pattern_accepts_partial_then_completes() {
        let engine = ReferenceEngine::new(512, 4096);
        let matcher = PatternMatcher::compile("ok").unwrap();
        let mut seq = Sequence::new();
        seq.begin_match_pattern();

        let mut logits = vec![-10.0_f32; engine.vocab_size()];
        logits[b'o' as usize] = 1000.0;
        seq.logits = Some(logits);
        let outcome = match_pattern_step(&mut seq, &engine, &matcher);
        assert!(matches!(outcome, MatchOutcome::Continue));

        let mut logits = vec![-10.0_f32; engine.vocab_size()];
        logits[b'k' as usize] = 1000.0;
        seq.logits = Some(logits);
        let outcome = match_pattern_step(&mut seq, &engine, &matcher);
        assert!(matches!(outcome, MatchOutcome::Matched { .. }));
    }

    #[test]
    fn match_pattern_fails_when_no_candidate_matches() {
        let engine = ReferenceEngine::new(512, 4096);
        let matcher = PatternMatcher::compile("ok").unwrap();
        let mut seq = Sequence::new();
        seq.begin_match_pattern();
        seq.match_state.as_mut().unwrap().current_match = "z".to_string();
        seq.logits = Some(vec![0.0_f32; engine.vocab_size()]);
        let outcome = match_pattern_step(&mut seq, &engine, &matcher);
        assert!(matches!(outcome, MatchOutcome::Failed));
    }
}
