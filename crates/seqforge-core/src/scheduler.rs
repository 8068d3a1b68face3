//! The continuous-batching scheduler (§4.3): drives one client program to
//! completion tick by tick over a single [`EngineAdapter`], mediating
//! KV-cache residency, role-switch/feed-token submission, and sampling.
//!
//! `Sequence`s are keyed by *path id* (§3), not by operation id: every leaf
//! operation on the same linear chain of a program shares one `Sequence` for
//! its whole lifetime, so `current_role`/`tokens`/`seq_num` persist across an
//! ordinary advance to the next operation. Only a genuine `Branch` starts a
//! new path (and therefore a new `Sequence`, KV-copied from its parent).

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rand::rngs::ThreadRng;
use rand::Rng;

use crate::config::{Config, ForkSelectionStrategy};
use crate::context::{FirstFork, ForkSelector, Interpreter};
use crate::engine::{DecodeBatch, EngineAdapter, SeqNum, TokenId};
use crate::error::{EngineError, SchedulerError};
use crate::op::{self, Operation, OperationId, OperationKind, Program};
use crate::sampling::Candidate;
use crate::sequence::{self, MatchOutcome, RolePrologues, Sequence};

/// A sequence has this many consecutive decode failures before the
/// scheduler gives up on it and marks it `done` with an error (§7).
const MAX_SEQUENCE_FAILURES: u32 = 3;

/// One streamed token, emitted as the sequence runtime produces it (§4.2).
#[derive(Debug, Clone)]
pub struct StepEvent {
    pub operation_id: OperationId,
    pub token_index: u32,
    pub token_id: TokenId,
    pub top_candidates: Vec<Candidate>,
}

/// The terminal outcome of one leaf operation.
#[derive(Debug, Clone)]
pub struct OperationResult {
    pub operation_id: OperationId,
    pub text: String,
    pub match_logit_sum: Option<f32>,
    pub error: Option<String>,
}

/// A cooperative cancellation flag, checked once per scheduler tick (§5:
/// "if a client disconnects mid-request, the request façade signals the
/// interpreter; the scheduler sees this on its next tick and reaps all
/// sequences tied to that request"). Cloning shares the same underlying
/// flag, so a request façade can hold one clone and hand another to
/// `Scheduler::run`.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Picks the winning fork by the accumulated `logit_sum` its terminal
/// `MatchPattern` leaf reported, falling back to the first candidate when no
/// score is available (§9, `max_likelihood` strategy). Scores come from
/// `results` rather than live `Sequence`s, since a fork's backing sequence is
/// typically already reaped by the time its branch resolves a winner.
struct ScoredFork<'a> {
    results: &'a HashMap<OperationId, OperationResult>,
}

impl ForkSelector for ScoredFork<'_> {
    fn select(&self, candidates: &[OperationId]) -> OperationId {
        candidates
            .iter()
            .copied()
            .max_by(|a, b| self.score(*a).total_cmp(&self.score(*b)))
            .unwrap_or(candidates[0])
    }
}

impl ScoredFork<'_> {
    fn score(&self, id: OperationId) -> f32 {
        self.results
            .get(&id)
            .and_then(|r| r.match_logit_sum)
            .unwrap_or(f32::MIN)
    }
}

pub struct Scheduler<E: EngineAdapter> {
    engine: E,
    config: Config,
    prologues: RolePrologues,
    next_seq_num: SeqNum,
    free_seq_nums: Vec<SeqNum>,
}

impl<E: EngineAdapter> Scheduler<E> {
    pub fn new(engine: E, config: Config) -> Result<Self, EngineError> {
        let prologues = RolePrologues::compute(&engine)?;
        Ok(Self {
            engine,
            config,
            prologues,
            next_seq_num: 0,
            free_seq_nums: Vec::new(),
        })
    }

    /// Tokenize free-form text through the underlying engine, without
    /// touching scheduler state. Used by the HTTP façade's `/tokenize`.
    pub fn tokenize(&self, text: &str) -> Result<Vec<TokenId>, EngineError> {
        self.engine.tokenize(text)
    }

    /// The decoded text for every token id in `0..vocab_size()`, in order.
    /// Used by the HTTP façade's `/token_map`.
    pub fn token_map(&self) -> Vec<String> {
        (0..self.engine.vocab_size() as TokenId)
            .map(|t| self.engine.token_to_piece(t))
            .collect()
    }

    fn alloc_seq_num(&mut self) -> Result<SeqNum, SchedulerError> {
        if let Some(n) = self.free_seq_nums.pop() {
            return Ok(n);
        }
        if (self.next_seq_num as usize) >= self.engine.batch_size().max(self.config.batch_size as usize) * 4 {
            return Err(SchedulerError::OutOfSequenceNumbers);
        }
        let n = self.next_seq_num;
        self.next_seq_num += 1;
        Ok(n)
    }

    fn free_seq_num(&mut self, n: SeqNum) {
        self.free_seq_nums.push(n);
    }

    /// Drive `program` to completion, invoking `on_token` for every sampled
    /// or fed token. Returns one [`OperationResult`] per leaf operation, or
    /// a [`SchedulerError`] if the program is malformed, the tick cap is
    /// reached before completion, or `cancel` is signalled mid-run.
    pub fn run(
        &mut self,
        program: Program,
        cancel: &CancelToken,
        mut on_token: impl FnMut(StepEvent),
    ) -> Result<Vec<OperationResult>, SchedulerError> {
        let leaf_ops = op::index_leaf_operations(&program);
        let mut interpreter = Interpreter::new(program);
        let mut sequences: HashMap<u64, Sequence> = HashMap::new();
        let mut results: HashMap<OperationId, OperationResult> = HashMap::new();
        let mut token_indices: HashMap<OperationId, u32> = HashMap::new();
        let mut rng = rand::thread_rng();

        let mut ticks = 0u32;
        loop {
            if cancel.is_cancelled() {
                for seq in sequences.values_mut() {
                    seq.done = true;
                }
                self.reap_completed(&mut sequences);
                return Err(SchedulerError::Cancelled);
            }
            if ticks >= self.config.tick_cap {
                return Err(SchedulerError::CapacityExceeded {
                    cap: self.config.tick_cap,
                });
            }
            ticks += 1;

            let contexts = match self.config.fork_selection_strategy {
                ForkSelectionStrategy::First => interpreter.step(&FirstFork),
                ForkSelectionStrategy::MaxLikelihood => {
                    let selector = ScoredFork { results: &results };
                    interpreter.step(&selector)
                }
            };
            if interpreter.done {
                break;
            }

            // Step 1: bind each runnable context to its path's sequence,
            // creating a fresh one only the first time a path is seen
            // (fork start), and reset per-operation scratch state only when
            // the path's active leaf operation has actually changed.
            let active_paths: HashSet<u64> = contexts.iter().map(|c| c.path_id).collect();
            for ctx in &contexts {
                let seq = sequences
                    .entry(ctx.path_id)
                    .or_insert_with(|| Sequence::with_parent_path(ctx.parent_path));
                if seq.current_operation_id != Some(ctx.id) {
                    seq.current_operation_id = Some(ctx.id);
                    let op = leaf_ops.get(&ctx.id).expect("runnable context must resolve to a leaf operation");
                    match &op.kind {
                        OperationKind::Completion(spec) => seq.begin_completion(spec.max_tokens),
                        OperationKind::MatchPattern(_) => seq.begin_match_pattern(),
                        _ => {}
                    }
                }
            }

            self.allocate_residency(&mut sequences)?;

            // Step 2: a path whose leaf no longer appears among this tick's
            // contexts, and that no other sequence is still waiting to copy
            // its KV state from, has nothing left to do — either it forked
            // (its children now carry the work) or the interpreter has
            // nothing further queued for it (§4.3 step 4).
            let still_needed_as_parent: HashSet<u64> =
                sequences.values().filter_map(|s| s.parent_path).collect();
            for (path_id, seq) in sequences.iter_mut() {
                if !seq.done && !active_paths.contains(path_id) && !still_needed_as_parent.contains(path_id) {
                    seq.done = true;
                }
            }

            self.reap_completed(&mut sequences);
            self.feed_fixed_tokens(&mut sequences, &leaf_ops, &mut interpreter, &mut results, &mut token_indices, &mut on_token)?;
            self.sample_step(&mut sequences, &leaf_ops, &mut interpreter, &mut results, &mut token_indices, &mut rng, &mut on_token)?;

            for ctx in &contexts {
                if let Some(seq) = sequences.get(&ctx.path_id) {
                    if seq.failure_count >= MAX_SEQUENCE_FAILURES && !seq.done {
                        results.entry(ctx.id).or_insert_with(|| OperationResult {
                            operation_id: ctx.id,
                            text: String::new(),
                            match_logit_sum: None,
                            error: Some(format!(
                                "sequence exceeded {MAX_SEQUENCE_FAILURES} consecutive decode failures"
                            )),
                        });
                        interpreter.complete(ctx.id);
                        sequences.get_mut(&ctx.path_id).unwrap().done = true;
                    }
                }
            }
        }

        Ok(results.into_values().collect())
    }

    /// §4.3 step 3: allocate a fresh `seq_num` for every non-resident,
    /// non-done sequence, by prefix-copy from a resident parent,
    /// replay-recovery of its own token history, or fresh assignment.
    fn allocate_residency(&mut self, sequences: &mut HashMap<u64, Sequence>) -> Result<(), SchedulerError> {
        let parent_seq_nums: HashMap<u64, Option<SeqNum>> =
            sequences.iter().map(|(id, s)| (*id, s.seq_num)).collect();
        let parent_logits: HashMap<u64, Option<Vec<f32>>> =
            sequences.iter().map(|(id, s)| (*id, s.logits.clone())).collect();
        let parent_role: HashMap<u64, Option<crate::op::Role>> =
            sequences.iter().map(|(id, s)| (*id, s.current_role)).collect();
        let parent_tokens: HashMap<u64, Vec<TokenId>> =
            sequences.iter().map(|(id, s)| (*id, s.tokens.clone())).collect();

        let pending: Vec<u64> = sequences
            .iter()
            .filter(|(_, s)| s.seq_num.is_none() && !s.done)
            .map(|(id, _)| *id)
            .collect();

        for path_id in pending {
            let parent = sequences.get(&path_id).unwrap().parent_path;
            if let Some(parent_path) = parent {
                match parent_seq_nums.get(&parent_path).copied().flatten() {
                    Some(parent_n) => {
                        let n = self.alloc_seq_num()?;
                        self.engine.kv_copy(parent_n, n);
                        let seq = sequences.get_mut(&path_id).unwrap();
                        seq.logits = parent_logits.get(&parent_path).cloned().flatten();
                        seq.current_role = parent_role.get(&parent_path).copied().flatten();
                        seq.tokens = parent_tokens.get(&parent_path).cloned().unwrap_or_default();
                        seq.parent_path = None;
                        seq.seq_num = Some(n);
                    }
                    None => continue, // parent not yet resident; retry next tick
                }
                continue;
            }

            let needs_replay = !sequences.get(&path_id).unwrap().tokens.is_empty();
            if needs_replay {
                let n = self.alloc_seq_num()?;
                let tokens = sequences.get(&path_id).unwrap().tokens.clone();
                match self.replay(n, &tokens) {
                    Ok(logits) => {
                        let seq = sequences.get_mut(&path_id).unwrap();
                        seq.seq_num = Some(n);
                        seq.logits = Some(logits);
                    }
                    Err(_) => {
                        self.engine.kv_remove(n);
                        self.free_seq_num(n);
                        let seq = sequences.get_mut(&path_id).unwrap();
                        seq.failure_count += 1;
                    }
                }
            } else {
                let n = self.alloc_seq_num()?;
                sequences.get_mut(&path_id).unwrap().seq_num = Some(n);
            }
        }
        Ok(())
    }

    /// Replay `tokens` against fresh KV handle `n` in sub-batches of at
    /// most `batch_size`, returning the final logits (§4.3 step 3b).
    fn replay(&mut self, n: SeqNum, tokens: &[TokenId]) -> Result<Vec<f32>, EngineError> {
        let chunk_size = self.config.batch_size as usize;
        let mut last_logits = Vec::new();
        for (chunk_index, chunk) in tokens.chunks(chunk_size.max(1)).enumerate() {
            let mut batch = DecodeBatch::new(chunk.len());
            for (i, &token) in chunk.iter().enumerate() {
                let pos = (chunk_index * chunk_size + i) as i32;
                let is_last = chunk_index * chunk_size + i == tokens.len() - 1;
                batch.push(token, pos, n, is_last)?;
            }
            self.engine.decode(&batch)?;
            last_logits = self.engine.logits_of(chunk.len() - 1).to_vec();
        }
        Ok(last_logits)
    }

    /// §4.3 step 4: reap every sequence whose path has nothing left to do.
    fn reap_completed(&mut self, sequences: &mut HashMap<u64, Sequence>) {
        for seq in sequences.values_mut() {
            if seq.done {
                if let Some(n) = seq.seq_num.take() {
                    self.engine.kv_remove(n);
                    self.free_seq_num(n);
                }
            }
        }
    }

    /// §4.3 step 5 / §4.4.1 / §4.4.3: submit role-switch prologues and
    /// `FeedTokens` payloads for every resident sequence that needs them.
    fn feed_fixed_tokens(
        &mut self,
        sequences: &mut HashMap<u64, Sequence>,
        leaf_ops: &HashMap<OperationId, Operation>,
        interpreter: &mut Interpreter,
        results: &mut HashMap<OperationId, OperationResult>,
        token_indices: &mut HashMap<OperationId, u32>,
        on_token: &mut impl FnMut(StepEvent),
    ) -> Result<(), SchedulerError> {
        let mut tokens_submitted = 0u32;
        let path_ids: Vec<u64> = sequences
            .iter()
            .filter(|(_, s)| s.is_resident() && !s.done)
            .map(|(id, _)| *id)
            .collect();

        for path_id in path_ids {
            if tokens_submitted >= self.config.batch_max_tokens {
                break;
            }
            let op_id = sequences.get(&path_id).unwrap().current_operation_id.expect("resident sequence tracks its current operation");
            let op = leaf_ops.get(&op_id).expect("resident sequence must back a leaf operation");
            let desired_role = op.role().expect("leaf operation carries a role");

            let seq = sequences.get(&path_id).unwrap();
            let mut run: Vec<TokenId> = Vec::new();
            if seq.current_role != Some(desired_role) {
                run.extend_from_slice(self.prologues.run_for(seq.current_role, desired_role));
            }
            let is_feed_tokens = matches!(op.kind, OperationKind::FeedTokens(_));
            if let OperationKind::FeedTokens(spec) = &op.kind {
                run.extend_from_slice(&spec.tokens);
            }
            if run.is_empty() {
                continue;
            }

            let seq_num = seq.seq_num.unwrap();
            let start_pos = seq.tokens.len() as i32;
            let top_p_k = op.top_p_k();
            match self.submit_run(seq_num, start_pos, &run) {
                Ok(per_position_logits) => {
                    let seq = sequences.get_mut(&path_id).unwrap();
                    for (i, &token) in run.iter().enumerate() {
                        seq.tokens.push(token);
                        let idx = token_indices.entry(op_id).or_insert(0);
                        let (_, mut candidates) =
                            crate::sampling::sample_completion(&per_position_logits[i], 1.0, top_p_k, &mut rand::thread_rng());
                        if !candidates.iter().any(|(id, _)| *id == token) {
                            candidates.push((token, per_position_logits[i][token as usize]));
                        }
                        on_token(StepEvent {
                            operation_id: op_id,
                            token_index: *idx,
                            token_id: token,
                            top_candidates: candidates,
                        });
                        *idx += 1;
                    }
                    seq.current_role = Some(desired_role);
                    seq.logits = per_position_logits.last().cloned();
                    if is_feed_tokens {
                        results.entry(op_id).or_insert_with(|| OperationResult {
                            operation_id: op_id,
                            text: String::new(),
                            match_logit_sum: None,
                            error: None,
                        });
                        interpreter.complete(op_id);
                        // Sequence stays resident: the path continues on to
                        // its next operation (or a fork, which will copy
                        // from it) under the same `path_id`.
                    }
                }
                Err(_) => {
                    self.engine.kv_remove(seq_num);
                    self.free_seq_num(seq_num);
                    let seq = sequences.get_mut(&path_id).unwrap();
                    seq.seq_num = None;
                    seq.logits = None;
                    seq.failure_count += 1;
                }
            }
            tokens_submitted += run.len() as u32;
        }
        Ok(())
    }

    /// Submit `run` as one or more sub-batches of at most `batch_size`,
    /// requesting logits at every position (§4.3 step 5), and return each
    /// position's full logit vector in order.
    fn submit_run(&mut self, seq_num: SeqNum, start_pos: i32, run: &[TokenId]) -> Result<Vec<Vec<f32>>, EngineError> {
        let chunk_size = self.config.batch_size as usize;
        let mut out = Vec::with_capacity(run.len());
        for (chunk_index, chunk) in run.chunks(chunk_size.max(1)).enumerate() {
            let mut batch = DecodeBatch::new(chunk.len());
            for (i, &token) in chunk.iter().enumerate() {
                let pos = start_pos + (chunk_index * chunk_size + i) as i32;
                batch.push(token, pos, seq_num, true)?;
            }
            self.engine.decode(&batch)?;
            for i in 0..chunk.len() {
                out.push(self.engine.logits_of(i).to_vec());
            }
        }
        Ok(out)
    }

    /// §4.3 step 6-7: sample one token for every resident `Completion` /
    /// `MatchPattern` sequence with populated logits, composed into a single
    /// batch, and distribute the resulting logits back.
    fn sample_step(
        &mut self,
        sequences: &mut HashMap<u64, Sequence>,
        leaf_ops: &HashMap<OperationId, Operation>,
        interpreter: &mut Interpreter,
        results: &mut HashMap<OperationId, OperationResult>,
        token_indices: &mut HashMap<OperationId, u32>,
        rng: &mut ThreadRng,
        on_token: &mut impl FnMut(StepEvent),
    ) -> Result<(), SchedulerError> {
        let candidate_paths: Vec<u64> = sequences
            .iter()
            .filter(|(_, s)| {
                s.is_resident()
                    && !s.done
                    && s.logits.is_some()
                    && s.current_operation_id
                        .and_then(|id| leaf_ops.get(&id))
                        .map(|op| matches!(op.kind, OperationKind::Completion(_) | OperationKind::MatchPattern(_)))
                        .unwrap_or(false)
            })
            .map(|(id, _)| *id)
            .collect();

        if candidate_paths.is_empty() {
            return Ok(());
        }

        let mut sampled: HashMap<u64, (OperationId, TokenId, Option<Vec<Candidate>>, bool)> = HashMap::new();
        for &path_id in &candidate_paths {
            let op_id = sequences.get(&path_id).unwrap().current_operation_id.unwrap();
            let op = leaf_ops.get(&op_id).unwrap();
            let seq = sequences.get_mut(&path_id).unwrap();
            match &op.kind {
                OperationKind::Completion(spec) => {
                    let outcome = sequence::sample_completion_step(seq, &self.engine, self.config.temperature, spec.top_p_k, rng);
                    sampled.insert(path_id, (op_id, outcome.token, Some(outcome.candidates), outcome.terminated));
                }
                OperationKind::MatchPattern(spec) => {
                    let matcher = crate::pattern::PatternMatcher::compile(&spec.pattern)
                        .expect("pattern already validated at submission time");
                    let token = *seq.tokens.last().unwrap_or(&0);
                    let before_len = seq.tokens.len();
                    let outcome = sequence::match_pattern_step(seq, &self.engine, &matcher);
                    let appended_token = if seq.tokens.len() > before_len {
                        *seq.tokens.last().unwrap()
                    } else {
                        token
                    };
                    match outcome {
                        MatchOutcome::Continue => {
                            sampled.insert(path_id, (op_id, appended_token, None, false));
                        }
                        MatchOutcome::Matched { logit_sum } => {
                            sampled.insert(path_id, (op_id, appended_token, None, true));
                            results.entry(op_id).or_insert_with(|| OperationResult {
                                operation_id: op_id,
                                text: seq.match_state.as_ref().map(|m| m.current_match.clone()).unwrap_or_default(),
                                match_logit_sum: Some(logit_sum),
                                error: None,
                            });
                        }
                        MatchOutcome::Failed => {
                            results.entry(op_id).or_insert_with(|| OperationResult {
                                operation_id: op_id,
                                text: seq.match_state.as_ref().map(|m| m.current_match.clone()).unwrap_or_default(),
                                match_logit_sum: seq.match_state.as_ref().map(|m| m.logit_sum),
                                error: Some("no candidate token matched the pattern".to_string()),
                            });
                            seq.done = true;
                            interpreter.complete(op_id);
                        }
                    }
                }
                _ => unreachable!("filtered to Completion/MatchPattern above"),
            }
        }

        let mut batch = DecodeBatch::new(self.config.batch_size as usize);
        let mut order = Vec::new();
        for (&path_id, (_, token, _, _)) in &sampled {
            let seq = sequences.get(&path_id).unwrap();
            let pos = seq.tokens.len() as i32 - 1;
            if batch.push(*token, pos, seq.seq_num.unwrap(), true).is_ok() {
                order.push(path_id);
            }
        }

        if !order.is_empty() {
            match self.engine.decode(&batch) {
                Ok(()) => {
                    for (i, &path_id) in order.iter().enumerate() {
                        sequences.get_mut(&path_id).unwrap().logits = Some(self.engine.logits_of(i).to_vec());
                    }
                }
                Err(_) => {
                    for &path_id in &order {
                        let seq_num = sequences.get(&path_id).unwrap().seq_num.unwrap();
                        self.engine.kv_remove(seq_num);
                        self.free_seq_num(seq_num);
                        let seq = sequences.get_mut(&path_id).unwrap();
                        seq.seq_num = None;
                        seq.logits = None;
                        seq.failure_count += 1;
                    }
                }
            }
        }

        for (path_id, (op_id, token, candidates, terminated)) in sampled {
            if let Some(candidates) = candidates {
                let idx = token_indices.entry(op_id).or_insert(0);
                on_token(StepEvent {
                    operation_id: op_id,
                    token_index: *idx,
                    token_id: token,
                    top_candidates: candidates,
                });
                *idx += 1;
            }
            if terminated {
                let seq = sequences.get_mut(&path_id).unwrap();
                results.entry(op_id).or_insert_with(|| OperationResult {
                    operation_id: op_id,
                    text: seq.completion_text.clone(),
                    match_logit_sum: None,
                    error: None,
                });
                interpreter.complete(op_id);
                // Sequence stays resident; reaped later if its path truly
                // has nothing left to do (handled in `run`'s main loop).
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::reference::{ReferenceEngine, EOG_TOKEN};
    use crate::op::{CompletionSpec, FeedTokensSpec, MatchPatternSpec, OperationWire, Role};

    fn wire_completion(id: OperationId, role: Role, max_tokens: u32) -> OperationWire {
        OperationWire {
            id,
            name: "completion".to_string(),
            feed_tokens: None,
            completion: Some(CompletionSpec { role, max_tokens, top_p_k: 0 }),
            branch: None,
            match_pattern: None,
            result: None,
        }
    }

    fn wire_feed(id: OperationId, role: Role, tokens: Vec<TokenId>) -> OperationWire {
        OperationWire {
            id,
            name: "feed_tokens".to_string(),
            feed_tokens: Some(FeedTokensSpec { role, tokens, top_p_k: 0 }),
            completion: None,
            branch: None,
            match_pattern: None,
            result: None,
        }
    }

    #[test]
    fn completion_runs_to_engine_reported_eog() {
        let mut engine = ReferenceEngine::new(64, 4096);
        // Every logits-requesting position (the role-switch prologue's
        // positions included) consumes one scripted token, so script enough
        // repeats that the completion step still sees EOG once the
        // prologue has been fed.
        for _ in 0..32 {
            engine.script_next_token(0, EOG_TOKEN);
        }
        let scheduler_engine = engine;
        let mut scheduler = Scheduler::new(scheduler_engine, Config::default()).unwrap();

        let program = op::validate_program(vec![wire_completion(1, Role::Assistant, 20)]).unwrap();
        let mut events = Vec::new();
        let results = scheduler.run(program, &CancelToken::new(), |e| events.push(e)).unwrap();

        assert_eq!(results.len(), 1);
        assert!(results[0].error.is_none());
    }

    #[test]
    fn feed_tokens_then_completion_reaches_max_tokens() {
        let engine = ReferenceEngine::new(64, 4096);
        let mut scheduler = Scheduler::new(engine, Config::default()).unwrap();
        let feed_tokens = scheduler.engine.tokenize("hi").unwrap();

        let program = op::validate_program(vec![
            wire_feed(1, Role::User, feed_tokens),
            wire_completion(2, Role::Assistant, 3),
        ])
        .unwrap();

        let mut events = Vec::new();
        let results = scheduler.run(program, &CancelToken::new(), |e| events.push(e)).unwrap();

        let completion = results.iter().find(|r| r.operation_id == 2).unwrap();
        assert!(completion.error.is_none());
        assert!(events.iter().any(|e| e.operation_id == 2));
        // Both operations ran on the same path, so no KV copy should have
        // separated them: the completion must have inherited the user-role
        // feed rather than replaying from scratch with no recorded role.
        let feed_result = results.iter().find(|r| r.operation_id == 1).unwrap();
        assert!(feed_result.error.is_none());
    }

    #[test]
    fn match_pattern_success_reports_logit_sum() {
        let mut engine = ReferenceEngine::new(64, 4096);
        engine.script_next_token(0, b'o' as TokenId);
        engine.script_next_token(0, b'k' as TokenId);
        let mut scheduler = Scheduler::new(engine, Config::default()).unwrap();

        let wire = OperationWire {
            id: 1,
            name: "match_pattern".to_string(),
            feed_tokens: None,
            completion: None,
            branch: None,
            match_pattern: Some(MatchPatternSpec {
                role: Role::Assistant,
                pattern: "ok".to_string(),
                top_p_k: 0,
            }),
            result: None,
        };
        let program = op::validate_program(vec![wire]).unwrap();
        let results = scheduler.run(program, &CancelToken::new(), |_| {}).unwrap();

        let result = &results[0];
        assert!(result.error.is_none());
        assert_eq!(result.text, "ok");
        assert!(result.match_logit_sum.is_some());
    }

    #[test]
    fn decode_failure_is_retried_up_to_the_cap() {
        let mut engine = ReferenceEngine::new(64, 4096);
        engine.fail_next_decode_for(0);
        let mut scheduler = Scheduler::new(engine, Config::default()).unwrap();

        let program = op::validate_program(vec![wire_completion(1, Role::Assistant, 1)]).unwrap();
        let results = scheduler.run(program, &CancelToken::new(), |_| {}).unwrap();
        assert_eq!(results.len(), 1);
    }

    #[test]
    fn branch_forks_share_no_sequence_and_report_both_results() {
        let branch = OperationWire {
            id: 1,
            name: "branch".to_string(),
            feed_tokens: None,
            completion: None,
            match_pattern: None,
            result: None,
            branch: Some(crate::op::BranchWire {
                forks: vec![
                    vec![wire_completion(2, Role::Assistant, 2)],
                    vec![wire_completion(3, Role::Assistant, 2)],
                ],
            }),
        };
        let engine = ReferenceEngine::new(64, 4096);
        let mut scheduler = Scheduler::new(engine, Config::default()).unwrap();
        let program = op::validate_program(vec![branch]).unwrap();
        let results = scheduler.run(program, &CancelToken::new(), |_| {}).unwrap();

        assert!(results.iter().any(|r| r.operation_id == 2));
        assert!(results.iter().any(|r| r.operation_id == 3));
        assert!(results.iter().all(|r| r.error.is_none()));
    }
}
