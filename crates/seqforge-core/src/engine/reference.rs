//! A deterministic, pure-Rust [`EngineAdapter`] with no native dependency.
//!
//! This is the engine the crate ships and tests against by default (§10.4):
//! an in-process reference engine with a fixed, small vocabulary and
//! deterministic logits. It plays the same role a mock `spawn_echo_backend` /
//! `spawn_stream_backend` test double plays for any service built around a
//! native backend: a stand-in that exercises the real call shape without a
//! model file or a native library.
//!
//! Vocabulary: each of the 128 ASCII code points is its own token (`id as
//! u8 as char`), plus one reserved end-of-generation token at id 128. This
//! keeps `tokenize`/`token_to_piece` trivially invertible while still letting
//! the six role-switch template strings (`<|system|>\n`, …) round-trip
//! exactly like a real BPE vocabulary would.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::engine::{DecodeBatch, EngineAdapter, SeqNum, TokenId};
use crate::error::EngineError;

pub const EOG_TOKEN: TokenId = 128;
const VOCAB_SIZE: usize = 129;

/// A fixed, non-EOG token the reference engine prefers by default so that
/// unscripted generation runs long enough to exercise the tick cap (§8,
/// scenario 6) instead of terminating immediately.
const DEFAULT_NEXT_TOKEN: TokenId = b'x' as TokenId;

pub struct ReferenceEngine {
    batch_size: usize,
    n_ctx: usize,
    resident: HashMap<SeqNum, Vec<TokenId>>,
    logit_slots: Vec<Vec<f32>>,
    /// Scripted next tokens per sequence, consumed in order; falls back to
    /// [`DEFAULT_NEXT_TOKEN`] once exhausted. Lets tests drive exact
    /// scenarios (forced EOG, forced `<|end|>` text, …) deterministically.
    scripted: HashMap<SeqNum, VecDeque<TokenId>>,
    /// Sequence ids whose *next* `decode` call should fail once, then clear.
    fail_once: HashSet<SeqNum>,
}

impl ReferenceEngine {
    pub fn new(batch_size: usize, n_ctx: usize) -> Self {
        Self {
            batch_size,
            n_ctx,
            resident: HashMap::new(),
            logit_slots: Vec::new(),
            scripted: HashMap::new(),
            fail_once: HashSet::new(),
        }
    }

    /// Test hook: make the given sequence sample `token` on its next step
    /// (repeat calls queue further steps).
    pub fn script_next_token(&mut self, seq: SeqNum, token: TokenId) {
        self.scripted.entry(seq).or_default().push_back(token);
    }

    /// Test hook: fail the next `decode` call that includes `seq` in its
    /// batch (one-shot).
    pub fn fail_next_decode_for(&mut self, seq: SeqNum) {
        self.fail_once.insert(seq);
    }

    fn next_token_for(&mut self, seq: SeqNum) -> TokenId {
        self.scripted
            .get_mut(&seq)
            .and_then(|q| q.pop_front())
            .unwrap_or(DEFAULT_NEXT_TOKEN)
    }
}

impl EngineAdapter for ReferenceEngine {
    fn tokenize(&self, text: &str) -> Result<Vec<TokenId>, EngineError> {
        text.chars()
            .map(|c| {
                if (c as u32) < VOCAB_SIZE as u32 {
                    Ok(c as TokenId)
                } else {
                    Err(EngineError::TokenizeFailed(format!(
                        "character {c:?} is outside the reference vocabulary"
                    )))
                }
            })
            .collect()
    }

    fn decode(&mut self, batch: &DecodeBatch) -> Result<(), EngineError> {
        if batch.slots().iter().any(|s| self.fail_once.remove(&s.seq_id)) {
            return Err(EngineError::DecodeFailed(1));
        }

        self.logit_slots.clear();
        for slot in batch.slots() {
            let tokens = self.resident.entry(slot.seq_id).or_default();
            tokens.push(slot.token);

            if slot.logits_wanted {
                let preferred = self.next_token_for(slot.seq_id);
                let mut logits = vec![-10.0_f32; VOCAB_SIZE];
                logits[preferred as usize] = 1000.0;
                self.logit_slots.push(logits);
            } else {
                self.logit_slots.push(Vec::new());
            }
        }
        Ok(())
    }

    fn logits_of(&self, slot_index: usize) -> &[f32] {
        &self.logit_slots[slot_index]
    }

    fn kv_copy(&mut self, src: SeqNum, dst: SeqNum) {
        let tokens = self.resident.get(&src).cloned().unwrap_or_default();
        self.resident.insert(dst, tokens);
    }

    fn kv_remove(&mut self, seq: SeqNum) {
        self.resident.remove(&seq);
        self.scripted.remove(&seq);
    }

    fn kv_clear(&mut self) {
        self.resident.clear();
    }

    fn is_end_of_generation(&self, token: TokenId) -> bool {
        token == EOG_TOKEN
    }

    fn token_to_piece(&self, token: TokenId) -> String {
        if token == EOG_TOKEN {
            return String::new();
        }
        char::from_u32(token as u32)
            .map(|c| c.to_string())
            .unwrap_or_else(|| "?".to_string())
    }

    fn vocab_size(&self) -> usize {
        VOCAB_SIZE
    }

    fn n_ctx(&self) -> usize {
        self.n_ctx
    }

    fn batch_size(&self) -> usize {
        self.batch_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenize_round_trips_ascii() {
        let engine = ReferenceEngine::new(512, 4096);
        let tokens = engine.tokenize("<|system|>\n").unwrap();
        let text: String = tokens.iter().map(|&t| engine.token_to_piece(t)).collect();
        assert_eq!(text, "<|system|>\n");
    }

    #[test]
    fn scripted_token_wins_next_decode() {
        let mut engine = ReferenceEngine::new(512, 4096);
        engine.script_next_token(0, b'A' as TokenId);
        let mut batch = DecodeBatch::new(8);
        batch.push(b'x' as TokenId, 0, 0, true).unwrap();
        engine.decode(&batch).unwrap();
        let logits = engine.logits_of(0);
        let argmax = logits
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .unwrap()
            .0;
        assert_eq!(argmax, b'A' as usize);
    }

    #[test]
    fn fail_next_decode_is_one_shot() {
        let mut engine = ReferenceEngine::new(512, 4096);
        engine.fail_next_decode_for(0);
        let mut batch = DecodeBatch::new(8);
        batch.push(b'x' as TokenId, 0, 0, true).unwrap();
        assert!(engine.decode(&batch).is_err());
        assert!(engine.decode(&batch).is_ok());
    }
}
