//! The engine adapter contract.
//!
//! The scheduler, interpreter and sequence runtime depend only on the
//! [`EngineAdapter`] trait below — never on a concrete decoder library. A
//! worker loop only ever needs to call through a small set of
//! `LlamaContext`/`LlamaBatch`-shaped methods (decode, get_logits_ith,
//! kv_cache_seq_rm) rather than touching any FFI layer directly.

pub mod reference;

use crate::error::EngineError;

/// A token id in the engine's vocabulary.
pub type TokenId = i32;

/// A position within a sequence's token stream.
pub type SeqNum = i32;

/// One slot of a [`DecodeBatch`].
#[derive(Debug, Clone, Copy)]
pub struct BatchSlot {
    pub token: TokenId,
    pub pos: i32,
    pub seq_id: SeqNum,
    pub logits_wanted: bool,
}

/// A batch of tokens submitted to the engine in one `decode` call.
///
/// Mirrors `LlamaBatch` (slab-llama): an append-only scratch buffer with a
/// hard capacity, reused across ticks by the scheduler.
#[derive(Debug, Clone)]
pub struct DecodeBatch {
    slots: Vec<BatchSlot>,
    capacity: usize,
}

impl DecodeBatch {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn remaining(&self) -> usize {
        self.capacity.saturating_sub(self.slots.len())
    }

    pub fn slots(&self) -> &[BatchSlot] {
        &self.slots
    }

    pub fn clear(&mut self) {
        self.slots.clear();
    }

    /// Append one token. Fails with [`EngineError::BatchFull`] once `capacity`
    /// slots have been used.
    pub fn push(
        &mut self,
        token: TokenId,
        pos: i32,
        seq_id: SeqNum,
        logits_wanted: bool,
    ) -> Result<(), EngineError> {
        if self.slots.len() >= self.capacity {
            return Err(EngineError::BatchFull);
        }
        self.slots.push(BatchSlot {
            token,
            pos,
            seq_id,
            logits_wanted,
        });
        Ok(())
    }
}

/// Thin semantic wrapper over a native batched transformer decoder.
///
/// Implementations own the model and the KV cache; the scheduler serializes
/// all calls through a single executor (§5), so no method here needs to be
/// internally synchronized.
pub trait EngineAdapter: Send {
    /// Tokenize free-form text into vocabulary indices.
    fn tokenize(&self, text: &str) -> Result<Vec<TokenId>, EngineError>;

    /// Run one forward pass over `batch`. On success, `logits_of` becomes
    /// valid for every slot that requested logits, until the next call.
    fn decode(&mut self, batch: &DecodeBatch) -> Result<(), EngineError>;

    /// Read back the vocab-sized logit vector for the given batch slot index,
    /// valid only for the batch passed to the most recent [`Self::decode`].
    fn logits_of(&self, slot_index: usize) -> &[f32];

    /// Copy the KV-cache state of `src` into a new sequence `dst`. Used when
    /// a branch forks a resident parent.
    fn kv_copy(&mut self, src: SeqNum, dst: SeqNum);

    /// Drop the KV-cache state for `seq`, freeing it for reuse.
    fn kv_remove(&mut self, seq: SeqNum);

    /// Drop all KV-cache state. Used only at process shutdown or full reset.
    fn kv_clear(&mut self);

    /// Whether `token` is one of the engine's end-of-generation tokens.
    fn is_end_of_generation(&self, token: TokenId) -> bool;

    /// Decode a single token to its textual piece. Invalid UTF-8 is replaced
    /// with `"?"`, matching `original_source/inference/util.py`'s
    /// `token_to_string`.
    fn token_to_piece(&self, token: TokenId) -> String;

    /// Size of the vocabulary (`|V|`).
    fn vocab_size(&self) -> usize;

    /// The engine's context window size.
    fn n_ctx(&self) -> usize;

    /// The engine's hard batch capacity (`batch_size`).
    fn batch_size(&self) -> usize;
}
