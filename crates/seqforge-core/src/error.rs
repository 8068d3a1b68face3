use crate::engine::SeqNum;
use crate::op::OperationId;

/// Errors raised by an [`crate::engine::EngineAdapter`] implementation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    #[error("decode failed with code {0}")]
    DecodeFailed(i32),
    #[error("tokenize failed: {0}")]
    TokenizeFailed(String),
    #[error("batch is full, cannot add more tokens")]
    BatchFull,
    #[error("no kv sequence numbers remain")]
    OutOfSequenceNumbers,
}

/// Errors raised while validating a client-submitted program, before any
/// engine work is performed.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ValidationError {
    #[error("operation {id}: feed_tokens must carry a non-empty token list")]
    EmptyFeedTokens { id: OperationId },
    #[error("operation {id}: completion.max_tokens must be > 0")]
    NonPositiveMaxTokens { id: OperationId },
    #[error("operation {id}: match_pattern.pattern must be non-empty")]
    EmptyPattern { id: OperationId },
    #[error("operation {id}: match_pattern.pattern is not a valid regular expression: {source}")]
    InvalidPattern {
        id: OperationId,
        #[source]
        source: regex_automata::dfa::dense::BuildError,
    },
    #[error("operation {id}: branch must declare at least one fork")]
    EmptyBranch { id: OperationId },
    #[error("operation {id}: declared name '{name}' does not match the populated operation body")]
    NameMismatch { id: OperationId, name: String },
    #[error("program must contain at least one operation")]
    EmptyProgram,
}

/// Top-level error returned by the scheduler, one request at a time.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("invalid program: {0}")]
    InvalidProgram(#[from] ValidationError),

    #[error("sequence {seq_num} exceeded {max} consecutive decode failures")]
    SequenceFailuresExhausted { seq_num: SeqNum, max: u32 },

    #[error("tick cap of {cap} reached before the program completed")]
    CapacityExceeded { cap: u32 },

    #[error("no scheduler admission slots available")]
    Busy,

    #[error("request cancelled by the client")]
    Cancelled,

    #[error("no free kv sequence numbers available")]
    OutOfSequenceNumbers,

    #[error("engine error: {0}")]
    Engine(#[from] EngineError),
}
