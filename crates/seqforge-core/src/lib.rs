mod config;
mod context;
mod engine;
mod error;
mod op;
mod pattern;
mod sampling;
mod scheduler;
mod sequence;

pub use config::{Config, ForkSelectionStrategy};
pub use context::{ForkSelector, Interpreter, OperationContext};
pub use engine::reference::ReferenceEngine;
pub use engine::{BatchSlot, DecodeBatch, EngineAdapter, SeqNum, TokenId};
pub use error::{EngineError, SchedulerError, ValidationError};
pub use op::{
    BranchWire, CompletionSpec, FeedTokensSpec, MatchPatternSpec, Operation, OperationId,
    OperationKind, OperationWire, Program, Role, validate_program,
};
pub use sampling::Candidate;
pub use scheduler::{CancelToken, OperationResult, Scheduler, StepEvent};
