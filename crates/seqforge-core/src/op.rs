//! The operation model: the typed, validated description of a client
//! program, and the wire format it is parsed from (§3, §4.1, §6.3).

use serde::{Deserialize, Serialize};

use crate::engine::TokenId;
use crate::error::ValidationError;

pub type OperationId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
}

fn default_top_p_k() -> u32 {
    0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedTokensSpec {
    pub role: Role,
    pub tokens: Vec<TokenId>,
    #[serde(default = "default_top_p_k", rename = "top_p")]
    pub top_p_k: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionSpec {
    pub role: Role,
    pub max_tokens: u32,
    #[serde(default = "default_top_p_k", rename = "top_p")]
    pub top_p_k: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchPatternSpec {
    pub role: Role,
    pub pattern: String,
    #[serde(default = "default_top_p_k", rename = "top_p")]
    pub top_p_k: u32,
}

/// The as-received shape of one branch fork list, before validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchWire {
    pub forks: Vec<Vec<OperationWire>>,
}

/// The wire shape of one operation: a flat `{id, name, <name>?}` struct
/// where exactly one of `feed_tokens` / `completion` / `branch` /
/// `match_pattern` is populated, matching §6.3.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationWire {
    pub id: OperationId,
    pub name: String,
    #[serde(default)]
    pub feed_tokens: Option<FeedTokensSpec>,
    #[serde(default)]
    pub completion: Option<CompletionSpec>,
    #[serde(default)]
    pub branch: Option<BranchWire>,
    #[serde(default)]
    pub match_pattern: Option<MatchPatternSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}

/// The validated, internal representation of one program step.
#[derive(Debug, Clone)]
pub enum OperationKind {
    FeedTokens(FeedTokensSpec),
    Completion(CompletionSpec),
    Branch(Vec<Program>),
    MatchPattern(MatchPatternSpec),
}

#[derive(Debug, Clone)]
pub struct Operation {
    pub id: OperationId,
    pub kind: OperationKind,
}

impl Operation {
    pub fn role(&self) -> Option<Role> {
        match &self.kind {
            OperationKind::FeedTokens(s) => Some(s.role),
            OperationKind::Completion(s) => Some(s.role),
            OperationKind::MatchPattern(s) => Some(s.role),
            OperationKind::Branch(_) => None,
        }
    }

    pub fn top_p_k(&self) -> u32 {
        match &self.kind {
            OperationKind::FeedTokens(s) => s.top_p_k,
            OperationKind::Completion(s) => s.top_p_k,
            OperationKind::MatchPattern(s) => s.top_p_k,
            OperationKind::Branch(_) => 1,
        }
    }
}

/// A non-empty ordered sequence of operations (§3). Programs nest only
/// through `Branch`.
pub type Program = Vec<Operation>;

impl TryFrom<OperationWire> for Operation {
    type Error = ValidationError;

    fn try_from(wire: OperationWire) -> Result<Self, Self::Error> {
        let id = wire.id;
        let kind = match wire.name.as_str() {
            "feed_tokens" => {
                let spec = wire
                    .feed_tokens
                    .ok_or(ValidationError::NameMismatch { id, name: wire.name.clone() })?;
                if spec.tokens.is_empty() {
                    return Err(ValidationError::EmptyFeedTokens { id });
                }
                OperationKind::FeedTokens(spec)
            }
            "completion" => {
                let spec = wire
                    .completion
                    .ok_or(ValidationError::NameMismatch { id, name: wire.name.clone() })?;
                if spec.max_tokens == 0 {
                    return Err(ValidationError::NonPositiveMaxTokens { id });
                }
                OperationKind::Completion(spec)
            }
            "match_pattern" => {
                let spec = wire
                    .match_pattern
                    .ok_or(ValidationError::NameMismatch { id, name: wire.name.clone() })?;
                if spec.pattern.is_empty() {
                    return Err(ValidationError::EmptyPattern { id });
                }
                crate::pattern::PatternMatcher::compile(&spec.pattern)
                    .map_err(|source| ValidationError::InvalidPattern { id, source })?;
                OperationKind::MatchPattern(spec)
            }
            "branch" => {
                let wire_branch = wire
                    .branch
                    .ok_or(ValidationError::NameMismatch { id, name: wire.name.clone() })?;
                if wire_branch.forks.is_empty() {
                    return Err(ValidationError::EmptyBranch { id });
                }
                let forks = wire_branch
                    .forks
                    .into_iter()
                    .map(validate_program)
                    .collect::<Result<Vec<_>, _>>()?;
                OperationKind::Branch(forks)
            }
            other => {
                return Err(ValidationError::NameMismatch {
                    id,
                    name: other.to_string(),
                })
            }
        };
        Ok(Operation { id, kind })
    }
}

/// Validate a whole wire program top-down (§4.1): every operation must
/// parse, and the program itself must be non-empty.
pub fn validate_program(wire: Vec<OperationWire>) -> Result<Program, ValidationError> {
    if wire.is_empty() {
        return Err(ValidationError::EmptyProgram);
    }
    wire.into_iter().map(Operation::try_from).collect()
}

/// Flatten every leaf operation (everything but `Branch` itself) reachable
/// from `program`, recursing into fork bodies, keyed by id. The scheduler
/// uses this to look up an operation's role/kind from the bare id an
/// [`crate::context::Interpreter`] tick reports as runnable.
pub fn index_leaf_operations(program: &Program) -> std::collections::HashMap<OperationId, Operation> {
    let mut map = std::collections::HashMap::new();
    for op in program {
        match &op.kind {
            OperationKind::Branch(forks) => {
                for fork in forks {
                    map.extend(index_leaf_operations(fork));
                }
            }
            _ => {
                map.insert(op.id, op.clone());
            }
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_program() {
        let err = validate_program(vec![]).unwrap_err();
        assert!(matches!(err, ValidationError::EmptyProgram));
    }

    #[test]
    fn rejects_empty_feed_tokens() {
        let wire = vec![OperationWire {
            id: 1,
            name: "feed_tokens".to_string(),
            feed_tokens: Some(FeedTokensSpec {
                role: Role::User,
                tokens: vec![],
                top_p_k: 0,
            }),
            completion: None,
            branch: None,
            match_pattern: None,
            result: None,
        }];
        let err = validate_program(wire).unwrap_err();
        assert!(matches!(err, ValidationError::EmptyFeedTokens { id: 1 }));
    }

    #[test]
    fn rejects_zero_max_tokens() {
        let wire = vec![OperationWire {
            id: 2,
            name: "completion".to_string(),
            feed_tokens: None,
            completion: Some(CompletionSpec {
                role: Role::Assistant,
                max_tokens: 0,
                top_p_k: 0,
            }),
            branch: None,
            match_pattern: None,
            result: None,
        }];
        let err = validate_program(wire).unwrap_err();
        assert!(matches!(err, ValidationError::NonPositiveMaxTokens { id: 2 }));
    }

    #[test]
    fn validates_nested_branch_forks() {
        let inner_bad = vec![OperationWire {
            id: 11,
            name: "completion".to_string(),
            feed_tokens: None,
            completion: Some(CompletionSpec {
                role: Role::Assistant,
                max_tokens: 0,
                top_p_k: 0,
            }),
            branch: None,
            match_pattern: None,
            result: None,
        }];
        let wire = vec![OperationWire {
            id: 10,
            name: "branch".to_string(),
            feed_tokens: None,
            completion: None,
            branch: Some(BranchWire {
                forks: vec![inner_bad],
            }),
            match_pattern: None,
            result: None,
        }];
        let err = validate_program(wire).unwrap_err();
        assert!(matches!(err, ValidationError::NonPositiveMaxTokens { id: 11 }));
    }
}
