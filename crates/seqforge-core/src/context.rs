//! The interpreter: a tree walker over a [`Program`] producing, each tick,
//! the multiset of runnable [`OperationId`]s (§4.2).
//!
//! A *path* is one sequential thread of leaf operations from the program
//! root down to (and through) whichever `Branch` forks it passed. All leaf
//! operations on the same path share a `path_id` and are meant to be backed
//! by the *same* scheduler-owned `Sequence` (§3) for their whole lifetime —
//! only a `Branch` actually starts a new path, never an ordinary advance to
//! the next operation in a linear chain.

use crate::op::{Operation, OperationId, OperationKind, Program};

/// Picks the winning fork of a completed [`BranchContext`] from its
/// candidates' final operation ids (§9 — resolved open question).
pub trait ForkSelector {
    fn select(&self, candidates: &[OperationId]) -> OperationId;
}

/// The reference's literal behavior: the first fork, by construction order.
pub struct FirstFork;

impl ForkSelector for FirstFork {
    fn select(&self, candidates: &[OperationId]) -> OperationId {
        candidates[0]
    }
}

/// Assigns fresh path ids; root is always 0.
struct PathIds(u64);

impl PathIds {
    fn next(&mut self) -> u64 {
        self.0 += 1;
        self.0
    }
}

/// Runtime state for one non-branch operation on one path through the tree
/// (§3). Completion is set externally by the sequence runtime.
#[derive(Debug, Clone)]
pub struct OperationContext {
    pub id: OperationId,
    pub path_id: u64,
    /// The path this one forked from, carried on every context produced
    /// while this path is new so the scheduler can seed its `Sequence`'s
    /// KV-copy source on first sight. Irrelevant once the `Sequence` exists.
    pub parent_path: Option<u64>,
    pub token_index: u32,
    pub completed: bool,
}

impl OperationContext {
    fn new(id: OperationId, path_id: u64, parent_path: Option<u64>) -> Self {
        Self {
            id,
            path_id,
            parent_path,
            token_index: 0,
            completed: false,
        }
    }
}

/// A set of child [`SequenceContext`]s, one per fork, each starting a new
/// path rooted at this branch's path (§3).
pub struct BranchContext {
    pub id: OperationId,
    pub forks: Vec<SequenceContext>,
    pub terminated: bool,
}

impl BranchContext {
    fn new(id: OperationId, forks: Vec<Program>, path_id: u64, path_ids: &mut PathIds) -> Self {
        Self {
            id,
            forks: forks
                .into_iter()
                .map(|ops| {
                    let fork_path = path_ids.next();
                    SequenceContext::new(ops, fork_path, Some(path_id), path_ids)
                })
                .collect(),
            terminated: false,
        }
    }

    fn step(&mut self, selector: &dyn ForkSelector, path_ids: &mut PathIds) -> Vec<OperationContext> {
        if self.terminated {
            return Vec::new();
        }
        let mut runnable = Vec::new();
        for fork in &mut self.forks {
            runnable.extend(fork.step(selector, path_ids));
        }
        if self.forks.iter().all(|f| f.terminated) {
            self.terminated = true;
        }
        runnable
    }

    fn final_id(&self, selector: &dyn ForkSelector) -> OperationId {
        let candidates: Vec<OperationId> = self
            .forks
            .iter()
            .map(|f| f.final_id.expect("terminated fork must record a final id"))
            .collect();
        selector.select(&candidates)
    }

    pub fn complete(&mut self, id: OperationId) -> bool {
        self.forks.iter_mut().any(|f| f.complete(id))
    }
}

enum Leaf {
    Operation(OperationContext),
    Branch(BranchContext),
}

impl Leaf {
    fn new(op: &Operation, path_id: u64, parent_path: Option<u64>, path_ids: &mut PathIds) -> Self {
        match &op.kind {
            OperationKind::Branch(forks) => Leaf::Branch(BranchContext::new(op.id, forks.clone(), path_id, path_ids)),
            _ => Leaf::Operation(OperationContext::new(op.id, path_id, parent_path)),
        }
    }

    fn step(&mut self, selector: &dyn ForkSelector, path_ids: &mut PathIds) -> Vec<OperationContext> {
        match self {
            Leaf::Operation(ctx) => {
                if ctx.completed {
                    Vec::new()
                } else {
                    vec![ctx.clone()]
                }
            }
            Leaf::Branch(branch) => branch.step(selector, path_ids),
        }
    }

    fn is_completed(&self) -> bool {
        match self {
            Leaf::Operation(ctx) => ctx.completed,
            Leaf::Branch(branch) => branch.terminated,
        }
    }

    fn final_id(&self, selector: &dyn ForkSelector) -> OperationId {
        match self {
            Leaf::Operation(ctx) => ctx.id,
            Leaf::Branch(branch) => branch.final_id(selector),
        }
    }

    fn complete(&mut self, id: OperationId) -> bool {
        match self {
            Leaf::Operation(ctx) if ctx.id == id => {
                ctx.completed = true;
                true
            }
            Leaf::Operation(_) => false,
            Leaf::Branch(branch) => branch.complete(id),
        }
    }
}

/// Runtime state for one program on one path through the tree (§3). Only
/// the very first leaf on a path carries a `parent_path`; every later leaf
/// on the same path keeps the same `path_id` and `parent_path = None`
/// (irrelevant after the first tick, since the backing `Sequence` already
/// exists by then).
pub struct SequenceContext {
    operations: Program,
    operation_index: usize,
    path_id: u64,
    current: Leaf,
    pub terminated: bool,
    pub final_id: Option<OperationId>,
}

impl SequenceContext {
    fn new(operations: Program, path_id: u64, parent_path: Option<u64>, path_ids: &mut PathIds) -> Self {
        assert!(!operations.is_empty(), "program must be non-empty");
        let current = Leaf::new(&operations[0], path_id, parent_path, path_ids);
        Self {
            operations,
            operation_index: 0,
            path_id,
            current,
            terminated: false,
            final_id: None,
        }
    }

    pub fn current_operation_context(&self) -> Option<&OperationContext> {
        match &self.current {
            Leaf::Operation(ctx) => Some(ctx),
            Leaf::Branch(_) => None,
        }
    }

    pub fn current_operation_context_mut(&mut self) -> Option<&mut OperationContext> {
        match &mut self.current {
            Leaf::Operation(ctx) => Some(ctx),
            Leaf::Branch(_) => None,
        }
    }

    pub fn complete(&mut self, id: OperationId) -> bool {
        self.current.complete(id)
    }

    /// Collect the contexts of every still-running leaf operation beneath
    /// this sequence context, advancing past any leaf that just completed.
    pub fn step(&mut self, selector: &dyn ForkSelector, path_ids: &mut PathIds) -> Vec<OperationContext> {
        if self.terminated {
            return Vec::new();
        }
        let runnable = self.current.step(selector, path_ids);
        if self.current.is_completed() {
            let completed_id = self.current.final_id(selector);
            self.operation_index += 1;
            if self.operation_index >= self.operations.len() {
                self.terminated = true;
                self.final_id = Some(completed_id);
                return Vec::new();
            }
            let next_op = &self.operations[self.operation_index];
            // Same path continues: no parent_path, same path_id.
            self.current = Leaf::new(next_op, self.path_id, None, path_ids);
            return self.current.step(selector, path_ids);
        }
        runnable
    }
}

/// The interpreter: owns the root [`SequenceContext`] of one client program.
pub struct Interpreter {
    root: SequenceContext,
    path_ids: PathIds,
    pub done: bool,
}

impl Interpreter {
    pub fn new(program: Program) -> Self {
        let mut path_ids = PathIds(0);
        let root = SequenceContext::new(program, 0, None, &mut path_ids);
        Self {
            root,
            path_ids,
            done: false,
        }
    }

    /// Advance the interpreter by one tick, returning the context of every
    /// operation that is currently runnable.
    pub fn step(&mut self, selector: &dyn ForkSelector) -> Vec<OperationContext> {
        if self.root.terminated {
            self.done = true;
            return Vec::new();
        }
        let runnable = self.root.step(selector, &mut self.path_ids);
        self.done = self.root.terminated;
        runnable
    }

    /// Mark every operation beneath the root as externally cancelled by
    /// forcing the interpreter to report done; used on client disconnect
    /// (§5 — cancellation).
    pub fn cancel(&mut self) {
        self.root.terminated = true;
        self.done = true;
    }

    /// Mark leaf operation `id` completed; called by the sequence runtime
    /// once its termination condition fires (§4.2).
    pub fn complete(&mut self, id: OperationId) -> bool {
        self.root.complete(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::op::{CompletionSpec, FeedTokensSpec, MatchPatternSpec, Role};

    fn completion(id: OperationId, max_tokens: u32) -> Operation {
        Operation {
            id,
            kind: OperationKind::Completion(CompletionSpec {
                role: Role::Assistant,
                max_tokens,
                top_p_k: 0,
            }),
        }
    }

    fn feed(id: OperationId) -> Operation {
        Operation {
            id,
            kind: OperationKind::FeedTokens(FeedTokensSpec {
                role: Role::User,
                tokens: vec![1, 2, 3],
                top_p_k: 0,
            }),
        }
    }

    fn ids(ctxs: &[OperationContext]) -> Vec<OperationId> {
        ctxs.iter().map(|c| c.id).collect()
    }

    #[test]
    fn single_operation_is_runnable_until_completed() {
        let mut interp = Interpreter::new(vec![completion(1, 5)]);
        let runnable = interp.step(&FirstFork);
        assert_eq!(ids(&runnable), vec![1]);
        assert!(!interp.done);

        interp.root.current_operation_context_mut().unwrap().completed = true;
        let runnable = interp.step(&FirstFork);
        assert!(runnable.is_empty());
        assert!(interp.done);
    }

    #[test]
    fn advancing_to_next_operation_keeps_the_same_path_id() {
        let mut interp = Interpreter::new(vec![feed(1), completion(2, 5)]);
        let first = interp.step(&FirstFork);
        let path_id = first[0].path_id;
        interp.root.current_operation_context_mut().unwrap().completed = true;
        let runnable = interp.step(&FirstFork);
        assert_eq!(ids(&runnable), vec![2]);
        assert_eq!(runnable[0].path_id, path_id);
    }

    #[test]
    fn branch_forks_get_fresh_path_ids_parented_on_the_branch_path() {
        let branch = Operation {
            id: 5,
            kind: OperationKind::Branch(vec![vec![completion(6, 3)], vec![completion(7, 3)]]),
        };
        let mut interp = Interpreter::new(vec![branch]);
        let runnable = interp.step(&FirstFork);
        assert_eq!(ids(&runnable), vec![6, 7]);
        assert_ne!(runnable[0].path_id, runnable[1].path_id);
        assert_eq!(runnable[0].parent_path, Some(0));
        assert_eq!(runnable[1].parent_path, Some(0));
    }

    #[test]
    fn branch_terminates_once_every_fork_is_done() {
        let branch = Operation {
            id: 5,
            kind: OperationKind::Branch(vec![vec![completion(6, 3)], vec![completion(7, 3)]]),
        };
        let mut interp = Interpreter::new(vec![branch]);
        interp.step(&FirstFork);
        interp.complete(6);
        let runnable = interp.step(&FirstFork);
        assert_eq!(ids(&runnable), vec![7]);
        assert!(!interp.done);

        interp.complete(7);
        interp.step(&FirstFork);
        assert!(interp.done);
    }

    #[test]
    fn match_pattern_operation_is_a_plain_leaf() {
        let op = Operation {
            id: 9,
            kind: OperationKind::MatchPattern(MatchPatternSpec {
                role: Role::Assistant,
                pattern: "yes|no".to_string(),
                top_p_k: 0,
            }),
        };
        let mut interp = Interpreter::new(vec![op]);
        assert_eq!(ids(&interp.step(&FirstFork)), vec![9]);
    }
}
