//! Resumable steps.
//!
//! The interpreter runs as a tree of named steps. Each step records itself
//! under `Capture/<depth>/<index>` when it starts (`Executing`) and again
//! with its result when it finishes (`Completed`). After a restart the same
//! program runs again: a step found `Completed` returns its stored result
//! without running its body, a step found `Executing` runs again and its own
//! children replay the same way. Guards and actions of completed steps are
//! therefore never evaluated twice.
//!
//! Loop bodies use [`Capture::exit_iteration`], which discards the finished
//! body's records so the next iteration starts from index 0.

use crate::document::DocId;
use crate::error::{EngineError, PersistenceError};
use crate::layout::{corrupt, Key};
use std::fmt;
use stepchart_storage::{Bucket, DocIdList};

/// A resumable call site of the interpreter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Initialize = 1,
    MainLoop = 2,
    SelectEventless = 3,
    PickInternal = 4,
    SelectForEvent = 5,
    StartInvokes = 6,
    WaitExternal = 7,
    ProcessExternal = 8,
    Microstep = 9,
    ExitInterpreter = 10,
}

impl Step {
    fn code(self) -> i64 {
        self as i64
    }

    fn from_code(code: i64) -> Option<Self> {
        Some(match code {
            1 => Step::Initialize,
            2 => Step::MainLoop,
            3 => Step::SelectEventless,
            4 => Step::PickInternal,
            5 => Step::SelectForEvent,
            6 => Step::StartInvokes,
            7 => Step::WaitExternal,
            8 => Step::ProcessExternal,
            9 => Step::Microstep,
            10 => Step::ExitInterpreter,
            _ => return None,
        })
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

const EXECUTING: i64 = 1;
const COMPLETED: i64 = 2;

/// Result stored with a completed step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepResult {
    None,
    Bool(bool),
    Transitions(Vec<DocId>),
}

impl StepResult {
    pub fn into_bool(self) -> Result<bool, EngineError> {
        match self {
            StepResult::Bool(b) => Ok(b),
            other => Err(corrupt(format!("expected a boolean step result, found {:?}", other))),
        }
    }

    pub fn into_transitions(self) -> Result<Vec<DocId>, EngineError> {
        match self {
            StepResult::Transitions(t) => Ok(t),
            other => Err(corrupt(format!("expected a transition list, found {:?}", other))),
        }
    }

    fn write(&self, entry: &Bucket) -> Result<(), EngineError> {
        match self {
            StepResult::None => {
                entry.add(Key::StepResult, &0i64)?;
                entry.remove(Key::Data)?;
            }
            StepResult::Bool(b) => {
                entry.add(Key::StepResult, &1i64)?;
                entry.add(Key::Data, b)?;
            }
            StepResult::Transitions(ids) => {
                entry.add(Key::StepResult, &2i64)?;
                entry.add(Key::Data, &DocIdList(ids.iter().map(|t| t.0).collect()))?;
            }
        }
        Ok(())
    }

    fn read(entry: &Bucket) -> Result<Self, EngineError> {
        let tag: i64 = entry
            .try_get(Key::StepResult)?
            .ok_or_else(|| corrupt("completed step without result"))?;
        Ok(match tag {
            0 => StepResult::None,
            1 => StepResult::Bool(
                entry
                    .try_get(Key::Data)?
                    .ok_or_else(|| corrupt("boolean step result"))?,
            ),
            2 => {
                let list: DocIdList = entry
                    .try_get(Key::Data)?
                    .ok_or_else(|| corrupt("transition step result"))?;
                StepResult::Transitions(list.0.into_iter().map(DocId).collect())
            }
            other => return Err(corrupt(format!("step result tag {}", other))),
        })
    }
}

/// Persisted step stack of one session.
pub(crate) struct Capture {
    bucket: Bucket,
    /// Next child index per depth; the last entry is the current depth.
    indices: Vec<u32>,
    /// Steps currently executing, outermost first.
    open: Vec<Step>,
}

impl Capture {
    pub fn new(bucket: Bucket) -> Self {
        Self {
            bucket,
            indices: vec![0],
            open: Vec::new(),
        }
    }

    pub fn depth(&self) -> u32 {
        self.open.len() as u32
    }

    /// Starts `step`. Returns its stored result if it already completed,
    /// in which case the caller must skip the body.
    pub fn enter(&mut self, step: Step) -> Result<Option<StepResult>, EngineError> {
        let depth = self.depth();
        let index = self.current_index();
        let entry = self.entry(depth, index)?;

        if let Some(code) = entry.try_get::<i64>(Key::StepKey)? {
            if code != step.code() {
                let found = Step::from_code(code)
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| format!("unknown step {}", code));
                return Err(PersistenceError::StepMismatch {
                    depth,
                    index,
                    expected: step.to_string(),
                    found,
                }
                .into());
            }
            if entry.try_get::<i64>(Key::StepStatus)? == Some(COMPLETED) {
                let result = StepResult::read(&entry)?;
                self.advance();
                tracing::trace!("Replayed step {} at {}/{}", step, depth, index);
                return Ok(Some(result));
            }
        } else {
            entry.add(Key::StepKey, &step.code())?;
        }

        entry.add(Key::StepStatus, &EXECUTING)?;
        self.open.push(step);
        self.indices.push(0);
        Ok(None)
    }

    /// Returns whether the next step at the current position is `step` and
    /// has already completed. Nothing is recorded.
    pub fn is_completed(&self, step: Step) -> Result<bool, EngineError> {
        let entry = self.entry(self.depth(), self.current_index())?;
        Ok(entry.try_get::<i64>(Key::StepKey)? == Some(step.code())
            && entry.try_get::<i64>(Key::StepStatus)? == Some(COMPLETED))
    }

    /// Finishes the innermost step with `result`.
    pub fn exit(&mut self, step: Step, result: StepResult) -> Result<(), EngineError> {
        if self.open.last() != Some(&step) {
            return Err(EngineError::Platform(format!(
                "step {} exited while {:?} is open",
                step,
                self.open.last()
            )));
        }
        self.open.pop();
        self.indices.pop();

        let depth = self.depth();
        let index = self.current_index();
        let entry = self.entry(depth, index)?;
        entry.add(Key::StepStatus, &COMPLETED)?;
        result.write(&entry)?;
        self.bucket.remove_subtree(depth + 1)?;
        self.advance();
        Ok(())
    }

    /// Returns how many iterations the innermost step has finished.
    pub fn iteration(&self) -> Result<u64, EngineError> {
        Ok(self.parent_entry()?.get_or(Key::Iteration, 0u64)?)
    }

    /// Ends one iteration of the innermost step's loop: drops the records
    /// of the finished body and counts the iteration.
    pub fn exit_iteration(&mut self) -> Result<u64, EngineError> {
        let depth = self.depth();
        if depth == 0 {
            return Err(EngineError::Platform("iteration outside a step".into()));
        }
        self.bucket.remove_subtree(depth)?;
        if let Some(index) = self.indices.last_mut() {
            *index = 0;
        }

        let parent = self.parent_entry()?;
        let done = parent.get_or(Key::Iteration, 0u64)? + 1;
        parent.add(Key::Iteration, &done)?;
        Ok(done)
    }

    fn current_index(&self) -> u32 {
        self.indices.last().copied().unwrap_or(0)
    }

    fn advance(&mut self) {
        if let Some(index) = self.indices.last_mut() {
            *index += 1;
        }
    }

    fn entry(&self, depth: u32, index: u32) -> Result<Bucket, EngineError> {
        Ok(self.bucket.nested(depth)?.nested(index)?)
    }

    /// Entry of the innermost open step.
    fn parent_entry(&self) -> Result<Bucket, EngineError> {
        let depth = self.depth();
        if depth == 0 {
            return Err(EngineError::Platform("no open step".into()));
        }
        let parent_index = self.indices[self.indices.len() - 2];
        self.entry(depth - 1, parent_index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use stepchart_storage::SharedStorage;
    use stepchart_wal::InMemoryStorage;

    fn bucket() -> Bucket {
        let storage: SharedStorage = Arc::new(Mutex::new(InMemoryStorage::new()));
        Bucket::new(storage).nested(Key::Capture).unwrap()
    }

    #[test]
    fn test_completed_steps_replay() {
        let bucket = bucket();
        let mut first = Capture::new(bucket.clone());
        assert_eq!(first.enter(Step::Initialize).unwrap(), None);
        first.exit(Step::Initialize, StepResult::None).unwrap();
        assert_eq!(first.enter(Step::MainLoop).unwrap(), None);
        assert_eq!(first.enter(Step::SelectEventless).unwrap(), None);
        first
            .exit(
                Step::SelectEventless,
                StepResult::Transitions(vec![DocId(4), DocId(9)]),
            )
            .unwrap();
        assert_eq!(first.enter(Step::PickInternal).unwrap(), None);
        // crash here

        let mut second = Capture::new(bucket);
        assert_eq!(second.enter(Step::Initialize).unwrap(), Some(StepResult::None));
        assert_eq!(second.enter(Step::MainLoop).unwrap(), None);
        assert_eq!(
            second.enter(Step::SelectEventless).unwrap(),
            Some(StepResult::Transitions(vec![DocId(4), DocId(9)]))
        );
        assert_eq!(second.enter(Step::PickInternal).unwrap(), None);
        second.exit(Step::PickInternal, StepResult::Bool(true)).unwrap();
    }

    #[test]
    fn test_is_completed_peeks_without_advancing() {
        let bucket = bucket();
        let mut first = Capture::new(bucket.clone());
        assert!(!first.is_completed(Step::Initialize).unwrap());
        assert_eq!(first.enter(Step::Initialize).unwrap(), None);
        first.exit(Step::Initialize, StepResult::None).unwrap();
        assert_eq!(first.enter(Step::WaitExternal).unwrap(), None);
        // crash while waiting

        let mut second = Capture::new(bucket);
        assert!(second.is_completed(Step::Initialize).unwrap());
        assert!(!second.is_completed(Step::MainLoop).unwrap());
        assert!(second.is_completed(Step::Initialize).unwrap());
        assert_eq!(second.enter(Step::Initialize).unwrap(), Some(StepResult::None));
        assert!(!second.is_completed(Step::WaitExternal).unwrap());
    }

    #[test]
    fn test_step_mismatch_is_fatal() {
        let bucket = bucket();
        let mut first = Capture::new(bucket.clone());
        first.enter(Step::Initialize).unwrap();

        let mut second = Capture::new(bucket);
        let err = second.enter(Step::MainLoop).unwrap_err();
        assert!(matches!(
            err,
            EngineError::Persistence(PersistenceError::StepMismatch { depth: 0, index: 0, .. })
        ));
    }

    #[test]
    fn test_exit_drops_children() {
        let bucket = bucket();
        let mut capture = Capture::new(bucket.clone());
        capture.enter(Step::MainLoop).unwrap();
        capture.enter(Step::Microstep).unwrap();
        capture.exit(Step::Microstep, StepResult::None).unwrap();
        capture.exit(Step::MainLoop, StepResult::None).unwrap();

        assert_eq!(
            bucket.nested(1u32).unwrap().nested(0u32).unwrap().try_get::<i64>(Key::StepKey).unwrap(),
            None
        );
        assert_eq!(capture.depth(), 0);
    }

    #[test]
    fn test_iterations_restart_body() {
        let bucket = bucket();
        let mut capture = Capture::new(bucket.clone());
        capture.enter(Step::MainLoop).unwrap();
        for _ in 0..3 {
            assert_eq!(capture.enter(Step::SelectEventless).unwrap(), None);
            capture
                .exit(Step::SelectEventless, StepResult::Transitions(vec![]))
                .unwrap();
            capture.exit_iteration().unwrap();
        }
        assert_eq!(capture.iteration().unwrap(), 3);

        let mut resumed = Capture::new(bucket);
        assert_eq!(resumed.enter(Step::MainLoop).unwrap(), None);
        assert_eq!(resumed.iteration().unwrap(), 3);
        assert_eq!(resumed.enter(Step::SelectEventless).unwrap(), None);
    }

    #[test]
    fn test_exit_of_wrong_step() {
        let mut capture = Capture::new(bucket());
        capture.enter(Step::MainLoop).unwrap();
        assert!(capture.exit(Step::Microstep, StepResult::None).is_err());
    }

    #[test]
    fn test_result_type_checks() {
        assert!(StepResult::Bool(true).into_transitions().is_err());
        assert!(!StepResult::Bool(false).into_bool().unwrap());
    }
}
