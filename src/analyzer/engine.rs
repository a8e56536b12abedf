//! Dependency-resolved, memoized execution of analysis tasks.
//!
//! Every task declares the [`Wiring::Slot`]s it consumes and produces. A
//! slot has exactly one producer. [`Engine::run`] walks the tasks in
//! registration order and, before running a task, recursively runs the
//! producers of its inputs. Each task runs at most once per run.
//!
//! When an input is absent (no producer, or the producer declined or
//! failed) the task's [`ResolutionMode`] decides: `Strict` tasks are not
//! run and their outputs stay absent, `Tolerant` tasks run with `None` in
//! that position.

#![allow(missing_docs)]

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::Hash;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::core::errors::{DiagError, Result};

/// The closed set of values that flow between tasks.
pub trait Wiring: Sized {
    type Slot: Copy + Eq + Hash + fmt::Debug;

    /// Identity of this value's kind.
    fn slot(&self) -> Self::Slot;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionMode {
    #[default]
    Strict,
    Tolerant,
}

impl fmt::Display for ResolutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Strict => "strict",
            Self::Tolerant => "tolerant",
        })
    }
}

impl FromStr for ResolutionMode {
    type Err = DiagError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "strict" => Ok(Self::Strict),
            "tolerant" => Ok(Self::Tolerant),
            other => Err(DiagError::malformed(
                "resolution mode",
                format!("{other:?} (expected strict|tolerant)"),
            )),
        }
    }
}

/// One analysis unit.
pub trait AnalysisTask<W: Wiring> {
    fn name(&self) -> &str;
    fn inputs(&self) -> Vec<W::Slot>;
    fn outputs(&self) -> Vec<W::Slot>;

    /// Per-task override of the engine default.
    fn mode(&self) -> Option<ResolutionMode> {
        None
    }

    /// `inputs` is aligned with [`Self::inputs`]; the result must be aligned
    /// with [`Self::outputs`], each present value carrying the declared slot.
    fn run(&mut self, inputs: Vec<Option<Arc<W>>>) -> Result<Vec<Option<W>>>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TaskOutcome {
    Ran,
    Declined { missing: Vec<String> },
    Failed { error: String },
}

/// What happened during one [`Engine::run`].
#[derive(Debug)]
pub struct RunReport<W: Wiring> {
    /// Tasks in the order they finished resolving.
    pub outcomes: Vec<(String, TaskOutcome)>,
    values: HashMap<W::Slot, Arc<W>>,
}

impl<W: Wiring> RunReport<W> {
    pub fn outcome(&self, task: &str) -> Option<&TaskOutcome> {
        self.outcomes
            .iter()
            .find(|(name, _)| name == task)
            .map(|(_, outcome)| outcome)
    }

    pub fn value(&self, slot: W::Slot) -> Option<&Arc<W>> {
        self.values.get(&slot)
    }

    pub fn failures(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, o)| matches!(o, TaskOutcome::Failed { .. }))
            .count()
    }
}

enum Memo<W> {
    NotRun,
    Running,
    Done(Vec<Option<Arc<W>>>),
}

pub struct Engine<W: Wiring> {
    tasks: Vec<Box<dyn AnalysisTask<W>>>,
    producers: HashMap<W::Slot, (usize, usize)>,
    default_mode: ResolutionMode,
}

impl<W: Wiring> Default for Engine<W> {
    fn default() -> Self {
        Self::new(ResolutionMode::Strict)
    }
}

impl<W: Wiring> Engine<W> {
    pub fn new(default_mode: ResolutionMode) -> Self {
        Self {
            tasks: Vec::new(),
            producers: HashMap::new(),
            default_mode,
        }
    }

    pub fn default_mode(&self) -> ResolutionMode {
        self.default_mode
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    // ──────────────────── registration ────────────────────

    pub fn register<T: AnalysisTask<W> + 'static>(&mut self, task: T) -> Result<()> {
        self.register_boxed(Box::new(task))
    }

    pub fn register_boxed(&mut self, task: Box<dyn AnalysisTask<W>>) -> Result<()> {
        let name = task.name().to_string();
        let invalid = |reason: String| DiagError::InvalidTask {
            task: name.clone(),
            reason,
        };
        if name.is_empty() {
            return Err(invalid("task has no name".to_string()));
        }
        if self.tasks.iter().any(|t| t.name() == name) {
            return Err(invalid("a task with this name is already registered".to_string()));
        }

        let inputs = task.inputs();
        let outputs = task.outputs();
        if let Some(dup) = first_duplicate(&inputs) {
            return Err(invalid(format!("input {dup:?} declared twice")));
        }
        if let Some(dup) = first_duplicate(&outputs) {
            return Err(invalid(format!("output {dup:?} declared twice")));
        }
        if let Some(own) = inputs.iter().find(|s| outputs.contains(s)) {
            return Err(invalid(format!("consumes its own output {own:?}")));
        }
        for slot in &outputs {
            if let Some(&(other, _)) = self.producers.get(slot) {
                return Err(invalid(format!(
                    "output {slot:?} is already produced by {:?}",
                    self.tasks[other].name()
                )));
            }
        }

        let idx = self.tasks.len();
        self.tasks.push(task);
        for (pos, slot) in outputs.iter().enumerate() {
            self.producers.insert(*slot, (idx, pos));
        }
        if self.reaches(idx, idx) {
            for slot in &outputs {
                self.producers.remove(slot);
            }
            self.tasks.pop();
            return Err(invalid("dependency cycle".to_string()));
        }
        Ok(())
    }

    /// Whether `target` is reachable from `from` by following inputs to
    /// their producers.
    fn reaches(&self, from: usize, target: usize) -> bool {
        let mut stack = vec![from];
        let mut seen = HashSet::new();
        while let Some(idx) = stack.pop() {
            for slot in self.tasks[idx].inputs() {
                let Some(&(producer, _)) = self.producers.get(&slot) else {
                    continue;
                };
                if producer == target {
                    return true;
                }
                if seen.insert(producer) {
                    stack.push(producer);
                }
            }
        }
        false
    }

    // ──────────────────── execution ────────────────────

    pub fn run(&mut self) -> RunReport<W> {
        let mut memo: Vec<Memo<W>> = (0..self.tasks.len()).map(|_| Memo::NotRun).collect();
        let mut outcomes = Vec::with_capacity(self.tasks.len());
        for idx in 0..self.tasks.len() {
            self.resolve(idx, &mut memo, &mut outcomes);
        }

        let mut values = HashMap::new();
        for (slot, &(idx, pos)) in &self.producers {
            if let Memo::Done(outputs) = &memo[idx]
                && let Some(Some(value)) = outputs.get(pos)
            {
                values.insert(*slot, Arc::clone(value));
            }
        }
        RunReport { outcomes, values }
    }

    fn resolve(
        &mut self,
        idx: usize,
        memo: &mut [Memo<W>],
        outcomes: &mut Vec<(String, TaskOutcome)>,
    ) {
        match memo[idx] {
            Memo::Done(_) => return,
            Memo::Running => {
                // Registration rejects cycles, so this is never reached.
                eprintln!(
                    "[DIAG-TASK] {} re-entered while running",
                    self.tasks[idx].name()
                );
                return;
            }
            Memo::NotRun => memo[idx] = Memo::Running,
        }

        let input_slots = self.tasks[idx].inputs();
        let mut inputs = Vec::with_capacity(input_slots.len());
        let mut missing = Vec::new();
        for slot in &input_slots {
            let value = match self.producers.get(slot).copied() {
                Some((producer, pos)) => {
                    self.resolve(producer, memo, outcomes);
                    match &memo[producer] {
                        Memo::Done(outputs) => outputs.get(pos).cloned().flatten(),
                        _ => None,
                    }
                }
                None => None,
            };
            if value.is_none() {
                missing.push(format!("{slot:?}"));
            }
            inputs.push(value);
        }

        let task = &mut self.tasks[idx];
        let name = task.name().to_string();
        let output_slots = task.outputs();
        let absent = || (0..output_slots.len()).map(|_| None).collect::<Vec<_>>();
        let mode = task.mode().unwrap_or(self.default_mode);

        if mode == ResolutionMode::Strict && !missing.is_empty() {
            memo[idx] = Memo::Done(absent());
            outcomes.push((name, TaskOutcome::Declined { missing }));
            return;
        }

        let result = task.run(inputs).and_then(|produced| {
            check_shape(&output_slots, produced)
        });
        match result {
            Ok(outputs) => {
                memo[idx] = Memo::Done(outputs);
                outcomes.push((name, TaskOutcome::Ran));
            }
            Err(err) => {
                eprintln!("[DIAG-TASK] {name} failed: {err}");
                memo[idx] = Memo::Done(absent());
                outcomes.push((
                    name,
                    TaskOutcome::Failed {
                        error: err.to_string(),
                    },
                ));
            }
        }
    }
}

fn first_duplicate<S: Eq + Hash + Copy>(slots: &[S]) -> Option<S> {
    let mut seen = HashSet::new();
    slots.iter().copied().find(|s| !seen.insert(*s))
}

fn check_shape<W: Wiring>(
    declared: &[W::Slot],
    produced: Vec<Option<W>>,
) -> Result<Vec<Option<Arc<W>>>> {
    if produced.len() != declared.len() {
        return Err(DiagError::Runtime {
            details: format!(
                "produced {} outputs, declared {}",
                produced.len(),
                declared.len()
            ),
        });
    }
    produced
        .into_iter()
        .zip(declared)
        .map(|(value, slot)| match value {
            Some(v) if v.slot() != *slot => Err(DiagError::Runtime {
                details: format!("produced {:?} where {slot:?} was declared", v.slot()),
            }),
            other => Ok(other.map(Arc::new)),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    enum Val {
        X(i64),
        Y(i64),
        Z(i64),
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Slot {
        X,
        Y,
        Z,
    }

    impl Wiring for Val {
        type Slot = Slot;

        fn slot(&self) -> Slot {
            match self {
                Self::X(_) => Slot::X,
                Self::Y(_) => Slot::Y,
                Self::Z(_) => Slot::Z,
            }
        }
    }

    type Body = Box<dyn FnMut(Vec<Option<Arc<Val>>>) -> Result<Vec<Option<Val>>>>;

    struct FnTask {
        name: &'static str,
        inputs: Vec<Slot>,
        outputs: Vec<Slot>,
        mode: Option<ResolutionMode>,
        calls: Arc<AtomicUsize>,
        body: Body,
    }

    impl FnTask {
        fn new(
            name: &'static str,
            inputs: Vec<Slot>,
            outputs: Vec<Slot>,
            body: impl FnMut(Vec<Option<Arc<Val>>>) -> Result<Vec<Option<Val>>> + 'static,
        ) -> Self {
            Self {
                name,
                inputs,
                outputs,
                mode: None,
                calls: Arc::new(AtomicUsize::new(0)),
                body: Box::new(body),
            }
        }

        fn tolerant(mut self) -> Self {
            self.mode = Some(ResolutionMode::Tolerant);
            self
        }
    }

    impl AnalysisTask<Val> for FnTask {
        fn name(&self) -> &str {
            self.name
        }

        fn inputs(&self) -> Vec<Slot> {
            self.inputs.clone()
        }

        fn outputs(&self) -> Vec<Slot> {
            self.outputs.clone()
        }

        fn mode(&self) -> Option<ResolutionMode> {
            self.mode
        }

        fn run(&mut self, inputs: Vec<Option<Arc<Val>>>) -> Result<Vec<Option<Val>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            (self.body)(inputs)
        }
    }

    fn x_of(inputs: &[Option<Arc<Val>>]) -> i64 {
        match inputs[0].as_deref() {
            Some(Val::X(v)) => *v,
            other => panic!("expected X, got {other:?}"),
        }
    }

    #[test]
    fn strict_diamond_runs_each_task_once() {
        let a = FnTask::new("A", vec![], vec![Slot::X], |_| Ok(vec![Some(Val::X(7))]));
        let b = FnTask::new("B", vec![Slot::X], vec![Slot::Y], |i| {
            Ok(vec![Some(Val::Y(x_of(&i) + 1))])
        });
        let c = FnTask::new("C", vec![Slot::X], vec![Slot::Z], |i| {
            Ok(vec![Some(Val::Z(x_of(&i) * 2))])
        });
        let counts = [
            Arc::clone(&a.calls),
            Arc::clone(&b.calls),
            Arc::clone(&c.calls),
        ];

        let mut engine: Engine<Val> = Engine::default();
        engine.register(c).unwrap();
        engine.register(b).unwrap();
        engine.register(a).unwrap();
        let report = engine.run();

        for count in &counts {
            assert_eq!(count.load(Ordering::SeqCst), 1);
        }
        assert_eq!(report.failures(), 0);
        assert_eq!(report.value(Slot::Y).map(|v| (**v).clone()), Some(Val::Y(8)));
        assert_eq!(report.value(Slot::Z).map(|v| (**v).clone()), Some(Val::Z(14)));
        let order: Vec<&str> = report.outcomes.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(order, vec!["A", "C", "B"]);
    }

    #[test]
    fn tolerant_task_runs_with_null_input() {
        let a = FnTask::new("A", vec![], vec![Slot::X, Slot::Y], |_| {
            Ok(vec![Some(Val::X(1)), None])
        });
        let b = FnTask::new("B", vec![Slot::Y], vec![Slot::Z], |inputs| {
            assert!(inputs[0].is_none());
            Ok(vec![None])
        })
        .tolerant();
        let b_calls = Arc::clone(&b.calls);

        let mut engine: Engine<Val> = Engine::default();
        engine.register(a).unwrap();
        engine.register(b).unwrap();
        let report = engine.run();

        assert_eq!(b_calls.load(Ordering::SeqCst), 1);
        assert_eq!(report.outcome("A"), Some(&TaskOutcome::Ran));
        assert_eq!(report.outcome("B"), Some(&TaskOutcome::Ran));
    }

    #[test]
    fn engine_default_tolerant_applies_without_override() {
        let b = FnTask::new("B", vec![Slot::Y], vec![Slot::Z], |_| Ok(vec![Some(Val::Z(0))]));
        let mut engine: Engine<Val> = Engine::new(ResolutionMode::Tolerant);
        engine.register(b).unwrap();
        assert!(engine.run().value(Slot::Z).is_some());
    }

    #[test]
    fn strict_task_with_missing_input_is_not_run() {
        let b = FnTask::new("B", vec![Slot::Y], vec![Slot::Z], |_| Ok(vec![Some(Val::Z(0))]));
        let c = FnTask::new("C", vec![Slot::Z], vec![], |_| Ok(vec![]));
        let (b_calls, c_calls) = (Arc::clone(&b.calls), Arc::clone(&c.calls));

        let mut engine: Engine<Val> = Engine::default();
        engine.register(b).unwrap();
        engine.register(c).unwrap();
        let report = engine.run();

        assert_eq!(b_calls.load(Ordering::SeqCst), 0);
        assert_eq!(c_calls.load(Ordering::SeqCst), 0);
        assert_eq!(
            report.outcome("B"),
            Some(&TaskOutcome::Declined {
                missing: vec!["Y".to_string()]
            })
        );
        assert!(report.value(Slot::Z).is_none());
    }

    #[test]
    fn failing_task_leaves_outputs_absent() {
        let a = FnTask::new("A", vec![], vec![Slot::X], |_| {
            Err(DiagError::Runtime {
                details: "boom".to_string(),
            })
        });
        let b = FnTask::new("B", vec![Slot::X], vec![Slot::Y], |_| Ok(vec![None]));
        let b_calls = Arc::clone(&b.calls);
        let mut engine: Engine<Val> = Engine::default();
        engine.register(a).unwrap();
        engine.register(b).unwrap();
        let report = engine.run();

        assert!(matches!(report.outcome("A"), Some(TaskOutcome::Failed { .. })));
        assert_eq!(b_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn misshaped_result_is_a_failure() {
        let wrong_slot = FnTask::new("A", vec![], vec![Slot::X], |_| Ok(vec![Some(Val::Y(1))]));
        let wrong_len = FnTask::new("B", vec![], vec![Slot::Z], |_| Ok(vec![]));
        let mut engine: Engine<Val> = Engine::default();
        engine.register(wrong_slot).unwrap();
        engine.register(wrong_len).unwrap();
        let report = engine.run();
        assert_eq!(report.failures(), 2);
        assert!(report.value(Slot::X).is_none());
    }

    #[test]
    fn registration_rejects_bad_shapes() {
        let mut engine: Engine<Val> = Engine::default();
        let cases = vec![
            FnTask::new("", vec![], vec![Slot::X], |_| Ok(vec![None])),
            FnTask::new("dup-in", vec![Slot::X, Slot::X], vec![], |_| Ok(vec![])),
            FnTask::new("dup-out", vec![], vec![Slot::Y, Slot::Y], |_| Ok(vec![])),
            FnTask::new("self", vec![Slot::Z], vec![Slot::Z], |_| Ok(vec![None])),
        ];
        for task in cases {
            let err = engine.register(task).unwrap_err();
            assert_eq!(err.code(), "DIAG-2201");
        }
        assert!(engine.is_empty());
    }

    #[test]
    fn registration_rejects_second_producer_and_cycles() {
        let mut engine: Engine<Val> = Engine::default();
        engine
            .register(FnTask::new("A", vec![Slot::Z], vec![Slot::X], |_| Ok(vec![None])))
            .unwrap();
        let err = engine
            .register(FnTask::new("A2", vec![], vec![Slot::X], |_| Ok(vec![None])))
            .unwrap_err();
        assert!(err.to_string().contains("already produced"));

        engine
            .register(FnTask::new("B", vec![Slot::X], vec![Slot::Y], |_| Ok(vec![None])))
            .unwrap();
        let err = engine
            .register(FnTask::new("C", vec![Slot::Y], vec![Slot::Z], |_| Ok(vec![None])))
            .unwrap_err();
        assert!(err.to_string().contains("cycle"));
        assert_eq!(engine.len(), 2);
    }

    #[test]
    fn mode_parses_and_displays() {
        assert_eq!("Tolerant".parse::<ResolutionMode>().unwrap(), ResolutionMode::Tolerant);
        assert_eq!(ResolutionMode::Strict.to_string(), "strict");
        assert!("lenient".parse::<ResolutionMode>().is_err());
    }
}
