// Trace — Recorded straight-line programs replayed over fresh inputs
//
// A trace is a list of steps over numbered value slots:
//
//   slots [0, num_inputs)  the replay inputs
//   each step              reads some earlier slots, calls a GenericFunction,
//                          and appends its results as new slots
//
// Replay never unwinds. A step that fails writes its ErrorValue into every
// one of its output slots; a step that reads an ErrorValue is skipped and
// passes the first such error on. Inspection is deferred: the caller gets a
// Replay holding every slot and decides afterwards what to do about errors.

use std::fmt;

use log::{debug, trace};

use shrew_value::{
    bail, forward_errors, Error, ErrorRecord, GenericFunction, Result, ValueRef, ValueRefList,
};

/// Position of a value in a trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Slot(usize);

impl Slot {
    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

#[derive(Debug, Clone)]
struct Step {
    func: GenericFunction,
    inputs: Vec<Slot>,
    num_outputs: usize,
}

/// A recorded sequence of function applications.
#[derive(Debug, Clone, Default)]
pub struct Trace {
    num_inputs: usize,
    num_slots: usize,
    steps: Vec<Step>,
    outputs: Vec<Slot>,
}

impl Trace {
    /// An empty trace taking `num_inputs` values.
    pub fn new(num_inputs: usize) -> Self {
        Trace {
            num_inputs,
            num_slots: num_inputs,
            steps: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub fn num_inputs(&self) -> usize {
        self.num_inputs
    }

    pub fn num_steps(&self) -> usize {
        self.steps.len()
    }

    pub fn num_slots(&self) -> usize {
        self.num_slots
    }

    /// Slot of the `i`-th replay input.
    pub fn input(&self, i: usize) -> Result<Slot> {
        if i >= self.num_inputs {
            bail!("trace input {} out of range ({} inputs)", i, self.num_inputs);
        }
        Ok(Slot(i))
    }

    fn check_slots(&self, slots: &[Slot]) -> Result<()> {
        match slots.iter().find(|s| s.0 >= self.num_slots) {
            Some(s) => bail!("slot {} not defined yet ({} slots)", s, self.num_slots),
            None => Ok(()),
        }
    }

    /// Append a step; returns the slots its results will occupy.
    pub fn record(
        &mut self,
        func: GenericFunction,
        inputs: &[Slot],
        num_outputs: usize,
    ) -> Result<Vec<Slot>> {
        self.check_slots(inputs)?;
        let first = self.num_slots;
        self.num_slots += num_outputs;
        trace!(
            "record {}({:?}) -> {} output(s) at {}",
            func.name(),
            inputs,
            num_outputs,
            first
        );
        self.steps.push(Step {
            func,
            inputs: inputs.to_vec(),
            num_outputs,
        });
        Ok((first..self.num_slots).map(Slot).collect())
    }

    /// Choose which slots a replay reports as its outputs.
    pub fn set_outputs(&mut self, outputs: &[Slot]) -> Result<()> {
        self.check_slots(outputs)?;
        self.outputs = outputs.to_vec();
        Ok(())
    }

    /// Run every step over `inputs`.
    ///
    /// Fails only when `inputs` does not match the trace's arity; every
    /// failure inside a step is stored in the replay instead.
    pub fn replay(&self, inputs: &[ValueRef]) -> Result<Replay> {
        if inputs.len() != self.num_inputs {
            return Err(Error::ArityMismatch {
                op: "trace".to_string(),
                expected: self.num_inputs,
                got: inputs.len(),
            });
        }
        let mut slots: Vec<ValueRef> = Vec::with_capacity(self.num_slots);
        slots.extend_from_slice(inputs);
        let mut failures = Vec::new();

        for (index, step) in self.steps.iter().enumerate() {
            let args: Vec<ValueRef> = step.inputs.iter().map(|s| slots[s.0].clone()).collect();

            if let Some(errors) = forward_errors(&args) {
                debug!("step {} ({}): skipped, input failed", index, step.func.name());
                let first = errors[0].clone();
                slots.extend(std::iter::repeat(first).take(step.num_outputs));
                continue;
            }

            let results = step.func.call(&args);
            if results.is_failure() || results.len() != step.num_outputs {
                let record = match results.first_error() {
                    Some(record) if results.is_failure() => record.clone(),
                    _ => ErrorRecord::new(format!(
                        "{}: expected {} outputs, got {}",
                        step.func.name(),
                        step.num_outputs,
                        results.len()
                    )),
                };
                debug!("step {} ({}) failed: {}", index, step.func.name(), record);
                let error = ValueRef::error(record.clone());
                slots.extend(std::iter::repeat(error).take(step.num_outputs));
                failures.push(StepFailure {
                    step: index,
                    name: step.func.name().to_string(),
                    error: record,
                });
                continue;
            }

            for (entry, record) in results.errors() {
                failures.push(StepFailure {
                    step: index,
                    name: format!("{}[{}]", step.func.name(), entry),
                    error: record.clone(),
                });
            }
            slots.extend(results);
        }

        Ok(Replay {
            slots,
            outputs: self.outputs.clone(),
            failures,
        })
    }
}

/// A failure raised by a step (not one it merely passed on).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepFailure {
    pub step: usize,
    pub name: String,
    pub error: ErrorRecord,
}

/// The slots of one replay.
#[derive(Debug, Clone)]
pub struct Replay {
    slots: Vec<ValueRef>,
    outputs: Vec<Slot>,
    failures: Vec<StepFailure>,
}

impl Replay {
    pub fn get(&self, slot: Slot) -> Option<&ValueRef> {
        self.slots.get(slot.0)
    }

    /// The designated output slots, in order.
    pub fn outputs(&self) -> ValueRefList {
        self.outputs
            .iter()
            .filter_map(|s| self.slots.get(s.0).cloned())
            .collect()
    }

    /// Failures in step order.
    pub fn errors(&self) -> &[StepFailure] {
        &self.failures
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// The outputs, or the first failure of the replay.
    pub fn into_result(self) -> Result<ValueRefList> {
        match self.failures.first() {
            Some(failure) => Err(Error::Value(failure.error.clone())),
            None => Ok(self.outputs()),
        }
    }
}
