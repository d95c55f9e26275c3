// Batch — Run one function over many argument lists, keeping every failure
//
// Batched execution must not stop at the first bad item: each item's result
// list is kept, successes and failures side by side, and the failures are
// enumerated afterwards. Function values are Send + Sync, so the parallel
// variant simply fans the items out over rayon.

use log::{debug, warn};
use rayon::prelude::*;

use shrew_value::{Error, ErrorRecord, GenericFunction, Result, ValueRefList};

/// One failed entry of one batch item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchFailure {
    /// Which item of the batch.
    pub item: usize,
    /// Which entry of that item's result list.
    pub entry: usize,
    pub error: ErrorRecord,
}

/// Results of a batch run, in input order.
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    results: Vec<ValueRefList>,
}

impl BatchReport {
    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn results(&self) -> &[ValueRefList] {
        &self.results
    }

    pub fn get(&self, item: usize) -> Option<&ValueRefList> {
        self.results.get(item)
    }

    /// Every `ErrorValue` in every result list.
    pub fn failures(&self) -> Vec<BatchFailure> {
        self.results
            .iter()
            .enumerate()
            .flat_map(|(item, list)| {
                list.errors().map(move |(entry, error)| BatchFailure {
                    item,
                    entry,
                    error: error.clone(),
                })
            })
            .collect()
    }

    /// Number of items whose result list holds no error.
    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|l| !l.has_error()).count()
    }

    pub fn is_clean(&self) -> bool {
        self.succeeded() == self.len()
    }

    pub fn into_results(self) -> Vec<ValueRefList> {
        self.results
    }

    /// All result lists, or the first failure.
    pub fn fail_fast(self) -> Result<Vec<ValueRefList>> {
        match self.failures().into_iter().next() {
            Some(failure) => Err(Error::Value(failure.error)),
            None => Ok(self.results),
        }
    }

    fn log_summary(&self, name: &str) {
        let failed = self.len() - self.succeeded();
        if failed > 0 {
            warn!("{}: {} of {} batch item(s) failed", name, failed, self.len());
        } else {
            debug!("{}: {} batch item(s) succeeded", name, self.len());
        }
    }
}

/// Call `func` on every item in order.
pub fn run_batch<I>(func: &GenericFunction, items: I) -> BatchReport
where
    I: IntoIterator<Item = ValueRefList>,
{
    let report = BatchReport {
        results: items.into_iter().map(|inputs| func.call(&inputs)).collect(),
    };
    report.log_summary(func.name());
    report
}

/// Like [`run_batch`], with items processed in parallel. Result order is preserved.
pub fn par_run_batch(func: &GenericFunction, items: &[ValueRefList]) -> BatchReport {
    let report = BatchReport {
        results: items.par_iter().map(|inputs| func.call(inputs)).collect(),
    };
    report.log_summary(func.name());
    report
}
