use std::fmt;
use std::ops::{Deref, Index};

use crate::error::{Error, ErrorRecord, Result};
use crate::value::ValueRef;

/// One entry of a list, seen as a Rust result: `ErrorValue` entries become `Err`.
pub type ValueResult = std::result::Result<ValueRef, ErrorRecord>;

/// Ordered, immutable-once-built sequence of value handles.
///
/// This is the argument and result type of every operator and
/// [`GenericFunction`](crate::GenericFunction). Entries may be `ErrorValue`s: a
/// list can carry successes and failures side by side.
#[derive(Clone, Default)]
pub struct ValueRefList {
    items: Vec<ValueRef>,
}

impl ValueRefList {
    pub fn new() -> Self {
        ValueRefList { items: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        ValueRefList {
            items: Vec::with_capacity(capacity),
        }
    }

    /// A one-element list.
    pub fn single(value: ValueRef) -> Self {
        ValueRefList { items: vec![value] }
    }

    /// A one-element list holding an `ErrorValue`: the shape of a failed call.
    pub fn error(record: impl Into<ErrorRecord>) -> Self {
        ValueRefList::single(ValueRef::error(record))
    }

    pub fn push(&mut self, value: ValueRef) {
        self.items.push(value);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Checked access; `None` when out of range.
    pub fn get(&self, index: usize) -> Option<&ValueRef> {
        self.items.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ValueRef> {
        self.items.iter()
    }

    pub fn as_slice(&self) -> &[ValueRef] {
        &self.items
    }

    pub fn into_vec(self) -> Vec<ValueRef> {
        self.items
    }

    /// This list followed by `other`.
    pub fn concat(mut self, other: ValueRefList) -> Self {
        self.items.extend(other.items);
        self
    }

    // Error entries

    pub fn has_error(&self) -> bool {
        self.items.iter().any(|v| v.is_error())
    }

    /// Positions and records of all `ErrorValue` entries.
    pub fn errors(&self) -> impl Iterator<Item = (usize, &ErrorRecord)> + '_ {
        self.items
            .iter()
            .enumerate()
            .filter_map(|(i, v)| v.as_error().map(|record| (i, record)))
    }

    pub fn first_error(&self) -> Option<&ErrorRecord> {
        self.errors().next().map(|(_, record)| record)
    }

    /// Whether this is the single-`ErrorValue` list of a failed call.
    ///
    /// An empty list is a successful call with no results, never a failure.
    pub fn is_failure(&self) -> bool {
        self.items.len() == 1 && self.items[0].is_error()
    }

    /// Per-entry results, keeping successes and failures in order.
    pub fn into_results(self) -> Vec<ValueResult> {
        self.items
            .into_iter()
            .map(|v| match v.as_error() {
                Some(record) => Err(record.clone()),
                None => Ok(v),
            })
            .collect()
    }

    /// Inverse of [`into_results`](Self::into_results): failures become `ErrorValue`s.
    pub fn from_results<I>(results: I) -> Self
    where
        I: IntoIterator<Item = ValueResult>,
    {
        results
            .into_iter()
            .map(|r| r.unwrap_or_else(|record| ValueRef::error(record)))
            .collect()
    }

    /// The list itself if no entry failed, otherwise the first failure.
    pub fn fail_fast(self) -> Result<ValueRefList> {
        match self.first_error() {
            Some(record) => Err(Error::Value(record.clone())),
            None => Ok(self),
        }
    }
}

impl Deref for ValueRefList {
    type Target = [ValueRef];

    fn deref(&self) -> &[ValueRef] {
        &self.items
    }
}

impl Index<usize> for ValueRefList {
    type Output = ValueRef;

    /// Unchecked access; an out-of-range index is a programming error.
    fn index(&self, index: usize) -> &ValueRef {
        match self.items.get(index) {
            Some(v) => v,
            None => panic!(
                "ValueRefList index {} out of range for length {}",
                index,
                self.items.len()
            ),
        }
    }
}

impl From<Vec<ValueRef>> for ValueRefList {
    fn from(items: Vec<ValueRef>) -> Self {
        ValueRefList { items }
    }
}

impl From<&[ValueRef]> for ValueRefList {
    fn from(items: &[ValueRef]) -> Self {
        ValueRefList {
            items: items.to_vec(),
        }
    }
}

impl<const N: usize> From<[ValueRef; N]> for ValueRefList {
    fn from(items: [ValueRef; N]) -> Self {
        ValueRefList {
            items: items.into(),
        }
    }
}

impl From<ValueRef> for ValueRefList {
    fn from(value: ValueRef) -> Self {
        ValueRefList::single(value)
    }
}

impl FromIterator<ValueRef> for ValueRefList {
    fn from_iter<I: IntoIterator<Item = ValueRef>>(iter: I) -> Self {
        ValueRefList {
            items: iter.into_iter().collect(),
        }
    }
}

impl Extend<ValueRef> for ValueRefList {
    fn extend<I: IntoIterator<Item = ValueRef>>(&mut self, iter: I) {
        self.items.extend(iter);
    }
}

impl IntoIterator for ValueRefList {
    type Item = ValueRef;
    type IntoIter = std::vec::IntoIter<ValueRef>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}

impl<'a> IntoIterator for &'a ValueRefList {
    type Item = &'a ValueRef;
    type IntoIter = std::slice::Iter<'a, ValueRef>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

impl fmt::Debug for ValueRefList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.items.iter()).finish()
    }
}

impl fmt::Display for ValueRefList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, v) in self.items.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", v)?;
        }
        f.write_str("]")
    }
}
