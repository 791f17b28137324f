//! Monotonic id counter persisted next to the data.

use std::fs;
use std::path::Path;

use parking_lot::Mutex;

use crate::codec::parse_document;
use crate::error::{Error, Result};

/// File name of the persisted counter in an embedded store.
pub const IDGEN_FILE: &str = "idgen.xml";

/// Transaction slot of the staged counter; not a valid record id.
pub(crate) const COUNTER_SLOT: &str = "#counter";

#[derive(Debug)]
struct Counter {
    value: u64,
    dirty: bool,
}

/// Hands out string ids from a single counter.
///
/// `next_id` increments and reads under one lock, so concurrent callers
/// never see the same value. The counter is only written back when dirty.
#[derive(Debug)]
pub struct IdGenerator {
    counter: Mutex<Counter>,
}

impl IdGenerator {
    /// A generator whose first id will be `base + 1`.
    pub fn new(base: u64) -> Self {
        Self {
            counter: Mutex::new(Counter {
                value: base,
                dirty: false,
            }),
        }
    }

    /// Loads a persisted counter; `NotFound` if `path` does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(Error::not_found(path.display().to_string()));
        }
        let xml = fs::read_to_string(path)?;
        Self::from_xml(&xml, path)
    }

    pub fn from_xml(xml: &str, source: &Path) -> Result<Self> {
        let root = parse_document(xml, source)?;
        let counter = root
            .children
            .iter()
            .find(|e| e.name == "counter")
            .ok_or_else(|| Error::malformed(source, "no counter element"))?;
        let value = counter
            .text
            .trim()
            .parse::<u64>()
            .map_err(|e| Error::malformed(source, format!("bad counter {:?}: {e}", counter.text)))?;
        Ok(Self::new(value))
    }

    pub fn to_xml(value: u64) -> String {
        format!("<?xml version=\"1.0\"?>\n<xmlroot>\n  <counter>{value}</counter>\n</xmlroot>\n")
    }

    pub fn next_id(&self) -> String {
        let mut counter = self.counter.lock();
        counter.value += 1;
        counter.dirty = true;
        counter.value.to_string()
    }

    pub fn value(&self) -> u64 {
        self.counter.lock().value
    }

    /// Raises the counter to at least `value`. Never lowers it.
    pub fn raise_to(&self, value: u64) {
        let mut counter = self.counter.lock();
        if counter.value < value {
            counter.value = value;
            counter.dirty = true;
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.counter.lock().dirty
    }

    /// Value to write back, if anything changed since the last flush.
    pub fn pending_flush(&self) -> Option<u64> {
        let counter = self.counter.lock();
        counter.dirty.then_some(counter.value)
    }

    /// Records that `value` reached storage. Ids issued in the meantime
    /// keep the counter dirty.
    pub fn mark_flushed(&self, value: u64) {
        let mut counter = self.counter.lock();
        if counter.value == value {
            counter.dirty = false;
        }
    }
}
