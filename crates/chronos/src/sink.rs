//! Record sinks.
//!
//! A sink receives each completed [`MeasureRecord`] exactly once. Any
//! `Fn(MeasureRecord) -> Result<(), SinkError>` closure is a sink; two
//! ready-made sinks cover in-memory collection and JSON-lines output.

use std::cell::RefCell;
use std::io::{BufRead, Write};
use std::rc::Rc;

use crate::error::SinkError;
use crate::types::MeasureRecord;

/// Destination for completed measures.
pub trait Sink {
    fn store(&self, record: MeasureRecord) -> Result<(), SinkError>;
}

impl<F> Sink for F
where
    F: Fn(MeasureRecord) -> Result<(), SinkError>,
{
    fn store(&self, record: MeasureRecord) -> Result<(), SinkError> {
        self(record)
    }
}

/// Type alias for a shared sink.
pub type SharedSink = Rc<dyn Sink>;

/// Collects records in memory. Clones share the same storage.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    records: Rc<RefCell<Vec<MeasureRecord>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every record received so far.
    pub fn records(&self) -> Vec<MeasureRecord> {
        self.records.borrow().clone()
    }

    /// Names of received records, in delivery order.
    pub fn names(&self) -> Vec<String> {
        self.records.borrow().iter().map(|r| r.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.records.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.borrow().is_empty()
    }

    /// Remove and return every record received so far.
    pub fn take(&self) -> Vec<MeasureRecord> {
        std::mem::take(&mut *self.records.borrow_mut())
    }
}

impl Sink for MemorySink {
    fn store(&self, record: MeasureRecord) -> Result<(), SinkError> {
        self.records.borrow_mut().push(record);
        Ok(())
    }
}

/// Writes each record as one JSON object per line, flushing after every
/// record.
pub struct JsonLinesSink<W: Write> {
    writer: RefCell<W>,
}

impl<W: Write> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: RefCell::new(writer),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

impl JsonLinesSink<std::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl<W: Write> Sink for JsonLinesSink<W> {
    fn store(&self, record: MeasureRecord) -> Result<(), SinkError> {
        let line = serde_json::to_string(&record)?;
        let mut writer = self.writer.borrow_mut();
        writeln!(writer, "{}", line)?;
        writer.flush()?;
        Ok(())
    }
}

/// Read records back from JSON-lines input, skipping blank lines.
pub fn read_records(reader: impl BufRead) -> Result<Vec<MeasureRecord>, SinkError> {
    let mut records = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        records.push(serde_json::from_str(&line)?);
    }
    Ok(records)
}
