//! Line-delimited JSON backend.

use super::records::Record;
use super::RecordSink;
use alloy_primitives::B256;
use eyre::{Result, WrapErr};
use parking_lot::Mutex;
use std::io::{BufWriter, Write};
use std::sync::atomic::{AtomicU64, Ordering};

/// Writes one record per line; stdout by default.
pub struct JsonLines {
    writer: Mutex<BufWriter<Box<dyn Write + Send>>>,
    lines: AtomicU64,
}

impl std::fmt::Debug for JsonLines {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonLines")
            .field("lines", &self.lines.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl JsonLines {
    pub fn stdout() -> Self {
        Self::new(Box::new(std::io::stdout()))
    }

    pub fn new(writer: Box<dyn Write + Send>) -> Self {
        Self {
            writer: Mutex::new(BufWriter::new(writer)),
            lines: AtomicU64::new(0),
        }
    }

    pub fn lines(&self) -> u64 {
        self.lines.load(Ordering::Relaxed)
    }
}

impl RecordSink for JsonLines {
    fn write(&self, records: &[Record]) -> Result<()> {
        let mut writer = self.writer.lock();
        for record in records {
            serde_json::to_writer(&mut *writer, record)
                .wrap_err_with(|| format!("failed to encode {} record", record.type_name()))?;
            writer.write_all(b"\n")?;
        }
        writer.flush().wrap_err("failed to flush json output")?;
        self.lines.fetch_add(records.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// No index is kept, so every block is unknown.
    fn has_block(&self, _hash: &B256) -> Result<bool> {
        Ok(false)
    }

    fn flush(&self) -> Result<()> {
        self.writer.lock().flush()?;
        Ok(())
    }
}
