//! ReadingSink trait and the in-memory implementation.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::codec::Reading;
use crate::writer::WriteError;

// ------------------------------------------------------------------ //
//  Trait                                                              //
// ------------------------------------------------------------------ //

/// Destination for decoded readings. One call persists exactly one reading.
#[async_trait]
pub trait ReadingSink: Send {
    async fn write(&mut self, reading: &Reading) -> Result<(), WriteError>;
}

// ------------------------------------------------------------------ //
//  MemorySink (for tests)                                             //
// ------------------------------------------------------------------ //

/// In-memory sink that collects written readings for test assertions.
///
/// Clones share the same buffer, so a test can keep one handle while the
/// pipeline owns another.
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    rows: Arc<Mutex<Vec<Reading>>>,
    failures: Arc<Mutex<usize>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` writes fail with a connection-reset error.
    pub fn fail_next(&self, n: usize) {
        *self.failures.lock().unwrap() = n;
    }

    /// Non-destructive snapshot of the stored rows.
    pub fn snapshot(&self) -> Vec<Reading> {
        self.rows.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.rows.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ReadingSink for MemorySink {
    async fn write(&mut self, reading: &Reading) -> Result<(), WriteError> {
        {
            let mut failures = self.failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(WriteError::Insert(sqlx::Error::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionReset,
                    "injected failure",
                ))));
            }
        }
        // No dedup: every delivery is its own row.
        self.rows.lock().unwrap().push(reading.clone());
        Ok(())
    }
}
