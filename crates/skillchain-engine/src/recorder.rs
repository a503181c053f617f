use std::collections::HashMap;
use std::sync::Mutex;

use skillchain_core::error::Result;
use skillchain_core::traits::Recorder;
use skillchain_core::types::{ExecutionRecord, RunId};

/// In-process append-only recorder. The engine default.
#[derive(Debug, Default)]
pub struct MemoryRecorder {
    runs: Mutex<HashMap<RunId, Vec<ExecutionRecord>>>,
}

impl MemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run ids with at least one record.
    pub fn runs(&self) -> Vec<RunId> {
        let runs = self.runs.lock().unwrap_or_else(|e| e.into_inner());
        runs.keys().cloned().collect()
    }
}

impl Recorder for MemoryRecorder {
    fn record(&self, record: &ExecutionRecord) -> Result<()> {
        let mut runs = self.runs.lock().unwrap_or_else(|e| e.into_inner());
        runs.entry(record.run_id.clone())
            .or_default()
            .push(record.clone());
        Ok(())
    }

    fn history(&self, run_id: &RunId) -> Result<Vec<ExecutionRecord>> {
        let runs = self.runs.lock().unwrap_or_else(|e| e.into_inner());
        Ok(runs.get(run_id).cloned().unwrap_or_default())
    }
}
