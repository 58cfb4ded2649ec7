//! JSON summary of a probe run.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use h2mangle::MutationRecord;
use serde::Serialize;

use crate::error::ProbeError;
use crate::io::Observations;

/// One rewritten frame.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct MutatedFrame {
    pub index:              usize,
    pub offset:             usize,
    pub original_type:      String,
    pub original_length:    u32,
    pub replacement_type:   String,
    pub replacement_flags:  u8,
    pub replacement_stream: u32,
    pub replacement_length: u32,
    pub intercepted:        bool,
}

impl From<&MutationRecord> for MutatedFrame {
    fn from(record: &MutationRecord) -> Self {
        Self {
            index:              record.index,
            offset:             record.offset,
            original_type:      record.original.frame_type.to_string(),
            original_length:    record.original.length,
            replacement_type:   record.replacement.frame_type.to_string(),
            replacement_flags:  record.replacement.flags,
            replacement_stream: record.replacement.stream_id.0,
            replacement_length: record.replacement.length,
            intercepted:        record.intercepted,
        }
    }
}

/// Summary of one probed connection
#[derive(Debug, Clone, Serialize)]
pub struct ProbeReport {
    pub mode:      &'static str,
    pub target:    String,
    pub rule:      String,
    pub mutations: Vec<MutatedFrame>,
    pub events:    Vec<String>,
    pub verdict:   String,
    pub enforced:  bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status:    Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error:     Option<String>,
}

impl ProbeReport {
    pub fn new(mode: &'static str, target: String, rule: String, observations: &Observations) -> Self {
        let verdict = observations.verdict();
        Self {
            mode,
            target,
            rule,
            mutations: observations.mutations.iter().map(MutatedFrame::from).collect(),
            events: observations.events.iter().map(ToString::to_string).collect(),
            verdict: verdict.to_string(),
            enforced: matches!(verdict, h2mangle::Verdict::Enforced { .. }),
            status: None,
            error: None,
        }
    }

    pub fn with_status(mut self, status: Option<u16>) -> Self {
        self.status = status;
        self
    }

    pub fn with_error(mut self, error: Option<&h2::Error>) -> Self {
        self.error = error.map(ToString::to_string);
        self
    }

    pub fn to_json(&self) -> Result<String, ProbeError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn write_to(&self, path: &Path) -> Result<(), ProbeError> {
        let mut writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(&mut writer, self)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }
}
