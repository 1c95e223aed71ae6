//! Messages exchanged between the parent and worker processes.
//!
//! Each message is one line of JSON on the worker's stdin or stdout. Array
//! data never travels in messages; tasks name the shared segments holding
//! it. Floating-point values are sent as their IEEE-754 bit patterns so that
//! every value, including NaN payloads and infinities, arrives unchanged.

use crate::core::chunked::ChunkRange;
use crate::filters::stage::{SideValues, StageParams};
use crate::shm::array::SegmentRef;
use crate::shm::store::StoreLocation;
use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::{self, BufRead, Write};

/// One unit of work: run a stage over a range of frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkTask {
    /// Stage name, resolved in the worker's registry.
    pub stage: String,
    /// Stage parameters.
    pub params: StageParams,
    /// Side values the stage consumes.
    #[serde(with = "side_value_bits")]
    pub side_values: SideValues,
    /// Frames to process.
    pub chunk: ChunkRange,
    /// Full sample array.
    pub sample: SegmentRef,
    /// Full flat array, when the stage uses references.
    pub flat: Option<SegmentRef>,
    /// Full dark array, when the stage uses references.
    pub dark: Option<SegmentRef>,
    /// Output array, for frame-producing stages.
    pub output: Option<SegmentRef>,
}

/// Result of a successful task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutcome {
    /// Frames that were processed.
    pub chunk: ChunkRange,
    /// Per-frame values, for values-producing stages.
    #[serde(with = "value_bits")]
    pub values: Option<Vec<f64>>,
}

/// Parent to worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerRequest {
    /// Build the stage registry and open the segment store.
    Init { store: StoreLocation },
    /// Run one task.
    Task(ChunkTask),
    /// Exit after replying.
    Shutdown,
}

/// Worker to parent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerResponse {
    /// Initialisation finished; lists the registered stages.
    Ready { pid: u32, stages: Vec<String> },
    /// Task finished.
    Done(TaskOutcome),
    /// Task failed.
    Failed {
        stage: String,
        chunk: ChunkRange,
        message: String,
    },
    /// The worker is exiting.
    Goodbye,
}

/// Write one message as a JSON line and flush.
pub fn write_message<W: Write, M: Serialize>(writer: &mut W, message: &M) -> io::Result<()> {
    serde_json::to_writer(&mut *writer, message)?;
    writer.write_all(b"\n")?;
    writer.flush()
}

/// Read one JSON line. Returns `None` at end of stream.
pub fn read_message<R: BufRead, M: DeserializeOwned>(reader: &mut R) -> io::Result<Option<M>> {
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            return Ok(None);
        }
        if !line.trim().is_empty() {
            break;
        }
    }
    serde_json::from_str(line.trim_end())
        .map(Some)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

fn to_bits(values: &[f64]) -> Vec<u64> {
    values.iter().map(|v| v.to_bits()).collect()
}

fn from_bits(bits: Vec<u64>) -> Vec<f64> {
    bits.into_iter().map(f64::from_bits).collect()
}

mod value_bits {
    use super::{from_bits, to_bits};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(
        values: &Option<Vec<f64>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        values.as_deref().map(to_bits).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<f64>>, D::Error> {
        Ok(Option::<Vec<u64>>::deserialize(deserializer)?.map(from_bits))
    }
}

mod side_value_bits {
    use super::{from_bits, to_bits, IndexMap, SideValues};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(values: &SideValues, serializer: S) -> Result<S::Ok, S::Error> {
        values
            .iter()
            .map(|(key, v)| (key, to_bits(v)))
            .collect::<IndexMap<_, _>>()
            .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<SideValues, D::Error> {
        let raw = IndexMap::<String, Vec<u64>>::deserialize(deserializer)?;
        let mut values = SideValues::new();
        for (key, bits) in raw {
            values.insert(key, from_bits(bits));
        }
        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Dtype;
    use std::io::Cursor;

    fn segment(name: &str) -> SegmentRef {
        SegmentRef {
            name: name.to_string(),
            shape: [10, 4, 4],
            dtype: Dtype::Float32,
        }
    }

    #[test]
    fn test_task_survives_the_wire() {
        let mut side_values = SideValues::new();
        side_values.insert("scale_factors", vec![1.5, f64::NAN, f64::INFINITY, -0.0]);
        let task = ChunkTask {
            stage: "apply_scale_factors".to_string(),
            params: StageParams::new().with("size", 3),
            side_values,
            chunk: ChunkRange::new(2, 6),
            sample: segment("TOMO_1_a"),
            flat: None,
            dark: None,
            output: Some(segment("TOMO_1_b")),
        };

        let mut buf = Vec::new();
        write_message(&mut buf, &WorkerRequest::Task(task.clone())).unwrap();
        assert_eq!(buf.iter().filter(|b| **b == b'\n').count(), 1);

        let back: WorkerRequest = read_message(&mut Cursor::new(buf)).unwrap().unwrap();
        let WorkerRequest::Task(back) = back else {
            panic!("expected a task");
        };
        let sent = task.side_values.get("scale_factors").unwrap();
        let received = back.side_values.get("scale_factors").unwrap();
        assert!(sent.iter().zip(received).all(|(a, b)| a.to_bits() == b.to_bits()));
        assert_eq!(back.chunk, task.chunk);
        assert_eq!(back.output, task.output);
    }

    #[test]
    fn test_read_skips_blank_lines_and_reports_eof() {
        let mut input = Cursor::new(b"\n{\"type\":\"shutdown\"}\n".to_vec());
        let first: Option<WorkerRequest> = read_message(&mut input).unwrap();
        assert_eq!(first, Some(WorkerRequest::Shutdown));
        let second: Option<WorkerRequest> = read_message(&mut input).unwrap();
        assert_eq!(second, None);
    }

    #[test]
    fn test_garbage_is_invalid_data() {
        let mut input = Cursor::new(b"not json\n".to_vec());
        let result: io::Result<Option<WorkerResponse>> = read_message(&mut input);
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::InvalidData);
    }
}
