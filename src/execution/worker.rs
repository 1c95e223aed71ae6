//! The worker side of the process protocol.
//!
//! A worker is a fresh process running the binary's `worker` subcommand. It
//! builds its stage registry once, on the first `Init`, then answers tasks
//! until it receives `Shutdown` or its stdin closes. Stdout carries protocol
//! messages only; logging goes to stderr.

use crate::core::error::WorkerFailure;
use crate::execution::protocol::{
    read_message, write_message, ChunkTask, TaskOutcome, WorkerRequest, WorkerResponse,
};
use crate::filters::registry::StageRegistry;
use crate::filters::stage::{StageChunk, StageContext, StageOutput};
use crate::shm::array::SharedArray;
use crate::shm::store::SegmentStore;
use log::{debug, info};
use std::io::{self, BufRead, Write};
use std::sync::Arc;

/// Serve the protocol on this process's stdin and stdout.
///
/// `init` builds the stage registry. It runs once, when the first `Init`
/// arrives, so binaries that embed tomoflow can register their own stages.
pub fn serve_stdio<F>(init: F) -> io::Result<()>
where
    F: FnOnce() -> StageRegistry,
{
    let stdin = io::stdin();
    let stdout = io::stdout();
    serve(stdin.lock(), stdout.lock(), init)
}

/// Serve the protocol over arbitrary streams.
pub fn serve<R, W, F>(mut reader: R, mut writer: W, init: F) -> io::Result<()>
where
    R: BufRead,
    W: Write,
    F: FnOnce() -> StageRegistry,
{
    let pid = std::process::id();
    let mut init = Some(init);
    let mut registry: Option<StageRegistry> = None;
    let mut store: Option<Arc<dyn SegmentStore>> = None;

    while let Some(request) = read_message::<_, WorkerRequest>(&mut reader)? {
        match request {
            WorkerRequest::Init { store: location } => {
                if let Some(init) = init.take() {
                    registry = Some(init());
                }
                let stages = registry.as_ref().map(|r| r.names()).unwrap_or_default();
                info!("Worker {} ready with {} stages", pid, stages.len());
                store = Some(location.open());
                write_message(&mut writer, &WorkerResponse::Ready { pid, stages })?;
            }
            WorkerRequest::Task(task) => {
                let result = match (&registry, &store) {
                    (Some(registry), Some(store)) => execute_task(&task, registry, store.as_ref()),
                    _ => Err(WorkerFailure::Transform {
                        stage: task.stage.clone(),
                        chunk: task.chunk,
                        message: "worker received a task before Init".to_string(),
                    }),
                };
                let response = match result {
                    Ok(outcome) => WorkerResponse::Done(outcome),
                    Err(failure) => failed(&task, failure),
                };
                write_message(&mut writer, &response)?;
            }
            WorkerRequest::Shutdown => {
                write_message(&mut writer, &WorkerResponse::Goodbye)?;
                debug!("Worker {} shutting down", pid);
                break;
            }
        }
    }
    Ok(())
}

fn failed(task: &ChunkTask, failure: WorkerFailure) -> WorkerResponse {
    match failure {
        WorkerFailure::Transform {
            stage,
            chunk,
            message,
        } => WorkerResponse::Failed {
            stage,
            chunk,
            message,
        },
        other => WorkerResponse::Failed {
            stage: task.stage.clone(),
            chunk: task.chunk,
            message: other.to_string(),
        },
    }
}

/// Run one task against segments in `store`.
///
/// Frame-producing stages write their frames into the output segment at the
/// chunk's offset; values-producing stages return one value per frame. Every
/// error is reported as [`WorkerFailure::Transform`] naming the stage and
/// chunk.
pub fn execute_task(
    task: &ChunkTask,
    registry: &StageRegistry,
    store: &dyn SegmentStore,
) -> Result<TaskOutcome, WorkerFailure> {
    let fail = |message: String| WorkerFailure::Transform {
        stage: task.stage.clone(),
        chunk: task.chunk,
        message,
    };

    let transform = registry
        .get(&task.stage)
        .ok_or_else(|| fail(format!("stage '{}' is not registered in this worker", task.stage)))?;

    let sample = SharedArray::attach(store, &task.sample).map_err(|e| fail(e.to_string()))?;
    let flat = task
        .flat
        .as_ref()
        .map(|segment| SharedArray::attach(store, segment))
        .transpose()
        .map_err(|e| fail(e.to_string()))?;
    let dark = task
        .dark
        .as_ref()
        .map(|segment| SharedArray::attach(store, segment))
        .transpose()
        .map_err(|e| fail(e.to_string()))?;

    let chunk = StageChunk {
        sample: sample.view_frames(task.chunk).map_err(|e| fail(e.to_string()))?,
        flat: flat.as_ref().map(|a| a.view()).transpose().map_err(|e| fail(e.to_string()))?,
        dark: dark.as_ref().map(|a| a.view()).transpose().map_err(|e| fail(e.to_string()))?,
        range: task.chunk,
    };
    let ctx = StageContext {
        params: &task.params,
        side_values: &task.side_values,
    };

    let output = transform.apply(&chunk, &ctx).map_err(|e| fail(e.to_string()))?;
    debug!("Stage '{}' finished frames {}", task.stage, task.chunk);

    match (output, &task.output) {
        (StageOutput::Frames(frames), Some(target)) => {
            let expected = [task.chunk.len(), target.shape[1], target.shape[2]];
            if frames.shape() != expected {
                return Err(fail(format!(
                    "returned frames of shape {:?}, expected {:?}",
                    frames.shape(),
                    expected
                )));
            }
            let mut out = SharedArray::attach(store, target).map_err(|e| fail(e.to_string()))?;
            out.write_frames(task.chunk.start, &frames.view())
                .map_err(|e| fail(e.to_string()))?;
            Ok(TaskOutcome {
                chunk: task.chunk,
                values: None,
            })
        }
        (StageOutput::Values(values), None) => {
            if values.len() != task.chunk.len() {
                return Err(fail(format!(
                    "returned {} values for {} frames",
                    values.len(),
                    task.chunk.len()
                )));
            }
            Ok(TaskOutcome {
                chunk: task.chunk,
                values: Some(values),
            })
        }
        (StageOutput::Frames(_), None) => Err(fail(
            "returned frames but no output segment was given".to_string(),
        )),
        (StageOutput::Values(_), Some(_)) => Err(fail(
            "returned values where frames were expected".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::chunked::ChunkRange;
    use crate::core::types::{Dtype, Volume};
    use crate::filters::stage::{SideValues, StageParams};
    use crate::shm::registry::SegmentRegistry;
    use crate::shm::store::DirectoryStore;
    use std::io::Cursor;

    fn segments(dir: &tempfile::TempDir) -> SegmentRegistry {
        SegmentRegistry::new().with_store(Arc::new(DirectoryStore::new(dir.path())))
    }

    fn task(
        stage: &str,
        chunk: ChunkRange,
        sample: &SharedArray,
        output: Option<&SharedArray>,
    ) -> ChunkTask {
        ChunkTask {
            stage: stage.to_string(),
            params: StageParams::new(),
            side_values: SideValues::new(),
            chunk,
            sample: sample.segment().clone(),
            flat: None,
            dark: None,
            output: output.map(|o| o.segment().clone()),
        }
    }

    #[test]
    fn test_execute_frame_task_writes_output_range() {
        let dir = tempfile::tempdir().unwrap();
        let segments = segments(&dir);
        let volume = Volume::from_fn(Dtype::Float32, [6, 2, 3], |z, _, _| (z + 1) as f64);
        let mut sample = segments.create_array(volume.shape(), volume.dtype()).unwrap();
        sample.store(&volume.view()).unwrap();
        let output = segments.create_array(volume.shape(), volume.dtype()).unwrap();

        let registry = StageRegistry::with_builtins();
        let request = task("minus_log", ChunkRange::new(2, 4), &sample, Some(&output));
        let outcome = execute_task(&request, &registry, segments.store().as_ref()).unwrap();
        assert_eq!(outcome.values, None);

        let result = output.to_volume().unwrap();
        assert_eq!(result.get([0, 0, 0]), Some(0.0));
        let expected = -(3.0f64.ln()) as f32;
        assert_eq!(result.get([2, 1, 2]), Some(expected as f64));
        assert_eq!(result.get([4, 0, 0]), Some(0.0));
    }

    #[test]
    fn test_execute_values_task() {
        let dir = tempfile::tempdir().unwrap();
        let segments = segments(&dir);
        let volume = Volume::from_fn(Dtype::Float64, [4, 2, 2], |z, _, _| z as f64 * 2.0);
        let mut sample = segments.create_array(volume.shape(), volume.dtype()).unwrap();
        sample.store(&volume.view()).unwrap();

        let registry = StageRegistry::with_builtins();
        let request = task("compute_scale_factors", ChunkRange::new(1, 4), &sample, None);
        let outcome = execute_task(&request, &registry, segments.store().as_ref()).unwrap();
        assert_eq!(outcome.values, Some(vec![2.0, 4.0, 6.0]));
    }

    #[test]
    fn test_stage_error_names_stage_and_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let segments = segments(&dir);
        let sample = segments.create_array([3, 2, 2], Dtype::Float32).unwrap();
        let output = segments.create_array([3, 2, 2], Dtype::Float32).unwrap();

        let registry = StageRegistry::with_builtins();
        // cut_off without its level parameter
        let request = task("cut_off", ChunkRange::new(0, 3), &sample, Some(&output));
        let err = execute_task(&request, &registry, segments.store().as_ref()).unwrap_err();
        match err {
            WorkerFailure::Transform { stage, chunk, message } => {
                assert_eq!(stage, "cut_off");
                assert_eq!(chunk, ChunkRange::new(0, 3));
                assert!(message.contains("level"));
            }
            other => panic!("unexpected failure {:?}", other),
        }
    }

    #[test]
    fn test_serve_handshake_task_and_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let segments = segments(&dir);
        let sample = segments.create_array([2, 1, 1], Dtype::Float64).unwrap();

        let mut input = Vec::new();
        let factors = task("compute_scale_factors", ChunkRange::new(0, 2), &sample, None);
        let init = WorkerRequest::Init {
            store: segments.store().location(),
        };
        write_message(&mut input, &WorkerRequest::Task(factors.clone())).unwrap();
        write_message(&mut input, &init).unwrap();
        write_message(&mut input, &WorkerRequest::Task(factors)).unwrap();
        write_message(&mut input, &WorkerRequest::Shutdown).unwrap();
        write_message(&mut input, &WorkerRequest::Shutdown).unwrap();

        let mut output = Vec::new();
        serve(Cursor::new(input), &mut output, StageRegistry::with_builtins).unwrap();

        let mut reader = Cursor::new(output);
        let mut responses = Vec::new();
        while let Some(response) = read_message::<_, WorkerResponse>(&mut reader).unwrap() {
            responses.push(response);
        }
        assert_eq!(responses.len(), 4);
        assert!(matches!(responses[0], WorkerResponse::Failed { .. }));
        match &responses[1] {
            WorkerResponse::Ready { pid, stages } => {
                assert_eq!(*pid, std::process::id());
                assert!(stages.iter().any(|s| s == "median_filter"));
            }
            other => panic!("expected Ready, got {:?}", other),
        }
        assert!(matches!(
            &responses[2],
            WorkerResponse::Done(outcome) if outcome.values == Some(vec![0.0, 0.0])
        ));
        assert_eq!(responses[3], WorkerResponse::Goodbye);
    }
}
