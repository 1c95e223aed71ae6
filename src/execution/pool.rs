//! Worker pool management.
//!
//! A [`WorkerPool`] owns a fixed set of cold-started worker processes that
//! speak the line protocol in [`crate::execution::protocol`] over their stdio.
//! Tasks are handed out from a shared queue, so a fast worker takes more
//! chunks than a slow one. The first failure cancels the queue; tasks
//! already running are allowed to finish before the failure is returned.

use crate::core::config::resolve_cores;
use crate::core::error::{EngineResult, WorkerFailure};
use crate::execution::protocol::{
    read_message, write_message, ChunkTask, TaskOutcome, WorkerRequest, WorkerResponse,
};
use crate::execution::worker::execute_task;
use crate::filters::registry::StageRegistry;
use crate::shm::store::{SegmentStore, StoreLocation};
use crossbeam::channel;
use log::{debug, info, warn};
use parking_lot::Mutex;
use rayon::prelude::*;
use std::ffi::OsString;
use std::io::{self, BufReader};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

/// Something that can run a batch of chunk tasks to completion.
pub trait ChunkDispatcher: Send + Sync {
    /// Number of tasks that can run at once.
    fn workers(&self) -> usize;

    /// Run every task and return the outcomes in completion order.
    ///
    /// Blocks until all tasks finished or the first failure has drained.
    fn dispatch(&self, tasks: Vec<ChunkTask>) -> EngineResult<Vec<TaskOutcome>>;
}

/// How to launch a worker process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    program: PathBuf,
    args: Vec<OsString>,
    env: Vec<(OsString, OsString)>,
}

impl WorkerCommand {
    /// Launch `program` with no arguments.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    /// Launch the running binary's `worker` subcommand.
    pub fn current_exe() -> io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?).arg("worker"))
    }

    /// Append an argument.
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Set an environment variable for the worker.
    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// The program that will be launched.
    pub fn program(&self) -> &PathBuf {
        &self.program
    }

    fn to_command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .envs(self.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        command
    }
}

/// One live worker process and its pipes.
struct WorkerProcess {
    pid: u32,
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl WorkerProcess {
    fn spawn(command: &WorkerCommand) -> Result<Self, WorkerFailure> {
        let mut child = command
            .to_command()
            .spawn()
            .map_err(|e| WorkerFailure::Spawn(format!("{}: {}", command.program.display(), e)))?;
        let pid = child.id();
        let (stdin, stdout) = match (child.stdin.take(), child.stdout.take()) {
            (Some(stdin), Some(stdout)) => (stdin, stdout),
            _ => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(WorkerFailure::Spawn(format!("worker {} has no stdio pipes", pid)));
            }
        };
        debug!("Spawned worker {}", pid);
        Ok(Self {
            pid,
            child,
            stdin,
            stdout: BufReader::new(stdout),
        })
    }

    fn send(&mut self, request: &WorkerRequest) -> Result<(), WorkerFailure> {
        write_message(&mut self.stdin, request).map_err(|e| {
            debug!("Write to worker {} failed: {}", self.pid, e);
            WorkerFailure::Crashed { pid: self.pid }
        })
    }

    fn receive(&mut self) -> Result<WorkerResponse, WorkerFailure> {
        match read_message(&mut self.stdout) {
            Ok(Some(response)) => Ok(response),
            Ok(None) => Err(WorkerFailure::Crashed { pid: self.pid }),
            Err(e) if e.kind() == io::ErrorKind::InvalidData => Err(WorkerFailure::Protocol {
                pid: self.pid,
                message: e.to_string(),
            }),
            Err(e) => {
                debug!("Read from worker {} failed: {}", self.pid, e);
                Err(WorkerFailure::Crashed { pid: self.pid })
            }
        }
    }

    fn unexpected(&self, response: WorkerResponse) -> WorkerFailure {
        WorkerFailure::Protocol {
            pid: self.pid,
            message: format!("{:?}", response),
        }
    }

    fn handshake(
        &mut self,
        store: &StoreLocation,
        expected: &[String],
    ) -> Result<(), WorkerFailure> {
        self.send(&WorkerRequest::Init { store: store.clone() })?;
        match self.receive()? {
            WorkerResponse::Ready { stages, .. } => {
                let missing: Vec<String> = expected
                    .iter()
                    .filter(|name| !stages.contains(name))
                    .cloned()
                    .collect();
                if missing.is_empty() {
                    Ok(())
                } else {
                    Err(WorkerFailure::MissingStages { pid: self.pid, missing })
                }
            }
            other => Err(self.unexpected(other)),
        }
    }

    fn run(&mut self, task: &ChunkTask) -> Result<TaskOutcome, WorkerFailure> {
        self.send(&WorkerRequest::Task(task.clone()))?;
        match self.receive()? {
            WorkerResponse::Done(outcome) if outcome.chunk == task.chunk => Ok(outcome),
            WorkerResponse::Failed {
                stage,
                chunk,
                message,
            } => Err(WorkerFailure::Transform {
                stage,
                chunk,
                message,
            }),
            other => Err(self.unexpected(other)),
        }
    }

    fn shutdown(&mut self) -> Result<(), WorkerFailure> {
        self.send(&WorkerRequest::Shutdown)?;
        match self.receive()? {
            WorkerResponse::Goodbye => {}
            other => return Err(self.unexpected(other)),
        }
        self.child
            .wait()
            .map_err(|_| WorkerFailure::Crashed { pid: self.pid })?;
        debug!("Worker {} exited", self.pid);
        Ok(())
    }

    fn kill(&mut self) {
        if let Err(e) = self.child.kill() {
            debug!("Kill of worker {} failed: {}", self.pid, e);
        }
        if let Err(e) = self.child.wait() {
            warn!("Failed to reap worker {}: {}", self.pid, e);
        }
    }
}

/// A fixed-size pool of worker processes.
///
/// Dropping a running pool stops it, falling back to killing the workers
/// if a graceful stop fails.
pub struct WorkerPool {
    workers: Vec<Mutex<WorkerProcess>>,
    store: StoreLocation,
    running: bool,
}

impl WorkerPool {
    /// Spawn `requested` workers (0 = one per core) and wait for each to
    /// report that it registered every stage in `expected_stages`.
    pub fn start(
        requested: usize,
        command: &WorkerCommand,
        store: StoreLocation,
        expected_stages: &[String],
    ) -> EngineResult<Self> {
        let size = resolve_cores(requested);
        let mut pool = WorkerPool {
            workers: Vec::with_capacity(size),
            store,
            running: true,
        };
        for _ in 0..size {
            let worker = WorkerProcess::spawn(command)?;
            pool.workers.push(Mutex::new(worker));
        }
        for worker in &pool.workers {
            worker.lock().handshake(&pool.store, expected_stages)?;
        }
        info!("Started worker pool of {} processes", size);
        Ok(pool)
    }

    /// Number of workers.
    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Whether `stop` or `terminate` has not been called yet.
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Process ids of the workers.
    pub fn pids(&self) -> Vec<u32> {
        self.workers.iter().map(|w| w.lock().pid).collect()
    }

    /// Where the workers attach segments.
    pub fn store(&self) -> &StoreLocation {
        &self.store
    }

    /// Ask every worker to exit and wait for it. A second call does nothing.
    ///
    /// Workers that do not exit cleanly are killed; the first such failure
    /// is returned.
    pub fn stop(&mut self) -> Result<(), WorkerFailure> {
        if !self.running {
            return Ok(());
        }
        self.running = false;
        let mut first_error = None;
        for worker in &self.workers {
            let mut worker = worker.lock();
            if let Err(e) = worker.shutdown() {
                warn!("Worker {} did not stop cleanly: {}", worker.pid, e);
                worker.kill();
                first_error.get_or_insert(e);
            }
        }
        info!("Stopped worker pool of {} processes", self.workers.len());
        first_error.map_or(Ok(()), Err)
    }

    /// Kill every worker without waiting for in-flight tasks.
    pub fn terminate(&mut self) {
        if !self.running {
            return;
        }
        self.running = false;
        for worker in &self.workers {
            worker.lock().kill();
        }
        warn!("Terminated worker pool of {} processes", self.workers.len());
    }
}

impl ChunkDispatcher for WorkerPool {
    fn workers(&self) -> usize {
        self.size()
    }

    fn dispatch(&self, tasks: Vec<ChunkTask>) -> EngineResult<Vec<TaskOutcome>> {
        if !self.running {
            return Err(WorkerFailure::PoolStopped.into());
        }
        let total = tasks.len();
        let (task_tx, task_rx) = channel::unbounded::<ChunkTask>();
        for task in tasks {
            if task_tx.send(task).is_err() {
                break;
            }
        }
        drop(task_tx);

        let (result_tx, result_rx) = channel::unbounded();
        let cancelled = AtomicBool::new(false);
        thread::scope(|scope| {
            for worker in &self.workers {
                let task_rx = task_rx.clone();
                let result_tx = result_tx.clone();
                let cancelled = &cancelled;
                scope.spawn(move || {
                    let mut worker = worker.lock();
                    while !cancelled.load(Ordering::SeqCst) {
                        let Ok(task) = task_rx.recv() else {
                            break;
                        };
                        let result = worker.run(&task);
                        if result.is_err() {
                            cancelled.store(true, Ordering::SeqCst);
                        }
                        if result_tx.send(result).is_err() {
                            break;
                        }
                    }
                });
            }
        });
        drop(result_tx);

        collect_outcomes(result_rx.iter(), total)
    }
}

fn collect_outcomes<I>(results: I, total: usize) -> EngineResult<Vec<TaskOutcome>>
where
    I: IntoIterator<Item = Result<TaskOutcome, WorkerFailure>>,
{
    let mut outcomes = Vec::with_capacity(total);
    let mut first_error = None;
    for result in results {
        match result {
            Ok(outcome) => outcomes.push(outcome),
            Err(e) => {
                first_error.get_or_insert(e);
            }
        }
    }
    match first_error {
        Some(e) => Err(e.into()),
        None => Ok(outcomes),
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if self.running {
            if let Err(e) = self.stop() {
                warn!("Worker pool did not stop cleanly: {}", e);
            }
        }
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("size", &self.workers.len())
            .field("store", &self.store)
            .field("running", &self.running)
            .finish()
    }
}

/// Runs tasks on a rayon thread pool inside this process.
///
/// Uses the same task executor as the worker processes, so results are
/// identical to a process pool given the same segments.
pub struct InProcessDispatcher {
    pool: rayon::ThreadPool,
    registry: Arc<StageRegistry>,
    store: Arc<dyn SegmentStore>,
}

impl InProcessDispatcher {
    /// Create a dispatcher with `threads` threads (0 = one per core).
    pub fn new(
        threads: usize,
        registry: Arc<StageRegistry>,
        store: Arc<dyn SegmentStore>,
    ) -> EngineResult<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(resolve_cores(threads))
            .thread_name(|i| format!("tomoflow-chunk-{}", i))
            .build()
            .map_err(|e| WorkerFailure::Spawn(e.to_string()))?;
        Ok(Self { pool, registry, store })
    }
}

impl ChunkDispatcher for InProcessDispatcher {
    fn workers(&self) -> usize {
        self.pool.current_num_threads()
    }

    fn dispatch(&self, tasks: Vec<ChunkTask>) -> EngineResult<Vec<TaskOutcome>> {
        let total = tasks.len();
        let cancelled = AtomicBool::new(false);
        let results = Mutex::new(Vec::with_capacity(total));
        self.pool.install(|| {
            tasks.par_iter().for_each(|task| {
                if cancelled.load(Ordering::SeqCst) {
                    return;
                }
                let result = execute_task(task, &self.registry, self.store.as_ref());
                if result.is_err() {
                    cancelled.store(true, Ordering::SeqCst);
                }
                results.lock().push(result);
            });
        });
        collect_outcomes(results.into_inner(), total)
    }
}

impl std::fmt::Debug for InProcessDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcessDispatcher")
            .field("threads", &self.pool.current_num_threads())
            .field("store", &self.store)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::chunked::ChunkRange;
    use crate::core::error::EngineError;
    use crate::core::types::Dtype;
    use crate::filters::stage::{SideValues, StageParams};
    use crate::shm::registry::SegmentRegistry;
    use crate::shm::store::DirectoryStore;

    fn shell(script: &str) -> WorkerCommand {
        WorkerCommand::new("/bin/sh").arg("-c").arg(script)
    }

    #[test]
    fn test_current_exe_runs_worker_subcommand() {
        let command = WorkerCommand::current_exe().unwrap();
        assert_eq!(command.args, vec![OsString::from("worker")]);
        assert!(command.program().is_absolute());
    }

    #[test]
    fn test_spawn_failure() {
        let command = WorkerCommand::new("/nonexistent/tomoflow-worker");
        let err = WorkerPool::start(1, &command, StoreLocation::Posix, &[]).unwrap_err();
        assert!(matches!(err, EngineError::Worker(WorkerFailure::Spawn(_))));
    }

    #[test]
    fn test_worker_exiting_before_handshake_is_a_crash() {
        let err = WorkerPool::start(2, &shell("exit 0"), StoreLocation::Posix, &[]).unwrap_err();
        assert!(matches!(err, EngineError::Worker(WorkerFailure::Crashed { .. })));
    }

    #[test]
    fn test_garbage_reply_is_a_protocol_error() {
        let command = shell("read line; echo not-json; read line");
        let err = WorkerPool::start(1, &command, StoreLocation::Posix, &[]).unwrap_err();
        assert!(matches!(err, EngineError::Worker(WorkerFailure::Protocol { .. })));
    }

    #[test]
    fn test_missing_stages_fail_start() {
        let script = concat!(
            r#"read line; echo '{"type":"ready","pid":1,"stages":["crop"]}'; "#,
            r#"read line; echo '{"type":"goodbye"}'"#,
        );
        let expected = vec!["crop".to_string(), "rotate".to_string()];
        let err =
            WorkerPool::start(1, &shell(script), StoreLocation::Posix, &expected).unwrap_err();
        match err {
            EngineError::Worker(WorkerFailure::MissingStages { missing, .. }) => {
                assert_eq!(missing, vec!["rotate".to_string()]);
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_fake_worker_stops_twice() {
        let script = concat!(
            r#"read line; echo '{"type":"ready","pid":1,"stages":[]}'; "#,
            r#"read line; echo '{"type":"goodbye"}'"#,
        );
        let mut pool = WorkerPool::start(2, &shell(script), StoreLocation::Posix, &[]).unwrap();
        assert_eq!(pool.size(), 2);
        assert!(pool.is_running());
        pool.stop().unwrap();
        assert!(!pool.is_running());
        pool.stop().unwrap();
        let err = pool.dispatch(Vec::new()).unwrap_err();
        assert!(matches!(err, EngineError::Worker(WorkerFailure::PoolStopped)));
    }

    fn scale_factor_tasks(
        sample: &crate::shm::array::SharedArray,
        chunks: &[ChunkRange],
    ) -> Vec<ChunkTask> {
        chunks
            .iter()
            .map(|&chunk| ChunkTask {
                stage: "compute_scale_factors".to_string(),
                params: StageParams::new(),
                side_values: SideValues::new(),
                chunk,
                sample: sample.segment().clone(),
                flat: None,
                dark: None,
                output: None,
            })
            .collect()
    }

    #[test]
    fn test_in_process_dispatch() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn SegmentStore> = Arc::new(DirectoryStore::new(dir.path()));
        let segments = SegmentRegistry::new().with_store(store.clone());
        let sample = segments.create_array([8, 2, 2], Dtype::Float32).unwrap();

        let registry = Arc::new(StageRegistry::with_builtins());
        let dispatcher = InProcessDispatcher::new(3, registry, store).unwrap();
        assert_eq!(dispatcher.workers(), 3);
        let chunks = [ChunkRange::new(0, 3), ChunkRange::new(3, 6), ChunkRange::new(6, 8)];
        let mut outcomes = dispatcher.dispatch(scale_factor_tasks(&sample, &chunks)).unwrap();
        outcomes.sort_by_key(|o| o.chunk.start);
        let covered: Vec<ChunkRange> = outcomes.iter().map(|o| o.chunk).collect();
        assert_eq!(covered, chunks.to_vec());
    }

    #[test]
    fn test_in_process_dispatch_returns_transform_failure() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn SegmentStore> = Arc::new(DirectoryStore::new(dir.path()));
        let segments = SegmentRegistry::new().with_store(store.clone());
        let sample = segments.create_array([4, 2, 2], Dtype::Float32).unwrap();

        let chunks = [ChunkRange::new(0, 2), ChunkRange::new(2, 4)];
        let mut tasks = scale_factor_tasks(&sample, &chunks);
        tasks[1].params = StageParams::new().with("roi", serde_json::json!([0, 0, 5, 5]));

        let registry = Arc::new(StageRegistry::with_builtins());
        let dispatcher = InProcessDispatcher::new(1, registry, store).unwrap();
        let err = dispatcher.dispatch(tasks).unwrap_err();
        match err {
            EngineError::Worker(WorkerFailure::Transform { stage, chunk, .. }) => {
                assert_eq!(stage, "compute_scale_factors");
                assert_eq!(chunk, ChunkRange::new(2, 4));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }
}
