//! Pipeline execution.
//!
//! [`PipelineExecutor`] runs an ordered stage list over an [`ImageStack`],
//! one stage at a time. A parallel stage with more than one core is split
//! into chunks along the frame axis, copied into shared segments and handed
//! to a [`ChunkDispatcher`]; every other stage runs in this process on the
//! whole stack. [`Engine`] owns the worker pool and starts it on demand.

use crate::core::chunked::{plan_split, ChunkRange, SplitPlan};
use crate::core::config::{resolve_cores, ResourceConfig};
use crate::core::error::{EngineError, EngineResult, PipelineError, WorkerFailure};
use crate::core::types::{ImageStack, Volume};
use crate::execution::pool::{ChunkDispatcher, WorkerCommand, WorkerPool};
use crate::execution::progress::{ProgressCallback, ProgressTracker, SkipReason};
use crate::execution::protocol::ChunkTask;
use crate::filters::pipeline::{validate_stages, PipelineKind, PipelineStage, AIR_REGION_STAGE};
use crate::filters::registry::StageRegistry;
use crate::filters::stage::{SideValues, StageChunk, StageCondition, StageContext, StageOutput};
use crate::shm::array::SharedArray;
use crate::shm::registry::SegmentRegistry;
use log::{debug, info, warn};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

/// Runs one kind of pipeline.
#[derive(Clone)]
pub struct PipelineExecutor {
    kind: PipelineKind,
    progress: Option<ProgressCallback>,
}

impl PipelineExecutor {
    /// Create an executor for `kind`.
    pub fn new(kind: PipelineKind) -> Self {
        Self { kind, progress: None }
    }

    /// Set a callback for progress updates.
    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    /// The pipeline kind this executor validates against.
    pub fn kind(&self) -> PipelineKind {
        self.kind
    }

    /// Run `stages` over `stack` and return the processed stack.
    ///
    /// The stage list is validated before anything runs. Chunked dispatch is
    /// used for parallel stages when more than one core is configured and a
    /// dispatcher is given; results are identical either way.
    pub fn run(
        &self,
        mut stack: ImageStack,
        stages: &[PipelineStage],
        resources: &ResourceConfig,
        segments: &SegmentRegistry,
        dispatcher: Option<&dyn ChunkDispatcher>,
    ) -> EngineResult<ImageStack> {
        resources.validate()?;
        validate_stages(self.kind, stages)?;

        let cores = resources.resolved_cores();
        let air_region_enabled = stages.iter().any(|s| s.enabled && s.name() == AIR_REGION_STAGE);
        let mut tracker = ProgressTracker::new(stages.len()).with_callback(self.progress.clone());
        tracker.start();
        info!(
            "Running {} with {} stages on {} cores",
            self.kind,
            stages.len(),
            cores
        );

        let mut side_values = SideValues::new();
        let mut missing_keys: HashSet<&str> = HashSet::new();

        for stage in stages {
            if !stage.enabled {
                debug!("Stage '{}' is disabled", stage.name());
                tracker.stage_skipped(stage.name(), SkipReason::Disabled);
                continue;
            }
            if stage.condition == StageCondition::ReferencesOrAirRegion
                && !stack.has_references()
                && !air_region_enabled
            {
                warn!(
                    "Skipping '{}': no flat/dark references and {} is not enabled",
                    stage.name(),
                    AIR_REGION_STAGE
                );
                missing_keys.extend(stage.produces.iter().map(String::as_str));
                tracker.stage_skipped(stage.name(), SkipReason::ConditionNotMet);
                continue;
            }
            if let Some(key) = stage.consumes.iter().find(|k| missing_keys.contains(k.as_str())) {
                warn!("Skipping '{}': '{}' was not computed", stage.name(), key);
                missing_keys.extend(stage.produces.iter().map(String::as_str));
                tracker.stage_skipped(stage.name(), SkipReason::ProducerSkipped);
                continue;
            }

            let started = Instant::now();
            let chunked = dispatcher.filter(|_| stage.parallel && cores > 1);
            let result = run_stage(
                &mut stack,
                stage,
                &mut side_values,
                resources,
                segments,
                chunked,
                &tracker,
            );
            if let Err(e) = result {
                tracker.report_error(Some(stage.name()), e.to_string());
                return Err(e);
            }
            let elapsed = started.elapsed().as_millis() as u64;
            info!("Stage '{}' finished in {} ms", stage.name(), elapsed);
            tracker.stage_completed(stage.name(), elapsed);
        }

        tracker.complete();
        Ok(stack)
    }
}

fn run_stage(
    stack: &mut ImageStack,
    stage: &PipelineStage,
    side_values: &mut SideValues,
    resources: &ResourceConfig,
    segments: &SegmentRegistry,
    dispatcher: Option<&dyn ChunkDispatcher>,
    tracker: &ProgressTracker,
) -> EngineResult<()> {
    let inputs = side_values.subset(&stage.consumes);
    let output = match dispatcher {
        Some(dispatcher) => {
            run_chunked(stack, stage, &inputs, resources, segments, dispatcher, tracker)?
        }
        None => {
            tracker.stage_started(stage.name(), 1);
            let (flat, dark) = if stage.uses_references {
                (stack.flat(), stack.dark())
            } else {
                (None, None)
            };
            apply_whole(stage, stack.sample(), flat, dark, &inputs)?
        }
    };
    check_output(stage, stack.sample(), &output)?;

    match output {
        StageOutput::Frames(volume) => {
            let references = if stage.applies_to_references {
                let flat = stack.flat().map(|v| apply_to_reference(stage, v)).transpose()?;
                let dark = stack.dark().map(|v| apply_to_reference(stage, v)).transpose()?;
                Some((flat, dark))
            } else {
                None
            };
            stack.replace_sample(volume);
            if let Some((flat, dark)) = references {
                stack.replace_references(flat, dark)?;
            }
        }
        StageOutput::Values(values) => {
            if let Some(key) = stage.produces.first() {
                debug!("Stage '{}' produced {} values for '{}'", stage.name(), values.len(), key);
                side_values.insert(key.clone(), values);
            }
        }
    }
    Ok(())
}

/// Run a stage on a whole volume in this process.
fn apply_whole(
    stage: &PipelineStage,
    sample: &Volume,
    flat: Option<&Volume>,
    dark: Option<&Volume>,
    side_values: &SideValues,
) -> EngineResult<StageOutput> {
    let range = ChunkRange::new(0, sample.frames());
    let chunk = StageChunk {
        sample: sample.view(),
        flat: flat.map(Volume::view),
        dark: dark.map(Volume::view),
        range,
    };
    let ctx = StageContext {
        params: &stage.params,
        side_values,
    };
    stage
        .transform
        .apply(&chunk, &ctx)
        .map_err(|e| transform_failure(stage, range, e.to_string()))
}

fn apply_to_reference(stage: &PipelineStage, reference: &Volume) -> EngineResult<Volume> {
    let output = apply_whole(stage, reference, None, None, &SideValues::new())?;
    check_output(stage, reference, &output)?;
    match output {
        StageOutput::Frames(volume) => Ok(volume),
        StageOutput::Values(_) => Err(transform_failure(
            stage,
            ChunkRange::new(0, reference.frames()),
            "returned values for a reference stack".to_string(),
        )),
    }
}

fn transform_failure(stage: &PipelineStage, chunk: ChunkRange, message: String) -> EngineError {
    WorkerFailure::Transform {
        stage: stage.name().to_string(),
        chunk,
        message,
    }
    .into()
}

/// Check that an output has the frame count and plane the stage promises.
fn check_output(stage: &PipelineStage, input: &Volume, output: &StageOutput) -> EngineResult<()> {
    let frames = input.frames();
    match output {
        StageOutput::Frames(volume) => {
            let (rows, cols) = stage
                .transform
                .output_plane(input.plane(), &stage.params)
                .map_err(|e| transform_failure(stage, ChunkRange::new(0, frames), e.to_string()))?;
            let expected = [frames, rows, cols];
            if volume.shape() != expected {
                return Err(PipelineError::OutputShapeMismatch {
                    stage: stage.name().to_string(),
                    expected,
                    got: volume.shape(),
                }
                .into());
            }
        }
        StageOutput::Values(values) => {
            if values.len() != frames {
                return Err(PipelineError::FrameCountChanged {
                    stage: stage.name().to_string(),
                    expected: frames,
                    got: values.len(),
                }
                .into());
            }
        }
    }
    Ok(())
}

fn copy_in(segments: &SegmentRegistry, volume: &Volume) -> EngineResult<SharedArray> {
    let mut array = segments.create_array(volume.shape(), volume.dtype())?;
    array.store(&volume.view())?;
    Ok(array)
}

/// Split a stage into chunks and run them through `dispatcher`.
///
/// Every segment created here is owned by this process and released before
/// returning, on success and on failure alike.
fn run_chunked(
    stack: &ImageStack,
    stage: &PipelineStage,
    side_values: &SideValues,
    resources: &ResourceConfig,
    segments: &SegmentRegistry,
    dispatcher: &dyn ChunkDispatcher,
    tracker: &ProgressTracker,
) -> EngineResult<StageOutput> {
    let shape = stack.shape();
    let dtype = stack.dtype();
    let plan = match resources.chunksize {
        Some(size) => SplitPlan::with_step(shape[0] as u64, size as u64),
        None => plan_split(
            &shape,
            0,
            dtype.width(),
            resources.memory_budget(),
            resources.max_ratio,
            stage.produces_frames(),
        )?,
    };
    let chunks: Vec<ChunkRange> = plan.chunks().collect();
    tracker.stage_started(stage.name(), chunks.len());
    info!(
        "Dispatching '{}' as {} chunks to {} workers",
        stage.name(),
        chunks.len(),
        dispatcher.workers()
    );

    let sample = copy_in(segments, stack.sample())?;
    let (flat, dark) = if stage.uses_references {
        (
            stack.flat().map(|v| copy_in(segments, v)).transpose()?,
            stack.dark().map(|v| copy_in(segments, v)).transpose()?,
        )
    } else {
        (None, None)
    };
    let output = if stage.produces_frames() {
        let (rows, cols) = stage
            .transform
            .output_plane(stack.sample().plane(), &stage.params)
            .map_err(|e| transform_failure(stage, ChunkRange::new(0, shape[0]), e.to_string()))?;
        Some(segments.create_array([shape[0], rows, cols], dtype)?)
    } else {
        None
    };

    let tasks: Vec<ChunkTask> = chunks
        .iter()
        .map(|&chunk| ChunkTask {
            stage: stage.name().to_string(),
            params: stage.params.clone(),
            side_values: side_values.clone(),
            chunk,
            sample: sample.segment().clone(),
            flat: flat.as_ref().map(|a| a.segment().clone()),
            dark: dark.as_ref().map(|a| a.segment().clone()),
            output: output.as_ref().map(|a| a.segment().clone()),
        })
        .collect();

    let mut outcomes = dispatcher.dispatch(tasks)?;
    for outcome in &outcomes {
        tracker.chunk_completed(stage.name(), outcome.chunk);
    }
    outcomes.sort_by_key(|o| o.chunk.start);

    let result = match output {
        Some(array) => {
            let volume = array.to_volume()?;
            array.free()?;
            StageOutput::Frames(volume)
        }
        None => StageOutput::Values(
            outcomes
                .into_iter()
                .flat_map(|o| o.values.unwrap_or_default())
                .collect(),
        ),
    };

    sample.free()?;
    for reference in [flat, dark].into_iter().flatten() {
        reference.free()?;
    }
    Ok(result)
}

/// Owns a stage registry, the shared-memory registry and at most one
/// worker pool.
pub struct Engine {
    registry: Arc<StageRegistry>,
    segments: SegmentRegistry,
    worker_command: Option<WorkerCommand>,
    pool: Option<WorkerPool>,
    progress: Option<ProgressCallback>,
}

impl Engine {
    /// Create an engine using POSIX shared memory and the running binary as
    /// the worker program.
    pub fn new(registry: StageRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
            segments: SegmentRegistry::new(),
            worker_command: None,
            pool: None,
            progress: None,
        }
    }

    /// Use a different segment registry.
    pub fn with_segments(mut self, segments: SegmentRegistry) -> Self {
        self.segments = segments;
        self
    }

    /// Launch workers with `command` instead of the running binary.
    pub fn with_worker_command(mut self, command: WorkerCommand) -> Self {
        self.worker_command = Some(command);
        self
    }

    /// Set a callback for progress updates.
    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    /// The stage registry.
    pub fn registry(&self) -> &Arc<StageRegistry> {
        &self.registry
    }

    /// The shared-memory registry.
    pub fn segments(&self) -> &SegmentRegistry {
        &self.segments
    }

    /// The running pool, if any.
    pub fn pool(&self) -> Option<&WorkerPool> {
        self.pool.as_ref().filter(|p| p.is_running())
    }

    /// Start a pool of `requested` workers (0 = one per core).
    ///
    /// A running pool of the same size is reused. A running pool of a
    /// different size is an error; stop it first.
    pub fn start_pool(&mut self, requested: usize) -> EngineResult<&WorkerPool> {
        let size = resolve_cores(requested);
        match self.pool().map(WorkerPool::size) {
            Some(running) if running == size => {
                debug!("Reusing worker pool of {} processes", running);
            }
            Some(running) => {
                return Err(EngineError::PoolAlreadyRunning {
                    running,
                    requested: size,
                })
            }
            None => {
                let command = match &self.worker_command {
                    Some(command) => command.clone(),
                    None => WorkerCommand::current_exe()?,
                };
                let pool = WorkerPool::start(
                    size,
                    &command,
                    self.segments.store().location(),
                    &self.registry.names(),
                )?;
                self.pool = Some(pool);
            }
        }
        self.pool
            .as_ref()
            .ok_or_else(|| WorkerFailure::PoolStopped.into())
    }

    /// Stop the pool if one is running.
    pub fn stop_pool(&mut self) -> EngineResult<()> {
        if let Some(mut pool) = self.pool.take() {
            pool.stop()?;
        }
        Ok(())
    }

    /// Run a pipeline, starting the pool first if any enabled stage will be
    /// dispatched.
    ///
    /// A worker crash or protocol violation terminates the pool; the next
    /// run starts a fresh one.
    pub fn run(
        &mut self,
        stack: ImageStack,
        kind: PipelineKind,
        stages: &[PipelineStage],
        resources: &ResourceConfig,
    ) -> EngineResult<ImageStack> {
        resources.validate()?;
        let cores = resources.resolved_cores();
        let wants_pool = cores > 1 && stages.iter().any(|s| s.enabled && s.parallel);
        if wants_pool {
            self.start_pool(cores)?;
        }

        let mut executor = PipelineExecutor::new(kind);
        executor.progress = self.progress.clone();
        let dispatcher = self
            .pool()
            .filter(|_| wants_pool)
            .map(|pool| pool as &dyn ChunkDispatcher);
        let result = executor.run(stack, stages, resources, &self.segments, dispatcher);

        if let Err(EngineError::Worker(
            WorkerFailure::Crashed { .. } | WorkerFailure::Protocol { .. },
        )) = &result
        {
            if let Some(mut pool) = self.pool.take() {
                warn!("Terminating worker pool after a worker failure");
                pool.terminate();
            }
        }
        result
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("stages", &self.registry.len())
            .field("segments", &self.segments)
            .field("pool", &self.pool)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::EngineConfig;
    use crate::core::error::ConfigurationError;
    use crate::core::types::Dtype;
    use crate::execution::pool::InProcessDispatcher;
    use crate::execution::progress::ProgressUpdate;
    use crate::execution::protocol::TaskOutcome;
    use crate::filters::stage::StageParams;
    use crate::shm::store::{DirectoryStore, SegmentStore};
    use serde_json::json;

    fn stage(registry: &StageRegistry, name: &str, params: StageParams) -> PipelineStage {
        PipelineStage::new(registry.get(name).unwrap()).with_params(params)
    }

    fn sample_stack() -> ImageStack {
        let sample = Volume::from_fn(Dtype::Float32, [10, 6, 8], |z, y, x| {
            1.0 + ((z * 7 + y * 3 + x * 5) % 11) as f64 * 0.25
        });
        let flat = Volume::from_fn(Dtype::Float32, [2, 6, 8], |z, y, x| {
            4.0 + (z + y + x) as f64 * 0.1
        });
        let dark = Volume::from_fn(Dtype::Float32, [2, 6, 8], |_, y, _| 0.1 * y as f64);
        ImageStack::new(sample).with_references(flat, dark).unwrap()
    }

    fn pre_processing(registry: &StageRegistry) -> Vec<PipelineStage> {
        vec![
            stage(registry, "rotate", StageParams::new()),
            stage(
                registry,
                "compute_scale_factors",
                StageParams::new().with("roi", json!([0, 0, 3, 3])),
            ),
            stage(registry, "flat_dark_normalisation", StageParams::new()),
            stage(registry, "apply_scale_factors", StageParams::new()),
            stage(registry, "crop", StageParams::new().with("roi", json!([1, 1, 5, 7]))),
            stage(registry, "median_filter", StageParams::new().with("size", 3)),
            stage(registry, "gaussian_filter", StageParams::new().with("sigma", 0.8)),
            stage(registry, "minus_log", StageParams::new()),
        ]
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        store: Arc<dyn SegmentStore>,
        segments: SegmentRegistry,
        registry: Arc<StageRegistry>,
    }

    impl Fixture {
        fn dispatcher(&self, threads: usize) -> InProcessDispatcher {
            InProcessDispatcher::new(threads, self.registry.clone(), self.store.clone()).unwrap()
        }
    }

    fn single_core() -> ResourceConfig {
        ResourceConfig::new().with_cores(1)
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn SegmentStore> = Arc::new(DirectoryStore::new(dir.path()));
        Fixture {
            segments: SegmentRegistry::new().with_store(store.clone()),
            store,
            registry: Arc::new(StageRegistry::with_builtins()),
            _dir: dir,
        }
    }

    /// Returns outcomes in reverse chunk order.
    struct ReversingDispatcher(InProcessDispatcher);

    impl ChunkDispatcher for ReversingDispatcher {
        fn workers(&self) -> usize {
            self.0.workers()
        }

        fn dispatch(&self, tasks: Vec<ChunkTask>) -> EngineResult<Vec<TaskOutcome>> {
            let mut outcomes = self.0.dispatch(tasks)?;
            outcomes.sort_by_key(|o| std::cmp::Reverse(o.chunk.start));
            Ok(outcomes)
        }
    }

    #[test]
    fn test_chunked_run_matches_single_core() {
        let fx = fixture();
        let stages = pre_processing(&fx.registry);
        let executor = PipelineExecutor::new(PipelineKind::PreProcessing);

        let single = executor
            .run(sample_stack(), &stages, &single_core(), &fx.segments, None)
            .unwrap();

        let dispatcher = fx.dispatcher(4);
        let resources = ResourceConfig::new().with_cores(4).with_chunksize(3);
        let chunked = executor
            .run(sample_stack(), &stages, &resources, &fx.segments, Some(&dispatcher))
            .unwrap();

        assert_eq!(single.shape(), [10, 6, 4]);
        assert!(single.sample().bitwise_eq(chunked.sample()));
        assert_eq!(single.flat().map(Volume::shape), Some([2, 6, 4]));
        assert!(fx.store.list().unwrap().is_empty());
    }

    #[test]
    fn test_memory_planned_run_matches_single_core() {
        let fx = fixture();
        let stages = pre_processing(&fx.registry);
        let executor = PipelineExecutor::new(PipelineKind::PreProcessing);

        let single = executor
            .run(sample_stack(), &stages, &single_core(), &fx.segments, None)
            .unwrap();

        // 10 frames of 6x8 f32 is 1920 bytes; a 1000 byte budget forces a split.
        let resources = ResourceConfig::new().with_cores(3).with_max_memory(1000);
        let dispatcher = fx.dispatcher(3);
        let chunked = executor
            .run(sample_stack(), &stages, &resources, &fx.segments, Some(&dispatcher))
            .unwrap();
        assert!(single.sample().bitwise_eq(chunked.sample()));
    }

    #[test]
    fn test_zero_memory_budget_uses_available_memory() {
        let fx = fixture();
        let stages = vec![stage(&fx.registry, "median_filter", StageParams::new())];
        let executor = PipelineExecutor::new(PipelineKind::PreProcessing);
        let resources = EngineConfig::from_toml_str("[resources]\ncores = 2\nmax_memory = 0\n")
            .unwrap()
            .resources;

        let dispatcher = fx.dispatcher(2);
        let chunked = executor
            .run(sample_stack(), &stages, &resources, &fx.segments, Some(&dispatcher))
            .unwrap();
        let single = executor
            .run(sample_stack(), &stages, &single_core(), &fx.segments, None)
            .unwrap();
        assert!(single.sample().bitwise_eq(chunked.sample()));
    }

    #[test]
    fn test_out_of_order_outcomes_are_reassembled() {
        let fx = fixture();
        let stages = pre_processing(&fx.registry);
        let executor = PipelineExecutor::new(PipelineKind::PreProcessing);
        let resources = ResourceConfig::new().with_cores(2).with_chunksize(2);

        let in_order = fx.dispatcher(2);
        let expected = executor
            .run(sample_stack(), &stages, &resources, &fx.segments, Some(&in_order))
            .unwrap();

        let reversed = ReversingDispatcher(fx.dispatcher(2));
        let got = executor
            .run(sample_stack(), &stages, &resources, &fx.segments, Some(&reversed))
            .unwrap();
        assert!(expected.sample().bitwise_eq(got.sample()));
    }

    #[test]
    fn test_validation_runs_before_any_stage() {
        let fx = fixture();
        let executor = PipelineExecutor::new(PipelineKind::PreProcessing);
        let resources = ResourceConfig::new().with_cores(1);

        let out_of_order = vec![
            stage(&fx.registry, "minus_log", StageParams::new()),
            stage(&fx.registry, "crop", StageParams::new().with("roi", json!([0, 0, 2, 2]))),
        ];
        let err = executor
            .run(sample_stack(), &out_of_order, &resources, &fx.segments, None)
            .unwrap_err();
        assert!(matches!(err, EngineError::Pipeline(PipelineError::OutOfOrder { .. })));

        let orphan_consumer = vec![stage(&fx.registry, "apply_scale_factors", StageParams::new())];
        let err = executor
            .run(sample_stack(), &orphan_consumer, &resources, &fx.segments, None)
            .unwrap_err();
        assert!(matches!(err, EngineError::Pipeline(PipelineError::MissingSideValue { .. })));

        let wrong_kind = vec![stage(&fx.registry, "circular_mask", StageParams::new())];
        let err = executor
            .run(sample_stack(), &wrong_kind, &resources, &fx.segments, None)
            .unwrap_err();
        assert!(matches!(err, EngineError::Pipeline(PipelineError::UnknownStage { .. })));

        let bad_ratio = ResourceConfig::new().with_max_ratio(1.5);
        let err = executor
            .run(sample_stack(), &[], &bad_ratio, &fx.segments, None)
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Configuration(ConfigurationError::InvalidRatio(_))
        ));
    }

    #[test]
    fn test_scale_factors_skipped_without_references() {
        let fx = fixture();
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = seen.clone();
        let executor = PipelineExecutor::new(PipelineKind::PreProcessing)
            .with_progress(Arc::new(move |update| sink.lock().push(update)));

        let stages = vec![
            stage(&fx.registry, "compute_scale_factors", StageParams::new()),
            stage(&fx.registry, "apply_scale_factors", StageParams::new()),
            stage(&fx.registry, "median_filter", StageParams::new()),
        ];
        let sample = Volume::from_fn(Dtype::Float64, [3, 4, 4], |z, _, _| z as f64 + 2.0);
        let out = executor
            .run(ImageStack::new(sample.clone()), &stages, &single_core(), &fx.segments, None)
            .unwrap();

        // A constant frame is unchanged by the median and was never rescaled.
        assert!(out.sample().bitwise_eq(&sample));
        let seen = seen.lock();
        assert!(seen.contains(&ProgressUpdate::StageSkipped {
            name: "compute_scale_factors".to_string(),
            reason: SkipReason::ConditionNotMet,
        }));
        assert!(seen.contains(&ProgressUpdate::StageSkipped {
            name: "apply_scale_factors".to_string(),
            reason: SkipReason::ProducerSkipped,
        }));
    }

    #[test]
    fn test_scale_factors_run_with_air_region() {
        let fx = fixture();
        let stages = vec![
            stage(&fx.registry, "compute_scale_factors", StageParams::new()),
            stage(
                &fx.registry,
                "air_region_normalisation",
                StageParams::new().with("air", json!([0, 0, 2, 2])),
            ),
            stage(&fx.registry, "apply_scale_factors", StageParams::new()),
        ];
        let sample = Volume::from_fn(Dtype::Float64, [2, 2, 2], |z, _, _| [2.0, 4.0][z]);
        let out = PipelineExecutor::new(PipelineKind::PreProcessing)
            .run(ImageStack::new(sample), &stages, &single_core(), &fx.segments, None)
            .unwrap();
        // Air normalisation brings every frame to 1, then the mean factor (3) applies.
        assert!(out.sample().iter_f64().all(|v| v == 3.0));
    }

    #[test]
    fn test_transform_failure_names_stage() {
        let fx = fixture();
        let executor = PipelineExecutor::new(PipelineKind::PreProcessing);
        let stages = vec![stage(&fx.registry, "cut_off", StageParams::new())];
        let err = executor
            .run(sample_stack(), &stages, &single_core(), &fx.segments, None)
            .unwrap_err();
        match err {
            EngineError::Worker(failure) => assert_eq!(failure.stage(), Some("cut_off")),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_chunked_failure_releases_segments() {
        let fx = fixture();
        let executor = PipelineExecutor::new(PipelineKind::PreProcessing);
        let stages = vec![stage(&fx.registry, "median_filter", StageParams::new().with("size", 4))];
        let dispatcher = fx.dispatcher(2);
        let resources = ResourceConfig::new().with_cores(2).with_chunksize(4);

        let err = executor
            .run(sample_stack(), &stages, &resources, &fx.segments, Some(&dispatcher))
            .unwrap_err();
        assert_eq!(
            match &err {
                EngineError::Worker(failure) => failure.stage(),
                _ => None,
            },
            Some("median_filter")
        );
        assert!(fx.store.list().unwrap().is_empty());
    }

    #[test]
    fn test_engine_pool_reuse_and_size_conflict() {
        let fx = fixture();
        let script = concat!(
            r#"read line; echo '{"type":"ready","pid":1,"stages":[]}'; "#,
            r#"read line; echo '{"type":"goodbye"}'"#,
        );
        let command = WorkerCommand::new("/bin/sh").arg("-c").arg(script);
        let mut engine = Engine::new(StageRegistry::new())
            .with_segments(fx.segments)
            .with_worker_command(command);

        let pids = engine.start_pool(2).unwrap().pids();
        assert_eq!(engine.start_pool(2).unwrap().pids(), pids);
        let err = engine.start_pool(3).unwrap_err();
        assert!(matches!(
            err,
            EngineError::PoolAlreadyRunning {
                running: 2,
                requested: 3
            }
        ));
        engine.stop_pool().unwrap();
        assert!(engine.pool().is_none());
        engine.stop_pool().unwrap();
    }

    #[test]
    fn test_engine_single_core_needs_no_pool() {
        let fx = fixture();
        let stages = pre_processing(&fx.registry);
        let mut engine = Engine::new(StageRegistry::with_builtins())
            .with_segments(fx.segments)
            .with_worker_command(WorkerCommand::new("/nonexistent/worker"));
        let out = engine
            .run(sample_stack(), PipelineKind::PreProcessing, &stages, &single_core())
            .unwrap();
        assert_eq!(out.shape(), [10, 6, 4]);
        assert!(engine.pool().is_none());
    }
}
