//! Tomoflow CLI
//!
//! Plans chunk splits, lists stages, sweeps orphaned shared memory and runs
//! configured pipelines over a synthetic stack. The hidden `worker` command
//! is what the worker pool launches.

use anyhow::{anyhow, bail, Context, Result};
use std::sync::Arc;
use tomoflow::core::memory::{element_width, footprint_bytes, to_mb};
use tomoflow::execution::serve_stdio;
use tomoflow::prelude::*;

fn main() {
    let args: Vec<String> = std::env::args().collect();
    let program = args.first().map(String::as_str).unwrap_or("tomoflow");

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    if args.len() < 2 {
        print_usage(program);
        return;
    }

    let result = match args[1].as_str() {
        "worker" => serve_stdio(StageRegistry::with_builtins).context("worker protocol failed"),
        "sweep" => sweep(&args[2..]),
        "plan" => plan(&args[2..]),
        "stages" => {
            list_stages();
            Ok(())
        }
        "run" => run(&args[2..]),
        "help" | "--help" | "-h" => {
            print_usage(program);
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {}", other);
            print_usage(program);
            std::process::exit(2);
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn print_usage(program: &str) {
    println!("tomoflow v{}", tomoflow::VERSION);
    println!();
    println!("Usage: {} <command> [options]", program);
    println!();
    println!("Commands:");
    println!("  stages                          List the built-in stages");
    println!("  plan <frames> <rows> <cols>     Plan a chunk split for a stack");
    println!("  sweep [--dry-run]               Free shared memory left by dead processes");
    println!("  run --config <file>             Run a configured pipeline on a synthetic stack");
    println!("  help                            Show this help message");
    println!();
    println!("Plan options:");
    println!("  --dtype <kind>        Element kind, e.g. float32 (default: float32)");
    println!("  --max-memory <MB>     Memory budget (default: available memory)");
    println!("  --ratio <r>           Fraction of the budget per chunk (default: 1.0)");
    println!("  --reconstruction      Account for an output as large as the input");
    println!();
    println!("Run options:");
    println!("  --frames <n> --rows <n> --cols <n>   Synthetic stack shape (default: 64 128 128)");
    println!("  --cores <n>                          Override the configured core count");
    println!("  --post                               Also run the post-processing chain");
}

/// Pull `--name value` out of an argument list.
fn option<'a>(args: &'a [String], name: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == name)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

fn parsed<T: std::str::FromStr>(args: &[String], name: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    option(args, name)
        .map(|v| v.parse::<T>().map_err(|e| anyhow!("invalid value for {}: {}", name, e)))
        .transpose()
}

fn flag(args: &[String], name: &str) -> bool {
    args.iter().any(|a| a == name)
}

fn list_stages() {
    let registry = StageRegistry::with_builtins();
    println!("Available stages ({} total):", registry.len());
    println!();

    for (category, stages) in registry.grouped_by_category() {
        println!("  {}", category.display_name());
        for descriptor in stages {
            let mode = if descriptor.parallel { "parallel" } else { "serial" };
            println!("      {:<26} [{}] {}", descriptor.name, mode, descriptor.description);
        }
        println!();
    }

    for kind in [PipelineKind::PreProcessing, PipelineKind::PostProcessing] {
        println!("  {} order: {}", kind, kind.order().join(" -> "));
    }
}

fn plan(args: &[String]) -> Result<()> {
    let dims: Vec<usize> = args
        .iter()
        .take_while(|a| !a.starts_with("--"))
        .map(|a| a.parse::<usize>().with_context(|| format!("invalid dimension '{}'", a)))
        .collect::<Result<_>>()?;
    let &[frames, rows, cols] = dims.as_slice() else {
        bail!("plan needs exactly three dimensions: <frames> <rows> <cols>");
    };
    let shape = [frames, rows, cols];

    let width = element_width(option(args, "--dtype").unwrap_or("float32"));
    let mut resources = ResourceConfig::new();
    if let Some(mb) = parsed::<u64>(args, "--max-memory")? {
        resources = resources.with_max_memory_mb(mb);
    }
    if let Some(ratio) = parsed::<f64>(args, "--ratio")? {
        resources = resources.with_max_ratio(ratio);
    }
    resources.validate()?;

    let budget = resources.memory_budget();
    let plan = plan_split(
        &shape,
        0,
        width,
        budget,
        resources.max_ratio,
        flag(args, "--reconstruction"),
    )?;

    println!("Budget:      {:.1} MB", to_mb(budget));
    println!("Frame size:  {:.3} MB", to_mb(footprint_bytes(&shape, 0, width)));
    println!("Step:        {}", plan.step);
    println!("Chunks:      {}", plan.chunk_count());
    for chunk in plan.chunks() {
        println!("  {}", chunk);
    }
    Ok(())
}

fn sweep(args: &[String]) -> Result<()> {
    let segments = SegmentRegistry::new();
    if flag(args, "--dry-run") {
        let orphans = segments.find_orphans()?;
        println!("{} orphaned segments", orphans.len());
        for name in orphans {
            println!("  {}", name);
        }
    } else {
        let freed = segments.sweep_orphans()?;
        println!("Freed {} orphaned segments", freed.len());
        for name in freed {
            println!("  {}", name);
        }
    }
    Ok(())
}

/// Deterministic stand-in for loaded projections.
fn synthetic_stack(frames: usize, rows: usize, cols: usize) -> Result<ImageStack> {
    let sample = Volume::from_fn(Dtype::Float32, [frames, rows, cols], |z, y, x| {
        let ripple = ((x as f64 * 0.37 + z as f64 * 0.11).sin() + 1.0) * 0.5;
        0.2 + 0.6 * ripple * (1.0 - y as f64 / rows.max(1) as f64 * 0.5)
    });
    let flat = Volume::from_fn(Dtype::Float32, [4, rows, cols], |z, _, _| 0.95 + z as f64 * 0.01);
    let dark = Volume::from_fn(Dtype::Float32, [4, rows, cols], |_, _, _| 0.05);
    Ok(ImageStack::new(sample).with_references(flat, dark)?)
}

fn run(args: &[String]) -> Result<()> {
    let path = option(args, "--config").ok_or_else(|| anyhow!("run needs --config <file>"))?;
    let config = EngineConfig::from_file(path)?;
    let registry = StageRegistry::with_builtins();

    let mut resources = config.resources.clone();
    if let Some(cores) = parsed::<usize>(args, "--cores")? {
        resources = resources.with_cores(cores);
    }
    let frames = parsed(args, "--frames")?.unwrap_or(64);
    let rows = parsed(args, "--rows")?.unwrap_or(128);
    let cols = parsed(args, "--cols")?.unwrap_or(128);

    let mut kinds = vec![PipelineKind::PreProcessing];
    if flag(args, "--post") {
        kinds.push(PipelineKind::PostProcessing);
    }

    let pipelines = kinds
        .iter()
        .map(|&kind| Ok((kind, config.build_stages(kind, &registry)?)))
        .collect::<Result<Vec<_>>>()?;

    let progress: ProgressCallback = Arc::new(|update| match update {
        ProgressUpdate::StageStarted { name, chunks, .. } => {
            println!("  running {} ({} chunks)", name, chunks)
        }
        ProgressUpdate::StageSkipped { name, reason } => {
            println!("  skipped {} ({:?})", name, reason)
        }
        ProgressUpdate::Completed {
            total_duration_ms,
            stages_run,
            ..
        } => println!("  done in {} ms ({} stages)", total_duration_ms, stages_run),
        _ => {}
    });
    let mut engine = Engine::new(registry).with_progress(progress);

    let mut stack = synthetic_stack(frames, rows, cols)?;
    for (kind, stages) in &pipelines {
        println!("{}:", kind);
        stack = engine.run(stack, *kind, stages, &resources)?;
    }
    engine.stop_pool()?;

    let checksum: f64 = stack.sample().iter_f64().sum();
    println!("Shape:    {:?}", stack.shape());
    println!("Checksum: {:.6}", checksum);
    Ok(())
}
