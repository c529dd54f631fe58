use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use regex::Regex;
use retrocam_core::{
    output_format_label, parse_effect_chain, resample_filter_label, resolve_pipeline_config, vintage_chain, CoreError, OutputFormat, PipelineConfig,
    PipelineSettings, DEFAULT_MAX_DECODED_PIXELS,
};
use retrocam_image::{estimate_rgba_bytes, plan_resize, ImageSize, ResizeRequest, DEFAULT_MAX_DIMENSION, DEFAULT_TARGET_PIXELS};
use retrocam_runtime::{CancellationToken, Pipeline};
use retrocam_telemetry::sink_from_env;
use walkdir::WalkDir;

#[derive(Parser, Debug)]
#[command(name = "retrocam", version, about = "Resize photos to a pixel budget and give them an early phone camera look")]
struct Cli {
    #[command(subcommand)]
    command: TopLevelCommand,
}

#[derive(Subcommand, Debug)]
enum TopLevelCommand {
    /// Resize, filter and encode one or more images.
    Process(ProcessArgs),
    /// Print the output dimensions for a source size without touching pixels.
    Plan(PlanArgs),
    /// Print the default effect chain as JSON (the format --chain accepts).
    Chain,
}

#[derive(Args, Debug)]
struct ProcessArgs {
    /// File, directory, or a regex matched against file names under --input-root.
    #[arg(long, short = 'i')]
    input: String,
    /// Root directory for regex input matching (defaults to current directory).
    #[arg(long, short = 'r')]
    input_root: Option<PathBuf>,
    /// Recurse when scanning directories / regex matches.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    recursive: bool,
    /// If set, abort the whole run on the first input error.
    #[arg(long, default_value_t = false, action = clap::ArgAction::SetTrue)]
    strict: bool,
    #[arg(long, short = 'o')]
    output: Option<PathBuf>,
    /// Output directory used when processing multiple inputs.
    #[arg(long)]
    output_dir: Option<PathBuf>,
    #[arg(long, short = 'p', default_value_t = DEFAULT_TARGET_PIXELS)]
    target_pixels: u64,
    #[arg(long, default_value_t = DEFAULT_MAX_DIMENSION)]
    max_dimension: u32,
    #[arg(long, short = 'f', default_value = "jpeg")]
    format: String,
    #[arg(long, short = 'q', default_value_t = 100)]
    quality: u8,
    #[arg(long, default_value = "bilinear")]
    filter: String,
    /// Noise seed; derived from the output size when omitted.
    #[arg(long)]
    seed: Option<u64>,
    /// JSON file with an effect chain replacing the default one.
    #[arg(long, conflicts_with = "no_effects")]
    chain: Option<PathBuf>,
    #[arg(long, default_value_t = false, action = clap::ArgAction::SetTrue)]
    no_effects: bool,
    /// Per-stage timeout in milliseconds.
    #[arg(long)]
    timeout_ms: Option<u64>,
    #[arg(long, default_value_t = DEFAULT_MAX_DECODED_PIXELS)]
    max_decoded_pixels: u64,
    #[arg(long, default_value_t = false, action = clap::ArgAction::SetTrue)]
    profile: bool,
}

#[derive(Args, Debug)]
struct PlanArgs {
    #[arg(long)]
    width: u32,
    #[arg(long)]
    height: u32,
    #[arg(long, short = 'p', default_value_t = DEFAULT_TARGET_PIXELS)]
    target_pixels: u64,
    #[arg(long, default_value_t = DEFAULT_MAX_DIMENSION)]
    max_dimension: u32,
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("error resizing or processing image: {:#}", err);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        TopLevelCommand::Process(args) => {
            let runtime = tokio::runtime::Runtime::new().context("starting async runtime")?;
            runtime.block_on(process(args))
        }
        TopLevelCommand::Plan(args) => {
            let request = ResizeRequest {
                target_pixels: args.target_pixels,
                max_dimension: args.max_dimension,
            };
            let plan = plan_resize(ImageSize::new(args.width, args.height), &request)?;
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "source": plan.source,
                    "target": plan.target,
                    "scaleFactor": plan.scale_factor,
                    "clamped": plan.clamped,
                    "pixels": plan.target.pixels(),
                    "pixelError": plan.pixel_error(args.target_pixels),
                    "upscale": plan.is_upscale(),
                    "rgbaBytes": estimate_rgba_bytes(plan.target),
                }))?
            );
            Ok(())
        }
        TopLevelCommand::Chain => {
            println!("{}", serde_json::to_string_pretty(&vintage_chain())?);
            Ok(())
        }
    }
}

async fn process(args: ProcessArgs) -> Result<()> {
    let total_start = Instant::now();
    let inputs = resolve_inputs(&args)?;
    if inputs.is_empty() {
        return Err(anyhow!("no input images matched"));
    }
    let settings = build_settings(&args)?;

    let mut pipeline = Pipeline::default();
    if let Some(sink) = sink_from_env() {
        pipeline = pipeline.with_telemetry(Arc::from(sink));
    }

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("interrupt received, cancelling");
            interrupt.cancel();
        }
    });

    let bulk_mode = inputs.len() > 1;
    let outputs = assign_outputs(&args, &inputs, settings.format)?;
    let mut results = Vec::with_capacity(inputs.len());
    let mut total_pipeline_ms: u128 = 0;
    let mut total_write_ms: u128 = 0;

    for (input_path, output_path) in inputs.into_iter().zip(outputs) {

        let pipeline_start = Instant::now();
        let output = match pipeline.run_file(&input_path, settings.clone(), &cancel).await {
            Ok(output) => output,
            Err(CoreError::Cancelled) => return Err(CoreError::Cancelled.into()),
            Err(err) => {
                if bulk_mode && !args.strict {
                    log::warn!("skipping {}: {}", input_path.display(), err);
                    results.push(serde_json::json!({
                        "input": input_path,
                        "error": err.as_error_info(),
                    }));
                    continue;
                }
                return Err(anyhow!("failed to process {}: {}", input_path.display(), err));
            }
        };
        let pipeline_done = Instant::now();
        total_pipeline_ms += pipeline_done.duration_since(pipeline_start).as_millis();

        write_output(&output_path, &output.blob.bytes)?;
        let write_done = Instant::now();
        total_write_ms += write_done.duration_since(pipeline_done).as_millis();

        let timings = if args.profile {
            Some(serde_json::json!({
                "pipeline": pipeline_done.duration_since(pipeline_start).as_millis(),
                "writeOutput": write_done.duration_since(pipeline_done).as_millis(),
            }))
        } else {
            None
        };

        results.push(serde_json::json!({
            "input": input_path,
            "output": output_path,
            "sourceFormat": output.source_format,
            "sourceWidth": output.plan.source.width,
            "sourceHeight": output.plan.source.height,
            "width": output.blob.width,
            "height": output.blob.height,
            "scaleFactor": output.plan.scale_factor,
            "clamped": output.plan.clamped,
            "format": output_format_label(output.blob.format),
            "filter": resample_filter_label(settings.filter),
            "quality": output.blob.quality,
            "bytes": output.blob.bytes.len(),
            "seed": output.seed,
            "timingsMs": timings,
        }));
    }

    let timings = if args.profile {
        Some(serde_json::json!({
            "files": results.len(),
            "pipeline": total_pipeline_ms,
            "writeOutputs": total_write_ms,
            "total": total_start.elapsed().as_millis(),
        }))
    } else {
        None
    };

    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "results": results,
            "timingsMs": timings,
        }))?
    );
    Ok(())
}

fn build_settings(args: &ProcessArgs) -> Result<PipelineSettings> {
    let config = resolve_pipeline_config(PipelineConfig {
        target_pixels: args.target_pixels,
        max_dimension: args.max_dimension,
        output_format: args.format.clone(),
        quality: args.quality,
        resample_filter: args.filter.clone(),
        seed: args.seed,
        stage_timeout_ms: args.timeout_ms,
        max_decoded_pixels: args.max_decoded_pixels,
    });
    let mut settings = config.into_settings()?;
    if args.no_effects {
        settings.chain.clear();
    } else if let Some(path) = &args.chain {
        let json = std::fs::read_to_string(path).with_context(|| format!("reading effect chain {}", path.display()))?;
        settings.chain = parse_effect_chain(&json)?;
    }
    Ok(settings)
}

fn resolve_inputs(args: &ProcessArgs) -> Result<Vec<PathBuf>> {
    let candidate = PathBuf::from(&args.input);
    if candidate.exists() {
        if candidate.is_dir() {
            return collect_images_in_dir(&candidate, args.recursive);
        }
        return Ok(vec![candidate]);
    }
    let root = match &args.input_root {
        Some(root) => root.clone(),
        None => std::env::current_dir().context("resolving current directory")?,
    };
    let re = Regex::new(&args.input).map_err(|e| anyhow!("invalid regex: {}", e))?;
    collect_images_by_regex(&root, args.recursive, &re)
}

fn collect_images_in_dir(dir: &Path, recursive: bool) -> Result<Vec<PathBuf>> {
    collect_images(dir, recursive, |_| true)
}

fn collect_images_by_regex(root: &Path, recursive: bool, re: &Regex) -> Result<Vec<PathBuf>> {
    collect_images(root, recursive, |path| {
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        re.is_match(name)
    })
}

fn collect_images(root: &Path, recursive: bool, keep: impl Fn(&Path) -> bool) -> Result<Vec<PathBuf>> {
    let walker = if recursive {
        WalkDir::new(root)
    } else {
        WalkDir::new(root).max_depth(1)
    };
    let mut out: Vec<PathBuf> = walker
        .into_iter()
        .filter_map(std::result::Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| is_supported_image(path) && !is_own_output(path) && keep(path))
        .collect();
    out.sort();
    Ok(out)
}

fn is_supported_image(path: &Path) -> bool {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    matches!(ext.as_str(), "png" | "jpg" | "jpeg")
}

fn is_own_output(path: &Path) -> bool {
    path.file_stem()
        .and_then(|s| s.to_str())
        .map(|s| s.ends_with(OUTPUT_SUFFIX))
        .unwrap_or(false)
}

const OUTPUT_SUFFIX: &str = "_retro";

/// Resolves one output per input. Default names that collide (`a.jpg` and
/// `a.png`, or the same stem from two directories under `--output-dir`) get a
/// numbered stem such as `a-2_retro.jpg`.
fn assign_outputs(args: &ProcessArgs, inputs: &[PathBuf], format: OutputFormat) -> Result<Vec<PathBuf>> {
    let multi_input = inputs.len() > 1 || Path::new(&args.input).is_dir();
    let mut taken = HashSet::with_capacity(inputs.len());
    let mut outputs = Vec::with_capacity(inputs.len());
    for input in inputs {
        let first = resolve_output_for_input(args, input, format, multi_input)?;
        let mut candidate = first.clone();
        let mut n = 2;
        while !taken.insert(candidate.clone()) {
            candidate = first.with_file_name(numbered_output_filename(input, format, n)?);
            n += 1;
        }
        if candidate != first {
            log::warn!("{} would overwrite {}, writing {} instead", input.display(), first.display(), candidate.display());
        }
        outputs.push(candidate);
    }
    Ok(outputs)
}

fn resolve_output_for_input(args: &ProcessArgs, input_path: &Path, format: OutputFormat, multi_input: bool) -> Result<PathBuf> {
    if multi_input {
        // -o doubles as the output directory in bulk mode.
        let dir = args.output_dir.clone().or_else(|| args.output.clone());
        return match dir {
            Some(dir) => Ok(dir.join(default_output_filename(input_path, format)?)),
            None => default_output_path(input_path, format),
        };
    }

    match &args.output {
        Some(path) => {
            validate_output_extension(path, format)?;
            Ok(path.clone())
        }
        None => match &args.output_dir {
            Some(dir) => Ok(dir.join(default_output_filename(input_path, format)?)),
            None => default_output_path(input_path, format),
        },
    }
}

fn default_output_filename(input: &Path, format: OutputFormat) -> Result<String> {
    Ok(format!("{}{}.{}", input_stem(input)?, OUTPUT_SUFFIX, format.extension()))
}

fn numbered_output_filename(input: &Path, format: OutputFormat, n: usize) -> Result<String> {
    Ok(format!("{}-{}{}.{}", input_stem(input)?, n, OUTPUT_SUFFIX, format.extension()))
}

fn input_stem(input: &Path) -> Result<String> {
    Ok(input
        .file_stem()
        .ok_or_else(|| anyhow!("input file must include a valid file name"))?
        .to_string_lossy()
        .into_owned())
}

fn default_output_path(input: &Path, format: OutputFormat) -> Result<PathBuf> {
    let filename = default_output_filename(input, format)?;
    Ok(match input.parent() {
        Some(parent) => parent.join(filename),
        None => PathBuf::from(filename),
    })
}

fn validate_output_extension(path: &Path, format: OutputFormat) -> Result<()> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    let accepted = match format {
        OutputFormat::Jpeg => matches!(ext.as_str(), "jpg" | "jpeg"),
        OutputFormat::Png => ext == "png",
    };
    if !accepted {
        return Err(anyhow!(
            "output must be a .{} file for format {} (received: '{}')",
            format.extension(),
            output_format_label(format),
            path.display()
        ));
    }
    Ok(())
}

/// Writes through a sibling temp file so a failed write never leaves a
/// truncated image behind.
fn write_output(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }
    let mut staging = path.as_os_str().to_owned();
    staging.push(".partial");
    let staging = PathBuf::from(staging);
    std::fs::write(&staging, bytes).with_context(|| format!("writing {}", staging.display()))?;
    std::fs::rename(&staging, path).with_context(|| format!("moving output into place at {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_process(argv: &[&str]) -> ProcessArgs {
        let cli = Cli::try_parse_from(std::iter::once("retrocam").chain(argv.iter().copied())).expect("args should parse");
        match cli.command {
            TopLevelCommand::Process(args) => args,
            other => panic!("unexpected command {:?}", other),
        }
    }

    fn args_for(input: &str) -> ProcessArgs {
        parse_process(&["process", "-i", input])
    }

    #[test]
    fn defaults_match_the_vintage_pipeline() {
        let args = args_for("photo.jpg");
        let settings = build_settings(&args).expect("settings should build");
        assert_eq!(settings.resize.target_pixels, 3_000_000);
        assert_eq!(settings.format, OutputFormat::Jpeg);
        assert_eq!(settings.quality, 100);
        assert_eq!(settings.chain, vintage_chain());
    }

    #[test]
    fn no_effects_clears_chain() {
        let args = parse_process(&["process", "-i", "a.png", "--no-effects"]);
        assert!(build_settings(&args).expect("settings should build").chain.is_empty());
    }

    #[test]
    fn chain_file_replaces_default_chain() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let chain_path = dir.path().join("chain.json");
        std::fs::write(&chain_path, r#"[{"op":"noise","amount":0.25}]"#).expect("chain should be written");
        let chain_arg = chain_path.to_string_lossy().to_string();
        let args = parse_process(&["process", "-i", "a.png", "--chain", chain_arg.as_str()]);
        let settings = build_settings(&args).expect("settings should build");
        assert_eq!(settings.chain, vec![retrocam_core::EffectOp::Noise { amount: 0.25 }]);
    }

    #[test]
    fn single_input_defaults_next_to_source() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let input = dir.path().join("holiday.png");
        std::fs::write(&input, b"x").expect("fixture should be written");
        let args = args_for(&input.to_string_lossy());
        let out = resolve_output_for_input(&args, &input, OutputFormat::Jpeg, false).expect("output should resolve");
        assert_eq!(out, dir.path().join("holiday_retro.jpg"));
    }

    #[test]
    fn single_output_extension_must_match_format() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let input = dir.path().join("holiday.png");
        std::fs::write(&input, b"x").expect("fixture should be written");
        let input_arg = input.to_string_lossy().to_string();
        let args = parse_process(&["process", "-i", input_arg.as_str(), "-o", "out.png"]);
        assert!(resolve_output_for_input(&args, &input, OutputFormat::Jpeg, false).is_err());
        assert!(resolve_output_for_input(&args, &input, OutputFormat::Png, false).is_ok());
    }

    #[test]
    fn colliding_stems_get_distinct_outputs() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        std::fs::create_dir(dir.path().join("sub")).expect("subdir should be created");
        let inputs = vec![
            dir.path().join("a.jpg"),
            dir.path().join("a.png"),
            dir.path().join("sub").join("a.jpg"),
        ];
        for input in &inputs {
            std::fs::write(input, b"x").expect("fixture should be written");
        }
        let out_dir = dir.path().join("out");
        let out_arg = out_dir.to_string_lossy().to_string();
        let dir_arg = dir.path().to_string_lossy().to_string();
        let args = parse_process(&["process", "-i", dir_arg.as_str(), "--output-dir", out_arg.as_str()]);

        let outputs = assign_outputs(&args, &inputs, OutputFormat::Jpeg).expect("outputs should resolve");
        assert_eq!(
            outputs,
            vec![
                out_dir.join("a_retro.jpg"),
                out_dir.join("a-2_retro.jpg"),
                out_dir.join("a-3_retro.jpg"),
            ]
        );
        assert!(outputs.iter().all(|p| is_own_output(p)));
    }

    #[test]
    fn single_regex_match_honours_output_file() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let input = dir.path().join("x.jpg");
        std::fs::write(&input, b"x").expect("fixture should be written");
        let root_arg = dir.path().to_string_lossy().to_string();
        let out = dir.path().join("out.jpg");
        let out_arg = out.to_string_lossy().to_string();
        let args = parse_process(&["process", "-i", r"^x\.jpg$", "-r", root_arg.as_str(), "-o", out_arg.as_str()]);

        let inputs = resolve_inputs(&args).expect("regex should resolve");
        assert_eq!(inputs, vec![input]);
        let outputs = assign_outputs(&args, &inputs, OutputFormat::Jpeg).expect("outputs should resolve");
        assert_eq!(outputs, vec![out]);
    }

    #[test]
    fn directory_scan_skips_previous_outputs_and_other_files() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        for name in ["a.jpg", "b.PNG", "a_retro.jpg", "notes.txt"] {
            std::fs::write(dir.path().join(name), b"x").expect("fixture should be written");
        }
        let found = collect_images_in_dir(dir.path(), false).expect("scan should succeed");
        let names: Vec<_> = found
            .iter()
            .filter_map(|p| p.file_name().and_then(|n| n.to_str()).map(str::to_string))
            .collect();
        assert_eq!(names, vec!["a.jpg".to_string(), "b.PNG".to_string()]);
    }

    #[test]
    fn regex_input_matches_file_names() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        for name in ["img_001.jpg", "img_002.jpg", "cover.jpg"] {
            std::fs::write(dir.path().join(name), b"x").expect("fixture should be written");
        }
        let found = collect_images_by_regex(dir.path(), true, &Regex::new(r"^img_\d+").expect("regex should compile"))
            .expect("scan should succeed");
        assert_eq!(found.len(), 2);
    }

    #[test]
    fn write_output_leaves_no_staging_file() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let path = dir.path().join("nested").join("out.jpg");
        write_output(&path, &[1, 2, 3]).expect("write should succeed");
        assert_eq!(std::fs::read(&path).expect("output should exist"), vec![1, 2, 3]);
        assert!(!dir.path().join("nested").join("out.jpg.partial").exists());
    }
}
