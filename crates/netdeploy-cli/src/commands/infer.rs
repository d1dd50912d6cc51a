//! Infer command - run a batch of images through a deployed network.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Args;
use console::style;
use glob::glob;
use image::DynamicImage;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use tracing::{debug, info};

use netdeploy_core::config::BackendType;
use netdeploy_core::{
    create_wrapper, tensor_to_images, DeployConfig, Detection, Detector, ImagePreprocessor, Task,
    TensorMap,
};

const IMAGE_EXTENSIONS: [&str; 6] = ["png", "jpg", "jpeg", "bmp", "tif", "tiff"];

/// Arguments for the infer command.
#[derive(Args)]
pub struct InferArgs {
    /// Input images or glob patterns, run as one batch
    #[arg(required = true)]
    inputs: Vec<String>,

    /// ncnn param file (overrides the configured backend)
    #[arg(long, requires = "bin")]
    param: Option<PathBuf>,

    /// ncnn bin file
    #[arg(long, requires = "param")]
    bin: Option<PathBuf>,

    /// Outputs to fetch, comma separated
    #[arg(long, value_delimiter = ',')]
    output_names: Option<Vec<String>>,

    /// Run batch samples concurrently
    #[arg(long)]
    parallel: bool,

    /// Override the configured task
    #[arg(long, value_enum)]
    task: Option<TaskArg>,

    /// Output file (default: stdout)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Output format
    #[arg(short, long, value_enum, default_value = "json")]
    format: OutputFormat,

    /// Directory for super-resolution images
    #[arg(long)]
    save_dir: Option<PathBuf>,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
pub enum OutputFormat {
    /// JSON output
    Json,
    /// Plain text summary
    Text,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
pub enum TaskArg {
    Detection,
    SuperResolution,
    Raw,
}

impl From<TaskArg> for Task {
    fn from(task: TaskArg) -> Self {
        match task {
            TaskArg::Detection => Task::ObjectDetection,
            TaskArg::SuperResolution => Task::SuperResolution,
            TaskArg::Raw => Task::Raw,
        }
    }
}

#[derive(Debug, Serialize)]
struct Report {
    backend: String,
    task: Task,
    elapsed_ms: u64,
    images: Vec<ImageReport>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    outputs: Vec<OutputReport>,
}

#[derive(Debug, Serialize)]
struct ImageReport {
    path: PathBuf,
    width: u32,
    height: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    detections: Option<Vec<Detection>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    restored: Option<PathBuf>,
}

#[derive(Debug, Serialize)]
struct OutputReport {
    name: String,
    shape: Vec<usize>,
    values: Vec<f32>,
}

pub async fn run(args: InferArgs, config_path: Option<&str>) -> anyhow::Result<()> {
    let start = Instant::now();
    let mut config = super::config::load_config(config_path)?;
    apply_overrides(&mut config, &args);
    config.validate()?;

    let paths = expand_inputs(&args.inputs)?;
    info!("Running {} image(s) as one batch", paths.len());

    let images = paths
        .iter()
        .map(|p| image::open(p).with_context(|| format!("Failed to open {}", p.display())))
        .collect::<anyhow::Result<Vec<_>>>()?;

    if let Some(dir) = &args.save_dir {
        fs::create_dir_all(dir)?;
    }

    let pb = ProgressBar::new_spinner();
    pb.set_style(ProgressStyle::default_spinner().template("{spinner:.green} [{elapsed_precise}] {msg}")?);
    pb.set_message(format!("Running {} image(s)...", images.len()));
    pb.enable_steady_tick(Duration::from_millis(100));

    let save_dir = args.save_dir.clone();
    let result = tokio::task::spawn_blocking(move || execute(&config, &paths, &images, save_dir.as_deref()))
        .await?;
    pb.finish_and_clear();

    let mut report = result?;
    report.elapsed_ms = start.elapsed().as_millis() as u64;

    let output = match args.format {
        OutputFormat::Json => serde_json::to_string_pretty(&report)?,
        OutputFormat::Text => format_report(&report),
    };

    if let Some(output_path) = &args.output {
        fs::write(output_path, &output)?;
        eprintln!(
            "{} Output written to {}",
            style("✓").green(),
            output_path.display()
        );
    } else {
        println!("{}", output);
    }

    debug!("Total time: {:?}", start.elapsed());
    Ok(())
}

fn apply_overrides(config: &mut DeployConfig, args: &InferArgs) {
    if let (Some(param), Some(bin)) = (&args.param, &args.bin) {
        config.backend.kind = BackendType::Ncnn;
        config.backend.files = vec![param.clone(), bin.clone()];
    }
    if let Some(names) = &args.output_names {
        config.backend.output_names = Some(names.clone());
    }
    if args.parallel {
        config.backend.parallel = true;
    }
    if let Some(task) = args.task {
        config.codebase.task = task.into();
    }
}

/// Expand globs, keeping image files in argument order.
fn expand_inputs(patterns: &[String]) -> anyhow::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for pattern in patterns {
        let before = files.len();
        for entry in glob(pattern)? {
            let path = entry?;
            if is_image(&path) && !files.contains(&path) {
                files.push(path);
            }
        }
        if files.len() == before {
            anyhow::bail!("No matching images found for: {}", pattern);
        }
    }
    Ok(files)
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
}

fn execute(
    config: &DeployConfig,
    paths: &[PathBuf],
    images: &[DynamicImage],
    save_dir: Option<&Path>,
) -> anyhow::Result<Report> {
    let wrapper = create_wrapper(&config.backend)?;
    let backend = wrapper.backend().to_string();

    let mut image_reports: Vec<ImageReport> = paths
        .iter()
        .zip(images)
        .map(|(path, image)| ImageReport {
            path: path.clone(),
            width: image.width(),
            height: image.height(),
            detections: None,
            restored: None,
        })
        .collect();
    let mut outputs = Vec::new();

    match config.codebase.task {
        Task::ObjectDetection => {
            let detector = Detector::new(wrapper, config)?;
            for (report, dets) in image_reports.iter_mut().zip(detector.detect(images)?) {
                report.detections = Some(dets);
            }
        }
        Task::SuperResolution => {
            let results = forward_batch(wrapper.as_ref(), config, images)?;
            let (name, tensor) = results
                .first()
                .ok_or_else(|| anyhow::anyhow!("network produced no outputs"))?;
            debug!("Decoding output '{}' of shape {:?}", name, tensor.shape());

            for (report, restored) in image_reports.iter_mut().zip(tensor_to_images(tensor)?) {
                if let Some(dir) = save_dir {
                    let stem = report
                        .path
                        .file_stem()
                        .and_then(|s| s.to_str())
                        .unwrap_or("image");
                    let out_path = dir.join(format!("{}_sr.png", stem));
                    restored.save(&out_path)?;
                    report.restored = Some(out_path);
                }
            }
        }
        Task::Raw => {
            let results = forward_batch(wrapper.as_ref(), config, images)?;
            outputs = results
                .iter()
                .map(|(name, tensor)| OutputReport {
                    name: name.to_string(),
                    shape: tensor.shape().to_vec(),
                    values: tensor.to_f32().iter().cloned().collect(),
                })
                .collect();
        }
    }

    Ok(Report {
        backend,
        task: config.codebase.task,
        elapsed_ms: 0,
        images: image_reports,
        outputs,
    })
}

fn forward_batch(
    wrapper: &dyn netdeploy_core::BackendWrapper,
    config: &DeployConfig,
    images: &[DynamicImage],
) -> anyhow::Result<TensorMap> {
    let batch = ImagePreprocessor::new(&config.input).batch(images)?;
    let mut inputs = TensorMap::with_capacity(1);
    inputs.insert(config.codebase.input_name.clone(), batch);
    Ok(wrapper.forward(&inputs)?)
}

fn format_report(report: &Report) -> String {
    let mut lines = vec![format!(
        "Backend: {}  Task: {:?}  Time: {}ms",
        report.backend, report.task, report.elapsed_ms
    )];

    for image in &report.images {
        lines.push(format!(
            "{} ({}x{})",
            image.path.display(),
            image.width,
            image.height
        ));
        if let Some(dets) = &image.detections {
            if dets.is_empty() {
                lines.push("  no detections".to_string());
            }
            for d in dets {
                lines.push(format!(
                    "  label {:>3}  score {:.3}  [{:.1}, {:.1}, {:.1}, {:.1}]",
                    d.label, d.score, d.bbox[0], d.bbox[1], d.bbox[2], d.bbox[3]
                ));
            }
        }
        if let Some(path) = &image.restored {
            lines.push(format!("  restored -> {}", path.display()));
        }
    }

    for output in &report.outputs {
        lines.push(format!("{}: shape {:?}", output.name, output.shape));
    }

    lines.join("\n")
}
