use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use ett_pipeline::classifier::onnx::MODEL_PATH_ENV;
use ett_pipeline::pipeline::write_preview;
use ett_pipeline::tensor::InputScaling;
use ett_pipeline::{
    Classification, Geometry, ImageInput, InputKind, LazyClassifier, OnnxModelFactory, Pipeline,
};
use indicatif::{ProgressBar, ProgressStyle};
use snafu::Report;
use tracing::{error, info};
use walkdir::WalkDir;

/// Classify endotracheal tube placement in chest radiographs
#[derive(Debug, Parser)]
#[command(version)]
struct App {
    /// DICOM or raster image files (or directories with --recursive)
    #[arg(required = true)]
    inputs: Vec<PathBuf>,

    /// Path to the ONNX classifier
    #[arg(short = 'm', long = "model", env = MODEL_PATH_ENV)]
    model: Option<PathBuf>,

    /// Descend into directories
    #[arg(short = 'r', long = "recursive")]
    recursive: bool,

    /// Feed the classifier values in [0, 1] instead of [0, 255]
    #[arg(long = "unit-scale")]
    unit_scale: bool,

    /// Print one JSON object per input
    #[arg(long = "json")]
    json: bool,

    /// Write a JPEG rendering of each DICOM input into this directory
    #[arg(long = "preview-dir")]
    preview_dir: Option<PathBuf>,

    /// Verbose mode
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,
}

fn main() {
    let app = App::parse();

    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if app.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("error")
        }
    });
    let _ = tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .finish(),
    );

    if !run(app) {
        std::process::exit(1);
    }
}

/// Returns whether every input was classified.
fn run(app: App) -> bool {
    let (files, mut ok) = collect_files(&app.inputs, app.recursive);
    if files.is_empty() {
        error!("No input files found");
        return false;
    }

    let mut factory = match &app.model {
        Some(path) => OnnxModelFactory::new(path),
        None => OnnxModelFactory::default_location(),
    };
    if app.unit_scale {
        factory = factory.with_scaling(InputScaling::Unit);
    }
    info!("Using model {}", factory.path().display());

    let classifier = LazyClassifier::new(factory);
    let pipeline = Pipeline::new(Geometry::default(), &classifier);

    let progress = if files.len() > 1 && !app.verbose {
        let bar = ProgressBar::new(files.len() as u64);
        if let Ok(style) =
            ProgressStyle::default_bar().template("[{elapsed_precise}] {bar:40} {pos}/{len} {wide_msg}")
        {
            bar.set_style(style);
        }
        bar.enable_steady_tick(Duration::from_millis(480));
        Some(bar)
    } else {
        None
    };

    for file in &files {
        if let Some(bar) = &progress {
            bar.set_message(file.display().to_string());
        }

        let rendered = classify_file(&pipeline, file, app.preview_dir.as_deref())
            .map_err(|e| Report::from_error(e).to_string())
            .and_then(|result| {
                render(file, &result, app.json, app.verbose)
                    .map_err(|e| Report::from_error(e).to_string())
            });
        match rendered {
            Ok(line) => match &progress {
                Some(bar) => bar.println(line),
                None => println!("{}", line),
            },
            Err(report) => {
                ok = false;
                let msg = format!("{}: {}", file.display(), report);
                match &progress {
                    Some(bar) => bar.println(msg),
                    None => eprintln!("{}", msg),
                }
            }
        }

        if let Some(bar) = &progress {
            bar.inc(1);
        }
    }

    if let Some(bar) = progress {
        bar.finish_with_message("done");
    }
    ok
}

fn classify_file(
    pipeline: &Pipeline<'_>,
    path: &Path,
    preview_dir: Option<&Path>,
) -> ett_pipeline::Result<Classification> {
    let input = ImageInput::from_path(path)?;
    let normalized = pipeline.normalize(&input)?;

    if let Some(dir) = preview_dir {
        if normalized.kind == InputKind::Dicom {
            let stem = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "preview".to_string());
            write_preview(&normalized.image, &dir.join(format!("{}.jpg", stem)))?;
        }
    }

    pipeline.run_normalized(&input, normalized)
}

fn render(
    path: &Path,
    result: &Classification,
    json: bool,
    verbose: bool,
) -> Result<String, serde_json::Error> {
    if json {
        let mut value = serde_json::to_value(result)?;
        if let Some(obj) = value.as_object_mut() {
            obj.insert("path".to_string(), path.display().to_string().into());
        }
        return Ok(value.to_string());
    }

    let mut line = format!("{}: class {}", path.display(), result.predicted_class);
    if verbose {
        let scores: Vec<String> = result
            .scores
            .as_slice()
            .iter()
            .enumerate()
            .map(|(i, s)| format!("{}={:.4}", i, s))
            .collect();
        line.push_str(&format!(" [{}]", scores.join(", ")));
    }
    Ok(line)
}

/// Expand the inputs into files. The flag is false if any input was skipped.
fn collect_files(inputs: &[PathBuf], recursive: bool) -> (Vec<PathBuf>, bool) {
    let mut files = Vec::new();
    let mut complete = true;
    for path in inputs {
        if path.is_dir() {
            if recursive {
                files.extend(
                    WalkDir::new(path)
                        .sort_by_file_name()
                        .into_iter()
                        .filter_map(Result::ok)
                        .filter(|f| !f.file_type().is_dir())
                        .map(|f| f.into_path()),
                );
            } else {
                error!("{} is a directory, use --recursive", path.display());
                complete = false;
            }
        } else {
            files.push(path.clone());
        }
    }
    (files, complete)
}
