use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use nalgebra::DMatrix;
use sdm_core::optimiser::normalised_least_squares_residual;
use sdm_core::types::shape_from_points;
use sdm_core::{
    BoundingBox, CascadeTrainer, DescriptorRegistry, LinearRegressor, Point, Regulariser, SdmLandmarkModel,
    SupervisedDescentOptimiser, TrainingConfig, TrainingSample,
};
use serde::Deserialize;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sdm", about = "Supervised descent landmark fitting")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the structure of a trained landmark model
    Inspect {
        /// Model file in the text format
        model: PathBuf,
    },
    /// Fit a landmark model to a face in an image
    Fit {
        #[arg(short, long)]
        model: PathBuf,
        #[arg(short, long)]
        image: PathBuf,
        /// Face box as x,y,width,height
        #[arg(long, value_parser = parse_face_box)]
        face_box: BoundingBox,
    },
    /// Train a landmark model from an annotated manifest
    Train {
        /// JSON manifest of annotated images
        #[arg(long)]
        manifest: PathBuf,
        /// Training config (TOML); defaults apply when omitted
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Learn to invert sin(x) and print the residual per cascade length
    Demo {
        #[arg(long, default_value_t = 10)]
        max_levels: usize,
    },
}

/// Training manifest. Relative image paths resolve against the manifest's
/// directory.
#[derive(Debug, Deserialize)]
struct Manifest {
    landmark_ids: Vec<String>,
    samples: Vec<ManifestSample>,
}

#[derive(Debug, Deserialize)]
struct ManifestSample {
    image: PathBuf,
    face_box: BoundingBox,
    /// One `[x, y]` pair per landmark, in `landmark_ids` order.
    landmarks: Vec<[f32; 2]>,
}

fn parse_face_box(s: &str) -> Result<BoundingBox, String> {
    let values: Vec<f32> = s
        .split(',')
        .map(|v| v.trim().parse::<f32>().map_err(|e| format!("{v:?}: {e}")))
        .collect::<Result<_, _>>()?;
    match values[..] {
        [x, y, w, h] => {
            let b = BoundingBox::new(x, y, w, h);
            if b.is_valid() {
                Ok(b)
            } else {
                Err(format!("face box must have positive size, got {s}"))
            }
        }
        _ => Err(format!("expected x,y,width,height, got {s}")),
    }
}

fn load_gray(path: &Path) -> Result<image::GrayImage> {
    Ok(image::open(path)
        .with_context(|| format!("cannot read image {}", path.display()))?
        .to_luma8())
}

fn inspect(path: &Path) -> Result<()> {
    let model = SdmLandmarkModel::load(path, &DescriptorRegistry::default())
        .with_context(|| format!("cannot load model {}", path.display()))?;
    println!("landmarks: {}", model.num_landmarks());
    println!("ids: {}", model.landmark_ids().join(" "));
    println!("cascade steps: {}", model.num_cascade_steps());
    for step in 0..model.num_cascade_steps() {
        if let (Some(r), Some(d)) = (model.regressor(step), model.descriptor(step)) {
            println!(
                "  step {step}: {} [{}] regressor {}x{}",
                d.descriptor_type(),
                d.parameter_string(),
                r.nrows(),
                r.ncols()
            );
        }
    }
    Ok(())
}

fn fit(model_path: &Path, image_path: &Path, face_box: BoundingBox) -> Result<()> {
    let model = SdmLandmarkModel::load(model_path, &DescriptorRegistry::default())
        .with_context(|| format!("cannot load model {}", model_path.display()))?;
    let image = load_gray(image_path)?;
    let shape = model.fit(&image, &face_box)?;

    let landmarks: Vec<serde_json::Value> = model
        .landmark_ids()
        .iter()
        .filter_map(|id| {
            model
                .landmark(&shape, id)
                .map(|p| serde_json::json!({ "id": id, "x": p.x, "y": p.y }))
        })
        .collect();
    println!("{}", serde_json::to_string_pretty(&landmarks)?);
    Ok(())
}

fn train(manifest_path: &Path, config_path: Option<&Path>, output: &Path) -> Result<()> {
    let config = match config_path {
        Some(p) => TrainingConfig::load(p).with_context(|| format!("cannot load config {}", p.display()))?,
        None => TrainingConfig::from_env().context("invalid SDM_* environment overrides")?,
    };

    let text = std::fs::read_to_string(manifest_path)
        .with_context(|| format!("cannot read manifest {}", manifest_path.display()))?;
    let manifest: Manifest = serde_json::from_str(&text).context("bad manifest JSON")?;
    let base = manifest_path.parent().unwrap_or_else(|| Path::new("."));

    let mut samples = Vec::with_capacity(manifest.samples.len());
    for (i, s) in manifest.samples.iter().enumerate() {
        if s.landmarks.len() != manifest.landmark_ids.len() {
            bail!(
                "sample {i} has {} landmarks, manifest names {}",
                s.landmarks.len(),
                manifest.landmark_ids.len()
            );
        }
        let points: Vec<Point> = s.landmarks.iter().map(|&[x, y]| Point::new(x, y)).collect();
        samples.push(TrainingSample {
            image: load_gray(&base.join(&s.image))?,
            face_box: s.face_box,
            landmarks: shape_from_points(&points),
        });
    }
    tracing::info!(samples = samples.len(), "loaded training manifest");

    let trainer = CascadeTrainer::from_config(&config, &DescriptorRegistry::default())?;
    let model = trainer.train(&samples, manifest.landmark_ids)?;
    model
        .save(output)
        .with_context(|| format!("cannot write model {}", output.display()))?;
    println!(
        "Trained {} cascade steps over {} landmarks -> {}",
        model.num_cascade_steps(),
        model.num_landmarks(),
        output.display()
    );
    Ok(())
}

fn demo(max_levels: usize) -> Result<()> {
    let mut y = Vec::with_capacity(11);
    let mut v = -1.0f32;
    for _ in 0..11 {
        y.push(v);
        v += 0.2;
    }
    let x: Vec<f32> = y.iter().map(|v| v.min(1.0).asin()).collect();
    let n = y.len();
    let x = DMatrix::from_column_slice(n, 1, &x);
    let y = DMatrix::from_column_slice(n, 1, &y);
    let x0 = DMatrix::from_element(n, 1, 0.5f32);
    let h = |p: &[f32]| vec![p[0].sin()];

    for levels in 1..=max_levels {
        let mut opt = SupervisedDescentOptimiser::new(
            (0..levels)
                .map(|_| LinearRegressor::new(Regulariser::default()))
                .collect(),
        );
        opt.train(&x, &x0, &y, &h)?;
        let predictions = opt.test(&x0, &y, &h)?;
        println!(
            "levels {levels:>2}: residual {:.7}",
            normalised_least_squares_residual(&predictions, &x)
        );
    }
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Inspect { model } => inspect(&model)?,
        Commands::Fit {
            model,
            image,
            face_box,
        } => fit(&model, &image, face_box)?,
        Commands::Train {
            manifest,
            config,
            output,
        } => train(&manifest, config.as_deref(), &output)?,
        Commands::Demo { max_levels } => demo(max_levels)?,
    }

    Ok(())
}
