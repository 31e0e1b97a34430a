//! Road FCN CLI
//!
//! Entry point wiring the frozen backbone, the FCN decoder, the objective
//! and the training loop together for KITTI road segmentation.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use burn::tensor::backend::Backend;
use chrono::Local;
use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing::{info, warn};

use road_fcn::backend::{backend_name, default_device, TrainingBackend};
use road_fcn::dataset::{BatchSource, RoadDataset, SyntheticRoadSource, NUM_ROAD_CLASSES};
use road_fcn::encoder::Encoder;
use road_fcn::model::{FcnDecoderConfig, LossReport, TrainingConfig};
use road_fcn::preflight::run_preflight;
use road_fcn::training::{build_model, train, ObjectiveConfig};
use road_fcn::utils::logging::{init_logging, LogConfig};
use road_fcn::utils::{format_duration, format_shape};

/// Fully convolutional road segmentation
///
/// Trains a skip-connected FCN decoder on top of a frozen convolutional
/// backbone using the Burn framework.
#[derive(Parser, Debug)]
#[command(name = "road_fcn")]
#[command(version)]
#[command(about = "FCN road segmentation with Burn", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, default_value = "false")]
    verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Check the framework version and accelerator availability
    Preflight,

    /// Train the decoder
    Train {
        /// JSON or TOML configuration file; flags below override its values
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Dataset root (expects data_road/training inside)
        #[arg(short, long)]
        data_dir: Option<PathBuf>,

        /// Directory for run artifacts
        #[arg(short, long)]
        runs_dir: Option<PathBuf>,

        /// Number of training epochs
        #[arg(short, long)]
        epochs: Option<usize>,

        /// Batch size for training
        #[arg(short, long)]
        batch_size: Option<usize>,

        /// Learning rate
        #[arg(short, long)]
        learning_rate: Option<f64>,

        /// Dropout keep-probability in (0, 1]
        #[arg(long)]
        retention: Option<f64>,

        /// Random seed for initialisation, shuffling and dropout
        #[arg(long)]
        seed: Option<u64>,

        /// Pretrained backbone weights (CompactRecorder file)
        #[arg(long)]
        backbone_weights: Option<PathBuf>,

        /// Train on N generated road scenes instead of the disk dataset
        #[arg(long)]
        synthetic: Option<usize>,

        /// Report epoch loss as sum / batch_size instead of the per-batch mean
        #[arg(long, default_value = "false")]
        per_batch_size_loss: bool,

        /// Train without the L2 weight penalty
        #[arg(long, default_value = "false")]
        no_regularization: bool,

        /// Small image size and backbone for a quick smoke run
        #[arg(long, default_value = "false")]
        quick: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_config = if cli.verbose {
        LogConfig::verbose()
    } else {
        LogConfig::default()
    };

    let _ = init_logging(&log_config);

    print_banner();

    match cli.command {
        Commands::Preflight => cmd_preflight(),

        Commands::Train {
            config,
            data_dir,
            runs_dir,
            epochs,
            batch_size,
            learning_rate,
            retention,
            seed,
            backbone_weights,
            synthetic,
            per_batch_size_loss,
            no_regularization,
            quick,
        } => {
            let mut cfg = match (config, quick) {
                (Some(path), _) => TrainingConfig::from_file(&path)
                    .with_context(|| format!("Failed to load config {:?}", path))?,
                (None, true) => TrainingConfig::debug(),
                (None, false) => TrainingConfig::default(),
            };

            if let Some(v) = data_dir {
                cfg.data_dir = v;
            }
            if let Some(v) = runs_dir {
                cfg.runs_dir = v;
            }
            if let Some(v) = epochs {
                cfg.epochs = v;
            }
            if let Some(v) = batch_size {
                cfg.batch_size = v;
            }
            if let Some(v) = learning_rate {
                cfg.learning_rate = v;
            }
            if let Some(v) = retention {
                cfg.retention = v;
            }
            if let Some(v) = seed {
                cfg.seed = v;
            }
            if backbone_weights.is_some() {
                cfg.backbone.weights = backbone_weights;
            }
            if per_batch_size_loss {
                cfg.loss_report = LossReport::PerBatchSize;
            }
            if no_regularization {
                cfg.regularize = false;
            }

            cmd_train(cfg, synthetic)
        }
    }
}

fn print_banner() {
    println!(
        "{}",
        r#"
 +--------------------------------------------------------------+
 |   Road FCN                                                   |
 |   Fully convolutional road segmentation with Burn + Rust     |
 +--------------------------------------------------------------+
  "#
        .green()
    );
}

fn cmd_preflight() -> Result<()> {
    let report = run_preflight();
    report.log();

    println!("{}", "Pre-flight Checks:".cyan().bold());
    let framework = if report.framework.is_supported() {
        report.framework.to_string().green()
    } else {
        report.framework.to_string().red()
    };
    println!("  Framework:   {}", framework);
    println!("  Backend:     {}", report.backend);
    let accelerator = if report.accelerator.is_present() {
        report.accelerator.to_string().green()
    } else {
        report.accelerator.to_string().yellow()
    };
    println!("  Accelerator: {}", accelerator);

    for warning in report.warnings() {
        println!("{} {}", "Warning:".yellow(), warning);
    }
    Ok(())
}

fn cmd_train(config: TrainingConfig, synthetic: Option<usize>) -> Result<()> {
    config.validate()?;

    let report = run_preflight();
    report.log();
    if !report.framework.is_supported() {
        bail!("{}", report.framework);
    }
    for warning in report.warnings() {
        println!("{} {}", "Warning:".yellow(), warning);
    }

    let device = default_device();
    let (height, width) = config.image_shape;

    println!("{}", "Assembling Model...".cyan());
    // Weight initialisation draws from the backend RNG
    TrainingBackend::seed(config.seed);
    let mut encoder = config.backbone.to_config().init::<TrainingBackend>(&device)?;
    match &config.backbone.weights {
        Some(path) => {
            encoder = encoder.load_pretrained(path, &device)?;
        }
        None => warn!("No backbone weights given, the encoder keeps its random initialisation"),
    }

    let decoder_config = FcnDecoderConfig::new(config.num_classes, encoder.channels());
    let plan = decoder_config.plan(height, width)?;
    info!(
        "Decoder plan: {} -> {} -> {} -> {}",
        format_shape(&plan.stride32),
        format_shape(&plan.fused16),
        format_shape(&plan.fused8),
        format_shape(&plan.output)
    );

    let objective_config = ObjectiveConfig::new(config.num_classes).with_regularize(config.regularize);
    let mut model = build_model::<TrainingBackend>(&decoder_config, &objective_config, &device)?;

    println!("{}", "Loading Dataset...".cyan());
    let mut source: Box<dyn BatchSource> = match synthetic {
        Some(count) => Box::new(SyntheticRoadSource::new(count, config.image_shape, config.seed)?),
        None => {
            if config.num_classes != NUM_ROAD_CLASSES {
                bail!(
                    "the KITTI road dataset has {} classes, config asks for {}",
                    NUM_ROAD_CLASSES,
                    config.num_classes
                );
            }
            let root = config.data_dir.join("data_road").join("training");
            Box::new(RoadDataset::open(&root, config.image_shape, config.seed)?)
        }
    };

    println!();
    println!("{}", "Training Configuration:".cyan().bold());
    println!("  Samples:        {}", source.len());
    println!("  Epochs:         {}", config.epochs);
    println!("  Batch size:     {}", config.batch_size);
    println!("  Learning rate:  {}", config.learning_rate);
    println!("  Retention:      {}", config.retention);
    println!("  Image shape:    {}x{}", height, width);
    println!("  Backend:        {}", backend_name());
    println!();

    println!("{}", "Starting Training...".green().bold());
    let summary = train(&mut model, &encoder, source.as_mut(), &config, &device)?;

    for epoch in &summary.epochs {
        println!(
            "  {} Epoch: {}  loss: {:.6}",
            "->".cyan(),
            epoch.epoch,
            epoch.reported_loss
        );
    }

    let timestamp = Local::now().format("%Y%m%d_%H%M%S");
    let run_dir = config.runs_dir.join(timestamp.to_string());
    std::fs::create_dir_all(&run_dir)
        .with_context(|| format!("Failed to create run directory {:?}", run_dir))?;

    config.save(&run_dir.join("config.json"))?;
    std::fs::write(
        run_dir.join("summary.json"),
        serde_json::to_string_pretty(&summary)?,
    )?;
    model.save_decoder(&run_dir.join("decoder"))?;

    println!();
    println!("{}", "Training Complete!".green().bold());
    println!(
        "  Batches: {} in {}",
        summary.total_batches,
        format_duration(summary.elapsed_secs)
    );
    if let Some(loss) = summary.final_loss() {
        println!("  Final loss: {:.6}", loss);
    }
    println!("  Saved to: {:?}", run_dir);

    Ok(())
}
