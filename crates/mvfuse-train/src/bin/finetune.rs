//! CLI entry point for multi-view MRI finetuning.
//!
//! Subcommands:
//!   train     -- Finetune the composed model and test the best checkpoint
//!   evaluate  -- Test a previously finetuned model
//!   split     -- Print the split sizes for the configured manifest

use clap::{Args, Parser, Subcommand};
use mvfuse_core::{FinetuneConfig, LoggingConfig};
use mvfuse_model::{device_label, select_device};
use mvfuse_train::{config, trainer};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser)]
#[command(name = "finetune", about = "Multi-view MRI finetuning pipeline")]
struct Cli {
    /// YAML configuration file; defaults apply when omitted.
    #[arg(long, env = "MVFUSE_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Finetune on the train split, validate every epoch, then test.
    Train(Overrides),
    /// Evaluate the model saved in the checkpoint directory on the test split.
    Evaluate(Overrides),
    /// Print val/test/train/discard sizes without loading images or models.
    Split(Overrides),
}

/// Command-line overrides of the configuration file.
#[derive(Args)]
struct Overrides {
    #[arg(long)]
    random_seed: Option<u64>,
    #[arg(long)]
    train_batch_size: Option<usize>,
    #[arg(long)]
    eval_batch_size: Option<usize>,
    #[arg(long)]
    dataset_root: Option<PathBuf>,
    #[arg(long)]
    manifest_path: Option<PathBuf>,
    #[arg(long)]
    ensemble_checkpoint_path: Option<PathBuf>,
    #[arg(long)]
    fusion_checkpoint_path: Option<PathBuf>,
    #[arg(long)]
    model_checkpoint_dir: Option<PathBuf>,
    #[arg(long)]
    learning_rate: Option<f64>,
    #[arg(long)]
    finetune_ensemble: Option<bool>,
    #[arg(long)]
    finetune_fusion: Option<bool>,
    /// `true` for 3-class diagnosis, `false` for score regression.
    #[arg(long)]
    classification: Option<bool>,
    #[arg(long)]
    hidden_size: Option<usize>,
    #[arg(long)]
    train_ratio: Option<f64>,
    #[arg(long)]
    val_ratio: Option<f64>,
    #[arg(long)]
    test_ratio: Option<f64>,
    #[arg(long)]
    max_epochs: Option<usize>,
    #[arg(long)]
    patience: Option<usize>,

    /// Run on CPU even when an accelerator is available.
    #[arg(long)]
    cpu: bool,

    /// Also write the JSON report to this file.
    #[arg(long)]
    report: Option<PathBuf>,
}

impl Overrides {
    fn apply(&self, config: &mut FinetuneConfig) {
        macro_rules! set {
            ($($field:ident),* $(,)?) => {
                $(if let Some(value) = &self.$field {
                    config.$field = value.clone();
                })*
            };
        }
        set!(
            random_seed,
            train_batch_size,
            eval_batch_size,
            dataset_root,
            manifest_path,
            ensemble_checkpoint_path,
            fusion_checkpoint_path,
            model_checkpoint_dir,
            learning_rate,
            finetune_ensemble,
            finetune_fusion,
            classification,
            hidden_size,
            train_ratio,
            val_ratio,
            test_ratio,
            max_epochs,
        );
        if self.patience.is_some() {
            config.patience = self.patience;
        }
    }
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = config::resolve_config(cli.config.as_deref())?;
    let overrides = match &cli.command {
        Command::Train(o) | Command::Evaluate(o) | Command::Split(o) => o,
    };
    overrides.apply(&mut config);
    init_tracing(&config.logging);

    match &cli.config {
        Some(path) => info!(path = %path.display(), "Configuration loaded from file"),
        None => info!("No config file specified, using defaults"),
    }

    let report = match &cli.command {
        Command::Split(_) => plan_json(&trainer::plan(&config)?),
        Command::Train(_) | Command::Evaluate(_) => {
            let device = select_device(overrides.cpu);
            info!(device = device_label(&device), mode = %config.task_mode(), "Device selected");
            if matches!(&cli.command, Command::Train(_)) {
                serde_json::to_value(trainer::run(&config, &device)?)?
            } else {
                serde_json::to_value(trainer::evaluate(&config, &device)?)?
            }
        }
    };

    let rendered = serde_json::to_string_pretty(&report)?;
    if let Some(path) = &overrides.report {
        std::fs::write(path, &rendered)
            .map_err(|e| anyhow::anyhow!("Failed to write report {}: {}", path.display(), e))?;
        info!(path = %path.display(), "Report written");
    }
    println!("{rendered}");
    Ok(())
}

fn plan_json(plan: &mvfuse_data::SplitPlan) -> serde_json::Value {
    serde_json::json!({
        "val": plan.val_size,
        "test": plan.test_size,
        "train": plan.train_size,
        "discarded": plan.discard_size,
        "total": plan.total(),
    })
}
