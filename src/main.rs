use std::path::PathBuf;

use anyhow::{Context, Result};
use burn::backend::{libtorch::LibTorchDevice, Autodiff, LibTorch};
use clap::{Parser, ValueEnum};
use ocr_train::{
    parse_config::OcrFullConfig,
    training::{self, OcrModule, TrainingConfig},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum ModuleArg {
    Detector,
    Recognizer,
}

impl From<ModuleArg> for OcrModule {
    fn from(arg: ModuleArg) -> Self {
        match arg {
            ModuleArg::Detector => OcrModule::Detector,
            ModuleArg::Recognizer => OcrModule::Recognizer,
        }
    }
}

/// Train the text detector or the text recognizer on a synthetic dataset.
#[derive(Parser, Debug)]
#[command(name = "ocr-train", disable_version_flag = true)]
struct Cli {
    /// Which model to train.
    #[arg(short, long, value_enum)]
    module: ModuleArg,

    /// Run version, used to name log and checkpoint directories.
    #[arg(short, long, default_value_t = 0)]
    version: usize,

    #[arg(long = "batch-size", visible_alias = "bs", default_value_t = 4)]
    batch_size: usize,

    #[arg(long = "learning-rate", visible_alias = "lr", default_value_t = 5e-5)]
    learning_rate: f64,

    #[arg(short = 'e', long = "max-epoch", default_value_t = 100)]
    max_epoch: usize,

    #[arg(long = "num-workers", visible_alias = "nw", default_value_t = 8)]
    num_workers: usize,

    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Log progress instead of drawing the terminal dashboard.
    #[arg(long)]
    headless: bool,
}

impl Cli {
    fn training_config(&self, full_config: &OcrFullConfig) -> TrainingConfig {
        TrainingConfig::from_full_config(full_config)
            .with_version(self.version)
            .with_batch_size(self.batch_size)
            .with_learning_rate(self.learning_rate)
            .with_num_epochs(self.max_epoch)
            .with_num_workers(self.num_workers)
            .with_headless(self.headless)
    }
}

/// `None` takes every visible CUDA device; zero devices means CPU.
fn devices(num_cuda: Option<usize>) -> Vec<LibTorchDevice> {
    let num_cuda = num_cuda
        .unwrap_or_else(|| usize::try_from(tch::Cuda::device_count()).unwrap_or_default());
    if num_cuda == 0 {
        return vec![LibTorchDevice::Cpu];
    }

    (0..num_cuda).map(LibTorchDevice::Cuda).collect()
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("ocr_train=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let full_config = OcrFullConfig::from_yaml(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    let training_config = cli.training_config(&full_config);
    let devices = devices(full_config.num_cuda);
    tracing::info!("devices: {devices:?}");

    training::train::<Autodiff<LibTorch>>(
        cli.module.into(),
        &full_config,
        training_config,
        devices,
    )?;

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_defaults() {
        let cli = Cli::try_parse_from(["ocr-train", "-m", "recognizer"]).unwrap();

        assert_eq!(cli.module, ModuleArg::Recognizer);
        assert_eq!(cli.version, 0);
        assert_eq!(cli.batch_size, 4);
        assert_eq!(cli.learning_rate, 5e-5);
        assert_eq!(cli.max_epoch, 100);
        assert_eq!(cli.num_workers, 8);
        assert_eq!(cli.config, PathBuf::from("config.yaml"));
    }

    #[test]
    fn test_aliases() {
        let cli = Cli::try_parse_from([
            "ocr-train", "--module", "detector", "-v", "3", "--bs", "16", "--lr", "0.001", "-e",
            "5", "--nw", "2", "-c", "other.yaml",
        ])
        .unwrap();

        assert_eq!(cli.module, ModuleArg::Detector);
        assert_eq!(cli.version, 3);
        assert_eq!(cli.batch_size, 16);
        assert_eq!(cli.learning_rate, 0.001);
        assert_eq!(cli.max_epoch, 5);
        assert_eq!(cli.num_workers, 2);
        assert_eq!(cli.config, PathBuf::from("other.yaml"));
    }

    #[test]
    fn test_module_is_required() {
        assert!(Cli::try_parse_from(["ocr-train"]).is_err());
        assert!(Cli::try_parse_from(["ocr-train", "-m", "classifier"]).is_err());
    }

    #[test]
    fn test_training_config_overrides() {
        let full_config = OcrFullConfig::from_yaml_str(
            "DATA:\n  synth_data_path: gt.pkl\nTRAINING:\n  seed: 7\n  save_top_k: 2\n",
        )
        .unwrap();
        let cli = Cli::try_parse_from([
            "ocr-train", "-m", "recognizer", "-v", "4", "--bs", "32", "--lr", "0.01", "-e", "12",
            "--nw", "3", "--headless",
        ])
        .unwrap();
        let config = cli.training_config(&full_config);

        assert_eq!(config.version, 4);
        assert_eq!(config.batch_size, 32);
        assert_eq!(config.learning_rate, 0.01);
        assert_eq!(config.num_epochs, 12);
        assert_eq!(config.num_workers, 3);
        assert!(config.headless);
        // config file values survive the overrides
        assert_eq!(config.seed, 7);
        assert_eq!(config.save_top_k, 2);
    }

    #[test]
    fn test_devices() {
        assert_eq!(devices(Some(0)), vec![LibTorchDevice::Cpu]);
        assert_eq!(
            devices(Some(2)),
            vec![LibTorchDevice::Cuda(0), LibTorchDevice::Cuda(1)]
        );
        assert!(!devices(None).is_empty());
    }
}
