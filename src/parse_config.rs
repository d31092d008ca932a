use std::{fs, path::Path};

use serde::{Deserialize, Serialize};

use crate::error::{OcrError, Result};

#[derive(Serialize, Deserialize, Debug)]
struct DataYaml {
    synth_data_path: String,
    #[serde(default = "default_input_channel")]
    input_channel: usize,
    #[serde(default = "default_img_h")]
    img_h: u32,
    #[serde(default = "default_img_w")]
    img_w: u32,
    #[serde(default = "default_true")]
    pad: bool,
    #[serde(default = "default_vocab_path")]
    vocab_path: String,
    #[serde(default)]
    max_text_length: Option<usize>,
    #[serde(default = "default_canvas_size")]
    canvas_size: u32,
}

#[derive(Serialize, Deserialize, Debug)]
struct ModelYaml {
    #[serde(default = "default_dimensions")]
    dimensions: usize,
    #[serde(default = "default_n_heads")]
    n_heads: usize,
    #[serde(default = "default_stacks")]
    stacks: usize,
    #[serde(default = "default_feed_forward_size")]
    feed_forward_size: usize,
    #[serde(default = "default_dropout")]
    dropout: f64,
    #[serde(default = "default_detector_channels")]
    detector_channels: usize,
}

impl Default for ModelYaml {
    fn default() -> Self {
        Self {
            dimensions: default_dimensions(),
            n_heads: default_n_heads(),
            stacks: default_stacks(),
            feed_forward_size: default_feed_forward_size(),
            dropout: default_dropout(),
            detector_channels: default_detector_channels(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug)]
struct TrainingYaml {
    /// Every visible CUDA device when absent.
    #[serde(default)]
    num_cuda: Option<usize>,
    #[serde(default = "default_seed")]
    seed: u64,
    #[serde(default = "default_train_ratio")]
    train_ratio: f64,
    #[serde(default = "default_save_top_k")]
    save_top_k: usize,
    #[serde(default = "default_log_dir")]
    log_dir: String,
    #[serde(default = "default_checkpoint_dir")]
    checkpoint_dir: String,
    #[serde(default = "default_score_threshold")]
    score_threshold: f32,
}

impl Default for TrainingYaml {
    fn default() -> Self {
        Self {
            num_cuda: None,
            seed: default_seed(),
            train_ratio: default_train_ratio(),
            save_top_k: default_save_top_k(),
            log_dir: default_log_dir(),
            checkpoint_dir: default_checkpoint_dir(),
            score_threshold: default_score_threshold(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "UPPERCASE")]
struct OcrTrainingConfigYaml {
    data: DataYaml,
    #[serde(default)]
    model: ModelYaml,
    #[serde(default)]
    training: TrainingYaml,
}

fn default_input_channel() -> usize {
    1
}
fn default_img_h() -> u32 {
    32
}
fn default_img_w() -> u32 {
    100
}
fn default_true() -> bool {
    true
}
fn default_vocab_path() -> String {
    "vocab.txt".to_string()
}
fn default_canvas_size() -> u32 {
    768
}
fn default_dimensions() -> usize {
    256
}
fn default_n_heads() -> usize {
    8
}
fn default_stacks() -> usize {
    3
}
fn default_feed_forward_size() -> usize {
    1024
}
fn default_dropout() -> f64 {
    0.1
}
fn default_detector_channels() -> usize {
    64
}
fn default_seed() -> u64 {
    42
}
fn default_train_ratio() -> f64 {
    0.9
}
fn default_save_top_k() -> usize {
    3
}
fn default_log_dir() -> String {
    "tb_logs".to_string()
}
fn default_checkpoint_dir() -> String {
    "checkpoints".to_string()
}
fn default_score_threshold() -> f32 {
    0.4
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct OcrFullConfig {
    pub synth_data_path: String,
    pub input_channel: usize,
    pub img_h: u32,
    pub img_w: u32,
    pub pad: bool,
    pub vocab_path: String,
    pub max_text_length: Option<usize>,
    pub canvas_size: u32,
    pub dimensions: usize,
    pub n_heads: usize,
    pub stacks: usize,
    pub feed_forward_size: usize,
    pub dropout: f64,
    pub detector_channels: usize,
    pub num_cuda: Option<usize>,
    pub seed: u64,
    pub train_ratio: f64,
    pub save_top_k: usize,
    pub log_dir: String,
    pub checkpoint_dir: String,
    pub score_threshold: f32,
}

impl OcrFullConfig {
    pub fn from_yaml<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| OcrError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;

        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let yaml: OcrTrainingConfigYaml = serde_yaml::from_str(content)?;

        Ok(Self {
            synth_data_path: yaml.data.synth_data_path,
            input_channel: yaml.data.input_channel,
            img_h: yaml.data.img_h,
            img_w: yaml.data.img_w,
            pad: yaml.data.pad,
            vocab_path: yaml.data.vocab_path,
            max_text_length: yaml.data.max_text_length,
            canvas_size: yaml.data.canvas_size,
            dimensions: yaml.model.dimensions,
            n_heads: yaml.model.n_heads,
            stacks: yaml.model.stacks,
            feed_forward_size: yaml.model.feed_forward_size,
            dropout: yaml.model.dropout,
            detector_channels: yaml.model.detector_channels,
            num_cuda: yaml.training.num_cuda,
            seed: yaml.training.seed,
            train_ratio: yaml.training.train_ratio,
            save_top_k: yaml.training.save_top_k,
            log_dir: yaml.training.log_dir,
            checkpoint_dir: yaml.training.checkpoint_dir,
            score_threshold: yaml.training.score_threshold,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_defaults_fill_missing_sections() {
        let config = OcrFullConfig::from_yaml_str("DATA:\n  synth_data_path: ./data/gt.pkl\n")
            .unwrap();

        assert_eq!(config.synth_data_path, "./data/gt.pkl");
        assert_eq!(config.input_channel, 1);
        assert_eq!((config.img_h, config.img_w), (32, 100));
        assert!(config.pad);
        assert_eq!(config.max_text_length, None);
        assert_eq!(config.save_top_k, 3);
        assert_eq!(config.train_ratio, 0.9);
        assert_eq!(config.log_dir, "tb_logs");
        assert_eq!(config.num_cuda, None);
    }

    #[test]
    fn test_sections_override_defaults() {
        let yaml = "\
DATA:
  synth_data_path: gt.pkl
  input_channel: 3
  pad: false
  max_text_length: 25
MODEL:
  dimensions: 128
TRAINING:
  num_cuda: 2
  save_top_k: 5
";
        let config = OcrFullConfig::from_yaml_str(yaml).unwrap();

        assert_eq!(config.input_channel, 3);
        assert!(!config.pad);
        assert_eq!(config.max_text_length, Some(25));
        assert_eq!(config.dimensions, 128);
        assert_eq!(config.n_heads, 8);
        assert_eq!(config.num_cuda, Some(2));
        assert_eq!(config.save_top_k, 5);
    }

    #[test]
    fn test_missing_data_path_is_an_error() {
        assert!(OcrFullConfig::from_yaml_str("DATA:\n  img_h: 32\n").is_err());
    }

    #[test]
    fn test_missing_file() {
        let err = OcrFullConfig::from_yaml("./does-not-exist.yaml").unwrap_err();
        assert!(matches!(err, OcrError::ConfigRead { .. }));
    }
}
