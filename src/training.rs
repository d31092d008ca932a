use std::{
    fmt, fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
};

use burn::{
    config::Config,
    data::dataloader::{DataLoader, DataLoaderBuilder},
    module::{AutodiffModule, Module},
    optim::AdamConfig,
    record::{BinFileRecorder, FullPrecisionSettings},
    tensor::{
        backend::{AutodiffBackend, Backend},
        ElementConversion,
    },
    train::{
        metric::{
            store::{Aggregate, Direction, Split},
            AccuracyMetric, LossMetric,
        },
        renderer::{MetricState, MetricsRenderer, TrainingProgress},
        LearnerBuilder,
    },
};

use crate::{
    checkpoint::{export_top_k, TopK, TopKCheckpointing},
    craft_dataset::{CraftBatch, CraftBatcher, CraftDataset},
    dataset::{split_train_valid, TextImgBatch, TextImgBatcher, TextImgDataset},
    error::{self, OcrError},
    image_data::AlignCollate,
    metric::FScoreMetric,
    model::{
        detector::{Detector, DetectorConfig},
        recognizer::{Recognizer, RecognizerConfig},
    },
    parse_config::OcrFullConfig,
    utils::label_converter::TokenConverter,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OcrModule {
    Detector,
    Recognizer,
}

impl fmt::Display for OcrModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OcrModule::Detector => write!(f, "detector"),
            OcrModule::Recognizer => write!(f, "recognizer"),
        }
    }
}

#[derive(Config, Debug)]
pub struct TrainingConfig {
    #[config(default = 0)]
    pub version: usize,
    #[config(default = 8)]
    pub num_workers: usize,
    #[config(default = 100)]
    pub num_epochs: usize,
    #[config(default = 4)]
    pub batch_size: usize,
    #[config(default = 42)]
    pub seed: u64,
    #[config(default = 5e-5)]
    pub learning_rate: f64,
    #[config(default = 0.9)]
    pub train_ratio: f64,
    #[config(default = 3)]
    pub save_top_k: usize,
    #[config(default = "String::from(\"tb_logs\")")]
    pub log_dir: String,
    #[config(default = "String::from(\"checkpoints\")")]
    pub checkpoint_dir: String,
    /// Report progress through `tracing` instead of the terminal dashboard.
    #[config(default = false)]
    pub headless: bool,
}

impl TrainingConfig {
    pub fn from_full_config(full_config: &OcrFullConfig) -> Self {
        TrainingConfig::new()
            .with_seed(full_config.seed)
            .with_train_ratio(full_config.train_ratio)
            .with_save_top_k(full_config.save_top_k)
            .with_log_dir(full_config.log_dir.clone())
            .with_checkpoint_dir(full_config.checkpoint_dir.clone())
    }

    /// Metric logs and the learner's own checkpoints.
    pub fn artifact_dir(&self, module: OcrModule) -> PathBuf {
        Path::new(&self.log_dir)
            .join(module.to_string())
            .join(format!("version_{}", self.version))
    }

    /// The exported best checkpoints and the final model.
    pub fn export_dir(&self) -> PathBuf {
        Path::new(&self.checkpoint_dir).join(format!("version_{}", self.version))
    }
}

/// Progress reporting for runs without a terminal.
pub struct TracingRenderer;

impl MetricsRenderer for TracingRenderer {
    fn update_train(&mut self, _state: MetricState) {}

    fn update_valid(&mut self, state: MetricState) {
        if let MetricState::Numeric(entry, _) = state {
            tracing::debug!("valid {}", entry.formatted);
        }
    }

    fn render_train(&mut self, item: TrainingProgress) {
        tracing::trace!(
            "train epoch {}/{} iteration {}",
            item.epoch,
            item.epoch_total,
            item.iteration
        );
    }

    fn render_valid(&mut self, item: TrainingProgress) {
        tracing::trace!("valid epoch {}/{}", item.epoch, item.epoch_total);
    }
}

fn prepare_artifact_dir(config: &TrainingConfig, module: OcrModule) -> error::Result<PathBuf> {
    let artifact_dir = config.artifact_dir(module);
    fs::create_dir_all(&artifact_dir)?;
    config.save(artifact_dir.join("config.json"))?;

    Ok(artifact_dir)
}

fn top_k_strategy(config: &TrainingConfig) -> TopKCheckpointing {
    TopKCheckpointing::new::<FScoreMetric>(
        config.save_top_k,
        Aggregate::Mean,
        Direction::Highest,
        Split::Valid,
    )
}

fn save_results<B: Backend, M: Module<B>>(
    model: M,
    ranking: &Arc<Mutex<TopK>>,
    artifact_dir: &Path,
    export_dir: &Path,
) -> error::Result<()> {
    let ranked = ranking
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .entries()
        .to_vec();
    export_top_k(artifact_dir, &ranked, export_dir)?;

    let model_path = export_dir.join("model");
    model
        .save_file(
            model_path.clone(),
            &BinFileRecorder::<FullPrecisionSettings>::new(),
        )
        .map_err(|err| OcrError::Checkpoint(format!("cannot save final model: {err:?}")))?;
    tracing::info!("final model saved to {}", model_path.display());

    Ok(())
}

fn main_device<B: Backend>(devices: &[B::Device]) -> error::Result<B::Device> {
    devices.first().cloned().ok_or(OcrError::NoDevice)
}

/// Runs one validation batch before fitting so broken data or shapes fail
/// early.
fn sanity_check_recognizer<B: AutodiffBackend>(
    model: &Recognizer<B>,
    dataloader: &Arc<dyn DataLoader<TextImgBatch<B::InnerBackend>>>,
    converter: &TokenConverter,
) {
    let Some(batch) = dataloader.iter().next() else {
        tracing::warn!("validation split is empty, sanity check skipped");
        return;
    };
    let output = model
        .valid()
        .forward_classification(batch.images, batch.targets);
    if output.batch_size == 0 {
        return;
    }

    let loss = output.classification.loss.into_scalar().elem::<f64>();
    let steps = output.classification.output.dims()[0] / output.batch_size;
    let predictions = output
        .classification
        .output
        .argmax(1)
        .reshape([output.batch_size, steps])
        .slice([0..1, 0..steps])
        .into_data()
        .convert::<i64>()
        .value;
    tracing::info!(
        "sanity check: loss {loss:.4}, first prediction {:?}",
        converter.decode(&predictions)
    );
}

fn sanity_check_detector<B: AutodiffBackend>(
    model: &Detector<B>,
    dataloader: &Arc<dyn DataLoader<CraftBatch<B::InnerBackend>>>,
) {
    let Some(batch) = dataloader.iter().next() else {
        tracing::warn!("validation split is empty, sanity check skipped");
        return;
    };
    let output = model
        .valid()
        .forward_regression(batch.images, batch.score_maps);
    let loss = output.regression.loss.into_scalar().elem::<f64>();
    tracing::info!("sanity check: loss {loss:.4}");
}

pub fn train_recognizer<B: AutodiffBackend>(
    full_config: &OcrFullConfig,
    config: TrainingConfig,
    devices: Vec<B::Device>,
) -> error::Result<()> {
    B::seed(config.seed);
    let main_device = main_device::<B>(&devices)?;

    let dataset = TextImgDataset::new(
        &full_config.synth_data_path,
        full_config.input_channel,
        &full_config.vocab_path,
    )?;
    let converter =
        TokenConverter::new(dataset.vocab()).with_max_text_length(full_config.max_text_length);
    let collate = AlignCollate::new(
        full_config.img_h,
        full_config.img_w,
        full_config.pad,
        full_config.input_channel,
    );
    let pad = converter.additional_symbols.pad as usize;
    let model_config = RecognizerConfig::new(converter.num_classes, pad)
        .with_input_channel(collate.channels)
        .with_dimensions(full_config.dimensions)
        .with_stacks(full_config.stacks)
        .with_n_heads(full_config.n_heads)
        .with_dropout(full_config.dropout)
        .with_feed_forward_size(full_config.feed_forward_size);

    let (dataset_train, dataset_valid) =
        split_train_valid(dataset, config.train_ratio, config.seed);
    let batcher_train =
        TextImgBatcher::<B>::new(main_device.clone(), collate.clone(), converter.clone());
    let batcher_valid =
        TextImgBatcher::<B::InnerBackend>::new(main_device.clone(), collate, converter.clone());

    let dataloader_train = DataLoaderBuilder::new(batcher_train)
        .batch_size(config.batch_size)
        .shuffle(config.seed)
        .num_workers(config.num_workers)
        .build(dataset_train);
    let dataloader_valid = DataLoaderBuilder::new(batcher_valid)
        .batch_size(config.batch_size)
        .num_workers(config.num_workers)
        .build(dataset_valid);

    let artifact_dir = prepare_artifact_dir(&config, OcrModule::Recognizer)?;
    model_config.save(artifact_dir.join("model.json"))?;

    let model = model_config.init::<B>(&main_device);
    sanity_check_recognizer(&model, &dataloader_valid, &converter);

    let strategy = top_k_strategy(&config);
    let ranking = strategy.ranking();
    tracing::info!("training recognizer on {} device(s)", devices.len());
    let mut builder = LearnerBuilder::new(&artifact_dir.to_string_lossy())
        .metric_train_numeric(AccuracyMetric::new().with_pad_token(pad))
        .metric_valid_numeric(AccuracyMetric::new().with_pad_token(pad))
        .metric_train_numeric(LossMetric::new())
        .metric_valid_numeric(LossMetric::new())
        .metric_valid_numeric(FScoreMetric::new())
        .with_file_checkpointer(BinFileRecorder::<FullPrecisionSettings>::new())
        .log_to_file(false)
        .devices(devices)
        .num_epochs(config.num_epochs)
        .summary();
    if config.headless {
        builder = builder.renderer(TracingRenderer);
    }
    builder.with_checkpointing_strategy(strategy);
    let learner = builder.build(model, AdamConfig::new().init(), config.learning_rate);

    let model_trained = learner.fit(dataloader_train, dataloader_valid);

    save_results(model_trained, &ranking, &artifact_dir, &config.export_dir())
}

pub fn train_detector<B: AutodiffBackend>(
    full_config: &OcrFullConfig,
    config: TrainingConfig,
    devices: Vec<B::Device>,
) -> error::Result<()> {
    B::seed(config.seed);
    let main_device = main_device::<B>(&devices)?;

    let dataset = CraftDataset::new(&full_config.synth_data_path)?;
    let model_config = DetectorConfig::new()
        .with_channels(full_config.detector_channels)
        .with_score_threshold(full_config.score_threshold);

    let (dataset_train, dataset_valid) =
        split_train_valid(dataset, config.train_ratio, config.seed);
    let batcher_train = CraftBatcher::<B>::new(main_device.clone(), full_config.canvas_size);
    let batcher_valid =
        CraftBatcher::<B::InnerBackend>::new(main_device.clone(), full_config.canvas_size);

    let dataloader_train = DataLoaderBuilder::new(batcher_train)
        .batch_size(config.batch_size)
        .shuffle(config.seed)
        .num_workers(config.num_workers)
        .build(dataset_train);
    let dataloader_valid = DataLoaderBuilder::new(batcher_valid)
        .batch_size(config.batch_size)
        .num_workers(config.num_workers)
        .build(dataset_valid);

    let artifact_dir = prepare_artifact_dir(&config, OcrModule::Detector)?;
    model_config.save(artifact_dir.join("model.json"))?;

    let model = model_config.init::<B>(&main_device);
    sanity_check_detector(&model, &dataloader_valid);

    let strategy = top_k_strategy(&config);
    let ranking = strategy.ranking();
    tracing::info!("training detector on {} device(s)", devices.len());
    let mut builder = LearnerBuilder::new(&artifact_dir.to_string_lossy())
        .metric_train_numeric(LossMetric::new())
        .metric_valid_numeric(LossMetric::new())
        .metric_valid_numeric(FScoreMetric::new())
        .with_file_checkpointer(BinFileRecorder::<FullPrecisionSettings>::new())
        .log_to_file(false)
        .devices(devices)
        .num_epochs(config.num_epochs)
        .summary();
    if config.headless {
        builder = builder.renderer(TracingRenderer);
    }
    builder.with_checkpointing_strategy(strategy);
    let learner = builder.build(model, AdamConfig::new().init(), config.learning_rate);

    let model_trained = learner.fit(dataloader_train, dataloader_valid);

    save_results(model_trained, &ranking, &artifact_dir, &config.export_dir())
}

pub fn train<B: AutodiffBackend>(
    module: OcrModule,
    full_config: &OcrFullConfig,
    config: TrainingConfig,
    devices: Vec<B::Device>,
) -> error::Result<()> {
    match module {
        OcrModule::Detector => train_detector::<B>(full_config, config, devices),
        OcrModule::Recognizer => train_recognizer::<B>(full_config, config, devices),
    }
}
