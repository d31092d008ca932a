use std::{
    fs::File,
    io::BufReader,
    path::{Path, PathBuf},
    marker::PhantomData,
    sync::Arc,
};

use crate::{
    error::{OcrError, Result},
    image_data::{image_from_raw, AlignCollate},
    utils::{
        label_converter::TokenConverter,
        vocab::{normalize_label, Vocabulary},
    },
};
use burn::{
    data::{
        dataloader::batcher::Batcher,
        dataset::{
            transform::{PartialDataset, ShuffledDataset},
            Dataset,
        },
    },
    tensor::{backend::Backend, Data, Int, Shape, Tensor},
};
use image::DynamicImage;
use serde::{Deserialize, Serialize};

/// One record of the pickled ground-truth list.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct SynthEntry {
    #[serde(rename = "fn")]
    pub file_name: String,
    pub txt: String,
    /// Character quads, four `[x, y]` points each.
    #[serde(rename = "charBB", default, skip_serializing_if = "Option::is_none")]
    pub char_boxes: Option<Vec<Vec<Vec<f32>>>>,
}

pub fn load_entries<P: AsRef<Path>>(path: P) -> Result<Vec<SynthEntry>> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|source| OcrError::DatasetRead {
        path: path.to_path_buf(),
        source,
    })?;
    let entries: Vec<SynthEntry> =
        serde_pickle::from_reader(BufReader::new(file), serde_pickle::DeOptions::new())?;
    tracing::info!("loaded {} entries from {}", entries.len(), path.display());

    Ok(entries)
}

/// Images referenced by the pickle live next to it.
pub fn base_dir(data_path: &Path) -> PathBuf {
    data_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default()
}

/// Logs and drops a sample that cannot be opened.
pub(crate) fn readable<T>(index: usize, opened: Result<T>) -> Option<T> {
    opened
        .map_err(|err| tracing::warn!("skipping sample {index}: {err}"))
        .ok()
}

/// Replaces unreadable samples with the next readable one of the same
/// dataset, wrapping around at most once.
///
/// Burn's data loader ends an epoch at the first `None`, so every split is
/// wrapped in this.
pub struct FallbackDataset<D, I> {
    dataset: D,
    input: PhantomData<I>,
}

impl<D, I> FallbackDataset<D, I>
where
    D: Dataset<I>,
    I: Clone + Send + Sync,
{
    pub fn new(dataset: D) -> Self {
        Self {
            dataset,
            input: PhantomData,
        }
    }
}

impl<D, I> Dataset<I> for FallbackDataset<D, I>
where
    D: Dataset<I>,
    I: Clone + Send + Sync,
{
    fn get(&self, index: usize) -> Option<I> {
        let len = self.dataset.len();
        if index >= len {
            return None;
        }

        (0..len).find_map(|offset| self.dataset.get((index + offset) % len))
    }

    fn len(&self) -> usize {
        self.dataset.len()
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct TextImgItem {
    // The raw vec of the image is passed here because DynamicImage
    // does not directly implement the Serialize trait.
    pub image_raw: Vec<u8>,
    pub channels: usize,
    pub image_height: u32,
    pub image_width: u32,
    pub text: String,
}

impl TextImgItem {
    pub fn image(&self) -> Option<DynamicImage> {
        image_from_raw(
            self.image_raw.clone(),
            self.channels,
            self.image_width,
            self.image_height,
        )
    }
}

pub struct TextImgDataset {
    base_path: PathBuf,
    image_names: Vec<String>,
    texts: Vec<String>,
    vocab: Vocabulary,
    input_channel: usize,
}

impl TextImgDataset {
    /// Loads the pickled list, builds the vocabulary and writes it to
    /// `vocab_path`.
    pub fn new<P: AsRef<Path>, V: AsRef<Path>>(
        data_path: P,
        input_channel: usize,
        vocab_path: V,
    ) -> Result<Self> {
        let data_path = data_path.as_ref();
        let entries = load_entries(data_path)?;
        if entries.is_empty() {
            return Err(OcrError::EmptyDataset(data_path.to_path_buf()));
        }

        let (image_names, texts): (Vec<_>, Vec<_>) = entries
            .into_iter()
            .map(|entry| (entry.file_name, normalize_label(&entry.txt)))
            .unzip();
        let vocab = Vocabulary::from_labels(texts.iter().map(String::as_str));
        vocab.write(vocab_path.as_ref())?;
        tracing::info!(
            "vocabulary of {} tokens written to {}",
            vocab.len(),
            vocab_path.as_ref().display()
        );

        Ok(Self {
            base_path: base_dir(data_path),
            image_names,
            texts,
            vocab,
            input_channel,
        })
    }

    pub fn vocab(&self) -> &Vocabulary {
        &self.vocab
    }

    fn open(&self, index: usize) -> Result<TextImgItem> {
        let img = image::open(self.base_path.join(&self.image_names[index]))?;
        let (image_raw, channels) = if self.input_channel == 1 {
            (img.to_luma8().into_raw(), 1)
        } else {
            (img.to_rgb8().into_raw(), 3)
        };

        Ok(TextImgItem {
            image_raw,
            channels,
            image_height: img.height(),
            image_width: img.width(),
            text: self.texts[index].clone(),
        })
    }
}

impl Dataset<TextImgItem> for TextImgDataset {
    fn get(&self, index: usize) -> Option<TextImgItem> {
        if index >= self.len() {
            return None;
        }

        readable(index, self.open(index))
    }

    fn len(&self) -> usize {
        self.image_names.len()
    }
}

pub type SplitDataset<D, I> = FallbackDataset<PartialDataset<Arc<ShuffledDataset<D, I>>, I>, I>;

/// Shuffles with `seed`, then cuts at `floor(len * train_ratio)`. An
/// unreadable sample is only ever replaced from its own side of the cut.
pub fn split_train_valid<D, I>(
    dataset: D,
    train_ratio: f64,
    seed: u64,
) -> (SplitDataset<D, I>, SplitDataset<D, I>)
where
    D: Dataset<I>,
    I: Clone + Send + Sync,
{
    let len = dataset.len();
    let train_size = ((len as f64 * train_ratio) as usize).min(len);
    let shuffled = Arc::new(ShuffledDataset::with_seed(dataset, seed));
    tracing::info!("dataset split: {} train, {} valid", train_size, len - train_size);

    (
        FallbackDataset::new(PartialDataset::new(shuffled.clone(), 0, train_size)),
        FallbackDataset::new(PartialDataset::new(shuffled, train_size, len)),
    )
}

#[derive(Clone)]
pub struct TextImgBatcher<B: Backend> {
    device: B::Device,
    collate: AlignCollate,
    converter: TokenConverter,
}

impl<B: Backend> TextImgBatcher<B> {
    pub fn new(device: B::Device, collate: AlignCollate, converter: TokenConverter) -> Self {
        Self {
            device,
            collate,
            converter,
        }
    }
}

#[derive(Clone, Debug)]
pub struct TextImgBatch<B: Backend> {
    pub images: Tensor<B, 4>,
    pub targets: Tensor<B, 2, Int>,
}

impl<B: Backend> Batcher<TextImgItem, TextImgBatch<B>> for TextImgBatcher<B> {
    fn batch(&self, items: Vec<TextImgItem>) -> TextImgBatch<B> {
        let mut images = Vec::with_capacity(items.len() * self.collate.item_len());
        let mut texts = Vec::with_capacity(items.len());

        for item in &items {
            let Some(img) = item.image() else {
                tracing::warn!("dropping a malformed image buffer from the batch");
                continue;
            };
            images.extend(self.collate.transform(&img));
            texts.push(item.text.as_str());
        }

        let shape = Shape::new([
            texts.len(),
            self.collate.channels,
            self.collate.img_h as usize,
            self.collate.img_w as usize,
        ]);
        let images = Tensor::<B, 4>::from_data(Data::new(images, shape).convert(), &self.device);
        let targets = Tensor::<B, 2, Int>::from_data(
            self.converter.encode_to_tensor_data(&texts, true).convert(),
            &self.device,
        );

        TextImgBatch { images, targets }
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use std::{fs::File, path::Path};

    use image::{Rgb, RgbImage};

    use super::SynthEntry;

    pub fn write_image(path: &Path, width: u32, height: u32) {
        RgbImage::from_pixel(width, height, Rgb([200, 100, 50]))
            .save(path)
            .unwrap();
    }

    pub fn write_pickle(path: &Path, entries: &[SynthEntry]) {
        let mut file = File::create(path).unwrap();
        serde_pickle::to_writer(&mut file, &entries, serde_pickle::SerOptions::new()).unwrap();
    }

    pub fn entry(file_name: &str, txt: &str) -> SynthEntry {
        SynthEntry {
            file_name: file_name.to_string(),
            txt: txt.to_string(),
            char_boxes: None,
        }
    }
}

#[cfg(test)]
mod test {
    use std::fs;

    use burn::backend::{ndarray::NdArrayDevice, NdArray};

    use super::{fixtures::*, *};

    fn build(dir: &Path, input_channel: usize) -> TextImgDataset {
        write_image(&dir.join("a.png"), 64, 32);
        write_image(&dir.join("b.png"), 20, 40);
        fs::write(dir.join("broken.png"), b"not an image").unwrap();
        write_pickle(
            &dir.join("gt.pkl"),
            &[
                entry("a.png", "가  나 다"),
                entry("broken.png", "라"),
                entry("b.png", "다 마"),
            ],
        );

        TextImgDataset::new(dir.join("gt.pkl"), input_channel, dir.join("vocab.txt")).unwrap()
    }

    #[test]
    fn test_dataset_new() {
        let dir = tempfile::tempdir().unwrap();
        let dataset = build(dir.path(), 1);

        assert_eq!(dataset.len(), 3);
        assert_eq!(dataset.texts[0], "가 나 다");
        assert_eq!(dataset.vocab().len(), 5);
        assert_eq!(
            fs::read_to_string(dir.path().join("vocab.txt")).unwrap(),
            "가 나 다 라 마"
        );
    }

    #[test]
    fn test_get_item() {
        let dir = tempfile::tempdir().unwrap();
        let dataset = build(dir.path(), 1);
        let item = dataset.get(0).unwrap();

        assert_eq!(item.channels, 1);
        assert_eq!((item.image_width, item.image_height), (64, 32));
        assert_eq!(item.image_raw.len(), 64 * 32);
        assert!(dataset.get(3).is_none());

        let rgb = build(dir.path(), 3).get(2).unwrap();
        assert_eq!(rgb.channels, 3);
        assert_eq!(rgb.image_raw.len(), 20 * 40 * 3);
    }

    #[test]
    fn test_unreadable_image_falls_back_to_next() {
        let dir = tempfile::tempdir().unwrap();
        let dataset = build(dir.path(), 1);
        assert!(dataset.get(1).is_none());

        let dataset = FallbackDataset::new(dataset);
        assert_eq!(dataset.get(1).unwrap().text, "다 마");
        assert_eq!(dataset.get(2).unwrap().text, "다 마");
        assert!(dataset.get(3).is_none());
    }

    /// Every third sample is unreadable.
    struct Holes(usize);

    impl Dataset<usize> for Holes {
        fn get(&self, index: usize) -> Option<usize> {
            (index < self.0 && index % 3 != 0).then_some(index)
        }

        fn len(&self) -> usize {
            self.0
        }
    }

    #[test]
    fn test_fallback_wraps_around() {
        let dataset = FallbackDataset::new(Holes(4));

        assert_eq!(dataset.get(0), Some(1));
        assert_eq!(dataset.get(3), Some(1));
        assert!(FallbackDataset::new(Holes(1)).get(0).is_none());
    }

    #[test]
    fn test_split_fallback_stays_in_split() {
        let (train, valid) = split_train_valid(Holes(30), 0.7, 3);
        let train_items: Vec<usize> = train.iter().collect();
        let valid_items: Vec<usize> = valid.iter().collect();

        assert_eq!(train_items.len(), 21);
        assert_eq!(valid_items.len(), 9);
        assert!(train_items.iter().all(|item| item % 3 != 0));
        assert!(train_items.iter().all(|item| !valid_items.contains(item)));
    }

    #[test]
    fn test_empty_pickle_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        write_pickle(&dir.path().join("gt.pkl"), &[]);
        let res = TextImgDataset::new(dir.path().join("gt.pkl"), 1, dir.path().join("vocab.txt"));

        assert!(matches!(res, Err(OcrError::EmptyDataset(_))));
    }

    #[test]
    fn test_split_train_valid() {
        let (train, valid) = split_train_valid(
            burn::data::dataset::InMemDataset::new((0..25).collect::<Vec<usize>>()),
            0.9,
            7,
        );

        assert_eq!(train.len(), 22);
        assert_eq!(valid.len(), 3);
        let mut all: Vec<usize> = train.iter().chain(valid.iter()).collect();
        all.sort();
        assert_eq!(all, (0..25).collect::<Vec<_>>());
    }

    #[test]
    fn test_batcher() {
        let dir = tempfile::tempdir().unwrap();
        let dataset = build(dir.path(), 1);
        let converter = TokenConverter::new(dataset.vocab());
        let batcher = TextImgBatcher::<NdArray>::new(
            NdArrayDevice::Cpu,
            AlignCollate::new(32, 100, true, 1),
            converter,
        );

        let items = vec![dataset.get(0).unwrap(), dataset.get(2).unwrap()];
        let batch = batcher.batch(items);

        assert_eq!(batch.images.dims(), [2, 1, 32, 100]);
        assert_eq!(batch.targets.dims(), [2, 5]);
        let first: Vec<i64> = batch.targets.to_data().value;
        assert_eq!(&first[..5], &[1, 4, 5, 6, 2]);
    }
}
