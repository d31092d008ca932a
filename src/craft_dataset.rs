use std::path::{Path, PathBuf};

use burn::{
    data::{dataloader::batcher::Batcher, dataset::Dataset},
    tensor::{backend::Backend, Data, Shape, Tensor},
};
use image::RgbImage;
use serde::{Deserialize, Serialize};

use crate::{
    dataset::{base_dir, load_entries, readable},
    error::{OcrError, Result},
    image_data::resize_to_canvas,
    utils::score_map::{affinity_quads, scale_quad, Quad, ScoreMap},
};

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct CraftItem {
    pub image_raw: Vec<u8>,
    pub image_height: u32,
    pub image_width: u32,
    pub char_boxes: Vec<Quad>,
    pub word_lengths: Vec<usize>,
}

struct CraftSample {
    file_name: String,
    char_boxes: Vec<Quad>,
    word_lengths: Vec<usize>,
}

fn to_quads(file_name: &str, boxes: &[Vec<Vec<f32>>]) -> Result<Vec<Quad>> {
    let invalid = |reason: String| OcrError::InvalidSample {
        file_name: file_name.to_string(),
        reason,
    };

    boxes
        .iter()
        .enumerate()
        .map(|(idx, points)| {
            if points.len() != 4 || points.iter().any(|p| p.len() != 2) {
                return Err(invalid(format!("character box {idx} is not four [x, y] points")));
            }
            Ok([
                (points[0][0], points[0][1]),
                (points[1][0], points[1][1]),
                (points[2][0], points[2][1]),
                (points[3][0], points[3][1]),
            ])
        })
        .collect()
}

/// Character-box annotated images for the region/affinity detector.
pub struct CraftDataset {
    base_path: PathBuf,
    samples: Vec<CraftSample>,
}

impl CraftDataset {
    pub fn new<P: AsRef<Path>>(data_path: P) -> Result<Self> {
        let data_path = data_path.as_ref();
        let mut samples = Vec::new();
        for entry in load_entries(data_path)? {
            let Some(boxes) = entry.char_boxes.as_deref() else {
                tracing::warn!("{} has no character boxes, skipped", entry.file_name);
                continue;
            };
            match to_quads(&entry.file_name, boxes) {
                Ok(char_boxes) => samples.push(CraftSample {
                    word_lengths: entry
                        .txt
                        .split_whitespace()
                        .map(|word| word.chars().count())
                        .collect(),
                    file_name: entry.file_name,
                    char_boxes,
                }),
                Err(err) => tracing::warn!("{err}"),
            }
        }

        if samples.is_empty() {
            return Err(OcrError::EmptyDataset(data_path.to_path_buf()));
        }

        Ok(Self {
            base_path: base_dir(data_path),
            samples,
        })
    }

    fn open(&self, index: usize) -> Result<CraftItem> {
        let sample = &self.samples[index];
        let img = image::open(self.base_path.join(&sample.file_name))?.to_rgb8();

        Ok(CraftItem {
            image_height: img.height(),
            image_width: img.width(),
            image_raw: img.into_raw(),
            char_boxes: sample.char_boxes.clone(),
            word_lengths: sample.word_lengths.clone(),
        })
    }
}

impl Dataset<CraftItem> for CraftDataset {
    fn get(&self, index: usize) -> Option<CraftItem> {
        if index >= self.len() {
            return None;
        }

        readable(index, self.open(index))
    }

    fn len(&self) -> usize {
        self.samples.len()
    }
}

#[derive(Clone)]
pub struct CraftBatcher<B: Backend> {
    device: B::Device,
    canvas_size: u32,
}

impl<B: Backend> CraftBatcher<B> {
    /// `canvas_size` is rounded down to an even number so the score maps
    /// are exactly half the input.
    pub fn new(device: B::Device, canvas_size: u32) -> Self {
        Self {
            device,
            canvas_size: (canvas_size / 2 * 2).max(2),
        }
    }
}

#[derive(Clone, Debug)]
pub struct CraftBatch<B: Backend> {
    pub images: Tensor<B, 4>,
    /// Region score in channel 0, affinity score in channel 1.
    pub score_maps: Tensor<B, 4>,
}

impl<B: Backend> Batcher<CraftItem, CraftBatch<B>> for CraftBatcher<B> {
    fn batch(&self, items: Vec<CraftItem>) -> CraftBatch<B> {
        let canvas = self.canvas_size as usize;
        let half = canvas / 2;
        let mut images = Vec::with_capacity(items.len() * 3 * canvas * canvas);
        let mut score_maps = Vec::with_capacity(items.len() * 2 * half * half);
        let mut batch_size = 0;

        for item in items {
            let Some(img) = RgbImage::from_raw(item.image_width, item.image_height, item.image_raw)
            else {
                tracing::warn!("dropping a malformed image buffer from the batch");
                continue;
            };
            let (pixels, scale) = resize_to_canvas(&img, self.canvas_size);
            images.extend(pixels);

            let char_quads: Vec<Quad> = item
                .char_boxes
                .iter()
                .map(|quad| scale_quad(quad, scale * 0.5))
                .collect();
            let mut region = ScoreMap::new(half, half);
            for quad in &char_quads {
                region.draw_gaussian(quad);
            }
            let mut affinity = ScoreMap::new(half, half);
            match affinity_quads(&char_quads, &item.word_lengths) {
                Some(links) => {
                    for quad in &links {
                        affinity.draw_gaussian(quad);
                    }
                }
                None => tracing::warn!(
                    "{} character boxes do not match word lengths {:?}, affinity left empty",
                    char_quads.len(),
                    item.word_lengths
                ),
            }

            score_maps.extend(region.data);
            score_maps.extend(affinity.data);
            batch_size += 1;
        }

        let images = Tensor::<B, 4>::from_data(
            Data::new(images, Shape::new([batch_size, 3, canvas, canvas])).convert(),
            &self.device,
        );
        let score_maps = Tensor::<B, 4>::from_data(
            Data::new(score_maps, Shape::new([batch_size, 2, half, half])).convert(),
            &self.device,
        );

        CraftBatch { images, score_maps }
    }
}

#[cfg(test)]
mod test {
    use burn::backend::{ndarray::NdArrayDevice, NdArray};

    use super::*;
    use crate::dataset::{
        fixtures::{entry, write_image, write_pickle},
        SynthEntry,
    };

    fn boxed(file_name: &str, txt: &str, boxes: Vec<Vec<Vec<f32>>>) -> SynthEntry {
        SynthEntry {
            char_boxes: Some(boxes),
            ..entry(file_name, txt)
        }
    }

    fn square(x: f32, y: f32, size: f32) -> Vec<Vec<f32>> {
        vec![
            vec![x, y],
            vec![x + size, y],
            vec![x + size, y + size],
            vec![x, y + size],
        ]
    }

    fn build(dir: &Path) -> CraftDataset {
        write_image(&dir.join("a.png"), 64, 32);
        write_pickle(
            &dir.join("gt.pkl"),
            &[
                boxed(
                    "a.png",
                    "ab c",
                    vec![
                        square(0.0, 0.0, 16.0),
                        square(16.0, 0.0, 16.0),
                        square(40.0, 0.0, 16.0),
                    ],
                ),
                entry("no-boxes.png", "x"),
                boxed("bad.png", "y", vec![vec![vec![1.0, 2.0]]]),
            ],
        );

        CraftDataset::new(dir.join("gt.pkl")).unwrap()
    }

    #[test]
    fn test_dataset_keeps_boxed_entries() {
        let dir = tempfile::tempdir().unwrap();
        let dataset = build(dir.path());

        assert_eq!(dataset.len(), 1);
        let item = dataset.get(0).unwrap();
        assert_eq!(item.word_lengths, vec![2, 1]);
        assert_eq!(item.char_boxes[1][0], (16.0, 0.0));
        assert_eq!(item.image_raw.len(), 64 * 32 * 3);
    }

    #[test]
    fn test_batcher_renders_score_maps() {
        let dir = tempfile::tempdir().unwrap();
        let dataset = build(dir.path());
        let batcher = CraftBatcher::<NdArray>::new(NdArrayDevice::Cpu, 64);
        let batch = batcher.batch(vec![dataset.get(0).unwrap(), dataset.get(0).unwrap()]);

        assert_eq!(batch.images.dims(), [2, 3, 64, 64]);
        assert_eq!(batch.score_maps.dims(), [2, 2, 32, 32]);

        let maps: Vec<f32> = batch.score_maps.to_data().value;
        let region_peak = maps[..32 * 32].iter().cloned().fold(0.0, f32::max);
        let affinity_peak = maps[32 * 32..2 * 32 * 32].iter().cloned().fold(0.0, f32::max);
        assert!(region_peak > 0.9);
        assert!(affinity_peak > 0.5);
        // nothing below the scaled image
        assert!(maps[31 * 32..32 * 32].iter().all(|&v| v == 0.0));
    }
}
