use std::{
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
};

use burn::train::{
    checkpoint::{CheckpointingAction, CheckpointingStrategy},
    metric::{
        store::{Aggregate, Direction, EventStoreClient, Split},
        Metric,
    },
};

use crate::error::{OcrError, Result};

/// File extension written by `BinFileRecorder`.
pub const CHECKPOINT_EXTENSION: &str = "bin";

#[derive(Debug, PartialEq)]
pub enum Offer {
    Kept { evicted: Option<usize> },
    Rejected,
}

/// The best `k` epochs seen so far, best first.
#[derive(Clone, Debug)]
pub struct TopK {
    k: usize,
    maximize: bool,
    entries: Vec<(usize, f64)>,
}

impl TopK {
    pub fn new(k: usize, direction: Direction) -> Self {
        Self {
            k,
            maximize: matches!(direction, Direction::Highest),
            entries: Vec::with_capacity(k + 1),
        }
    }

    fn better(&self, a: f64, b: f64) -> bool {
        if self.maximize {
            a > b
        } else {
            a < b
        }
    }

    pub fn offer(&mut self, epoch: usize, score: f64) -> Offer {
        if self.k == 0 || score.is_nan() {
            return Offer::Rejected;
        }
        if self.entries.len() == self.k {
            let (_, worst) = self.entries[self.k - 1];
            if !self.better(score, worst) {
                return Offer::Rejected;
            }
        }

        let position = self
            .entries
            .iter()
            .position(|&(_, kept)| self.better(score, kept))
            .unwrap_or(self.entries.len());
        self.entries.insert(position, (epoch, score));

        let evicted = if self.entries.len() > self.k {
            self.entries.pop().map(|(epoch, _)| epoch)
        } else {
            None
        };

        Offer::Kept { evicted }
    }

    pub fn entries(&self) -> &[(usize, f64)] {
        &self.entries
    }
}

/// Keeps the checkpoints of the `k` best epochs according to a validation
/// metric.
///
/// The ranking is shared through [`TopKCheckpointing::ranking`] so the kept
/// epochs can be exported once fitting is done.
pub struct TopKCheckpointing {
    ranking: Arc<Mutex<TopK>>,
    name: String,
    aggregate: Aggregate,
    split: Split,
}

impl TopKCheckpointing {
    pub fn new<M: Metric>(
        k: usize,
        aggregate: Aggregate,
        direction: Direction,
        split: Split,
    ) -> Self {
        Self {
            ranking: Arc::new(Mutex::new(TopK::new(k, direction))),
            name: M::NAME.to_string(),
            aggregate,
            split,
        }
    }

    pub fn ranking(&self) -> Arc<Mutex<TopK>> {
        self.ranking.clone()
    }
}

impl CheckpointingStrategy for TopKCheckpointing {
    fn checkpointing(
        &mut self,
        epoch: usize,
        collector: &EventStoreClient,
    ) -> Vec<CheckpointingAction> {
        let Some(score) = collector.find_metric(&self.name, epoch, self.aggregate, self.split)
        else {
            tracing::warn!("metric {} missing for epoch {epoch}, no checkpoint saved", self.name);
            return Vec::new();
        };

        let mut ranking = self.ranking.lock().unwrap_or_else(PoisonError::into_inner);
        match ranking.offer(epoch, score) {
            Offer::Kept { evicted } => {
                tracing::info!("epoch {epoch}: {} = {score:.4}, checkpoint kept", self.name);
                let mut actions = vec![CheckpointingAction::Save];
                if let Some(evicted) = evicted {
                    actions.push(CheckpointingAction::Delete(evicted));
                }
                actions
            }
            Offer::Rejected => Vec::new(),
        }
    }
}

pub fn checkpoint_file_name(epoch: usize, score: f64) -> String {
    format!("checkpoints-epoch={epoch:02}-fscore={score:.2}.{CHECKPOINT_EXTENSION}")
}

/// Copies the model checkpoints of the ranked epochs out of the learner's
/// artifact directory under human readable names.
pub fn export_top_k(
    artifact_dir: &Path,
    ranked: &[(usize, f64)],
    out_dir: &Path,
) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(out_dir)?;

    let mut exported = Vec::with_capacity(ranked.len());
    for &(epoch, score) in ranked {
        let source = artifact_dir
            .join("checkpoint")
            .join(format!("model-{epoch}.{CHECKPOINT_EXTENSION}"));
        let target = out_dir.join(checkpoint_file_name(epoch, score));
        fs::copy(&source, &target).map_err(|err| {
            OcrError::Checkpoint(format!(
                "cannot export {} to {}: {err}",
                source.display(),
                target.display()
            ))
        })?;
        tracing::info!("exported {}", target.display());
        exported.push(target);
    }

    Ok(exported)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_top_k_keeps_best() {
        let mut top_k = TopK::new(3, Direction::Highest);

        assert_eq!(top_k.offer(1, 0.2), Offer::Kept { evicted: None });
        assert_eq!(top_k.offer(2, 0.5), Offer::Kept { evicted: None });
        assert_eq!(top_k.offer(3, 0.4), Offer::Kept { evicted: None });
        assert_eq!(top_k.offer(4, 0.1), Offer::Rejected);
        assert_eq!(top_k.offer(5, 0.45), Offer::Kept { evicted: Some(1) });
        assert_eq!(top_k.offer(6, 0.4), Offer::Rejected);
        assert_eq!(top_k.entries(), &[(2, 0.5), (5, 0.45), (3, 0.4)]);
    }

    #[test]
    fn test_top_k_lowest() {
        let mut top_k = TopK::new(1, Direction::Lowest);

        top_k.offer(1, 3.0);
        assert_eq!(top_k.offer(2, 1.0), Offer::Kept { evicted: Some(1) });
        assert_eq!(top_k.offer(3, f64::NAN), Offer::Rejected);
    }

    #[test]
    fn test_zero_k_keeps_nothing() {
        assert_eq!(TopK::new(0, Direction::Highest).offer(1, 1.0), Offer::Rejected);
    }

    #[test]
    fn test_checkpoint_file_name() {
        assert_eq!(
            checkpoint_file_name(3, 0.8765),
            "checkpoints-epoch=03-fscore=0.88.bin"
        );
        assert_eq!(
            checkpoint_file_name(112, 1.0),
            "checkpoints-epoch=112-fscore=1.00.bin"
        );
    }

    #[test]
    fn test_export_top_k() {
        let artifact = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        fs::create_dir_all(artifact.path().join("checkpoint")).unwrap();
        fs::write(artifact.path().join("checkpoint/model-2.bin"), b"two").unwrap();
        fs::write(artifact.path().join("checkpoint/model-5.bin"), b"five").unwrap();

        let out_dir = out.path().join("version_0");
        let exported = export_top_k(artifact.path(), &[(5, 0.91), (2, 0.5)], &out_dir).unwrap();

        assert_eq!(exported.len(), 2);
        assert_eq!(
            fs::read(out_dir.join("checkpoints-epoch=05-fscore=0.91.bin")).unwrap(),
            b"five"
        );
        assert!(export_top_k(artifact.path(), &[(7, 0.1)], &out_dir).is_err());
    }
}
