//! # Feedback store
//!
//! User corrections, one JSON file per record. Records are only ever appended: a file is created
//! with `create_new`, so an existing record is never overwritten.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::example::{Example, LabelSet};
use crate::lm::ModelPair;
use crate::optimizer::{Mipro, Optimized, OptimizerConfig, ProgramOptimizer};
use crate::program::ClassifierProgram;

pub const DEFAULT_FEEDBACK_TRIALS: usize = 5;
pub const DEFAULT_FEEDBACK_MAX_DEMOS: usize = 3;
const FEEDBACK_CANDIDATES: usize = 4;

/// On-disk shape of one correction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedbackRecord {
    pub text: String,
    /// The correct label.
    pub label: String,
    pub reasoning: Option<String>,
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub predicted_label: Option<String>,
}

impl FeedbackRecord {
    fn to_example(&self) -> Example {
        Example::new(self.text.clone(), self.label.clone()).with_reasoning(self.reasoning.clone())
    }
}

#[derive(Debug)]
pub struct FeedbackStore {
    dir: PathBuf,
    labels: Option<LabelSet>,
    examples: Vec<Example>,
}

impl FeedbackStore {
    /// Open the store at `dir` and load what is already there. The directory is created if missing.
    ///
    /// With a [LabelSet] attached, corrections must use one of its labels.
    pub fn open(dir: impl Into<PathBuf>, labels: Option<LabelSet>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let mut store = Self {
            dir,
            labels,
            examples: Vec::new(),
        };
        store.load_from_disk()?;
        Ok(store)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn count(&self) -> usize {
        self.examples.len()
    }

    pub fn examples(&self) -> &[Example] {
        &self.examples
    }

    /// Record a correction: `correct_label` is the gold label for `text`.
    ///
    /// Returns the path of the written file.
    pub fn add_feedback(
        &mut self,
        text: &str,
        predicted_label: Option<&str>,
        correct_label: &str,
        reasoning: Option<&str>,
    ) -> Result<PathBuf> {
        let label = match &self.labels {
            Some(labels) => labels.require(correct_label)?.to_string(),
            None => correct_label.to_string(),
        };
        let now = Local::now();
        let record = FeedbackRecord {
            text: text.to_string(),
            label,
            reasoning: reasoning.map(str::trim).filter(|r| !r.is_empty()).map(String::from),
            timestamp: now.format("%Y-%m-%dT%H:%M:%S%.6f").to_string(),
            predicted_label: predicted_label.map(String::from),
        };

        let path = self.persist(&record, now)?;
        self.examples.push(record.to_example());
        info!("Feedback saved to {}", path.display());
        Ok(path)
    }

    fn persist(&self, record: &FeedbackRecord, now: DateTime<Local>) -> Result<PathBuf> {
        let stem = format!("feedback_{}", now.format("%Y%m%d_%H%M%S_%6f"));
        let content = serde_json::to_string_pretty(record)?;
        let mut attempt = 0usize;
        loop {
            let name = match attempt {
                0 => format!("{}.json", stem),
                n => format!("{}_{}.json", stem, n),
            };
            let path = self.dir.join(name);
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    if let Err(e) = file.write_all(content.as_bytes()) {
                        let _ = fs::remove_file(&path);
                        return Err(e.into());
                    }
                    return Ok(path);
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => attempt += 1,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Replace the in-memory records with the files on disk, in filename order.
    ///
    /// Files that cannot be parsed are logged and skipped.
    pub fn load_from_disk(&mut self) -> Result<usize> {
        let mut paths: Vec<PathBuf> = fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().map_or(false, |ext| ext == "json"))
            .collect();
        paths.sort();

        self.examples.clear();
        for path in paths {
            match read_record(&path).and_then(|record| self.checked(record)) {
                Ok(record) => self.examples.push(record.to_example()),
                Err(e) => error!("Error loading feedback from {}: {}", path.display(), e),
            }
        }
        info!("Loaded {} feedback examples", self.examples.len());
        Ok(self.examples.len())
    }

    /// With a [LabelSet] attached, the record's label is replaced by its canonical spelling.
    fn checked(&self, mut record: FeedbackRecord) -> Result<FeedbackRecord> {
        if let Some(labels) = &self.labels {
            record.label = labels.require(&record.label)?.to_string();
        }
        Ok(record)
    }

    /// Re-optimize `base` on the collected corrections.
    ///
    /// The corrections are both the training and the validation set. Without any, `base` comes back
    /// unchanged.
    pub async fn optimize_with_feedback(
        &self,
        base: &ClassifierProgram,
        models: ModelPair,
        num_trials: usize,
        max_demos: usize,
    ) -> Result<Optimized> {
        if self.examples.is_empty() {
            warn!("No feedback examples available for optimization");
            return Ok(Optimized::unchanged(base));
        }
        info!("Optimizing with {} feedback examples...", self.examples.len());
        let config = OptimizerConfig::default()
            .with_num_trials(num_trials)
            .with_num_candidates(FEEDBACK_CANDIDATES)
            .with_max_bootstrapped_demos(max_demos)
            .with_max_labeled_demos(max_demos);
        Mipro::new(config, models)
            .compile(base, &self.examples, &self.examples)
            .await
    }
}

fn read_record(path: &Path) -> Result<FeedbackRecord> {
    let content = fs::read_to_string(path)?;
    let record: FeedbackRecord = serde_json::from_str(&content)?;
    if record.text.trim().is_empty() || record.label.trim().is_empty() {
        return Err(Error::Json(<serde_json::Error as serde::de::Error>::custom("empty text or label")));
    }
    Ok(record)
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::lm::FnModel;

    fn labels() -> LabelSet {
        LabelSet::new(["card_arrival", "card_swallowed", "lost_or_stolen_card"])
    }

    fn json_files(dir: &Path) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| p.extension().map_or(false, |ext| ext == "json"))
            .collect();
        files.sort();
        files
    }

    #[test]
    fn test_add_feedback_appends_one_file_per_record() {
        let tmp = TempDir::new().unwrap();
        let mut store = FeedbackStore::open(tmp.path(), Some(labels())).unwrap();
        assert_eq!(0, store.count());

        for i in 0..3 {
            store
                .add_feedback(&format!("my card got stuck {}", i), Some("card_arrival"), "card_swallowed", None)
                .unwrap();
        }
        assert_eq!(3, store.count());
        assert_eq!(3, json_files(tmp.path()).len());
        assert!(json_files(tmp.path())
            .iter()
            .all(|p| p.file_name().unwrap().to_string_lossy().starts_with("feedback_")));
    }

    #[test]
    fn test_record_format() {
        let tmp = TempDir::new().unwrap();
        let mut store = FeedbackStore::open(tmp.path(), Some(labels())).unwrap();
        let path = store
            .add_feedback("The ATM kept my card", Some("card_arrival"), "card_swallowed", Some("  "))
            .unwrap();

        let value: serde_json::Value = serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!("The ATM kept my card", value["text"]);
        assert_eq!("card_swallowed", value["label"]);
        assert!(value["reasoning"].is_null());
        assert_eq!("card_arrival", value["predicted_label"]);
        let timestamp = value["timestamp"].as_str().unwrap();
        assert!(chrono::NaiveDateTime::parse_from_str(timestamp, "%Y-%m-%dT%H:%M:%S%.f").is_ok());
    }

    #[test]
    fn test_rejects_unknown_label() {
        let tmp = TempDir::new().unwrap();
        let mut store = FeedbackStore::open(tmp.path(), Some(labels())).unwrap();
        let err = store.add_feedback("hello", None, "greeting", None).unwrap_err();
        assert!(matches!(err, Error::UnknownLabel(_)));
        assert_eq!(0, store.count());
        assert!(json_files(tmp.path()).is_empty());
    }

    #[test]
    fn test_round_trip_across_reload() {
        let tmp = TempDir::new().unwrap();
        {
            let mut store = FeedbackStore::open(tmp.path(), Some(labels())).unwrap();
            store.add_feedback("my card never came", None, "card_arrival", Some("waiting for delivery")).unwrap();
            store.add_feedback("someone took my card", None, "Lost Or Stolen Card", None).unwrap();
        }
        fs::write(tmp.path().join("feedback_broken.json"), "{not json").unwrap();
        fs::write(tmp.path().join("notes.txt"), "ignored").unwrap();

        let store = FeedbackStore::open(tmp.path(), Some(labels())).unwrap();
        assert_eq!(2, store.count());
        assert!(store.examples().contains(
            &Example::new("my card never came", "card_arrival").with_reasoning(Some("waiting for delivery"))
        ));
        assert!(store.examples().contains(&Example::new("someone took my card", "lost_or_stolen_card")));
    }

    #[test]
    fn test_loads_records_without_predicted_label() {
        let tmp = TempDir::new().unwrap();
        fs::write(
            tmp.path().join("feedback_20240101_120000_000001.json"),
            r#"{"text": "where is my card", "label": "card_arrival", "reasoning": null, "timestamp": "2024-01-01T12:00:00.000001"}"#,
        )
        .unwrap();
        let store = FeedbackStore::open(tmp.path(), None).unwrap();
        assert_eq!(vec![Example::new("where is my card", "card_arrival")], store.examples());
    }

    #[test]
    fn test_skips_records_with_foreign_labels() {
        let tmp = TempDir::new().unwrap();
        fs::write(
            tmp.path().join("feedback_20240101_120000_000001.json"),
            r#"{"text": "atm kept it", "label": "card_stuck", "reasoning": null, "timestamp": "2024-01-01T12:00:00.000001"}"#,
        )
        .unwrap();
        fs::write(
            tmp.path().join("feedback_20240101_120000_000002.json"),
            r#"{"text": "card is late", "label": "Card Arrival", "reasoning": null, "timestamp": "2024-01-01T12:00:00.000002"}"#,
        )
        .unwrap();

        let store = FeedbackStore::open(tmp.path(), Some(labels())).unwrap();
        assert_eq!(vec![Example::new("card is late", "card_arrival")], store.examples());

        let unchecked = FeedbackStore::open(tmp.path(), None).unwrap();
        assert_eq!(2, unchecked.count());
    }

    #[test]
    fn test_failed_write_leaves_count_unchanged() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("feedback");
        let mut store = FeedbackStore::open(&dir, Some(labels())).unwrap();
        fs::remove_dir_all(&dir).unwrap();

        assert!(store.add_feedback("my card is late", None, "card_arrival", None).is_err());
        assert_eq!(0, store.count());
        assert!(store.examples().is_empty());
    }

    #[tokio::test]
    async fn test_optimize_without_feedback_is_a_no_op() {
        let tmp = TempDir::new().unwrap();
        let store = FeedbackStore::open(tmp.path(), Some(labels())).unwrap();
        let model = FnModel::new("student", |_| Ok("card_arrival".to_string()));
        let base = ClassifierProgram::new(labels(), model.clone().shared());

        let optimized = store
            .optimize_with_feedback(&base, ModelPair::student_only(model.clone().shared()), 5, 3)
            .await
            .unwrap();
        assert!(optimized.report.skipped);
        assert_eq!(base.state(), optimized.program.state());
        assert_eq!(0, model.calls());
    }

    #[tokio::test]
    async fn test_optimize_with_feedback_runs_search() {
        let tmp = TempDir::new().unwrap();
        let mut store = FeedbackStore::open(tmp.path(), Some(labels())).unwrap();
        store.add_feedback("the machine swallowed my card", Some("card_arrival"), "card_swallowed", None).unwrap();
        store.add_feedback("card not delivered yet", None, "card_arrival", None).unwrap();

        let model = FnModel::new("student", |_| Ok("card_arrival".to_string()));
        let base = ClassifierProgram::new(labels(), model.clone().shared());
        let optimized = store
            .optimize_with_feedback(&base, ModelPair::student_only(model.clone().shared()), 5, 3)
            .await
            .unwrap();
        assert!(!optimized.report.skipped);
        assert_eq!(0.5, optimized.report.baseline_score);
        assert!(optimized.report.instruction_candidates <= 4);
        assert!(model.calls() > 0);
    }
}
