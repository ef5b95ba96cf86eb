//! # Session
//!
//! What one run of the application works with: the label vocabulary, the models, the feedback
//! store, the saved programs and which of them is selected. Every user action goes through here.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{info, warn};

use crate::config::AppConfig;
use crate::dataset::{load_label_set, CorpusSource, HuggingFaceCorpus, LabelSetOrDefault};
use crate::error::{Error, Result};
use crate::example::{LabelSet, Prediction};
use crate::feedback::FeedbackStore;
use crate::inspector::{compare, extract_prompt, PromptDiff};
use crate::lm::{ModelPair, OpenAiModel, TeacherOrStudent};
use crate::optimizer::{run_full_optimization, FullRunParams, OptimizationReport, Optimized};
use crate::program::ClassifierProgram;
use crate::repository::{timestamped_name, ProgramRepository, BASE_PROGRAM, FEEDBACK_PREFIX, MIPRO_PREFIX};

/// Result of an optimization action.
#[derive(Debug, Clone)]
pub struct OptimizationOutcome {
    /// Name the new program was saved under. `None` when the optimizer had nothing to work with.
    pub saved_as: Option<String>,
    pub report: OptimizationReport,
}

pub struct Session {
    labels: LabelSet,
    models: ModelPair,
    feedback: FeedbackStore,
    repository: ProgramRepository,
    programs: BTreeMap<String, ClassifierProgram>,
    selected: String,
}

impl Session {
    pub fn new(
        labels: LabelSet,
        models: ModelPair,
        program_dir: impl Into<PathBuf>,
        feedback_dir: impl Into<PathBuf>,
    ) -> Result<Self> {
        let feedback = FeedbackStore::open(feedback_dir, Some(labels.clone()))?;
        let mut session = Self {
            labels,
            models,
            feedback,
            repository: ProgramRepository::new(program_dir),
            programs: BTreeMap::new(),
            selected: BASE_PROGRAM.to_string(),
        };
        session.refresh_programs()?;
        Ok(session)
    }

    /// Set up a session against the configured backend and the remote label vocabulary.
    pub async fn start(config: &AppConfig) -> Result<Self> {
        let corpus = HuggingFaceCorpus::banking77(config.dataset_api_base.clone());
        let labels = match load_label_set(&corpus).await {
            LabelSetOrDefault::Loaded(labels) => labels,
            fallback @ LabelSetOrDefault::Fallback { .. } => {
                warn!("Using the built-in label vocabulary");
                fallback.into_label_set()
            }
        };
        info!("Loaded {} intent labels", labels.len());

        let student = Arc::new(OpenAiModel::connect(&config.backend)?);
        let models = TeacherOrStudent::acquire(config.teacher_backend().as_ref()).into_pair(student);
        Self::new(labels, models, &config.program_dir, &config.feedback_dir)
    }

    pub fn labels(&self) -> &LabelSet {
        &self.labels
    }

    pub fn models(&self) -> &ModelPair {
        &self.models
    }

    pub fn feedback(&self) -> &FeedbackStore {
        &self.feedback
    }

    pub fn program_dir(&self) -> &Path {
        self.repository.dir()
    }

    /// Reload every saved program. A program that fails to load is skipped with a warning.
    ///
    /// `base_program` is always present afterwards, and the selection falls back to it when the
    /// selected program is gone.
    pub fn refresh_programs(&mut self) -> Result<()> {
        let mut programs = BTreeMap::new();
        for name in self.repository.list_available()? {
            match self.repository.load(&name, &self.labels, self.models.student.clone()) {
                Ok(program) => {
                    programs.insert(name, program);
                }
                Err(e) => warn!("Could not load {}: {}", name, e),
            }
        }
        programs
            .entry(BASE_PROGRAM.to_string())
            .or_insert_with(|| ClassifierProgram::new(self.labels.clone(), self.models.student.clone()));
        self.programs = programs;
        if !self.programs.contains_key(&self.selected) {
            self.selected = BASE_PROGRAM.to_string();
        }
        Ok(())
    }

    pub fn program_names(&self) -> impl Iterator<Item = &str> {
        self.programs.keys().map(String::as_str)
    }

    pub fn selected_name(&self) -> &str {
        &self.selected
    }

    pub fn program(&self, name: &str) -> Result<&ClassifierProgram> {
        self.programs.get(name).ok_or_else(|| Error::ProgramNotFound {
            name: name.to_string(),
            path: self.repository.path_of(name),
        })
    }

    pub fn current(&self) -> Result<&ClassifierProgram> {
        self.program(&self.selected)
    }

    pub fn select(&mut self, name: &str) -> Result<()> {
        self.program(name)?;
        self.selected = name.to_string();
        info!("Selected program {}", name);
        Ok(())
    }

    /// Classify with the selected program. Blank input does nothing.
    pub async fn classify(&self, text: &str) -> Result<Option<Prediction>> {
        if text.trim().is_empty() {
            warn!("Please enter text to classify.");
            return Ok(None);
        }
        self.current()?.classify(text).await.map(Some)
    }

    /// Record that `text` should have been classified as `correct_label`. Blank input does nothing.
    pub fn submit_feedback(
        &mut self,
        text: &str,
        predicted_label: Option<&str>,
        correct_label: &str,
        reasoning: Option<&str>,
    ) -> Result<Option<PathBuf>> {
        if text.trim().is_empty() {
            warn!("No text to attach the feedback to");
            return Ok(None);
        }
        self.feedback
            .add_feedback(text.trim(), predicted_label, correct_label, reasoning)
            .map(Some)
    }

    /// Optimize the program `name` on the labeled corpus and save the result as `mipro_optimized_<time>`.
    pub async fn optimize_full(
        &mut self,
        name: &str,
        source: &dyn CorpusSource,
        params: FullRunParams,
    ) -> Result<OptimizationOutcome> {
        let base = self.program(name)?.clone();
        let optimized = run_full_optimization(&base, source, self.models.clone(), params).await?;
        self.keep(optimized, MIPRO_PREFIX)
    }

    /// Optimize the selected program on the collected feedback and save the result as
    /// `feedback_optimized_<time>`.
    pub async fn optimize_feedback(&mut self, num_trials: usize, max_demos: usize) -> Result<OptimizationOutcome> {
        let base = self.current()?.clone();
        let optimized = self
            .feedback
            .optimize_with_feedback(&base, self.models.clone(), num_trials, max_demos)
            .await?;
        self.keep(optimized, FEEDBACK_PREFIX)
    }

    fn keep(&mut self, optimized: Optimized, prefix: &str) -> Result<OptimizationOutcome> {
        if optimized.report.skipped {
            return Ok(OptimizationOutcome { saved_as: None, report: optimized.report });
        }
        // Only save what this session can load back.
        let program = ClassifierProgram::new(self.labels.clone(), self.models.student.clone())
            .with_state(optimized.program.state())?;
        let name = timestamped_name(prefix);
        self.repository.save(&program, &name)?;
        self.refresh_programs()?;
        self.select(&name)?;
        info!("Created new program: '{}'", name);
        Ok(OptimizationOutcome { saved_as: Some(name), report: optimized.report })
    }

    /// Human-readable configuration of the program `name`.
    pub fn inspect(&self, name: &str) -> Result<String> {
        Ok(extract_prompt(self.program(name)?))
    }

    pub fn compare(&self, a: &str, b: &str) -> Result<PromptDiff> {
        Ok(compare(self.program(a)?, self.program(b)?))
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;

    use super::*;
    use crate::dataset::StaticCorpus;
    use crate::example::Example;
    use crate::lm::FnModel;
    use crate::program::Describe;

    fn labels() -> LabelSet {
        LabelSet::new(["card_arrival", "card_swallowed", "exchange_rate"])
    }

    fn session(tmp: &TempDir, reply: &'static str) -> Session {
        let model = FnModel::new("scripted", move |_| Ok(reply.to_string())).shared();
        Session::new(labels(), ModelPair::student_only(model), tmp.path().join("programs"), tmp.path().join("feedback"))
            .unwrap()
    }

    #[test]
    fn test_base_program_always_available() {
        let tmp = TempDir::new().unwrap();
        let session = session(&tmp, "card_arrival");
        assert_eq!(vec![BASE_PROGRAM], session.program_names().collect::<Vec<_>>());
        assert_eq!(BASE_PROGRAM, session.selected_name());
        assert!(!tmp.path().join("programs").join("base_program.json").exists());
        assert!(session.inspect(BASE_PROGRAM).unwrap().contains("Labels (3)"));
    }

    #[test]
    fn test_broken_program_is_skipped() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("programs");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("broken.json"), "[]").unwrap();
        let session = session(&tmp, "card_arrival");
        assert_eq!(vec![BASE_PROGRAM], session.program_names().collect::<Vec<_>>());
        assert!(session.program("broken").unwrap_err().is_not_found());
    }

    #[test]
    fn test_select_unknown_program() {
        let tmp = TempDir::new().unwrap();
        let mut session = session(&tmp, "card_arrival");
        assert!(session.select("missing").unwrap_err().is_not_found());
        assert_eq!(BASE_PROGRAM, session.selected_name());
    }

    #[tokio::test]
    async fn test_classify_and_feedback() {
        let tmp = TempDir::new().unwrap();
        let mut session = session(&tmp, "{\"reasoning\": \"stuck in ATM\", \"label\": \"card_swallowed\"}");

        assert_eq!(None, session.classify("   ").await.unwrap());
        let prediction = session.classify("My card got stuck").await.unwrap().unwrap();
        assert_eq!("card_swallowed", prediction.label);

        assert_eq!(None, session.submit_feedback("", Some("card_swallowed"), "card_arrival", None).unwrap());
        session
            .submit_feedback("My card got stuck", Some(&prediction.label), "card_swallowed", Some("right"))
            .unwrap()
            .unwrap();
        assert_eq!(1, session.feedback().count());
    }

    #[tokio::test]
    async fn test_optimize_feedback_without_feedback_saves_nothing() {
        let tmp = TempDir::new().unwrap();
        let mut session = session(&tmp, "card_arrival");
        let outcome = session.optimize_feedback(5, 3).await.unwrap();
        assert_eq!(None, outcome.saved_as);
        assert!(outcome.report.skipped);
        assert_eq!(vec![BASE_PROGRAM], session.program_names().collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_optimize_feedback_saves_and_selects() {
        let tmp = TempDir::new().unwrap();
        let mut session = session(&tmp, "card_arrival");
        session.submit_feedback("card still not here", None, "card_arrival", None).unwrap();
        session.submit_feedback("ATM took it", Some("card_arrival"), "card_swallowed", None).unwrap();

        let outcome = session.optimize_feedback(3, 2).await.unwrap();
        let name = outcome.saved_as.unwrap();
        assert!(name.starts_with("feedback_optimized_"));
        assert_eq!(name, session.selected_name());
        assert!(session.program_dir().join(format!("{}.json", name)).is_file());
        assert!(session.program_names().any(|n| n == BASE_PROGRAM));
    }

    #[tokio::test]
    async fn test_foreign_feedback_label_never_reaches_a_saved_program() {
        let tmp = TempDir::new().unwrap();
        let feedback_dir = tmp.path().join("feedback");
        fs::create_dir_all(&feedback_dir).unwrap();
        fs::write(
            feedback_dir.join("feedback_20240101_120000_000001.json"),
            r#"{"text": "the ATM kept it", "label": "card_stuck", "reasoning": null, "timestamp": "2024-01-01T12:00:00.000001"}"#,
        )
        .unwrap();
        let mut session = session(&tmp, "card_arrival");
        assert_eq!(0, session.feedback().count());
        session.submit_feedback("card still not here", None, "card_arrival", None).unwrap();

        let outcome = session.optimize_feedback(5, 3).await.unwrap();
        let name = outcome.saved_as.unwrap();
        assert_eq!(name, session.selected_name());
        assert!(session.current().unwrap().demonstrations().iter().all(|d| d.label != "card_stuck"));
    }

    #[test]
    fn test_keep_refuses_program_with_unknown_labels() {
        let tmp = TempDir::new().unwrap();
        let mut session = session(&tmp, "card_arrival");
        let foreign = session
            .current()
            .unwrap()
            .with_configuration("Be precise.", vec![Example::new("the ATM kept it", "card_stuck")]);
        let optimized = Optimized {
            program: foreign,
            report: OptimizationReport::default(),
        };

        assert!(matches!(session.keep(optimized, FEEDBACK_PREFIX), Err(Error::UnknownLabel(_))));
        assert!(!session.program_dir().exists());
        assert_eq!(vec![BASE_PROGRAM], session.program_names().collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_optimize_full_with_unreachable_corpus_is_a_no_op() {
        let tmp = TempDir::new().unwrap();
        let mut session = session(&tmp, "card_arrival");
        let corpus = StaticCorpus::unavailable("offline");
        let outcome = session
            .optimize_full(BASE_PROGRAM, &corpus, FullRunParams::default())
            .await
            .unwrap();
        assert_eq!(None, outcome.saved_as);
    }

    #[test]
    fn test_compare_saved_program() {
        let tmp = TempDir::new().unwrap();
        let mut session = session(&tmp, "card_arrival");
        let tuned = session
            .current()
            .unwrap()
            .with_configuration("Be precise.", vec![Example::new("ATM ate my card", "card_swallowed")]);
        ProgramRepository::new(session.program_dir()).save(&tuned, "tuned").unwrap();
        session.refresh_programs().unwrap();

        let diff = session.compare("tuned", BASE_PROGRAM).unwrap();
        assert!(!diff.is_identical());
        assert!(diff.render_inline().contains("Be precise."));
    }
}
