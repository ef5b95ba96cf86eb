//! # Program optimizer
//!
//! [Mipro] jointly searches over instructions and demonstration sets:
//!
//! 1. Score the input program on the validation set (the baseline).
//! 2. Bootstrap demonstrations: run the student on training examples and keep the traces the
//!    metric accepts. Build candidate demo sets from those traces and from labeled examples.
//! 3. Ask the teacher model for alternative instructions. The input instruction is always kept.
//! 4. Run a budget of trials. Each trial picks an (instruction, demo set) pair, randomly during
//!    warmup and from a TPE-style sampler afterwards, and scores it on the validation set.
//! 5. Return the best configuration. The baseline wins ties, so a search that finds nothing better
//!    returns a program equivalent to its input.
//!
//! An empty training or validation set makes the optimizer a no-op.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use lazy_static::lazy_static;
use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use regex::Regex;

use crate::dataset::{build_datasets, CorpusSource, DEFAULT_DEV_SIZE, DEFAULT_TEST_SIZE, DEFAULT_TRAIN_SIZE};
use crate::error::{Error, Result};
use crate::example::{Example, LabelSet};
use crate::lm::{CompletionRequest, ModelPair};
use crate::metric::{exact_match, mean, Metric};
use crate::program::{ClassifierProgram, Describe};

lazy_static! {
    static ref NUMBERED_LINE_RE: Regex = Regex::new(r"^\s*\d+\s*[.)]\s*(.+?)\s*$").unwrap();
}

const PROPOSER_SYSTEM: &str = "You are an expert prompt engineer. You write instructions for a language model \
that reads a customer's message to a bank and picks the intent label that describes it.";

/// How many labeled examples the instruction proposer gets to see.
const PROPOSAL_SAMPLE_SIZE: usize = 10;
/// How many label names the instruction proposer gets to see.
const PROPOSAL_LABEL_PREVIEW: usize = 20;

/// Search budget.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OptimizerConfig {
    /// Scored (instruction, demo set) trials after the baseline.
    pub num_trials: usize,
    /// Instruction candidates, and demo set candidates.
    pub num_candidates: usize,
    pub max_bootstrapped_demos: usize,
    pub max_labeled_demos: usize,
    pub seed: u64,
    pub proposal_temperature: f32,
    /// Fraction of trials sampled uniformly before the sampler takes over.
    pub warmup_fraction: f32,
    /// Fraction of trials the sampler counts as good.
    pub gamma: f32,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            num_trials: 10,
            num_candidates: 10,
            max_bootstrapped_demos: 3,
            max_labeled_demos: 5,
            seed: 9,
            proposal_temperature: 0.7,
            warmup_fraction: 0.2,
            gamma: 0.25,
        }
    }
}

impl OptimizerConfig {
    pub const fn with_num_trials(mut self, n: usize) -> Self {
        self.num_trials = n;
        self
    }

    pub const fn with_num_candidates(mut self, n: usize) -> Self {
        self.num_candidates = n;
        self
    }

    pub const fn with_max_bootstrapped_demos(mut self, n: usize) -> Self {
        self.max_bootstrapped_demos = n;
        self
    }

    pub const fn with_max_labeled_demos(mut self, n: usize) -> Self {
        self.max_labeled_demos = n;
        self
    }

    pub const fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}

/// One scored configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct TrialRecord {
    pub instruction_idx: usize,
    pub demo_set_idx: usize,
    pub score: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct OptimizationReport {
    /// True when the optimizer returned its input without searching.
    pub skipped: bool,
    pub baseline_score: f64,
    pub best_score: f64,
    pub instruction_candidates: usize,
    pub demo_set_candidates: usize,
    pub trials: Vec<TrialRecord>,
}

/// The program an optimizer settled on, and how it got there.
#[derive(Debug, Clone)]
pub struct Optimized {
    pub program: ClassifierProgram,
    pub report: OptimizationReport,
}

impl Optimized {
    pub fn unchanged(program: &ClassifierProgram) -> Self {
        Self {
            program: program.clone(),
            report: OptimizationReport { skipped: true, ..OptimizationReport::default() },
        }
    }

    pub fn improved(&self) -> bool {
        self.report.best_score > self.report.baseline_score
    }
}

/// Accuracy-maximizing program synthesis under a trial budget.
#[async_trait]
pub trait ProgramOptimizer: Send + Sync {
    async fn compile(
        &self,
        student: &ClassifierProgram,
        trainset: &[Example],
        valset: &[Example],
    ) -> Result<Optimized>;
}

/// Categorical TPE: favors values that show up in the best `gamma` fraction of trials.
pub struct TpeSampler {
    history: Vec<TrialRecord>,
    gamma: f32,
}

impl TpeSampler {
    pub fn new(gamma: f32) -> Self {
        Self { history: Vec::new(), gamma }
    }

    pub fn record(&mut self, trial: TrialRecord) {
        self.history.push(trial);
    }

    /// Suggest an (instruction, demo set) pair.
    pub fn suggest(&self, num_instructions: usize, num_demo_sets: usize, rng: &mut StdRng) -> (usize, usize) {
        if self.history.is_empty() {
            return (rng.gen_range(0..num_instructions), rng.gen_range(0..num_demo_sets));
        }
        let mut sorted: Vec<&TrialRecord> = self.history.iter().collect();
        sorted.sort_by(|a, b| b.score.total_cmp(&a.score));
        let n_good = ((sorted.len() as f32 * self.gamma).ceil() as usize).max(1);
        let (good, bad) = sorted.split_at(n_good);

        let instruction = Self::sample(num_instructions, good, bad, |t| t.instruction_idx, rng);
        let demo_set = Self::sample(num_demo_sets, good, bad, |t| t.demo_set_idx, rng);
        (instruction, demo_set)
    }

    /// Sample proportionally to (good + 1) / (bad + 1).
    fn sample(
        n: usize,
        good: &[&TrialRecord],
        bad: &[&TrialRecord],
        key: impl Fn(&TrialRecord) -> usize,
        rng: &mut StdRng,
    ) -> usize {
        let mut good_counts = vec![0usize; n];
        let mut bad_counts = vec![0usize; n];
        good.iter().filter(|t| key(t) < n).for_each(|t| good_counts[key(t)] += 1);
        bad.iter().filter(|t| key(t) < n).for_each(|t| bad_counts[key(t)] += 1);
        let weights: Vec<f64> = good_counts
            .iter()
            .zip(&bad_counts)
            .map(|(&g, &b)| (g as f64 + 1.0) / (b as f64 + 1.0))
            .collect();
        let total: f64 = weights.iter().sum();
        let mut threshold = rng.gen_range(0.0..total);
        for (idx, weight) in weights.iter().enumerate() {
            if threshold < *weight {
                return idx;
            }
            threshold -= weight;
        }
        n - 1
    }
}

/// Multi-instruction prompt optimization over a [ClassifierProgram].
pub struct Mipro {
    config: OptimizerConfig,
    models: ModelPair,
    metric: Metric,
}

impl Mipro {
    pub fn new(config: OptimizerConfig, models: ModelPair) -> Self {
        Self { config, models, metric: exact_match }
    }

    pub fn with_metric(mut self, metric: Metric) -> Self {
        self.metric = metric;
        self
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    /// Mean metric of `program` over `examples`.
    ///
    /// A reply outside the output contract scores 0; a backend failure aborts the evaluation.
    pub async fn evaluate(&self, program: &ClassifierProgram, examples: &[Example]) -> Result<f64> {
        let mut scores = Vec::with_capacity(examples.len());
        for example in examples {
            let score = match program.classify(&example.text).await {
                Ok(prediction) => (self.metric)(example, &prediction),
                Err(Error::MalformedOutput { reason, .. }) => {
                    debug!("unusable reply while scoring `{}`: {}", example.text, reason);
                    0.0
                }
                Err(e) => return Err(e),
            };
            scores.push(score);
        }
        Ok(mean(&scores))
    }

    /// Run the student over shuffled training examples and keep up to `target` accepted traces.
    async fn bootstrap_traces(
        &self,
        student: &ClassifierProgram,
        shuffled: &[Example],
        target: usize,
    ) -> Result<Vec<Example>> {
        let mut traces = Vec::with_capacity(target);
        if target == 0 {
            return Ok(traces);
        }
        for example in shuffled {
            let prediction = match student.classify(&example.text).await {
                Ok(prediction) => prediction,
                Err(Error::MalformedOutput { reason, .. }) => {
                    debug!("no trace for `{}`: {}", example.text, reason);
                    continue;
                }
                Err(e) => return Err(e),
            };
            if (self.metric)(example, &prediction) >= 1.0 {
                let reasoning = Some(prediction.reasoning).filter(|r| !r.is_empty()).or_else(|| example.reasoning.clone());
                traces.push(Example::new(example.text.clone(), example.label.clone()).with_reasoning(reasoning));
                if traces.len() >= target {
                    break;
                }
            }
        }
        info!("Bootstrapped {} demonstration traces from {} training examples", traces.len(), shuffled.len());
        Ok(traces)
    }

    /// Candidate demo sets: zero-shot, labeled-only, then bootstrapped traces topped up with labeled examples.
    pub async fn demo_candidates(
        &self,
        student: &ClassifierProgram,
        trainset: &[Example],
        rng: &mut StdRng,
    ) -> Result<Vec<Vec<Example>>> {
        let num_sets = self.config.num_candidates.max(1);
        let max_boot = self.config.max_bootstrapped_demos;
        let max_labeled = self.config.max_labeled_demos;

        let mut shuffled = trainset.to_vec();
        shuffled.shuffle(rng);

        let mut sets: Vec<Vec<Example>> = vec![Vec::new()];
        if num_sets > 1 && max_labeled > 0 {
            sets.push(shuffled.iter().take(max_labeled).cloned().collect());
        }
        if sets.len() < num_sets && max_boot > 0 {
            let pool_target = max_boot * (num_sets - sets.len());
            let traces = self.bootstrap_traces(student, &shuffled, pool_target).await?;
            if !traces.is_empty() {
                sets.push(traces.iter().take(max_boot).cloned().collect());
            }
            while !traces.is_empty() && sets.len() < num_sets {
                let size = rng.gen_range(1..=max_boot.min(traces.len()));
                let mut demos: Vec<Example> = traces.choose_multiple(rng, size).cloned().collect();
                let traced: HashSet<&str> = demos.iter().map(|d| d.text.as_str()).collect();
                let fill = max_labeled.saturating_sub(demos.len());
                let labeled: Vec<Example> = shuffled
                    .iter()
                    .filter(|e| !traced.contains(e.text.as_str()))
                    .cloned()
                    .collect::<Vec<_>>()
                    .choose_multiple(rng, fill)
                    .cloned()
                    .collect();
                demos.extend(labeled);
                sets.push(demos);
            }
        }
        let mut seen = HashSet::new();
        sets.retain(|set| seen.insert(set.clone()));
        sets.truncate(num_sets);
        Ok(sets)
    }

    /// Instruction candidates: the student's own instruction followed by the teacher's proposals.
    pub async fn propose_instructions(
        &self,
        student: &ClassifierProgram,
        trainset: &[Example],
        rng: &mut StdRng,
    ) -> Result<Vec<String>> {
        let base = student.instruction().to_string();
        let wanted = self.config.num_candidates.saturating_sub(1);
        let mut instructions = vec![base.clone()];
        if wanted == 0 {
            return Ok(instructions);
        }

        let labels: &LabelSet = student.label_set();
        let preview: Vec<&str> = labels.iter().take(PROPOSAL_LABEL_PREVIEW).collect();
        let sample: Vec<&Example> = trainset.choose_multiple(rng, PROPOSAL_SAMPLE_SIZE).collect();
        let mut user = format!(
            "Task signature: {}\nThere are {} labels, for example: {}.\n\nCurrent instruction:\n{}\n\nLabeled data:\n",
            student.signature(),
            labels.len(),
            preview.join(", "),
            base
        );
        for example in sample {
            user.push_str(&format!("- \"{}\" => {}\n", example.text, example.label));
        }
        user.push_str(&format!(
            "\nWrite {} alternative instructions for this task. Each must be self-contained, specific to \
             banking intents, and take a different angle. Answer with a numbered list, one instruction per line:\n1. ",
            wanted
        ));

        let request = CompletionRequest::new(PROPOSER_SYSTEM, user).with_temperature(self.config.proposal_temperature);
        let reply = self.models.teacher.complete(&request).await?;
        for proposal in parse_numbered_list(&reply) {
            if instructions.len() > wanted {
                break;
            }
            if !instructions.contains(&proposal) {
                instructions.push(proposal);
            }
        }
        info!("Proposed {} instruction candidates with {}", instructions.len() - 1, self.models.teacher.model_name());
        Ok(instructions)
    }
}

/// Items of a numbered list, stripped of numbering and quotes.
///
/// The proposer prompt ends with `1. `, so a first line without a number counts as item one.
pub fn parse_numbered_list(reply: &str) -> Vec<String> {
    let mut items = Vec::new();
    for (idx, line) in reply.lines().enumerate() {
        let item = match NUMBERED_LINE_RE.captures(line) {
            Some(captures) => captures[1].to_string(),
            None if idx == 0 => line.trim().to_string(),
            None => continue,
        };
        let item = item.trim_matches(|c| c == '"' || c == '\'' || c == '*').trim().to_string();
        if !item.is_empty() {
            items.push(item);
        }
    }
    items
}

#[async_trait]
impl ProgramOptimizer for Mipro {
    async fn compile(
        &self,
        student: &ClassifierProgram,
        trainset: &[Example],
        valset: &[Example],
    ) -> Result<Optimized> {
        if trainset.is_empty() || valset.is_empty() {
            warn!(
                "Nothing to optimize on ({} training, {} validation examples). Returning the input program.",
                trainset.len(),
                valset.len()
            );
            return Ok(Optimized::unchanged(student));
        }
        let config = &self.config;
        let mut rng = StdRng::seed_from_u64(config.seed);
        let student = student.with_model(self.models.student.clone());

        let baseline_score = self.evaluate(&student, valset).await?;
        info!("Baseline score: {:.3} on {} validation examples", baseline_score, valset.len());

        let demo_sets = self.demo_candidates(&student, trainset, &mut rng).await?;
        let instructions = self.propose_instructions(&student, trainset, &mut rng).await?;
        let combinations = instructions.len() * demo_sets.len();
        info!(
            "Searching {} instructions x {} demo sets with {} trials",
            instructions.len(),
            demo_sets.len(),
            config.num_trials
        );

        let warmup = (config.num_trials as f32 * config.warmup_fraction).ceil() as usize;
        let mut sampler = TpeSampler::new(config.gamma);
        let mut scored: HashMap<(usize, usize), f64> = HashMap::new();
        let mut trials = Vec::new();
        let mut best_score = baseline_score;
        let mut best = student.clone();
        // Instruction 0 with the zero-shot set 0 is the baseline itself.
        if student.demonstrations().is_empty() {
            scored.insert((0, 0), baseline_score);
        }

        for trial_idx in 0..config.num_trials {
            if scored.len() >= combinations {
                info!("All {} configurations scored, stopping early", combinations);
                break;
            }
            let mut choice = if trial_idx < warmup {
                (rng.gen_range(0..instructions.len()), rng.gen_range(0..demo_sets.len()))
            } else {
                sampler.suggest(instructions.len(), demo_sets.len(), &mut rng)
            };
            if scored.contains_key(&choice) {
                let unscored: Vec<(usize, usize)> = (0..instructions.len())
                    .flat_map(|i| (0..demo_sets.len()).map(move |d| (i, d)))
                    .filter(|c| !scored.contains_key(c))
                    .collect();
                match unscored.choose(&mut rng) {
                    Some(&c) => choice = c,
                    None => break,
                }
            }
            let (instruction_idx, demo_set_idx) = choice;
            let candidate = student.with_configuration(instructions[instruction_idx].clone(), demo_sets[demo_set_idx].clone());
            let score = self.evaluate(&candidate, valset).await?;
            info!(
                "Trial {}/{}: score {:.3} (instruction {}, demo set {} with {} demos)",
                trial_idx + 1,
                config.num_trials,
                score,
                instruction_idx,
                demo_set_idx,
                demo_sets[demo_set_idx].len()
            );
            scored.insert(choice, score);
            let record = TrialRecord { instruction_idx, demo_set_idx, score };
            sampler.record(record.clone());
            trials.push(record);
            if score > best_score {
                best_score = score;
                best = candidate;
            }
        }

        info!("Best score: {:.3} (baseline {:.3})", best_score, baseline_score);
        Ok(Optimized {
            program: best,
            report: OptimizationReport {
                skipped: false,
                baseline_score,
                best_score,
                instruction_candidates: instructions.len(),
                demo_set_candidates: demo_sets.len(),
                trials,
            },
        })
    }
}

/// Search budget of a full-corpus run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FullRunParams {
    pub num_trials: usize,
    pub max_bootstrapped_demos: usize,
    pub max_labeled_demos: usize,
}

impl Default for FullRunParams {
    fn default() -> Self {
        Self {
            num_trials: 10,
            max_bootstrapped_demos: 3,
            max_labeled_demos: 5,
        }
    }
}

/// Optimize `base` on the labeled corpus: train on the train split, score on the dev split.
pub async fn run_full_optimization(
    base: &ClassifierProgram,
    source: &dyn CorpusSource,
    models: ModelPair,
    params: FullRunParams,
) -> Result<Optimized> {
    info!("Starting full optimization...");
    let datasets = build_datasets(source, base.label_set(), DEFAULT_TRAIN_SIZE, DEFAULT_DEV_SIZE, DEFAULT_TEST_SIZE).await;
    let config = OptimizerConfig::default()
        .with_num_trials(params.num_trials)
        .with_num_candidates(10)
        .with_max_bootstrapped_demos(params.max_bootstrapped_demos)
        .with_max_labeled_demos(params.max_labeled_demos);
    let optimized = Mipro::new(config, models)
        .compile(base, &datasets.train, &datasets.dev)
        .await?;
    info!("Full optimization complete.");
    Ok(optimized)
}
