//! # Labeled-example store
//!
//! Loads the Banking77 label vocabulary and labeled corpus, and splits the corpus into
//! train/dev/test partitions.
//!
//! Neither operation fails past this module. A missing vocabulary degrades to
//! [FALLBACK_LABELS] ([LabelSetOrDefault::Fallback]); a missing corpus degrades to an empty
//! [Dataset], on which the optimizer is a no-op.
//!
//! The split is reproducible: the same corpus and the same seed give the same partitions, in the
//! same order, on every run.

use async_trait::async_trait;
use log::{error, info, warn};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::Deserialize;
use serde_json::Value;
use url::Url;

use crate::error::{Error, Result};
use crate::example::{Example, LabelSet};

pub const DATASET_NAME: &str = "PolyAI/banking77";
pub const SPLIT_SEED: u64 = 0;
/// Largest page the datasets-server `/rows` endpoint serves.
pub const ROWS_PAGE_SIZE: usize = 100;

pub const DEFAULT_TRAIN_SIZE: usize = 500;
pub const DEFAULT_DEV_SIZE: usize = 200;
pub const DEFAULT_TEST_SIZE: usize = 200;

/// Banking77 intents in dataset index order.
pub const FALLBACK_LABELS: [&str; 77] = [
    "activate_my_card",
    "age_limit",
    "apple_pay_or_google_pay",
    "atm_support",
    "automatic_top_up",
    "balance_not_updated_after_bank_transfer",
    "balance_not_updated_after_cheque_or_cash_deposit",
    "beneficiary_not_allowed",
    "cancel_transfer",
    "card_about_to_expire",
    "card_acceptance",
    "card_arrival",
    "card_delivery_estimate",
    "card_linking",
    "card_not_working",
    "card_payment_fee_charged",
    "card_payment_not_recognised",
    "card_payment_wrong_exchange_rate",
    "card_swallowed",
    "cash_withdrawal_charge",
    "cash_withdrawal_not_recognised",
    "change_pin",
    "compromised_card",
    "contactless_not_working",
    "country_support",
    "declined_card_payment",
    "declined_cash_withdrawal",
    "declined_transfer",
    "direct_debit_payment_not_recognised",
    "disposable_card_limits",
    "edit_personal_details",
    "exchange_charge",
    "exchange_rate",
    "exchange_via_app",
    "extra_charge_on_statement",
    "failed_transfer",
    "fiat_currency_support",
    "get_disposable_virtual_card",
    "get_physical_card",
    "getting_spare_card",
    "getting_virtual_card",
    "lost_or_stolen_card",
    "lost_or_stolen_phone",
    "order_physical_card",
    "passcode_forgotten",
    "pending_card_payment",
    "pending_cash_withdrawal",
    "pending_top_up",
    "pending_transfer",
    "pin_blocked",
    "receiving_money",
    "Refund_not_showing_up",
    "request_refund",
    "reverted_card_payment?",
    "supported_cards_and_currencies",
    "terminate_account",
    "top_up_by_bank_transfer_charge",
    "top_up_by_card_charge",
    "top_up_by_cash_or_cheque",
    "top_up_failed",
    "top_up_limits",
    "top_up_reverted",
    "topping_up_by_card",
    "transaction_charged_twice",
    "transfer_fee_charged",
    "transfer_into_account",
    "transfer_not_received_by_recipient",
    "transfer_timing",
    "unable_to_verify_identity",
    "verify_my_identity",
    "verify_source_of_funds",
    "verify_top_up",
    "virtual_card_not_working",
    "visa_or_mastercard",
    "why_verify_identity",
    "wrong_amount_of_cash_received",
    "wrong_exchange_rate_for_cash_withdrawal",
];

/// One corpus row before its label index is resolved.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RawRow {
    pub text: String,
    pub label: usize,
}

/// Where label names and labeled rows come from.
#[async_trait]
pub trait CorpusSource: Send + Sync {
    /// Label names in class-index order.
    async fn label_names(&self) -> Result<Vec<String>>;

    /// The first `limit` rows of the corpus, in corpus order.
    async fn fetch_rows(&self, limit: usize) -> Result<Vec<RawRow>>;
}

/// A dataset served by the HuggingFace datasets-server REST API.
#[derive(Debug, Clone)]
pub struct HuggingFaceCorpus {
    client: reqwest::Client,
    api_base: Url,
    dataset: String,
    config: String,
    split: String,
}

#[derive(Debug, Deserialize)]
struct RowsPage {
    rows: Vec<RowEntry>,
    #[serde(default)]
    num_rows_total: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct RowEntry {
    row: RawRow,
}

impl HuggingFaceCorpus {
    pub fn new(api_base: Url, dataset: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_base,
            dataset: dataset.into(),
            config: "default".to_string(),
            split: "train".to_string(),
        }
    }

    /// The Banking77 training split.
    pub fn banking77(api_base: Url) -> Self {
        Self::new(api_base, DATASET_NAME)
    }

    fn endpoint(&self, path: &str, extra: &[(&str, String)]) -> Result<Url> {
        let mut url = self.api_base.clone();
        url.path_segments_mut()
            .map_err(|_| Error::Dataset(format!("{} cannot be a base URL", self.api_base)))?
            .pop_if_empty()
            .push(path);
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("dataset", &self.dataset)
                .append_pair("config", &self.config);
            for (key, value) in extra {
                query.append_pair(key, value);
            }
        }
        Ok(url)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: Url) -> Result<T> {
        let response = self.client.get(url).send().await?.error_for_status()?;
        Ok(response.json().await?)
    }
}

#[async_trait]
impl CorpusSource for HuggingFaceCorpus {
    async fn label_names(&self) -> Result<Vec<String>> {
        let info: Value = self.get_json(self.endpoint("info", &[])?).await?;
        let names = info
            .pointer("/dataset_info/features/label/names")
            .and_then(Value::as_array)
            .ok_or_else(|| Error::Dataset("no label names in dataset info".to_string()))?;
        names
            .iter()
            .map(|name| {
                name.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| Error::Dataset(format!("label name is not a string: {}", name)))
            })
            .collect()
    }

    async fn fetch_rows(&self, limit: usize) -> Result<Vec<RawRow>> {
        let mut rows = Vec::with_capacity(limit.min(ROWS_PAGE_SIZE));
        while rows.len() < limit {
            let length = ROWS_PAGE_SIZE.min(limit - rows.len());
            let url = self.endpoint("rows", &[
                ("split", self.split.clone()),
                ("offset", rows.len().to_string()),
                ("length", length.to_string()),
            ])?;
            let page: RowsPage = self.get_json(url).await?;
            let received = page.rows.len();
            rows.extend(page.rows.into_iter().map(|entry| entry.row));
            let exhausted = page.num_rows_total.map_or(false, |total| rows.len() >= total);
            if received < length || exhausted {
                break;
            }
        }
        rows.truncate(limit);
        Ok(rows)
    }
}

/// An in-memory corpus.
#[derive(Debug, Clone, Default)]
pub struct StaticCorpus {
    labels: Vec<String>,
    rows: Vec<RawRow>,
    unavailable: Option<String>,
}

impl StaticCorpus {
    pub fn new(labels: Vec<String>, rows: Vec<RawRow>) -> Self {
        Self { labels, rows, unavailable: None }
    }

    /// A source whose every request fails with `reason`.
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self { unavailable: Some(reason.into()), ..Self::default() }
    }

    fn check(&self) -> Result<()> {
        match &self.unavailable {
            Some(reason) => Err(Error::Dataset(reason.clone())),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl CorpusSource for StaticCorpus {
    async fn label_names(&self) -> Result<Vec<String>> {
        self.check()?;
        Ok(self.labels.clone())
    }

    async fn fetch_rows(&self, limit: usize) -> Result<Vec<RawRow>> {
        self.check()?;
        Ok(self.rows.iter().take(limit).cloned().collect())
    }
}

/// Result of loading the vocabulary: either the remote one or the built-in fallback.
#[derive(Debug, Clone)]
pub enum LabelSetOrDefault {
    Loaded(LabelSet),
    Fallback { labels: LabelSet, reason: String },
}

impl LabelSetOrDefault {
    pub fn fallback(reason: impl Into<String>) -> Self {
        LabelSetOrDefault::Fallback {
            labels: LabelSet::new(FALLBACK_LABELS),
            reason: reason.into(),
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, LabelSetOrDefault::Fallback { .. })
    }

    pub fn into_label_set(self) -> LabelSet {
        match self {
            LabelSetOrDefault::Loaded(labels) => labels,
            LabelSetOrDefault::Fallback { labels, .. } => labels,
        }
    }
}

/// Fetch the label vocabulary, falling back to [FALLBACK_LABELS] on any failure.
pub async fn load_label_set(source: &dyn CorpusSource) -> LabelSetOrDefault {
    match source.label_names().await {
        Ok(names) if !names.is_empty() => LabelSetOrDefault::Loaded(LabelSet::new(names)),
        Ok(_) => {
            error!("Label source returned no labels, using the built-in vocabulary");
            LabelSetOrDefault::fallback("empty label list")
        }
        Err(e) => {
            error!("Failed to load label names: {}. Using the built-in vocabulary", e);
            LabelSetOrDefault::fallback(e.to_string())
        }
    }
}

/// Three disjoint partitions of the corpus.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Dataset {
    pub train: Vec<Example>,
    pub dev: Vec<Example>,
    pub test: Vec<Example>,
}

impl Dataset {
    /// Stands in for a corpus that could not be loaded.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.train.is_empty() && self.dev.is_empty() && self.test.is_empty()
    }
}

/// Shuffle `examples` with `seed` and slice train, dev and test off the front, in that order.
///
/// Only the first `train + dev + test` examples take part. When the corpus is smaller, the
/// partitions are filled in order, so train is truncated last.
pub fn split_examples(mut examples: Vec<Example>, train: usize, dev: usize, test: usize, seed: u64) -> Dataset {
    examples.truncate(train.saturating_add(dev).saturating_add(test));
    examples.shuffle(&mut StdRng::seed_from_u64(seed));

    let mut rest = examples.into_iter();
    let train: Vec<Example> = rest.by_ref().take(train).collect();
    let dev: Vec<Example> = rest.by_ref().take(dev).collect();
    let test: Vec<Example> = rest.take(test).collect();
    Dataset { train, dev, test }
}

fn resolve_rows(rows: Vec<RawRow>, labels: &LabelSet) -> Result<Vec<Example>> {
    rows.into_iter()
        .map(|row| {
            let label = labels.name(row.label).ok_or_else(|| Error::Dataset(format!(
                "label index {} out of range for {} labels",
                row.label,
                labels.len()
            )))?;
            Ok(Example::new(row.text, label))
        })
        .collect()
}

/// Fetch `train + dev + test` examples and split them deterministically.
///
/// Any failure is logged and yields [Dataset::empty].
pub async fn build_datasets(
    source: &dyn CorpusSource,
    labels: &LabelSet,
    train: usize,
    dev: usize,
    test: usize,
) -> Dataset {
    info!("Creating datasets...");
    let requested = train.saturating_add(dev).saturating_add(test);
    let examples = match source.fetch_rows(requested).await {
        Ok(rows) => resolve_rows(rows, labels),
        Err(e) => Err(e),
    };
    match examples {
        Ok(examples) => {
            if examples.len() < requested {
                warn!("Corpus has {} examples, {} were requested", examples.len(), requested);
            }
            let dataset = split_examples(examples, train, dev, test, SPLIT_SEED);
            info!(
                "Datasets created: Train ({}), Dev ({}), Test ({})",
                dataset.train.len(),
                dataset.dev.len(),
                dataset.test.len()
            );
            dataset
        }
        Err(e) => {
            error!("Failed to create datasets: {}", e);
            Dataset::empty()
        }
    }
}
