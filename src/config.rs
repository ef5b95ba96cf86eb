//! Process configuration, read once from the environment at startup.
//!
//! Missing credentials or model identifiers are fatal: [AppConfig::from_env] fails with
//! [Error::Config] and the caller must not go on to serve requests.

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;

use url::Url;

use crate::error::{Error, Result};

pub const API_KEY_VARS: [&str; 2] = ["GROQ_API_KEY", "LLM_API_KEY"];
pub const MODEL_NAME_VAR: &str = "MODEL_NAME";
pub const API_BASE_VAR: &str = "LLM_API_BASE";
pub const TEACHER_MODEL_VAR: &str = "TEACHER_MODEL_NAME";
pub const TEACHER_POLICY_VAR: &str = "TEACHER_POLICY";
pub const DATASET_API_BASE_VAR: &str = "DATASET_API_BASE";

pub const DEFAULT_API_BASE: &str = "https://api.groq.com/openai/v1";
pub const DEFAULT_TEACHER_MODEL: &str = "groq/llama3-70b-8192";
pub const DEFAULT_DATASET_API_BASE: &str = "https://datasets-server.huggingface.co";

const PROVIDER_PREFIXES: [&str; 2] = ["groq/", "openai/"];

/// Whether optimization may use a separate, stronger model to propose instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TeacherPolicy {
    /// Try the configured teacher model, fall back to the student when it cannot be set up.
    #[default]
    PreferTeacher,
    /// Always let the student propose its own instructions.
    StudentOnly,
}

impl FromStr for TeacherPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "prefer-teacher" | "teacher" => Ok(TeacherPolicy::PreferTeacher),
            "student-only" | "student" => Ok(TeacherPolicy::StudentOnly),
            other => Err(Error::Config(format!(
                "{} must be `prefer-teacher` or `student-only`, got `{}`",
                TEACHER_POLICY_VAR, other
            ))),
        }
    }
}

/// Connection settings for one OpenAI-compatible chat model.
#[derive(Clone, PartialEq, Eq)]
pub struct BackendConfig {
    pub api_base: Url,
    pub api_key: String,
    pub model: String,
}

impl BackendConfig {
    /// Model identifier as the API expects it, without a provider routing prefix such as `groq/`.
    pub fn api_model(&self) -> &str {
        PROVIDER_PREFIXES
            .iter()
            .find_map(|prefix| self.model.strip_prefix(prefix))
            .unwrap_or(&self.model)
    }

    /// Same endpoint and credential, another model.
    pub fn with_model(&self, model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..self.clone()
        }
    }
}

impl std::fmt::Debug for BackendConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendConfig")
            .field("api_base", &self.api_base.as_str())
            .field("api_key", &"<redacted>")
            .field("model", &self.model)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Student model: the one that classifies.
    pub backend: BackendConfig,
    /// Teacher model identifier used to propose instructions during optimization.
    pub teacher_model: Option<String>,
    pub teacher_policy: TeacherPolicy,
    pub dataset_api_base: Url,
    pub program_dir: PathBuf,
    pub feedback_dir: PathBuf,
}

impl AppConfig {
    /// Read the configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        let vars: HashMap<String, String> = std::env::vars().collect();
        Self::from_vars(&vars)
    }

    /// Build the configuration from an explicit variable map.
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self> {
        let get = |key: &str| {
            vars.get(key)
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };

        let api_key = API_KEY_VARS
            .iter()
            .find_map(|key| get(key))
            .ok_or_else(|| Error::Config(format!(
                "{} must be set in the environment",
                API_KEY_VARS.join(" or ")
            )))?;
        let model = get(MODEL_NAME_VAR).ok_or_else(|| Error::Config(format!(
            "{} must be set, e.g. `groq/llama3-8b-8192`",
            MODEL_NAME_VAR
        )))?;
        let api_base = parse_url(API_BASE_VAR, get(API_BASE_VAR).as_deref().unwrap_or(DEFAULT_API_BASE))?;
        let dataset_api_base = parse_url(
            DATASET_API_BASE_VAR,
            get(DATASET_API_BASE_VAR).as_deref().unwrap_or(DEFAULT_DATASET_API_BASE),
        )?;
        let teacher_policy = match get(TEACHER_POLICY_VAR) {
            Some(policy) => policy.parse()?,
            None => TeacherPolicy::default(),
        };
        let teacher_model = Some(get(TEACHER_MODEL_VAR).unwrap_or_else(|| DEFAULT_TEACHER_MODEL.to_string()));

        Ok(Self {
            backend: BackendConfig { api_base, api_key, model },
            teacher_model,
            teacher_policy,
            dataset_api_base,
            program_dir: PathBuf::from("programs"),
            feedback_dir: PathBuf::from("feedback"),
        })
    }

    /// Backend settings of the teacher model, if the policy allows one.
    pub fn teacher_backend(&self) -> Option<BackendConfig> {
        match self.teacher_policy {
            TeacherPolicy::StudentOnly => None,
            TeacherPolicy::PreferTeacher => self
                .teacher_model
                .as_ref()
                .map(|model| self.backend.with_model(model.clone())),
        }
    }
}

fn parse_url(var: &str, value: &str) -> Result<Url> {
    Url::parse(value).map_err(|e| Error::Config(format!("{} is not a valid URL ({}): {}", var, value, e)))
}
