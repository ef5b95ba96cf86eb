//! # Language-model backend
//!
//! Programs and the optimizer never reach for a global model. They hold a [SharedModel] handed to
//! them at construction time, so swapping the backend (or a test double) is a constructor argument.
//!
//! There is no response cache: every [LanguageModel::complete] call reaches the backend.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_openai::config::OpenAIConfig;
use async_openai::types::{
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
    CreateChatCompletionRequestArgs,
};
use async_openai::Client;
use async_trait::async_trait;
use log::{debug, info, warn};

use crate::config::BackendConfig;
use crate::error::{Error, Result};

/// A two-message chat request: the rendered program prompt and the user turn.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub system: String,
    pub user: String,
    pub temperature: f32,
}

impl CompletionRequest {
    pub fn new(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            user: user.into(),
            temperature: 0.0,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Identifier shown in logs.
    fn model_name(&self) -> &str;

    /// Send one request and return the reply text.
    async fn complete(&self, request: &CompletionRequest) -> Result<String>;
}

pub type SharedModel = Arc<dyn LanguageModel>;

/// Chat model behind an OpenAI-compatible API (OpenAI, Groq, vLLM, ...).
#[derive(Clone)]
pub struct OpenAiModel {
    client: Client<OpenAIConfig>,
    config: BackendConfig,
}

impl OpenAiModel {
    /// Set up a client. Fails on settings that can never produce a working call.
    pub fn connect(config: &BackendConfig) -> Result<Self> {
        let model = config.api_model();
        if model.is_empty() || model.chars().any(char::is_whitespace) {
            return Err(Error::Config(format!("invalid model identifier `{}`", config.model)));
        }
        if config.api_key.trim().is_empty() {
            return Err(Error::Config(format!("no API key for model `{}`", config.model)));
        }
        let openai_config = OpenAIConfig::new()
            .with_api_base(config.api_base.as_str().trim_end_matches('/'))
            .with_api_key(config.api_key.clone());
        Ok(Self {
            client: Client::with_config(openai_config),
            config: config.clone(),
        })
    }
}

impl fmt::Debug for OpenAiModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenAiModel").field("config", &self.config).finish()
    }
}

#[async_trait]
impl LanguageModel for OpenAiModel {
    fn model_name(&self) -> &str {
        &self.config.model
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        let chat_request = CreateChatCompletionRequestArgs::default()
            .model(self.config.api_model())
            .temperature(request.temperature)
            .messages([
                ChatCompletionRequestSystemMessageArgs::default()
                    .content(request.system.as_str())
                    .build()?
                    .into(),
                ChatCompletionRequestUserMessageArgs::default()
                    .content(request.user.as_str())
                    .build()?
                    .into(),
            ])
            .build()?;
        debug!("sending chat completion to {}", self.config.model);
        let response = self.client.chat().create(chat_request).await?;
        response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| Error::Backend(format!("{} returned no message content", self.config.model)))
    }
}

type ReplyFn = dyn Fn(&CompletionRequest) -> Result<String> + Send + Sync;

/// A model backed by a closure. Used for offline runs and tests.
#[derive(Clone)]
pub struct FnModel {
    name: String,
    reply: Arc<ReplyFn>,
    calls: Arc<AtomicUsize>,
}

impl FnModel {
    pub fn new<F>(name: impl Into<String>, reply: F) -> Self
    where
        F: Fn(&CompletionRequest) -> Result<String> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            reply: Arc::new(reply),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of requests answered so far, shared between clones.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn shared(self) -> SharedModel {
        Arc::new(self)
    }
}

#[async_trait]
impl LanguageModel for FnModel {
    fn model_name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        (self.reply)(request)
    }
}

/// Outcome of trying to set up a teacher model.
pub enum TeacherOrStudent {
    Teacher(SharedModel),
    /// Use the student for both roles.
    Student { reason: String },
}

impl TeacherOrStudent {
    /// Try to set up the teacher backend; `None` means the policy asks for the student only.
    pub fn acquire(teacher: Option<&BackendConfig>) -> Self {
        match teacher {
            None => TeacherOrStudent::Student {
                reason: "teacher model disabled by policy".to_string(),
            },
            Some(config) => match OpenAiModel::connect(config) {
                Ok(model) => TeacherOrStudent::Teacher(Arc::new(model)),
                Err(e) => TeacherOrStudent::Student { reason: e.to_string() },
            },
        }
    }

    pub fn into_pair(self, student: SharedModel) -> ModelPair {
        info!("Student model (task model): {}", student.model_name());
        match self {
            TeacherOrStudent::Teacher(teacher) => {
                info!("Teacher model (prompt model): {}", teacher.model_name());
                ModelPair { student, teacher }
            }
            TeacherOrStudent::Student { reason } => {
                warn!("Could not initialize teacher model. Falling back to student model. Reason: {}", reason);
                ModelPair::student_only(student)
            }
        }
    }
}

/// Models used by one optimization run.
#[derive(Clone)]
pub struct ModelPair {
    /// Runs the program: bootstrapping and scoring.
    pub student: SharedModel,
    /// Proposes instructions.
    pub teacher: SharedModel,
}

impl ModelPair {
    pub fn student_only(student: SharedModel) -> Self {
        Self {
            teacher: student.clone(),
            student,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;

    fn backend(model: &str, key: &str) -> BackendConfig {
        BackendConfig {
            api_base: Url::parse("https://api.groq.com/openai/v1").unwrap(),
            api_key: key.to_string(),
            model: model.to_string(),
        }
    }

    #[tokio::test]
    async fn test_fn_model_counts_every_call() {
        let model = FnModel::new("echo", |req| Ok(req.user.to_uppercase()));
        let request = CompletionRequest::new("sys", "same text");
        assert_eq!("SAME TEXT", model.complete(&request).await.unwrap());
        assert_eq!("SAME TEXT", model.complete(&request).await.unwrap());
        assert_eq!(2, model.calls());
    }

    #[test]
    fn test_connect_rejects_bad_settings() {
        assert!(OpenAiModel::connect(&backend("groq/", "k")).is_err());
        assert!(OpenAiModel::connect(&backend("llama 3", "k")).is_err());
        assert!(OpenAiModel::connect(&backend("groq/llama3-70b-8192", " ")).is_err());
        let model = OpenAiModel::connect(&backend("groq/llama3-70b-8192", "k")).unwrap();
        assert_eq!("groq/llama3-70b-8192", model.model_name());
    }

    #[test]
    fn test_teacher_fallback() {
        let student = FnModel::new("student", |_| Ok(String::new())).shared();

        let pair = TeacherOrStudent::acquire(None).into_pair(student.clone());
        assert_eq!("student", pair.teacher.model_name());

        let broken = backend("", "k");
        let pair = TeacherOrStudent::acquire(Some(&broken)).into_pair(student.clone());
        assert_eq!("student", pair.teacher.model_name());

        let good = backend("groq/llama3-70b-8192", "k");
        let pair = TeacherOrStudent::acquire(Some(&good)).into_pair(student);
        assert_eq!("groq/llama3-70b-8192", pair.teacher.model_name());
        assert_eq!("student", pair.student.model_name());
    }
}
