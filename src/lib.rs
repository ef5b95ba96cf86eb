//! # intent-tuner
//!
//! Feedback-driven prompt optimization for a banking-intent text classifier.
//!
//! A [ClassifierProgram](crate::program::ClassifierProgram) asks a chat model to put a customer's
//! message into one of the 77 Banking77 intents. What the program tells the model (its instruction
//! and its demonstrations) is not written by hand: it is searched for by an
//! [optimizer](crate::optimizer), either on the labeled corpus or on corrections users submitted
//! while classifying.
//!
//! ## Concepts
//!
//! ### Label set
//!
//! The closed vocabulary a prediction must come from. It is loaded from the corpus once per
//! session, with a built-in copy for when the corpus cannot be reached. See [crate::dataset].
//!
//! ### Program
//!
//! An instruction, a list of demonstrations and a handle to the model that runs it. Running a
//! program on a text gives a [Prediction](crate::example::Prediction) whose label is guaranteed to
//! belong to the label set, or an error. Its prompt is a [PromptTemplate](crate::prompt::PromptTemplate)
//! that the program fills itself, being a [filler](crate::filler) of its own placeholders.
//!
//! ### Optimizer
//!
//! [Mipro](crate::optimizer::Mipro) proposes instructions with a teacher model, bootstraps
//! demonstrations by running the program, and keeps the configuration that scores best on a
//! validation set. The input program is the baseline and wins ties.
//!
//! ### Feedback
//!
//! A correction is an [Example](crate::example::Example): the text and the label it should have
//! gotten. Corrections are appended to the [FeedbackStore](crate::feedback::FeedbackStore), one file
//! each, and are the training and validation set of a feedback optimization.
//!
//! ### Repository and inspector
//!
//! Programs are saved by name as JSON by the [ProgramRepository](crate::repository::ProgramRepository).
//! The [inspector](crate::inspector) renders a program for humans and diffs two of them.
//!
//! ## Configuration
//!
//! See [AppConfig](crate::config::AppConfig). `GROQ_API_KEY` (or `LLM_API_KEY`) and `MODEL_NAME`
//! are required; any OpenAI-compatible endpoint works through `LLM_API_BASE`.

pub mod config;
pub mod dataset;
pub mod error;
pub mod example;
pub mod feedback;
pub mod filler;
pub mod inspector;
pub mod lm;
pub mod metric;
pub mod optimizer;
pub mod program;
pub mod prompt;
pub mod repository;
pub mod session;
pub mod utils;

pub use error::{Error, Result};
