//! # Program repository
//!
//! Named program configurations stored as `<dir>/<name>.json`. Only the instruction and the
//! demonstrations are persisted; the label set and the backend come from the loading session.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Local;
use log::{error, info};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::example::{Example, LabelSet};
use crate::lm::SharedModel;
use crate::program::{ClassifierProgram, Describe, ProgramState};

/// Name of the default, unoptimized program.
pub const BASE_PROGRAM: &str = "base_program";
pub const MIPRO_PREFIX: &str = "mipro_optimized";
pub const FEEDBACK_PREFIX: &str = "feedback_optimized";

/// `<prefix>_<YYYYmmdd_HHMM>` for the current local time.
pub fn timestamped_name(prefix: &str) -> String {
    format!("{}_{}", prefix, Local::now().format("%Y%m%d_%H%M"))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct SavedProgram {
    instruction: String,
    #[serde(default)]
    demos: Vec<Example>,
    #[serde(default)]
    saved_at: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ProgramRepository {
    dir: PathBuf,
}

impl ProgramRepository {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_of(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.json", name))
    }

    /// Persist `program` under `name`, replacing any previous version.
    ///
    /// The content goes to a temporary file first and is renamed into place.
    pub fn save(&self, program: &ClassifierProgram, name: &str) -> Result<PathBuf> {
        validate_name(name)?;
        fs::create_dir_all(&self.dir)?;
        let saved = SavedProgram {
            instruction: program.instruction().to_string(),
            demos: program.demonstrations().to_vec(),
            saved_at: Some(Local::now().format("%Y-%m-%dT%H:%M:%S%.6f").to_string()),
        };
        let path = self.path_of(name);
        let tmp = self.dir.join(format!(".{}.json.tmp", name));
        fs::write(&tmp, serde_json::to_string_pretty(&saved)?)?;
        if let Err(e) = fs::rename(&tmp, &path) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        info!("Program saved to {}", path.display());
        Ok(path)
    }

    /// A base program over `labels` and `lm` with the state saved under `name`.
    pub fn load(&self, name: &str, labels: &LabelSet, lm: SharedModel) -> Result<ClassifierProgram> {
        validate_name(name)?;
        let path = self.path_of(name);
        if !path.is_file() {
            return Err(Error::ProgramNotFound {
                name: name.to_string(),
                path,
            });
        }
        let load_error = |reason: String| {
            error!("Error loading program {}: {}", name, reason);
            Error::ProgramLoad {
                name: name.to_string(),
                reason,
            }
        };
        let content = fs::read_to_string(&path).map_err(|e| load_error(e.to_string()))?;
        let saved: SavedProgram = serde_json::from_str(&content).map_err(|e| load_error(e.to_string()))?;
        let state = ProgramState {
            instruction: saved.instruction,
            demos: saved.demos,
        };
        let program = ClassifierProgram::new(labels.clone(), lm)
            .with_state(state)
            .map_err(|e| load_error(e.to_string()))?;
        info!("Loaded program {} from {}", name, path.display());
        Ok(program)
    }

    /// Names of the saved programs, sorted. A missing directory holds no programs.
    pub fn list_available(&self) -> Result<Vec<String>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut names: Vec<String> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().map_or(false, |ext| ext == "json"))
            .filter_map(|path| path.file_stem().and_then(|s| s.to_str()).map(String::from))
            .filter(|name| !name.starts_with('.'))
            .collect();
        names.sort();
        Ok(names)
    }
}

fn validate_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && !name.starts_with('.')
        && name.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if valid {
        Ok(())
    } else {
        Err(Error::ProgramLoad {
            name: name.to_string(),
            reason: "program names may only contain letters, digits, `_`, `-` and `.`".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::inspector::extract_prompt;
    use crate::lm::FnModel;

    fn labels() -> LabelSet {
        LabelSet::new(["card_arrival", "card_swallowed", "exchange_rate"])
    }

    fn model() -> SharedModel {
        FnModel::new("scripted", |_| Ok("card_arrival".to_string())).shared()
    }

    fn tuned_program() -> ClassifierProgram {
        ClassifierProgram::new(labels(), model()).with_configuration(
            "Find the customer's banking intent.",
            vec![
                Example::new("The ATM ate my card", "card_swallowed").with_reasoning(Some("machine kept it")),
                Example::new("What rate for dollars?", "exchange_rate"),
            ],
        )
    }

    #[test]
    fn test_save_load_round_trip() {
        let tmp = TempDir::new().unwrap();
        let repo = ProgramRepository::new(tmp.path().join("programs"));
        let program = tuned_program();
        let path = repo.save(&program, "mipro_optimized_20240101_1200").unwrap();
        assert!(path.ends_with("mipro_optimized_20240101_1200.json"));

        let loaded = repo.load("mipro_optimized_20240101_1200", &labels(), model()).unwrap();
        assert_eq!(program.state(), loaded.state());
        assert_eq!(extract_prompt(&program), extract_prompt(&loaded));

        let value: serde_json::Value = serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap();
        assert!(value["saved_at"].is_string());
        assert_eq!("Find the customer's banking intent.", value["instruction"]);
    }

    #[test]
    fn test_save_overwrites() {
        let tmp = TempDir::new().unwrap();
        let repo = ProgramRepository::new(tmp.path());
        repo.save(&tuned_program(), "p").unwrap();
        let base = ClassifierProgram::new(labels(), model());
        repo.save(&base, "p").unwrap();
        assert_eq!(base.state(), repo.load("p", &labels(), model()).unwrap().state());
        assert_eq!(vec!["p".to_string()], repo.list_available().unwrap());
    }

    #[test]
    fn test_missing_program_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let repo = ProgramRepository::new(tmp.path());
        let err = repo.load("nope", &labels(), model()).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_malformed_program_is_a_load_error() {
        let tmp = TempDir::new().unwrap();
        let repo = ProgramRepository::new(tmp.path());
        fs::write(repo.path_of("broken"), "{\"demos\": []}").unwrap();
        fs::write(
            repo.path_of("foreign"),
            r#"{"instruction": "x", "demos": [{"text": "hi", "label": "greeting"}]}"#,
        )
        .unwrap();
        assert!(matches!(repo.load("broken", &labels(), model()), Err(Error::ProgramLoad { .. })));
        assert!(matches!(repo.load("foreign", &labels(), model()), Err(Error::ProgramLoad { .. })));
    }

    #[test]
    fn test_list_available() {
        let tmp = TempDir::new().unwrap();
        let repo = ProgramRepository::new(tmp.path().join("missing"));
        assert!(repo.list_available().unwrap().is_empty());

        let repo = ProgramRepository::new(tmp.path());
        repo.save(&tuned_program(), "b_program").unwrap();
        repo.save(&tuned_program(), "a_program").unwrap();
        fs::write(tmp.path().join("readme.txt"), "").unwrap();
        assert_eq!(vec!["a_program", "b_program"], repo.list_available().unwrap());
    }

    #[test]
    fn test_names() {
        let name = timestamped_name(MIPRO_PREFIX);
        assert!(name.starts_with("mipro_optimized_"));
        assert_eq!("mipro_optimized_".len() + 13, name.len());
        assert!(validate_name("../escape").is_err());
        assert!(validate_name(BASE_PROGRAM).is_ok());
    }
}
