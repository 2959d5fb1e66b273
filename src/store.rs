use crate::prompts::Rubric;
use crate::scoring::Scorecard;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::debug;

/// Outcome classification of one judged item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Ok,
    Error,
}

/// A previously generated output awaiting (re)judgement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Generation {
    pub id: u64,
    #[serde(default)]
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// Persisted result of judging one generation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JudgeRecord {
    pub generation_id: u64,
    pub reference: String,
    pub judge_model: String,
    pub rubric: Rubric,
    pub prompt_version: String,
    pub status: ItemStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scorecard: Option<Scorecard>,
    /// Error code when the judge produced no scorecard
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Judge text (or failure preview), capped at 800 characters
    #[serde(default)]
    pub raw_text: String,
}

/// Where candidate texts come from and where judgements go
pub trait GenerationStore {
    fn candidate_text(&self, generation_id: u64) -> impl Future<Output = Result<String>> + Send;

    fn record_judgement(&self, record: JudgeRecord) -> impl Future<Output = Result<()>> + Send;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoreFile {
    #[serde(default)]
    generations: Vec<Generation>,
    #[serde(default)]
    judgements: Vec<JudgeRecord>,
}

/// Generations and judgements kept in one pretty-printed JSON file
pub struct JsonFileStore {
    path: PathBuf,
    state: Mutex<StoreFile>,
}

impl JsonFileStore {
    /// Open the store at `path`; a missing file starts empty
    pub fn open(path: &Path) -> Result<Self> {
        let state = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read store: {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse store: {}", path.display()))?
        } else {
            StoreFile::default()
        };

        Ok(Self {
            path: path.to_path_buf(),
            state: Mutex::new(state),
        })
    }

    pub async fn insert_generation(&self, generation: Generation) -> Result<()> {
        let mut state = self.state.lock().await;
        let mut next = state.clone();
        next.generations.retain(|existing| existing.id != generation.id);
        next.generations.push(generation);
        self.persist(&next)?;
        *state = next;
        Ok(())
    }

    pub async fn judgements(&self) -> Vec<JudgeRecord> {
        self.state.lock().await.judgements.clone()
    }

    fn persist(&self, state: &StoreFile) -> Result<()> {
        let json_content =
            serde_json::to_string_pretty(state).context("Failed to serialize store to JSON")?;

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
        std::fs::write(&self.path, json_content)
            .with_context(|| format!("Failed to write store: {}", self.path.display()))
    }
}

impl GenerationStore for JsonFileStore {
    async fn candidate_text(&self, generation_id: u64) -> Result<String> {
        let state = self.state.lock().await;
        state
            .generations
            .iter()
            .find(|generation| generation.id == generation_id)
            .map(|generation| generation.output.clone())
            .with_context(|| format!("Generation {generation_id} not found"))
    }

    async fn record_judgement(&self, record: JudgeRecord) -> Result<()> {
        let mut state = self.state.lock().await;
        debug!(generation_id = record.generation_id, status = ?record.status, "recording judgement");
        // Memory only changes once the file write has succeeded.
        let mut next = state.clone();
        next.judgements.push(record);
        self.persist(&next)?;
        *state = next;
        Ok(())
    }
}
