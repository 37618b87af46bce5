//! Core domain types for question-tree extraction and tracking.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{QuestionTreeError, Result};

/// Deepest expansion accepted on the request-serving path.
pub const MAX_REQUEST_DEPTH: u8 = 2;

/// Deepest expansion the raw engine will attempt.
pub const MAX_ENGINE_DEPTH: u8 = 3;

/// Upper bound on consensus runs per request.
pub const MAX_CONSENSUS_RUNS: u8 = 3;

// ---------------------------------------------------------------------------
// Device
// ---------------------------------------------------------------------------

/// Device class the results page is rendered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    #[default]
    Mobile,
    Desktop,
}

impl Device {
    pub fn as_str(&self) -> &'static str {
        match self {
            Device::Mobile => "mobile",
            Device::Desktop => "desktop",
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Device {
    type Err = QuestionTreeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mobile" => Ok(Device::Mobile),
            "desktop" => Ok(Device::Desktop),
            other => Err(QuestionTreeError::validation(format!(
                "device must be 'mobile' or 'desktop', got '{other}'"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// ExtractionParams
// ---------------------------------------------------------------------------

/// Parameters for one extraction request.
///
/// `depth` counts completed expansions: 0 records the top-level questions
/// only, 1 additionally expands each of them once, and so on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionParams {
    pub keyword: String,
    /// Two-letter country code, lowercase.
    pub country: String,
    /// Language code, lowercase.
    pub language: String,
    pub device: Device,
    pub depth: u8,
    /// Consensus run count K.
    pub runs: u8,
    /// Pre-encoded city-bias token, forwarded verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city_bias: Option<String>,
    /// Apply the quorum filter during consensus.
    #[serde(default)]
    pub strict: bool,
}

impl ExtractionParams {
    /// Build validated parameters with depth 0 and a single run.
    pub fn new(
        keyword: impl Into<String>,
        country: impl Into<String>,
        language: impl Into<String>,
        device: Device,
    ) -> Result<Self> {
        let keyword = keyword.into().trim().to_string();
        if keyword.is_empty() {
            return Err(QuestionTreeError::validation("keyword must not be empty"));
        }
        Ok(Self {
            keyword,
            country: country.into().trim().to_ascii_lowercase(),
            language: language.into().trim().to_ascii_lowercase(),
            device,
            depth: 0,
            runs: 1,
            city_bias: None,
            strict: false,
        })
    }

    /// Set the expansion depth, clamped to the engine maximum.
    pub fn with_depth(mut self, depth: u8) -> Self {
        self.depth = depth.min(MAX_ENGINE_DEPTH);
        self
    }

    /// Set the consensus run count, clamped to `1..=3`.
    pub fn with_runs(mut self, runs: u8) -> Self {
        self.runs = runs.clamp(1, MAX_CONSENSUS_RUNS);
        self
    }

    pub fn with_city_bias(mut self, token: Option<String>) -> Self {
        self.city_bias = token.filter(|t| !t.trim().is_empty());
        self
    }

    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Apply the tighter depth bound used when serving external requests.
    pub fn for_request(mut self) -> Self {
        self.depth = self.depth.min(MAX_REQUEST_DEPTH);
        self
    }

    /// Locale tag such as `en-US`.
    pub fn locale(&self) -> String {
        if self.country.is_empty() {
            self.language.clone()
        } else {
            format!("{}-{}", self.language, self.country.to_ascii_uppercase())
        }
    }
}

// ---------------------------------------------------------------------------
// Single-run output
// ---------------------------------------------------------------------------

/// One discovered question node within one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionItem {
    pub raw: String,
    /// In-run identity key.
    pub normalized: String,
    /// 0 for top-level questions.
    pub depth: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    /// Structural path used only to re-locate the node.
    pub path: String,
    /// Position within the container at discovery time.
    pub order: usize,
}

/// Visual and markup evidence captured during one run.
#[derive(Debug, Clone, Default)]
pub struct Evidence {
    pub full_page: Option<Vec<u8>>,
    pub container_html: Option<String>,
    /// One crop after locating the container, then one per expansion.
    pub crops: Vec<Vec<u8>>,
}

impl Evidence {
    pub fn is_empty(&self) -> bool {
        self.full_page.is_none() && self.container_html.is_none() && self.crops.is_empty()
    }
}

/// Why a tree walk stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    #[default]
    QueueExhausted,
    NodeBudget,
    TimeBudget,
    Cancelled,
    /// No question container was located on the page.
    NoContainer,
}

/// Result of a single Run Executor invocation.
#[derive(Debug, Clone, Default)]
pub struct RunResult {
    pub items: Vec<QuestionItem>,
    pub evidence: Evidence,
    pub drift_hash: String,
    /// Network identifier of the egress used (proxy host), if any.
    pub egress: Option<String>,
    pub stop_reason: StopReason,
    pub elapsed_ms: u64,
}

impl RunResult {
    pub fn container_found(&self) -> bool {
        self.stop_reason != StopReason::NoContainer
    }
}

// ---------------------------------------------------------------------------
// Consensus output
// ---------------------------------------------------------------------------

/// One question merged across consensus runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusResult {
    pub normalized: String,
    /// Most frequent surface form across runs.
    pub raw: String,
    /// Minimum observed depth.
    pub depth: u8,
    /// Minimum observed order index.
    pub order: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    /// Number of runs that observed this question (1..=K).
    pub appearances: u8,
    /// In (0, 1], rounded to three decimals.
    pub confidence: f64,
}

// ---------------------------------------------------------------------------
// Tracking (persisted)
// ---------------------------------------------------------------------------

/// A UUID v7 wrapper for tracked target identifiers (time-sortable).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TargetId(pub Uuid);

impl TargetId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for TargetId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TargetId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// A (keyword, region) pair monitored on a recurring schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedTarget {
    pub id: TargetId,
    pub keyword: String,
    pub country: String,
    pub language: String,
    pub device: Device,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city_bias: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl TrackedTarget {
    /// Depth-0, single-run parameters used by the tracking cycle.
    pub fn params(&self) -> Result<ExtractionParams> {
        Ok(ExtractionParams::new(
            self.keyword.clone(),
            self.country.clone(),
            self.language.clone(),
            self.device,
        )?
        .with_city_bias(self.city_bias.clone()))
    }
}

/// Coarse classification of a question by its leading interrogative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionType {
    What,
    How,
    Why,
    When,
    Where,
    Who,
    Which,
    Can,
    YesNo,
    Cost,
    Other,
}

impl QuestionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuestionType::What => "what",
            QuestionType::How => "how",
            QuestionType::Why => "why",
            QuestionType::When => "when",
            QuestionType::Where => "where",
            QuestionType::Who => "who",
            QuestionType::Which => "which",
            QuestionType::Can => "can",
            QuestionType::YesNo => "yes_no",
            QuestionType::Cost => "cost",
            QuestionType::Other => "other",
        }
    }
}

impl FromStr for QuestionType {
    type Err = QuestionTreeError;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "what" => QuestionType::What,
            "how" => QuestionType::How,
            "why" => QuestionType::Why,
            "when" => QuestionType::When,
            "where" => QuestionType::Where,
            "who" => QuestionType::Who,
            "which" => QuestionType::Which,
            "can" => QuestionType::Can,
            "yes_no" => QuestionType::YesNo,
            "cost" => QuestionType::Cost,
            "other" => QuestionType::Other,
            other => {
                return Err(QuestionTreeError::validation(format!(
                    "unknown question type '{other}'"
                )));
            }
        })
    }
}

/// Persisted state of one question for one tracked target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionRecord {
    pub target_id: TargetId,
    pub hash: String,
    pub raw: String,
    pub question_type: QuestionType,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub times_seen: u32,
    /// Running mean of the 0-based position across cycles.
    pub avg_position: f64,
    /// Position in the most recent cycle that observed this question.
    pub last_position: u32,
    pub is_current: bool,
}

/// Kind of a detected change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Added,
    Removed,
    PositionChanged,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Added => "added",
            ChangeKind::Removed => "removed",
            ChangeKind::PositionChanged => "position_changed",
        }
    }
}

impl FromStr for ChangeKind {
    type Err = QuestionTreeError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "added" => Ok(ChangeKind::Added),
            "removed" => Ok(ChangeKind::Removed),
            "position_changed" => Ok(ChangeKind::PositionChanged),
            other => Err(QuestionTreeError::validation(format!(
                "unknown change kind '{other}'"
            ))),
        }
    }
}

/// Append-only record of one detected change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub target_id: TargetId,
    pub kind: ChangeKind,
    pub raw: String,
    pub hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_position: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_position: Option<u32>,
    pub detected_at: DateTime<Utc>,
}

/// Raw ordered question list of one tracking cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub target_id: TargetId,
    pub observed_at: DateTime<Utc>,
    pub questions: Vec<String>,
}
