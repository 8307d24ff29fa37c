use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("io error at {path}: {message}")]
    Io { path: String, message: String },
    #[error("json error at {path}: {message}")]
    Json { path: String, message: String },
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("browser failed: {0}")]
    Browser(String),
    #[error("fetch failed: {0}")]
    Fetch(String),
    #[error("sanitizer failed: {0}")]
    Sanitize(String),
    #[error("taxonomy error: {0}")]
    Taxonomy(String),
    #[error("invalid record: {0}")]
    InvalidRecord(String),
    #[error("not configured: {0}")]
    NotConfigured(String),
    #[error("not supported: {0}")]
    NotSupported(String),
}

impl Error {
    pub fn io(path: impl fmt::Display, e: impl fmt::Display) -> Self {
        Error::Io {
            path: path.to_string(),
            message: e.to_string(),
        }
    }

    pub fn json(path: impl fmt::Display, e: impl fmt::Display) -> Self {
        Error::Json {
            path: path.to_string(),
            message: e.to_string(),
        }
    }

    /// Timeouts and driver hiccups are worth another attempt; everything else is not.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Timeout(_) | Error::Browser(_) | Error::Fetch(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExamId {
    Ege,
    Oge,
}

impl ExamId {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExamId::Ege => "ege",
            ExamId::Oge => "oge",
        }
    }
}

impl fmt::Display for ExamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExamId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ege" => Ok(ExamId::Ege),
            "oge" => Ok(ExamId::Oge),
            other => Err(Error::NotSupported(format!("unknown exam: {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Basic,
    Profile,
}

impl Level {
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Basic => "basic",
            Level::Profile => "profile",
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Level {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "basic" | "base" => Ok(Level::Basic),
            "profile" => Ok(Level::Profile),
            other => Err(Error::NotSupported(format!("unknown level: {other:?}"))),
        }
    }
}

/// How an identifier was found on the card.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IdMethod {
    Text,
    Attr,
    Href,
    Onclick,
    #[serde(alias = "hidden-input")]
    Hidden,
    Hash,
    /// Older raw files only recorded "detected" vs "hash".
    #[serde(other)]
    Detected,
}

impl IdMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdMethod::Text => "text",
            IdMethod::Attr => "attr",
            IdMethod::Href => "href",
            IdMethod::Onclick => "onclick",
            IdMethod::Hidden => "hidden",
            IdMethod::Hash => "hash",
            IdMethod::Detected => "detected",
        }
    }
}

/// Identity of one question card.
///
/// A `Synthetic` identity is derived from the card markup itself, so it is only as stable as
/// the markup. It must never be trusted for a merge on its own; callers pair it with the
/// content checksum.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identity {
    Stable { id: String, method: IdMethod },
    Synthetic { id: String },
}

impl Identity {
    pub fn id(&self) -> &str {
        match self {
            Identity::Stable { id, .. } | Identity::Synthetic { id } => id,
        }
    }

    pub fn method(&self) -> IdMethod {
        match self {
            Identity::Stable { method, .. } => *method,
            Identity::Synthetic { .. } => IdMethod::Hash,
        }
    }

    pub fn is_synthetic(&self) -> bool {
        matches!(self, Identity::Synthetic { .. })
    }
}

/// Fields shared by raw, labeled and review records, as they appear on disk.
///
/// Deserialization is lenient (defaults everywhere, snake_case aliases) because raw files may
/// come from older crawler versions or be edited by hand.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordBody {
    #[serde(default, alias = "source_id", skip_serializing_if = "Option::is_none")]
    pub fipi_id: Option<String>,
    #[serde(default)]
    pub id_synthetic: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_method: Option<IdMethod>,
    #[serde(default, alias = "statement_html")]
    pub statement_html: String,
    #[serde(default, alias = "statement_text", skip_serializing_if = "Option::is_none")]
    pub statement_text: Option<String>,
    #[serde(default, alias = "assetsUrls")]
    pub asset_urls: Vec<String>,
    /// Localized asset paths (`/fipi/<hash>.<ext>`); failed downloads are simply absent.
    #[serde(default)]
    pub assets: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
    #[serde(default, alias = "source_url")]
    pub source_url: String,
    #[serde(default, alias = "accessed_at")]
    pub accessed_at: String,
    #[serde(default)]
    pub checksum: String,
}

impl RecordBody {
    /// Rebuild the tagged identity from the flat on-disk fields.
    pub fn identity(&self) -> Option<Identity> {
        let id = self.fipi_id.as_deref().map(str::trim).filter(|s| !s.is_empty())?;
        let synthetic = self.id_synthetic || self.id_method == Some(IdMethod::Hash);
        Some(if synthetic {
            Identity::Synthetic { id: id.to_string() }
        } else {
            Identity::Stable {
                id: id.to_string(),
                method: self.id_method.unwrap_or(IdMethod::Detected),
            }
        })
    }

    pub fn set_identity(&mut self, identity: &Identity) {
        self.fipi_id = Some(identity.id().to_string());
        self.id_synthetic = identity.is_synthetic();
        self.id_method = Some(identity.method());
    }
}

/// One scraped card, before classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exam: Option<ExamId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<Level>,
    /// Task-number filter that was active when the card was scraped.
    #[serde(default, alias = "task_no", skip_serializing_if = "Option::is_none")]
    pub task_no: Option<u32>,
    #[serde(flatten)]
    pub body: RecordBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Validation {
    pub confidence: f64,
    pub hits: Vec<String>,
}

/// A confidently classified record in the taxonomy tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabeledRecord {
    pub exam: ExamId,
    pub level: Level,
    #[serde(alias = "task_no")]
    pub task_no: u32,
    pub subtopic: String,
    pub title: String,
    #[serde(flatten)]
    pub body: RecordBody,
    pub validation: Validation,
    /// Unknown fields from hand-edited files survive a merge.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    NeedsReview,
}

/// A record that did not reach classification confidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewRecord {
    pub status: ReviewStatus,
    pub exam: ExamId,
    pub level: Level,
    /// Best guess; 0 when nothing pointed at a task number.
    pub task_no: u32,
    pub subtopic: String,
    #[serde(flatten)]
    pub body: RecordBody,
}

pub const UNKNOWN_SUBTOPIC: &str = "unknown";

/// Which document a browser operation targets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameRef {
    Main,
    /// A child frame matched by name, or by a substring of its URL.
    Named(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameInfo {
    pub name: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Locator {
    /// Case-insensitive regex over the element's visible text.
    Text(String),
    Css(String),
}

/// Black-box browser automation capability.
///
/// Every call carries an explicit timeout. A timeout surfaces as `Error::Timeout`, which the
/// crawl loop treats as retryable.
#[async_trait::async_trait]
pub trait BrowserDriver: Send + Sync {
    async fn navigate(&self, frame: &FrameRef, url: &str, timeout: Duration) -> Result<()>;
    async fn wait_for_selector(
        &self,
        frame: &FrameRef,
        selector: &str,
        timeout: Duration,
    ) -> Result<()>;
    async fn frames(&self) -> Result<Vec<FrameInfo>>;
    /// Returns `Ok(false)` when the locator matched nothing.
    async fn click(&self, frame: &FrameRef, locator: &Locator, timeout: Duration) -> Result<bool>;
    /// Set the first `<select>`/`<input>` following the element matched by `label`.
    async fn fill_near_label(
        &self,
        frame: &FrameRef,
        label: &Locator,
        value: &str,
        timeout: Duration,
    ) -> Result<bool>;
    async fn wait_for_load(&self, frame: &FrameRef, timeout: Duration) -> Result<()>;
    async fn content(&self, frame: &FrameRef) -> Result<String>;
    async fn url(&self, frame: &FrameRef) -> Result<String>;
}

/// HTML sanitization capability.
pub trait Sanitizer: Send + Sync {
    fn name(&self) -> &'static str;
    fn sanitize(&self, html: &str) -> Result<String>;
}
