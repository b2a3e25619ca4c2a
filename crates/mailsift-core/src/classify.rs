use async_trait::async_trait;
use thiserror::Error;

/// A candidate category offered to the classifier, with the user's own
/// description of what belongs in it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategoryChoice {
    pub name: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifyInput {
    pub subject: Option<String>,
    pub sender: Option<String>,
    pub body: Option<String>,
    pub categories: Vec<CategoryChoice>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    /// One of the offered category names, or None when nothing fits.
    pub category: Option<String>,
    pub summary: String,
    pub confidence: f32,
}

#[derive(Debug, Error)]
pub enum ClassifyError {
    #[error("classifier unavailable: {0}")]
    Unavailable(String),
    #[error("invalid classifier output: {0}")]
    InvalidOutput(String),
}

/// Classifies a notification message into one of the user's categories and
/// produces a one-line summary. Implementations are expected to be remote
/// and fallible; callers treat errors as retryable.
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, input: &ClassifyInput) -> Result<Classification, ClassifyError>;
}

/// Deterministic summary used when the classifier declines or fails hard:
/// the subject, or the leading body text when no subject is present.
pub fn fallback_summary(subject: Option<&str>, body: Option<&str>) -> String {
    if let Some(subject) = subject {
        let trimmed = subject.trim();
        if !trimmed.is_empty() {
            return truncate(trimmed, 120);
        }
    }

    if let Some(body) = body {
        let first_line = body.lines().find(|line| !line.trim().is_empty());
        if let Some(line) = first_line {
            return truncate(line.trim(), 120);
        }
    }

    "(no content)".to_string()
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let truncated: String = text.chars().take(max_chars).collect();
    format!("{truncated}…")
}

/// Keyword matcher used in tests and as a zero-dependency default. Picks the
/// first category whose name appears in the subject or body.
#[derive(Debug, Clone, Default)]
pub struct KeywordClassifier;

#[async_trait]
impl Classifier for KeywordClassifier {
    async fn classify(&self, input: &ClassifyInput) -> Result<Classification, ClassifyError> {
        let haystack = format!(
            "{} {}",
            input.subject.as_deref().unwrap_or(""),
            input.body.as_deref().unwrap_or("")
        )
        .to_ascii_lowercase();

        let category = input
            .categories
            .iter()
            .find(|c| haystack.contains(&c.name.to_ascii_lowercase()))
            .map(|c| c.name.clone());

        let confidence = if category.is_some() { 0.9 } else { 0.0 };
        Ok(Classification {
            category,
            summary: fallback_summary(input.subject.as_deref(), input.body.as_deref()),
            confidence,
        })
    }
}
