use std::fmt;

use serde::{Deserialize, Serialize};

pub const DEFAULT_PROMPT: &str = "What is this?";
pub const NO_IMAGE_MESSAGE: &str = "Please upload an image first.";
pub const READ_FAILURE_MESSAGE: &str = "Failed to read the file.";
pub const EMPTY_IMAGE_DATA_MESSAGE: &str = "Failed to read image data.";
pub const EMPTY_RESPONSE_FALLBACK: &str = "No response received from the AI model.";
pub const REMOTE_FAILURE_PREFIX: &str = "An error occurred while analyzing the image";

/// Where the current analysis attempt stands. A front end renders from this
/// value alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleStatus {
    #[default]
    Idle,
    Pending,
    Succeeded,
    Failed,
}

impl LifecycleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Pending => "pending",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl fmt::Display for LifecycleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    NoImage,
    Read,
    Remote,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoImage => "no_image",
            Self::Read => "read",
            Self::Remote => "remote",
        }
    }
}

/// Terminal result of the most recent analysis attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AnalysisOutcome {
    Text { text: String },
    Failed { kind: FailureKind, message: String },
}

impl AnalysisOutcome {
    /// Builds the success outcome for a resolved call. Empty or absent text is
    /// still a success and shows the fallback message.
    pub fn from_reply_text(text: Option<&str>) -> Self {
        let text = text
            .filter(|value| !value.is_empty())
            .unwrap_or(EMPTY_RESPONSE_FALLBACK);
        Self::Text {
            text: text.to_string(),
        }
    }

    pub fn failed(kind: FailureKind, message: impl Into<String>) -> Self {
        Self::Failed {
            kind,
            message: message.into(),
        }
    }

    pub fn no_image() -> Self {
        Self::failed(FailureKind::NoImage, NO_IMAGE_MESSAGE)
    }

    pub fn remote(detail: &str) -> Self {
        let detail = detail.trim();
        let message = if detail.is_empty() {
            format!("{REMOTE_FAILURE_PREFIX}.")
        } else {
            format!("{REMOTE_FAILURE_PREFIX}: {detail}")
        };
        Self::failed(FailureKind::Remote, message)
    }

    pub fn text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text.as_str()),
            Self::Failed { .. } => None,
        }
    }

    pub fn failure(&self) -> Option<&str> {
        match self {
            Self::Failed { message, .. } => Some(message.as_str()),
            Self::Text { .. } => None,
        }
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Self::Failed { kind, .. } => Some(*kind),
            Self::Text { .. } => None,
        }
    }

    pub fn status(&self) -> LifecycleStatus {
        match self {
            Self::Text { .. } => LifecycleStatus::Succeeded,
            Self::Failed { .. } => LifecycleStatus::Failed,
        }
    }
}

/// One call against the external analysis contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalyzeCall {
    pub prompt: String,
    /// Base64 (standard alphabet) encoding of the image bytes.
    pub image_data: String,
    pub mime_type: String,
    pub model: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnalyzeReply {
    pub text: Option<String>,
    pub model: String,
    pub input_tokens: Option<i64>,
    pub output_tokens: Option<i64>,
}
