use serde::{Deserialize, Serialize};

/// `action` value that marks a client message as a processing result.
pub const RESULT_ACTION: &str = "result";

/// Status carried by a client result message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AckStatus {
    Success,
    Skipped,
    /// Anything else (`failed`, `deferred`, ...). Never removes the item.
    Other(String),
}

impl AckStatus {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "success" => Self::Success,
            "skipped" => Self::Skipped,
            other => Self::Other(other.to_string()),
        }
    }

    /// Whether this status releases the item from the queue.
    pub fn is_completion(&self) -> bool {
        matches!(self, Self::Success | Self::Skipped)
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Success => "success",
            Self::Skipped => "skipped",
            Self::Other(s) => s,
        }
    }
}

/// Inbound client message. Every field is optional; shape checks happen in
/// [`ResultMessage::classify`] rather than at parse time.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultMessage {
    pub action: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub status: Option<String>,
    pub request_id: Option<String>,
}

/// What a parsed client message asks the relay to do.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Acknowledgment {
    /// Completion status for an item: remove it.
    Complete { request_id: String, status: AckStatus },
    /// Non-completion status for an item: keep it, back off for this client.
    Defer { request_id: String, status: AckStatus },
    /// Not a result message, or one without a usable id/status.
    Irrelevant,
}

impl ResultMessage {
    /// Parse a text frame. Non-object JSON and wrongly-typed fields are errors.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn is_result(&self) -> bool {
        self.action.as_deref() == Some(RESULT_ACTION)
    }

    pub fn classify(&self) -> Acknowledgment {
        if !self.is_result() {
            return Acknowledgment::Irrelevant;
        }
        let (Some(request_id), Some(status)) = (self.request_id.as_deref(), self.status.as_deref())
        else {
            return Acknowledgment::Irrelevant;
        };
        if request_id.is_empty() {
            return Acknowledgment::Irrelevant;
        }
        let status = AckStatus::parse(status);
        let request_id = request_id.to_string();
        if status.is_completion() {
            Acknowledgment::Complete { request_id, status }
        } else {
            Acknowledgment::Defer { request_id, status }
        }
    }
}
