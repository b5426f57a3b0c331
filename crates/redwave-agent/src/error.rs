use redwave_process::{InstanceId, InstanceStatus};

const MAX_MESSAGE_BYTES: usize = 32 * 1024;
const MAX_HINT_BYTES: usize = 8 * 1024;

/// Recoverable failures of instance operations. None of these take the
/// manager down; every path also leaves a line in the instance log.
#[derive(Debug, thiserror::Error)]
pub enum PanelError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("unknown instance: {0}")]
    NotFound(InstanceId),

    #[error("instance {id} is {status}")]
    AlreadyRunning {
        id: InstanceId,
        status: InstanceStatus,
    },

    #[error("instance {0} is not running")]
    NotRunning(InstanceId),

    #[error("provisioning failed: {0}")]
    ProvisionFailed(String),

    #[error("launch failed: {0}")]
    LaunchFailed(String),
}

impl PanelError {
    pub fn code(&self) -> &'static str {
        match self {
            PanelError::InvalidInput(_) => "invalid_input",
            PanelError::NotFound(_) => "not_found",
            PanelError::AlreadyRunning { .. } => "already_running",
            PanelError::NotRunning(_) => "not_running",
            PanelError::ProvisionFailed(_) => "provision_failed",
            PanelError::LaunchFailed(_) => "launch_failed",
        }
    }

    pub fn hint(&self) -> Option<String> {
        match self {
            PanelError::AlreadyRunning {
                status: InstanceStatus::Cloning,
                ..
            } => Some("Wait for the clone to finish, then start again.".to_string()),
            PanelError::NotRunning(_) => Some("Start the instance first.".to_string()),
            PanelError::ProvisionFailed(_) => Some(
                "Check the template URL and network access, then create the instance again."
                    .to_string(),
            ),
            PanelError::LaunchFailed(_) => Some(
                "Make sure the runtime is installed and the dependencies were installed in the working directory."
                    .to_string(),
            ),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl From<&PanelError> for ErrorPayload {
    fn from(err: &PanelError) -> Self {
        Self {
            code: err.code().to_string(),
            message: truncate_utf8(&err.to_string(), MAX_MESSAGE_BYTES),
            hint: err.hint().map(|h| truncate_utf8(&h, MAX_HINT_BYTES)),
        }
    }
}

pub(crate) fn truncate_utf8(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }

    let suffix = "…(truncated)";
    let keep = max_bytes.saturating_sub(suffix.len()).max(1);
    let mut end = keep.min(s.len());
    while end > 0 && !s.is_char_boundary(end) {
        end = end.saturating_sub(1);
    }
    let mut out = s[..end].to_string();
    out.push_str(suffix);
    out
}

pub(crate) fn format_error_chain(err: &anyhow::Error) -> String {
    let mut parts = Vec::<String>::new();
    for cause in err.chain() {
        let s = cause.to_string();
        if s.is_empty() {
            continue;
        }
        if parts.last() == Some(&s) {
            continue;
        }
        parts.push(s);
    }
    if parts.is_empty() {
        "unknown error".to_string()
    } else {
        parts.join(": ")
    }
}
