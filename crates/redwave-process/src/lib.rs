use std::fmt;

/// Opaque, never-reused identifier of a managed bot instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct InstanceId(pub String);

impl InstanceId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Cloning,
    Offline,
    Error,
    Online,
}

impl InstanceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            InstanceStatus::Cloning => "cloning",
            InstanceStatus::Offline => "offline",
            InstanceStatus::Error => "error",
            InstanceStatus::Online => "online",
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Error,
}

/// One entry of an instance's log history.
///
/// `seq` is strictly increasing per instance and survives ring eviction, so
/// observers can detect gaps and de-duplicate across a snapshot/live boundary.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct LogLine {
    pub instance_id: InstanceId,
    pub seq: u64,
    pub at_unix_ms: u64,
    pub severity: Severity,
    pub text: String,
}

impl LogLine {
    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

/// Template a manual or cloned instance was provisioned from.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TemplateRef {
    pub name: String,
    pub url: String,
    pub runtime: String,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct InstanceSnapshot {
    pub id: InstanceId,
    pub name: String,
    pub template: Option<TemplateRef>,
    pub runtime: String,
    pub working_dir: String,
    pub status: InstanceStatus,
    pub pid: Option<u32>,
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct StatusChange {
    pub id: InstanceId,
    pub status: InstanceStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_id_is_non_empty_and_unique() {
        let a = InstanceId::new();
        let b = InstanceId::new();
        assert!(!a.0.is_empty());
        assert_ne!(a, b);
    }

    #[test]
    fn status_serializes_as_lowercase() {
        let change = StatusChange {
            id: InstanceId("abc".to_string()),
            status: InstanceStatus::Online,
        };
        let json = serde_json::to_string(&change).unwrap();
        assert_eq!(json, r#"{"id":"abc","status":"online"}"#);
    }
}
