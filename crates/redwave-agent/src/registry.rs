use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use redwave_process::{
    InstanceId, InstanceSnapshot, InstanceStatus, LogLine, Severity, StatusChange, TemplateRef,
};
use tokio::sync::{Mutex, MutexGuard, RwLock};

use crate::error::PanelError;
use crate::event_bus::{EventBus, LogSubscription, LogTopic};
use crate::log_buffer::LogBuffer;
use crate::supervisor::RunningProcess;
use crate::templates::TemplateCatalog;

const MAX_DIR_NAME_CHARS: usize = 30;

/// Maps every char outside `[A-Za-z0-9]` to `-` and caps the length.
pub fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .take(MAX_DIR_NAME_CHARS)
        .collect()
}

fn working_dir_name(name: &str, id: &InstanceId) -> String {
    format!("{}-{}", sanitize_name(name), id)
}

/// Mutable part of an instance. Status and process handle only ever change
/// together, under this lock.
#[derive(Debug)]
pub(crate) struct InstanceState {
    pub(crate) status: InstanceStatus,
    pub(crate) process: Option<RunningProcess>,
    pub(crate) exit_code: Option<i32>,
}

#[derive(Debug)]
pub struct Instance {
    id: InstanceId,
    name: String,
    template: Option<TemplateRef>,
    runtime: String,
    working_dir: PathBuf,
    state: Mutex<InstanceState>,
    logs: Mutex<LogBuffer>,
    log_topic: LogTopic,
    bus: EventBus,
}

impl Instance {
    pub fn id(&self) -> &InstanceId {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn template(&self) -> Option<&TemplateRef> {
        self.template.as_ref()
    }

    pub fn runtime(&self) -> &str {
        &self.runtime
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    /// Appends to the history and publishes on the instance topic while the
    /// buffer lock is held, so a concurrent `subscribe_logs` never sees a line
    /// twice or misses it.
    pub async fn log(&self, severity: Severity, text: impl Into<String>) -> LogLine {
        let mut logs = self.logs.lock().await;
        let line = logs.push(severity, text);
        tracing::debug!(instance = %self.id, seq = line.seq, error = line.is_error(), "{}", line.text);
        self.log_topic.publish(line.clone());
        line
    }

    pub async fn info(&self, text: impl Into<String>) -> LogLine {
        self.log(Severity::Info, text).await
    }

    pub async fn error(&self, text: impl Into<String>) -> LogLine {
        self.log(Severity::Error, text).await
    }

    pub async fn status(&self) -> InstanceStatus {
        self.state.lock().await.status
    }

    pub(crate) async fn lock_state(&self) -> MutexGuard<'_, InstanceState> {
        self.state.lock().await
    }

    /// Must be called with the state lock held; publishes the change.
    pub(crate) fn set_status(&self, state: &mut InstanceState, status: InstanceStatus) {
        if state.status == status {
            return;
        }
        tracing::info!(instance = %self.id, from = %state.status, to = %status, "status change");
        state.status = status;
        self.bus.publish_status(StatusChange {
            id: self.id.clone(),
            status,
        });
    }

    /// Moves between the non-running states. `Online` is only ever entered
    /// by the supervisor together with a process handle.
    pub(crate) async fn transition(&self, status: InstanceStatus) -> Result<(), PanelError> {
        if status == InstanceStatus::Online {
            return Err(PanelError::InvalidInput(
                "online is set by starting the instance".to_string(),
            ));
        }
        let mut state = self.state.lock().await;
        self.set_status(&mut state, status);
        Ok(())
    }

    pub async fn snapshot(&self) -> InstanceSnapshot {
        let state = self.state.lock().await;
        InstanceSnapshot {
            id: self.id.clone(),
            name: self.name.clone(),
            template: self.template.clone(),
            runtime: self.runtime.clone(),
            working_dir: self.working_dir.display().to_string(),
            status: state.status,
            pid: state.process.as_ref().and_then(|p| p.pid),
            exit_code: state.exit_code,
        }
    }

    pub async fn history(&self) -> Vec<LogLine> {
        self.logs.lock().await.snapshot()
    }

    pub async fn tail_logs(&self, cursor: u64, limit: usize) -> (Vec<LogLine>, u64) {
        self.logs.lock().await.tail_after(cursor, limit)
    }

    /// History snapshot plus a live receiver taken atomically.
    pub async fn subscribe_logs(&self) -> LogSubscription {
        let logs = self.logs.lock().await;
        LogSubscription {
            history: logs.snapshot(),
            live: self.log_topic.subscribe(),
        }
    }
}

#[derive(Debug, Default)]
struct RegistryInner {
    order: Vec<Arc<Instance>>,
    by_id: HashMap<InstanceId, Arc<Instance>>,
}

/// Owns every instance record for the lifetime of the manager.
#[derive(Clone, Debug)]
pub struct Registry {
    inner: Arc<RwLock<RegistryInner>>,
    bus: EventBus,
    catalog: Arc<TemplateCatalog>,
    bots_dir: PathBuf,
    log_max_lines: usize,
}

impl Registry {
    pub fn new(
        bus: EventBus,
        catalog: Arc<TemplateCatalog>,
        bots_dir: PathBuf,
        log_max_lines: usize,
    ) -> Self {
        Self {
            inner: Arc::new(RwLock::new(RegistryInner::default())),
            bus,
            catalog,
            bots_dir,
            log_max_lines,
        }
    }

    pub fn bots_dir(&self) -> &Path {
        &self.bots_dir
    }

    /// Registers a new instance and returns immediately; provisioning is the
    /// caller's business.
    pub async fn create(
        &self,
        name: &str,
        template: Option<&str>,
    ) -> Result<Arc<Instance>, PanelError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(PanelError::InvalidInput(
                "instance name must be non-empty".to_string(),
            ));
        }

        let template = match template.map(str::trim).filter(|t| !t.is_empty()) {
            Some(t) => Some(
                self.catalog
                    .find(t)
                    .ok_or_else(|| PanelError::InvalidInput(format!("unknown template: {t}")))?,
            ),
            None => None,
        };
        let runtime = template
            .as_ref()
            .map(|t| t.runtime.clone())
            .unwrap_or_else(|| self.catalog.default_runtime().to_string());

        let id = InstanceId::new();
        let status = if template.is_some() {
            InstanceStatus::Cloning
        } else {
            InstanceStatus::Offline
        };

        let instance = Arc::new(Instance {
            id: id.clone(),
            name: name.to_string(),
            template,
            runtime,
            working_dir: self.bots_dir.join(working_dir_name(name, &id)),
            state: Mutex::new(InstanceState {
                status,
                process: None,
                exit_code: None,
            }),
            logs: Mutex::new(LogBuffer::new(id.clone(), self.log_max_lines)),
            log_topic: self.bus.open_log_topic(&id).await,
            bus: self.bus.clone(),
        });

        {
            let mut inner = self.inner.write().await;
            if inner.by_id.contains_key(&id) {
                tracing::error!(%id, "instance id collision");
                return Err(PanelError::InvalidInput(format!(
                    "instance id collision: {id}"
                )));
            }
            inner.by_id.insert(id.clone(), instance.clone());
            inner.order.push(instance.clone());
        }

        match instance.template() {
            Some(t) => instance.info(format!("[SYSTEM] Starting clone of {}", t.name)).await,
            None => instance.info("[SYSTEM] Instance created without a template").await,
        };
        self.bus.publish_status(StatusChange {
            id: id.clone(),
            status,
        });

        tracing::info!(
            %id,
            name,
            template = instance.template().map(|t| t.name.as_str()),
            dir = %instance.working_dir().display(),
            "instance created"
        );
        Ok(instance)
    }

    pub async fn get(&self, id: &InstanceId) -> Result<Arc<Instance>, PanelError> {
        self.inner
            .read()
            .await
            .by_id
            .get(id)
            .cloned()
            .ok_or_else(|| PanelError::NotFound(id.clone()))
    }

    /// Creation order.
    pub async fn list(&self) -> Vec<Arc<Instance>> {
        self.inner.read().await.order.clone()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.order.len()
    }

    pub async fn update_status(
        &self,
        id: &InstanceId,
        status: InstanceStatus,
    ) -> Result<(), PanelError> {
        self.get(id).await?.transition(status).await
    }
}
