use std::sync::Arc;

use redwave_process::{
    InstanceId, InstanceSnapshot, LogLine, StatusChange, TemplateRef,
};
use tokio::sync::broadcast;

use crate::config::PanelConfig;
use crate::error::PanelError;
use crate::event_bus::{EventBus, LogSubscription};
use crate::provisioner::Provisioner;
use crate::registry::Registry;
use crate::supervisor::Supervisor;
use crate::templates::TemplateCatalog;

/// Boundary operations consumed by the HTTP layer. Every call returns as
/// soon as the request is accepted; clones and process lifetimes continue
/// on their own tasks and report through logs and status events.
#[derive(Clone, Debug)]
pub struct InstanceManager {
    registry: Registry,
    provisioner: Provisioner,
    supervisor: Supervisor,
    bus: EventBus,
    catalog: Arc<TemplateCatalog>,
}

impl InstanceManager {
    pub fn new(config: &PanelConfig) -> Self {
        let bus = EventBus::default();
        let catalog = Arc::new(TemplateCatalog::from_config(config));
        Self {
            registry: Registry::new(
                bus.clone(),
                catalog.clone(),
                config.bots_dir(),
                config.log_max_lines,
            ),
            provisioner: Provisioner::new(
                config.clone_command.clone(),
                config.clone_timeout(),
                catalog.clone(),
            ),
            supervisor: Supervisor::new(catalog.clone()),
            bus,
            catalog,
        }
    }

    pub fn templates(&self) -> Vec<TemplateRef> {
        self.catalog.list()
    }

    pub async fn create_instance(
        &self,
        name: &str,
        template: Option<&str>,
    ) -> Result<InstanceId, PanelError> {
        let instance = self.registry.create(name, template).await?;
        let id = instance.id().clone();

        match instance.template().cloned() {
            Some(template) => {
                self.provisioner.spawn(instance, template);
            }
            None => {
                // A failure leaves the instance in Error with the reason logged.
                let _ = self.provisioner.prepare_empty(&instance).await;
            }
        }
        Ok(id)
    }

    pub async fn start_instance(&self, id: &InstanceId) -> Result<Option<u32>, PanelError> {
        let instance = self.registry.get(id).await?;
        self.supervisor.start(&instance).await
    }

    pub async fn stop_instance(&self, id: &InstanceId) -> Result<(), PanelError> {
        let instance = self.registry.get(id).await?;
        self.supervisor.stop(&instance).await
    }

    pub async fn send_command(&self, id: &InstanceId, text: &str) -> Result<(), PanelError> {
        let instance = self.registry.get(id).await?;
        self.supervisor.send_input(&instance, text).await
    }

    pub async fn get_instance(&self, id: &InstanceId) -> Result<InstanceSnapshot, PanelError> {
        Ok(self.registry.get(id).await?.snapshot().await)
    }

    pub async fn list_instances(&self) -> Vec<InstanceSnapshot> {
        let instances = self.registry.list().await;
        let mut out = Vec::with_capacity(instances.len());
        for instance in instances {
            out.push(instance.snapshot().await);
        }
        out
    }

    /// Current history followed by live lines.
    pub async fn subscribe_logs(&self, id: &InstanceId) -> Result<LogSubscription, PanelError> {
        Ok(self.registry.get(id).await?.subscribe_logs().await)
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<StatusChange> {
        self.bus.subscribe_status()
    }

    pub async fn tail_logs(
        &self,
        id: &InstanceId,
        cursor: u64,
        limit: usize,
    ) -> Result<(Vec<LogLine>, u64), PanelError> {
        Ok(self.registry.get(id).await?.tail_logs(cursor, limit).await)
    }

    pub async fn instance_count(&self) -> usize {
        self.registry.len().await
    }
}
