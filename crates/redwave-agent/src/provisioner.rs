use std::{path::Path, sync::Arc, time::Duration};

use anyhow::Context;
use redwave_process::{InstanceStatus, TemplateRef};
use tokio::{process::Command, task::JoinHandle};

use crate::error::{PanelError, format_error_chain, truncate_utf8};
use crate::registry::Instance;
use crate::templates::TemplateCatalog;

const MAX_STDERR_BYTES: usize = 2 * 1024;

/// Materializes instance working directories by running the configured clone
/// command (`git clone` by default) against a template URL.
#[derive(Clone, Debug)]
pub struct Provisioner {
    clone_command: Arc<Vec<String>>,
    timeout: Duration,
    catalog: Arc<TemplateCatalog>,
}

impl Provisioner {
    pub fn new(clone_command: Vec<String>, timeout: Duration, catalog: Arc<TemplateCatalog>) -> Self {
        Self {
            clone_command: Arc::new(clone_command),
            timeout,
            catalog,
        }
    }

    /// Runs `provision` on its own task; clones of different instances never
    /// wait on each other.
    pub fn spawn(&self, instance: Arc<Instance>, template: TemplateRef) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            // Outcome is already in the instance log and status.
            let _ = this.provision(&instance, &template).await;
        })
    }

    /// Cloning -> Offline on success, Cloning -> Error on failure. No retry.
    pub async fn provision(
        &self,
        instance: &Instance,
        template: &TemplateRef,
    ) -> Result<(), PanelError> {
        let dest = instance.working_dir();
        instance
            .info(format!(
                "[GIT] Running: {} {} {}",
                self.clone_command.join(" "),
                template.url,
                dest.display()
            ))
            .await;

        match self.run_clone(&template.url, dest).await {
            Ok(()) => {
                instance.info("[GIT] Repository cloned.").await;
                instance.transition(InstanceStatus::Offline).await?;
                instance
                    .error(format!(
                        "[CRITICAL NOTICE] REQUIRED STEP: enter {} and run '{}' before starting.",
                        dest.display(),
                        self.catalog.install_hint(instance.runtime())
                    ))
                    .await;
                tracing::info!(instance = %instance.id(), template = %template.name, "clone finished");
                Ok(())
            }
            Err(err) => {
                let reason = format_error_chain(&err);
                tracing::warn!(instance = %instance.id(), template = %template.name, %reason, "clone failed");
                instance
                    .error(format!("[GIT ERROR] Clone failed. {reason}"))
                    .await;
                instance.transition(InstanceStatus::Error).await?;
                Err(PanelError::ProvisionFailed(reason))
            }
        }
    }

    async fn run_clone(&self, url: &str, dest: &Path) -> anyhow::Result<()> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create {}", parent.display()))?;
        }

        let (program, args) = self
            .clone_command
            .split_first()
            .ok_or_else(|| anyhow::anyhow!("clone command is empty"))?;

        let child = Command::new(program)
            .args(args)
            .arg(url)
            .arg(dest)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            // Dropping the wait future on timeout kills the clone.
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawn {program}"))?;

        let out = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(res) => res.with_context(|| format!("wait for {program}"))?,
            Err(_) => anyhow::bail!("timed out after {}ms", self.timeout.as_millis()),
        };

        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            let stderr = truncate_utf8(stderr.trim(), MAX_STDERR_BYTES);
            let code = out
                .status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "none".to_string());
            if stderr.is_empty() {
                anyhow::bail!("{program} exited with code {code}");
            }
            anyhow::bail!("{program} exited with code {code}: {stderr}");
        }
        Ok(())
    }

    /// Manual instances have nothing to clone; only their directory is made.
    pub async fn prepare_empty(&self, instance: &Instance) -> Result<(), PanelError> {
        let dir = instance.working_dir();
        match tokio::fs::create_dir_all(dir).await {
            Ok(()) => Ok(()),
            Err(err) => {
                let reason = format!("create {}: {err}", dir.display());
                instance
                    .error(format!("[SYSTEM ERROR] Could not prepare working directory. {reason}"))
                    .await;
                instance.transition(InstanceStatus::Error).await?;
                Err(PanelError::ProvisionFailed(reason))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use redwave_process::StatusChange;
    use tokio::sync::broadcast;

    use super::*;
    use crate::event_bus::EventBus;
    use crate::registry::Registry;
    use crate::test_support::{self, wait_for_status};

    struct Harness {
        tmp: tempfile::TempDir,
        registry: Registry,
        provisioner: Provisioner,
        status_rx: broadcast::Receiver<StatusChange>,
    }

    fn harness(timeout: Duration) -> Harness {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = test_support::config(tmp.path());
        let bus = EventBus::default();
        let catalog = Arc::new(TemplateCatalog::from_config(&cfg));
        Harness {
            registry: Registry::new(bus.clone(), catalog.clone(), cfg.bots_dir(), 0),
            provisioner: Provisioner::new(cfg.clone_command.clone(), timeout, catalog),
            status_rx: bus.subscribe_status(),
            tmp,
        }
    }

    #[tokio::test]
    async fn successful_clone_goes_offline_with_install_reminder() {
        let mut h = harness(Duration::from_secs(10));
        let inst = h.registry.create("Foo", Some("T1")).await.unwrap();
        let template = inst.template().cloned().unwrap();

        h.provisioner.provision(&inst, &template).await.unwrap();

        wait_for_status(&mut h.status_rx, inst.id(), InstanceStatus::Cloning).await;
        wait_for_status(&mut h.status_rx, inst.id(), InstanceStatus::Offline).await;
        assert!(inst.working_dir().is_dir());
        assert!(inst.working_dir().starts_with(h.tmp.path()));

        let history = inst.history().await;
        let texts: Vec<_> = history.iter().map(|l| l.text.as_str()).collect();
        assert!(texts[0].contains("Starting clone of T1"));
        assert!(texts[1].starts_with("[GIT] Running: sh -c"));
        assert_eq!(texts[2], "[GIT] Repository cloned.");
        assert!(texts[3].contains("REQUIRED STEP"));
        assert!(texts[3].contains("npm ci"));
        assert!(history[3].is_error());
        assert_eq!(history.len(), 4);
    }

    #[tokio::test]
    async fn failed_clone_goes_to_error_with_reason() {
        let mut h = harness(Duration::from_secs(10));
        let inst = h.registry.create("Bar", Some("Broken")).await.unwrap();
        let template = inst.template().cloned().unwrap();

        let err = h.provisioner.provision(&inst, &template).await.unwrap_err();
        assert!(matches!(err, PanelError::ProvisionFailed(ref m) if m.contains("128")));

        wait_for_status(&mut h.status_rx, inst.id(), InstanceStatus::Error).await;
        let errors: Vec<_> = inst
            .history()
            .await
            .into_iter()
            .filter(|l| l.is_error())
            .collect();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].text.starts_with("[GIT ERROR] Clone failed."));
        assert!(errors[0].text.contains("repository not found"));
    }

    #[tokio::test]
    async fn slow_clone_times_out_into_error() {
        let mut h = harness(Duration::from_millis(200));
        let inst = h.registry.create("Baz", Some("Slow")).await.unwrap();
        let template = inst.template().cloned().unwrap();

        let started = tokio::time::Instant::now();
        h.provisioner.spawn(inst.clone(), template).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));

        wait_for_status(&mut h.status_rx, inst.id(), InstanceStatus::Error).await;
        let last = inst.history().await.pop().unwrap();
        assert!(last.text.contains("timed out after 200ms"), "{}", last.text);
    }

    #[tokio::test]
    async fn unwritable_parent_fails_provisioning() {
        let mut h = harness(Duration::from_secs(10));
        // A regular file where the bots directory should be.
        std::fs::write(h.registry.bots_dir(), b"not a dir").unwrap();
        let inst = h.registry.create("Qux", Some("T1")).await.unwrap();
        let template = inst.template().cloned().unwrap();

        let err = h.provisioner.provision(&inst, &template).await.unwrap_err();
        assert!(matches!(err, PanelError::ProvisionFailed(_)));
        wait_for_status(&mut h.status_rx, inst.id(), InstanceStatus::Error).await;
    }

    #[tokio::test]
    async fn concurrent_clones_are_independent() {
        let mut h = harness(Duration::from_secs(3));
        let slow = h.registry.create("slow", Some("Slow")).await.unwrap();
        let fast = h.registry.create("fast", Some("T1")).await.unwrap();

        h.provisioner
            .spawn(slow.clone(), slow.template().cloned().unwrap());
        h.provisioner
            .spawn(fast.clone(), fast.template().cloned().unwrap());

        // The fast clone finishes while the slow one is still running.
        wait_for_status(&mut h.status_rx, fast.id(), InstanceStatus::Offline).await;
        assert_eq!(slow.status().await, InstanceStatus::Cloning);
    }

    #[tokio::test]
    async fn prepare_empty_creates_directory() {
        let h = harness(Duration::from_secs(1));
        let inst = h.registry.create("manual", None).await.unwrap();
        h.provisioner.prepare_empty(&inst).await.unwrap();
        assert!(inst.working_dir().is_dir());
        assert_eq!(inst.status().await, InstanceStatus::Offline);
    }
}
