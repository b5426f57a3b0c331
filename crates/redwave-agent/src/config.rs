use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use serde::Deserialize;

use crate::templates::{self, RuntimeSpec, TemplateSpec};

const DEFAULT_CONFIG_PATH: &str = "redwave.toml";
const DEFAULT_LISTEN: &str = "0.0.0.0:3000";
const DEFAULT_LOG_MAX_LINES: usize = 1000;
const DEFAULT_CLONE_TIMEOUT_SEC: u64 = 120;

fn clamp_log_max_lines(v: usize) -> usize {
    v.clamp(100, 50_000)
}

fn clamp_clone_timeout_sec(v: u64) -> u64 {
    v.clamp(1, 60 * 60)
}

fn absolutize(p: PathBuf) -> PathBuf {
    if p.is_absolute() {
        return p;
    }
    std::env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join(p)
}

/// Panel configuration: `redwave.toml` (optional) plus `REDWAVE_*` env overrides.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PanelConfig {
    pub listen: String,
    pub data_root: PathBuf,
    pub log_max_lines: usize,
    pub clone_timeout_sec: u64,
    /// Program + leading args; the remote URL and destination are appended.
    pub clone_command: Vec<String>,
    /// Runtime used by instances created without a template.
    pub default_runtime: String,
    pub runtimes: BTreeMap<String, RuntimeSpec>,
    pub templates: Vec<TemplateSpec>,
}

impl Default for PanelConfig {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN.to_string(),
            data_root: PathBuf::from("./data"),
            log_max_lines: DEFAULT_LOG_MAX_LINES,
            clone_timeout_sec: DEFAULT_CLONE_TIMEOUT_SEC,
            clone_command: vec!["git".to_string(), "clone".to_string()],
            default_runtime: "node".to_string(),
            runtimes: templates::default_runtimes(),
            templates: templates::default_templates(),
        }
    }
}

impl PanelConfig {
    /// Load from `REDWAVE_CONFIG` (must exist when set) or `./redwave.toml`
    /// (optional), then apply env overrides.
    pub fn load() -> anyhow::Result<Self> {
        let explicit = std::env::var("REDWAVE_CONFIG").ok();
        let path = PathBuf::from(explicit.as_deref().unwrap_or(DEFAULT_CONFIG_PATH));

        let mut cfg = if explicit.is_some() || path.exists() {
            Self::from_file(&path)?
        } else {
            Self::default()
        };

        cfg.apply_env(|name| std::env::var(name).ok());
        cfg.data_root = absolutize(cfg.data_root);
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        Self::from_toml_str(&raw).with_context(|| format!("parse config {}", path.display()))
    }

    pub fn from_toml_str(raw: &str) -> anyhow::Result<Self> {
        let mut cfg: PanelConfig = toml::from_str(raw)?;
        cfg.log_max_lines = clamp_log_max_lines(cfg.log_max_lines);
        cfg.clone_timeout_sec = clamp_clone_timeout_sec(cfg.clone_timeout_sec);
        Ok(cfg)
    }

    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("REDWAVE_LISTEN").filter(|v| !v.trim().is_empty()) {
            self.listen = v.trim().to_string();
        }
        if let Some(v) = lookup("REDWAVE_DATA_ROOT").filter(|v| !v.trim().is_empty()) {
            self.data_root = PathBuf::from(v.trim());
        }
        if let Some(v) = lookup("REDWAVE_LOG_MAX_LINES").and_then(|v| v.parse::<usize>().ok()) {
            self.log_max_lines = clamp_log_max_lines(v);
        }
        if let Some(v) = lookup("REDWAVE_CLONE_TIMEOUT_SEC").and_then(|v| v.parse::<u64>().ok())
        {
            self.clone_timeout_sec = clamp_clone_timeout_sec(v);
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.clone_command.first().is_none_or(|p| p.trim().is_empty()) {
            anyhow::bail!("clone_command must name a program");
        }
        if !self.runtimes.contains_key(&self.default_runtime) {
            anyhow::bail!("default_runtime {:?} is not defined", self.default_runtime);
        }
        for (kind, rt) in &self.runtimes {
            if rt.command.trim().is_empty() {
                anyhow::bail!("runtime {kind:?} has an empty command");
            }
        }

        let mut seen = std::collections::BTreeSet::new();
        for t in &self.templates {
            if t.name.trim().is_empty() {
                anyhow::bail!("template with url {:?} has an empty name", t.url);
            }
            if !seen.insert(t.name.as_str()) {
                anyhow::bail!("duplicate template name: {}", t.name);
            }
            if !self.runtimes.contains_key(&t.runtime) {
                anyhow::bail!(
                    "template {:?} references unknown runtime {:?}",
                    t.name,
                    t.runtime
                );
            }
        }
        Ok(())
    }

    pub fn clone_timeout(&self) -> Duration {
        Duration::from_secs(self.clone_timeout_sec)
    }

    /// Parent of every instance working directory.
    pub fn bots_dir(&self) -> PathBuf {
        self.data_root.join("bots")
    }
}
