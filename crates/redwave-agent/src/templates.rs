use std::collections::BTreeMap;

use redwave_process::TemplateRef;
use serde::{Deserialize, Serialize};

use crate::config::PanelConfig;

/// How to launch a bot of a given runtime kind.
///
/// NOTE: operators never send commands; instances map to a runtime kind and
/// the agent only ever spawns these fixed specs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeSpec {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Dependency installation step the operator must run before the first start.
    #[serde(default)]
    pub install_hint: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateSpec {
    pub name: String,
    pub url: String,
    pub runtime: String,
}

pub fn default_runtimes() -> BTreeMap<String, RuntimeSpec> {
    let mut out = BTreeMap::new();
    out.insert(
        "node".to_string(),
        RuntimeSpec {
            command: "node".to_string(),
            args: vec!["index.js".to_string()],
            install_hint: Some("npm install".to_string()),
        },
    );
    out
}

pub fn default_templates() -> Vec<TemplateSpec> {
    vec![
        TemplateSpec {
            name: "BlackBot-WA".to_string(),
            url: "https://github.com/bronxys/Black.git".to_string(),
            runtime: "node".to_string(),
        },
        TemplateSpec {
            name: "NazunaBot-WA".to_string(),
            url: "https://github.com/bronxys/Nazuna.git".to_string(),
            runtime: "node".to_string(),
        },
    ]
}

#[derive(Debug, Clone)]
pub struct TemplateCatalog {
    templates: Vec<TemplateSpec>,
    runtimes: BTreeMap<String, RuntimeSpec>,
    default_runtime: String,
}

impl TemplateCatalog {
    pub fn from_config(cfg: &PanelConfig) -> Self {
        Self {
            templates: cfg.templates.clone(),
            runtimes: cfg.runtimes.clone(),
            default_runtime: cfg.default_runtime.clone(),
        }
    }

    pub fn list(&self) -> Vec<TemplateRef> {
        self.templates.iter().map(to_ref).collect()
    }

    pub fn find(&self, name: &str) -> Option<TemplateRef> {
        self.templates.iter().find(|t| t.name == name).map(to_ref)
    }

    pub fn runtime(&self, kind: &str) -> Option<&RuntimeSpec> {
        self.runtimes.get(kind)
    }

    pub fn default_runtime(&self) -> &str {
        &self.default_runtime
    }

    pub fn install_hint(&self, kind: &str) -> String {
        self.runtime(kind)
            .and_then(|rt| rt.install_hint.clone())
            .unwrap_or_else(|| "the bot's dependency installation".to_string())
    }
}

fn to_ref(t: &TemplateSpec) -> TemplateRef {
    TemplateRef {
        name: t.name.clone(),
        url: t.url.clone(),
        runtime: t.runtime.clone(),
    }
}
