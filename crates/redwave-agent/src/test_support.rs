use std::{collections::BTreeMap, path::Path, time::Duration};

use redwave_process::{InstanceId, InstanceStatus, StatusChange};
use tokio::sync::broadcast;

use crate::config::PanelConfig;
use crate::templates::{RuntimeSpec, TemplateSpec};

/// `$1` is the URL, `$2` the destination.
const FAKE_CLONE: &str = r#"case "$1" in
  *broken*) echo "fatal: repository not found" >&2; exit 128 ;;
  *slow*) sleep 5 ;;
  *) mkdir -p "$2" ;;
esac"#;

fn sh(script: &str) -> RuntimeSpec {
    RuntimeSpec {
        command: "sh".to_string(),
        args: vec!["-c".to_string(), script.to_string()],
        install_hint: None,
    }
}

fn template(name: &str, url: &str, runtime: &str) -> TemplateSpec {
    TemplateSpec {
        name: name.to_string(),
        url: url.to_string(),
        runtime: runtime.to_string(),
    }
}

/// Config rooted at `root` whose clone command and runtimes are plain `sh`.
pub(crate) fn config(root: &Path) -> PanelConfig {
    let mut runtimes = BTreeMap::new();
    runtimes.insert(
        "cat".to_string(),
        RuntimeSpec {
            command: "cat".to_string(),
            args: Vec::new(),
            install_hint: Some("npm ci".to_string()),
        },
    );
    runtimes.insert(
        "chatty".to_string(),
        sh("for i in 1 2 3 4 5; do echo out$i; done; echo warned >&2"),
    );
    runtimes.insert("crashy".to_string(), sh("exit 7"));
    runtimes.insert("suicidal".to_string(), sh("kill -TERM $$"));
    // Exits at once while a background child keeps stdout/stderr open.
    runtimes.insert(
        "orphaning".to_string(),
        sh("sleep 5 & echo parent-done; exit 0"),
    );
    // Keeps stdin open but never reads it.
    runtimes.insert("deaf".to_string(), sh("exec sleep 30"));

    PanelConfig {
        listen: "127.0.0.1:0".to_string(),
        data_root: root.to_path_buf(),
        log_max_lines: 1000,
        clone_timeout_sec: 10,
        clone_command: vec![
            "sh".to_string(),
            "-c".to_string(),
            FAKE_CLONE.to_string(),
            "clone".to_string(),
        ],
        default_runtime: "cat".to_string(),
        runtimes,
        templates: vec![
            template("T1", "https://example.invalid/t1.git", "cat"),
            template("Broken", "https://example.invalid/broken.git", "cat"),
            template("Slow", "https://example.invalid/slow.git", "cat"),
            template("Echo", "https://example.invalid/echo.git", "cat"),
            template("Chatty", "https://example.invalid/chatty.git", "chatty"),
            template("Crashy", "https://example.invalid/crashy.git", "crashy"),
            template("Suicidal", "https://example.invalid/suicidal.git", "suicidal"),
            template("Orphaning", "https://example.invalid/orphaning.git", "orphaning"),
            template("Deaf", "https://example.invalid/deaf.git", "deaf"),
        ],
    }
}

/// Waits until `id` reports `status`, skipping unrelated events.
pub(crate) async fn wait_for_status(
    rx: &mut broadcast::Receiver<StatusChange>,
    id: &InstanceId,
    status: InstanceStatus,
) {
    let wait = async {
        loop {
            match rx.recv().await {
                Ok(change) if change.id == *id && change.status == status => return,
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("status channel closed"),
            }
        }
    };
    if tokio::time::timeout(Duration::from_secs(10), wait).await.is_err() {
        panic!("instance {id} never reached {status}");
    }
}
