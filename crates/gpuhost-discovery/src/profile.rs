//! How a service inside a workload is started and where it reports its address

use serde::{Deserialize, Serialize};
use std::time::Duration;

const NOTEBOOK_SCRIPT: &str = r#"#!/bin/bash
cd /workspace
. nimaenv/bin/activate 2>/dev/null || true
export HOME=/workspace
export JUPYTER_RUNTIME_DIR=/workspace/.jupyter/runtime
export JUPYTER_DATA_DIR=/workspace/.jupyter
export JUPYTER_CONFIG_DIR=/workspace/.jupyter
mkdir -p $JUPYTER_RUNTIME_DIR
exec jupyter lab --no-browser --ip=0.0.0.0 --port=8888 --allow-root --ServerApp.token='' --ServerApp.password=''
"#;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceProfile {
    /// Label used in logs and tmux session names
    pub name: String,

    /// Shell fragment run before every probe command inside the container
    pub prelude: String,

    /// Command printing one JSON record per running server
    pub structured_listing: String,

    /// Command printing running servers as prose with URLs
    pub alternate_listing: String,

    /// Process name to look for in the socket table
    pub process_name: String,

    /// Secondary process name when the log reports port 0
    pub fallback_process: String,

    pub log_path: String,
    pub log_tail_lines: u32,

    pub script_path: String,
    pub startup_script: String,

    /// Seconds to wait after launch before probing
    pub startup_wait_secs: u64,

    /// Extra passes over the whole chain when every strategy misses
    pub discovery_retries: u32,
    pub retry_delay_secs: u64,
}

impl Default for ServiceProfile {
    fn default() -> Self {
        Self {
            name: "jupyter".to_string(),
            prelude: "cd /workspace 2>/dev/null; . nimaenv/bin/activate 2>/dev/null;".to_string(),
            structured_listing:
                "jupyter server list --json 2>/dev/null || jupyter lab list --json 2>/dev/null"
                    .to_string(),
            alternate_listing:
                "jupyter lab list 2>/dev/null || jupyter notebook list 2>/dev/null".to_string(),
            process_name: "jupyter".to_string(),
            fallback_process: "python3".to_string(),
            log_path: "/workspace/jupyter.log".to_string(),
            log_tail_lines: 20,
            script_path: "/workspace/start_jlab.sh".to_string(),
            startup_script: NOTEBOOK_SCRIPT.to_string(),
            startup_wait_secs: 5,
            discovery_retries: 2,
            retry_delay_secs: 3,
        }
    }
}

impl ServiceProfile {
    pub fn startup_wait(&self) -> Duration {
        Duration::from_secs(self.startup_wait_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    /// `inner` prefixed with the prelude
    pub fn with_prelude(&self, inner: &str) -> String {
        if self.prelude.trim().is_empty() {
            inner.to_string()
        } else {
            format!("{} {}", self.prelude.trim(), inner)
        }
    }
}
