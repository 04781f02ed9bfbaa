use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::propfile::parse_properties;

pub const HOME_ENV: &str = "CONFSYNC_HOME";
const BOOTSTRAP_FILE: &str = "confsync.properties";

/// Contents of the bootstrap discovery file. Without it the system runs
/// in local-only mode.
#[derive(Debug, Clone)]
pub struct BootstrapConfig {
    pub conf_server: String,
    pub version: String,
    pub env: String,
    pub download_dir: Option<PathBuf>,
}

pub fn bootstrap_path(app: &str) -> PathBuf {
    match std::env::var(HOME_ENV) {
        Ok(home) => Path::new(&home)
            .join("appconfig")
            .join(app)
            .join(BOOTSTRAP_FILE),
        Err(_) => PathBuf::from(BOOTSTRAP_FILE),
    }
}

/// Reads the bootstrap file for an application. A missing or unreadable
/// file is not an error; it selects local-only mode.
pub fn load_bootstrap(app: &str) -> Option<BootstrapConfig> {
    let path = bootstrap_path(app);
    load_bootstrap_from(&path)
}

pub fn load_bootstrap_from(path: &Path) -> Option<BootstrapConfig> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) => {
            tracing::info!(path = %path.display(), error = %err, "no bootstrap file, using local-only mode");
            return None;
        }
    };
    let entries: BTreeMap<String, String> = parse_properties(&content).into_iter().collect();
    let Some(conf_server) = entries.get("conf_server_host") else {
        tracing::warn!(path = %path.display(), "bootstrap file has no conf_server_host, using local-only mode");
        return None;
    };
    let conf_server = if conf_server.starts_with("http") {
        conf_server.clone()
    } else {
        format!("http://{conf_server}")
    };
    Some(BootstrapConfig {
        conf_server,
        version: entries.get("version").cloned().unwrap_or_default(),
        env: entries.get("env").cloned().unwrap_or_default(),
        download_dir: entries.get("user_define_download_dir").map(PathBuf::from),
    })
}

#[derive(Deserialize)]
struct HostsResponse {
    value: String,
}

/// Asks the configuration server for the coordination-service host list.
pub async fn discover_hosts(client: &reqwest::Client, conf_server: &str) -> Result<String> {
    let url = format!("{conf_server}/api/zoo/hosts");
    let response = client
        .get(&url)
        .send()
        .await
        .map_err(|err| Error::Bootstrap(format!("host discovery at '{url}' failed: {err}")))?;
    if !response.status().is_success() {
        return Err(Error::Bootstrap(format!(
            "host discovery at '{url}' returned HTTP {}",
            response.status()
        )));
    }
    let parsed: HostsResponse = response
        .json()
        .await
        .map_err(|err| Error::Bootstrap(format!("invalid host discovery response: {err}")))?;
    if parsed.value.trim().is_empty() {
        return Err(Error::Bootstrap(
            "host discovery returned an empty host list".to_owned(),
        ));
    }
    Ok(parsed.value)
}

/// Coordination-service node path prefix for one application deployment.
pub fn node_prefix(app: &str, version: &str, env: &str) -> String {
    format!("/confsync/{app}_{version}_{env}/file/")
}
