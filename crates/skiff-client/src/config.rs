//! Configuration loading.
//!
//! The configuration names the object and kv servers, the backend each
//! component uses, and client tuning. It is a TOML file resolved through
//! the usual chain: `$SKIFF_CONFIG` (an absolute path wins outright, a
//! relative value only renames the file), then
//! `$XDG_CONFIG_HOME/skiff/<name>`, then every entry of
//! `$XDG_CONFIG_DIRS/skiff/<name>`.
//!
//! ```toml
//! [clients]
//! max-connections = 8
//!
//! [servers]
//! object = "stor1:4711;stor2:4711"
//! kv = "meta1:4711"
//!
//! [object]
//! backend = "posix"
//! component = "server"
//! path = "/var/lib/skiff/objects"
//!
//! [kv]
//! backend = "fjall"
//! component = "server"
//! path = "/var/lib/skiff/kv"
//! ```

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::debug;

use crate::error::ClientError;

/// Default TCP port for servers listed without one.
pub const DEFAULT_PORT: u16 = 4711;

/// Default per-server connection cap when `[clients] max-connections` is
/// absent or zero.
pub const DEFAULT_MAX_CONNECTIONS: u32 = 8;

/// Where a backend runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    /// Linked into the client process; no server round-trips.
    Client,
    /// Behind the servers listed in `[servers]`.
    Server,
}

/// One store section (`[object]` or `[kv]`).
#[derive(Debug, Clone)]
pub struct StoreSection {
    /// Backend name, resolved through the backend registry.
    pub backend: String,
    /// Where the backend runs.
    pub component: Component,
    /// Storage path handed to the backend.
    pub path: PathBuf,
}

/// A validated configuration.
#[derive(Debug, Clone)]
pub struct Configuration {
    object_servers: Vec<String>,
    kv_servers: Vec<String>,
    object: StoreSection,
    kv: StoreSection,
    max_connections: u32,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawClients {
    #[serde(rename = "max-connections")]
    max_connections: u32,
}

#[derive(Debug, Deserialize)]
struct RawServers {
    object: String,
    kv: String,
}

#[derive(Debug, Deserialize)]
struct RawStore {
    backend: String,
    component: String,
    path: PathBuf,
}

#[derive(Debug, Deserialize)]
struct RawConfiguration {
    #[serde(default)]
    clients: RawClients,
    servers: RawServers,
    object: RawStore,
    kv: RawStore,
}

impl Configuration {
    /// Build a configuration programmatically (used by daemons and tests).
    pub fn new(
        object_servers: Vec<String>,
        kv_servers: Vec<String>,
        object: StoreSection,
        kv: StoreSection,
        max_connections: u32,
    ) -> Result<Self, ClientError> {
        if object_servers.is_empty() || kv_servers.is_empty() {
            return Err(ClientError::Config(
                "at least one object and one kv server are required".to_string(),
            ));
        }

        Ok(Self {
            object_servers: object_servers.into_iter().map(with_default_port).collect(),
            kv_servers: kv_servers.into_iter().map(with_default_port).collect(),
            object,
            kv,
            max_connections: if max_connections == 0 {
                DEFAULT_MAX_CONNECTIONS
            } else {
                max_connections
            },
        })
    }

    /// Resolve and load the configuration through the lookup chain.
    pub fn load() -> Result<Self, ClientError> {
        let mut name = "skiff".to_string();

        if let Ok(env_path) = std::env::var("SKIFF_CONFIG") {
            let env_path = PathBuf::from(env_path);
            if env_path.is_absolute() {
                // An absolute override wins; if it is unreadable, stop
                // searching instead of silently using another file.
                return Self::from_file(&env_path);
            }
            if let Some(file_name) = env_path.file_name().and_then(|n| n.to_str()) {
                name = file_name.to_string();
            }
        }

        let mut candidates = Vec::new();
        if let Some(user_dir) = dirs::config_dir() {
            candidates.push(user_dir.join("skiff").join(&name));
        }
        let system_dirs =
            std::env::var("XDG_CONFIG_DIRS").unwrap_or_else(|_| "/etc/xdg".to_string());
        for dir in system_dirs.split(':').filter(|d| !d.is_empty()) {
            candidates.push(Path::new(dir).join("skiff").join(&name));
        }

        for candidate in &candidates {
            if candidate.is_file() {
                debug!(path = %candidate.display(), "loading configuration");
                return Self::from_file(candidate);
            }
        }

        Err(ClientError::Config(format!(
            "no configuration found (searched {} locations)",
            candidates.len()
        )))
    }

    /// Load a configuration from a specific file.
    pub fn from_file(path: &Path) -> Result<Self, ClientError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ClientError::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_str(&content)
    }

    /// Parse a configuration from TOML text.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self, ClientError> {
        let raw: RawConfiguration =
            toml::from_str(content).map_err(|e| ClientError::Config(e.to_string()))?;

        Self::new(
            split_servers(&raw.servers.object),
            split_servers(&raw.servers.kv),
            parse_store(raw.object)?,
            parse_store(raw.kv)?,
            raw.clients.max_connections,
        )
    }

    pub fn object_server_count(&self) -> u32 {
        self.object_servers.len() as u32
    }

    pub fn kv_server_count(&self) -> u32 {
        self.kv_servers.len() as u32
    }

    pub fn object_server(&self, index: u32) -> Option<&str> {
        self.object_servers.get(index as usize).map(String::as_str)
    }

    pub fn kv_server(&self, index: u32) -> Option<&str> {
        self.kv_servers.get(index as usize).map(String::as_str)
    }

    pub fn object(&self) -> &StoreSection {
        &self.object
    }

    pub fn kv(&self) -> &StoreSection {
        &self.kv
    }

    pub fn max_connections(&self) -> u32 {
        self.max_connections
    }
}

fn split_servers(list: &str) -> Vec<String> {
    list.split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn with_default_port(server: String) -> String {
    if server.contains(':') {
        server
    } else {
        format!("{server}:{DEFAULT_PORT}")
    }
}

fn parse_store(raw: RawStore) -> Result<StoreSection, ClientError> {
    let component = match raw.component.as_str() {
        "client" => Component::Client,
        "server" => Component::Server,
        other => {
            return Err(ClientError::Config(format!(
                "component must be \"client\" or \"server\", got {other:?}"
            )));
        }
    };

    if raw.backend.is_empty() {
        return Err(ClientError::Config("backend must not be empty".to_string()));
    }

    Ok(StoreSection {
        backend: raw.backend,
        component,
        path: raw.path,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
[clients]
max-connections = 3

[servers]
object = "stor1; stor2:5000"
kv = "meta1:4711"

[object]
backend = "posix"
component = "server"
path = "/tmp/skiff-objects"

[kv]
backend = "fjall"
component = "client"
path = "/tmp/skiff-kv"
"#;

    #[test]
    fn test_parse_full_configuration() {
        let config = Configuration::from_str(FULL).unwrap();
        assert_eq!(config.object_server_count(), 2);
        assert_eq!(config.kv_server_count(), 1);
        assert_eq!(config.object_server(0), Some("stor1:4711"));
        assert_eq!(config.object_server(1), Some("stor2:5000"));
        assert_eq!(config.kv_server(0), Some("meta1:4711"));
        assert_eq!(config.max_connections(), 3);
        assert_eq!(config.object().backend, "posix");
        assert_eq!(config.object().component, Component::Server);
        assert_eq!(config.kv().component, Component::Client);
        assert_eq!(config.kv().path, PathBuf::from("/tmp/skiff-kv"));
    }

    #[test]
    fn test_missing_servers_rejected() {
        let content = FULL.replace("object = \"stor1; stor2:5000\"", "object = \"\"");
        assert!(matches!(
            Configuration::from_str(&content),
            Err(ClientError::Config(_))
        ));
    }

    #[test]
    fn test_bad_component_rejected() {
        let content = FULL.replace("component = \"client\"", "component = \"sideways\"");
        assert!(matches!(
            Configuration::from_str(&content),
            Err(ClientError::Config(_))
        ));
    }

    #[test]
    fn test_zero_max_connections_uses_default() {
        let content = FULL.replace("max-connections = 3", "max-connections = 0");
        let config = Configuration::from_str(&content).unwrap();
        assert_eq!(config.max_connections(), DEFAULT_MAX_CONNECTIONS);

        let content = FULL.replace("max-connections = 3\n", "");
        let config = Configuration::from_str(&content).unwrap();
        assert_eq!(config.max_connections(), DEFAULT_MAX_CONNECTIONS);
    }

    // Environment variables are process-global, so the whole lookup chain
    // is exercised in a single test.
    #[test]
    fn test_lookup_chain() {
        let dir = tempfile::tempdir().unwrap();

        // Absolute SKIFF_CONFIG wins.
        let absolute = dir.path().join("direct.toml");
        std::fs::write(&absolute, FULL).unwrap();
        unsafe { std::env::set_var("SKIFF_CONFIG", &absolute) };
        let config = Configuration::load().unwrap();
        assert_eq!(config.max_connections(), 3);

        // An unreadable absolute path fails outright, no fallback.
        unsafe { std::env::set_var("SKIFF_CONFIG", dir.path().join("missing.toml")) };
        assert!(Configuration::load().is_err());

        // A relative SKIFF_CONFIG renames the file searched in the XDG dirs.
        let xdg = dir.path().join("xdg");
        std::fs::create_dir_all(xdg.join("skiff")).unwrap();
        std::fs::write(xdg.join("skiff").join("alt"), FULL).unwrap();
        unsafe {
            std::env::set_var("SKIFF_CONFIG", "alt");
            std::env::set_var("XDG_CONFIG_HOME", dir.path().join("nothing-here"));
            std::env::set_var("XDG_CONFIG_DIRS", &xdg);
        }
        let config = Configuration::load().unwrap();
        assert_eq!(config.object_server(0), Some("stor1:4711"));

        unsafe {
            std::env::remove_var("SKIFF_CONFIG");
            std::env::remove_var("XDG_CONFIG_HOME");
            std::env::remove_var("XDG_CONFIG_DIRS");
        }
    }
}
