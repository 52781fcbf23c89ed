use std::path::{Path, PathBuf};

use facet::Facet;

use crate::error::GatekeeperError;
use crate::vault::VaultRoots;

/// Default config filename, looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "gatekeeper.toml";

/// Operating mode, decided at startup and immutable for the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Trusted deployment: both vaults readable.
    Local,
    /// Untrusted deployment: private vault is off-limits.
    Cloud,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Local => "LOCAL",
            Mode::Cloud => "CLOUD",
        }
    }

    pub fn parse(s: &str) -> Result<Self, GatekeeperError> {
        match s.trim().to_ascii_uppercase().as_str() {
            "LOCAL" => Ok(Mode::Local),
            "CLOUD" => Ok(Mode::Cloud),
            other => Err(GatekeeperError::Validation {
                message: format!("invalid mode {other:?}, expected LOCAL or CLOUD"),
            }),
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct Config {
    #[facet(default = "LOCAL")]
    pub mode: String,
    #[facet(default)]
    pub vaults: VaultsConfig,
    #[facet(default)]
    pub cluster: ClusterConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: "LOCAL".into(),
            vaults: VaultsConfig::default(),
            cluster: ClusterConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct VaultsConfig {
    #[facet(default = "./data/public")]
    pub public: String,
    #[facet(default = "./data/private")]
    pub private: String,
}

impl Default for VaultsConfig {
    fn default() -> Self {
        Self {
            public: "./data/public".into(),
            private: "./data/private".into(),
        }
    }
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct ClusterConfig {
    #[facet(default = "carapace-node")]
    pub name: String,
    #[facet(default = "4+")]
    pub cpus: String,
    #[facet(default = "16+")]
    pub memory: String,
    #[facet(default = 100)]
    pub disk_size: u32,
    #[facet(default)]
    pub use_spot: bool,
    #[facet(default = vec![3001])]
    pub ports: Vec<u16>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            name: "carapace-node".into(),
            cpus: "4+".into(),
            memory: "16+".into(),
            disk_size: 100,
            use_spot: false,
            ports: vec![3001],
        }
    }
}

// ── SystemConfig ──────────────────────────────────────────

/// Resolved runtime config: parsed TOML plus env overrides, with vault
/// paths made absolute.
#[derive(Debug, Clone)]
pub struct SystemConfig {
    pub mode: Mode,
    pub vault_roots: VaultRoots,
    pub cluster: ClusterConfig,
    /// Where the TOML came from, if any file was read.
    pub config_path: Option<PathBuf>,
}

/// Environment variables that override the TOML.
const ENV_MODE: &str = "GATEKEEPER_MODE";
const ENV_PUBLIC_VAULT: &str = "PUBLIC_VAULT";
const ENV_PRIVATE_VAULT: &str = "PRIVATE_VAULT";

fn apply_env_overrides(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(mode) = lookup(ENV_MODE) {
        config.mode = mode;
    }
    if let Some(public) = lookup(ENV_PUBLIC_VAULT) {
        config.vaults.public = public;
    }
    if let Some(private) = lookup(ENV_PRIVATE_VAULT) {
        config.vaults.private = private;
    }
}

fn validate_config(config: &Config) -> Result<(), GatekeeperError> {
    if config.cluster.name.trim().is_empty() {
        return Err(GatekeeperError::Validation {
            message: "cluster.name must not be empty".into(),
        });
    }
    if config.cluster.cpus.trim().is_empty() || config.cluster.memory.trim().is_empty() {
        return Err(GatekeeperError::Validation {
            message: "cluster.cpus and cluster.memory must not be empty".into(),
        });
    }
    Ok(())
}

fn resolve(config: Config, config_path: Option<PathBuf>) -> Result<SystemConfig, GatekeeperError> {
    let mode = Mode::parse(&config.mode)?;
    let public = std::path::absolute(&config.vaults.public).map_err(|source| {
        GatekeeperError::Io {
            context: format!("resolving vault path {}", config.vaults.public),
            source,
        }
    })?;
    let private = std::path::absolute(&config.vaults.private).map_err(|source| {
        GatekeeperError::Io {
            context: format!("resolving vault path {}", config.vaults.private),
            source,
        }
    })?;
    Ok(SystemConfig {
        mode,
        vault_roots: VaultRoots { public, private },
        cluster: config.cluster,
        config_path,
    })
}

// ── public API ────────────────────────────────────────────

/// Load configuration.
///
/// An explicit path must exist; the default `gatekeeper.toml` is optional
/// and its absence means built-in defaults. Environment overrides
/// (`GATEKEEPER_MODE`, `PUBLIC_VAULT`, `PRIVATE_VAULT`) apply last.
pub fn load_config(explicit: Option<&Path>) -> Result<SystemConfig, GatekeeperError> {
    let (contents, config_path) = match explicit {
        Some(path) => {
            let contents =
                std::fs::read_to_string(path).map_err(|source| GatekeeperError::ConfigLoad {
                    path: path.display().to_string(),
                    source,
                })?;
            (Some(contents), Some(path.to_path_buf()))
        }
        None => {
            let path = Path::new(DEFAULT_CONFIG_FILE);
            match std::fs::read_to_string(path) {
                Ok(contents) => (Some(contents), Some(path.to_path_buf())),
                Err(_) => (None, None),
            }
        }
    };

    let mut config = match (&contents, &config_path) {
        (Some(contents), Some(path)) => {
            facet_toml::from_str(contents).map_err(|e| GatekeeperError::ConfigParse {
                path: path.display().to_string(),
                message: e.to_string(),
            })?
        }
        _ => Config::default(),
    };

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    validate_config(&config)?;
    resolve(config, config_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_local_with_carapace_node() {
        let config = Config::default();
        let resolved = resolve(config, None).unwrap();
        assert_eq!(resolved.mode, Mode::Local);
        assert_eq!(resolved.cluster.name, "carapace-node");
        assert_eq!(resolved.cluster.cpus, "4+");
        assert_eq!(resolved.cluster.ports, vec![3001]);
        assert!(resolved.vault_roots.public.is_absolute());
        assert!(resolved.vault_roots.private.is_absolute());
    }

    #[test]
    fn parses_full_toml() {
        let toml = r#"
            mode = "CLOUD"

            [vaults]
            public = "/srv/vaults/public"
            private = "/srv/vaults/private"

            [cluster]
            name = "my-node"
            cpus = "8+"
            memory = "32+"
            disk_size = 200
            use_spot = true
            ports = [3001, 8080]
        "#;
        let config: Config = facet_toml::from_str(toml).unwrap();
        let resolved = resolve(config, None).unwrap();
        assert_eq!(resolved.mode, Mode::Cloud);
        assert_eq!(resolved.cluster.name, "my-node");
        assert_eq!(resolved.cluster.disk_size, 200);
        assert!(resolved.cluster.use_spot);
        assert_eq!(resolved.cluster.ports, vec![3001, 8080]);
        assert_eq!(
            resolved.vault_roots.public,
            PathBuf::from("/srv/vaults/public")
        );
    }

    #[test]
    fn partial_toml_falls_back_to_defaults() {
        let toml = r#"mode = "CLOUD""#;
        let config: Config = facet_toml::from_str(toml).unwrap();
        assert_eq!(config.cluster.name, "carapace-node");
        assert_eq!(config.vaults.public, "./data/public");
    }

    #[test]
    fn mode_parse_is_case_insensitive() {
        assert_eq!(Mode::parse("local").unwrap(), Mode::Local);
        assert_eq!(Mode::parse("Cloud").unwrap(), Mode::Cloud);
        assert_eq!(Mode::parse(" LOCAL ").unwrap(), Mode::Local);
        assert!(Mode::parse("hybrid").is_err());
    }

    #[test]
    fn env_overrides_beat_toml() {
        let mut config = Config::default();
        apply_env_overrides(&mut config, |key| match key {
            "GATEKEEPER_MODE" => Some("CLOUD".into()),
            "PUBLIC_VAULT" => Some("/tmp/pub".into()),
            "PRIVATE_VAULT" => Some("/tmp/priv".into()),
            _ => None,
        });
        let resolved = resolve(config, None).unwrap();
        assert_eq!(resolved.mode, Mode::Cloud);
        assert_eq!(resolved.vault_roots.public, PathBuf::from("/tmp/pub"));
        assert_eq!(resolved.vault_roots.private, PathBuf::from("/tmp/priv"));
    }

    #[test]
    fn empty_cluster_name_is_rejected() {
        let mut config = Config::default();
        config.cluster.name = "  ".into();
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn explicit_missing_config_errors() {
        let err = load_config(Some(Path::new("/nonexistent/gatekeeper.toml"))).unwrap_err();
        assert!(matches!(err, GatekeeperError::ConfigLoad { .. }));
    }

    #[test]
    fn explicit_config_file_is_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gatekeeper.toml");
        std::fs::write(&path, "mode = \"CLOUD\"\n").unwrap();
        let resolved = load_config(Some(&path)).unwrap();
        assert_eq!(resolved.mode, Mode::Cloud);
        assert_eq!(resolved.config_path, Some(path));
    }
}
