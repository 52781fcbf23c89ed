//! Provisioning task document rendering.
//!
//! The generated document is a fixed, flat schema — string building is
//! enough, no YAML library. Optional keys are omitted entirely when unset.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::SystemTime;

use crate::error::GatekeeperError;

/// Fully-resolved description of the cluster task to provision.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub name: String,
    pub cloud: Option<String>,
    pub region: Option<String>,
    pub instance_type: Option<String>,
    pub cpus: String,
    pub memory: String,
    pub disk_size: u32,
    pub use_spot: bool,
    pub ports: Vec<u16>,
    pub envs: BTreeMap<String, String>,
    /// remote path → local path
    pub file_mounts: BTreeMap<String, String>,
    pub setup: String,
    pub run: String,
}

/// Render a task spec to the provisioning document format.
pub fn render(spec: &TaskSpec) -> String {
    let mut lines: Vec<String> = Vec::new();

    lines.push(format!("name: {}", spec.name));
    lines.push(String::new());

    lines.push("resources:".into());
    if let Some(cloud) = &spec.cloud {
        lines.push(format!("  cloud: {cloud}"));
    }
    if let Some(region) = &spec.region {
        lines.push(format!("  region: {region}"));
    }
    if let Some(instance_type) = &spec.instance_type {
        lines.push(format!("  instance_type: {instance_type}"));
    }
    lines.push(format!("  cpus: {}", spec.cpus));
    lines.push(format!("  memory: {}", spec.memory));
    lines.push(format!("  disk_size: {}", spec.disk_size));
    lines.push(format!("  use_spot: {}", spec.use_spot));
    if !spec.ports.is_empty() {
        lines.push("  ports:".into());
        for port in &spec.ports {
            lines.push(format!("    - {port}"));
        }
    }
    lines.push(String::new());

    if !spec.envs.is_empty() {
        lines.push("envs:".into());
        for (key, value) in &spec.envs {
            lines.push(format!("  {key}: {value}"));
        }
        lines.push(String::new());
    }

    if !spec.file_mounts.is_empty() {
        lines.push("file_mounts:".into());
        for (remote, local) in &spec.file_mounts {
            lines.push(format!("  {remote}: {local}"));
        }
        lines.push(String::new());
    }

    if !spec.setup.is_empty() {
        lines.push("setup: |".into());
        for line in spec.setup.lines() {
            lines.push(format!("  {line}"));
        }
        lines.push(String::new());
    }

    if !spec.run.is_empty() {
        lines.push("run: |".into());
        for line in spec.run.lines() {
            lines.push(format!("  {line}"));
        }
        lines.push(String::new());
    }

    lines.join("\n")
}

/// Write a rendered document to a uniquely-named file under the OS temp dir.
pub async fn write_temp(document: &str) -> Result<PathBuf, GatekeeperError> {
    let millis = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let path = std::env::temp_dir().join(format!("carapace-sky-{millis}.yaml"));
    tokio::fs::write(&path, document)
        .await
        .map_err(|e| GatekeeperError::Io {
            context: format!("writing task file {}", path.display()),
            source: e,
        })?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_spec() -> TaskSpec {
        TaskSpec {
            name: "carapace-node".into(),
            cloud: None,
            region: None,
            instance_type: None,
            cpus: "4+".into(),
            memory: "16+".into(),
            disk_size: 100,
            use_spot: false,
            ports: vec![3001],
            envs: BTreeMap::from([("TAILSCALE_AUTH_KEY".to_string(), "tskey-xxx".to_string())]),
            file_mounts: BTreeMap::from([
                (
                    "/opt/carapace/data/public".to_string(),
                    "./data/public".to_string(),
                ),
                (
                    "/opt/carapace/data/private".to_string(),
                    "./data/private".to_string(),
                ),
            ]),
            setup: "curl -fsSL https://get.docker.com | sh\nsudo usermod -aG docker $USER".into(),
            run: "cd /opt/carapace && docker compose up -d\nwhile true; do sleep 3600; done".into(),
        }
    }

    #[test]
    fn includes_name_and_resources() {
        let yaml = render(&base_spec());
        assert!(yaml.contains("name: carapace-node"));
        assert!(yaml.contains("resources:"));
        assert!(yaml.contains("cpus: 4+"));
        assert!(yaml.contains("memory: 16+"));
        assert!(yaml.contains("disk_size: 100"));
        assert!(yaml.contains("use_spot: false"));
    }

    #[test]
    fn includes_ports_list() {
        let yaml = render(&base_spec());
        assert!(yaml.contains("ports:"));
        assert!(yaml.contains("- 3001"));
    }

    #[test]
    fn includes_envs_and_file_mounts() {
        let yaml = render(&base_spec());
        assert!(yaml.contains("envs:"));
        assert!(yaml.contains("TAILSCALE_AUTH_KEY: tskey-xxx"));
        assert!(yaml.contains("file_mounts:"));
        assert!(yaml.contains("/opt/carapace/data/public: ./data/public"));
        assert!(yaml.contains("/opt/carapace/data/private: ./data/private"));
    }

    #[test]
    fn setup_and_run_are_literal_blocks() {
        let yaml = render(&base_spec());
        assert!(yaml.contains("setup: |"));
        assert!(yaml.contains("  curl -fsSL https://get.docker.com | sh"));
        assert!(yaml.contains("run: |"));
        assert!(yaml.contains("  cd /opt/carapace && docker compose up -d"));
    }

    #[test]
    fn omits_optional_resource_keys_when_unset() {
        let yaml = render(&base_spec());
        assert!(!yaml.contains("cloud:"));
        assert!(!yaml.contains("region:"));
        assert!(!yaml.contains("instance_type:"));
    }

    #[test]
    fn includes_optional_resource_keys_when_set() {
        let mut spec = base_spec();
        spec.cloud = Some("aws".into());
        spec.region = Some("us-east-1".into());
        spec.instance_type = Some("m5.xlarge".into());
        let yaml = render(&spec);
        assert!(yaml.contains("cloud: aws"));
        assert!(yaml.contains("region: us-east-1"));
        assert!(yaml.contains("instance_type: m5.xlarge"));
    }

    #[test]
    fn omits_empty_sections() {
        let mut spec = base_spec();
        spec.envs.clear();
        spec.ports.clear();
        spec.setup.clear();
        let yaml = render(&spec);
        assert!(!yaml.contains("envs:"));
        assert!(!yaml.contains("ports:"));
        assert!(!yaml.contains("setup:"));
    }

    #[tokio::test]
    async fn write_temp_creates_readable_file() {
        let path = write_temp("name: x\n").await.unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "name: x\n");
        let _ = std::fs::remove_file(&path);
    }
}
