//! Cluster lifecycle: the in-memory record, the transition table, and the
//! manager that drives sky commands through it.
//!
//! Lifecycle operations return as soon as the record reflects the new
//! in-flight state; the slow sky work continues in a background task that
//! re-validates the record before every write, so a destroy that raced in
//! can't be clobbered by a stale continuation.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use tracing::{info, warn};

use crate::config::{ClusterConfig, SystemConfig};
use crate::error::GatekeeperError;
use crate::events::{EventBus, ProvisioningEvent};
use crate::runner::SkyRunner;
use crate::skypilot;
use crate::task_yaml::{self, TaskSpec};
use crate::vault::VaultRoots;

/// Node setup: install docker on the fresh instance.
const SETUP_SCRIPT: &str =
    "curl -fsSL https://get.docker.com | sh\nsudo usermod -aG docker $USER";

/// Node entrypoint: bring the stack up, then idle so the cluster stays UP.
const RUN_SCRIPT: &str =
    "cd /opt/carapace && docker compose up -d\nwhile true; do sleep 3600; done";

/// Where the vaults are mounted on the node.
const REMOTE_PUBLIC_MOUNT: &str = "/opt/carapace/data/public";
const REMOTE_PRIVATE_MOUNT: &str = "/opt/carapace/data/private";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterStatus {
    NoServer,
    Provisioning,
    Running,
    Stopping,
    Stopped,
    Destroying,
    Error,
}

impl ClusterStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ClusterStatus::NoServer => "no_server",
            ClusterStatus::Provisioning => "provisioning",
            ClusterStatus::Running => "running",
            ClusterStatus::Stopping => "stopping",
            ClusterStatus::Stopped => "stopped",
            ClusterStatus::Destroying => "destroying",
            ClusterStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for ClusterStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which lifecycle moves a record may take. Launch gates on this table;
/// stop and destroy carry their own status guards (destroy is also legal
/// from `error`, where teardown completes as `error -> no_server`).
pub fn validate_transition(
    from: ClusterStatus,
    to: ClusterStatus,
) -> Result<(), GatekeeperError> {
    use ClusterStatus::*;
    let allowed = match from {
        NoServer => matches!(to, Provisioning),
        Provisioning => matches!(to, Running | Error),
        Running => matches!(to, Stopping | Destroying),
        Stopping => matches!(to, Stopped | Error),
        Stopped => matches!(to, Destroying | Provisioning),
        Destroying => matches!(to, NoServer | Error),
        Error => matches!(to, NoServer | Provisioning),
    };
    if allowed {
        Ok(())
    } else {
        Err(GatekeeperError::Conflict {
            message: format!("invalid transition: {from} -> {to}"),
        })
    }
}

/// In-memory record of the managed cluster. At most one exists.
#[derive(Debug, Clone)]
pub struct Cluster {
    pub name: String,
    pub status: ClusterStatus,
    pub cloud: Option<String>,
    pub region: Option<String>,
    pub ip: Option<String>,
    /// Unix millis of the launch request.
    pub launched_at: Option<u64>,
    pub error: Option<String>,
}

/// Per-launch overrides on top of the configured cluster shape.
#[derive(Debug, Clone, Default)]
pub struct LaunchOverrides {
    pub cloud: Option<String>,
    pub region: Option<String>,
    pub instance_type: Option<String>,
    pub cpus: Option<String>,
    pub memory: Option<String>,
    pub disk_size: Option<u32>,
    pub use_spot: Option<bool>,
}

/// Outcome of a credential check.
#[derive(Debug, Clone)]
pub struct CheckReport {
    pub sky_installed: bool,
    pub sky_version: Option<String>,
    pub enabled: Vec<String>,
    pub disabled: BTreeMap<String, String>,
}

pub struct ClusterManager {
    cluster_name: String,
    baseline: ClusterConfig,
    vault_roots: VaultRoots,
    runner: Arc<SkyRunner>,
    state: Arc<Mutex<Option<Cluster>>>,
    events: Arc<EventBus>,
}

impl ClusterManager {
    pub fn new(config: &SystemConfig, carapace_home: &Path, events: Arc<EventBus>) -> Self {
        Self {
            cluster_name: config.cluster.name.clone(),
            baseline: config.cluster.clone(),
            vault_roots: config.vault_roots.clone(),
            runner: Arc::new(SkyRunner::new(carapace_home)),
            state: Arc::new(Mutex::new(None)),
            events,
        }
    }

    pub fn events(&self) -> Arc<EventBus> {
        self.events.clone()
    }

    /// Current record, if any. No side effects.
    pub fn status(&self) -> Option<Cluster> {
        self.state.lock().unwrap().clone()
    }

    fn current_status(&self) -> ClusterStatus {
        self.state
            .lock()
            .unwrap()
            .as_ref()
            .map(|c| c.status)
            .unwrap_or(ClusterStatus::NoServer)
    }

    /// Start provisioning. Returns the new record as soon as it is created;
    /// the launch itself continues in the background, reported via events.
    pub async fn launch(
        &self,
        overrides: LaunchOverrides,
    ) -> Result<Cluster, GatekeeperError> {
        // Cheap early gate before the expensive credential check.
        let current = self.current_status();
        validate_transition(current, ClusterStatus::Provisioning).map_err(|_| {
            GatekeeperError::Conflict {
                message: format!("cluster already active (status: {current})"),
            }
        })?;

        if !self.runner.resolve_binary().exists() {
            return Err(GatekeeperError::DependencyUnavailable {
                message: "SkyPilot not installed. Run the install command first.".into(),
            });
        }

        let check = self.runner.check().await;
        let outcome = skypilot::parse_check(&format!("{}\n{}", check.stdout, check.stderr));
        if outcome.enabled.is_empty() {
            return Err(GatekeeperError::DependencyUnavailable {
                message: "No cloud credentials configured. Run `sky check` for setup instructions."
                    .into(),
            });
        }

        let spec = self.build_task_spec(&overrides);
        let yaml = task_yaml::render(&spec);
        let yaml_path = task_yaml::write_temp(&yaml).await?;

        // The gate must hold under the lock too: another launch may have
        // won the race while we were checking credentials.
        let record = {
            let mut state = self.state.lock().unwrap();
            let current = state
                .as_ref()
                .map(|c| c.status)
                .unwrap_or(ClusterStatus::NoServer);
            validate_transition(current, ClusterStatus::Provisioning).map_err(|_| {
                GatekeeperError::Conflict {
                    message: format!("cluster already active (status: {current})"),
                }
            })?;
            let record = Cluster {
                name: self.cluster_name.clone(),
                status: ClusterStatus::Provisioning,
                cloud: overrides.cloud.clone(),
                region: overrides.region.clone(),
                ip: None,
                launched_at: Some(now_millis()),
                error: None,
            };
            *state = Some(record.clone());
            record
        };

        info!(cluster = %self.cluster_name, "launch accepted");
        self.events
            .publish(ProvisioningEvent::progress("Starting provisioning..."));

        let runner = self.runner.clone();
        let state = self.state.clone();
        let events = self.events.clone();
        let name = self.cluster_name.clone();
        tokio::spawn(async move {
            let result = runner
                .launch(&yaml_path, &name, |line| {
                    let line = line.trim();
                    if !line.is_empty() {
                        events.publish(ProvisioningEvent::progress(line));
                    }
                })
                .await;
            let _ = tokio::fs::remove_file(&yaml_path).await;

            if result.success() {
                let ip = runner.ip(&name).await;
                let updated = update_if(&state, &name, ClusterStatus::Provisioning, |c| {
                    c.status = ClusterStatus::Running;
                    c.ip = ip.clone();
                    c.error = None;
                });
                if updated {
                    info!(cluster = %name, ip = ?ip, "cluster up");
                    events.publish(ProvisioningEvent::complete("Cluster is UP"));
                }
            } else {
                let stderr = if result.stderr.trim().is_empty() {
                    &result.stdout
                } else {
                    &result.stderr
                };
                let message = skypilot::extract_error(stderr);
                let updated = update_if(&state, &name, ClusterStatus::Provisioning, |c| {
                    c.status = ClusterStatus::Error;
                    c.error = Some(message.clone());
                });
                if updated {
                    warn!(cluster = %name, error = %message, "launch failed");
                    events.publish(ProvisioningEvent::error(message));
                }
            }
        });

        Ok(record)
    }

    /// Stop the running cluster. Returns once the record shows `stopping`.
    pub async fn stop(&self) -> Result<Cluster, GatekeeperError> {
        let record = {
            let mut state = self.state.lock().unwrap();
            let Some(cluster) = state.as_mut() else {
                return Err(GatekeeperError::NotFound {
                    message: "no cluster exists".into(),
                });
            };
            if cluster.status != ClusterStatus::Running {
                return Err(GatekeeperError::Conflict {
                    message: format!(
                        "cluster is {}, must be running to stop",
                        cluster.status
                    ),
                });
            }
            cluster.status = ClusterStatus::Stopping;
            cluster.clone()
        };

        self.events
            .publish(ProvisioningEvent::progress("Stopping cluster..."));

        let runner = self.runner.clone();
        let state = self.state.clone();
        let events = self.events.clone();
        let name = self.cluster_name.clone();
        tokio::spawn(async move {
            let result = runner.stop_cluster(&name).await;
            if result.success() {
                let updated = update_if(&state, &name, ClusterStatus::Stopping, |c| {
                    c.status = ClusterStatus::Stopped;
                    c.ip = None;
                });
                if updated {
                    info!(cluster = %name, "cluster stopped");
                    events.publish(ProvisioningEvent::complete("Cluster stopped"));
                }
            } else {
                let message = skypilot::extract_error(&result.stderr);
                let updated = update_if(&state, &name, ClusterStatus::Stopping, |c| {
                    c.status = ClusterStatus::Error;
                    c.error = Some(message.clone());
                });
                if updated {
                    warn!(cluster = %name, error = %message, "stop failed");
                    events.publish(ProvisioningEvent::error(message));
                }
            }
        });

        Ok(record)
    }

    /// Tear the cluster down. Returns once the record shows `destroying`;
    /// on success the record is removed entirely.
    pub async fn destroy(&self) -> Result<Cluster, GatekeeperError> {
        let record = {
            let mut state = self.state.lock().unwrap();
            let Some(cluster) = state.as_mut() else {
                return Err(GatekeeperError::NotFound {
                    message: "no cluster exists".into(),
                });
            };
            if cluster.status == ClusterStatus::Destroying {
                return Err(GatekeeperError::Conflict {
                    message: "cluster is already being destroyed".into(),
                });
            }
            if !matches!(
                cluster.status,
                ClusterStatus::Running | ClusterStatus::Stopped | ClusterStatus::Error
            ) {
                return Err(GatekeeperError::Conflict {
                    message: format!("cannot destroy cluster in {} state", cluster.status),
                });
            }
            cluster.status = ClusterStatus::Destroying;
            cluster.clone()
        };

        self.events
            .publish(ProvisioningEvent::progress("Destroying cluster..."));

        let runner = self.runner.clone();
        let state = self.state.clone();
        let events = self.events.clone();
        let name = self.cluster_name.clone();
        tokio::spawn(async move {
            let result = runner.down(&name).await;
            if result.success() {
                let mut state = state.lock().unwrap();
                let ours = state
                    .as_ref()
                    .is_some_and(|c| c.name == name && c.status == ClusterStatus::Destroying);
                if ours {
                    *state = None;
                    drop(state);
                    info!(cluster = %name, "cluster destroyed");
                    events.publish(ProvisioningEvent::complete("Cluster destroyed"));
                }
            } else {
                let message = skypilot::extract_error(&result.stderr);
                let updated = update_if(&state, &name, ClusterStatus::Destroying, |c| {
                    c.status = ClusterStatus::Error;
                    c.error = Some(message.clone());
                });
                if updated {
                    warn!(cluster = %name, error = %message, "destroy failed");
                    events.publish(ProvisioningEvent::error(message));
                }
            }
        });

        Ok(record)
    }

    /// Reconcile the record against what sky actually reports.
    ///
    /// Only steady states are overwritten; a record mid-transition
    /// (`stopping`, `destroying`) or parked in `error` keeps its status so
    /// an in-flight continuation or a preserved failure isn't erased.
    pub async fn status_refresh(&self) -> Option<Cluster> {
        let result = self.runner.status(&self.cluster_name).await;
        let observed = skypilot::parse_status(&result.stdout, &self.cluster_name);
        let ip = if observed == ClusterStatus::Running {
            self.runner.ip(&self.cluster_name).await
        } else {
            None
        };

        let mut state = self.state.lock().unwrap();
        match state.as_mut() {
            None => {
                if observed == ClusterStatus::NoServer {
                    return None;
                }
                // A cluster exists that we have no record of (process
                // restart). Reconstruct from what sky reports.
                let record = Cluster {
                    name: self.cluster_name.clone(),
                    status: observed,
                    cloud: None,
                    region: None,
                    ip,
                    launched_at: None,
                    error: None,
                };
                *state = Some(record.clone());
                Some(record)
            }
            Some(cluster) => {
                let steady = matches!(
                    cluster.status,
                    ClusterStatus::Provisioning
                        | ClusterStatus::Running
                        | ClusterStatus::Stopped
                );
                if steady {
                    if observed == ClusterStatus::NoServer {
                        *state = None;
                        return None;
                    }
                    cluster.status = observed;
                    cluster.error = None;
                    cluster.ip = if observed == ClusterStatus::Running {
                        ip
                    } else {
                        None
                    };
                }
                Some(cluster.clone())
            }
        }
    }

    /// Check cloud credentials without touching the cluster.
    pub async fn check(&self) -> CheckReport {
        if !self.runner.resolve_binary().exists() {
            return CheckReport {
                sky_installed: false,
                sky_version: None,
                enabled: Vec::new(),
                disabled: BTreeMap::new(),
            };
        }
        let version = self.runner.run(&["--version"]).await;
        let sky_version = if version.success() {
            let v = version.stdout.trim();
            (!v.is_empty()).then(|| v.to_string())
        } else {
            None
        };
        let result = self.runner.check().await;
        let outcome = skypilot::parse_check(&format!("{}\n{}", result.stdout, result.stderr));
        CheckReport {
            sky_installed: true,
            sky_version,
            enabled: outcome.enabled,
            disabled: outcome.disabled,
        }
    }

    fn build_task_spec(&self, overrides: &LaunchOverrides) -> TaskSpec {
        let mut envs = BTreeMap::new();
        if let Ok(key) = std::env::var("TAILSCALE_AUTH_KEY") {
            envs.insert("TAILSCALE_AUTH_KEY".to_string(), key);
        }
        let file_mounts = BTreeMap::from([
            (
                REMOTE_PUBLIC_MOUNT.to_string(),
                self.vault_roots.public.display().to_string(),
            ),
            (
                REMOTE_PRIVATE_MOUNT.to_string(),
                self.vault_roots.private.display().to_string(),
            ),
        ]);
        TaskSpec {
            name: self.cluster_name.clone(),
            cloud: overrides.cloud.clone(),
            region: overrides.region.clone(),
            instance_type: overrides.instance_type.clone(),
            cpus: overrides.cpus.clone().unwrap_or_else(|| self.baseline.cpus.clone()),
            memory: overrides
                .memory
                .clone()
                .unwrap_or_else(|| self.baseline.memory.clone()),
            disk_size: overrides.disk_size.unwrap_or(self.baseline.disk_size),
            use_spot: overrides.use_spot.unwrap_or(self.baseline.use_spot),
            ports: self.baseline.ports.clone(),
            envs,
            file_mounts,
            setup: SETUP_SCRIPT.into(),
            run: RUN_SCRIPT.into(),
        }
    }
}

/// Mutate the record only if it still names the same cluster in the
/// expected state. Returns whether the write happened.
fn update_if(
    state: &Mutex<Option<Cluster>>,
    name: &str,
    expected: ClusterStatus,
    apply: impl FnOnce(&mut Cluster),
) -> bool {
    let mut state = state.lock().unwrap();
    match state.as_mut() {
        Some(cluster) if cluster.name == name && cluster.status == expected => {
            apply(cluster);
            true
        }
        _ => false,
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
