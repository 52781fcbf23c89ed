use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use gatekeeper::cli::{Cli, Command, OutputFormat};
use gatekeeper::cluster::{Cluster, ClusterManager, LaunchOverrides};
use gatekeeper::config;
use gatekeeper::error::GatekeeperError;
use gatekeeper::events::{EventBus, EventKind, ProvisioningEvent};
use gatekeeper::files;
use gatekeeper::installer::Installer;
use gatekeeper::paths;

#[tokio::main]
async fn main() -> miette::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env()
            .add_directive("gatekeeper=info".parse().expect("valid log directive"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let sys_config = config::load_config(cli.config.as_deref())?;
    let home = paths::carapace_home();
    let events = Arc::new(EventBus::new());
    let manager = ClusterManager::new(&sys_config, &home, events.clone());
    let installer = Installer::new(&home);
    let json = matches!(cli.output, OutputFormat::Json);

    match cli.command {
        Command::Check => {
            let report = manager.check().await;
            if json {
                let disabled = report
                    .disabled
                    .iter()
                    .map(|(name, reason)| DisabledCloudJson {
                        name: name.clone(),
                        reason: reason.clone(),
                    })
                    .collect();
                print_json(&CheckJson {
                    sky_installed: report.sky_installed,
                    sky_version: report.sky_version,
                    enabled: report.enabled,
                    disabled,
                });
            } else if !report.sky_installed {
                println!("SkyPilot: not installed");
            } else {
                match &report.sky_version {
                    Some(version) => println!("SkyPilot: {version}"),
                    None => println!("SkyPilot: installed"),
                }
                for cloud in &report.enabled {
                    println!("  {cloud}: enabled");
                }
                for (cloud, reason) in &report.disabled {
                    println!("  {cloud}: disabled ({reason})");
                }
                if report.enabled.is_empty() {
                    println!("No cloud provider enabled.");
                }
            }
        }

        Command::Status { refresh } => {
            let cluster = if refresh {
                manager.status_refresh().await
            } else {
                manager.status()
            };
            print_cluster(cluster.as_ref(), json);
        }

        Command::Launch {
            cloud,
            region,
            instance_type,
            cpus,
            memory,
            disk_size,
            spot,
        } => {
            // Pick up any cluster that already exists at the provider, so
            // the launch gate sees its real state.
            manager.status_refresh().await;
            let mut rx = events.subscribe();
            manager
                .launch(LaunchOverrides {
                    cloud,
                    region,
                    instance_type,
                    cpus,
                    memory,
                    disk_size,
                    use_spot: spot.then_some(true),
                })
                .await?;
            follow_events(&mut rx, json, "sky launch").await?;
            print_cluster(manager.status().as_ref(), json);
        }

        Command::Stop => {
            manager.status_refresh().await;
            let mut rx = events.subscribe();
            manager.stop().await?;
            follow_events(&mut rx, json, "sky stop").await?;
            print_cluster(manager.status().as_ref(), json);
        }

        Command::Destroy => {
            manager.status_refresh().await;
            let mut rx = events.subscribe();
            manager.destroy().await?;
            follow_events(&mut rx, json, "sky down").await?;
            print_cluster(manager.status().as_ref(), json);
        }

        Command::Install => {
            installer
                .ensure(move |progress| {
                    if json {
                        print_json(&InstallProgressJson {
                            phase: progress.phase.as_str().to_string(),
                            message: progress.message,
                            percent: progress.percent,
                        });
                    } else {
                        match progress.percent {
                            Some(percent) => {
                                println!("[{}] {} ({percent}%)", progress.phase.as_str(), progress.message)
                            }
                            None => println!("[{}] {}", progress.phase.as_str(), progress.message),
                        }
                    }
                })
                .await?;
        }

        Command::InstallStatus => {
            let status = installer.install_status().await;
            if json {
                print_json(&InstallStatusJson {
                    uv_installed: status.uv_installed,
                    uv_version: status.uv_version,
                    sky_installed: status.sky_installed,
                    sky_version: status.sky_version,
                    carapace_home: status.carapace_home,
                });
            } else {
                println!("home: {}", status.carapace_home);
                match &status.uv_version {
                    Some(v) => println!("uv: {v}"),
                    None => println!("uv: not installed"),
                }
                if status.sky_installed {
                    println!("sky: installed");
                } else {
                    println!("sky: not installed");
                }
            }
        }

        Command::Read { path } => {
            let result = files::read_file(&path, &sys_config.vault_roots, sys_config.mode).await?;
            if json {
                print_json(&ReadJson {
                    path: result.path,
                    content: result.content,
                    size: result.size,
                });
            } else {
                print!("{}", result.content);
            }
        }

        Command::List => {
            let result = files::list_files(&sys_config.vault_roots, sys_config.mode).await?;
            if json {
                let files = result
                    .files
                    .iter()
                    .map(|f| FileEntryJson {
                        name: f.name.clone(),
                        size: f.size,
                    })
                    .collect();
                print_json(&ListJson {
                    mode: result.mode.as_str().to_string(),
                    files,
                });
            } else {
                for entry in &result.files {
                    println!("{}", entry.name);
                }
            }
        }
    }

    Ok(())
}

/// Print provisioning events as they arrive until a terminal one lands.
/// A terminal error becomes the process's failure.
async fn follow_events(
    rx: &mut tokio::sync::mpsc::Receiver<ProvisioningEvent>,
    json: bool,
    command: &str,
) -> Result<(), GatekeeperError> {
    while let Some(event) = rx.recv().await {
        if json {
            print_json(&EventJson {
                timestamp: event.timestamp.clone(),
                kind: event.kind.as_str().to_string(),
                message: event.message.clone(),
            });
        } else {
            println!("{}", event.message);
        }
        match event.kind {
            EventKind::Progress => {}
            EventKind::Complete => return Ok(()),
            EventKind::Error => {
                return Err(GatekeeperError::ExternalCommand {
                    command: command.to_string(),
                    message: event.message,
                });
            }
        }
    }
    Ok(())
}

fn print_cluster(cluster: Option<&Cluster>, json: bool) {
    match cluster {
        Some(cluster) => {
            if json {
                print_json(&ClusterJson {
                    name: cluster.name.clone(),
                    status: cluster.status.as_str().to_string(),
                    cloud: cluster.cloud.clone(),
                    region: cluster.region.clone(),
                    ip: cluster.ip.clone(),
                    launched_at: cluster.launched_at,
                    error: cluster.error.clone(),
                });
            } else {
                println!("{}: {}", cluster.name, cluster.status);
                if let Some(ip) = &cluster.ip {
                    println!("  IP: {ip}");
                }
                if let Some(error) = &cluster.error {
                    println!("  error: {error}");
                }
            }
        }
        None => {
            if json {
                print_json(&NoClusterJson {
                    status: "no_server".to_string(),
                });
            } else {
                println!("no cluster");
            }
        }
    }
}

fn print_json<'a, T: facet::Facet<'a>>(value: &T) {
    println!(
        "{}",
        facet_json::to_string(value).expect("JSON serialization")
    );
}

#[derive(facet::Facet)]
struct CheckJson {
    sky_installed: bool,
    sky_version: Option<String>,
    enabled: Vec<String>,
    disabled: Vec<DisabledCloudJson>,
}

#[derive(facet::Facet)]
struct DisabledCloudJson {
    name: String,
    reason: String,
}

#[derive(facet::Facet)]
struct ClusterJson {
    name: String,
    status: String,
    cloud: Option<String>,
    region: Option<String>,
    ip: Option<String>,
    launched_at: Option<u64>,
    error: Option<String>,
}

#[derive(facet::Facet)]
struct NoClusterJson {
    status: String,
}

#[derive(facet::Facet)]
struct EventJson {
    timestamp: String,
    kind: String,
    message: String,
}

#[derive(facet::Facet)]
struct InstallProgressJson {
    phase: String,
    message: String,
    percent: Option<u8>,
}

#[derive(facet::Facet)]
struct InstallStatusJson {
    uv_installed: bool,
    uv_version: Option<String>,
    sky_installed: bool,
    sky_version: Option<String>,
    carapace_home: String,
}

#[derive(facet::Facet)]
struct ReadJson {
    path: String,
    content: String,
    size: u64,
}

#[derive(facet::Facet)]
struct ListJson {
    mode: String,
    files: Vec<FileEntryJson>,
}

#[derive(facet::Facet)]
struct FileEntryJson {
    name: String,
    size: u64,
}
