use std::collections::BTreeMap;
use std::ffi::OsString;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::process::Stdio;

use anyhow::{bail, Context};
use serde::Deserialize;
use tokio::process::Command;
use tracing::*;

use super::{Platform, ServiceHandle, ServiceStatus};
use crate::container::{Container, Exec, MountSource, NewFile, Service};
use crate::error::Error;

const DEFAULT_FILE_PERMISSIONS: u32 = 0o644;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Mode {
    /// Kept alive with a no-op main process while each exec runs in turn.
    Pipeline,
    /// The final exec is the main process; exposed ports are published.
    Service,
}

#[derive(Deserialize)]
struct InspectState {
    #[serde(rename = "Running")]
    running: bool,
}

#[derive(Deserialize)]
struct PortBinding {
    #[serde(rename = "HostIp", default)]
    host_ip: String,

    #[serde(rename = "HostPort")]
    host_port: String,
}

#[derive(Deserialize)]
struct InspectNetworkSettings {
    #[serde(rename = "Ports", default)]
    ports: BTreeMap<String, Option<Vec<PortBinding>>>,
}

#[derive(Deserialize)]
struct Inspect {
    #[serde(rename = "State")]
    state: InspectState,

    #[serde(rename = "NetworkSettings")]
    network_settings: InspectNetworkSettings,
}

/// Drives `docker` (or a CLI compatible tool such as `podman`).
pub(crate) struct DockerCli {
    tool: OsString,
}

impl DockerCli {
    pub fn new(tool: impl Into<OsString>) -> Self {
        Self { tool: tool.into() }
    }

    /// Use the first of `docker` or `podman` that answers `version`.
    pub async fn detect() -> anyhow::Result<Self> {
        for tool in ["docker", "podman"] {
            let status = Command::new(tool)
                .arg("version")
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await;
            if status.is_ok_and(|status| status.success()) {
                info!("Using container tool {tool}");
                return Ok(Self::new(tool));
            }
        }
        bail!("No container tool could be detected, set CONTAINER_TOOL")
    }

    async fn run(&self, args: Vec<String>) -> Result<String, Error> {
        let rendered = format!("{} {}", self.tool.to_string_lossy(), args.join(" "));
        debug!(command = %rendered, "Running");

        let output = Command::new(&self.tool)
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .await
            .with_context(|| format!("Failed to run {rendered}"))?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if output.status.success() {
            return Ok(stdout);
        }
        Err(Error::Exit {
            command: rendered,
            code: output.status.code(),
            stdout,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }

    /// Create, populate and start a container, returning its id.
    async fn launch(&self, ctr: &Container, mode: Mode) -> Result<String, Error> {
        let id = self.run(create_args(ctr, mode)?).await?.trim().to_string();
        info!(%id, image = %ctr, "Created container");

        let launched = async {
            for file in ctr.files() {
                self.copy_in(&id, file).await?;
            }
            self.run(vec!["start".to_string(), id.clone()]).await?;
            for file in ctr.files() {
                if let Some(owner) = &file.opts.owner {
                    self.run(as_root(&id, ["chown", owner.as_str(), file.path.as_str()]))
                        .await?;
                }
            }
            Ok::<(), Error>(())
        }
        .await;

        if let Err(err) = launched {
            self.remove(&id).await;
            return Err(err);
        }
        Ok(id)
    }

    async fn copy_in(&self, id: &str, file: &NewFile) -> Result<(), Error> {
        let path = Path::new(&file.path);
        let (Some(parent), Some(name)) = (path.parent(), path.file_name()) else {
            return Err(anyhow::anyhow!("Invalid file path {}", file.path).into());
        };

        let stage = tempfile::tempdir().context("Failed to create staging directory")?;
        let staged = stage.path().join(name);
        tokio::fs::write(&staged, &file.contents)
            .await
            .with_context(|| format!("Failed to stage {}", file.path))?;

        #[cfg(unix)]
        {
            let mode = file.opts.permissions.unwrap_or(DEFAULT_FILE_PERMISSIONS);
            std::fs::set_permissions(&staged, std::fs::Permissions::from_mode(mode))
                .with_context(|| format!("Failed to set permissions on {}", file.path))?;
            std::fs::set_permissions(stage.path(), std::fs::Permissions::from_mode(0o755))
                .context("Failed to set permissions on staging directory")?;
        }

        // A trailing "/." copies the directory contents and creates the
        // destination when it does not exist yet.
        self.run(vec![
            "cp".to_string(),
            format!("{}/.", stage.path().display()),
            format!("{id}:{}", parent.display()),
        ])
        .await?;
        Ok(())
    }

    async fn remove(&self, id: &str) {
        if let Err(err) = self.run(remove_args(id)).await {
            error!(%id, "Failed to remove container: {err}");
        }
    }

    async fn exec_all(&self, id: &str, execs: &[Exec]) -> Result<String, Error> {
        let mut stdout = String::new();
        for exec in execs {
            stdout = self.run(exec_args(id, exec)).await?;
        }
        Ok(stdout)
    }
}

impl Platform for DockerCli {
    async fn stdout(&self, ctr: &Container) -> Result<String, Error> {
        let id = self.launch(ctr, Mode::Pipeline).await?;
        let result = self.exec_all(&id, ctr.execs()).await;
        self.remove(&id).await;
        result
    }

    async fn file(&self, ctr: &Container, path: &str) -> Result<String, Error> {
        let id = self.launch(ctr, Mode::Pipeline).await?;
        let result = async {
            self.exec_all(&id, ctr.execs()).await?;
            let path = ctr.resolve_path(path);
            self.run(vec![
                "exec".to_string(),
                id.clone(),
                "cat".to_string(),
                path,
            ])
            .await
        }
        .await;
        self.remove(&id).await;
        result
    }

    async fn start(&self, service: &Service) -> Result<ServiceHandle, Error> {
        let id = self.launch(&service.container, Mode::Service).await?;
        info!(%id, "Service started");
        Ok(ServiceHandle { id })
    }

    async fn status(&self, handle: &ServiceHandle) -> Result<ServiceStatus, Error> {
        let out = self
            .run(vec!["inspect".to_string(), handle.id.clone()])
            .await?;
        parse_inspect(&out).map_err(Error::from)
    }

    async fn stop(&self, handle: &ServiceHandle) -> Result<(), Error> {
        self.run(remove_args(&handle.id)).await?;
        info!(id = %handle.id, "Service stopped");
        Ok(())
    }
}

fn create_args(ctr: &Container, mode: Mode) -> anyhow::Result<Vec<String>> {
    let mut args = vec!["create".to_string()];

    if ctr.privileged() {
        args.push("--privileged".to_string());
    }

    for mount in ctr.mounts() {
        match &mount.source {
            MountSource::Cache(cache) => {
                args.push("--mount".to_string());
                args.push(format!(
                    "type=volume,source={},target={}",
                    cache.name, mount.target
                ));
            }
            // k3s unpacks and runs its bundled binaries from scratch space,
            // so the default noexec would break it.
            MountSource::Temp => {
                args.push("--tmpfs".to_string());
                args.push(format!("{}:exec", mount.target));
            }
        }
    }

    for (name, value) in ctr.env() {
        args.push("--env".to_string());
        args.push(format!("{name}={value}"));
    }

    if let Some(user) = ctr.user() {
        args.push("--user".to_string());
        args.push(user.to_string());
    }

    if let Some(workdir) = ctr.workdir() {
        args.push("--workdir".to_string());
        args.push(workdir.to_string());
    }

    if let Some(network) = ctr.network() {
        args.push("--network".to_string());
        args.push(network.to_string());
    }

    match mode {
        Mode::Pipeline => {
            args.extend(["--entrypoint", "tail"].map(String::from));
            args.push(ctr.image().to_string());
            args.extend(["-f", "/dev/null"].map(String::from));
        }
        Mode::Service => {
            for port in ctr.exposed_ports() {
                args.push("--publish".to_string());
                args.push(format!("{port}:{port}"));
            }

            let entrypoint = ctr.entrypoint();
            if let Some(entrypoint) = entrypoint {
                args.push("--entrypoint".to_string());
                args.push(entrypoint.first().cloned().unwrap_or_default());
            }
            args.push(ctr.image().to_string());
            if let Some(entrypoint) = entrypoint {
                args.extend(entrypoint.iter().skip(1).cloned());
            }

            match ctr.execs() {
                [] => {}
                [exec] => args.extend(exec.args.iter().cloned()),
                _ => bail!("A service runs a single exec, got {}", ctr.execs().len()),
            }
        }
    }

    Ok(args)
}

fn exec_args(id: &str, exec: &Exec) -> Vec<String> {
    let mut args = vec!["exec".to_string()];
    if exec.opts.insecure_root_capabilities {
        args.push("--privileged".to_string());
    }
    args.push(id.to_string());
    args.extend(exec.args.iter().cloned());
    args
}

fn as_root<'a>(id: &str, command: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let mut args = vec![
        "exec".to_string(),
        "--user".to_string(),
        "0".to_string(),
        id.to_string(),
    ];
    args.extend(command.into_iter().map(String::from));
    args
}

fn remove_args(id: &str) -> Vec<String> {
    vec!["rm".to_string(), "--force".to_string(), id.to_string()]
}

fn parse_inspect(out: &str) -> anyhow::Result<ServiceStatus> {
    let inspected: Vec<Inspect> =
        serde_json::from_str(out).context("Failed to parse inspect output")?;
    let inspect = inspected
        .into_iter()
        .next()
        .context("Inspect returned no containers")?;

    let endpoints = inspect
        .network_settings
        .ports
        .values()
        .flatten()
        .flatten()
        .map(|binding| {
            let host = if binding.host_ip.is_empty() {
                "0.0.0.0"
            } else {
                binding.host_ip.as_str()
            };
            format!("{host}:{}", binding.host_port)
        })
        .collect();

    Ok(ServiceStatus {
        running: inspect.state.running,
        endpoints,
    })
}
