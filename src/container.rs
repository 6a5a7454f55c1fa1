use std::collections::BTreeMap;
use std::fmt;

/// A named volume that outlives any single container.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct CacheVolume {
    pub name: String,
}

impl CacheVolume {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum MountSource {
    Cache(CacheVolume),
    Temp,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Mount {
    pub target: String,
    pub source: MountSource,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct FileOpts {
    pub permissions: Option<u32>,
    pub owner: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct NewFile {
    pub path: String,
    pub contents: String,
    pub opts: FileOpts,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct ExecOpts {
    /// Run with the full set of root capabilities (`--privileged`).
    pub insecure_root_capabilities: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Exec {
    pub args: Vec<String>,
    pub opts: ExecOpts,
}

/// Lazily describes a container and the steps to run in it.
///
/// Nothing is pulled or executed until the descriptor is handed to a
/// [`Platform`](crate::platform::Platform). Every `with_*` call returns a new
/// descriptor, so a base container can be shared between several pipelines.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Container {
    image: String,
    entrypoint: Option<Vec<String>>,
    user: Option<String>,
    workdir: Option<String>,
    network: Option<String>,
    env: BTreeMap<String, String>,
    mounts: Vec<Mount>,
    files: Vec<NewFile>,
    exposed_ports: Vec<u16>,
    execs: Vec<Exec>,
}

impl Container {
    pub fn from(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            entrypoint: None,
            user: None,
            workdir: None,
            network: None,
            env: BTreeMap::new(),
            mounts: Vec::new(),
            files: Vec::new(),
            exposed_ports: Vec::new(),
            execs: Vec::new(),
        }
    }

    pub fn with<F>(self, f: F) -> Self
    where
        F: FnOnce(Self) -> Self,
    {
        f(self)
    }

    pub fn with_entrypoint<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.entrypoint = Some(args.into_iter().map(Into::into).collect());
        self
    }

    pub fn without_entrypoint(mut self) -> Self {
        self.entrypoint = Some(Vec::new());
        self
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn with_workdir(mut self, path: impl Into<String>) -> Self {
        self.workdir = Some(path.into());
        self
    }

    /// Share the host's network namespace, so ports published by other
    /// containers are reachable on loopback.
    pub fn with_host_network(mut self) -> Self {
        self.network = Some("host".to_string());
        self
    }

    pub fn with_env_variable(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(name.into(), value.into());
        self
    }

    pub fn with_mounted_cache(mut self, path: impl Into<String>, cache: &CacheVolume) -> Self {
        self.mounts.push(Mount {
            target: path.into(),
            source: MountSource::Cache(cache.clone()),
        });
        self
    }

    pub fn with_mounted_temp(mut self, path: impl Into<String>) -> Self {
        self.mounts.push(Mount {
            target: path.into(),
            source: MountSource::Temp,
        });
        self
    }

    pub fn with_new_file(
        mut self,
        path: impl Into<String>,
        contents: impl Into<String>,
        opts: FileOpts,
    ) -> Self {
        self.files.push(NewFile {
            path: path.into(),
            contents: contents.into(),
            opts,
        });
        self
    }

    pub fn with_exposed_port(mut self, port: u16) -> Self {
        if !self.exposed_ports.contains(&port) {
            self.exposed_ports.push(port);
        }
        self
    }

    pub fn with_exec<I, S>(mut self, args: I, opts: ExecOpts) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.execs.push(Exec {
            args: args.into_iter().map(Into::into).collect(),
            opts,
        });
        self
    }

    pub fn as_service(self) -> Service {
        Service { container: self }
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    pub fn entrypoint(&self) -> Option<&[String]> {
        self.entrypoint.as_deref()
    }

    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    pub fn workdir(&self) -> Option<&str> {
        self.workdir.as_deref()
    }

    pub fn network(&self) -> Option<&str> {
        self.network.as_deref()
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    pub fn mounts(&self) -> &[Mount] {
        &self.mounts
    }

    pub fn files(&self) -> &[NewFile] {
        &self.files
    }

    pub fn exposed_ports(&self) -> &[u16] {
        &self.exposed_ports
    }

    pub fn execs(&self) -> &[Exec] {
        &self.execs
    }

    /// True when any step asks for root capabilities.
    pub fn privileged(&self) -> bool {
        self.execs.iter().any(|e| e.opts.insecure_root_capabilities)
    }

    /// Resolve `path` against the working directory, `/` when unset.
    pub fn resolve_path(&self, path: &str) -> String {
        if path.starts_with('/') {
            return path.to_string();
        }
        match self.workdir.as_deref() {
            Some(dir) => format!("{}/{path}", dir.trim_end_matches('/')),
            None => format!("/{path}"),
        }
    }
}

impl fmt::Display for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.image)
    }
}

/// A container whose final exec keeps running in the background.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Service {
    pub container: Container,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builders_do_not_touch_the_receiver() {
        let base = Container::from("alpine");
        let derived = base.clone().with_env_variable("A", "1").with_user("1001");

        assert!(base.env().is_empty());
        assert_eq!(base.user(), None);
        assert_eq!(derived.env().get("A").map(String::as_str), Some("1"));
        assert_eq!(derived.user(), Some("1001"));
    }

    #[test]
    fn env_variable_is_overwritten() {
        let ctr = Container::from("alpine")
            .with_env_variable("CACHE_BURSTER", "a")
            .with_env_variable("CACHE_BURSTER", "b");

        assert_eq!(ctr.env().len(), 1);
        assert_eq!(ctr.env()["CACHE_BURSTER"], "b");
    }

    #[test]
    fn relative_paths_resolve_against_workdir() {
        let ctr = Container::from("alpine");
        assert_eq!(ctr.resolve_path("k3s.yaml"), "/k3s.yaml");
        assert_eq!(ctr.resolve_path("/etc/hosts"), "/etc/hosts");

        let ctr = ctr.with_workdir("/work/");
        assert_eq!(ctr.resolve_path("k3s.yaml"), "/work/k3s.yaml");
    }

    #[test]
    fn privileged_follows_exec_options() {
        let ctr = Container::from("alpine").with_exec(["true"], ExecOpts::default());
        assert!(!ctr.privileged());

        let ctr = ctr.with_exec(
            ["sh", "-c", "k3s server"],
            ExecOpts {
                insecure_root_capabilities: true,
            },
        );
        assert!(ctr.privileged());
    }

    #[test]
    fn host_network_is_opt_in() {
        let ctr = Container::from("bitnami/kubectl");
        assert_eq!(ctr.network(), None);
        assert_eq!(ctr.with_host_network().network(), Some("host"));
    }

    #[test]
    fn exposed_ports_are_deduplicated() {
        let ctr = Container::from("rancher/k3s")
            .with_exposed_port(6443)
            .with_exposed_port(6443);
        assert_eq!(ctr.exposed_ports(), &[6443]);
    }
}
