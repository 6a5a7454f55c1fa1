use tracing::*;

use crate::cachebuster::{with_cache_buster, CacheBusterLevel, Clock};
use crate::container::{CacheVolume, Container, ExecOpts, FileOpts, Service};
use crate::context::Data;
use crate::error::Error;
use crate::image::{
    ImageSelector, DEFAULT_IMAGE_REPOSITORY, DEFAULT_IMAGE_REPOSITORY_KUBECONFIG,
    DEFAULT_IMAGE_REPOSITORY_KUBECTL,
};
use crate::kubeconfig::Kubeconfig;
use crate::platform::{Platform, ServiceHandle};

const ENTRYPOINT: &str = include_str!("../hack/entrypoint.sh");

const CONFIG_PATH: &str = "/etc/rancher/k3s";
const CACHE_PATH: &str = "/cache/k3s";
const KUBECONFIG_FILE: &str = "k3s.yaml";
const KUBECONFIG_WORKDIR: &str = "/work";
const KUBECTL_CONFIG: &str = "/.kube/config";
const KUBECTL_USER: &str = "1001";

pub(crate) const DEFAULT_NAME: &str = "default";
pub(crate) const DEFAULT_PORT: u16 = 6443;
pub(crate) const DEFAULT_DISABLED_SERVICES: [&str; 2] = ["traefik", "metrics-server"];

/// Everything needed to describe one cluster.
#[derive(Clone, Debug)]
pub(crate) struct ClusterOptions {
    /// Namespaces the persistent config cache.
    pub name: String,
    pub server: ImageSelector,
    /// HTTPS listen port.
    pub port: u16,
    /// Packaged components to skip, e.g. coredns, servicelb, traefik,
    /// local-storage, metrics-server.
    pub disable_services: Vec<String>,
    pub disable_helm_controller: bool,
    pub disable_kube_proxy: bool,
    pub disable_network_policy: bool,
    pub disable_cloud_controller: bool,
    pub disable_scheduler: bool,
    pub kubeconfig: ImageSelector,
    pub kubectl: ImageSelector,
}

impl Default for ClusterOptions {
    fn default() -> Self {
        Self {
            name: DEFAULT_NAME.to_string(),
            server: ImageSelector::default(),
            port: DEFAULT_PORT,
            disable_services: DEFAULT_DISABLED_SERVICES.map(String::from).to_vec(),
            disable_helm_controller: false,
            disable_kube_proxy: false,
            disable_network_policy: false,
            disable_cloud_controller: false,
            disable_scheduler: false,
            kubeconfig: ImageSelector::default(),
            kubectl: ImageSelector::default(),
        }
    }
}

/// A k3s server running in a container, plus the helpers that talk to it.
pub(crate) struct K3s {
    ctr: Container,
    config_cache: CacheVolume,
    port: u16,
    disable_services: Vec<String>,
    disable_helm_controller: bool,
    disable_kube_proxy: bool,
    disable_network_policy: bool,
    disable_cloud_controller: bool,
    disable_scheduler: bool,
    kubeconfig: ImageSelector,
    kubectl: ImageSelector,
}

impl K3s {
    pub fn new(opts: ClusterOptions) -> Self {
        Self {
            ctr: opts.server.resolve(DEFAULT_IMAGE_REPOSITORY),
            config_cache: CacheVolume::new(format!("k3s_config_{}", opts.name)),
            port: opts.port,
            disable_services: opts.disable_services,
            disable_helm_controller: opts.disable_helm_controller,
            disable_kube_proxy: opts.disable_kube_proxy,
            disable_network_policy: opts.disable_network_policy,
            disable_cloud_controller: opts.disable_cloud_controller,
            disable_scheduler: opts.disable_scheduler,
            kubeconfig: opts.kubeconfig,
            kubectl: opts.kubectl,
        }
    }

    /// The server container with its mounts and port, before any exec.
    pub fn container(&self) -> Container {
        self.ctr
            .clone()
            .with(entrypoint)
            .with_mounted_cache(CONFIG_PATH, &self.config_cache)
            .with_mounted_temp("/etc/lib/cni")
            .with_mounted_temp("/var/lib/kubelet")
            .with_mounted_temp("/var/lib/rancher/k3s")
            .with_mounted_temp("/var/log")
            .with_exposed_port(self.port)
    }

    /// `k3s server` followed by the configured flags, in a fixed order.
    pub fn server_command(&self) -> Vec<String> {
        let mut opts = vec!["k3s".to_string(), "server".to_string()];

        opts.push("--https-listen-port".to_string());
        opts.push(self.port.to_string());

        // Do not deploy packaged components and delete any deployed components
        for service in &self.disable_services {
            opts.push("--disable".to_string());
            opts.push(service.clone());
        }

        let flags = [
            (self.disable_helm_controller, "--disable-helm-controller"),
            (self.disable_kube_proxy, "--disable-kube-proxy"),
            (self.disable_network_policy, "--disable-network-policy"),
            (self.disable_cloud_controller, "--disable-cloud-controller"),
            (self.disable_scheduler, "--disable-scheduler"),
        ];
        opts.extend(
            flags
                .into_iter()
                .filter(|(enabled, _)| *enabled)
                .map(|(_, flag)| flag.to_string()),
        );

        opts
    }

    /// Attach the server command to `ctr`. k3s sets up networking and
    /// cgroups itself, so it needs root capabilities.
    pub fn k3s(&self, ctr: Container) -> Container {
        ctr.with_exec(
            ["sh".to_string(), "-c".to_string(), self.server_command().join(" ")],
            ExecOpts {
                insecure_root_capabilities: true,
            },
        )
    }

    pub fn service(&self) -> Service {
        self.k3s(self.container()).as_service()
    }

    pub async fn start<P: Platform>(&self, ctx: &Data<P>) -> Result<ServiceHandle, Error> {
        info!(cache = %self.config_cache.name, port = self.port, "Starting k3s");
        ctx.platform.start(&self.service()).await
    }

    #[cfg_attr(not(test), allow(dead_code))]
    pub fn with_container(mut self, ctr: Container) -> Self {
        self.ctr = ctr;
        self
    }

    pub fn with_cache_buster(mut self, level: CacheBusterLevel, clock: &dyn Clock) -> Self {
        self.ctr = with_cache_buster(self.ctr, level, clock);
        self
    }

    /// Helper that copies `k3s.yaml` out of the config cache. Always cache
    /// busted so a stale copy is never reused.
    fn kubeconfig_container(&self, clock: &dyn Clock) -> Container {
        let ctr = self.kubeconfig.resolve(DEFAULT_IMAGE_REPOSITORY_KUBECONFIG);
        with_cache_buster(ctr, CacheBusterLevel::Second, clock)
            .with_workdir(KUBECONFIG_WORKDIR)
            .with_mounted_cache(CACHE_PATH, &self.config_cache)
            .with_exec(
                [
                    "cp".to_string(),
                    format!("{CACHE_PATH}/{KUBECONFIG_FILE}"),
                    KUBECONFIG_FILE.to_string(),
                ],
                ExecOpts::default(),
            )
    }

    /// Fetch the kubeconfig the server wrote into the config cache. With
    /// `local` the server address points at localhost, which is what a
    /// caller reaching the service through its published port needs.
    ///
    /// Fails if the server has not written the file yet.
    pub async fn kubeconfig<P: Platform>(
        &self,
        ctx: &Data<P>,
        local: bool,
    ) -> Result<Kubeconfig, Error> {
        let ctr = self.kubeconfig_container(ctx.clock.as_ref());
        let contents = ctx.platform.file(&ctr, KUBECONFIG_FILE).await?;
        info!(cache = %self.config_cache.name, local, "Fetched kubeconfig");

        let kubeconfig = Kubeconfig::new(contents);
        Ok(if local {
            kubeconfig.with_localhost()
        } else {
            kubeconfig
        })
    }

    fn kubectl_container(&self, kubeconfig: &Kubeconfig, clock: &dyn Clock) -> Container {
        let ctr = self
            .kubectl
            .resolve(DEFAULT_IMAGE_REPOSITORY_KUBECTL)
            .without_entrypoint()
            .with_mounted_cache(CACHE_PATH, &self.config_cache);
        with_cache_buster(ctr, CacheBusterLevel::Second, clock)
            .with_new_file(
                KUBECTL_CONFIG,
                kubeconfig.contents(),
                FileOpts {
                    permissions: Some(0o600),
                    owner: Some(KUBECTL_USER.to_string()),
                },
            )
            .with_user(KUBECTL_USER)
            .with_host_network()
    }

    /// Run `kubectl <args>` through a shell. `args` is not tokenized or
    /// escaped, so it must come from a trusted source.
    pub async fn kubectl<P: Platform>(&self, ctx: &Data<P>, args: &str) -> Result<String, Error> {
        let kubeconfig = self.kubeconfig(ctx, false).await?;
        kubeconfig.parse()?;

        let ctr = self
            .kubectl_container(&kubeconfig, ctx.clock.as_ref())
            .with_exec(
                ["sh".to_string(), "-c".to_string(), format!("kubectl {args}")],
                ExecOpts::default(),
            );
        debug!(%args, "Running kubectl");
        ctx.platform.stdout(&ctr).await
    }

    /// Run kubectl with `args` passed as-is, without a shell in between.
    pub async fn kubectl_args<P: Platform>(
        &self,
        ctx: &Data<P>,
        args: &[String],
    ) -> Result<String, Error> {
        let kubeconfig = self.kubeconfig(ctx, false).await?;
        kubeconfig.parse()?;

        let ctr = self
            .kubectl_container(&kubeconfig, ctx.clock.as_ref())
            .with_exec(
                std::iter::once("kubectl".to_string()).chain(args.iter().cloned()),
                ExecOpts::default(),
            );
        debug!(?args, "Running kubectl");
        ctx.platform.stdout(&ctr).await
    }
}

/// Install the bundled entrypoint script and run everything through it.
fn entrypoint(ctr: Container) -> Container {
    let opts = FileOpts {
        permissions: Some(0o755),
        owner: None,
    };
    ctr.with_new_file("/usr/bin/entrypoint.sh", ENTRYPOINT, opts)
        .with_entrypoint(["entrypoint.sh"])
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::cachebuster::{FixedClock, CACHE_BURSTER_ENV};
    use crate::container::MountSource;
    use crate::platform::fake::RecordingPlatform;

    const K3S_YAML: &str = "apiVersion: v1
clusters:
- cluster:
    server: https://10.0.0.5:6443
  name: default
contexts:
- context:
    cluster: default
    user: default
  name: default
current-context: default
kind: Config
users:
- name: default
  user:
    token: secret
";

    fn ctx(files: &[(&str, &str)]) -> Data<RecordingPlatform> {
        Data {
            platform: RecordingPlatform {
                files: files
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect::<HashMap<_, _>>(),
                stdout: "node/default Ready\n".to_string(),
                ..Default::default()
            },
            clock: Box::new(FixedClock(
                Utc.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).unwrap(),
            )),
        }
    }

    fn with_disabled(services: &[&str]) -> K3s {
        K3s::new(ClusterOptions {
            disable_services: services.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        })
    }

    #[test]
    fn default_server_command() {
        let k3s = with_disabled(&["traefik", "metrics-server"]);
        assert_eq!(
            k3s.server_command().join(" "),
            "k3s server --https-listen-port 6443 --disable traefik --disable metrics-server"
        );
    }

    #[test]
    fn no_disabled_services_means_no_disable_flags() {
        let k3s = with_disabled(&[]);
        assert_eq!(
            k3s.server_command(),
            ["k3s", "server", "--https-listen-port", "6443"]
        );
    }

    #[test]
    fn boolean_flags_follow_services_in_fixed_order() {
        let k3s = K3s::new(ClusterOptions {
            port: 7443,
            disable_services: vec!["coredns".to_string()],
            disable_helm_controller: true,
            disable_kube_proxy: true,
            disable_network_policy: true,
            disable_cloud_controller: true,
            disable_scheduler: true,
            ..Default::default()
        });
        assert_eq!(
            k3s.server_command().join(" "),
            "k3s server --https-listen-port 7443 --disable coredns \
             --disable-helm-controller --disable-kube-proxy --disable-network-policy \
             --disable-cloud-controller --disable-scheduler"
        );
    }

    #[test]
    fn single_flag_only() {
        let k3s = K3s::new(ClusterOptions {
            disable_services: vec![],
            disable_network_policy: true,
            ..Default::default()
        });
        assert_eq!(
            k3s.server_command().last().map(String::as_str),
            Some("--disable-network-policy")
        );
        assert_eq!(k3s.server_command().len(), 5);
    }

    #[test]
    fn command_is_deterministic() {
        let a = with_disabled(&["servicelb", "local-storage"]);
        let b = with_disabled(&["servicelb", "local-storage"]);
        assert_eq!(a.server_command(), b.server_command());
    }

    #[test]
    fn container_mount_plan() {
        let k3s = K3s::new(ClusterOptions {
            name: "ci".to_string(),
            port: 16443,
            ..Default::default()
        });
        let ctr = k3s.container();

        assert_eq!(k3s.config_cache.name, "k3s_config_ci");
        assert_eq!(ctr.image(), "rancher/k3s");
        assert_eq!(ctr.exposed_ports(), &[16443]);
        assert_eq!(ctr.entrypoint(), Some(&["entrypoint.sh".to_string()][..]));
        assert_eq!(ctr.files()[0].path, "/usr/bin/entrypoint.sh");
        assert_eq!(ctr.files()[0].opts.permissions, Some(0o755));

        let mounts = ctr.mounts();
        assert_eq!(mounts[0].target, "/etc/rancher/k3s");
        assert_eq!(
            mounts[0].source,
            MountSource::Cache(CacheVolume::new("k3s_config_ci"))
        );
        let temps: Vec<_> = mounts[1..]
            .iter()
            .filter(|m| m.source == MountSource::Temp)
            .map(|m| m.target.as_str())
            .collect();
        assert_eq!(
            temps,
            ["/etc/lib/cni", "/var/lib/kubelet", "/var/lib/rancher/k3s", "/var/log"]
        );
        assert!(ctr.execs().is_empty());
    }

    #[test]
    fn service_runs_server_privileged() {
        let service = with_disabled(&["traefik"]).service();
        let execs = service.container.execs();

        assert_eq!(execs.len(), 1);
        assert_eq!(
            execs[0].args,
            ["sh", "-c", "k3s server --https-listen-port 6443 --disable traefik"]
        );
        assert!(execs[0].opts.insecure_root_capabilities);
    }

    #[test]
    fn server_image_selection() {
        let k3s = K3s::new(ClusterOptions {
            server: ImageSelector {
                version: Some("v1.31.1-k3s1".to_string()),
                image: Some("example/k3s".to_string()),
                container: None,
            },
            ..Default::default()
        });
        assert_eq!(k3s.container().image(), "rancher/k3s:v1.31.1-k3s1");

        let k3s = k3s.with_container(Container::from("mirror.local/k3s:dev"));
        assert_eq!(k3s.container().image(), "mirror.local/k3s:dev");
    }

    #[test]
    fn server_cache_buster() {
        let clock = FixedClock(Utc.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).unwrap());
        let k3s = K3s::new(ClusterOptions::default());

        let busted = K3s::new(ClusterOptions::default())
            .with_cache_buster(CacheBusterLevel::Daily, &clock);
        assert_eq!(busted.container().env()[CACHE_BURSTER_ENV], "20250102");

        let untouched = k3s.with_cache_buster(CacheBusterLevel::None, &clock);
        assert!(untouched.container().env().is_empty());
    }

    #[tokio::test]
    async fn kubeconfig_is_copied_from_cache() {
        let ctx = ctx(&[("/work/k3s.yaml", K3S_YAML)]);
        let k3s = K3s::new(ClusterOptions::default());

        let kubeconfig = k3s.kubeconfig(&ctx, false).await.unwrap();
        assert_eq!(kubeconfig.contents(), K3S_YAML);

        let recorded = ctx.platform.recorded();
        let helper = &recorded[0];
        assert_eq!(helper.image(), "alpine");
        assert_eq!(helper.env()[CACHE_BURSTER_ENV], "20250102030405");
        assert_eq!(helper.mounts()[0].target, "/cache/k3s");
        assert_eq!(
            helper.execs()[0].args,
            ["cp", "/cache/k3s/k3s.yaml", "k3s.yaml"]
        );
    }

    #[tokio::test]
    async fn local_kubeconfig_points_at_localhost() {
        let ctx = ctx(&[("/work/k3s.yaml", K3S_YAML)]);
        let k3s = K3s::new(ClusterOptions {
            kubeconfig: ImageSelector {
                version: Some("3.20".to_string()),
                ..Default::default()
            },
            ..Default::default()
        });

        let kubeconfig = k3s.kubeconfig(&ctx, true).await.unwrap();
        assert!(kubeconfig.contents().contains("https://localhost:6443"));
        assert!(!kubeconfig.contents().contains("10.0.0.5"));
        assert_eq!(ctx.platform.recorded()[0].image(), "alpine:3.20");
    }

    #[tokio::test]
    async fn missing_kubeconfig_propagates() {
        let ctx = ctx(&[]);
        let k3s = K3s::new(ClusterOptions::default());

        let err = k3s.kubeconfig(&ctx, false).await.unwrap_err();
        assert!(matches!(err, Error::Exit { code: Some(1), .. }));
    }

    #[tokio::test]
    async fn kubectl_runs_through_shell_as_non_root() {
        let ctx = ctx(&[("/work/k3s.yaml", K3S_YAML)]);
        let k3s = K3s::new(ClusterOptions::default());

        let out = k3s.kubectl(&ctx, "get nodes -o name").await.unwrap();
        assert_eq!(out, "node/default Ready\n");

        let recorded = ctx.platform.recorded();
        assert_eq!(recorded.len(), 2);
        let kubectl = &recorded[1];
        assert_eq!(kubectl.image(), "bitnami/kubectl");
        assert_eq!(kubectl.entrypoint(), Some(&[][..]));
        assert_eq!(kubectl.user(), Some("1001"));
        assert_eq!(kubectl.env()[CACHE_BURSTER_ENV], "20250102030405");
        assert_eq!(kubectl.network(), Some("host"));

        let file = &kubectl.files()[0];
        assert_eq!(file.path, "/.kube/config");
        assert_eq!(file.contents, K3S_YAML);
        assert_eq!(file.opts.permissions, Some(0o600));
        assert_eq!(file.opts.owner.as_deref(), Some("1001"));

        assert_eq!(
            kubectl.execs()[0].args,
            ["sh", "-c", "kubectl get nodes -o name"]
        );
    }

    #[tokio::test]
    async fn kubectl_args_skip_the_shell() {
        let ctx = ctx(&[("/work/k3s.yaml", K3S_YAML)]);
        let k3s = K3s::new(ClusterOptions::default());

        let args = ["get".to_string(), "pods; rm -rf /".to_string()];
        k3s.kubectl_args(&ctx, &args).await.unwrap();

        let recorded = ctx.platform.recorded();
        assert_eq!(
            recorded[1].execs()[0].args,
            ["kubectl", "get", "pods; rm -rf /"]
        );
    }

    #[tokio::test]
    async fn kubectl_rejects_malformed_kubeconfig() {
        let ctx = ctx(&[("/work/k3s.yaml", "clusters: [")]);
        let k3s = K3s::new(ClusterOptions::default());

        assert!(k3s.kubectl(&ctx, "version").await.is_err());
        assert_eq!(ctx.platform.recorded().len(), 1);
    }

    #[tokio::test]
    async fn start_hands_service_to_platform() {
        let ctx = ctx(&[]);
        let k3s = K3s::new(ClusterOptions::default());

        let handle = k3s.start(&ctx).await.unwrap();
        assert_eq!(handle.id, "k3s-test");
        assert_eq!(ctx.platform.recorded()[0], k3s.service().container);
    }
}
