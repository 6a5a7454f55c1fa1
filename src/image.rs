use crate::container::Container;

/// Used for the k3s server when no image is specified.
pub(crate) const DEFAULT_IMAGE_REPOSITORY: &str = "rancher/k3s";

/// Used to copy the kubeconfig out of the config cache.
pub(crate) const DEFAULT_IMAGE_REPOSITORY_KUBECONFIG: &str = "alpine";

/// Used to run kubectl against the cluster.
pub(crate) const DEFAULT_IMAGE_REPOSITORY_KUBECTL: &str = "bitnami/kubectl";

/// Which base container to start from. The first populated field wins:
/// `version`, then `image`, then `container`, then the default repository.
#[derive(Clone, Debug, Default)]
pub(crate) struct ImageSelector {
    /// Tag to use from the default repository.
    pub version: Option<String>,

    /// Image reference in "repository:tag" format.
    pub image: Option<String>,

    /// Pre-built container, used as-is.
    pub container: Option<Container>,
}

impl ImageSelector {
    pub fn resolve(&self, default_repository: &str) -> Container {
        if let Some(version) = non_empty(&self.version) {
            Container::from(format!("{default_repository}:{version}"))
        } else if let Some(image) = non_empty(&self.image) {
            Container::from(image)
        } else if let Some(container) = &self.container {
            container.clone()
        } else {
            Container::from(default_repository)
        }
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}
