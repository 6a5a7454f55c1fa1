use crate::container::{Container, Service};
use crate::error::Error;

mod docker;

pub(crate) use docker::DockerCli;

/// A service started in the background by a [`Platform`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct ServiceHandle {
    pub id: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct ServiceStatus {
    pub running: bool,
    /// Host endpoints in `host:port` form, one per published port.
    pub endpoints: Vec<String>,
}

/// The container build and execution engine the cluster runs on.
///
/// Every call is one-shot: failures are returned as they happen, nothing is
/// retried and nothing waits for readiness.
pub(crate) trait Platform {
    /// Run every exec of `ctr` in order and return the last one's stdout.
    async fn stdout(&self, ctr: &Container) -> Result<String, Error>;

    /// Run every exec of `ctr`, then read `path` out of the container.
    async fn file(&self, ctr: &Container, path: &str) -> Result<String, Error>;

    async fn start(&self, service: &Service) -> Result<ServiceHandle, Error>;

    async fn status(&self, handle: &ServiceHandle) -> Result<ServiceStatus, Error>;

    async fn stop(&self, handle: &ServiceHandle) -> Result<(), Error>;
}
