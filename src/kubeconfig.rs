use std::path::Path;

use anyhow::Context;
use url::Url;

const HTTPS: &str = "https:";
const LOCALHOST: &str = "https://localhost:";

/// The `k3s.yaml` credentials file copied out of the config cache.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Kubeconfig {
    contents: String,
}

impl Kubeconfig {
    pub fn new(contents: impl Into<String>) -> Self {
        Self {
            contents: contents.into(),
        }
    }

    pub fn contents(&self) -> &str {
        &self.contents
    }

    /// Point every server address at localhost, keeping the port.
    ///
    /// On each line the text from the first `https:` up to the last `:` is
    /// replaced, so `server: https://10.0.0.5:6443` becomes
    /// `server: https://localhost:6443`.
    pub fn with_localhost(&self) -> Self {
        let contents = self
            .contents
            .split_inclusive('\n')
            .map(rewrite_line)
            .collect::<String>();
        Self { contents }
    }

    pub fn parse(&self) -> anyhow::Result<kube::config::Kubeconfig> {
        kube::config::Kubeconfig::from_yaml(&self.contents).context("Failed to parse kubeconfig")
    }

    /// Server addresses of every cluster entry.
    pub fn servers(&self) -> anyhow::Result<Vec<Url>> {
        self.parse()?
            .clusters
            .iter()
            .filter_map(|named| named.cluster.as_ref()?.server.as_deref())
            .map(|server| Url::parse(server).with_context(|| format!("Invalid server {server}")))
            .collect()
    }

    pub async fn write_to(&self, path: &Path) -> anyhow::Result<()> {
        tokio::fs::write(path, &self.contents)
            .await
            .with_context(|| format!("Failed to write kubeconfig to {}", path.display()))
    }
}

fn rewrite_line(line: &str) -> std::borrow::Cow<'_, str> {
    let Some(start) = line.find(HTTPS) else {
        return line.into();
    };
    let rest = &line[start + HTTPS.len()..];
    let Some(end) = rest.rfind(':') else {
        return line.into();
    };
    let tail = &rest[end + 1..];
    format!("{}{LOCALHOST}{tail}", &line[..start]).into()
}
