use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::{AttachParams, ListParams},
    Api, Client, ResourceExt,
};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::debug;
#[cfg(test)]
use unimock::unimock;

/// Output of a command run inside a pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    /// Pod the command ran in
    pub pod: String,
    /// Captured standard output
    pub stdout: String,
    /// Captured standard error
    pub stderr: String,
}

/// Define the behavior we consume from the pod exec API.
#[cfg_attr(test, unimock(api=ExecChannelMock))]
#[async_trait]
pub trait ExecChannel {
    /// Run the command in the first pod of the namespace matching the label selector.
    async fn exec(
        &self,
        namespace: String,
        selector: String,
        command: Vec<String>,
    ) -> Result<ExecOutput>;
}

/// Runs commands through the exec subresource of the cluster API.
pub struct KubeExecChannel {
    client: Client,
}

impl KubeExecChannel {
    /// Create an exec channel using the client.
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

async fn read_all(mut reader: impl AsyncRead + Unpin) -> Result<String> {
    let mut out = String::new();
    reader.read_to_string(&mut out).await?;
    Ok(out)
}

#[async_trait]
impl ExecChannel for KubeExecChannel {
    async fn exec(
        &self,
        namespace: String,
        selector: String,
        command: Vec<String>,
    ) -> Result<ExecOutput> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &namespace);
        let pod = pods
            .list(&ListParams::default().labels(&selector))
            .await?
            .items
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("no pod matches {selector}"))?;
        let name = pod.name_any();
        debug!(pod = name, ?command, "exec");

        let mut attached = pods
            .exec(
                &name,
                command,
                &AttachParams::default().stdin(false).stdout(true).stderr(true),
            )
            .await?;
        let stdout = attached
            .stdout()
            .ok_or_else(|| anyhow!("stdout of {name} not attached"))?;
        let stderr = attached
            .stderr()
            .ok_or_else(|| anyhow!("stderr of {name} not attached"))?;
        let status = attached.take_status();
        let (stdout, stderr) = tokio::try_join!(read_all(stdout), read_all(stderr))?;
        if let Some(status) = status {
            if let Some(status) = status.await {
                if status.status.as_deref() == Some("Failure") {
                    bail!(
                        "command failed in {name}: {}",
                        status.message.unwrap_or_default()
                    );
                }
            }
        }
        attached.join().await?;
        Ok(ExecOutput {
            pod: name,
            stdout,
            stderr,
        })
    }
}
