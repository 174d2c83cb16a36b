//! Docker implementation of the container runtime seam, via bollard.

use anyhow::{Context, Result};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, WaitContainerOptions,
};
use bollard::models::HostConfig;
use bollard::Docker;
use futures::TryStreamExt;
use tracing::debug;

use super::{ContainerRuntime, ContainerSpec};

/// Container runtime backed by the local Docker daemon.
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connects using the platform defaults (unix socket or named pipe).
    pub fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .context("cannot connect to the Docker daemon")?;
        Ok(Self { docker })
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn create(&self, spec: &ContainerSpec) -> Result<String> {
        let host_config = HostConfig {
            memory: Some(spec.memory_bytes),
            nano_cpus: Some(spec.nano_cpus),
            binds: Some(spec.binds.iter().map(|b| b.to_bind_string()).collect()),
            ..Default::default()
        };

        let config = Config {
            image: Some(spec.image.clone()),
            env: Some(spec.env.clone()),
            working_dir: Some(spec.working_dir.clone()),
            host_config: Some(host_config),
            ..Default::default()
        };

        let created = self
            .docker
            .create_container(None::<CreateContainerOptions<String>>, config)
            .await
            .with_context(|| format!("cannot create container from {}", spec.image))?;

        debug!("Created container {}", created.id);
        Ok(created.id)
    }

    async fn start(&self, handle: &str) -> Result<()> {
        self.docker
            .start_container(handle, None::<StartContainerOptions<String>>)
            .await
            .with_context(|| format!("cannot start container {handle}"))?;
        Ok(())
    }

    async fn wait(&self, handle: &str) -> Result<i64> {
        let mut stream = self
            .docker
            .wait_container(handle, None::<WaitContainerOptions<String>>);

        // bollard surfaces non-zero exits as a typed error; both shapes
        // carry the code we need.
        match stream.try_next().await {
            Ok(Some(response)) => Ok(response.status_code),
            Ok(None) => anyhow::bail!("wait stream for {handle} ended without a status"),
            Err(bollard::errors::Error::DockerContainerWaitError { code, .. }) => Ok(code),
            Err(e) => Err(e).with_context(|| format!("cannot wait on container {handle}")),
        }
    }

    async fn logs(&self, handle: &str) -> Result<Vec<u8>> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            ..Default::default()
        };

        let mut stream = self.docker.logs(handle, Some(options));
        let mut bytes = Vec::new();
        while let Some(chunk) = stream
            .try_next()
            .await
            .with_context(|| format!("cannot read logs of container {handle}"))?
        {
            bytes.extend_from_slice(&chunk.into_bytes());
        }
        Ok(bytes)
    }

    async fn remove(&self, handle: &str, force: bool) -> Result<()> {
        self.docker
            .remove_container(
                handle,
                Some(RemoveContainerOptions {
                    force,
                    ..Default::default()
                }),
            )
            .await
            .with_context(|| format!("cannot remove container {handle}"))?;
        debug!("Removed container {handle}");
        Ok(())
    }
}
