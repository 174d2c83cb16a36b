//! Execution sandbox — container runtime seam.
//!
//! The orchestrator depends on exactly five operations: create, start,
//! wait, logs, remove. They are expressed as an object-safe trait so the
//! production Docker implementation and the in-memory test runtime are
//! interchangeable, the same way LLM providers hide behind a trait in the
//! classifier.

pub mod docker;

use anyhow::Result;
use async_trait::async_trait;

/// A host → container bind mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindMount {
    pub host_path: String,
    pub container_path: String,
}

impl BindMount {
    pub fn new(host_path: impl Into<String>, container_path: impl Into<String>) -> Self {
        Self {
            host_path: host_path.into(),
            container_path: container_path.into(),
        }
    }

    /// Docker bind syntax: `host:container`
    pub fn to_bind_string(&self) -> String {
        format!("{}:{}", self.host_path, self.container_path)
    }
}

/// Everything needed to provision one sandboxed process.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub image: String,
    /// `KEY=VALUE` pairs, including the env-carried task payload
    pub env: Vec<String>,
    /// Memory ceiling in bytes
    pub memory_bytes: i64,
    /// CPU ceiling in billionths of a core (Docker nano-CPUs)
    pub nano_cpus: i64,
    pub binds: Vec<BindMount>,
    /// Working directory inside the container
    pub working_dir: String,
}

/// The five-operation contract between the orchestrator and whatever
/// actually runs containers. Handles are opaque runtime-assigned ids.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Provisions a container and returns its handle. Does not start it.
    async fn create(&self, spec: &ContainerSpec) -> Result<String>;

    async fn start(&self, handle: &str) -> Result<()>;

    /// Blocks until the container exits; returns the exit code.
    async fn wait(&self, handle: &str) -> Result<i64>;

    /// Combined captured output. May carry multiplexed stream framing;
    /// the output parser strips it.
    async fn logs(&self, handle: &str) -> Result<Vec<u8>>;

    /// Removes the container. With `force`, a running container is killed
    /// first. Must succeed-or-error fast; callers swallow errors from
    /// already-gone containers.
    async fn remove(&self, handle: &str, force: bool) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Compile-time verification that `ContainerRuntime` is object-safe.
    #[test]
    fn test_container_runtime_is_object_safe() {
        fn _assert_object_safe(_: &dyn ContainerRuntime) {}
    }

    #[test]
    fn test_bind_mount_string() {
        let bind = BindMount::new("/data/s1/workspace", "/workspace");
        assert_eq!(bind.to_bind_string(), "/data/s1/workspace:/workspace");
    }
}
