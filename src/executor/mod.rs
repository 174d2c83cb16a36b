//! Execution orchestrator — the central state machine.
//!
//! Takes a screened request, resolves the session's mounts, injects
//! configuration and secrets, provisions a resource-bounded container,
//! races it against the request timeout, retries once with the fallback
//! credential when the primary one fails, and parses the captured output
//! into a typed result.
//!
//! Only orchestrator-level faults (sandbox creation/start errors,
//! timeouts, unexpected exits) propagate as errors; output-parsing
//! ambiguity is absorbed into the result.

pub mod output;
pub mod registry;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::SandboxConfig;
use crate::sandbox::{BindMount, ContainerRuntime, ContainerSpec};
use crate::session::SessionStore;
use registry::ExecutionRegistry;

/// Container-side mount points
const WORKSPACE_MOUNT: &str = "/workspace";
const HOME_MOUNT: &str = "/home/agent";

/// Env var carrying the JSON task payload into the sandbox
const TASK_ENV: &str = "COURIER_TASK";

/// Literal signatures of a failed credential in captured output
const AUTH_FAILURE_MARKERS: &[&str] = &[
    "authentication_error",
    "authentication failed",
    "invalid api key",
    "credential has expired",
    "not authenticated",
];

/// Bytes of output quoted in error messages sent back to operators
const ERROR_EXCERPT_LIMIT: usize = 300;

/// Which reply channel the request came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskSource {
    Email,
    Api,
}

/// Agent definition, loaded elsewhere and read-only here.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    pub id: String,
    pub name: String,
    pub system_prompt: String,
    /// Static or `${VAR}`-templated env passed into the sandbox
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Pre-resolved service/tool configuration (JSON object)
    #[serde(default)]
    pub services: Option<serde_json::Value>,
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    #[serde(default)]
    pub model: Option<String>,
}

/// Resource ceilings for one execution.
#[derive(Debug, Clone, Copy)]
pub struct ResourceLimits {
    pub memory_mb: u64,
    pub cpu_cores: f64,
    pub timeout_ms: u64,
    pub max_turns: u32,
}

/// One unit of work. Immutable once submitted.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    /// Caller-supplied, unique per attempt
    pub execution_id: String,
    pub prompt: String,
    pub agent: AgentConfig,
    pub session_id: Option<String>,
    pub use_resume: bool,
    pub limits: ResourceLimits,
    pub skip_safety_check: bool,
    pub source: TaskSource,
    /// Request-scoped service config merged over the agent's own
    pub services: Option<serde_json::Value>,
}

/// Which credential carried the successful attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMethod {
    Primary,
    Fallback,
}

/// Outcome of one execution attempt. Produced exactly once per attempt.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub summary: String,
    pub files_modified: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub models_used: Vec<String>,
    pub auth_method: AuthMethod,
    /// Bounded tail of the raw output, for diagnostics
    pub raw_output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turns: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sandbox_session_id: Option<String>,
}

/// JSON payload delivered to the sandbox via the environment.
#[derive(Debug, Serialize)]
struct TaskPayload<'a> {
    prompt: &'a str,
    system_prompt: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
    max_turns: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    resume: Option<&'a str>,
    allowed_tools: &'a [String],
}

/// Resolved mounts for one run.
struct MountPlan {
    /// Absent for the stateless legacy mount (credential-only)
    workspace: Option<PathBuf>,
    sandbox_home: PathBuf,
    /// Set when the sandbox-home is ephemeral and must be discarded
    ephemeral: bool,
}

/// Result of one container attempt.
struct Attempt {
    exit_code: i64,
    text: String,
    raw: Vec<u8>,
}

impl Attempt {
    fn auth_failed(&self) -> bool {
        let lower = self.text.to_ascii_lowercase();
        AUTH_FAILURE_MARKERS.iter().any(|m| lower.contains(m))
    }
}

/// The orchestrator. Cheap to share behind an `Arc`; every `execute`
/// call is independent of every other.
pub struct ExecutionOrchestrator {
    runtime: Arc<dyn ContainerRuntime>,
    sessions: Arc<SessionStore>,
    registry: Arc<ExecutionRegistry>,
    config: SandboxConfig,
}

impl ExecutionOrchestrator {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        sessions: Arc<SessionStore>,
        registry: Arc<ExecutionRegistry>,
        config: SandboxConfig,
    ) -> Self {
        Self {
            runtime,
            sessions,
            registry,
            config,
        }
    }

    /// Runs one screened request to completion. The registry observes the
    /// whole lifecycle; the caller gets either a typed result or an
    /// orchestrator-level fault.
    pub async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionResult> {
        self.registry.start(&request.execution_id).await;
        info!(
            "Execution {} starting (agent: {} \"{}\", session: {}, source: {:?})",
            request.execution_id,
            request.agent.id,
            request.agent.name,
            request.session_id.as_deref().unwrap_or("none"),
            request.source,
        );
        if request.skip_safety_check {
            warn!(
                "Execution {} was submitted with the safety check skipped",
                request.execution_id
            );
        }

        let outcome = self.run(request).await;

        match &outcome {
            Ok(result) => {
                info!(
                    "Execution {} completed (success: {}, auth: {:?})",
                    request.execution_id, result.success, result.auth_method
                );
                self.registry
                    .complete(&request.execution_id, result.clone())
                    .await;
            }
            Err(e) => {
                warn!("Execution {} failed: {e:#}", request.execution_id);
                self.registry
                    .fail(&request.execution_id, &format!("{e:#}"))
                    .await;
            }
        }

        outcome
    }

    async fn run(&self, request: &ExecutionRequest) -> Result<ExecutionResult> {
        let mounts = self.resolve_mounts(request).await?;

        let result = self.run_with_mounts(request, &mounts).await;

        if mounts.ephemeral {
            self.sessions.discard_ephemeral(&request.execution_id);
        }

        result
    }

    async fn run_with_mounts(
        &self,
        request: &ExecutionRequest,
        mounts: &MountPlan,
    ) -> Result<ExecutionResult> {
        self.inject_service_config(request, mounts)?;

        let system_prompt = resolve_prompt_placeholders(&request.agent.system_prompt);
        let resume_id = self.resume_id(request).await?;

        let payload = TaskPayload {
            prompt: &request.prompt,
            system_prompt: &system_prompt,
            model: request.agent.model.as_deref(),
            max_turns: request.limits.max_turns,
            resume: resume_id.as_deref(),
            allowed_tools: &request.agent.allowed_tools,
        };
        let payload_json =
            serde_json::to_string(&payload).context("cannot encode task payload")?;

        // One deadline covers both credential attempts
        let budget = Duration::from_millis(request.limits.timeout_ms);
        let started = Instant::now();

        let spec = self.container_spec(request, mounts, &payload_json, AuthMethod::Primary);
        let first = self.run_attempt(&spec, budget).await?;

        let attempt_failed = first.exit_code != 0 || first.auth_failed();
        let (attempt, auth_method) = if !attempt_failed {
            (first, AuthMethod::Primary)
        } else if self.config.fallback_api_key.is_empty() {
            warn!(
                "Execution {}: primary credential failed (exit {}), no fallback key configured",
                request.execution_id, first.exit_code
            );
            (first, AuthMethod::Primary)
        } else {
            info!(
                "Execution {}: primary credential failed (exit {}), retrying with fallback key",
                request.execution_id, first.exit_code
            );
            let remaining = budget.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                bail!(
                    "execution timed out after {}ms (before fallback attempt)",
                    request.limits.timeout_ms
                );
            }
            let spec =
                self.container_spec(request, mounts, &payload_json, AuthMethod::Fallback);
            let second = self.run_attempt(&spec, remaining).await?;
            (second, AuthMethod::Fallback)
        };

        if attempt.exit_code != 0 {
            bail!(
                "sandbox exited with code {}: {}",
                attempt.exit_code,
                output::tail(attempt.text.trim(), ERROR_EXCERPT_LIMIT)
            );
        }

        let parsed = output::parse_output(&attempt.raw, self.config.raw_output_tail);

        // A successful run that established a sandbox conversation makes
        // the session resumable from now on.
        if let (Some(session_id), Some(sbx)) =
            (request.session_id.as_deref(), parsed.sandbox_session_id.as_deref())
        {
            if parsed.success {
                if let Err(e) = self.sessions.set_sandbox_session(session_id, sbx).await {
                    warn!("Cannot record sandbox session id for {session_id}: {e:#}");
                }
            }
        }

        for tool in &parsed.tool_invocations {
            debug!(
                "Execution {}: tool {} ({} bytes of output)",
                request.execution_id,
                tool.command,
                tool.output.len()
            );
        }

        Ok(ExecutionResult {
            success: parsed.success,
            summary: parsed.summary,
            files_modified: parsed.files_modified,
            commit_hash: parsed.commit_hash,
            error: None,
            models_used: parsed.models_used,
            auth_method,
            raw_output: parsed.raw_tail,
            cost_usd: parsed.cost_usd,
            turns: parsed.turns,
            sandbox_session_id: parsed.sandbox_session_id,
        })
    }

    /// Creates, starts and awaits one container within `budget`. The
    /// container is removed on every path; on timeout the partial output
    /// is discarded for determinism.
    async fn run_attempt(&self, spec: &ContainerSpec, budget: Duration) -> Result<Attempt> {
        let handle = self
            .runtime
            .create(spec)
            .await
            .context("sandbox creation failed")?;

        let outcome = async {
            self.runtime
                .start(&handle)
                .await
                .context("sandbox start failed")?;

            match tokio::time::timeout(budget, self.runtime.wait(&handle)).await {
                Ok(Ok(exit_code)) => {
                    let raw = self.runtime.logs(&handle).await.unwrap_or_default();
                    let text = output::demux_stream(&raw);
                    Ok(Attempt {
                        exit_code,
                        text,
                        raw,
                    })
                }
                Ok(Err(e)) => Err(e.context("sandbox wait failed")),
                Err(_) => bail!(
                    "execution timed out after {}ms, sandbox terminated",
                    budget.as_millis()
                ),
            }
        }
        .await;

        // Unconditional teardown; errors from an already-gone container
        // are swallowed.
        if let Err(e) = self.runtime.remove(&handle, true).await {
            debug!("Sandbox cleanup for {handle}: {e:#}");
        }

        outcome
    }

    /// Resolves where the container's workspace and home come from:
    /// the session's durable pair, or an ephemeral credential-only home
    /// for sessionless requests.
    async fn resolve_mounts(&self, request: &ExecutionRequest) -> Result<MountPlan> {
        match request.session_id.as_deref() {
            Some(session_id) => {
                let session = self
                    .sessions
                    .get(session_id)
                    .await?
                    .ok_or_else(|| anyhow!("unknown session: {session_id}"))?;
                let paths = self
                    .sessions
                    .existing_paths(&session.agent_id, session_id)?;
                Ok(MountPlan {
                    workspace: Some(paths.workspace),
                    sandbox_home: paths.sandbox_home,
                    ephemeral: false,
                })
            }
            None => {
                let sandbox_home = self.sessions.stage_ephemeral(&request.execution_id)?;
                Ok(MountPlan {
                    workspace: None,
                    sandbox_home,
                    ephemeral: true,
                })
            }
        }
    }

    /// Writes the merged service/tool configuration into the sandbox's
    /// private config area. Rewritten on every injection, never appended.
    fn inject_service_config(
        &self,
        request: &ExecutionRequest,
        mounts: &MountPlan,
    ) -> Result<()> {
        let merged = merge_services(
            request.agent.services.as_ref(),
            request.services.as_ref(),
        );
        let Some(merged) = merged else {
            return Ok(());
        };

        let json = serde_json::to_string_pretty(&merged)?;
        let resolved = resolve_config_placeholders(&json);
        let path = mounts.sandbox_home.join("services.json");
        std::fs::write(&path, resolved)
            .with_context(|| format!("cannot write service config {}", path.display()))?;
        debug!("Injected service config at {}", path.display());
        Ok(())
    }

    /// The sandbox conversation to resume, if the request asks for it and
    /// the session actually has established state.
    async fn resume_id(&self, request: &ExecutionRequest) -> Result<Option<String>> {
        if !request.use_resume {
            return Ok(None);
        }
        let Some(session_id) = request.session_id.as_deref() else {
            return Ok(None);
        };
        let Some(session) = self.sessions.get(session_id).await? else {
            return Ok(None);
        };
        if !self
            .sessions
            .has_established_state(&session.agent_id, session_id)
        {
            debug!("Session {session_id} has no established state, starting fresh");
            return Ok(None);
        }
        Ok(session.sandbox_session_id)
    }

    fn container_spec(
        &self,
        request: &ExecutionRequest,
        mounts: &MountPlan,
        payload_json: &str,
        auth: AuthMethod,
    ) -> ContainerSpec {
        let mut env = vec![format!("{TASK_ENV}={payload_json}")];

        // Agent-declared env, ${VAR} templates resolved like config
        for (key, value) in &request.agent.env {
            env.push(format!("{key}={}", resolve_config_placeholders(value)));
        }

        match auth {
            AuthMethod::Primary => env.push("COURIER_AUTH=primary".to_string()),
            AuthMethod::Fallback => {
                env.push("COURIER_AUTH=api-key".to_string());
                env.push(format!("COURIER_API_KEY={}", self.config.fallback_api_key));
            }
        }

        let mut binds = Vec::new();
        if let Some(workspace) = &mounts.workspace {
            binds.push(BindMount::new(
                workspace.to_string_lossy(),
                WORKSPACE_MOUNT,
            ));
        }
        binds.push(BindMount::new(
            mounts.sandbox_home.to_string_lossy(),
            HOME_MOUNT,
        ));

        ContainerSpec {
            image: self.config.image.clone(),
            env,
            memory_bytes: (request.limits.memory_mb * 1024 * 1024) as i64,
            nano_cpus: (request.limits.cpu_cores * 1_000_000_000.0) as i64,
            binds,
            working_dir: WORKSPACE_MOUNT.to_string(),
        }
    }
}

// ── Service merge ────────────────────────────────────────

/// Merges request-scoped service definitions over the agent's own.
/// Both are JSON objects keyed by service name; request entries win.
fn merge_services(
    agent: Option<&serde_json::Value>,
    request: Option<&serde_json::Value>,
) -> Option<serde_json::Value> {
    match (agent, request) {
        (None, None) => None,
        (Some(a), None) => Some(a.clone()),
        (None, Some(r)) => Some(r.clone()),
        (Some(a), Some(r)) => {
            let mut merged = a.clone();
            if let (Some(base), Some(extra)) = (merged.as_object_mut(), r.as_object()) {
                for (key, value) in extra {
                    base.insert(key.clone(), value.clone());
                }
                Some(merged)
            } else {
                // Non-object shapes: the request-scoped value wins whole
                Some(r.clone())
            }
        }
    }
}

// ── Placeholder resolution ───────────────────────────────

fn config_placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap())
}

fn prompt_placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{([A-Za-z_][A-Za-z0-9_]*)\}\}").unwrap())
}

/// Resolves `${VAR}` config placeholders against the process environment.
/// An unresolved placeholder becomes the empty string with a warning —
/// config values must never be literally the placeholder text.
pub fn resolve_config_placeholders(text: &str) -> String {
    config_placeholder_re()
        .replace_all(text, |caps: &regex::Captures| {
            let name = &caps[1];
            match std::env::var(name) {
                Ok(value) => value,
                Err(_) => {
                    warn!("Unresolved config placeholder ${{{name}}}, using empty string");
                    String::new()
                }
            }
        })
        .into_owned()
}

/// Resolves `{{VAR}}` prompt placeholders against the process environment.
/// Unresolved placeholders stay literal — empty substitutions must never
/// leak into natural-language prompts.
pub fn resolve_prompt_placeholders(text: &str) -> String {
    prompt_placeholder_re()
        .replace_all(text, |caps: &regex::Captures| {
            let name = &caps[1];
            match std::env::var(name) {
                Ok(value) => value,
                Err(_) => caps[0].to_string(),
            }
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::registry::ExecutionState;
    use crate::config::SessionsConfig;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// One scripted container run for the mock runtime.
    struct ScriptedRun {
        exit_code: i64,
        logs: Vec<u8>,
        hang: bool,
    }

    /// Runtime double: hands out scripted runs in order and records
    /// every create/remove so tests can assert on teardown.
    struct MockRuntime {
        script: Mutex<VecDeque<ScriptedRun>>,
        specs: Mutex<Vec<ContainerSpec>>,
        active: Mutex<Vec<(String, ScriptedRun)>>,
        removed: Mutex<Vec<String>>,
    }

    impl MockRuntime {
        fn new(runs: Vec<ScriptedRun>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(runs.into()),
                specs: Mutex::new(Vec::new()),
                active: Mutex::new(Vec::new()),
                removed: Mutex::new(Vec::new()),
            })
        }

        fn created_count(&self) -> usize {
            self.specs.lock().unwrap().len()
        }

        fn removed_handles(&self) -> Vec<String> {
            self.removed.lock().unwrap().clone()
        }

        fn spec(&self, index: usize) -> ContainerSpec {
            self.specs.lock().unwrap()[index].clone()
        }
    }

    #[async_trait]
    impl ContainerRuntime for MockRuntime {
        async fn create(&self, spec: &ContainerSpec) -> Result<String> {
            let run = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| anyhow!("no scripted run left"))?;
            let mut specs = self.specs.lock().unwrap();
            specs.push(spec.clone());
            let handle = format!("c{}", specs.len());
            self.active.lock().unwrap().push((handle.clone(), run));
            Ok(handle)
        }

        async fn start(&self, _handle: &str) -> Result<()> {
            Ok(())
        }

        async fn wait(&self, handle: &str) -> Result<i64> {
            let (exit_code, hang) = {
                let active = self.active.lock().unwrap();
                let (_, run) = active
                    .iter()
                    .find(|(h, _)| h == handle)
                    .ok_or_else(|| anyhow!("unknown handle {handle}"))?;
                (run.exit_code, run.hang)
            };
            if hang {
                futures::future::pending::<()>().await;
            }
            Ok(exit_code)
        }

        async fn logs(&self, handle: &str) -> Result<Vec<u8>> {
            let active = self.active.lock().unwrap();
            let (_, run) = active
                .iter()
                .find(|(h, _)| h == handle)
                .ok_or_else(|| anyhow!("unknown handle {handle}"))?;
            Ok(run.logs.clone())
        }

        async fn remove(&self, handle: &str, _force: bool) -> Result<()> {
            self.removed.lock().unwrap().push(handle.to_string());
            Ok(())
        }
    }

    const RESULT_LINE: &str = concat!(
        r#"{"type":"result","version":1,"success":true,"summary":"Applied the fix.","#,
        r#""session_id":"sbx-7","models":["claude-sonnet-4-5-20250929"],"#,
        r#""files_modified":["src/lib.rs"],"commit":"abc1234","turns":3,"cost_usd":0.05}"#,
    );

    fn harness(
        dir: &std::path::Path,
        runs: Vec<ScriptedRun>,
    ) -> (Arc<MockRuntime>, Arc<SessionStore>, ExecutionOrchestrator) {
        let runtime = MockRuntime::new(runs);
        let sessions = Arc::new(
            SessionStore::open(&SessionsConfig {
                base_path: dir.to_path_buf(),
                credential_file: None,
                state_dir: ".agent/state".to_string(),
            })
            .unwrap(),
        );
        let registry = Arc::new(ExecutionRegistry::new(Duration::from_secs(300)));
        let orchestrator = ExecutionOrchestrator::new(
            runtime.clone(),
            sessions.clone(),
            registry,
            SandboxConfig {
                image: "courier-sandbox:latest".to_string(),
                memory_mb: 2048,
                cpu_cores: 2.0,
                timeout_secs: 300,
                max_turns: 30,
                fallback_api_key: "fallback-key".to_string(),
                raw_output_tail: 4000,
                registry_retention_secs: 300,
            },
        );
        (runtime, sessions, orchestrator)
    }

    fn request(execution_id: &str) -> ExecutionRequest {
        ExecutionRequest {
            execution_id: execution_id.to_string(),
            prompt: "Fix the failing test".to_string(),
            agent: AgentConfig {
                id: "mailbot".to_string(),
                name: "Mailbot".to_string(),
                system_prompt: "You execute mailed-in tasks.".to_string(),
                env: BTreeMap::new(),
                services: None,
                allowed_tools: vec!["shell".to_string(), "edit".to_string()],
                model: Some("claude-sonnet-4-5-20250929".to_string()),
            },
            session_id: None,
            use_resume: false,
            limits: ResourceLimits {
                memory_mb: 2048,
                cpu_cores: 2.0,
                timeout_ms: 300_000,
                max_turns: 30,
            },
            skip_safety_check: false,
            source: TaskSource::Api,
            services: None,
        }
    }

    // ── success path ────────────────────────────────────

    #[tokio::test]
    async fn test_successful_execution() {
        let dir = tempfile::tempdir().unwrap();
        let (runtime, _, orchestrator) = harness(
            dir.path(),
            vec![ScriptedRun {
                exit_code: 0,
                logs: format!("Setting up\n{RESULT_LINE}\n").into_bytes(),
                hang: false,
            }],
        );

        let result = orchestrator.execute(&request("e1")).await.unwrap();
        assert!(result.success);
        assert_eq!(result.summary, "Applied the fix.");
        assert_eq!(result.files_modified, vec!["src/lib.rs"]);
        assert_eq!(result.commit_hash.as_deref(), Some("abc1234"));
        assert_eq!(result.models_used, vec!["Sonnet"]);
        assert_eq!(result.auth_method, AuthMethod::Primary);
        assert!(result.raw_output.len() <= 4000);
        assert_eq!(result.turns, Some(3));

        // Exactly one container, removed afterwards
        assert_eq!(runtime.created_count(), 1);
        assert_eq!(runtime.removed_handles(), vec!["c1"]);
    }

    #[tokio::test]
    async fn test_registry_observes_completion() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = MockRuntime::new(vec![ScriptedRun {
            exit_code: 0,
            logs: RESULT_LINE.as_bytes().to_vec(),
            hang: false,
        }]);
        let sessions = Arc::new(
            SessionStore::open(&SessionsConfig {
                base_path: dir.path().to_path_buf(),
                credential_file: None,
                state_dir: ".agent/state".to_string(),
            })
            .unwrap(),
        );
        let registry = Arc::new(ExecutionRegistry::new(Duration::from_secs(300)));
        let orchestrator = ExecutionOrchestrator::new(
            runtime,
            sessions,
            registry.clone(),
            SandboxConfig {
                image: "courier-sandbox:latest".to_string(),
                memory_mb: 2048,
                cpu_cores: 2.0,
                timeout_secs: 300,
                max_turns: 30,
                fallback_api_key: String::new(),
                raw_output_tail: 4000,
                registry_retention_secs: 300,
            },
        );

        orchestrator.execute(&request("e1")).await.unwrap();
        let status = registry.get("e1").await.unwrap();
        assert_eq!(status.state, ExecutionState::Completed);
        assert!(status.result.unwrap().success);
    }

    // ── timeout path ────────────────────────────────────

    #[tokio::test]
    async fn test_timeout_terminates_and_fails() {
        let dir = tempfile::tempdir().unwrap();
        let (runtime, _, orchestrator) = harness(
            dir.path(),
            vec![ScriptedRun {
                exit_code: 0,
                logs: b"partial output that must be discarded".to_vec(),
                hang: true,
            }],
        );

        let mut req = request("e1");
        req.limits.timeout_ms = 50;

        let started = Instant::now();
        let err = orchestrator.execute(&req).await.unwrap_err();
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert!(err.to_string().contains("timed out"));

        // The sandbox was force-removed, no leaked handle
        assert_eq!(runtime.removed_handles(), vec!["c1"]);
    }

    #[tokio::test]
    async fn test_timeout_marks_registry_failed() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = MockRuntime::new(vec![ScriptedRun {
            exit_code: 0,
            logs: Vec::new(),
            hang: true,
        }]);
        let sessions = Arc::new(
            SessionStore::open(&SessionsConfig {
                base_path: dir.path().to_path_buf(),
                credential_file: None,
                state_dir: ".agent/state".to_string(),
            })
            .unwrap(),
        );
        let registry = Arc::new(ExecutionRegistry::new(Duration::from_secs(300)));
        let orchestrator = ExecutionOrchestrator::new(
            runtime,
            sessions,
            registry.clone(),
            SandboxConfig {
                image: "courier-sandbox:latest".to_string(),
                memory_mb: 2048,
                cpu_cores: 2.0,
                timeout_secs: 300,
                max_turns: 30,
                fallback_api_key: String::new(),
                raw_output_tail: 4000,
                registry_retention_secs: 300,
            },
        );

        let mut req = request("e1");
        req.limits.timeout_ms = 50;
        orchestrator.execute(&req).await.unwrap_err();

        let status = registry.get("e1").await.unwrap();
        assert_eq!(status.state, ExecutionState::Failed);
        assert!(status.error.unwrap().contains("timed out"));
    }

    // ── credential fallback ─────────────────────────────

    #[tokio::test]
    async fn test_auth_fallback_on_failure_signature() {
        let dir = tempfile::tempdir().unwrap();
        let (runtime, _, orchestrator) = harness(
            dir.path(),
            vec![
                ScriptedRun {
                    exit_code: 1,
                    logs: b"error: authentication_error: token rejected".to_vec(),
                    hang: false,
                },
                ScriptedRun {
                    exit_code: 0,
                    logs: RESULT_LINE.as_bytes().to_vec(),
                    hang: false,
                },
            ],
        );

        let result = orchestrator.execute(&request("e1")).await.unwrap();
        assert!(result.success);
        assert_eq!(result.auth_method, AuthMethod::Fallback);

        // Two containers ran, both removed
        assert_eq!(runtime.created_count(), 2);
        assert_eq!(runtime.removed_handles(), vec!["c1", "c2"]);

        // Second attempt carried the fallback key
        let env = runtime.spec(1).env;
        assert!(env.contains(&"COURIER_AUTH=api-key".to_string()));
        assert!(env.contains(&"COURIER_API_KEY=fallback-key".to_string()));
        // First attempt did not
        let env = runtime.spec(0).env;
        assert!(env.contains(&"COURIER_AUTH=primary".to_string()));
        assert!(!env.iter().any(|e| e.starts_with("COURIER_API_KEY=")));
    }

    #[tokio::test]
    async fn test_auth_signature_with_zero_exit_still_retries() {
        let dir = tempfile::tempdir().unwrap();
        let (runtime, _, orchestrator) = harness(
            dir.path(),
            vec![
                ScriptedRun {
                    exit_code: 0,
                    logs: b"Authentication failed, please re-login\n".to_vec(),
                    hang: false,
                },
                ScriptedRun {
                    exit_code: 0,
                    logs: RESULT_LINE.as_bytes().to_vec(),
                    hang: false,
                },
            ],
        );

        let result = orchestrator.execute(&request("e1")).await.unwrap();
        assert_eq!(result.auth_method, AuthMethod::Fallback);
        assert_eq!(runtime.created_count(), 2);
    }

    #[tokio::test]
    async fn test_both_attempts_failing_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let (runtime, _, orchestrator) = harness(
            dir.path(),
            vec![
                ScriptedRun {
                    exit_code: 1,
                    logs: b"invalid api key".to_vec(),
                    hang: false,
                },
                ScriptedRun {
                    exit_code: 1,
                    logs: b"invalid api key".to_vec(),
                    hang: false,
                },
            ],
        );

        let err = orchestrator.execute(&request("e1")).await.unwrap_err();
        assert!(err.to_string().contains("exited with code 1"));
        assert_eq!(runtime.removed_handles(), vec!["c1", "c2"]);
    }

    #[tokio::test]
    async fn test_no_fallback_key_means_no_second_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = MockRuntime::new(vec![ScriptedRun {
            exit_code: 1,
            logs: b"authentication failed".to_vec(),
            hang: false,
        }]);
        let sessions = Arc::new(
            SessionStore::open(&SessionsConfig {
                base_path: dir.path().to_path_buf(),
                credential_file: None,
                state_dir: ".agent/state".to_string(),
            })
            .unwrap(),
        );
        let registry = Arc::new(ExecutionRegistry::new(Duration::from_secs(300)));
        let orchestrator = ExecutionOrchestrator::new(
            runtime.clone(),
            sessions,
            registry,
            SandboxConfig {
                image: "courier-sandbox:latest".to_string(),
                memory_mb: 2048,
                cpu_cores: 2.0,
                timeout_secs: 300,
                max_turns: 30,
                fallback_api_key: String::new(),
                raw_output_tail: 4000,
                registry_retention_secs: 300,
            },
        );

        let err = orchestrator.execute(&request("e1")).await.unwrap_err();
        assert!(err.to_string().contains("exited with code 1"));
        assert_eq!(runtime.created_count(), 1);
    }

    // ── mounts and payload ──────────────────────────────

    #[tokio::test]
    async fn test_stateless_mount_is_credential_only() {
        let dir = tempfile::tempdir().unwrap();
        let (runtime, _, orchestrator) = harness(
            dir.path(),
            vec![ScriptedRun {
                exit_code: 0,
                logs: RESULT_LINE.as_bytes().to_vec(),
                hang: false,
            }],
        );

        orchestrator.execute(&request("e1")).await.unwrap();

        let spec = runtime.spec(0);
        // Only the sandbox-home bind, no persistent workspace
        assert_eq!(spec.binds.len(), 1);
        assert_eq!(spec.binds[0].container_path, "/home/agent");

        // Ephemeral staging discarded after the run
        assert!(!dir.path().join("ephemeral/e1").exists());
    }

    #[tokio::test]
    async fn test_session_mount_binds_workspace_and_home() {
        let dir = tempfile::tempdir().unwrap();
        let (runtime, sessions, orchestrator) = harness(
            dir.path(),
            vec![ScriptedRun {
                exit_code: 0,
                logs: RESULT_LINE.as_bytes().to_vec(),
                hang: false,
            }],
        );

        let session = sessions
            .create("mailbot", "<msg-1>", "Subject", "ops@example.com")
            .await
            .unwrap();

        let mut req = request("e1");
        req.session_id = Some(session.id.clone());
        let result = orchestrator.execute(&req).await.unwrap();

        let spec = runtime.spec(0);
        assert_eq!(spec.binds.len(), 2);
        assert_eq!(spec.binds[0].container_path, "/workspace");
        assert_eq!(spec.binds[1].container_path, "/home/agent");
        assert_eq!(spec.memory_bytes, 2048 * 1024 * 1024);
        assert_eq!(spec.nano_cpus, 2_000_000_000);

        // The sandbox conversation id was recorded on the session
        assert_eq!(result.sandbox_session_id.as_deref(), Some("sbx-7"));
        let after = sessions.get(&session.id).await.unwrap().unwrap();
        assert_eq!(after.sandbox_session_id.as_deref(), Some("sbx-7"));
    }

    #[tokio::test]
    async fn test_unknown_session_is_a_fault() {
        let dir = tempfile::tempdir().unwrap();
        let (_, _, orchestrator) = harness(dir.path(), vec![]);

        let mut req = request("e1");
        req.session_id = Some("deadbeef".to_string());
        let err = orchestrator.execute(&req).await.unwrap_err();
        assert!(err.to_string().contains("unknown session"));
    }

    #[tokio::test]
    async fn test_task_payload_env() {
        let dir = tempfile::tempdir().unwrap();
        let (runtime, _, orchestrator) = harness(
            dir.path(),
            vec![ScriptedRun {
                exit_code: 0,
                logs: RESULT_LINE.as_bytes().to_vec(),
                hang: false,
            }],
        );

        orchestrator.execute(&request("e1")).await.unwrap();

        let spec = runtime.spec(0);
        let payload_var = spec
            .env
            .iter()
            .find(|e| e.starts_with("COURIER_TASK="))
            .unwrap();
        let payload: serde_json::Value =
            serde_json::from_str(payload_var.strip_prefix("COURIER_TASK=").unwrap()).unwrap();
        assert_eq!(payload["prompt"], "Fix the failing test");
        assert_eq!(payload["system_prompt"], "You execute mailed-in tasks.");
        assert_eq!(payload["max_turns"], 30);
        assert_eq!(payload["allowed_tools"][0], "shell");
        assert!(payload.get("resume").is_none());
    }

    #[tokio::test]
    async fn test_resume_id_requires_established_state() {
        let dir = tempfile::tempdir().unwrap();
        let (runtime, sessions, orchestrator) = harness(
            dir.path(),
            vec![
                ScriptedRun {
                    exit_code: 0,
                    logs: RESULT_LINE.as_bytes().to_vec(),
                    hang: false,
                },
                ScriptedRun {
                    exit_code: 0,
                    logs: RESULT_LINE.as_bytes().to_vec(),
                    hang: false,
                },
            ],
        );

        let session = sessions
            .create("mailbot", "<msg-1>", "Subject", "ops@example.com")
            .await
            .unwrap();
        sessions
            .set_sandbox_session(&session.id, "sbx-old")
            .await
            .unwrap();

        let mut req = request("e1");
        req.session_id = Some(session.id.clone());
        req.use_resume = true;

        // No established state yet → no resume id in the payload
        orchestrator.execute(&req).await.unwrap();
        let payload: serde_json::Value = serde_json::from_str(
            runtime.spec(0).env[0].strip_prefix("COURIER_TASK=").unwrap(),
        )
        .unwrap();
        assert!(payload.get("resume").is_none());

        // Establish state, run again → resume id present
        let state = sessions
            .paths("mailbot", &session.id)
            .sandbox_home
            .join(".agent/state");
        std::fs::create_dir_all(&state).unwrap();
        std::fs::write(state.join("conversation.json"), "{}").unwrap();

        let mut req2 = request("e2");
        req2.session_id = Some(session.id.clone());
        req2.use_resume = true;
        orchestrator.execute(&req2).await.unwrap();
        let payload: serde_json::Value = serde_json::from_str(
            runtime.spec(1).env[0].strip_prefix("COURIER_TASK=").unwrap(),
        )
        .unwrap();
        assert_eq!(payload["resume"], "sbx-old");
    }

    #[tokio::test]
    async fn test_service_config_injection_rewrites_file() {
        let dir = tempfile::tempdir().unwrap();
        let (_, sessions, orchestrator) = harness(
            dir.path(),
            vec![
                ScriptedRun {
                    exit_code: 0,
                    logs: RESULT_LINE.as_bytes().to_vec(),
                    hang: false,
                },
                ScriptedRun {
                    exit_code: 0,
                    logs: RESULT_LINE.as_bytes().to_vec(),
                    hang: false,
                },
            ],
        );

        let session = sessions
            .create("mailbot", "<msg-1>", "Subject", "ops@example.com")
            .await
            .unwrap();

        let mut req = request("e1");
        req.session_id = Some(session.id.clone());
        req.agent.services = Some(serde_json::json!({
            "search": {"endpoint": "https://search.example.com"}
        }));
        req.services = Some(serde_json::json!({
            "tickets": {"endpoint": "https://tickets.example.com"}
        }));
        orchestrator.execute(&req).await.unwrap();

        let path = sessions
            .paths("mailbot", &session.id)
            .sandbox_home
            .join("services.json");
        let written: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert!(written.get("search").is_some());
        assert!(written.get("tickets").is_some());

        // Re-injection rewrites, never appends
        let mut req2 = request("e2");
        req2.session_id = Some(session.id.clone());
        req2.agent.services = Some(serde_json::json!({"only": {}}));
        orchestrator.execute(&req2).await.unwrap();
        let written: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert!(written.get("only").is_some());
        assert!(written.get("search").is_none());
    }

    // ── placeholder resolution ──────────────────────────

    #[test]
    fn test_config_placeholder_resolution() {
        std::env::set_var("COURIER_PH_SET", "resolved");
        std::env::remove_var("COURIER_PH_UNSET");

        assert_eq!(
            resolve_config_placeholders("token=${COURIER_PH_SET}"),
            "token=resolved"
        );
        // Unresolved → empty string, never the literal placeholder
        assert_eq!(
            resolve_config_placeholders("token=${COURIER_PH_UNSET}!"),
            "token=!"
        );
    }

    #[test]
    fn test_prompt_placeholder_resolution() {
        std::env::set_var("COURIER_PH_SET", "resolved");
        std::env::remove_var("COURIER_PH_UNSET");

        assert_eq!(
            resolve_prompt_placeholders("Hello {{COURIER_PH_SET}}"),
            "Hello resolved"
        );
        // Unresolved → left literally in place, never empty
        assert_eq!(
            resolve_prompt_placeholders("Hello {{COURIER_PH_UNSET}}"),
            "Hello {{COURIER_PH_UNSET}}"
        );
    }

    #[test]
    fn test_placeholder_asymmetry_is_preserved() {
        std::env::remove_var("COURIER_PH_GONE");
        let config = resolve_config_placeholders("${COURIER_PH_GONE}");
        let prompt = resolve_prompt_placeholders("{{COURIER_PH_GONE}}");
        assert_eq!(config, "");
        assert_eq!(prompt, "{{COURIER_PH_GONE}}");
    }

    // ── service merge ───────────────────────────────────

    #[test]
    fn test_merge_services_request_wins() {
        let agent = serde_json::json!({"a": 1, "b": 2});
        let request = serde_json::json!({"b": 3, "c": 4});
        let merged = merge_services(Some(&agent), Some(&request)).unwrap();
        assert_eq!(merged["a"], 1);
        assert_eq!(merged["b"], 3);
        assert_eq!(merged["c"], 4);
    }

    #[test]
    fn test_merge_services_none() {
        assert!(merge_services(None, None).is_none());
    }
}
