//! Session store — durable mapping from a conversation thread to a
//! reusable sandbox identity.
//!
//! Layout:
//!   {base_path}/{agent_id}/{session_id}/workspace/      — task working tree
//!   {base_path}/{agent_id}/{session_id}/sandbox-home/   — sandbox home/config
//!   {base_path}/session-index.json                      — durable index
//!
//! The index is a single JSON document read-modify-written on every
//! mutation. All writers serialize through one async mutex and every write
//! lands via temp-file + rename, so a session is never indexed with a
//! partially-created directory pair and readers never observe torn writes.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::SessionsConfig;

/// Which external messages belong to a session.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Thread {
    pub original_message_id: String,
    /// Ordered, deduplicated
    pub message_ids: Vec<String>,
    pub original_subject: String,
}

/// One ongoing conversation bound to one agent identity.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Session {
    pub id: String,
    pub agent_id: String,
    pub thread: Thread,
    /// Originating principal, kept for audit and reply routing
    pub sender: String,
    pub created_at: String,
    pub last_activity_at: String,
    /// Sandbox conversation id, set after the first successful execution
    /// that produces one. Enables resume.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sandbox_session_id: Option<String>,
}

impl Session {
    /// The bracketed short code senders can put in a subject or body to
    /// address this session explicitly, e.g. `[a1b2c3d4]`.
    pub fn tag(&self) -> String {
        format!("[{}]", self.id)
    }
}

/// Resolved directory pair for a session.
#[derive(Debug, Clone)]
pub struct SessionPaths {
    pub root: PathBuf,
    pub workspace: PathBuf,
    pub sandbox_home: PathBuf,
}

#[derive(Debug, Serialize, Deserialize)]
struct SessionIndex {
    version: u32,
    sessions: BTreeMap<String, Session>,
}

impl Default for SessionIndex {
    fn default() -> Self {
        Self {
            version: 1,
            sessions: BTreeMap::new(),
        }
    }
}

/// Filesystem-backed session store.
pub struct SessionStore {
    base_path: PathBuf,
    credential_file: Option<PathBuf>,
    state_dir: String,
    tag_re: Regex,
    /// Serializes every read-modify-write of the index file
    write_lock: Mutex<()>,
}

impl SessionStore {
    pub fn open(config: &SessionsConfig) -> Result<Self> {
        fs::create_dir_all(&config.base_path).with_context(|| {
            format!(
                "cannot create session base directory {}",
                config.base_path.display()
            )
        })?;
        info!("Session store opened at {}", config.base_path.display());

        // Session ids are 8 lowercase hex chars; the tag is the id in brackets
        let tag_re = Regex::new(r"\[([0-9a-f]{8})\]")
            .context("invalid session tag pattern")?;

        Ok(Self {
            base_path: config.base_path.clone(),
            credential_file: config.credential_file.clone(),
            state_dir: config.state_dir.clone(),
            tag_re,
            write_lock: Mutex::new(()),
        })
    }

    fn index_path(&self) -> PathBuf {
        self.base_path.join("session-index.json")
    }

    /// Reads the durable index. A missing file is an empty index; a
    /// corrupt one is a hard error — sessions are never silently
    /// fabricated over a broken index.
    fn load_index(&self) -> Result<SessionIndex> {
        let path = self.index_path();
        if !path.exists() {
            return Ok(SessionIndex::default());
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("cannot read session index {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("corrupt session index {}", path.display()))
    }

    /// Persists the index atomically (temp file + rename).
    fn persist_index(&self, index: &SessionIndex) -> Result<()> {
        let path = self.index_path();
        let tmp = self.base_path.join("session-index.json.tmp");
        let json = serde_json::to_string_pretty(index)?;
        fs::write(&tmp, json)
            .with_context(|| format!("cannot write session index {}", tmp.display()))?;
        fs::rename(&tmp, &path)
            .with_context(|| format!("cannot replace session index {}", path.display()))?;
        Ok(())
    }

    // ── Lookup ────────────────────────────────────────────

    /// Resolves a session from an inbound message: by prior message id
    /// first (thread continuation), then by an explicit bracketed session
    /// tag anywhere in the given free text. Returns `None` if neither
    /// resolves — the caller decides whether to create a fresh session.
    pub async fn resolve(
        &self,
        in_reply_to: Option<&str>,
        text: Option<&str>,
    ) -> Result<Option<Session>> {
        let index = self.load_index()?;

        if let Some(reply_id) = in_reply_to {
            let hit = index.sessions.values().find(|s| {
                s.thread.original_message_id == reply_id
                    || s.thread.message_ids.iter().any(|m| m == reply_id)
            });
            if let Some(session) = hit {
                debug!("Resolved session {} via message id", session.id);
                return Ok(Some(session.clone()));
            }
        }

        if let Some(text) = text {
            if let Some(caps) = self.tag_re.captures(text) {
                let id = &caps[1];
                if let Some(session) = index.sessions.get(id) {
                    debug!("Resolved session {} via explicit tag", session.id);
                    return Ok(Some(session.clone()));
                }
            }
        }

        Ok(None)
    }

    /// Looks a session up by id.
    pub async fn get(&self, session_id: &str) -> Result<Option<Session>> {
        Ok(self.load_index()?.sessions.get(session_id).cloned())
    }

    // ── Creation ──────────────────────────────────────────

    /// Creates a new session: allocates a short unique id, creates the
    /// workspace/sandbox-home directory pair, provisions the baseline
    /// credential, and registers the session in the index in a single
    /// persisted write. The directories exist before the index entry does.
    pub async fn create(
        &self,
        agent_id: &str,
        first_message_id: &str,
        subject: &str,
        sender: &str,
    ) -> Result<Session> {
        let _guard = self.write_lock.lock().await;
        let mut index = self.load_index()?;

        // 32 random bits as 8 hex chars; collisions are negligible but
        // cheap to rule out entirely against the loaded index.
        let mut id = new_session_id();
        while index.sessions.contains_key(&id) {
            id = new_session_id();
        }

        let paths = self.paths(agent_id, &id);
        fs::create_dir_all(&paths.workspace).with_context(|| {
            format!("cannot create workspace {}", paths.workspace.display())
        })?;
        fs::create_dir_all(&paths.sandbox_home).with_context(|| {
            format!("cannot create sandbox home {}", paths.sandbox_home.display())
        })?;

        self.provision_credential(&paths.sandbox_home);

        let now = chrono::Utc::now().to_rfc3339();
        let session = Session {
            id: id.clone(),
            agent_id: agent_id.to_string(),
            thread: Thread {
                original_message_id: first_message_id.to_string(),
                message_ids: vec![first_message_id.to_string()],
                original_subject: subject.to_string(),
            },
            sender: sender.to_string(),
            created_at: now.clone(),
            last_activity_at: now,
            sandbox_session_id: None,
        };

        index.sessions.insert(id.clone(), session.clone());
        self.persist_index(&index)?;

        info!(
            "Created session {id} for agent {agent_id} (sender: {sender})"
        );
        Ok(session)
    }

    /// Copies the baseline credential into a session's private area.
    /// A missing source is logged, not fatal — the fallback API key can
    /// still carry an execution.
    fn provision_credential(&self, sandbox_home: &Path) {
        let Some(source) = &self.credential_file else {
            return;
        };
        if !source.is_file() {
            warn!(
                "Baseline credential {} not found, session starts without it",
                source.display()
            );
            return;
        }
        let file_name = source
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| ".credentials.json".into());
        let dest = sandbox_home.join(file_name);
        if let Err(e) = fs::copy(source, &dest) {
            warn!(
                "Cannot copy baseline credential to {}: {e}",
                dest.display()
            );
        }
    }

    // ── Mutation ──────────────────────────────────────────

    /// Appends a message id to a session's thread (no-op if already
    /// present) and bumps `last_activity_at`.
    pub async fn add_message(&self, session_id: &str, message_id: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut index = self.load_index()?;
        let session = index
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| anyhow!("unknown session: {session_id}"))?;

        if !session.thread.message_ids.iter().any(|m| m == message_id) {
            session.thread.message_ids.push(message_id.to_string());
        }
        session.last_activity_at = chrono::Utc::now().to_rfc3339();

        self.persist_index(&index)
    }

    /// Records the sandbox conversation id produced by a successful
    /// execution, enabling later resumes.
    pub async fn set_sandbox_session(
        &self,
        session_id: &str,
        sandbox_session_id: &str,
    ) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut index = self.load_index()?;
        let session = index
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| anyhow!("unknown session: {session_id}"))?;

        session.sandbox_session_id = Some(sandbox_session_id.to_string());
        self.persist_index(&index)
    }

    // ── Ephemeral staging ─────────────────────────────────

    /// Stages a credential-only sandbox-home for a sessionless execution
    /// (the stateless legacy mount). Lives under `{base}/ephemeral/` and
    /// is expected to be discarded by the caller after the run.
    pub fn stage_ephemeral(&self, execution_id: &str) -> Result<PathBuf> {
        let root = self.base_path.join("ephemeral").join(execution_id);
        let sandbox_home = root.join("sandbox-home");
        fs::create_dir_all(&sandbox_home).with_context(|| {
            format!("cannot create ephemeral area {}", sandbox_home.display())
        })?;
        self.provision_credential(&sandbox_home);
        Ok(sandbox_home)
    }

    /// Discards an ephemeral staging area. Best-effort.
    pub fn discard_ephemeral(&self, execution_id: &str) {
        let root = self.base_path.join("ephemeral").join(execution_id);
        if let Err(e) = fs::remove_dir_all(&root) {
            if root.exists() {
                warn!("Cannot discard ephemeral area {}: {e}", root.display());
            }
        }
    }

    // ── Paths and state ───────────────────────────────────

    /// Directory pair for a session. Pure path math, no I/O.
    pub fn paths(&self, agent_id: &str, session_id: &str) -> SessionPaths {
        let root = self.base_path.join(agent_id).join(session_id);
        SessionPaths {
            workspace: root.join("workspace"),
            sandbox_home: root.join("sandbox-home"),
            root,
        }
    }

    /// Like [`paths`], but fails when the directory pair does not exist —
    /// an indexed session pointing at missing directories is a session
    /// fault, surfaced explicitly rather than papered over.
    pub fn existing_paths(&self, agent_id: &str, session_id: &str) -> Result<SessionPaths> {
        let paths = self.paths(agent_id, session_id);
        if !paths.workspace.is_dir() || !paths.sandbox_home.is_dir() {
            bail!(
                "session {session_id} is indexed but its directories are missing under {}",
                paths.root.display()
            );
        }
        Ok(paths)
    }

    /// True iff the sandbox's persisted conversation state directory is
    /// non-empty — the signal that an execution may resume prior context
    /// instead of starting fresh.
    pub fn has_established_state(&self, agent_id: &str, session_id: &str) -> bool {
        let state = self
            .paths(agent_id, session_id)
            .sandbox_home
            .join(&self.state_dir);
        match fs::read_dir(&state) {
            Ok(mut entries) => entries.next().is_some(),
            Err(_) => false,
        }
    }
}

fn new_session_id() -> String {
    let bytes: [u8; 4] = rand::random();
    hex::encode(bytes)
}
