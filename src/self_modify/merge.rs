//! # Stage: Merge / Integrator
//!
//! ## Responsibility
//! Applies an accepted change: persists the generated artifact through an
//! [`ArtifactStore`], then applies the integration patch through an
//! [`EntryPointRegistry`], and reports a [`MergeResult`] with the time taken
//! since the request arrived.
//!
//! ## Guarantees
//! - Ordered: persist, then register, then timing
//! - Staged: [`FsArtifactStore`] writes a staging file and renames it into
//!   place, so a half-written artifact is never visible under its final name
//! - Compensated: if registration fails the target file goes back to what it
//!   held before the merge (or away, if it did not exist); a failed restore is
//!   logged as an inconsistency to reconcile on restart
//! - Bounded without tearing: each step runs on its own task, so a deadline
//!   stops the wait, never the step. A step that finishes after the deadline
//!   is undone in the background.
//! - Errors name the failing [`IntegrationStep`]
//!
//! ## NOT Responsible For
//! - Version control or deployment of the host system
//! - Serialising concurrent merges to the same file

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::task::JoinError;

use crate::error::{KernelError, Result};
use crate::util::now_ms;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrationStep {
    Persist,
    Register,
}

impl std::fmt::Display for IntegrationStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IntegrationStep::Persist => write!(f, "artifact persistence"),
            IntegrationStep::Register => write!(f, "entry-point registration"),
        }
    }
}

/// Outcome of a successful merge. Created once, then attached to the task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeResult {
    pub success: bool,
    pub original_request: String,
    pub generated_code: String,
    pub time_to_implementation: Duration,
}

// ---------------------------------------------------------------------------
// Collaborator traits
// ---------------------------------------------------------------------------

/// Persists generated artifacts by name.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Current content, `None` if nothing is stored under `name`.
    async fn read(&self, name: &str) -> Result<Option<String>>;

    async fn write(&self, name: &str, content: &str) -> Result<()>;

    /// Delete `name`. Deleting something absent is not an error.
    async fn remove(&self, name: &str) -> Result<()>;
}

/// Applies integration patches to the host's entry points.
#[async_trait]
pub trait EntryPointRegistry: Send + Sync {
    async fn integrate(&self, content: &str) -> Result<()>;

    /// Withdraw one earlier integration of `content`. Used for compensation only.
    async fn revoke(&self, content: &str) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Filesystem implementations
// ---------------------------------------------------------------------------

/// Artifacts as files under `root`, committed via staging file + rename.
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Only plain file names: no separators, no parent references.
    fn checked_name(name: &str) -> Result<&str> {
        let bad = name.is_empty()
            || name == "."
            || name == ".."
            || name.contains(['/', '\\'])
            || name.starts_with(".staging");
        if bad {
            return Err(KernelError::Integration {
                step: IntegrationStep::Persist,
                reason: format!("invalid artifact name {name:?}"),
            });
        }
        Ok(name)
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn read(&self, name: &str) -> Result<Option<String>> {
        let name = Self::checked_name(name)?;
        match tokio::fs::read_to_string(self.root.join(name)).await {
            Ok(body) => Ok(Some(body)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, name: &str, content: &str) -> Result<()> {
        let name = Self::checked_name(name)?;
        let staging_dir = self.root.join(".staging");
        tokio::fs::create_dir_all(&staging_dir).await?;
        let staged = staging_dir.join(format!("{name}.{}.tmp", uuid::Uuid::new_v4()));
        let committed = match tokio::fs::write(&staged, content).await {
            Ok(()) => tokio::fs::rename(&staged, self.root.join(name)).await,
            Err(e) => Err(e),
        };
        if let Err(e) = committed {
            let _ = tokio::fs::remove_file(&staged).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<()> {
        let name = Self::checked_name(name)?;
        match tokio::fs::remove_file(self.root.join(name)).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}

/// Records integrations as JSON lines appended to a manifest file.
///
/// Each line is `{"action": "integrate" | "revoke", "at_ms": .., "content": ..}`.
/// Lines without an `action` are integrations.
pub struct ManifestEntryPoints {
    path: PathBuf,
}

impl ManifestEntryPoints {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn append(&self, action: &str, content: &str) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut line = serde_json::to_string(&serde_json::json!({
            "action": action,
            "at_ms": now_ms(),
            "content": content,
        }))?;
        line.push('\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    /// Replay the manifest: integrations still in effect, oldest first.
    pub async fn active(&self) -> Result<Vec<String>> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut active: Vec<String> = Vec::new();
        for line in raw.lines().filter(|l| !l.trim().is_empty()) {
            let entry: serde_json::Value = serde_json::from_str(line)?;
            let content = entry["content"].as_str().unwrap_or_default().to_string();
            if entry["action"].as_str() == Some("revoke") {
                if let Some(i) = active.iter().rposition(|c| *c == content) {
                    active.remove(i);
                }
            } else {
                active.push(content);
            }
        }
        Ok(active)
    }
}

#[async_trait]
impl EntryPointRegistry for ManifestEntryPoints {
    async fn integrate(&self, content: &str) -> Result<()> {
        self.append("integrate", content).await
    }

    async fn revoke(&self, content: &str) -> Result<()> {
        self.append("revoke", content).await
    }
}

// ---------------------------------------------------------------------------
// In-memory implementations
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct InMemoryArtifactStore {
    files: Mutex<HashMap<String, String>>,
}

impl InMemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<String> {
        self.files.lock().unwrap_or_else(PoisonError::into_inner).get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.files.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ArtifactStore for InMemoryArtifactStore {
    async fn read(&self, name: &str) -> Result<Option<String>> {
        Ok(self.get(name))
    }

    async fn write(&self, name: &str, content: &str) -> Result<()> {
        self.files
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), content.to_string());
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<()> {
        self.files.lock().unwrap_or_else(PoisonError::into_inner).remove(name);
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryEntryPoints {
    applied: Mutex<Vec<String>>,
}

impl InMemoryEntryPoints {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn integrations(&self) -> Vec<String> {
        self.applied.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[async_trait]
impl EntryPointRegistry for InMemoryEntryPoints {
    async fn integrate(&self, content: &str) -> Result<()> {
        self.applied.lock().unwrap_or_else(PoisonError::into_inner).push(content.to_string());
        Ok(())
    }

    async fn revoke(&self, content: &str) -> Result<()> {
        let mut applied = self.applied.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(i) = applied.iter().rposition(|c| c == content) {
            applied.remove(i);
        }
        Ok(())
    }
}

/// In-memory registry that takes `delay` to apply each integration.
pub struct DelayedEntryPoints {
    delay: Duration,
    inner: InMemoryEntryPoints,
}

impl DelayedEntryPoints {
    pub fn new(delay: Duration) -> Self {
        Self { delay, inner: InMemoryEntryPoints::new() }
    }

    pub fn integrations(&self) -> Vec<String> {
        self.inner.integrations()
    }
}

#[async_trait]
impl EntryPointRegistry for DelayedEntryPoints {
    async fn integrate(&self, content: &str) -> Result<()> {
        tokio::time::sleep(self.delay).await;
        self.inner.integrate(content).await
    }

    async fn revoke(&self, content: &str) -> Result<()> {
        self.inner.revoke(content).await
    }
}

/// Store whose writes always fail.
pub struct FailingArtifactStore(pub String);

#[async_trait]
impl ArtifactStore for FailingArtifactStore {
    async fn read(&self, _name: &str) -> Result<Option<String>> {
        Ok(None)
    }

    async fn write(&self, _name: &str, _content: &str) -> Result<()> {
        Err(KernelError::Io(std::io::Error::new(std::io::ErrorKind::Other, self.0.clone())))
    }

    async fn remove(&self, _name: &str) -> Result<()> {
        Ok(())
    }
}

/// Registry whose integrations always fail.
pub struct FailingEntryPoints(pub String);

#[async_trait]
impl EntryPointRegistry for FailingEntryPoints {
    async fn integrate(&self, _content: &str) -> Result<()> {
        Err(KernelError::Io(std::io::Error::new(std::io::ErrorKind::Other, self.0.clone())))
    }

    async fn revoke(&self, _content: &str) -> Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Integrator
// ---------------------------------------------------------------------------

fn at_step(step: IntegrationStep, e: KernelError) -> KernelError {
    match e {
        KernelError::Integration { .. } => e,
        other => KernelError::Integration { step, reason: other.to_string() },
    }
}

fn joined(step: IntegrationStep, r: std::result::Result<Result<()>, JoinError>) -> Result<()> {
    match r {
        Ok(inner) => inner.map_err(|e| at_step(step, e)),
        Err(e) => Err(KernelError::Integration { step, reason: format!("step task failed: {e}") }),
    }
}

/// Put `name` back to `prior`: rewrite it, or remove it if it did not exist.
async fn restore(store: &dyn ArtifactStore, name: &str, prior: Option<String>) {
    let undo = match prior.as_deref() {
        Some(body) => store.write(name, body).await,
        None => store.remove(name).await,
    };
    match undo {
        Ok(()) => tracing::warn!(
            target: "kernel::merge",
            file = name,
            restored_prior = prior.is_some(),
            "merge rolled back"
        ),
        Err(e) => tracing::error!(
            target: "kernel::merge",
            file = name,
            error = %e,
            "merge rollback failed; reconcile on restart"
        ),
    }
}

pub struct Integrator {
    artifacts: Arc<dyn ArtifactStore>,
    entry_points: Arc<dyn EntryPointRegistry>,
}

impl Integrator {
    pub fn new(artifacts: Arc<dyn ArtifactStore>, entry_points: Arc<dyn EntryPointRegistry>) -> Self {
        Self { artifacts, entry_points }
    }

    /// Persist then register, within `budget`.
    ///
    /// On timeout the caller gets `KernelError::Timeout { stage: "merge" }`
    /// and the target is left as it was before the call once any step still
    /// in flight has finished.
    pub async fn merge(
        &self,
        target_name: &str,
        artifact: &str,
        integration: &str,
        original_request: &str,
        start: Instant,
        budget: Duration,
    ) -> Result<MergeResult> {
        let deadline = tokio::time::Instant::now() + budget;
        let timed_out = || KernelError::Timeout { stage: "merge", after: budget };

        let prior = tokio::time::timeout_at(deadline, self.artifacts.read(target_name))
            .await
            .map_err(|_| timed_out())?
            .map_err(|e| at_step(IntegrationStep::Persist, e))?;

        let mut write = {
            let store = Arc::clone(&self.artifacts);
            let (name, body) = (target_name.to_string(), artifact.to_string());
            tokio::spawn(async move { store.write(&name, &body).await })
        };
        match tokio::time::timeout_at(deadline, &mut write).await {
            Ok(r) => joined(IntegrationStep::Persist, r)?,
            Err(_) => {
                let store = Arc::clone(&self.artifacts);
                let name = target_name.to_string();
                tokio::spawn(async move {
                    if let Ok(Ok(())) = write.await {
                        restore(&*store, &name, prior).await;
                    }
                });
                return Err(timed_out());
            }
        }

        let mut register = {
            let entry_points = Arc::clone(&self.entry_points);
            let patch = integration.to_string();
            tokio::spawn(async move { entry_points.integrate(&patch).await })
        };
        match tokio::time::timeout_at(deadline, &mut register).await {
            Ok(r) => {
                if let Err(e) = joined(IntegrationStep::Register, r) {
                    restore(&*self.artifacts, target_name, prior).await;
                    return Err(e);
                }
            }
            Err(_) => {
                restore(&*self.artifacts, target_name, prior).await;
                let entry_points = Arc::clone(&self.entry_points);
                let patch = integration.to_string();
                tokio::spawn(async move {
                    if let Ok(Ok(())) = register.await {
                        match entry_points.revoke(&patch).await {
                            Ok(()) => tracing::warn!(target: "kernel::merge", "late registration revoked"),
                            Err(e) => tracing::error!(
                                target: "kernel::merge",
                                error = %e,
                                "late registration could not be revoked; reconcile on restart"
                            ),
                        }
                    }
                });
                return Err(timed_out());
            }
        }

        let time_to_implementation = start.elapsed().max(Duration::from_nanos(1));
        tracing::info!(
            target: "kernel::merge",
            file = target_name,
            elapsed_ms = time_to_implementation.as_millis() as u64,
            "change integrated"
        );
        Ok(MergeResult {
            success: true,
            original_request: original_request.to_string(),
            generated_code: artifact.to_string(),
            time_to_implementation,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
