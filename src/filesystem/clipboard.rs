//! Clipboard capability and the exposure policy wrapped around it.
//!
//! At most one auto-clear is pending at any time. Every write bumps a
//! generation counter; the scheduler only clears when the generation it
//! was armed for is still the latest, so a superseded timer can never wipe
//! a newer value.

use anyhow::{anyhow, Result};
use copypasta::{ClipboardContext, ClipboardProvider};
use secrecy::{ExposeSecret, SecretString};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

pub const DEFAULT_CLIPBOARD_TTL: Duration = Duration::from_secs(30);

pub trait ClipboardEngine: Send + Sync + 'static {
    fn write(&self, text: &str) -> Result<()>;
    fn clear(&self) -> Result<()>;
}

pub struct SystemClipboardEngine {
    ctx: Mutex<ClipboardContext>,
}

impl SystemClipboardEngine {
    pub fn new() -> Result<Self> {
        let ctx =
            ClipboardContext::new().map_err(|e| anyhow!("Failed to access clipboard: {e}"))?;
        Ok(Self {
            ctx: Mutex::new(ctx),
        })
    }
}

impl ClipboardEngine for SystemClipboardEngine {
    fn write(&self, text: &str) -> Result<()> {
        let mut ctx = self.ctx.lock().unwrap_or_else(PoisonError::into_inner);
        ctx.set_contents(text.to_string())
            .map_err(|e| anyhow!("Failed to copy to clipboard: {e}"))
    }

    fn clear(&self) -> Result<()> {
        let mut ctx = self.ctx.lock().unwrap_or_else(PoisonError::into_inner);
        ctx.set_contents(String::new())
            .map_err(|e| anyhow!("Failed to clear clipboard: {e}"))
    }
}

/// Stand-in when no system clipboard can be opened. Writes fail; clears succeed.
pub struct NoClipboard {
    reason: String,
}

impl NoClipboard {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl ClipboardEngine for NoClipboard {
    fn write(&self, _text: &str) -> Result<()> {
        Err(anyhow!("{}", self.reason))
    }

    fn clear(&self) -> Result<()> {
        Ok(())
    }
}

/// Best-effort warning when the clipboard is likely unavailable (SSH/headless).
pub fn environment_warning() -> Option<String> {
    let is_ssh = std::env::var("SSH_CONNECTION").is_ok() || std::env::var("SSH_TTY").is_ok();
    #[cfg(all(target_family = "unix", not(target_os = "macos")))]
    let headless = std::env::var("DISPLAY").is_err() && std::env::var("WAYLAND_DISPLAY").is_err();
    #[cfg(any(not(target_family = "unix"), target_os = "macos"))]
    let headless = false;
    if is_ssh {
        return Some("Detected SSH session; clipboard may be unavailable.".to_string());
    }
    if headless {
        return Some("No DISPLAY/WAYLAND detected; clipboard may be unavailable.".to_string());
    }
    None
}

#[derive(Debug, Default)]
struct ExposureState {
    generation: u64,
    /// The value written by `generation` is still on the clipboard.
    live: bool,
    /// Generation of the secret still waiting to be cleared.
    pending_secret: Option<u64>,
}

enum Schedule {
    Arm { generation: u64, at: Instant },
    Disarm,
}

struct Shared {
    engine: Arc<dyn ClipboardEngine>,
    state: Mutex<ExposureState>,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, ExposureState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Clear only if `generation` is still what the clipboard holds.
    fn clear_if_current(&self, generation: u64) -> Result<bool> {
        let mut state = self.state();
        if state.generation != generation || state.pending_secret != Some(generation) {
            return Ok(false);
        }
        self.engine.clear()?;
        state.pending_secret = None;
        state.live = false;
        tracing::debug!(generation, "clipboard cleared");
        Ok(true)
    }
}

/// Handle to one exposure. Lets the caller check whether its value is
/// still on the clipboard or clear it early.
#[derive(Clone)]
pub struct ExposureHandle {
    generation: u64,
    shared: Arc<Shared>,
}

impl ExposureHandle {
    /// True while no newer write has replaced this one and it has not been cleared.
    pub fn is_current(&self) -> bool {
        let state = self.shared.state();
        state.generation == self.generation && state.live
    }

    pub fn is_pending_clear(&self) -> bool {
        self.shared.state().pending_secret == Some(self.generation)
    }

    pub fn clear_now(&self) -> Result<bool> {
        self.shared.clear_if_current(self.generation)
    }
}

/// Owns the clipboard on behalf of the vault. Must be created inside a tokio runtime.
pub struct ClipboardPolicy {
    shared: Arc<Shared>,
    default_ttl: Duration,
    scheduler: mpsc::UnboundedSender<Schedule>,
}

impl ClipboardPolicy {
    pub fn new(engine: Arc<dyn ClipboardEngine>, default_ttl: Duration) -> Self {
        let shared = Arc::new(Shared {
            engine,
            state: Mutex::new(ExposureState::default()),
        });
        let (scheduler, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_scheduler(shared.clone(), rx));
        Self {
            shared,
            default_ttl,
            scheduler,
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Write a secret and schedule its removal after `ttl` (default when `None`).
    /// Replaces any pending clear.
    pub fn expose_secret(
        &self,
        value: &SecretString,
        ttl: Option<Duration>,
    ) -> Result<ExposureHandle> {
        let ttl = ttl.unwrap_or(self.default_ttl);
        let generation = {
            let mut state = self.shared.state();
            self.shared.engine.write(value.expose_secret())?;
            state.generation += 1;
            state.live = true;
            state.pending_secret = Some(state.generation);
            state.generation
        };
        let _ = self.scheduler.send(Schedule::Arm {
            generation,
            at: Instant::now() + ttl,
        });
        tracing::debug!(generation, ?ttl, "secret exposed on clipboard");
        Ok(self.handle(generation))
    }

    /// Write a value that needs no auto-clear. Still cancels a pending clear,
    /// since the secret it guarded is gone from the clipboard.
    pub fn expose_non_secret(&self, value: &str) -> Result<ExposureHandle> {
        let generation = {
            let mut state = self.shared.state();
            self.shared.engine.write(value)?;
            state.generation += 1;
            state.live = true;
            state.pending_secret = None;
            state.generation
        };
        let _ = self.scheduler.send(Schedule::Disarm);
        Ok(self.handle(generation))
    }

    fn handle(&self, generation: u64) -> ExposureHandle {
        ExposureHandle {
            generation,
            shared: self.shared.clone(),
        }
    }

    pub fn has_pending_clear(&self) -> bool {
        self.shared.state().pending_secret.is_some()
    }

    /// Clear a pending secret now and stop the timer.
    pub fn shutdown(&self) -> Result<()> {
        let _ = self.scheduler.send(Schedule::Disarm);
        let pending = self.shared.state().pending_secret;
        if let Some(generation) = pending {
            self.shared.clear_if_current(generation)?;
        }
        Ok(())
    }
}

impl Drop for ClipboardPolicy {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::warn!(error = %e, "could not clear clipboard on teardown");
        }
    }
}

async fn run_scheduler(shared: Arc<Shared>, mut rx: mpsc::UnboundedReceiver<Schedule>) {
    let mut armed: Option<(u64, Instant)> = None;
    loop {
        let deadline = armed.map(|(_, at)| at);
        let expiry = async move {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            msg = rx.recv() => match msg {
                Some(Schedule::Arm { generation, at }) => armed = Some((generation, at)),
                Some(Schedule::Disarm) => armed = None,
                None => break,
            },
            _ = expiry => {
                if let Some((generation, _)) = armed.take() {
                    if let Err(e) = shared.clear_if_current(generation) {
                        tracing::warn!(error = %e, "clipboard auto-clear failed");
                    }
                }
            }
        }
    }
}
