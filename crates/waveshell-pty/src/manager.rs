use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use portable_pty::{native_pty_system, CommandBuilder, PtyPair, PtySize};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use crate::circular::CircularBuffer;

/// Substrings that flag the last output line as a secret prompt (spec.md §4.8).
const PASSWORD_MARKERS: &[&str] = &["assword", "Enter passphrase for key"];

/// Default secret-cache eviction timeout (spec.md §4.8: "default 5 minutes; value
/// `notimeout` disables eviction").
pub const DEFAULT_SECRET_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// A controlling pty attached to a dialed agent's child process (ssh or local shell), used
/// to relay interactive password/passphrase prompts and to keep a circular console log.
///
/// Grounded on the `portable-pty`-based pty manager pattern in the retrieval pack: a pty
/// pair, a boxed writer, and a dedicated OS thread for the blocking read loop feeding an
/// async channel, since `portable-pty`'s reader is synchronous.
pub struct ControllingPty {
    pair: PtyPair,
    child: Mutex<Box<dyn portable_pty::Child + Send + Sync>>,
    writer: Mutex<Box<dyn Write + Send>>,
    pub log: Arc<CircularBuffer>,
    closed: AtomicBool,
}

impl ControllingPty {
    /// Open an 8x80 controlling pty (spec.md §4.4) and spawn `cmd` under it.
    pub fn spawn(cmd: CommandBuilder, output_tx: mpsc::Sender<Vec<u8>>) -> Result<Arc<Self>> {
        let pty_system = native_pty_system();
        let pair = pty_system.openpty(PtySize {
            rows: 8,
            cols: 80,
            pixel_width: 0,
            pixel_height: 0,
        })?;

        let child = pair.slave.spawn_command(cmd)?;
        let writer = pair.master.take_writer()?;
        let mut reader = pair.master.try_clone_reader()?;
        let log = Arc::new(CircularBuffer::new(64 * 1024));

        let pty = Arc::new(ControllingPty {
            pair,
            child: Mutex::new(child),
            writer: Mutex::new(writer),
            log: log.clone(),
            closed: AtomicBool::new(false),
        });

        // portable-pty's reader is blocking, so it gets its own OS thread; bytes are handed
        // to the tokio world over a channel, same shape as the PtyManager reader thread.
        let rt_handle = tokio::runtime::Handle::current();
        std::thread::spawn(move || {
            let mut buf = [0u8; 4096];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => {
                        debug!(target: "waveshell_pty", "pty reader got EOF");
                        break;
                    }
                    Ok(n) => {
                        let data = buf[..n].to_vec();
                        log.write(&data);
                        if rt_handle.block_on(output_tx.send(data)).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(target: "waveshell_pty", "pty read error: {e}");
                        break;
                    }
                }
            }
        });

        Ok(pty)
    }

    pub async fn write_input(&self, bytes: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(bytes)?;
        writer.flush()?;
        Ok(())
    }

    pub async fn resize(&self, rows: u16, cols: u16) -> Result<()> {
        self.pair.master.resize(PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        })?;
        Ok(())
    }

    pub async fn kill(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.child.lock().await.kill()?;
        Ok(())
    }

    /// The pty-side process id, when the underlying implementation reports one.
    pub async fn pid(&self) -> Option<u32> {
        self.child.lock().await.process_id()
    }

    pub async fn is_alive(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
            && matches!(self.child.lock().await.try_wait(), Ok(None))
    }

    /// Whether the last output line looks like a password/passphrase prompt.
    pub fn last_line_is_prompt(&self) -> bool {
        let line = self.log.last_line();
        PASSWORD_MARKERS.iter().any(|marker| line.contains(marker))
    }
}

/// A cached password/passphrase with an eviction deadline.
struct CachedSecret {
    value: String,
    expires_at: Option<Instant>,
}

/// Caches a secret per remote for reuse across reconnects, with eviction.
///
/// `None` timeout (the `"notimeout"` value in spec.md §4.8) disables eviction entirely.
pub struct SecretCache {
    entries: Mutex<std::collections::HashMap<String, CachedSecret>>,
    default_timeout: Option<Duration>,
}

impl SecretCache {
    pub fn new(default_timeout: Option<Duration>) -> Self {
        SecretCache {
            entries: Mutex::new(std::collections::HashMap::new()),
            default_timeout,
        }
    }

    pub async fn put(&self, key: impl Into<String>, value: impl Into<String>) {
        let expires_at = self.default_timeout.map(|d| Instant::now() + d);
        self.entries
            .lock()
            .await
            .insert(key.into(), CachedSecret { value: value.into(), expires_at });
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        let mut entries = self.entries.lock().await;
        let expired = entries
            .get(key)
            .and_then(|e| e.expires_at)
            .map(|at| Instant::now() >= at)
            .unwrap_or(false);
        if expired {
            entries.remove(key);
            return None;
        }
        entries.get(key).map(|e| e.value.clone())
    }

    pub async fn evict(&self, key: &str) {
        self.entries.lock().await.remove(key);
    }
}

/// Build the [`CommandBuilder`] for dialing `target` over ssh with a controlling pty, or a
/// local shell when `target` is `None`.
pub fn build_ssh_command(target: &str, remote_command: &str) -> CommandBuilder {
    let mut cmd = CommandBuilder::new("ssh");
    cmd.args([
        "-o",
        "BatchMode=no",
        "-o",
        "StrictHostKeyChecking=accept-new",
        "-tt",
        target,
        "--",
        remote_command,
    ]);
    cmd
}

pub fn build_local_shell_command(shell: &str) -> Result<CommandBuilder> {
    if shell.is_empty() {
        return Err(anyhow!("local shell path must not be empty"));
    }
    Ok(CommandBuilder::new(shell))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_markers_match_common_prompts() {
        assert!(PASSWORD_MARKERS.iter().any(|m| "user@host's password:".contains(m)));
        assert!(PASSWORD_MARKERS
            .iter()
            .any(|m| "Enter passphrase for key '/home/user/.ssh/id_ed25519':".contains(m)));
        assert!(!PASSWORD_MARKERS.iter().any(|m| "$ ".contains(m)));
    }

    #[tokio::test]
    async fn secret_cache_respects_eviction() {
        let cache = SecretCache::new(Some(Duration::from_millis(20)));
        cache.put("host1", "hunter2").await;
        assert_eq!(cache.get("host1").await, Some("hunter2".to_string()));
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(cache.get("host1").await, None);
    }

    #[tokio::test]
    async fn notimeout_never_evicts() {
        let cache = SecretCache::new(None);
        cache.put("host1", "hunter2").await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(cache.get("host1").await, Some("hunter2".to_string()));
    }
}
