use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::AbortHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use blockrelay_core::cancel::CancellationFlags;
use blockrelay_core::ids::SessionId;

#[derive(Clone, Debug)]
pub struct MonitorConfig {
    pub poll_interval: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
        }
    }
}

struct MonitorState {
    generation: u64,
    token: CancellationToken,
    cause: Option<String>,
    poller: Option<AbortHandle>,
}

/// Polls the shared cancellation flag of one session and trips a local
/// token when it is raised.
///
/// The flag is only consulted while a poller is running, so a flag raised
/// after the owning round stopped monitoring has no effect on that round.
pub struct CancellationMonitor {
    flags: Arc<dyn CancellationFlags>,
    session_id: SessionId,
    config: MonitorConfig,
    state: Arc<Mutex<MonitorState>>,
}

impl CancellationMonitor {
    pub fn new(flags: Arc<dyn CancellationFlags>, session_id: SessionId, config: MonitorConfig) -> Self {
        Self {
            flags,
            session_id,
            config,
            state: Arc::new(Mutex::new(MonitorState {
                generation: 0,
                token: CancellationToken::new(),
                cause: None,
                poller: None,
            })),
        }
    }

    /// Start (or restart) polling. The local signal is reset and any previous
    /// poller is replaced, so at most one poller runs per monitor.
    ///
    /// The returned guard stops monitoring when dropped.
    pub fn start_monitoring(&self) -> MonitorGuard {
        let mut state = self.state.lock();
        if let Some(previous) = state.poller.take() {
            previous.abort();
        }
        state.generation += 1;
        state.token = CancellationToken::new();
        state.cause = None;

        let generation = state.generation;
        let handle = tokio::spawn(poll_flag(
            Arc::clone(&self.flags),
            self.session_id.clone(),
            self.config.poll_interval,
            Arc::clone(&self.state),
            generation,
        ));
        state.poller = Some(handle.abort_handle());
        debug!(session_id = %self.session_id, generation, "cancellation monitoring started");

        MonitorGuard {
            state: Arc::clone(&self.state),
            generation,
            token: state.token.clone(),
        }
    }

    /// Stop the current poller, if any.
    pub fn stop_monitoring(&self) {
        stop(&self.state, None);
    }

    /// Token tripped by the current monitoring generation.
    pub fn token(&self) -> CancellationToken {
        self.state.lock().token.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.lock().token.is_cancelled()
    }

    /// Cause recorded with the flag that tripped the current token.
    pub fn cause(&self) -> Option<String> {
        self.state.lock().cause.clone()
    }

    pub fn is_monitoring(&self) -> bool {
        self.state.lock().poller.is_some()
    }
}

impl Drop for CancellationMonitor {
    fn drop(&mut self) {
        stop(&self.state, None);
    }
}

/// Scope of one monitoring generation.
pub struct MonitorGuard {
    state: Arc<Mutex<MonitorState>>,
    generation: u64,
    token: CancellationToken,
}

impl MonitorGuard {
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn cause(&self) -> Option<String> {
        let state = self.state.lock();
        if state.generation == self.generation {
            state.cause.clone()
        } else {
            None
        }
    }
}

impl Drop for MonitorGuard {
    fn drop(&mut self) {
        stop(&self.state, Some(self.generation));
    }
}

fn stop(state: &Mutex<MonitorState>, generation: Option<u64>) {
    let mut state = state.lock();
    if generation.is_some_and(|g| g != state.generation) {
        return;
    }
    if let Some(poller) = state.poller.take() {
        poller.abort();
    }
}

async fn poll_flag(
    flags: Arc<dyn CancellationFlags>,
    session_id: SessionId,
    interval: Duration,
    state: Arc<Mutex<MonitorState>>,
    generation: u64,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let flag = match flags.check(&session_id).await {
            Ok(Some(flag)) => flag,
            Ok(None) => continue,
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "cancellation flag check failed");
                continue;
            }
        };

        {
            let mut state = state.lock();
            if state.generation != generation {
                return;
            }
            state.cause = flag.cause.clone();
            state.token.cancel();
            state.poller = None;
        }
        info!(session_id = %session_id, cause = ?flag.cause, "cancellation requested");

        if let Err(e) = flags.clear(&session_id).await {
            warn!(session_id = %session_id, error = %e, "failed to clear cancellation flag");
        }
        return;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryCancellationFlags;

    fn monitor(flags: &Arc<MemoryCancellationFlags>) -> CancellationMonitor {
        CancellationMonitor::new(
            flags.clone(),
            SessionId::from_raw("s"),
            MonitorConfig {
                poll_interval: Duration::from_millis(50),
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn detects_flag_within_one_interval() {
        let flags = Arc::new(MemoryCancellationFlags::new());
        let monitor = monitor(&flags);
        let guard = monitor.start_monitoring();
        let token = guard.token();

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!token.is_cancelled());

        flags.set(&SessionId::from_raw("s"), Some("user".into())).await.unwrap();
        tokio::time::timeout(Duration::from_millis(60), token.cancelled())
            .await
            .expect("cancelled within one poll interval");

        assert_eq!(guard.cause().as_deref(), Some("user"));
        assert!(monitor.is_cancelled());
        // Detection cleans up the shared flag.
        tokio::task::yield_now().await;
        assert!(flags.check(&SessionId::from_raw("s")).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn flag_after_stop_has_no_effect() {
        let flags = Arc::new(MemoryCancellationFlags::new());
        let monitor = monitor(&flags);
        let token = {
            let guard = monitor.start_monitoring();
            guard.token()
        };
        assert!(!monitor.is_monitoring());

        flags.set(&SessionId::from_raw("s"), None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!token.is_cancelled());
        assert!(flags.check(&SessionId::from_raw("s")).await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn restart_resets_local_signal() {
        let flags = Arc::new(MemoryCancellationFlags::new());
        let monitor = monitor(&flags);
        let first = monitor.start_monitoring();
        flags.set(&SessionId::from_raw("s"), None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(first.token().is_cancelled());
        drop(first);

        let second = monitor.start_monitoring();
        assert!(!second.token().is_cancelled());
        assert!(!monitor.is_cancelled());
        assert!(monitor.cause().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_guard_does_not_stop_newer_generation() {
        let flags = Arc::new(MemoryCancellationFlags::new());
        let monitor = monitor(&flags);
        let stale = monitor.start_monitoring();
        let current = monitor.start_monitoring();
        drop(stale);
        assert!(monitor.is_monitoring());

        monitor.stop_monitoring();
        assert!(!monitor.is_monitoring());
        drop(current);
    }
}
