//! Client session manager.
//!
//! The [`ClientManager`] owns the session table, the connection cap, the
//! resource limits and the daemon shutdown token. [`serve`] accepts
//! connections and spawns one task per session; each task multiplexes its
//! socket with readiness waits, reading only while the deferred output
//! queue is empty (backpressure) and draining it while it is not. Event
//! producers wake blocked idle clients through [`ClientManager::idle_add`],
//! and a periodic sweep enforces expiry and the inactivity timeout.
//!
//! The session table mutex plus the per-session state mutexes take the
//! place of the classic reactor's main-notify lock: raises and table
//! mutations are observed atomically by session tasks, and no lock is ever
//! held across an await point.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::client::{Client, SessionAction};
use crate::command::CommandExecutor;
use crate::config::Limits;
use crate::listener::{Listener, Peer, Stream};

/// Greeting written to every accepted connection.
const GREETING: &str = "OK MPD 0.15.0\n";

/// How often the expiry sweep runs.
const SWEEP_INTERVAL: Duration = Duration::from_millis(500);

/// One connected session: socket, state, and a wakeup channel for events
/// raised outside the session's own task (idle raises, expiry, shutdown).
pub struct ClientHandle {
    num: u64,
    stream: Stream,
    state: Mutex<Client>,
    wake: Notify,
}

struct ManagerInner {
    clients: Mutex<HashMap<u64, Arc<ClientHandle>>>,
    next_num: AtomicU64,
    /// Dropped to zero on shutdown so no new session can be created.
    max_connections: AtomicUsize,
    limits: Limits,
    default_permission: u32,
    shutdown: CancellationToken,
}

/// Owns every live session and the global limits.
#[derive(Clone)]
pub struct ClientManager {
    inner: Arc<ManagerInner>,
}

impl ClientManager {
    pub fn new(limits: Limits, default_permission: u32) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                clients: Mutex::new(HashMap::new()),
                next_num: AtomicU64::new(0),
                max_connections: AtomicUsize::new(limits.max_connections),
                limits,
                default_permission,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Token cancelled when the daemon is shutting down.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    pub fn limits(&self) -> Limits {
        self.inner.limits
    }

    /// Number of live sessions.
    pub fn client_count(&self) -> usize {
        self.inner.clients.lock().len()
    }

    /// Admit one accepted connection: enforce the connection cap, create
    /// the session, send the greeting, and spawn its task.
    pub fn accept_client(&self, stream: Stream, peer: Peer, executor: Arc<dyn CommandExecutor>) {
        let max = self.inner.max_connections.load(Ordering::Relaxed);

        let handle = {
            let mut clients = self.inner.clients.lock();
            if clients.len() >= max {
                tracing::error!(addr = %peer.addr, "max connections reached");
                return;
            }

            let num = self.inner.next_num.fetch_add(1, Ordering::Relaxed);
            let client = Client::new(num, peer.uid, self.inner.default_permission, self.inner.limits);
            let handle = Arc::new(ClientHandle {
                num,
                stream,
                state: Mutex::new(client),
                wake: Notify::new(),
            });
            clients.insert(num, handle.clone());
            handle
        };

        tracing::debug!(client = handle.num, addr = %peer.addr, "client opened");

        {
            // The greeting is the one write that happens before the client
            // has said anything; staging is empty so this goes out directly.
            let mut state = handle.state.lock();
            state.puts(&handle.stream, GREETING);
            state.write_output(&handle.stream);
        }

        let manager = self.clone();
        tokio::spawn(async move {
            client_task(manager, handle, executor).await;
        });
    }

    /// Raise idle event flags on every live session, waking any that are
    /// blocked on a subscribed event. Callable from any task or thread.
    pub fn idle_add(&self, flags: u32) {
        debug_assert!(flags != 0);

        let handles: Vec<Arc<ClientHandle>> =
            self.inner.clients.lock().values().cloned().collect();

        for handle in handles {
            {
                let mut state = handle.state.lock();
                if state.is_expired() {
                    continue;
                }
                state.idle_add(&handle.stream, flags);
            }
            // The delivery may have queued deferred output or expired the
            // session; let the task re-evaluate its readiness interest.
            handle.wake.notify_one();
        }
    }

    /// Expiry sweep: wake expired sessions so their tasks detach them, and
    /// expire sessions past the inactivity timeout. Idle-waiting clients
    /// never time out.
    pub fn expire(&self) {
        let handles: Vec<Arc<ClientHandle>> =
            self.inner.clients.lock().values().cloned().collect();

        for handle in handles {
            let mut state = handle.state.lock();
            if state.is_expired() {
                tracing::debug!(client = handle.num, "client expired");
            } else if !state.is_idle_waiting()
                && state.last_activity().elapsed() > self.inner.limits.connection_timeout
            {
                tracing::debug!(client = handle.num, "client timed out");
                state.set_expired();
            } else {
                continue;
            }
            drop(state);
            handle.wake.notify_one();
        }
    }

    /// Shut the daemon down: stop admitting connections, cancel the
    /// shutdown token, and expire every session.
    pub fn shutdown(&self) {
        self.inner.max_connections.store(0, Ordering::Relaxed);
        self.inner.shutdown.cancel();

        let handles: Vec<Arc<ClientHandle>> =
            self.inner.clients.lock().values().cloned().collect();
        for handle in handles {
            handle.state.lock().set_expired();
            handle.wake.notify_one();
        }
    }

    /// Detach one session; the socket closes when the last handle drops.
    fn close(&self, handle: &Arc<ClientHandle>) {
        handle.state.lock().set_expired();
        self.inner.clients.lock().remove(&handle.num);
        tracing::debug!(client = handle.num, "client closed");
    }
}

/// Accept loop. Runs until the manager shuts down; accept errors are
/// transient (the kernel can refuse under descriptor pressure) and logged.
pub async fn serve(
    manager: ClientManager,
    listener: Listener,
    executor: Arc<dyn CommandExecutor>,
) -> io::Result<()> {
    let shutdown = manager.shutdown_token();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    manager.accept_client(stream, peer, executor.clone());
                }
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                }
            },
        }
    }
}

/// Periodic expiry sweep. Runs until the manager shuts down.
pub async fn sweep(manager: ClientManager) {
    let shutdown = manager.shutdown_token();
    let mut interval = tokio::time::interval(SWEEP_INTERVAL);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = interval.tick() => manager.expire(),
        }
    }
}

/// Drive one session until it closes.
///
/// Readiness interest follows the backpressure rule: while deferred output
/// is pending the task waits only for writability; otherwise it waits for
/// readability. The wake channel re-evaluates interest whenever another
/// task mutates this session (idle raise, expiry, shutdown).
async fn client_task(
    manager: ClientManager,
    handle: Arc<ClientHandle>,
    executor: Arc<dyn CommandExecutor>,
) {
    let shutdown = manager.shutdown_token();

    loop {
        let want_write = {
            let state = handle.state.lock();
            if state.is_expired() {
                break;
            }
            !state.deferred_is_empty()
        };

        tokio::select! {
            _ = shutdown.cancelled() => break,

            _ = handle.wake.notified() => {}

            ready = handle.stream.readable(), if !want_write => {
                if ready.is_err() {
                    break;
                }
                let action = {
                    let mut state = handle.state.lock();
                    state.read_step(&handle.stream, executor.as_ref())
                };
                match action {
                    SessionAction::Continue => {}
                    SessionAction::Close => break,
                    SessionAction::Kill => {
                        tracing::info!(client = handle.num, "kill requested");
                        manager.shutdown();
                        break;
                    }
                }
            }

            ready = handle.stream.writable(), if want_write => {
                if ready.is_err() {
                    break;
                }
                handle.state.lock().write_deferred(&handle.stream);
            }
        }
    }

    manager.close(&handle);
}
