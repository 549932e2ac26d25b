//! # Shared Listener
//!
//! One PostgreSQL `LISTEN` connection shared across every queue this pod
//! cares about, so consumer wake-ups don't each open their own
//! `PgListener`. Generalizes
//! `tasker-shared/src/messaging/service/providers/pgmq.rs`'s
//! `SharedListenerManager`/`shared_listener_task` lazy-start-once pattern.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use sqlx::postgres::PgListener;
use sqlx::PgPool;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

const COMMAND_BUFFER_SIZE: usize = 128;
const NOTIFICATION_BUFFER_SIZE: usize = 64;
const NOTIFY_CHANNEL: &str = "queue_message_ready";

#[derive(Debug)]
enum ListenerCommand {
    Subscribe {
        queue_name: String,
        tx: mpsc::Sender<()>,
    },
}

struct SharedListenerState {
    pool: PgPool,
    command_tx: mpsc::Sender<ListenerCommand>,
    command_rx: Mutex<Option<mpsc::Receiver<ListenerCommand>>>,
    started: AtomicBool,
}

impl std::fmt::Debug for SharedListenerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedListenerState")
            .field("started", &self.started.load(Ordering::Relaxed))
            .finish()
    }
}

/// A cheaply-cloneable handle to the one background `PgListener` task for a
/// pod. `subscribe` returns a channel that receives a unit value each time
/// `queue_name` gets a new row, letting a consumer loop `select!` between
/// "wake on notify" and its own poll-interval fallback timer.
#[derive(Debug, Clone)]
pub struct SharedListener {
    inner: Arc<SharedListenerState>,
}

impl SharedListener {
    pub fn new(pool: PgPool) -> Self {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER_SIZE);
        Self {
            inner: Arc::new(SharedListenerState {
                pool,
                command_tx,
                command_rx: Mutex::new(Some(command_rx)),
                started: AtomicBool::new(false),
            }),
        }
    }

    fn ensure_started(&self) {
        if self
            .inner
            .started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let command_rx = self
                .inner
                .command_rx
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .take()
                .expect("command_rx taken exactly once");
            let pool = self.inner.pool.clone();
            tokio::spawn(async move {
                shared_listener_task(pool, command_rx).await;
            });
        }
    }

    /// Subscribe to wake-ups for `queue_name`. The returned receiver yields
    /// `()` on every insert notification; a dropped receiver is pruned from
    /// the dispatch table on the next notification.
    pub fn subscribe(&self, queue_name: &str) -> mpsc::Receiver<()> {
        self.ensure_started();
        let (tx, rx) = mpsc::channel(NOTIFICATION_BUFFER_SIZE);
        if self
            .inner
            .command_tx
            .try_send(ListenerCommand::Subscribe {
                queue_name: queue_name.to_string(),
                tx,
            })
            .is_err()
        {
            warn!(queue = %queue_name, "shared listener command channel full, subscription dropped");
        }
        rx
    }
}

async fn shared_listener_task(pool: PgPool, mut command_rx: mpsc::Receiver<ListenerCommand>) {
    let mut listener = match PgListener::connect_with(&pool).await {
        Ok(l) => l,
        Err(e) => {
            error!(error = %e, "failed to create shared PgListener");
            return;
        }
    };

    if let Err(e) = listener.listen(NOTIFY_CHANNEL).await {
        error!(error = %e, channel = NOTIFY_CHANNEL, "failed to LISTEN on notify channel");
        return;
    }

    info!(channel = NOTIFY_CHANNEL, "shared PgListener started");

    let mut subscribers: HashMap<String, Vec<mpsc::Sender<()>>> = HashMap::new();

    loop {
        tokio::select! {
            notification = listener.recv() => {
                match notification {
                    Ok(notification) => {
                        let queue_name = notification.payload().to_string();
                        debug!(queue = %queue_name, "shared listener notification");
                        if let Some(senders) = subscribers.get_mut(&queue_name) {
                            senders.retain(|tx| !tx.is_closed());
                            for tx in senders.iter() {
                                let _ = tx.try_send(());
                            }
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "shared PgListener connection error");
                        break;
                    }
                }
            }
            command = command_rx.recv() => {
                match command {
                    Some(ListenerCommand::Subscribe { queue_name, tx }) => {
                        subscribers.entry(queue_name).or_default().push(tx);
                    }
                    None => {
                        info!("shared listener command channel closed, shutting down");
                        break;
                    }
                }
            }
        }
    }
}
