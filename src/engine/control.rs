//! Control plane: reads the ingress queue and dispatches events on a
//! bounded pool of workers.

use crate::config::Options;
use crate::db::Db;
use crate::db::pgmq::{EVENTS_QUEUE, EVENTS_READY_CHANNEL, PgmqMessage};
use crate::error::Result;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use super::dispatch::Dispatcher;

/// Configuration for the control plane.
#[derive(Debug, Clone)]
pub struct ControlConfig {
    /// Visibility timeout (seconds) for pgmq reads.
    pub visibility_timeout: i32,
    /// Poll interval fallback when no NOTIFY arrives.
    pub poll_interval: Duration,
    /// Events dispatched concurrently.
    pub max_workers: usize,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            visibility_timeout: 60,
            poll_interval: Duration::from_secs(60),
            max_workers: 10,
        }
    }
}

impl From<&Options> for ControlConfig {
    fn from(options: &Options) -> Self {
        Self {
            visibility_timeout: i32::try_from(options.visibility_timeout).unwrap_or(i32::MAX),
            poll_interval: Duration::from_secs(options.polling_interval),
            max_workers: options.max_workers,
        }
    }
}

/// What a worker does with a message once its dispatch finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Done with it: archive.
    Archive,
    /// Leave it; it reappears after the visibility timeout.
    Redeliver,
}

/// The control plane loop: read events, dispatch, archive.
#[derive(Clone)]
pub struct ControlPlane {
    db: Arc<Db>,
    dispatcher: Arc<Dispatcher>,
    config: ControlConfig,
    shutdown: Arc<Notify>,
    active: Arc<AtomicUsize>,
}

impl ControlPlane {
    pub fn new(db: Arc<Db>, dispatcher: Arc<Dispatcher>, config: ControlConfig) -> Self {
        Self {
            db,
            dispatcher,
            config,
            shutdown: Arc::new(Notify::new()),
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Signal the control plane to shut down. In-flight dispatches finish.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Number of dispatches currently running.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    /// Run the control plane loop until shutdown.
    pub async fn run(&self) -> Result<()> {
        self.db.create_queue(EVENTS_QUEUE).await?;

        let mut listener = sqlx::postgres::PgListener::connect_with(self.db.pool()).await?;
        listener.listen(EVENTS_READY_CHANNEL).await?;

        info!(
            queue = EVENTS_QUEUE,
            max_workers = self.config.max_workers,
            "control plane started, listening for events"
        );

        let mut workers = JoinSet::new();
        loop {
            if let Err(e) = self.fill(&mut workers).await {
                error!("reading ingress queue failed: {e}");
            }

            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!(in_flight = self.active(), "control plane shutting down");
                    break;
                }
                notif = listener.recv() => {
                    match notif {
                        Ok(n) => info!(event = n.payload(), "notified of new event"),
                        Err(e) => warn!("PgListener error: {e}, falling back to poll"),
                    }
                }
                Some(joined) = workers.join_next(), if !workers.is_empty() => {
                    if let Err(e) = joined {
                        error!("worker panicked: {e}");
                    }
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!("worker panicked: {e}");
            }
        }
        info!("control plane stopped");
        Ok(())
    }

    /// Start workers for queued messages until the pool is full or the
    /// queue is empty.
    async fn fill(&self, workers: &mut JoinSet<()>) -> Result<()> {
        while let Some(joined) = workers.try_join_next() {
            if let Err(e) = joined {
                error!("worker panicked: {e}");
            }
        }

        let free = self.config.max_workers.saturating_sub(workers.len());
        if free == 0 {
            return Ok(());
        }
        let messages = self
            .db
            .read_from_queue(
                EVENTS_QUEUE,
                self.config.visibility_timeout,
                i32::try_from(free).unwrap_or(i32::MAX),
            )
            .await?;

        for msg in messages {
            let plane = self.clone();
            plane.active.fetch_add(1, Ordering::Relaxed);
            workers.spawn(async move {
                let msg_id = msg.msg_id;
                if let Err(e) = plane.work(msg).await {
                    error!(msg_id, "retiring message failed: {e}");
                }
                plane.active.fetch_sub(1, Ordering::Relaxed);
            });
        }
        Ok(())
    }

    /// Dispatch one message, enqueue its follow-ups, then retire it.
    async fn work(&self, msg: PgmqMessage) -> Result<()> {
        let event = match msg.event() {
            Ok(event) => event,
            Err(e) => {
                error!(msg_id = msg.msg_id, "undecodable message, archiving: {e}");
                return self.db.archive_message(EVENTS_QUEUE, msg.msg_id).await;
            }
        };

        let disposition = match self.dispatcher.dispatch(&event).await {
            Ok(follow_ups) => {
                for follow_up in &follow_ups {
                    self.db.enqueue_event(follow_up).await?;
                }
                Disposition::Archive
            }
            Err(e) => disposition_for(&e, msg.read_ct),
        };

        match disposition {
            Disposition::Archive => self.db.archive_message(EVENTS_QUEUE, msg.msg_id).await,
            Disposition::Redeliver => {
                warn!(
                    msg_id = msg.msg_id,
                    read_ct = msg.read_ct,
                    "dispatch failed transiently, leaving message for redelivery"
                );
                Ok(())
            }
        }
    }
}

/// Messages read this many times are archived even on transient failures.
const MAX_DELIVERIES: i32 = 5;

fn disposition_for(err: &crate::error::Error, read_ct: i32) -> Disposition {
    if err.is_transient() && read_ct < MAX_DELIVERIES {
        Disposition::Redeliver
    } else {
        Disposition::Archive
    }
}
