//! The ingestion loop: a single sequential driver over block heights.
//!
//! Each pass polls the node tip and processes one batch
//! `[current, min(current + batch_size, tip)]` in increasing height order.
//!
//! - A reorg outcome moves `current` to the reported resume height.
//! - Any other failure rolls the store back to `height - 1` and retries
//!   `height` after a backoff; the failure after `max_retries` retries is fatal.
//!   A rollback that itself fails is fatal.
//! - A failed tip poll backs off under its own counter; it does not use up
//!   the retries of the block at `current`.
//! - Reorg-resolution exhaustion is fatal immediately.
//!
//! Loop state (`current`, `retries`, `poll_failures`) is passed into and returned from
//! [`IndexLoop::step`]; nothing else carries over between passes.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use tzeindex_core::error::IndexerError;
use tzeindex_core::indexer::{IndexerConfig, IndexerState};
use tzeindex_core::retry::RetryPolicy;
use tzeindex_core::store::IndexStore;

use crate::fetcher::NodeClient;
use crate::orchestrator::{BlockOrchestrator, BlockOutcome};

/// Loop-local state carried between passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopState {
    /// Next height to process.
    pub current: u64,
    /// Consecutive failures at `current`.
    pub retries: u32,
    /// Consecutive failed tip polls.
    pub poll_failures: u32,
}

impl LoopState {
    pub fn new(current: u64) -> Self {
        Self {
            current,
            retries: 0,
            poll_failures: 0,
        }
    }
}

/// What a single pass decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// More work may be available immediately.
    Continue(LoopState),
    /// Caught up with the tip; poll again after the interval.
    CaughtUp(LoopState),
    /// The configured stop height has been indexed.
    Finished,
    /// A stop was requested.
    Cancelled,
}

/// The ingestion loop over a node client and a store.
pub struct IndexLoop<C: ?Sized, S: ?Sized> {
    config: IndexerConfig,
    client: Arc<C>,
    store: Arc<S>,
    orchestrator: BlockOrchestrator<C, S>,
    retry: RetryPolicy,
    stop_tx: Arc<watch::Sender<bool>>,
    stop_rx: watch::Receiver<bool>,
    state_tx: watch::Sender<IndexerState>,
}

impl<C, S> IndexLoop<C, S>
where
    C: NodeClient + ?Sized,
    S: IndexStore + ?Sized,
{
    pub fn new(config: IndexerConfig, client: Arc<C>, store: Arc<S>) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        let (state_tx, _) = watch::channel(IndexerState::Idle);
        Self {
            orchestrator: BlockOrchestrator::new(&config, Arc::clone(&client), Arc::clone(&store)),
            retry: RetryPolicy::new(config.retry.clone()),
            config,
            client,
            store,
            stop_tx: Arc::new(stop_tx),
            stop_rx,
            state_tx,
        }
    }

    pub fn orchestrator(&self) -> &BlockOrchestrator<C, S> {
        &self.orchestrator
    }

    /// Request a stop; observed before each tip poll, before each block, and
    /// during sleeps.
    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
    }

    pub fn state(&self) -> IndexerState {
        *self.state_tx.borrow()
    }

    fn stop_requested(&self) -> bool {
        *self.stop_rx.borrow()
    }

    fn set_state(&self, state: IndexerState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            info!(indexer = %self.config.id, from = %previous, to = %state, "state change");
        }
    }

    /// Explicit override, else one past the cursor, else the configured default.
    pub async fn start_height(&self) -> Result<u64, IndexerError> {
        if let Some(h) = self.config.start_height {
            return Ok(h);
        }
        Ok(match self.store.load_cursor().await? {
            Some(cursor) => {
                info!(height = cursor.height, hash = %cursor.hash, "resuming from cursor");
                cursor.next_height()
            }
            None => self.config.default_start_height,
        })
    }

    /// Sleep for `duration`; returns `false` if a stop arrived first.
    async fn sleep(&self, duration: Duration) -> bool {
        let mut stop = self.stop_rx.clone();
        if *stop.borrow() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = stop.changed() => !*stop.borrow(),
        }
    }

    /// Run until the stop height, a stop request, or a fatal error.
    pub async fn run(&self) -> Result<(), IndexerError> {
        let mut state = LoopState::new(self.start_height().await?);
        let poll = Duration::from_millis(self.config.poll_interval_ms);
        info!(
            indexer = %self.config.id,
            start = state.current,
            stop = ?self.config.stop_height,
            modules = ?self.orchestrator.modules(),
            "starting ingestion"
        );

        loop {
            match self.step(state).await {
                Ok(Step::Continue(next)) => state = next,
                Ok(Step::CaughtUp(next)) => {
                    state = next;
                    if !self.sleep(poll).await {
                        break;
                    }
                }
                Ok(Step::Finished) => {
                    info!(height = state.current.saturating_sub(1), "stop height reached");
                    break;
                }
                Ok(Step::Cancelled) => {
                    self.set_state(IndexerState::Stopping);
                    break;
                }
                Err(e) => {
                    error!(height = state.current, error = %e, "ingestion stopped");
                    self.set_state(IndexerState::Error);
                    return Err(e);
                }
            }
        }
        self.set_state(IndexerState::Stopped);
        Ok(())
    }

    /// One pass: poll the tip and process one batch.
    pub async fn step(&self, state: LoopState) -> Result<Step, IndexerError> {
        if self.stop_requested() {
            return Ok(Step::Cancelled);
        }
        if self
            .config
            .stop_height
            .is_some_and(|stop| state.current > stop)
        {
            return Ok(Step::Finished);
        }

        let tip = match self.client.get_block_count().await {
            Ok(tip) => tip,
            Err(e) => return self.poll_failed(state, e).await.map(Step::Continue),
        };
        let mut state = LoopState {
            poll_failures: 0,
            ..state
        };
        let target = match self.config.stop_height {
            Some(stop) => stop.min(tip),
            None => tip,
        };
        if state.current > target {
            self.set_state(IndexerState::Live);
            return Ok(Step::CaughtUp(state));
        }

        let end = state.current.saturating_add(self.config.batch_size).min(target);
        self.set_state(if end < tip {
            IndexerState::Backfilling
        } else {
            IndexerState::Live
        });

        let start = state.current;
        for height in start..=end {
            if self.stop_requested() {
                return Ok(Step::Cancelled);
            }
            match self.orchestrator.process_block(height).await {
                Ok(BlockOutcome::Indexed { .. }) => {
                    state = LoopState::new(height + 1);
                }
                Ok(BlockOutcome::Reorg(event)) => {
                    self.set_state(IndexerState::ReorgRecovery);
                    warn!(
                        detected_at = event.detected_at,
                        ancestor = event.common_ancestor,
                        depth = event.depth,
                        resume = event.resume_height,
                        "reorg resolved"
                    );
                    return Ok(Step::Continue(LoopState::new(event.resume_height)));
                }
                Err(e) => return self.recover(state, e).await.map(Step::Continue),
            }
        }

        info!(from = start, to = end, tip, "batch complete");
        Ok(Step::Continue(state))
    }

    /// Back off after a failed tip poll, or give up once the retry policy is spent.
    async fn poll_failed(
        &self,
        state: LoopState,
        err: IndexerError,
    ) -> Result<LoopState, IndexerError> {
        if err.is_fatal() {
            return Err(err);
        }
        let attempt = state.poll_failures + 1;
        let Some(delay) = self.retry.next_delay(attempt) else {
            return Err(IndexerError::RetriesExhausted {
                height: state.current,
                attempts: attempt,
                last_error: format!("tip poll failed: {err}"),
            });
        };
        warn!(
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "tip poll failed, retrying"
        );
        self.sleep(delay).await;
        Ok(LoopState {
            poll_failures: attempt,
            ..state
        })
    }

    /// Roll back and schedule a retry of `state.current`, or give up.
    async fn recover(&self, state: LoopState, err: IndexerError) -> Result<LoopState, IndexerError> {
        let height = state.current;
        if err.is_fatal() {
            return Err(err);
        }
        let attempt = state.retries + 1;
        let Some(delay) = self.retry.next_delay(attempt) else {
            return Err(IndexerError::RetriesExhausted {
                height,
                attempts: attempt,
                last_error: err.to_string(),
            });
        };

        warn!(
            height,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "block failed, rolling back and retrying"
        );
        if height > 0 {
            self.store.rollback_after(height - 1).await?;
        }
        // A stop during the backoff is picked up by the next pass.
        self.sleep(delay).await;
        Ok(LoopState {
            retries: attempt,
            ..state
        })
    }
}

impl<C, S> IndexLoop<C, S>
where
    C: NodeClient + ?Sized + 'static,
    S: IndexStore + ?Sized + 'static,
{
    /// Run the loop as a Tokio task.
    pub fn spawn(self) -> IndexerHandle {
        let (err_tx, err_rx) = oneshot::channel();
        let stop = Arc::clone(&self.stop_tx);
        let state = self.state_tx.subscribe();
        let join = tokio::spawn(async move {
            if let Err(e) = self.run().await {
                let _ = err_tx.send(e);
            }
        });
        IndexerHandle {
            stop,
            state,
            errors: err_rx,
            join,
        }
    }
}

/// Owner's handle on a spawned [`IndexLoop`].
pub struct IndexerHandle {
    stop: Arc<watch::Sender<bool>>,
    state: watch::Receiver<IndexerState>,
    /// Receives the fatal error that stopped the loop, if any.
    pub errors: oneshot::Receiver<IndexerError>,
    pub join: JoinHandle<()>,
}

impl IndexerHandle {
    pub fn stop(&self) {
        self.stop.send_replace(true);
    }

    pub fn state(&self) -> IndexerState {
        *self.state.borrow()
    }

    /// A receiver that observes every state change.
    pub fn subscribe(&self) -> watch::Receiver<IndexerState> {
        self.state.clone()
    }

    /// Wait for the loop to exit and return its fatal error, if any.
    pub async fn wait(self) -> Result<(), IndexerError> {
        self.join
            .await
            .map_err(|e| IndexerError::Aborted {
                reason: format!("indexer task failed: {e}"),
            })?;
        match self.errors.await {
            Ok(err) => Err(err),
            Err(_) => Ok(()),
        }
    }
}
