//! Per-connection block ordering engine
//!
//! Blocks of one connection may arrive over any tunnel in any order and
//! more than once. The engine delivers each block ID exactly once, in
//! order, and declares the connection dead when a gap stays open longer
//! than the block wait timeout.

use super::shared::ConnectionCore;
use super::ConnectionError;
use crate::protocol::{Block, ShutdownType, BLOCK_ID_ORIGIN, MAX_CACHED_BLOCKS};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{trace, warn};

/// Reassembles one direction of a connection
#[derive(Debug)]
pub struct BlockOrderer {
    connection_id: u32,
    /// Lowest block ID not yet delivered
    next: u32,
    /// One past the largest block ID seen
    highest_seen: u32,
    cache: HashMap<u32, Block>,
    /// When the current gap opened or last made progress
    gap_since: Option<Instant>,
}

impl BlockOrderer {
    pub fn new(connection_id: u32) -> Self {
        Self {
            connection_id,
            next: BLOCK_ID_ORIGIN,
            highest_seen: BLOCK_ID_ORIGIN,
            cache: HashMap::new(),
            gap_since: None,
        }
    }

    /// Next block ID expected
    pub fn next_block_id(&self) -> u32 {
        self.next
    }

    pub fn cached(&self) -> usize {
        self.cache.len()
    }

    /// True while some block after `next` has been seen but `next` has not
    pub fn has_gap(&self) -> bool {
        self.next < self.highest_seen
    }

    /// Accept one block, returning every block that is now deliverable in
    /// order (possibly none)
    pub fn accept(&mut self, block: Block, now: Instant) -> Result<Vec<Block>, ConnectionError> {
        let block_id = block.block_id();
        let mut delivered = Vec::new();

        if block_id < self.next {
            trace!(connection_id = self.connection_id, block_id, "duplicate block dropped");
            return Ok(delivered);
        }

        if block_id == self.next {
            delivered.push(block);
            self.next = self.next.wrapping_add(1);
            while let Some(cached) = self.cache.remove(&self.next) {
                delivered.push(cached);
                self.next = self.next.wrapping_add(1);
            }
            self.highest_seen = self.highest_seen.max(self.next);
        } else {
            if !self.cache.contains_key(&block_id) && self.cache.len() >= MAX_CACHED_BLOCKS {
                return Err(ConnectionError::CacheOverflow(self.cache.len()));
            }
            self.cache.entry(block_id).or_insert(block);
            self.highest_seen = self.highest_seen.max(block_id.saturating_add(1));
        }

        if !self.has_gap() {
            self.gap_since = None;
        } else if self.gap_since.is_none() || !delivered.is_empty() {
            self.gap_since = Some(now);
        }

        Ok(delivered)
    }

    /// When the open gap (if any) times out
    pub fn gap_deadline(&self, block_wait: Duration) -> Option<Instant> {
        self.gap_since.map(|since| since + block_wait)
    }

    /// True if a gap has been open without progress for `block_wait`
    pub fn is_stalled(&self, now: Instant, block_wait: Duration) -> bool {
        self.has_gap()
            && self
                .gap_deadline(block_wait)
                .is_some_and(|deadline| now >= deadline)
    }
}

/// Ordering task: `input` carries blocks as dispatched by the pool,
/// `ordered` receives them in block-ID order.
///
/// Disconnect blocks update the connection's half-close state after they
/// are forwarded. Ends when the connection is closed, on a fault, or when
/// either queue goes away.
pub(crate) async fn run_ordering(
    core: Arc<ConnectionCore>,
    mut input: mpsc::Receiver<Block>,
    ordered: mpsc::Sender<Block>,
    block_wait: Duration,
) {
    let connection_id = core.id();
    let token = core.token().clone();
    let mut orderer = BlockOrderer::new(connection_id);

    'run: loop {
        let wait = match orderer.gap_deadline(block_wait) {
            Some(deadline) => deadline.saturating_duration_since(Instant::now()),
            None => block_wait,
        };

        let next = tokio::select! {
            _ = token.cancelled() => break,
            next = tokio::time::timeout(wait, input.recv()) => next,
        };

        let block = match next {
            Ok(Some(block)) => block,
            Ok(None) => break,
            Err(_) if orderer.is_stalled(Instant::now(), block_wait) => {
                let err = ConnectionError::OrderingTimeout {
                    connection_id,
                    block_id: orderer.next_block_id(),
                };
                warn!(connection_id, cached = orderer.cached(), "{}", err);
                core.reset();
                break;
            }
            Err(_) => {
                trace!(connection_id, "connection idle");
                continue;
            }
        };

        let delivered = match orderer.accept(block, Instant::now()) {
            Ok(delivered) => delivered,
            Err(e) => {
                warn!(connection_id, error = %e, "Dropping connection");
                core.reset();
                break;
            }
        };

        for block in delivered {
            let shutdown = block.shutdown_type();

            let sent = tokio::select! {
                sent = ordered.send(block) => sent.is_ok(),
                _ = token.cancelled() => false,
            };
            if !sent {
                break 'run;
            }

            match shutdown {
                Some(ShutdownType::WriteOnly) => core.close_remote(),
                Some(ShutdownType::ReadOnly) => core.close_local(),
                Some(ShutdownType::Both) => {
                    core.remote_closed();
                    break 'run;
                }
                None => {}
            }
        }
    }

    trace!(connection_id, "ordering engine stopped");
}
