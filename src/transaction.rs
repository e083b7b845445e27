//! Transaction id allocation and reply matching
//!
//! The matcher owns every in-flight [`Request`] of a channel. Replies are
//! matched on the MBAP transaction id; a reply for an id that is no longer
//! registered (late, duplicate or foreign) is logged and dropped.

use std::collections::HashMap;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{FrameError, ModbusError, ModbusResult};
use crate::frame::Frame;
use crate::request::Request;

#[derive(Debug)]
struct Transaction {
    request: Request,
    deadline: Instant,
}

/// In-flight transactions of one channel
#[derive(Debug, Default)]
pub struct TransactionMatcher {
    next: u16,
    pending: HashMap<u16, Transaction>,
}

impl TransactionMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next transaction id
    ///
    /// Ids increment with wrap-around and skip ids that are still in flight.
    pub fn next_id(&mut self) -> u16 {
        loop {
            let id = self.next;
            self.next = self.next.wrapping_add(1);
            if !self.pending.contains_key(&id) {
                return id;
            }
        }
    }

    /// Take ownership of a sent request until its reply or deadline
    pub fn register(&mut self, id: u16, request: Request, deadline: Instant) {
        if let Some(previous) = self.pending.insert(id, Transaction { request, deadline }) {
            previous
                .request
                .fail(ModbusError::internal("transaction id reused while in flight"));
        }
    }

    /// Whether `id` is still waiting for a reply
    pub fn is_pending(&self, id: u16) -> bool {
        self.pending.contains_key(&id)
    }

    /// Resolve the transaction a reply belongs to
    ///
    /// Returns `None` when no transaction is registered under the reply's id;
    /// otherwise the outcome that was handed to the callback.
    pub fn resolve(&mut self, frame: &Frame) -> Option<ModbusResult<()>> {
        let id = frame.header.tx_id;
        let Some(transaction) = self.pending.remove(&id) else {
            warn!(
                "Discarding reply with unknown transaction id {} (unit {})",
                id, frame.header.unit_id
            );
            return None;
        };

        let request = transaction.request;
        if frame.header.unit_id != request.unit_id() {
            let err = ModbusError::from(FrameError::UnitIdMismatch {
                expected: request.unit_id(),
                actual: frame.header.unit_id,
            });
            request.fail(err.clone());
            return Some(Err(err));
        }

        debug!("Resolving transaction {}", id);
        Some(request.complete(&frame.pdu))
    }

    /// Earliest deadline among in-flight transactions
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|t| t.deadline).min()
    }

    /// Retire every transaction whose deadline has passed
    ///
    /// Each expired request resolves with a timeout error; returns the ids
    /// that were retired.
    pub fn expire(&mut self, now: Instant) -> Vec<u16> {
        let mut expired: Vec<u16> = self
            .pending
            .iter()
            .filter(|(_, t)| t.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        expired.sort_unstable();

        for id in &expired {
            if let Some(transaction) = self.pending.remove(id) {
                let timeout_ms = transaction.request.timeout().as_millis() as u64;
                warn!("Transaction {} timed out after {}ms", id, timeout_ms);
                transaction.request.fail(ModbusError::timeout(timeout_ms));
            }
        }

        expired
    }

    /// Resolve every in-flight transaction with `err`
    pub fn fail_all(&mut self, err: ModbusError) {
        let mut ids: Vec<u16> = self.pending.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            if let Some(transaction) = self.pending.remove(&id) {
                transaction.request.fail(err.clone());
            }
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
