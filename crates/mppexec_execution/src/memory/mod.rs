//! Per-query memory accounting shared by every exchange on a node.
//!
//! Bytes are reserved before data is buffered and freed once it has been
//! consumed. A reservation that doesn't fit is queued and granted by a later
//! `free`, which is how a slow consumer throttles how much data is pulled over
//! the network.

use std::collections::VecDeque;

use hashbrown::HashMap;
use mppexec_error::{ErrorKind, MppError, Result};
use parking_lot::Mutex;
use tracing::trace;

use crate::ids::QueryId;
use crate::signal::{Signal, SignalFuture};

/// Counters describing everything that went through the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemoryPoolStats {
    /// Bytes currently reserved across all queries.
    pub reserved: u64,
    /// Total bytes ever granted.
    pub allocated: u64,
    /// Total bytes ever freed.
    pub deallocated: u64,
    /// Reservations waiting for room.
    pub pending: usize,
}

#[derive(Debug)]
struct PendingReservation {
    query_id: QueryId,
    bytes: u64,
    signal: Signal,
}

#[derive(Debug, Default)]
struct PoolState {
    reserved: u64,
    allocated: u64,
    deallocated: u64,
    query_reservations: HashMap<QueryId, u64>,
    pending: VecDeque<PendingReservation>,
}

impl PoolState {
    fn fits(
        &self,
        max_bytes: u64,
        max_bytes_per_query: u64,
        query_id: &QueryId,
        bytes: u64,
    ) -> bool {
        let query_reserved = self.query_reservations.get(query_id).copied().unwrap_or(0);
        self.reserved + bytes <= max_bytes && query_reserved + bytes <= max_bytes_per_query
    }

    fn grant(&mut self, query_id: QueryId, bytes: u64) {
        self.reserved += bytes;
        self.allocated += bytes;
        *self.query_reservations.entry(query_id).or_insert(0) += bytes;
    }
}

#[derive(Debug)]
pub struct MemoryPool {
    max_bytes: u64,
    max_bytes_per_query: u64,
    state: Mutex<PoolState>,
}

impl MemoryPool {
    pub fn new(max_bytes: u64, max_bytes_per_query: u64) -> Self {
        MemoryPool {
            max_bytes,
            max_bytes_per_query: max_bytes_per_query.min(max_bytes),
            state: Mutex::new(PoolState::default()),
        }
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    pub fn max_bytes_per_query(&self) -> u64 {
        self.max_bytes_per_query
    }

    /// Reserve `bytes` on behalf of a query.
    ///
    /// The returned future is already done if the bytes were reserved
    /// synchronously. Otherwise the reservation is queued and the future
    /// completes once a `free` makes room, at which point the bytes are
    /// accounted to the query.
    pub fn reserve(&self, query_id: QueryId, bytes: u64) -> Result<SignalFuture> {
        if bytes == 0 {
            return Err(MppError::with_kind(
                ErrorKind::InvalidArgument,
                "Bytes to reserve must be greater than zero",
            ));
        }
        if bytes > self.max_bytes_per_query {
            return Err(MppError::with_kind(
                ErrorKind::InvalidArgument,
                format!(
                    "Reservation of {bytes} bytes exceeds per query limit of {}",
                    self.max_bytes_per_query
                ),
            ));
        }

        let mut state = self.state.lock();
        let query_waiting = state
            .pending
            .iter()
            .any(|p| p.query_id == query_id && !p.signal.is_done());
        if !query_waiting
            && state.fits(self.max_bytes, self.max_bytes_per_query, &query_id, bytes)
        {
            state.grant(query_id, bytes);
            trace!(%query_id, %bytes, reserved = %state.reserved, "reserved memory");
            return Ok(Signal::completed().future());
        }

        let signal = Signal::new();
        let fut = signal.future();
        state.pending.push_back(PendingReservation {
            query_id,
            bytes,
            signal,
        });
        trace!(%query_id, %bytes, pending = %state.pending.len(), "queued memory reservation");

        Ok(fut)
    }

    /// Return bytes previously reserved for a query.
    ///
    /// Queued reservations that now fit are granted, and their futures are
    /// completed after the pool lock is released.
    pub fn free(&self, query_id: QueryId, bytes: u64) -> Result<()> {
        if bytes == 0 {
            return Ok(());
        }

        let granted = {
            let mut state = self.state.lock();
            let query_reserved = match state.query_reservations.get_mut(&query_id) {
                Some(reserved) => reserved,
                None => {
                    return Err(MppError::with_kind(
                        ErrorKind::InvalidArgument,
                        format!("Query {query_id} has no memory reserved"),
                    ))
                }
            };
            if *query_reserved < bytes {
                return Err(MppError::with_kind(
                    ErrorKind::InvalidArgument,
                    format!(
                        "Freeing {bytes} bytes for query {query_id}, but only {} reserved",
                        *query_reserved
                    ),
                ));
            }

            *query_reserved -= bytes;
            if *query_reserved == 0 {
                state.query_reservations.remove(&query_id);
            }
            state.reserved -= bytes;
            state.deallocated += bytes;
            trace!(%query_id, %bytes, reserved = %state.reserved, "freed memory");

            self.grant_pending(&mut state)
        };

        for signal in granted {
            signal.set();
        }

        Ok(())
    }

    fn grant_pending(&self, state: &mut PoolState) -> Vec<Signal> {
        let mut granted = Vec::new();
        let mut remaining = VecDeque::with_capacity(state.pending.len());

        while let Some(pending) = state.pending.pop_front() {
            if pending.signal.is_done() {
                // Nobody's waiting on this anymore.
                continue;
            }
            let query_waiting = remaining
                .iter()
                .any(|p: &PendingReservation| p.query_id == pending.query_id);
            if !query_waiting
                && state.fits(
                    self.max_bytes,
                    self.max_bytes_per_query,
                    &pending.query_id,
                    pending.bytes,
                )
            {
                state.grant(pending.query_id, pending.bytes);
                granted.push(pending.signal);
            } else {
                remaining.push_back(pending);
            }
        }

        state.pending = remaining;
        granted
    }

    /// Bytes currently reserved across all queries.
    pub fn reserved_bytes(&self) -> u64 {
        self.state.lock().reserved
    }

    /// Bytes currently reserved for a single query.
    pub fn query_reserved_bytes(&self, query_id: &QueryId) -> u64 {
        self.state
            .lock()
            .query_reservations
            .get(query_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn stats(&self) -> MemoryPoolStats {
        let state = self.state.lock();
        MemoryPoolStats {
            reserved: state.reserved,
            allocated: state.allocated,
            deallocated: state.deallocated,
            pending: state.pending.len(),
        }
    }
}
