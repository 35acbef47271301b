//! Per-connection counters (thread-safe, lock-free).

use crate::pending::ResponseKind;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

const OP_SLOTS: usize = 8;

fn slot(kind: ResponseKind) -> usize {
    match kind {
        ResponseKind::Bind => 0,
        ResponseKind::Search => 1,
        ResponseKind::Modify => 2,
        ResponseKind::Add => 3,
        ResponseKind::Delete => 4,
        ResponseKind::ModifyDn => 5,
        ResponseKind::Compare => 6,
        ResponseKind::Extended => 7,
    }
}

const SLOT_NAMES: [&str; OP_SLOTS] = [
    "bind", "search", "modify", "add", "delete", "modify_dn", "compare", "extended",
];

#[derive(Debug, Default)]
struct OpCounters {
    sent: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
}

/// Counters for one connection. Cheap to bump from any task.
#[derive(Debug, Default)]
pub struct ConnectionStats {
    ops: [OpCounters; OP_SLOTS],
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    abandons_sent: AtomicU64,
    unsolicited: AtomicU64,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct OpSnapshot {
    pub op: &'static str,
    pub sent: u64,
    pub completed: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub ops: Vec<OpSnapshot>,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub abandons_sent: u64,
    pub unsolicited: u64,
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_sent(&self, kind: ResponseKind) {
        self.ops[slot(kind)].sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_completed(&self, kind: ResponseKind) {
        self.ops[slot(kind)]
            .completed
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self, kind: ResponseKind) {
        self.ops[slot(kind)].failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bytes_in(&self, n: usize) {
        self.bytes_in.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn record_bytes_out(&self, n: usize) {
        self.bytes_out.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn record_abandon(&self) {
        self.abandons_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unsolicited(&self) {
        self.unsolicited.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            ops: self
                .ops
                .iter()
                .zip(SLOT_NAMES)
                .map(|(c, op)| OpSnapshot {
                    op,
                    sent: c.sent.load(Ordering::Relaxed),
                    completed: c.completed.load(Ordering::Relaxed),
                    failed: c.failed.load(Ordering::Relaxed),
                })
                .collect(),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            abandons_sent: self.abandons_sent.load(Ordering::Relaxed),
            unsolicited: self.unsolicited.load(Ordering::Relaxed),
        }
    }
}
