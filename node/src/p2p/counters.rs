//! Per-peer message counters.

use crate::p2p::codec::MessageKind;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

const KINDS: usize = MessageKind::ALL.len();

#[derive(Debug, Default)]
struct Direction {
    items: [AtomicU64; KINDS],
    packets: [AtomicU64; KINDS],
}

impl Direction {
    fn record(&self, kind: MessageKind, items: usize) {
        self.items[kind.index()].fetch_add(items as u64, Ordering::Relaxed);
        self.packets[kind.index()].fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> (BTreeMap<String, u64>, BTreeMap<String, u64>) {
        let mut items = BTreeMap::new();
        let mut packets = BTreeMap::new();
        for kind in MessageKind::ALL {
            let packet_count = self.packets[kind.index()].load(Ordering::Relaxed);
            if packet_count == 0 {
                continue;
            }
            packets.insert(kind.name().to_string(), packet_count);
            items.insert(
                kind.name().to_string(),
                self.items[kind.index()].load(Ordering::Relaxed),
            );
        }
        (items, packets)
    }
}

/// Item and packet counts per message kind, for both directions.
#[derive(Debug, Default)]
pub struct PeerCounters {
    received: Direction,
    sent: Direction,
    dropped_broadcasts: AtomicU64,
}

impl PeerCounters {
    pub fn record_received(&self, kind: MessageKind, items: usize) {
        self.received.record(kind, items);
    }

    pub fn record_sent(&self, kind: MessageKind, items: usize) {
        self.sent.record(kind, items);
    }

    pub fn record_dropped_broadcast(&self) {
        self.dropped_broadcasts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn received_packets(&self, kind: MessageKind) -> u64 {
        self.received.packets[kind.index()].load(Ordering::Relaxed)
    }

    pub fn sent_packets(&self, kind: MessageKind) -> u64 {
        self.sent.packets[kind.index()].load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        let (received, packets_received) = self.received.snapshot();
        let (sent, packets_sent) = self.sent.snapshot();
        CounterSnapshot {
            received,
            sent,
            packets_received,
            packets_sent,
            dropped_broadcasts: self.dropped_broadcasts.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`PeerCounters`], keyed by message name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub received: BTreeMap<String, u64>,
    pub sent: BTreeMap<String, u64>,
    pub packets_received: BTreeMap<String, u64>,
    pub packets_sent: BTreeMap<String, u64>,
    pub dropped_broadcasts: u64,
}
