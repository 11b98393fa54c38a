//! Bounded ingest queue between the capture thread and the aggregation workers.
//!
//! The queue is split into one lane per worker. Events are routed by a hash of
//! their canonical connection key, so every event of a connection lands in the
//! same lane and is applied in arrival order. When a lane is full the oldest
//! queued event is discarded to make room and the overflow is counted.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};

use super::FlowEvent;
use crate::core::flow::ConnectionKey;
use crate::core::stats::PipelineStats;

struct Lane {
    tx: Sender<FlowEvent>,
    // The producer keeps a receiver too so it can evict the oldest event.
    rx: Receiver<FlowEvent>,
}

pub struct IngestQueue {
    lanes: Vec<Lane>,
    stats: Arc<PipelineStats>,
}

impl IngestQueue {
    /// Create `lanes` lanes of `lane_capacity` events each (both at least 1).
    pub fn new(lanes: usize, lane_capacity: usize, stats: Arc<PipelineStats>) -> Self {
        let lanes = (0..lanes.max(1))
            .map(|_| {
                let (tx, rx) = bounded(lane_capacity.max(1));
                Lane { tx, rx }
            })
            .collect();
        Self { lanes, stats }
    }

    pub fn lanes(&self) -> usize {
        self.lanes.len()
    }

    /// Receiving end of one lane, for its aggregation worker.
    pub fn receiver(&self, lane: usize) -> Receiver<FlowEvent> {
        self.lanes[lane].rx.clone()
    }

    /// Lane index for an event. Both directions of a connection map to the same lane.
    pub fn lane_for(&self, event: &FlowEvent) -> usize {
        let mut hasher = DefaultHasher::new();
        ConnectionKey::from_event(event).hash(&mut hasher);
        (hasher.finish() % self.lanes.len() as u64) as usize
    }

    /// Enqueue without blocking, discarding the lane's oldest event if it is full.
    pub fn push(&self, event: FlowEvent) {
        let lane = &self.lanes[self.lane_for(&event)];
        let mut pending = event;
        loop {
            match lane.tx.try_send(pending) {
                Ok(()) => return,
                Err(TrySendError::Full(back)) => {
                    if lane.rx.try_recv().is_ok() {
                        self.stats.record_overflow();
                    }
                    pending = back;
                }
                // The lane owns a receiver, so it cannot disconnect while `self` lives.
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
    }

    /// Events currently queued across all lanes.
    pub fn len(&self) -> usize {
        self.lanes.iter().map(|lane| lane.rx.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::Protocol;
    use chrono::Utc;
    use std::net::{IpAddr, Ipv4Addr};

    fn event(src_last: u8, src_port: u16, length: u64) -> FlowEvent {
        FlowEvent {
            timestamp: Utc::now(),
            src: IpAddr::V4(Ipv4Addr::new(10, 0, 0, src_last)),
            dst: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 200)),
            src_port,
            dst_port: 443,
            protocol: Protocol::Tcp,
            length,
        }
    }

    fn reversed(e: &FlowEvent) -> FlowEvent {
        FlowEvent {
            src: e.dst,
            dst: e.src,
            src_port: e.dst_port,
            dst_port: e.src_port,
            ..e.clone()
        }
    }

    #[test]
    fn test_both_directions_share_a_lane() {
        let queue = IngestQueue::new(8, 16, Arc::new(PipelineStats::default()));
        for i in 1..50u8 {
            let forward = event(i, 40000 + i as u16, 60);
            assert_eq!(queue.lane_for(&forward), queue.lane_for(&reversed(&forward)));
        }
    }

    #[test]
    fn test_full_lane_drops_oldest() {
        let stats = Arc::new(PipelineStats::default());
        let queue = IngestQueue::new(1, 3, Arc::clone(&stats));

        for length in 1..=5 {
            queue.push(event(1, 1000, length));
        }

        assert_eq!(queue.len(), 3);
        assert_eq!(stats.counters().queue_overflows, 2);

        let rx = queue.receiver(0);
        let kept: Vec<u64> = rx.try_iter().map(|e| e.length).collect();
        assert_eq!(kept, vec![3, 4, 5]);
    }

    #[test]
    fn test_lane_preserves_arrival_order() {
        let queue = IngestQueue::new(4, 100, Arc::new(PipelineStats::default()));
        let first = event(7, 5555, 1);
        let lane = queue.lane_for(&first);

        queue.push(first.clone());
        queue.push(reversed(&event(7, 5555, 2)));
        queue.push(event(7, 5555, 3));

        let lengths: Vec<u64> = queue.receiver(lane).try_iter().map(|e| e.length).collect();
        assert_eq!(lengths, vec![1, 2, 3]);
    }

    #[test]
    fn test_zero_sizes_are_clamped() {
        let queue = IngestQueue::new(0, 0, Arc::new(PipelineStats::default()));
        assert_eq!(queue.lanes(), 1);
        queue.push(event(1, 1, 1));
        assert_eq!(queue.len(), 1);
        assert!(!queue.is_empty());
    }
}
