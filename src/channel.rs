//! Per-connection channel state: receive buffer, outbound rolling counter and
//! inbound loss accounting.

use std::collections::HashMap;

use tracing::debug;

use crate::codec::{self, Frame, FrameBuffer};

/// Loss statistics snapshot, emitted once per stats window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinkStats {
    pub received: u64,
    pub lost: u64,
    /// Exponentially smoothed loss rate in percent
    pub loss_percent: f64,
}

/// State owned by exactly one vehicle connection.
#[derive(Debug, Clone)]
pub struct ChannelState {
    buffer: FrameBuffer,
    tx_sequence: u8,
    last_seen: HashMap<u16, u8>,
    received: u64,
    lost: u64,
    loss_percent: f64,
    stats_window: u32,
    window_received: u64,
    window_lost: u64,
}

impl ChannelState {
    pub fn new(receive_buffer_capacity: usize, stats_window: u32) -> Self {
        Self {
            buffer: FrameBuffer::with_capacity(receive_buffer_capacity),
            tx_sequence: 0,
            last_seen: HashMap::new(),
            received: 0,
            lost: 0,
            loss_percent: 0.0,
            stats_window: stats_window.max(1),
            window_received: 0,
            window_lost: 0,
        }
    }

    /// Counter for the next outbound frame (post-incremented).
    pub fn next_sequence(&mut self) -> u8 {
        let sequence = self.tx_sequence;
        self.tx_sequence = sequence.wrapping_add(1);
        sequence
    }

    /// Feed raw transport bytes; returns the frames they completed.
    pub fn decode(&mut self, bytes: &[u8]) -> Vec<Frame> {
        codec::decode(&mut self.buffer, bytes)
    }

    /// Account one decoded frame. Returns a snapshot every `stats_window` frames.
    pub fn record(&mut self, frame: &Frame) -> Option<LinkStats> {
        let gap = match self.last_seen.insert(frame.source_id, frame.sequence) {
            Some(previous) => u64::from(frame.sequence.wrapping_sub(previous.wrapping_add(1))),
            None => 0,
        };

        self.received += 1;
        self.lost += gap;
        self.window_received += 1;
        self.window_lost += gap;

        if self.received % u64::from(self.stats_window) != 0 {
            return None;
        }

        let expected = self.window_received + self.window_lost;
        let instant = self.window_lost as f64 * 100.0 / expected as f64;
        self.loss_percent = 0.5 * instant + 0.5 * self.loss_percent;
        self.window_received = 0;
        self.window_lost = 0;

        let stats = self.stats();
        debug!(
            received = stats.received,
            lost = stats.lost,
            loss_percent = stats.loss_percent,
            "link statistics"
        );
        Some(stats)
    }

    pub fn stats(&self) -> LinkStats {
        LinkStats {
            received: self.received,
            lost: self.lost,
            loss_percent: self.loss_percent,
        }
    }

    pub fn received_count(&self) -> u64 {
        self.received
    }

    pub fn lost_count(&self) -> u64 {
        self.lost
    }

    pub fn pending_bytes(&self) -> usize {
        self.buffer.pending()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::MsgClass;

    fn frame_from(source: u16, sequence: u8) -> Frame {
        let mut frame = Frame::new(MsgClass::GeneralStatus, 0, source, 0, vec![]);
        frame.sequence = sequence;
        frame
    }

    #[test]
    fn test_rolling_counter_wraps() {
        let mut channel = ChannelState::new(256, 32);
        for expected in 0..=255u8 {
            assert_eq!(channel.next_sequence(), expected);
        }
        assert_eq!(channel.next_sequence(), 0);
    }

    #[test]
    fn test_first_frame_charges_no_loss() {
        let mut channel = ChannelState::new(256, 32);
        channel.record(&frame_from(1, 200));
        assert_eq!(channel.lost_count(), 0);
    }

    #[test]
    fn test_gap_across_wrap() {
        let mut channel = ChannelState::new(256, 32);
        channel.record(&frame_from(1, 254));
        channel.record(&frame_from(1, 2));
        // 255, 0 and 1 are missing
        assert_eq!(channel.lost_count(), 3);
    }

    #[test]
    fn test_sources_tracked_independently() {
        let mut channel = ChannelState::new(256, 32);
        channel.record(&frame_from(1, 10));
        channel.record(&frame_from(2, 50));
        channel.record(&frame_from(1, 11));
        channel.record(&frame_from(2, 51));
        assert_eq!(channel.lost_count(), 0);
        assert_eq!(channel.received_count(), 4);
    }

    #[test]
    fn test_stats_emitted_each_window() {
        let mut channel = ChannelState::new(256, 4);
        let mut snapshots = Vec::new();
        // every other counter value skipped: one lost per received after the first
        for i in 0..8u8 {
            if let Some(stats) = channel.record(&frame_from(9, i * 2)) {
                snapshots.push(stats);
            }
        }
        assert_eq!(snapshots.len(), 2);
        // window 1: 4 received, 3 lost -> 3/7 = 42.857%, smoothed with 0
        let first = 3.0 * 100.0 / 7.0 * 0.5;
        assert!((snapshots[0].loss_percent - first).abs() < 1e-9);
        // window 2: 4 received, 4 lost -> 50%
        let second = 0.5 * 50.0 + 0.5 * first;
        assert!((snapshots[1].loss_percent - second).abs() < 1e-9);
    }
}
