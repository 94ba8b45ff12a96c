//! Transmitter module - outbound handoff to the transport writer
//!
//! The event loop owns all transaction state; other tasks and threads only
//! ever hand finished byte chunks to the writer through this channel.

use tokio::sync::mpsc;
use tracing::trace;

use crate::codec::MAX_FRAME_LEN;
use crate::errors::{Result, SyncError};

/// Transmitter - cloneable sending half of the outbound byte queue
#[derive(Debug, Clone)]
pub struct Transmitter {
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl Transmitter {
    /// Create a transmitter and the queue the transport writer drains
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queue one encoded frame for transmission
    ///
    /// # Returns
    /// Number of bytes queued, or `LinkClosed` when the writer is gone
    pub fn send_raw(&self, bytes: Vec<u8>) -> Result<usize> {
        if bytes.len() > MAX_FRAME_LEN {
            return Err(SyncError::Internal(format!(
                "refusing to send {} bytes, largest frame is {MAX_FRAME_LEN}",
                bytes.len()
            )));
        }

        let len = bytes.len();
        self.tx.send(bytes).map_err(|_| SyncError::LinkClosed)?;
        trace!(len, "frame queued");
        Ok(len)
    }

    /// Queue several frames in order (stops at the first failure)
    pub fn send_batch(&self, chunks: Vec<Vec<u8>>) -> Result<usize> {
        chunks.into_iter().map(|bytes| self.send_raw(bytes)).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_from_another_thread() {
        let (transmitter, mut rx) = Transmitter::channel();
        let remote = transmitter.clone();
        std::thread::spawn(move || remote.send_raw(vec![1, 2, 3]))
            .join()
            .unwrap()
            .unwrap();
        assert_eq!(rx.try_recv().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_oversized_rejected() {
        let (transmitter, _rx) = Transmitter::channel();
        let result = transmitter.send_raw(vec![0; MAX_FRAME_LEN + 1]);
        assert!(matches!(result, Err(SyncError::Internal(_))));
    }

    #[test]
    fn test_closed_writer() {
        let (transmitter, rx) = Transmitter::channel();
        drop(rx);
        assert_eq!(transmitter.send_raw(vec![0; 4]), Err(SyncError::LinkClosed));
    }

    #[test]
    fn test_batch_counts_bytes() {
        let (transmitter, mut rx) = Transmitter::channel();
        let sent = transmitter.send_batch(vec![vec![0; 10], vec![0; 12]]).unwrap();
        assert_eq!(sent, 22);
        assert_eq!(rx.try_recv().unwrap().len(), 10);
        assert_eq!(rx.try_recv().unwrap().len(), 12);
    }
}
