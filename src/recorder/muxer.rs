//! Packet multiplexer
//!
//! Stream workers hand compressed packets to a shared queue; a dedicated
//! thread writes them into the container in arrival order.

use crate::recorder::codec::{ContainerWriter, EncodedPacket};
use crate::utils::{RecorderError, RecorderResult};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

pub type SharedContainer = Arc<Mutex<Box<dyn ContainerWriter>>>;

struct PacketQueueInner {
    packets: VecDeque<EncodedPacket>,
    closed: bool,
}

/// Unbounded so encoder threads never block on the writer
pub struct PacketQueue {
    inner: Mutex<PacketQueueInner>,
    not_empty: Condvar,
}

impl PacketQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(PacketQueueInner {
                packets: VecDeque::new(),
                closed: false,
            }),
            not_empty: Condvar::new(),
        }
    }

    /// Returns false once the queue is closed
    pub fn push(&self, packet: EncodedPacket) -> bool {
        let mut inner = self.inner.lock();
        if inner.closed {
            return false;
        }
        inner.packets.push_back(packet);
        self.not_empty.notify_one();
        true
    }

    /// Blocks until a packet is available; `None` once closed and drained
    pub fn pop(&self) -> Option<EncodedPacket> {
        let mut inner = self.inner.lock();
        loop {
            if let Some(packet) = inner.packets.pop_front() {
                return Some(packet);
            }
            if inner.closed {
                return None;
            }
            self.not_empty.wait(&mut inner);
        }
    }

    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.not_empty.notify_all();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for PacketQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Cloneable sender used by stream processors
#[derive(Clone)]
pub struct MuxerHandle {
    queue: Arc<PacketQueue>,
}

impl MuxerHandle {
    pub fn send(&self, packet: EncodedPacket) {
        if !self.queue.push(packet) {
            tracing::debug!("Muxer closed, packet dropped");
        }
    }
}

pub struct Muxer {
    container: SharedContainer,
    queue: Arc<PacketQueue>,
    packets_written: Arc<AtomicU64>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Muxer {
    pub fn new(container: Box<dyn ContainerWriter>) -> Self {
        Self {
            container: Arc::new(Mutex::new(container)),
            queue: Arc::new(PacketQueue::new()),
            packets_written: Arc::new(AtomicU64::new(0)),
            thread: Mutex::new(None),
        }
    }

    pub fn handle(&self) -> MuxerHandle {
        MuxerHandle {
            queue: self.queue.clone(),
        }
    }

    pub fn container(&self) -> &SharedContainer {
        &self.container
    }

    pub fn packets_written(&self) -> u64 {
        self.packets_written.load(Ordering::SeqCst)
    }

    pub fn start(&self) -> RecorderResult<()> {
        let mut thread = self.thread.lock();
        if thread.is_some() {
            return Err(RecorderError::InvalidState("muxer already started".to_string()));
        }

        let container = self.container.clone();
        let queue = self.queue.clone();
        let written = self.packets_written.clone();

        let handle = std::thread::Builder::new()
            .name("muxer".to_string())
            .spawn(move || {
                while let Some(packet) = queue.pop() {
                    let stream = packet.stream_index;
                    match container.lock().write_packet(packet) {
                        Ok(()) => {
                            written.fetch_add(1, Ordering::SeqCst);
                        }
                        Err(e) => tracing::warn!("Failed to write packet on stream {}: {}", stream, e),
                    }
                }
                tracing::debug!("Muxer thread finished");
            })?;

        *thread = Some(handle);
        tracing::debug!("Muxer started");
        Ok(())
    }

    /// Write every queued packet, then stop the thread
    pub fn stop(&self) {
        self.queue.close();
        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::error!("Muxer thread panicked");
            }
        }
    }
}

impl Drop for Muxer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryContainer;

    #[test]
    fn test_queued_packets_are_written_on_stop() {
        let (container, record) = MemoryContainer::new();
        let muxer = Muxer::new(Box::new(container));
        let handle = muxer.handle();

        handle.send(EncodedPacket::new(0, 10, vec![1]));
        handle.send(EncodedPacket::new(10, 10, vec![2]));
        muxer.start().unwrap();
        muxer.stop();

        assert_eq!(muxer.packets_written(), 2);
        let pts: Vec<i64> = record.lock().packets.iter().map(|p| p.pts_us).collect();
        assert_eq!(pts, vec![0, 10]);
    }

    #[test]
    fn test_closed_queue_rejects_packets() {
        let queue = PacketQueue::new();
        queue.close();
        assert!(!queue.push(EncodedPacket::new(0, 0, Vec::new())));
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_start_twice_fails() {
        let (container, _) = MemoryContainer::new();
        let muxer = Muxer::new(Box::new(container));
        muxer.start().unwrap();
        assert!(muxer.start().is_err());
    }
}
