//! LRU-K replacement policy.
//!
//! The victim is the evictable frame whose K-th most recent access lies
//! furthest in the past. Frames with fewer than K recorded accesses have
//! infinite backward K-distance and are preferred, oldest first access
//! first. Nodes live in a plain map keyed by frame id; no intrusive lists.

use crate::storage::buffer::replacer::{FrameId, Replacer};
use std::collections::{HashMap, VecDeque};

#[derive(Debug, Default)]
struct LruKNode {
    /// Up to the K most recent access timestamps, oldest first. While the
    /// frame has seen fewer than K accesses the front is its first access
    /// ever; afterwards the front is exactly the K-th most recent one.
    history: VecDeque<u64>,
    evictable: bool,
}

pub struct LruKReplacer {
    nodes: HashMap<FrameId, LruKNode>,
    current_timestamp: u64,
    k: usize,
    evictable_count: usize,
}

impl LruKReplacer {
    pub fn new(num_frames: usize, k: usize) -> Self {
        assert!(k >= 1);
        Self {
            nodes: HashMap::with_capacity(num_frames),
            current_timestamp: 0,
            k,
            evictable_count: 0,
        }
    }

    pub fn k(&self) -> usize {
        self.k
    }
}

impl Replacer for LruKReplacer {
    fn record_access(&mut self, frame_id: FrameId) {
        let timestamp = self.current_timestamp;
        self.current_timestamp += 1;

        let node = self.nodes.entry(frame_id).or_default();
        node.history.push_back(timestamp);
        if node.history.len() > self.k {
            node.history.pop_front();
        }
    }

    fn set_evictable(&mut self, frame_id: FrameId, evictable: bool) {
        if let Some(node) = self.nodes.get_mut(&frame_id) {
            if node.evictable != evictable {
                node.evictable = evictable;
                if evictable {
                    self.evictable_count += 1;
                } else {
                    self.evictable_count -= 1;
                }
            }
        }
    }

    fn evict(&mut self) -> Option<FrameId> {
        // Infinite backward K-distance first: among frames with fewer than
        // K accesses, the earliest first access wins. Otherwise the
        // earliest K-th most recent access wins.
        let mut victim: Option<(bool, u64, FrameId)> = None;
        for (&frame_id, node) in &self.nodes {
            if !node.evictable {
                continue;
            }
            let infinite = node.history.len() < self.k;
            let stamp = *node.history.front().expect("tracked frame has an access");
            let candidate = (infinite, stamp, frame_id);
            victim = match victim {
                None => Some(candidate),
                Some(best) => {
                    let better = (infinite && !best.0)
                        || (infinite == best.0 && stamp < best.1);
                    if better {
                        Some(candidate)
                    } else {
                        Some(best)
                    }
                }
            };
        }

        let (_, _, frame_id) = victim?;
        self.nodes.remove(&frame_id);
        self.evictable_count -= 1;
        log::trace!("lru-k evicting frame {frame_id}");
        Some(frame_id)
    }

    fn remove(&mut self, frame_id: FrameId) {
        match self.nodes.get(&frame_id) {
            None => {}
            Some(node) if node.evictable => {
                self.nodes.remove(&frame_id);
                self.evictable_count -= 1;
            }
            Some(_) => panic!("removing non-evictable frame {frame_id} from the replacer"),
        }
    }

    fn size(&self) -> usize {
        self.evictable_count
    }
}
