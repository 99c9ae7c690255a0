use log::debug;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;

/// Index of a slot in the buffer pool
pub type FrameId = usize;

/// Eviction policy of the buffer pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplacementAlgorithm {
    /// Evict the least recently used slot
    #[default]
    Lru,
    /// Evict the most recently used slot
    Mru,
    /// Evict in the order slots were filled
    Fifo,
    /// Second-chance sweep over reference bits
    Clock,
}

impl fmt::Display for ReplacementAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReplacementAlgorithm::Lru => "lru",
            ReplacementAlgorithm::Mru => "mru",
            ReplacementAlgorithm::Fifo => "fifo",
            ReplacementAlgorithm::Clock => "clock",
        };
        f.write_str(name)
    }
}

impl FromStr for ReplacementAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "lru" => Ok(ReplacementAlgorithm::Lru),
            "mru" => Ok(ReplacementAlgorithm::Mru),
            "fifo" => Ok(ReplacementAlgorithm::Fifo),
            "clock" => Ok(ReplacementAlgorithm::Clock),
            other => Err(format!("unknown replacement algorithm: {}", other)),
        }
    }
}

enum Policy {
    /// Recency order shared by LRU and MRU; front of the cache is most recent
    Recency(LruCache<FrameId, ()>),
    Fifo(VecDeque<FrameId>),
    Clock {
        /// `None` for slots that hold nothing evictable
        ref_bits: Vec<Option<bool>>,
        hand: usize,
    },
}

/// Picks eviction victims among the frames it tracks.
///
/// The replacer only knows frame ids. Pin state lives in the buffer pool and
/// is passed to `victim` as a predicate, so a pinned frame can never be
/// returned whatever the policy. Victim choice depends only on the sequence
/// of `insert`/`touch`/`remove` calls.
pub struct Replacer {
    algorithm: ReplacementAlgorithm,
    policy: Policy,
}

impl Replacer {
    pub fn new(algorithm: ReplacementAlgorithm, capacity: usize) -> Self {
        let policy = match algorithm {
            ReplacementAlgorithm::Lru | ReplacementAlgorithm::Mru => {
                Policy::Recency(LruCache::unbounded())
            }
            ReplacementAlgorithm::Fifo => Policy::Fifo(VecDeque::with_capacity(capacity)),
            ReplacementAlgorithm::Clock => Policy::Clock {
                ref_bits: vec![None; capacity],
                hand: 0,
            },
        };
        Self { algorithm, policy }
    }

    pub fn algorithm(&self) -> ReplacementAlgorithm {
        self.algorithm
    }

    /// Start tracking a frame that was just bound to a page
    pub fn insert(&mut self, frame: FrameId) {
        match &mut self.policy {
            Policy::Recency(order) => {
                order.put(frame, ());
            }
            Policy::Fifo(queue) => {
                if !queue.contains(&frame) {
                    queue.push_back(frame);
                }
            }
            Policy::Clock { ref_bits, .. } => ref_bits[frame] = Some(true),
        }
    }

    /// Record a hit on a tracked frame
    pub fn touch(&mut self, frame: FrameId) {
        match &mut self.policy {
            Policy::Recency(order) => {
                order.put(frame, ());
            }
            // Insertion order is all FIFO cares about
            Policy::Fifo(_) => {}
            Policy::Clock { ref_bits, .. } => {
                if let Some(bit) = ref_bits[frame].as_mut() {
                    *bit = true;
                }
            }
        }
    }

    /// Stop tracking a frame whose binding was released
    pub fn remove(&mut self, frame: FrameId) {
        match &mut self.policy {
            Policy::Recency(order) => {
                order.pop(&frame);
            }
            Policy::Fifo(queue) => queue.retain(|&f| f != frame),
            Policy::Clock { ref_bits, .. } => ref_bits[frame] = None,
        }
    }

    /// Choose and stop tracking a victim for which `is_pinned` is false.
    ///
    /// Returns `None` when every tracked frame is pinned.
    pub fn victim<F>(&mut self, is_pinned: F) -> Option<FrameId>
    where
        F: Fn(FrameId) -> bool,
    {
        let victim = match &mut self.policy {
            Policy::Recency(order) => {
                let found = if self.algorithm == ReplacementAlgorithm::Mru {
                    order.iter().map(|(&f, _)| f).find(|&f| !is_pinned(f))
                } else {
                    order.iter().rev().map(|(&f, _)| f).find(|&f| !is_pinned(f))
                };
                if let Some(frame) = found {
                    order.pop(&frame);
                }
                found
            }
            Policy::Fifo(queue) => {
                let position = queue.iter().position(|&f| !is_pinned(f));
                position.and_then(|p| queue.remove(p))
            }
            Policy::Clock { ref_bits, hand } => {
                let len = ref_bits.len();
                let mut found = None;
                // Two sweeps: the first may only clear reference bits
                for _ in 0..2 * len {
                    let frame = *hand;
                    *hand = (*hand + 1) % len;
                    let bit = ref_bits[frame];
                    match bit {
                        Some(_) if is_pinned(frame) => {}
                        Some(true) => ref_bits[frame] = Some(false),
                        Some(false) => {
                            ref_bits[frame] = None;
                            found = Some(frame);
                            break;
                        }
                        None => {}
                    }
                }
                found
            }
        };

        if victim.is_none() {
            debug!("{} replacer found no unpinned victim", self.algorithm);
        }
        victim
    }

    /// Forget every tracked frame
    pub fn clear(&mut self) {
        match &mut self.policy {
            Policy::Recency(order) => order.clear(),
            Policy::Fifo(queue) => queue.clear(),
            Policy::Clock { ref_bits, hand } => {
                ref_bits.iter_mut().for_each(|bit| *bit = None);
                *hand = 0;
            }
        }
    }
}
