//! Coalesces many individual gene acknowledgments into few outbound packets.
//!
//! Acks are enqueued per connection as genes arrive; the first ack for a
//! connection arms a flush deadline (`now + ack_delay`), and the send cycle
//! drains connections whose deadline passed, in arrival order. All queue
//! vectors are pooled and reused across flush cycles so steady load does not
//! allocate.

use crate::frame::{AckEntry, Frame, ACK_MARGIN, MAX_FRAME_LEN};
use bytes::BytesMut;
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::sync::Mutex;
use tracing::trace;

/// Identifies the local connection an ack batch belongs to. Connection ids
/// are unique per side, so the side flag disambiguates paired connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AckKey {
    pub connection_id: u64,
    pub server_side: bool,
}

/// A pending acknowledgment, not yet serialized.
#[derive(Debug, PartialEq, Eq)]
pub enum AckPending {
    /// The whole transmission arrived ("burst").
    Burst { transmission_id: u32 },
    /// Individual gene serials, range-compressed at flush time.
    Block {
        transmission_id: u32,
        max_receive_position: i32,
        successive_received_position: i32,
        serials: Vec<i32>,
    },
}

struct PendingAcks {
    deadline_mics: u64,
    entries: Vec<AckPending>,
}

struct AckBufferInner {
    pending: FxHashMap<AckKey, PendingAcks>,
    /// flush order = order of first enqueue
    order: VecDeque<AckKey>,
    free_entry_lists: Vec<Vec<AckPending>>,
    free_serial_lists: Vec<Vec<i32>>,
}

const POOL_LIMIT: usize = 64;

pub struct AckBuffer {
    ack_delay_mics: u64,
    inner: Mutex<AckBufferInner>,
}

impl AckBuffer {
    pub fn new(ack_delay_mics: u64) -> AckBuffer {
        AckBuffer {
            ack_delay_mics,
            inner: Mutex::new(AckBufferInner {
                pending: FxHashMap::default(),
                order: VecDeque::new(),
                free_entry_lists: Vec::new(),
                free_serial_lists: Vec::new(),
            }),
        }
    }

    /// Marks a whole transmission as fully received. Idempotent within a
    /// flush cycle: a transmission already carrying a pending burst marker is
    /// not enqueued again.
    pub fn ack_burst(&self, key: AckKey, transmission_id: u32, now_mics: u64) {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        Self::ensure_pending(inner, key, now_mics + self.ack_delay_mics);
        let pending = inner.pending.get_mut(&key).unwrap();

        let already_pending = pending.entries.iter().any(
            |e| matches!(e, AckPending::Burst { transmission_id: id } if *id == transmission_id),
        );
        if !already_pending {
            pending.entries.push(AckPending::Burst { transmission_id });
        }
    }

    /// Appends one gene serial to the transmission's pending-ack queue,
    /// creating the (pooled) queue on first use.
    pub fn ack_block(
        &self,
        key: AckKey,
        transmission_id: u32,
        gene_serial: i32,
        max_receive_position: i32,
        successive_received_position: i32,
        now_mics: u64,
    ) {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        Self::ensure_pending(inner, key, now_mics + self.ack_delay_mics);
        let pending = inner.pending.get_mut(&key).unwrap();

        for entry in pending.entries.iter_mut().rev() {
            if let AckPending::Block {
                transmission_id: id,
                max_receive_position: max_pos,
                successive_received_position: successive,
                serials,
            } = entry
            {
                if *id == transmission_id {
                    serials.push(gene_serial);
                    *max_pos = (*max_pos).max(max_receive_position);
                    *successive = (*successive).max(successive_received_position);
                    return;
                }
            }
        }

        let mut serials = inner.free_serial_lists.pop().unwrap_or_default();
        serials.push(gene_serial);
        pending.entries.push(AckPending::Block {
            transmission_id,
            max_receive_position,
            successive_received_position,
            serials,
        });
    }

    /// Creates the per-connection pending batch (arming its flush deadline)
    /// if it does not exist yet.
    fn ensure_pending(inner: &mut AckBufferInner, key: AckKey, deadline_mics: u64) {
        if !inner.pending.contains_key(&key) {
            let entries = inner.free_entry_lists.pop().unwrap_or_default();
            inner.pending.insert(
                key,
                PendingAcks {
                    deadline_mics,
                    entries,
                },
            );
            inner.order.push_back(key);
        }
    }

    /// Dequeues all connections whose flush deadline has passed, in arrival
    /// order. The caller serializes the returned batches outside the buffer's
    /// lock and hands them back through [`AckBuffer::serialize_and_recycle`].
    pub fn drain_due(&self, now_mics: u64) -> Vec<(AckKey, Vec<AckPending>)> {
        let mut inner = self.inner.lock().unwrap();
        let mut due = Vec::new();

        while let Some(&key) = inner.order.front() {
            let deadline = match inner.pending.get(&key) {
                Some(p) => p.deadline_mics,
                None => {
                    inner.order.pop_front();
                    continue;
                }
            };
            if deadline > now_mics {
                break;
            }
            inner.order.pop_front();
            let pending = inner.pending.remove(&key).unwrap();
            due.push((key, pending.entries));
        }
        due
    }

    /// Serializes a drained batch into complete ack frames (frame type tag
    /// included), compressing gene serials into maximal half-open ranges. A
    /// new frame is started whenever the remaining space falls below
    /// [`ACK_MARGIN`], so one batch may span several packets. The batch's
    /// vectors are returned to the free lists afterwards.
    pub fn serialize_and_recycle(&self, mut entries: Vec<AckPending>) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        let mut current = new_ack_frame();

        for entry in &mut entries {
            match entry {
                AckPending::Burst { transmission_id } => {
                    let wire = AckEntry::Burst {
                        transmission_id: *transmission_id,
                    };
                    if current.len() + wire.serialized_len() > MAX_FRAME_LEN - ACK_MARGIN {
                        frames.push(current.to_vec());
                        current = new_ack_frame();
                    }
                    wire.ser(&mut current);
                }
                AckPending::Block {
                    transmission_id,
                    max_receive_position,
                    successive_received_position,
                    serials,
                } => {
                    let ranges = compress_to_ranges(serials);
                    let mut remaining: &[(i32, i32)] = &ranges;

                    // a block entry restarts with its own header in every
                    // frame it spills into
                    loop {
                        if current.len() + 14 + 8 > MAX_FRAME_LEN - ACK_MARGIN {
                            frames.push(current.to_vec());
                            current = new_ack_frame();
                        }
                        let space_for_pairs =
                            (MAX_FRAME_LEN - ACK_MARGIN - current.len() - 14) / 8;
                        let take = remaining.len().min(space_for_pairs).min(u16::MAX as usize);

                        AckEntry::Block {
                            transmission_id: *transmission_id,
                            max_receive_position: *max_receive_position,
                            successive_received_position: *successive_received_position,
                            ranges: remaining[..take].to_vec(),
                        }
                        .ser(&mut current);
                        remaining = &remaining[take..];

                        if remaining.is_empty() {
                            break;
                        }
                    }
                }
            }
        }

        if current.len() > 2 {
            frames.push(current.to_vec());
        }
        trace!("serialized ack batch into {} frame(s)", frames.len());

        self.recycle(entries);
        frames
    }

    fn recycle(&self, mut entries: Vec<AckPending>) {
        let mut inner = self.inner.lock().unwrap();
        for entry in entries.drain(..) {
            if let AckPending::Block { mut serials, .. } = entry {
                if inner.free_serial_lists.len() < POOL_LIMIT {
                    serials.clear();
                    inner.free_serial_lists.push(serials);
                }
            }
        }
        if inner.free_entry_lists.len() < POOL_LIMIT {
            inner.free_entry_lists.push(entries);
        }
    }
}

fn new_ack_frame() -> BytesMut {
    let mut buf = BytesMut::new();
    Frame::Ack(Vec::new()).ser(&mut buf);
    buf
}

/// Sorts and dedupes the serials, then merges consecutive runs into maximal
/// half-open `(start, end)` ranges.
pub fn compress_to_ranges(serials: &mut Vec<i32>) -> Vec<(i32, i32)> {
    serials.sort_unstable();
    serials.dedup();

    let mut ranges: Vec<(i32, i32)> = Vec::new();
    for &serial in serials.iter() {
        match ranges.last_mut() {
            Some((_, end)) if *end == serial => *end = serial + 1,
            _ => ranges.push((serial, serial + 1)),
        }
    }
    ranges
}
