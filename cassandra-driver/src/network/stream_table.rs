//! Fixed capacity arena of stream ids, indexed by the id itself.

use std::collections::BTreeSet;
use std::time::Duration;

use tokio::time::Instant;

/// Smallest accepted stream table.
pub const MIN_STREAMS: usize = 128;
/// Largest stream table: ids `0..=32766`.
pub const MAX_STREAMS: usize = i16::MAX as usize;

enum Slot<H> {
    Free,
    Pending(H),
    // The caller gave up; the slot stays taken until the late response
    // shows up, so that it cannot be matched with a newer request.
    Abandoned(Instant),
}

/// What a response frame with a given stream id resolved to.
#[derive(Debug)]
pub(crate) enum Completion<H> {
    Pending(H),
    Abandoned,
    Free,
}

pub(crate) struct StreamTable<H> {
    slots: Box<[Slot<H>]>,
    used_bitmap: Box<[u64]>,
    abandoned_since: BTreeSet<(Instant, i16)>,
}

impl<H> StreamTable<H> {
    pub(crate) fn new(capacity: usize) -> Self {
        let capacity = capacity.clamp(MIN_STREAMS, MAX_STREAMS);
        let blocks = capacity.div_ceil(64);
        let mut used_bitmap = vec![0u64; blocks].into_boxed_slice();

        // Ids past the capacity are permanently marked as used.
        let tail_bits = capacity % 64;
        if tail_bits != 0 {
            used_bitmap[blocks - 1] = !0u64 << tail_bits;
        }

        Self {
            slots: (0..capacity).map(|_| Slot::Free).collect(),
            used_bitmap,
            abandoned_since: BTreeSet::new(),
        }
    }

    /// Takes the lowest free id. Gives the handler back if the table is full.
    pub(crate) fn allocate(&mut self, handler: H) -> Result<i16, H> {
        for (block_id, block) in self.used_bitmap.iter_mut().enumerate() {
            if *block != !0 {
                let off = block.trailing_ones() as usize;
                *block |= 1u64 << off;
                let stream_id = block_id * 64 + off;
                self.slots[stream_id] = Slot::Pending(handler);
                return Ok(stream_id as i16);
            }
        }
        Err(handler)
    }

    /// Frees the slot of a response that arrived.
    pub(crate) fn complete(&mut self, stream_id: i16) -> Completion<H> {
        let Some(slot) = usize::try_from(stream_id)
            .ok()
            .and_then(|idx| self.slots.get_mut(idx))
        else {
            return Completion::Free;
        };

        match std::mem::replace(slot, Slot::Free) {
            Slot::Free => Completion::Free,
            Slot::Pending(handler) => {
                self.release(stream_id);
                Completion::Pending(handler)
            }
            Slot::Abandoned(since) => {
                self.abandoned_since.remove(&(since, stream_id));
                self.release(stream_id);
                Completion::Abandoned
            }
        }
    }

    /// Marks a pending slot as abandoned and returns its handler.
    pub(crate) fn abandon(&mut self, stream_id: i16) -> Option<H> {
        let slot = self.slots.get_mut(usize::try_from(stream_id).ok()?)?;
        if !matches!(slot, Slot::Pending(_)) {
            return None;
        }
        let now = Instant::now();
        match std::mem::replace(slot, Slot::Abandoned(now)) {
            Slot::Pending(handler) => {
                self.abandoned_since.insert((now, stream_id));
                Some(handler)
            }
            _ => None,
        }
    }

    /// Counts slots abandoned for longer than `age`.
    pub(crate) fn abandoned_older_than(&self, age: Duration) -> usize {
        let Some(threshold) = Instant::now().checked_sub(age) else {
            return 0;
        };
        self.abandoned_since.range(..(threshold, i16::MAX)).count()
    }

    /// Removes every pending handler, leaving the table unusable.
    pub(crate) fn drain_pending(&mut self) -> impl Iterator<Item = H> + '_ {
        self.slots
            .iter_mut()
            .filter_map(|slot| match std::mem::replace(slot, Slot::Free) {
                Slot::Pending(handler) => Some(handler),
                _ => None,
            })
    }

    fn release(&mut self, stream_id: i16) {
        let idx = stream_id as usize;
        self.used_bitmap[idx / 64] &= !(1u64 << (idx % 64));
    }
}

#[cfg(test)]
impl<H> StreamTable<H> {
    fn capacity(&self) -> usize {
        self.slots.len()
    }

    // Taken slots, abandoned ones included.
    fn in_use(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| !matches!(slot, Slot::Free))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::{Completion, StreamTable, MAX_STREAMS, MIN_STREAMS};
    use assert_matches::assert_matches;
    use std::collections::HashSet;
    use std::time::Duration;

    #[test]
    fn allocation_is_bounded_and_unique() {
        let mut table = StreamTable::new(200);
        assert_eq!(table.capacity(), 200);

        let ids: HashSet<i16> = (0..200).map(|i| table.allocate(i).unwrap()).collect();
        assert_eq!(ids.len(), 200);
        assert!(ids.iter().all(|id| (0..200).contains(id)));
        assert_eq!(table.in_use(), 200);

        assert_matches!(table.allocate(1000), Err(1000));
    }

    #[test]
    fn capacity_is_clamped() {
        assert_eq!(StreamTable::<()>::new(1).capacity(), MIN_STREAMS);
        assert_eq!(StreamTable::<()>::new(usize::MAX).capacity(), MAX_STREAMS);

        let mut table = StreamTable::new(MAX_STREAMS);
        for _ in 0..MAX_STREAMS {
            table.allocate(()).unwrap();
        }
        // Id 32767 must never be handed out.
        assert!(table.allocate(()).is_err());
    }

    #[test]
    fn freed_ids_are_reused() {
        let mut table = StreamTable::new(MIN_STREAMS);
        let a = table.allocate("a").unwrap();
        let b = table.allocate("b").unwrap();
        assert_ne!(a, b);

        assert_matches!(table.complete(a), Completion::Pending("a"));
        assert_matches!(table.complete(a), Completion::Free);
        assert_eq!(table.allocate("c").unwrap(), a);
        assert_matches!(table.complete(-5), Completion::Free);
        assert_matches!(table.complete(i16::MAX), Completion::Free);
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_slot_is_held_until_response() {
        let mut table = StreamTable::new(MIN_STREAMS);
        let id = table.allocate(7).unwrap();

        assert_eq!(table.abandon(id), Some(7));
        assert_eq!(table.abandon(id), None);
        assert_eq!(table.in_use(), 1);

        // The slot cannot be handed out while abandoned.
        let other = table.allocate(8).unwrap();
        assert_ne!(other, id);

        assert_eq!(table.abandoned_older_than(Duration::from_secs(1)), 0);
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(table.abandoned_older_than(Duration::from_secs(1)), 1);

        assert_matches!(table.complete(id), Completion::Abandoned);
        assert_eq!(table.abandoned_older_than(Duration::from_secs(1)), 0);
        assert_eq!(table.in_use(), 1);
    }

    #[test]
    fn drain_returns_only_pending() {
        let mut table = StreamTable::new(MIN_STREAMS);
        let ids: Vec<i16> = (0..5).map(|i| table.allocate(i).unwrap()).collect();
        table.abandon(ids[1]);
        table.complete(ids[2]);

        let mut drained: Vec<i32> = table.drain_pending().collect();
        drained.sort();
        assert_eq!(drained, vec![0, 3, 4]);
    }
}
