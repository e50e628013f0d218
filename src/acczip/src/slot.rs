use std::sync::atomic::{AtomicU8, AtomicU64, AtomicUsize, Ordering};

use super::*;

/// Life cycle of one request slot.
///
/// ```text
/// Free ──reserve──> Submitted ──buffers ready──> InFlight ──completion──> Completed
///  ^                    │                          │                          │
///  └──────abort─────────┘<────undo / reclaim───────┘<─────────consume─────────┘
/// ```
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Free = 0,
    Submitted = 1,
    InFlight = 2,
    Completed = 3,
}

impl SlotState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Submitted,
            2 => Self::InFlight,
            3 => Self::Completed,
            _ => Self::Free,
        }
    }

    pub fn can_transition(self, next: SlotState) -> bool {
        matches!(
            (self, next),
            (Self::Free, Self::Submitted)
                | (Self::Submitted, Self::InFlight)
                | (Self::Submitted, Self::Free)
                | (Self::InFlight, Self::Completed)
                | (Self::InFlight, Self::Free)
                | (Self::Completed, Self::Free)
        )
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct SlotMeta {
    pub src_offset: usize,
    pub src_len: usize,
    pub raw_len: usize,
    pub crc32: u32,
    pub header: Option<BlockHeader>,
    pub outcome: Option<CompletionOutcome>,
}

#[derive(Debug)]
pub(crate) struct SlotBuffers {
    pub src: PinnedBuf,
    pub dst: PinnedBuf,
}

#[derive(Debug)]
pub(crate) struct Slot {
    state: AtomicU8,
    seq: AtomicU64,
    owner: AtomicU64,
    pub meta: Mutex<SlotMeta>,
    pub buffers: Mutex<SlotBuffers>,
}

impl Slot {
    fn new(memory: &Arc<MemoryTracker>, capacity: usize) -> Result<Self, AcczipError> {
        Ok(Self {
            state: AtomicU8::new(SlotState::Free as u8),
            seq: AtomicU64::new(0),
            owner: AtomicU64::new(0),
            meta: Mutex::new(SlotMeta::default()),
            buffers: Mutex::new(SlotBuffers {
                src: memory.alloc_pinned(capacity)?,
                dst: memory.alloc_pinned(capacity)?,
            }),
        })
    }

    pub fn state(&self) -> SlotState {
        SlotState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn seq(&self) -> u64 {
        self.seq.load(Ordering::Acquire)
    }

    pub fn owner(&self) -> u64 {
        self.owner.load(Ordering::Acquire)
    }

    pub fn transition(&self, from: SlotState, to: SlotState) -> Result<(), AcczipError> {
        if !from.can_transition(to) {
            return Err(AcczipError::Internal("invalid slot transition"));
        }
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| AcczipError::Internal("slot changed state concurrently"))
    }

    fn force_free(&self) {
        self.state.store(SlotState::Free as u8, Ordering::Release);
    }
}

#[derive(Debug)]
pub(crate) struct SlotTable {
    slots: Box<[Slot]>,
    cursor: AtomicUsize,
    capacity: usize,
}

impl SlotTable {
    pub fn new(
        memory: &Arc<MemoryTracker>,
        count: usize,
        capacity: usize,
    ) -> Result<Self, AcczipError> {
        let slots = (0..count)
            .map(|_| Slot::new(memory, capacity))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            slots: slots.into_boxed_slice(),
            cursor: AtomicUsize::new(0),
            capacity,
        })
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn get(&self, id: SlotId) -> Option<&Slot> {
        self.slots.get(id.0)
    }

    pub fn reserve(&self, owner: u64, seq: u64) -> Option<SlotId> {
        let count = self.slots.len();
        if count == 0 {
            return None;
        }
        let start = self.cursor.load(Ordering::Relaxed) % count;
        for offset in 0..count {
            let index = (start + offset) % count;
            let slot = &self.slots[index];
            if slot
                .state
                .compare_exchange(
                    SlotState::Free as u8,
                    SlotState::Submitted as u8,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                slot.owner.store(owner, Ordering::Release);
                slot.seq.store(seq, Ordering::Release);
                self.cursor.store(index + 1, Ordering::Relaxed);
                return Some(SlotId(index));
            }
        }
        None
    }

    pub fn find_ready(&self, owner: u64, seq: u64) -> Option<SlotId> {
        self.slots
            .iter()
            .position(|slot| {
                slot.state() == SlotState::Completed && slot.owner() == owner && slot.seq() == seq
            })
            .map(SlotId)
    }

    pub fn completed_by(&self, owner: u64) -> Vec<SlotId> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.state() == SlotState::Completed && slot.owner() == owner)
            .map(|(index, _)| SlotId(index))
            .collect()
    }

    pub fn reclaim(&self, owner: u64) -> usize {
        let mut reclaimed = 0;
        for slot in self.slots.iter() {
            let state = slot.state();
            if slot.owner() == owner && matches!(state, SlotState::InFlight | SlotState::Completed)
            {
                slot.force_free();
                reclaimed += 1;
            }
        }
        reclaimed
    }

    pub fn busy_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.state() != SlotState::Free)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::thread;

    use super::*;

    #[test]
    fn transition_table_matches_life_cycle() {
        use SlotState::*;
        assert!(Free.can_transition(Submitted));
        assert!(Submitted.can_transition(InFlight));
        assert!(InFlight.can_transition(Completed));
        assert!(Completed.can_transition(Free));
        assert!(InFlight.can_transition(Free));
        assert!(!Free.can_transition(Completed));
        assert!(!Completed.can_transition(InFlight));
        assert!(!Free.can_transition(InFlight));
    }

    #[test]
    fn reserved_slot_is_found_once_completed() {
        let memory = MemoryTracker::new();
        let table = SlotTable::new(&memory, 2, 64).expect("table should build");
        let id = table.reserve(7, 0).expect("slot should be free");
        let slot = table.get(id).expect("slot exists");
        assert_eq!(table.find_ready(7, 0), None);

        slot.transition(SlotState::Submitted, SlotState::InFlight)
            .expect("submit transition");
        slot.transition(SlotState::InFlight, SlotState::Completed)
            .expect("completion transition");
        assert_eq!(table.find_ready(7, 0), Some(id));
        assert_eq!(table.find_ready(8, 0), None);
        assert_eq!(table.find_ready(7, 1), None);

        slot.transition(SlotState::Completed, SlotState::Free)
            .expect("consume transition");
        assert_eq!(table.busy_count(), 0);
    }

    #[test]
    fn invalid_transition_is_refused() {
        let memory = MemoryTracker::new();
        let table = SlotTable::new(&memory, 1, 64).expect("table should build");
        let slot = table.get(SlotId(0)).expect("slot exists");
        assert!(slot.transition(SlotState::Free, SlotState::Completed).is_err());
        assert!(slot.transition(SlotState::InFlight, SlotState::Completed).is_err());
        assert_eq!(slot.state(), SlotState::Free);
    }

    #[test]
    fn table_exhaustion_and_reclaim() {
        let memory = MemoryTracker::new();
        let table = SlotTable::new(&memory, 3, 64).expect("table should build");
        for seq in 0..3 {
            let id = table.reserve(1, seq).expect("slot should be free");
            table
                .get(id)
                .expect("slot exists")
                .transition(SlotState::Submitted, SlotState::InFlight)
                .expect("submit transition");
        }
        assert_eq!(table.reserve(1, 3), None);
        assert_eq!(table.reclaim(2), 0);
        assert_eq!(table.reclaim(1), 3);
        assert!(table.reserve(1, 3).is_some());
    }

    #[test]
    fn concurrent_reservations_never_share_a_slot() {
        let memory = MemoryTracker::new();
        let table = SlotTable::new(&memory, 8, 32).expect("table should build");

        for _round in 0..50 {
            let claimed = thread::scope(|scope| {
                let handles = (0..6_u64)
                    .map(|owner| {
                        let table = &table;
                        scope.spawn(move || {
                            let mut mine = Vec::new();
                            while let Some(id) = table.reserve(owner + 1, mine.len() as u64) {
                                mine.push(id);
                            }
                            mine
                        })
                    })
                    .collect::<Vec<_>>();
                handles
                    .into_iter()
                    .flat_map(|handle| handle.join().expect("reserver should not panic"))
                    .collect::<Vec<_>>()
            });

            let unique = claimed.iter().copied().collect::<HashSet<_>>();
            assert_eq!(unique.len(), claimed.len());
            assert_eq!(claimed.len(), 8);

            for id in claimed {
                table
                    .get(id)
                    .expect("slot exists")
                    .transition(SlotState::Submitted, SlotState::Free)
                    .expect("abort transition");
            }
        }
    }
}
