//! Which input slots are online at which frame.
//!
//! Changes are keyed by effective frame. Several changes may share a frame
//! (a leave and a re-join of the same slot in one tick), so each entry holds
//! an owned vector ordered by event id. A parallel timeline caches the
//! resulting online mask after every change frame. Trimming keeps the newest
//! dropped change of every slot, so a slot that joined long ago still knows
//! when it came online.

use shared::protocol::{JleKind, JoinLeaveEvent};
use shared::{slot_mask, Frame, InputSlot, JleId, Timeline, MAX_INPUT_SLOTS};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotChange {
    pub event: JleId,
    pub slot: InputSlot,
    pub kind: JleKind,
}

impl SlotChange {
    pub fn from_event(event: &JoinLeaveEvent) -> Self {
        Self {
            event: event.id,
            slot: event.slot,
            kind: event.kind.clone(),
        }
    }

    fn apply(&self, mask: u8) -> u8 {
        match self.kind {
            JleKind::Join { .. } => mask | slot_mask(self.slot),
            JleKind::Leave => mask & !slot_mask(self.slot),
        }
    }
}

#[derive(Debug, Default)]
pub struct OnlineState {
    changes: Timeline<Vec<SlotChange>>,
    masks: Timeline<u8>,
    /// Mask in force before the oldest retained change.
    base: u8,
    /// Newest trimmed change per slot.
    retired: [Option<(Frame, SlotChange)>; MAX_INPUT_SLOTS],
}

impl OnlineState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mask_at(&self, frame: Frame) -> u8 {
        self.masks
            .last_at_or_before(frame)
            .map(|(_, mask)| *mask)
            .unwrap_or(self.base)
    }

    pub fn is_online(&self, slot: InputSlot, frame: Frame) -> bool {
        self.mask_at(frame) & slot_mask(slot) != 0
    }

    pub fn changes_at(&self, frame: Frame) -> &[SlotChange] {
        self.changes.get(frame).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Inserts a change; re-inserting the same event is a no-op.
    pub fn insert(&mut self, frame: Frame, change: SlotChange) {
        let records = self.changes.get_or_insert_with(frame, Vec::new);
        if records.iter().any(|c| c.event == change.event) {
            return;
        }
        let at = records.partition_point(|c| c.event < change.event);
        records.insert(at, change);
        self.rebuild_from(frame);
    }

    /// Removes the change made by `event`, returning its frame.
    pub fn remove_event(&mut self, event: JleId) -> Option<Frame> {
        let frame = self
            .changes
            .iter()
            .find(|(_, records)| records.iter().any(|c| c.event == event))
            .map(|(frame, _)| frame)?;

        let now_empty = match self.changes.get_mut(frame) {
            Some(records) => {
                records.retain(|c| c.event != event);
                records.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.changes.remove(frame);
        }
        self.rebuild_from(frame);
        Some(frame)
    }

    /// Frame and change of the newest event touching `slot`.
    pub fn latest_for_slot(&self, slot: InputSlot) -> Option<(Frame, &SlotChange)> {
        self.changes
            .iter()
            .rev()
            .find_map(|(frame, records)| {
                records
                    .iter()
                    .rev()
                    .find(|c| c.slot == slot)
                    .map(|c| (frame, c))
            })
            .or_else(|| self.retired_for(slot))
    }

    fn retired_for(&self, slot: InputSlot) -> Option<(Frame, &SlotChange)> {
        self.retired
            .get(slot as usize)
            .and_then(Option::as_ref)
            .map(|(frame, change)| (*frame, change))
    }

    /// Effective frame of the join that put `slot` online as of `frame`.
    pub fn online_since(&self, slot: InputSlot, frame: Frame) -> Option<Frame> {
        if !self.is_online(slot, frame) {
            return None;
        }
        self.changes
            .range(Frame::MIN, frame)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .find_map(|(at, records)| {
                records
                    .iter()
                    .rev()
                    .find(|c| c.slot == slot)
                    .filter(|c| matches!(c.kind, JleKind::Join { .. }))
                    .map(|_| at)
            })
            .or_else(|| {
                self.retired_for(slot)
                    .filter(|(at, change)| {
                        *at <= frame && matches!(change.kind, JleKind::Join { .. })
                    })
                    .map(|(at, _)| at)
            })
    }

    /// Drops changes before `floor` without changing any answer at or after it.
    pub fn trim_before(&mut self, floor: Frame) {
        self.base = self.mask_at(floor - 1);
        for (frame, records) in self.changes.range(Frame::MIN, floor - 1) {
            for change in records {
                if let Some(entry) = self.retired.get_mut(change.slot as usize) {
                    *entry = Some((frame, change.clone()));
                }
            }
        }
        self.changes.trim_before(floor);
        self.masks.trim_before(floor);
    }

    fn rebuild_from(&mut self, frame: Frame) {
        let mut mask = self.mask_at(frame - 1);
        self.masks.drop_from(frame);

        let mut rebuilt = Vec::new();
        for (at, records) in self.changes.range(frame, Frame::MAX) {
            for change in records {
                mask = change.apply(mask);
            }
            rebuilt.push((at, mask));
        }
        for (at, mask) in rebuilt {
            self.masks.set(at, mask);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn join(event: JleId, slot: InputSlot) -> SlotChange {
        SlotChange {
            event,
            slot,
            kind: JleKind::Join {
                name: String::new(),
                player_data: Vec::new(),
            },
        }
    }

    fn leave(event: JleId, slot: InputSlot) -> SlotChange {
        SlotChange {
            event,
            slot,
            kind: JleKind::Leave,
        }
    }

    #[test]
    fn test_mask_follows_changes() {
        let mut online = OnlineState::new();
        online.insert(1, join(1, 0));
        online.insert(10, join(2, 1));
        online.insert(20, leave(3, 0));

        assert_eq!(online.mask_at(0), 0);
        assert_eq!(online.mask_at(1), 0b01);
        assert_eq!(online.mask_at(15), 0b11);
        assert_eq!(online.mask_at(20), 0b10);
        assert!(!online.is_online(0, 25));
        assert!(online.is_online(1, 25));
    }

    #[test]
    fn test_leave_and_rejoin_share_a_frame() {
        let mut online = OnlineState::new();
        online.insert(1, join(1, 2));
        online.insert(8, join(3, 2));
        online.insert(8, leave(2, 2));

        let ids: Vec<JleId> = online.changes_at(8).iter().map(|c| c.event).collect();
        assert_eq!(ids, vec![2, 3]);
        assert!(online.is_online(2, 8));
        assert_eq!(online.online_since(2, 9), Some(8));
    }

    #[test]
    fn test_out_of_order_insert_rebuilds_later_masks() {
        let mut online = OnlineState::new();
        online.insert(10, join(2, 1));
        online.insert(5, join(1, 0));
        assert_eq!(online.mask_at(12), 0b11);
    }

    #[test]
    fn test_remove_event_unwinds() {
        let mut online = OnlineState::new();
        online.insert(1, join(1, 0));
        online.insert(6, join(2, 1));
        assert_eq!(online.remove_event(2), Some(6));
        assert_eq!(online.mask_at(10), 0b01);
        assert!(online.changes_at(6).is_empty());
        assert_eq!(online.remove_event(2), None);
    }

    #[test]
    fn test_trim_preserves_answers() {
        let mut online = OnlineState::new();
        online.insert(1, join(1, 0));
        online.insert(4, join(2, 1));
        online.insert(9, leave(3, 0));
        online.trim_before(9);
        assert_eq!(online.mask_at(8), 0b11);
        assert_eq!(online.mask_at(9), 0b10);

        online.insert(12, join(4, 3));
        assert_eq!(online.mask_at(12), 0b1010);
    }

    #[test]
    fn test_latest_for_slot() {
        let mut online = OnlineState::new();
        online.insert(1, join(1, 0));
        online.insert(7, leave(2, 0));
        let (frame, change) = online.latest_for_slot(0).unwrap();
        assert_eq!(frame, 7);
        assert_eq!(change.kind, JleKind::Leave);
        assert!(online.latest_for_slot(5).is_none());
        assert_eq!(online.online_since(0, 8), None);
    }

    #[test]
    fn test_trim_keeps_the_join_of_a_long_online_slot() {
        let mut online = OnlineState::new();
        online.insert(1, join(1, 0));
        online.insert(3, join(2, 1));
        online.insert(500, leave(3, 1));
        online.trim_before(900);
        online.trim_before(1200);

        let (frame, change) = online.latest_for_slot(0).unwrap();
        assert_eq!(frame, 1);
        assert!(matches!(change.kind, JleKind::Join { .. }));
        assert_eq!(online.online_since(0, 1500), Some(1));

        let (frame, change) = online.latest_for_slot(1).unwrap();
        assert_eq!(frame, 500);
        assert_eq!(change.kind, JleKind::Leave);
        assert_eq!(online.online_since(1, 1500), None);
        assert_eq!(online.mask_at(1500), 0b01);
    }
}
