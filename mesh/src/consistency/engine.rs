//! Frame-indexed history and the rollback loop.
//!
//! The engine keeps, per input slot, every input known at or after the
//! retention floor, the online-state history, a snapshot after every
//! simulated frame and the exact input vector each frame was simulated
//! with. A newly learned input that differs from what was simulated marks
//! its frame dirty; the next `resimulate` reloads the snapshot before the
//! dirty frame and replays forward.

use super::online_state::{OnlineState, SlotChange};
use super::Ledger;
use log::{debug, error, info, warn};
use shared::input_codec::{self, value_mask, InputBatch, MAX_BATCH_FRAMES};
use shared::protocol::{HostMigration, JleKind, JoinLeaveEvent, SlotInputs, Welcome};
use shared::{
    slot_mask, ConnectionId, ConsistencyReport, Frame, InputSlot, InputVector, InternalError,
    JleId, MeshConfig, ProtocolError, Simulation, StateHash, Timeline, TimelineError,
    MAX_INPUT_SLOTS,
};
use std::collections::BTreeMap;

/// What a remote last told us about its own progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteStatus {
    pub ncf: Frame,
    pub jle_epoch: JleId,
}

/// A remote slot that has held NCF back past its backstop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StalledSlot {
    pub slot: InputSlot,
    pub frame: Frame,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedInput {
    /// Last frame covered by the batch; the sender's input frame when sent.
    pub last_frame: Frame,
    pub report: Option<ConsistencyReport>,
}

#[derive(Debug, Clone, Copy)]
struct Stall {
    slot: InputSlot,
    frame: Frame,
    flagged: bool,
}

pub struct Engine<S> {
    config: MeshConfig,
    simulation: S,
    running: bool,
    local_slot: Option<InputSlot>,

    inputs: Vec<Timeline<u32>>,
    online: OnlineState,
    events: BTreeMap<JleId, JoinLeaveEvent>,
    host_for_jle: BTreeMap<JleId, ConnectionId>,
    jle_epoch: JleId,

    snapshots: Timeline<Vec<u8>>,
    hashes: Timeline<StateHash>,
    applied: Timeline<InputVector>,

    ncf: Frame,
    simulation_frame: Frame,
    input_frame: Frame,
    /// Highest frame ever simulated; later replays are not `first_time`.
    simulated_through: Frame,
    dirty_from: Option<Frame>,
    /// Coordinator NCF; members never finalize past it.
    vouched_ncf: Option<Frame>,
    floor: Frame,

    remotes: BTreeMap<ConnectionId, RemoteStatus>,
    stall: Option<Stall>,
    backstop_reported: bool,
}

impl<S: Simulation> Engine<S> {
    pub fn new(config: MeshConfig, simulation: S) -> Self {
        Self {
            config,
            simulation,
            running: false,
            local_slot: None,
            inputs: (0..MAX_INPUT_SLOTS).map(|_| Timeline::new()).collect(),
            online: OnlineState::new(),
            events: BTreeMap::new(),
            host_for_jle: BTreeMap::new(),
            jle_epoch: 0,
            snapshots: Timeline::new(),
            hashes: Timeline::new(),
            applied: Timeline::new(),
            ncf: 0,
            simulation_frame: 0,
            input_frame: 0,
            simulated_through: 0,
            dirty_from: None,
            vouched_ncf: None,
            floor: Frame::MIN,
            remotes: BTreeMap::new(),
            stall: None,
            backstop_reported: false,
        }
    }

    pub fn simulation(&self) -> &S {
        &self.simulation
    }

    pub fn simulation_mut(&mut self) -> &mut S {
        &mut self.simulation
    }

    pub fn simulation_frame(&self) -> Frame {
        self.simulation_frame
    }

    pub fn local_slot(&self) -> Option<InputSlot> {
        self.local_slot
    }

    pub fn floor(&self) -> Frame {
        self.floor
    }

    pub fn online_mask(&self, frame: Frame) -> u8 {
        self.online.mask_at(frame)
    }

    pub fn known_input(&self, slot: InputSlot, frame: Frame) -> Option<u32> {
        self.inputs
            .get(slot as usize)
            .and_then(|timeline| timeline.get(frame))
            .copied()
    }

    pub fn remote_status(&self, peer: ConnectionId) -> Option<RemoteStatus> {
        self.remotes.get(&peer).copied()
    }

    pub fn snapshot_at(&self, frame: Frame) -> Option<&[u8]> {
        self.snapshots.get(frame).map(Vec::as_slice)
    }

    pub fn host_of_event(&self, id: JleId) -> Option<ConnectionId> {
        self.host_for_jle.get(&id).copied()
    }

    /// Retained join/leave events, oldest first.
    pub fn events(&self) -> impl Iterator<Item = &JoinLeaveEvent> {
        self.events.values()
    }

    /// Hash of the snapshot after `frame`, computed on first request.
    pub fn hash_at(&mut self, frame: Frame) -> Option<StateHash> {
        if let Some(hash) = self.hashes.get(frame) {
            return Some(*hash);
        }
        let hash = StateHash::of(self.snapshots.get(frame)?);
        self.hashes.set(frame, hash);
        Some(hash)
    }

    /// Consistency report for our current NCF.
    pub fn report(&mut self, coordinator: ConnectionId) -> Option<ConsistencyReport> {
        let ncf = self.ncf;
        let hash = self.hash_at(ncf)?;
        Some(ConsistencyReport {
            ncf,
            jle_epoch: self.jle_epoch,
            coordinator,
            hash,
        })
    }

    fn reset(&mut self) {
        for timeline in &mut self.inputs {
            *timeline = Timeline::new();
        }
        self.online = OnlineState::new();
        self.events.clear();
        self.host_for_jle.clear();
        self.jle_epoch = 0;
        self.snapshots = Timeline::new();
        self.hashes = Timeline::new();
        self.applied = Timeline::new();
        self.dirty_from = None;
        self.stall = None;
        self.remotes.clear();
    }

    fn mark_dirty(&mut self, frame: Frame) {
        if frame <= self.simulation_frame {
            self.dirty_from = Some(self.dirty_from.map_or(frame, |dirty| dirty.min(frame)));
        }
    }

    /// `frame` is no longer certain: pull NCF below it and replay from it.
    fn rewind_to(&mut self, frame: Frame) {
        if frame <= self.ncf {
            debug!("NCF rewound from {} to {}", self.ncf, frame - 1);
            self.ncf = frame - 1;
        }
        self.mark_dirty(frame);
    }

    fn record_event(&mut self, event: &JoinLeaveEvent, host: ConnectionId) {
        let effective = event.effective_frame;
        self.online.insert(effective, SlotChange::from_event(event));
        self.inputs[event.slot as usize].drop_from(effective);
        self.events.insert(event.id, event.clone());
        self.host_for_jle.insert(event.id, host);
        self.jle_epoch = self.jle_epoch.max(event.id);
        self.rewind_to(effective);
    }

    fn unwind_event(&mut self, id: JleId) {
        if let Some(event) = self.events.remove(&id) {
            warn!(
                "Unwinding uncorroborated event {} for slot {} at frame {}",
                id, event.slot, event.effective_frame
            );
            self.host_for_jle.remove(&id);
            self.online.remove_event(id);
            self.rewind_to(event.effective_frame);
        }
    }

    /// Overwrites inputs with coordinator-vouched values.
    fn set_authoritative(&mut self, inputs: &SlotInputs) {
        let slot = inputs.slot as usize;
        for (frame, value) in inputs.batch().frames() {
            if frame < self.floor || self.inputs[slot].get(frame) == Some(&value) {
                continue;
            }
            self.inputs[slot].set(frame, value);
            self.rewind_to(frame);
        }
    }

    fn check_values(&self, inputs: &SlotInputs) -> Result<(), ProtocolError> {
        if inputs.slot as usize >= MAX_INPUT_SLOTS {
            return Err(ProtocolError::BadSlot(inputs.slot));
        }
        let mask = value_mask(self.config.input_bits);
        match inputs.values.iter().find(|v| **v & !mask != 0) {
            Some(value) => Err(ProtocolError::ValueOutOfRange {
                value: *value,
                bits: self.config.input_bits,
            }),
            None => Ok(()),
        }
    }

    /// Contiguous known inputs of `slot` starting at `from`.
    fn known_run(&self, slot: InputSlot, from: Frame) -> Option<SlotInputs> {
        let values: Vec<u32> = self.inputs[slot as usize]
            .range(from, Frame::MAX)
            .enumerate()
            .take_while(|(i, (frame, _))| *frame == from + *i as Frame)
            .map(|(_, (_, value))| *value)
            .collect();
        if values.is_empty() {
            return None;
        }
        Some(SlotInputs {
            slot,
            start_frame: from,
            values,
        })
    }

    fn predicted(&self, slot: InputSlot, frame: Frame) -> u32 {
        self.inputs[slot as usize]
            .last_at_or_before(frame)
            .map(|(_, value)| *value)
            .unwrap_or(0)
    }

    fn simulate_frame(&mut self, frame: Frame, first_time: bool) {
        self.simulation.before_frame();
        for change in self.online.changes_at(frame) {
            match &change.kind {
                JleKind::Join { name, player_data } => {
                    self.simulation
                        .player_join(change.slot, name, player_data, first_time)
                }
                JleKind::Leave => self.simulation.player_leave(change.slot, first_time),
            }
        }

        let mask = self.online.mask_at(frame);
        let mut vector: InputVector = [0; MAX_INPUT_SLOTS];
        for slot in 0..MAX_INPUT_SLOTS as InputSlot {
            if mask & slot_mask(slot) != 0 {
                vector[slot as usize] = self.predicted(slot, frame);
            }
        }

        self.simulation.step(&vector, first_time);
        self.simulation.after_frame();
        self.applied.set(frame, vector);
        self.snapshots.set(frame, self.simulation.serialize());
        self.hashes.remove(frame);
    }

    /// Records our own input for every online frame up to the input frame.
    fn record_local_input(&mut self, value: u32) {
        let slot = match self.local_slot {
            Some(slot) => slot,
            None => return,
        };
        let since = match self.online.latest_for_slot(slot) {
            Some((frame, change)) if matches!(change.kind, JleKind::Join { .. }) => frame,
            _ => return,
        };

        let mask = value_mask(self.config.input_bits);
        if value & !mask != 0 {
            debug!(
                "Local input {:#x} truncated to {} bits",
                value, self.config.input_bits
            );
        }
        let value = value & mask;

        let timeline = &mut self.inputs[slot as usize];
        let next = timeline.last().map_or(since, |(frame, _)| (frame + 1).max(since));
        for frame in next..=self.input_frame {
            timeline.set(frame, value);
        }
    }

    /// Advances one frame: records local input, simulates the new frame.
    pub fn tick(&mut self, local_input: u32) -> Result<(), InternalError> {
        if self.ncf > self.simulation_frame {
            return Err(InternalError::NcfAheadOfSimulation {
                ncf: self.ncf,
                simulation: self.simulation_frame,
            });
        }
        self.input_frame += 1;
        self.record_local_input(local_input);

        self.simulation_frame += 1;
        let frame = self.simulation_frame;
        let first_time = frame > self.simulated_through;
        self.simulate_frame(frame, first_time);
        self.simulated_through = self.simulated_through.max(frame);
        Ok(())
    }

    /// Replays from the earliest dirty frame through the simulation frame.
    pub fn resimulate(&mut self) -> Result<(), InternalError> {
        let from = match self.dirty_from.take() {
            Some(from) => from,
            None => return Ok(()),
        };
        if from <= self.ncf {
            return Err(InternalError::DirtyBelowNcf {
                dirty: from,
                ncf: self.ncf,
            });
        }
        if from > self.simulation_frame {
            return Ok(());
        }

        let (base, snapshot) = self
            .snapshots
            .last_at_or_before(from - 1)
            .map(|(frame, bytes)| (frame, bytes.clone()))
            .ok_or(InternalError::MissingSnapshot(from - 1))?;
        self.simulation
            .deserialize(&snapshot)
            .map_err(|e| InternalError::SnapshotRestore(e.0))?;

        debug!(
            "Rollback to frame {}, resimulating {} frames",
            base,
            self.simulation_frame - base
        );
        for frame in base + 1..=self.simulation_frame {
            let first_time = frame > self.simulated_through;
            self.simulate_frame(frame, first_time);
        }
        Ok(())
    }

    fn missing_slot(&self, frame: Frame) -> Option<InputSlot> {
        let mask = self.online.mask_at(frame);
        (0..MAX_INPUT_SLOTS as InputSlot)
            .find(|slot| mask & slot_mask(*slot) != 0 && !self.inputs[*slot as usize].contains(frame))
    }

    /// Moves NCF forward over every frame whose online slots all have input.
    pub fn advance_ncf(&mut self) -> Result<Option<StalledSlot>, InternalError> {
        if !self.running {
            return Ok(None);
        }
        let limit = match self.vouched_ncf {
            Some(vouched) => vouched.min(self.simulation_frame),
            None => self.simulation_frame,
        };
        while self.ncf < limit {
            let frame = self.ncf + 1;
            if let Some(slot) = self.missing_slot(frame) {
                return self.note_stall(slot, frame);
            }
            self.ncf = frame;
        }
        // Past the vouched NCF a silent slot still has to trip its backstop.
        let gap = (self.ncf + 1..=self.simulation_frame)
            .find_map(|frame| self.missing_slot(frame).map(|slot| (slot, frame)));
        if let Some((slot, frame)) = gap {
            return self.note_stall(slot, frame);
        }
        self.stall = None;
        Ok(None)
    }

    fn note_stall(
        &mut self,
        slot: InputSlot,
        frame: Frame,
    ) -> Result<Option<StalledSlot>, InternalError> {
        let mut stall = match self.stall {
            Some(stall) if stall.slot == slot && stall.frame == frame => stall,
            _ => Stall {
                slot,
                frame,
                flagged: false,
            },
        };
        let waited = self.simulation_frame - frame;
        let local = Some(slot) == self.local_slot;
        let backstop = if local {
            self.config.local_stall_frames
        } else {
            self.config.remote_stall_frames
        };

        let mut outcome = Ok(None);
        if !stall.flagged && waited > backstop {
            stall.flagged = true;
            if local {
                error!("Own slot {} has no input for frame {}", slot, frame);
                outcome = Err(InternalError::LocalStall(frame));
            } else {
                warn!(
                    "Slot {} has held NCF at frame {} for {} frames",
                    slot, frame, waited
                );
                outcome = Ok(Some(StalledSlot { slot, frame }));
            }
        }
        self.stall = Some(stall);
        outcome
    }

    /// Merges a remote input message for `slot`.
    pub fn receive_input(
        &mut self,
        slot: InputSlot,
        payload: &[u8],
    ) -> Result<ReceivedInput, ProtocolError> {
        if slot as usize >= MAX_INPUT_SLOTS || Some(slot) == self.local_slot {
            return Err(ProtocolError::BadSlot(slot));
        }
        let (batch, report) = input_codec::decode(payload, self.config.input_bits)?;
        let last_frame = batch.frame_after() - 1;
        let limit = self.config.max_frames_ahead;
        if last_frame > self.simulation_frame.saturating_add(limit) {
            return Err(ProtocolError::TooFarAhead {
                end: last_frame,
                local: self.simulation_frame,
                limit,
            });
        }

        for (frame, value) in batch.frames() {
            if frame < self.floor {
                continue;
            }
            match self.inputs[slot as usize].add(frame, value) {
                Ok(true) => self.note_new_input(slot, frame, value),
                Ok(false) => {}
                Err(TimelineError::ConflictingValue { frame }) => {
                    return Err(ProtocolError::ConflictingInput { slot, frame })
                }
            }
        }
        Ok(ReceivedInput { last_frame, report })
    }

    fn note_new_input(&mut self, slot: InputSlot, frame: Frame, value: u32) {
        if frame > self.simulation_frame || !self.online.is_online(slot, frame) {
            return;
        }
        let simulated = self.applied.get(frame).map(|vector| vector[slot as usize]);
        if simulated != Some(value) {
            self.mark_dirty(frame);
        }
    }

    /// Records a remote's report. `vouching` is set when it comes from the
    /// current coordinator about the current history.
    pub fn note_report(&mut self, peer: ConnectionId, report: &ConsistencyReport, vouching: bool) {
        self.remotes.insert(
            peer,
            RemoteStatus {
                ncf: report.ncf,
                jle_epoch: report.jle_epoch,
            },
        );
        if vouching {
            self.vouched_ncf = Some(self.vouched_ncf.map_or(report.ncf, |v| v.max(report.ncf)));
        }
    }

    /// Encodes our inputs after `sent_through` up to the input frame.
    /// Returns the payload and the last frame it covers.
    pub fn outgoing_input(
        &mut self,
        sent_through: Frame,
        coordinator: ConnectionId,
    ) -> Option<(Vec<u8>, Frame)> {
        let slot = self.local_slot? as usize;
        let (start, _) = self.inputs[slot].first_after(sent_through)?;
        if start > self.input_frame {
            return None;
        }
        let values: Vec<u32> = self.inputs[slot]
            .range(start, self.input_frame)
            .take(MAX_BATCH_FRAMES)
            .enumerate()
            .take_while(|(i, (frame, _))| *frame == start + *i as Frame)
            .map(|(_, (_, value))| *value)
            .collect();

        let batch = InputBatch::new(start, values);
        let report = if batch.can_coalesce() {
            self.report(coordinator)
        } else {
            None
        };
        let payload = input_codec::encode(&batch, self.config.input_bits, report.as_ref());
        Some((payload, batch.frame_after() - 1))
    }

    /// Collected snapshots from `from` through `to`, skipping missing frames.
    pub fn snapshots_between(&self, from: Frame, to: Frame) -> Vec<(Frame, Vec<u8>)> {
        self.snapshots
            .range(from, to)
            .map(|(frame, bytes)| (frame, bytes.clone()))
            .collect()
    }

    /// Drops history no peer can still need. `hold` pins an extra frame,
    /// such as the earliest effect of buffered migration traffic.
    pub fn trim(&mut self, hold: Option<Frame>) {
        if !self.running {
            return;
        }
        let mut floor = self.ncf;
        if let Some(vouched) = self.vouched_ncf {
            floor = floor.min(vouched);
        }
        if let Some(hold) = hold {
            floor = floor.min(hold);
        }
        for status in self.remotes.values() {
            floor = floor.min(status.ncf);
        }

        if self.simulation_frame - floor > self.config.retention_backstop_frames
            && !self.backstop_reported
        {
            error!(
                "Retention floor {} lags simulation frame {} by more than {} frames",
                floor, self.simulation_frame, self.config.retention_backstop_frames
            );
            self.backstop_reported = true;
        }

        if floor <= self.floor {
            return;
        }
        self.floor = floor;
        for timeline in &mut self.inputs {
            timeline.trim_before(floor);
        }
        self.online.trim_before(floor);
        // Snapshots outlive the floor by one dump window so either side of a
        // desync can still build or check a dump.
        let evidence = floor.saturating_sub(self.config.desync_dump_max_frames as Frame);
        self.snapshots.trim_before(evidence);
        self.hashes.trim_before(evidence);
        self.applied.trim_before(floor);
        self.prune_events();
    }

    fn prune_events(&mut self) {
        let min_epoch = self
            .remotes
            .values()
            .map(|status| status.jle_epoch)
            .min()
            .unwrap_or(self.jle_epoch);

        let mut latest: BTreeMap<InputSlot, JleId> = BTreeMap::new();
        let mut latest_join: BTreeMap<InputSlot, JleId> = BTreeMap::new();
        for event in self.events.values() {
            latest.insert(event.slot, event.id);
            if event.is_join() {
                latest_join.insert(event.slot, event.id);
            }
        }

        let floor = self.floor;
        self.events.retain(|id, event| {
            *id > min_epoch
                || event.effective_frame >= floor
                || latest.get(&event.slot) == Some(id)
                || latest_join.get(&event.slot) == Some(id)
        });
        let events = &self.events;
        self.host_for_jle.retain(|id, _| events.contains_key(id));
    }
}

impl<S: Simulation> Ledger for Engine<S> {
    fn is_running(&self) -> bool {
        self.running
    }

    fn ncf(&self) -> Frame {
        self.ncf
    }

    fn input_frame(&self) -> Frame {
        self.input_frame
    }

    fn jle_epoch(&self) -> JleId {
        self.jle_epoch
    }

    fn free_slot(&self, reserved: u8, max_slots: usize) -> Option<InputSlot> {
        let count = max_slots.min(MAX_INPUT_SLOTS) as InputSlot;
        (0..count).find(|slot| {
            reserved & slot_mask(*slot) == 0
                && !self.online.is_online(*slot, self.ncf)
                && self
                    .online
                    .latest_for_slot(*slot)
                    .map_or(true, |(frame, _)| frame <= self.ncf)
        })
    }

    fn start_host(
        &mut self,
        slot: InputSlot,
        name: &str,
        player_data: &[u8],
        host: ConnectionId,
    ) -> JoinLeaveEvent {
        self.reset();
        self.snapshots.set(0, self.simulation.serialize());
        self.ncf = 0;
        self.simulation_frame = 0;
        self.simulated_through = 0;
        self.input_frame = self.config.local_frame_delay;
        self.vouched_ncf = None;
        self.floor = 0;
        self.local_slot = Some(slot);
        self.running = true;
        self.authorize_join(slot, name, player_data, host)
    }

    fn authorize_join(
        &mut self,
        slot: InputSlot,
        name: &str,
        player_data: &[u8],
        host: ConnectionId,
    ) -> JoinLeaveEvent {
        let pending = self
            .online
            .latest_for_slot(slot)
            .map_or(Frame::MIN, |(frame, _)| frame);
        let event = JoinLeaveEvent {
            id: self.jle_epoch + 1,
            slot,
            consistent_frame: self.ncf,
            effective_frame: self.ncf.max(self.input_frame).max(pending) + 1,
            kind: JleKind::Join {
                name: name.to_string(),
                player_data: player_data.to_vec(),
            },
        };
        info!(
            "Event {}: slot {} joins at frame {} (NCF {})",
            event.id, slot, event.effective_frame, event.consistent_frame
        );
        self.record_event(&event, host);
        event
    }

    fn authorize_leave(
        &mut self,
        slot: InputSlot,
        host: ConnectionId,
    ) -> Option<(JoinLeaveEvent, Option<SlotInputs>)> {
        let since = match self.online.latest_for_slot(slot) {
            Some((frame, change)) if matches!(change.kind, JleKind::Join { .. }) => frame,
            _ => return None,
        };
        let last_known = self.inputs[slot as usize]
            .last()
            .map(|(frame, value)| (frame, *value));
        let last_frame = last_known.map_or(Frame::MIN, |(frame, _)| frame);
        let effective = self
            .ncf
            .max(last_frame)
            .max(self.input_frame)
            .max(since)
            + 1;

        let event = JoinLeaveEvent {
            id: self.jle_epoch + 1,
            slot,
            consistent_frame: self.ncf,
            effective_frame: effective,
            kind: JleKind::Leave,
        };
        info!(
            "Event {}: slot {} leaves at frame {} (NCF {})",
            event.id, slot, effective, event.consistent_frame
        );
        self.record_event(&event, host);

        let fill_value = match last_known {
            Some((frame, value)) if frame >= since => value,
            _ => 0,
        };
        let fill_start = since.max(last_frame.saturating_add(1));
        let fill = if fill_start < effective {
            let inputs = SlotInputs {
                slot,
                start_frame: fill_start,
                values: vec![fill_value; (effective - fill_start) as usize],
            };
            self.set_authoritative(&inputs);
            Some(inputs)
        } else {
            None
        };
        Some((event, fill))
    }

    fn apply_event(
        &mut self,
        event: &JoinLeaveEvent,
        host: ConnectionId,
        inputs: Option<&SlotInputs>,
    ) -> Result<(), ProtocolError> {
        event.validate()?;
        if let Some(inputs) = inputs {
            self.check_values(inputs)?;
            if inputs.slot != event.slot {
                return Err(ProtocolError::BadEvent {
                    id: event.id,
                    detail: "inputs for another slot",
                });
            }
        }

        if event.id <= self.jle_epoch {
            return match self.events.get(&event.id) {
                Some(known) if known != event => Err(ProtocolError::BadEvent {
                    id: event.id,
                    detail: "conflicts with a known event",
                }),
                _ => Ok(()),
            };
        }
        if event.id != self.jle_epoch + 1 {
            return Err(ProtocolError::BadEvent {
                id: event.id,
                detail: "out of sequence",
            });
        }
        if event.effective_frame <= self.floor {
            return Err(ProtocolError::BadEvent {
                id: event.id,
                detail: "takes effect before retained history",
            });
        }

        self.record_event(event, host);
        if let Some(inputs) = inputs {
            self.set_authoritative(inputs);
        }
        Ok(())
    }

    fn welcome(&mut self, event: &JoinLeaveEvent) -> Result<Welcome, InternalError> {
        let frame = event.consistent_frame;
        let snapshot = self
            .snapshots
            .get(frame)
            .cloned()
            .ok_or(InternalError::MissingSnapshot(frame))?;

        let online = &self.online;
        let events: Vec<JoinLeaveEvent> = self
            .events
            .values()
            .filter(|e| {
                e.effective_frame > frame
                    || (e.is_join() && online.online_since(e.slot, frame) == Some(e.effective_frame))
            })
            .cloned()
            .collect();
        let host_for_jle = events
            .iter()
            .filter_map(|e| self.host_for_jle.get(&e.id).map(|host| (e.id, *host)))
            .collect();
        let inputs = (0..MAX_INPUT_SLOTS as InputSlot)
            .filter(|slot| *slot != event.slot)
            .filter_map(|slot| self.known_run(slot, frame + 1))
            .collect();

        Ok(Welcome {
            frame,
            snapshot,
            events,
            host_for_jle,
            inputs,
        })
    }

    fn accept_welcome(
        &mut self,
        welcome: &Welcome,
        local_slot: InputSlot,
    ) -> Result<(), ProtocolError> {
        for event in &welcome.events {
            event.validate()?;
        }
        for inputs in &welcome.inputs {
            self.check_values(inputs)?;
            if inputs.slot == local_slot {
                return Err(ProtocolError::BadSlot(local_slot));
            }
        }
        let admitted = welcome.events.iter().any(|e| {
            e.slot == local_slot && e.is_join() && e.effective_frame > welcome.frame
        });
        if !admitted {
            return Err(ProtocolError::Unexpected("Welcome without our join"));
        }

        self.simulation
            .deserialize(&welcome.snapshot)
            .map_err(|e| ProtocolError::BadSnapshot(e.0))?;
        self.reset();

        let frame = welcome.frame;
        self.snapshots.set(frame, welcome.snapshot.clone());
        self.ncf = frame;
        self.simulation_frame = frame;
        self.simulated_through = frame;
        self.input_frame = frame + self.config.local_frame_delay;
        self.vouched_ncf = Some(frame);
        self.floor = frame;

        for event in &welcome.events {
            self.online
                .insert(event.effective_frame, SlotChange::from_event(event));
            self.events.insert(event.id, event.clone());
            self.jle_epoch = self.jle_epoch.max(event.id);
        }
        self.host_for_jle.extend(welcome.host_for_jle.iter().copied());
        for inputs in &welcome.inputs {
            for (at, value) in inputs.batch().frames() {
                self.inputs[inputs.slot as usize].set(at, value);
            }
        }

        self.local_slot = Some(local_slot);
        self.running = true;
        info!(
            "Joined history at frame {} with {} events, epoch {}",
            frame,
            welcome.events.len(),
            self.jle_epoch
        );
        Ok(())
    }

    fn migration_payload(
        &mut self,
        coordinator: ConnectionId,
        members: Vec<ConnectionId>,
        departed: &[InputSlot],
    ) -> HostMigration {
        self.vouched_ncf = None;
        let mut departed_inputs = Vec::new();
        for slot in departed {
            if let Some((_, fill)) = self.authorize_leave(*slot, coordinator) {
                departed_inputs.extend(fill);
            }
        }

        let min_epoch = members
            .iter()
            .map(|member| self.remotes.get(member).map_or(0, |s| s.jle_epoch))
            .min()
            .unwrap_or(self.jle_epoch);
        let mut ids = Vec::new();
        let mut id = self.jle_epoch;
        while id > min_epoch && self.events.contains_key(&id) {
            ids.push(id);
            id -= 1;
        }
        ids.reverse();

        let events = ids
            .iter()
            .filter_map(|id| self.events.get(id).cloned())
            .collect();
        let host_for_jle = ids
            .iter()
            .filter_map(|id| self.host_for_jle.get(id).map(|host| (*id, *host)))
            .collect();

        HostMigration {
            coordinator,
            ncf: self.ncf,
            members,
            events,
            host_for_jle,
            departed_inputs,
        }
    }

    fn reconcile_migration(&mut self, migration: &HostMigration) -> Result<(), ProtocolError> {
        for event in &migration.events {
            event.validate()?;
        }
        for inputs in &migration.departed_inputs {
            self.check_values(inputs)?;
        }
        if let Some(first) = migration.events.first() {
            if first.id > self.jle_epoch + 1 {
                return Err(ProtocolError::BadEvent {
                    id: first.id,
                    detail: "migration log starts after local history",
                });
            }
        }

        let corroborated = migration.events.last().map_or(self.jle_epoch, |e| e.id);
        let incoming: BTreeMap<JleId, &JoinLeaveEvent> =
            migration.events.iter().map(|e| (e.id, e)).collect();
        let first_bad = self
            .events
            .iter()
            .find(|(id, event)| {
                **id > corroborated
                    || incoming.get(*id).map_or(false, |theirs| theirs != event)
            })
            .map(|(id, _)| *id);
        if let Some(bad) = first_bad {
            let doomed: Vec<JleId> = self.events.range(bad..).map(|(id, _)| *id).rev().collect();
            for id in doomed {
                self.unwind_event(id);
            }
            self.jle_epoch = bad - 1;
        }

        for event in &migration.events {
            if event.id <= self.jle_epoch {
                continue;
            }
            if event.id != self.jle_epoch + 1 {
                return Err(ProtocolError::BadEvent {
                    id: event.id,
                    detail: "out of sequence",
                });
            }
            let host = migration
                .host_for_jle
                .iter()
                .find(|(id, _)| *id == event.id)
                .map_or(migration.coordinator, |(_, host)| *host);
            self.record_event(event, host);
        }
        for inputs in &migration.departed_inputs {
            self.set_authoritative(inputs);
        }

        if migration.ncf < self.ncf {
            debug!(
                "NCF corrected from {} to {} by new coordinator",
                self.ncf, migration.ncf
            );
            self.ncf = migration.ncf;
        }
        self.vouched_ncf = Some(migration.ncf);
        Ok(())
    }

    fn forget_remote(&mut self, peer: ConnectionId) {
        self.remotes.remove(&peer);
    }
}
