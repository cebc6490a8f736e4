//! Desync detection and diagnostics export
//!
//! Consistency reports piggybacked on input carry the hash of the sender's
//! snapshot at its NCF. Once our own NCF reaches that frame we compare. A
//! mismatch is logged, the sender is shipped a bounded window of our raw
//! snapshots, and the local snapshot is exported. A peer receiving such a
//! window compares it byte for byte against its own history and exports the
//! last agreeing frame together with both sides of the first divergence.
//!
//! Desync is not an error: nobody is disconnected for it.

use crate::consistency::{Engine, Ledger};
use log::{debug, info, warn};
use shared::protocol::DesyncDump;
use shared::{
    ConnectionId, ConsistencyReport, Frame, JleId, MeshConfig, ProtocolError, Simulation,
};
use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

/// Reports parked while waiting for our NCF to catch up.
const MAX_PENDING_REPORTS: usize = 256;

/// Sink for desync evidence.
pub trait DesyncExporter: Send {
    /// Our snapshot at a frame whose hash disagreed with `peer`.
    fn export_local(&mut self, peer: ConnectionId, frame: Frame, snapshot: &[u8]);

    /// First frame at which our history and the dump from `peer` differ.
    fn export_divergence(
        &mut self,
        peer: ConnectionId,
        frame: Frame,
        last_agreeing: Option<&[u8]>,
        local: &[u8],
        remote: &[u8],
    );
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportRecord {
    Local {
        peer: ConnectionId,
        frame: Frame,
        snapshot: Vec<u8>,
    },
    Divergence {
        peer: ConnectionId,
        frame: Frame,
        last_agreeing: Option<Vec<u8>>,
        local: Vec<u8>,
        remote: Vec<u8>,
    },
}

/// Keeps exports in memory; clones share one record list.
#[derive(Debug, Clone, Default)]
pub struct MemoryExporter {
    records: Arc<Mutex<Vec<ExportRecord>>>,
}

impl MemoryExporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<ExportRecord> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn push(&self, record: ExportRecord) {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(record);
    }
}

impl DesyncExporter for MemoryExporter {
    fn export_local(&mut self, peer: ConnectionId, frame: Frame, snapshot: &[u8]) {
        self.push(ExportRecord::Local {
            peer,
            frame,
            snapshot: snapshot.to_vec(),
        });
    }

    fn export_divergence(
        &mut self,
        peer: ConnectionId,
        frame: Frame,
        last_agreeing: Option<&[u8]>,
        local: &[u8],
        remote: &[u8],
    ) {
        self.push(ExportRecord::Divergence {
            peer,
            frame,
            last_agreeing: last_agreeing.map(<[u8]>::to_vec),
            local: local.to_vec(),
            remote: remote.to_vec(),
        });
    }
}

/// Writes raw snapshots as `desync-<peer>-<frame>-<part>.bin` under a directory.
#[derive(Debug, Clone)]
pub struct FileExporter {
    dir: PathBuf,
}

impl FileExporter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn write(&self, peer: ConnectionId, frame: Frame, part: &str, bytes: &[u8]) {
        let path = self
            .dir
            .join(format!("desync-{}-{}-{}.bin", peer, frame, part));
        let written = fs::create_dir_all(&self.dir).and_then(|_| fs::write(&path, bytes));
        match written {
            Ok(()) => info!("Wrote {}", path.display()),
            Err(e) => warn!("Failed to write {}: {}", path.display(), e),
        }
    }
}

impl DesyncExporter for FileExporter {
    fn export_local(&mut self, peer: ConnectionId, frame: Frame, snapshot: &[u8]) {
        self.write(peer, frame, "local", snapshot);
    }

    fn export_divergence(
        &mut self,
        peer: ConnectionId,
        frame: Frame,
        last_agreeing: Option<&[u8]>,
        local: &[u8],
        remote: &[u8],
    ) {
        if let Some(agreed) = last_agreeing {
            self.write(peer, frame - 1, "agreed", agreed);
        }
        self.write(peer, frame, "ours", local);
        self.write(peer, frame, "theirs", remote);
    }
}

/// A hash mismatch found while processing reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mismatch {
    pub peer: ConnectionId,
    pub frame: Frame,
    /// Encoded [`DesyncDump`] to ship to `peer` on the diagnostics channel.
    pub dump: Option<Vec<u8>>,
}

pub struct DesyncDetector {
    exporter: Box<dyn DesyncExporter>,
    pending: VecDeque<(ConnectionId, ConsistencyReport)>,
    /// Epoch at which each peer was last flagged; one detection per epoch.
    flagged: BTreeMap<ConnectionId, JleId>,
    max_frames: usize,
    max_bytes: usize,
}

impl DesyncDetector {
    pub fn new(config: &MeshConfig, exporter: Box<dyn DesyncExporter>) -> Self {
        Self {
            exporter,
            pending: VecDeque::new(),
            flagged: BTreeMap::new(),
            max_frames: config.desync_dump_max_frames,
            max_bytes: config.desync_dump_max_bytes,
        }
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn note_report(&mut self, peer: ConnectionId, report: ConsistencyReport) {
        if self.pending.len() >= MAX_PENDING_REPORTS {
            self.pending.pop_front();
        }
        self.pending.push_back((peer, report));
    }

    pub fn forget(&mut self, peer: ConnectionId) {
        self.pending.retain(|(from, _)| *from != peer);
        self.flagged.remove(&peer);
    }

    /// Compares every parked report our NCF has reached.
    pub fn process<S: Simulation>(
        &mut self,
        engine: &mut Engine<S>,
        epoch: JleId,
        coordinator: ConnectionId,
    ) -> Vec<Mismatch> {
        let ncf = engine.ncf();
        let mut mismatches = Vec::new();
        let mut waiting = VecDeque::new();

        while let Some((peer, report)) = self.pending.pop_front() {
            if report.jle_epoch != epoch || report.coordinator != coordinator {
                debug!(
                    "Skipping report from {} for epoch {} under coordinator {}",
                    peer, report.jle_epoch, report.coordinator
                );
                continue;
            }
            if report.ncf > ncf {
                waiting.push_back((peer, report));
                continue;
            }
            let local = match engine.hash_at(report.ncf) {
                Some(hash) => hash,
                None => continue,
            };
            if local == report.hash || self.flagged.get(&peer) == Some(&epoch) {
                continue;
            }

            warn!(
                "Desync with peer {} at frame {}: local {} remote {}",
                peer, report.ncf, local, report.hash
            );
            self.flagged.insert(peer, epoch);
            if let Some(snapshot) = engine.snapshot_at(report.ncf) {
                self.exporter.export_local(peer, report.ncf, snapshot);
            }
            mismatches.push(Mismatch {
                peer,
                frame: report.ncf,
                dump: self.build_dump(engine, report.ncf, epoch, coordinator),
            });
        }

        self.pending = waiting;
        mismatches
    }

    /// The contiguous run of snapshots ending at `frame`, within the caps.
    fn build_dump<S: Simulation>(
        &self,
        engine: &Engine<S>,
        frame: Frame,
        epoch: JleId,
        coordinator: ConnectionId,
    ) -> Option<Vec<u8>> {
        let from = frame - self.max_frames as Frame + 1;
        let mut snapshots: Vec<(Frame, Vec<u8>)> = engine.snapshots_between(from, frame);
        if snapshots.last().map(|(f, _)| *f) != Some(frame) {
            return None;
        }

        let mut keep = 0;
        let mut bytes = 0;
        for (i, (at, snapshot)) in snapshots.iter().enumerate().rev() {
            if *at != frame - (snapshots.len() - 1 - i) as Frame
                || bytes + snapshot.len() > self.max_bytes
            {
                break;
            }
            bytes += snapshot.len();
            keep += 1;
        }
        if keep == 0 {
            return None;
        }
        let tail = snapshots.split_off(snapshots.len() - keep);
        let dump = DesyncDump {
            jle_epoch: epoch,
            coordinator,
            start_frame: tail[0].0,
            snapshots: tail.into_iter().map(|(_, snapshot)| snapshot).collect(),
        };
        match dump.encode() {
            Ok(payload) => Some(payload),
            Err(e) => {
                warn!("Could not encode desync dump: {}", e);
                None
            }
        }
    }

    /// Handles a dump from `peer`. Returns the first diverging frame, if any.
    pub fn on_dump<S: Simulation>(
        &mut self,
        peer: ConnectionId,
        payload: &[u8],
        engine: &Engine<S>,
        epoch: JleId,
        coordinator: ConnectionId,
    ) -> Result<Option<Frame>, ProtocolError> {
        let dump = DesyncDump::decode(payload, self.max_frames, self.max_bytes)?;
        if dump.jle_epoch != epoch || dump.coordinator != coordinator {
            debug!(
                "Ignoring desync dump from {} for epoch {} (ours {})",
                peer, dump.jle_epoch, epoch
            );
            return Ok(None);
        }

        let mut last_agreeing: Option<&[u8]> = None;
        for (i, remote) in dump.snapshots.iter().enumerate() {
            let frame = dump.start_frame + i as Frame;
            let local = match engine.snapshot_at(frame) {
                Some(local) => local,
                None => {
                    last_agreeing = None;
                    continue;
                }
            };
            if local == remote.as_slice() {
                last_agreeing = Some(local);
                continue;
            }
            warn!(
                "Snapshots from peer {} first differ at frame {}",
                peer, frame
            );
            self.exporter
                .export_divergence(peer, frame, last_agreeing, local, remote);
            return Ok(Some(frame));
        }

        info!(
            "Desync dump from peer {} matched our {} frames",
            peer,
            dump.frame_count()
        );
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{InputSlot, InputVector, SimulationError, StateHash};

    #[derive(Default)]
    struct Counter(u32);

    impl Simulation for Counter {
        fn serialize(&self) -> Vec<u8> {
            self.0.to_le_bytes().to_vec()
        }

        fn deserialize(&mut self, bytes: &[u8]) -> Result<(), SimulationError> {
            let raw: [u8; 4] = bytes
                .try_into()
                .map_err(|_| SimulationError("expected 4 bytes".to_string()))?;
            self.0 = u32::from_le_bytes(raw);
            Ok(())
        }

        fn step(&mut self, inputs: &InputVector, _first_time: bool) {
            self.0 = self.0.wrapping_add(1 + inputs[0]);
        }

        fn player_join(&mut self, _slot: InputSlot, _name: &str, _data: &[u8], _first_time: bool) {}

        fn player_leave(&mut self, _slot: InputSlot, _first_time: bool) {}
    }

    fn engine() -> Engine<Counter> {
        let config = MeshConfig {
            local_frame_delay: 0,
            ..MeshConfig::default()
        };
        let mut engine = Engine::new(config, Counter::default());
        engine.start_host(0, "host", &[], 1);
        for _ in 0..10 {
            engine.tick(0).unwrap();
            engine.advance_ncf().unwrap();
        }
        engine
    }

    fn detector(exporter: &MemoryExporter) -> DesyncDetector {
        let config = MeshConfig {
            desync_dump_max_frames: 4,
            ..MeshConfig::default()
        };
        DesyncDetector::new(&config, Box::new(exporter.clone()))
    }

    fn report(engine: &mut Engine<Counter>, frame: Frame) -> ConsistencyReport {
        ConsistencyReport {
            ncf: frame,
            jle_epoch: 1,
            coordinator: 1,
            hash: engine.hash_at(frame).unwrap(),
        }
    }

    #[test]
    fn test_matching_hash_is_silent() {
        let exporter = MemoryExporter::new();
        let mut detector = detector(&exporter);
        let mut engine = engine();
        let agreeing = report(&mut engine, 8);
        detector.note_report(2, agreeing);
        assert!(detector.process(&mut engine, 1, 1).is_empty());
        assert!(exporter.records().is_empty());
    }

    #[test]
    fn test_mismatch_exports_and_builds_dump() {
        let exporter = MemoryExporter::new();
        let mut detector = detector(&exporter);
        let mut engine = engine();
        let mut bad = report(&mut engine, 9);
        bad.hash = StateHash(bad.hash.0 ^ 1);
        detector.note_report(2, bad);
        detector.note_report(2, bad);

        let found = detector.process(&mut engine, 1, 1);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].frame, 9);

        let dump = DesyncDump::decode(found[0].dump.as_ref().unwrap(), 4, usize::MAX).unwrap();
        assert_eq!(dump.start_frame, 6);
        assert_eq!(dump.frame_count(), 4);
        assert!(matches!(
            exporter.records().as_slice(),
            [ExportRecord::Local { peer: 2, frame: 9, .. }]
        ));
    }

    #[test]
    fn test_report_ahead_of_ncf_waits() {
        let exporter = MemoryExporter::new();
        let mut detector = detector(&exporter);
        let mut engine = engine();
        let ahead = ConsistencyReport {
            ncf: 50,
            jle_epoch: 1,
            coordinator: 1,
            hash: StateHash(0),
        };
        detector.note_report(2, ahead);
        assert!(detector.process(&mut engine, 1, 1).is_empty());
        assert_eq!(detector.pending(), 1);
    }

    #[test]
    fn test_other_epoch_is_not_compared() {
        let exporter = MemoryExporter::new();
        let mut detector = detector(&exporter);
        let mut engine = engine();
        let mut stale = report(&mut engine, 5);
        stale.jle_epoch = 7;
        stale.hash = StateHash(0);
        detector.note_report(2, stale);
        assert!(detector.process(&mut engine, 1, 1).is_empty());
        assert_eq!(detector.pending(), 0);
    }

    #[test]
    fn test_dump_reports_first_divergence() {
        let exporter = MemoryExporter::new();
        let mut detector = detector(&exporter);
        let engine = engine();

        let mut snapshots: Vec<Vec<u8>> = (5..=8)
            .map(|f| engine.snapshot_at(f).unwrap().to_vec())
            .collect();
        snapshots[2] = vec![0xFF; 4];
        let dump = DesyncDump {
            jle_epoch: 1,
            coordinator: 1,
            start_frame: 5,
            snapshots,
        }
        .encode()
        .unwrap();

        assert_eq!(detector.on_dump(3, &dump, &engine, 1, 1), Ok(Some(7)));
        match exporter.records().as_slice() {
            [ExportRecord::Divergence {
                peer,
                frame,
                last_agreeing,
                remote,
                ..
            }] => {
                assert_eq!((*peer, *frame), (3, 7));
                assert_eq!(last_agreeing.as_deref(), engine.snapshot_at(6));
                assert_eq!(remote, &vec![0xFF; 4]);
            }
            other => panic!("unexpected exports {:?}", other),
        }
    }

    #[test]
    fn test_oversized_dump_rejected() {
        let exporter = MemoryExporter::new();
        let mut detector = detector(&exporter);
        let engine = engine();
        let dump = DesyncDump {
            jle_epoch: 1,
            coordinator: 1,
            start_frame: 0,
            snapshots: vec![vec![0; 4]; 5],
        }
        .encode()
        .unwrap();
        assert!(matches!(
            detector.on_dump(3, &dump, &engine, 1, 1),
            Err(ProtocolError::DumpTooLarge { .. })
        ));
    }
}
