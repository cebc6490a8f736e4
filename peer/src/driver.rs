//! Runs several mesh peers in one process over the loopback transport.
//!
//! A [`Swarm`] owns a [`LoopbackHub`] and one [`MeshSession`] per peer.
//! Every [`Swarm::step`] advances the virtual network by one tick and updates
//! each live peer with scripted input, so whole sessions (joins, migrations,
//! severed links) can be replayed deterministically.

use crate::game::{Buttons, Platformer, INPUT_BITS};
use log::{debug, info};
use mesh::{LoopbackHub, LoopbackTransport, MeshEvent, MeshSession, PeerState};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use shared::{Endpoint, Frame, InternalError, MeshConfig, StateHash, Transport};
use std::time::Duration;

pub type PeerSession = MeshSession<Platformer, LoopbackTransport>;

/// Mesh settings for the platformer at `tick_rate`.
pub fn platformer_config(tick_rate: u32, frame_delay: i32) -> MeshConfig {
    MeshConfig {
        input_bits: INPUT_BITS,
        tick_rate,
        local_frame_delay: frame_delay,
        max_slots: shared::MAX_INPUT_SLOTS,
        ..MeshConfig::default()
    }
}

/// Holds a button pattern for a random number of frames, then picks another.
pub struct InputScript {
    rng: StdRng,
    current: Buttons,
    hold: u32,
}

impl InputScript {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            current: Buttons::default(),
            hold: 0,
        }
    }

    pub fn next(&mut self) -> u32 {
        if self.hold == 0 {
            self.current = Buttons::from_bits(self.rng.gen_range(0..8));
            self.hold = self.rng.gen_range(5..30);
        }
        self.hold -= 1;
        self.current.to_bits()
    }
}

struct Node {
    name: String,
    session: PeerSession,
    script: InputScript,
    alive: bool,
    /// Still connected but no longer updated.
    frozen: bool,
    events: Vec<MeshEvent>,
}

pub struct Swarm {
    hub: LoopbackHub,
    config: MeshConfig,
    tick: Duration,
    nodes: Vec<Node>,
    steps: u64,
}

impl Swarm {
    pub fn new(config: MeshConfig, latency: Duration) -> Self {
        let hub = LoopbackHub::new();
        hub.set_latency(latency);
        Self {
            hub,
            tick: config.tick_duration(),
            config,
            nodes: Vec::new(),
            steps: 0,
        }
    }

    pub fn hub(&self) -> &LoopbackHub {
        &self.hub
    }

    fn spawn(&mut self, name: &str) -> usize {
        let session = MeshSession::new(
            self.config.clone(),
            Platformer::new(self.config.tick_rate),
            self.hub.transport(),
        );
        let index = self.nodes.len();
        self.nodes.push(Node {
            name: name.to_string(),
            session,
            script: InputScript::new(index as u64 + 1),
            alive: true,
            frozen: false,
            events: Vec::new(),
        });
        index
    }

    /// Adds a peer that starts a new session.
    pub fn host(&mut self, name: &str) -> usize {
        let index = self.spawn(name);
        self.nodes[index].session.host(name, &[]);
        index
    }

    /// Adds a peer that joins through the current coordinator.
    pub fn join(&mut self, name: &str) -> Result<usize, Box<dyn std::error::Error>> {
        let target = self
            .coordinator()
            .map(|index| self.endpoint(index))
            .ok_or("no coordinator to join")?;
        Ok(self.join_at(name, target)?)
    }

    pub fn join_at(&mut self, name: &str, target: Endpoint) -> Result<usize, InternalError> {
        let index = self.spawn(name);
        self.nodes[index]
            .session
            .join(target, name, &[], None)?;
        Ok(index)
    }

    pub fn endpoint(&self, index: usize) -> Endpoint {
        self.nodes[index].session.transport().local_endpoint()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }

    pub fn name(&self, index: usize) -> &str {
        &self.nodes[index].name
    }

    pub fn session(&self, index: usize) -> &PeerSession {
        &self.nodes[index].session
    }

    pub fn session_mut(&mut self, index: usize) -> &mut PeerSession {
        &mut self.nodes[index].session
    }

    pub fn is_alive(&self, index: usize) -> bool {
        self.nodes[index].alive
    }

    /// Events seen by one peer so far.
    pub fn events(&self, index: usize) -> &[MeshEvent] {
        &self.nodes[index].events
    }

    /// Takes a peer off the network without a goodbye.
    pub fn kill(&mut self, index: usize) {
        let endpoint = self.endpoint(index);
        self.hub.kill(endpoint);
        self.nodes[index].alive = false;
        info!("Killed {} at {}", self.nodes[index].name, endpoint);
    }

    /// Stops updating a peer while its links stay open, as a hung process would.
    pub fn freeze(&mut self, index: usize) {
        self.nodes[index].frozen = true;
        info!("Froze {}", self.nodes[index].name);
    }

    pub fn thaw(&mut self, index: usize) {
        self.nodes[index].frozen = false;
    }

    /// Cuts the direct link between two peers.
    pub fn sever(&mut self, a: usize, b: usize) {
        let (a, b) = (self.endpoint(a), self.endpoint(b));
        self.hub.sever(a, b);
    }

    /// Index of the live peer currently acting as coordinator.
    pub fn coordinator(&self) -> Option<usize> {
        self.nodes
            .iter()
            .position(|node| node.alive && node.session.state() == PeerState::Coordinator)
    }

    pub fn running(&self) -> Vec<usize> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, node)| node.alive && node.session.state().is_running())
            .map(|(index, _)| index)
            .collect()
    }

    pub fn step(&mut self) {
        self.hub.advance(self.tick);
        for node in self.nodes.iter_mut().filter(|node| node.alive && !node.frozen) {
            let input = node.script.next();
            node.session.update(self.tick, input);
            for event in node.session.drain_events() {
                debug!("{}: {:?}", node.name, event);
                node.events.push(event);
            }
        }
        self.steps += 1;
    }

    pub fn run(&mut self, steps: u64) {
        for _ in 0..steps {
            self.step();
        }
    }

    /// Steps until `done` holds, giving up after `max_steps`.
    pub fn run_until(&mut self, max_steps: u64, done: impl Fn(&Swarm) -> bool) -> bool {
        for _ in 0..max_steps {
            if done(self) {
                return true;
            }
            self.step();
        }
        done(self)
    }

    /// Every running peer's NCF reaches at least `frame`.
    pub fn all_reached(&self, frame: Frame) -> bool {
        let running = self.running();
        !running.is_empty()
            && running
                .iter()
                .all(|index| self.nodes[*index].session.ncf() >= frame)
    }

    /// Lowest NCF among running peers.
    pub fn common_frame(&self) -> Option<Frame> {
        self.running()
            .iter()
            .map(|index| self.nodes[*index].session.ncf())
            .min()
    }

    /// State hash of every running peer at the lowest common NCF.
    pub fn hashes(&mut self) -> Vec<(usize, Option<StateHash>)> {
        let frame = match self.common_frame() {
            Some(frame) => frame,
            None => return Vec::new(),
        };
        self.running()
            .into_iter()
            .map(|index| (index, self.nodes[index].session.state_hash(frame)))
            .collect()
    }

    /// True when every running peer holds the same state at the common NCF.
    pub fn converged(&mut self) -> bool {
        let hashes = self.hashes();
        match hashes.first() {
            Some((_, Some(first))) => hashes.iter().all(|(_, hash)| *hash == Some(*first)),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn swarm() -> Swarm {
        Swarm::new(platformer_config(60, 2), Duration::from_millis(10))
    }

    #[test]
    fn test_script_is_reproducible() {
        let mut a = InputScript::new(7);
        let mut b = InputScript::new(7);
        let left: Vec<u32> = (0..100).map(|_| a.next()).collect();
        let right: Vec<u32> = (0..100).map(|_| b.next()).collect();
        assert_eq!(left, right);
        assert!(left.iter().all(|bits| *bits < 8));
    }

    #[test]
    fn test_host_runs_alone() {
        let mut swarm = swarm();
        let host = swarm.host("host");
        swarm.run(30);
        assert_eq!(swarm.coordinator(), Some(host));
        assert!(swarm.session(host).ncf() > 0);
        assert!(swarm.converged());
    }

    #[test]
    fn test_join_without_coordinator_fails() {
        let mut swarm = swarm();
        assert!(swarm.join("lost").is_err());
    }

    #[test]
    fn test_two_peers_converge() {
        let mut swarm = swarm();
        swarm.host("host");
        let guest = swarm.join("guest").unwrap();
        assert!(swarm.run_until(300, |s| s.running().len() == 2 && s.all_reached(60)));
        assert!(swarm.converged());
        assert_eq!(swarm.session(guest).state(), PeerState::ApplicationConnected);
        assert_eq!(swarm.session(guest).simulation().players().len(), 2);
    }

    #[test]
    fn test_frozen_peer_stops_advancing() {
        let mut swarm = swarm();
        let host = swarm.host("host");
        swarm.run(10);
        swarm.freeze(host);
        let frame = swarm.session(host).simulation_frame();
        swarm.run(10);
        assert_eq!(swarm.session(host).simulation_frame(), frame);
        assert!(swarm.is_alive(host));

        swarm.thaw(host);
        swarm.run(5);
        assert_eq!(swarm.session(host).simulation_frame(), frame + 5);
    }

    #[test]
    fn test_swarm_paced_by_interval() {
        tokio_test::block_on(async {
            let mut swarm = swarm();
            swarm.host("host");
            swarm.join("guest").unwrap();

            let mut timer = tokio::time::interval(Duration::from_millis(1));
            for _ in 0..240 {
                timer.tick().await;
                swarm.step();
            }

            assert_eq!(swarm.steps(), 240);
            assert_eq!(swarm.running().len(), 2);
            assert!(swarm.converged());
        });
    }
}
