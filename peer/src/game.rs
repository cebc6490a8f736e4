//! A small deterministic platformer driven by the mesh.
//!
//! Each input slot owns one player. Inputs are packed into three bits
//! (left, right, jump); everything else is derived from them, so peers that
//! agree on inputs agree on the world.

use serde::{Deserialize, Serialize};
use shared::{InputSlot, InputVector, Simulation, SimulationError};
use std::collections::BTreeMap;

pub const GRAVITY: f32 = 980.0;
pub const PLAYER_SPEED: f32 = 300.0;
pub const JUMP_VELOCITY: f32 = -400.0;
pub const FLOOR_Y: f32 = 550.0;
pub const WORLD_WIDTH: f32 = 800.0;
pub const PLAYER_SIZE: f32 = 32.0;

/// Wire width of one packed [`Buttons`] value.
pub const INPUT_BITS: u8 = 3;

const LEFT: u32 = 1;
const RIGHT: u32 = 1 << 1;
const JUMP: u32 = 1 << 2;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Buttons {
    pub left: bool,
    pub right: bool,
    pub jump: bool,
}

impl Buttons {
    pub fn to_bits(self) -> u32 {
        let mut bits = 0;
        if self.left {
            bits |= LEFT;
        }
        if self.right {
            bits |= RIGHT;
        }
        if self.jump {
            bits |= JUMP;
        }
        bits
    }

    pub fn from_bits(bits: u32) -> Self {
        Self {
            left: bits & LEFT != 0,
            right: bits & RIGHT != 0,
            jump: bits & JUMP != 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Player {
    pub name: String,
    pub x: f32,
    pub y: f32,
    pub vel_x: f32,
    pub vel_y: f32,
    pub on_ground: bool,
}

impl Player {
    /// Spawns on the floor, spread out by slot.
    pub fn spawn(slot: InputSlot, name: &str) -> Self {
        Self {
            name: name.to_string(),
            x: 64.0 + slot as f32 * 96.0,
            y: FLOOR_Y - PLAYER_SIZE,
            vel_x: 0.0,
            vel_y: 0.0,
            on_ground: true,
        }
    }

    pub fn bounds(&self) -> (f32, f32, f32, f32) {
        (self.x, self.y, self.x + PLAYER_SIZE, self.y + PLAYER_SIZE)
    }

    pub fn center(&self) -> (f32, f32) {
        (self.x + PLAYER_SIZE / 2.0, self.y + PLAYER_SIZE / 2.0)
    }

    fn apply(&mut self, buttons: Buttons) {
        self.vel_x = 0.0;
        if buttons.left {
            self.vel_x -= PLAYER_SPEED;
        }
        if buttons.right {
            self.vel_x += PLAYER_SPEED;
        }
        if buttons.jump && self.on_ground {
            self.vel_y = JUMP_VELOCITY;
            self.on_ground = false;
        }
    }

    fn integrate(&mut self, dt: f32) {
        if !self.on_ground {
            self.vel_y += GRAVITY * dt;
        }
        self.x += self.vel_x * dt;
        self.y += self.vel_y * dt;
        self.x = self.x.clamp(0.0, WORLD_WIDTH - PLAYER_SIZE);

        if self.y + PLAYER_SIZE >= FLOOR_Y {
            self.y = FLOOR_Y - PLAYER_SIZE;
            self.vel_y = 0.0;
            self.on_ground = true;
        }
        if self.y <= 0.0 {
            self.y = 0.0;
            self.vel_y = 0.0;
        }
    }
}

pub fn check_collision(a: &Player, b: &Player) -> bool {
    let (x1, y1, x2, y2) = a.bounds();
    let (x3, y3, x4, y4) = b.bounds();
    !(x2 <= x3 || x4 <= x1 || y2 <= y3 || y4 <= y1)
}

/// Pushes overlapping players apart and swaps their damped velocities.
pub fn resolve_collision(a: &mut Player, b: &mut Player) {
    if !check_collision(a, b) {
        return;
    }

    let (cx1, cy1) = a.center();
    let (cx2, cy2) = b.center();
    let dx = cx2 - cx1;
    let dy = cy2 - cy1;
    let distance = (dx * dx + dy * dy).sqrt();

    if distance < 0.001 {
        a.x -= PLAYER_SIZE / 2.0;
        b.x += PLAYER_SIZE / 2.0;
        return;
    }

    let overlap = PLAYER_SIZE - distance;
    if overlap > 0.0 {
        let nx = dx / distance;
        let ny = dy / distance;
        let separation = overlap / 2.0;
        a.x -= nx * separation;
        a.y -= ny * separation;
        b.x += nx * separation;
        b.y += ny * separation;

        a.x = a.x.clamp(0.0, WORLD_WIDTH - PLAYER_SIZE);
        a.y = a.y.clamp(0.0, FLOOR_Y - PLAYER_SIZE);
        b.x = b.x.clamp(0.0, WORLD_WIDTH - PLAYER_SIZE);
        b.y = b.y.clamp(0.0, FLOOR_Y - PLAYER_SIZE);

        let (vx, vy) = (a.vel_x, a.vel_y);
        a.vel_x = b.vel_x * 0.8;
        a.vel_y = b.vel_y * 0.8;
        b.vel_x = vx * 0.8;
        b.vel_y = vy * 0.8;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct World {
    frame: u64,
    players: BTreeMap<InputSlot, Player>,
}

/// The simulation handed to a `MeshSession`.
#[derive(Debug, Clone, PartialEq)]
pub struct Platformer {
    world: World,
    dt: f32,
    /// Frames stepped for the first time, for effects that must not repeat.
    fresh_frames: u64,
}

impl Platformer {
    pub fn new(tick_rate: u32) -> Self {
        Self {
            world: World {
                frame: 0,
                players: BTreeMap::new(),
            },
            dt: 1.0 / tick_rate.max(1) as f32,
            fresh_frames: 0,
        }
    }

    pub fn frame(&self) -> u64 {
        self.world.frame
    }

    pub fn players(&self) -> &BTreeMap<InputSlot, Player> {
        &self.world.players
    }

    pub fn fresh_frames(&self) -> u64 {
        self.fresh_frames
    }

    fn handle_collisions(&mut self) {
        let slots: Vec<InputSlot> = self.world.players.keys().copied().collect();
        for i in 0..slots.len() {
            for j in (i + 1)..slots.len() {
                let (a, b) = (slots[i], slots[j]);
                if let (Some(mut first), Some(mut second)) = (
                    self.world.players.get(&a).cloned(),
                    self.world.players.get(&b).cloned(),
                ) {
                    resolve_collision(&mut first, &mut second);
                    self.world.players.insert(a, first);
                    self.world.players.insert(b, second);
                }
            }
        }
    }
}

impl Simulation for Platformer {
    fn serialize(&self) -> Vec<u8> {
        // A BTreeMap of plain fields cannot fail to encode.
        bincode::serialize(&self.world).unwrap_or_default()
    }

    fn deserialize(&mut self, bytes: &[u8]) -> Result<(), SimulationError> {
        let world: World =
            bincode::deserialize(bytes).map_err(|e| SimulationError(e.to_string()))?;
        self.world = world;
        Ok(())
    }

    fn step(&mut self, inputs: &InputVector, first_time: bool) {
        for (slot, player) in self.world.players.iter_mut() {
            player.apply(Buttons::from_bits(inputs[*slot as usize]));
        }
        for player in self.world.players.values_mut() {
            player.integrate(self.dt);
        }
        self.handle_collisions();
        self.world.frame += 1;
        if first_time {
            self.fresh_frames += 1;
        }
    }

    fn player_join(&mut self, slot: InputSlot, name: &str, _data: &[u8], _first_time: bool) {
        self.world.players.insert(slot, Player::spawn(slot, name));
    }

    fn player_leave(&mut self, slot: InputSlot, _first_time: bool) {
        self.world.players.remove(&slot);
    }

    fn write_discovery_data(&self, out: &mut Vec<u8>) {
        out.push(self.world.players.len() as u8);
        for player in self.world.players.values() {
            out.extend_from_slice(player.name.as_bytes());
            out.push(0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    fn inputs(slot: usize, buttons: Buttons) -> InputVector {
        let mut vector = [0; shared::MAX_INPUT_SLOTS];
        vector[slot] = buttons.to_bits();
        vector
    }

    #[test]
    fn test_buttons_pack() {
        let buttons = Buttons {
            left: true,
            right: false,
            jump: true,
        };
        assert_eq!(buttons.to_bits(), 0b101);
        assert_eq!(Buttons::from_bits(0b101), buttons);
        assert!(buttons.to_bits() < 1 << INPUT_BITS);
    }

    #[test]
    fn test_spawn_on_floor() {
        let player = Player::spawn(2, "p");
        assert_eq!(player.y + PLAYER_SIZE, FLOOR_Y);
        assert!(player.on_ground);
    }

    #[test]
    fn test_run_right() {
        let mut game = Platformer::new(60);
        game.player_join(0, "a", &[], true);
        let start = game.players()[&0].x;
        let right = Buttons {
            right: true,
            ..Buttons::default()
        };
        for _ in 0..60 {
            game.step(&inputs(0, right), true);
        }
        assert_approx_eq!(game.players()[&0].x - start, PLAYER_SPEED, 0.5);
        assert_eq!(game.frame(), 60);
    }

    #[test]
    fn test_jump_lands() {
        let mut game = Platformer::new(60);
        game.player_join(0, "a", &[], true);
        let jump = Buttons {
            jump: true,
            ..Buttons::default()
        };
        game.step(&inputs(0, jump), true);
        assert!(!game.players()[&0].on_ground);
        assert!(game.players()[&0].y < FLOOR_Y - PLAYER_SIZE);

        for _ in 0..120 {
            game.step(&inputs(0, Buttons::default()), true);
        }
        let player = &game.players()[&0];
        assert!(player.on_ground);
        assert_approx_eq!(player.y, FLOOR_Y - PLAYER_SIZE, 0.001);
    }

    #[test]
    fn test_collision_resolution() {
        let mut a = Player::spawn(0, "a");
        let mut b = Player::spawn(0, "b");
        a.x = 10.0;
        a.y = 10.0;
        b.x = 20.0;
        b.y = 20.0;
        a.vel_x = 100.0;
        a.vel_y = -50.0;
        b.vel_x = -75.0;
        b.vel_y = 25.0;

        resolve_collision(&mut a, &mut b);

        assert_approx_eq!(a.vel_x, -75.0 * 0.8, 0.01);
        assert_approx_eq!(a.vel_y, 25.0 * 0.8, 0.01);
        assert_approx_eq!(b.vel_x, 100.0 * 0.8, 0.01);
        assert_approx_eq!(b.vel_y, -50.0 * 0.8, 0.01);
    }

    #[test]
    fn test_same_position_separates() {
        let mut a = Player::spawn(1, "a");
        let mut b = Player::spawn(1, "b");
        resolve_collision(&mut a, &mut b);
        assert!(!check_collision(&a, &b));
    }

    #[test]
    fn test_state_roundtrip_restores_world() {
        let mut game = Platformer::new(30);
        game.player_join(0, "a", &[], true);
        game.player_join(3, "b", &[], true);
        let jump = Buttons {
            jump: true,
            ..Buttons::default()
        };
        game.step(&inputs(3, jump), true);
        let saved = game.serialize();

        game.step(&inputs(0, jump), true);
        game.player_leave(0, true);
        assert_ne!(game.serialize(), saved);

        game.deserialize(&saved).unwrap();
        assert_eq!(game.serialize(), saved);
        assert_eq!(game.frame(), 1);
        assert_eq!(game.players().len(), 2);
    }

    #[test]
    fn test_rejects_garbage_state() {
        let mut game = Platformer::new(30);
        assert!(game.deserialize(&[0xff; 3]).is_err());
    }

    #[test]
    fn test_resimulation_does_not_count_as_fresh() {
        let mut game = Platformer::new(30);
        game.step(&[0; shared::MAX_INPUT_SLOTS], true);
        game.step(&[0; shared::MAX_INPUT_SLOTS], false);
        assert_eq!(game.fresh_frames(), 1);
    }

    #[test]
    fn test_discovery_lists_names() {
        let mut game = Platformer::new(30);
        game.player_join(1, "ann", &[], true);
        let mut out = Vec::new();
        game.write_discovery_data(&mut out);
        assert_eq!(out, b"\x01ann\x00".to_vec());
    }
}
