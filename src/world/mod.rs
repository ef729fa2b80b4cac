use crate::prelude::*;
use crate::config::{IntervalConfig, WorldConfig};
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

mod active;
mod clock;
mod delayed;
#[cfg(test)]
mod tests;

pub use active::ActiveList;
pub use clock::{Calendar, Throttle, Weather, WorldTimers};
pub use delayed::{ActionKind, DelayedAction, DelayedQueue, ScheduleError};

/// Continuation of a delayed action. Receives the actor and the context string it was queued with.
pub type DelayedFn = Box<dyn FnOnce(&mut World, CreatureId, &str, Inboxes<'_>)>;

const PLAYER_HP: i32 = 20;
const ATTACK_DELAY: u64 = 3;
const MAX_ROOM_MONSTERS: usize = 4;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonsterFlags {
    /// Stays on the active list with nobody around.
    pub always_active: bool,
    pub aggressive: bool,
    pub day_only: bool,
    pub night_only: bool,
    /// Attacks monsters that don't share its name.
    pub hunts_monsters: bool,
    pub regenerates: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonsterTemplate {
    pub name: String,
    #[serde(default)]
    pub flags: MonsterFlags,
    #[serde(default = "default_hp")]
    pub hp: i32,
    #[serde(default = "default_damage")]
    pub damage: i32,
    /// Percent chance per update of leaving when nothing holds it here.
    #[serde(default = "default_wander_chance")]
    pub wander_chance: u8,
}
impl MonsterTemplate {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            flags: MonsterFlags::default(),
            hp: default_hp(),
            damage: default_damage(),
            wander_chance: default_wander_chance(),
        }
    }
}
fn default_hp() -> i32 {
    10
}
fn default_damage() -> i32 {
    1
}
fn default_wander_chance() -> u8 {
    5
}

#[derive(Debug)]
pub struct Monster {
    pub flags: MonsterFlags,
    pub enemies: Vec<CreatureId>,
    pub target: Option<CreatureId>,
    pub damage: i32,
    pub wander_chance: u8,
    pub last_attack: u64,
}

#[derive(Debug)]
pub enum Kind {
    Player { conn: ConnKey, role: Role },
    Monster(Monster),
}

#[derive(Debug)]
pub struct Effect {
    pub name: String,
    pub expires: u64,
}

#[derive(Debug)]
pub struct Creature {
    pub name: String,
    /// Lookup key only; the room's own lists decide who is in it.
    pub room: Option<RoomId>,
    pub hp: i32,
    pub max_hp: i32,
    pub poison: u32,
    pub effects: Vec<Effect>,
    pub kind: Kind,
}
impl Creature {
    pub fn is_player(&self) -> bool {
        matches!(self.kind, Kind::Player { .. })
    }
    pub fn monster(&self) -> Option<&Monster> {
        match &self.kind {
            Kind::Monster(m) => Some(m),
            Kind::Player { .. } => None,
        }
    }
    pub fn monster_mut(&mut self) -> Option<&mut Monster> {
        match &mut self.kind {
            Kind::Monster(m) => Some(m),
            Kind::Player { .. } => None,
        }
    }
    pub fn conn(&self) -> Option<ConnKey> {
        match self.kind {
            Kind::Player { conn, .. } => Some(conn),
            Kind::Monster(_) => None,
        }
    }
    pub fn role(&self) -> Option<Role> {
        match self.kind {
            Kind::Player { role, .. } => Some(role),
            Kind::Monster(_) => None,
        }
    }
}

#[derive(Debug)]
pub struct Room {
    pub name: String,
    pub description: String,
    pub water: bool,
    pub exits: Vec<(String, RoomId)>,
    pub players: Vec<CreatureId>,
    pub monsters: Vec<CreatureId>,
    pub spawns: Vec<MonsterTemplate>,
    pub spawn_chance: u8,
}

pub struct World {
    creatures: SlotMap<CreatureId, Creature>,
    rooms: SlotMap<RoomId, Room>,
    room_names: HashMap<String, RoomId>,
    start_room: RoomId,
    players: HashMap<String, CreatureId>,
    active: ActiveList,
    delayed: DelayedQueue<DelayedFn>,
    timers: WorldTimers,
    started: bool,
    last_update: u64,
    rng: StdRng,
}
impl World {
    pub fn new(config: &WorldConfig, intervals: &IntervalConfig) -> Self {
        Self::with_rng(config, intervals, StdRng::from_os_rng())
    }
    pub fn seeded(config: &WorldConfig, intervals: &IntervalConfig, seed: u64) -> Self {
        Self::with_rng(config, intervals, StdRng::seed_from_u64(seed))
    }
    fn with_rng(config: &WorldConfig, intervals: &IntervalConfig, rng: StdRng) -> Self {
        let mut rooms = SlotMap::new();
        let mut room_names = HashMap::new();
        for spec in &config.rooms {
            let id = rooms.insert(Room {
                name: spec.name.clone(),
                description: spec.description.clone(),
                water: spec.water,
                exits: vec![],
                players: vec![],
                monsters: vec![],
                spawns: spec.spawns.clone(),
                spawn_chance: spec.spawn_chance,
            });
            room_names.insert(spec.name.to_lowercase(), id);
        }
        for spec in &config.rooms {
            let exits = spec
                .exits
                .iter()
                .filter_map(|(exit, to)| match room_names.get(&to.to_lowercase()) {
                    Some(id) => Some((exit.clone(), *id)),
                    None => {
                        log::warn!("exit {exit} of {} leads to unknown room {to}", spec.name);
                        None
                    }
                })
                .collect();
            if let Some(room) = room_names.get(&spec.name.to_lowercase()).and_then(|id| rooms.get_mut(*id)) {
                room.exits = exits;
            }
        }
        let start_room = match room_names.get(&config.start_room.to_lowercase()) {
            Some(id) => *id,
            None => {
                log::warn!("start room {} does not exist, using the void", config.start_room);
                let id = rooms.insert(Room {
                    name: "The Void".to_owned(),
                    description: "Nothing at all.".to_owned(),
                    water: false,
                    exits: vec![],
                    players: vec![],
                    monsters: vec![],
                    spawns: vec![],
                    spawn_chance: 0,
                });
                room_names.insert("the void".to_owned(), id);
                id
            }
        };
        let mut world = Self {
            creatures: SlotMap::new(),
            rooms,
            room_names,
            start_room,
            players: HashMap::new(),
            active: ActiveList::default(),
            delayed: DelayedQueue::default(),
            timers: WorldTimers {
                calendar: Calendar::default(),
                weather: Weather::Clear,
                hour: Throttle::new(intervals.seconds_per_hour),
                weather_update: Throttle::new(intervals.weather),
                random_update: Throttle::new(intervals.random),
            },
            started: false,
            last_update: 0,
            rng,
        };
        for spec in &config.rooms {
            let Some(room) = world.room_named(&spec.name) else { continue };
            for resident in &spec.residents {
                world.spawn(resident, room);
            }
        }
        world
    }

    pub fn creature(&self, id: CreatureId) -> Option<&Creature> {
        self.creatures.get(id)
    }
    pub fn creature_mut(&mut self, id: CreatureId) -> Option<&mut Creature> {
        self.creatures.get_mut(id)
    }
    pub fn room(&self, id: RoomId) -> Option<&Room> {
        self.rooms.get(id)
    }
    pub fn room_named(&self, name: &str) -> Option<RoomId> {
        self.room_names.get(&name.to_lowercase()).copied()
    }
    pub fn start_room(&self) -> RoomId {
        self.start_room
    }
    pub fn player_named(&self, name: &str) -> Option<CreatureId> {
        self.players.get(&name.to_lowercase()).copied()
    }
    pub fn players(&self) -> impl Iterator<Item = (CreatureId, &Creature)> {
        self.players.values().filter_map(|id| self.creatures.get(*id).map(|c| (*id, c)))
    }
    pub fn player_count(&self) -> usize {
        self.players.len()
    }
    pub fn role_of(&self, id: CreatureId) -> Option<Role> {
        self.creatures.get(id).and_then(Creature::role)
    }
    pub fn active(&self) -> &ActiveList {
        &self.active
    }
    pub fn calendar(&self) -> Calendar {
        self.timers.calendar
    }
    pub fn weather(&self) -> Weather {
        self.timers.weather
    }
    pub fn timers(&self) -> WorldTimers {
        self.timers
    }
    pub fn restore_timers(&mut self, timers: WorldTimers) {
        self.timers = timers;
        self.started = true;
    }
    /// The world clock: the second of the most recent update.
    pub fn now(&self) -> u64 {
        self.last_update
    }

    pub fn login(&mut self, conn: ConnKey, name: &str, role: Role, room: Option<RoomId>, mut inboxes: Inboxes) -> CreatureId {
        let room = room.filter(|r| self.rooms.contains(*r)).unwrap_or(self.start_room);
        let id = self.creatures.insert(Creature {
            name: name.to_owned(),
            room: None,
            hp: PLAYER_HP,
            max_hp: PLAYER_HP,
            poison: 0,
            effects: vec![],
            kind: Kind::Player { conn, role },
        });
        self.players.insert(name.to_lowercase(), id);
        if let Some(mut inbox) = inboxes.get(conn) {
            inbox.set_player(Some(id));
        }
        log::info!("{name} entered the world");
        self.place(id, room, &mut inboxes);
        id
    }
    pub fn logout(&mut self, id: CreatureId, mut inboxes: Inboxes) {
        let Some(name) = self.creatures.get(id).map(|c| c.name.clone()) else { return };
        self.delayed.remove_all(id);
        self.unplace(id, &mut inboxes);
        self.players.remove(&name.to_lowercase());
        self.forget(id);
        self.active.remove(id);
        self.creatures.release(id);
        log::info!("{name} left the world");
    }
    pub fn move_creature(&mut self, id: CreatureId, to: RoomId, mut inboxes: Inboxes) {
        if !self.rooms.contains(to) || !self.creatures.contains(id) {
            return;
        }
        self.unplace(id, &mut inboxes);
        self.place(id, to, &mut inboxes);
    }
    /// Creates a monster in `room`. It joins the active list if anyone is there to see it.
    pub fn spawn(&mut self, template: &MonsterTemplate, room: RoomId) -> CreatureId {
        let id = self.creatures.insert(Creature {
            name: template.name.clone(),
            room: Some(room),
            hp: template.hp,
            max_hp: template.hp,
            poison: 0,
            effects: vec![],
            kind: Kind::Monster(Monster {
                flags: template.flags,
                enemies: vec![],
                target: None,
                damage: template.damage,
                wander_chance: template.wander_chance,
                last_attack: 0,
            }),
        });
        let mut players_here = false;
        if let Some(r) = self.rooms.get_mut(room) {
            r.monsters.push(id);
            players_here = !r.players.is_empty();
        }
        if template.flags.always_active || players_here {
            self.add_active(id);
        }
        id
    }
    /// Removes a creature from everything that refers to it.
    pub fn destroy(&mut self, id: CreatureId) {
        let Some(creature) = self.creatures.get(id) else { return };
        if creature.is_player() {
            log::warn!("refusing to destroy player {}", creature.name);
            return;
        }
        if let Some(room) = creature.room.and_then(|r| self.rooms.get_mut(r)) {
            room.monsters.retain(|m| *m != id);
        }
        self.delayed.remove_all(id);
        self.active.remove(id);
        self.forget(id);
        self.creatures.release(id);
    }
    /// Applies damage. Interrupts whatever the victim was doing; true if it died.
    pub fn damage(&mut self, victim: CreatureId, amount: i32, mut inboxes: Inboxes) -> bool {
        let Some(creature) = self.creatures.get_mut(victim) else { return false };
        creature.hp -= amount;
        let dead = creature.hp <= 0;
        self.interrupt_delayed(victim, inboxes.reborrow());
        if !dead {
            return false;
        }
        let Some(creature) = self.creatures.get_mut(victim) else { return true };
        let name = capitalize(&creature.name);
        let room = creature.room;
        if creature.is_player() {
            creature.hp = creature.max_hp;
            creature.poison = 0;
            self.forget(victim);
            self.tell(victim, "You have been slain!\n", &mut inboxes);
            if let Some(room) = room {
                self.room_broadcast(room, Some(victim), &format!("{name} has been slain!\n"), &mut inboxes);
            }
            self.unplace(victim, &mut inboxes);
            self.place(victim, self.start_room, &mut inboxes);
        } else {
            if let Some(room) = room {
                self.room_broadcast(room, None, &format!("{name} dies.\n"), &mut inboxes);
            }
            self.destroy(victim);
        }
        true
    }

    fn place(&mut self, id: CreatureId, room: RoomId, inboxes: &mut Inboxes) {
        let Some(creature) = self.creatures.get_mut(id) else { return };
        creature.room = Some(room);
        let is_player = creature.is_player();
        let name = creature.name.clone();
        let Some(r) = self.rooms.get_mut(room) else { return };
        if !is_player {
            r.monsters.push(id);
            return;
        }
        r.players.push(id);
        let monsters = r.monsters.clone();
        self.room_broadcast(room, Some(id), &format!("{name} arrives.\n"), inboxes);
        for monster in monsters {
            self.add_active(monster);
        }
    }
    fn unplace(&mut self, id: CreatureId, inboxes: &mut Inboxes) {
        let Some(creature) = self.creatures.get_mut(id) else { return };
        let Some(room) = creature.room.take() else { return };
        let name = creature.name.clone();
        let is_player = creature.is_player();
        if let Some(r) = self.rooms.get_mut(room) {
            r.players.retain(|p| *p != id);
            r.monsters.retain(|m| *m != id);
        }
        if is_player {
            self.room_broadcast(room, Some(id), &format!("{name} leaves.\n"), inboxes);
        }
    }
    /// Drops `id` from every monster's enemies.
    fn forget(&mut self, id: CreatureId) {
        for (_, creature) in self.creatures.iter_mut() {
            if let Some(monster) = creature.monster_mut() {
                monster.enemies.retain(|e| *e != id);
                if monster.target == Some(id) {
                    monster.target = None;
                }
            }
        }
    }

    pub(crate) fn tell(&self, id: CreatureId, text: &str, inboxes: &mut Inboxes) {
        let Some(conn) = self.creatures.get(id).and_then(Creature::conn) else { return };
        if let Some(mut inbox) = inboxes.get(conn) {
            inbox.print(text);
        }
    }
    pub fn room_broadcast(&self, room: RoomId, except: Option<CreatureId>, text: &str, inboxes: &mut Inboxes) {
        let Some(r) = self.rooms.get(room) else { return };
        for player in &r.players {
            if Some(*player) != except {
                self.tell(*player, text, inboxes);
            }
        }
    }
    pub fn broadcast_players(&self, text: &str, inboxes: &mut Inboxes) {
        for id in self.players.values() {
            self.tell(*id, text, inboxes);
        }
    }
    /// Warnings about broken invariants go to the log and to staff in game.
    pub fn warn_staff(&self, text: &str, inboxes: &mut Inboxes) {
        log::warn!("{text}");
        for (id, creature) in self.players() {
            if creature.role().is_some_and(Role::is_staff) {
                self.tell(id, &format!("*** {text}\n"), inboxes);
            }
        }
    }

    pub fn describe_room(&self, room: RoomId, viewer: Option<CreatureId>) -> String {
        let Some(r) = self.rooms.get(room) else { return String::new() };
        let mut out = format!("{}\n{}\n", r.name, r.description);
        if r.exits.is_empty() {
            out.push_str("There are no obvious exits.\n");
        } else {
            let exits: Vec<&str> = r.exits.iter().map(|(name, _)| name.as_str()).collect();
            out.push_str(&format!("Exits: {}.\n", exits.join(", ")));
        }
        let others: Vec<&str> = r
            .players
            .iter()
            .chain(&r.monsters)
            .filter(|id| Some(**id) != viewer)
            .filter_map(|id| self.creatures.get(*id))
            .map(|c| c.name.as_str())
            .collect();
        if !others.is_empty() {
            out.push_str(&format!("You see {}.\n", others.join(", ")));
        }
        out
    }
    /// One line per player, with what they are busy doing.
    pub fn who(&self) -> String {
        let mut lines: Vec<String> = self
            .players()
            .map(|(id, c)| format!("{}{}", c.name, self.delayed.describe(id)))
            .collect();
        lines.sort();
        let mut out = lines.join("\n");
        out.push_str(&format!("\n{} player(s) online.\n", lines.len()));
        out
    }

    pub fn add_delayed(
        &mut self,
        actor: CreatureId,
        kind: ActionKind,
        delay: u64,
        context: &str,
        callback: DelayedFn,
    ) -> Result<(), ScheduleError> {
        if kind.players_only() && !self.creatures.get(actor).is_some_and(Creature::is_player) {
            return Err(ScheduleError::PlayersOnly(kind));
        }
        self.delayed.add(DelayedAction {
            actor,
            kind,
            due: self.last_update + delay,
            context: context.to_owned(),
            interruptible: kind != ActionKind::Script,
            callback,
        })
    }
    pub fn has_action(&self, actor: CreatureId, kind: ActionKind) -> bool {
        self.delayed.has_action(actor, kind)
    }
    /// Cancels what the actor is channelling. True if anything was cancelled.
    pub fn interrupt_delayed(&mut self, actor: CreatureId, mut inboxes: Inboxes) -> bool {
        let interrupted = self.delayed.interrupt(actor);
        if interrupted {
            self.tell(actor, "You stop what you are doing.\n", &mut inboxes);
        }
        interrupted
    }
    fn fire_delayed(&mut self, now: u64, mut inboxes: Inboxes) {
        for action in self.delayed.take_due(now) {
            if !self.creatures.contains(action.actor) {
                log::debug!("dropping {:?} for a creature that is gone", action.kind);
                continue;
            }
            (action.callback)(self, action.actor, &action.context, inboxes.reborrow());
        }
    }

    /// The world part of a reactor pass. Runs at most once per second of `now`.
    pub fn update_game(&mut self, now: u64, mut inboxes: Inboxes) {
        if now == self.last_update {
            return;
        }
        self.last_update = now;
        if !self.started {
            self.started = true;
            self.timers.hour.last = now;
            self.timers.weather_update.last = now;
            self.timers.random_update.last = now;
        }

        self.fire_delayed(now, inboxes.reborrow());
        if self.timers.hour.ready(now) {
            if let Some(text) = self.timers.calendar.advance() {
                self.broadcast_players(&format!("{text}\n"), &mut inboxes);
            }
        }
        if self.timers.weather_update.ready(now) {
            self.update_weather(&mut inboxes);
        }
        if self.timers.random_update.ready(now) {
            self.update_random(&mut inboxes);
        }
        self.update_active(now, inboxes);
    }
    fn update_weather(&mut self, inboxes: &mut Inboxes) {
        let roll = self.rng.random_range(1..=100);
        let next = match roll {
            1..=20 => self.timers.weather.shift(1),
            21..=40 => self.timers.weather.shift(-1),
            _ => self.timers.weather,
        };
        if next != self.timers.weather {
            self.timers.weather = next;
            self.broadcast_players(&format!("{}\n", next.announcement()), inboxes);
        }
    }
    /// Random arrivals in rooms that have players in them.
    fn update_random(&mut self, inboxes: &mut Inboxes) {
        let is_day = self.timers.calendar.is_day();
        let rooms: Vec<RoomId> = self
            .rooms
            .iter()
            .filter(|(_, r)| !r.players.is_empty() && r.spawn_chance > 0 && r.monsters.len() < MAX_ROOM_MONSTERS)
            .map(|(id, _)| id)
            .collect();
        for room in rooms {
            let Some(r) = self.rooms.get(room) else { continue };
            let candidates: Vec<&MonsterTemplate> = r
                .spawns
                .iter()
                .filter(|t| !(t.flags.night_only && is_day) && !(t.flags.day_only && !is_day))
                .collect();
            if candidates.is_empty() || self.rng.random_range(1..=100) > r.spawn_chance {
                continue;
            }
            let template = candidates[self.rng.random_range(0..candidates.len())].clone();
            self.spawn(&template, room);
            self.room_broadcast(room, None, &format!("{} arrives.\n", capitalize(&template.name)), inboxes);
        }
    }
}

pub(crate) fn capitalize(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
