//! Monsters that need per-second attention.
//!
//! A monster is on the list while someone can observe it or it has unfinished
//! business (enemies, poison). The update may remove members, including ones
//! later in the same pass; those are skipped rather than visited stale.

use super::{capitalize, Creature, World};
use crate::prelude::*;
use rand::Rng;

#[derive(Debug, Default)]
pub struct ActiveList {
    members: Vec<CreatureId>,
}
impl ActiveList {
    pub fn len(&self) -> usize {
        self.members.len()
    }
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
    pub fn contains(&self, id: CreatureId) -> bool {
        self.members.contains(&id)
    }
    /// False if it was already a member.
    pub fn add(&mut self, id: CreatureId) -> bool {
        if self.contains(id) {
            return false;
        }
        self.members.push(id);
        true
    }
    pub fn remove(&mut self, id: CreatureId) -> bool {
        match self.members.iter().position(|m| *m == id) {
            Some(at) => {
                self.members.remove(at);
                true
            }
            None => false,
        }
    }
    pub fn snapshot(&self) -> Vec<CreatureId> {
        self.members.clone()
    }
    pub fn iter(&self) -> impl Iterator<Item = CreatureId> + '_ {
        self.members.iter().copied()
    }
}

impl World {
    pub fn add_active(&mut self, id: CreatureId) {
        match self.creatures.get(id) {
            Some(c) if !c.is_player() => {
                self.active.add(id);
            }
            Some(c) => log::warn!("{} is a player and can't be made active", c.name),
            None => log::warn!("tried to activate missing creature {id}"),
        }
    }
    /// Removing something that is not on the list is reported, not fatal.
    pub fn del_active(&mut self, id: CreatureId, mut inboxes: Inboxes) {
        if !self.active.remove(id) {
            let name = self.creatures.get(id).map_or_else(|| id.to_string(), |c| c.name.clone());
            self.warn_staff(&format!("{name} was removed from the active list but was not on it."), &mut inboxes);
        }
    }
    pub fn is_active(&self, id: CreatureId) -> bool {
        self.active.contains(id)
    }

    /// Gives every member at the start of the pass one update.
    pub fn update_active(&mut self, now: u64, mut inboxes: Inboxes) {
        let is_day = self.timers.calendar.is_day();
        for id in self.active.snapshot() {
            if !self.active.contains(id) {
                continue;
            }
            let Some(creature) = self.creatures.get(id) else {
                log::warn!("released creature {id} was still on the active list");
                self.active.remove(id);
                continue;
            };
            let name = creature.name.clone();
            let poisoned = creature.poison > 0;
            let Some(monster) = creature.monster() else {
                log::warn!("player {name} was on the active list");
                self.active.remove(id);
                continue;
            };
            let flags = monster.flags;
            let fighting = !monster.enemies.is_empty();
            let Some(room) = creature.room.filter(|r| self.rooms.contains(*r)) else {
                self.warn_staff(&format!("{name} is active but in no room. Deleting."), &mut inboxes);
                self.destroy(id);
                continue;
            };
            let (players_here, staff_here) = self.occupancy(room);

            let wrong_time = (flags.night_only && is_day) || (flags.day_only && !is_day);
            if wrong_time && !staff_here {
                self.room_broadcast(room, None, &format!("{} wanders slowly away.\n", capitalize(&name)), &mut inboxes);
                self.destroy(id);
                continue;
            }
            let keep_going = flags.always_active || flags.aggressive || flags.regenerates || fighting || poisoned;
            if !players_here && !keep_going {
                self.active.remove(id);
                continue;
            }

            if flags.hunts_monsters {
                self.hunt_monsters(id, room);
            }
            if self.pulse_creature(id, now, inboxes.reborrow()) {
                continue;
            }
            let fighting = self.creatures.get(id).and_then(Creature::monster).is_some_and(|m| !m.enemies.is_empty());
            if !players_here && !fighting && self.roll_wander(id) {
                self.room_broadcast(room, None, &format!("{} wanders away.\n", capitalize(&name)), &mut inboxes);
                self.destroy(id);
                continue;
            }
            self.update_combat(id, room, now, inboxes.reborrow());
            if flags.aggressive && self.creatures.contains(id) {
                self.pick_target(id, room, &mut inboxes);
            }
        }
    }

    /// Whether any players, and any staff, are in the room.
    fn occupancy(&self, room: RoomId) -> (bool, bool) {
        let Some(r) = self.rooms.get(room) else { return (false, false) };
        let staff = r
            .players
            .iter()
            .filter_map(|p| self.creatures.get(*p))
            .any(|c| c.role().is_some_and(Role::is_staff));
        (!r.players.is_empty(), staff)
    }
    fn hunt_monsters(&mut self, id: CreatureId, room: RoomId) {
        let Some(name) = self.creatures.get(id).map(|c| c.name.clone()) else { return };
        let Some(r) = self.rooms.get(room) else { return };
        let prey: Vec<CreatureId> = r
            .monsters
            .iter()
            .copied()
            .filter(|m| *m != id)
            .filter(|m| self.creatures.get(*m).is_some_and(|c| c.name != name))
            .collect();
        if let Some(monster) = self.creatures.get_mut(id).and_then(Creature::monster_mut) {
            for target in prey {
                if !monster.enemies.contains(&target) {
                    monster.enemies.push(target);
                }
            }
        }
    }
    /// Effects wearing off, regeneration and poison. True if the creature died.
    fn pulse_creature(&mut self, id: CreatureId, now: u64, inboxes: Inboxes) -> bool {
        let Some(creature) = self.creatures.get_mut(id) else { return true };
        creature.effects.retain(|e| e.expires > now);
        let regenerates = creature.monster().is_some_and(|m| m.flags.regenerates);
        if creature.hp < creature.max_hp && (regenerates || now % 10 == 0) {
            creature.hp += 1;
        }
        if creature.poison > 0 {
            creature.poison -= 1;
            return self.damage(id, 1, inboxes);
        }
        false
    }
    fn roll_wander(&mut self, id: CreatureId) -> bool {
        let chance = self.creatures.get(id).and_then(Creature::monster).map_or(0, |m| m.wander_chance);
        chance > 0 && self.rng.random_range(1..=100u8) <= chance
    }
    fn update_combat(&mut self, id: CreatureId, room: RoomId, now: u64, mut inboxes: Inboxes) {
        let Some(monster) = self.creatures.get(id).and_then(Creature::monster) else { return };
        let in_room = |target: &CreatureId| self.creatures.get(*target).is_some_and(|c| c.room == Some(room));
        let target = monster.target.or_else(|| monster.enemies.iter().copied().find(|t| in_room(t)));
        let Some(target) = target else { return };
        let present = in_room(&target);
        let Some(monster) = self.creatures.get_mut(id).and_then(Creature::monster_mut) else { return };
        if !present {
            monster.target = None;
            monster.enemies.retain(|e| *e != target);
            return;
        }
        monster.target = Some(target);
        if now.saturating_sub(monster.last_attack) < super::ATTACK_DELAY {
            return;
        }
        monster.last_attack = now;
        let damage = monster.damage;
        let attacker = self.creatures.get(id).map(|c| capitalize(&c.name)).unwrap_or_default();
        let victim = self.creatures.get(target).map(|c| c.name.clone()).unwrap_or_default();
        self.tell(target, &format!("{attacker} hits you.\n"), &mut inboxes);
        self.room_broadcast(room, Some(target), &format!("{attacker} hits {victim}.\n"), &mut inboxes);
        self.damage(target, damage, inboxes);
    }
    /// An aggressive monster with nothing to fight picks one non-staff player in the room.
    fn pick_target(&mut self, id: CreatureId, room: RoomId, inboxes: &mut Inboxes) {
        if self.creatures.get(id).and_then(Creature::monster).map_or(true, |m| !m.enemies.is_empty()) {
            return;
        }
        let Some(r) = self.rooms.get(room) else { return };
        let victim = r
            .players
            .iter()
            .copied()
            .find(|p| self.creatures.get(*p).is_some_and(|c| !c.role().is_some_and(Role::is_staff)));
        let Some(victim) = victim else { return };
        if let Some(monster) = self.creatures.get_mut(id).and_then(Creature::monster_mut) {
            monster.enemies.push(victim);
            monster.target = Some(victim);
        }
        let attacker = self.creatures.get(id).map(|c| capitalize(&c.name)).unwrap_or_default();
        let victim_name = self.creatures.get(victim).map(|c| c.name.clone()).unwrap_or_default();
        self.tell(victim, &format!("{attacker} attacks you!\n"), inboxes);
        self.room_broadcast(room, Some(victim), &format!("{attacker} attacks {victim_name}!\n"), inboxes);
    }
}
