use super::*;
use crate::config::RoomSpec;
use crate::network::Network;
use std::cell::Cell;
use std::rc::Rc;

fn room(name: &str, exits: &[(&str, &str)], residents: Vec<MonsterTemplate>) -> RoomSpec {
    RoomSpec {
        name: name.to_owned(),
        description: format!("The {name}."),
        water: false,
        exits: exits.iter().map(|(e, to)| (e.to_string(), to.to_string())).collect(),
        residents,
        spawns: vec![],
        spawn_chance: 0,
    }
}

fn world() -> World {
    let config = WorldConfig {
        start_room: "Hall".to_owned(),
        rooms: vec![
            room("Hall", &[("east", "Den")], vec![]),
            room("Den", &[("west", "Hall")], vec![MonsterTemplate::named("a sewer rat")]),
        ],
    };
    World::seeded(&config, &IntervalConfig::default(), 7)
}

fn conn(idx: u32) -> ConnKey {
    ConnKey::from_parts(idx, 0)
}

fn still(name: &str) -> MonsterTemplate {
    let mut template = MonsterTemplate::named(name);
    template.wander_chance = 0;
    template
}

#[test]
fn monsters_are_active_only_while_watched() {
    let mut network = Network::new(4).unwrap();
    let mut world = world();
    let hall = world.room_named("hall").unwrap();
    let den = world.room_named("Den").unwrap();
    let rat = world.room(den).unwrap().monsters[0];
    assert!(!world.is_active(rat));

    let alice = world.login(conn(0), "Alice", Role::Player, Some(hall), network.inboxes());
    world.update_game(1000, network.inboxes());
    assert!(!world.is_active(rat));

    world.move_creature(alice, den, network.inboxes());
    assert!(world.is_active(rat));
    world.update_game(1001, network.inboxes());
    assert!(world.is_active(rat));

    world.move_creature(alice, hall, network.inboxes());
    world.update_game(1002, network.inboxes());
    assert!(!world.is_active(rat));
    assert_eq!(world.room(den).unwrap().monsters, vec![rat]);
}

#[test]
fn activation_is_idempotent_and_bad_removal_is_harmless() {
    let mut network = Network::new(4).unwrap();
    let mut world = world();
    let den = world.room_named("Den").unwrap();
    let rat = world.room(den).unwrap().monsters[0];
    world.add_active(rat);
    world.add_active(rat);
    assert_eq!(world.active().len(), 1);

    let bat = world.spawn(&still("a bat"), den);
    assert!(!world.is_active(bat));
    world.del_active(bat, network.inboxes());
    assert_eq!(world.active().iter().collect::<Vec<_>>(), vec![rat]);
}

#[test]
fn damage_cancels_fishing() {
    let mut network = Network::new(4).unwrap();
    let mut world = world();
    let alice = world.login(conn(0), "Alice", Role::Player, None, network.inboxes());
    world.update_game(1000, network.inboxes());

    let fired = Rc::new(Cell::new(false));
    let flag = Rc::clone(&fired);
    world
        .add_delayed(alice, ActionKind::Fish, 7, "Hall", Box::new(move |_, _, _, _| flag.set(true)))
        .unwrap();
    assert_eq!(
        world.add_delayed(alice, ActionKind::Fish, 7, "Hall", Box::new(|_, _, _, _| {})),
        Err(ScheduleError::AlreadyQueued(ActionKind::Fish))
    );
    assert!(world.has_action(alice, ActionKind::Fish));

    assert!(!world.damage(alice, 1, network.inboxes()));
    assert!(!world.has_action(alice, ActionKind::Fish));
    for now in 1001..=1010 {
        world.update_game(now, network.inboxes());
    }
    assert!(!fired.get());
}

#[test]
fn fishing_lands_after_its_delay() {
    let mut network = Network::new(4).unwrap();
    let mut world = world();
    let alice = world.login(conn(0), "Alice", Role::Player, None, network.inboxes());
    world.update_game(1000, network.inboxes());

    let caught = Rc::new(Cell::new(None));
    let seen = Rc::clone(&caught);
    world
        .add_delayed(
            alice,
            ActionKind::Fish,
            7,
            "Hall",
            Box::new(move |_, actor, spot, _| seen.set(Some((actor, spot == "Hall")))),
        )
        .unwrap();
    for now in 1001..=1006 {
        world.update_game(now, network.inboxes());
    }
    assert_eq!(caught.get(), None);
    world.update_game(1007, network.inboxes());
    assert_eq!(caught.get(), Some((alice, true)));
    assert!(!world.has_action(alice, ActionKind::Fish));
}

#[test]
fn delayed_actions_respect_who_may_queue_them() {
    let mut network = Network::new(4).unwrap();
    let mut world = world();
    let den = world.room_named("Den").unwrap();
    let rat = world.room(den).unwrap().monsters[0];
    assert_eq!(
        world.add_delayed(rat, ActionKind::Fish, 1, "", Box::new(|_, _, _, _| {})),
        Err(ScheduleError::PlayersOnly(ActionKind::Fish))
    );

    let fired = Rc::new(Cell::new(false));
    let flag = Rc::clone(&fired);
    world
        .add_delayed(rat, ActionKind::Cast, 1, "", Box::new(move |_, _, _, _| flag.set(true)))
        .unwrap();
    world.destroy(rat);
    world.update_game(1000, network.inboxes());
    world.update_game(1001, network.inboxes());
    assert!(!fired.get());
}

#[test]
fn night_creatures_leave_by_day_unless_staff_watch() {
    let mut wolf = still("a grey wolf");
    wolf.flags.night_only = true;

    for (role, stays) in [(Role::Player, false), (Role::Staff, true)] {
        let mut network = Network::new(4).unwrap();
        let mut world = world();
        assert!(world.calendar().is_day());
        let hall = world.room_named("Hall").unwrap();
        world.login(conn(0), "Alice", role, Some(hall), network.inboxes());
        let id = world.spawn(&wolf, hall);
        assert!(world.is_active(id));
        world.update_game(1000, network.inboxes());
        assert_eq!(world.creature(id).is_some(), stays, "{role:?}");
        assert_eq!(world.is_active(id), stays);
    }
}

#[test]
fn aggressive_monsters_pick_one_player() {
    let mut network = Network::new(4).unwrap();
    let mut world = world();
    let hall = world.room_named("Hall").unwrap();
    let admin = world.login(conn(0), "Carol", Role::Admin, Some(hall), network.inboxes());
    let alice = world.login(conn(1), "Alice", Role::Player, Some(hall), network.inboxes());
    let bob = world.login(conn(2), "Bob", Role::Player, Some(hall), network.inboxes());
    let mut template = still("a grey wolf");
    template.flags.aggressive = true;
    template.damage = 3;
    let wolf = world.spawn(&template, hall);

    world.update_game(1000, network.inboxes());
    let monster = world.creature(wolf).and_then(Creature::monster).unwrap();
    assert_eq!(monster.enemies, vec![alice]);
    assert_eq!(monster.target, Some(alice));

    world.update_game(1001, network.inboxes());
    assert_eq!(world.creature(alice).unwrap().hp, PLAYER_HP - 3);
    assert_eq!(world.creature(bob).unwrap().hp, PLAYER_HP);
    assert_eq!(world.creature(admin).unwrap().hp, PLAYER_HP);
}

#[test]
fn hunters_turn_on_other_monsters() {
    let mut network = Network::new(4).unwrap();
    let mut world = world();
    let den = world.room_named("Den").unwrap();
    let rat = world.room(den).unwrap().monsters[0];
    let mut template = still("a hawk");
    template.flags.hunts_monsters = true;
    template.flags.always_active = true;
    let hawk = world.spawn(&template, den);
    let second = world.spawn(&template, den);

    world.update_game(1000, network.inboxes());
    let enemies = &world.creature(hawk).and_then(Creature::monster).unwrap().enemies;
    assert!(enemies.contains(&rat));
    assert!(!enemies.contains(&second));
    assert!(world.creature(rat).unwrap().hp < 10);
}

#[test]
fn poison_keeps_a_monster_active_until_it_wears_off() {
    let mut network = Network::new(4).unwrap();
    let mut world = world();
    let den = world.room_named("Den").unwrap();
    let toad = world.spawn(&still("a toad"), den);
    world.creature_mut(toad).unwrap().poison = 2;
    world.add_active(toad);

    world.update_game(1001, network.inboxes());
    world.update_game(1002, network.inboxes());
    assert!(world.is_active(toad));
    assert_eq!(world.creature(toad).unwrap().hp, 8);
    world.update_game(1003, network.inboxes());
    assert!(!world.is_active(toad));
}

#[test]
fn regenerating_monsters_stay_active_unwatched() {
    let mut network = Network::new(4).unwrap();
    let mut world = world();
    let den = world.room_named("Den").unwrap();
    let mut template = still("a cave troll");
    template.flags.regenerates = true;
    let troll = world.spawn(&template, den);
    world.creature_mut(troll).unwrap().hp = 5;
    world.add_active(troll);

    for now in 1001..=1003 {
        world.update_game(now, network.inboxes());
    }
    assert!(world.is_active(troll));
    assert_eq!(world.creature(troll).unwrap().hp, 8);
}

#[test]
fn logout_forgets_the_player_everywhere() {
    let mut network = Network::new(4).unwrap();
    let mut world = world();
    let alice = world.login(conn(0), "Alice", Role::Player, None, network.inboxes());
    world
        .add_delayed(alice, ActionKind::Search, 3, "", Box::new(|_, _, _, _| {}))
        .unwrap();
    assert_eq!(world.player_named("alice"), Some(alice));
    world.logout(alice, network.inboxes());
    assert_eq!(world.player_named("alice"), None);
    assert!(world.creature(alice).is_none());
    assert!(!world.has_action(alice, ActionKind::Search));
    let hall = world.start_room();
    assert!(world.room(hall).unwrap().players.is_empty());
}
