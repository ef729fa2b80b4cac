//! Turning command lines into world actions.
//!
//! The reactor only knows the [`Interpreter`] seam. [`Lobby`] is the small
//! command set the binary ships with.

use crate::children::{ChildKind, Children};
use crate::config::Config;
use crate::prelude::*;
use crate::world::{capitalize, ActionKind, Creature, World};
use std::io::Write;
use std::process::{Command, Stdio};

/// Things a command asks of the server rather than the world.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Reboot,
    Shutdown,
    /// Drop a connection right away.
    Kick(ConnKey),
}

pub struct Context<'a> {
    pub world: &'a mut World,
    pub inboxes: Inboxes<'a>,
    pub children: &'a mut Children,
    pub config: &'a Config,
    pub requests: &'a mut Vec<Request>,
}

pub trait Interpreter {
    /// First words to a connection, once its hostname is known.
    fn greet(&mut self, inbox: Inbox);
    /// Runs one line from `conn` and says what state the connection is in afterwards.
    fn handle(&mut self, cx: Context, conn: ConnKey, state: ConnState, line: &str) -> Result<ConnState, Disconnection>;
}

const BANNER: &str = "\nWelcome to the realm.\n\n";
const NAME_PROMPT: &str = "By what name are you known? ";
const PROMPT: &str = "> ";
const FISHING_TIME: u64 = 7;
const SEARCH_TIME: u64 = 3;

#[derive(Debug, Default)]
pub struct Lobby;

impl Interpreter for Lobby {
    fn greet(&mut self, mut inbox: Inbox) {
        inbox.print(BANNER);
        inbox.prompt(NAME_PROMPT);
    }
    fn handle(&mut self, cx: Context, conn: ConnKey, state: ConnState, line: &str) -> Result<ConnState, Disconnection> {
        match state {
            ConnState::Login => Ok(login(cx, conn, line.trim())),
            ConnState::Playing => play(cx, conn, line.trim()),
            other => Ok(other),
        }
    }
}

fn login(mut cx: Context, conn: ConnKey, name: &str) -> ConnState {
    let Some(mut inbox) = cx.inboxes.get(conn) else { return ConnState::Disconnecting };
    if name.len() < 3 || name.len() > 16 || !name.chars().all(|c| c.is_ascii_alphabetic()) {
        inbox.print("Names are 3 to 16 letters.\n");
        inbox.prompt(NAME_PROMPT);
        return ConnState::Login;
    }
    if cx.world.player_named(name).is_some() {
        inbox.print("That name is in use.\n");
        inbox.prompt(NAME_PROMPT);
        return ConnState::Login;
    }
    let name = capitalize(&name.to_ascii_lowercase());
    let role = cx.config.role_for(&name);
    let player = cx.world.login(conn, &name, role, None, cx.inboxes.reborrow());
    let room = cx.world.creature(player).and_then(|c| c.room);
    if let Some(mut inbox) = cx.inboxes.get(conn) {
        inbox.print(&format!("Welcome, {name}.\n\n"));
        if let Some(room) = room {
            inbox.print(&cx.world.describe_room(room, Some(player)));
        }
        inbox.prompt(PROMPT);
    }
    ConnState::Playing
}

fn play(mut cx: Context, conn: ConnKey, line: &str) -> Result<ConnState, Disconnection> {
    let Some(player) = cx.inboxes.get(conn).and_then(|inbox| inbox.player()) else {
        log::warn!("connection {conn} is playing without a player");
        return Err(Disconnection::new());
    };
    let Some(creature) = cx.world.creature(player) else { return Err(Disconnection::new()) };
    let name = creature.name.clone();
    let role = creature.role().unwrap_or_default();
    let room = creature.room;
    let (verb, args) = line.split_once(' ').map_or((line, ""), |(v, a)| (v, a.trim()));
    let mut reply = String::new();
    let mut next = ConnState::Playing;

    match verb.to_ascii_lowercase().as_str() {
        "" => {}
        "l" | "look" => {
            if let Some(room) = room {
                reply = cx.world.describe_room(room, Some(player));
            }
        }
        "say" | "'" if !args.is_empty() => {
            reply = format!("You say, \"{args}\"\n");
            if let Some(room) = room {
                cx.world
                    .room_broadcast(room, Some(player), &format!("{name} says, \"{args}\"\n"), &mut cx.inboxes);
            }
        }
        "say" | "'" => reply = "Say what?\n".to_owned(),
        "who" => reply = cx.world.who(),
        "exits" => {
            let exits: Vec<String> = room
                .and_then(|r| cx.world.room(r))
                .map(|r| r.exits.iter().map(|(exit, _)| exit.clone()).collect())
                .unwrap_or_default();
            reply = if exits.is_empty() {
                "There are no obvious exits.\n".to_owned()
            } else {
                format!("Exits: {}.\n", exits.join(", "))
            };
        }
        "go" => reply = go(&mut cx, player, room, args),
        "n" | "north" | "s" | "south" | "e" | "east" | "w" | "west" | "u" | "up" | "d" | "down" => {
            reply = go(&mut cx, player, room, verb)
        }
        "fish" => reply = fish(&mut cx, player, room),
        "search" => reply = search(&mut cx, player),
        "list" => {
            let command: Vec<String> = cx.config.lister_command.iter().cloned().chain(args.split_whitespace().map(str::to_owned)).collect();
            cx.children.spawn(ChildKind::Lister, name, Box::new(move |out| run_lister(&command, out)));
            reply = "Listing...\n".to_owned();
        }
        "report" => {
            let report = cx.world.who();
            cx.children.spawn(ChildKind::Print, name, Box::new(move |out| out.write_all(report.as_bytes())));
        }
        "kick" if role.is_staff() => {
            let target = cx.world.player_named(args).and_then(|id| cx.world.creature(id)).and_then(Creature::conn);
            reply = match target {
                Some(target) => {
                    cx.requests.push(Request::Kick(target));
                    format!("You kick {args}.\n")
                }
                None => "Nobody by that name.\n".to_owned(),
            };
        }
        "swap" if role == Role::Admin => {
            cx.children.spawn(ChildKind::SwapFinish, name, Box::new(|out| out.write_all(b"swap complete")));
            reply = "Swapping world data in the background.\n".to_owned();
        }
        "reboot" if role == Role::Admin => {
            cx.requests.push(Request::Reboot);
            reply = "Rebooting.\n".to_owned();
        }
        "shutdown" if role == Role::Admin => {
            cx.requests.push(Request::Shutdown);
            reply = "Shutting down.\n".to_owned();
        }
        "quit" => {
            reply = "Goodbye.\n".to_owned();
            next = ConnState::Disconnecting;
        }
        _ => reply = "Huh?\n".to_owned(),
    }

    if let Some(mut inbox) = cx.inboxes.get(conn) {
        inbox.print(&reply);
        if next == ConnState::Playing {
            inbox.prompt(PROMPT);
        }
    }
    Ok(next)
}

fn go(cx: &mut Context, player: CreatureId, room: Option<RoomId>, exit: &str) -> String {
    let exit = exit.to_ascii_lowercase();
    let to = room.and_then(|r| cx.world.room(r)).and_then(|r| {
        r.exits
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(&exit) || (!exit.is_empty() && name.starts_with(&exit)))
            .map(|(_, to)| *to)
    });
    let Some(to) = to else { return "You can't go that way.\n".to_owned() };
    cx.world.move_creature(player, to, cx.inboxes.reborrow());
    cx.world.describe_room(to, Some(player))
}

fn fish(cx: &mut Context, player: CreatureId, room: Option<RoomId>) -> String {
    let Some(room) = room.and_then(|r| cx.world.room(r)) else { return "You can't fish here.\n".to_owned() };
    if !room.water {
        return "There is no water here.\n".to_owned();
    }
    if cx.world.has_action(player, ActionKind::Fish) {
        return "You are already fishing!\n".to_owned();
    }
    let spot = room.name.clone();
    let queued = cx.world.add_delayed(
        player,
        ActionKind::Fish,
        FISHING_TIME,
        &spot,
        Box::new(|world, actor, spot, mut inboxes| {
            world.tell(actor, &format!("You pull a fish out of the water at {spot}!\n"), &mut inboxes);
        }),
    );
    match queued {
        Ok(()) => "You cast your line into the water.\n".to_owned(),
        Err(e) => {
            log::debug!("fishing refused: {e}");
            "You are already fishing!\n".to_owned()
        }
    }
}

fn search(cx: &mut Context, player: CreatureId) -> String {
    if cx.world.has_action(player, ActionKind::Search) {
        return "You are already searching.\n".to_owned();
    }
    let queued = cx.world.add_delayed(
        player,
        ActionKind::Search,
        SEARCH_TIME,
        "",
        Box::new(|world, actor, _, mut inboxes| {
            world.tell(actor, "You find nothing of interest.\n", &mut inboxes);
        }),
    );
    match queued {
        Ok(()) => "You begin searching.\n".to_owned(),
        Err(_) => "You are already searching.\n".to_owned(),
    }
}

/// Runs the configured listing command, streaming its stdout.
fn run_lister(command: &[String], out: &mut dyn Write) -> io::Result<()> {
    let Some((program, args)) = command.split_first() else {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "no lister command configured"));
    };
    let mut child = Command::new(program).args(args).stdout(Stdio::piped()).stderr(Stdio::null()).spawn()?;
    if let Some(mut stdout) = child.stdout.take() {
        io::copy(&mut stdout, out)?;
    }
    let status = child.wait()?;
    if status.success() {
        Ok(())
    } else {
        Err(io::Error::new(io::ErrorKind::Other, format!("{program} exited with {status}")))
    }
}
