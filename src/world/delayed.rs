//! Single-shot actions that finish a number of ticks after they start
//! (fishing, searching, channelled casting).
//!
//! The queue only stores and orders; [`World`](super::World) owns firing,
//! because a callback needs the world and must not run for an actor that
//! has since left it.

use crate::prelude::*;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    Fish,
    Search,
    Track,
    Study,
    Cast,
    Script,
}
impl ActionKind {
    /// Kinds only a player can have queued.
    pub fn players_only(self) -> bool {
        matches!(self, ActionKind::Fish | ActionKind::Search | ActionKind::Track | ActionKind::Study)
    }
    /// Tag shown next to the actor in listings.
    pub fn tag(self) -> Option<&'static str> {
        match self {
            ActionKind::Fish => Some("*Fishing*"),
            ActionKind::Search => Some("*Searching*"),
            ActionKind::Track => Some("*Tracking*"),
            ActionKind::Study => Some("*Studying*"),
            ActionKind::Cast | ActionKind::Script => None,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("{0:?} is already queued for this actor")]
    AlreadyQueued(ActionKind),
    #[error("{0:?} can only be queued by players")]
    PlayersOnly(ActionKind),
}

pub struct DelayedAction<F> {
    pub actor: CreatureId,
    pub kind: ActionKind,
    pub due: u64,
    pub context: String,
    pub interruptible: bool,
    pub callback: F,
}
impl<F> std::fmt::Debug for DelayedAction<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelayedAction")
            .field("actor", &self.actor)
            .field("kind", &self.kind)
            .field("due", &self.due)
            .field("context", &self.context)
            .finish()
    }
}

#[derive(Debug)]
pub struct DelayedQueue<F> {
    actions: Vec<DelayedAction<F>>,
}
impl<F> Default for DelayedQueue<F> {
    fn default() -> Self {
        Self { actions: vec![] }
    }
}
impl<F> DelayedQueue<F> {
    pub fn len(&self) -> usize {
        self.actions.len()
    }
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
    pub fn has_action(&self, actor: CreatureId, kind: ActionKind) -> bool {
        self.actions.iter().any(|a| a.actor == actor && a.kind == kind)
    }
    pub fn add(&mut self, action: DelayedAction<F>) -> Result<(), ScheduleError> {
        if self.has_action(action.actor, action.kind) {
            return Err(ScheduleError::AlreadyQueued(action.kind));
        }
        self.actions.push(action);
        Ok(())
    }
    /// Cancels the actor's interruptible actions. True if anything was cancelled.
    pub fn interrupt(&mut self, actor: CreatureId) -> bool {
        let before = self.actions.len();
        self.actions.retain(|a| a.actor != actor || !a.interruptible);
        before != self.actions.len()
    }
    /// Drops everything the actor has queued, interruptible or not.
    pub fn remove_all(&mut self, actor: CreatureId) {
        self.actions.retain(|a| a.actor != actor);
    }
    pub fn describe(&self, actor: CreatureId) -> String {
        self.actions
            .iter()
            .filter(|a| a.actor == actor)
            .filter_map(|a| a.kind.tag())
            .fold(String::new(), |mut s, tag| {
                s.push(' ');
                s.push_str(tag);
                s
            })
    }
    /// Removes and returns every action due at or before `now`, in the order they were queued.
    pub fn take_due(&mut self, now: u64) -> Vec<DelayedAction<F>> {
        let (due, pending): (Vec<_>, Vec<_>) = core::mem::take(&mut self.actions)
            .into_iter()
            .partition(|a| a.due <= now);
        self.actions = pending;
        due
    }
}
