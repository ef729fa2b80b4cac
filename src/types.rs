use crate::collections::slot_keys;
use serde::{Deserialize, Serialize};

slot_keys! {
    /// A connection in the network's arena. The slot index doubles as the poller key.
    ConnKey
    /// A player or monster in the world's arena.
    CreatureId
    RoomId
}

/// Staff level of a logged-in player. Decides idle timeouts and who sees staff broadcasts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub enum Role {
    #[default]
    Player,
    Staff,
    Admin,
}
impl Role {
    pub fn is_staff(self) -> bool {
        self >= Role::Staff
    }
}

/// Marker returned by anything that decides a connection must be dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Disconnection(pub(crate) ());
impl Disconnection {
    pub fn new() -> Self {
        Self(())
    }
}
impl Default for Disconnection {
    fn default() -> Self {
        Self::new()
    }
}
