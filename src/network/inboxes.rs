use super::*;

/// The world's view of the network: it can write to connections but not accept, read or drop them.
pub struct Inboxes<'a>(pub(super) &'a mut Network);

impl Network {
    /// Used by the world to send updates to the network
    pub fn inboxes(&mut self) -> Inboxes<'_> {
        Inboxes(self)
    }
}

impl Inboxes<'_> {
    pub fn get(&mut self, key: ConnKey) -> Option<Inbox<'_>> {
        self.0.connections.get_mut(key).filter(|c| !c.is_disconnecting()).map(|c| c.inbox())
    }
    pub fn reborrow(&mut self) -> Inboxes<'_> {
        Inboxes(self.0)
    }
    /// Writes `text` to every connection that has a player on it.
    pub fn broadcast_playing(&mut self, text: &str) {
        for (_, conn) in self.0.connections.iter_mut() {
            if conn.state() == ConnState::Playing {
                conn.inbox().print(text);
            }
        }
    }
}
