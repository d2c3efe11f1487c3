//! Local channel id allocation and ownership.
//!
//! Every local channel id in use maps to exactly one slot:
//! - `Opening`: we sent CHANNEL_OPEN and wait for the confirmation.
//! - `Incoming`: the peer opened a channel and the user has not decided yet.
//! - `Live`: the channel is open.
//!
//! Ids come from a monotonic counter. Once the counter reaches the top of the
//! id space, allocation scans for the lowest id not in use.

use crate::ssh::channel::{Channel, SshChannel};
use crate::ssh::codec::IncomingOpen;
use crate::ssh::connection::ChannelType;
use crate::ssh::pending::Completion;
use crate::ssh::setup::SessionPlan;
use std::collections::HashMap;
use wisp_platform::{WispError, WispResult};

/// Highest local channel id.
pub const MAX_CHANNEL: u32 = u32::MAX;

/// Continuation of a locally initiated open.
#[derive(Debug)]
pub(crate) enum PendingOpen {
    Session(SessionPlan),
    Direct {
        channel_type: ChannelType,
        completion: Completion<SshChannel>,
    },
}

impl PendingOpen {
    pub(crate) fn channel_type(&self) -> ChannelType {
        match self {
            PendingOpen::Session(_) => ChannelType::Session,
            PendingOpen::Direct { channel_type, .. } => *channel_type,
        }
    }

    pub(crate) fn fail(self, error: WispError) {
        match self {
            PendingOpen::Session(plan) => plan.fail(error),
            PendingOpen::Direct { completion, .. } => completion.complete(Err(error)),
        }
    }
}

#[derive(Debug)]
pub(crate) enum Slot {
    Opening(PendingOpen),
    Incoming(IncomingOpen),
    Live(Channel),
}

/// Map from local channel id to slot.
#[derive(Debug)]
pub(crate) struct ChannelRegistry {
    slots: HashMap<u32, Slot>,
    counter: Option<u32>,
    max_channel: u32,
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelRegistry {
    pub(crate) fn new() -> Self {
        Self {
            slots: HashMap::new(),
            counter: None,
            max_channel: MAX_CHANNEL,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_max_channel(max_channel: u32) -> Self {
        Self {
            max_channel,
            ..Self::new()
        }
    }

    /// Picks a free id without claiming it; pair with [`Self::insert`].
    pub(crate) fn allocate(&mut self) -> WispResult<u32> {
        let next = match self.counter {
            None => Some(0),
            Some(current) if current < self.max_channel => Some(current + 1),
            Some(_) => None,
        };
        if let Some(id) = next {
            self.counter = Some(id);
            return Ok(id);
        }
        (0..self.max_channel)
            .find(|id| !self.slots.contains_key(id))
            .ok_or(WispError::NoFreeChannels)
    }

    /// Allocates an id and stores `slot` under it.
    #[cfg(test)]
    pub(crate) fn reserve(&mut self, slot: Slot) -> WispResult<u32> {
        let id = self.allocate()?;
        self.slots.insert(id, slot);
        Ok(id)
    }

    pub(crate) fn insert(&mut self, id: u32, slot: Slot) {
        self.slots.insert(id, slot);
    }

    pub(crate) fn remove(&mut self, id: u32) -> Option<Slot> {
        self.slots.remove(&id)
    }

    pub(crate) fn insert_live(&mut self, id: u32, channel: Channel) {
        self.slots.insert(id, Slot::Live(channel));
    }

    /// Removes the slot only if it is still waiting for an open reply.
    pub(crate) fn take_opening(&mut self, id: u32) -> Option<PendingOpen> {
        match self.slots.get(&id) {
            Some(Slot::Opening(_)) => match self.slots.remove(&id) {
                Some(Slot::Opening(pending)) => Some(pending),
                _ => None,
            },
            _ => None,
        }
    }

    /// Removes the slot only if it is an undecided incoming open.
    pub(crate) fn take_incoming(&mut self, id: u32) -> Option<IncomingOpen> {
        match self.slots.get(&id) {
            Some(Slot::Incoming(_)) => match self.slots.remove(&id) {
                Some(Slot::Incoming(open)) => Some(open),
                _ => None,
            },
            _ => None,
        }
    }

    pub(crate) fn live(&self, id: u32) -> Option<&Channel> {
        match self.slots.get(&id) {
            Some(Slot::Live(channel)) => Some(channel),
            _ => None,
        }
    }

    pub(crate) fn live_mut(&mut self, id: u32) -> Option<&mut Channel> {
        match self.slots.get_mut(&id) {
            Some(Slot::Live(channel)) => Some(channel),
            _ => None,
        }
    }

    #[cfg(test)]
    pub(crate) fn take_live(&mut self, id: u32) -> Option<Channel> {
        match self.slots.get(&id) {
            Some(Slot::Live(_)) => match self.slots.remove(&id) {
                Some(Slot::Live(channel)) => Some(channel),
                _ => None,
            },
            _ => None,
        }
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, id: u32) -> bool {
        self.slots.contains_key(&id)
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    /// Empties the registry in ascending id order.
    pub(crate) fn drain(&mut self) -> Vec<(u32, Slot)> {
        let mut slots: Vec<(u32, Slot)> = self.slots.drain().collect();
        slots.sort_by_key(|(id, _)| *id);
        slots
    }

    /// Forgets every slot and restarts the counter.
    pub(crate) fn reset(&mut self) {
        self.slots.clear();
        self.counter = None;
    }
}
