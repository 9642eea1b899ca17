use crate::session::{
    Amount,
    PlayerAddress,
    RequestId,
};
use serde::{
    Deserialize,
    Serialize,
};
use std::fmt;

/// Contract events the engine listens for. Declaration order is the
/// tie-break when both land in the same block.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventName {
    GameStarted,
    GameResolved,
}

impl EventName {
    pub const ALL: [EventName; 2] = [EventName::GameStarted, EventName::GameResolved];

    pub fn as_str(self) -> &'static str {
        match self {
            EventName::GameStarted => "GameStarted",
            EventName::GameResolved => "GameResolved",
        }
    }
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventPayload {
    Started {
        player: PlayerAddress,
        chosen_number: u8,
        bet_amount: Amount,
    },
    Resolved {
        result_roll: u8,
        payout: Amount,
    },
}

/// A decoded contract log, as delivered by a subscription.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawEvent {
    pub request_id: RequestId,
    pub block_number: u64,
    pub log_index: u64,
    pub payload: EventPayload,
}

impl RawEvent {
    pub fn started(
        request_id: RequestId,
        block_number: u64,
        player: PlayerAddress,
        chosen_number: u8,
        bet_amount: Amount,
    ) -> Self {
        Self {
            request_id,
            block_number,
            log_index: 0,
            payload: EventPayload::Started {
                player,
                chosen_number,
                bet_amount,
            },
        }
    }

    pub fn resolved(
        request_id: RequestId,
        block_number: u64,
        result_roll: u8,
        payout: Amount,
    ) -> Self {
        Self {
            request_id,
            block_number,
            log_index: 0,
            payload: EventPayload::Resolved {
                result_roll,
                payout,
            },
        }
    }

    pub fn with_log_index(mut self, log_index: u64) -> Self {
        self.log_index = log_index;
        self
    }

    pub fn name(&self) -> EventName {
        match self.payload {
            EventPayload::Started { .. } => EventName::GameStarted,
            EventPayload::Resolved { .. } => EventName::GameResolved,
        }
    }

    /// Identity used for de-duplication: the same log replayed after a
    /// resubscribe carries the same key.
    pub fn key(&self) -> EventKey {
        EventKey {
            request_id: self.request_id.clone(),
            name: self.name(),
            block_number: self.block_number,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct EventKey {
    pub request_id: RequestId,
    pub name: EventName,
    pub block_number: u64,
}

impl fmt::Display for EventKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}#{}", self.name, self.block_number, self.request_id)
    }
}

/// Server-side selection for a subscription.
///
/// `player` only narrows events that carry a player; `GameResolved` logs
/// pass unless `request_id` is set.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EventFilter {
    pub player: Option<PlayerAddress>,
    pub request_id: Option<RequestId>,
    pub from_block: u64,
}

impl EventFilter {
    pub fn for_player(player: PlayerAddress) -> Self {
        Self {
            player: Some(player),
            ..Self::default()
        }
    }

    pub fn from_block(mut self, block_number: u64) -> Self {
        self.from_block = block_number;
        self
    }

    pub fn matches(&self, event: &RawEvent) -> bool {
        if event.block_number < self.from_block {
            return false;
        }
        if let Some(request_id) = &self.request_id
            && request_id != &event.request_id
        {
            return false;
        }
        match (&self.player, &event.payload) {
            (Some(wanted), EventPayload::Started { player, .. }) => wanted == player,
            _ => true,
        }
    }
}

/// What the state machine understands, after reconciliation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DomainEvent {
    Confirmed {
        block_number: u64,
    },
    Reverted {
        reason: Option<String>,
    },
    Started {
        block_number: u64,
    },
    Resolved {
        block_number: u64,
        result_roll: u8,
        reported_payout: Amount,
    },
}

impl DomainEvent {
    pub fn label(&self) -> &'static str {
        match self {
            DomainEvent::Confirmed { .. } => "Confirmed",
            DomainEvent::Reverted { .. } => "Reverted",
            DomainEvent::Started { .. } => "GameStarted",
            DomainEvent::Resolved { .. } => "GameResolved",
        }
    }
}
