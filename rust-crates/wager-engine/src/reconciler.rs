use crate::{
    events::{
        DomainEvent,
        EventName,
        EventPayload,
        RawEvent,
    },
    session::{
        Amount,
        GameSession,
        PlayerAddress,
        RequestId,
    },
};
use std::{
    collections::{
        HashMap,
        HashSet,
    },
    time::Duration,
};
use tokio::time::Instant;
use tracing::{
    debug,
    warn,
};

#[cfg(test)]
mod tests;

/// What the engine expects the chain to echo back for a submitted bet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubmissionRecord {
    pub request_id: RequestId,
    pub player: PlayerAddress,
    pub chosen_number: u8,
    pub bet_amount: Amount,
}

impl From<&GameSession> for SubmissionRecord {
    fn from(session: &GameSession) -> Self {
        Self {
            request_id: session.request_id.clone(),
            player: session.player.clone(),
            chosen_number: session.chosen_number,
            bet_amount: session.bet_amount,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Delivery {
    pub request_id: RequestId,
    pub event: DomainEvent,
}

/// Events dropped because nothing claimed them within the reorder window.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Orphan {
    pub request_id: RequestId,
    pub name: EventName,
    pub block_number: u64,
}

#[derive(Debug)]
struct Buffered {
    event: RawEvent,
    received_at: Instant,
}

#[derive(Debug, Default)]
struct Ledger {
    record: Option<SubmissionRecord>,
    started: bool,
    seen: HashSet<(EventName, u64)>,
    buffered: Vec<Buffered>,
}

/// Turns an unordered, at-least-once stream of contract logs into an
/// ordered, exactly-once stream of [`DomainEvent`]s per request.
///
/// Logs for requests the engine has not registered yet wait for up to the
/// reorder window, as do `GameResolved` logs whose `GameStarted` has not
/// been seen.
#[derive(Debug)]
pub struct EventReconciler {
    reorder_window: Duration,
    ledgers: HashMap<RequestId, Ledger>,
}

impl EventReconciler {
    pub fn new(reorder_window: Duration) -> Self {
        Self {
            reorder_window,
            ledgers: HashMap::new(),
        }
    }

    /// Registers a submitted bet and releases anything that was waiting on it.
    pub fn track(&mut self, record: SubmissionRecord) -> Vec<Delivery> {
        let request_id = record.request_id.clone();
        let ledger = self.ledgers.entry(request_id.clone()).or_default();
        if ledger.record.as_ref().is_some_and(|previous| previous != &record) {
            debug!(%request_id, "request id reused by a new bet");
            ledger.started = false;
        }
        ledger.record = Some(record);
        Self::release(&request_id, ledger)
    }

    pub fn ingest(&mut self, event: RawEvent, now: Instant) -> Vec<Delivery> {
        let request_id = event.request_id.clone();
        let ledger = self.ledgers.entry(request_id.clone()).or_default();
        if !ledger.seen.insert((event.name(), event.block_number)) {
            debug!(
                anomaly = "DUPLICATE_EVENT",
                key = %event.key(),
                "dropping redelivered log"
            );
            return Vec::new();
        }
        ledger.buffered.push(Buffered {
            event,
            received_at: now,
        });
        Self::release(&request_id, ledger)
    }

    /// Drops buffered logs older than the reorder window.
    pub fn expire(&mut self, now: Instant) -> Vec<Orphan> {
        let window = self.reorder_window;
        let mut orphans = Vec::new();
        for (request_id, ledger) in self.ledgers.iter_mut() {
            let tracked = ledger.record.is_some();
            ledger.buffered.retain(|buffered| {
                if now.saturating_duration_since(buffered.received_at) < window {
                    return true;
                }
                let orphan = Orphan {
                    request_id: request_id.clone(),
                    name: buffered.event.name(),
                    block_number: buffered.event.block_number,
                };
                if tracked {
                    warn!(
                        anomaly = "ORPHANED_EVENT",
                        request_id = %orphan.request_id,
                        event = %orphan.name,
                        block_number = orphan.block_number,
                        "no matching GameStarted arrived within the reorder window"
                    );
                } else {
                    debug!(
                        anomaly = "ORPHANED_EVENT",
                        request_id = %orphan.request_id,
                        event = %orphan.name,
                        block_number = orphan.block_number,
                        "log for an untracked request expired"
                    );
                }
                orphans.push(orphan);
                false
            });
        }
        self.ledgers
            .retain(|_, ledger| ledger.record.is_some() || !ledger.buffered.is_empty());
        orphans
    }

    pub fn forget(&mut self, request_id: &RequestId) {
        self.ledgers.remove(request_id);
    }

    pub fn is_tracked(&self, request_id: &RequestId) -> bool {
        self.ledgers
            .get(request_id)
            .is_some_and(|ledger| ledger.record.is_some())
    }

    pub fn buffered_len(&self) -> usize {
        self.ledgers.values().map(|ledger| ledger.buffered.len()).sum()
    }

    fn release(request_id: &RequestId, ledger: &mut Ledger) -> Vec<Delivery> {
        let Some(record) = ledger.record.clone() else {
            return Vec::new();
        };
        let mut buffered = std::mem::take(&mut ledger.buffered);
        buffered.sort_by_key(|b| (b.event.block_number, b.event.name(), b.event.log_index));

        let mut deliveries = Vec::new();
        let mut waiting = Vec::new();
        for entry in buffered {
            if entry.event.name() == EventName::GameResolved {
                waiting.push(entry);
                continue;
            }
            let EventPayload::Started {
                player,
                chosen_number,
                bet_amount,
            } = &entry.event.payload
            else {
                continue;
            };
            if player != &record.player
                || *chosen_number != record.chosen_number
                || *bet_amount != record.bet_amount
            {
                warn!(
                    anomaly = "INVALID_EVENT",
                    request_id = %request_id,
                    block_number = entry.event.block_number,
                    %player,
                    chosen_number = *chosen_number,
                    bet_amount = %bet_amount,
                    "GameStarted does not match the submitted bet"
                );
                continue;
            }
            if ledger.started {
                debug!(
                    request_id = %request_id,
                    block_number = entry.event.block_number,
                    "GameStarted already delivered"
                );
                continue;
            }
            ledger.started = true;
            deliveries.push(Delivery {
                request_id: request_id.clone(),
                event: DomainEvent::Started {
                    block_number: entry.event.block_number,
                },
            });
        }

        if !ledger.started {
            ledger.buffered = waiting;
            return deliveries;
        }
        for entry in waiting {
            if let EventPayload::Resolved {
                result_roll,
                payout,
            } = entry.event.payload
            {
                deliveries.push(Delivery {
                    request_id: request_id.clone(),
                    event: DomainEvent::Resolved {
                        block_number: entry.event.block_number,
                        result_roll,
                        reported_payout: payout,
                    },
                });
            }
        }
        deliveries
    }
}
