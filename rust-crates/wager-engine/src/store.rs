use crate::{
    error::StoreError,
    session::{
        GameSession,
        PlayerAddress,
        RequestId,
    },
};
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    sync::Arc,
    time::Duration,
};
use tokio::time::Instant;

/// Keyed session storage plus the one-wager-per-player guard.
///
/// Implementations are plain data holders; lifecycle rules live in the
/// state machine.
pub trait SessionStore: Clone + Send + Sync + 'static {
    /// Claims the player's single in-flight slot before anything is signed.
    fn reserve(&self, player: &PlayerAddress) -> Result<(), StoreError>;

    /// Gives back a slot claimed by [`SessionStore::reserve`] that never
    /// turned into a session.
    fn release(&self, player: &PlayerAddress);

    /// Turns the player's reservation into a tracked session.
    fn commit(&self, session: GameSession) -> Result<(), StoreError>;

    fn get(&self, request_id: &RequestId) -> Option<GameSession>;

    fn update(&self, session: &GameSession) -> Result<(), StoreError>;

    fn evict(&self, request_id: &RequestId) -> Option<GameSession>;

    /// Moves a session to the request id the chain actually assigned,
    /// carrying the player's in-flight slot along.
    fn rekey(&self, from: &RequestId, to: &RequestId) -> Result<GameSession, StoreError>;

    fn active_session(&self, player: &PlayerAddress) -> Option<RequestId>;

    /// Non-terminal sessions whose current deadline is at or before `now`.
    fn overdue(&self, now: Instant) -> Vec<GameSession>;

    /// Terminal sessions that have sat in their final state for `retention`.
    fn expired_terminal(&self, now: Instant, retention: Duration) -> Vec<RequestId>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum ActiveSlot {
    Reserved,
    Session(RequestId),
}

#[derive(Default)]
struct StoreInner {
    sessions: HashMap<RequestId, GameSession>,
    active: HashMap<PlayerAddress, ActiveSlot>,
}

impl StoreInner {
    fn clear_slot_for(&mut self, session: &GameSession) {
        if self.active.get(&session.player)
            == Some(&ActiveSlot::Session(session.request_id.clone()))
        {
            self.active.remove(&session.player);
        }
    }
}

#[derive(Clone, Default)]
pub struct InMemorySessionStore {
    inner: Arc<Mutex<StoreInner>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for InMemorySessionStore {
    fn reserve(&self, player: &PlayerAddress) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        if let Some(slot) = inner.active.get(player) {
            let request_id = match slot {
                ActiveSlot::Reserved => None,
                ActiveSlot::Session(id) => Some(id.clone()),
            };
            return Err(StoreError::SessionInFlight {
                player: player.clone(),
                request_id,
            });
        }
        inner.active.insert(player.clone(), ActiveSlot::Reserved);
        Ok(())
    }

    fn release(&self, player: &PlayerAddress) {
        let mut inner = self.inner.lock();
        if inner.active.get(player) == Some(&ActiveSlot::Reserved) {
            inner.active.remove(player);
        }
    }

    fn commit(&self, session: GameSession) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        if inner.active.get(&session.player) != Some(&ActiveSlot::Reserved) {
            return Err(StoreError::NotReserved(session.player.clone()));
        }
        // a reverted bet never claims its request id, so a settled session
        // may be superseded by a later bet that was assigned the same id
        if inner
            .sessions
            .get(&session.request_id)
            .is_some_and(|existing| !existing.status.is_terminal())
        {
            return Err(StoreError::DuplicateSession(session.request_id.clone()));
        }
        if session.status.is_terminal() {
            inner.active.remove(&session.player);
        } else {
            inner.active.insert(
                session.player.clone(),
                ActiveSlot::Session(session.request_id.clone()),
            );
        }
        inner.sessions.insert(session.request_id.clone(), session);
        Ok(())
    }

    fn get(&self, request_id: &RequestId) -> Option<GameSession> {
        self.inner.lock().sessions.get(request_id).cloned()
    }

    fn update(&self, session: &GameSession) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let Some(stored) = inner.sessions.get_mut(&session.request_id) else {
            return Err(StoreError::UnknownSession(session.request_id.clone()));
        };
        *stored = session.clone();
        if session.status.is_terminal() {
            inner.clear_slot_for(session);
        }
        Ok(())
    }

    fn evict(&self, request_id: &RequestId) -> Option<GameSession> {
        let mut inner = self.inner.lock();
        let session = inner.sessions.remove(request_id)?;
        inner.clear_slot_for(&session);
        Some(session)
    }

    fn rekey(&self, from: &RequestId, to: &RequestId) -> Result<GameSession, StoreError> {
        let mut inner = self.inner.lock();
        if inner
            .sessions
            .get(to)
            .is_some_and(|existing| !existing.status.is_terminal())
        {
            return Err(StoreError::DuplicateSession(to.clone()));
        }
        let Some(mut session) = inner.sessions.remove(from) else {
            return Err(StoreError::UnknownSession(from.clone()));
        };
        session.request_id = to.clone();
        if inner.active.get(&session.player) == Some(&ActiveSlot::Session(from.clone())) {
            inner
                .active
                .insert(session.player.clone(), ActiveSlot::Session(to.clone()));
        }
        inner.sessions.insert(to.clone(), session.clone());
        Ok(session)
    }

    fn active_session(&self, player: &PlayerAddress) -> Option<RequestId> {
        match self.inner.lock().active.get(player) {
            Some(ActiveSlot::Session(id)) => Some(id.clone()),
            _ => None,
        }
    }

    fn overdue(&self, now: Instant) -> Vec<GameSession> {
        self.inner
            .lock()
            .sessions
            .values()
            .filter(|s| !s.status.is_terminal())
            .filter(|s| s.deadline.is_some_and(|deadline| deadline <= now))
            .cloned()
            .collect()
    }

    fn expired_terminal(&self, now: Instant, retention: Duration) -> Vec<RequestId> {
        self.inner
            .lock()
            .sessions
            .values()
            .filter(|s| s.status.is_terminal())
            .filter(|s| now.saturating_duration_since(s.state_entered_at) >= retention)
            .map(|s| s.request_id.clone())
            .collect()
    }

    fn len(&self) -> usize {
        self.inner.lock().sessions.len()
    }
}

/// Holds a player's in-flight slot for the duration of a submission.
///
/// Dropping the guard without committing gives the slot back, so a failed
/// or abandoned `place_bet` never leaves the player locked out.
pub struct Reservation<S: SessionStore> {
    store: S,
    player: PlayerAddress,
    armed: bool,
}

impl<S: SessionStore> Reservation<S> {
    pub fn acquire(store: &S, player: &PlayerAddress) -> Result<Self, StoreError> {
        store.reserve(player)?;
        Ok(Self {
            store: store.clone(),
            player: player.clone(),
            armed: true,
        })
    }

    pub fn player(&self) -> &PlayerAddress {
        &self.player
    }

    pub fn commit(mut self, session: GameSession) -> Result<(), StoreError> {
        self.store.commit(session)?;
        self.armed = false;
        Ok(())
    }
}

impl<S: SessionStore> Drop for Reservation<S> {
    fn drop(&mut self) {
        if self.armed {
            self.store.release(&self.player);
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]

    use super::*;
    use crate::{
        gateway::Submission,
        session::{
            SessionStatus,
            TxHash,
        },
        state_machine::{
            SessionStateMachine,
            TimeoutPolicy,
        },
    };

    fn alice() -> PlayerAddress {
        PlayerAddress::new("0xa11ce")
    }

    fn session_for(player: PlayerAddress, id: u64) -> GameSession {
        let machine = SessionStateMachine::new(TimeoutPolicy {
            confirmation: Duration::from_secs(10),
            resolution: Duration::from_secs(60),
        });
        let submission = Submission {
            tx_hash: TxHash::new(format!("0x{id:064x}")),
            request_id: RequestId::from(id),
        };
        machine.open(&submission, player, 4, 100, Instant::now())
    }

    #[test]
    fn reserve__player_with_active_session__is_session_in_flight() {
        // given
        let store = InMemorySessionStore::new();
        let reservation = Reservation::acquire(&store, &alice()).unwrap();
        reservation.commit(session_for(alice(), 1)).unwrap();

        // when
        let actual = store.reserve(&alice());

        // then
        assert_eq!(
            Err(StoreError::SessionInFlight {
                player: alice(),
                request_id: Some(RequestId::from(1)),
            }),
            actual
        );
    }

    #[test]
    fn reservation__dropped_without_commit__frees_the_player() {
        // given
        let store = InMemorySessionStore::new();
        let reservation = Reservation::acquire(&store, &alice()).unwrap();

        // when
        drop(reservation);

        // then
        assert!(store.reserve(&alice()).is_ok());
    }

    #[test]
    fn update__session_reaches_terminal__frees_the_player() {
        // given
        let store = InMemorySessionStore::new();
        let reservation = Reservation::acquire(&store, &alice()).unwrap();
        let mut session = session_for(alice(), 1);
        reservation.commit(session.clone()).unwrap();

        // when
        session.status = SessionStatus::Failed;
        store.update(&session).unwrap();

        // then
        assert_eq!(None, store.active_session(&alice()));
        assert!(store.reserve(&alice()).is_ok());
        assert_eq!(
            Some(SessionStatus::Failed),
            store.get(&RequestId::from(1)).map(|s| s.status)
        );
    }

    #[test]
    fn commit__without_reservation__is_rejected() {
        let store = InMemorySessionStore::new();
        let actual = store.commit(session_for(alice(), 1));
        assert_eq!(Err(StoreError::NotReserved(alice())), actual);
    }

    #[test]
    fn evict__active_session__removes_it_and_frees_the_player() {
        // given
        let store = InMemorySessionStore::new();
        Reservation::acquire(&store, &alice())
            .unwrap()
            .commit(session_for(alice(), 1))
            .unwrap();

        // when
        let evicted = store.evict(&RequestId::from(1));

        // then
        assert!(evicted.is_some());
        assert!(store.is_empty());
        assert_eq!(None, store.active_session(&alice()));
    }

    #[test]
    fn overdue__deadline_passed__lists_only_live_sessions() {
        // given
        let store = InMemorySessionStore::new();
        let bob = PlayerAddress::new("0xb0b");
        let live = session_for(alice(), 1);
        let mut finished = session_for(bob.clone(), 2);
        finished.status = SessionStatus::Completed;
        Reservation::acquire(&store, &alice())
            .unwrap()
            .commit(live.clone())
            .unwrap();
        Reservation::acquire(&store, &bob)
            .unwrap()
            .commit(finished)
            .unwrap();

        // when
        let later = Instant::now() + Duration::from_secs(11);
        let actual: Vec<_> = store
            .overdue(later)
            .into_iter()
            .map(|s| s.request_id)
            .collect();

        // then
        assert_eq!(vec![live.request_id], actual);
    }

    #[test]
    fn commit__id_of_settled_session__supersedes_it() {
        // given
        let store = InMemorySessionStore::new();
        let mut reverted = session_for(alice(), 1);
        reverted.status = SessionStatus::Failed;
        Reservation::acquire(&store, &alice())
            .unwrap()
            .commit(reverted)
            .unwrap();

        // when
        let actual = Reservation::acquire(&store, &alice())
            .unwrap()
            .commit(session_for(alice(), 1));

        // then
        assert_eq!(Ok(()), actual);
        assert_eq!(
            Some(SessionStatus::Pending),
            store.get(&RequestId::from(1)).map(|s| s.status)
        );
    }

    #[test]
    fn commit__id_of_live_session__is_duplicate() {
        // given
        let store = InMemorySessionStore::new();
        let bob = PlayerAddress::new("0xb0b");
        Reservation::acquire(&store, &alice())
            .unwrap()
            .commit(session_for(alice(), 1))
            .unwrap();

        // when
        let actual = Reservation::acquire(&store, &bob)
            .unwrap()
            .commit(session_for(bob.clone(), 1));

        // then
        assert_eq!(Err(StoreError::DuplicateSession(RequestId::from(1))), actual);
        assert!(store.reserve(&bob).is_ok());
    }

    #[test]
    fn rekey__live_session__moves_it_and_the_players_slot() {
        // given
        let store = InMemorySessionStore::new();
        Reservation::acquire(&store, &alice())
            .unwrap()
            .commit(session_for(alice(), 1))
            .unwrap();

        // when
        let actual = store.rekey(&RequestId::from(1), &RequestId::from(2)).unwrap();

        // then
        assert_eq!(RequestId::from(2), actual.request_id);
        assert!(store.get(&RequestId::from(1)).is_none());
        assert_eq!(
            Some(RequestId::from(2)),
            store.get(&RequestId::from(2)).map(|s| s.request_id)
        );
        assert_eq!(Some(RequestId::from(2)), store.active_session(&alice()));
    }

    #[test]
    fn rekey__onto_another_live_session__is_duplicate_and_changes_nothing() {
        // given
        let store = InMemorySessionStore::new();
        let bob = PlayerAddress::new("0xb0b");
        Reservation::acquire(&store, &alice())
            .unwrap()
            .commit(session_for(alice(), 1))
            .unwrap();
        Reservation::acquire(&store, &bob)
            .unwrap()
            .commit(session_for(bob.clone(), 2))
            .unwrap();

        // when
        let actual = store.rekey(&RequestId::from(1), &RequestId::from(2));

        // then
        assert_eq!(Err(StoreError::DuplicateSession(RequestId::from(2))), actual);
        assert_eq!(Some(RequestId::from(1)), store.active_session(&alice()));
        assert_eq!(2, store.len());
    }
}
