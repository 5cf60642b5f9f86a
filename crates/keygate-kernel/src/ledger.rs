use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use keygate_contracts::{Requester, RequesterId, ResourceId};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LedgerError {
    #[error("requester {0} already has a pending request")]
    AlreadyPending(RequesterId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingState {
    /// Waiting for the administrator.
    Open,
    /// A decision has claimed the entry and is delivering or notifying.
    Deciding,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRequest {
    pub requester: Requester,
    pub resource_id: ResourceId,
    pub created_at: DateTime<Utc>,
    pub state: PendingState,
}

/// Open reservations keyed by requester, at most one per requester.
#[derive(Debug, Default)]
pub struct RequestLedger {
    entries: BTreeMap<RequesterId, PendingRequest>,
}

impl RequestLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_open(
        &mut self,
        requester: Requester,
        resource_id: ResourceId,
        created_at: DateTime<Utc>,
    ) -> Result<&PendingRequest, LedgerError> {
        use std::collections::btree_map::Entry;

        match self.entries.entry(requester.id) {
            Entry::Occupied(_) => Err(LedgerError::AlreadyPending(requester.id)),
            Entry::Vacant(slot) => Ok(slot.insert(PendingRequest {
                requester,
                resource_id,
                created_at,
                state: PendingState::Open,
            })),
        }
    }

    pub fn peek(&self, requester: RequesterId) -> Option<&PendingRequest> {
        self.entries.get(&requester)
    }

    /// Marks an open entry as being decided and returns a copy of it.
    ///
    /// Returns `None` when there is no entry or another decision already holds
    /// it, so a replayed button press never runs a second delivery.
    pub fn claim(&mut self, requester: RequesterId) -> Option<PendingRequest> {
        let entry = self.entries.get_mut(&requester)?;
        if entry.state != PendingState::Open {
            return None;
        }
        entry.state = PendingState::Deciding;
        Some(entry.clone())
    }

    /// Removes the entry. Closing an absent entry is a no-op.
    pub fn close(&mut self, requester: RequesterId) -> Option<PendingRequest> {
        self.entries.remove(&requester)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Resources currently held by any entry, open or being decided.
    pub fn reserved(&self) -> BTreeSet<ResourceId> {
        self.entries
            .values()
            .map(|p| p.resource_id.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keygate_contracts::ChatId;

    fn ann() -> Requester {
        Requester::new(1, "Ann").with_handle("ann")
    }

    #[test]
    fn second_open_for_same_requester_is_refused() {
        let mut ledger = RequestLedger::new();
        ledger
            .try_open(ann(), ResourceId::new("a.conf"), Utc::now())
            .unwrap();
        let err = ledger
            .try_open(ann(), ResourceId::new("b.conf"), Utc::now())
            .unwrap_err();
        assert_eq!(err, LedgerError::AlreadyPending(ChatId(1)));
        assert_eq!(ledger.len(), 1);
        assert_eq!(
            ledger.peek(ChatId(1)).unwrap().resource_id,
            ResourceId::new("a.conf")
        );
    }

    #[test]
    fn claim_is_granted_once() {
        let mut ledger = RequestLedger::new();
        ledger
            .try_open(ann(), ResourceId::new("a.conf"), Utc::now())
            .unwrap();
        let claimed = ledger.claim(ChatId(1)).expect("first claim");
        assert_eq!(claimed.state, PendingState::Deciding);
        assert!(ledger.claim(ChatId(1)).is_none());
        assert!(ledger.peek(ChatId(1)).is_some());
    }

    #[test]
    fn close_tolerates_missing_entries() {
        let mut ledger = RequestLedger::new();
        assert!(ledger.close(ChatId(9)).is_none());
        ledger
            .try_open(ann(), ResourceId::new("a.conf"), Utc::now())
            .unwrap();
        assert!(ledger.close(ChatId(1)).is_some());
        assert!(ledger.close(ChatId(1)).is_none());
        assert!(ledger.is_empty());
    }

    #[test]
    fn reserved_covers_every_entry() {
        let mut ledger = RequestLedger::new();
        ledger
            .try_open(ann(), ResourceId::new("a.conf"), Utc::now())
            .unwrap();
        ledger
            .try_open(Requester::new(2, "Bob"), ResourceId::new("b.conf"), Utc::now())
            .unwrap();
        ledger.claim(ChatId(2));
        let reserved = ledger.reserved();
        assert!(reserved.contains(&ResourceId::new("a.conf")));
        assert!(reserved.contains(&ResourceId::new("b.conf")));
    }
}
