//! Per-document transaction gate.
//!
//! Maps a document to the one transaction allowed to be active on it.
//! Claims and releases are compare-and-set operations on a single map
//! entry, so two `begin` calls racing on a document cannot both win.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use sheetguard_common::types::{DocumentId, TxnId};

/// The gate.
#[derive(Debug, Default)]
pub struct TxnGate {
    holders: DashMap<DocumentId, TxnId>,
}

impl TxnGate {
    /// Creates an empty gate.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims `document` for `txn`. Returns the current holder on failure.
    pub fn claim(&self, document: &DocumentId, txn: TxnId) -> Result<(), TxnId> {
        match self.holders.entry(document.clone()) {
            Entry::Occupied(held) if *held.get() != txn => Err(*held.get()),
            Entry::Occupied(_) => Ok(()),
            Entry::Vacant(slot) => {
                slot.insert(txn);
                Ok(())
            }
        }
    }

    /// Releases `document` if `txn` holds it. Returns true if released.
    pub fn release(&self, document: &DocumentId, txn: TxnId) -> bool {
        self.holders
            .remove_if(document, |_, holder| *holder == txn)
            .is_some()
    }

    /// The transaction holding `document`.
    #[must_use]
    pub fn holder(&self, document: &DocumentId) -> Option<TxnId> {
        self.holders.get(document).map(|h| *h)
    }

    /// Number of claimed documents.
    #[must_use]
    pub fn len(&self) -> usize {
        self.holders.len()
    }

    /// Returns true if no document is claimed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.holders.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_claim_and_release() {
        let gate = TxnGate::new();
        let doc = DocumentId::new("S1");
        assert!(gate.claim(&doc, TxnId::new(1)).is_ok());
        assert_eq!(gate.claim(&doc, TxnId::new(2)), Err(TxnId::new(1)));
        assert!(gate.claim(&doc, TxnId::new(1)).is_ok());

        assert!(!gate.release(&doc, TxnId::new(2)));
        assert_eq!(gate.holder(&doc), Some(TxnId::new(1)));
        assert!(gate.release(&doc, TxnId::new(1)));
        assert!(gate.is_empty());
    }

    #[test]
    fn test_racing_claims_have_one_winner() {
        let gate = Arc::new(TxnGate::new());
        let doc = DocumentId::new("S1");
        let handles: Vec<_> = (1..=8)
            .map(|i| {
                let gate = gate.clone();
                let doc = doc.clone();
                std::thread::spawn(move || gate.claim(&doc, TxnId::new(i)).is_ok())
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
        assert_eq!(gate.len(), 1);
    }
}
