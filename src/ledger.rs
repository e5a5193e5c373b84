use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::types::{Auction, AuctionId, Loan, LoanId, PartyId, Term, TermId};

/// persistent loan arena
///
/// ids come from an ever-incrementing counter and are never reused; closed
/// loans stay in the map flagged `Inactive` so historical lookups keep
/// working
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoanLedger {
    next_id: LoanId,
    loans: BTreeMap<LoanId, Loan>,
}

impl LoanLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// assign the next id and record the loan under it
    pub fn insert(&mut self, mut loan: Loan) -> LoanId {
        let id = self.next_id;
        self.next_id += 1;
        loan.id = id;
        self.loans.insert(id, loan);
        id
    }

    pub fn get(&self, id: LoanId) -> Option<&Loan> {
        self.loans.get(&id)
    }

    pub fn get_mut(&mut self, id: LoanId) -> Option<&mut Loan> {
        self.loans.get_mut(&id)
    }

    pub fn len(&self) -> usize {
        self.loans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loans.is_empty()
    }
}

/// append-only registry of term templates
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TermRegistry {
    next_id: TermId,
    terms: BTreeMap<TermId, Term>,
}

impl TermRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, mut term: Term) -> TermId {
        let id = self.next_id;
        self.next_id += 1;
        term.id = id;
        self.terms.insert(id, term);
        id
    }

    pub fn get(&self, id: TermId) -> Option<&Term> {
        self.terms.get(&id)
    }

    pub fn get_mut(&mut self, id: TermId) -> Option<&mut Term> {
        self.terms.get_mut(&id)
    }
}

/// live auctions, keyed by id, with the loan-id reverse index
///
/// settled auctions are removed outright (the loan record carries the
/// history); ids are never reused
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuctionBook {
    next_id: AuctionId,
    auctions: BTreeMap<AuctionId, Auction>,
    by_loan: BTreeMap<LoanId, AuctionId>,
}

impl AuctionBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// open an auction; at most one may be live per loan
    pub fn insert(&mut self, mut auction: Auction) -> AuctionId {
        debug_assert!(!self.by_loan.contains_key(&auction.loan_id));
        let id = self.next_id;
        self.next_id += 1;
        auction.id = id;
        self.by_loan.insert(auction.loan_id, id);
        self.auctions.insert(id, auction);
        id
    }

    pub fn get(&self, id: AuctionId) -> Option<&Auction> {
        self.auctions.get(&id)
    }

    pub fn for_loan(&self, loan_id: LoanId) -> Option<&Auction> {
        self.by_loan.get(&loan_id).and_then(|id| self.auctions.get(id))
    }

    /// close an auction, clearing both indices
    pub fn remove(&mut self, id: AuctionId) -> Option<Auction> {
        let auction = self.auctions.remove(&id)?;
        self.by_loan.remove(&auction.loan_id);
        Some(auction)
    }

    pub fn len(&self) -> usize {
        self.auctions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.auctions.is_empty()
    }
}

/// borrower -> loan-id enumeration index
///
/// removal is swap-with-last-and-pop, so iteration order is not stable
/// across deletions
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BorrowerIndex {
    loans: HashMap<PartyId, Vec<LoanId>>,
}

impl BorrowerIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, borrower: PartyId, loan_id: LoanId) {
        self.loans.entry(borrower).or_default().push(loan_id);
    }

    pub fn remove(&mut self, borrower: PartyId, loan_id: LoanId) {
        if let Some(ids) = self.loans.get_mut(&borrower) {
            if let Some(pos) = ids.iter().position(|&id| id == loan_id) {
                ids.swap_remove(pos);
            }
            if ids.is_empty() {
                self.loans.remove(&borrower);
            }
        }
    }

    pub fn loans_of(&self, borrower: PartyId) -> &[LoanId] {
        self.loans.get(&borrower).map(Vec::as_slice).unwrap_or(&[])
    }
}
