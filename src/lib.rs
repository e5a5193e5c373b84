pub mod auction;
pub mod coordinator;
pub mod custody;
pub mod decimal;
pub mod errors;
pub mod events;
pub mod guard;
pub mod hooks;
pub mod interest;
pub mod ledger;
pub mod types;

// re-export key types
pub use coordinator::{Coordinator, CoordinatorState};
pub use custody::{AssetCustody, InMemoryCustody};
pub use decimal::{Money, Rate};
pub use errors::{CoordinatorError, Result};
pub use events::{Event, EventStore};
pub use guard::ReentrancyGuard;
pub use hooks::{
    BorrowerHooks, FlashLoanReceiver, HookDispatcher, HookError, HookResult, LenderHooks,
    RateSource,
};
pub use types::{
    AssetId, Auction, AuctionId, AuctionQuote, HookAck, Loan, LoanId, LoanState, PartyId,
    PendingRate, Term, TermConfig, TermId, Transfer, MAX_AUCTION_LENGTH_SECS,
};

// re-export external dependencies that users will need
pub use chrono;
pub use hourglass_rs::{SafeTimeProvider, TimeSource};
pub use rust_decimal::Decimal;
pub use uuid::Uuid;
