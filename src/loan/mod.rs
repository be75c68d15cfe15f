//! Loan domain module
//!
//! The loan aggregate, its durable store, the state machine that owns every
//! status mutation, and the pure expiration computation.

pub mod expiration;
mod model;
mod state_machine;
mod store;

pub use model::*;
pub use state_machine::{LoanStateMachine, TransitionError, Transitioned};
pub use store::{LoanStore, LoanUpdate, MemoryLoanStore, PgLoanStore, StoreError};
