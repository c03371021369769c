//! Pure orchestration logic. Nothing in this tree performs I/O.

pub mod fsm;
pub mod grouper;
pub mod subst;
pub mod types;
