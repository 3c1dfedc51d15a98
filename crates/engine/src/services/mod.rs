//! Engine services: milestone writes, reconciliation polling, and fan-out.

pub mod fanout;
pub mod milestones;
pub mod sync;
