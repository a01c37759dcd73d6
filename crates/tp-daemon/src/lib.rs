//! Polling orchestrator daemon.
//!
//! Four periodic loops share one state store:
//! - intake: new tasks from the work tracker, deduplicated, run through the
//!   analysis and implementation stages
//! - PR discovery: waits for a pull request on each implemented branch
//! - review cycle: drives the review -> fix iteration from commit history
//! - patrol: cache expiry, pipeline retention, dead process sweeps

pub mod daemon;
pub mod intake;
pub mod notify;
pub mod patrol;
pub mod pr_discovery;
pub mod review_cycle;
pub mod runner;
pub mod shutdown;
