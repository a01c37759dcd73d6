//! Adapters from the orchestrator's ports to real services: GitHub as the
//! version-control host and Linear as the work tracker.

pub mod github;
pub mod linear;

pub use github::GitHubClient;
pub use linear::LinearClient;
