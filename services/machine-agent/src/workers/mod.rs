//! Workers run by the machine agent in every cycle.
//!
//! - `Machiner`: keeps the machine's deployed units in line with the store
//! - `Upgrader`: ends the cycle with an upgrade signal when new tools are proposed

mod machiner;
mod upgrader;

pub use machiner::Machiner;
pub use upgrader::Upgrader;
