//! Mogogo
//!
//! Leisure-activity funnel: a short sequence of binary choices narrows a
//! wish down to one concrete recommendation, backed by an untrusted text
//! oracle, a nearby-place search and a virtual-currency ledger.

pub mod config;
pub mod error;
pub mod funnel;
pub mod ledger;
pub mod oracle;
pub mod places;
pub mod safety;
pub mod server;
pub mod themes;
pub mod utils;
