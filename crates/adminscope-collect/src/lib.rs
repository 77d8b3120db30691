//! Admin API collection for adminscope
//!
//! Fans a single admin request out over every resolved pod, one tunnel per
//! pod, and turns the answers into one keyed document.

mod admin;
mod codec;
mod collector;
mod decode;
mod projection;
mod ratelimit;

pub use admin::AdminClient;
pub use codec::encode;
pub use collector::{Collection, Collector, CollectorSettings};
pub use decode::decode;
pub use projection::project;
pub use ratelimit::{CONTROLLER_CONFIG_KEY, CONTROLLER_CONFIG_MAP, rate_limit_enabled};
