//! Chat platform abstractions (Slack today).

pub mod port;
pub mod throttled;
