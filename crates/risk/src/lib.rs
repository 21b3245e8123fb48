//! Risk manager: the mandatory gateway between strategy signals and the
//! order executor.
//!
//! Every order in the system is constructed here, after the full rule
//! chain has passed. The executor consumes a channel whose only producer
//! is this crate; nothing else can reach the exchange client.

mod accounting;
mod config;
mod manager;

pub use accounting::{create_accounting, PortfolioAccounting, SharedAccounting};
pub use config::{ExposureLimit, RiskConfig};
pub use manager::RiskManager;

/// Hard ceiling on simultaneously open orders. Compiled in, not
/// user-configurable: a last-resort stop against runaway order flow.
pub const MAX_OPEN_ORDERS: u32 = 5;

/// Supervisor-issued controls consumed by the risk manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RiskControl {
    /// Clear a drawdown halt and reseed the peak at the current value.
    ResetDrawdown,
    /// Emit market closes for every open position (stop drain phase).
    FlattenAll,
}
