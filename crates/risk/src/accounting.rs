use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use rust_decimal::Decimal;

/// Mutable portfolio bookkeeping shared between the risk manager (values,
/// peak) and the order executor (realized PnL, order count).
///
/// The peak never moves down except through an explicit reseed on a
/// drawdown reset.
pub struct PortfolioAccounting {
    /// Seed value plus all realized PnL to date.
    realized_value: RwLock<Decimal>,
    /// Latest full valuation: realized value plus unrealized PnL.
    current_value: RwLock<Decimal>,
    peak_value: RwLock<Decimal>,
    open_orders: AtomicU32,
}

impl PortfolioAccounting {
    pub fn new(initial_value: Decimal) -> Self {
        Self {
            realized_value: RwLock::new(initial_value),
            current_value: RwLock::new(initial_value),
            peak_value: RwLock::new(initial_value),
            open_orders: AtomicU32::new(0),
        }
    }

    pub fn realized_value(&self) -> Decimal {
        *self.realized_value.read()
    }

    pub fn apply_realized(&self, pnl: Decimal) {
        *self.realized_value.write() += pnl;
    }

    pub fn current_value(&self) -> Decimal {
        *self.current_value.read()
    }

    pub fn set_current_value(&self, value: Decimal) {
        *self.current_value.write() = value;
    }

    pub fn peak_value(&self) -> Decimal {
        *self.peak_value.read()
    }

    pub fn raise_peak(&self, candidate: Decimal) {
        let mut peak = self.peak_value.write();
        if candidate > *peak {
            *peak = candidate;
        }
    }

    /// Reset the drawdown reference point (drawdown reset only).
    pub fn reseed_peak(&self, value: Decimal) {
        *self.peak_value.write() = value;
    }

    /// Fractional decline from peak; zero while the peak is non-positive.
    pub fn drawdown(&self) -> Decimal {
        let peak = self.peak_value();
        if peak <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        (peak - self.current_value()) / peak
    }

    pub fn open_order_count(&self) -> u32 {
        self.open_orders.load(Ordering::Acquire)
    }

    pub fn increment_open_orders(&self) {
        self.open_orders.fetch_add(1, Ordering::AcqRel);
    }

    pub fn decrement_open_orders(&self) {
        let _ = self
            .open_orders
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }
}

pub type SharedAccounting = Arc<PortfolioAccounting>;

pub fn create_accounting(initial_value: Decimal) -> SharedAccounting {
    Arc::new(PortfolioAccounting::new(initial_value))
}
