//! Tracks balances, margin, and positions per venue, consuming execution reports and producing
//! position events. The ledger is the second owner in an order's life: the venue matches it, the
//! ledger books it, and sequential event processing means exactly one of them mutates it at any
//! instant.
pub mod juno;

use derive_more::{Display, Error};
use log::info;
use serde::{Deserialize, Serialize};

use crate::exchange::{OrderSide, OrderStateError};

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum AccountType {
    Cash,
    Margin,
}

/// Order management mode of a venue: `Netting` nets all fills for an instrument into one
/// position, `Hedging` allows simultaneous long and short positions per instrument.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum OmsType {
    Netting,
    Hedging,
}

/// Balance in a single currency. `total` always equals `free + locked`; the mutation helpers on
/// [Account] keep it that way.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize)]
pub struct Balance {
    pub total: f64,
    pub free: f64,
    pub locked: f64,
}

/// One account per venue. A frozen account rejects new orders at the risk engine and is exempt
/// from the overdraw check, which is what makes unbounded test accounts possible.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Account {
    pub venue: String,
    pub account_type: AccountType,
    pub currency: String,
    pub balance: Balance,
    pub default_leverage: f64,
    pub frozen: bool,
    //Running sum of realized PnL booked against this account, reconciled against positions
    pub realized_pnl: f64,
}

impl Account {
    pub fn new(
        venue: impl Into<String>,
        account_type: AccountType,
        currency: impl Into<String>,
        starting_cash: f64,
    ) -> Self {
        Self {
            venue: venue.into(),
            account_type,
            currency: currency.into(),
            balance: Balance {
                total: starting_cash,
                free: starting_cash,
                locked: 0.0,
            },
            default_leverage: 1.0,
            frozen: false,
            realized_pnl: 0.0,
        }
    }

    pub fn credit(&mut self, value: f64) {
        info!(
            "LEDGER: Credited {:?} to {}, balance now {:?}",
            value, self.venue, self.balance.total
        );
        self.balance.free += value;
        self.balance.total += value;
    }

    pub fn debit(&mut self, value: f64) {
        info!(
            "LEDGER: Debited {:?} from {}, balance now {:?}",
            value, self.venue, self.balance.total
        );
        self.balance.free -= value;
        self.balance.total -= value;
    }

    /// Moves free balance into locked margin (negative delta releases). Total is unchanged.
    pub fn adjust_locked(&mut self, delta: f64) {
        self.balance.free -= delta;
        self.balance.locked += delta;
    }

    /// Books realized PnL against the account and the running reconciliation sum.
    pub fn book_pnl(&mut self, pnl: f64) {
        info!(
            "LEDGER: Booked realized pnl of {:?} against {}, balance now {:?}",
            pnl,
            self.venue,
            self.balance.total + pnl
        );
        self.balance.free += pnl;
        self.balance.total += pnl;
        self.realized_pnl += pnl;
    }

    /// Records realized PnL without moving balances, for accounts where settlement of the
    /// fill value has already carried the cash.
    pub fn note_pnl(&mut self, pnl: f64) {
        self.realized_pnl += pnl;
    }

    pub fn is_overdrawn(&self) -> bool {
        !self.frozen && self.balance.free < 0.0
    }
}

/// Mutable aggregate of fills for one instrument under one strategy. Closed positions are
/// retained for reporting, never destroyed.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Position {
    pub position_id: String,
    pub strategy_id: String,
    pub symbol: String,
    pub venue: String,
    pub side: OrderSide,
    pub quantity: f64,
    pub avg_px_open: f64,
    pub realized_pnl: f64,
    pub ts_opened: i64,
    pub ts_closed: Option<i64>,
    //Retained in the id as well so a flip is visible in an audit trail
    pub flipped: bool,
}

impl Position {
    pub fn is_open(&self) -> bool {
        self.ts_closed.is_none()
    }

    pub fn signed_qty(&self) -> f64 {
        self.quantity * self.side.sign()
    }

    pub fn unrealized_pnl(&self, market_price: f64) -> f64 {
        if !self.is_open() {
            return 0.0;
        }
        (market_price - self.avg_px_open) * self.quantity * self.side.sign()
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub enum PositionEvent {
    Opened(Position),
    Changed(Position),
    Closed(Position),
}

impl PositionEvent {
    pub fn position(&self) -> &Position {
        match self {
            PositionEvent::Opened(position) => position,
            PositionEvent::Changed(position) => position,
            PositionEvent::Closed(position) => position,
        }
    }

    pub fn strategy_id(&self) -> &str {
        &self.position().strategy_id
    }
}

/// An upstream invariant was violated. These indicate an engine bug rather than a user or
/// strategy mistake, so the run stops instead of continuing with corrupted state.
#[derive(Clone, Debug, Display, Error)]
pub enum ConsistencyError {
    #[display("fill references unknown order {client_order_id}")]
    UnknownOrder { client_order_id: String },
    #[display("fill references unknown instrument {symbol}")]
    UnknownInstrument { symbol: String },
    #[display("fill for order {client_order_id} does not match its registration")]
    MismatchedFill { client_order_id: String },
    #[display("account for venue {venue} is overdrawn")]
    Overdrawn { venue: String },
    #[display("order {client_order_id}: {source}")]
    BadOrderTransition {
        client_order_id: String,
        source: OrderStateError,
    },
}
