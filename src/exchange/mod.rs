//! Order model and the simulated venues that match orders against replayed market data. The
//! exchange is the external interface that provides a set of possible operations to strategies;
//! business rejections are signalled with output events so control flow stays event-driven,
//! an exchange never panics or errors on an expected outcome.
pub mod iona;

use derive_more::{Display, Error};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

pub type OrderId = u64;

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn sign(&self) -> f64 {
        match self {
            OrderSide::Buy => 1.0,
            OrderSide::Sell => -1.0,
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum OrderKind {
    Market,
    Limit,
    StopMarket,
    StopLimit,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum TimeInForce {
    Gtc,
    Ioc,
    Gtd,
}

/// Lifecycle of an order. Terminal states are final: any attempted transition out of them is an
/// error surfaced to the caller, never a silent no-op, so strategy and ledger logic can rely on
/// closed orders staying closed.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum OrderStatus {
    Initialized,
    Submitted,
    Accepted,
    PartiallyFilled,
    Filled,
    Canceled,
    Expired,
    Denied,
    Rejected,
}

#[derive(Clone, Copy, Debug, Display, Error)]
#[display("order cannot move from {_0:?} to {_1:?}")]
pub struct OrderStateError(pub OrderStatus, pub OrderStatus);

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled
                | OrderStatus::Canceled
                | OrderStatus::Expired
                | OrderStatus::Denied
                | OrderStatus::Rejected
        )
    }

    pub fn transition(self, next: OrderStatus) -> Result<OrderStatus, OrderStateError> {
        let permitted = match (self, next) {
            (OrderStatus::Initialized, OrderStatus::Submitted) => true,
            (OrderStatus::Submitted, OrderStatus::Accepted | OrderStatus::Denied) => true,
            (
                OrderStatus::Accepted,
                OrderStatus::PartiallyFilled
                | OrderStatus::Filled
                | OrderStatus::Canceled
                | OrderStatus::Expired
                | OrderStatus::Rejected,
            ) => true,
            //PartiallyFilled is re-enterable until quantity is exhausted
            (
                OrderStatus::PartiallyFilled,
                OrderStatus::PartiallyFilled
                | OrderStatus::Filled
                | OrderStatus::Canceled
                | OrderStatus::Expired,
            ) => true,
            _ => false,
        };
        if permitted {
            Ok(next)
        } else {
            Err(OrderStateError(self, next))
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Order {
    pub client_order_id: String,
    pub strategy_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub kind: OrderKind,
    pub quantity: f64,
    pub price: Option<f64>,
    pub trigger_price: Option<f64>,
    pub tif: TimeInForce,
    pub expire_ts: Option<i64>,
    pub reduce_only: bool,
    pub status: OrderStatus,
    pub filled_qty: f64,
    pub ts_submitted: Option<i64>,
}

impl Order {
    fn base(
        kind: OrderKind,
        side: OrderSide,
        symbol: impl Into<String>,
        quantity: f64,
        price: Option<f64>,
        trigger_price: Option<f64>,
    ) -> Self {
        Self {
            client_order_id: String::new(),
            strategy_id: String::new(),
            symbol: symbol.into(),
            side,
            kind,
            quantity,
            price,
            trigger_price,
            tif: TimeInForce::Gtc,
            expire_ts: None,
            reduce_only: false,
            status: OrderStatus::Initialized,
            filled_qty: 0.0,
            ts_submitted: None,
        }
    }

    pub fn market_buy(symbol: impl Into<String>, quantity: f64) -> Self {
        Self::base(OrderKind::Market, OrderSide::Buy, symbol, quantity, None, None)
    }

    pub fn market_sell(symbol: impl Into<String>, quantity: f64) -> Self {
        Self::base(OrderKind::Market, OrderSide::Sell, symbol, quantity, None, None)
    }

    pub fn limit_buy(symbol: impl Into<String>, quantity: f64, price: f64) -> Self {
        Self::base(OrderKind::Limit, OrderSide::Buy, symbol, quantity, Some(price), None)
    }

    pub fn limit_sell(symbol: impl Into<String>, quantity: f64, price: f64) -> Self {
        Self::base(OrderKind::Limit, OrderSide::Sell, symbol, quantity, Some(price), None)
    }

    pub fn stop_buy(symbol: impl Into<String>, quantity: f64, trigger: f64) -> Self {
        Self::base(
            OrderKind::StopMarket,
            OrderSide::Buy,
            symbol,
            quantity,
            None,
            Some(trigger),
        )
    }

    pub fn stop_sell(symbol: impl Into<String>, quantity: f64, trigger: f64) -> Self {
        Self::base(
            OrderKind::StopMarket,
            OrderSide::Sell,
            symbol,
            quantity,
            None,
            Some(trigger),
        )
    }

    pub fn stop_limit_buy(
        symbol: impl Into<String>,
        quantity: f64,
        trigger: f64,
        price: f64,
    ) -> Self {
        Self::base(
            OrderKind::StopLimit,
            OrderSide::Buy,
            symbol,
            quantity,
            Some(price),
            Some(trigger),
        )
    }

    pub fn stop_limit_sell(
        symbol: impl Into<String>,
        quantity: f64,
        trigger: f64,
        price: f64,
    ) -> Self {
        Self::base(
            OrderKind::StopLimit,
            OrderSide::Sell,
            symbol,
            quantity,
            Some(price),
            Some(trigger),
        )
    }

    pub fn with_tif(mut self, tif: TimeInForce) -> Self {
        self.tif = tif;
        self
    }

    pub fn with_expire_ts(mut self, expire_ts: i64) -> Self {
        self.tif = TimeInForce::Gtd;
        self.expire_ts = Some(expire_ts);
        self
    }

    pub fn reduce_only(mut self) -> Self {
        self.reduce_only = true;
        self
    }

    pub fn leaves_qty(&self) -> f64 {
        self.quantity - self.filled_qty
    }

    /// Marks the order as sent towards a venue. Panics on a double submission, which is a
    /// caller bug, not a business outcome.
    pub fn submitted(mut self) -> Self {
        self.status = self.status.transition(OrderStatus::Submitted).unwrap();
        self
    }

    pub fn apply_status(&mut self, next: OrderStatus) -> Result<(), OrderStateError> {
        self.status = self.status.transition(next)?;
        Ok(())
    }
}

/// Specific reason an order was turned away before matching.
#[derive(Clone, Debug, Deserialize, Display, Eq, PartialEq, Serialize)]
pub enum DenyReason {
    #[display("instrument is unknown to the venue")]
    UnknownInstrument,
    #[display("quantity must be positive")]
    NonPositiveQuantity,
    #[display("price is not aligned to the instrument price precision")]
    MisalignedPrice,
    #[display("venue does not support good-til-date orders")]
    GtdUnsupported,
    #[display("venue does not support reduce-only orders")]
    ReduceOnlyUnsupported,
    #[display("account is frozen")]
    FrozenAccount,
    #[display("order rate limit exceeded")]
    OrderRateExceeded,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Fill {
    pub order_id: OrderId,
    pub client_order_id: String,
    pub strategy_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub price: f64,
    pub quantity: f64,
    pub fee: f64,
    pub ts: i64,
}

impl Fill {
    pub fn value(&self) -> f64 {
        self.price * self.quantity
    }
}

/// Everything a venue reports back about an order. Rejections are data, not errors, so strategy
/// logic observes them through the same path as fills.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub enum ExecutionReport {
    Accepted {
        order_id: OrderId,
        client_order_id: String,
        strategy_id: String,
        ts: i64,
    },
    Denied {
        client_order_id: String,
        strategy_id: String,
        reason: DenyReason,
        ts: i64,
    },
    Rejected {
        order_id: OrderId,
        client_order_id: String,
        strategy_id: String,
        reason: String,
        ts: i64,
    },
    Fill(Fill),
    Canceled {
        order_id: OrderId,
        client_order_id: String,
        strategy_id: String,
        ts: i64,
    },
    CancelRejected {
        client_order_id: String,
        strategy_id: String,
        reason: String,
        ts: i64,
    },
    Updated {
        order_id: OrderId,
        client_order_id: String,
        strategy_id: String,
        ts: i64,
    },
    ModifyRejected {
        client_order_id: String,
        strategy_id: String,
        reason: String,
        ts: i64,
    },
    Expired {
        order_id: OrderId,
        client_order_id: String,
        strategy_id: String,
        ts: i64,
    },
}

impl ExecutionReport {
    pub fn strategy_id(&self) -> &str {
        match self {
            ExecutionReport::Accepted { strategy_id, .. } => strategy_id,
            ExecutionReport::Denied { strategy_id, .. } => strategy_id,
            ExecutionReport::Rejected { strategy_id, .. } => strategy_id,
            ExecutionReport::Fill(fill) => &fill.strategy_id,
            ExecutionReport::Canceled { strategy_id, .. } => strategy_id,
            ExecutionReport::CancelRejected { strategy_id, .. } => strategy_id,
            ExecutionReport::Updated { strategy_id, .. } => strategy_id,
            ExecutionReport::ModifyRejected { strategy_id, .. } => strategy_id,
            ExecutionReport::Expired { strategy_id, .. } => strategy_id,
        }
    }
}

/// Decides whether limit/stop orders fill and whether fills slip, from an injected seeded source
/// so identical runs make identical decisions. Never a global RNG.
#[derive(Clone, Debug)]
pub struct FillModel {
    prob_fill_on_limit: f64,
    prob_fill_on_stop: f64,
    prob_slippage: f64,
    rng: StdRng,
}

impl FillModel {
    pub fn new(seed: u64) -> Self {
        Self::with_probs(1.0, 1.0, 0.0, seed)
    }

    pub fn with_probs(
        prob_fill_on_limit: f64,
        prob_fill_on_stop: f64,
        prob_slippage: f64,
        seed: u64,
    ) -> Self {
        Self {
            prob_fill_on_limit,
            prob_fill_on_stop,
            prob_slippage,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    //The degenerate probabilities skip the draw so default configs don't consume RNG state
    fn event(&mut self, prob: f64) -> bool {
        if prob >= 1.0 {
            return true;
        }
        if prob <= 0.0 {
            return false;
        }
        self.rng.gen::<f64>() < prob
    }

    pub fn is_limit_filled(&mut self) -> bool {
        self.event(self.prob_fill_on_limit)
    }

    pub fn is_stop_filled(&mut self) -> bool {
        self.event(self.prob_fill_on_stop)
    }

    pub fn is_slipped(&mut self) -> bool {
        self.event(self.prob_slippage)
    }
}

/// Simulated delay between an order being submitted and becoming eligible for matching.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub enum LatencyModel {
    None,
    FixedPeriod(i64),
}

impl LatencyModel {
    pub fn is_eligible(&self, now: i64, ts_submitted: i64) -> bool {
        match self {
            Self::None => true,
            Self::FixedPeriod(period) => ts_submitted + period < now,
        }
    }
}

///Implementation of various cost models for venues. The configured list is summed over each fill
///and reported on the fill itself.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub enum FeeModel {
    PerShare(f64),
    PctOfValue(f64),
    Flat(f64),
}

impl FeeModel {
    pub fn calc(&self, value: f64, quantity: f64) -> f64 {
        match self {
            FeeModel::PerShare(cost) => cost * quantity,
            FeeModel::PctOfValue(pct) => value * pct,
            FeeModel::Flat(val) => *val,
        }
    }

    pub fn calc_total(models: &[FeeModel], value: f64, quantity: f64) -> f64 {
        let mut total = 0.0;
        for model in models {
            total += model.calc(value, quantity);
        }
        total
    }
}
