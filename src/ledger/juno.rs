use std::collections::HashMap;

use log::info;

use crate::exchange::{ExecutionReport, Fill, OrderSide, OrderStatus};
use crate::input::Instrument;
use crate::ledger::{
    Account, AccountType, ConsistencyError, OmsType, Position, PositionEvent,
};

#[derive(Clone, Debug)]
struct OrderRecord {
    strategy_id: String,
    symbol: String,
    quantity: f64,
    filled_qty: f64,
    status: OrderStatus,
    history: Vec<OrderStatus>,
}

impl OrderRecord {
    fn transition(
        &mut self,
        client_order_id: &str,
        next: OrderStatus,
    ) -> Result<(), ConsistencyError> {
        match self.status.transition(next) {
            Ok(status) => {
                self.status = status;
                self.history.push(status);
                Ok(())
            }
            Err(source) => Err(ConsistencyError::BadOrderTransition {
                client_order_id: client_order_id.to_string(),
                source,
            }),
        }
    }
}

/// Account and position ledger. Consumes execution reports, maintains per-venue balances and
/// per-strategy positions, and emits position lifecycle events.
///
/// Cash accounts settle the full value of every fill against free balance, the discipline a
/// stock broker runs. Margin accounts only lock `notional / leverage` and settle realized PnL
/// when quantity comes off.
#[derive(Clone, Debug)]
pub struct Juno {
    accounts: HashMap<String, Account>,
    oms: HashMap<String, OmsType>,
    instruments: HashMap<String, Instrument>,
    positions: Vec<Position>,
    position_seq: u64,
    orders: HashMap<String, OrderRecord>,
    //Last seen price per symbol, used for pre-trade estimates and equity marks
    marks: HashMap<String, f64>,
    //Margin currently locked per (venue, symbol) so deltas can be applied incrementally
    margins: HashMap<(String, String), f64>,
}

impl Juno {
    pub fn new() -> Self {
        Self {
            accounts: HashMap::new(),
            oms: HashMap::new(),
            instruments: HashMap::new(),
            positions: Vec::new(),
            position_seq: 0,
            orders: HashMap::new(),
            marks: HashMap::new(),
            margins: HashMap::new(),
        }
    }

    pub fn add_account(&mut self, account: Account, oms: OmsType) {
        self.oms.insert(account.venue.clone(), oms);
        self.accounts.insert(account.venue.clone(), account);
    }

    pub fn add_instrument(&mut self, instrument: Instrument) {
        self.instruments
            .insert(instrument.symbol.clone(), instrument);
    }

    pub fn account(&self, venue: &str) -> Option<&Account> {
        self.accounts.get(venue)
    }

    pub fn positions(&self) -> &[Position] {
        &self.positions
    }

    pub fn open_positions(&self, strategy_id: &str) -> Vec<&Position> {
        self.positions
            .iter()
            .filter(|position| position.is_open() && position.strategy_id == strategy_id)
            .collect()
    }

    pub fn net_position_qty(&self, strategy_id: &str, symbol: &str) -> f64 {
        self.positions
            .iter()
            .filter(|position| {
                position.is_open()
                    && position.strategy_id == strategy_id
                    && position.symbol == symbol
            })
            .map(|position| position.signed_qty())
            .sum()
    }

    pub fn order_history(&self, client_order_id: &str) -> Option<&[OrderStatus]> {
        self.orders
            .get(client_order_id)
            .map(|record| record.history.as_slice())
    }

    pub fn update_mark(&mut self, symbol: &str, price: f64) {
        self.marks.insert(symbol.to_string(), price);
    }

    pub fn mark(&self, symbol: &str) -> Option<f64> {
        self.marks.get(symbol).copied()
    }

    /// Account balance plus unrealized PnL across the venue's open positions, marked at the
    /// last seen prices.
    pub fn equity(&self, venue: &str) -> f64 {
        let total = self
            .accounts
            .get(venue)
            .map(|account| account.balance.total)
            .unwrap_or(0.0);
        let unrealized: f64 = self
            .positions
            .iter()
            .filter(|position| position.is_open() && position.venue == venue)
            .map(|position| {
                self.marks
                    .get(&position.symbol)
                    .map(|mark| position.unrealized_pnl(*mark))
                    .unwrap_or(0.0)
            })
            .sum();
        total + unrealized
    }

    /// Every position delta must reconcile exactly with the account's realized PnL series.
    /// Divergence means an engine bug, callers treat a false return as fatal.
    pub fn reconciles(&self, venue: &str) -> bool {
        let from_positions: f64 = self
            .positions
            .iter()
            .filter(|position| position.venue == venue)
            .map(|position| position.realized_pnl)
            .sum();
        let from_account = self
            .accounts
            .get(venue)
            .map(|account| account.realized_pnl)
            .unwrap_or(0.0);
        (from_positions - from_account).abs() < 1e-6
    }

    /// Registers an order the moment it is sent towards a venue so later reports can be tied
    /// back to it. A report for an unregistered order is a consistency error.
    pub fn register_order(
        &mut self,
        client_order_id: &str,
        strategy_id: &str,
        symbol: &str,
        quantity: f64,
    ) {
        self.orders.insert(
            client_order_id.to_string(),
            OrderRecord {
                strategy_id: strategy_id.to_string(),
                symbol: symbol.to_string(),
                quantity,
                filled_qty: 0.0,
                status: OrderStatus::Submitted,
                history: vec![OrderStatus::Initialized, OrderStatus::Submitted],
            },
        );
    }

    /// Checks an order against the account before it reaches matching. Returns the business
    /// reason it cannot be afforded, or None when it can.
    pub fn pre_trade_check(
        &self,
        strategy_id: &str,
        symbol: &str,
        side: OrderSide,
        quantity: f64,
        limit_price: Option<f64>,
        reduce_only: bool,
    ) -> Option<String> {
        let instrument = match self.instruments.get(symbol) {
            Some(instrument) => instrument,
            None => return Some(format!("no instrument definition for {}", symbol)),
        };
        let account = match self.accounts.get(&instrument.venue) {
            Some(account) => account,
            None => return Some(format!("no account for venue {}", instrument.venue)),
        };

        if reduce_only {
            let net = self.net_position_qty(strategy_id, symbol);
            let reduces = match side {
                OrderSide::Buy => net <= -quantity,
                OrderSide::Sell => net >= quantity,
            };
            if !reduces {
                return Some("reduce-only order would grow the position".to_string());
            }
            //An order that only reduces exposure needs no balance to support it
            return None;
        }

        //Without any price to estimate against we let the order through, the venue cannot
        //fill it until data arrives anyway
        let est_price = match limit_price.or_else(|| self.marks.get(symbol).copied()) {
            Some(price) => price,
            None => return None,
        };

        match account.account_type {
            AccountType::Cash => {
                if side == OrderSide::Buy {
                    let cost = est_price * quantity * instrument.contract_size;
                    if cost > account.balance.free {
                        return Some("insufficient balance".to_string());
                    }
                } else {
                    let held = self.net_position_qty(strategy_id, symbol);
                    if held < quantity {
                        return Some("insufficient holdings for sale".to_string());
                    }
                }
            }
            AccountType::Margin => {
                let notional = Self::notional(instrument, quantity, est_price);
                let margin_init = notional / account.default_leverage;
                if margin_init > account.balance.free {
                    return Some("insufficient margin".to_string());
                }
            }
        }
        None
    }

    /// Applies one execution report. Fills move balances and positions; everything else only
    /// advances order lifecycle bookkeeping.
    pub fn apply_report(
        &mut self,
        report: &ExecutionReport,
    ) -> Result<Vec<PositionEvent>, ConsistencyError> {
        match report {
            ExecutionReport::Accepted {
                client_order_id, ..
            } => {
                self.transition_order(client_order_id, OrderStatus::Accepted)?;
                Ok(Vec::new())
            }
            ExecutionReport::Denied {
                client_order_id, ..
            } => {
                self.transition_order(client_order_id, OrderStatus::Denied)?;
                Ok(Vec::new())
            }
            ExecutionReport::Rejected {
                client_order_id, ..
            } => {
                self.transition_order(client_order_id, OrderStatus::Rejected)?;
                Ok(Vec::new())
            }
            ExecutionReport::Canceled {
                client_order_id, ..
            } => {
                self.transition_order(client_order_id, OrderStatus::Canceled)?;
                Ok(Vec::new())
            }
            ExecutionReport::Expired {
                client_order_id, ..
            } => {
                self.transition_order(client_order_id, OrderStatus::Expired)?;
                Ok(Vec::new())
            }
            ExecutionReport::Fill(fill) => self.apply_fill(fill),
            //Modify outcomes and cancel rejections carry no lifecycle or balance change
            ExecutionReport::Updated { .. }
            | ExecutionReport::CancelRejected { .. }
            | ExecutionReport::ModifyRejected { .. } => Ok(Vec::new()),
        }
    }

    fn transition_order(
        &mut self,
        client_order_id: &str,
        next: OrderStatus,
    ) -> Result<(), ConsistencyError> {
        match self.orders.get_mut(client_order_id) {
            Some(record) => record.transition(client_order_id, next),
            None => Err(ConsistencyError::UnknownOrder {
                client_order_id: client_order_id.to_string(),
            }),
        }
    }

    fn notional(instrument: &Instrument, quantity: f64, price: f64) -> f64 {
        if instrument.inverse_as_quote {
            //Inverse contracts are sized in quote units so notional is contracts over price
            quantity * instrument.contract_size / price
        } else {
            quantity * instrument.contract_size * price
        }
    }

    fn next_position_id(&mut self, venue: &str, symbol: &str, flipped: bool) -> String {
        self.position_seq += 1;
        if flipped {
            format!("{}-{}-{}F", venue, symbol, self.position_seq)
        } else {
            format!("{}-{}-{}", venue, symbol, self.position_seq)
        }
    }

    fn apply_fill(&mut self, fill: &Fill) -> Result<Vec<PositionEvent>, ConsistencyError> {
        let record = match self.orders.get_mut(&fill.client_order_id) {
            Some(record) => record,
            None => {
                return Err(ConsistencyError::UnknownOrder {
                    client_order_id: fill.client_order_id.clone(),
                })
            }
        };
        //A fill that disagrees with what was registered means the venue and ledger have
        //diverged, which is an engine bug
        if record.symbol != fill.symbol || record.strategy_id != fill.strategy_id {
            return Err(ConsistencyError::MismatchedFill {
                client_order_id: fill.client_order_id.clone(),
            });
        }
        record.filled_qty += fill.quantity;
        let next = if record.filled_qty >= record.quantity {
            OrderStatus::Filled
        } else {
            OrderStatus::PartiallyFilled
        };
        record.transition(&fill.client_order_id, next)?;

        let instrument = match self.instruments.get(&fill.symbol) {
            Some(instrument) => instrument.clone(),
            None => {
                return Err(ConsistencyError::UnknownInstrument {
                    symbol: fill.symbol.clone(),
                })
            }
        };
        let venue = instrument.venue.clone();
        let oms = *self.oms.get(&venue).unwrap_or(&OmsType::Netting);

        let events = match oms {
            OmsType::Netting => self.apply_fill_netting(fill, &instrument),
            OmsType::Hedging => self.apply_fill_hedging(fill, &instrument),
        };

        //Unwrap is safe because the orchestrator validates every instrument maps to an account
        let account = self.accounts.get_mut(&venue).unwrap();
        account.debit(fill.fee);
        if account.account_type == AccountType::Cash {
            match fill.side {
                OrderSide::Buy => account.debit(fill.value()),
                OrderSide::Sell => account.credit(fill.value()),
            }
        }

        self.recompute_margin(&venue, &instrument);

        let account = self.accounts.get(&venue).unwrap();
        if account.is_overdrawn() {
            return Err(ConsistencyError::Overdrawn { venue });
        }

        Ok(events)
    }

    /// Netting keeps at most one open position per (strategy, instrument). A fill on the same
    /// side grows it at the weighted-average price; an opposite fill shrinks it, realizing PnL;
    /// a fill through zero closes it and opens a flipped position with the residual.
    fn apply_fill_netting(&mut self, fill: &Fill, instrument: &Instrument) -> Vec<PositionEvent> {
        let mut events = Vec::new();

        let open_idx = self.positions.iter().position(|position| {
            position.is_open()
                && position.strategy_id == fill.strategy_id
                && position.symbol == fill.symbol
        });

        match open_idx {
            None => {
                let position_id = self.next_position_id(&instrument.venue, &fill.symbol, false);
                let position = Position {
                    position_id,
                    strategy_id: fill.strategy_id.clone(),
                    symbol: fill.symbol.clone(),
                    venue: instrument.venue.clone(),
                    side: fill.side,
                    quantity: fill.quantity,
                    avg_px_open: fill.price,
                    realized_pnl: 0.0,
                    ts_opened: fill.ts,
                    ts_closed: None,
                    flipped: false,
                };
                info!(
                    "LEDGER: Opened position {} for {:?} {} @ {}",
                    position.position_id, fill.side, fill.quantity, fill.price
                );
                self.positions.push(position.clone());
                events.push(PositionEvent::Opened(position));
            }
            Some(idx) => {
                if self.positions[idx].side == fill.side {
                    let position = &mut self.positions[idx];
                    //Weighted-average entry price over the combined quantity
                    position.avg_px_open = (position.avg_px_open * position.quantity
                        + fill.price * fill.quantity)
                        / (position.quantity + fill.quantity);
                    position.quantity += fill.quantity;
                    events.push(PositionEvent::Changed(position.clone()));
                } else {
                    let residual = fill.quantity - self.positions[idx].quantity;
                    if residual < 0.0 {
                        let position = &mut self.positions[idx];
                        let pnl = (fill.price - position.avg_px_open)
                            * fill.quantity
                            * position.side.sign();
                        position.quantity -= fill.quantity;
                        position.realized_pnl += pnl;
                        let snapshot = position.clone();
                        self.book_pnl_for(&instrument.venue, pnl);
                        events.push(PositionEvent::Changed(snapshot));
                    } else {
                        //Fill consumes the whole position, realize on the full quantity
                        let position = &mut self.positions[idx];
                        let pnl = (fill.price - position.avg_px_open)
                            * position.quantity
                            * position.side.sign();
                        position.realized_pnl += pnl;
                        position.quantity = 0.0;
                        position.ts_closed = Some(fill.ts);
                        let snapshot = position.clone();
                        self.book_pnl_for(&instrument.venue, pnl);
                        info!(
                            "LEDGER: Closed position {} with realized pnl {:?}",
                            snapshot.position_id, snapshot.realized_pnl
                        );
                        events.push(PositionEvent::Closed(snapshot));

                        if residual > 0.0 {
                            let position_id =
                                self.next_position_id(&instrument.venue, &fill.symbol, true);
                            let flipped = Position {
                                position_id,
                                strategy_id: fill.strategy_id.clone(),
                                symbol: fill.symbol.clone(),
                                venue: instrument.venue.clone(),
                                side: fill.side,
                                quantity: residual,
                                avg_px_open: fill.price,
                                realized_pnl: 0.0,
                                ts_opened: fill.ts,
                                ts_closed: None,
                                flipped: true,
                            };
                            self.positions.push(flipped.clone());
                            events.push(PositionEvent::Opened(flipped));
                        }
                    }
                }
            }
        }
        events
    }

    /// Hedging books same-side fills into the position they extend and reduces opposite-side
    /// positions oldest-first; any residual opens a fresh position rather than flipping.
    fn apply_fill_hedging(&mut self, fill: &Fill, instrument: &Instrument) -> Vec<PositionEvent> {
        let mut events = Vec::new();
        let mut remaining = fill.quantity;

        //Oldest-first pass over opposite-side positions
        for idx in 0..self.positions.len() {
            if remaining <= 0.0 {
                break;
            }
            let position = &self.positions[idx];
            if !position.is_open()
                || position.strategy_id != fill.strategy_id
                || position.symbol != fill.symbol
                || position.side == fill.side
            {
                continue;
            }

            let closed_qty = remaining.min(self.positions[idx].quantity);
            let position = &mut self.positions[idx];
            let pnl = (fill.price - position.avg_px_open) * closed_qty * position.side.sign();
            position.quantity -= closed_qty;
            position.realized_pnl += pnl;
            remaining -= closed_qty;

            let closed = position.quantity <= 0.0;
            if closed {
                position.ts_closed = Some(fill.ts);
            }
            let snapshot = position.clone();
            self.book_pnl_for(&instrument.venue, pnl);
            if closed {
                events.push(PositionEvent::Closed(snapshot));
            } else {
                events.push(PositionEvent::Changed(snapshot));
            }
        }

        if remaining > 0.0 {
            let same_idx = self.positions.iter().position(|position| {
                position.is_open()
                    && position.strategy_id == fill.strategy_id
                    && position.symbol == fill.symbol
                    && position.side == fill.side
            });
            match same_idx {
                Some(idx) => {
                    //Residual joins the existing same-side position at the blended price
                    let position = &mut self.positions[idx];
                    position.avg_px_open = (position.avg_px_open * position.quantity
                        + fill.price * remaining)
                        / (position.quantity + remaining);
                    position.quantity += remaining;
                    events.push(PositionEvent::Changed(position.clone()));
                }
                None => {
                    let position_id =
                        self.next_position_id(&instrument.venue, &fill.symbol, false);
                    let position = Position {
                        position_id,
                        strategy_id: fill.strategy_id.clone(),
                        symbol: fill.symbol.clone(),
                        venue: instrument.venue.clone(),
                        side: fill.side,
                        quantity: remaining,
                        avg_px_open: fill.price,
                        realized_pnl: 0.0,
                        ts_opened: fill.ts,
                        ts_closed: None,
                        flipped: false,
                    };
                    self.positions.push(position.clone());
                    events.push(PositionEvent::Opened(position));
                }
            }
        }
        events
    }

    fn book_pnl_for(&mut self, venue: &str, pnl: f64) {
        //Unwrap is safe because fills only arrive for validated venues
        let account = self.accounts.get_mut(venue).unwrap();
        match account.account_type {
            //Cash settlement already moved the money, only the reconciliation sum advances
            AccountType::Cash => account.note_pnl(pnl),
            AccountType::Margin => account.book_pnl(pnl),
        }
    }

    /// Margin accounts relock `notional / leverage` over the open quantity after every fill.
    fn recompute_margin(&mut self, venue: &str, instrument: &Instrument) {
        let account = self.accounts.get_mut(venue).unwrap();
        if account.account_type != AccountType::Margin {
            return;
        }

        let open_notional: f64 = self
            .positions
            .iter()
            .filter(|position| position.is_open() && position.symbol == instrument.symbol)
            .map(|position| Self::notional(instrument, position.quantity, position.avg_px_open))
            .sum();
        let required = open_notional / account.default_leverage;

        let key = (venue.to_string(), instrument.symbol.clone());
        let current = self.margins.get(&key).copied().unwrap_or(0.0);
        account.adjust_locked(required - current);
        self.margins.insert(key, required);
    }
}

impl Default for Juno {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::Juno;
    use crate::exchange::{ExecutionReport, Fill, OrderSide};
    use crate::input::Instrument;
    use crate::ledger::{Account, AccountType, ConsistencyError, OmsType, PositionEvent};

    fn fill(id: &str, side: OrderSide, quantity: f64, price: f64, ts: i64) -> Fill {
        Fill {
            order_id: 1,
            client_order_id: id.to_string(),
            strategy_id: "S1".to_string(),
            symbol: "EUR/USD".to_string(),
            side,
            price,
            quantity,
            fee: 0.0,
            ts,
        }
    }

    fn setup(account_type: AccountType, leverage: f64, starting: f64) -> Juno {
        let mut juno = Juno::new();
        let mut account = Account::new("SIM", account_type, "USD", starting);
        account.default_leverage = leverage;
        juno.add_account(account, OmsType::Netting);
        juno.add_instrument(Instrument::fx("EUR/USD", "SIM"));
        juno
    }

    #[test]
    fn test_that_round_trip_realizes_pnl_and_closes_position() {
        let mut juno = setup(AccountType::Margin, 10.0, 1_000_000.0);
        juno.register_order("S1-1", "S1", "EUR/USD", 100_000.0);
        juno.register_order("S1-2", "S1", "EUR/USD", 100_000.0);

        juno.apply_report(&ExecutionReport::Fill(fill(
            "S1-1",
            OrderSide::Buy,
            100_000.0,
            1.10000,
            100,
        )))
        .unwrap();
        let events = juno
            .apply_report(&ExecutionReport::Fill(fill(
                "S1-2",
                OrderSide::Sell,
                100_000.0,
                1.10050,
                200,
            )))
            .unwrap();

        assert!(matches!(events.first().unwrap(), PositionEvent::Closed(_)));
        assert_eq!(juno.positions().len(), 1);
        let position = juno.positions().first().unwrap();
        assert!(!position.is_open());
        assert!((position.realized_pnl - 50.0).abs() < 1e-9);

        let account = juno.account("SIM").unwrap();
        assert!((account.balance.total - 1_000_050.0).abs() < 1e-6);
        //Flat after the round trip so no margin stays locked
        assert!(account.balance.locked.abs() < 1e-9);
        assert!(juno.reconciles("SIM"));
    }

    #[test]
    fn test_that_margin_is_locked_against_leverage() {
        let mut juno = setup(AccountType::Margin, 10.0, 1_000_000.0);
        juno.register_order("S1-1", "S1", "EUR/USD", 100_000.0);

        juno.apply_report(&ExecutionReport::Fill(fill(
            "S1-1",
            OrderSide::Buy,
            100_000.0,
            0.80000,
            100,
        )))
        .unwrap();

        let account = juno.account("SIM").unwrap();
        //notional / leverage = 80,000 / 10
        assert!((account.balance.locked - 8_000.0).abs() < 1e-9);
        assert!(
            (account.balance.total - (account.balance.free + account.balance.locked)).abs() < 1e-9
        );
    }

    #[test]
    fn test_that_fill_through_zero_flips_position() {
        let mut juno = setup(AccountType::Margin, 10.0, 1_000_000.0);
        juno.register_order("S1-1", "S1", "EUR/USD", 100_000.0);
        juno.register_order("S1-2", "S1", "EUR/USD", 150_000.0);

        juno.apply_report(&ExecutionReport::Fill(fill(
            "S1-1",
            OrderSide::Buy,
            100_000.0,
            1.10000,
            100,
        )))
        .unwrap();
        let events = juno
            .apply_report(&ExecutionReport::Fill(fill(
                "S1-2",
                OrderSide::Sell,
                150_000.0,
                1.10000,
                200,
            )))
            .unwrap();

        assert_eq!(events.len(), 2);
        assert!(matches!(events.first().unwrap(), PositionEvent::Closed(_)));
        let opened = match events.get(1).unwrap() {
            PositionEvent::Opened(position) => position,
            _ => panic!("expected an opened position"),
        };
        assert!(opened.flipped);
        assert!(opened.position_id.ends_with('F'));
        assert_eq!(opened.side, OrderSide::Sell);
        assert_eq!(opened.quantity, 50_000.0);
    }

    #[test]
    fn test_that_same_side_fills_average_entry_price() {
        let mut juno = setup(AccountType::Margin, 10.0, 1_000_000.0);
        juno.register_order("S1-1", "S1", "EUR/USD", 100_000.0);
        juno.register_order("S1-2", "S1", "EUR/USD", 100_000.0);

        juno.apply_report(&ExecutionReport::Fill(fill(
            "S1-1",
            OrderSide::Buy,
            100_000.0,
            1.00000,
            100,
        )))
        .unwrap();
        juno.apply_report(&ExecutionReport::Fill(fill(
            "S1-2",
            OrderSide::Buy,
            100_000.0,
            1.10000,
            200,
        )))
        .unwrap();

        let position = juno.positions().first().unwrap();
        assert!((position.avg_px_open - 1.05).abs() < 1e-9);
        assert_eq!(position.quantity, 200_000.0);
    }

    #[test]
    fn test_that_hedging_allows_simultaneous_long_and_short() {
        let mut juno = Juno::new();
        juno.add_account(
            Account::new("SIM", AccountType::Margin, "USD", 1_000_000.0),
            OmsType::Hedging,
        );
        juno.add_instrument(Instrument::fx("EUR/USD", "SIM"));
        juno.register_order("S1-1", "S1", "EUR/USD", 100_000.0);

        //A lone sell under hedging opens a short rather than erroring on a missing long
        let events = juno
            .apply_report(&ExecutionReport::Fill(fill(
                "S1-1",
                OrderSide::Sell,
                100_000.0,
                1.10000,
                100,
            )))
            .unwrap();
        assert!(matches!(events.first().unwrap(), PositionEvent::Opened(_)));

        juno.register_order("S1-2", "S1", "EUR/USD", 50_000.0);
        let events = juno
            .apply_report(&ExecutionReport::Fill(fill(
                "S1-2",
                OrderSide::Buy,
                50_000.0,
                1.09000,
                200,
            )))
            .unwrap();
        //Hedging reduces the oldest opposite position first
        assert!(matches!(events.first().unwrap(), PositionEvent::Changed(_)));
        assert!(juno.reconciles("SIM"));
    }

    #[test]
    fn test_that_fill_disagreeing_with_registration_is_fatal() {
        let mut juno = setup(AccountType::Margin, 10.0, 1_000_000.0);
        juno.register_order("S1-1", "S1", "GBP/USD", 100.0);

        let res = juno.apply_report(&ExecutionReport::Fill(fill(
            "S1-1",
            OrderSide::Buy,
            100.0,
            1.0,
            100,
        )));
        assert!(matches!(res, Err(ConsistencyError::MismatchedFill { .. })));
    }

    #[test]
    fn test_that_fill_for_unknown_order_is_fatal() {
        let mut juno = setup(AccountType::Margin, 10.0, 1_000_000.0);
        let res = juno.apply_report(&ExecutionReport::Fill(fill(
            "ghost",
            OrderSide::Buy,
            100.0,
            1.0,
            100,
        )));
        assert!(matches!(res, Err(ConsistencyError::UnknownOrder { .. })));
    }

    #[test]
    fn test_that_order_history_has_exactly_one_terminal_state() {
        let mut juno = setup(AccountType::Margin, 10.0, 1_000_000.0);
        juno.register_order("S1-1", "S1", "EUR/USD", 100.0);

        juno.apply_report(&ExecutionReport::Accepted {
            order_id: 1,
            client_order_id: "S1-1".to_string(),
            strategy_id: "S1".to_string(),
            ts: 100,
        })
        .unwrap();
        juno.apply_report(&ExecutionReport::Canceled {
            order_id: 1,
            client_order_id: "S1-1".to_string(),
            strategy_id: "S1".to_string(),
            ts: 101,
        })
        .unwrap();

        //A second terminal transition must fail loudly
        let res = juno.apply_report(&ExecutionReport::Canceled {
            order_id: 1,
            client_order_id: "S1-1".to_string(),
            strategy_id: "S1".to_string(),
            ts: 102,
        });
        assert!(matches!(
            res,
            Err(ConsistencyError::BadOrderTransition { .. })
        ));

        let history = juno.order_history("S1-1").unwrap();
        let terminal_count = history.iter().filter(|status| status.is_terminal()).count();
        assert_eq!(terminal_count, 1);
    }

    #[test]
    fn test_that_cash_account_settles_full_value() {
        let mut juno = setup(AccountType::Cash, 1.0, 1_000_000.0);
        juno.register_order("S1-1", "S1", "EUR/USD", 100_000.0);

        juno.apply_report(&ExecutionReport::Fill(fill(
            "S1-1",
            OrderSide::Buy,
            100_000.0,
            1.10000,
            100,
        )))
        .unwrap();

        let account = juno.account("SIM").unwrap();
        assert!((account.balance.total - 890_000.0).abs() < 1e-6);
    }

    #[test]
    fn test_that_reduce_only_check_blocks_growth() {
        let juno = setup(AccountType::Margin, 10.0, 1_000_000.0);
        //No position yet so a reduce-only buy can only grow
        let reason = juno.pre_trade_check("S1", "EUR/USD", OrderSide::Buy, 100.0, None, true);
        assert!(reason.is_some());
    }

    #[test]
    fn test_that_insufficient_margin_is_reported() {
        let mut juno = setup(AccountType::Margin, 10.0, 100.0);
        juno.update_mark("EUR/USD", 1.10000);
        let reason =
            juno.pre_trade_check("S1", "EUR/USD", OrderSide::Buy, 100_000.0, None, false);
        assert_eq!(reason.unwrap(), "insufficient margin");
    }
}
