use std::collections::{HashMap, VecDeque};

use log::info;
use serde::{Deserialize, Serialize};

use crate::exchange::{
    DenyReason, ExecutionReport, FeeModel, Fill, FillModel, LatencyModel, Order, OrderId,
    OrderKind, OrderSide, OrderStatus, TimeInForce,
};
use crate::input::{Depth, Instrument, Level, MarketData};

/// How the venue derives its internal book from replayed data.
///
/// An `L1` venue synthesizes top-of-book from quotes, trades, and bars. An `L2` venue maintains
/// full depth from book deltas; quotes/trades/bars only move its last-traded marker.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum BookType {
    L1,
    L2,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum VenueState {
    Uninitialized,
    Ready,
    Finalized,
}

/// Size used for levels synthesized from data that carries no size, e.g. a quote with no volume
/// attached. Matching treats it as unlimited liquidity at that price.
const UNBOUNDED_SIZE: f64 = f64::MAX;

#[derive(Clone, Debug)]
struct SyntheticBook {
    depth: Depth,
    last_price: Option<f64>,
}

impl SyntheticBook {
    fn new(symbol: &str) -> Self {
        Self {
            depth: Depth::new(symbol),
            last_price: None,
        }
    }

    fn set_top_of_book(&mut self, bid: f64, bid_size: f64, ask: f64, ask_size: f64) {
        let mut depth = Depth::new(&self.depth.symbol);
        depth.add_level(
            Level {
                price: bid,
                size: if bid_size > 0.0 { bid_size } else { UNBOUNDED_SIZE },
            },
            crate::input::Side::Bid,
        );
        depth.add_level(
            Level {
                price: ask,
                size: if ask_size > 0.0 { ask_size } else { UNBOUNDED_SIZE },
            },
            crate::input::Side::Ask,
        );
        self.depth = depth;
    }

    fn best_bid(&self) -> Option<f64> {
        self.depth.get_best_bid().map(|level| level.price)
    }

    fn best_ask(&self) -> Option<f64> {
        self.depth.get_best_ask().map(|level| level.price)
    }
}

#[derive(Clone, Debug)]
struct InnerOrder {
    order_id: OrderId,
    order: Order,
    //Set once an Ioc order has had its chance, the remainder is then canceled
    attempted_execution: bool,
}

// FillTracker is stored over the life of one execution cycle so that concurrent resting orders
// do not consume the same liquidity twice. Keeping it outside the book means the underlying
// depth, which belongs to the replayed data, is never mutated by matching.
struct FillTracker {
    inner: HashMap<String, HashMap<String, f64>>,
}

impl FillTracker {
    fn new() -> Self {
        Self {
            inner: HashMap::new(),
        }
    }

    fn get_fill(&self, symbol: &str, level: &Level) -> f64 {
        if let Some(fills) = self.inner.get(symbol) {
            if let Some(val) = fills.get(&level.price.to_string()) {
                return *val;
            }
        }
        0.0
    }

    fn insert_fill(&mut self, symbol: &str, level: &Level, filled: f64) {
        let fills = self.inner.entry(symbol.to_string()).or_default();
        fills
            .entry(level.price.to_string())
            .and_modify(|count| *count += filled)
            .or_insert(filled);
    }
}

/// Simulated exchange for one venue. Matches orders against a synthetic book derived from
/// replayed market data, under configurable fill, latency, and fee models.
///
/// Two disciplines protect replay correctness:
/// * Orders submitted while an event is being processed are buffered and only enter the book on
///   the venue's next market event, so an order can never trade against the data that prompted
///   it (lookahead bias).
/// * All matching walks the resting queue in insertion order, which gives price-time priority
///   within the synthetic book: earlier-submitted orders at the same price fill first.
#[derive(Clone, Debug)]
pub struct IonaV1 {
    name: String,
    state: VenueState,
    book_type: BookType,
    instruments: HashMap<String, Instrument>,
    books: HashMap<String, SyntheticBook>,
    resting: VecDeque<InnerOrder>,
    //This is cleared on every processed market event
    order_buffer: Vec<InnerOrder>,
    last_order_id: OrderId,
    fill_model: FillModel,
    latency: LatencyModel,
    fees: Vec<FeeModel>,
    supports_gtd: bool,
    supports_reduce_only: bool,
    trade_log: Vec<Fill>,
}

impl IonaV1 {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: VenueState::Uninitialized,
            book_type: BookType::L1,
            instruments: HashMap::new(),
            books: HashMap::new(),
            resting: VecDeque::new(),
            order_buffer: Vec::new(),
            last_order_id: 0,
            fill_model: FillModel::new(0),
            latency: LatencyModel::None,
            fees: Vec::new(),
            supports_gtd: true,
            supports_reduce_only: true,
            trade_log: Vec::new(),
        }
    }

    pub fn with_instrument(mut self, instrument: Instrument) -> Self {
        self.books
            .insert(instrument.symbol.clone(), SyntheticBook::new(&instrument.symbol));
        self.instruments
            .insert(instrument.symbol.clone(), instrument);
        self
    }

    pub fn with_book_type(mut self, book_type: BookType) -> Self {
        self.book_type = book_type;
        self
    }

    pub fn with_fill_model(mut self, fill_model: FillModel) -> Self {
        self.fill_model = fill_model;
        self
    }

    pub fn with_latency(mut self, latency: LatencyModel) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_fees(mut self, fees: Vec<FeeModel>) -> Self {
        self.fees = fees;
        self
    }

    pub fn with_gtd_support(mut self, supported: bool) -> Self {
        self.supports_gtd = supported;
        self
    }

    pub fn with_reduce_only_support(mut self, supported: bool) -> Self {
        self.supports_reduce_only = supported;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn book_type(&self) -> BookType {
        self.book_type
    }

    pub fn has_instrument(&self, symbol: &str) -> bool {
        self.instruments.contains_key(symbol)
    }

    pub fn fills(&self) -> &[Fill] {
        &self.trade_log
    }

    pub fn open(&mut self) {
        assert!(
            self.state == VenueState::Uninitialized,
            "venue {} has already been opened",
            self.name
        );
        self.state = VenueState::Ready;
    }

    pub fn finalize(&mut self) {
        self.state = VenueState::Finalized;
    }

    fn assert_ready(&self) {
        assert!(
            self.state == VenueState::Ready,
            "venue {} received work while not ready",
            self.name
        );
    }

    /// Accepts an order for matching or turns it away with a reasoned denial. Accepted orders
    /// are buffered until the venue's next market event.
    pub fn submit_order(&mut self, mut order: Order, now: i64) -> Vec<ExecutionReport> {
        self.assert_ready();

        if let Some(reason) = self.validate_order(&order) {
            info!(
                "VENUE {}: Denied order {} for {}: {}",
                self.name, order.client_order_id, order.symbol, reason
            );
            //Denial is terminal, mark the order so the caller's copy agrees with the report
            //Transition from Submitted is always legal here, the order was just submitted
            order.apply_status(OrderStatus::Denied).unwrap();
            return vec![ExecutionReport::Denied {
                client_order_id: order.client_order_id,
                strategy_id: order.strategy_id,
                reason,
                ts: now,
            }];
        }

        self.last_order_id += 1;
        let order_id = self.last_order_id;
        order.ts_submitted = Some(now);
        order.apply_status(OrderStatus::Accepted).unwrap();

        let report = ExecutionReport::Accepted {
            order_id,
            client_order_id: order.client_order_id.clone(),
            strategy_id: order.strategy_id.clone(),
            ts: now,
        };

        // Orders are only inserted into the book when the next market event is processed, this
        // is to ensure proper ordering of trades relative to the data that prompted them.
        self.order_buffer.push(InnerOrder {
            order_id,
            order,
            attempted_execution: false,
        });

        vec![report]
    }

    fn validate_order(&self, order: &Order) -> Option<DenyReason> {
        let instrument = match self.instruments.get(&order.symbol) {
            Some(instrument) => instrument,
            None => return Some(DenyReason::UnknownInstrument),
        };
        if order.quantity <= 0.0 {
            return Some(DenyReason::NonPositiveQuantity);
        }
        for price in [order.price, order.trigger_price].into_iter().flatten() {
            if !instrument.price_is_aligned(price) {
                return Some(DenyReason::MisalignedPrice);
            }
        }
        if order.tif == TimeInForce::Gtd && !self.supports_gtd {
            return Some(DenyReason::GtdUnsupported);
        }
        if order.reduce_only && !self.supports_reduce_only {
            return Some(DenyReason::ReduceOnlyUnsupported);
        }
        None
    }

    /// Cancels a working order, or reports why it could not. Cancels take effect immediately,
    /// they do not queue behind the order buffer.
    pub fn cancel_order(&mut self, client_order_id: &str, now: i64) -> Vec<ExecutionReport> {
        self.assert_ready();

        let position = self
            .resting
            .iter()
            .position(|inner| inner.order.client_order_id == client_order_id);
        if let Some(position) = position {
            let mut inner = self.resting.remove(position).unwrap();
            //Cancel from a working state is always legal
            inner.order.apply_status(OrderStatus::Canceled).unwrap();
            return vec![ExecutionReport::Canceled {
                order_id: inner.order_id,
                client_order_id: inner.order.client_order_id,
                strategy_id: inner.order.strategy_id,
                ts: now,
            }];
        }

        if let Some(position) = self
            .order_buffer
            .iter()
            .position(|inner| inner.order.client_order_id == client_order_id)
        {
            let mut inner = self.order_buffer.remove(position);
            inner.order.apply_status(OrderStatus::Canceled).unwrap();
            return vec![ExecutionReport::Canceled {
                order_id: inner.order_id,
                client_order_id: inner.order.client_order_id,
                strategy_id: inner.order.strategy_id,
                ts: now,
            }];
        }

        vec![ExecutionReport::CancelRejected {
            client_order_id: client_order_id.to_string(),
            strategy_id: String::new(),
            reason: "order is unknown or already closed".to_string(),
            ts: now,
        }]
    }

    /// Pulls an accepted order back out of the venue with a business rejection, used when the
    /// account-side checks that run behind acceptance fail, e.g. insufficient margin. Rejection
    /// is terminal, the order never reaches matching.
    pub fn reject_order(
        &mut self,
        client_order_id: &str,
        reason: impl Into<String>,
        now: i64,
    ) -> Vec<ExecutionReport> {
        self.assert_ready();

        let position = self
            .order_buffer
            .iter()
            .position(|inner| inner.order.client_order_id == client_order_id)
            .or_else(|| {
                self.resting
                    .iter()
                    .position(|inner| inner.order.client_order_id == client_order_id)
                    .map(|idx| idx + self.order_buffer.len())
            });

        match position {
            Some(idx) if idx < self.order_buffer.len() => {
                let mut inner = self.order_buffer.remove(idx);
                inner.order.apply_status(OrderStatus::Rejected).unwrap();
                vec![ExecutionReport::Rejected {
                    order_id: inner.order_id,
                    client_order_id: inner.order.client_order_id,
                    strategy_id: inner.order.strategy_id,
                    reason: reason.into(),
                    ts: now,
                }]
            }
            Some(idx) => {
                let mut inner = self.resting.remove(idx - self.order_buffer.len()).unwrap();
                inner.order.apply_status(OrderStatus::Rejected).unwrap();
                vec![ExecutionReport::Rejected {
                    order_id: inner.order_id,
                    client_order_id: inner.order.client_order_id,
                    strategy_id: inner.order.strategy_id,
                    reason: reason.into(),
                    ts: now,
                }]
            }
            None => {
                info!(
                    "VENUE {}: Asked to reject unknown order {}",
                    self.name, client_order_id
                );
                Vec::new()
            }
        }
    }

    /// Replaces quantity and/or price on a working order. The order keeps its queue position.
    pub fn modify_order(
        &mut self,
        client_order_id: &str,
        quantity: Option<f64>,
        price: Option<f64>,
        now: i64,
    ) -> Vec<ExecutionReport> {
        self.assert_ready();

        let inner = self
            .resting
            .iter_mut()
            .chain(self.order_buffer.iter_mut())
            .find(|inner| inner.order.client_order_id == client_order_id);

        match inner {
            Some(inner) => {
                if let Some(quantity) = quantity {
                    if quantity <= inner.order.filled_qty {
                        return vec![ExecutionReport::ModifyRejected {
                            client_order_id: client_order_id.to_string(),
                            strategy_id: inner.order.strategy_id.clone(),
                            reason: "quantity below filled quantity".to_string(),
                            ts: now,
                        }];
                    }
                    inner.order.quantity = quantity;
                }
                if let Some(price) = price {
                    inner.order.price = Some(price);
                }
                vec![ExecutionReport::Updated {
                    order_id: inner.order_id,
                    client_order_id: inner.order.client_order_id.clone(),
                    strategy_id: inner.order.strategy_id.clone(),
                    ts: now,
                }]
            }
            None => vec![ExecutionReport::ModifyRejected {
                client_order_id: client_order_id.to_string(),
                strategy_id: String::new(),
                reason: "order is unknown or already closed".to_string(),
                ts: now,
            }],
        }
    }

    /// Updates the synthetic book from one record of replayed data and re-evaluates resting
    /// orders against the new state. Buffered submissions enter the book afterwards, never
    /// before, so they wait for the next event.
    pub fn process_market_event(&mut self, event: &MarketData, now: i64) -> Vec<ExecutionReport> {
        self.assert_ready();

        self.update_book(event);
        let mut reports = self.execute_orders(now);

        self.sort_order_buffer();
        for inner in std::mem::take(&mut self.order_buffer) {
            self.resting.push_back(inner);
        }

        for report in &reports {
            if let ExecutionReport::Fill(fill) = report {
                self.trade_log.push(fill.clone());
            }
        }
        reports
    }

    fn sort_order_buffer(&mut self) {
        //Sells free up balance for buys landing in the same cycle so they go to the front.
        //Stable sort, so insertion order is kept within each side.
        self.order_buffer.sort_by_key(|inner| match inner.order.side {
            OrderSide::Sell => 0,
            OrderSide::Buy => 1,
        })
    }

    fn update_book(&mut self, event: &MarketData) {
        let book = match self.books.get_mut(event.symbol()) {
            Some(book) => book,
            //Data for instruments this venue does not list is not an error here, the
            //orchestrator validates the mapping before the run starts
            None => return,
        };

        match event {
            MarketData::Quote(quote) => {
                if self.book_type == BookType::L1 {
                    book.set_top_of_book(quote.bid, quote.bid_size, quote.ask, quote.ask_size);
                }
            }
            MarketData::Trade(trade) => {
                book.last_price = Some(trade.price);
                if self.book_type == BookType::L1 && book.depth.bids.is_empty() {
                    book.set_top_of_book(trade.price, 0.0, trade.price, 0.0);
                }
            }
            MarketData::Bar(bar) => {
                book.last_price = Some(bar.close);
                if self.book_type == BookType::L1 {
                    book.set_top_of_book(bar.close, 0.0, bar.close, 0.0);
                }
            }
            MarketData::Delta(delta) => {
                if self.book_type == BookType::L2 {
                    book.depth.apply_delta(delta);
                }
            }
        }
    }

    fn execute_orders(&mut self, now: i64) -> Vec<ExecutionReport> {
        let mut reports: Vec<ExecutionReport> = Vec::new();
        if self.resting.is_empty() {
            return reports;
        }

        //Tracks liquidity that has been used at each level within this cycle
        let mut filled = FillTracker::new();
        let mut closed: Vec<OrderId> = Vec::new();

        let mut resting = std::mem::take(&mut self.resting);
        for inner in resting.iter_mut() {
            //Expiry applies before matching so a late trigger cannot revive a dead order
            if let Some(expire_ts) = inner.order.expire_ts {
                if expire_ts <= now {
                    inner.order.apply_status(OrderStatus::Expired).unwrap();
                    closed.push(inner.order_id);
                    reports.push(ExecutionReport::Expired {
                        order_id: inner.order_id,
                        client_order_id: inner.order.client_order_id.clone(),
                        strategy_id: inner.order.strategy_id.clone(),
                        ts: now,
                    });
                    continue;
                }
            }

            let ts_submitted = inner.order.ts_submitted.unwrap_or(now);
            if !self.latency.is_eligible(now, ts_submitted) {
                continue;
            }

            let book = match self.books.get(&inner.order.symbol) {
                Some(book) => book,
                None => continue,
            };
            if book.depth.bids.is_empty() && book.depth.asks.is_empty() {
                continue;
            }

            match inner.order.kind {
                OrderKind::StopMarket | OrderKind::StopLimit => {
                    //Triggered stops convert in place and become eligible on the next event,
                    //orders cannot jump the queue on the data that triggered them
                    if Self::stop_is_triggered(&inner.order, book)
                        && self.fill_model.is_stop_filled()
                    {
                        inner.order.kind = match inner.order.kind {
                            OrderKind::StopMarket => OrderKind::Market,
                            _ => OrderKind::Limit,
                        };
                        inner.order.trigger_price = None;
                    }
                }
                OrderKind::Market | OrderKind::Limit => {
                    let is_ioc = inner.order.tif == TimeInForce::Ioc;
                    if is_ioc && inner.attempted_execution {
                        inner.order.apply_status(OrderStatus::Canceled).unwrap();
                        closed.push(inner.order_id);
                        reports.push(ExecutionReport::Canceled {
                            order_id: inner.order_id,
                            client_order_id: inner.order.client_order_id.clone(),
                            strategy_id: inner.order.strategy_id.clone(),
                            ts: now,
                        });
                        continue;
                    }

                    if inner.order.kind == OrderKind::Limit && !self.fill_model.is_limit_filled() {
                        if is_ioc {
                            inner.attempted_execution = true;
                        }
                        continue;
                    }

                    //Unwrap is safe because the instrument was checked at submission
                    let instrument = self.instruments.get(&inner.order.symbol).unwrap();
                    let slip = self.fill_model.is_slipped();
                    let trades = Self::fill_order(
                        book,
                        instrument,
                        inner,
                        slip,
                        &self.fees,
                        &mut filled,
                        now,
                    );

                    inner.attempted_execution = true;
                    for fill in trades {
                        inner.order.filled_qty += fill.quantity;
                        let next = if inner.order.leaves_qty() <= 0.0 {
                            OrderStatus::Filled
                        } else {
                            OrderStatus::PartiallyFilled
                        };
                        //Transition from a working state is always legal
                        inner.order.apply_status(next).unwrap();
                        reports.push(ExecutionReport::Fill(fill));
                    }
                    if inner.order.status == OrderStatus::Filled {
                        closed.push(inner.order_id);
                    }
                }
            }
        }

        resting.retain(|inner| !closed.contains(&inner.order_id));
        self.resting = resting;
        reports
    }

    fn stop_is_triggered(order: &Order, book: &SyntheticBook) -> bool {
        //Unwrap is safe because stops always carry a trigger price
        let trigger = order.trigger_price.unwrap();
        match order.side {
            OrderSide::Buy => book
                .best_ask()
                .or(book.last_price)
                .map(|price| price >= trigger)
                .unwrap_or(false),
            OrderSide::Sell => book
                .best_bid()
                .or(book.last_price)
                .map(|price| price <= trigger)
                .unwrap_or(false),
        }
    }

    fn fill_order(
        book: &SyntheticBook,
        instrument: &Instrument,
        inner: &InnerOrder,
        slip: bool,
        fees: &[FeeModel],
        filled: &mut FillTracker,
        now: i64,
    ) -> Vec<Fill> {
        let order = &inner.order;
        let mut to_fill = order.leaves_qty();
        let mut fills = Vec::new();

        let is_buy = order.side == OrderSide::Buy;
        let price_check = match order.kind {
            //Unwrap is safe because limits always carry a price
            OrderKind::Limit => order.price.unwrap(),
            _ if is_buy => f64::MAX,
            _ => f64::MIN,
        };

        let levels = if is_buy { &book.depth.asks } else { &book.depth.bids };
        for level in levels {
            if is_buy && level.price > price_check {
                break;
            }
            if !is_buy && level.price < price_check {
                break;
            }

            let already_used = filled.get_fill(&order.symbol, level);
            let available = level.size - already_used;
            if available <= 0.0 {
                continue;
            }

            let qty = if available >= to_fill { to_fill } else { available };
            to_fill -= qty;

            let mut price = level.price;
            if slip {
                //Slippage moves one tick against the aggressor
                price += instrument.tick_size * order.side.sign();
            }

            let value = price * qty;
            let fill = Fill {
                order_id: inner.order_id,
                client_order_id: order.client_order_id.clone(),
                strategy_id: order.strategy_id.clone(),
                symbol: order.symbol.clone(),
                side: order.side,
                price,
                quantity: qty,
                fee: FeeModel::calc_total(fees, value, qty),
                ts: now,
            };
            filled.insert_fill(&order.symbol, level, qty);
            fills.push(fill);

            if to_fill <= 0.0 {
                break;
            }
        }
        fills
    }
}

#[cfg(test)]
mod tests {
    use super::{BookType, IonaV1};
    use crate::exchange::{
        DenyReason, ExecutionReport, FeeModel, FillModel, LatencyModel, Order, TimeInForce,
    };
    use crate::input::clio::ClioBuilder;
    use crate::input::{BookOp, Instrument, MarketData, Side};

    fn setup() -> (Vec<MarketData>, IonaV1) {
        let mut builder = ClioBuilder::new();
        builder.add_quote(101.00, 102.00, 100, "ABC");
        builder.add_quote(102.00, 103.00, 101, "ABC");
        builder.add_quote(105.00, 106.00, 102, "ABC");
        let clio = builder.build();

        let mut exchange = IonaV1::new("SIM").with_instrument(Instrument::equity("ABC", "SIM"));
        exchange.open();
        (clio.merged(0, 1000).unwrap(), exchange)
    }

    fn count_fills(reports: &[ExecutionReport]) -> usize {
        reports
            .iter()
            .filter(|report| matches!(report, ExecutionReport::Fill(_)))
            .count()
    }

    #[test]
    fn test_that_buy_market_executes_incrementing_trade_log() {
        let (events, mut exchange) = setup();

        exchange.submit_order(Order::market_buy("ABC", 100.0).submitted(), 100);
        exchange.process_market_event(&events[0], 100);
        exchange.process_market_event(&events[1], 101);

        assert_eq!(exchange.fills().len(), 1);
    }

    #[test]
    fn test_that_buy_market_executes_on_next_event() {
        //Verifies that trades do not execute instantaneously removing lookahead bias
        let (events, mut exchange) = setup();

        exchange.submit_order(Order::market_buy("ABC", 100.0).submitted(), 100);
        let reports = exchange.process_market_event(&events[0], 100);
        assert_eq!(count_fills(&reports), 0);

        let reports = exchange.process_market_event(&events[1], 101);
        assert_eq!(count_fills(&reports), 1);

        let fill = exchange.fills().first().unwrap();
        //Fill executes on the event at 101 so the price should be that event's ask
        assert_eq!(fill.price, 103.00);
        assert_eq!(fill.ts, 101);
    }

    #[test]
    fn test_that_sell_market_executes_at_bid() {
        let (events, mut exchange) = setup();

        exchange.submit_order(Order::market_sell("ABC", 100.0).submitted(), 100);
        exchange.process_market_event(&events[0], 100);
        exchange.process_market_event(&events[1], 101);

        let fill = exchange.fills().first().unwrap();
        assert_eq!(fill.price, 102.00);
    }

    #[test]
    fn test_that_order_for_unknown_instrument_is_denied() {
        let (events, mut exchange) = setup();

        let reports = exchange.submit_order(Order::market_buy("XYZ", 100.0).submitted(), 100);
        assert!(matches!(
            reports.first().unwrap(),
            ExecutionReport::Denied {
                reason: DenyReason::UnknownInstrument,
                ..
            }
        ));

        exchange.process_market_event(&events[0], 100);
        assert_eq!(exchange.fills().len(), 0);
    }

    #[test]
    fn test_that_zero_quantity_order_is_denied_without_matching() {
        let (events, mut exchange) = setup();

        let reports = exchange.submit_order(Order::market_buy("ABC", 0.0).submitted(), 100);
        assert_eq!(reports.len(), 1);
        assert!(matches!(
            reports.first().unwrap(),
            ExecutionReport::Denied {
                reason: DenyReason::NonPositiveQuantity,
                ..
            }
        ));

        exchange.process_market_event(&events[0], 100);
        exchange.process_market_event(&events[1], 101);
        assert_eq!(exchange.fills().len(), 0);
    }

    #[test]
    fn test_that_limit_buy_rests_until_price_crosses() {
        let (events, mut exchange) = setup();

        //Ask starts at 102 and only reaches the limit at the third event
        exchange.submit_order(Order::limit_buy("ABC", 100.0, 102.00).submitted(), 100);
        exchange.process_market_event(&events[0], 100);
        assert_eq!(exchange.fills().len(), 0);

        exchange.process_market_event(&events[1], 101);
        //Ask moved up to 103 which is above the limit
        assert_eq!(exchange.fills().len(), 0);

        let mut builder = ClioBuilder::new();
        builder.add_quote(100.00, 101.00, 103, "ABC");
        let clio = builder.build();
        let drop_event = clio.merged(0, 1000).unwrap();
        exchange.process_market_event(&drop_event[0], 103);
        assert_eq!(exchange.fills().len(), 1);
        assert_eq!(exchange.fills().first().unwrap().price, 101.00);
    }

    #[test]
    fn test_that_stop_buy_triggers_then_fills_on_following_event() {
        let (events, mut exchange) = setup();

        exchange.submit_order(Order::stop_buy("ABC", 100.0, 105.00).submitted(), 100);
        exchange.process_market_event(&events[0], 100);
        exchange.process_market_event(&events[1], 101);
        //Not triggered yet, ask has not touched 105
        assert_eq!(exchange.fills().len(), 0);

        //Ask reaches 106 which touches the trigger, conversion happens here
        exchange.process_market_event(&events[2], 102);
        assert_eq!(exchange.fills().len(), 0);

        let mut builder = ClioBuilder::new();
        builder.add_quote(106.00, 107.00, 103, "ABC");
        let clio = builder.build();
        let next = clio.merged(0, 1000).unwrap();
        let reports = exchange.process_market_event(&next[0], 103);
        assert_eq!(count_fills(&reports), 1);
    }

    #[test]
    fn test_that_cancel_of_resting_order_emits_canceled() {
        let (events, mut exchange) = setup();

        let mut order = Order::limit_buy("ABC", 100.0, 90.00).submitted();
        order.client_order_id = "S1-1".to_string();
        exchange.submit_order(order, 100);
        exchange.process_market_event(&events[0], 100);

        let reports = exchange.cancel_order("S1-1", 101);
        assert!(matches!(
            reports.first().unwrap(),
            ExecutionReport::Canceled { .. }
        ));
    }

    #[test]
    fn test_that_cancel_of_unknown_order_is_rejected_not_dropped() {
        let (_events, mut exchange) = setup();

        let reports = exchange.cancel_order("missing", 100);
        assert_eq!(reports.len(), 1);
        assert!(matches!(
            reports.first().unwrap(),
            ExecutionReport::CancelRejected { .. }
        ));
    }

    #[test]
    fn test_that_canceled_order_cannot_be_canceled_again() {
        let (events, mut exchange) = setup();

        let mut order = Order::limit_buy("ABC", 100.0, 90.00).submitted();
        order.client_order_id = "S1-1".to_string();
        exchange.submit_order(order, 100);
        exchange.process_market_event(&events[0], 100);

        exchange.cancel_order("S1-1", 101);
        let reports = exchange.cancel_order("S1-1", 102);
        assert!(matches!(
            reports.first().unwrap(),
            ExecutionReport::CancelRejected { .. }
        ));
    }

    #[test]
    fn test_that_modify_updates_resting_quantity() {
        let (events, mut exchange) = setup();

        let mut order = Order::limit_buy("ABC", 100.0, 90.00).submitted();
        order.client_order_id = "S1-1".to_string();
        exchange.submit_order(order, 100);
        exchange.process_market_event(&events[0], 100);

        let reports = exchange.modify_order("S1-1", Some(50.0), None, 101);
        assert!(matches!(
            reports.first().unwrap(),
            ExecutionReport::Updated { .. }
        ));
    }

    #[test]
    fn test_that_gtd_order_expires() {
        let (events, mut exchange) = setup();

        let mut order = Order::limit_buy("ABC", 100.0, 90.00)
            .with_expire_ts(101)
            .submitted();
        order.client_order_id = "S1-1".to_string();
        exchange.submit_order(order, 100);
        exchange.process_market_event(&events[0], 100);

        let reports = exchange.process_market_event(&events[1], 101);
        assert!(reports
            .iter()
            .any(|report| matches!(report, ExecutionReport::Expired { .. })));
    }

    #[test]
    fn test_that_gtd_is_denied_when_unsupported() {
        let mut exchange = IonaV1::new("SIM")
            .with_instrument(Instrument::equity("ABC", "SIM"))
            .with_gtd_support(false);
        exchange.open();

        let reports =
            exchange.submit_order(Order::limit_buy("ABC", 100.0, 90.00).with_expire_ts(200).submitted(), 100);
        assert!(matches!(
            reports.first().unwrap(),
            ExecutionReport::Denied {
                reason: DenyReason::GtdUnsupported,
                ..
            }
        ));
    }

    #[test]
    fn test_that_ioc_remainder_is_canceled_after_first_attempt() {
        let mut exchange = IonaV1::new("SIM")
            .with_instrument(Instrument::equity("ABC", "SIM"))
            .with_book_type(BookType::L2);
        exchange.open();

        let mut builder = ClioBuilder::new();
        builder.add_delta(BookOp::Add, Side::Ask, 102.00, 40.0, 100, "ABC");
        builder.add_delta(BookOp::Add, Side::Bid, 101.00, 40.0, 100, "ABC");
        let clio = builder.build();
        let events = clio.merged(0, 1000).unwrap();

        let order = Order::limit_buy("ABC", 100.0, 102.00)
            .with_tif(TimeInForce::Ioc)
            .submitted();
        exchange.submit_order(order, 99);
        exchange.process_market_event(&events[0], 100);
        exchange.process_market_event(&events[1], 100);

        //First pass fills the available 40 then the remainder cancels on the next cycle
        assert_eq!(exchange.fills().len(), 1);
        assert_eq!(exchange.fills().first().unwrap().quantity, 40.0);
    }

    #[test]
    fn test_that_l2_book_fills_across_levels_with_price_time_priority() {
        let mut exchange = IonaV1::new("SIM")
            .with_instrument(Instrument::equity("ABC", "SIM"))
            .with_book_type(BookType::L2);
        exchange.open();

        let mut builder = ClioBuilder::new();
        builder.add_delta(BookOp::Add, Side::Ask, 102.00, 80.0, 100, "ABC");
        builder.add_delta(BookOp::Add, Side::Ask, 103.00, 20.0, 101, "ABC");
        builder.add_delta(BookOp::Add, Side::Bid, 100.00, 100.0, 102, "ABC");
        let clio = builder.build();
        let events = clio.merged(0, 1000).unwrap();

        for (idx, event) in events.iter().enumerate() {
            exchange.process_market_event(event, 100 + idx as i64);
        }

        exchange.submit_order(Order::market_buy("ABC", 100.0).submitted(), 103);

        let mut builder = ClioBuilder::new();
        builder.add_delta(BookOp::Update, Side::Bid, 100.00, 100.0, 104, "ABC");
        builder.add_delta(BookOp::Update, Side::Bid, 100.00, 100.0, 105, "ABC");
        let clio = builder.build();
        let ticks = clio.merged(0, 1000).unwrap();
        //First event pulls the buffered order into the book, second matches it
        exchange.process_market_event(&ticks[0], 104);
        let reports = exchange.process_market_event(&ticks[1], 105);

        assert_eq!(count_fills(&reports), 2);
        assert_eq!(exchange.fills().first().unwrap().quantity, 80.0);
        assert_eq!(exchange.fills().get(1).unwrap().quantity, 20.0);
    }

    #[test]
    fn test_that_repeated_orders_do_not_use_same_liquidity() {
        let mut exchange = IonaV1::new("SIM")
            .with_instrument(Instrument::equity("ABC", "SIM"))
            .with_book_type(BookType::L2);
        exchange.open();

        let mut builder = ClioBuilder::new();
        builder.add_delta(BookOp::Add, Side::Ask, 102.00, 20.0, 100, "ABC");
        builder.add_delta(BookOp::Add, Side::Bid, 98.00, 20.0, 100, "ABC");
        let clio = builder.build();
        let events = clio.merged(0, 1000).unwrap();

        exchange.submit_order(Order::limit_buy("ABC", 20.0, 103.00).submitted(), 99);
        exchange.submit_order(Order::limit_buy("ABC", 20.0, 103.00).submitted(), 99);
        exchange.process_market_event(&events[0], 100);
        let reports = exchange.process_market_event(&events[1], 100);

        //Only the first order finds liquidity, the second waits for replenishment
        assert_eq!(count_fills(&reports), 1);
    }

    #[test]
    fn test_that_sells_enter_the_book_before_buys() {
        let (events, mut exchange) = setup();

        exchange.submit_order(Order::market_buy("ABC", 100.0).submitted(), 100);
        exchange.submit_order(Order::market_sell("ABC", 100.0).submitted(), 100);
        exchange.process_market_event(&events[0], 100);
        let reports = exchange.process_market_event(&events[1], 101);

        let first_fill = reports
            .iter()
            .find_map(|report| match report {
                ExecutionReport::Fill(fill) => Some(fill),
                _ => None,
            })
            .unwrap();
        assert_eq!(first_fill.side, crate::exchange::OrderSide::Sell);
    }

    #[test]
    fn test_that_latency_model_delays_fills() {
        let mut exchange = IonaV1::new("SIM")
            .with_instrument(Instrument::equity("ABC", "SIM"))
            .with_latency(LatencyModel::FixedPeriod(1));
        exchange.open();

        let mut builder = ClioBuilder::new();
        builder.add_quote(101.00, 102.00, 100, "ABC");
        builder.add_quote(101.00, 102.00, 101, "ABC");
        builder.add_quote(101.00, 102.00, 102, "ABC");
        let clio = builder.build();
        let events = clio.merged(0, 1000).unwrap();

        exchange.submit_order(Order::market_buy("ABC", 10.0).submitted(), 100);
        exchange.process_market_event(&events[0], 100);
        exchange.process_market_event(&events[1], 101);
        assert_eq!(exchange.fills().len(), 0);

        exchange.process_market_event(&events[2], 102);
        assert_eq!(exchange.fills().len(), 1);
    }

    #[test]
    fn test_that_fees_are_charged_on_fills() {
        let mut exchange = IonaV1::new("SIM")
            .with_instrument(Instrument::equity("ABC", "SIM"))
            .with_fees(vec![FeeModel::Flat(2.0)]);
        exchange.open();

        let mut builder = ClioBuilder::new();
        builder.add_quote(101.00, 102.00, 100, "ABC");
        builder.add_quote(101.00, 102.00, 101, "ABC");
        let clio = builder.build();
        let events = clio.merged(0, 1000).unwrap();

        exchange.submit_order(Order::market_buy("ABC", 10.0).submitted(), 100);
        exchange.process_market_event(&events[0], 100);
        exchange.process_market_event(&events[1], 101);

        assert_eq!(exchange.fills().first().unwrap().fee, 2.0);
    }

    #[test]
    fn test_that_probabilistic_fill_model_is_reproducible() {
        let run = |seed: u64| -> Vec<f64> {
            let mut exchange = IonaV1::new("SIM")
                .with_instrument(Instrument::equity("ABC", "SIM"))
                .with_fill_model(FillModel::with_probs(0.5, 1.0, 0.0, seed));
            exchange.open();

            let mut builder = ClioBuilder::new();
            for ts in 100..120 {
                builder.add_quote(101.00, 102.00, ts, "ABC");
            }
            let clio = builder.build();
            let events = clio.merged(0, 1000).unwrap();

            for chunk in [0, 5, 10] {
                exchange.submit_order(
                    Order::limit_buy("ABC", 10.0, 102.00).submitted(),
                    100 + chunk,
                );
            }
            for (idx, event) in events.iter().enumerate() {
                exchange.process_market_event(event, 100 + idx as i64);
            }
            exchange.fills().iter().map(|fill| fill.ts as f64).collect()
        };

        assert_eq!(run(7), run(7));
    }
}
