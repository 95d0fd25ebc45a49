//! Thin routing layer between data, strategies, venues, and the ledger. None of it is complex
//! on its own but everything above composes through it: the data engine fans market data out to
//! subscribers, the risk engine runs pre-trade checks, and the execution engine carries order
//! commands to the right venue and execution reports back.

use std::collections::HashMap;

use log::info;

use crate::exchange::iona::IonaV1;
use crate::exchange::{DenyReason, ExecutionReport, Order, OrderStatus};
use crate::input::MarketData;
use crate::ledger::juno::Juno;

/// Fans each market-data record out to the strategies subscribed to its topic. Topics are
/// `"{symbol}.{kind}"`, e.g. `"EUR/USD.quote"`, and patterns may use `*` as a wildcard for any
/// run of characters, so `"*.quote"` or `"EUR/USD.*"` both work.
pub struct DataEngine {
    //Registration order doubles as dispatch order so fan-out stays deterministic
    subscriptions: Vec<(String, String)>,
}

impl DataEngine {
    pub fn new() -> Self {
        Self {
            subscriptions: Vec::new(),
        }
    }

    pub fn subscribe(&mut self, strategy_id: impl Into<String>, pattern: impl Into<String>) {
        self.subscriptions.push((pattern.into(), strategy_id.into()));
    }

    pub fn topic_for(data: &MarketData) -> String {
        let kind = match data {
            MarketData::Delta(_) => "delta",
            MarketData::Trade(_) => "trade",
            MarketData::Quote(_) => "quote",
            MarketData::Bar(_) => "bar",
        };
        format!("{}.{}", data.symbol(), kind)
    }

    pub fn subscribers(&self, data: &MarketData) -> Vec<String> {
        let topic = Self::topic_for(data);
        let mut targets: Vec<String> = Vec::new();
        for (pattern, strategy_id) in &self.subscriptions {
            if Self::matches(pattern, &topic) && !targets.contains(strategy_id) {
                targets.push(strategy_id.clone());
            }
        }
        targets
    }

    fn matches(pattern: &str, topic: &str) -> bool {
        match pattern.split_once('*') {
            None => pattern == topic,
            Some((prefix, rest)) => {
                if !topic.starts_with(prefix) {
                    return false;
                }
                let remainder = &topic[prefix.len()..];
                //Wildcard is greedy from the left, try every split for the remainder
                (0..=remainder.len())
                    .any(|idx| Self::matches(rest, &remainder[idx..]))
            }
        }
    }
}

impl Default for DataEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Pre-trade checks that run before a venue ever sees the order. A failed check short-circuits
/// with a denial.
pub struct RiskEngine {
    max_order_rate: Option<usize>,
    //Orders seen per strategy at the current timestamp
    rate_window: HashMap<String, (i64, usize)>,
}

impl RiskEngine {
    pub fn new() -> Self {
        Self {
            max_order_rate: None,
            rate_window: HashMap::new(),
        }
    }

    pub fn with_max_order_rate(mut self, per_timestamp: usize) -> Self {
        self.max_order_rate = Some(per_timestamp);
        self
    }

    pub fn check(&mut self, order: &Order, venue: &str, ledger: &Juno, now: i64) -> Option<DenyReason> {
        if let Some(account) = ledger.account(venue) {
            if account.frozen {
                return Some(DenyReason::FrozenAccount);
            }
        }
        if order.quantity <= 0.0 {
            return Some(DenyReason::NonPositiveQuantity);
        }
        if let Some(max_rate) = self.max_order_rate {
            let window = self
                .rate_window
                .entry(order.strategy_id.clone())
                .or_insert((now, 0));
            if window.0 != now {
                *window = (now, 0);
            }
            window.1 += 1;
            if window.1 > max_rate {
                return Some(DenyReason::OrderRateExceeded);
            }
        }
        None
    }
}

impl Default for RiskEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Debug)]
struct OrderRoute {
    venue: String,
}

/// Routes order commands from strategies to the correct venue by instrument lookup, and knows
/// where every order it has seen lives so cancels and modifies find their way home.
pub struct ExecutionEngine {
    routes: HashMap<String, String>,
    order_routes: HashMap<String, OrderRoute>,
}

impl ExecutionEngine {
    pub fn new() -> Self {
        Self {
            routes: HashMap::new(),
            order_routes: HashMap::new(),
        }
    }

    pub fn add_route(&mut self, symbol: impl Into<String>, venue: impl Into<String>) {
        self.routes.insert(symbol.into(), venue.into());
    }

    pub fn venue_for(&self, symbol: &str) -> Option<&String> {
        self.routes.get(symbol)
    }

    /// Carries one order through risk, the venue, and the account check that runs behind
    /// acceptance. Every outcome comes back as execution reports for the ledger and the
    /// originating strategy.
    pub fn submit(
        &mut self,
        risk: &mut RiskEngine,
        venues: &mut HashMap<String, IonaV1>,
        ledger: &mut Juno,
        mut order: Order,
        now: i64,
    ) -> Vec<ExecutionReport> {
        //Factory orders are always Initialized so this transition cannot fail
        order.apply_status(OrderStatus::Submitted).unwrap();
        ledger.register_order(
            &order.client_order_id,
            &order.strategy_id,
            &order.symbol,
            order.quantity,
        );

        let venue_name = match self.routes.get(&order.symbol) {
            Some(venue_name) => venue_name.clone(),
            None => {
                info!(
                    "EXEC: No venue route for {}, denying order {}",
                    order.symbol, order.client_order_id
                );
                return vec![ExecutionReport::Denied {
                    client_order_id: order.client_order_id,
                    strategy_id: order.strategy_id,
                    reason: DenyReason::UnknownInstrument,
                    ts: now,
                }];
            }
        };

        if let Some(reason) = risk.check(&order, &venue_name, ledger, now) {
            info!(
                "EXEC: Risk check denied order {}: {}",
                order.client_order_id, reason
            );
            return vec![ExecutionReport::Denied {
                client_order_id: order.client_order_id,
                strategy_id: order.strategy_id,
                reason,
                ts: now,
            }];
        }

        //Unwrap is safe because routes are only added for configured venues
        let venue = venues.get_mut(&venue_name).unwrap();
        let client_order_id = order.client_order_id.clone();
        let strategy_id = order.strategy_id.clone();
        let symbol = order.symbol.clone();
        let side = order.side;
        let quantity = order.quantity;
        let limit_price = order.price;
        let reduce_only = order.reduce_only;

        let mut reports = venue.submit_order(order, now);

        let accepted = reports
            .iter()
            .any(|report| matches!(report, ExecutionReport::Accepted { .. }));
        if accepted {
            self.order_routes.insert(
                client_order_id.clone(),
                OrderRoute {
                    venue: venue_name.clone(),
                },
            );
            //Account checks run behind acceptance so a failure is a venue-side rejection
            if let Some(reason) = ledger.pre_trade_check(
                &strategy_id,
                &symbol,
                side,
                quantity,
                limit_price,
                reduce_only,
            ) {
                reports.append(&mut venue.reject_order(&client_order_id, reason, now));
            }
        }
        reports
    }

    pub fn cancel(
        &mut self,
        venues: &mut HashMap<String, IonaV1>,
        client_order_id: &str,
        now: i64,
    ) -> Vec<ExecutionReport> {
        match self.order_routes.get(client_order_id) {
            Some(route) => {
                let venue = venues.get_mut(&route.venue).unwrap();
                venue.cancel_order(client_order_id, now)
            }
            None => vec![ExecutionReport::CancelRejected {
                client_order_id: client_order_id.to_string(),
                strategy_id: String::new(),
                reason: "order was never routed to a venue".to_string(),
                ts: now,
            }],
        }
    }

    pub fn modify(
        &mut self,
        venues: &mut HashMap<String, IonaV1>,
        client_order_id: &str,
        quantity: Option<f64>,
        price: Option<f64>,
        now: i64,
    ) -> Vec<ExecutionReport> {
        match self.order_routes.get(client_order_id) {
            Some(route) => {
                let venue = venues.get_mut(&route.venue).unwrap();
                venue.modify_order(client_order_id, quantity, price, now)
            }
            None => vec![ExecutionReport::ModifyRejected {
                client_order_id: client_order_id.to_string(),
                strategy_id: String::new(),
                reason: "order was never routed to a venue".to_string(),
                ts: now,
            }],
        }
    }
}

impl Default for ExecutionEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::{DataEngine, ExecutionEngine, RiskEngine};
    use crate::exchange::iona::IonaV1;
    use crate::exchange::{DenyReason, ExecutionReport, Order};
    use crate::input::clio::ClioBuilder;
    use crate::input::Instrument;
    use crate::ledger::juno::Juno;
    use crate::ledger::{Account, AccountType, OmsType};

    fn setup() -> (HashMap<String, IonaV1>, Juno, ExecutionEngine, RiskEngine) {
        let mut venues = HashMap::new();
        let mut venue = IonaV1::new("SIM").with_instrument(Instrument::equity("ABC", "SIM"));
        venue.open();
        venues.insert("SIM".to_string(), venue);

        let mut ledger = Juno::new();
        ledger.add_account(
            Account::new("SIM", AccountType::Margin, "USD", 1_000_000.0),
            OmsType::Netting,
        );
        ledger.add_instrument(Instrument::equity("ABC", "SIM"));

        let mut exec = ExecutionEngine::new();
        exec.add_route("ABC", "SIM");

        (venues, ledger, exec, RiskEngine::new())
    }

    fn order(id: &str, quantity: f64) -> Order {
        let mut order = Order::market_buy("ABC", quantity);
        order.client_order_id = id.to_string();
        order.strategy_id = "S1".to_string();
        order
    }

    #[test]
    fn test_that_topic_wildcards_match() {
        assert!(DataEngine::matches("EUR/USD.quote", "EUR/USD.quote"));
        assert!(DataEngine::matches("*.quote", "EUR/USD.quote"));
        assert!(DataEngine::matches("EUR/USD.*", "EUR/USD.trade"));
        assert!(DataEngine::matches("*", "EUR/USD.bar"));
        assert!(!DataEngine::matches("*.quote", "EUR/USD.trade"));
    }

    #[test]
    fn test_that_subscribers_fan_out_in_registration_order_without_duplicates() {
        let mut data_engine = DataEngine::new();
        data_engine.subscribe("S2", "*.quote");
        data_engine.subscribe("S1", "ABC.*");
        data_engine.subscribe("S2", "ABC.quote");

        let mut builder = ClioBuilder::new();
        builder.add_quote(101.00, 102.00, 100, "ABC");
        let clio = builder.build();
        let events = clio.merged(0, 1000).unwrap();

        let targets = data_engine.subscribers(events.first().unwrap());
        assert_eq!(targets, vec!["S2".to_string(), "S1".to_string()]);
    }

    #[test]
    fn test_that_order_for_unrouted_symbol_is_denied() {
        let (mut venues, mut ledger, mut exec, mut risk) = setup();
        let mut bad = Order::market_buy("XYZ", 100.0);
        bad.client_order_id = "S1-1".to_string();
        bad.strategy_id = "S1".to_string();

        let reports = exec.submit(&mut risk, &mut venues, &mut ledger, bad, 100);
        assert!(matches!(
            reports.first().unwrap(),
            ExecutionReport::Denied {
                reason: DenyReason::UnknownInstrument,
                ..
            }
        ));
    }

    #[test]
    fn test_that_frozen_account_denies_before_venue() {
        let (mut venues, mut ledger, mut exec, mut risk) = setup();
        let mut frozen = Account::new("SIM", AccountType::Margin, "USD", 1_000_000.0);
        frozen.frozen = true;
        ledger.add_account(frozen, OmsType::Netting);

        let reports = exec.submit(&mut risk, &mut venues, &mut ledger, order("S1-1", 100.0), 100);
        assert!(matches!(
            reports.first().unwrap(),
            ExecutionReport::Denied {
                reason: DenyReason::FrozenAccount,
                ..
            }
        ));
        //The venue never saw the order so there is nothing to fill later
        assert!(venues.get("SIM").unwrap().fills().is_empty());
    }

    #[test]
    fn test_that_order_rate_limit_denies_excess_orders() {
        let (mut venues, mut ledger, mut exec, _risk) = setup();
        let mut risk = RiskEngine::new().with_max_order_rate(2);

        let first = exec.submit(&mut risk, &mut venues, &mut ledger, order("S1-1", 10.0), 100);
        let second = exec.submit(&mut risk, &mut venues, &mut ledger, order("S1-2", 10.0), 100);
        let third = exec.submit(&mut risk, &mut venues, &mut ledger, order("S1-3", 10.0), 100);

        assert!(matches!(
            first.first().unwrap(),
            ExecutionReport::Accepted { .. }
        ));
        assert!(matches!(
            second.first().unwrap(),
            ExecutionReport::Accepted { .. }
        ));
        assert!(matches!(
            third.first().unwrap(),
            ExecutionReport::Denied {
                reason: DenyReason::OrderRateExceeded,
                ..
            }
        ));
    }

    #[test]
    fn test_that_insufficient_margin_rejects_after_acceptance() {
        let (mut venues, mut ledger, mut exec, mut risk) = setup();
        ledger.add_account(
            Account::new("SIM", AccountType::Margin, "USD", 10.0),
            OmsType::Netting,
        );
        ledger.update_mark("ABC", 100.0);

        let reports = exec.submit(
            &mut risk,
            &mut venues,
            &mut ledger,
            order("S1-1", 1_000.0),
            100,
        );
        assert!(matches!(
            reports.first().unwrap(),
            ExecutionReport::Accepted { .. }
        ));
        assert!(matches!(
            reports.get(1).unwrap(),
            ExecutionReport::Rejected { .. }
        ));
    }

    #[test]
    fn test_that_cancel_routes_to_the_owning_venue() {
        let (mut venues, mut ledger, mut exec, mut risk) = setup();
        let mut resting = Order::limit_buy("ABC", 10.0, 90.0);
        resting.client_order_id = "S1-1".to_string();
        resting.strategy_id = "S1".to_string();
        exec.submit(&mut risk, &mut venues, &mut ledger, resting, 100);

        let reports = exec.cancel(&mut venues, "S1-1", 101);
        assert!(matches!(
            reports.first().unwrap(),
            ExecutionReport::Canceled { .. }
        ));
    }
}
