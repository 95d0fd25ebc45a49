use std::collections::HashMap;

use crate::backtest::{Backtest, BacktestConfig, VenueConfig};
use crate::clock::TestClock;
use crate::engine::{DataEngine, ExecutionEngine, RiskEngine};
use crate::exchange::iona::{BookType, IonaV1};
use crate::exchange::{FillModel, LatencyModel};
use crate::input::clio::Clio;
use crate::input::ConfigError;
use crate::ledger::juno::Juno;
use crate::ledger::Account;
use crate::strategy::{Strategy, StrategyRegistry, Trader};

/// Creates a [Backtest]. All configuration validation happens in `build`, before any simulated
/// time advances, so a bad setup never gets as far as replaying an event.
pub struct BacktestBuilder {
    clio: Option<Clio>,
    venues: Vec<VenueConfig>,
    strategies: Vec<(String, Box<dyn Strategy>)>,
    subscriptions: Vec<(String, String)>,
    start: Option<i64>,
    end: Option<i64>,
    chunk_size: Option<usize>,
    max_order_rate: Option<usize>,
}

impl BacktestBuilder {
    pub fn new() -> Self {
        Self {
            clio: None,
            venues: Vec::new(),
            strategies: Vec::new(),
            subscriptions: Vec::new(),
            start: None,
            end: None,
            chunk_size: None,
            max_order_rate: None,
        }
    }

    pub fn with_data(mut self, clio: Clio) -> Self {
        self.clio = Some(clio);
        self
    }

    pub fn with_venue(mut self, venue: VenueConfig) -> Self {
        self.venues.push(venue);
        self
    }

    pub fn with_strategy(mut self, strategy_id: impl Into<String>, strategy: Box<dyn Strategy>) -> Self {
        self.strategies.push((strategy_id.into(), strategy));
        self
    }

    /// Topic subscription for a strategy, e.g. `"EUR/USD.quote"` or `"*.bar"`. A strategy with
    /// no explicit subscriptions receives everything.
    pub fn with_subscription(
        mut self,
        strategy_id: impl Into<String>,
        pattern: impl Into<String>,
    ) -> Self {
        self.subscriptions.push((strategy_id.into(), pattern.into()));
        self
    }

    pub fn with_range(mut self, start: i64, end: i64) -> Self {
        self.start = Some(start);
        self.end = Some(end);
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = Some(chunk_size);
        self
    }

    pub fn with_max_order_rate(mut self, per_timestamp: usize) -> Self {
        self.max_order_rate = Some(per_timestamp);
        self
    }

    /// Resolves a serializable [BacktestConfig] against a strategy registry. Unknown strategy
    /// keys are configuration errors surfaced before the run starts.
    pub fn from_config(
        config: &BacktestConfig,
        clio: Clio,
        registry: &StrategyRegistry,
    ) -> Result<Backtest, ConfigError> {
        let mut builder = Self::new()
            .with_data(clio)
            .with_range(config.data.start, config.data.end);
        if let Some(chunk_size) = config.data.chunk_size {
            builder = builder.with_chunk_size(chunk_size);
        }
        if let Some(max_order_rate) = config.max_order_rate {
            builder = builder.with_max_order_rate(max_order_rate);
        }
        for venue in &config.venues {
            builder = builder.with_venue(venue.clone());
        }
        for strategy in &config.strategies {
            let instance = registry.create(&strategy.key).ok_or_else(|| {
                ConfigError::UnknownStrategy {
                    key: strategy.key.clone(),
                }
            })?;
            builder = builder.with_strategy(&strategy.strategy_id, instance);
            for pattern in &strategy.subscriptions {
                builder = builder.with_subscription(&strategy.strategy_id, pattern);
            }
        }
        builder.build()
    }

    pub fn build(self) -> Result<Backtest, ConfigError> {
        if self.clio.is_none() || self.start.is_none() || self.end.is_none() {
            panic!("Backtest must be built with data and a start/end range");
        }
        let clio = self.clio.unwrap();
        let start = self.start.unwrap();
        let end = self.end.unwrap();

        if end < start {
            return Err(ConfigError::EndBeforeStart { start, end });
        }
        if self.chunk_size == Some(0) {
            return Err(ConfigError::ZeroChunkSize);
        }

        //Every symbol in the requested data must belong to a configured venue, silence here
        //would surface later as orders quietly going nowhere
        for symbol in clio.symbols() {
            let instrument = clio
                .get_instrument(&symbol)
                .ok_or_else(|| ConfigError::UnknownInstrument {
                    symbol: symbol.clone(),
                })?;
            if !self
                .venues
                .iter()
                .any(|venue| venue.name == instrument.venue)
            {
                return Err(ConfigError::UnknownInstrument { symbol });
            }
        }

        //An order-book venue without book data can never fill anything
        for venue_config in &self.venues {
            if venue_config.book_type == BookType::L2 {
                let has_deltas = clio.symbols().iter().any(|symbol| {
                    clio.get_instrument(symbol)
                        .map(|instrument| instrument.venue == venue_config.name)
                        .unwrap_or(false)
                        && clio.has_deltas_for(symbol)
                });
                if !has_deltas {
                    return Err(ConfigError::MissingBookData {
                        venue: venue_config.name.clone(),
                    });
                }
            }
        }

        let mut venues: HashMap<String, IonaV1> = HashMap::new();
        let mut ledger = Juno::new();
        let mut exec_engine = ExecutionEngine::new();

        for venue_config in &self.venues {
            let fill_model = match &venue_config.fill_model {
                Some(config) => FillModel::with_probs(
                    config.prob_fill_on_limit,
                    config.prob_fill_on_stop,
                    config.prob_slippage,
                    config.seed,
                ),
                None => FillModel::new(0),
            };
            let latency = match venue_config.latency {
                Some(period) => LatencyModel::FixedPeriod(period),
                None => LatencyModel::None,
            };

            let mut venue = IonaV1::new(&venue_config.name)
                .with_book_type(venue_config.book_type)
                .with_fill_model(fill_model)
                .with_latency(latency)
                .with_fees(venue_config.fees.clone())
                .with_gtd_support(venue_config.supports_gtd)
                .with_reduce_only_support(venue_config.supports_reduce_only);

            for symbol in clio.symbols() {
                if let Some(instrument) = clio.get_instrument(&symbol) {
                    if instrument.venue == venue_config.name {
                        venue = venue.with_instrument(instrument.clone());
                        ledger.add_instrument(instrument.clone());
                        exec_engine.add_route(&symbol, &venue_config.name);
                    }
                }
            }

            let mut account = Account::new(
                &venue_config.name,
                venue_config.account_type,
                &venue_config.currency,
                venue_config.starting_cash,
            );
            account.default_leverage = venue_config.leverage;
            account.frozen = venue_config.frozen_account;
            ledger.add_account(account, venue_config.oms_type);

            venues.insert(venue_config.name.clone(), venue);
        }

        let mut data_engine = DataEngine::new();
        let mut trader = Trader::new();
        for (strategy_id, strategy) in self.strategies {
            let has_subscription = self
                .subscriptions
                .iter()
                .any(|(subscriber, _)| *subscriber == strategy_id);
            if !has_subscription {
                data_engine.subscribe(&strategy_id, "*");
            }
            trader.add_strategy(strategy_id, strategy);
        }
        for (strategy_id, pattern) in self.subscriptions {
            data_engine.subscribe(strategy_id, pattern);
        }

        let risk_engine = match self.max_order_rate {
            Some(per_timestamp) => RiskEngine::new().with_max_order_rate(per_timestamp),
            None => RiskEngine::new(),
        };

        Ok(Backtest {
            clio,
            start,
            end,
            chunk_size: self.chunk_size,
            clock: TestClock::new(start),
            venues,
            ledger,
            data_engine,
            exec_engine,
            risk_engine,
            trader,
            stop_flag: None,
            orders_submitted: 0,
        })
    }
}

impl Default for BacktestBuilder {
    fn default() -> Self {
        Self::new()
    }
}
