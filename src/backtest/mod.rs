//! Running context for a backtest. The orchestrator wires venues, ledger, engines, and
//! strategies together per run configuration, drives the replay loop one merged event at a
//! time, and collects results.
//!
//! Within a run the call stack is totally vertical: data moves venue -> ledger -> strategy, the
//! commands a strategy queues move risk -> venue -> ledger -> strategy, and no component ever
//! calls back up. That single-threaded pump is what makes two runs over the same inputs
//! byte-identical.

mod builder;

pub use builder::BacktestBuilder;

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use log::{error, info};
use serde::{Deserialize, Serialize};

use crate::clock::{DateTime, TestClock};
use crate::exchange::iona::{BookType, IonaV1};
use crate::exchange::{ExecutionReport, Fill};
use crate::input::clio::Clio;
use crate::input::MarketData;
use crate::ledger::juno::Juno;
use crate::ledger::{AccountType, Balance, OmsType, Position};
use crate::strategy::{Command, Event, StrategyRegistry, Trader};
use crate::engine::{DataEngine, ExecutionEngine, RiskEngine};

fn default_leverage() -> f64 {
    1.0
}

fn default_true() -> bool {
    true
}

/// Probabilistic fill behaviour for a venue, with the seed that makes it reproducible.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct FillModelConfig {
    pub prob_fill_on_limit: f64,
    pub prob_fill_on_stop: f64,
    pub prob_slippage: f64,
    pub seed: u64,
}

/// Everything needed to stand up one simulated venue.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct VenueConfig {
    pub name: String,
    pub oms_type: OmsType,
    pub account_type: AccountType,
    pub currency: String,
    pub starting_cash: f64,
    pub book_type: BookType,
    #[serde(default = "default_leverage")]
    pub leverage: f64,
    #[serde(default)]
    pub fill_model: Option<FillModelConfig>,
    //Fixed latency period in nanoseconds, absent means orders are eligible on the next event
    #[serde(default)]
    pub latency: Option<i64>,
    #[serde(default)]
    pub fees: Vec<crate::exchange::FeeModel>,
    #[serde(default = "default_true")]
    pub supports_gtd: bool,
    #[serde(default = "default_true")]
    pub supports_reduce_only: bool,
    #[serde(default)]
    pub frozen_account: bool,
}

impl VenueConfig {
    pub fn new(
        name: impl Into<String>,
        oms_type: OmsType,
        account_type: AccountType,
        currency: impl Into<String>,
        starting_cash: f64,
    ) -> Self {
        Self {
            name: name.into(),
            oms_type,
            account_type,
            currency: currency.into(),
            starting_cash,
            book_type: BookType::L1,
            leverage: 1.0,
            fill_model: None,
            latency: None,
            fees: Vec::new(),
            supports_gtd: true,
            supports_reduce_only: true,
            frozen_account: false,
        }
    }
}

/// Strategy reference resolvable against a [StrategyRegistry], so batches can be configured by
/// name from JSON.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct StrategyConfig {
    pub strategy_id: String,
    pub key: String,
    #[serde(default)]
    pub subscriptions: Vec<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct DataConfig {
    pub start: i64,
    pub end: i64,
    #[serde(default)]
    pub chunk_size: Option<usize>,
}

/// Serializable surface of one run, resolved into a [Backtest] with
/// [BacktestBuilder::from_config].
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct BacktestConfig {
    pub venues: Vec<VenueConfig>,
    pub data: DataConfig,
    pub strategies: Vec<StrategyConfig>,
    #[serde(default)]
    pub max_order_rate: Option<usize>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct EquitySnapshot {
    pub ts: i64,
    pub equity: f64,
}

/// Immutable snapshot of run statistics produced once at the end of a run. Elapsed wall time is
/// excluded from serialization so identical runs serialize byte-identically.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct BacktestResult {
    #[serde(skip)]
    pub elapsed_ms: u128,
    pub events_processed: u64,
    pub orders_submitted: u64,
    pub fills: Vec<Fill>,
    pub positions: Vec<Position>,
    pub balances: BTreeMap<String, Balance>,
    pub realized_pnl: BTreeMap<String, f64>,
    //Realized PnL per strategy, summed over its positions
    pub strategy_pnl: BTreeMap<String, f64>,
    pub equity_curve: Vec<EquitySnapshot>,
}

/// Fully wired run, created by [BacktestBuilder]. `run` consumes the replay exactly once.
pub struct Backtest {
    pub(crate) clio: Clio,
    pub(crate) start: i64,
    pub(crate) end: i64,
    pub(crate) chunk_size: Option<usize>,
    pub(crate) clock: TestClock,
    pub(crate) venues: std::collections::HashMap<String, IonaV1>,
    pub(crate) ledger: Juno,
    pub(crate) data_engine: DataEngine,
    pub(crate) exec_engine: ExecutionEngine,
    pub(crate) risk_engine: RiskEngine,
    pub(crate) trader: Trader,
    pub(crate) stop_flag: Option<Arc<AtomicBool>>,
    pub(crate) orders_submitted: u64,
}

impl Backtest {
    /// Installs a flag checked between chunks. A run stops cooperatively at the next chunk
    /// boundary, never mid-event, so partial processing of an event is not observable.
    pub fn with_stop_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.stop_flag = Some(flag);
        self
    }

    pub fn run(&mut self) -> anyhow::Result<BacktestResult> {
        let wall_start = Instant::now();
        let mut events_processed: u64 = 0;
        let mut equity_curve: Vec<EquitySnapshot> = Vec::new();

        for venue in self.venues.values_mut() {
            venue.open();
        }

        self.clock.advance_to(self.start);
        let start_commands = self.trader.start_all(DateTime::from(self.start));
        self.process_commands(start_commands, self.start)?;

        //Chunk boundaries are the only points where the merger may fetch more data, and the
        //only points where a cooperative stop is honoured. The store is moved out for the
        //duration of the replay, a run consumes its data exactly once.
        let clio = std::mem::replace(&mut self.clio, crate::input::clio::ClioBuilder::new().build());
        let mut stream = clio.stream(self.start, self.end, self.chunk_size.unwrap_or(usize::MAX))?;

        loop {
            if let Some(flag) = &self.stop_flag {
                if flag.load(Ordering::Relaxed) {
                    info!("BACKTEST: Stop requested, halting at chunk boundary");
                    break;
                }
            }
            let chunk = match stream.next() {
                Some(chunk) => chunk,
                None => break,
            };

            let mut last_ts = self.start;
            for event in &chunk {
                self.process_event(event)
                    .with_context(|| format!("processing event at ts {}", event.ts_init()))?;
                events_processed += 1;
                last_ts = event.ts_init();
            }

            let equity = self.total_equity();
            equity_curve.push(EquitySnapshot {
                ts: last_ts,
                equity,
            });
        }

        let stop_commands = self.trader.stop_all(DateTime::from(self.end));
        self.process_commands(stop_commands, self.end)?;

        for venue in self.venues.values_mut() {
            venue.finalize();
        }

        //Ledger totals diverging from position deltas is an engine bug, stop rather than
        //report corrupted numbers
        let mut venue_names: Vec<&String> = self.venues.keys().collect();
        venue_names.sort();
        for venue_name in &venue_names {
            if !self.ledger.reconciles(venue_name) {
                anyhow::bail!(
                    "ledger for venue {} does not reconcile with position deltas",
                    venue_name
                );
            }
        }

        let mut fills: Vec<Fill> = Vec::new();
        for venue_name in &venue_names {
            fills.extend_from_slice(self.venues.get(*venue_name).unwrap().fills());
        }
        fills.sort_by_key(|fill| fill.ts);

        let mut balances = BTreeMap::new();
        let mut realized_pnl = BTreeMap::new();
        for venue_name in &venue_names {
            //Unwrap is safe because the builder creates one account per venue
            let account = self.ledger.account(venue_name).unwrap();
            balances.insert((*venue_name).clone(), account.balance);
            realized_pnl.insert((*venue_name).clone(), account.realized_pnl);
        }

        let mut strategy_pnl: BTreeMap<String, f64> = BTreeMap::new();
        for position in self.ledger.positions() {
            *strategy_pnl.entry(position.strategy_id.clone()).or_default() +=
                position.realized_pnl;
        }

        Ok(BacktestResult {
            elapsed_ms: wall_start.elapsed().as_millis(),
            events_processed,
            orders_submitted: self.orders_submitted,
            fills,
            positions: self.ledger.positions().to_vec(),
            balances,
            realized_pnl,
            strategy_pnl,
            equity_curve,
        })
    }

    fn total_equity(&self) -> f64 {
        let mut venue_names: Vec<&String> = self.venues.keys().collect();
        venue_names.sort();
        venue_names
            .iter()
            .map(|venue_name| self.ledger.equity(venue_name))
            .sum()
    }

    /// Pumps one merged event: clock, marks, venue matching, ledger bookkeeping, strategy
    /// callbacks, and any order commands those callbacks queue.
    fn process_event(&mut self, event: &MarketData) -> anyhow::Result<()> {
        let ts = event.ts_init();
        self.clock.advance_to(ts);

        match event {
            MarketData::Quote(quote) => self.ledger.update_mark(&quote.symbol, quote.bid),
            MarketData::Trade(trade) => self.ledger.update_mark(&trade.symbol, trade.price),
            MarketData::Bar(bar) => self.ledger.update_mark(&bar.symbol, bar.close),
            MarketData::Delta(_) => {}
        }

        let mut queue: VecDeque<Command> = VecDeque::new();

        if let Some(venue_name) = self.exec_engine.venue_for(event.symbol()).cloned() {
            let venue = self.venues.get_mut(&venue_name).unwrap();
            let reports = venue.process_market_event(event, ts);
            self.handle_reports(reports, None, ts, &mut queue)?;
        }

        let targets = self.data_engine.subscribers(event);
        let commands = self.trader.dispatch_data(&targets, event, DateTime::from(ts));
        queue.extend(commands);

        self.drain_queue(queue, ts)
    }

    fn process_commands(&mut self, commands: Vec<Command>, now: i64) -> anyhow::Result<()> {
        self.drain_queue(VecDeque::from(commands), now)
    }

    fn drain_queue(&mut self, mut queue: VecDeque<Command>, now: i64) -> anyhow::Result<()> {
        while let Some(command) = queue.pop_front() {
            match command {
                Command::Submit(order) => {
                    self.orders_submitted += 1;
                    let reports = self.exec_engine.submit(
                        &mut self.risk_engine,
                        &mut self.venues,
                        &mut self.ledger,
                        order,
                        now,
                    );
                    self.handle_reports(reports, None, now, &mut queue)?;
                }
                Command::Cancel {
                    strategy_id,
                    client_order_id,
                } => {
                    let reports = self.exec_engine.cancel(&mut self.venues, &client_order_id, now);
                    self.handle_reports(reports, Some(&strategy_id), now, &mut queue)?;
                }
                Command::Modify {
                    strategy_id,
                    client_order_id,
                    quantity,
                    price,
                } => {
                    let reports = self.exec_engine.modify(
                        &mut self.venues,
                        &client_order_id,
                        quantity,
                        price,
                        now,
                    );
                    self.handle_reports(reports, Some(&strategy_id), now, &mut queue)?;
                }
            }
        }
        Ok(())
    }

    fn handle_reports(
        &mut self,
        reports: Vec<ExecutionReport>,
        origin: Option<&str>,
        now: i64,
        queue: &mut VecDeque<Command>,
    ) -> anyhow::Result<()> {
        for mut report in reports {
            //Rejections raised before routing resolved carry no strategy, the command origin does
            if let Some(origin) = origin {
                match &mut report {
                    ExecutionReport::CancelRejected { strategy_id, .. }
                    | ExecutionReport::ModifyRejected { strategy_id, .. }
                        if strategy_id.is_empty() =>
                    {
                        *strategy_id = origin.to_string();
                    }
                    _ => {}
                }
            }

            let position_events = self.ledger.apply_report(&report)?;

            let strategy_id = report.strategy_id().to_string();
            let commands = self.trader.dispatch_event(
                &strategy_id,
                &Event::Execution(report),
                DateTime::from(now),
            );
            queue.extend(commands);

            for position_event in position_events {
                let strategy_id = position_event.strategy_id().to_string();
                let commands = self.trader.dispatch_event(
                    &strategy_id,
                    &Event::Position(position_event),
                    DateTime::from(now),
                );
                queue.extend(commands);
            }
        }
        Ok(())
    }
}

/// Runs a batch of configurations against shared data. With `raise_exception` set a failing run
/// halts the batch, otherwise it is logged with its configuration context and the batch
/// continues with the remaining runs.
pub fn run_batch(
    configs: &[BacktestConfig],
    clio: &Clio,
    registry: &StrategyRegistry,
    raise_exception: bool,
) -> anyhow::Result<Vec<BacktestResult>> {
    let mut results = Vec::new();
    for (idx, config) in configs.iter().enumerate() {
        let run = BacktestBuilder::from_config(config, clio.clone(), registry)
            .map_err(anyhow::Error::new)
            .and_then(|mut backtest| backtest.run());
        match run {
            Ok(result) => results.push(result),
            Err(err) => {
                if raise_exception {
                    return Err(err.context(format!("run {} of {}", idx + 1, configs.len())));
                }
                error!(
                    "BACKTEST: Run {} failed, continuing batch: {:#} (config: {})",
                    idx + 1,
                    err,
                    serde_json::to_string(config).unwrap_or_default()
                );
            }
        }
    }
    Ok(results)
}
