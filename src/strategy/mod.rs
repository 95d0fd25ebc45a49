//! Strategy lifecycle contract and the runtime that owns strategy instances. The core
//! guarantees callbacks are invoked strictly in global timestamp order, synchronously, with no
//! reentrancy: a callback queues commands on its context and the orchestrator drains them after
//! the callback returns.

use std::collections::HashMap;

use log::info;

use crate::clock::DateTime;
use crate::exchange::{ExecutionReport, Order};
use crate::input::{Bar, BookDelta, MarketData, QuoteTick, TradeTick};
use crate::ledger::PositionEvent;

/// Everything routed back to a strategy's `on_event` callback.
#[derive(Clone, Debug)]
pub enum Event {
    Execution(ExecutionReport),
    Position(PositionEvent),
}

/// Order commands queued by a strategy during a callback. Drained and routed by the
/// orchestrator once the callback returns, never mid-callback.
#[derive(Clone, Debug)]
pub enum Command {
    Submit(Order),
    Cancel {
        strategy_id: String,
        client_order_id: String,
    },
    Modify {
        strategy_id: String,
        client_order_id: String,
        quantity: Option<f64>,
        price: Option<f64>,
    },
}

/// Handle passed into every callback: clock time, the order factory, and the command queue.
#[derive(Clone, Debug)]
pub struct StrategyCtx {
    strategy_id: String,
    now: DateTime,
    order_seq: u64,
    commands: Vec<Command>,
}

impl StrategyCtx {
    pub fn new(strategy_id: impl Into<String>) -> Self {
        Self {
            strategy_id: strategy_id.into(),
            now: DateTime::from(0),
            order_seq: 0,
            commands: Vec::new(),
        }
    }

    pub fn strategy_id(&self) -> &str {
        &self.strategy_id
    }

    pub fn now(&self) -> DateTime {
        self.now
    }

    /// Stamps the order with a deterministic client id and this strategy's identity, then
    /// queues it for submission.
    pub fn submit_order(&mut self, mut order: Order) -> String {
        self.order_seq += 1;
        order.client_order_id = format!("{}-{}", self.strategy_id, self.order_seq);
        order.strategy_id = self.strategy_id.clone();
        let client_order_id = order.client_order_id.clone();
        info!(
            "STRATEGY {}: Queueing {:?} {:?} order for {:?} {}",
            self.strategy_id, order.side, order.kind, order.quantity, order.symbol
        );
        self.commands.push(Command::Submit(order));
        client_order_id
    }

    pub fn cancel_order(&mut self, client_order_id: impl Into<String>) {
        self.commands.push(Command::Cancel {
            strategy_id: self.strategy_id.clone(),
            client_order_id: client_order_id.into(),
        });
    }

    pub fn modify_order(
        &mut self,
        client_order_id: impl Into<String>,
        quantity: Option<f64>,
        price: Option<f64>,
    ) {
        self.commands.push(Command::Modify {
            strategy_id: self.strategy_id.clone(),
            client_order_id: client_order_id.into(),
            quantity,
            price,
        });
    }

    pub(crate) fn set_now(&mut self, now: DateTime) {
        self.now = now;
    }

    pub(crate) fn drain_commands(&mut self) -> Vec<Command> {
        std::mem::take(&mut self.commands)
    }
}

/// Single lifecycle contract for anything the runtime drives. Data callbacks default to no-ops
/// so a strategy only implements the shapes it subscribes to; `on_data` additionally receives
/// every subscribed record after its type-specific callback.
pub trait Strategy {
    fn on_start(&mut self, _ctx: &mut StrategyCtx) {}
    fn on_stop(&mut self, _ctx: &mut StrategyCtx) {}
    fn on_reset(&mut self) {}
    fn on_dispose(&mut self) {}

    fn on_quote(&mut self, _ctx: &mut StrategyCtx, _quote: &QuoteTick) {}
    fn on_trade(&mut self, _ctx: &mut StrategyCtx, _trade: &TradeTick) {}
    fn on_bar(&mut self, _ctx: &mut StrategyCtx, _bar: &Bar) {}
    fn on_delta(&mut self, _ctx: &mut StrategyCtx, _delta: &BookDelta) {}
    fn on_data(&mut self, _ctx: &mut StrategyCtx, _data: &MarketData) {}

    fn on_event(&mut self, _ctx: &mut StrategyCtx, _event: &Event) {}
}

/// Maps a stable string key to a strategy factory, resolved at configuration-load time. Keeps
/// configure-by-name ergonomics without any runtime reflection.
pub struct StrategyRegistry {
    factories: HashMap<String, Box<dyn Fn() -> Box<dyn Strategy>>>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn register<F>(&mut self, key: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn Strategy> + 'static,
    {
        self.factories.insert(key.into(), Box::new(factory));
    }

    pub fn create(&self, key: &str) -> Option<Box<dyn Strategy>> {
        self.factories.get(key).map(|factory| factory())
    }
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StrategyState {
    Ready,
    Running,
    Stopped,
}

struct TraderEntry {
    strategy: Box<dyn Strategy>,
    ctx: StrategyCtx,
    state: StrategyState,
}

/// Owns the active strategy instances and drives their lifecycle. Dispatch order is the order
/// strategies were added, which keeps multi-strategy runs reproducible.
pub struct Trader {
    entries: Vec<TraderEntry>,
}

impl Trader {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn add_strategy(&mut self, strategy_id: impl Into<String>, strategy: Box<dyn Strategy>) {
        let strategy_id = strategy_id.into();
        self.entries.push(TraderEntry {
            strategy,
            ctx: StrategyCtx::new(strategy_id),
            state: StrategyState::Ready,
        });
    }

    pub fn strategy_ids(&self) -> Vec<String> {
        self.entries
            .iter()
            .map(|entry| entry.ctx.strategy_id().to_string())
            .collect()
    }

    pub fn start_all(&mut self, now: DateTime) -> Vec<Command> {
        let mut commands = Vec::new();
        for entry in self.entries.iter_mut() {
            entry.ctx.set_now(now);
            entry.strategy.on_start(&mut entry.ctx);
            entry.state = StrategyState::Running;
            commands.append(&mut entry.ctx.drain_commands());
        }
        commands
    }

    pub fn stop_all(&mut self, now: DateTime) -> Vec<Command> {
        let mut commands = Vec::new();
        for entry in self.entries.iter_mut() {
            if entry.state != StrategyState::Running {
                continue;
            }
            entry.ctx.set_now(now);
            entry.strategy.on_stop(&mut entry.ctx);
            entry.state = StrategyState::Stopped;
            commands.append(&mut entry.ctx.drain_commands());
        }
        commands
    }

    pub fn reset_all(&mut self) {
        for entry in self.entries.iter_mut() {
            entry.strategy.on_reset();
            entry.state = StrategyState::Ready;
        }
    }

    pub fn dispose_all(&mut self) {
        for entry in self.entries.iter_mut() {
            entry.strategy.on_dispose();
        }
    }

    /// Forwards one record of market data to the named strategies, in the trader's own
    /// strategy order, and returns whatever commands the callbacks queued.
    pub fn dispatch_data(
        &mut self,
        targets: &[String],
        data: &MarketData,
        now: DateTime,
    ) -> Vec<Command> {
        let mut commands = Vec::new();
        for entry in self.entries.iter_mut() {
            if entry.state != StrategyState::Running {
                continue;
            }
            if !targets
                .iter()
                .any(|target| target == entry.ctx.strategy_id())
            {
                continue;
            }
            entry.ctx.set_now(now);
            match data {
                MarketData::Quote(quote) => entry.strategy.on_quote(&mut entry.ctx, quote),
                MarketData::Trade(trade) => entry.strategy.on_trade(&mut entry.ctx, trade),
                MarketData::Bar(bar) => entry.strategy.on_bar(&mut entry.ctx, bar),
                MarketData::Delta(delta) => entry.strategy.on_delta(&mut entry.ctx, delta),
            }
            entry.strategy.on_data(&mut entry.ctx, data);
            commands.append(&mut entry.ctx.drain_commands());
        }
        commands
    }

    /// Routes an execution or position event back to the strategy that owns it.
    pub fn dispatch_event(
        &mut self,
        strategy_id: &str,
        event: &Event,
        now: DateTime,
    ) -> Vec<Command> {
        let mut commands = Vec::new();
        for entry in self.entries.iter_mut() {
            if entry.ctx.strategy_id() != strategy_id {
                continue;
            }
            if entry.state != StrategyState::Running {
                continue;
            }
            entry.ctx.set_now(now);
            entry.strategy.on_event(&mut entry.ctx, event);
            commands.append(&mut entry.ctx.drain_commands());
        }
        commands
    }
}

impl Default for Trader {
    fn default() -> Self {
        Self::new()
    }
}
