use std::env;
use std::path::Path;

use elodea::backtest::{BacktestBuilder, VenueConfig};
use elodea::exchange::{ExecutionReport, FeeModel, Order};
use elodea::input::QuoteTick;
use elodea::ledger::{AccountType, OmsType};
use elodea::source;
use elodea::strategy::{Event, Strategy, StrategyCtx};

/// Buys when the bid ticks up, exits when it ticks down. Exists to give the demo something to
/// trade, not to make money.
struct Momentum {
    last_bid: Option<f64>,
    holding: f64,
    clip: f64,
}

impl Strategy for Momentum {
    fn on_quote(&mut self, ctx: &mut StrategyCtx, quote: &QuoteTick) {
        if let Some(last_bid) = self.last_bid {
            if quote.bid > last_bid && self.holding == 0.0 {
                ctx.submit_order(Order::market_buy(&quote.symbol, self.clip));
            } else if quote.bid < last_bid && self.holding > 0.0 {
                ctx.submit_order(Order::market_sell(&quote.symbol, self.holding));
            }
        }
        self.last_bid = Some(quote.bid);
    }

    fn on_event(&mut self, _ctx: &mut StrategyCtx, event: &Event) {
        if let Event::Execution(ExecutionReport::Fill(fill)) = event {
            self.holding += fill.quantity * fill.side.sign();
        }
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    //Optionally takes a path to a Binance 1m kline CSV, otherwise runs on a seeded random
    //series so the demo works with no data on disk
    let args: Vec<String> = env::args().collect();
    let clio = match args.get(1) {
        Some(path) => source::load_binance_klines(Path::new(path), "BTC", "SIM")?,
        None => source::random_quotes(1_000, &["ABC"], "SIM", 42),
    };

    let mut venue = VenueConfig::new("SIM", OmsType::Netting, AccountType::Cash, "USD", 1_000_000.0);
    venue.fees = vec![FeeModel::Flat(1.0)];

    let mut backtest = BacktestBuilder::new()
        .with_data(clio)
        .with_venue(venue)
        .with_strategy(
            "MOM-1",
            Box::new(Momentum {
                last_bid: None,
                holding: 0.0,
                clip: 100.0,
            }),
        )
        .with_range(0, i64::MAX)
        .with_chunk_size(256)
        .build()?;

    let result = backtest.run()?;

    println!(
        "processed {} events, {} orders, {} fills in {}ms",
        result.events_processed,
        result.orders_submitted,
        result.fills.len(),
        result.elapsed_ms
    );
    for (venue, balance) in &result.balances {
        println!(
            "{}: total {:.2} free {:.2} locked {:.2}",
            venue, balance.total, balance.free, balance.locked
        );
    }
    for (venue, pnl) in &result.realized_pnl {
        println!("{}: realized pnl {:.2}", venue, pnl);
    }
    Ok(())
}
