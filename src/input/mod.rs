//! Market data model consumed by venues and strategies. The input defines the format of quotes,
//! trades, bars, and book deltas that venues wishing to use the source must use. [clio::Clio] is
//! the library implementation of a store that merges per-instrument series into the single
//! time-ordered sequence that drives a backtest.
pub mod clio;

use derive_more::{Display, Error};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum Side {
    Bid,
    Ask,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum Aggressor {
    Buyer,
    Seller,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Level {
    pub price: f64,
    pub size: f64,
}

/// Two-sided book for a single symbol. Bids are held best-first (descending), asks best-first
/// (ascending) so matching walks each side from index zero.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Depth {
    pub bids: Vec<Level>,
    pub asks: Vec<Level>,
    pub symbol: String,
}

impl Depth {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            bids: Vec::new(),
            asks: Vec::new(),
            symbol: symbol.into(),
        }
    }

    pub fn add_level(&mut self, level: Level, side: Side) {
        match side {
            Side::Bid => {
                self.bids.push(level);
                self.bids
                    .sort_by(|x, y| y.price.partial_cmp(&x.price).unwrap());
            }
            Side::Ask => {
                self.asks.push(level);
                self.asks
                    .sort_by(|x, y| x.price.partial_cmp(&y.price).unwrap());
            }
        }
    }

    pub fn get_best_bid(&self) -> Option<&Level> {
        self.bids.first()
    }

    pub fn get_best_ask(&self) -> Option<&Level> {
        self.asks.first()
    }

    pub fn apply_delta(&mut self, delta: &BookDelta) {
        let side_levels = match delta.side {
            Side::Bid => &mut self.bids,
            Side::Ask => &mut self.asks,
        };
        match delta.op {
            BookOp::Clear => side_levels.clear(),
            BookOp::Delete => side_levels.retain(|level| level.price != delta.price),
            BookOp::Add | BookOp::Update => {
                if let Some(existing) = side_levels
                    .iter_mut()
                    .find(|level| level.price == delta.price)
                {
                    existing.size = delta.size;
                } else {
                    self.add_level(
                        Level {
                            price: delta.price,
                            size: delta.size,
                        },
                        delta.side,
                    );
                    return;
                }
                //Zero-size update removes the level rather than leaving an unfillable entry
                side_levels.retain(|level| level.size > 0.0);
            }
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct QuoteTick {
    pub symbol: String,
    pub bid: f64,
    pub bid_size: f64,
    pub ask: f64,
    pub ask_size: f64,
    pub ts_event: i64,
    pub ts_init: i64,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct TradeTick {
    pub symbol: String,
    pub price: f64,
    pub size: f64,
    pub aggressor: Aggressor,
    pub ts_event: i64,
    pub ts_init: i64,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Bar {
    pub symbol: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub ts_event: i64,
    pub ts_init: i64,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum BookOp {
    Add,
    Update,
    Delete,
    Clear,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct BookDelta {
    pub symbol: String,
    pub op: BookOp,
    pub side: Side,
    pub price: f64,
    pub size: f64,
    pub ts_event: i64,
    pub ts_init: i64,
}

/// Single variant over every kind of market data a venue can replay.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub enum MarketData {
    Delta(BookDelta),
    Trade(TradeTick),
    Quote(QuoteTick),
    Bar(Bar),
}

impl MarketData {
    pub fn symbol(&self) -> &str {
        match self {
            MarketData::Delta(delta) => &delta.symbol,
            MarketData::Trade(trade) => &trade.symbol,
            MarketData::Quote(quote) => &quote.symbol,
            MarketData::Bar(bar) => &bar.symbol,
        }
    }

    pub fn ts_init(&self) -> i64 {
        match self {
            MarketData::Delta(delta) => delta.ts_init,
            MarketData::Trade(trade) => trade.ts_init,
            MarketData::Quote(quote) => quote.ts_init,
            MarketData::Bar(bar) => bar.ts_init,
        }
    }

    pub fn ts_event(&self) -> i64 {
        match self {
            MarketData::Delta(delta) => delta.ts_event,
            MarketData::Trade(trade) => trade.ts_event,
            MarketData::Quote(quote) => quote.ts_event,
            MarketData::Bar(bar) => bar.ts_event,
        }
    }

    /// Fixed policy for ordering different kinds of data carrying the same `ts_init`: book deltas
    /// apply before trades, trades before quotes, quotes before bars. Same-timestamp ordering has
    /// to be explicit or replays stop being reproducible across runs.
    pub fn type_priority(&self) -> u8 {
        match self {
            MarketData::Delta(_) => 0,
            MarketData::Trade(_) => 1,
            MarketData::Quote(_) => 2,
            MarketData::Bar(_) => 3,
        }
    }
}

/// Immutable identity and sizing rules for a tradeable instrument. Created once at setup and
/// read-only during a run.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Instrument {
    pub symbol: String,
    pub venue: String,
    pub price_precision: u8,
    pub qty_precision: u8,
    pub tick_size: f64,
    pub lot_size: f64,
    pub contract_size: f64,
    pub base_currency: String,
    pub quote_currency: String,
    pub inverse_as_quote: bool,
}

impl Instrument {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        symbol: impl Into<String>,
        venue: impl Into<String>,
        price_precision: u8,
        qty_precision: u8,
        tick_size: f64,
        lot_size: f64,
        contract_size: f64,
        base_currency: impl Into<String>,
        quote_currency: impl Into<String>,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            venue: venue.into(),
            price_precision,
            qty_precision,
            tick_size,
            lot_size,
            contract_size,
            base_currency: base_currency.into(),
            quote_currency: quote_currency.into(),
            inverse_as_quote: false,
        }
    }

    /// Spot FX pair quoted to five decimal places, e.g. "EUR/USD".
    pub fn fx(symbol: impl Into<String>, venue: impl Into<String>) -> Self {
        let symbol = symbol.into();
        let (base, quote) = match symbol.split_once('/') {
            Some((base, quote)) => (base.to_string(), quote.to_string()),
            None => (symbol.clone(), "USD".to_string()),
        };
        Self::new(symbol, venue, 5, 0, 0.00001, 1.0, 1.0, base, quote)
    }

    /// Equity-style instrument quoted to two decimal places.
    pub fn equity(symbol: impl Into<String>, venue: impl Into<String>) -> Self {
        Self::new(symbol, venue, 2, 0, 0.01, 1.0, 1.0, "", "USD")
    }

    pub fn price_is_aligned(&self, price: f64) -> bool {
        let scale = 10_f64.powi(self.price_precision as i32);
        let scaled = price * scale;
        (scaled - scaled.round()).abs() < 1e-6
    }
}

/// Setup problems found before any event is replayed. Fatal to the run they belong to.
#[derive(Clone, Debug, Display, Error)]
pub enum ConfigError {
    #[display("data range ends ({end}) before it starts ({start})")]
    EndBeforeStart { start: i64, end: i64 },
    #[display("chunk size must be greater than zero")]
    ZeroChunkSize,
    #[display("instrument {symbol} is not attached to any configured venue")]
    UnknownInstrument { symbol: String },
    #[display("venue {venue} is configured for book data but none was supplied")]
    MissingBookData { venue: String },
    #[display("no strategy registered under key {key}")]
    UnknownStrategy { key: String },
}

#[cfg(test)]
mod tests {
    use super::{BookDelta, BookOp, Depth, Instrument, Level, Side};

    #[test]
    fn test_that_insertions_are_sorted_best_first() {
        let mut depth = Depth::new("ABC");
        depth.add_level(
            Level {
                price: 100.0,
                size: 100.0,
            },
            Side::Bid,
        );
        depth.add_level(
            Level {
                price: 101.0,
                size: 100.0,
            },
            Side::Bid,
        );
        depth.add_level(
            Level {
                price: 103.0,
                size: 100.0,
            },
            Side::Ask,
        );
        depth.add_level(
            Level {
                price: 102.0,
                size: 100.0,
            },
            Side::Ask,
        );

        assert_eq!(depth.get_best_bid().unwrap().price, 101.0);
        assert_eq!(depth.get_best_ask().unwrap().price, 102.0);
    }

    #[test]
    fn test_that_delta_update_replaces_size_and_delete_removes_level() {
        let mut depth = Depth::new("ABC");
        depth.apply_delta(&BookDelta {
            symbol: "ABC".to_string(),
            op: BookOp::Add,
            side: Side::Bid,
            price: 100.0,
            size: 50.0,
            ts_event: 0,
            ts_init: 0,
        });
        depth.apply_delta(&BookDelta {
            symbol: "ABC".to_string(),
            op: BookOp::Update,
            side: Side::Bid,
            price: 100.0,
            size: 75.0,
            ts_event: 1,
            ts_init: 1,
        });
        assert_eq!(depth.get_best_bid().unwrap().size, 75.0);

        depth.apply_delta(&BookDelta {
            symbol: "ABC".to_string(),
            op: BookOp::Delete,
            side: Side::Bid,
            price: 100.0,
            size: 0.0,
            ts_event: 2,
            ts_init: 2,
        });
        assert!(depth.get_best_bid().is_none());
    }

    #[test]
    fn test_that_price_alignment_respects_precision() {
        let instrument = Instrument::fx("EUR/USD", "SIM");
        assert!(instrument.price_is_aligned(1.10000));
        assert!(instrument.price_is_aligned(1.10005));
        assert!(!instrument.price_is_aligned(1.100001));
    }
}
