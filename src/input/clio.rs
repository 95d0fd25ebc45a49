use std::collections::HashMap;

use crate::input::{
    Aggressor, Bar, BookDelta, BookOp, ConfigError, Instrument, MarketData, QuoteTick, Side,
    TradeTick,
};

/// In-memory store of per-instrument market data series, merged on demand into one globally
/// time-ordered sequence. Built with [ClioBuilder].
///
/// Each (symbol, kind) pair holds its own chronological series. The merge is ordered by
/// `ts_init`, ties broken by [MarketData::type_priority] and then by the order in which series
/// were first added to the builder, so a replay over the same store is always identical.
#[derive(Clone, Debug)]
pub struct Clio {
    series: Vec<Vec<MarketData>>,
    instruments: HashMap<String, Instrument>,
}

impl Clio {
    pub fn get_instrument(&self, symbol: &str) -> Option<&Instrument> {
        self.instruments.get(symbol)
    }

    /// Symbols referenced by any series or instrument definition, sorted so callers iterating
    /// over them stay deterministic.
    pub fn symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.instruments.keys().cloned().collect();
        for series in &self.series {
            if let Some(first) = series.first() {
                let symbol = first.symbol().to_string();
                if !symbols.contains(&symbol) {
                    symbols.push(symbol);
                }
            }
        }
        symbols.sort();
        symbols
    }

    pub fn has_deltas_for(&self, symbol: &str) -> bool {
        self.series.iter().any(|series| {
            series
                .first()
                .map(|data| matches!(data, MarketData::Delta(_)) && data.symbol() == symbol)
                .unwrap_or(false)
        })
    }

    pub fn is_empty(&self) -> bool {
        self.series.iter().all(|series| series.is_empty())
    }

    /// Materializes the full merged sequence for the range. Start and end are inclusive.
    pub fn merged(&self, start: i64, end: i64) -> Result<Vec<MarketData>, ConfigError> {
        let mut stream = self.stream(start, end, usize::MAX)?;
        Ok(stream.next().unwrap_or_default())
    }

    /// Lazy chunked variant of [Clio::merged]: yields chunks of at most `chunk_size` records.
    /// The stream is forward-only, a chunk cannot be replayed once consumed.
    pub fn stream(
        &self,
        start: i64,
        end: i64,
        chunk_size: usize,
    ) -> Result<ClioStream<'_>, ConfigError> {
        if end < start {
            return Err(ConfigError::EndBeforeStart { start, end });
        }
        if chunk_size == 0 {
            return Err(ConfigError::ZeroChunkSize);
        }

        let mut cursors = Vec::with_capacity(self.series.len());
        for series in &self.series {
            //First element inside the requested range, series are sorted on build
            let pos = series.partition_point(|data| data.ts_init() < start);
            cursors.push(pos);
        }

        Ok(ClioStream {
            series: &self.series,
            cursors,
            end,
            chunk_size,
        })
    }
}

/// Forward-only iterator over merged chunks. Holding only cursor positions keeps memory bounded
/// regardless of how much history sits behind it.
#[derive(Debug)]
pub struct ClioStream<'a> {
    series: &'a [Vec<MarketData>],
    cursors: Vec<usize>,
    end: i64,
    chunk_size: usize,
}

impl ClioStream<'_> {
    fn pick_next(&self) -> Option<usize> {
        let mut best: Option<(i64, u8, usize)> = None;
        for (idx, series) in self.series.iter().enumerate() {
            let pos = self.cursors[idx];
            if let Some(data) = series.get(pos) {
                if data.ts_init() > self.end {
                    continue;
                }
                let key = (data.ts_init(), data.type_priority(), idx);
                if best.is_none() || key < best.unwrap() {
                    best = Some(key);
                }
            }
        }
        best.map(|(_, _, idx)| idx)
    }
}

impl Iterator for ClioStream<'_> {
    type Item = Vec<MarketData>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut chunk = Vec::new();
        while chunk.len() < self.chunk_size {
            match self.pick_next() {
                Some(idx) => {
                    let pos = self.cursors[idx];
                    chunk.push(self.series[idx][pos].clone());
                    self.cursors[idx] += 1;
                }
                None => break,
            }
        }
        if chunk.is_empty() {
            None
        } else {
            Some(chunk)
        }
    }
}

#[derive(Clone, Eq, Hash, PartialEq)]
struct SeriesKey {
    symbol: String,
    priority: u8,
}

/// Used to build [Clio].
pub struct ClioBuilder {
    keys: HashMap<SeriesKey, usize>,
    series: Vec<Vec<MarketData>>,
    instruments: HashMap<String, Instrument>,
}

impl ClioBuilder {
    pub fn new() -> Self {
        Self {
            keys: HashMap::new(),
            series: Vec::new(),
            instruments: HashMap::new(),
        }
    }

    pub fn add_instrument(&mut self, instrument: Instrument) -> &mut Self {
        self.instruments
            .insert(instrument.symbol.clone(), instrument);
        self
    }

    pub fn push(&mut self, data: MarketData) -> &mut Self {
        let key = SeriesKey {
            symbol: data.symbol().to_string(),
            priority: data.type_priority(),
        };
        match self.keys.get(&key) {
            Some(idx) => self.series[*idx].push(data),
            None => {
                self.keys.insert(key, self.series.len());
                self.series.push(vec![data]);
            }
        }
        self
    }

    pub fn add_quote(&mut self, bid: f64, ask: f64, ts: i64, symbol: impl Into<String>) {
        self.push(MarketData::Quote(QuoteTick {
            symbol: symbol.into(),
            bid,
            bid_size: 0.0,
            ask,
            ask_size: 0.0,
            ts_event: ts,
            ts_init: ts,
        }));
    }

    pub fn add_trade(
        &mut self,
        price: f64,
        size: f64,
        aggressor: Aggressor,
        ts: i64,
        symbol: impl Into<String>,
    ) {
        self.push(MarketData::Trade(TradeTick {
            symbol: symbol.into(),
            price,
            size,
            aggressor,
            ts_event: ts,
            ts_init: ts,
        }));
    }

    #[allow(clippy::too_many_arguments)]
    pub fn add_bar(
        &mut self,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
        ts: i64,
        symbol: impl Into<String>,
    ) {
        self.push(MarketData::Bar(Bar {
            symbol: symbol.into(),
            open,
            high,
            low,
            close,
            volume,
            ts_event: ts,
            ts_init: ts,
        }));
    }

    pub fn add_delta(
        &mut self,
        op: BookOp,
        side: Side,
        price: f64,
        size: f64,
        ts: i64,
        symbol: impl Into<String>,
    ) {
        self.push(MarketData::Delta(BookDelta {
            symbol: symbol.into(),
            op,
            side,
            price,
            size,
            ts_event: ts,
            ts_init: ts,
        }));
    }

    /// Series are sorted by `ts_init` here so callers can add out of order without breaking the
    /// merge. The sort is stable, same-timestamp records within one series keep add order.
    pub fn build(mut self) -> Clio {
        for series in self.series.iter_mut() {
            series.sort_by_key(|data| data.ts_init());
        }
        Clio {
            series: self.series,
            instruments: self.instruments,
        }
    }
}

impl Default for ClioBuilder {
    fn default() -> Self {
        Self::new()
    }
}
