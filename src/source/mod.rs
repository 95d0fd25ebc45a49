//! Sources are external data sources that are converted into input types. Source parsing is
//! kept away from the engine: each source has its own raw format that is translated into
//! [crate::input] records before anything downstream sees it.

use std::path::Path;

use anyhow::Context;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Uniform};

use crate::input::clio::{Clio, ClioBuilder};
use crate::input::Instrument;

/// Reads a Binance 1m kline CSV from disk into bars for one symbol. Timestamps in the file are
/// milliseconds and are converted to nanoseconds.
pub fn load_binance_klines(
    path: &Path,
    symbol: &str,
    venue: &str,
) -> anyhow::Result<Clio> {
    let mut builder = ClioBuilder::new();
    builder.add_instrument(Instrument::equity(symbol, venue));

    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(false)
        .from_path(path)
        .with_context(|| format!("opening kline file {:?}", path))?;

    for row in rdr.records() {
        let row = row?;
        /*
         * Binance data format:
         * 1607444700000,          // Open time
         * "18879.99",             // Open
         * "18900.00",             // High
         * "18878.98",             // Low
         * "18896.13",             // Close (or latest price)
         * "492.363",              // Volume
         * 1607444759999,          // Close time
         * "9302145.66080",        // Quote asset volume
         * 1874,                   // Number of trades
         * "385.983",              // Taker buy volume
         * "7292402.33267",        // Taker buy quote asset volume
         * "0"                     // Ignore.
         */
        let open_time_ms: i64 = row[0].parse()?;
        builder.add_bar(
            row[1].parse()?,
            row[2].parse()?,
            row[3].parse()?,
            row[4].parse()?,
            row[5].parse()?,
            open_time_ms * 1_000_000,
            symbol,
        );
    }
    Ok(builder.build())
}

/// Seeded random quote series for tests, benches, and examples. Seeding rather than ambient
/// randomness keeps every consumer of this source reproducible.
pub fn random_quotes(length: i64, symbols: &[&str], venue: &str, seed: u64) -> Clio {
    let price_dist = Uniform::new(90.0, 100.0);
    let mut rng = StdRng::seed_from_u64(seed);

    let mut builder = ClioBuilder::new();
    for symbol in symbols {
        builder.add_instrument(Instrument::equity(*symbol, venue));
    }

    for ts in 100..length + 100 {
        for symbol in symbols {
            let random_price = price_dist.sample(&mut rng);
            builder.add_quote(random_price * 0.99, random_price * 1.01, ts, *symbol);
        }
    }
    builder.build()
}
