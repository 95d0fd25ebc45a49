//! # What is Elodea?
//!
//! Elodea is a deterministic, event-driven backtest engine. Historical market data is replayed
//! through simulated venues and a set of strategies, producing fills, positions, and account
//! state the way a live exchange would, but reproducibly: identical inputs and configuration
//! always produce identical results. That determinism is the point of the design, it is what
//! makes strategy research and regression testing trustworthy.
//!
//! # Implementation
//!
//! A single backtest is composed of:
//! - An input, [Clio](crate::input::clio::Clio) is the library implementation. The input
//!   defines the format of quotes, trades, bars, and book deltas, and merges per-instrument
//!   series into one globally time-ordered sequence, either materialized in one shot or
//!   streamed in bounded chunks so memory stays flat on large datasets.
//! - A venue implementation, [IonaV1](crate::exchange::iona::IonaV1) is the library
//!   implementation. The venue holds a synthetic book per instrument and matches orders
//!   against replayed data under configurable fill, latency, and fee models. Rejections are
//!   output events rather than errors so control flow stays event-driven throughout.
//! - A ledger, [Juno](crate::ledger::juno::Juno), which consumes execution reports and tracks
//!   balances, margin, and positions under netting or hedging order management.
//! - The engines in [engine](crate::engine), a thin routing layer fanning data out to
//!   subscribed strategies, carrying order commands to the right venue, and running pre-trade
//!   risk checks.
//! - The strategy runtime in [strategy](crate::strategy), which owns strategy instances and
//!   drives their lifecycle through a fixed callback contract.
//! - The orchestrator in [backtest](crate::backtest), which wires everything together from a
//!   run configuration and pumps the merged stream one event at a time.
//!
//! Backtests are single-threaded and strictly sequential by design. The only shared mutable
//! resource is the clock, owned by the orchestrator and advanced nowhere else.
pub mod backtest;
pub mod clock;
pub mod engine;
pub mod exchange;
pub mod input;
pub mod ledger;
pub mod source;
pub mod strategy;
