use criterion::{criterion_group, criterion_main, Criterion};

use elodea::exchange::iona::IonaV1;
use elodea::exchange::Order;
use elodea::input::clio::ClioBuilder;
use elodea::input::Instrument;

fn iona_core_loop_test() {
    let mut builder = ClioBuilder::new();
    builder.add_quote(100.00, 101.00, 100, "ABC");
    builder.add_quote(10.00, 11.00, 100, "BCD");
    builder.add_quote(100.00, 101.00, 101, "ABC");
    builder.add_quote(10.00, 11.00, 101, "BCD");
    builder.add_quote(104.00, 105.00, 102, "ABC");
    builder.add_quote(10.00, 11.00, 102, "BCD");
    builder.add_quote(104.00, 105.00, 103, "ABC");
    builder.add_quote(12.00, 13.00, 103, "BCD");
    let clio = builder.build();
    let events = clio.merged(0, 1_000).unwrap();

    let mut iona = IonaV1::new("SIM")
        .with_instrument(Instrument::equity("ABC", "SIM"))
        .with_instrument(Instrument::equity("BCD", "SIM"));
    iona.open();

    iona.submit_order(Order::market_buy("ABC", 100.0).submitted(), 100);
    iona.submit_order(Order::market_buy("ABC", 100.0).submitted(), 100);

    for event in &events {
        iona.process_market_event(event, event.ts_init());
    }
}

fn benchmarks(c: &mut Criterion) {
    c.bench_function("iona core loop", |b| b.iter(iona_core_loop_test));
}

criterion_group!(benches, benchmarks);
criterion_main!(benches);
