//! Basic circuit breaker usage example
//!
//! Run with `RUST_LOG=tripwire=debug cargo run --example basic` to see the
//! breaker's own logging.

use std::sync::Arc;
use std::time::Duration;
use tripwire::{CallOptions, CircuitBreaker, Config, ManualClock, SlidingWindowType};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tripwire=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    println!("=== Circuit Breaker Basic Example ===\n");

    let clock = Arc::new(ManualClock::new());
    let config = Config::builder()
        .sliding_window(SlidingWindowType::CountBased, 5)
        .minimum_number_of_calls(3)
        .failure_rate_threshold(50.0)
        .wait_duration_in_open_state(Duration::from_secs(5))
        .permitted_number_of_calls_in_half_open_state(2)
        .build()
        .expect("valid configuration");

    let breaker = CircuitBreaker::builder("payment_api")
        .config(config)
        .clock(clock.clone())
        .on_open(|name| println!("Circuit '{}' opened!", name))
        .on_close(|name| println!("Circuit '{}' closed!", name))
        .on_half_open(|name| println!("Circuit '{}' half-open, testing...", name))
        .build()
        .expect("valid breaker");

    println!("Initial state: {}\n", breaker.state());

    println!("--- Successful call ---");
    match breaker.call(|| Ok::<_, String>("Payment 1".to_string())) {
        Ok(result) => println!("ok: {}", result),
        Err(e) => println!("error: {}", e),
    }

    println!("\n--- Triggering failures ---");
    for i in 1..=2 {
        match breaker.call(move || Err::<String, _>(format!("Payment failed {}", i))) {
            Ok(_) => println!("ok"),
            Err(e) => println!("error: {}", e),
        }
    }
    let metrics = breaker.metrics();
    println!(
        "State: {} (failure rate {:.1}% over {} calls)\n",
        breaker.state(),
        metrics.failure_rate,
        metrics.number_of_calls
    );

    println!("--- Attempting call while open ---");
    let fallback = CallOptions::new().with_fallback(|ctx| {
        Ok(format!("cached response ({} is {})", ctx.circuit_name, ctx.state))
    });
    match breaker.call((|| Ok::<_, String>("Should be rejected".to_string()), fallback)) {
        Ok(result) => println!("fallback: {}", result),
        Err(e) => println!("error: {}", e),
    }

    println!("\n--- Waiting out the open state ---");
    clock.advance(Duration::from_secs(5));
    for i in 1..=2 {
        match breaker.call(move || Ok::<_, String>(format!("Trial payment {}", i))) {
            Ok(result) => println!("ok: {}", result),
            Err(e) => println!("error: {}", e),
        }
    }
    println!("State: {}\n", breaker.state());

    println!("--- Resetting circuit ---");
    breaker.reset();
    println!("State after reset: {}", breaker.state());
}
