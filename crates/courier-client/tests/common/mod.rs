#![allow(dead_code)]

use courier_client::{ClientConfig, RetrySettings};
use courier_emulator::{Emulator, EmulatorConfig};
use std::time::Duration;

pub const TOPIC: &str = "orders";
pub const SUBSCRIPTION: &str = "orders-sub";

pub fn emulator() -> Emulator {
    emulator_with(EmulatorConfig::default())
}

pub fn emulator_with(config: EmulatorConfig) -> Emulator {
    let emulator = Emulator::new(config);
    emulator.create_topic(TOPIC);
    emulator
        .create_subscription(SUBSCRIPTION, TOPIC)
        .expect("subscription");
    emulator
}

/// Defaults with millisecond backoff so retry paths finish quickly.
pub fn fast_config() -> ClientConfig {
    ClientConfig {
        retry: RetrySettings {
            max_attempts: 4,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(20),
            multiplier: 2.0,
        },
        ..ClientConfig::default()
    }
}

/// Poll `check` until it holds, failing the test after two seconds.
pub async fn eventually(what: &str, check: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !check() {
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
