//! End-to-end balancer scenarios against the public API

use std::collections::HashMap;
use std::time::Duration;
use swarmgate::balancer::{CircuitState, LoadBalancer, RouteContext, Strategy};
use swarmgate::config::BalancerConfig;
use swarmgate::Error;

fn config(strategy: &str, breaker_timeout_secs: u64) -> BalancerConfig {
    BalancerConfig {
        strategy: strategy.to_string(),
        circuit_breaker_threshold: 3,
        circuit_breaker_timeout_secs: breaker_timeout_secs,
        session_affinity: true,
        ..BalancerConfig::default()
    }
}

fn ctx(ip: &str) -> RouteContext {
    RouteContext {
        client_ip: ip.to_string(),
        session_key: None,
        method: "GET".to_string(),
    }
}

/// Three healthy workers, round-robin, seven requests: 3/2/2.
#[tokio::test]
async fn round_robin_distribution_over_seven_requests() {
    let balancer = LoadBalancer::new(&config("round-robin", 60)).unwrap();
    for worker in ["w1", "w2", "w3"] {
        balancer.register_worker(worker, 1.0).await;
    }

    let mut counts: HashMap<String, u64> = HashMap::new();
    for _ in 0..7 {
        let picked = balancer.pick(&ctx("198.51.100.1")).await.unwrap();
        *counts.entry(picked.clone()).or_default() += 1;
        balancer.record_success(&picked, 4.0).await;
    }

    assert_eq!(counts["w1"], 3);
    assert_eq!(counts["w2"], 2);
    assert_eq!(counts["w3"], 2);

    // Every N requests the spread stays within one
    let max = counts.values().max().unwrap();
    let min = counts.values().min().unwrap();
    assert!(max - min <= 1);
}

/// Breaker timeline: threshold errors open the circuit, the timeout admits
/// a half-open trial, and a successful trial closes it with zero failures.
#[tokio::test]
async fn circuit_breaker_full_cycle() {
    let balancer = LoadBalancer::new(&config("round-robin", 1)).unwrap();
    balancer.register_worker("w1", 1.0).await;

    for _ in 0..3 {
        let picked = balancer.pick(&ctx("1.1.1.1")).await.unwrap();
        balancer.record_error(&picked).await;
    }
    assert_eq!(
        balancer.circuit_state("w1").await,
        Some(CircuitState::Open)
    );
    assert!(matches!(
        balancer.pick(&ctx("1.1.1.1")).await,
        Err(Error::Resource(_))
    ));

    tokio::time::sleep(Duration::from_millis(1_100)).await;

    // The next request transitions open -> half-open and is admitted
    let picked = balancer.pick(&ctx("1.1.1.1")).await.unwrap();
    assert_eq!(picked, "w1");
    assert_eq!(
        balancer.circuit_state("w1").await,
        Some(CircuitState::HalfOpen)
    );

    balancer.record_success("w1", 2.0).await;
    assert_eq!(
        balancer.circuit_state("w1").await,
        Some(CircuitState::Closed)
    );

    // A single new error must not re-open a freshly closed breaker
    let picked = balancer.pick(&ctx("1.1.1.1")).await.unwrap();
    balancer.record_error(&picked).await;
    assert_eq!(
        balancer.circuit_state("w1").await,
        Some(CircuitState::Closed)
    );
}

/// With every circuit open, exactly one worker is admitted half-open; no
/// fan-out to the rest.
#[tokio::test]
async fn all_open_admits_exactly_one_half_open() {
    let balancer = LoadBalancer::new(&config("round-robin", 1)).unwrap();
    for worker in ["w1", "w2"] {
        balancer.register_worker(worker, 1.0).await;
    }

    for worker in ["w1", "w2"] {
        for _ in 0..3 {
            balancer.record_error(worker).await;
        }
        assert!(balancer.is_circuit_open(worker).await);
    }

    tokio::time::sleep(Duration::from_millis(1_100)).await;

    // Both breakers are due, but one request selects exactly one trial
    let first = balancer.pick(&ctx("1.1.1.1")).await.unwrap();
    assert_eq!(
        balancer.circuit_state(&first).await,
        Some(CircuitState::HalfOpen)
    );

    // The second pick may only use the other worker's trial slot
    let second = balancer.pick(&ctx("1.1.1.1")).await.unwrap();
    assert_ne!(first, second);

    // Both trial slots taken: nothing is available until an outcome lands
    assert!(balancer.pick(&ctx("1.1.1.1")).await.is_err());
}

#[tokio::test]
async fn reset_circuit_breaker_restores_traffic() {
    let balancer = LoadBalancer::new(&config("round-robin", 600)).unwrap();
    balancer.register_worker("w1", 1.0).await;

    for _ in 0..3 {
        balancer.record_error("w1").await;
    }
    assert!(balancer.is_circuit_open("w1").await);

    assert!(balancer.reset_circuit_breaker("w1").await);
    assert!(!balancer.is_circuit_open("w1").await);
    assert_eq!(balancer.pick(&ctx("1.1.1.1")).await.unwrap(), "w1");
}

#[tokio::test]
async fn strategy_switch_applies_after_update() {
    let balancer = LoadBalancer::new(&config("round-robin", 60)).unwrap();
    for worker in ["w1", "w2", "w3"] {
        balancer.register_worker(worker, 1.0).await;
    }

    assert!(balancer.update_strategy(Strategy::IpHash).await.unwrap());

    // ip-hash now keeps one client on one worker
    let first = balancer.pick(&ctx("203.0.113.77")).await.unwrap();
    balancer.record_success(&first, 1.0).await;
    for _ in 0..5 {
        let next = balancer.pick(&ctx("203.0.113.77")).await.unwrap();
        assert_eq!(next, first);
        balancer.record_success(&next, 1.0).await;
    }
}

#[tokio::test]
async fn distribution_stats_report_efficiency() {
    let balancer = LoadBalancer::new(&config("round-robin", 60)).unwrap();
    for worker in ["w1", "w2", "w3", "w4"] {
        balancer.register_worker(worker, 1.0).await;
    }

    for _ in 0..40 {
        let picked = balancer.pick(&ctx("1.2.3.4")).await.unwrap();
        balancer.record_success(&picked, 3.0).await;
    }

    let stats = balancer.stats().await;
    assert_eq!(stats.total_picked, 40);
    assert!(stats.efficiency_score > 95.0);
    assert_eq!(stats.workers.len(), 4);
    for worker in &stats.workers {
        assert_eq!(worker.picked, 10);
        assert!(worker.avg_latency_ms > 0.0);
    }
}
