//! Load balancing strategies for picking the backend that serves the next request
//!
//! The strategy is fixed when the controller is built. Two are implemented:
//! - **Round robin** walks the registered node list in registration order.
//! - **Power of two choices** samples two nodes from those that have reported stats and keeps
//!   the less loaded one.
//!
//! The other names accepted on the command line are recognised but refused at startup.
use clap::ValueEnum;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::cmp::Reverse;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

use crate::errors::ConfigError;
use crate::models::NodeStats;
use crate::registry::NodeRegistry;

/// Every load balancing method name the router recognises.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadBalanceMethod {
    RoundRobin,
    ShortestQueue,
    ResourcesAware,
    PowerOf2Choice,
    PreRadix,
    MultiTurn,
    Bucket,
}

impl LoadBalanceMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadBalanceMethod::RoundRobin => "round_robin",
            LoadBalanceMethod::ShortestQueue => "shortest_queue",
            LoadBalanceMethod::ResourcesAware => "resources_aware",
            LoadBalanceMethod::PowerOf2Choice => "power_of_2_choice",
            LoadBalanceMethod::PreRadix => "pre_radix",
            LoadBalanceMethod::MultiTurn => "multi_turn",
            LoadBalanceMethod::Bucket => "bucket",
        }
    }
}

impl fmt::Display for LoadBalanceMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LoadBalanceMethod {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "round_robin" => Ok(LoadBalanceMethod::RoundRobin),
            "shortest_queue" => Ok(LoadBalanceMethod::ShortestQueue),
            "resources_aware" => Ok(LoadBalanceMethod::ResourcesAware),
            "power_of_2_choice" => Ok(LoadBalanceMethod::PowerOf2Choice),
            "pre_radix" => Ok(LoadBalanceMethod::PreRadix),
            "multi_turn" => Ok(LoadBalanceMethod::MultiTurn),
            "bucket" => Ok(LoadBalanceMethod::Bucket),
            other => Err(ConfigError::UnknownLoadBalanceMethod(other.to_owned())),
        }
    }
}

/// The second key in the power-of-two comparison, after the waiting queue length.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum TieBreak {
    /// Compare waiting counts again, so ties fall straight through to free memory.
    #[default]
    Waiting,
    /// Prefer the node with fewer running requests.
    Running,
}

impl TieBreak {
    fn value(self, stats: &NodeStats) -> u64 {
        match self {
            TieBreak::Waiting => stats.num_waiting,
            TieBreak::Running => stats.num_running,
        }
    }
}

/// Knobs for [`PowerOfTwoChoices`].
#[derive(Debug, Clone, Copy, Default)]
pub struct PowerOfTwoOptions {
    pub tie_break: TieBreak,
    /// Re-draw the second candidate so it always differs from the first.
    pub distinct: bool,
    /// Seed for reproducible sampling. Seeded from the OS when absent.
    pub seed: Option<u64>,
}

/// Walks the node list with a single cursor shared by every dispatch.
#[derive(Debug, Default)]
pub struct RoundRobin {
    cursor: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the address of the node under the cursor and advances it.
    pub fn select(&self, registry: &NodeRegistry) -> Option<String> {
        registry.with_nodes(|nodes| {
            if nodes.is_empty() {
                return None;
            }
            let len = nodes.len();
            let (Ok(index) | Err(index)) =
                self.cursor
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cursor| {
                        Some((cursor + 1) % len)
                    });
            nodes.get(index % len).map(|node| node.address())
        })
    }
}

/// Samples two nodes from the stats map and keeps the less loaded one.
///
/// Candidates are ranked by `(num_waiting, tie_break, available_memory)`: fewer waiting wins,
/// then the lower tie-break value, then more free memory. Equal ranks keep the first draw.
/// Nodes that have not reported stats yet are never chosen.
#[derive(Debug)]
pub struct PowerOfTwoChoices {
    options: PowerOfTwoOptions,
    rng: Mutex<StdRng>,
}

impl PowerOfTwoChoices {
    pub fn new(options: PowerOfTwoOptions) -> Self {
        let rng = match options.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self {
            options,
            rng: Mutex::new(rng),
        }
    }

    /// Returns the `ip:port` key of the chosen node.
    pub fn select(&self, registry: &NodeRegistry) -> Option<String> {
        registry.with_stats(|stats| {
            if stats.len() <= 1 {
                return stats.keys().next().cloned();
            }

            // Sorted so that a seeded rng gives the same picks on every run.
            let mut keys: Vec<&String> = stats.keys().collect();
            keys.sort_unstable();

            let (first, second) = self.draw(keys.len());
            let (first, second) = (keys[first], keys[second]);
            let chosen = if self.prefers_second(&stats[first], &stats[second]) {
                second
            } else {
                first
            };
            debug!(first = %first, second = %second, chosen = %chosen, "Power of two choice");
            Some(chosen.clone())
        })
    }

    fn draw(&self, len: usize) -> (usize, usize) {
        let mut rng = self.rng.lock();
        let first = rng.random_range(0..len);
        let second = if self.options.distinct {
            let other = rng.random_range(0..len - 1);
            if other >= first { other + 1 } else { other }
        } else {
            rng.random_range(0..len)
        };
        (first, second)
    }

    /// Whether `second` strictly outranks `first`.
    pub fn prefers_second(&self, first: &NodeStats, second: &NodeStats) -> bool {
        let rank = |stats: &NodeStats| {
            (
                stats.num_waiting,
                self.options.tie_break.value(stats),
                Reverse(stats.available_memory),
            )
        };
        rank(second) < rank(first)
    }
}

/// The strategy in use for the lifetime of the process.
#[derive(Debug)]
pub enum Scheduler {
    RoundRobin(RoundRobin),
    PowerOfTwoChoices(PowerOfTwoChoices),
}

impl Scheduler {
    /// Builds the scheduler for `method`, refusing methods that have no implementation.
    pub fn from_method(
        method: LoadBalanceMethod,
        options: PowerOfTwoOptions,
    ) -> Result<Self, ConfigError> {
        match method {
            LoadBalanceMethod::RoundRobin => Ok(Scheduler::RoundRobin(RoundRobin::new())),
            LoadBalanceMethod::PowerOf2Choice => {
                Ok(Scheduler::PowerOfTwoChoices(PowerOfTwoChoices::new(options)))
            }
            unsupported => Err(ConfigError::UnsupportedLoadBalanceMethod(unsupported)),
        }
    }

    pub fn method(&self) -> LoadBalanceMethod {
        match self {
            Scheduler::RoundRobin(_) => LoadBalanceMethod::RoundRobin,
            Scheduler::PowerOfTwoChoices(_) => LoadBalanceMethod::PowerOf2Choice,
        }
    }

    /// Whether [`Scheduler::select`] could return anything right now.
    pub fn has_candidates(&self, registry: &NodeRegistry) -> bool {
        match self {
            Scheduler::RoundRobin(_) => registry.node_count() > 0,
            Scheduler::PowerOfTwoChoices(_) => registry.stats_count() > 0,
        }
    }

    /// Picks the `host:port` address of the backend for the next request.
    pub fn select(&self, registry: &NodeRegistry) -> Option<String> {
        match self {
            Scheduler::RoundRobin(rr) => rr.select(registry),
            Scheduler::PowerOfTwoChoices(p2c) => p2c.select(registry),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NodeInfo;
    use rstest::rstest;
    use std::collections::HashMap;
    use std::sync::Arc;

    fn registry_with_nodes(count: u16) -> NodeRegistry {
        let registry = NodeRegistry::new();
        for i in 0..count {
            registry.add_node(NodeInfo::builder().ip("10.0.0.1").port(8000 + i).build());
        }
        registry
    }

    fn stats(num_waiting: u64, num_running: u64, available_memory: u64) -> NodeStats {
        NodeStats {
            available_memory,
            num_running,
            num_waiting,
        }
    }

    #[rstest]
    #[case("round_robin", LoadBalanceMethod::RoundRobin)]
    #[case("shortest_queue", LoadBalanceMethod::ShortestQueue)]
    #[case("resources_aware", LoadBalanceMethod::ResourcesAware)]
    #[case("power_of_2_choice", LoadBalanceMethod::PowerOf2Choice)]
    #[case("pre_radix", LoadBalanceMethod::PreRadix)]
    #[case("multi_turn", LoadBalanceMethod::MultiTurn)]
    #[case("bucket", LoadBalanceMethod::Bucket)]
    fn test_method_names_round_trip(#[case] name: &str, #[case] method: LoadBalanceMethod) {
        assert_eq!(name.parse::<LoadBalanceMethod>().unwrap(), method);
        assert_eq!(method.to_string(), name);
    }

    #[test]
    fn test_unknown_method_name_is_rejected() {
        let err = "fastest".parse::<LoadBalanceMethod>().unwrap_err();
        assert!(matches!(err, ConfigError::UnknownLoadBalanceMethod(ref name) if name == "fastest"));
        assert_eq!(err.to_string(), "fastest is not a valid load balance method");
    }

    #[rstest]
    #[case(LoadBalanceMethod::ShortestQueue)]
    #[case(LoadBalanceMethod::ResourcesAware)]
    #[case(LoadBalanceMethod::PreRadix)]
    #[case(LoadBalanceMethod::MultiTurn)]
    #[case(LoadBalanceMethod::Bucket)]
    fn test_unimplemented_methods_refuse_to_build(#[case] method: LoadBalanceMethod) {
        let err = Scheduler::from_method(method, PowerOfTwoOptions::default()).unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedLoadBalanceMethod(m) if m == method));
    }

    #[test]
    fn test_round_robin_cycles_in_registration_order() {
        let registry = registry_with_nodes(3);
        let rr = RoundRobin::new();

        let picks: Vec<String> = (0..4).filter_map(|_| rr.select(&registry)).collect();

        assert_eq!(
            picks,
            vec![
                "10.0.0.1:8000",
                "10.0.0.1:8001",
                "10.0.0.1:8002",
                "10.0.0.1:8000"
            ]
        );
    }

    #[test]
    fn test_round_robin_empty_registry_selects_nothing() {
        let registry = NodeRegistry::new();
        let scheduler = Scheduler::RoundRobin(RoundRobin::new());

        assert!(!scheduler.has_candidates(&registry));
        assert_eq!(scheduler.select(&registry), None);
    }

    #[test]
    fn test_round_robin_single_node_always_selected() {
        let registry = registry_with_nodes(1);
        let rr = RoundRobin::new();

        for _ in 0..5 {
            assert_eq!(rr.select(&registry).as_deref(), Some("10.0.0.1:8000"));
        }
    }

    #[test]
    fn test_round_robin_concurrent_selection_is_even() {
        let registry = Arc::new(registry_with_nodes(4));
        let rr = Arc::new(RoundRobin::new());

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let rr = Arc::clone(&rr);
                std::thread::spawn(move || {
                    (0..100)
                        .filter_map(|_| rr.select(&registry))
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut counts: HashMap<String, usize> = HashMap::new();
        for handle in handles {
            for address in handle.join().unwrap() {
                *counts.entry(address).or_default() += 1;
            }
        }

        assert_eq!(counts.len(), 4);
        assert!(counts.values().all(|&count| count == 100));
    }

    #[test]
    fn test_power_of_two_ignores_nodes_without_stats() {
        let registry = registry_with_nodes(3);
        let scheduler = Scheduler::from_method(
            LoadBalanceMethod::PowerOf2Choice,
            PowerOfTwoOptions::default(),
        )
        .unwrap();

        assert!(!scheduler.has_candidates(&registry));
        assert_eq!(scheduler.select(&registry), None);

        registry.update_stats("10.0.0.1:8001", stats(0, 0, 0));
        for _ in 0..10 {
            assert_eq!(scheduler.select(&registry).as_deref(), Some("10.0.0.1:8001"));
        }
    }

    #[test]
    fn test_power_of_two_prefers_shorter_waiting_queue() {
        let registry = NodeRegistry::new();
        registry.update_stats("10.0.0.1:8000", stats(5, 0, 100));
        registry.update_stats("10.0.0.2:8000", stats(2, 0, 100));
        let p2c = PowerOfTwoChoices::new(PowerOfTwoOptions {
            distinct: true,
            seed: Some(7),
            ..Default::default()
        });

        for _ in 0..50 {
            assert_eq!(p2c.select(&registry).as_deref(), Some("10.0.0.2:8000"));
        }
    }

    #[test]
    fn test_power_of_two_independent_draws_pick_lighter_node_when_both_drawn() {
        let registry = NodeRegistry::new();
        registry.update_stats("10.0.0.1:8000", stats(5, 0, 100));
        registry.update_stats("10.0.0.2:8000", stats(2, 0, 100));
        let p2c = PowerOfTwoChoices::new(PowerOfTwoOptions {
            seed: Some(42),
            ..Default::default()
        });

        // A draw that lands on the same key twice yields that key, so the loaded node can still
        // be chosen, but the lighter node must win whenever both are compared.
        let picks: Vec<String> = (0..200).filter_map(|_| p2c.select(&registry)).collect();
        let lighter = picks.iter().filter(|a| *a == "10.0.0.2:8000").count();
        assert!(lighter > picks.len() / 2, "lighter node picked {lighter} times");
    }

    #[rstest]
    #[case::fewer_waiting(stats(3, 0, 10), stats(1, 9, 0), true)]
    #[case::more_waiting(stats(1, 0, 10), stats(3, 0, 99), false)]
    #[case::more_memory_breaks_tie(stats(1, 5, 10), stats(1, 0, 20), true)]
    #[case::less_memory(stats(1, 0, 20), stats(1, 0, 10), false)]
    #[case::equal_keeps_first(stats(1, 1, 10), stats(1, 1, 10), false)]
    fn test_waiting_tie_break_ranking(
        #[case] first: NodeStats,
        #[case] second: NodeStats,
        #[case] expected: bool,
    ) {
        let p2c = PowerOfTwoChoices::new(PowerOfTwoOptions::default());
        assert_eq!(p2c.prefers_second(&first, &second), expected);
    }

    #[test]
    fn test_running_tie_break_ranks_running_before_memory() {
        let p2c = PowerOfTwoChoices::new(PowerOfTwoOptions {
            tie_break: TieBreak::Running,
            ..Default::default()
        });

        assert!(p2c.prefers_second(&stats(1, 5, 100), &stats(1, 2, 10)));
        assert!(!p2c.prefers_second(&stats(1, 2, 10), &stats(1, 5, 100)));
        assert!(p2c.prefers_second(&stats(1, 2, 10), &stats(1, 2, 100)));
    }

    #[test]
    fn test_seeded_power_of_two_is_reproducible() {
        let registry = NodeRegistry::new();
        for i in 0..6u64 {
            registry.update_stats(format!("10.0.0.{i}:8000"), stats(i % 3, 0, i * 10));
        }
        let options = PowerOfTwoOptions {
            seed: Some(1234),
            ..Default::default()
        };
        let a = PowerOfTwoChoices::new(options);
        let b = PowerOfTwoChoices::new(options);

        let picks_a: Vec<_> = (0..20).map(|_| a.select(&registry)).collect();
        let picks_b: Vec<_> = (0..20).map(|_| b.select(&registry)).collect();
        assert_eq!(picks_a, picks_b);
    }
}
