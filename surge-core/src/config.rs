//! Centralized configuration for Surge.
//!
//! Tick timing, stream sizing, bottleneck scoring and the per-type node
//! defaults applied by the graph builder all live here instead of being
//! scattered through the engine.

use std::time::Duration;

/// Central configuration for all Surge components.
///
/// Groups engine timing and node defaults. Supports environment variable
/// overrides for runtime customization.
#[derive(Debug, Clone, Default)]
pub struct SurgeConfig {
    pub engine: EngineConfig,
    pub defaults: NodeDefaults,
}

/// Tick driver and output stream configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Period between ticks of the background driver
    pub tick_interval: Duration,
    /// Capacity of the bounded per-session metrics stream
    pub output_buffer: usize,
    /// Score above which a node is flagged as a bottleneck
    pub bottleneck_threshold: f64,
    /// Weight of the queue growth term in the bottleneck score
    pub queue_growth_weight: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(500),
            output_buffer: 100,
            bottleneck_threshold: 0.7,
            queue_growth_weight: 0.3,
        }
    }
}

/// Defaults applied to unset or zero topology fields.
///
/// Capacities are requests per second, latencies are milliseconds.
#[derive(Debug, Clone)]
pub struct NodeDefaults {
    pub load_balancer_capacity: f64,
    pub app_server_capacity: f64,
    pub app_server_latency_ms: f64,
    pub database_capacity: f64,
    pub database_latency_ms: f64,
    /// Aggregate injection rate when the topology leaves it unset
    pub traffic_rps: f64,
    /// Share of undifferentiated flow treated as reads
    pub read_ratio: f64,
    /// Fraction of downstream pool capacity admitted by a shielded load balancer
    pub backpressure_threshold: f64,
    pub router_overhead_ms: f64,
    pub load_balancer_overhead_ms: f64,
}

impl Default for NodeDefaults {
    fn default() -> Self {
        Self {
            load_balancer_capacity: 500.0,
            app_server_capacity: 100.0,
            app_server_latency_ms: 20.0,
            database_capacity: 50.0,
            database_latency_ms: 50.0,
            traffic_rps: 100.0,
            read_ratio: 0.7,
            backpressure_threshold: 0.9,
            router_overhead_ms: 1.0,
            load_balancer_overhead_ms: 0.5,
        }
    }
}

impl SurgeConfig {
    /// Creates configuration with environment variable overrides.
    ///
    /// Unparsable values are ignored and the default is kept.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(interval) = std::env::var("SURGE_TICK_INTERVAL_MS")
            && let Ok(millis) = interval.parse::<u64>()
            && millis > 0
        {
            config.engine.tick_interval = Duration::from_millis(millis);
        }

        if let Ok(buffer) = std::env::var("SURGE_OUTPUT_BUFFER")
            && let Ok(size) = buffer.parse::<usize>()
            && size > 0
        {
            config.engine.output_buffer = size;
        }

        if let Ok(threshold) = std::env::var("SURGE_BOTTLENECK_THRESHOLD")
            && let Ok(value) = threshold.parse::<f64>()
            && value.is_finite()
        {
            config.engine.bottleneck_threshold = value;
        }

        config
    }

    /// Creates a configuration optimized for testing.
    ///
    /// Short tick interval so driver tests finish quickly.
    pub fn for_testing() -> Self {
        Self {
            engine: EngineConfig {
                tick_interval: Duration::from_millis(10),
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let config = SurgeConfig::default();

        assert_eq!(config.engine.tick_interval, Duration::from_millis(500));
        assert_eq!(config.engine.output_buffer, 100);
        assert_eq!(config.engine.bottleneck_threshold, 0.7);
        assert_eq!(config.defaults.load_balancer_capacity, 500.0);
        assert_eq!(config.defaults.app_server_capacity, 100.0);
        assert_eq!(config.defaults.database_latency_ms, 50.0);
        assert_eq!(config.defaults.read_ratio, 0.7);
    }

    #[test]
    fn test_testing_preset() {
        let config = SurgeConfig::for_testing();
        assert_eq!(config.engine.tick_interval, Duration::from_millis(10));
        assert_eq!(config.engine.output_buffer, 100);
    }

    #[test]
    fn test_env_override() {
        unsafe {
            std::env::set_var("SURGE_TICK_INTERVAL_MS", "250");
            std::env::set_var("SURGE_OUTPUT_BUFFER", "8");
            std::env::set_var("SURGE_BOTTLENECK_THRESHOLD", "not-a-number");
        }

        let config = SurgeConfig::from_env();

        assert_eq!(config.engine.tick_interval, Duration::from_millis(250));
        assert_eq!(config.engine.output_buffer, 8);
        assert_eq!(config.engine.bottleneck_threshold, 0.7);

        // Zero sizes fall back to the defaults.
        unsafe {
            std::env::set_var("SURGE_TICK_INTERVAL_MS", "0");
            std::env::set_var("SURGE_OUTPUT_BUFFER", "0");
            std::env::set_var("SURGE_BOTTLENECK_THRESHOLD", "0.9");
        }

        let config = SurgeConfig::from_env();
        let defaults = SurgeConfig::default();

        assert_eq!(config.engine.tick_interval, defaults.engine.tick_interval);
        assert_eq!(config.engine.output_buffer, defaults.engine.output_buffer);
        assert_eq!(config.engine.bottleneck_threshold, 0.9);

        unsafe {
            std::env::remove_var("SURGE_TICK_INTERVAL_MS");
            std::env::remove_var("SURGE_OUTPUT_BUFFER");
            std::env::remove_var("SURGE_BOTTLENECK_THRESHOLD");
        }
    }
}
