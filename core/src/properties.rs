//! Declarative registry setup from TOML
//!
//! ```toml
//! [configs.default]
//! sliding_window_size = 20
//!
//! [configs.strict]
//! failure_rate_threshold = 25.0
//! wait_duration_in_open_state_ms = 5000
//!
//! [instances.payments]
//! base_config = "strict"
//! minimum_number_of_calls = 5
//! ```
//!
//! Every field is optional. An instance starts from its `base_config`
//! (or `default`) and overrides whatever it sets. Durations are milliseconds.

use crate::clock::{Clock, SystemClock};
use crate::config::{Config, SlidingWindowType, WaitInterval};
use crate::errors::ConfigError;
use crate::registry::{CircuitBreakerRegistry, DEFAULT_CONFIG};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Upper bound for exponential waits when none is configured
const UNBOUNDED_WAIT: Duration = Duration::from_millis(u64::MAX);

/// Root of a properties document
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RegistryProperties {
    /// Shared configurations, addressable by name
    pub configs: HashMap<String, InstanceProperties>,
    /// Breakers created up front
    pub instances: HashMap<String, InstanceProperties>,
}

/// Overrides for one configuration or breaker
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct InstanceProperties {
    pub base_config: Option<String>,
    pub failure_rate_threshold: Option<f32>,
    pub slow_call_rate_threshold: Option<f32>,
    pub slow_call_duration_threshold_ms: Option<u64>,
    pub sliding_window_type: Option<SlidingWindowType>,
    pub sliding_window_size: Option<u32>,
    pub minimum_number_of_calls: Option<u32>,
    pub permitted_number_of_calls_in_half_open_state: Option<u32>,
    /// Zero disables the limit
    pub max_wait_duration_in_half_open_state_ms: Option<u64>,
    pub wait_duration_in_open_state_ms: Option<u64>,
    /// Switches the open wait to exponential backoff
    pub exponential_backoff_multiplier: Option<f64>,
    pub exponential_max_wait_duration_in_open_state_ms: Option<u64>,
    /// Jitter for exponential backoff, in [0, 1]
    pub randomized_wait_factor: Option<f64>,
    pub automatic_transition_from_open_to_half_open_enabled: Option<bool>,
}

impl InstanceProperties {
    /// Overlay the fields that are set onto `config`
    pub fn apply(&self, mut config: Config) -> Config {
        if let Some(threshold) = self.failure_rate_threshold {
            config.failure_rate_threshold = threshold;
        }
        if let Some(threshold) = self.slow_call_rate_threshold {
            config.slow_call_rate_threshold = threshold;
        }
        if let Some(ms) = self.slow_call_duration_threshold_ms {
            config.slow_call_duration_threshold = Duration::from_millis(ms);
        }
        if let Some(window_type) = self.sliding_window_type {
            config.sliding_window_type = window_type;
        }
        if let Some(size) = self.sliding_window_size {
            config.sliding_window_size = size;
        }
        if let Some(calls) = self.minimum_number_of_calls {
            config.minimum_number_of_calls = calls;
        }
        if let Some(calls) = self.permitted_number_of_calls_in_half_open_state {
            config.permitted_number_of_calls_in_half_open_state = calls;
        }
        if let Some(ms) = self.max_wait_duration_in_half_open_state_ms {
            config.max_wait_duration_in_half_open_state =
                (ms > 0).then(|| Duration::from_millis(ms));
        }
        if let Some(enabled) = self.automatic_transition_from_open_to_half_open_enabled {
            config.automatic_transition_from_open_to_half_open_enabled = enabled;
        }
        config.wait_interval_in_open_state = self.wait_interval(config.wait_interval_in_open_state);
        config
    }

    fn wait_interval(&self, current: WaitInterval) -> WaitInterval {
        let initial = self.wait_duration_in_open_state_ms.map(Duration::from_millis);

        match current {
            WaitInterval::Exponential {
                initial: base_initial,
                multiplier,
                max,
                jitter,
            } => WaitInterval::Exponential {
                initial: initial.unwrap_or(base_initial),
                multiplier: self.exponential_backoff_multiplier.unwrap_or(multiplier),
                max: self
                    .exponential_max_wait_duration_in_open_state_ms
                    .map_or(max, Duration::from_millis),
                jitter: self.randomized_wait_factor.unwrap_or(jitter),
            },
            current => {
                let Some(multiplier) = self.exponential_backoff_multiplier else {
                    return match initial {
                        Some(wait) => WaitInterval::Fixed(wait),
                        None => current,
                    };
                };
                let base_initial = match current {
                    WaitInterval::Fixed(wait) => wait,
                    _ => Config::default().wait_interval_in_open_state.wait_duration(1),
                };
                WaitInterval::Exponential {
                    initial: initial.unwrap_or(base_initial),
                    multiplier,
                    max: self
                        .exponential_max_wait_duration_in_open_state_ms
                        .map_or(UNBOUNDED_WAIT, Duration::from_millis),
                    jitter: self.randomized_wait_factor.unwrap_or(0.0),
                }
            }
        }
    }
}

impl RegistryProperties {
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(source)?)
    }

    /// Fully resolved configuration for a `[configs.*]` or `[instances.*]` entry
    pub fn resolve(&self, properties: &InstanceProperties) -> Result<Config, ConfigError> {
        let config = self.resolve_at(properties, &mut Vec::new())?;
        config.validate()?;
        Ok(config)
    }

    /// Registry holding every named configuration and every declared instance
    pub fn into_registry(self) -> Result<CircuitBreakerRegistry, ConfigError> {
        self.into_registry_with_clock(Arc::new(SystemClock::new()))
    }

    pub fn into_registry_with_clock(
        self,
        clock: Arc<dyn Clock>,
    ) -> Result<CircuitBreakerRegistry, ConfigError> {
        let default = self.default_config();
        default.validate()?;
        let registry = CircuitBreakerRegistry::with_clock(default, clock)?;

        for (name, properties) in &self.configs {
            if name != DEFAULT_CONFIG {
                registry.add_configuration(name.clone(), self.resolve(properties)?)?;
            }
        }
        for (name, properties) in &self.instances {
            registry.circuit_breaker_with(name, self.resolve(properties)?)?;
        }

        Ok(registry)
    }

    fn default_config(&self) -> Config {
        match self.configs.get(DEFAULT_CONFIG) {
            Some(section) => section.apply(Config::default()),
            None => Config::default(),
        }
    }

    /// `chain` holds the sections already visited on the way down
    fn resolve_at<'a>(
        &'a self,
        properties: &'a InstanceProperties,
        chain: &mut Vec<&'a str>,
    ) -> Result<Config, ConfigError> {
        let base = match properties.base_config.as_deref() {
            None | Some(DEFAULT_CONFIG) => self.default_config(),
            Some(name) => {
                if chain.contains(&name) {
                    return Err(ConfigError::BaseConfigCycle(name.to_string()));
                }
                let section = self
                    .configs
                    .get(name)
                    .ok_or_else(|| ConfigError::UnknownBaseConfig(name.to_string()))?;
                chain.push(name);
                self.resolve_at(section, chain)?
            }
        };
        Ok(properties.apply(base))
    }
}

impl FromStr for RegistryProperties {
    type Err = ConfigError;

    fn from_str(source: &str) -> Result<Self, Self::Err> {
        Self::from_toml_str(source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::CircuitState;

    const PROPERTIES: &str = r#"
        [configs.default]
        sliding_window_size = 10
        minimum_number_of_calls = 5

        [configs.strict]
        failure_rate_threshold = 25.0
        wait_duration_in_open_state_ms = 5000

        [configs.stricter]
        base_config = "strict"
        permitted_number_of_calls_in_half_open_state = 2

        [instances.payments]
        base_config = "stricter"
        sliding_window_type = "time_based"

        [instances.search]
        wait_duration_in_open_state_ms = 1000
        exponential_backoff_multiplier = 2.0
        exponential_max_wait_duration_in_open_state_ms = 8000
        max_wait_duration_in_half_open_state_ms = 0
    "#;

    #[test]
    fn test_parse_and_build_registry() {
        let registry = RegistryProperties::from_toml_str(PROPERTIES)
            .unwrap()
            .into_registry()
            .unwrap();

        let default = registry.default_config();
        assert_eq!(default.sliding_window_size, 10);
        assert_eq!(default.minimum_number_of_calls, 5);
        assert_eq!(default.failure_rate_threshold, 50.0);

        let strict = registry.configuration("strict").unwrap();
        assert_eq!(strict.failure_rate_threshold, 25.0);
        assert_eq!(strict.sliding_window_size, 10);

        assert_eq!(registry.len(), 2);
        let payments = registry.find("payments").unwrap();
        assert_eq!(payments.state(), CircuitState::Closed);
    }

    #[test]
    fn test_base_config_chain() {
        let properties: RegistryProperties = PROPERTIES.parse().unwrap();
        let payments = properties
            .resolve(&properties.instances["payments"])
            .unwrap();

        assert_eq!(payments.sliding_window_type, SlidingWindowType::TimeBased);
        assert_eq!(payments.permitted_number_of_calls_in_half_open_state, 2);
        assert_eq!(payments.failure_rate_threshold, 25.0);
        assert_eq!(payments.minimum_number_of_calls, 5);
        assert_eq!(
            payments.wait_interval_in_open_state.wait_duration(3),
            Duration::from_secs(5)
        );
    }

    #[test]
    fn test_exponential_wait_from_properties() {
        let properties: RegistryProperties = PROPERTIES.parse().unwrap();
        let search = properties.resolve(&properties.instances["search"]).unwrap();

        assert!(search.max_wait_duration_in_half_open_state.is_none());
        match search.wait_interval_in_open_state {
            WaitInterval::Exponential {
                initial,
                multiplier,
                max,
                jitter,
            } => {
                assert_eq!(initial, Duration::from_secs(1));
                assert_eq!(multiplier, 2.0);
                assert_eq!(max, Duration::from_secs(8));
                assert_eq!(jitter, 0.0);
            }
            other => panic!("Expected exponential wait, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_base_config() {
        let properties = RegistryProperties::from_toml_str(
            r#"
            [instances.orders]
            base_config = "missing"
            "#,
        )
        .unwrap();

        assert!(matches!(
            properties.into_registry(),
            Err(ConfigError::UnknownBaseConfig(name)) if name == "missing"
        ));
    }

    #[test]
    fn test_base_config_cycle_rejected() {
        let properties = RegistryProperties::from_toml_str(
            r#"
            [configs.a]
            base_config = "b"

            [configs.b]
            base_config = "a"
            "#,
        )
        .unwrap();

        assert!(matches!(
            properties.into_registry(),
            Err(ConfigError::BaseConfigCycle(_))
        ));

        let properties = RegistryProperties::from_toml_str(
            r#"
            [instances.orders]
            base_config = "loop"

            [configs.loop]
            base_config = "loop"
            "#,
        )
        .unwrap();
        let orders = &properties.instances["orders"];
        assert!(matches!(
            properties.resolve(orders),
            Err(ConfigError::BaseConfigCycle(name)) if name == "loop"
        ));
    }

    #[test]
    fn test_shared_base_chain_is_not_a_cycle() {
        let properties = RegistryProperties::from_toml_str(
            r#"
            [configs.shared]
            failure_rate_threshold = 30.0

            [configs.strict]
            base_config = "shared"
            minimum_number_of_calls = 2

            [instances.orders]
            base_config = "strict"

            [instances.payments]
            base_config = "shared"
            "#,
        )
        .unwrap();

        let orders = properties.resolve(&properties.instances["orders"]).unwrap();
        assert_eq!(orders.failure_rate_threshold, 30.0);
        assert_eq!(orders.minimum_number_of_calls, 2);
        assert!(properties.into_registry().is_ok());
    }

    #[test]
    fn test_invalid_values_rejected() {
        let properties = RegistryProperties::from_toml_str(
            r#"
            [instances.orders]
            failure_rate_threshold = 150.0
            "#,
        )
        .unwrap();
        assert!(matches!(
            properties.into_registry(),
            Err(ConfigError::FailureRateThreshold(rate)) if rate == 150.0
        ));

        assert!(matches!(
            RegistryProperties::from_toml_str("[instances.orders]\nfailure_rate = 10.0"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_empty_document_uses_defaults() {
        let registry = RegistryProperties::from_toml_str("")
            .unwrap()
            .into_registry()
            .unwrap();

        assert!(registry.is_empty());
        assert_eq!(registry.default_config().sliding_window_size, 100);
    }
}
