//! Named circuit breakers and shared configurations
//!
//! A [`CircuitBreakerRegistry`] is an explicit object owned by the caller.
//! Breakers are created on first lookup and shared afterwards, so every
//! caller asking for `"payments"` talks to the same breaker.

use crate::circuit::CircuitBreaker;
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::errors::ConfigError;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::debug;

/// Name of the configuration every registry starts with
pub const DEFAULT_CONFIG: &str = "default";

/// Change to the set of breakers held by a registry
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    Added(CircuitBreaker),
    Removed(CircuitBreaker),
    Replaced {
        old: CircuitBreaker,
        new: CircuitBreaker,
    },
}

type RegistryConsumer = Arc<dyn Fn(&RegistryEvent) + Send + Sync>;

pub struct CircuitBreakerRegistry {
    configs: DashMap<String, Arc<Config>>,
    breakers: DashMap<String, CircuitBreaker>,
    clock: Arc<dyn Clock>,
    consumers: RwLock<Vec<RegistryConsumer>>,
}

impl CircuitBreakerRegistry {
    /// Registry whose `"default"` configuration is `default_config`
    pub fn new(default_config: Config) -> Result<Self, ConfigError> {
        Self::with_clock(default_config, Arc::new(SystemClock::new()))
    }

    /// Registry whose breakers all read time from `clock`
    pub fn with_clock(default_config: Config, clock: Arc<dyn Clock>) -> Result<Self, ConfigError> {
        default_config.validate()?;
        let configs = DashMap::new();
        configs.insert(DEFAULT_CONFIG.to_string(), Arc::new(default_config));
        Ok(Self {
            configs,
            breakers: DashMap::new(),
            clock,
            consumers: RwLock::new(Vec::new()),
        })
    }

    /// Register (or overwrite) a shared named configuration
    pub fn add_configuration(
        &self,
        name: impl Into<String>,
        config: Config,
    ) -> Result<(), ConfigError> {
        config.validate()?;
        self.configs.insert(name.into(), Arc::new(config));
        Ok(())
    }

    pub fn configuration(&self, name: &str) -> Option<Arc<Config>> {
        self.configs.get(name).map(|entry| Arc::clone(entry.value()))
    }

    pub fn default_config(&self) -> Arc<Config> {
        self.configuration(DEFAULT_CONFIG)
            .unwrap_or_else(|| Arc::new(Config::default()))
    }

    /// Existing breaker, or a new one on the default configuration
    pub fn circuit_breaker(&self, name: &str) -> CircuitBreaker {
        self.find(name).unwrap_or_else(|| {
            self.insert_if_absent(name, self.default_config())
        })
    }

    /// Existing breaker, or a new one on the named shared configuration
    pub fn circuit_breaker_with_config(
        &self,
        name: &str,
        config_name: &str,
    ) -> Result<CircuitBreaker, ConfigError> {
        if let Some(existing) = self.find(name) {
            return Ok(existing);
        }
        let config = self
            .configuration(config_name)
            .ok_or_else(|| ConfigError::UnknownBaseConfig(config_name.to_string()))?;
        Ok(self.insert_if_absent(name, config))
    }

    /// Existing breaker, or a new one on `config`
    ///
    /// An existing breaker keeps its own configuration.
    pub fn circuit_breaker_with(
        &self,
        name: &str,
        config: Config,
    ) -> Result<CircuitBreaker, ConfigError> {
        if let Some(existing) = self.find(name) {
            return Ok(existing);
        }
        config.validate()?;
        Ok(self.insert_if_absent(name, Arc::new(config)))
    }

    pub fn find(&self, name: &str) -> Option<CircuitBreaker> {
        self.breakers.get(name).map(|entry| entry.value().clone())
    }

    /// Swap the breaker registered under `name`, returning the old one.
    /// Nothing happens when no breaker is registered under that name.
    pub fn replace(&self, name: &str, breaker: CircuitBreaker) -> Option<CircuitBreaker> {
        let old = {
            let mut entry = self.breakers.get_mut(name)?;
            std::mem::replace(entry.value_mut(), breaker.clone())
        };

        debug!(circuit = %name, "Replaced circuit breaker in registry");
        self.publish(&RegistryEvent::Replaced {
            old: old.clone(),
            new: breaker,
        });
        Some(old)
    }

    pub fn remove(&self, name: &str) -> Option<CircuitBreaker> {
        let (_, removed) = self.breakers.remove(name)?;

        debug!(circuit = %name, "Removed circuit breaker from registry");
        self.publish(&RegistryEvent::Removed(removed.clone()));
        Some(removed)
    }

    /// Every registered breaker, in no particular order
    pub fn all(&self) -> Vec<CircuitBreaker> {
        self.breakers
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }

    /// Subscribe to breakers being added, removed or replaced
    pub fn on_entry_event<F>(&self, f: F)
    where
        F: Fn(&RegistryEvent) + Send + Sync + 'static,
    {
        self.consumers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(f));
    }

    /// `config` must already be validated
    fn insert_if_absent(&self, name: &str, config: Arc<Config>) -> CircuitBreaker {
        let created = match self.breakers.entry(name.to_string()) {
            Entry::Occupied(entry) => return entry.get().clone(),
            Entry::Vacant(entry) => {
                let breaker = CircuitBreaker::from_validated(
                    name.to_string(),
                    config,
                    Arc::clone(&self.clock),
                    None,
                );
                entry.insert(breaker.clone());
                breaker
            }
        };

        // Shard lock is released before consumers run
        debug!(circuit = %name, "Added circuit breaker to registry");
        self.publish(&RegistryEvent::Added(created.clone()));
        created
    }

    fn publish(&self, event: &RegistryEvent) {
        let consumers: Vec<_> = self
            .consumers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(Arc::clone)
            .collect();

        for consumer in consumers {
            consumer(event);
        }
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        let configs = DashMap::new();
        configs.insert(DEFAULT_CONFIG.to_string(), Arc::new(Config::default()));
        Self {
            configs,
            breakers: DashMap::new(),
            clock: Arc::new(SystemClock::new()),
            consumers: RwLock::new(Vec::new()),
        }
    }
}

impl std::fmt::Debug for CircuitBreakerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut breakers: Vec<_> = self.breakers.iter().map(|e| e.key().clone()).collect();
        breakers.sort();
        let mut configs: Vec<_> = self.configs.iter().map(|e| e.key().clone()).collect();
        configs.sort();
        f.debug_struct("CircuitBreakerRegistry")
            .field("configs", &configs)
            .field("breakers", &breakers)
            .finish()
    }
}
