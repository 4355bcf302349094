//! Bus factories and the registry that builds interfaces from
//! configuration.
//!
//! Each adapter crate exports a factory; the composition root registers
//! the factories it was compiled with and builds interfaces from TOML
//! fragments:
//!
//! ```rust,ignore
//! let mut registry = BusRegistry::new();
//! registry.register(Box::new(PrologixFactory));
//!
//! let config = toml::toml! {
//!     device = "/dev/ttyUSB0"
//!     baud = 115200
//! };
//! let interface = registry.build("prologix", config.into()).await?;
//! ```

use crate::interface::GpibInterface;
use anyhow::Result;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::Arc;

/// Constructor for one adapter type.
pub trait BusFactory: Send + Sync {
    /// Machine identifier used in configuration files (e.g. `"prologix"`).
    fn bus_type(&self) -> &'static str;

    /// Human-readable product name.
    fn name(&self) -> &'static str;

    /// Check a configuration fragment without touching hardware.
    fn validate(&self, config: &toml::Value) -> Result<()>;

    /// Open the transport, run the adapter's initialization sequence, and
    /// return the ready interface.
    fn build(&self, config: toml::Value) -> BoxFuture<'static, Result<Arc<GpibInterface>>>;
}

/// Registry of bus factories keyed by `bus_type`.
#[derive(Default)]
pub struct BusRegistry {
    factories: HashMap<&'static str, Box<dyn BusFactory>>,
}

impl BusRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, factory: Box<dyn BusFactory>) {
        self.factories.insert(factory.bus_type(), factory);
    }

    pub fn factory(&self, bus_type: &str) -> Option<&dyn BusFactory> {
        self.factories.get(bus_type).map(|f| f.as_ref())
    }

    pub fn bus_types(&self) -> Vec<&'static str> {
        let mut types: Vec<_> = self.factories.keys().copied().collect();
        types.sort_unstable();
        types
    }

    pub async fn build(&self, bus_type: &str, config: toml::Value) -> Result<Arc<GpibInterface>> {
        let factory = self
            .factory(bus_type)
            .ok_or_else(|| anyhow::anyhow!("unknown bus type '{bus_type}'"))?;
        factory.validate(&config)?;
        factory.build(config).await
    }
}
