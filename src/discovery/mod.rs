pub mod service_discovery;

pub use service_discovery::{
    RegistryStats, ServiceChangeEvent, ServiceChangeReceiver, ServiceRegistry,
};
