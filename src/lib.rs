//! Layerconf Library
//!
//! Layered multi-source configuration.
//!
//! Sources are registered at integer levels and merged into one read-only view
//! in which higher levels override lower ones. Watched sources are reloaded
//! after a debounce window, writes are routed to a single writable source, and
//! value transformers (encryption, for instance) sit between the stored form and
//! what callers read.

pub mod builder;
pub mod configuration;
pub mod engine;
pub mod error;
pub mod interpolate;
pub mod section;
pub mod settings;
pub mod shutdown;
pub mod source;
pub mod transform;

pub use builder::ConfigurationBuilder;
pub use configuration::{Configuration, ListenerGuard};
pub use engine::{
    ChangeType, ConfigChange, ConfigChangeEvent, ConfigEvent, MergedView, ReloadErrorEvent, ReloadOutcome,
    ReloadTrigger, SourceRegistration,
};
pub use error::{ConfigError, Result, WriteTarget};
pub use section::ConfigSection;
pub use settings::{EngineSettings, SettingsManager};
pub use shutdown::ShutdownCoordinator;
pub use source::{ChangeBatch, ChangeNotifier, ConfigSource, EnvSource, FileSource, MemorySource, SourceId, WatchHandle};
pub use transform::{EncryptionTransformer, Masker, TransformerChain, ValueCipher, ValueTransformer};
