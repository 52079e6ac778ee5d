//! Source Registry
//!
//! Owned by one configuration instance; fixed once the configuration is built.

use crate::error::{ConfigError, Result, WriteTarget};
use crate::source::{ConfigSource, SourceId, SourceMetadata};
use std::collections::HashSet;
use std::sync::Arc;

/// A source together with how it was registered
#[derive(Clone)]
pub struct RegisteredSource {
    pub metadata: SourceMetadata,
    pub source: Arc<dyn ConfigSource>,
}

impl RegisteredSource {
    pub fn id(&self) -> &SourceId {
        &self.metadata.id
    }
}

/// Registration request collected by the builder
#[derive(Clone)]
pub struct SourceRegistration {
    pub(crate) level: i32,
    pub(crate) name: Option<String>,
    pub(crate) primary_writer: bool,
    pub(crate) source: Arc<dyn ConfigSource>,
}

impl SourceRegistration {
    pub fn new<S: ConfigSource>(level: i32, source: S) -> Self {
        Self::from_arc(level, Arc::new(source))
    }

    pub fn from_arc(level: i32, source: Arc<dyn ConfigSource>) -> Self {
        Self {
            level,
            name: None,
            primary_writer: false,
            source,
        }
    }

    /// Register under `name` instead of the source's own name
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Make this source the default write target
    pub fn primary_writer(mut self) -> Self {
        self.primary_writer = true;
        self
    }
}

/// Sources in registration order
pub struct SourceRegistry {
    sources: Vec<RegisteredSource>,
    /// Indices into `sources`, ascending by `(level, order)`
    merge_order: Vec<usize>,
}

impl SourceRegistry {
    pub fn new(registrations: Vec<SourceRegistration>) -> Result<Self> {
        let mut seen = HashSet::new();
        let mut sources = Vec::with_capacity(registrations.len());
        let mut primary: Option<SourceId> = None;

        for (order, registration) in registrations.into_iter().enumerate() {
            let name = registration
                .name
                .unwrap_or_else(|| registration.source.name());
            let id = SourceId::new(registration.level, name);
            if !seen.insert(id.clone()) {
                return Err(ConfigError::DuplicateSource(id));
            }

            let writeable = registration.source.is_writeable();
            if registration.primary_writer {
                if !writeable {
                    return Err(ConfigError::InvalidRegistration(format!(
                        "primary writer {} is not writable",
                        id
                    )));
                }
                if let Some(existing) = &primary {
                    return Err(ConfigError::InvalidRegistration(format!(
                        "both {} and {} are marked as primary writer",
                        existing, id
                    )));
                }
                primary = Some(id.clone());
            }

            sources.push(RegisteredSource {
                metadata: SourceMetadata {
                    kind: registration.source.kind().to_string(),
                    id,
                    writeable,
                    primary_writer: registration.primary_writer,
                    order,
                },
                source: registration.source,
            });
        }

        let mut merge_order: Vec<usize> = (0..sources.len()).collect();
        merge_order.sort_by_key(|&i| (sources[i].metadata.id.level, sources[i].metadata.order));

        Ok(Self {
            sources,
            merge_order,
        })
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Sources in registration order
    pub fn iter(&self) -> impl Iterator<Item = &RegisteredSource> {
        self.sources.iter()
    }

    /// Source at position `order` in registration order
    pub fn at(&self, order: usize) -> &RegisteredSource {
        &self.sources[order]
    }

    /// Sources ascending by precedence
    pub fn in_merge_order(&self) -> impl Iterator<Item = &RegisteredSource> {
        self.merge_order.iter().map(move |&i| &self.sources[i])
    }

    pub fn get(&self, level: i32, name: &str) -> Option<&RegisteredSource> {
        self.sources
            .iter()
            .find(|s| s.metadata.id.level == level && s.metadata.id.name == name)
    }

    pub fn primary_writer(&self) -> Option<&RegisteredSource> {
        self.sources.iter().find(|s| s.metadata.primary_writer)
    }

    /// Pick the source a write goes to.
    ///
    /// An explicit target must name a writable source; a level-only target
    /// picks the last-registered writable source at that level. Without a
    /// target the primary writer is used.
    pub fn resolve_write_target(&self, target: Option<&WriteTarget>) -> Result<&RegisteredSource> {
        let Some(target) = target else {
            return self.primary_writer().ok_or(ConfigError::NoWritableTarget);
        };

        if let Some(name) = &target.name {
            let source = self
                .get(target.level, name)
                .ok_or_else(|| ConfigError::not_writable(target.clone(), "no such source"))?;
            if !source.metadata.writeable {
                return Err(ConfigError::not_writable(target.clone(), "source is read-only"));
            }
            return Ok(source);
        }

        let mut at_level = self
            .sources
            .iter()
            .filter(|s| s.metadata.id.level == target.level)
            .peekable();
        if at_level.peek().is_none() {
            return Err(ConfigError::not_writable(target.clone(), "no source at this level"));
        }
        at_level
            .filter(|s| s.metadata.writeable)
            .last()
            .ok_or_else(|| ConfigError::not_writable(target.clone(), "no writable source at this level"))
    }
}
