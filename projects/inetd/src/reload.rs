//! Apply a freshly read configuration to the live registry.
//!
//! Entries are matched by `ServiceKey`. An entry whose spec did not change
//! keeps its socket and runtime state untouched. A changed spec with the same
//! bind address is swapped in place, so the socket survives. A changed address
//! means a new socket. Removals are applied before anything is bound, which
//! lets a service move to an address another one just gave up.

use log::{debug, info, warn};

use crate::entries::{self, ParsedConfig, Resolver, ServiceKey, ServiceSpec};
use crate::registry::{EntryId, ServiceEntry, ServiceRegistry};
use crate::sockets::{BindError, SocketBinder};

use std::collections::HashSet;
use std::path::PathBuf;

/// Where configurations come from
pub trait ConfigSource {
    fn load(&self) -> std::io::Result<ParsedConfig>;
    /// Used to prefix diagnostics, e.g. the path of the file
    fn describe(&self) -> String;
}

pub struct FileConfigSource {
    pub path: PathBuf,
    pub resolver: Box<dyn Resolver + Send>,
}

impl FileConfigSource {
    pub fn new(path: PathBuf, resolver: impl Resolver + Send + 'static) -> Self {
        Self {
            path,
            resolver: Box::new(resolver),
        }
    }
}

impl ConfigSource for FileConfigSource {
    fn load(&self) -> std::io::Result<ParsedConfig> {
        entries::parse_file(&self.path, self.resolver.as_ref())
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// A spec that could not be brought live
#[derive(Debug)]
pub struct ConfigDiffError {
    pub key: ServiceKey,
    pub source: BindError,
}

impl std::fmt::Display for ConfigDiffError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "service {} not started: {}", self.key, self.source)
    }
}

impl std::error::Error for ConfigDiffError {}

/// The difference between the registry and a new set of specs
#[derive(Debug, Default)]
pub struct ReloadPlan {
    pub unchanged: Vec<EntryId>,
    /// Same key and address, other fields changed
    pub update: Vec<(EntryId, ServiceSpec)>,
    /// Same key, new address
    pub rebind: Vec<(EntryId, ServiceSpec)>,
    pub remove: Vec<EntryId>,
    pub add: Vec<ServiceSpec>,
}

impl ReloadPlan {
    #[must_use]
    pub fn new(registry: &ServiceRegistry, specs: Vec<ServiceSpec>) -> Self {
        let mut plan = Self::default();
        let mut matched = HashSet::new();
        for spec in specs {
            match registry.find(&spec.key()) {
                Some(id) => {
                    matched.insert(id);
                    let Some(current) = registry.get(id) else {
                        continue;
                    };
                    if current.spec == spec {
                        plan.unchanged.push(id);
                    } else if current.spec.listen == spec.listen {
                        plan.update.push((id, spec));
                    } else {
                        plan.rebind.push((id, spec));
                    }
                }
                None => plan.add.push(spec),
            }
        }
        plan.remove = registry
            .iter()
            .map(|(id, _)| id)
            .filter(|id| !matched.contains(id))
            .collect();
        plan
    }
}

#[derive(Debug, Default)]
pub struct ReloadReport {
    pub unchanged: usize,
    pub updated: usize,
    pub rebound: usize,
    pub removed: usize,
    pub added: usize,
    pub failed: Vec<ConfigDiffError>,
}

impl std::fmt::Display for ReloadReport {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "{} unchanged, {} updated, {} rebound, {} removed, {} added, {} failed",
            self.unchanged,
            self.updated,
            self.rebound,
            self.removed,
            self.added,
            self.failed.len()
        )
    }
}

pub struct ReloadCoordinator {
    source: Box<dyn ConfigSource + Send>,
    binder: SocketBinder,
}

impl ReloadCoordinator {
    pub fn new(source: Box<dyn ConfigSource + Send>, binder: SocketBinder) -> Self {
        Self { source, binder }
    }

    /// Read the configuration and apply it. On a read error the registry is left alone.
    pub fn reload(&self, registry: &mut ServiceRegistry) -> std::io::Result<ReloadReport> {
        let parsed = self.source.load()?;
        for error in &parsed.errors {
            warn!("{}: {}", self.source.describe(), error);
        }
        Ok(self.apply(registry, parsed.specs))
    }

    pub fn apply(&self, registry: &mut ServiceRegistry, specs: Vec<ServiceSpec>) -> ReloadReport {
        let plan = ReloadPlan::new(registry, specs);
        let mut report = ReloadReport {
            unchanged: plan.unchanged.len(),
            ..ReloadReport::default()
        };

        for id in plan.remove {
            if let Some(entry) = registry.remove(id) {
                info!("Removed service: {}", entry.spec);
                report.removed += 1;
            }
        }
        let mut to_bind = Vec::with_capacity(plan.rebind.len() + plan.add.len());
        for (id, spec) in plan.rebind {
            if let Some(entry) = registry.remove(id) {
                debug!("{} moves from {} to {}", spec.key(), entry.spec.listen, spec.listen);
            }
            to_bind.push((spec, true));
        }
        for (id, spec) in plan.update {
            if let Some(entry) = registry.get_mut(id) {
                info!("Updated service: {spec}");
                entry.spec = spec;
                report.updated += 1;
            }
        }
        to_bind.extend(plan.add.into_iter().map(|spec| (spec, false)));

        for (spec, rebind) in to_bind {
            match self.binder.bind(&spec) {
                Ok(socket) => {
                    info!("Listening on {} for {}", spec.listen, spec);
                    registry.add(ServiceEntry::new(spec, socket));
                    if rebind {
                        report.rebound += 1;
                    } else {
                        report.added += 1;
                    }
                }
                Err(source) => {
                    let failure = ConfigDiffError {
                        key: spec.key(),
                        source,
                    };
                    warn!("{failure}");
                    report.failed.push(failure);
                }
            }
        }
        report
    }
}
