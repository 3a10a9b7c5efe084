//! Immutable description of every supervised service and its dependency layering.
use std::{
    collections::{BTreeMap, HashMap},
    path::PathBuf,
};

use serde::Serialize;
use tracing::debug;

use crate::config::{Config, Protocol};
use crate::error::InvalidRegistry;

/// Identifier of a registered service.
pub type ServiceId = String;

/// An opaque shell command executed in a working directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Directive {
    pub command: String,
    pub working_dir: PathBuf,
    pub env: BTreeMap<String, String>,
}

impl Directive {
    /// Convenience constructor with an empty environment.
    pub fn new(command: impl Into<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            working_dir: working_dir.into(),
            env: BTreeMap::new(),
        }
    }
}

/// Static description of one service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceSpec {
    pub id: ServiceId,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub health_path: String,
    pub protocol: Protocol,
    pub depends_on: Vec<ServiceId>,
    pub start: Directive,
    pub build: Option<Directive>,
}

impl ServiceSpec {
    /// Builds a plain HTTP service spec on localhost; mostly useful in tests and tooling.
    pub fn new(id: &str, port: u16, depends_on: &[&str], start: Directive) -> Self {
        Self {
            id: id.to_string(),
            name: id.to_string(),
            host: "127.0.0.1".to_string(),
            port,
            health_path: "/health".to_string(),
            protocol: Protocol::Http,
            depends_on: depends_on.iter().map(|dep| dep.to_string()).collect(),
            start,
            build: None,
        }
    }

    /// `host:port` of the service.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Full URL of the health endpoint.
    pub fn health_url(&self) -> String {
        let path = if self.health_path.starts_with('/') {
            self.health_path.clone()
        } else {
            format!("/{}", self.health_path)
        };
        format!("{}://{}:{}{}", self.protocol, self.host, self.port, path)
    }
}

/// Validated, read-only set of services.
#[derive(Debug, Clone)]
pub struct Registry {
    services: Vec<ServiceSpec>,
    index: HashMap<ServiceId, usize>,
    phases: Vec<Vec<ServiceId>>,
}

impl Registry {
    /// Builds and validates a registry from the loaded configuration.
    pub fn load(config: &Config) -> Result<Self, InvalidRegistry> {
        let root = config.project_root();
        let specs = config
            .services
            .iter()
            .map(|service| {
                let directive = |raw: &crate::config::DirectiveConfig| Directive {
                    command: raw.command.clone(),
                    working_dir: raw.working_dir(&root),
                    env: service.env.clone(),
                };

                ServiceSpec {
                    id: service.id.trim().to_string(),
                    name: service
                        .name
                        .clone()
                        .unwrap_or_else(|| service.id.trim().to_string()),
                    host: service.host.clone(),
                    port: service.port,
                    health_path: service.health_path.clone(),
                    protocol: service.protocol,
                    depends_on: service.depends_on.clone(),
                    start: directive(&service.start),
                    build: service.build.as_ref().map(directive),
                }
            })
            .collect();

        Self::from_specs(specs)
    }

    /// Validates `services` and computes the startup phases.
    pub fn from_specs(services: Vec<ServiceSpec>) -> Result<Self, InvalidRegistry> {
        let mut index = HashMap::with_capacity(services.len());
        for (position, service) in services.iter().enumerate() {
            if service.id.is_empty() {
                return Err(InvalidRegistry::EmptyId { index: position });
            }
            if index.insert(service.id.clone(), position).is_some() {
                return Err(InvalidRegistry::DuplicateService {
                    service: service.id.clone(),
                });
            }
        }

        for service in &services {
            for dependency in &service.depends_on {
                if !index.contains_key(dependency) {
                    return Err(InvalidRegistry::UnknownDependency {
                        service: service.id.clone(),
                        dependency: dependency.clone(),
                    });
                }
            }
        }

        detect_cycle(&services, &index)?;
        let phases = layer(&services, &index);
        debug!("Registry loaded with {} services in {} phases", services.len(), phases.len());

        Ok(Self {
            services,
            index,
            phases,
        })
    }

    /// Looks up a service by id.
    pub fn get(&self, id: &str) -> Option<&ServiceSpec> {
        self.index.get(id).map(|&position| &self.services[position])
    }

    /// All services in declaration order.
    pub fn services(&self) -> &[ServiceSpec] {
        &self.services
    }

    /// Service ids in declaration order.
    pub fn ids(&self) -> impl Iterator<Item = &ServiceId> {
        self.services.iter().map(|service| &service.id)
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Topological layering: phase 0 holds services without dependencies, phase `k`
    /// holds services whose dependencies all live in earlier phases.
    pub fn phases(&self) -> &[Vec<ServiceId>] {
        &self.phases
    }

    /// Index of the phase containing `id`.
    pub fn phase_of(&self, id: &str) -> Option<usize> {
        self.phases
            .iter()
            .position(|phase| phase.iter().any(|member| member == id))
    }

    /// Services that declare a direct dependency on `id`.
    pub fn dependents_of(&self, id: &str) -> Vec<&ServiceId> {
        self.services
            .iter()
            .filter(|service| service.depends_on.iter().any(|dep| dep == id))
            .map(|service| &service.id)
            .collect()
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Visit {
    InProgress,
    Done,
}

/// Depth-first search tracking an in-progress set; revisiting an in-progress node is a cycle.
fn detect_cycle(
    services: &[ServiceSpec],
    index: &HashMap<ServiceId, usize>,
) -> Result<(), InvalidRegistry> {
    fn visit(
        position: usize,
        services: &[ServiceSpec],
        index: &HashMap<ServiceId, usize>,
        marks: &mut [Option<Visit>],
        path: &mut Vec<usize>,
    ) -> Result<(), InvalidRegistry> {
        match marks[position] {
            Some(Visit::Done) => return Ok(()),
            Some(Visit::InProgress) => {
                let start = path.iter().position(|&p| p == position).unwrap_or(0);
                let mut cycle: Vec<&str> = path[start..]
                    .iter()
                    .map(|&p| services[p].id.as_str())
                    .collect();
                cycle.push(services[position].id.as_str());
                return Err(InvalidRegistry::DependencyCycle {
                    cycle: cycle.join(" -> "),
                });
            }
            None => {}
        }

        marks[position] = Some(Visit::InProgress);
        path.push(position);
        for dependency in &services[position].depends_on {
            if let Some(&next) = index.get(dependency) {
                visit(next, services, index, marks, path)?;
            }
        }
        path.pop();
        marks[position] = Some(Visit::Done);
        Ok(())
    }

    let mut marks = vec![None; services.len()];
    let mut path = Vec::new();
    for position in 0..services.len() {
        visit(position, services, index, &mut marks, &mut path)?;
    }
    Ok(())
}

/// Assigns each service the phase `1 + max(phase of dependencies)`. Requires an acyclic graph.
fn layer(services: &[ServiceSpec], index: &HashMap<ServiceId, usize>) -> Vec<Vec<ServiceId>> {
    fn depth(
        position: usize,
        services: &[ServiceSpec],
        index: &HashMap<ServiceId, usize>,
        memo: &mut [Option<usize>],
    ) -> usize {
        if let Some(known) = memo[position] {
            return known;
        }
        let level = services[position]
            .depends_on
            .iter()
            .filter_map(|dep| index.get(dep))
            .map(|&dep| depth(dep, services, index, memo) + 1)
            .max()
            .unwrap_or(0);
        memo[position] = Some(level);
        level
    }

    let mut memo = vec![None; services.len()];
    let mut phases: Vec<Vec<ServiceId>> = Vec::new();
    for position in 0..services.len() {
        let level = depth(position, services, index, &mut memo);
        if phases.len() <= level {
            phases.resize_with(level + 1, Vec::new);
        }
        phases[level].push(services[position].id.clone());
    }

    phases
}
