//! Checks a compose file against what the securitybot deployment needs.

use std::{collections::BTreeMap, fmt};

use crate::{
    model::{ComposeFile, Mount, PortMapping},
    vars::{referenced_variables, substitute},
};

/// Services every securitybot deployment defines.
pub const REQUIRED_SERVICES: &[&str] = &["db", "bot", "frontend"];

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Issue {
    MissingService(String),
    UnsetVariable { service: String, name: String },
    UndeclaredVolume { service: String, volume: String },
    PortCollision { port: u16, services: Vec<String> },
    MissingDependency { service: String, dependency: String },
    /// A `ports:` entry that does not parse.
    InvalidPort { service: String, spec: String },
}

impl fmt::Display for Issue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Issue::MissingService(s) => write!(f, "service `{s}` is not defined"),
            Issue::UnsetVariable { service, name } => {
                write!(f, "`{service}` references ${{{name}}} which is not set")
            }
            Issue::UndeclaredVolume { service, volume } => write!(
                f,
                "`{service}` mounts volume `{volume}` which is not declared under top-level `volumes`"
            ),
            Issue::PortCollision { port, services } => write!(
                f,
                "host port {port} is published by more than one service: {}",
                services.join(", ")
            ),
            Issue::MissingDependency {
                service,
                dependency,
            } => write!(f, "`{service}` depends on undefined service `{dependency}`"),
            Issue::InvalidPort { service, spec } => {
                write!(f, "`{service}` has an invalid port mapping `{spec}`")
            }
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Report {
    pub issues: Vec<Issue>,
}

impl Report {
    pub fn is_ok(&self) -> bool {
        self.issues.is_empty()
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.issues.is_empty() {
            return writeln!(f, "ok: no issues found");
        }
        for issue in &self.issues {
            writeln!(f, "error: {issue}")?;
        }
        write!(f, "{} issue(s)", self.issues.len())
    }
}

pub fn validate(file: &ComposeFile, env: &dyn Fn(&str) -> Option<String>) -> Report {
    let mut issues = Vec::new();

    for name in REQUIRED_SERVICES {
        if !file.services.contains_key(*name) {
            issues.push(Issue::MissingService(name.to_string()));
        }
    }

    for var in referenced_variables(file) {
        if var.has_default {
            continue;
        }
        // Reuse the interpolation rules for `?` forms and empty values.
        if substitute(&format!("${{{}}}", var.name), env).is_err() {
            issues.push(Issue::UnsetVariable {
                service: var.service,
                name: var.name,
            });
        }
    }

    let mut host_ports: BTreeMap<u16, Vec<String>> = BTreeMap::new();
    for (name, svc) in &file.services {
        for dep in svc.depends_on.names() {
            if !file.services.contains_key(dep) {
                issues.push(Issue::MissingDependency {
                    service: name.clone(),
                    dependency: dep.to_string(),
                });
            }
        }

        for mount in &svc.volumes {
            if let Mount::Named { volume, .. } = Mount::parse(mount) {
                if !file.volumes.contains_key(&volume) {
                    issues.push(Issue::UndeclaredVolume {
                        service: name.clone(),
                        volume,
                    });
                }
            }
        }

        for spec in &svc.ports {
            let spec = spec.to_string();
            let spec = substitute(&spec, env).unwrap_or(spec);
            match PortMapping::parse(&spec) {
                Some(PortMapping {
                    host_port: Some(port),
                    ..
                }) => host_ports.entry(port).or_default().push(name.clone()),
                Some(_) => {}
                None => issues.push(Issue::InvalidPort {
                    service: name.clone(),
                    spec,
                }),
            }
        }
    }

    for (port, services) in host_ports {
        if services.len() > 1 {
            issues.push(Issue::PortCollision { port, services });
        }
    }

    Report { issues }
}
