//! Compose file model. Only the keys the deployment uses are typed; the rest
//! are ignored.

use std::collections::BTreeMap;

use serde::Deserialize;

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ComposeFile {
    #[serde(default)]
    pub version: Option<Scalar>,
    #[serde(default)]
    pub services: BTreeMap<String, Service>,
    /// Top-level named volumes. Values are driver options, usually empty.
    #[serde(default)]
    pub volumes: BTreeMap<String, Option<serde_yaml::Value>>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct Service {
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub build: Option<Build>,
    #[serde(default)]
    pub command: Option<CommandLine>,
    #[serde(default)]
    pub environment: Environment,
    #[serde(default)]
    pub ports: Vec<Scalar>,
    #[serde(default)]
    pub volumes: Vec<String>,
    #[serde(default)]
    pub depends_on: DependsOn,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub enum Build {
    Context(String),
    Detailed {
        context: String,
        #[serde(default)]
        dockerfile: Option<String>,
    },
}

impl Build {
    pub fn context(&self) -> &str {
        match self {
            Build::Context(c) => c,
            Build::Detailed { context, .. } => context,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub enum CommandLine {
    Shell(String),
    Exec(Vec<String>),
}

impl CommandLine {
    pub fn parts(&self) -> Vec<&str> {
        match self {
            CommandLine::Shell(s) => s.split_whitespace().collect(),
            CommandLine::Exec(v) => v.iter().map(String::as_str).collect(),
        }
    }
}

/// YAML scalar that compose accepts where a string is expected (`8888`, `true`).
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl std::fmt::Display for Scalar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Scalar::Str(s) => f.write_str(s),
            Scalar::Int(i) => write!(f, "{i}"),
            Scalar::Float(x) => write!(f, "{x}"),
            Scalar::Bool(b) => write!(f, "{b}"),
        }
    }
}

/// `environment:` as a map or as a `KEY=value` list.
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub enum Environment {
    Map(BTreeMap<String, Option<Scalar>>),
    List(Vec<String>),
}

impl Default for Environment {
    fn default() -> Self {
        Environment::List(Vec::new())
    }
}

impl Environment {
    /// `(name, value)` pairs; `None` means "pass through from the host".
    pub fn entries(&self) -> Vec<(String, Option<String>)> {
        match self {
            Environment::Map(m) => m
                .iter()
                .map(|(k, v)| (k.clone(), v.as_ref().map(Scalar::to_string)))
                .collect(),
            Environment::List(l) => l
                .iter()
                .map(|e| match e.split_once('=') {
                    Some((k, v)) => (k.to_string(), Some(v.to_string())),
                    None => (e.clone(), None),
                })
                .collect(),
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.entries()
            .into_iter()
            .find(|(k, _)| k == key)
            .and_then(|(_, v)| v)
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub enum DependsOn {
    List(Vec<String>),
    /// Long form: `db: { condition: service_healthy }`.
    Map(BTreeMap<String, serde_yaml::Value>),
}

impl Default for DependsOn {
    fn default() -> Self {
        DependsOn::List(Vec::new())
    }
}

impl DependsOn {
    pub fn names(&self) -> Vec<&str> {
        match self {
            DependsOn::List(l) => l.iter().map(String::as_str).collect(),
            DependsOn::Map(m) => m.keys().map(String::as_str).collect(),
        }
    }
}

/// A `ports:` entry split into its published host port and container port.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PortMapping {
    pub host_ip: Option<String>,
    /// `None` means the host port is ephemeral.
    pub host_port: Option<u16>,
    pub container_port: u16,
    pub protocol: String,
}

impl PortMapping {
    /// Parse `"3306"`, `"8888:8888"`, `"127.0.0.1:8888:8888/tcp"`.
    pub fn parse(spec: &str) -> Option<Self> {
        let (addr, protocol) = match spec.rsplit_once('/') {
            Some((a, p)) => (a, p.to_string()),
            None => (spec, "tcp".to_string()),
        };
        let parts: Vec<&str> = addr.split(':').collect();
        let (host_ip, host, container) = match parts.as_slice() {
            [c] => (None, None, *c),
            [h, c] => (None, Some(*h), *c),
            [ip, h, c] => (Some(ip.to_string()), Some(*h), *c),
            _ => return None,
        };
        let host_port = match host {
            Some("") | None => None,
            Some(h) => Some(h.parse().ok()?),
        };
        Some(Self {
            host_ip,
            host_port,
            container_port: container.parse().ok()?,
            protocol,
        })
    }
}

/// A `volumes:` entry of a service.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Mount {
    Named { volume: String, target: String },
    Bind { source: String, target: String },
    Anonymous { target: String },
}

impl Mount {
    pub fn parse(spec: &str) -> Self {
        let mut parts = spec.splitn(3, ':');
        let first = parts.next().unwrap_or_default().to_string();
        match parts.next() {
            None => Mount::Anonymous { target: first },
            Some(target) => {
                let target = target.to_string();
                if first.starts_with(|c: char| matches!(c, '.' | '/' | '~' | '$')) {
                    Mount::Bind {
                        source: first,
                        target,
                    }
                } else {
                    Mount::Named {
                        volume: first,
                        target,
                    }
                }
            }
        }
    }
}
