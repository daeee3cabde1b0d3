//! `${VAR}` interpolation the way compose does it.

use std::{collections::BTreeSet, sync::OnceLock};

use regex::{Captures, Regex};

use sb_core::{errors::Error, Result};

use crate::model::{ComposeFile, Service};

fn var_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        match Regex::new(
            r"\$(?:(\$)|\{([A-Za-z_][A-Za-z0-9_]*)(?:(:?[-?])([^}]*))?\}|([A-Za-z_][A-Za-z0-9_]*))",
        ) {
            Ok(re) => re,
            Err(e) => unreachable!("static regex: {e}"),
        }
    })
}

/// One `$VAR` / `${VAR...}` occurrence.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct VarRef {
    pub service: String,
    pub name: String,
    /// The value is usable without the variable being set (`:-`, `-`).
    pub has_default: bool,
}

fn refs_in(service: &str, value: &str, out: &mut BTreeSet<VarRef>) {
    for caps in var_re().captures_iter(value) {
        if caps.get(1).is_some() {
            continue;
        }
        let (name, op) = match (caps.get(2), caps.get(5)) {
            (Some(n), _) => (n.as_str(), caps.get(3).map(|m| m.as_str())),
            (None, Some(n)) => (n.as_str(), None),
            (None, None) => continue,
        };
        out.insert(VarRef {
            service: service.to_string(),
            name: name.to_string(),
            has_default: matches!(op, Some(":-") | Some("-")),
        });
    }
}

/// Every string of a service that compose interpolates.
fn service_strings(svc: &Service) -> Vec<String> {
    let mut out = Vec::new();
    out.extend(svc.image.clone());
    if let Some(build) = &svc.build {
        out.push(build.context().to_string());
    }
    if let Some(cmd) = &svc.command {
        out.extend(cmd.parts().into_iter().map(str::to_string));
    }
    out.extend(svc.environment.entries().into_iter().filter_map(|(_, v)| v));
    out.extend(svc.ports.iter().map(ToString::to_string));
    out.extend(svc.volumes.iter().cloned());
    out
}

/// All variables referenced by any service, ordered by service then name.
pub fn referenced_variables(file: &ComposeFile) -> Vec<VarRef> {
    let mut out = BTreeSet::new();
    for (name, svc) in &file.services {
        for value in service_strings(svc) {
            refs_in(name, &value, &mut out);
        }
    }
    out.into_iter().collect()
}

/// Interpolate one value. `$$` is a literal `$`.
///
/// `${VAR:-d}` uses `d` when VAR is unset or empty, `${VAR-d}` only when
/// unset; `${VAR:?msg}` / `${VAR?msg}` fail instead. A bare unset `${VAR}`
/// is an error.
pub fn substitute(value: &str, env: &dyn Fn(&str) -> Option<String>) -> Result<String> {
    let mut err = None;
    let out = var_re().replace_all(value, |caps: &Captures| {
        if caps.get(1).is_some() {
            return "$".to_string();
        }
        let (name, op, arg) = match (caps.get(2), caps.get(5)) {
            (Some(n), _) => (
                n.as_str(),
                caps.get(3).map(|m| m.as_str()),
                caps.get(4).map_or("", |m| m.as_str()),
            ),
            (None, Some(n)) => (n.as_str(), None, ""),
            (None, None) => return String::new(),
        };
        let current = env(name);
        match (op, current) {
            (Some(":-"), Some(v)) if !v.is_empty() => v,
            (Some(":-"), _) => arg.to_string(),
            (Some("-"), Some(v)) => v,
            (Some("-"), None) => arg.to_string(),
            (Some(":?"), Some(v)) if !v.is_empty() => v,
            (Some("?"), Some(v)) => v,
            (Some(_), _) => {
                let msg = if arg.is_empty() { "required" } else { arg };
                err.get_or_insert_with(|| format!("{name}: {msg}"));
                String::new()
            }
            (None, Some(v)) => v,
            (None, None) => {
                err.get_or_insert_with(|| format!("{name} is not set"));
                String::new()
            }
        }
    });
    match err {
        Some(msg) => Err(Error::InvalidInput(msg)),
        None => Ok(out.into_owned()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(name: &str) -> Option<String> {
        match name {
            "DB_PASS" => Some("hunter2".to_string()),
            "EMPTY" => Some(String::new()),
            _ => None,
        }
    }

    #[test]
    fn substitutes_each_form() {
        assert_eq!(substitute("p=${DB_PASS}", &env).unwrap(), "p=hunter2");
        assert_eq!(substitute("p=$DB_PASS!", &env).unwrap(), "p=hunter2!");
        assert_eq!(substitute("${NOPE:-db}", &env).unwrap(), "db");
        assert_eq!(substitute("${EMPTY:-db}", &env).unwrap(), "db");
        assert_eq!(substitute("${EMPTY-db}", &env).unwrap(), "");
        assert_eq!(substitute("${NOPE:-}", &env).unwrap(), "");
        assert_eq!(substitute("cost $$5", &env).unwrap(), "cost $5");
    }

    #[test]
    fn unset_required_variables_fail() {
        let err = substitute("${NOPE}", &env).unwrap_err();
        assert!(err.to_string().contains("NOPE is not set"));
        let err = substitute("${EMPTY:?set a password}", &env).unwrap_err();
        assert!(err.to_string().contains("set a password"));
        assert!(substitute("${DB_PASS?}", &env).is_ok());
    }

    #[test]
    fn references_note_defaults() {
        let file: ComposeFile = serde_yaml::from_str(
            "services:\n  app:\n    image: app:${TAG:-latest}\n    environment:\n      - A=$A\n      - B=${B}\n      - C=$$C\n",
        )
        .unwrap();
        let refs = referenced_variables(&file);
        let names: Vec<(&str, bool)> = refs
            .iter()
            .map(|r| (r.name.as_str(), r.has_default))
            .collect();
        assert_eq!(names, [("A", false), ("B", false), ("TAG", true)]);
    }
}
