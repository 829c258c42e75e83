use serde_json::{Map, Value};
use std::path::Path;
use std::sync::Arc;

use crate::catalog::{Catalog, CatalogEntry};
use crate::error::PolicyError;
use crate::tools::ToolKind;

pub const MAX_STRING_CHARS: usize = 20_000;
pub const MAX_LIST_ITEMS: usize = 1_000;

pub const PATH_KEYS: [&str; 3] = ["filename", "raw_file", "name"];

pub struct PolicyGate {
    catalog: Arc<Catalog>,
    require_confirmation: bool,
}

impl PolicyGate {
    pub fn new(catalog: Arc<Catalog>, require_confirmation: bool) -> Self {
        Self {
            catalog,
            require_confirmation,
        }
    }

    pub fn authorize(
        &self,
        name: &str,
        args: &Map<String, Value>,
    ) -> Result<&CatalogEntry, PolicyError> {
        let entry = self
            .catalog
            .get(name)
            .ok_or_else(|| PolicyError::NotAllowlisted(name.to_string()))?;
        validate_arguments(entry.kind, args)?;
        if self.require_confirmation && entry.policy.destructive && !is_confirmed(args) {
            return Err(PolicyError::ConfirmationRequired(name.to_string()));
        }
        Ok(entry)
    }
}

/// `true` or a nonzero integer. Strings never confirm.
fn is_confirmed(args: &Map<String, Value>) -> bool {
    match args.get("confirm") {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_i64().map_or(n.as_u64().is_some(), |n| n != 0),
        _ => false,
    }
}

pub fn validate_arguments(kind: ToolKind, args: &Map<String, Value>) -> Result<(), PolicyError> {
    for (key, value) in args {
        match value {
            Value::String(s) => {
                if s.chars().count() > MAX_STRING_CHARS {
                    return Err(PolicyError::invalid(key, "argument too long"));
                }
                if PATH_KEYS.contains(&key.as_str()) {
                    validate_safe_path(s).map_err(|reason| PolicyError::invalid(key, reason))?;
                }
            }
            Value::Array(items) => {
                if items.len() > MAX_LIST_ITEMS {
                    return Err(PolicyError::invalid(key, "list argument too long"));
                }
                if !items.iter().all(Value::is_string) {
                    return Err(PolicyError::invalid(key, "list argument must contain strings"));
                }
            }
            _ => {}
        }
    }

    if kind == ToolKind::InsertSymbol {
        if let Some(symbol) = args.get("symbol_name").and_then(Value::as_str) {
            if Path::new(symbol).is_absolute() {
                return Err(PolicyError::invalid(
                    "symbol_name",
                    "absolute symbol paths are not allowed",
                ));
            }
        }
    }

    if kind.is_local() {
        if let Some(port) = present(args, "tcp_port") {
            match port.as_i64() {
                Some(p) if (1..=65535).contains(&p) => {}
                Some(_) => {
                    return Err(PolicyError::invalid(
                        "tcp_port",
                        "must be between 1 and 65535",
                    ));
                }
                None => return Err(PolicyError::invalid("tcp_port", "must be an integer")),
            }
        }
    }

    if kind == ToolKind::StartProcess {
        if let Some(timeout) = present(args, "startup_timeout_seconds") {
            match timeout.as_f64() {
                Some(t) if t.is_finite() && t > 0.0 => {}
                _ => {
                    return Err(PolicyError::invalid(
                        "startup_timeout_seconds",
                        "must be > 0",
                    ));
                }
            }
        }
        if let Some(display) = present(args, "display") {
            if !display.is_string() {
                return Err(PolicyError::invalid("display", "must be a string"));
            }
        }
    }

    Ok(())
}

fn present<'a>(args: &'a Map<String, Value>, key: &str) -> Option<&'a Value> {
    args.get(key).filter(|v| !v.is_null())
}

/// Rejects NUL bytes and relative paths that normalize outside their base.
pub fn validate_safe_path(value: &str) -> Result<(), &'static str> {
    if value.contains('\0') {
        return Err("path contains NUL byte");
    }
    let norm = normalize_path(value);
    if norm == ".." || norm.starts_with("../") {
        return Err("path traversal is not allowed");
    }
    Ok(())
}

fn normalize_path(path: &str) -> String {
    let absolute = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for comp in path.split('/') {
        match comp {
            "" | "." => {}
            ".." => {
                if parts.last().is_some_and(|p| *p != "..") {
                    parts.pop();
                } else if !absolute {
                    parts.push("..");
                }
            }
            other => parts.push(other),
        }
    }
    let joined = parts.join("/");
    if absolute {
        format!("/{joined}")
    } else if joined.is_empty() {
        ".".to_string()
    } else {
        joined
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn gate(require_confirmation: bool) -> PolicyGate {
        PolicyGate::new(Arc::new(Catalog::load_embedded().unwrap()), require_confirmation)
    }

    fn args(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn unknown_tools_are_not_allowlisted() {
        let err = gate(true).authorize("xschem.unknown", &Map::new()).unwrap_err();
        assert!(matches!(err, PolicyError::NotAllowlisted(_)));
        assert!(err.is_authorization());
        assert!(gate(true).authorize("xschem.get_context", &Map::new()).is_ok());
    }

    #[test]
    fn every_destructive_tool_needs_confirm() {
        let gate = gate(true);
        let catalog = Catalog::load_embedded().unwrap();
        for entry in catalog.entries().iter().filter(|e| e.policy.destructive) {
            let name = entry.descriptor.name.as_str();
            let err = gate.authorize(name, &Map::new()).unwrap_err();
            assert!(matches!(err, PolicyError::ConfirmationRequired(_)), "{name}");
            assert!(err.is_authorization());

            let err = gate.authorize(name, &args(json!({ "confirm": false }))).unwrap_err();
            assert!(matches!(err, PolicyError::ConfirmationRequired(_)), "{name}");

            let err = gate.authorize(name, &args(json!({ "confirm": "yes" }))).unwrap_err();
            assert!(matches!(err, PolicyError::ConfirmationRequired(_)), "{name}");

            assert!(gate.authorize(name, &args(json!({ "confirm": true }))).is_ok(), "{name}");
        }
    }

    #[test]
    fn integer_confirm_follows_truthiness() {
        let gate = gate(true);
        assert!(gate.authorize("xschem.delete", &args(json!({ "confirm": 1 }))).is_ok());
        let err = gate
            .authorize("xschem.delete", &args(json!({ "confirm": 0 })))
            .unwrap_err();
        assert!(matches!(err, PolicyError::ConfirmationRequired(_)));
        let err = gate
            .authorize("xschem.delete", &args(json!({ "confirm": 0.5 })))
            .unwrap_err();
        assert!(matches!(err, PolicyError::ConfirmationRequired(_)));
    }

    #[test]
    fn confirmation_gate_can_be_disabled_bridge_wide() {
        assert!(gate(false).authorize("xschem.wire", &Map::new()).is_ok());
    }

    #[test]
    fn validation_runs_before_confirmation() {
        let err = gate(true)
            .authorize("xschem.save_schematic", &args(json!({ "filename": "../x.sch" })))
            .unwrap_err();
        assert!(matches!(err, PolicyError::InvalidArgument { .. }));
        assert!(!err.is_authorization());
    }

    #[test]
    fn path_traversal_is_rejected() {
        let kind = ToolKind::GenerateNetlist;
        assert!(validate_arguments(kind, &args(json!({ "filename": "../secret" }))).is_err());
        assert!(validate_arguments(kind, &args(json!({ "filename": ".." }))).is_err());
        assert!(validate_arguments(kind, &args(json!({ "filename": "a/../../b" }))).is_err());
        assert!(validate_arguments(kind, &args(json!({ "filename": "a/b.sym" }))).is_ok());
        assert!(validate_arguments(kind, &args(json!({ "filename": "a/../b.sym" }))).is_ok());
        assert!(validate_arguments(kind, &args(json!({ "filename": "/tmp/x.spice" }))).is_ok());
        assert!(validate_arguments(kind, &args(json!({ "filename": "ok\u{0}.sch" }))).is_err());
        assert!(validate_arguments(kind, &args(json!({ "raw_file": "../../r.raw" }))).is_err());
    }

    #[test]
    fn normalization_matches_posix_lexical_rules() {
        assert_eq!(normalize_path(""), ".");
        assert_eq!(normalize_path("./a//b/."), "a/b");
        assert_eq!(normalize_path("a/b/../../.."), "..");
        assert_eq!(normalize_path("/../etc"), "/etc");
        assert_eq!(normalize_path("../../x"), "../../x");
    }

    #[test]
    fn list_limits_and_homogeneity() {
        let kind = ToolKind::CreateSymbol;
        let at_limit: Vec<String> = (0..1000).map(|i| format!("p{i}")).collect();
        let over_limit: Vec<String> = (0..1001).map(|i| format!("p{i}")).collect();
        assert!(validate_arguments(kind, &args(json!({ "in": at_limit }))).is_ok());
        assert!(validate_arguments(kind, &args(json!({ "in": over_limit }))).is_err());
        assert!(validate_arguments(kind, &args(json!({ "in": ["a", 1] }))).is_err());
    }

    #[test]
    fn long_strings_are_rejected() {
        let kind = ToolKind::SetInstanceProperty;
        let ok = "é".repeat(MAX_STRING_CHARS);
        let too_long = "x".repeat(MAX_STRING_CHARS + 1);
        assert!(validate_arguments(kind, &args(json!({ "value": ok }))).is_ok());
        assert!(validate_arguments(kind, &args(json!({ "value": too_long }))).is_err());
    }

    #[test]
    fn absolute_symbol_paths_are_rejected() {
        let kind = ToolKind::InsertSymbol;
        let err = validate_arguments(
            kind,
            &args(json!({ "symbol_name": "/tmp/nmos.sym", "x": 0, "y": 0 })),
        )
        .unwrap_err();
        assert!(matches!(err, PolicyError::InvalidArgument { ref key, .. } if key == "symbol_name"));
        assert!(validate_arguments(kind, &args(json!({ "symbol_name": "devices/nmos.sym" }))).is_ok());
    }

    #[test]
    fn process_tool_numeric_checks() {
        for port in [json!(0), json!(65536), json!(-1), json!("2021"), json!(20.5)] {
            assert!(
                validate_arguments(ToolKind::StopProcess, &args(json!({ "tcp_port": port }))).is_err()
            );
        }
        assert!(validate_arguments(ToolKind::StopProcess, &args(json!({ "tcp_port": 1 }))).is_ok());
        assert!(validate_arguments(ToolKind::ProcessStatus, &args(json!({ "tcp_port": 65535 }))).is_ok());

        let kind = ToolKind::StartProcess;
        assert!(validate_arguments(kind, &args(json!({ "tcp_port": 2021, "startup_timeout_seconds": 0 }))).is_err());
        assert!(validate_arguments(kind, &args(json!({ "tcp_port": 2021, "startup_timeout_seconds": -2.5 }))).is_err());
        assert!(validate_arguments(kind, &args(json!({ "tcp_port": 2021, "startup_timeout_seconds": 0.5 }))).is_ok());
        assert!(validate_arguments(kind, &args(json!({ "tcp_port": 2021, "display": 0 }))).is_err());
        assert!(validate_arguments(kind, &args(json!({ "tcp_port": 2021, "display": ":1" }))).is_ok());
    }
}
