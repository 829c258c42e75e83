use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashMap};

use crate::error::CatalogError;
use crate::tools::ToolKind;

const TOOLS_JSON: &str = include_str!("../catalog/tools.json");
const POLICY_JSON: &str = include_str!("../catalog/policy.json");

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyEntry {
    /// Remote command name; `None` means the tool is handled locally.
    #[serde(default)]
    pub remote_action: Option<String>,
    #[serde(default)]
    pub destructive: bool,
}

#[derive(Deserialize)]
struct ToolsFile {
    tools: Vec<ToolDescriptor>,
}

#[derive(Deserialize)]
struct PolicyFile {
    policy: BTreeMap<String, PolicyEntry>,
}

#[derive(Debug, Clone)]
pub struct CatalogEntry {
    pub kind: ToolKind,
    pub descriptor: ToolDescriptor,
    pub policy: PolicyEntry,
}

#[derive(Debug)]
pub struct Catalog {
    entries: Vec<CatalogEntry>,
    by_name: HashMap<String, usize>,
}

impl Catalog {
    pub fn load_embedded() -> Result<Self, CatalogError> {
        Self::from_json(TOOLS_JSON, POLICY_JSON)
    }

    pub fn from_json(tools_json: &str, policy_json: &str) -> Result<Self, CatalogError> {
        let tools: ToolsFile =
            serde_json::from_str(tools_json).map_err(|source| CatalogError::Malformed {
                table: "tool catalog",
                source,
            })?;
        let policy: PolicyFile =
            serde_json::from_str(policy_json).map_err(|source| CatalogError::Malformed {
                table: "policy",
                source,
            })?;
        Self::build(tools.tools, policy.policy)
    }

    fn build(
        tools: Vec<ToolDescriptor>,
        mut policy: BTreeMap<String, PolicyEntry>,
    ) -> Result<Self, CatalogError> {
        let mut entries = Vec::with_capacity(tools.len());
        let mut by_name = HashMap::with_capacity(tools.len());

        for mut descriptor in tools {
            let name = descriptor.name.clone();
            if !is_namespaced(&name) {
                return Err(CatalogError::InvalidName(name));
            }
            if by_name.contains_key(&name) {
                return Err(CatalogError::DuplicateTool(name));
            }
            let entry = policy
                .remove(&name)
                .ok_or_else(|| CatalogError::MissingPolicy(name.clone()))?;
            let kind =
                ToolKind::from_name(&name).ok_or_else(|| CatalogError::UnknownTool(name.clone()))?;

            match (&entry.remote_action, kind.is_local()) {
                (Some(action), true) => {
                    return Err(CatalogError::UnexpectedRemoteAction {
                        name,
                        action: action.clone(),
                    });
                }
                (None, false) => return Err(CatalogError::MissingRemoteAction(name)),
                (Some(action), false) if action.trim().is_empty() => {
                    return Err(CatalogError::MissingRemoteAction(name));
                }
                _ => {}
            }

            if entry.destructive {
                ensure_confirm_property(&mut descriptor.input_schema);
            }

            by_name.insert(name, entries.len());
            entries.push(CatalogEntry {
                kind,
                descriptor,
                policy: entry,
            });
        }

        if let Some(orphan) = policy.into_keys().next() {
            return Err(CatalogError::OrphanPolicy(orphan));
        }

        Ok(Self { entries, by_name })
    }

    pub fn get(&self, name: &str) -> Option<&CatalogEntry> {
        self.by_name.get(name).map(|&i| &self.entries[i])
    }

    pub fn entries(&self) -> &[CatalogEntry] {
        &self.entries
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &ToolDescriptor> {
        self.entries.iter().map(|e| &e.descriptor)
    }
}

fn is_namespaced(name: &str) -> bool {
    match name.split_once('.') {
        Some((ns, rest)) => {
            !ns.is_empty() && !rest.is_empty() && !name.chars().any(char::is_whitespace)
        }
        None => false,
    }
}

fn ensure_confirm_property(schema: &mut Value) {
    let Some(obj) = schema.as_object_mut() else {
        return;
    };
    let props = obj.entry("properties").or_insert_with(|| json!({}));
    if let Some(props) = props.as_object_mut() {
        props.entry("confirm").or_insert_with(|| {
            json!({
                "type": "boolean",
                "default": false,
                "description": "Required when destructive confirmations are enabled in bridge config. Must be true (or a nonzero integer); strings are not accepted."
            })
        });
    }
}
