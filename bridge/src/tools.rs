use serde_json::{Map, Value, json};

use crate::error::ToolError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToolKind {
    StartProcess,
    StopProcess,
    ProcessStatus,
    GetContext,
    SearchSymbols,
    ListSymbols,
    Wire,
    InsertSymbol,
    CreateSymbol,
    SetInstanceProperty,
    GenerateNetlist,
    RunSimulation,
    ReadSimulationResults,
    SaveSchematic,
    Delete,
    ReloadSchematic,
    ReadSchematic,
    AddGraph,
    AnnotateOperatingPoint,
    GetInstancePins,
    CheckConnectivity,
    GetNetlistPreview,
    GetPinCoordinates,
    WireToPin,
    GetWireNetAssignment,
    DebugPinWireConnection,
    ForcePinNet,
    GetNetlistTrace,
}

impl ToolKind {
    pub const ALL: [ToolKind; 28] = [
        ToolKind::StartProcess,
        ToolKind::StopProcess,
        ToolKind::ProcessStatus,
        ToolKind::GetContext,
        ToolKind::SearchSymbols,
        ToolKind::ListSymbols,
        ToolKind::Wire,
        ToolKind::InsertSymbol,
        ToolKind::CreateSymbol,
        ToolKind::SetInstanceProperty,
        ToolKind::GenerateNetlist,
        ToolKind::RunSimulation,
        ToolKind::ReadSimulationResults,
        ToolKind::SaveSchematic,
        ToolKind::Delete,
        ToolKind::ReloadSchematic,
        ToolKind::ReadSchematic,
        ToolKind::AddGraph,
        ToolKind::AnnotateOperatingPoint,
        ToolKind::GetInstancePins,
        ToolKind::CheckConnectivity,
        ToolKind::GetNetlistPreview,
        ToolKind::GetPinCoordinates,
        ToolKind::WireToPin,
        ToolKind::GetWireNetAssignment,
        ToolKind::DebugPinWireConnection,
        ToolKind::ForcePinNet,
        ToolKind::GetNetlistTrace,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ToolKind::StartProcess => "xschem.start_process",
            ToolKind::StopProcess => "xschem.stop_process",
            ToolKind::ProcessStatus => "xschem.process_status",
            ToolKind::GetContext => "xschem.get_context",
            ToolKind::SearchSymbols => "xschem.search_symbols",
            ToolKind::ListSymbols => "xschem.list_symbols",
            ToolKind::Wire => "xschem.wire",
            ToolKind::InsertSymbol => "xschem.insert_symbol",
            ToolKind::CreateSymbol => "xschem.create_symbol",
            ToolKind::SetInstanceProperty => "xschem.set_instance_property",
            ToolKind::GenerateNetlist => "xschem.generate_netlist",
            ToolKind::RunSimulation => "xschem.run_simulation",
            ToolKind::ReadSimulationResults => "xschem.read_simulation_results",
            ToolKind::SaveSchematic => "xschem.save_schematic",
            ToolKind::Delete => "xschem.delete",
            ToolKind::ReloadSchematic => "xschem.reload_schematic",
            ToolKind::ReadSchematic => "xschem.read_schematic",
            ToolKind::AddGraph => "xschem.add_graph",
            ToolKind::AnnotateOperatingPoint => "xschem.annotate_operating_point",
            ToolKind::GetInstancePins => "xschem.get_instance_pins",
            ToolKind::CheckConnectivity => "xschem.check_connectivity",
            ToolKind::GetNetlistPreview => "xschem.get_netlist_preview",
            ToolKind::GetPinCoordinates => "xschem.get_pin_coordinates",
            ToolKind::WireToPin => "xschem.wire_to_pin",
            ToolKind::GetWireNetAssignment => "xschem.get_wire_net_assignment",
            ToolKind::DebugPinWireConnection => "xschem.debug_pin_wire_connection",
            ToolKind::ForcePinNet => "xschem.force_pin_net",
            ToolKind::GetNetlistTrace => "xschem.get_netlist_trace",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }

    pub fn is_local(&self) -> bool {
        matches!(
            self,
            ToolKind::StartProcess | ToolKind::StopProcess | ToolKind::ProcessStatus
        )
    }

    pub fn remote_args(&self, args: &Map<String, Value>) -> Result<Vec<Value>, ToolError> {
        let a = Args(args);
        let out = match self {
            ToolKind::StartProcess | ToolKind::StopProcess | ToolKind::ProcessStatus => {
                return Err(ToolError::InvalidArguments(format!(
                    "{} is handled locally",
                    self.name()
                )));
            }
            ToolKind::GetContext
            | ToolKind::RunSimulation
            | ToolKind::ReloadSchematic
            | ToolKind::ReadSchematic
            | ToolKind::CheckConnectivity
            | ToolKind::GetWireNetAssignment
            | ToolKind::GetNetlistTrace => vec![],
            ToolKind::SearchSymbols => vec![a.or("pattern", json!("*"))],
            ToolKind::ListSymbols => vec![a.flag("include_derived")],
            ToolKind::Wire => vec![a.req("x1")?, a.req("y1")?, a.req("x2")?, a.req("y2")?],
            ToolKind::InsertSymbol => vec![
                a.req("symbol_name")?,
                a.req("x")?,
                a.req("y")?,
                a.or("rot", json!(0)),
                a.or("flip", json!(0)),
                a.or("inst_props", json!("")),
                a.flag("batch_continues"),
            ],
            ToolKind::CreateSymbol => vec![
                a.req("name")?,
                a.or("in", json!([])),
                a.or("out", json!([])),
                a.or("inout", json!([])),
                a.flag("overwrite"),
            ],
            ToolKind::SetInstanceProperty => vec![
                a.req("instance")?,
                a.req("token")?,
                a.req("value")?,
                a.flag("fast"),
            ],
            ToolKind::GenerateNetlist | ToolKind::AnnotateOperatingPoint => {
                vec![a.or("filename", json!(""))]
            }
            ToolKind::ReadSimulationResults => {
                vec![a.or("raw_file", json!("")), a.or("sim_type", json!(""))]
            }
            ToolKind::SaveSchematic => {
                vec![a.or("filename", json!("")), a.or("type", json!("schematic"))]
            }
            ToolKind::Delete => {
                let target = a.req("target")?;
                let kind = target.as_str().unwrap_or_default().to_string();
                match kind.as_str() {
                    "instance" => vec![target, a.or("name", json!(""))],
                    "wire" => vec![target, a.or("index", json!(0))],
                    "area" => vec![
                        target,
                        a.req("x1")?,
                        a.req("y1")?,
                        a.req("x2")?,
                        a.req("y2")?,
                    ],
                    _ => vec![target],
                }
            }
            ToolKind::AddGraph => vec![
                a.req("x1")?,
                a.req("y1")?,
                a.req("x2")?,
                a.req("y2")?,
                a.req("signals")?,
                a.or("raw_file", json!("")),
                a.or("sim_type", json!("")),
            ],
            ToolKind::GetInstancePins => vec![a.req("instance_name")?],
            ToolKind::GetNetlistPreview => vec![a.or("max_lines", json!(500))],
            ToolKind::GetPinCoordinates | ToolKind::DebugPinWireConnection => {
                vec![a.req("instance_name")?, a.req("pin_name")?]
            }
            ToolKind::WireToPin => vec![
                a.req("instance_name")?,
                a.req("pin_name")?,
                a.req("x")?,
                a.req("y")?,
            ],
            ToolKind::ForcePinNet => vec![
                a.req("instance_name")?,
                a.req("pin_name")?,
                a.req("net_name")?,
            ],
        };
        Ok(out)
    }
}

struct Args<'a>(&'a Map<String, Value>);

impl Args<'_> {
    fn req(&self, key: &'static str) -> Result<Value, ToolError> {
        match self.0.get(key) {
            Some(v) if !v.is_null() => Ok(v.clone()),
            _ => Err(ToolError::MissingArgument(key)),
        }
    }

    fn or(&self, key: &str, default: Value) -> Value {
        match self.0.get(key) {
            Some(v) if !v.is_null() => v.clone(),
            _ => default,
        }
    }

    fn flag(&self, key: &str) -> Value {
        let on = self.0.get(key).and_then(|v| v.as_bool()).unwrap_or(false);
        json!(if on { 1 } else { 0 })
    }
}
