//! # spcsim-model
//!
//! YAML scenario loading and simulation building for the SPC MAC simulator.
//!
//! This crate provides:
//! - YAML schema types for scenarios ([`schema`])
//! - Scenario loading from files and strings, with multi-file merging
//! - Simulation building from loaded scenarios
//!
//! ## Layering
//!
//! PHY and MAC parameters are resolved in order: built-in defaults →
//! `simulation` wide values → the `defaults` section → explicit values on a
//! node. Later files override earlier ones section by section, and nodes
//! with the same name are merged field by field.

pub mod schema;

pub use schema::{
    DefaultScenario, DefaultsConfig, DelayModelConfig, FixedLossConfig, LossModelConfig,
    LossPair, NodeConfig, OnOffTraffic, PropagationConfig, SimulationConfig, SinkConfig,
    SpcSenderTraffic, TrafficConfig, BROADCAST_NAME,
};

use serde::Deserialize;
use serde_yaml::{Mapping, Value};
use spcsim_agents::{OnOffConfig, OnOffSender, PacketSink, SpcSender, SpcSenderConfig};
use spcsim_common::{EntityId, EntityRegistry, MacAddress, Position, SimContext, SimTime};
use spcsim_mac::SpcNode;
use spcsim_phy::channel::Channel;
use spcsim_phy::propagation::{FixedLoss, PropagationDelayModel, PropagationLossModel};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info};

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur during model operations.
#[derive(Debug, Error)]
pub enum ModelError {
    /// YAML parsing error.
    #[error("YAML parse error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// A node section did not match the schema.
    #[error("Invalid node '{node}': {source}")]
    InvalidNode {
        /// Node name.
        node: String,
        /// Underlying schema error.
        source: serde_yaml::Error,
    },

    /// Node not found.
    #[error("Node not found: {0}")]
    NodeNotFound(String),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Duplicate node name.
    #[error("Duplicate node name: {0}")]
    DuplicateNode(String),

    /// IO error.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

// ============================================================================
// Public Model API
// ============================================================================

/// A loaded scenario with every layer resolved.
#[derive(Debug, Clone)]
pub struct Model {
    simulation: SimulationConfig,
    propagation: PropagationConfig,
    nodes: Vec<NodeConfig>,
}

impl Model {
    /// Simulation-wide settings.
    pub fn simulation(&self) -> &SimulationConfig {
        &self.simulation
    }

    /// Propagation models.
    pub fn propagation(&self) -> &PropagationConfig {
        &self.propagation
    }

    /// Nodes in declaration order.
    pub fn nodes(&self) -> &[NodeConfig] {
        &self.nodes
    }

    /// Find a node by name.
    pub fn find_node(&self, name: &str) -> Option<&NodeConfig> {
        self.nodes.iter().find(|n| n.name == name)
    }

    /// Link-layer address assigned to a node: its position in the node list,
    /// starting at 1.
    pub fn address_of(&self, name: &str) -> Option<MacAddress> {
        if name == BROADCAST_NAME {
            return Some(MacAddress::BROADCAST);
        }
        self.nodes
            .iter()
            .position(|n| n.name == name)
            .map(|i| MacAddress::from_index(i as u64 + 1))
    }
}

// ============================================================================
// YAML Schema Types (Internal)
// ============================================================================

/// Root of one scenario file. Sections stay untyped until every file is merged.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ModelFileYaml {
    #[serde(default)]
    simulation: Mapping,
    #[serde(default)]
    defaults: Mapping,
    #[serde(default)]
    propagation: Mapping,
    #[serde(default)]
    nodes: Vec<NodeEntryYaml>,
}

/// Node entry before layering.
#[derive(Debug, Clone, Deserialize)]
struct NodeEntryYaml {
    /// Node name (must be unique).
    name: String,
    /// When true, this node is removed during merging.
    #[serde(default)]
    remove: bool,
    /// Everything else, validated once the node is resolved.
    #[serde(flatten)]
    properties: Mapping,
}

/// `defaults` section, split per layer.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct DefaultsYaml {
    #[serde(default)]
    phy: Mapping,
    #[serde(default)]
    mac: Mapping,
}

/// Merge `overlay` into `base`. Mappings merge key by key; anything else
/// replaces.
fn merge_value(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Mapping(base), Value::Mapping(overlay)) => merge_mapping(base, overlay),
        (base, overlay) => *base = overlay,
    }
}

fn merge_mapping(base: &mut Mapping, overlay: Mapping) {
    for (key, value) in overlay {
        match base.get_mut(&key) {
            Some(existing) => merge_value(existing, value),
            None => {
                base.insert(key, value);
            }
        }
    }
}

fn key(name: &str) -> Value {
    Value::String(name.to_string())
}

// ============================================================================
// Model Loading
// ============================================================================

/// Load a scenario from a file.
pub fn load_model(path: &Path) -> Result<Model, ModelError> {
    load_models(&[path])
}

/// Parse a scenario from a YAML string.
pub fn load_model_from_str(yaml_str: &str) -> Result<Model, ModelError> {
    load_models_from_str(&[yaml_str])
}

/// Load and merge several scenario files.
///
/// Later files override earlier ones:
/// - `simulation` and `defaults` merge key by key
/// - `propagation.loss` and `propagation.delay` are replaced as a whole
/// - Nodes with the same name are merged; `remove: true` deletes a node
///
/// Validation runs only on the final merged scenario.
pub fn load_models(paths: &[&Path]) -> Result<Model, ModelError> {
    if paths.is_empty() {
        return Err(ModelError::InvalidConfig("No model files provided".to_string()));
    }
    let yaml_strings = paths
        .iter()
        .map(|path| std::fs::read_to_string(path))
        .collect::<Result<Vec<String>, std::io::Error>>()?;
    let yaml_strs: Vec<&str> = yaml_strings.iter().map(|s| s.as_str()).collect();
    load_models_from_str(&yaml_strs)
}

/// Load and merge several scenarios from YAML strings. See [`load_models`].
pub fn load_models_from_str(yaml_strs: &[&str]) -> Result<Model, ModelError> {
    if yaml_strs.is_empty() {
        return Err(ModelError::InvalidConfig("No model strings provided".to_string()));
    }

    let mut simulation = Mapping::new();
    let mut defaults = Mapping::new();
    let mut propagation = Mapping::new();
    let mut nodes: Vec<(String, Mapping)> = Vec::new();

    for yaml_str in yaml_strs {
        let file: ModelFileYaml = serde_yaml::from_str(yaml_str)?;
        merge_mapping(&mut simulation, file.simulation);
        merge_mapping(&mut defaults, file.defaults);
        for (k, v) in file.propagation {
            propagation.insert(k, v);
        }

        let mut seen = BTreeSet::new();
        for node in file.nodes {
            if !seen.insert(node.name.clone()) {
                return Err(ModelError::DuplicateNode(node.name));
            }
            let existing = nodes.iter().position(|(name, _)| *name == node.name);
            match (node.remove, existing) {
                (true, Some(index)) => {
                    nodes.remove(index);
                }
                (true, None) => return Err(ModelError::NodeNotFound(node.name)),
                (false, Some(index)) => merge_mapping(&mut nodes[index].1, node.properties),
                (false, None) => nodes.push((node.name, node.properties)),
            }
        }
    }

    let simulation: SimulationConfig = serde_yaml::from_value(Value::Mapping(simulation))?;
    let propagation: PropagationConfig = serde_yaml::from_value(Value::Mapping(propagation))?;
    let defaults: DefaultsYaml = serde_yaml::from_value(Value::Mapping(defaults))?;

    let mut mac_base = Mapping::new();
    if let Some(bandwidth) = simulation.bandwidth_hz {
        mac_base.insert(key("bandwidth_hz"), Value::from(bandwidth));
    }
    if let Some(interval) = simulation.measure_interval_ms {
        mac_base.insert(key("measure_interval_ms"), Value::from(interval));
    }
    merge_mapping(&mut mac_base, defaults.mac);

    let nodes = nodes
        .into_iter()
        .map(|(name, properties)| resolve_node(name, properties, &defaults.phy, &mac_base))
        .collect::<Result<Vec<_>, _>>()?;

    let model = Model {
        simulation,
        propagation,
        nodes,
    };
    validate(&model)?;
    Ok(model)
}

/// Layer defaults under a node's own values and parse the result.
fn resolve_node(
    name: String,
    mut properties: Mapping,
    phy_defaults: &Mapping,
    mac_defaults: &Mapping,
) -> Result<NodeConfig, ModelError> {
    for (layer, defaults) in [("phy", phy_defaults), ("mac", mac_defaults)] {
        let mut resolved = Value::Mapping(defaults.clone());
        if let Some(own) = properties.remove(layer) {
            merge_value(&mut resolved, own);
        }
        properties.insert(key(layer), resolved);
    }
    properties.insert(key("name"), Value::String(name.clone()));
    serde_yaml::from_value(Value::Mapping(properties))
        .map_err(|source| ModelError::InvalidNode { node: name, source })
}

fn validate(model: &Model) -> Result<(), ModelError> {
    let sim = &model.simulation;
    if !(sim.duration_s > 0.0) {
        return Err(ModelError::InvalidConfig(format!(
            "simulation.duration_s must be positive, got {}",
            sim.duration_s
        )));
    }

    let resolve = |name: &str| {
        model
            .address_of(name)
            .ok_or_else(|| ModelError::NodeNotFound(name.to_string()))
    };

    for node in &model.nodes {
        if node.mac.cw_min > node.mac.cw_max {
            return Err(ModelError::InvalidConfig(format!(
                "node '{}': cw_min {} exceeds cw_max {}",
                node.name, node.mac.cw_min, node.mac.cw_max
            )));
        }
        for traffic in &node.traffic {
            match traffic {
                TrafficConfig::SpcSender(spc) => {
                    if spc.destinations.len() != 2 {
                        return Err(ModelError::InvalidConfig(format!(
                            "node '{}': spc_sender needs exactly two destinations",
                            node.name
                        )));
                    }
                    for dest in &spc.destinations {
                        resolve(dest)?;
                        if *dest == node.name {
                            return Err(ModelError::InvalidConfig(format!(
                                "node '{}': sender cannot target itself",
                                node.name
                            )));
                        }
                    }
                    if !(0.0..=1.0).contains(&spc.traffic_ratio) {
                        return Err(ModelError::InvalidConfig(format!(
                            "node '{}': traffic_ratio {} outside [0, 1]",
                            node.name, spc.traffic_ratio
                        )));
                    }
                    if !(spc.mean_interval_s > 0.0) {
                        return Err(ModelError::InvalidConfig(format!(
                            "node '{}': mean_interval_s must be positive",
                            node.name
                        )));
                    }
                }
                TrafficConfig::OnOff(on_off) => {
                    resolve(&on_off.destination)?;
                    if on_off.destination == node.name {
                        return Err(ModelError::InvalidConfig(format!(
                            "node '{}': sender cannot target itself",
                            node.name
                        )));
                    }
                    if on_off.data_rate_bps == 0 || on_off.packet_size == 0 {
                        return Err(ModelError::InvalidConfig(format!(
                            "node '{}': on_off needs a positive rate and packet size",
                            node.name
                        )));
                    }
                }
            }
        }
    }

    if let LossModelConfig::Fixed(fixed) = &model.propagation.loss {
        for pair in &fixed.pairs {
            for name in [&pair.from, &pair.to] {
                if model.find_node(name).is_none() {
                    return Err(ModelError::NodeNotFound(name.clone()));
                }
            }
        }
    }
    Ok(())
}

/// Defaults for every section, as printed by `spcsim defaults`.
pub fn default_scenario_yaml() -> Result<String, ModelError> {
    Ok(serde_yaml::to_string(&DefaultScenario::default())?)
}

// ============================================================================
// Model Building
// ============================================================================

/// Information about a node for display purposes.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    /// Node name from the scenario.
    pub name: String,
    /// Assigned link-layer address.
    pub address: MacAddress,
    /// Position in meters.
    pub position: Position,
    /// Entity ID of the node.
    pub node_entity_id: EntityId,
    /// Entity ID of the packet sink, if any.
    pub sink_entity_id: Option<EntityId>,
    /// Entity IDs of traffic generators.
    pub sender_entity_ids: Vec<EntityId>,
}

/// Result of building a simulation from a model.
pub struct BuiltSimulation {
    /// Entity registry with all entities.
    pub entities: EntityRegistry,
    /// Seeded context holding the start-up events.
    pub context: SimContext,
    /// Entity ID of the shared channel.
    pub channel: EntityId,
    /// Information about each node for display.
    pub node_infos: Vec<NodeInfo>,
    /// Simulated time from the scenario.
    pub duration: SimTime,
}

/// Build a simulation from a model.
///
/// The channel is entity 1, nodes follow in declaration order, then sinks
/// and traffic generators. Every node and sender is started on the returned
/// context, so its pending events are the run's initial events.
pub fn build_simulation(model: &Model, seed: u64) -> Result<BuiltSimulation, ModelError> {
    let mut entities = EntityRegistry::new();
    let mut context = SimContext::new(seed);

    let channel_id = EntityId::new(1);
    let node_ids: BTreeMap<&str, EntityId> = model
        .nodes
        .iter()
        .enumerate()
        .map(|(i, node)| (node.name.as_str(), EntityId::new(2 + i as u64)))
        .collect();
    let mut next_id = 2 + model.nodes.len() as u64;
    let mut allocate = || {
        let id = EntityId::new(next_id);
        next_id += 1;
        id
    };

    let lookup = |name: &str| {
        node_ids
            .get(name)
            .copied()
            .ok_or_else(|| ModelError::NodeNotFound(name.to_string()))
    };
    let address = |name: &str| {
        model
            .address_of(name)
            .ok_or_else(|| ModelError::NodeNotFound(name.to_string()))
    };

    let loss: Box<dyn PropagationLossModel> = match &model.propagation.loss {
        LossModelConfig::LogDistance(log) => Box::new(*log),
        LossModelConfig::Fixed(fixed) => {
            let mut matrix = FixedLoss::new(fixed.default_loss_db);
            for pair in &fixed.pairs {
                let (from, to) = (lookup(&pair.from)?, lookup(&pair.to)?);
                if pair.symmetric {
                    matrix.set_symmetric(from, to, pair.loss_db);
                } else {
                    matrix.set(from, to, pair.loss_db);
                }
            }
            Box::new(matrix)
        }
    };
    let delay: Box<dyn PropagationDelayModel> = match &model.propagation.delay {
        DelayModelConfig::ConstantSpeed(speed) => Box::new(*speed),
    };
    let mut channel = Channel::new(channel_id, loss, delay);

    let mut node_infos = Vec::with_capacity(model.nodes.len());
    for node_config in &model.nodes {
        let node_id = lookup(&node_config.name)?;
        let node_address = address(&node_config.name)?;
        channel.add_endpoint(node_id, node_config.position);

        let mut node = SpcNode::new(
            node_id,
            node_config.name.clone(),
            node_address,
            node_config.position,
            channel_id,
            node_config.phy.clone(),
            node_config.mac.clone(),
        );

        let sink_id = if node_config.sink.enabled {
            let id = allocate();
            node.set_app(id);
            entities.register(Box::new(PacketSink::new(
                id,
                &node_config.name,
                node_config.sink.port,
            )));
            Some(id)
        } else {
            None
        };

        let mut sender_ids = Vec::new();
        for traffic in &node_config.traffic {
            let id = allocate();
            match traffic {
                TrafficConfig::SpcSender(spc) => {
                    let [first, second] = [&spc.destinations[0], &spc.destinations[1]];
                    let config = SpcSenderConfig {
                        packet_size: spc.packet_size,
                        traffic_ratio: spc.traffic_ratio,
                        mean_interval_s: spc.mean_interval_s,
                        destination1: address(first)?,
                        destination2: address(second)?,
                        port: spc.port,
                        start_s: spc.start_s,
                        stop_s: spc.stop_s,
                    };
                    let mut sender = SpcSender::new(id, node_id, &node_config.name, config);
                    sender.start(&mut context);
                    entities.register(Box::new(sender));
                }
                TrafficConfig::OnOff(on_off) => {
                    let config = OnOffConfig {
                        data_rate_bps: on_off.data_rate_bps,
                        packet_size: on_off.packet_size,
                        destination: address(&on_off.destination)?,
                        port: on_off.port,
                        on_s: on_off.on_s,
                        off_s: on_off.off_s,
                        start_s: on_off.start_s,
                        stop_s: on_off.stop_s,
                    };
                    let mut sender = OnOffSender::new(id, node_id, &node_config.name, config);
                    sender.start(&mut context);
                    entities.register(Box::new(sender));
                }
            }
            sender_ids.push(id);
        }

        node.start(&mut context);
        entities.register(Box::new(node));
        debug!(
            node = %node_config.name,
            address = %node_address,
            entity = node_id.0,
            senders = sender_ids.len(),
            "node built"
        );

        node_infos.push(NodeInfo {
            name: node_config.name.clone(),
            address: node_address,
            position: node_config.position,
            node_entity_id: node_id,
            sink_entity_id: sink_id,
            sender_entity_ids: sender_ids,
        });
    }

    info!(
        nodes = node_infos.len(),
        entities = entities.len() + 1,
        "simulation built"
    );
    entities.register(Box::new(channel));

    Ok(BuiltSimulation {
        entities,
        context,
        channel: channel_id,
        node_infos,
        duration: SimTime::from_secs(model.simulation.duration_s),
    })
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use spcsim_common::EventPayload;

    const THREE_NODES: &str = r#"
simulation:
  seed: 7
  duration_s: 1.5
defaults:
  mac:
    rts_threshold: 500
nodes:
  - name: ap
    position: { x: 0.0, y: 0.0 }
    traffic:
      - type: spc_sender
        destinations: [near, far]
        packet_size: 3000
        mean_interval_s: 0.001
  - name: near
    position: { x: 10.0, y: 0.0 }
  - name: far
    position: { x: 60.0, y: 0.0 }
    mac:
      cw_min: 31
"#;

    #[test]
    fn test_load_and_layering() {
        let model = load_model_from_str(THREE_NODES).unwrap();
        assert_eq!(model.simulation().seed, 7);
        assert_eq!(model.nodes().len(), 3);

        let far = model.find_node("far").unwrap();
        assert_eq!(far.mac.cw_min, 31);
        assert_eq!(far.mac.rts_threshold, 500);
        assert_eq!(far.mac.cw_max, 1023);
        assert_eq!(far.phy, spcsim_phy::PhyConfig::default());
        assert!(far.sink.enabled);

        assert_eq!(model.address_of("ap"), Some(MacAddress::from_index(1)));
        assert_eq!(model.address_of("far"), Some(MacAddress::from_index(3)));
        assert_eq!(model.address_of(BROADCAST_NAME), Some(MacAddress::BROADCAST));
        assert_eq!(model.address_of("nobody"), None);
    }

    #[test]
    fn test_simulation_wide_values_apply_under_defaults() {
        let yaml = r#"
simulation:
  bandwidth_hz: 10000000
  measure_interval_ms: 50
defaults:
  mac:
    measure_interval_ms: 200
nodes:
  - name: a
"#;
        let model = load_model_from_str(yaml).unwrap();
        let a = model.find_node("a").unwrap();
        assert_eq!(a.mac.bandwidth_hz, 10_000_000);
        assert_eq!(a.mac.measure_interval_ms, 200);
    }

    #[test]
    fn test_merge_overrides_and_removes() {
        let overlay = r#"
simulation:
  duration_s: 3.0
propagation:
  loss:
    model: fixed
    default_loss_db: 90.0
    pairs:
      - { from: ap, to: far, loss_db: 120.0, symmetric: true }
nodes:
  - name: near
    remove: true
  - name: far
    position: { x: 100.0, y: 0.0 }
"#;
        let err = load_models_from_str(&[THREE_NODES, overlay]).unwrap_err();
        // The sender still targets the removed node.
        assert!(matches!(err, ModelError::NodeNotFound(ref n) if n == "near"), "{err}");

        let fix_sender = r#"
nodes:
  - name: ap
    traffic:
      - type: on_off
        destination: far
"#;
        let model = load_models_from_str(&[THREE_NODES, overlay, fix_sender]).unwrap();
        assert_eq!(model.simulation().seed, 7);
        assert_eq!(model.simulation().duration_s, 3.0);
        assert_eq!(model.nodes().len(), 2);
        let far = model.find_node("far").unwrap();
        assert_eq!(far.position.x, 100.0);
        assert_eq!(far.mac.cw_min, 31);
        assert!(matches!(model.propagation().loss, LossModelConfig::Fixed(_)));
        assert_eq!(model.address_of("far"), Some(MacAddress::from_index(2)));
    }

    #[test]
    fn test_unknown_fields_rejected() {
        assert!(matches!(
            load_model_from_str("simulaton:\n  seed: 1\n"),
            Err(ModelError::YamlError(_))
        ));
        let bad_mac = "nodes:\n  - name: a\n    mac:\n      cwmin: 3\n";
        assert!(matches!(
            load_model_from_str(bad_mac),
            Err(ModelError::InvalidNode { ref node, .. }) if node == "a"
        ));
    }

    #[test]
    fn test_validation_errors() {
        let one_dest = r#"
nodes:
  - name: a
    traffic:
      - type: spc_sender
        destinations: [b]
  - name: b
"#;
        assert!(matches!(load_model_from_str(one_dest), Err(ModelError::InvalidConfig(_))));

        let dup = "nodes:\n  - name: a\n  - name: a\n";
        assert!(matches!(load_model_from_str(dup), Err(ModelError::DuplicateNode(_))));

        let remove_missing = "nodes:\n  - name: a\n    remove: true\n";
        assert!(matches!(
            load_model_from_str(remove_missing),
            Err(ModelError::NodeNotFound(_))
        ));

        assert!(matches!(
            load_model_from_str("simulation:\n  duration_s: 0\n"),
            Err(ModelError::InvalidConfig(_))
        ));
        assert!(matches!(load_models_from_str(&[]), Err(ModelError::InvalidConfig(_))));
    }

    #[test]
    fn test_build_simulation_registers_entities() {
        let model = load_model_from_str(THREE_NODES).unwrap();
        let mut built = build_simulation(&model, 7).unwrap();

        // Channel, three nodes, three sinks, one sender.
        assert_eq!(built.entities.len(), 8);
        assert_eq!(built.duration, SimTime::from_millis(1500));
        assert_eq!(built.channel, EntityId::new(1));

        let ap = &built.node_infos[0];
        assert_eq!(ap.node_entity_id, EntityId::new(2));
        assert_eq!(ap.sender_entity_ids.len(), 1);
        assert!(ap.sink_entity_id.is_some());

        let pending = built.context.take_pending_events();
        let measures = pending
            .iter()
            .filter(|e| matches!(e.payload, EventPayload::Timer { .. }))
            .filter(|e| e.targets.iter().any(|t| (2..=4).contains(&t.0)))
            .count();
        assert_eq!(measures, 3);
        let sender_start = pending
            .iter()
            .filter(|e| e.targets == vec![ap.sender_entity_ids[0]])
            .count();
        assert_eq!(sender_start, 1);
    }

    #[test]
    fn test_default_scenario_yaml_round_trips() {
        let yaml = default_scenario_yaml().unwrap();
        assert!(yaml.contains("cw_max: 1023"));
        let model = load_model_from_str(&yaml).unwrap();
        assert!(model.nodes().is_empty());
        assert_eq!(model.simulation().duration_s, 10.0);
    }
}
