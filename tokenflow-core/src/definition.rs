use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::Result;
use jsonschema::Validator;
use petgraph::graphmap::DiGraphMap;
use petgraph::visit::Dfs;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::error::CoordinatorError;
use crate::outbound::ResourceCatalog;
use crate::types::{Node, NodeId, Transition, TransitionId, WorkflowDef};

/// A workflow definition checked, indexed and compiled for a run. Loaded
/// once per run on cold start; read-only afterwards.
#[derive(Debug)]
pub struct RunDefinition {
    def: WorkflowDef,
    node_index: BTreeMap<NodeId, usize>,
    transition_index: BTreeMap<TransitionId, usize>,
    /// Outbound transition indices per node, sorted by (priority, definition
    /// order) so routing tiers iterate without re-sorting.
    outbound: BTreeMap<NodeId, Vec<usize>>,
    input_validator: Option<Validator>,
    state_validator: Option<Validator>,
    output_validator: Option<Validator>,
}

impl RunDefinition {
    /// Index and structurally check a definition. Rejects duplicate ids,
    /// dangling transition endpoints, a missing initial node, and
    /// `spawn_count` combined with `foreach`. Nodes unreachable from the
    /// initial node are logged, not rejected.
    pub fn load(def: WorkflowDef) -> Result<Self, CoordinatorError> {
        let mut node_index = BTreeMap::new();
        for (i, node) in def.nodes.iter().enumerate() {
            if node_index.insert(node.id.clone(), i).is_some() {
                return Err(CoordinatorError::definition(format!(
                    "duplicate node id '{}'",
                    node.id
                )));
            }
        }
        if !node_index.contains_key(&def.initial_node_id) {
            return Err(CoordinatorError::definition(format!(
                "initial node '{}' is not defined",
                def.initial_node_id
            )));
        }

        let mut transition_index = BTreeMap::new();
        let mut outbound: BTreeMap<NodeId, Vec<usize>> = BTreeMap::new();
        for (i, transition) in def.transitions.iter().enumerate() {
            if transition_index
                .insert(transition.id.clone(), i)
                .is_some()
            {
                return Err(CoordinatorError::definition(format!(
                    "duplicate transition id '{}'",
                    transition.id
                )));
            }
            for endpoint in [&transition.from, &transition.to] {
                if !node_index.contains_key(endpoint) {
                    return Err(CoordinatorError::definition(format!(
                        "transition '{}' references unknown node '{endpoint}'",
                        transition.id
                    )));
                }
            }
            if transition.spawn_count.is_some() && transition.foreach.is_some() {
                return Err(CoordinatorError::definition(format!(
                    "transition '{}' sets both spawn_count and foreach",
                    transition.id
                )));
            }
            outbound
                .entry(transition.from.clone())
                .or_default()
                .push(i);
        }
        for indices in outbound.values_mut() {
            indices.sort_by_key(|&i| (def.transitions[i].priority, i));
        }

        let input_validator = compile_schema(def.input_schema.as_ref(), "input")?;
        let state_validator = compile_schema(def.state_schema.as_ref(), "state")?;
        let output_validator = compile_schema(def.output_schema.as_ref(), "output")?;

        let loaded = Self {
            def,
            node_index,
            transition_index,
            outbound,
            input_validator,
            state_validator,
            output_validator,
        };
        let orphans = loaded.unreachable_nodes();
        if !orphans.is_empty() {
            tracing::warn!(
                workflow_id = %loaded.def.id,
                ?orphans,
                "definition has nodes unreachable from the initial node"
            );
        }
        Ok(loaded)
    }

    pub fn def(&self) -> &WorkflowDef {
        &self.def
    }

    pub fn node(&self, id: &str) -> Result<&Node, CoordinatorError> {
        self.node_index
            .get(id)
            .map(|&i| &self.def.nodes[i])
            .ok_or_else(|| CoordinatorError::definition(format!("unknown node '{id}'")))
    }

    pub fn transition(&self, id: &str) -> Result<&Transition, CoordinatorError> {
        self.transition_index
            .get(id)
            .map(|&i| &self.def.transitions[i])
            .ok_or_else(|| CoordinatorError::definition(format!("unknown transition '{id}'")))
    }

    /// Outbound transitions of a node, highest priority first.
    pub fn outbound_transitions(&self, node_id: &str) -> Vec<&Transition> {
        self.outbound
            .get(node_id)
            .map(|indices| indices.iter().map(|&i| &self.def.transitions[i]).collect())
            .unwrap_or_default()
    }

    pub fn validate_input(&self, value: &Value) -> Result<(), CoordinatorError> {
        validate_with(self.input_validator.as_ref(), value, "input")
    }

    pub fn validate_state(&self, value: &Value) -> Result<(), CoordinatorError> {
        validate_with(self.state_validator.as_ref(), value, "state")
    }

    pub fn validate_output(&self, value: &Value) -> Result<(), CoordinatorError> {
        validate_with(self.output_validator.as_ref(), value, "output")
    }

    /// Nodes the initial node cannot reach through any transition.
    pub fn unreachable_nodes(&self) -> Vec<NodeId> {
        let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();
        for node in &self.def.nodes {
            graph.add_node(node.id.as_str());
        }
        for transition in &self.def.transitions {
            graph.add_edge(transition.from.as_str(), transition.to.as_str(), ());
        }
        let mut seen = std::collections::HashSet::new();
        let mut dfs = Dfs::new(&graph, self.def.initial_node_id.as_str());
        while let Some(node) = dfs.next(&graph) {
            seen.insert(node);
        }
        self.def
            .nodes
            .iter()
            .filter(|n| !seen.contains(n.id.as_str()))
            .map(|n| n.id.clone())
            .collect()
    }
}

fn compile_schema(
    schema: Option<&Value>,
    section: &str,
) -> Result<Option<Validator>, CoordinatorError> {
    match schema {
        None | Some(Value::Null) => Ok(None),
        Some(schema) => jsonschema::validator_for(schema)
            .map(Some)
            .map_err(|e| {
                CoordinatorError::definition(format!("invalid {section} schema: {e}"))
            }),
    }
}

fn validate_with(
    validator: Option<&Validator>,
    value: &Value,
    section: &str,
) -> Result<(), CoordinatorError> {
    if let Some(validator) = validator {
        if let Err(error) = validator.validate(value) {
            return Err(CoordinatorError::Validation(format!(
                "{section} does not match its schema: {error}"
            )));
        }
    }
    Ok(())
}

/// Process-wide definition cache: each `(id, version)` is fetched from the
/// resource catalog at most once and shared across runs.
pub struct DefinitionCache {
    catalog: Arc<dyn ResourceCatalog>,
    cached: RwLock<HashMap<(String, Option<String>), Arc<RunDefinition>>>,
}

impl DefinitionCache {
    pub fn new(catalog: Arc<dyn ResourceCatalog>) -> Self {
        Self {
            catalog,
            cached: RwLock::new(HashMap::new()),
        }
    }

    pub async fn get(
        &self,
        workflow_id: &str,
        version: Option<&str>,
    ) -> Result<Arc<RunDefinition>> {
        let key = (workflow_id.to_string(), version.map(str::to_string));
        if let Some(hit) = self.cached.read().await.get(&key) {
            return Ok(hit.clone());
        }
        let def = self.catalog.get_workflow_def(workflow_id, version).await?;
        let loaded = Arc::new(RunDefinition::load(def)?);
        self.cached.write().await.insert(key, loaded.clone());
        Ok(loaded)
    }
}
