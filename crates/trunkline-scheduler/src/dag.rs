//! DAG resolution for pipeline stages.

use petgraph::Direction;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::HashMap;
use trunkline_core::ConfigError;
use trunkline_core::pipeline::{PipelineDefinition, StageDefinition};

/// Directed acyclic graph of stage dependencies.
#[derive(Debug)]
pub struct PipelineDag {
    graph: DiGraph<StageDefinition, ()>,
    name_to_index: HashMap<String, NodeIndex>,
    order: Vec<NodeIndex>,
}

impl PipelineDag {
    /// Stages with no dependencies.
    pub fn roots(&self) -> Vec<&StageDefinition> {
        self.order
            .iter()
            .filter(|&&idx| {
                self.graph
                    .neighbors_directed(idx, Direction::Incoming)
                    .next()
                    .is_none()
            })
            .map(|&idx| &self.graph[idx])
            .collect()
    }

    /// Stages that list `stage_name` as a dependency.
    pub fn successors(&self, stage_name: &str) -> Vec<&StageDefinition> {
        self.neighbors(stage_name, Direction::Outgoing)
    }

    /// Stages `stage_name` depends on.
    pub fn predecessors(&self, stage_name: &str) -> Vec<&StageDefinition> {
        self.neighbors(stage_name, Direction::Incoming)
    }

    fn neighbors(&self, stage_name: &str, direction: Direction) -> Vec<&StageDefinition> {
        self.name_to_index
            .get(stage_name)
            .map(|&idx| {
                self.graph
                    .neighbors_directed(idx, direction)
                    .map(|n| &self.graph[n])
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Stages in a dependency-respecting order, stable for a given
    /// declaration.
    pub fn topological_order(&self) -> Vec<&StageDefinition> {
        self.order.iter().map(|&idx| &self.graph[idx]).collect()
    }

    pub fn stage(&self, name: &str) -> Option<&StageDefinition> {
        self.name_to_index.get(name).map(|&idx| &self.graph[idx])
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }
}

/// Builder for constructing pipeline DAGs.
pub struct DagBuilder;

impl DagBuilder {
    pub fn new() -> Self {
        Self
    }

    /// Build and validate a DAG from a pipeline definition.
    pub fn build(&self, pipeline: &PipelineDefinition) -> Result<PipelineDag, ConfigError> {
        if pipeline.stages.is_empty() {
            return Err(ConfigError::EmptyPipeline);
        }

        let mut graph = DiGraph::new();
        let mut name_to_index = HashMap::new();

        for stage in &pipeline.stages {
            if name_to_index.contains_key(&stage.name) {
                return Err(ConfigError::DuplicateStage(stage.name.clone()));
            }
            let idx = graph.add_node(stage.clone());
            name_to_index.insert(stage.name.clone(), idx);
        }

        for stage in &pipeline.stages {
            let stage_idx = name_to_index[&stage.name];
            for dep in &stage.depends_on {
                let dep_idx =
                    name_to_index
                        .get(dep)
                        .ok_or_else(|| ConfigError::UnknownDependency {
                            stage: stage.name.clone(),
                            dependency: dep.clone(),
                        })?;
                graph.add_edge(*dep_idx, stage_idx, ());
            }
        }

        let order = toposort(&graph, None)
            .map_err(|cycle| ConfigError::CyclicDependency(graph[cycle.node_id()].name.clone()))?;

        Ok(PipelineDag {
            graph,
            name_to_index,
            order,
        })
    }
}

impl Default for DagBuilder {
    fn default() -> Self {
        Self::new()
    }
}
