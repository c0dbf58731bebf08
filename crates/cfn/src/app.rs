//! The set of stacks and the ordering constraints between them.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use tracing::{debug, info};

use crate::assembly::{ArtifactManifest, ArtifactProperties, CloudAssembly, Manifest, MANIFEST_VERSION};
use crate::error::CfnError;
use crate::stack::{Output, Stack};

/// `consumer` must be deployed after `producer`. Both are artifact ids.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct DependencyEdge {
    pub consumer: String,
    pub producer: String,
}

/// All stacks of one synthesis pass.
#[derive(Debug, Clone, Default)]
pub struct App {
    stacks: Vec<Stack>,
    explicit: BTreeSet<DependencyEdge>,
}

impl App {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a stack. Stacks keep their insertion order.
    ///
    /// # Errors
    ///
    /// Returns an error if a stack with the same id or name already exists.
    pub fn add_stack(&mut self, stack: Stack) -> Result<(), CfnError> {
        if let Some(existing) = self
            .stacks
            .iter()
            .find(|s| s.id() == stack.id() || s.name() == stack.name())
        {
            return Err(CfnError::DuplicateStack(existing.id().to_string()));
        }
        self.stacks.push(stack);
        Ok(())
    }

    #[must_use]
    pub fn stacks(&self) -> &[Stack] {
        &self.stacks
    }

    /// Look up a stack by artifact id.
    #[must_use]
    pub fn stack(&self, id: &str) -> Option<&Stack> {
        self.stacks.iter().find(|s| s.id() == id)
    }

    /// Mutable lookup by artifact id.
    pub fn stack_mut(&mut self, id: &str) -> Option<&mut Stack> {
        self.stacks.iter_mut().find(|s| s.id() == id)
    }

    fn id_for_name(&self, name: &str) -> Option<&str> {
        self.stacks
            .iter()
            .find(|s| s.name() == name)
            .map(Stack::id)
    }

    /// Declare that `consumer` deploys after `producer`.
    ///
    /// # Errors
    ///
    /// Returns an error if either stack is unknown or both are the same.
    pub fn add_dependency(&mut self, consumer: &str, producer: &str) -> Result<(), CfnError> {
        for id in [consumer, producer] {
            if self.stack(id).is_none() {
                return Err(CfnError::UnknownStack(id.to_string()));
            }
        }
        if consumer == producer {
            return Err(CfnError::SelfDependency(consumer.to_string()));
        }
        debug!(consumer, producer, "Adding stack dependency");
        self.explicit.insert(DependencyEdge {
            consumer: consumer.to_string(),
            producer: producer.to_string(),
        });
        Ok(())
    }

    /// Explicit edges plus the edges implied by cross-stack imports.
    ///
    /// # Errors
    ///
    /// Returns an error if a stack imports from a stack that is not in the app.
    pub fn dependencies(&self) -> Result<BTreeSet<DependencyEdge>, CfnError> {
        let mut edges = self.explicit.clone();
        for stack in &self.stacks {
            for token in stack.imports().values() {
                let owner = token.stack().unwrap_or_default();
                let producer = self
                    .id_for_name(owner)
                    .ok_or_else(|| CfnError::UnknownStack(owner.to_string()))?;
                edges.insert(DependencyEdge {
                    consumer: stack.id().to_string(),
                    producer: producer.to_string(),
                });
            }
        }
        Ok(edges)
    }

    /// Artifact ids in an order that honours every dependency edge.
    ///
    /// Stacks that become ready at the same time keep their insertion order.
    ///
    /// # Errors
    ///
    /// Returns an error if the edges contain a cycle.
    pub fn deployment_order(&self) -> Result<Vec<String>, CfnError> {
        let edges = self.dependencies()?;
        self.order_for(&edges)
    }

    fn order_for(&self, edges: &BTreeSet<DependencyEdge>) -> Result<Vec<String>, CfnError> {
        let mut pending: BTreeMap<&str, BTreeSet<&str>> = self
            .stacks
            .iter()
            .map(|s| (s.id(), BTreeSet::new()))
            .collect();
        for edge in edges {
            if let Some(producers) = pending.get_mut(edge.consumer.as_str()) {
                producers.insert(edge.producer.as_str());
            }
        }

        let mut order: Vec<String> = Vec::with_capacity(self.stacks.len());
        while order.len() < self.stacks.len() {
            let ready: Vec<&str> = self
                .stacks
                .iter()
                .map(Stack::id)
                .filter(|id| !order.iter().any(|done| done.as_str() == *id))
                .filter(|id| pending.get(id).is_some_and(BTreeSet::is_empty))
                .collect();

            if ready.is_empty() {
                let stuck = self
                    .stacks
                    .iter()
                    .map(Stack::id)
                    .filter(|id| !order.iter().any(|done| done.as_str() == *id))
                    .map(String::from)
                    .collect();
                return Err(CfnError::DependencyCycle(stuck));
            }

            for id in ready {
                for producers in pending.values_mut() {
                    producers.remove(id);
                }
                order.push(id.to_string());
            }
        }
        Ok(order)
    }

    /// Render every stack into a cloud assembly.
    ///
    /// Cross-stack imports are turned into exports on their owning stack,
    /// the dependency graph is checked for cycles, and each stack's manifest
    /// entry lists the stacks it must wait for.
    ///
    /// # Errors
    ///
    /// Returns an error if an import names an unknown stack, an export id
    /// collides with an existing logical id, or the graph has a cycle.
    pub fn synth(&self) -> Result<CloudAssembly, CfnError> {
        let edges = self.dependencies()?;
        let deployment_order = self.order_for(&edges)?;

        let mut stacks = self.stacks.clone();
        let mut exports: BTreeMap<String, BTreeMap<String, Output>> = BTreeMap::new();
        for stack in &self.stacks {
            for (export_name, token) in stack.imports() {
                let (Some(owner), Some(output_id)) = (token.stack(), token.output_id()) else {
                    continue;
                };
                exports.entry(owner.to_string()).or_default().insert(
                    output_id,
                    Output::new(token.local_expr()).exported_as(export_name.clone()),
                );
            }
        }
        for stack in &mut stacks {
            if let Some(outputs) = exports.remove(stack.name()) {
                for (output_id, output) in outputs {
                    stack.add_output(output_id, output)?;
                }
            }
        }
        if let Some(owner) = exports.keys().next() {
            return Err(CfnError::UnknownStack(owner.clone()));
        }

        let mut artifacts = BTreeMap::new();
        let mut templates = BTreeMap::new();
        for stack in &stacks {
            let dependencies = edges
                .iter()
                .filter(|e| e.consumer == stack.id())
                .map(|e| e.producer.clone())
                .collect();
            artifacts.insert(
                stack.id().to_string(),
                ArtifactManifest {
                    artifact_type: "aws:cloudformation:stack".into(),
                    environment: stack.env().uri(),
                    properties: ArtifactProperties {
                        template_file: CloudAssembly::template_file_name(stack.id()),
                        stack_name: stack.name().to_string(),
                    },
                    dependencies,
                },
            );
            templates.insert(stack.id().to_string(), stack.to_template()?);
        }

        info!(
            "Synthesized {} stack(s): {}",
            stacks.len(),
            deployment_order.join(" -> ")
        );

        Ok(CloudAssembly {
            manifest: Manifest {
                version: MANIFEST_VERSION.to_string(),
                artifacts,
            },
            templates,
            deployment_order,
        })
    }
}
