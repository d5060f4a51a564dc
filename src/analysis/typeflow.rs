//! Type-flow cycle index.
//!
//! The [`TypeFlowIndex`] answers one question for the static-field analyzer: can a chain of
//! member accesses starting at a value of type `T` come back to `T`? Types form a directed
//! graph with an edge `A -> B` whenever an instance of `A` holds a reference of type `B`
//! (directly, or as the element type of an array or generic container). Strongly connected
//! components of that graph are the places where access chains can grow without bound.

use std::{collections::HashMap, fmt};

use serde::{Deserialize, Serialize};

use crate::{
    metadata::{Module, Token, TypeSig},
    utils::graph::{algorithms, DirectedGraph, NodeId},
    Result,
};

/// Identifier of a strongly connected component of the type-flow graph.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ComponentId(pub usize);

impl fmt::Display for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "scc{}", self.0)
    }
}

/// Type reference graph of a module reduced to its strongly connected components.
#[derive(Debug, Clone)]
pub struct TypeFlowIndex {
    /// Type -> component
    components: HashMap<Token, ComponentId>,
    /// Component -> member types, in token order
    members: Vec<Vec<Token>>,
    /// Component -> has a cycle
    recursive: Vec<bool>,
    /// Type -> base type, for lookups of types without fields of their own
    bases: HashMap<Token, Token>,
}

impl TypeFlowIndex {
    /// Builds the index over every type of `module`.
    ///
    /// # Errors
    /// Returns [`crate::Error::GraphError`] if the graph cannot be constructed.
    pub fn build(module: &Module) -> Result<Self> {
        let mut graph: DirectedGraph<Token, ()> = DirectedGraph::new();
        let mut nodes: HashMap<Token, NodeId> = HashMap::new();
        for ty in module.types() {
            nodes.insert(ty.token, graph.add_node(ty.token));
        }

        for field in module.fields() {
            if field.is_static() || field.is_literal() || field.sig.is_value_type() {
                continue;
            }
            let Some(&source) = nodes.get(&field.declaring_type) else {
                continue;
            };
            for target in referenced_types(&field.sig) {
                if let Some(&target) = nodes.get(&target) {
                    if !graph.has_edge(source, target) {
                        graph.add_edge(source, target, ())?;
                    }
                }
            }
        }

        let sccs = algorithms::strongly_connected_components(&graph);
        let mut components = HashMap::with_capacity(nodes.len());
        let mut members = Vec::with_capacity(sccs.len());
        let mut recursive = Vec::with_capacity(sccs.len());
        for (id, scc) in sccs.iter().enumerate() {
            let mut tokens: Vec<Token> = scc
                .iter()
                .filter_map(|node| graph.node(*node).copied())
                .collect();
            tokens.sort_unstable();
            for token in &tokens {
                components.insert(*token, ComponentId(id));
            }
            let cyclic = match scc.as_slice() {
                [single] => graph.has_edge(*single, *single),
                _ => true,
            };
            members.push(tokens);
            recursive.push(cyclic);
        }

        let bases = module
            .types()
            .filter_map(|ty| ty.base.map(|base| (ty.token, base)))
            .collect();

        let index = TypeFlowIndex {
            components,
            members,
            recursive,
            bases,
        };
        log::debug!(
            "type flow: {} types in {} components, {} recursive",
            nodes.len(),
            index.members.len(),
            index.recursive.iter().filter(|r| **r).count()
        );
        Ok(index)
    }

    /// The component of `ty`. Types unknown to the index are looked up through their base
    /// chain.
    #[must_use]
    pub fn component_of(&self, ty: Token) -> Option<ComponentId> {
        let mut current = ty;
        for _ in 0..=self.bases.len() {
            if let Some(component) = self.components.get(&current) {
                return Some(*component);
            }
            current = *self.bases.get(&current)?;
        }
        None
    }

    /// The component of the type a value of `sig` refers to.
    #[must_use]
    pub fn component_of_sig(&self, sig: &TypeSig) -> Option<ComponentId> {
        sig.type_token().and_then(|ty| self.component_of(ty))
    }

    /// Returns `true` if access chains can loop inside `component`.
    #[must_use]
    pub fn is_recursive(&self, component: ComponentId) -> bool {
        self.recursive.get(component.0).copied().unwrap_or(false)
    }

    /// Member types of `component`.
    #[must_use]
    pub fn members(&self, component: ComponentId) -> &[Token] {
        self.members.get(component.0).map_or(&[], Vec::as_slice)
    }

    /// Number of components.
    #[must_use]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Returns `true` if the module had no types.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// The type itself plus one hop through array / generic element types.
fn referenced_types(sig: &TypeSig) -> Vec<Token> {
    let mut types = Vec::new();
    if let Some(ty) = sig.type_token() {
        types.push(ty);
    }
    for element in sig.element_types() {
        if let Some(ty) = element.type_token() {
            if !types.contains(&ty) {
                types.push(ty);
            }
        }
    }
    types
}
