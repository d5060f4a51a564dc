//! Call graph construction and representation.
//!
//! This module provides the main [`CallGraph`] structure which represents the inter-procedural
//! call relationships of a [`Module`]. The call graph is constructed by scanning all method
//! bodies for call, construct and function-pointer instructions and resolving their targets
//! using the [`InheritanceGraph`] and the [`CallbackGraph`].
//!
//! The implementation leverages the generic [`DirectedGraph`] infrastructure from the
//! `utils::graph` module, providing access to standard graph algorithms.

use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

use rayon::prelude::*;

use crate::{
    analysis::{
        callgraph::{CallGraphNode, CallSite, CallTarget, CallType},
        CallbackGraph, DiagnosticKind, Diagnostics, InheritanceGraph, JumpSiteCache,
        JumpSiteMap,
    },
    assembly::{MethodBody, Opcode},
    metadata::{Intrinsic, Module, Token},
    utils::{
        graph::{
            algorithms::{self, strongly_connected_components},
            DirectedGraph, NodeId,
        },
        DotWriter,
    },
    Result,
};

/// Inter-procedural call graph for a module.
///
/// Every method of the module is a node, including runtime methods, so that calls into the
/// runtime stay visible. Edges are labelled with the [`CallType`] of the instruction that
/// created them; a site with several possible targets creates one edge per target.
///
/// # Example
///
/// ```rust,ignore
/// let call_graph = CallGraph::build(&module, &inheritance, &callbacks, &jumps, &diagnostics)?;
///
/// let stats = call_graph.stats();
/// println!("Methods: {}, Edges: {}", stats.method_count, stats.edge_count);
///
/// for callee in call_graph.callees(method_token) {
///     println!("Calls: {}", module.method_name(callee));
/// }
/// ```
#[derive(Debug)]
pub struct CallGraph {
    /// The underlying directed graph: nodes are methods, edges are call relationships.
    graph: DirectedGraph<CallGraphNode, CallType>,
    /// Map from method token to node ID in the graph for O(1) lookup.
    token_to_node: HashMap<Token, NodeId>,
    /// Strongly connected components (lazily computed on first access).
    sccs: OnceLock<Vec<Vec<NodeId>>>,
    /// Entry points - methods with no callers (lazily computed on first access).
    entry_points: OnceLock<Vec<Token>>,
}

impl CallGraph {
    /// Builds a call graph from a module.
    ///
    /// This method performs a two-pass construction:
    /// 1. First pass: Creates a node for each method in the module
    /// 2. Second pass: Extracts call sites from every body (in parallel) and creates edges
    ///
    /// Virtual calls are resolved to the override selected by the receiver when every
    /// receiver is constructed in the same method with a single type, and through Class
    /// Hierarchy Analysis otherwise. Callback invocations and asynchronous dispatch are
    /// resolved to the targets recorded in `callbacks`.
    ///
    /// # Errors
    ///
    /// Returns an error if a method body cannot be read.
    pub fn build(
        module: &Module,
        inheritance: &InheritanceGraph,
        callbacks: &CallbackGraph,
        jumps: &JumpSiteCache,
        diagnostics: &Diagnostics,
    ) -> Result<Self> {
        let method_count = module.methods().count();
        let mut graph: DirectedGraph<CallGraphNode, CallType> =
            DirectedGraph::with_capacity(method_count, method_count * 4);
        let mut token_to_node: HashMap<Token, NodeId> = HashMap::with_capacity(method_count);

        // First pass: add all methods as nodes
        for method in module.methods() {
            let mut node = CallGraphNode::new(module, method);
            node.overriders = inheritance.overriders(method.token);
            let node_id = graph.add_node(node);
            token_to_node.insert(method.token, node_id);
        }

        // Second pass: extract call sites in parallel
        let extractor = SiteExtractor {
            module,
            inheritance,
            callbacks,
            diagnostics,
        };
        let mut extracted = module
            .methods_with_body()
            .into_par_iter()
            .map(|method| {
                let map = jumps.get(module, method)?;
                let sites = extractor.extract(method, &map)?;
                Ok((method, sites))
            })
            .collect::<Result<Vec<_>>>()?;
        extracted.sort_by_key(|(method, _)| *method);

        // Third pass: edges, in deterministic order
        for (caller, call_sites) in extracted {
            let Some(&caller_node_id) = token_to_node.get(&caller) else {
                continue;
            };
            for site in &call_sites {
                for callee in site.target.all_targets() {
                    if let Some(&callee_node_id) = token_to_node.get(&callee) {
                        graph.add_edge(caller_node_id, callee_node_id, site.call_type)?;
                    }
                }
            }
            if let Some(node) = graph.node_mut(caller_node_id) {
                node.call_sites = call_sites;
            }
        }

        log::debug!(
            "call graph: {} methods, {} edges",
            graph.node_count(),
            graph.edge_count()
        );

        Ok(Self {
            graph,
            token_to_node,
            sccs: OnceLock::new(),
            entry_points: OnceLock::new(),
        })
    }

    /// Returns the number of methods in the call graph.
    #[must_use]
    pub fn method_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Returns the total number of call edges.
    ///
    /// Every (site, target) pair is one edge, so repeated calls between the same two methods
    /// produce parallel edges.
    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Returns a node by its method token.
    #[must_use]
    pub fn node(&self, token: Token) -> Option<&CallGraphNode> {
        self.token_to_node
            .get(&token)
            .and_then(|&node_id| self.graph.node(node_id))
    }

    /// Returns an iterator over all nodes in the call graph.
    pub fn nodes(&self) -> impl Iterator<Item = &CallGraphNode> {
        self.graph.nodes().map(|(_, node)| node)
    }

    /// Returns all method tokens that are called by the given method, without duplicates.
    #[must_use]
    pub fn callees(&self, caller: Token) -> Vec<Token> {
        let Some(&node_id) = self.token_to_node.get(&caller) else {
            return Vec::new();
        };
        let mut seen = HashSet::new();
        self.graph
            .successors(node_id)
            .filter(|callee_id| seen.insert(*callee_id))
            .filter_map(|callee_id| self.graph.node(callee_id).map(|n| n.token))
            .collect()
    }

    /// Returns all method tokens that call the given method, without duplicates.
    #[must_use]
    pub fn callers(&self, callee: Token) -> Vec<Token> {
        let Some(&node_id) = self.token_to_node.get(&callee) else {
            return Vec::new();
        };
        let mut seen = HashSet::new();
        self.graph
            .predecessors(node_id)
            .filter(|caller_id| seen.insert(*caller_id))
            .filter_map(|caller_id| self.graph.node(caller_id).map(|n| n.token))
            .collect()
    }

    /// Returns all call sites within a method.
    #[must_use]
    pub fn call_sites(&self, method: Token) -> &[CallSite] {
        self.node(method).map_or(&[], |n| n.call_sites.as_slice())
    }

    /// Returns the call site at instruction index `offset` of `method`.
    #[must_use]
    pub fn site_at(&self, method: Token, offset: usize) -> Option<&CallSite> {
        self.call_sites(method).iter().find(|s| s.offset == offset)
    }

    /// Every method reachable from `roots` through any call edge, roots included.
    #[must_use]
    pub fn reachable_from(&self, roots: &[Token]) -> Vec<Token> {
        let start = roots
            .iter()
            .filter_map(|root| self.token_to_node.get(root).copied());
        algorithms::reachable(&self.graph, start)
            .into_iter()
            .filter_map(|node_id| self.graph.node(node_id).map(|n| n.token))
            .collect()
    }

    /// Returns entry points (methods with a body and no callers within the module).
    #[must_use]
    pub fn entry_points(&self) -> &[Token] {
        self.entry_points.get_or_init(|| {
            self.graph
                .nodes()
                .filter(|(node_id, node)| {
                    node.has_body() && self.graph.predecessors(*node_id).next().is_none()
                })
                .map(|(_, node)| node.token)
                .collect()
        })
    }

    /// Returns the strongly connected components of the call graph.
    ///
    /// SCCs are returned in reverse topological order (callees first). The result is lazily
    /// computed and cached on first access.
    #[must_use]
    pub fn sccs(&self) -> &[Vec<NodeId>] {
        self.sccs
            .get_or_init(|| strongly_connected_components(&self.graph))
    }

    /// Returns statistics about the call graph.
    #[must_use]
    pub fn stats(&self) -> CallGraphStats {
        let mut stats = CallGraphStats {
            method_count: self.method_count(),
            edge_count: self.edge_count(),
            entry_points: self.entry_points().len(),
            scc_count: self.sccs().len(),
            ..CallGraphStats::default()
        };
        for site in self.nodes().flat_map(|n| n.call_sites.iter()) {
            stats.total_call_sites += 1;
            if site.is_resolved() {
                stats.resolved_calls += 1;
            }
            match site.target {
                CallTarget::Virtual { .. } => stats.virtual_calls += 1,
                CallTarget::Callback { .. } => stats.callback_calls += 1,
                _ => {}
            }
            if site.is_polymorphic() {
                stats.polymorphic_calls += 1;
            }
        }
        stats
    }

    /// Renders the call graph in DOT format.
    ///
    /// Virtual edges are dashed, callback edges dotted. Runtime methods without any edge are
    /// omitted.
    #[must_use]
    pub fn to_dot(&self, title: Option<&str>) -> String {
        let mut dot = DotWriter::new(title.unwrap_or("CallGraph"));
        for (node_id, node) in self.graph.nodes() {
            let connected = self.graph.successors(node_id).next().is_some()
                || self.graph.predecessors(node_id).next().is_some();
            if !node.has_body() && !connected {
                continue;
            }
            let style = if node.has_body() { "" } else { "style=dashed" };
            dot.node(&node_id.to_string(), &node.full_name, style);
        }
        for (node_id, node) in self.graph.nodes() {
            for site in &node.call_sites {
                let style = match site.target {
                    CallTarget::Virtual { .. } => "style=dashed",
                    CallTarget::Callback { .. } => "style=dotted",
                    _ => "",
                };
                for callee in site.target.all_targets() {
                    if let Some(callee_id) = self.token_to_node.get(&callee) {
                        dot.edge(&node_id.to_string(), &callee_id.to_string(), style);
                    }
                }
            }
        }
        dot.finish()
    }
}

/// Per-build call-site resolution context, shared across worker threads.
struct SiteExtractor<'a> {
    module: &'a Module,
    inheritance: &'a InheritanceGraph,
    callbacks: &'a CallbackGraph,
    diagnostics: &'a Diagnostics,
}

impl SiteExtractor<'_> {
    fn extract(&self, method: Token, map: &JumpSiteMap) -> Result<Vec<CallSite>> {
        let body = self.module.body(method)?;
        let mut sites = Vec::new();
        for (offset, instr) in body.instructions.iter().enumerate() {
            let call_type = match instr.opcode {
                Opcode::Call => CallType::Call,
                Opcode::Callvirt => CallType::CallVirt,
                Opcode::Newobj => CallType::NewObj,
                Opcode::Ldftn => CallType::Ldftn,
                Opcode::Ldvirtftn => CallType::LdVirtFtn,
                _ => continue,
            };
            let Some(token) = instr.token() else {
                continue;
            };
            let target = self.resolve(method, body, map, offset, call_type, token);
            sites.push(CallSite::new(offset, call_type, target));
        }
        Ok(sites)
    }

    fn resolve(
        &self,
        method: Token,
        body: &MethodBody,
        map: &JumpSiteMap,
        offset: usize,
        call_type: CallType,
        token: Token,
    ) -> CallTarget {
        let Ok(callee) = self.module.method(token) else {
            self.diagnostics.push(
                DiagnosticKind::UnresolvedReference,
                Some(method),
                Some(offset),
                format!(
                    "{} in {} references unknown method {}",
                    call_type,
                    self.module.method_name(method),
                    token
                ),
            );
            return CallTarget::Unresolved {
                token,
                reason: "method not found in module".to_string(),
            };
        };

        match (call_type, callee.intrinsic) {
            (CallType::CallVirt, Some(Intrinsic::DelegateInvoke)) => {
                return CallTarget::Callback {
                    via: token,
                    targets: self.callbacks.site_targets(method, offset),
                };
            }
            (CallType::Call | CallType::CallVirt, Some(intrinsic))
                if intrinsic.is_async_dispatch() =>
            {
                return CallTarget::Callback {
                    via: token,
                    targets: self.callbacks.site_targets(method, offset),
                };
            }
            (_, Some(_)) => return CallTarget::Resolved(token),
            _ => {}
        }

        let target = if call_type.is_virtual() && callee.is_virtual() {
            let receiver = (call_type == CallType::CallVirt)
                .then(|| self.receiver_type(body, map, offset))
                .flatten()
                .and_then(|ty| self.inheritance.resolve_for_receiver(self.module, token, ty));
            let possible_targets = match receiver {
                Some(found) => vec![found],
                None => self.inheritance.resolve_virtual(token),
            };
            CallTarget::Virtual {
                declared: token,
                possible_targets,
            }
        } else {
            CallTarget::Resolved(token)
        };

        let has_implementation = match &target {
            CallTarget::Virtual {
                possible_targets, ..
            } => !possible_targets.is_empty(),
            _ => callee.has_body(),
        };
        if !has_implementation && !callee.is_external() {
            self.diagnostics.push(
                DiagnosticKind::MissingImplementation,
                Some(method),
                Some(offset),
                format!(
                    "{} of {} in {} has no implementation",
                    call_type,
                    self.module.method_name(token),
                    self.module.method_name(method)
                ),
            );
        }
        target
    }

    /// The single runtime type of the receiver of the call at `offset`, when every value that
    /// can reach it is constructed by `newobj` of that type.
    fn receiver_type(&self, body: &MethodBody, map: &JumpSiteMap, offset: usize) -> Option<Token> {
        let producers = map.operand_producers(body, offset, 0);
        let mut receiver = None;
        for producer in producers {
            let instr = body.get(producer)?;
            if instr.opcode != Opcode::Newobj {
                return None;
            }
            let ty = self.module.method(instr.token()?).ok()?.declaring_type;
            match receiver {
                None => receiver = Some(ty),
                Some(seen) if seen == ty => {}
                Some(_) => return None,
            }
        }
        receiver
    }
}

/// Statistics about a call graph.
#[derive(Debug, Clone, Default)]
pub struct CallGraphStats {
    /// Total number of methods in the graph.
    pub method_count: usize,
    /// Total number of call edges.
    pub edge_count: usize,
    /// Total number of call sites across all methods.
    pub total_call_sites: usize,
    /// Number of virtual call sites.
    pub virtual_calls: usize,
    /// Number of callback invocation and asynchronous dispatch sites.
    pub callback_calls: usize,
    /// Number of call sites with a resolved target.
    pub resolved_calls: usize,
    /// Number of call sites with multiple possible targets.
    pub polymorphic_calls: usize,
    /// Number of entry points (methods with no callers).
    pub entry_points: usize,
    /// Number of strongly connected components.
    pub scc_count: usize,
}

impl CallGraphStats {
    /// Returns the resolution rate (resolved calls / total calls).
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn resolution_rate(&self) -> f64 {
        if self.total_call_sites == 0 {
            1.0
        } else {
            self.resolved_calls as f64 / self.total_call_sites as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        analysis::CallKind,
        assembly::InstructionAssembler,
        metadata::{MethodModifiers, ModuleBuilder, TypeAttributes, TypeSig},
    };

    fn build(module: &Module) -> (CallGraph, Diagnostics) {
        let inheritance = InheritanceGraph::new(module);
        let jumps = JumpSiteCache::new();
        let diagnostics = Diagnostics::new();
        let callbacks =
            CallbackGraph::build(module, &inheritance, &jumps, &diagnostics, 16).unwrap();
        let graph =
            CallGraph::build(module, &inheritance, &callbacks, &jumps, &diagnostics).unwrap();
        (graph, diagnostics)
    }

    #[test]
    fn test_call_graph_stats_resolution_rate() {
        let stats = CallGraphStats {
            total_call_sites: 100,
            resolved_calls: 75,
            ..Default::default()
        };
        assert!((stats.resolution_rate() - 0.75).abs() < f64::EPSILON);

        let empty = CallGraphStats::default();
        assert!((empty.resolution_rate() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_direct_calls_and_recursion() {
        let mut builder = ModuleBuilder::new("Calls").unwrap();
        let program = builder.static_class("Game", "Program");
        let leaf = builder
            .method(program, "Leaf")
            .flags(MethodModifiers::STATIC)
            .implementation(|asm| {
                asm.ret()?;
                Ok(())
            })
            .build()
            .unwrap();
        let walk = builder
            .method(program, "Walk")
            .flags(MethodModifiers::STATIC)
            .param("depth", TypeSig::I4)
            .build()
            .unwrap();
        let mut asm = InstructionAssembler::new();
        asm.ldarg(0)
            .unwrap()
            .brfalse("done")
            .unwrap()
            .ldarg(0)
            .unwrap()
            .ldc_i4(1)
            .unwrap()
            .sub()
            .unwrap()
            .call(walk)
            .unwrap()
            .label("done")
            .unwrap()
            .call(leaf)
            .unwrap()
            .ret()
            .unwrap();
        builder.module_mut().method_mut(walk).unwrap().body =
            Some(MethodBody::new(asm.finalize().unwrap(), Vec::new()));
        let main = builder
            .method(program, "Main")
            .flags(MethodModifiers::STATIC)
            .implementation(move |asm| {
                asm.ldc_i4(3)?.call(walk)?.ret()?;
                Ok(())
            })
            .build()
            .unwrap();
        let module = builder.build();

        let (graph, diagnostics) = build(&module);
        assert_eq!(graph.callees(main), vec![walk]);
        assert_eq!(graph.callers(leaf), vec![walk]);
        assert!(graph.site_at(walk, 5).is_some());
        assert!(graph.callees(walk).contains(&walk));
        assert!(graph.entry_points().contains(&main));
        assert!(graph.callees(leaf).is_empty());

        let reachable = graph.reachable_from(&[main]);
        assert!(reachable.contains(&leaf));
        assert!(reachable.contains(&walk));
        assert!(diagnostics.is_empty());

        let stats = graph.stats();
        assert_eq!(stats.total_call_sites, 3);
        assert_eq!(stats.resolved_calls, 3);
        assert!(graph.to_dot(Some("calls")).contains("Game.Program::Walk"));
    }

    #[test]
    fn test_virtual_call_prefers_receiver_type() {
        let mut builder = ModuleBuilder::new("Shapes").unwrap();
        let shape = builder.class("Shapes", "Shape");
        let circle = builder.add_type("Shapes", "Circle", TypeAttributes::empty(), Some(shape));
        let square = builder.add_type("Shapes", "Square", TypeAttributes::empty(), Some(shape));
        let virtual_area = |builder: &mut ModuleBuilder, ty: Token, base: Option<Token>| {
            let mut method = builder
                .method(ty, "Area")
                .flags(MethodModifiers::VIRTUAL)
                .returns(TypeSig::I4)
                .implementation(|asm| {
                    asm.ldc_i4(1)?.ret()?;
                    Ok(())
                });
            if let Some(base) = base {
                method = method.overrides(base);
            }
            method.build().unwrap()
        };
        let base_area = virtual_area(&mut builder, shape, None);
        let circle_area = virtual_area(&mut builder, circle, Some(base_area));
        let square_area = virtual_area(&mut builder, square, Some(base_area));
        let circle_ctor = builder.default_constructor(circle).unwrap();
        builder.default_constructor(square).unwrap();

        let program = builder.static_class("Shapes", "Program");
        let exact = builder
            .method(program, "Exact")
            .flags(MethodModifiers::STATIC)
            .returns(TypeSig::I4)
            .implementation(move |asm| {
                asm.newobj(circle_ctor)?.callvirt(base_area)?.ret()?;
                Ok(())
            })
            .build()
            .unwrap();
        let open = builder
            .method(program, "Open")
            .flags(MethodModifiers::STATIC)
            .param("shape", TypeSig::Class(shape))
            .returns(TypeSig::I4)
            .implementation(move |asm| {
                asm.ldarg(0)?.callvirt(base_area)?.ret()?;
                Ok(())
            })
            .build()
            .unwrap();
        let module = builder.build();

        let (graph, _) = build(&module);
        let site = graph.site_at(exact, 1).unwrap();
        assert_eq!(site.kind(), CallKind::Virtual);
        assert_eq!(site.target.all_targets(), vec![circle_area]);
        assert_eq!(site.target.primary_token(), base_area);

        let site = graph.site_at(open, 1).unwrap();
        assert!(site.is_polymorphic());
        let targets = site.target.all_targets();
        assert!(targets.contains(&base_area));
        assert!(targets.contains(&circle_area));
        assert!(targets.contains(&square_area));
    }

    #[test]
    fn test_missing_implementation_is_reported() {
        let mut builder = ModuleBuilder::new("Missing").unwrap();
        let program = builder.static_class("Game", "Program");
        let hollow = builder
            .method(program, "Hollow")
            .flags(MethodModifiers::STATIC)
            .build()
            .unwrap();
        builder
            .method(program, "Main")
            .flags(MethodModifiers::STATIC)
            .implementation(move |asm| {
                asm.call(hollow)?.ret()?;
                Ok(())
            })
            .build()
            .unwrap();
        let module = builder.build();

        let (_, diagnostics) = build(&module);
        assert_eq!(diagnostics.count(DiagnosticKind::MissingImplementation), 1);
    }
}
