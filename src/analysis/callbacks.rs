//! Callback invocation graph.
//!
//! Callback values (delegates) are created from a function pointer and later stored, passed
//! around, combined, and finally invoked or handed to an asynchronous dispatch primitive. The
//! [`CallbackGraph`] tracks which concrete methods each storage location can point to, so that
//! the call graph can treat a callback invocation as a call to those methods.
//!
//! # Records and aliasing
//!
//! Every location a callback value can live in is a [`CallbackKey`]: a field, a parameter or
//! local of a method, a method's return value, or an invoke / dispatch site. Each key owns a
//! record in a union-find arena. When one location is assigned from another the two records are
//! merged and from then on share a single target set; anything added later through either key
//! is visible through both.
//!
//! # Fixed point
//!
//! Every method body is scanned once up front. Scanning only adds targets or merges records, so
//! sets grow monotonically. The only scan result that depends on record contents is the flow of
//! callback arguments through an invoke site into the invoked targets' parameters; methods
//! containing such sites are re-scanned when the site's record changes.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::{
    analysis::{DiagnosticKind, Diagnostics, InheritanceGraph, JumpSiteCache, JumpSiteMap},
    assembly::{MethodBody, Opcode},
    metadata::{Intrinsic, MethodDef, Module, Token},
    Result,
};

/// A location that can hold a callback value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CallbackKey {
    /// A field, static or instance
    Field(Token),
    /// An argument slot of a method (`this` is argument 0 of instance methods)
    Param {
        /// Owning method
        method: Token,
        /// Argument index
        index: u16,
    },
    /// A local variable of a method
    Local {
        /// Owning method
        method: Token,
        /// Local slot
        index: u16,
    },
    /// The return value of a method
    Return(Token),
    /// The callback consumed by an invoke or asynchronous dispatch instruction
    Site {
        /// Method containing the instruction
        method: Token,
        /// Instruction index
        offset: usize,
    },
}

/// Statistics of a [`CallbackGraph`] run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallbackGraphStats {
    /// Method bodies scanned, including re-scans
    pub scans: usize,
    /// Distinct keys with a record
    pub records: usize,
    /// Distinct target sets after merging
    pub sets: usize,
    /// Sum of target set sizes over distinct sets
    pub targets: usize,
    /// `false` if the iteration bound stopped the fixed point
    pub converged: bool,
}

/// Where a callback value on the stack can come from.
#[derive(Debug, Default)]
struct ValueSources {
    targets: BTreeSet<Token>,
    aliases: BTreeSet<CallbackKey>,
    unresolved: bool,
}

/// Union-find arena of callback records.
#[derive(Debug, Clone, Default)]
pub struct CallbackGraph {
    index: HashMap<CallbackKey, usize>,
    keys: Vec<CallbackKey>,
    parent: Vec<usize>,
    /// Target set, valid at roots
    targets: Vec<BTreeSet<Token>>,
    /// Records merged into a root, valid at roots
    members: Vec<Vec<usize>>,
    /// Methods to re-scan when the record changes
    watchers: HashMap<usize, BTreeSet<Token>>,
    stats: CallbackGraphStats,
}

impl CallbackGraph {
    /// Creates an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs the fixed point over every method body of `module`.
    ///
    /// `max_iterations` bounds the number of full passes over the module; reaching it records
    /// an [`DiagnosticKind::IterationLimit`] diagnostic and returns the partial result.
    ///
    /// # Errors
    /// Returns an error if a method body referenced by the module cannot be read.
    pub fn build(
        module: &Module,
        inheritance: &InheritanceGraph,
        jumps: &JumpSiteCache,
        diagnostics: &Diagnostics,
        max_iterations: usize,
    ) -> Result<Self> {
        let mut graph = CallbackGraph::new();
        let methods = module.methods_with_body();
        let budget = max_iterations.saturating_mul(methods.len().max(1));

        let mut queue: VecDeque<Token> = methods.iter().copied().collect();
        let mut queued: HashSet<Token> = methods.iter().copied().collect();
        let mut reported = HashSet::new();
        let mut scanner = Scanner {
            module,
            inheritance,
            diagnostics,
            reported: &mut reported,
        };

        graph.stats.converged = true;
        while let Some(method) = queue.pop_front() {
            queued.remove(&method);
            if graph.stats.scans >= budget {
                graph.stats.converged = false;
                diagnostics.push(
                    DiagnosticKind::IterationLimit,
                    Some(method),
                    None,
                    format!("callback fixed point stopped after {} scans", graph.stats.scans),
                );
                break;
            }
            graph.stats.scans += 1;

            let map = jumps.get(module, method)?;
            let mut changed = Vec::new();
            scanner.scan(&mut graph, method, &map, &mut changed)?;

            for root in changed {
                for rescan in graph.watchers_of(root) {
                    if queued.insert(rescan) {
                        queue.push_back(rescan);
                    }
                }
            }
        }

        graph.stats.records = graph.keys.len();
        let roots: Vec<usize> = (0..graph.parent.len())
            .filter(|n| graph.parent[*n] == *n)
            .collect();
        graph.stats.sets = roots.len();
        graph.stats.targets = roots.iter().map(|r| graph.targets[*r].len()).sum();
        log::debug!(
            "callback graph: {} records in {} sets after {} scans",
            graph.stats.records,
            graph.stats.sets,
            graph.stats.scans
        );
        Ok(graph)
    }

    /// The record of `key`, creating it on first use.
    pub fn node(&mut self, key: CallbackKey) -> usize {
        if let Some(node) = self.index.get(&key) {
            return *node;
        }
        let node = self.keys.len();
        self.index.insert(key, node);
        self.keys.push(key);
        self.parent.push(node);
        self.targets.push(BTreeSet::new());
        self.members.push(vec![node]);
        node
    }

    fn find(&self, mut node: usize) -> usize {
        while self.parent[node] != node {
            node = self.parent[node];
        }
        node
    }

    /// Merges the records of two nodes. Returns the surviving root if either target set grew.
    pub fn union(&mut self, a: usize, b: usize) -> Option<usize> {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb {
            return None;
        }
        let (root, child) = if self.members[ra].len() >= self.members[rb].len() {
            (ra, rb)
        } else {
            (rb, ra)
        };
        let before_root = self.targets[root].len();
        let before_child = self.targets[child].len();

        let moved_targets = std::mem::take(&mut self.targets[child]);
        self.targets[root].extend(moved_targets);
        let moved_members = std::mem::take(&mut self.members[child]);
        self.members[root].extend(moved_members);
        self.parent[child] = root;

        let after = self.targets[root].len();
        (after != before_root || after != before_child).then_some(root)
    }

    /// Adds targets to the record of `node`. Returns the root if its set grew.
    pub fn add_targets(&mut self, node: usize, targets: &BTreeSet<Token>) -> Option<usize> {
        let root = self.find(node);
        let before = self.targets[root].len();
        self.targets[root].extend(targets.iter().copied());
        (self.targets[root].len() != before).then_some(root)
    }

    fn watch(&mut self, node: usize, method: Token) {
        self.watchers.entry(node).or_default().insert(method);
    }

    fn watchers_of(&self, root: usize) -> BTreeSet<Token> {
        self.members[root]
            .iter()
            .filter_map(|member| self.watchers.get(member))
            .flatten()
            .copied()
            .collect()
    }

    fn node_targets(&self, node: usize) -> &BTreeSet<Token> {
        &self.targets[self.find(node)]
    }

    /// Methods the callback stored at `key` can invoke.
    #[must_use]
    pub fn targets(&self, key: &CallbackKey) -> Vec<Token> {
        self.index
            .get(key)
            .map(|node| self.node_targets(*node).iter().copied().collect())
            .unwrap_or_default()
    }

    /// Methods the callback consumed by the instruction at `offset` of `method` can invoke.
    #[must_use]
    pub fn site_targets(&self, method: Token, offset: usize) -> Vec<Token> {
        self.targets(&CallbackKey::Site { method, offset })
    }

    /// Returns `true` if both keys share one record.
    #[must_use]
    pub fn are_aliases(&self, a: &CallbackKey, b: &CallbackKey) -> bool {
        match (self.index.get(a), self.index.get(b)) {
            (Some(x), Some(y)) => self.find(*x) == self.find(*y),
            _ => false,
        }
    }

    /// Every key that has a record.
    pub fn keys(&self) -> impl Iterator<Item = &CallbackKey> {
        self.keys.iter()
    }

    /// Statistics of the run that built this graph.
    #[must_use]
    pub fn stats(&self) -> &CallbackGraphStats {
        &self.stats
    }
}

/// Per-run scanning context.
struct Scanner<'a, 'r> {
    module: &'a Module,
    inheritance: &'a InheritanceGraph,
    diagnostics: &'a Diagnostics,
    reported: &'r mut HashSet<(Token, usize)>,
}

impl Scanner<'_, '_> {
    fn scan(
        &mut self,
        graph: &mut CallbackGraph,
        method: Token,
        map: &JumpSiteMap,
        changed: &mut Vec<usize>,
    ) -> Result<()> {
        let module = self.module;
        let def = module.method(method)?;
        let body = module.body(method)?;

        for (index, instr) in body.instructions.iter().enumerate() {
            match instr.opcode {
                Opcode::Stsfld | Opcode::Stfld => {
                    let Some(field) = instr.token().and_then(|t| module.field(t).ok()) else {
                        continue;
                    };
                    if module.is_callback_sig(&field.sig) {
                        let operand = usize::from(instr.opcode == Opcode::Stfld);
                        let key = CallbackKey::Field(field.token);
                        self.sink(graph, key, method, body, map, index, operand, changed);
                    }
                }
                Opcode::Stloc => {
                    let Some(local) = instr.local_index() else {
                        continue;
                    };
                    if body
                        .locals
                        .get(usize::from(local))
                        .is_some_and(|sig| module.is_callback_sig(sig))
                    {
                        let key = CallbackKey::Local {
                            method,
                            index: local,
                        };
                        self.sink(graph, key, method, body, map, index, 0, changed);
                    }
                }
                Opcode::Starg => {
                    let Some(arg) = instr.arg_index() else {
                        continue;
                    };
                    if def
                        .arg_sig(usize::from(arg))
                        .is_some_and(|sig| module.is_callback_sig(&sig))
                    {
                        let key = CallbackKey::Param { method, index: arg };
                        self.sink(graph, key, method, body, map, index, 0, changed);
                    }
                }
                Opcode::Ret if module.is_callback_sig(&def.return_type) => {
                    let key = CallbackKey::Return(method);
                    self.sink(graph, key, method, body, map, index, 0, changed);
                }
                Opcode::Call | Opcode::Callvirt | Opcode::Newobj => {
                    let Some(callee) = instr.token().and_then(|t| module.method(t).ok()) else {
                        continue;
                    };
                    self.scan_call(graph, method, body, map, index, callee, changed);
                }
                _ => {}
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn scan_call(
        &mut self,
        graph: &mut CallbackGraph,
        method: Token,
        body: &MethodBody,
        map: &JumpSiteMap,
        index: usize,
        callee: &MethodDef,
        changed: &mut Vec<usize>,
    ) {
        let module = self.module;
        let site = CallbackKey::Site {
            method,
            offset: index,
        };
        match callee.intrinsic {
            Some(Intrinsic::DelegateInvoke) => {
                self.sink(graph, site, method, body, map, index, 0, changed);
                let site_node = graph.node(site);
                graph.watch(site_node, method);

                let invoked: Vec<Token> = graph.node_targets(site_node).iter().copied().collect();
                for (j, param) in callee.params.iter().enumerate() {
                    if !module.is_callback_sig(&param.sig) {
                        continue;
                    }
                    for target in &invoked {
                        let Ok(target_def) = module.method(*target) else {
                            continue;
                        };
                        let Ok(arg) = u16::try_from(j + target_def.param_offset()) else {
                            continue;
                        };
                        let key = CallbackKey::Param {
                            method: *target,
                            index: arg,
                        };
                        self.sink(graph, key, method, body, map, index, j + 1, changed);
                    }
                }
            }
            Some(intrinsic) if intrinsic.is_async_dispatch() => {
                self.sink(graph, site, method, body, map, index, 0, changed);
            }
            Some(_) => {}
            None => {
                let is_newobj = body.instructions[index].opcode == Opcode::Newobj;
                let targets = if body.instructions[index].opcode == Opcode::Callvirt
                    && callee.is_virtual()
                {
                    self.inheritance.resolve_virtual(callee.token)
                } else {
                    vec![callee.token]
                };
                let stack_offset = if is_newobj { 0 } else { callee.param_offset() };
                for (j, param) in callee.params.iter().enumerate() {
                    if !module.is_callback_sig(&param.sig) {
                        continue;
                    }
                    for target in &targets {
                        let Ok(target_def) = module.method(*target) else {
                            continue;
                        };
                        let Ok(arg) = u16::try_from(j + target_def.param_offset()) else {
                            continue;
                        };
                        let key = CallbackKey::Param {
                            method: *target,
                            index: arg,
                        };
                        self.sink(graph, key, method, body, map, index, j + stack_offset, changed);
                    }
                }
            }
        }
    }

    /// Flows the value consumed as `operand` by the instruction at `index` into `dest`.
    #[allow(clippy::too_many_arguments)]
    fn sink(
        &mut self,
        graph: &mut CallbackGraph,
        dest: CallbackKey,
        method: Token,
        body: &MethodBody,
        map: &JumpSiteMap,
        index: usize,
        operand: usize,
        changed: &mut Vec<usize>,
    ) {
        let producers = map.operand_producers(body, index, operand);
        let mut sources = ValueSources::default();
        let mut visited = HashSet::new();
        if producers.is_empty() {
            sources.unresolved = true;
        }
        for producer in producers {
            self.resolve(method, body, map, producer, &mut sources, &mut visited);
        }
        if sources.unresolved && self.reported.insert((method, index)) {
            self.diagnostics.push(
                DiagnosticKind::UnresolvedCallback,
                Some(method),
                Some(index),
                format!(
                    "callback value consumed by '{}' in {} has no resolvable construction site",
                    body.instructions[index],
                    self.module.method_name(method)
                ),
            );
        }

        let node = graph.node(dest);
        for alias in &sources.aliases {
            let other = graph.node(*alias);
            if let Some(root) = graph.union(node, other) {
                changed.push(root);
            }
        }
        if let Some(root) = graph.add_targets(node, &sources.targets) {
            changed.push(root);
        }
    }

    fn resolve(
        &self,
        method: Token,
        body: &MethodBody,
        map: &JumpSiteMap,
        producer: usize,
        sources: &mut ValueSources,
        visited: &mut HashSet<usize>,
    ) {
        if !visited.insert(producer) {
            return;
        }
        let module = self.module;
        let instr = &body.instructions[producer];
        match instr.opcode {
            Opcode::LdNull => {}
            Opcode::Ldsfld | Opcode::Ldfld => match instr.token() {
                Some(field) => {
                    sources.aliases.insert(CallbackKey::Field(field));
                }
                None => sources.unresolved = true,
            },
            Opcode::Ldloc => match instr.local_index() {
                Some(index) => {
                    sources.aliases.insert(CallbackKey::Local { method, index });
                }
                None => sources.unresolved = true,
            },
            Opcode::Ldarg => match instr.arg_index() {
                Some(index) => {
                    sources.aliases.insert(CallbackKey::Param { method, index });
                }
                None => sources.unresolved = true,
            },
            Opcode::Castclass | Opcode::Isinst => {
                for inner in map.operand_producers(body, producer, 0) {
                    self.resolve(method, body, map, inner, sources, visited);
                }
            }
            Opcode::Newobj => {
                let is_delegate_ctor = instr
                    .token()
                    .and_then(|t| module.method(t).ok())
                    .is_some_and(|ctor| module.is_callback_type(ctor.declaring_type));
                if !is_delegate_ctor {
                    sources.unresolved = true;
                    return;
                }
                let pointers = map.operand_producers(body, producer, 1);
                if pointers.is_empty() {
                    sources.unresolved = true;
                }
                for pointer in pointers {
                    let ptr = &body.instructions[pointer];
                    match (ptr.opcode, ptr.token()) {
                        (Opcode::Ldftn | Opcode::Ldvirtftn, Some(target)) => {
                            sources.targets.insert(target);
                            sources
                                .targets
                                .extend(self.inheritance.overriders(target));
                        }
                        _ => sources.unresolved = true,
                    }
                }
            }
            Opcode::Call | Opcode::Callvirt => {
                let Some(callee) = instr.token().and_then(|t| module.method(t).ok()) else {
                    sources.unresolved = true;
                    return;
                };
                if callee
                    .intrinsic
                    .is_some_and(Intrinsic::is_delegate_combination)
                {
                    for operand in 0..2 {
                        for inner in map.operand_producers(body, producer, operand) {
                            self.resolve(method, body, map, inner, sources, visited);
                        }
                    }
                } else if module.is_callback_sig(&callee.return_type) {
                    let targets = if instr.opcode == Opcode::Callvirt && callee.is_virtual() {
                        self.inheritance.resolve_virtual(callee.token)
                    } else {
                        vec![callee.token]
                    };
                    for target in targets {
                        sources.aliases.insert(CallbackKey::Return(target));
                    }
                } else {
                    sources.unresolved = true;
                }
            }
            _ => sources.unresolved = true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{MethodModifiers, ModuleBuilder, TypeSig};

    fn run(module: &Module) -> (CallbackGraph, Diagnostics) {
        let inheritance = InheritanceGraph::new(module);
        let jumps = JumpSiteCache::new();
        let diagnostics = Diagnostics::new();
        let graph = CallbackGraph::build(module, &inheritance, &jumps, &diagnostics, 16).unwrap();
        (graph, diagnostics)
    }

    #[test]
    fn test_union_find_shares_sets() {
        let mut graph = CallbackGraph::new();
        let a = graph.node(CallbackKey::Field(Token(0x0400_0001)));
        let b = graph.node(CallbackKey::Return(Token(0x0600_0001)));
        let c = graph.node(CallbackKey::Field(Token(0x0400_0002)));
        graph.add_targets(a, &BTreeSet::from([Token(0x0600_0010)]));
        assert!(graph.union(a, b).is_some());
        assert!(graph.union(a, b).is_none());
        graph.add_targets(b, &BTreeSet::from([Token(0x0600_0011)]));
        assert_eq!(
            graph.targets(&CallbackKey::Field(Token(0x0400_0001))),
            vec![Token(0x0600_0010), Token(0x0600_0011)]
        );
        assert!(graph.are_aliases(
            &CallbackKey::Field(Token(0x0400_0001)),
            &CallbackKey::Return(Token(0x0600_0001))
        ));
        assert!(graph.targets(&CallbackKey::Field(Token(0x0400_0002))).is_empty());
        assert!(graph.union(c, a).is_some());
        assert_eq!(graph.targets(&CallbackKey::Field(Token(0x0400_0002))).len(), 2);
    }

    #[test]
    fn test_event_subscription_through_field() {
        let mut builder = ModuleBuilder::new("Events").unwrap();
        let core = *builder.core();
        let action = TypeSig::Class(core.action.ty);
        let bus = builder.static_class("Events", "Bus");
        let handlers = builder.static_field(bus, "handlers", action.clone()).unwrap();

        let handler = |name: &str, builder: &mut ModuleBuilder| {
            builder
                .method(bus, name)
                .flags(MethodModifiers::STATIC)
                .implementation(|asm| {
                    asm.ret()?;
                    Ok(())
                })
                .build()
                .unwrap()
        };
        let on_a = handler("OnA", &mut builder);
        let on_b = handler("OnB", &mut builder);

        // handlers = Combine(handlers, new Action(OnA)); same for OnB through a local
        let subscribe = builder
            .method(bus, "Subscribe")
            .flags(MethodModifiers::STATIC)
            .local(action.clone())
            .implementation(move |asm| {
                asm.ldsfld(handlers)?
                    .ldnull()?
                    .ldftn(on_a)?
                    .newobj(core.action.ctor)?
                    .call(core.combine)?
                    .castclass(core.action.ty)?
                    .stsfld(handlers)?
                    .ldnull()?
                    .ldftn(on_b)?
                    .newobj(core.action.ctor)?
                    .stloc(0)?
                    .ldsfld(handlers)?
                    .ldloc(0)?
                    .call(core.combine)?
                    .castclass(core.action.ty)?
                    .stsfld(handlers)?
                    .ret()?;
                Ok(())
            })
            .build()
            .unwrap();
        let raise = builder
            .method(bus, "Raise")
            .flags(MethodModifiers::STATIC)
            .implementation(move |asm| {
                asm.ldsfld(handlers)?.callvirt(core.action.invoke)?.ret()?;
                Ok(())
            })
            .build()
            .unwrap();
        let module = builder.build();

        let (graph, diagnostics) = run(&module);
        assert_eq!(graph.site_targets(raise, 1), vec![on_a, on_b]);
        assert!(graph.are_aliases(
            &CallbackKey::Field(handlers),
            &CallbackKey::Local {
                method: subscribe,
                index: 0
            }
        ));
        assert_eq!(diagnostics.count(DiagnosticKind::UnresolvedCallback), 0);
        assert!(graph.stats().converged);
    }

    #[test]
    fn test_callback_through_parameter_and_async_dispatch() {
        let mut builder = ModuleBuilder::new("Jobs").unwrap();
        let core = *builder.core();
        let action = TypeSig::Class(core.action.ty);
        let jobs = builder.static_class("Jobs", "Scheduler");
        let work = builder
            .method(jobs, "Work")
            .flags(MethodModifiers::STATIC)
            .implementation(|asm| {
                asm.ret()?;
                Ok(())
            })
            .build()
            .unwrap();
        let start = builder
            .method(jobs, "Start")
            .flags(MethodModifiers::STATIC)
            .param("job", action.clone())
            .implementation(move |asm| {
                asm.ldarg(0)?.call(core.task_run)?.ret()?;
                Ok(())
            })
            .build()
            .unwrap();
        builder
            .method(jobs, "Main")
            .flags(MethodModifiers::STATIC)
            .implementation(move |asm| {
                asm.ldnull()?
                    .ldftn(work)?
                    .newobj(core.action.ctor)?
                    .call(start)?
                    .ret()?;
                Ok(())
            })
            .build()
            .unwrap();
        let module = builder.build();

        let (graph, _) = run(&module);
        assert_eq!(graph.site_targets(start, 1), vec![work]);
        assert_eq!(
            graph.targets(&CallbackKey::Param {
                method: start,
                index: 0
            }),
            vec![work]
        );
    }

    #[test]
    fn test_unresolved_callback_is_reported() {
        let mut builder = ModuleBuilder::new("Bad").unwrap();
        let core = *builder.core();
        let ty = builder.static_class("Bad", "Holder");
        let slot = builder
            .static_field(ty, "slot", TypeSig::Class(core.action.ty))
            .unwrap();
        builder
            .method(ty, "Store")
            .flags(MethodModifiers::STATIC)
            .param("value", TypeSig::Object)
            .implementation(move |asm| {
                asm.ldarg(0)?.ldc_i4(1)?.add()?.stsfld(slot)?.ret()?;
                Ok(())
            })
            .build()
            .unwrap();
        let module = builder.build();
        let (graph, diagnostics) = run(&module);
        assert_eq!(diagnostics.count(DiagnosticKind::UnresolvedCallback), 1);
        assert!(graph.targets(&CallbackKey::Field(slot)).is_empty());
    }
}
