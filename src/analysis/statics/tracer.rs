//! Backward stack-value tracing to a fixed point.
//!
//! Every method body is swept in token order. A sweep recomputes, for each instruction that
//! pushes a value, the set of origins that value may have, and folds stores into the
//! flow-insensitive slot sets (locals and overwritten arguments), return summaries and
//! modified-parameter summaries. Sets only grow, so repeated sweeps reach a fixed point; the
//! chain depth limit keeps the number of distinct origins finite.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

use crate::{
    analysis::{
        statics::chain::{ChainContext, Origin, OriginRoot},
        CallGraph, CallSite, CallTarget, CallType, DiagnosticKind, Diagnostics, JumpSiteCache,
        MemberStep, StaticOrigin,
    },
    assembly::{MethodBody, Opcode},
    metadata::{Intrinsic, MethodDef, Module, Token},
    Result,
};

/// How the operands of a call site bind to the parameters of one of its targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Binding {
    /// `call` / `callvirt`: argument `k` is operand `k`
    Direct,
    /// `newobj`: argument 0 is the new object, argument `k` is operand `k - 1`
    Construct,
    /// Callback `Invoke`: operand 0 is the callback, the target's declared parameters follow
    Callback,
}

impl Binding {
    /// The stack operand carrying argument `arg` of `target`.
    pub fn operand(self, target: &MethodDef, arg: u16) -> Option<usize> {
        let arg = usize::from(arg);
        match self {
            Binding::Direct => Some(arg),
            Binding::Construct => arg.checked_sub(1),
            Binding::Callback => arg
                .checked_sub(target.param_offset())
                .map(|declared| declared + 1),
        }
    }
}

/// A storage slot of a method whose contents are tracked flow-insensitively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Slot {
    Local(u16),
    Arg(u16),
}

/// Precomputed operand producers of one body: `producers[index][operand]`.
struct Frame {
    producers: Vec<Vec<Vec<usize>>>,
}

/// Mutable state of the fixed point.
#[derive(Debug, Default)]
pub(crate) struct TraceState {
    /// Origins of the value pushed by `(method, index)`
    pub values: HashMap<(Token, usize), BTreeSet<Origin>>,
    slots: HashMap<(Token, Slot), BTreeSet<Origin>>,
    /// Origins a method may return, rooted at statics or at its own parameters
    pub returns: HashMap<Token, BTreeSet<Origin>>,
    /// Parameter-rooted locations a method writes into
    pub modified_params: HashMap<Token, BTreeSet<Origin>>,
    /// Static-rooted writes per method, with their instruction index
    pub modifications: BTreeMap<Token, BTreeSet<(usize, Origin)>>,
}

/// The fixed-point engine.
pub(crate) struct Tracer<'a> {
    pub chains: ChainContext<'a>,
    callgraph: &'a CallGraph,
    frames: BTreeMap<Token, Frame>,
    pub state: TraceState,
}

fn merge<K: std::hash::Hash + Eq>(
    map: &mut HashMap<K, BTreeSet<Origin>>,
    key: K,
    origins: BTreeSet<Origin>,
) -> bool {
    if origins.is_empty() {
        return false;
    }
    let entry = map.entry(key).or_default();
    let before = entry.len();
    entry.extend(origins);
    entry.len() != before
}

impl<'a> Tracer<'a> {
    /// Prepares frames for every method with a body.
    pub fn new(
        chains: ChainContext<'a>,
        callgraph: &'a CallGraph,
        jumps: &JumpSiteCache,
    ) -> Result<Self> {
        let module = chains.module;
        let mut frames = BTreeMap::new();
        for method in module.methods_with_body() {
            let body = module.body(method)?;
            let map = jumps.get(module, method)?;
            let producers = (0..body.len())
                .map(|index| {
                    let pops = map.effect(index).map_or(0, |e| usize::from(e.pops));
                    (0..pops)
                        .map(|operand| map.operand_producers(body, index, operand))
                        .collect()
                })
                .collect();
            frames.insert(method, Frame { producers });
        }
        Ok(Tracer {
            chains,
            callgraph,
            frames,
            state: TraceState::default(),
        })
    }

    /// Sweeps all bodies until nothing changes or `max_iterations` sweeps ran.
    ///
    /// Returns the number of sweeps and whether the fixed point was reached.
    pub fn solve(
        &mut self,
        max_iterations: usize,
        diagnostics: &Diagnostics,
    ) -> Result<(usize, bool)> {
        let methods: Vec<Token> = self.frames.keys().copied().collect();
        let mut iterations = 0;
        loop {
            if iterations >= max_iterations {
                diagnostics.push(
                    DiagnosticKind::IterationLimit,
                    None,
                    None,
                    format!("static field fixed point stopped after {iterations} sweeps"),
                );
                return Ok((iterations, false));
            }
            iterations += 1;
            let mut changed = false;
            for method in &methods {
                changed |= self.sweep(*method)?;
            }
            if !changed {
                return Ok((iterations, true));
            }
        }
    }

    fn sweep(&mut self, method: Token) -> Result<bool> {
        let module = self.chains.module;
        let def = module.method(method)?;
        let body = module.body(method)?;
        let mut changed = false;

        for (index, instr) in body.instructions.iter().enumerate() {
            let value = self.eval(method, def, body, index);
            changed |= merge(&mut self.state.values, (method, index), value);

            match instr.opcode {
                Opcode::Stloc => {
                    if let Some(local) = instr.local_index() {
                        let stored = self.operand(method, index, 0);
                        changed |=
                            merge(&mut self.state.slots, (method, Slot::Local(local)), stored);
                    }
                }
                Opcode::Starg => {
                    if let Some(arg) = instr.arg_index() {
                        let stored = self.operand(method, index, 0);
                        changed |= merge(&mut self.state.slots, (method, Slot::Arg(arg)), stored);
                    }
                }
                Opcode::Ret if def.returns_value() => {
                    let returned = self.operand(method, index, 0);
                    changed |= merge(&mut self.state.returns, method, returned);
                }
                _ => {}
            }

            for written in self.writes(method, body, index) {
                let grew = match written.root {
                    OriginRoot::Static(_) => self
                        .state
                        .modifications
                        .entry(method)
                        .or_default()
                        .insert((index, written)),
                    OriginRoot::Param(_) => self
                        .state
                        .modified_params
                        .entry(method)
                        .or_default()
                        .insert(written),
                };
                changed |= grew;
            }
        }
        Ok(changed)
    }

    /// Union of the origins of every producer of `operand` of the instruction at `index`.
    pub fn operand(&self, method: Token, index: usize, operand: usize) -> BTreeSet<Origin> {
        let Some(producers) = self
            .frames
            .get(&method)
            .and_then(|frame| frame.producers.get(index))
            .and_then(|operands| operands.get(operand))
        else {
            return BTreeSet::new();
        };
        producers
            .iter()
            .filter_map(|producer| self.state.values.get(&(method, *producer)))
            .flatten()
            .cloned()
            .collect()
    }

    fn extend_operand(
        &self,
        method: Token,
        index: usize,
        operand: usize,
        step: MemberStep,
    ) -> BTreeSet<Origin> {
        self.operand(method, index, operand)
            .iter()
            .map(|origin| self.chains.extend(origin, step))
            .collect()
    }

    /// Origins of the value pushed by the instruction at `index`.
    fn eval(
        &self,
        method: Token,
        def: &MethodDef,
        body: &MethodBody,
        index: usize,
    ) -> BTreeSet<Origin> {
        let module = self.chains.module;
        let instr = &body.instructions[index];
        match instr.opcode {
            Opcode::Ldsfld => instr
                .token()
                .filter(|field| module.field(*field).is_ok_and(|f| !f.is_literal()))
                .map(|field| BTreeSet::from([self.chains.static_root(field)]))
                .unwrap_or_default(),
            Opcode::Ldarg => {
                let Some(arg) = instr.arg_index() else {
                    return BTreeSet::new();
                };
                let mut origins = BTreeSet::from([self
                    .chains
                    .root(OriginRoot::Param(arg), def.arg_sig(usize::from(arg)))]);
                if let Some(stored) = self.state.slots.get(&(method, Slot::Arg(arg))) {
                    origins.extend(stored.iter().cloned());
                }
                origins
            }
            Opcode::Ldloc => instr
                .local_index()
                .and_then(|local| self.state.slots.get(&(method, Slot::Local(local))))
                .cloned()
                .unwrap_or_default(),
            Opcode::Ldfld => match instr.token() {
                Some(field) => self.extend_operand(method, index, 0, MemberStep::Field(field)),
                None => BTreeSet::new(),
            },
            Opcode::Ldelem => self.extend_operand(method, index, 0, MemberStep::Element),
            Opcode::Castclass | Opcode::Isinst => self.operand(method, index, 0),
            Opcode::Call | Opcode::Callvirt => {
                let intrinsic = instr.token().and_then(|t| module.intrinsic(t));
                match intrinsic {
                    Some(Intrinsic::CollectionGet) => {
                        self.extend_operand(method, index, 0, MemberStep::Element)
                    }
                    Some(Intrinsic::GetEnumerator) => self.operand(method, index, 0),
                    Some(Intrinsic::EnumeratorCurrent) => {
                        self.extend_operand(method, index, 0, MemberStep::Enumerator)
                    }
                    Some(intrinsic) if intrinsic != Intrinsic::DelegateInvoke => BTreeSet::new(),
                    _ => self.call_result(method, index),
                }
            }
            _ => BTreeSet::new(),
        }
    }

    /// Return summaries of every target of the call at `index`, bound to the caller.
    fn call_result(&self, method: Token, index: usize) -> BTreeSet<Origin> {
        let mut origins = BTreeSet::new();
        for (target, binding) in self.bindings(method, index) {
            let Some(returned) = self.state.returns.get(&target) else {
                continue;
            };
            self.bind(method, index, target, binding, returned, &mut origins);
        }
        origins
    }

    /// Locations written by the instruction at `index`.
    fn writes(&self, method: Token, body: &MethodBody, index: usize) -> BTreeSet<Origin> {
        let module = self.chains.module;
        let instr = &body.instructions[index];
        match instr.opcode {
            Opcode::Stsfld => instr
                .token()
                .filter(|field| module.field(*field).is_ok_and(|f| !f.is_literal()))
                .map(|field| BTreeSet::from([self.chains.static_root(field)]))
                .unwrap_or_default(),
            Opcode::Stfld => match instr.token() {
                Some(field) => self.extend_operand(method, index, 0, MemberStep::Field(field)),
                None => BTreeSet::new(),
            },
            Opcode::Stelem => self.extend_operand(method, index, 0, MemberStep::Element),
            Opcode::Call | Opcode::Callvirt | Opcode::Newobj => {
                let intrinsic = instr.token().and_then(|t| module.intrinsic(t));
                if intrinsic.is_some_and(Intrinsic::mutates_receiver) {
                    return self.extend_operand(method, index, 0, MemberStep::Element);
                }
                let mut written = BTreeSet::new();
                for (target, binding) in self.bindings(method, index) {
                    if let Some(modified) = self.state.modified_params.get(&target) {
                        self.bind(method, index, target, binding, modified, &mut written);
                    }
                }
                written
            }
            _ => BTreeSet::new(),
        }
    }

    /// Binds parameter-rooted callee origins to the caller's operands; static-rooted callee
    /// origins are copied unchanged.
    fn bind(
        &self,
        method: Token,
        index: usize,
        target: Token,
        binding: Binding,
        callee_origins: &BTreeSet<Origin>,
        out: &mut BTreeSet<Origin>,
    ) {
        let Ok(target_def) = self.chains.module.method(target) else {
            return;
        };
        for callee_origin in callee_origins {
            match callee_origin.root {
                OriginRoot::Static(_) => {
                    out.insert(callee_origin.clone());
                }
                OriginRoot::Param(arg) => {
                    let Some(operand) = binding.operand(target_def, arg) else {
                        continue;
                    };
                    for argument in self.operand(method, index, operand) {
                        out.insert(self.chains.substitute(&argument, callee_origin));
                    }
                }
            }
        }
    }

    /// Targets of the call site at `index` of `method`, with their operand binding.
    pub fn bindings(&self, method: Token, index: usize) -> Vec<(Token, Binding)> {
        self.callgraph
            .site_at(method, index)
            .map(|site| site_bindings(self.chains.module, site))
            .unwrap_or_default()
    }

    /// Resolves parameter roots through callers until only static roots remain.
    pub fn resolve_to_statics(
        &self,
        method: Token,
        origins: &BTreeSet<Origin>,
    ) -> BTreeSet<StaticOrigin> {
        let module = self.chains.module;
        let mut result = BTreeSet::new();
        let mut visited: HashSet<(Token, Origin)> = HashSet::new();
        let mut queue: VecDeque<(Token, Origin)> = VecDeque::new();

        for origin in origins {
            match origin.to_static() {
                Some(found) => {
                    result.insert(found);
                }
                None => {
                    if visited.insert((method, origin.clone())) {
                        queue.push_back((method, origin.clone()));
                    }
                }
            }
        }

        while let Some((callee, origin)) = queue.pop_front() {
            let (Some(arg), Ok(callee_def)) = (origin.param(), module.method(callee)) else {
                continue;
            };
            for caller in self.callgraph.callers(callee) {
                for site in self.callgraph.call_sites(caller) {
                    for (target, binding) in site_bindings(module, site) {
                        if target != callee {
                            continue;
                        }
                        let Some(operand) = binding.operand(callee_def, arg) else {
                            continue;
                        };
                        for argument in self.operand(caller, site.offset, operand) {
                            let bound = self.chains.substitute(&argument, &origin);
                            match bound.to_static() {
                                Some(found) => {
                                    result.insert(found);
                                }
                                None => {
                                    if visited.insert((caller, bound.clone())) {
                                        queue.push_back((caller, bound));
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }
        result
    }

    /// Number of instructions with at least one traced origin.
    pub fn traced_values(&self) -> usize {
        self.state.values.values().filter(|v| !v.is_empty()).count()
    }
}

/// Targets of `site` that can carry summaries, with their operand binding.
pub(crate) fn site_bindings(module: &Module, site: &CallSite) -> Vec<(Token, Binding)> {
    match (&site.target, site.call_type) {
        (CallTarget::Resolved(target), CallType::NewObj) => vec![(*target, Binding::Construct)],
        (CallTarget::Resolved(target), CallType::Call | CallType::CallVirt) => {
            vec![(*target, Binding::Direct)]
        }
        (
            CallTarget::Virtual {
                possible_targets, ..
            },
            CallType::Call | CallType::CallVirt,
        ) => possible_targets
            .iter()
            .map(|target| (*target, Binding::Direct))
            .collect(),
        (CallTarget::Callback { via, targets }, _)
            if module.intrinsic(*via) == Some(Intrinsic::DelegateInvoke) =>
        {
            targets
                .iter()
                .map(|target| (*target, Binding::Callback))
                .collect()
        }
        _ => Vec::new(),
    }
}
