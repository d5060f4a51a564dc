//! The context injection engine.
//!
//! Injection runs in two phases over the methods the [`BoundnessCache`] marks as bound:
//!
//! 1. **Declare** - every method whose signature changes gets a new definition: static methods
//!    move onto their context type as instance methods (static initializers become
//!    `StaticInit`), parameter forms gain a leading root parameter. Bodies are copied with their
//!    argument numbers shifted. Methods of root-carrying types are kept in place.
//! 2. **Rewrite** - every bound body is scanned for sites that need a context value: converted
//!    static field accesses, calls into bound methods, callback construction over moved methods
//!    and construction of root-capturing objects. Sites are processed in ascending order; each
//!    inserts its loads at or before its own position, so the indices of later sites shift by
//!    exactly the number of inserted instructions.
//!
//! Old definitions stay in the module until [`crate::context::finalize`] removes them, so the
//! stack effect of not-yet-rewritten call sites is always computed against the signature they
//! were written for.

use serde::{Deserialize, Serialize};

use crate::{
    analysis::{JumpSiteCache, JumpSiteMap},
    assembly::{BranchFixup, Instruction, MethodBody, Opcode, Operand},
    context::{
        insertion::{insert_operand, operand_start},
        BindingPlan, Boundness, BoundnessCache, ContextModel, IdMap,
    },
    metadata::{method::CCTOR_NAME, MethodModifiers, Module, Param, Token, TypeSig},
    Error, Result,
};

/// Name given to a static initializer once it runs per context.
pub const STATIC_INIT_NAME: &str = "StaticInit";

/// Counters describing one injection run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InjectionStats {
    /// Bound methods whose body was rewritten
    pub methods_rewritten: usize,
    /// New definitions emitted for methods whose signature changed
    pub methods_declared: usize,
    /// Rewritten instruction sites
    pub sites_rewritten: usize,
    /// Sites that needed their operands spilled into temporaries
    pub spills: usize,
    /// Methods that cache the root in a local
    pub cached_roots: usize,
    /// Constructors whose base constructor call was relocated
    pub relocations: usize,
}

/// How a rewritten method reaches the root context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RootSource {
    Arg(u16),
    Field(Token),
    Local(u16),
}

impl RootSource {
    fn load(self) -> Vec<Instruction> {
        match self {
            RootSource::Arg(index) => vec![Instruction::ldarg(index)],
            RootSource::Field(field) => vec![
                Instruction::ldarg(0),
                Instruction::with_token(Opcode::Ldfld, field),
            ],
            RootSource::Local(local) => vec![Instruction::ldloc(local)],
        }
    }
}

/// One instruction that needs a context value.
#[derive(Debug, Clone)]
enum Site {
    /// `ldsfld` of a converted field
    LoadStatic { bound: Token, owner: Token },
    /// `stsfld` of a converted field
    StoreStatic { bound: Token, owner: Token, sig: TypeSig },
    /// Call of a method moved onto a context type; the context instance becomes the receiver
    Receiver { callee: Token, owner: Token, above: Vec<TypeSig> },
    /// Call of a parameter-form method; the root becomes the first declared argument
    Root { callee: Token, above: Vec<TypeSig> },
    /// `ldftn` of a moved method; the callback target becomes the context instance
    CallbackTarget { callee: Token, owner: Token },
    /// Construction of a root-capturing object; the root is stored right after `newobj`
    Capture { field: Token },
}

/// Rewrites bound methods so the root context reaches every use of converted state.
pub struct ContextInjector<'a> {
    snapshot: &'a Module,
    plan: &'a BindingPlan,
    cache: &'a BoundnessCache,
    jumps: &'a JumpSiteCache,
    methods: IdMap,
    stats: InjectionStats,
}

impl<'a> ContextInjector<'a> {
    /// Creates an injector. `snapshot` is the module as analysed, before any edit.
    #[must_use]
    pub fn new(
        snapshot: &'a Module,
        plan: &'a BindingPlan,
        cache: &'a BoundnessCache,
        jumps: &'a JumpSiteCache,
    ) -> Self {
        ContextInjector {
            snapshot,
            plan,
            cache,
            jumps,
            methods: IdMap::new(),
            stats: InjectionStats::default(),
        }
    }

    /// Runs both phases and returns the method id map.
    ///
    /// # Errors
    /// Returns [`Error::InvariantViolation`] if a site cannot be rewritten deterministically,
    /// or any error from editing the module.
    pub fn run(
        mut self,
        module: &mut Module,
        model: &mut ContextModel,
    ) -> Result<(IdMap, InjectionStats)> {
        let bound = self.cache.bound();
        for (method, boundness) in &bound {
            self.declare(module, model, *method, *boundness)?;
        }
        for (method, boundness) in &bound {
            let target = self.methods.translate(*method);
            if module.method(target)?.has_body() {
                self.rewrite(module, model, target, *boundness)?;
                self.jumps.invalidate(*method);
                self.jumps.invalidate(target);
            }
        }
        log::info!(
            "Injected context into {} method(s), {} site(s), {} spill(s)",
            self.stats.methods_rewritten,
            self.stats.sites_rewritten,
            self.stats.spills
        );
        Ok((self.methods, self.stats))
    }

    fn declare(
        &mut self,
        module: &mut Module,
        model: &mut ContextModel,
        method: Token,
        boundness: Boundness,
    ) -> Result<()> {
        let def = self.snapshot.method(method)?.clone();
        if !boundness.changes_signature() {
            return self.methods.insert(method, method);
        }

        let root_sig = TypeSig::Class(model.root_type());
        let (owner, name, flags, params) = match boundness {
            Boundness::StaticToInstance => {
                let record = model.record(def.declaring_type).ok_or_else(|| {
                    invariant_error!(
                        method,
                        None,
                        "{} moves to a context type but {} has no context record",
                        self.snapshot.method_name(method),
                        self.snapshot.type_name(def.declaring_type)
                    )
                })?;
                let (name, flags) = if def.name == CCTOR_NAME {
                    (
                        STATIC_INIT_NAME.to_string(),
                        def.flags - MethodModifiers::STATIC - MethodModifiers::SPECIAL_NAME,
                    )
                } else {
                    (def.name.clone(), def.flags - MethodModifiers::STATIC)
                };
                (record.context_type, name, flags, def.params.clone())
            }
            _ => {
                let mut params = Vec::with_capacity(def.params.len() + 1);
                params.push(Param::new("root", root_sig));
                params.extend(def.params.iter().cloned());
                // A static initializer of a self-held singleton stays static and takes the root.
                let (name, flags) = if def.is_static_constructor() {
                    (
                        STATIC_INIT_NAME.to_string(),
                        def.flags - MethodModifiers::SPECIAL_NAME,
                    )
                } else {
                    (def.name.clone(), def.flags)
                };
                (def.declaring_type, name, flags, params)
            }
        };

        let token = module.add_method(owner, &name, flags, params, def.return_type.clone())?;
        let shift = boundness.shifted_args_from().unwrap_or(u16::MAX);
        {
            let declared = module.method_mut(token)?;
            declared.generic_params = def.generic_params.clone();
            declared.overrides = def.overrides.clone();
            declared.body = def.body.as_ref().map(|body| shift_args(body, shift));
        }
        if def.is_static_constructor() {
            if let Some(record) = model.record_mut(def.declaring_type) {
                record.static_init = Some(token);
            }
        }

        log::debug!(
            "{} -> {} ({})",
            self.snapshot.method_name(method),
            module.method_name(token),
            boundness
        );
        self.stats.methods_declared += 1;
        self.methods.insert(method, token)
    }

    fn root_source(
        &self,
        module: &Module,
        target: Token,
        boundness: Boundness,
    ) -> Result<RootSource> {
        let owner = module.method(target)?.declaring_type;
        let field = self.plan.root_field_of(module, owner);
        match boundness {
            Boundness::StaticWithRootParam => Ok(RootSource::Arg(0)),
            Boundness::InstanceWithRootParam => Ok(RootSource::Arg(1)),
            Boundness::Constructor => Ok(field.map_or(RootSource::Arg(1), RootSource::Field)),
            Boundness::StaticToInstance | Boundness::InstanceWithRootField => {
                field.map(RootSource::Field).ok_or_else(|| {
                    invariant_error!(
                        target,
                        None,
                        "{} carries no root field",
                        module.type_name(owner)
                    )
                })
            }
            Boundness::Unbound => {
                Err(invariant_error!(target, None, "rewriting an unbound method"))
            }
        }
    }

    fn rewrite(
        &mut self,
        module: &mut Module,
        model: &ContextModel,
        target: Token,
        boundness: Boundness,
    ) -> Result<()> {
        let Some(mut body) = module.method_mut(target)?.body.take() else {
            return Ok(());
        };
        let result = self.rewrite_body(module, model, target, boundness, &mut body);
        module.method_mut(target)?.body = Some(body);
        result
    }

    fn rewrite_body(
        &mut self,
        module: &Module,
        model: &ContextModel,
        target: Token,
        boundness: Boundness,
        body: &mut MethodBody,
    ) -> Result<()> {
        let mut root = self.root_source(module, target, boundness)?;
        let mut sites = self.collect_sites(module, model, target, body)?;
        if sites.is_empty() && boundness != Boundness::Constructor {
            return Ok(());
        }

        let root_uses = sites
            .iter()
            .filter(|(_, site)| self.site_needs_root(module, model, target, site))
            .count();
        if let RootSource::Field(field) = root {
            if boundness != Boundness::Constructor && root_uses >= 2 {
                let local = body.add_local(TypeSig::Class(model.root_type()))?;
                let mut prologue = root.load();
                prologue.push(Instruction::stloc(local));
                let shift = prologue.len();
                body.insert(0, prologue, BranchFixup::Preserve)?;
                for (index, _) in &mut sites {
                    *index += shift;
                }
                root = RootSource::Local(local);
                self.stats.cached_roots += 1;
                log::trace!("Caching {} in a local of {}", field, module.method_name(target));
            }
        }

        let mut shift = 0usize;
        for (index, site) in sites {
            let at = index + shift;
            shift += self.apply(module, model, target, root, body, at, site)?;
            self.stats.sites_rewritten += 1;
        }

        if boundness == Boundness::Constructor {
            if let RootSource::Field(field) = root {
                self.store_root_after_base_call(module, target, body, field)?;
            }
        }
        self.stats.methods_rewritten += 1;
        Ok(())
    }

    fn collect_sites(
        &self,
        module: &Module,
        model: &ContextModel,
        target: Token,
        body: &MethodBody,
    ) -> Result<Vec<(usize, Site)>> {
        let mut sites = Vec::new();
        for (index, instr) in body.instructions.iter().enumerate() {
            let Some(token) = instr.token() else {
                continue;
            };
            let site = match instr.opcode {
                Opcode::Ldsfld | Opcode::Stsfld => {
                    let Some(bound) = model.field_map().get(token) else {
                        continue;
                    };
                    let field = self.snapshot.field(token)?;
                    let owner = if model.is_root_held(token) {
                        model.root_type()
                    } else {
                        field.declaring_type
                    };
                    if instr.opcode == Opcode::Ldsfld {
                        Site::LoadStatic { bound, owner }
                    } else {
                        Site::StoreStatic {
                            bound,
                            owner,
                            sig: field.sig.clone(),
                        }
                    }
                }
                Opcode::Call | Opcode::Callvirt | Opcode::Newobj => {
                    let Ok(callee) = self.snapshot.method(token) else {
                        continue;
                    };
                    let above: Vec<TypeSig> = callee.params.iter().map(|p| p.sig.clone()).collect();
                    match self.cache.get(token) {
                        Boundness::StaticToInstance => Site::Receiver {
                            callee: self.methods.translate(token),
                            owner: callee.declaring_type,
                            above,
                        },
                        b if b.requires_caller_root() => Site::Root {
                            callee: self.methods.translate(token),
                            above,
                        },
                        _ if instr.opcode == Opcode::Newobj => {
                            match self.plan.root_field_of(module, callee.declaring_type) {
                                Some(field) => Site::Capture { field },
                                None => continue,
                            }
                        }
                        _ => continue,
                    }
                }
                Opcode::Ldftn | Opcode::Ldvirtftn => match self.cache.get(token) {
                    Boundness::StaticToInstance => Site::CallbackTarget {
                        callee: self.methods.translate(token),
                        owner: self.snapshot.method(token)?.declaring_type,
                    },
                    b if b.root_param().is_some() => {
                        return Err(Error::Unsupported(format!(
                            "callback over {} in {} cannot supply its root parameter",
                            self.snapshot.method_name(token),
                            module.method_name(target)
                        )));
                    }
                    _ => continue,
                },
                _ => continue,
            };
            sites.push((index, site));
        }
        Ok(sites)
    }

    fn is_own_context(
        &self,
        module: &Module,
        model: &ContextModel,
        target: Token,
        owner: Token,
    ) -> bool {
        let Ok(def) = module.method(target) else {
            return false;
        };
        !def.is_static()
            && model
                .record(owner)
                .is_some_and(|r| r.context_type == def.declaring_type)
    }

    fn site_needs_root(
        &self,
        module: &Module,
        model: &ContextModel,
        target: Token,
        site: &Site,
    ) -> bool {
        match site {
            Site::LoadStatic { owner, .. }
            | Site::StoreStatic { owner, .. }
            | Site::Receiver { owner, .. }
            | Site::CallbackTarget { owner, .. } => {
                !self.is_own_context(module, model, target, *owner)
            }
            Site::Root { .. } | Site::Capture { .. } => true,
        }
    }

    /// Instructions producing the context instance of `owner`'s record inside `target`, or the
    /// root itself when `owner` is the root context type.
    fn context_load(
        &self,
        module: &Module,
        model: &ContextModel,
        target: Token,
        root: RootSource,
        owner: Token,
    ) -> Result<Vec<Instruction>> {
        if owner == model.root_type() {
            return Ok(root.load());
        }
        if self.is_own_context(module, model, target, owner) {
            return Ok(vec![Instruction::ldarg(0)]);
        }
        let record = model.record(owner).ok_or_else(|| {
            invariant_error!(
                target,
                None,
                "no context record for {}",
                self.snapshot.type_name(owner)
            )
        })?;
        let mut load = root.load();
        load.extend(
            record
                .chain
                .iter()
                .map(|link| Instruction::with_token(Opcode::Ldfld, *link)),
        );
        Ok(load)
    }

    /// Rewrites one site and returns the number of instructions added to the body.
    #[allow(clippy::too_many_arguments)]
    fn apply(
        &mut self,
        module: &Module,
        model: &ContextModel,
        target: Token,
        root: RootSource,
        body: &mut MethodBody,
        at: usize,
        site: Site,
    ) -> Result<usize> {
        match site {
            Site::LoadStatic { bound, owner } => {
                let load = self.context_load(module, model, target, root, owner)?;
                let count = load.len();
                body.insert(at, load, BranchFixup::Retarget)?;
                body.replace(at + count, Instruction::with_token(Opcode::Ldfld, bound))?;
                Ok(count)
            }
            Site::StoreStatic { bound, owner, sig } => {
                let load = self.context_load(module, model, target, root, owner)?;
                let inserted = insert_operand(module, target, body, at, &[sig], load)?;
                self.stats.spills += usize::from(inserted.spilled);
                body.replace(
                    at + inserted.count,
                    Instruction::with_token(Opcode::Stfld, bound),
                )?;
                Ok(inserted.count)
            }
            Site::Receiver { callee, owner, above } => {
                let load = self.context_load(module, model, target, root, owner)?;
                let inserted = insert_operand(module, target, body, at, &above, load)?;
                self.stats.spills += usize::from(inserted.spilled);
                body.replace(
                    at + inserted.count,
                    Instruction::with_token(Opcode::Call, callee),
                )?;
                Ok(inserted.count)
            }
            Site::Root { callee, above } => {
                let opcode = body.instructions[at].opcode;
                let inserted = insert_operand(module, target, body, at, &above, root.load())?;
                self.stats.spills += usize::from(inserted.spilled);
                body.replace(at + inserted.count, Instruction::with_token(opcode, callee))?;
                Ok(inserted.count)
            }
            Site::CallbackTarget { callee, owner } => {
                self.retarget_callback(module, model, target, root, body, at, callee, owner)
            }
            Site::Capture { field } => {
                let mut store = vec![Instruction::simple(Opcode::Dup)];
                store.extend(root.load());
                store.push(Instruction::with_token(Opcode::Stfld, field));
                let count = store.len();
                body.insert(at + 1, store, BranchFixup::Preserve)?;
                Ok(count)
            }
        }
    }

    /// `ldnull; ldftn M; newobj D::.ctor` over a moved `M` becomes
    /// `<context>; ldftn M'; newobj D::.ctor`.
    #[allow(clippy::too_many_arguments)]
    fn retarget_callback(
        &mut self,
        module: &Module,
        model: &ContextModel,
        target: Token,
        root: RootSource,
        body: &mut MethodBody,
        at: usize,
        callee: Token,
        owner: Token,
    ) -> Result<usize> {
        let map = JumpSiteMap::from_body(module, target, body);
        let construct = at + 1;
        let constructs_callback = body.instructions.get(construct).is_some_and(|i| {
            i.opcode == Opcode::Newobj
                && i.token()
                    .and_then(|t| module.method(t).ok())
                    .is_some_and(|ctor| module.is_callback_type(ctor.declaring_type))
        });
        if !constructs_callback || !map.is_straight_line(construct) {
            return Err(invariant_error!(
                target,
                Some(at),
                "function pointer is not consumed by a callback constructor"
            ));
        }
        let producers = map.operand_producers(body, construct, 0);
        let [receiver] = producers.as_slice() else {
            return Err(invariant_error!(
                target,
                Some(at),
                "callback target has {} producers, expected exactly one",
                producers.len()
            ));
        };
        let receiver = *receiver;
        if body.instructions[receiver].opcode != Opcode::LdNull {
            return Err(invariant_error!(
                target,
                Some(receiver),
                "static callback target is not produced by ldnull"
            ));
        }

        let load = self.context_load(module, model, target, root, owner)?;
        let count = load.len();
        body.insert(receiver, load, BranchFixup::Retarget)?;
        body.remove(receiver + count)?;
        let pointer = at + count - 1;
        let opcode = body.instructions[pointer].opcode;
        body.replace(pointer, Instruction::with_token(opcode, callee))?;
        Ok(count - 1)
    }

    /// Stores the root parameter into the root field right after the single base (or self)
    /// constructor call, moving that call ahead of any initializer that already reads the field.
    fn store_root_after_base_call(
        &mut self,
        module: &Module,
        target: Token,
        body: &mut MethodBody,
        field: Token,
    ) -> Result<()> {
        let owner = module.method(target)?.declaring_type;
        let mut lineage = Vec::new();
        let mut current = Some(owner);
        while let Some(ty) = current {
            if lineage.contains(&ty) {
                break;
            }
            lineage.push(ty);
            current = module.type_def(ty)?.base;
        }

        let map = JumpSiteMap::from_body(module, target, body);
        let base_calls: Vec<usize> = body
            .instructions
            .iter()
            .enumerate()
            .filter(|(index, instr)| {
                instr.opcode == Opcode::Call
                    && instr
                        .token()
                        .and_then(|t| module.method(t).ok())
                        .is_some_and(|m| m.is_constructor() && lineage.contains(&m.declaring_type))
                    && map
                        .operand_producers(body, *index, 0)
                        .iter()
                        .all(|p| body.instructions[*p] == Instruction::ldarg(0))
            })
            .map(|(index, _)| index)
            .collect();
        let [base] = base_calls.as_slice() else {
            return Err(invariant_error!(
                target,
                None,
                "expected a single base constructor call, found {}",
                base_calls.len()
            ));
        };
        let base = *base;

        let pops = map.effect(base).map_or(0, |e| usize::from(e.pops));
        let start = operand_start(&map, base, pops)
            .ok_or_else(|| {
                invariant_error!(
                    target,
                    Some(base),
                    "base constructor arguments cross a join point"
                )
            })?;
        let store = vec![
            Instruction::ldarg(0),
            Instruction::ldarg(1),
            Instruction::with_token(Opcode::Stfld, field),
        ];
        let stored = store.len();
        body.insert(base + 1, store, BranchFixup::Preserve)?;

        let read = Instruction::with_token(Opcode::Ldfld, field);
        let dependent = (1..start.min(base)).find(|i| {
            body.instructions[*i] == read && body.instructions[*i - 1] == Instruction::ldarg(0)
        });
        if let Some(first) = dependent.map(|i| i - 1) {
            let uses_inside_arguments = (start..base).any(|i| body.instructions[i] == read);
            if uses_inside_arguments {
                return Err(invariant_error!(
                    target,
                    Some(base),
                    "base constructor arguments depend on the root field"
                ));
            }
            body.relocate(start, base + 1 + stored, first, BranchFixup::Retarget)?;
            self.stats.relocations += 1;
            log::debug!(
                "Moved base constructor call of {} from {} to {}",
                module.method_name(target),
                base,
                first
            );
        } else if (start..base).any(|i| body.instructions[i] == read) {
            return Err(invariant_error!(
                target,
                Some(base),
                "base constructor arguments depend on the root field"
            ));
        }
        Ok(())
    }
}

/// Copies `body`, renumbering every argument `>= from` one slot up.
fn shift_args(body: &MethodBody, from: u16) -> MethodBody {
    let mut shifted = body.clone();
    for instr in &mut shifted.instructions {
        if let Operand::Arg(index) = &mut instr.operand {
            if *index >= from {
                *index += 1;
            }
        }
    }
    shifted
}

/// Replaces references to original methods and fields by their context-bound counterparts in
/// the `overrides` lists of every method.
pub(crate) fn remap_overrides(module: &mut Module, methods: &IdMap) -> Result<()> {
    let tokens: Vec<Token> = module.methods().map(|m| m.token).collect();
    for token in tokens {
        let def = module.method_mut(token)?;
        for overridden in &mut def.overrides {
            *overridden = methods.translate(*overridden);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shift_args() {
        let body = MethodBody::new(
            vec![
                Instruction::ldarg(0),
                Instruction::ldarg(1),
                Instruction::starg(1),
                Instruction::simple(Opcode::Ret),
            ],
            vec![],
        );
        let shifted = shift_args(&body, 1);
        assert_eq!(shifted.instructions[0], Instruction::ldarg(0));
        assert_eq!(shifted.instructions[1], Instruction::ldarg(2));
        assert_eq!(shifted.instructions[2], Instruction::starg(2));
        assert_eq!(shift_args(&body, u16::MAX), body);
    }

    #[test]
    fn test_root_source_loads() {
        assert_eq!(RootSource::Arg(1).load(), vec![Instruction::ldarg(1)]);
        assert_eq!(RootSource::Local(3).load(), vec![Instruction::ldloc(3)]);
        let field = Token::from_parts(Token::FIELD_TABLE, 9);
        assert_eq!(
            RootSource::Field(field).load(),
            vec![Instruction::ldarg(0), Instruction::with_token(Opcode::Ldfld, field)]
        );
    }
}
