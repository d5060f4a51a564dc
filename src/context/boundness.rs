//! Context-boundness decisions: which methods must reach a root context, and how.
//!
//! A method needs a root context if it touches converted static state, constructs an object
//! that captures the root, or calls a method to which it has to supply one. How the method
//! itself obtains the root is its [`Boundness`]:
//!
//! | Boundness | Shape after the rewrite | Root obtained from |
//! |-----------|-------------------------|--------------------|
//! | [`Boundness::StaticToInstance`] | instance method on the context type | `this.<root>` |
//! | [`Boundness::StaticWithRootParam`] | static, root as argument 0 | argument 0 |
//! | [`Boundness::InstanceWithRootParam`] | instance, root as argument 1 | argument 1 |
//! | [`Boundness::InstanceWithRootField`] | unchanged signature | `this.<root>` |
//! | [`Boundness::Constructor`] | constructor, root as argument 1 | argument 1 or `this.<root>` |
//!
//! Decisions are memoized in a [`BoundnessCache`]; callers can assert a decision for a method,
//! which then takes precedence over the derived one.

use std::collections::{BTreeMap, BTreeSet};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter};

use crate::{
    analysis::{Diagnostics, InheritanceGraph},
    assembly::Opcode,
    context::{model::ROOT_FIELD, ContextModel},
    metadata::{FieldAttributes, Module, Token, TypeSig},
    Result,
};

/// How a method reaches the root context after the rewrite.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Display,
    EnumIter,
    Serialize,
    Deserialize,
)]
pub enum Boundness {
    /// Untouched by the rewrite
    Unbound,
    /// A static method moved onto its type's context type as an instance method
    StaticToInstance,
    /// A static method that stays static and receives the root as a leading argument
    StaticWithRootParam,
    /// An instance method receiving the root as its first declared parameter
    InstanceWithRootParam,
    /// An instance method of a type that stores the root in a field
    InstanceWithRootField,
    /// A constructor receiving the root as its first declared parameter
    Constructor,
}

impl Boundness {
    /// Returns `true` if the method is touched by the rewrite.
    #[must_use]
    pub const fn is_bound(self) -> bool {
        !matches!(self, Boundness::Unbound)
    }

    /// Returns `true` if a caller has to push something extra: the context instance for
    /// [`Boundness::StaticToInstance`], the root for the parameter forms.
    #[must_use]
    pub const fn requires_caller_root(self) -> bool {
        matches!(
            self,
            Boundness::StaticToInstance
                | Boundness::StaticWithRootParam
                | Boundness::InstanceWithRootParam
                | Boundness::Constructor
        )
    }

    /// Returns `true` if the signature changes, so the rewrite emits a new definition.
    #[must_use]
    pub const fn changes_signature(self) -> bool {
        self.requires_caller_root()
    }

    /// Argument slot of the root parameter, for the parameter forms.
    #[must_use]
    pub const fn root_param(self) -> Option<u16> {
        match self {
            Boundness::StaticWithRootParam => Some(0),
            Boundness::InstanceWithRootParam | Boundness::Constructor => Some(1),
            _ => None,
        }
    }

    /// First original argument index that moves up by one in the rewritten body.
    #[must_use]
    pub const fn shifted_args_from(self) -> Option<u16> {
        match self {
            Boundness::StaticToInstance | Boundness::StaticWithRootParam => Some(0),
            Boundness::InstanceWithRootParam | Boundness::Constructor => Some(1),
            _ => None,
        }
    }
}

/// Memoized boundness decisions.
///
/// Asserted decisions override derived ones and survive [`BoundnessCache::clear_derived`].
#[derive(Debug, Default)]
pub struct BoundnessCache {
    derived: DashMap<Token, Boundness>,
    asserted: DashMap<Token, Boundness>,
}

impl BoundnessCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fixes the decision for `method`, regardless of what the analysis derives.
    pub fn assert(&self, method: Token, boundness: Boundness) {
        self.asserted.insert(method, boundness);
    }

    /// The asserted decision for `method`, if any.
    #[must_use]
    pub fn asserted(&self, method: Token) -> Option<Boundness> {
        self.asserted.get(&method).map(|b| *b)
    }

    /// Records a derived decision.
    pub fn set(&self, method: Token, boundness: Boundness) {
        self.derived.insert(method, boundness);
    }

    /// The effective decision for `method`.
    #[must_use]
    pub fn get(&self, method: Token) -> Boundness {
        self.asserted(method)
            .or_else(|| self.derived.get(&method).map(|b| *b))
            .unwrap_or(Boundness::Unbound)
    }

    /// Forgets every derived decision.
    pub fn clear_derived(&self) {
        self.derived.clear();
    }

    /// Every bound method with its effective decision, in token order.
    #[must_use]
    pub fn bound(&self) -> Vec<(Token, Boundness)> {
        let mut methods: BTreeSet<Token> = self.derived.iter().map(|e| *e.key()).collect();
        methods.extend(self.asserted.iter().map(|e| *e.key()));
        methods
            .into_iter()
            .map(|m| (m, self.get(m)))
            .filter(|(_, b)| b.is_bound())
            .collect()
    }
}

/// Types that keep a root reference in a field, and where that field lives.
#[derive(Debug, Clone, Default)]
pub struct BindingPlan {
    carriers: BTreeSet<Token>,
    root_fields: BTreeMap<Token, Token>,
}

impl BindingPlan {
    /// Types (and interfaces) whose instances reach the root through a field.
    #[must_use]
    pub fn carriers(&self) -> &BTreeSet<Token> {
        &self.carriers
    }

    /// The root field an instance of `ty` carries, declared on `ty` or one of its bases.
    #[must_use]
    pub fn root_field_of(&self, module: &Module, ty: Token) -> Option<Token> {
        let mut current = Some(ty);
        let mut guard = 0;
        while let Some(t) = current {
            if let Some(field) = self.root_fields.get(&t) {
                return Some(*field);
            }
            current = module.type_def(t).ok().and_then(|d| d.base);
            guard += 1;
            if guard > 256 {
                break;
            }
        }
        None
    }
}

/// What a method body does that is relevant to boundness.
#[derive(Debug, Default)]
struct MethodFacts {
    touches_state: bool,
    fields: Vec<Token>,
    calls: Vec<Token>,
    constructs: Vec<Token>,
    function_refs: Vec<Token>,
}

/// Derives the boundness of every method and records it in the cache.
///
/// Runs against the unmodified `snapshot`; new records, root fields and bound field slots are
/// added to `module`.
pub(crate) struct Planner<'a> {
    snapshot: &'a Module,
    inheritance: &'a InheritanceGraph,
    cache: &'a BoundnessCache,
    diagnostics: &'a Diagnostics,
    facts: BTreeMap<Token, MethodFacts>,
    max_rounds: usize,
}

impl<'a> Planner<'a> {
    pub fn new(
        snapshot: &'a Module,
        converted: &BTreeSet<Token>,
        inheritance: &'a InheritanceGraph,
        cache: &'a BoundnessCache,
        diagnostics: &'a Diagnostics,
        max_rounds: usize,
    ) -> Result<Self> {
        let mut facts = BTreeMap::new();
        for method in snapshot.methods_with_body() {
            let mut fact = MethodFacts::default();
            for instr in &snapshot.body(method)?.instructions {
                let Some(token) = instr.token() else {
                    continue;
                };
                match instr.opcode {
                    Opcode::Ldsfld | Opcode::Stsfld if converted.contains(&token) => {
                        fact.touches_state = true;
                        fact.fields.push(token);
                    }
                    Opcode::Call | Opcode::Callvirt => fact.calls.push(token),
                    Opcode::Newobj => fact.constructs.push(token),
                    Opcode::Ldftn | Opcode::Ldvirtftn => fact.function_refs.push(token),
                    _ => {}
                }
            }
            facts.insert(method, fact);
        }
        Ok(Planner {
            snapshot,
            inheritance,
            cache,
            diagnostics,
            facts,
            max_rounds,
        })
    }

    /// Runs the decision procedure.
    ///
    /// Alternates between the "needs a root" fixed point and growing the set of carrier
    /// types until the carrier set is stable, then assigns a [`Boundness`] to every method
    /// that needs a root.
    pub fn run(&self, module: &mut Module, model: &mut ContextModel) -> Result<BindingPlan> {
        let mut carriers: BTreeSet<Token> = BTreeSet::new();
        let mut needs = BTreeSet::new();
        for round in 0..self.max_rounds.max(1) {
            needs = self.needs(model, &carriers);

            // Static callback targets and static initializers cannot take a parameter.
            for method in &needs {
                let def = self.snapshot.method(*method)?;
                if def.is_static()
                    && (def.is_static_constructor() || self.is_function_target(*method))
                {
                    model.create_or_reuse(module, def.declaring_type, self.diagnostics)?;
                }
            }

            let mut grown = self.grow_carriers(module, model, &needs, &carriers);
            for ty in &grown {
                if model.record(*ty).is_none() && model.is_reusable(module, *ty) {
                    model.create_or_reuse(module, *ty, self.diagnostics)?;
                }
            }
            grown.extend(model.records().filter(|r| r.reused).map(|r| r.original));

            if grown.is_subset(&carriers) {
                log::debug!("Boundness stable after {} round(s)", round + 1);
                break;
            }
            carriers.extend(grown);
        }

        let mut plan = BindingPlan {
            carriers: carriers.clone(),
            root_fields: BTreeMap::new(),
        };
        for record in model.records() {
            plan.root_fields.insert(record.context_type, record.root_field);
        }
        for ty in &carriers {
            if plan.root_fields.contains_key(ty) || self.inherits_carrier(*ty, &carriers) {
                continue;
            }
            let def = module.type_def(*ty)?;
            if def.is_interface() || def.is_runtime() {
                continue;
            }
            let field = module.add_field(
                *ty,
                ROOT_FIELD,
                TypeSig::Class(model.root_type()),
                FieldAttributes::COMPILER_GENERATED,
            )?;
            plan.root_fields.insert(*ty, field);
        }

        for method in &needs {
            if self.cache.asserted(*method).is_some() {
                continue;
            }
            let boundness = self.classify(model, &carriers, *method)?;
            self.cache.set(*method, boundness);
        }
        for record in model.records().filter(|r| r.reused) {
            for ctor in self.snapshot.constructors(record.original) {
                if self.cache.asserted(ctor).is_none() {
                    self.cache.set(ctor, Boundness::Constructor);
                }
            }
        }
        Ok(plan)
    }

    fn classify(
        &self,
        model: &ContextModel,
        carriers: &BTreeSet<Token>,
        method: Token,
    ) -> Result<Boundness> {
        let def = self.snapshot.method(method)?;
        let ty = def.declaring_type;
        // Code that reads or stores a self-held singleton cannot run on that singleton.
        let touches_root_held = self
            .facts
            .get(&method)
            .is_some_and(|f| f.fields.iter().any(|field| model.is_root_held(*field)));
        Ok(if def.is_static() {
            if model.record(ty).is_some() && !touches_root_held {
                Boundness::StaticToInstance
            } else {
                Boundness::StaticWithRootParam
            }
        } else if def.is_constructor() {
            Boundness::Constructor
        } else if self.carries(ty, carriers) {
            Boundness::InstanceWithRootField
        } else {
            Boundness::InstanceWithRootParam
        })
    }

    fn carries(&self, ty: Token, carriers: &BTreeSet<Token>) -> bool {
        carriers.contains(&ty) || self.inherits_carrier(ty, carriers)
    }

    fn inherits_carrier(&self, ty: Token, carriers: &BTreeSet<Token>) -> bool {
        self.inheritance
            .hierarchy()
            .base_chain(self.snapshot, ty)
            .iter()
            .skip(1)
            .any(|base| carriers.contains(base))
    }

    fn is_function_target(&self, method: Token) -> bool {
        self.facts.values().any(|f| f.function_refs.contains(&method))
    }

    /// Whether a caller of `callee` has to supply a root or context instance.
    fn caller_supplies(
        &self,
        callee: Token,
        needs: &BTreeSet<Token>,
        carriers: &BTreeSet<Token>,
    ) -> bool {
        if let Some(asserted) = self.cache.asserted(callee) {
            return asserted.requires_caller_root();
        }
        if !needs.contains(&callee) {
            return false;
        }
        match self.snapshot.method(callee) {
            Ok(def) => {
                def.is_static()
                    || def.is_constructor()
                    || !self.carries(def.declaring_type, carriers)
            }
            Err(_) => false,
        }
    }

    fn needs(&self, model: &ContextModel, carriers: &BTreeSet<Token>) -> BTreeSet<Token> {
        let mut needs: BTreeSet<Token> = self
            .cache
            .bound()
            .into_iter()
            .filter(|(m, _)| self.cache.asserted(*m).is_some())
            .map(|(m, _)| m)
            .collect();
        for record in model.records().filter(|r| r.reused) {
            needs.extend(self.snapshot.constructors(record.original));
        }

        loop {
            let mut changed = false;
            for (method, fact) in &self.facts {
                if needs.contains(method)
                    || self.cache.asserted(*method) == Some(Boundness::Unbound)
                {
                    continue;
                }
                let needed = fact.touches_state
                    || fact
                        .calls
                        .iter()
                        .chain(&fact.constructs)
                        .any(|c| self.caller_supplies(*c, &needs, carriers))
                    || fact.constructs.iter().any(|c| {
                        self.snapshot
                            .method(*c)
                            .is_ok_and(|d| self.carries(d.declaring_type, carriers))
                    })
                    || fact.function_refs.iter().any(|f| {
                        needs.contains(f) && self.snapshot.method(*f).is_ok_and(|d| d.is_static())
                    });
                if needed {
                    needs.insert(*method);
                    changed = true;
                }
            }

            // Override families share one slot and therefore one signature.
            let snapshot: Vec<Token> = needs.iter().copied().collect();
            for method in snapshot {
                for member in self.inheritance.family(method) {
                    if self.cache.asserted(member) == Some(Boundness::Unbound) {
                        continue;
                    }
                    let is_method = self
                        .snapshot
                        .method(member)
                        .is_ok_and(|d| !d.is_static() && !d.is_external());
                    if is_method && needs.insert(member) {
                        changed = true;
                    }
                }
            }
            if !changed {
                break;
            }
        }
        needs
    }

    fn grow_carriers(
        &self,
        module: &Module,
        model: &ContextModel,
        needs: &BTreeSet<Token>,
        carriers: &BTreeSet<Token>,
    ) -> BTreeSet<Token> {
        let mut grown = BTreeSet::new();
        let instance_needing = |m: &Token| {
            self.snapshot
                .method(*m)
                .is_ok_and(|d| !d.is_static() && !d.is_constructor())
        };

        for method in needs.iter().filter(|m| instance_needing(m)) {
            let Ok(def) = self.snapshot.method(*method) else {
                continue;
            };
            let ty = def.declaring_type;
            let closure = self.snapshot.type_def(ty).is_ok_and(|t| t.is_closure());
            if closure || self.is_function_target(*method) || model.is_reusable(module, ty) {
                grown.insert(ty);
            }

            let family = self.inheritance.family(*method);
            if family.len() > 1 {
                let fixed = family.iter().any(|m| {
                    self.snapshot
                        .method(*m)
                        .is_ok_and(|d| d.is_external() && !d.is_abstract())
                });
                let forms: BTreeSet<bool> = family
                    .iter()
                    .filter_map(|m| self.snapshot.method(*m).ok())
                    .filter(|d| !d.is_external())
                    .map(|d| self.carries(d.declaring_type, carriers))
                    .collect();
                if fixed || forms.len() > 1 {
                    grown.extend(
                        family
                            .iter()
                            .filter_map(|m| self.snapshot.method(*m).ok())
                            .filter(|d| !d.is_external())
                            .map(|d| d.declaring_type),
                    );
                }
            }
        }
        grown
    }
}
