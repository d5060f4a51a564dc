//! Member-access chains and their cycle-bounded extension.

use std::fmt::{self, Write};

use serde::{Deserialize, Serialize};

use crate::{
    analysis::{ComponentId, TypeFlowIndex},
    metadata::{Module, Token, TypeSig},
};

/// One layer of a member-access chain.
///
/// Two steps denote the same layer only if they are the same variant with the same key;
/// element accesses are index-erased.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MemberStep {
    /// A real instance field
    Field(Token),
    /// Any element of an array or collection
    Element,
    /// The current value of an enumerator over a collection
    Enumerator,
    /// Any number of further accesses inside a recursive type-flow component
    CycleLoop(ComponentId),
}

/// A static field a value may originate from, with the access path from that field.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StaticOrigin {
    /// The static field at the root of the chain
    pub field: Token,
    /// Accesses applied to the field's value, outermost first
    pub chain: Vec<MemberStep>,
}

impl StaticOrigin {
    /// Renders the chain with member names, e.g. `Game.World::players[*].name`.
    #[must_use]
    pub fn display(&self, module: &Module) -> String {
        let mut out = module.field_name(self.field);
        for step in &self.chain {
            match step {
                MemberStep::Field(field) => {
                    out.push('.');
                    out.push_str(module.field(*field).map_or("?", |f| f.name.as_str()));
                }
                MemberStep::Element => out.push_str("[*]"),
                MemberStep::Enumerator => out.push_str(".<current>"),
                MemberStep::CycleLoop(component) => {
                    let _ = write!(out, "..<{component}>");
                }
            }
        }
        out
    }
}

impl fmt::Display for MemberStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemberStep::Field(field) => write!(f, "{field}"),
            MemberStep::Element => write!(f, "[*]"),
            MemberStep::Enumerator => write!(f, "<current>"),
            MemberStep::CycleLoop(component) => write!(f, "<loop {component}>"),
        }
    }
}

/// Where a traced chain starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) enum OriginRoot {
    /// A static field
    Static(Token),
    /// An argument slot of the method the origin was computed in
    Param(u16),
}

/// A chain under construction: root, steps, and the type-flow component at every position
/// (position 0 is the root value, position `i` the value after `steps[i - 1]`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct Origin {
    pub root: OriginRoot,
    pub steps: Vec<MemberStep>,
    components: Vec<Option<ComponentId>>,
    ty: Option<TypeSig>,
}

/// Everything chain extension needs to know about the module.
pub(crate) struct ChainContext<'a> {
    pub module: &'a Module,
    pub typeflow: &'a TypeFlowIndex,
    pub max_depth: usize,
}

impl ChainContext<'_> {
    pub fn root(&self, root: OriginRoot, ty: Option<TypeSig>) -> Origin {
        let component = ty.as_ref().and_then(|t| self.typeflow.component_of_sig(t));
        Origin {
            root,
            steps: Vec::new(),
            components: vec![component],
            ty,
        }
    }

    /// The origin of static field `field`.
    pub fn static_root(&self, field: Token) -> Origin {
        let ty = self.module.field(field).ok().map(|f| f.sig.clone());
        self.root(OriginRoot::Static(field), ty)
    }

    /// Appends `step`, collapsing re-entry into a recursive component into one
    /// [`MemberStep::CycleLoop`]. Chains at the depth limit are returned unchanged.
    pub fn extend(&self, origin: &Origin, step: MemberStep) -> Origin {
        let (ty, component) = match step {
            MemberStep::Field(field) => {
                let ty = self.module.field(field).ok().map(|f| f.sig.clone());
                let component = ty.as_ref().and_then(|t| self.typeflow.component_of_sig(t));
                (ty, component)
            }
            MemberStep::Element | MemberStep::Enumerator => {
                let ty = origin
                    .ty
                    .as_ref()
                    .and_then(TypeSig::element_type)
                    .cloned();
                let component = ty.as_ref().and_then(|t| self.typeflow.component_of_sig(t));
                (ty, component)
            }
            MemberStep::CycleLoop(component) => (None, Some(component)),
        };

        if let Some(component) = component.filter(|c| self.typeflow.is_recursive(*c)) {
            if let Some(entry) = origin.components.iter().position(|c| *c == Some(component)) {
                let mut steps = origin.steps[..entry].to_vec();
                let mut components = origin.components[..=entry].to_vec();
                if steps.last() != Some(&MemberStep::CycleLoop(component)) {
                    steps.push(MemberStep::CycleLoop(component));
                    components.push(Some(component));
                }
                return Origin {
                    root: origin.root,
                    steps,
                    components,
                    ty: None,
                };
            }
        }

        if origin.steps.len() >= self.max_depth {
            return origin.clone();
        }
        let mut extended = origin.clone();
        extended.steps.push(step);
        extended.components.push(component);
        extended.ty = ty;
        extended
    }

    /// Replaces the parameter root of `callee_origin` by `argument`, re-applying every step.
    pub fn substitute(&self, argument: &Origin, callee_origin: &Origin) -> Origin {
        callee_origin
            .steps
            .iter()
            .fold(argument.clone(), |acc, step| self.extend(&acc, *step))
    }
}

impl Origin {
    /// The public form of a static-rooted origin.
    pub fn to_static(&self) -> Option<StaticOrigin> {
        match self.root {
            OriginRoot::Static(field) => Some(StaticOrigin {
                field,
                chain: self.steps.clone(),
            }),
            OriginRoot::Param(_) => None,
        }
    }

    pub fn param(&self) -> Option<u16> {
        match self.root {
            OriginRoot::Param(index) => Some(index),
            OriginRoot::Static(_) => None,
        }
    }
}
