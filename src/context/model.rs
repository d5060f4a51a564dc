//! The context data model.
//!
//! Every original type whose static state moves into per-instance scope gets one
//! [`ContextTypeRecord`]. Most records describe a freshly synthesized context type, nested under
//! the context type of the original's declaring type (or directly under the root context), with
//! a constructor taking the root and the parent instance and a link field on the parent. Types
//! that already behave as a single global instance are reused in place instead, see
//! [`SingletonShape`].

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::{
    analysis::{DiagnosticKind, Diagnostics, JumpSiteCache},
    assembly::Opcode,
    context::IdMap,
    metadata::{
        method::CTOR_NAME, FieldAttributes, Intrinsic, MethodModifiers, Module, Param, Token,
        TypeAttributes, TypeSig,
    },
    Error, Result,
};

/// Name of the root-context back reference on context types and reused singletons.
pub const ROOT_FIELD: &str = "<root>";
/// Name of the parent back reference on synthesized context types.
pub const PARENT_FIELD: &str = "<parent>";

/// How an original type's static state is represented after the rewrite.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextTypeRecord {
    /// The original type
    pub original: Token,
    /// The type holding the converted state (the original itself when reused)
    pub context_type: Token,
    /// Constructor of `context_type`; for reused types this is the original constructor
    pub constructor: Token,
    /// Link fields from the root context down to the instance of `context_type`
    pub chain: Vec<Token>,
    /// `true` if the original type is reused in place as a singleton
    pub reused: bool,
    /// Field on `context_type` referencing the root context
    pub root_field: Token,
    /// Context type of the parent record, `None` when nested directly under the root
    pub parent: Option<Token>,
    /// Field on `context_type` referencing the parent instance (synthesized types only)
    pub parent_field: Option<Token>,
    /// Originals of synthesized records nested under this one, in creation order
    pub children: Vec<Token>,
    /// Per-context static initializer, once the original `.cctor` has been moved
    pub static_init: Option<Token>,
}

impl ContextTypeRecord {
    /// The link field that reaches this record's instance from its parent.
    #[must_use]
    pub fn link_field(&self) -> Option<Token> {
        self.chain.last().copied()
    }
}

/// Syntactic singleton evidence for one type.
///
/// A type is reused in place only if it has exactly one instance constructor, that constructor
/// is invoked from exactly one site, and the constructed value is stored into exactly one static
/// field of the type's own type. That field may be declared on another type or on the singleton
/// itself; a self-held instance is bound directly on the root context.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SingletonShape {
    /// Number of instance constructors
    pub constructors: usize,
    /// Number of `newobj` sites of any of those constructors
    pub construction_sites: usize,
    /// Static fields of matching type receiving a constructed instance
    pub fields: Vec<Token>,
}

impl SingletonShape {
    fn criteria(&self) -> [bool; 3] {
        [
            self.constructors == 1,
            self.construction_sites == 1,
            self.fields.len() == 1,
        ]
    }

    /// Returns `true` if every criterion holds.
    #[must_use]
    pub fn is_singleton(&self) -> bool {
        self.criteria().iter().all(|c| *c)
    }

    /// Returns `true` if exactly one criterion fails.
    #[must_use]
    pub fn is_borderline(&self) -> bool {
        self.criteria().iter().filter(|c| !**c).count() == 1
    }

    /// The single singleton field, if the shape qualifies.
    #[must_use]
    pub fn field(&self) -> Option<Token> {
        if self.is_singleton() {
            self.fields.first().copied()
        } else {
            None
        }
    }

    fn describe(&self) -> String {
        format!(
            "{} constructor(s), {} construction site(s), {} matching static field(s)",
            self.constructors,
            self.construction_sites,
            self.fields.len()
        )
    }
}

/// Construction sites and their static stores, collected from the unmodified module.
#[derive(Debug, Clone, Default)]
pub struct SingletonIndex {
    shapes: BTreeMap<Token, SingletonShape>,
}

impl SingletonIndex {
    /// Scans every body of `module` for `newobj` sites and the static fields their results
    /// are stored into.
    ///
    /// # Errors
    /// Returns an error if a method body cannot be mapped.
    pub fn build(module: &Module, jumps: &JumpSiteCache) -> Result<Self> {
        let mut shapes: BTreeMap<Token, SingletonShape> = BTreeMap::new();
        for ty in module.types() {
            if ty.is_value_type() || ty.is_abstract() || ty.is_delegate() || ty.is_runtime() {
                continue;
            }
            shapes.insert(
                ty.token,
                SingletonShape {
                    constructors: module.constructors(ty.token).len(),
                    ..SingletonShape::default()
                },
            );
        }

        for method in module.methods_with_body() {
            let body = module.body(method)?;
            let map = jumps.get(module, method)?;
            for (index, instr) in body.instructions.iter().enumerate() {
                if instr.opcode != Opcode::Newobj {
                    continue;
                }
                let Some(ctor) = instr.token().and_then(|t| module.method(t).ok()) else {
                    continue;
                };
                let ty = ctor.declaring_type;
                let Some(shape) = shapes.get_mut(&ty) else {
                    continue;
                };
                shape.construction_sites += 1;

                for (store, candidate) in body.instructions.iter().enumerate() {
                    if candidate.opcode != Opcode::Stsfld {
                        continue;
                    }
                    let Some(field) = candidate.token().and_then(|t| module.field(t).ok()) else {
                        continue;
                    };
                    if field.sig.type_token() != Some(ty) || shape.fields.contains(&field.token) {
                        continue;
                    }
                    if map.operand_producers(body, store, 0).contains(&index) {
                        shape.fields.push(field.token);
                    }
                }
            }
        }
        Ok(SingletonIndex { shapes })
    }

    /// Evidence for `ty`, `None` for types that can never be reused (value types, abstract
    /// types, callbacks, runtime types).
    #[must_use]
    pub fn shape(&self, ty: Token) -> Option<&SingletonShape> {
        self.shapes.get(&ty)
    }
}

/// Naming of synthesized context types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextNames {
    /// Namespace of the root context type
    pub namespace: String,
    /// Name of the root context type
    pub root: String,
    /// Suffix appended to an original type's name to name its context type
    pub suffix: String,
}

impl Default for ContextNames {
    fn default() -> Self {
        ContextNames {
            namespace: String::new(),
            root: "RootContext".to_string(),
            suffix: "Ctx".to_string(),
        }
    }
}

/// Per-type context records plus the converted field map.
///
/// The model only grows: records are created on demand and never removed.
#[derive(Debug)]
pub struct ContextModel {
    root: Token,
    root_ctor: Token,
    object_ctor: Token,
    names: ContextNames,
    records: BTreeMap<Token, ContextTypeRecord>,
    order: Vec<Token>,
    top_level: Vec<Token>,
    by_context: BTreeMap<Token, Token>,
    in_progress: BTreeSet<Token>,
    singletons: SingletonIndex,
    converted: BTreeSet<Token>,
    root_held: BTreeSet<Token>,
    fields: IdMap,
}

/// Outcome of the singleton reuse check for one type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reuse {
    Field(Token),
    NotSingleton,
    Refused(&'static str),
}

impl ContextModel {
    /// Creates the root context type inside `module`.
    ///
    /// `converted` is the set of static fields moving into context scope; a singleton is only
    /// reused if its singleton field is part of it.
    ///
    /// # Errors
    /// Returns [`Error::Malformed`] if `module` has no object constructor to derive from.
    pub fn new(
        module: &mut Module,
        singletons: SingletonIndex,
        converted: BTreeSet<Token>,
        names: ContextNames,
    ) -> Result<Self> {
        let object_ctor = module
            .find_intrinsic(Intrinsic::ObjectCtor)
            .ok_or_else(|| malformed_error!("Module has no object constructor"))?;
        let object = module.method(object_ctor)?.declaring_type;

        let root = module.add_type(
            &names.namespace,
            &names.root,
            TypeAttributes::CONTEXT | TypeAttributes::SEALED,
            Some(object),
        );
        let root_ctor = module.add_method(
            root,
            CTOR_NAME,
            MethodModifiers::SPECIAL_NAME,
            Vec::new(),
            TypeSig::Void,
        )?;
        log::debug!("Created root context {}", module.type_name(root));

        Ok(ContextModel {
            root,
            root_ctor,
            object_ctor,
            names,
            records: BTreeMap::new(),
            order: Vec::new(),
            top_level: Vec::new(),
            by_context: BTreeMap::new(),
            in_progress: BTreeSet::new(),
            singletons,
            converted,
            root_held: BTreeSet::new(),
            fields: IdMap::new(),
        })
    }

    /// The root context type.
    #[must_use]
    pub fn root_type(&self) -> Token {
        self.root
    }

    /// The parameterless root context constructor.
    #[must_use]
    pub fn root_ctor(&self) -> Token {
        self.root_ctor
    }

    /// `System.Object::.ctor`, the base constructor of every context type.
    #[must_use]
    pub fn object_ctor(&self) -> Token {
        self.object_ctor
    }

    /// Record for `original`, if one was created.
    #[must_use]
    pub fn record(&self, original: Token) -> Option<&ContextTypeRecord> {
        self.records.get(&original)
    }

    pub(crate) fn record_mut(&mut self, original: Token) -> Option<&mut ContextTypeRecord> {
        self.records.get_mut(&original)
    }

    /// The original type a context type stands for.
    #[must_use]
    pub fn original_of(&self, context_type: Token) -> Option<Token> {
        self.by_context.get(&context_type).copied()
    }

    /// All records in creation order (parents before children).
    pub fn records(&self) -> impl Iterator<Item = &ContextTypeRecord> {
        self.order.iter().filter_map(|t| self.records.get(t))
    }

    /// Originals of the synthesized records nested directly under the root.
    #[must_use]
    pub fn top_level(&self) -> &[Token] {
        &self.top_level
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns `true` if no record was created.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Returns `true` if `field` moves into context scope.
    #[must_use]
    pub fn is_converted(&self, field: Token) -> bool {
        self.converted.contains(&field)
    }

    /// Static fields moving into context scope.
    #[must_use]
    pub fn converted(&self) -> &BTreeSet<Token> {
        &self.converted
    }

    /// Original static field → context-bound instance field.
    #[must_use]
    pub fn field_map(&self) -> &IdMap {
        &self.fields
    }

    /// Singleton evidence for `ty`.
    #[must_use]
    pub fn singleton_shape(&self, ty: Token) -> Option<&SingletonShape> {
        self.singletons.shape(ty)
    }

    /// Returns `true` if `ty` would be reused in place by [`ContextModel::create_or_reuse`].
    #[must_use]
    pub fn is_reusable(&self, module: &Module, ty: Token) -> bool {
        matches!(self.reuse_decision(module, ty), Reuse::Field(_))
    }

    /// Returns `true` if converted static `field` is bound directly on the root context.
    ///
    /// This is the case for the instance field of a singleton that holds itself.
    #[must_use]
    pub fn is_root_held(&self, field: Token) -> bool {
        self.root_held.contains(&field)
    }

    fn reuse_decision(&self, module: &Module, ty: Token) -> Reuse {
        let Some(field) = self.singletons.shape(ty).and_then(SingletonShape::field) else {
            return Reuse::NotSingleton;
        };
        let Ok(holder) = module.field(field).map(|f| f.declaring_type) else {
            return Reuse::NotSingleton;
        };
        if !self.converted.contains(&field) {
            Reuse::Refused("its instance field is not converted")
        } else if holder != ty && self.in_progress.contains(&holder) {
            Reuse::Refused("its holder depends on it")
        } else if module.type_def(holder).map_or(true, |t| t.is_runtime()) {
            Reuse::Refused("its instance field is held by a runtime type")
        } else {
            Reuse::Field(field)
        }
    }

    /// Returns the record for `original`, creating it (and its parents) if needed.
    ///
    /// # Errors
    /// Returns an error if `original` does not exist or a definition cannot be added.
    pub fn create_or_reuse(
        &mut self,
        module: &mut Module,
        original: Token,
        diagnostics: &Diagnostics,
    ) -> Result<&ContextTypeRecord> {
        self.ensure(module, original, diagnostics)?;
        self.records
            .get(&original)
            .ok_or(Error::TypeNotFound(original))
    }

    fn ensure(
        &mut self,
        module: &mut Module,
        original: Token,
        diagnostics: &Diagnostics,
    ) -> Result<()> {
        if self.records.contains_key(&original) {
            return Ok(());
        }
        if !self.in_progress.insert(original) {
            return Err(invariant_error!(
                original,
                None,
                "context record for {} depends on itself",
                module.type_name(original)
            ));
        }

        let result = match self.reuse_decision(module, original) {
            Reuse::Field(field) => self.reuse(module, original, field, diagnostics),
            decision => {
                let reason = match (decision, self.singletons.shape(original)) {
                    (Reuse::Refused(reason), Some(shape)) => {
                        Some(format!("{}, but {reason}", shape.describe()))
                    }
                    (_, Some(shape)) if shape.is_borderline() => Some(shape.describe()),
                    _ => None,
                };
                if let Some(reason) = reason {
                    diagnostics.push(
                        DiagnosticKind::BorderlineSingleton,
                        None,
                        None,
                        format!(
                            "{} almost qualifies as a singleton ({reason}); \
                             synthesizing a context type",
                            module.type_name(original)
                        ),
                    );
                }
                self.synthesize(module, original, diagnostics)
            }
        };
        self.in_progress.remove(&original);
        result
    }

    fn reuse(
        &mut self,
        module: &mut Module,
        original: Token,
        field: Token,
        diagnostics: &Diagnostics,
    ) -> Result<()> {
        let holder = module.field(field)?.declaring_type;
        let chain = if holder == original {
            // A self-held instance hangs off the root; reaching it cannot need the instance.
            let def = module.field(field)?.clone();
            let name = unique_field_name(module, self.root, &def.name);
            let flags = def.flags - FieldAttributes::STATIC - FieldAttributes::INIT_ONLY;
            let link = module.add_field(self.root, &name, def.sig, flags)?;
            self.fields.insert(field, link)?;
            self.root_held.insert(field);
            vec![link]
        } else {
            self.ensure(module, holder, diagnostics)?;
            let bound = self.bind_field(module, field, diagnostics)?;
            let mut chain = self
                .records
                .get(&holder)
                .ok_or(Error::TypeNotFound(holder))?
                .chain
                .clone();
            chain.push(bound);
            chain
        };

        let constructor = module
            .constructors(original)
            .first()
            .copied()
            .ok_or(Error::TypeNotFound(original))?;
        let root_field = module.add_field(
            original,
            ROOT_FIELD,
            TypeSig::Class(self.root),
            FieldAttributes::COMPILER_GENERATED,
        )?;

        log::info!(
            "Reusing singleton {} in place (instance held by {})",
            module.type_name(original),
            module.field_name(field)
        );
        self.insert(ContextTypeRecord {
            original,
            context_type: original,
            constructor,
            chain,
            reused: true,
            root_field,
            parent: None,
            parent_field: None,
            children: Vec::new(),
            static_init: None,
        });
        Ok(())
    }

    fn synthesize(
        &mut self,
        module: &mut Module,
        original: Token,
        diagnostics: &Diagnostics,
    ) -> Result<()> {
        let def = module.type_def(original)?;
        let name = def.name.clone();
        let enclosing = def
            .enclosing
            .filter(|e| module.type_def(*e).is_ok_and(|t| !t.is_runtime()));

        // Reused singletons keep their original constructors, so nothing nests under them.
        let mut enclosing_record = None;
        if let Some(outer) = enclosing {
            self.ensure(module, outer, diagnostics)?;
            let record = self.records.get(&outer).ok_or(Error::TypeNotFound(outer))?;
            if !record.reused {
                enclosing_record = Some(outer);
            }
        }
        let enclosing_context = enclosing_record.and_then(|outer| self.records.get(&outer));
        let (parent, mut chain) = match enclosing_context {
            Some(record) => (Some(record.context_type), record.chain.clone()),
            None => (None, Vec::new()),
        };
        let parent_type = parent.unwrap_or(self.root);
        let object = module.method(self.object_ctor)?.declaring_type;

        let base_name = format!("{name}{}", self.names.suffix);
        let type_name = unique_type_name(module, parent_type, &base_name);
        let context_type = module.add_nested_type(
            parent_type,
            &type_name,
            TypeAttributes::CONTEXT | TypeAttributes::SEALED,
            Some(object),
        )?;
        let root_field = module.add_field(
            context_type,
            ROOT_FIELD,
            TypeSig::Class(self.root),
            FieldAttributes::COMPILER_GENERATED,
        )?;
        let parent_field = module.add_field(
            context_type,
            PARENT_FIELD,
            TypeSig::Class(parent_type),
            FieldAttributes::COMPILER_GENERATED,
        )?;
        let constructor = module.add_method(
            context_type,
            CTOR_NAME,
            MethodModifiers::SPECIAL_NAME,
            vec![
                Param::new("root", TypeSig::Class(self.root)),
                Param::new("parent", TypeSig::Class(parent_type)),
            ],
            TypeSig::Void,
        )?;
        let link_name = unique_field_name(module, parent_type, &name);
        let link = module.add_field(
            parent_type,
            &link_name,
            TypeSig::Class(context_type),
            FieldAttributes::empty(),
        )?;
        chain.push(link);

        match enclosing_record.and_then(|outer| self.records.get_mut(&outer)) {
            Some(parent_record) => parent_record.children.push(original),
            None => self.top_level.push(original),
        }

        log::debug!(
            "Synthesized {} for {}",
            module.type_name(context_type),
            module.type_name(original)
        );
        self.insert(ContextTypeRecord {
            original,
            context_type,
            constructor,
            chain,
            reused: false,
            root_field,
            parent,
            parent_field: Some(parent_field),
            children: Vec::new(),
            static_init: None,
        });
        Ok(())
    }

    fn insert(&mut self, record: ContextTypeRecord) {
        self.by_context.insert(record.context_type, record.original);
        self.order.push(record.original);
        self.records.insert(record.original, record);
    }

    /// Returns the context-bound instance field of converted static `field`, creating it on
    /// the context type of the field's declaring type.
    ///
    /// # Errors
    /// Returns an error if the field does not exist or the record cannot be created.
    pub fn bind_field(
        &mut self,
        module: &mut Module,
        field: Token,
        diagnostics: &Diagnostics,
    ) -> Result<Token> {
        if let Some(bound) = self.fields.get(field) {
            return Ok(bound);
        }
        let def = module.field(field)?.clone();
        self.ensure(module, def.declaring_type, diagnostics)?;
        // A reused holder may have bound this field while its own record was created.
        if let Some(bound) = self.fields.get(field) {
            return Ok(bound);
        }
        let record = self
            .records
            .get(&def.declaring_type)
            .ok_or(Error::TypeNotFound(def.declaring_type))?;

        let flags = def.flags - FieldAttributes::STATIC - FieldAttributes::INIT_ONLY;
        let bound = if record.reused {
            module.field_mut(field)?.flags = flags;
            field
        } else {
            module.add_field(record.context_type, &def.name, def.sig.clone(), flags)?
        };
        self.fields.insert(field, bound)?;
        Ok(bound)
    }
}

fn unique_type_name(module: &Module, enclosing: Token, base: &str) -> String {
    let taken: BTreeSet<String> = module
        .types()
        .filter(|t| t.enclosing == Some(enclosing))
        .map(|t| t.name.clone())
        .collect();
    unique(base, &taken)
}

fn unique_field_name(module: &Module, ty: Token, base: &str) -> String {
    let taken: BTreeSet<String> = module
        .type_def(ty)
        .map(|t| {
            t.fields
                .iter()
                .filter_map(|f| module.field(*f).ok())
                .map(|f| f.name.clone())
                .collect()
        })
        .unwrap_or_default();
    unique(base, &taken)
}

fn unique(base: &str, taken: &BTreeSet<String>) -> String {
    if !taken.contains(base) {
        return base.to_string();
    }
    (2..)
        .map(|n| format!("{base}{n}"))
        .find(|candidate| !taken.contains(candidate))
        .unwrap_or_else(|| base.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::ModuleBuilder;

    /// `Services.Registry` holds the one `Game.Engine` created by `Services.Setup`.
    fn singleton_module(second_site: bool) -> (Module, Token, Token) {
        let mut builder = ModuleBuilder::new("Singletons").unwrap();
        let engine = builder.class("Game", "Engine");
        let ctor = builder.default_constructor(engine).unwrap();
        let registry = builder.static_class("Services", "Registry");
        let instance = builder
            .static_field(registry, "engine", TypeSig::Class(engine))
            .unwrap();
        builder
            .method(registry, "Setup")
            .flags(MethodModifiers::STATIC)
            .implementation(move |asm| {
                asm.newobj(ctor)?.stsfld(instance)?;
                if second_site {
                    asm.newobj(ctor)?.pop()?;
                }
                asm.ret()?;
                Ok(())
            })
            .build()
            .unwrap();
        (builder.build(), engine, instance)
    }

    fn model(module: &mut Module, converted: &[Token]) -> ContextModel {
        let index = SingletonIndex::build(module, &JumpSiteCache::new()).unwrap();
        ContextModel::new(
            module,
            index,
            converted.iter().copied().collect(),
            ContextNames::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_single_site_reuses_in_place() {
        let (mut module, engine, instance) = singleton_module(false);
        let diagnostics = Diagnostics::new();
        let mut model = model(&mut module, &[instance]);
        assert!(model.singleton_shape(engine).unwrap().is_singleton());

        let record = model.create_or_reuse(&mut module, engine, &diagnostics).unwrap().clone();
        assert!(record.reused);
        assert_eq!(record.context_type, engine);
        assert_eq!(record.chain.len(), 2);
        assert_eq!(record.link_field(), Some(model.field_map().get(instance).unwrap()));
        assert!(module.find_field(engine, ROOT_FIELD).is_some());
        assert!(diagnostics.is_empty());
    }

    /// `Game.Engine` keeps its one instance in its own `instance` field.
    fn self_held_module() -> (Module, Token, Token, Token) {
        let mut builder = ModuleBuilder::new("SelfHeld").unwrap();
        let engine = builder.class("Game", "Engine");
        let ctor = builder.default_constructor(engine).unwrap();
        let instance = builder
            .static_field(engine, "instance", TypeSig::Class(engine))
            .unwrap();
        let frames = builder.static_field(engine, "frames", TypeSig::I4).unwrap();
        builder
            .method(engine, "Init")
            .flags(MethodModifiers::STATIC)
            .implementation(move |asm| {
                asm.newobj(ctor)?.stsfld(instance)?.ret()?;
                Ok(())
            })
            .build()
            .unwrap();
        (builder.build(), engine, instance, frames)
    }

    #[test]
    fn test_self_held_singleton_reuses_in_place() {
        let (mut module, engine, instance, frames) = self_held_module();
        let diagnostics = Diagnostics::new();
        let mut model = model(&mut module, &[instance, frames]);
        assert!(model.is_reusable(&module, engine));

        let bound_frames = model.bind_field(&mut module, frames, &diagnostics).unwrap();
        let record = model.record(engine).unwrap().clone();
        assert!(record.reused);
        assert_eq!(record.context_type, engine);
        assert_eq!(record.chain.len(), 1);

        let link = record.link_field().unwrap();
        assert!(model.is_root_held(instance));
        assert_eq!(model.field_map().get(instance), Some(link));
        assert_eq!(module.field(link).unwrap().declaring_type, model.root_type());
        assert!(!module.field(link).unwrap().is_static());

        assert_eq!(bound_frames, frames);
        assert!(!module.field(frames).unwrap().is_static());
        assert!(model.top_level().is_empty());
        assert!(diagnostics.is_empty());
    }

    #[test]
    fn test_refused_reuse_is_reported() {
        let (mut module, engine, _, frames) = self_held_module();
        let diagnostics = Diagnostics::new();
        let mut model = model(&mut module, &[frames]);
        assert!(model.singleton_shape(engine).unwrap().is_singleton());
        assert!(!model.is_reusable(&module, engine));

        model.bind_field(&mut module, frames, &diagnostics).unwrap();
        assert!(!model.record(engine).unwrap().reused);
        assert_eq!(diagnostics.count(DiagnosticKind::BorderlineSingleton), 1);
    }

    #[test]
    fn test_second_site_forces_new_type() {
        let (mut module, engine, instance) = singleton_module(true);
        let diagnostics = Diagnostics::new();
        let mut model = model(&mut module, &[instance]);

        let record = model.create_or_reuse(&mut module, engine, &diagnostics).unwrap().clone();
        assert!(!record.reused);
        assert_ne!(record.context_type, engine);
        assert_eq!(module.type_name(record.context_type), "RootContext/EngineCtx");
        assert_eq!(diagnostics.count(DiagnosticKind::BorderlineSingleton), 1);
    }

    #[test]
    fn test_nested_records_and_field_binding() {
        let mut builder = ModuleBuilder::new("Nested").unwrap();
        let outer = builder.static_class("Game", "World");
        let inner = builder
            .nested_class(outer, "Clock", TypeAttributes::ABSTRACT | TypeAttributes::SEALED)
            .unwrap();
        let ticks = builder.static_field(inner, "ticks", TypeSig::I8).unwrap();
        let mut module = builder.build();
        let diagnostics = Diagnostics::new();
        let mut model = model(&mut module, &[ticks]);

        let bound = model.bind_field(&mut module, ticks, &diagnostics).unwrap();
        let clock = model.record(inner).unwrap();
        let world = model.record(outer).unwrap();
        assert_eq!(clock.parent, Some(world.context_type));
        assert_eq!(clock.chain.len(), 2);
        assert_eq!(world.children, vec![inner]);
        assert_eq!(model.top_level(), &[outer]);
        assert_eq!(module.field(bound).unwrap().declaring_type, clock.context_type);
        assert!(!module.field(bound).unwrap().is_static());
        assert_eq!(
            module.type_name(clock.context_type),
            "RootContext/WorldCtx/ClockCtx"
        );
        assert_eq!(model.bind_field(&mut module, ticks, &diagnostics).unwrap(), bound);
    }
}
