//! Shared state of one pipeline run.

use serde::{Deserialize, Serialize};

use crate::{
    analysis::{
        CallGraph, CallbackGraph, Diagnostic, Diagnostics, InheritanceGraph, JumpSiteCache,
        StaticFieldReport, TypeFlowIndex,
    },
    context::{
        BindingPlan, BoundnessCache, ContextModel, ContextTypeRecord, IdMap, InjectionStats,
    },
    metadata::{Module, Token},
    patch::WeaveConfig,
    Error, Result,
};

/// Everything passes share: the frozen input, the module being rewritten and the analyses
/// built so far.
///
/// Whole-program analyses run on the frozen `snapshot` and are built on first access, so a
/// pipeline that never asks for the callback graph never pays for it.
pub struct PatchArguments {
    pub(crate) config: WeaveConfig,
    pub(crate) snapshot: Module,
    pub(crate) module: Module,
    pub(crate) diagnostics: Diagnostics,
    pub(crate) jumps: JumpSiteCache,
    pub(crate) inheritance: Option<InheritanceGraph>,
    pub(crate) callbacks: Option<CallbackGraph>,
    pub(crate) callgraph: Option<CallGraph>,
    pub(crate) typeflow: Option<TypeFlowIndex>,
    pub(crate) report: Option<StaticFieldReport>,
    pub(crate) model: Option<ContextModel>,
    pub(crate) cache: BoundnessCache,
    pub(crate) plan: Option<BindingPlan>,
    pub(crate) methods: IdMap,
    pub(crate) injection: InjectionStats,
}

impl PatchArguments {
    /// Freezes `module` as the analysis snapshot and prepares a working copy.
    #[must_use]
    pub fn new(module: Module, config: WeaveConfig) -> Self {
        let cache = BoundnessCache::new();
        for (method, boundness) in &config.asserted {
            cache.assert(*method, *boundness);
        }
        PatchArguments {
            config,
            snapshot: module.clone(),
            module,
            diagnostics: Diagnostics::new(),
            jumps: JumpSiteCache::new(),
            inheritance: None,
            callbacks: None,
            callgraph: None,
            typeflow: None,
            report: None,
            model: None,
            cache,
            plan: None,
            methods: IdMap::new(),
            injection: InjectionStats::default(),
        }
    }

    /// The run configuration.
    #[must_use]
    pub fn config(&self) -> &WeaveConfig {
        &self.config
    }

    /// The module as it was before any pass ran.
    #[must_use]
    pub fn snapshot(&self) -> &Module {
        &self.snapshot
    }

    /// The module being rewritten.
    #[must_use]
    pub fn module(&self) -> &Module {
        &self.module
    }

    /// Non-fatal findings so far.
    #[must_use]
    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    /// Boundness decisions so far.
    #[must_use]
    pub fn boundness(&self) -> &BoundnessCache {
        &self.cache
    }

    /// The method inheritance graph of the snapshot.
    pub fn inheritance(&mut self) -> &InheritanceGraph {
        self.inheritance
            .get_or_insert_with(|| InheritanceGraph::new(&self.snapshot))
    }

    /// The callback invocation graph of the snapshot.
    ///
    /// # Errors
    /// Returns an error if a method body cannot be read.
    pub fn callbacks(&mut self) -> Result<&CallbackGraph> {
        if self.callbacks.is_none() {
            self.inheritance();
            let inheritance = self
                .inheritance
                .as_ref()
                .ok_or_else(|| missing("inheritance graph"))?;
            let graph = CallbackGraph::build(
                &self.snapshot,
                inheritance,
                &self.jumps,
                &self.diagnostics,
                self.config.max_callback_iterations,
            )?;
            self.callbacks = Some(graph);
        }
        self.callbacks.as_ref().ok_or_else(|| missing("callback graph"))
    }

    /// The method call graph of the snapshot.
    ///
    /// # Errors
    /// Returns an error if the callback graph or the call graph cannot be built.
    pub fn callgraph(&mut self) -> Result<&CallGraph> {
        if self.callgraph.is_none() {
            self.callbacks()?;
            let inheritance = self
                .inheritance
                .as_ref()
                .ok_or_else(|| missing("inheritance graph"))?;
            let callbacks = self.callbacks.as_ref().ok_or_else(|| missing("callback graph"))?;
            let graph = CallGraph::build(
                &self.snapshot,
                inheritance,
                callbacks,
                &self.jumps,
                &self.diagnostics,
            )?;
            self.callgraph = Some(graph);
        }
        self.callgraph.as_ref().ok_or_else(|| missing("call graph"))
    }

    /// The type-flow cycle index of the snapshot.
    ///
    /// # Errors
    /// Returns an error if the type reference graph cannot be condensed.
    pub fn typeflow(&mut self) -> Result<&TypeFlowIndex> {
        if self.typeflow.is_none() {
            self.typeflow = Some(TypeFlowIndex::build(&self.snapshot)?);
        }
        self.typeflow.as_ref().ok_or_else(|| missing("type-flow index"))
    }

    /// The static field report.
    ///
    /// # Errors
    /// Returns [`Error::Pipeline`] if no analysis pass ran yet.
    pub fn report(&self) -> Result<&StaticFieldReport> {
        self.report
            .as_ref()
            .ok_or_else(|| missing("static field report"))
    }

    /// The context model.
    ///
    /// # Errors
    /// Returns [`Error::Pipeline`] if no model pass ran yet.
    pub fn model(&self) -> Result<&ContextModel> {
        self.model.as_ref().ok_or_else(|| missing("context model"))
    }

    /// The binding plan.
    ///
    /// # Errors
    /// Returns [`Error::Pipeline`] if no planning pass ran yet.
    pub fn plan(&self) -> Result<&BindingPlan> {
        self.plan.as_ref().ok_or_else(|| missing("binding plan"))
    }

    /// Original ↔ bound method map built by injection.
    #[must_use]
    pub fn method_map(&self) -> &IdMap {
        &self.methods
    }

    /// Methods whose bodies the pipeline rewrote or generated, in the rewritten module.
    #[must_use]
    pub fn rewritten_methods(&self) -> Vec<Token> {
        let mut methods: Vec<Token> = self
            .cache
            .bound()
            .into_iter()
            .map(|(method, _)| self.methods.translate(method))
            .collect();
        if let Some(model) = &self.model {
            methods.push(model.root_ctor());
            methods.extend(model.records().filter(|r| !r.reused).map(|r| r.constructor));
        }
        methods.sort_unstable();
        methods.dedup();
        methods
    }

    /// Consumes the arguments, producing the pipeline output.
    ///
    /// # Errors
    /// Returns [`Error::Pipeline`] if no analysis pass ran.
    pub fn into_output(self) -> Result<PatchOutput> {
        let report = self.report.ok_or_else(|| missing("static field report"))?;
        let (field_map, context_types) = match &self.model {
            Some(model) => (
                model.field_map().clone(),
                model.records().cloned().collect(),
            ),
            None => (IdMap::new(), Vec::new()),
        };
        Ok(PatchOutput {
            root_type: self.model.as_ref().map(ContextModel::root_type),
            module: self.module,
            method_map: self.methods,
            field_map,
            context_types,
            report,
            injection: self.injection,
            diagnostics: self.diagnostics.to_vec(),
        })
    }
}

fn missing(what: &str) -> Error {
    Error::Pipeline(format!("{what} is not available at this point of the pipeline"))
}

/// Result of a weave run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatchOutput {
    /// The rewritten module
    pub module: Module,
    /// The root context type, if a context model was built
    pub root_type: Option<Token>,
    /// Original ↔ context-bound methods
    pub method_map: IdMap,
    /// Original static ↔ context-bound instance fields
    pub field_map: IdMap,
    /// Context records in creation order
    pub context_types: Vec<ContextTypeRecord>,
    /// The static field analysis result
    pub report: StaticFieldReport,
    /// Injection counters
    pub injection: InjectionStats,
    /// Non-fatal findings
    pub diagnostics: Vec<Diagnostic>,
}

#[derive(Serialize)]
struct IdMaps<'a> {
    methods: &'a IdMap,
    fields: &'a IdMap,
}

impl PatchOutput {
    /// Serializes both id maps as `{"methods": .., "fields": ..}`.
    ///
    /// # Errors
    /// Returns [`Error::Serialization`] if encoding fails.
    pub fn id_maps_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&IdMaps {
            methods: &self.method_map,
            fields: &self.field_map,
        })?)
    }

    /// The context record of `original`, if its state moved.
    #[must_use]
    pub fn context_of(&self, original: Token) -> Option<&ContextTypeRecord> {
        self.context_types.iter().find(|r| r.original == original)
    }
}
