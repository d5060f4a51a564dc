//! Builders for constructing modules programmatically.
//!
//! [`ModuleBuilder`] creates a [`Module`] pre-populated with the runtime core library (the root
//! object type, callback types, asynchronous dispatch primitives and a generic collection) and
//! offers shorthands for declaring user types, fields and methods. [`MethodBuilder`] assembles a
//! single method, using an [`InstructionAssembler`] closure for the body.
//!
//! # Examples
//!
//! ```rust
//! use ctxweave::metadata::{ModuleBuilder, MethodModifiers, TypeSig};
//!
//! let mut builder = ModuleBuilder::new("Game")?;
//! let counter = builder.static_class("Game", "Counter");
//! let n = builder.static_field(counter, "n", TypeSig::I4)?;
//! let bump = builder
//!     .method(counter, "Bump")
//!     .flags(MethodModifiers::STATIC)
//!     .implementation(move |asm| {
//!         asm.ldsfld(n)?.ldc_i4(1)?.add()?.stsfld(n)?.ret()?;
//!         Ok(())
//!     })
//!     .build()?;
//! let module = builder.build();
//! assert_eq!(module.method_name(bump), "Game.Counter::Bump");
//! # Ok::<(), ctxweave::Error>(())
//! ```

use crate::{
    assembly::{InstructionAssembler, MethodBody},
    metadata::{
        method::{CCTOR_NAME, CTOR_NAME},
        FieldAttributes, Intrinsic, MethodModifiers, Module, Param, Token, TypeAttributes,
        TypeSig,
    },
    Result,
};

/// Type alias for method body implementation closures
type ImplementationFn<'a> = Box<dyn FnOnce(&mut InstructionAssembler) -> Result<()> + 'a>;

/// Tokens of a callback (delegate) type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelegateType {
    /// The delegate type
    pub ty: Token,
    /// Its constructor `(object target, native int method)`
    pub ctor: Token,
    /// Its `Invoke` method
    pub invoke: Token,
}

/// Tokens of the runtime core library installed by [`ModuleBuilder::new`].
#[derive(Debug, Clone, Copy)]
pub struct CoreLibrary {
    /// `System.Object`
    pub object: Token,
    /// `System.Object::.ctor`
    pub object_ctor: Token,
    /// `System.MulticastDelegate`
    pub multicast_delegate: Token,
    /// `Delegate.Combine`
    pub combine: Token,
    /// `Delegate.Remove`
    pub remove: Token,
    /// `System.Action`
    pub action: DelegateType,
    /// `Thread.Run(Action)`
    pub thread_run: Token,
    /// `Task.Run(Action)`
    pub task_run: Token,
    /// `ThreadPool.QueueUserWorkItem(Action)`
    pub queue_work_item: Token,
    /// `List<T>`
    pub list: Token,
    /// `List<T>::.ctor`
    pub list_ctor: Token,
    /// `List<T>::get_Item`
    pub list_get: Token,
    /// `List<T>::set_Item`
    pub list_set: Token,
    /// `List<T>::Add`
    pub list_add: Token,
    /// `List<T>::Remove`
    pub list_remove: Token,
    /// `List<T>::Clear`
    pub list_clear: Token,
    /// `List<T>::get_Count`
    pub list_count: Token,
    /// `List<T>::GetEnumerator`
    pub list_get_enumerator: Token,
    /// `List<T>.Enumerator`
    pub enumerator: Token,
    /// `Enumerator::MoveNext`
    pub enumerator_move_next: Token,
    /// `Enumerator::get_Current`
    pub enumerator_current: Token,
}

impl CoreLibrary {
    fn install(module: &mut Module) -> Result<Self> {
        let runtime = TypeAttributes::RUNTIME;
        let object = module.add_type("System", "Object", runtime, None);
        let object_ctor = intrinsic(
            module,
            object,
            CTOR_NAME,
            MethodModifiers::SPECIAL_NAME,
            vec![],
            TypeSig::Void,
            Intrinsic::ObjectCtor,
        )?;

        let multicast_delegate = module.add_type(
            "System",
            "MulticastDelegate",
            runtime | TypeAttributes::ABSTRACT,
            Some(object),
        );
        let delegate_sig = TypeSig::Class(multicast_delegate);
        let pair = vec![
            Param::new("a", delegate_sig.clone()),
            Param::new("b", delegate_sig.clone()),
        ];
        let combine = intrinsic(
            module,
            multicast_delegate,
            "Combine",
            MethodModifiers::STATIC,
            pair.clone(),
            delegate_sig.clone(),
            Intrinsic::DelegateCombine,
        )?;
        let remove = intrinsic(
            module,
            multicast_delegate,
            "Remove",
            MethodModifiers::STATIC,
            pair,
            delegate_sig,
            Intrinsic::DelegateRemove,
        )?;

        let action = add_delegate(
            module,
            multicast_delegate,
            "System",
            "Action",
            vec![],
            TypeSig::Void,
        )?;
        let action_param = vec![Param::new("work", TypeSig::Class(action.ty))];

        let static_runtime = runtime | TypeAttributes::ABSTRACT | TypeAttributes::SEALED;
        let thread = module.add_type("System.Threading", "Thread", static_runtime, Some(object));
        let thread_run = intrinsic(
            module,
            thread,
            "Run",
            MethodModifiers::STATIC,
            action_param.clone(),
            TypeSig::Void,
            Intrinsic::ThreadStart,
        )?;
        let task = module.add_type("System.Threading.Tasks", "Task", static_runtime, Some(object));
        let task_run = intrinsic(
            module,
            task,
            "Run",
            MethodModifiers::STATIC,
            action_param.clone(),
            TypeSig::Void,
            Intrinsic::TaskRun,
        )?;
        let pool = module.add_type("System.Threading", "ThreadPool", static_runtime, Some(object));
        let queue_work_item = intrinsic(
            module,
            pool,
            "QueueUserWorkItem",
            MethodModifiers::STATIC,
            action_param,
            TypeSig::Void,
            Intrinsic::ThreadPoolQueue,
        )?;

        let list = module.add_type("System.Collections.Generic", "List`1", runtime, Some(object));
        module.type_def_mut(list)?.generic_params.push("T".to_string());
        let enumerator = module.add_nested_type(list, "Enumerator", runtime, Some(object))?;
        let item = TypeSig::Object;
        let inst = MethodModifiers::empty();
        let list_ctor = intrinsic(
            module,
            list,
            CTOR_NAME,
            MethodModifiers::SPECIAL_NAME,
            vec![],
            TypeSig::Void,
            Intrinsic::CollectionCtor,
        )?;
        let list_get = intrinsic(
            module,
            list,
            "get_Item",
            inst,
            vec![Param::new("index", TypeSig::I4)],
            item.clone(),
            Intrinsic::CollectionGet,
        )?;
        let list_set = intrinsic(
            module,
            list,
            "set_Item",
            inst,
            vec![Param::new("index", TypeSig::I4), Param::new("value", item.clone())],
            TypeSig::Void,
            Intrinsic::CollectionSet,
        )?;
        let list_add = intrinsic(
            module,
            list,
            "Add",
            inst,
            vec![Param::new("value", item.clone())],
            TypeSig::Void,
            Intrinsic::CollectionAdd,
        )?;
        let list_remove = intrinsic(
            module,
            list,
            "Remove",
            inst,
            vec![Param::new("value", item.clone())],
            TypeSig::Void,
            Intrinsic::CollectionRemove,
        )?;
        let list_clear = intrinsic(
            module,
            list,
            "Clear",
            inst,
            vec![],
            TypeSig::Void,
            Intrinsic::CollectionClear,
        )?;
        let list_count = intrinsic(
            module,
            list,
            "get_Count",
            inst,
            vec![],
            TypeSig::I4,
            Intrinsic::CollectionCount,
        )?;
        let list_get_enumerator = intrinsic(
            module,
            list,
            "GetEnumerator",
            inst,
            vec![],
            TypeSig::Class(enumerator),
            Intrinsic::GetEnumerator,
        )?;
        let enumerator_move_next = intrinsic(
            module,
            enumerator,
            "MoveNext",
            inst,
            vec![],
            TypeSig::Bool,
            Intrinsic::EnumeratorMoveNext,
        )?;
        let enumerator_current = intrinsic(
            module,
            enumerator,
            "get_Current",
            inst,
            vec![],
            item,
            Intrinsic::EnumeratorCurrent,
        )?;

        Ok(CoreLibrary {
            object,
            object_ctor,
            multicast_delegate,
            combine,
            remove,
            action,
            thread_run,
            task_run,
            queue_work_item,
            list,
            list_ctor,
            list_get,
            list_set,
            list_add,
            list_remove,
            list_clear,
            list_count,
            list_get_enumerator,
            enumerator,
            enumerator_move_next,
            enumerator_current,
        })
    }

    /// Signature of `List<element>`.
    #[must_use]
    pub fn list_of(&self, element: TypeSig) -> TypeSig {
        TypeSig::generic(self.list, vec![element])
    }
}

fn intrinsic(
    module: &mut Module,
    ty: Token,
    name: &str,
    flags: MethodModifiers,
    params: Vec<Param>,
    return_type: TypeSig,
    behaviour: Intrinsic,
) -> Result<Token> {
    let token = module.add_method(
        ty,
        name,
        flags | MethodModifiers::EXTERNAL,
        params,
        return_type,
    )?;
    module.method_mut(token)?.intrinsic = Some(behaviour);
    Ok(token)
}

fn add_delegate(
    module: &mut Module,
    multicast_delegate: Token,
    namespace: &str,
    name: &str,
    params: Vec<Param>,
    return_type: TypeSig,
) -> Result<DelegateType> {
    let ty = module.add_type(
        namespace,
        name,
        TypeAttributes::DELEGATE | TypeAttributes::SEALED,
        Some(multicast_delegate),
    );
    let ctor = module.add_method(
        ty,
        CTOR_NAME,
        MethodModifiers::SPECIAL_NAME | MethodModifiers::EXTERNAL,
        vec![
            Param::new("target", TypeSig::Object),
            Param::new("method", TypeSig::I8),
        ],
        TypeSig::Void,
    )?;
    let invoke = intrinsic(
        module,
        ty,
        "Invoke",
        MethodModifiers::VIRTUAL,
        params,
        return_type,
        Intrinsic::DelegateInvoke,
    )?;
    Ok(DelegateType { ty, ctor, invoke })
}

/// Builder for modules with an installed runtime core library.
pub struct ModuleBuilder {
    module: Module,
    core: CoreLibrary,
}

impl ModuleBuilder {
    /// Creates a module named `name` containing the runtime core library.
    ///
    /// # Errors
    /// Returns an error if the core library cannot be installed.
    pub fn new(name: &str) -> Result<Self> {
        let mut module = Module::new(name);
        let core = CoreLibrary::install(&mut module)?;
        Ok(ModuleBuilder { module, core })
    }

    /// The installed core library tokens.
    #[must_use]
    pub fn core(&self) -> &CoreLibrary {
        &self.core
    }

    /// Read access to the module under construction.
    #[must_use]
    pub fn module(&self) -> &Module {
        &self.module
    }

    /// Write access to the module under construction.
    pub fn module_mut(&mut self) -> &mut Module {
        &mut self.module
    }

    /// Declares a class deriving from `System.Object`.
    pub fn class(&mut self, namespace: &str, name: &str) -> Token {
        let object = self.core.object;
        self.module
            .add_type(namespace, name, TypeAttributes::empty(), Some(object))
    }

    /// Declares a class with explicit attributes and base type.
    pub fn add_type(
        &mut self,
        namespace: &str,
        name: &str,
        flags: TypeAttributes,
        base: Option<Token>,
    ) -> Token {
        let base = base.or(Some(self.core.object));
        self.module.add_type(namespace, name, flags, base)
    }

    /// Declares a static (abstract sealed) class.
    pub fn static_class(&mut self, namespace: &str, name: &str) -> Token {
        self.add_type(
            namespace,
            name,
            TypeAttributes::ABSTRACT | TypeAttributes::SEALED,
            None,
        )
    }

    /// Declares an interface.
    pub fn interface(&mut self, namespace: &str, name: &str) -> Token {
        self.module
            .add_type(namespace, name, TypeAttributes::INTERFACE | TypeAttributes::ABSTRACT, None)
    }

    /// Declares a type nested in `enclosing`, deriving from `System.Object`.
    ///
    /// # Errors
    /// Returns [`crate::Error::TypeNotFound`] if `enclosing` does not exist.
    pub fn nested_class(
        &mut self,
        enclosing: Token,
        name: &str,
        flags: TypeAttributes,
    ) -> Result<Token> {
        let object = self.core.object;
        self.module
            .add_nested_type(enclosing, name, flags, Some(object))
    }

    /// Declares an instance field.
    ///
    /// # Errors
    /// Returns [`crate::Error::TypeNotFound`] if `ty` does not exist.
    pub fn field(&mut self, ty: Token, name: &str, sig: TypeSig) -> Result<Token> {
        self.module.add_field(ty, name, sig, FieldAttributes::empty())
    }

    /// Declares a static field.
    ///
    /// # Errors
    /// Returns [`crate::Error::TypeNotFound`] if `ty` does not exist.
    pub fn static_field(&mut self, ty: Token, name: &str, sig: TypeSig) -> Result<Token> {
        self.module.add_field(ty, name, sig, FieldAttributes::STATIC)
    }

    /// Declares a callback (delegate) type.
    ///
    /// # Errors
    /// Returns an error if the delegate's members cannot be added.
    pub fn delegate(
        &mut self,
        namespace: &str,
        name: &str,
        params: Vec<Param>,
        return_type: TypeSig,
    ) -> Result<DelegateType> {
        let multicast = self.core.multicast_delegate;
        add_delegate(&mut self.module, multicast, namespace, name, params, return_type)
    }

    /// Starts building a method named `name` on `ty`.
    pub fn method(&mut self, ty: Token, name: &str) -> MethodBuilder<'_> {
        MethodBuilder::new(&mut self.module, ty, name)
    }

    /// Starts building an instance constructor on `ty`.
    pub fn constructor(&mut self, ty: Token) -> MethodBuilder<'_> {
        let mut builder = MethodBuilder::new(&mut self.module, ty, CTOR_NAME);
        builder.flags = MethodModifiers::SPECIAL_NAME;
        builder
    }

    /// Starts building the static initializer of `ty`.
    pub fn static_constructor(&mut self, ty: Token) -> MethodBuilder<'_> {
        let mut builder = MethodBuilder::new(&mut self.module, ty, CCTOR_NAME);
        builder.flags = MethodModifiers::STATIC | MethodModifiers::SPECIAL_NAME;
        builder
    }

    /// Adds a parameterless constructor that only chains to `System.Object::.ctor`.
    ///
    /// # Errors
    /// Returns [`crate::Error::TypeNotFound`] if `ty` does not exist.
    pub fn default_constructor(&mut self, ty: Token) -> Result<Token> {
        let base_ctor = self.core.object_ctor;
        self.constructor(ty)
            .implementation(move |asm| {
                asm.ldarg(0)?.call(base_ctor)?.ret()?;
                Ok(())
            })
            .build()
    }

    /// Finishes construction and returns the module.
    #[must_use]
    pub fn build(self) -> Module {
        self.module
    }
}

/// Builder for a single method.
pub struct MethodBuilder<'a> {
    module: &'a mut Module,
    declaring: Token,
    name: String,
    flags: MethodModifiers,
    params: Vec<Param>,
    return_type: TypeSig,
    locals: Vec<TypeSig>,
    overrides: Vec<Token>,
    implementation: Option<ImplementationFn<'a>>,
}

impl<'a> MethodBuilder<'a> {
    /// Starts a method named `name` on `declaring`.
    pub fn new(module: &'a mut Module, declaring: Token, name: &str) -> Self {
        MethodBuilder {
            module,
            declaring,
            name: name.to_string(),
            flags: MethodModifiers::empty(),
            params: Vec::new(),
            return_type: TypeSig::Void,
            locals: Vec::new(),
            overrides: Vec::new(),
            implementation: None,
        }
    }

    /// Adds modifier flags.
    #[must_use]
    pub fn flags(mut self, flags: MethodModifiers) -> Self {
        self.flags |= flags;
        self
    }

    /// Appends a parameter.
    #[must_use]
    pub fn param(mut self, name: &str, sig: TypeSig) -> Self {
        self.params.push(Param::new(name, sig));
        self
    }

    /// Sets the return type.
    #[must_use]
    pub fn returns(mut self, sig: TypeSig) -> Self {
        self.return_type = sig;
        self
    }

    /// Declares a local variable; locals are numbered in declaration order.
    #[must_use]
    pub fn local(mut self, sig: TypeSig) -> Self {
        self.locals.push(sig);
        self
    }

    /// Records an explicitly overridden or implemented method.
    #[must_use]
    pub fn overrides(mut self, method: Token) -> Self {
        self.overrides.push(method);
        self
    }

    /// Provides the body.
    #[must_use]
    pub fn implementation<F>(mut self, implementation: F) -> Self
    where
        F: FnOnce(&mut InstructionAssembler) -> Result<()> + 'a,
    {
        self.implementation = Some(Box::new(implementation));
        self
    }

    /// Adds the method to the module.
    ///
    /// # Errors
    /// Returns [`crate::Error::TypeNotFound`] if the declaring type does not exist, or the error
    /// produced by the implementation closure or label resolution.
    pub fn build(self) -> Result<Token> {
        let body = match self.implementation {
            Some(implementation) => {
                let mut asm = InstructionAssembler::new();
                implementation(&mut asm)?;
                Some(MethodBody::new(asm.finalize()?, self.locals))
            }
            None => None,
        };
        let token = self.module.add_method(
            self.declaring,
            &self.name,
            self.flags,
            self.params,
            self.return_type,
        )?;
        let method = self.module.method_mut(token)?;
        method.overrides = self.overrides;
        method.body = body;
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembly::Opcode;

    #[test]
    fn test_core_library() {
        let builder = ModuleBuilder::new("Test").unwrap();
        let core = *builder.core();
        let module = builder.build();
        assert_eq!(module.find_intrinsic(Intrinsic::ObjectCtor), Some(core.object_ctor));
        assert!(module.is_callback_type(core.action.ty));
        assert_eq!(module.delegate_invoke(core.action.ty), Some(core.action.invoke));
        assert_eq!(
            module.type_name(core.enumerator),
            "System.Collections.Generic.List`1/Enumerator"
        );
        assert!(module.method(core.thread_run).unwrap().is_static());
    }

    #[test]
    fn test_method_builder() {
        let mut builder = ModuleBuilder::new("Test").unwrap();
        let ty = builder.class("Game", "Player");
        let ctor = builder.default_constructor(ty).unwrap();
        let run = builder
            .method(ty, "Run")
            .param("x", TypeSig::I4)
            .returns(TypeSig::I4)
            .local(TypeSig::I4)
            .implementation(|asm| {
                asm.ldarg(1)?.stloc(0)?.ldloc(0)?.ret()?;
                Ok(())
            })
            .build()
            .unwrap();
        let module = builder.build();
        assert!(module.method(ctor).unwrap().is_constructor());
        let body = module.body(run).unwrap();
        assert_eq!(body.locals, vec![TypeSig::I4]);
        assert_eq!(body.instructions[3].opcode, Opcode::Ret);
        assert_eq!(module.constructors(ty), vec![ctor]);
    }
}
