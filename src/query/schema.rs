//! Member registry the binding compiler resolves identifiers against.
//!
//! Record and side-provider types have no runtime reflection, so each type
//! registers the fields and methods directives may reach. Declaration order is
//! kept: overload resolution picks the first declared method that accepts the
//! argument types.

use std::any::Any;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::error::BoxError;
use crate::query::value::{TypeRef, Value};

/// Erased receiver handed to member callbacks.
pub type Receiver = dyn Any + Send + Sync;

type Getter = Arc<dyn Fn(&Receiver) -> Option<Value> + Send + Sync>;
type Invoker = Arc<dyn Fn(&Receiver, &[Value]) -> Result<Value, CallError> + Send + Sync>;

/// Why a member callback produced no value.
#[derive(Debug)]
pub(crate) enum CallError {
    /// Receiver was not the registered host type.
    Receiver,
    /// The host method itself failed.
    Host(BoxError),
}

/// Readable field of a registered type.
pub struct FieldDef {
    name: Arc<str>,
    ty: TypeRef,
    get: Getter,
}

impl FieldDef {
    /// Field name as written in directives.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Static type of the field.
    pub fn ty(&self) -> &TypeRef {
        &self.ty
    }

    pub(crate) fn read(&self, receiver: &Receiver) -> Option<Value> {
        (self.get)(receiver)
    }
}

impl fmt::Debug for FieldDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.ty)
    }
}

/// Callable method of a registered type.
pub struct MethodDef {
    name: Arc<str>,
    params: Vec<TypeRef>,
    ret: TypeRef,
    call: Invoker,
}

impl MethodDef {
    /// Method name as written in directives.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared parameter types.
    pub fn params(&self) -> &[TypeRef] {
        &self.params
    }

    /// Declared return type.
    pub fn ret(&self) -> &TypeRef {
        &self.ret
    }

    /// Whether every parameter accepts the matching argument type.
    pub fn accepts(&self, args: &[TypeRef]) -> bool {
        self.params.len() == args.len()
            && self
                .params
                .iter()
                .zip(args)
                .all(|(param, arg)| param.accepts(arg))
    }

    pub(crate) fn invoke(&self, receiver: &Receiver, args: &[Value]) -> Result<Value, CallError> {
        (self.call)(receiver, args)
    }
}

impl fmt::Debug for MethodDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.name)?;
        for (i, param) in self.params.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{param}")?;
        }
        write!(f, ") -> {}", self.ret)
    }
}

/// Registered host type with its members in declaration order.
#[derive(Debug)]
pub struct TypeDef {
    name: Arc<str>,
    fields: Vec<Arc<FieldDef>>,
    methods: Vec<Arc<MethodDef>>,
}

impl TypeDef {
    /// Starts registering members of host type `T` under `name`.
    pub fn of<T: Any + Send + Sync>(name: impl Into<Arc<str>>) -> TypeDefBuilder<T> {
        TypeDefBuilder {
            def: TypeDef {
                name: name.into(),
                fields: Vec::new(),
                methods: Vec::new(),
            },
            _host: PhantomData,
        }
    }

    /// Registered type name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The type reference naming this definition.
    pub fn type_ref(&self) -> TypeRef {
        TypeRef::Object(Arc::clone(&self.name))
    }

    /// Looks up a field by name.
    pub fn field(&self, name: &str) -> Option<&Arc<FieldDef>> {
        self.fields.iter().find(|field| &*field.name == name)
    }

    /// Methods with the given name and arity, in declaration order.
    pub fn methods<'a>(
        &'a self,
        name: &'a str,
        arity: usize,
    ) -> impl Iterator<Item = &'a Arc<MethodDef>> + 'a {
        self.methods
            .iter()
            .filter(move |method| &*method.name == name && method.params.len() == arity)
    }
}

/// Fluent builder returned by [`TypeDef::of`].
pub struct TypeDefBuilder<T> {
    def: TypeDef,
    _host: PhantomData<fn(&T)>,
}

impl<T: Any + Send + Sync> TypeDefBuilder<T> {
    /// Registers a readable field.
    pub fn field<F>(mut self, name: impl Into<Arc<str>>, ty: impl Into<TypeRef>, get: F) -> Self
    where
        F: Fn(&T) -> Value + Send + Sync + 'static,
    {
        let getter: Getter = Arc::new(move |receiver: &Receiver| receiver.downcast_ref::<T>().map(&get));
        self.def.fields.push(Arc::new(FieldDef {
            name: name.into(),
            ty: ty.into(),
            get: getter,
        }));
        self
    }

    /// Registers a method. Later registrations with the same name are
    /// overloads and lose ties against earlier ones.
    pub fn method<F>(
        mut self,
        name: impl Into<Arc<str>>,
        params: impl IntoIterator<Item = TypeRef>,
        ret: impl Into<TypeRef>,
        call: F,
    ) -> Self
    where
        F: Fn(&T, &[Value]) -> Result<Value, BoxError> + Send + Sync + 'static,
    {
        let invoker: Invoker = Arc::new(move |receiver: &Receiver, args: &[Value]| {
            let host = receiver.downcast_ref::<T>().ok_or(CallError::Receiver)?;
            call(host, args).map_err(CallError::Host)
        });
        self.def.methods.push(Arc::new(MethodDef {
            name: name.into(),
            params: params.into_iter().collect(),
            ret: ret.into(),
            call: invoker,
        }));
        self
    }

    /// Finishes the definition.
    pub fn build(self) -> TypeDef {
        self.def
    }
}

/// Set of registered types.
#[derive(Debug, Default, Clone)]
pub struct Schema {
    types: FxHashMap<Arc<str>, Arc<TypeDef>>,
}

impl Schema {
    /// Creates an empty schema.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds (or replaces) a type definition.
    pub fn with_type(mut self, def: TypeDef) -> Self {
        self.insert(def);
        self
    }

    /// Adds (or replaces) a type definition in place.
    pub fn insert(&mut self, def: TypeDef) {
        self.types.insert(Arc::clone(&def.name), Arc::new(def));
    }

    /// Looks up a type by name.
    pub fn get(&self, name: &str) -> Option<&Arc<TypeDef>> {
        self.types.get(name)
    }

    /// Resolves the definition behind an object type reference.
    pub fn resolve(&self, ty: &TypeRef) -> Option<&Arc<TypeDef>> {
        match ty {
            TypeRef::Object(name) => self.get(name),
            TypeRef::Scalar(_) | TypeRef::Any => None,
        }
    }

    /// Number of registered types.
    pub fn len(&self) -> usize {
        self.types.len()
    }

    /// Whether no types are registered.
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}
