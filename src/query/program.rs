//! Binding programs and the stack machine that evaluates them.
//!
//! A program is the compiled form of one directive. Programs synthesized in
//! the same pass share a [`Frame`]: local slots stored by an earlier program
//! are visible to later ones, and the side provider is resolved once.

use std::fmt;
use std::sync::Arc;

use smallvec::SmallVec;

use crate::error::BoxError;
use crate::query::schema::{CallError, FieldDef, MethodDef};
use crate::query::value::{TypeRef, Value};

/// Primitive operation emitted by the binding compiler.
#[derive(Clone)]
pub enum Op {
    /// Push the input record.
    LoadRecord,
    /// First side-provider dereference in a pass: resolve, cache and push.
    ResolveProvider,
    /// Push the side-provider handle cached by [`Op::ResolveProvider`].
    LoadProvider,
    /// Pop a receiver and push one of its fields.
    LoadField(Arc<FieldDef>),
    /// Push the value held in a local slot.
    LoadLocal(usize),
    /// Copy the top of the stack into a local slot.
    StoreLocal(usize),
    /// Pop `argc` arguments and a receiver, push the method result.
    Invoke {
        /// Resolved overload.
        method: Arc<MethodDef>,
        /// Number of arguments to pop.
        argc: usize,
    },
    /// Push a literal.
    PushConstant(Value),
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Op::LoadRecord => f.write_str("load_record"),
            Op::ResolveProvider => f.write_str("resolve_provider"),
            Op::LoadProvider => f.write_str("load_provider"),
            Op::LoadField(field) => write!(f, "load_field {}", field.name()),
            Op::LoadLocal(slot) => write!(f, "load_local {slot}"),
            Op::StoreLocal(slot) => write!(f, "store_local {slot}"),
            Op::Invoke { method, argc } => write!(f, "invoke {}/{argc}", method.name()),
            Op::PushConstant(value) => write!(f, "push {value}"),
        }
    }
}

impl fmt::Debug for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Compiled directive.
#[derive(Clone, Debug)]
pub struct Program {
    directive: Arc<str>,
    ops: Vec<Op>,
    result: TypeRef,
}

impl Program {
    pub(crate) fn new(directive: Arc<str>, ops: Vec<Op>, result: TypeRef) -> Self {
        Self {
            directive,
            ops,
            result,
        }
    }

    /// Source directive.
    pub fn directive(&self) -> &str {
        &self.directive
    }

    /// Operations in execution order.
    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    /// Inferred result type.
    pub fn result(&self) -> &TypeRef {
        &self.result
    }

    pub(crate) fn eval(&self, env: &BindEnv<'_>, frame: &mut Frame) -> Result<Value, EvalError> {
        frame.stack.clear();
        for op in &self.ops {
            match op {
                Op::LoadRecord => frame.stack.push(env.record.clone()),
                Op::ResolveProvider => {
                    let side = env
                        .side
                        .cloned()
                        .ok_or_else(|| EvalError::Internal("side provider missing".into()))?;
                    frame.provider = Some(side.clone());
                    frame.stack.push(side);
                }
                Op::LoadProvider => {
                    let side = frame.provider.clone().ok_or_else(|| {
                        EvalError::Internal("side provider used before resolution".into())
                    })?;
                    frame.stack.push(side);
                }
                Op::LoadField(field) => {
                    let receiver = frame.pop()?;
                    let value = match &receiver {
                        Value::Object(obj) => field.read(obj.as_ref()),
                        Value::Null => return Err(EvalError::NullReceiver(field.name().into())),
                        _ => None,
                    }
                    .ok_or_else(|| EvalError::Receiver(field.name().into()))?;
                    frame.stack.push(value);
                }
                Op::LoadLocal(slot) => {
                    let value = frame
                        .locals
                        .get(*slot)
                        .and_then(Option::clone)
                        .ok_or_else(|| EvalError::Internal(format!("local {slot} unset")))?;
                    frame.stack.push(value);
                }
                Op::StoreLocal(slot) => {
                    let top = frame
                        .stack
                        .last()
                        .cloned()
                        .ok_or_else(|| EvalError::Internal("store on empty stack".into()))?;
                    if frame.locals.len() <= *slot {
                        frame.locals.resize(*slot + 1, None);
                    }
                    frame.locals[*slot] = Some(top);
                }
                Op::Invoke { method, argc } => {
                    if frame.stack.len() < argc + 1 {
                        return Err(EvalError::Internal(format!(
                            "invoke {} needs {} operands, stack has {}",
                            method.name(),
                            argc + 1,
                            frame.stack.len()
                        )));
                    }
                    let args: SmallVec<[Value; 4]> =
                        frame.stack.drain(frame.stack.len() - argc..).collect();
                    let receiver = frame.pop()?;
                    let obj = match &receiver {
                        Value::Object(obj) => obj,
                        Value::Null => return Err(EvalError::NullReceiver(method.name().into())),
                        _ => return Err(EvalError::Receiver(method.name().into())),
                    };
                    let value = method.invoke(obj.as_ref(), &args).map_err(|err| match err {
                        CallError::Receiver => EvalError::Receiver(method.name().into()),
                        CallError::Host(source) => EvalError::Host(method.name().into(), source),
                    })?;
                    frame.stack.push(value);
                }
                Op::PushConstant(value) => frame.stack.push(value.clone()),
            }
        }
        let result = frame.pop()?;
        if !frame.stack.is_empty() {
            return Err(EvalError::Internal(format!(
                "{} operand(s) left on stack",
                frame.stack.len()
            )));
        }
        Ok(result)
    }
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, op) in self.ops.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{op}")?;
        }
        Ok(())
    }
}

/// Inputs visible to every program in a bind pass.
pub(crate) struct BindEnv<'a> {
    pub record: &'a Value,
    pub side: Option<&'a Value>,
}

/// Mutable state shared by the programs of one bind pass.
#[derive(Default)]
pub(crate) struct Frame {
    provider: Option<Value>,
    locals: Vec<Option<Value>>,
    stack: Vec<Value>,
}

impl Frame {
    fn pop(&mut self) -> Result<Value, EvalError> {
        self.stack
            .pop()
            .ok_or_else(|| EvalError::Internal("stack underflow".into()))
    }
}

/// Evaluation failure; `Internal` means the program itself is broken.
#[derive(Debug)]
pub(crate) enum EvalError {
    Receiver(String),
    NullReceiver(String),
    Host(String, BoxError),
    Internal(String),
}

impl fmt::Display for EvalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvalError::Receiver(member) => write!(f, "receiver does not match type of '{member}'"),
            EvalError::NullReceiver(member) => write!(f, "null receiver for '{member}'"),
            EvalError::Host(member, source) => write!(f, "'{member}' failed: {source}"),
            EvalError::Internal(message) => f.write_str(message),
        }
    }
}
