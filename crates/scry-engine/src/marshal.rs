//! Converts remote values into locally owned [`LocalValue`]s.
//!
//! Dispatch order for a reference is fixed: arrays, then strings, then a
//! [`MarshalStrategy`] found by walking the runtime type's superclass chain,
//! and finally a remote `toString()`. Every object is pinned before it is
//! read; [`MarshalState::release_pins`] unpins them when the target resumes.
//!
//! A failure only affects the value it happened on; it becomes
//! [`LocalValue::Unavailable`].

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use scry_jdwp::wire::signature::signature_to_class_name;
use scry_jdwp::wire::{
    EventSet, InvokeResult, JdwpError, JdwpEvent, JdwpValue, MethodId, MethodInfo, ObjectId,
    ReferenceTypeId, ThreadId, VariableInfo, ERROR_ABSENT_INFORMATION, ERROR_INVALID_OBJECT,
    INVOKE_SINGLE_THREADED, SUSPEND_POLICY_ALL, SUSPEND_POLICY_NONE, TAG_ARRAY, TAG_STRING,
};
use scry_jdwp::TargetVm;
use serde::Serialize;
use thiserror::Error;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Local variables of one suspended frame, by name.
pub type Snapshot = BTreeMap<String, LocalValue>;

const NO_ARGS: &[JdwpValue] = &[];

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MarshalError {
    /// A remote call failed: the method threw, does not exist, or the call
    /// itself was rejected.
    #[error("{method}() failed: {message}")]
    RemoteInvocation { method: String, message: String },
    #[error("object {object:#x} has been collected")]
    Collected { object: ObjectId },
    #[error("value nested too deeply")]
    DepthLimit,
    #[error("{message}")]
    Remote { message: String },
}

impl MarshalError {
    fn from_jdwp(err: JdwpError, object: Option<ObjectId>) -> Self {
        match (err.vm_error_code(), object) {
            (Some(ERROR_INVALID_OBJECT), Some(object)) => MarshalError::Collected { object },
            _ => MarshalError::Remote {
                message: err.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum LocalValue {
    Null,
    Void,
    Boolean(bool),
    Char(char),
    Byte(i8),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    String(String),
    /// A remote array, element by element.
    Array(Vec<LocalValue>),
    /// Values produced by a multi-accessor strategy.
    Tuple(Vec<LocalValue>),
    Unavailable(MarshalError),
}

impl fmt::Display for LocalValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn list(f: &mut fmt::Formatter<'_>, items: &[LocalValue]) -> fmt::Result {
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{item}")?;
            }
            Ok(())
        }

        match self {
            LocalValue::Null => f.write_str("null"),
            LocalValue::Void => f.write_str("void"),
            LocalValue::Boolean(v) => write!(f, "{v}"),
            LocalValue::Char(v) => write!(f, "{v:?}"),
            LocalValue::Byte(v) => write!(f, "{v}"),
            LocalValue::Short(v) => write!(f, "{v}"),
            LocalValue::Int(v) => write!(f, "{v}"),
            LocalValue::Long(v) => write!(f, "{v}L"),
            LocalValue::Float(v) => write!(f, "{v}f"),
            LocalValue::Double(v) => write!(f, "{v}"),
            LocalValue::String(v) => write!(f, "{v:?}"),
            LocalValue::Array(items) => {
                f.write_str("[")?;
                list(f, items)?;
                f.write_str("]")
            }
            LocalValue::Tuple(items) => {
                f.write_str("(")?;
                list(f, items)?;
                f.write_str(")")
            }
            LocalValue::Unavailable(err) => write!(f, "<unavailable: {err}>"),
        }
    }
}

/// Custom unpacking for objects of one class (and its subclasses).
///
/// Strategies run while the target is suspended and may call back into it
/// through the [`Marshaller`].
pub trait MarshalStrategy<V: TargetVm>: Send + Sync {
    fn unpack<'m, 'a>(
        &'m self,
        object: ObjectId,
        cx: &'m mut Marshaller<'a, V>,
    ) -> BoxFuture<'m, LocalValue>;
}

/// Strategies that call no-argument methods on the object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Unpack {
    /// Call one method and marshal its result.
    Accessor(String),
    /// Call each method in order; the results form a [`LocalValue::Tuple`].
    Accessors(Vec<String>),
    /// Call `toArray()`; meant for collections.
    ToArray,
}

impl<V: TargetVm> MarshalStrategy<V> for Unpack {
    fn unpack<'m, 'a>(
        &'m self,
        object: ObjectId,
        cx: &'m mut Marshaller<'a, V>,
    ) -> BoxFuture<'m, LocalValue> {
        Box::pin(async move {
            match self {
                Unpack::Accessor(method) => cx.call_and_marshal(object, method).await,
                Unpack::Accessors(methods) => {
                    let mut parts = Vec::with_capacity(methods.len());
                    for method in methods {
                        parts.push(cx.call_and_marshal(object, method).await);
                    }
                    LocalValue::Tuple(parts)
                }
                Unpack::ToArray => cx.call_and_marshal(object, "toArray").await,
            }
        })
    }
}

/// Boxed primitives and the accessor that unwraps each.
const UNBOXING: [(&str, &str); 8] = [
    ("java.lang.Boolean", "booleanValue"),
    ("java.lang.Character", "charValue"),
    ("java.lang.Byte", "byteValue"),
    ("java.lang.Short", "shortValue"),
    ("java.lang.Integer", "intValue"),
    ("java.lang.Long", "longValue"),
    ("java.lang.Float", "floatValue"),
    ("java.lang.Double", "doubleValue"),
];

/// Strategies keyed by dotted class name.
///
/// A new registry unboxes `java.lang` wrappers into primitives; use
/// [`StrategyRegistry::empty`] to start without them.
pub struct StrategyRegistry<V> {
    strategies: HashMap<String, Arc<dyn MarshalStrategy<V>>>,
}

impl<V: TargetVm> Default for StrategyRegistry<V> {
    fn default() -> Self {
        let mut registry = Self::empty();
        for (class, accessor) in UNBOXING {
            registry.register(class, Unpack::Accessor(accessor.to_string()));
        }
        registry
    }
}

impl<V: TargetVm> StrategyRegistry<V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn empty() -> Self {
        Self {
            strategies: HashMap::new(),
        }
    }

    pub fn register(
        &mut self,
        class: impl Into<String>,
        strategy: impl MarshalStrategy<V> + 'static,
    ) -> &mut Self {
        self.strategies.insert(class.into(), Arc::new(strategy));
        self
    }

    pub fn get(&self, class: &str) -> Option<Arc<dyn MarshalStrategy<V>>> {
        self.strategies.get(class).cloned()
    }
}

/// Session-lifetime caches plus the pins and deferred events of the current
/// suspension.
#[derive(Debug, Default)]
pub struct MarshalState {
    type_names: HashMap<ReferenceTypeId, String>,
    superclasses: HashMap<ReferenceTypeId, Option<ReferenceTypeId>>,
    methods: HashMap<ReferenceTypeId, Arc<[MethodInfo]>>,
    variables: HashMap<(ReferenceTypeId, MethodId), Arc<[VariableInfo]>>,
    pins: HashSet<ObjectId>,
    deferred: VecDeque<EventSet>,
}

impl MarshalState {
    /// Re-enables collection of every object pinned since the last release.
    pub async fn release_pins<V: TargetVm>(&mut self, vm: &V) {
        for object in std::mem::take(&mut self.pins) {
            if let Err(err) = vm.enable_collection(object).await {
                tracing::debug!(
                    target: "scry.engine",
                    object,
                    error = %err,
                    "failed to unpin object"
                );
            }
        }
    }

    /// Next event set that arrived during a remote invocation.
    pub fn take_deferred(&mut self) -> Option<EventSet> {
        self.deferred.pop_front()
    }
}

/// Marshals values visible to one suspended thread.
pub struct Marshaller<'a, V> {
    vm: &'a V,
    thread: ThreadId,
    strategies: &'a StrategyRegistry<V>,
    state: &'a mut MarshalState,
    max_depth: usize,
    depth: usize,
}

impl<'a, V: TargetVm> Marshaller<'a, V> {
    pub fn new(
        vm: &'a V,
        thread: ThreadId,
        strategies: &'a StrategyRegistry<V>,
        state: &'a mut MarshalState,
        max_depth: usize,
    ) -> Self {
        Self {
            vm,
            thread,
            strategies,
            state,
            max_depth,
            depth: 0,
        }
    }

    pub fn thread(&self) -> ThreadId {
        self.thread
    }

    pub fn marshal(&mut self, value: JdwpValue) -> BoxFuture<'_, LocalValue> {
        Box::pin(self.marshal_value(value))
    }

    async fn marshal_value(&mut self, value: JdwpValue) -> LocalValue {
        match value {
            JdwpValue::Void => LocalValue::Void,
            JdwpValue::Boolean(v) => LocalValue::Boolean(v),
            JdwpValue::Byte(v) => LocalValue::Byte(v),
            JdwpValue::Char(v) => {
                let c = char::from_u32(u32::from(v)).unwrap_or(char::REPLACEMENT_CHARACTER);
                LocalValue::Char(c)
            }
            JdwpValue::Short(v) => LocalValue::Short(v),
            JdwpValue::Int(v) => LocalValue::Int(v),
            JdwpValue::Long(v) => LocalValue::Long(v),
            JdwpValue::Float(v) => LocalValue::Float(v),
            JdwpValue::Double(v) => LocalValue::Double(v),
            JdwpValue::Object { id: 0, .. } => LocalValue::Null,
            JdwpValue::Object { tag, id } => {
                if self.depth >= self.max_depth {
                    return LocalValue::Unavailable(MarshalError::DepthLimit);
                }
                if let Err(err) = self.pin(id).await {
                    return LocalValue::Unavailable(err);
                }
                self.depth += 1;
                let value = match tag {
                    TAG_ARRAY => self.marshal_array(id).await,
                    TAG_STRING => self.marshal_string(id).await,
                    _ => self.marshal_object(id).await,
                };
                self.depth -= 1;
                value
            }
        }
    }

    async fn pin(&mut self, object: ObjectId) -> Result<(), MarshalError> {
        if self.state.pins.contains(&object) {
            return Ok(());
        }
        self.vm
            .disable_collection(object)
            .await
            .map_err(|err| MarshalError::from_jdwp(err, Some(object)))?;
        self.state.pins.insert(object);
        Ok(())
    }

    async fn marshal_array(&mut self, array: ObjectId) -> LocalValue {
        let length = match self.vm.array_length(array).await {
            Ok(length) => length,
            Err(err) => return LocalValue::Unavailable(MarshalError::from_jdwp(err, Some(array))),
        };
        if length <= 0 {
            return LocalValue::Array(Vec::new());
        }
        let elements = match self.vm.array_values(array, 0, length).await {
            Ok(elements) => elements,
            Err(err) => return LocalValue::Unavailable(MarshalError::from_jdwp(err, Some(array))),
        };
        let mut items = Vec::with_capacity(elements.len());
        for element in elements {
            items.push(self.marshal(element).await);
        }
        LocalValue::Array(items)
    }

    async fn marshal_string(&mut self, string: ObjectId) -> LocalValue {
        match self.vm.string_value(string).await {
            Ok(text) => LocalValue::String(text),
            Err(err) => LocalValue::Unavailable(MarshalError::from_jdwp(err, Some(string))),
        }
    }

    async fn marshal_object(&mut self, object: ObjectId) -> LocalValue {
        let mut type_id = match self.vm.object_type(object).await {
            Ok(type_id) => type_id,
            Err(err) => return LocalValue::Unavailable(MarshalError::from_jdwp(err, Some(object))),
        };

        loop {
            let name = match self.type_name(type_id).await {
                Ok(name) => name,
                Err(err) => return LocalValue::Unavailable(err),
            };
            if name == "java.lang.String" {
                return self.marshal_string(object).await;
            }
            if let Some(strategy) = self.strategies.get(&name) {
                tracing::trace!(
                    target: "scry.engine",
                    class = %name,
                    object,
                    "unpacking with strategy"
                );
                return strategy.unpack(object, self).await;
            }
            match self.superclass(type_id).await {
                Ok(Some(superclass)) => type_id = superclass,
                Ok(None) => break,
                Err(err) => return LocalValue::Unavailable(err),
            }
        }

        self.call_and_marshal(object, "toString").await
    }

    /// Calls the no-argument method `method` on `object` and marshals what it
    /// returns.
    pub async fn call_and_marshal(&mut self, object: ObjectId, method: &str) -> LocalValue {
        match self.invoke(object, method).await {
            Ok(value) => self.marshal(value).await,
            Err(err) => LocalValue::Unavailable(err),
        }
    }

    /// Calls the no-argument method `method` on `object` on the suspended
    /// thread.
    pub async fn invoke(
        &mut self,
        object: ObjectId,
        method: &str,
    ) -> Result<JdwpValue, MarshalError> {
        let failed = |message: String| MarshalError::RemoteInvocation {
            method: method.to_string(),
            message,
        };

        let type_id = self
            .vm
            .object_type(object)
            .await
            .map_err(|err| MarshalError::from_jdwp(err, Some(object)))?;
        let (class_id, method_id) = self
            .find_method(type_id, method)
            .await?
            .ok_or_else(|| failed("no such method".to_string()))?;

        let result = self
            .invoke_isolated(object, class_id, method_id)
            .await
            .map_err(|err| failed(err.to_string()))?;
        match result.exception {
            None => Ok(result.value),
            Some(exception) => {
                let thrown = match self.vm.object_type(exception).await {
                    Ok(type_id) => self
                        .type_name(type_id)
                        .await
                        .unwrap_or_else(|_| "exception".to_string()),
                    Err(_) => "exception".to_string(),
                };
                Err(failed(format!("threw {thrown}")))
            }
        }
    }

    /// Runs `ObjectReference.InvokeMethod` while draining the event stream.
    ///
    /// Breakpoint, step and exception events raised by the invoked code are
    /// dropped and their thread resumed so the call can complete. Other events
    /// are queued for the event loop; their set is already resumed.
    async fn invoke_isolated(
        &mut self,
        object: ObjectId,
        class_id: ReferenceTypeId,
        method_id: MethodId,
    ) -> Result<InvokeResult, JdwpError> {
        let vm = self.vm;
        let invoke = vm.invoke_method(
            object,
            self.thread,
            class_id,
            method_id,
            NO_ARGS,
            INVOKE_SINGLE_THREADED,
        );
        tokio::pin!(invoke);

        loop {
            tokio::select! {
                biased;
                result = &mut invoke => return result,
                set = vm.next_event() => match set {
                    Some(set) => self.absorb(set).await,
                    None => return Err(JdwpError::ConnectionClosed),
                },
            }
        }
    }

    async fn absorb(&mut self, set: EventSet) {
        let resume_target = set.events.iter().find_map(JdwpEvent::thread);
        let mut kept = Vec::new();
        for event in set.events {
            match event {
                JdwpEvent::Breakpoint { .. }
                | JdwpEvent::SingleStep { .. }
                | JdwpEvent::Exception { .. } => {
                    tracing::debug!(
                        target: "scry.engine",
                        kind = event.kind(),
                        thread = ?event.thread(),
                        "dropping event raised during remote invocation"
                    );
                }
                other => kept.push(other),
            }
        }

        let resumed = match set.suspend_policy {
            SUSPEND_POLICY_NONE => Ok(()),
            SUSPEND_POLICY_ALL => self.vm.resume().await,
            _ => match resume_target {
                Some(thread) => self.vm.resume_thread(thread).await,
                None => self.vm.resume().await,
            },
        };
        if let Err(err) = resumed {
            tracing::warn!(
                target: "scry.engine",
                error = %err,
                "failed to resume thread during remote invocation"
            );
        }

        if !kept.is_empty() {
            self.state.deferred.push_back(EventSet {
                suspend_policy: SUSPEND_POLICY_NONE,
                events: kept,
            });
        }
    }

    async fn type_name(&mut self, type_id: ReferenceTypeId) -> Result<String, MarshalError> {
        if let Some(name) = self.state.type_names.get(&type_id) {
            return Ok(name.clone());
        }
        let signature = self
            .vm
            .signature(type_id)
            .await
            .map_err(|err| MarshalError::from_jdwp(err, None))?;
        let name = signature_to_class_name(&signature);
        self.state.type_names.insert(type_id, name.clone());
        Ok(name)
    }

    async fn superclass(
        &mut self,
        type_id: ReferenceTypeId,
    ) -> Result<Option<ReferenceTypeId>, MarshalError> {
        if let Some(superclass) = self.state.superclasses.get(&type_id) {
            return Ok(*superclass);
        }
        let superclass = self
            .vm
            .superclass(type_id)
            .await
            .map_err(|err| MarshalError::from_jdwp(err, None))?;
        self.state.superclasses.insert(type_id, superclass);
        Ok(superclass)
    }

    async fn methods(
        &mut self,
        type_id: ReferenceTypeId,
    ) -> Result<Arc<[MethodInfo]>, MarshalError> {
        if let Some(methods) = self.state.methods.get(&type_id) {
            return Ok(Arc::clone(methods));
        }
        let methods: Arc<[MethodInfo]> = self
            .vm
            .methods(type_id)
            .await
            .map_err(|err| MarshalError::from_jdwp(err, None))?
            .into();
        self.state.methods.insert(type_id, Arc::clone(&methods));
        Ok(methods)
    }

    /// The closest declaration of a no-argument `name` in the class hierarchy.
    async fn find_method(
        &mut self,
        mut type_id: ReferenceTypeId,
        name: &str,
    ) -> Result<Option<(ReferenceTypeId, MethodId)>, MarshalError> {
        loop {
            let methods = self.methods(type_id).await?;
            if let Some(method) = methods
                .iter()
                .find(|m| m.name == name && m.signature.starts_with("()"))
            {
                return Ok(Some((type_id, method.method_id)));
            }
            match self.superclass(type_id).await? {
                Some(superclass) => type_id = superclass,
                None => return Ok(None),
            }
        }
    }

    async fn variables(
        &mut self,
        class_id: ReferenceTypeId,
        method_id: MethodId,
    ) -> Result<Arc<[VariableInfo]>, JdwpError> {
        if let Some(vars) = self.state.variables.get(&(class_id, method_id)) {
            return Ok(Arc::clone(vars));
        }
        let vars: Arc<[VariableInfo]> = self.vm.variable_table(class_id, method_id).await?.into();
        self.state
            .variables
            .insert((class_id, method_id), Arc::clone(&vars));
        Ok(vars)
    }

    /// Marshals the locals of the thread's top frame, except `this`.
    pub async fn snapshot_frame(&mut self) -> Snapshot {
        let mut snapshot = Snapshot::new();
        let frame = match self.vm.frames(self.thread, 0, 1).await {
            Ok(frames) => match frames.first() {
                Some(frame) => *frame,
                None => return snapshot,
            },
            Err(err) => {
                tracing::warn!(
                    target: "scry.engine",
                    thread = self.thread,
                    error = %err,
                    "failed to read stack frame"
                );
                return snapshot;
            }
        };
        let location = frame.location;

        let vars = match self.variables(location.class_id, location.method_id).await {
            Ok(vars) => vars,
            Err(err) if err.vm_error_code() == Some(ERROR_ABSENT_INFORMATION) => {
                tracing::warn!(
                    target: "scry.engine",
                    class_id = location.class_id,
                    method_id = location.method_id,
                    "no local variable information; compile the target with -g"
                );
                return snapshot;
            }
            Err(err) => {
                tracing::warn!(
                    target: "scry.engine",
                    error = %err,
                    "failed to read variable table"
                );
                return snapshot;
            }
        };
        let visible: Vec<&VariableInfo> = vars
            .iter()
            .filter(|var| var.name != "this" && var.is_live_at(location.index))
            .collect();
        if visible.is_empty() {
            return snapshot;
        }

        let slots: Vec<(u32, String)> = visible
            .iter()
            .map(|var| (var.slot, var.signature.clone()))
            .collect();
        let values: Vec<Result<JdwpValue, JdwpError>> =
            match self.vm.frame_values(self.thread, frame.frame_id, &slots).await {
                Ok(values) if values.len() == slots.len() => values.into_iter().map(Ok).collect(),
                batch => {
                    if let Err(err) = batch {
                        tracing::debug!(
                            target: "scry.engine",
                            error = %err,
                            "batch frame read failed; reading slots one by one"
                        );
                    }
                    let mut values = Vec::with_capacity(slots.len());
                    for slot in &slots {
                        let value = self
                            .vm
                            .frame_values(self.thread, frame.frame_id, std::slice::from_ref(slot))
                            .await
                            .and_then(|mut single| {
                                single.pop().ok_or_else(|| {
                                    JdwpError::Protocol("empty StackFrame.GetValues reply".into())
                                })
                            });
                        values.push(value);
                    }
                    values
                }
            };

        for (var, value) in visible.into_iter().zip(values) {
            let local = match value {
                Ok(value) => self.marshal(value).await,
                Err(err) => LocalValue::Unavailable(MarshalError::from_jdwp(err, None)),
            };
            snapshot.insert(var.name.clone(), local);
        }
        snapshot
    }
}
