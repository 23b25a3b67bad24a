//! An in-memory [`TargetVm`] that replays a scripted execution trace.
//!
//! The trace is a list of executed source lines. Each step names a thread,
//! class, method, line, stack depth and the locals visible there. Code indices
//! are the line numbers themselves, so a breakpoint on line 15 is a location
//! with `index == 15`.
//!
//! Event semantics follow the JDWP agent closely enough for the engine:
//!
//! * the VM starts suspended with a `VmStart` event;
//! * a class is prepared when the trace first enters it;
//! * step requests fire per depth (`into` on the next line anywhere, `over`
//!   on the next line at the same or a shallower depth, `out` only shallower)
//!   and honour `ClassMatch`/`ClassExclude`;
//! * a second step request on the same thread fails with `DUPLICATE`;
//! * the end of the trace produces `VmDeath` followed by a disconnect.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

use tokio::sync::{mpsc, Mutex as AsyncMutex, Notify};
use tokio_util::sync::CancellationToken;

use crate::poison::lock;
use crate::target::TargetVm;
use crate::wire::signature::{
    class_name_to_signature, class_pattern_matches, signature_to_class_name,
};
use crate::wire::{
    ClassInfo, EventModifier, EventSet, FrameId, FrameInfo, InvokeResult, JdwpError, JdwpEvent,
    JdwpValue, LineTable, LineTableEntry, Location, MethodId, MethodInfo, ObjectId,
    ReferenceTypeId, Result, ThreadId, VariableInfo, ERROR_DUPLICATE, ERROR_INVALID_ARRAY,
    ERROR_INVALID_CLASS, ERROR_INVALID_EVENT_TYPE, ERROR_INVALID_FRAMEID, ERROR_INVALID_METHODID,
    ERROR_INVALID_OBJECT, ERROR_INVALID_SLOT, ERROR_INVALID_STRING, ERROR_INVALID_THREAD,
    ERROR_THREAD_NOT_SUSPENDED, EVENT_KIND_BREAKPOINT, EVENT_KIND_CLASS_PREPARE,
    EVENT_KIND_EXCEPTION, EVENT_KIND_SINGLE_STEP, SUSPEND_POLICY_ALL, SUSPEND_POLICY_EVENT_THREAD,
    SUSPEND_POLICY_NONE, STEP_DEPTH_INTO, STEP_DEPTH_OUT, STEP_DEPTH_OVER, TAG_ARRAY, TAG_OBJECT,
    TAG_STRING, TYPE_TAG_CLASS,
};

pub const MAIN_THREAD: ThreadId = 1;
pub const OBJECT_CLASS: ReferenceTypeId = 1;
pub const STRING_CLASS: ReferenceTypeId = 2;

const CLASS_STATUS_INITIALIZED: u32 = 7;

/// What a remote method call does.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Return(JdwpValue),
    Throw(JdwpValue),
}

#[derive(Debug, Clone)]
struct ScriptedClass {
    name: String,
    signature: String,
    superclass: Option<ReferenceTypeId>,
    methods: Vec<ScriptedMethod>,
    system: bool,
}

#[derive(Debug, Clone)]
struct ScriptedMethod {
    method_id: MethodId,
    name: String,
    signature: String,
    lines: Vec<u32>,
}

#[derive(Debug, Clone)]
enum ObjectKind {
    Plain,
    Str(String),
    Array(Vec<JdwpValue>),
}

#[derive(Debug, Clone)]
struct ScriptedObject {
    class_id: ReferenceTypeId,
    kind: ObjectKind,
    outcomes: HashMap<String, Outcome>,
    reentrant: HashSet<String>,
}

#[derive(Debug, Clone, Copy)]
struct Thrown {
    exception: JdwpValue,
    caught: bool,
}

#[derive(Debug, Clone)]
struct TraceStep {
    thread: ThreadId,
    class_id: ReferenceTypeId,
    method_id: MethodId,
    line: u32,
    depth: u32,
    locals: Vec<(String, JdwpValue)>,
    thrown: Option<Thrown>,
}

impl TraceStep {
    fn location(&self) -> Location {
        Location {
            type_tag: TYPE_TAG_CLASS,
            class_id: self.class_id,
            method_id: self.method_id,
            index: u64::from(self.line),
        }
    }
}

#[derive(Debug, Clone)]
struct Request {
    kind: u8,
    suspend_policy: u8,
    modifiers: Vec<EventModifier>,
}

impl Request {
    fn step(&self) -> Option<(ThreadId, u32)> {
        self.modifiers.iter().find_map(|m| match m {
            EventModifier::Step { thread, depth, .. } => Some((*thread, *depth)),
            _ => None,
        })
    }

    fn accepts_class(&self, class_name: &str) -> bool {
        self.modifiers.iter().all(|m| match m {
            EventModifier::ClassMatch { pattern } => class_pattern_matches(pattern, class_name),
            EventModifier::ClassExclude { pattern } => !class_pattern_matches(pattern, class_name),
            _ => true,
        })
    }
}

/// Builds the classes, heap and trace of a [`ScriptedVm`].
#[derive(Debug)]
pub struct ScriptedVmBuilder {
    classes: Vec<ScriptedClass>,
    objects: HashMap<ObjectId, ScriptedObject>,
    trace: Vec<TraceStep>,
    next_object_id: ObjectId,
    next_method_id: MethodId,
    rejected_matches: HashSet<String>,
}

impl Default for ScriptedVmBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedVmBuilder {
    pub fn new() -> Self {
        let mut builder = Self {
            classes: Vec::new(),
            objects: HashMap::new(),
            trace: Vec::new(),
            next_object_id: 0x1000,
            next_method_id: 1,
            rejected_matches: HashSet::new(),
        };
        let object = builder.push_class("java.lang.Object", None, true);
        builder.method(object, "toString", "()Ljava/lang/String;", &[]);
        builder.push_class("java.lang.String", Some(object), true);
        builder
    }

    fn push_class(
        &mut self,
        name: &str,
        superclass: Option<ReferenceTypeId>,
        system: bool,
    ) -> ReferenceTypeId {
        let signature = if name.starts_with('[') {
            name.to_string()
        } else {
            class_name_to_signature(name)
        };
        self.classes.push(ScriptedClass {
            name: signature_to_class_name(&signature),
            signature,
            superclass,
            methods: Vec::new(),
            system,
        });
        self.classes.len() as ReferenceTypeId
    }

    /// A user class extending `java.lang.Object`. It is prepared lazily.
    pub fn class(&mut self, name: &str) -> ReferenceTypeId {
        self.push_class(name, Some(OBJECT_CLASS), false)
    }

    pub fn subclass(&mut self, name: &str, superclass: ReferenceTypeId) -> ReferenceTypeId {
        self.push_class(name, Some(superclass), false)
    }

    /// Declares a method whose executable lines are `lines`.
    pub fn method(
        &mut self,
        class: ReferenceTypeId,
        name: &str,
        signature: &str,
        lines: &[u32],
    ) -> MethodId {
        let method_id = self.next_method_id;
        self.next_method_id += 1;
        let mut lines = lines.to_vec();
        lines.sort_unstable();
        lines.dedup();
        if let Some(class) = self.classes.get_mut(class_index(class)) {
            class.methods.push(ScriptedMethod {
                method_id,
                name: name.to_string(),
                signature: signature.to_string(),
                lines,
            });
        }
        method_id
    }

    fn alloc(&mut self, class_id: ReferenceTypeId, kind: ObjectKind) -> ObjectId {
        let id = self.next_object_id;
        self.next_object_id += 1;
        self.objects.insert(
            id,
            ScriptedObject {
                class_id,
                kind,
                outcomes: HashMap::new(),
                reentrant: HashSet::new(),
            },
        );
        id
    }

    pub fn string(&mut self, value: &str) -> JdwpValue {
        let id = self.alloc(STRING_CLASS, ObjectKind::Str(value.to_string()));
        JdwpValue::Object {
            tag: TAG_STRING,
            id,
        }
    }

    pub fn object(&mut self, class: ReferenceTypeId) -> JdwpValue {
        let id = self.alloc(class, ObjectKind::Plain);
        JdwpValue::Object {
            tag: TAG_OBJECT,
            id,
        }
    }

    /// An array whose element type is `element_signature` (`Z`, `[C`, `Ljava/lang/Object;`).
    pub fn array(&mut self, element_signature: &str, values: Vec<JdwpValue>) -> JdwpValue {
        let signature = format!("[{element_signature}");
        let class_id = match self.classes.iter().position(|c| c.signature == signature) {
            Some(index) => index as ReferenceTypeId + 1,
            None => self.push_class(&signature, Some(OBJECT_CLASS), true),
        };
        let id = self.alloc(class_id, ObjectKind::Array(values));
        JdwpValue::Object { tag: TAG_ARRAY, id }
    }

    /// Scripts the result of calling `method` on `object`.
    pub fn on_invoke(&mut self, object: JdwpValue, method: &str, outcome: Outcome) {
        if let Some(obj) = object.object_id().and_then(|id| self.objects.get_mut(&id)) {
            obj.outcomes.insert(method.to_string(), outcome);
        }
    }

    /// Calling `method` on `object` hits a breakpoint on the invoking thread and
    /// only completes once that thread is resumed.
    pub fn reenter_on_invoke(&mut self, object: JdwpValue, method: &str) {
        if let Some(obj) = object.object_id().and_then(|id| self.objects.get_mut(&id)) {
            obj.reentrant.insert(method.to_string());
        }
    }

    /// Event requests with a `ClassMatch` on `pattern` fail with
    /// `INVALID_CLASS`.
    pub fn reject_class_match(&mut self, pattern: &str) {
        self.rejected_matches.insert(pattern.to_string());
    }

    /// Appends an executed line on the main thread.
    pub fn step(
        &mut self,
        class: ReferenceTypeId,
        method: MethodId,
        line: u32,
        depth: u32,
        locals: &[(&str, JdwpValue)],
    ) -> &mut Self {
        self.trace.push(TraceStep {
            thread: MAIN_THREAD,
            class_id: class,
            method_id: method,
            line,
            depth,
            locals: locals
                .iter()
                .map(|(name, value)| (name.to_string(), *value))
                .collect(),
            thrown: None,
        });
        self
    }

    /// Appends an executed line that throws `exception`.
    pub fn step_throwing(
        &mut self,
        class: ReferenceTypeId,
        method: MethodId,
        line: u32,
        depth: u32,
        exception: JdwpValue,
        caught: bool,
    ) -> &mut Self {
        self.step(class, method, line, depth, &[]);
        if let Some(step) = self.trace.last_mut() {
            step.thrown = Some(Thrown { exception, caught });
        }
        self
    }

    pub fn build(self) -> ScriptedVm {
        let (sender, receiver) = mpsc::unbounded_channel();
        let prepared = self
            .classes
            .iter()
            .enumerate()
            .filter(|(_, class)| class.system)
            .map(|(index, _)| index as ReferenceTypeId + 1)
            .collect();

        let mut state = State {
            classes: self.classes,
            objects: self.objects,
            trace: self.trace,
            next_object_id: self.next_object_id,
            cursor: None,
            location_pending: false,
            prepared,
            requests: BTreeMap::new(),
            next_request_id: 1,
            suspend_count: 0,
            last_stop: None,
            invoking: false,
            sender: Some(sender),
            pins: HashMap::new(),
            resumes: 0,
            invocations: Vec::new(),
            exit_code: None,
            rejected_matches: self.rejected_matches,
        };
        state.emit(EventSet {
            suspend_policy: SUSPEND_POLICY_ALL,
            events: vec![JdwpEvent::VmStart {
                request_id: 0,
                thread: MAIN_THREAD,
            }],
        });
        state.suspend_count = 1;

        ScriptedVm {
            state: Mutex::new(state),
            events: AsyncMutex::new(receiver),
            disconnected: CancellationToken::new(),
            invoke_resumed: Notify::new(),
        }
    }
}

fn class_index(id: ReferenceTypeId) -> usize {
    (id as usize).wrapping_sub(1)
}

fn signature_for(value: &JdwpValue) -> String {
    match value {
        JdwpValue::Object { tag: TAG_STRING, .. } => "Ljava/lang/String;".to_string(),
        JdwpValue::Object { tag: TAG_ARRAY, .. } => "[Ljava/lang/Object;".to_string(),
        JdwpValue::Object { .. } => "Ljava/lang/Object;".to_string(),
        other => char::from(other.tag()).to_string(),
    }
}

#[derive(Debug)]
struct State {
    classes: Vec<ScriptedClass>,
    objects: HashMap<ObjectId, ScriptedObject>,
    trace: Vec<TraceStep>,
    next_object_id: ObjectId,
    cursor: Option<usize>,
    /// The step at `cursor` was entered but its location events are still due.
    location_pending: bool,
    prepared: HashSet<ReferenceTypeId>,
    requests: BTreeMap<i32, Request>,
    next_request_id: i32,
    suspend_count: u32,
    last_stop: Option<usize>,
    invoking: bool,
    sender: Option<mpsc::UnboundedSender<EventSet>>,
    pins: HashMap<ObjectId, u32>,
    resumes: usize,
    invocations: Vec<String>,
    exit_code: Option<i32>,
    rejected_matches: HashSet<String>,
}

impl State {
    fn ensure_alive(&self) -> Result<()> {
        if self.sender.is_some() {
            Ok(())
        } else {
            Err(JdwpError::ConnectionClosed)
        }
    }

    fn emit(&mut self, set: EventSet) {
        if let Some(sender) = &self.sender {
            let _ = sender.send(set);
        }
    }

    fn class(&self, id: ReferenceTypeId) -> Result<&ScriptedClass> {
        self.classes
            .get(class_index(id))
            .ok_or(JdwpError::VmError(ERROR_INVALID_CLASS))
    }

    fn object(&self, id: ObjectId) -> Result<&ScriptedObject> {
        self.objects
            .get(&id)
            .ok_or(JdwpError::VmError(ERROR_INVALID_OBJECT))
    }

    fn method(&self, class_id: ReferenceTypeId, method_id: MethodId) -> Result<&ScriptedMethod> {
        self.class(class_id)?
            .methods
            .iter()
            .find(|m| m.method_id == method_id)
            .ok_or(JdwpError::VmError(ERROR_INVALID_METHODID))
    }

    /// Looks `method_id` up in `class_id` and its superclasses.
    fn inherited_method(&self, class_id: ReferenceTypeId, method_id: MethodId) -> Option<&str> {
        let mut current = Some(class_id);
        while let Some(id) = current {
            let class = self.classes.get(class_index(id))?;
            if let Some(method) = class.methods.iter().find(|m| m.method_id == method_id) {
                return Some(&method.name);
            }
            current = class.superclass;
        }
        None
    }

    /// The step the given thread is suspended at.
    fn suspended_step(&self, thread: ThreadId) -> Result<(usize, &TraceStep)> {
        if self.suspend_count == 0 {
            return Err(JdwpError::VmError(ERROR_THREAD_NOT_SUSPENDED));
        }
        let index = self
            .cursor
            .ok_or(JdwpError::VmError(ERROR_THREAD_NOT_SUSPENDED))?;
        let step = &self.trace[index];
        if step.thread != thread {
            return Err(JdwpError::VmError(ERROR_INVALID_THREAD));
        }
        Ok((index, step))
    }

    /// Static variable table: every local the trace shows in the method, live
    /// over the span of lines it appears on.
    fn variables(&self, class_id: ReferenceTypeId, method_id: MethodId) -> Vec<VariableInfo> {
        let mut vars: Vec<VariableInfo> = Vec::new();
        let steps = self
            .trace
            .iter()
            .filter(|s| s.class_id == class_id && s.method_id == method_id);
        for step in steps {
            let index = u64::from(step.line);
            for (name, value) in &step.locals {
                match vars.iter_mut().find(|v| v.name == *name) {
                    Some(var) => {
                        let end = (var.code_index + u64::from(var.length)).max(index + 1);
                        var.code_index = var.code_index.min(index);
                        var.length = (end - var.code_index) as u32;
                    }
                    None => {
                        let slot = vars.len() as u32;
                        vars.push(VariableInfo {
                            code_index: index,
                            name: name.clone(),
                            signature: signature_for(value),
                            length: 1,
                            slot,
                        });
                    }
                }
            }
        }
        vars
    }

    fn run(&mut self, disconnected: &CancellationToken) {
        while self.sender.is_some() {
            if !self.location_pending {
                let next = self.cursor.map_or(0, |c| c + 1);
                if next >= self.trace.len() {
                    self.finish(true, disconnected);
                    return;
                }
                self.cursor = Some(next);
                self.location_pending = true;
                let (thread, class_id) = (self.trace[next].thread, self.trace[next].class_id);
                if self.prepared.insert(class_id) {
                    let events = self.class_prepare_events(thread, class_id);
                    if self.dispatch(events) {
                        return;
                    }
                }
            }

            self.location_pending = false;
            let Some(index) = self.cursor else { return };
            let events = self.location_events(index);
            if self.dispatch(events) {
                self.last_stop = Some(index);
                return;
            }
        }
    }

    /// Sends the matched events as one set; `true` when the set suspends.
    fn dispatch(&mut self, matched: Vec<(u8, JdwpEvent)>) -> bool {
        if matched.is_empty() {
            return false;
        }
        let suspend_policy = matched
            .iter()
            .map(|(policy, _)| *policy)
            .max()
            .unwrap_or(SUSPEND_POLICY_NONE);
        self.emit(EventSet {
            suspend_policy,
            events: matched.into_iter().map(|(_, event)| event).collect(),
        });
        if suspend_policy == SUSPEND_POLICY_NONE {
            return false;
        }
        self.suspend_count = 1;
        true
    }

    fn class_prepare_events(
        &self,
        thread: ThreadId,
        class_id: ReferenceTypeId,
    ) -> Vec<(u8, JdwpEvent)> {
        let Ok(class) = self.class(class_id) else {
            return Vec::new();
        };
        self.requests
            .iter()
            .filter(|(_, req)| req.kind == EVENT_KIND_CLASS_PREPARE)
            .filter(|(_, req)| req.accepts_class(&class.name))
            .map(|(id, req)| {
                let event = JdwpEvent::ClassPrepare {
                    request_id: *id,
                    thread,
                    ref_type_tag: TYPE_TAG_CLASS,
                    type_id: class_id,
                    signature: class.signature.clone(),
                    status: CLASS_STATUS_INITIALIZED,
                };
                (req.suspend_policy, event)
            })
            .collect()
    }

    fn location_events(&self, index: usize) -> Vec<(u8, JdwpEvent)> {
        let step = &self.trace[index];
        let location = step.location();
        let class_name = self
            .class(step.class_id)
            .map(|c| c.name.as_str())
            .unwrap_or_default();
        let origin_depth = self.last_stop.map(|i| self.trace[i].depth);

        let mut events = Vec::new();
        for (id, req) in &self.requests {
            if !req.accepts_class(class_name) {
                continue;
            }
            let request_id = *id;
            let event = match req.kind {
                EVENT_KIND_BREAKPOINT => {
                    let hit = req.modifiers.iter().any(|m| {
                        matches!(m, EventModifier::LocationOnly { location: l } if *l == location)
                    });
                    hit.then_some(JdwpEvent::Breakpoint {
                        request_id,
                        thread: step.thread,
                        location,
                    })
                }
                EVENT_KIND_SINGLE_STEP => {
                    let fires = match req.step() {
                        Some((thread, _)) if thread != step.thread => false,
                        Some((_, STEP_DEPTH_INTO)) => true,
                        Some((_, STEP_DEPTH_OVER)) => {
                            origin_depth.map_or(true, |d| step.depth <= d)
                        }
                        Some((_, STEP_DEPTH_OUT)) => origin_depth.map_or(true, |d| step.depth < d),
                        _ => false,
                    };
                    fires.then_some(JdwpEvent::SingleStep {
                        request_id,
                        thread: step.thread,
                        location,
                    })
                }
                EVENT_KIND_EXCEPTION => step.thrown.and_then(|thrown| {
                    let wanted = req.modifiers.iter().all(|m| match m {
                        EventModifier::ExceptionOnly {
                            caught, uncaught, ..
                        } => (thrown.caught && *caught) || (!thrown.caught && *uncaught),
                        _ => true,
                    });
                    wanted.then_some(JdwpEvent::Exception {
                        request_id,
                        thread: step.thread,
                        location,
                        exception: thrown.exception,
                        catch_location: thrown.caught.then_some(location),
                    })
                }),
                _ => None,
            };
            if let Some(event) = event {
                events.push((req.suspend_policy, event));
            }
        }
        events
    }

    fn finish(&mut self, with_death: bool, disconnected: &CancellationToken) {
        if with_death {
            self.emit(EventSet {
                suspend_policy: SUSPEND_POLICY_NONE,
                events: vec![JdwpEvent::VmDeath { request_id: 0 }],
            });
        }
        self.sender = None;
        self.suspend_count = 0;
        disconnected.cancel();
    }

    fn default_to_string(&mut self, object: ObjectId) -> Result<Outcome> {
        let obj = self.object(object)?;
        if let ObjectKind::Str(_) = obj.kind {
            return Ok(Outcome::Return(JdwpValue::Object {
                tag: TAG_STRING,
                id: object,
            }));
        }
        let class_name = self.class(obj.class_id)?.name.clone();
        let simple = class_name.rsplit('.').next().unwrap_or(&class_name);
        let text = format!("{simple}@{object:x}");

        let id = self.next_object_id;
        self.next_object_id += 1;
        self.objects.insert(
            id,
            ScriptedObject {
                class_id: STRING_CLASS,
                kind: ObjectKind::Str(text),
                outcomes: HashMap::new(),
                reentrant: HashSet::new(),
            },
        );
        Ok(Outcome::Return(JdwpValue::Object {
            tag: TAG_STRING,
            id,
        }))
    }

    fn resume_all(&mut self, disconnected: &CancellationToken) {
        self.resumes += 1;
        if self.suspend_count == 0 {
            return;
        }
        self.suspend_count -= 1;
        if self.suspend_count == 0 {
            self.run(disconnected);
        }
    }
}

/// See the module docs.
#[derive(Debug)]
pub struct ScriptedVm {
    state: Mutex<State>,
    events: AsyncMutex<mpsc::UnboundedReceiver<EventSet>>,
    disconnected: CancellationToken,
    invoke_resumed: Notify,
}

impl ScriptedVm {
    pub fn builder() -> ScriptedVmBuilder {
        ScriptedVmBuilder::new()
    }

    /// Drops the connection as if the target process died.
    pub fn disconnect(&self) {
        let mut state = lock(&self.state, "scripted vm");
        state.finish(false, &self.disconnected);
    }

    pub fn is_suspended(&self) -> bool {
        lock(&self.state, "scripted vm").suspend_count > 0
    }

    /// Class name and line of the step the VM is at.
    pub fn position(&self) -> Option<(String, u32)> {
        let state = lock(&self.state, "scripted vm");
        let step = &state.trace[state.cursor?];
        let class = state.class(step.class_id).ok()?;
        Some((class.name.clone(), step.line))
    }

    pub fn pinned_objects(&self) -> Vec<ObjectId> {
        let state = lock(&self.state, "scripted vm");
        let mut pinned: Vec<_> = state.pins.keys().copied().collect();
        pinned.sort_unstable();
        pinned
    }

    /// `VirtualMachine.Resume` and `ThreadReference.Resume` calls so far.
    pub fn resume_count(&self) -> usize {
        lock(&self.state, "scripted vm").resumes
    }

    pub fn exit_code(&self) -> Option<i32> {
        lock(&self.state, "scripted vm").exit_code
    }

    /// `Class.method` for every remote invocation, in order.
    pub fn invocations(&self) -> Vec<String> {
        lock(&self.state, "scripted vm").invocations.clone()
    }

    pub fn request_count(&self, kind: u8) -> usize {
        lock(&self.state, "scripted vm")
            .requests
            .values()
            .filter(|r| r.kind == kind)
            .count()
    }

    /// Depths of the installed step requests.
    pub fn step_depths(&self) -> Vec<u32> {
        lock(&self.state, "scripted vm")
            .requests
            .values()
            .filter_map(Request::step)
            .map(|(_, depth)| depth)
            .collect()
    }
}

impl TargetVm for ScriptedVm {
    async fn next_event(&self) -> Option<EventSet> {
        self.events.lock().await.recv().await
    }

    fn disconnect_token(&self) -> CancellationToken {
        self.disconnected.clone()
    }

    async fn resume(&self) -> Result<()> {
        let mut state = lock(&self.state, "scripted vm");
        state.ensure_alive()?;
        state.resume_all(&self.disconnected);
        Ok(())
    }

    async fn resume_thread(&self, _thread: ThreadId) -> Result<()> {
        let mut state = lock(&self.state, "scripted vm");
        state.ensure_alive()?;
        if state.invoking {
            state.resumes += 1;
            drop(state);
            self.invoke_resumed.notify_one();
            return Ok(());
        }
        state.resume_all(&self.disconnected);
        Ok(())
    }

    async fn exit(&self, exit_code: i32) -> Result<()> {
        let mut state = lock(&self.state, "scripted vm");
        state.ensure_alive()?;
        state.exit_code = Some(exit_code);
        state.finish(false, &self.disconnected);
        Ok(())
    }

    async fn set_event_request(
        &self,
        event_kind: u8,
        suspend_policy: u8,
        modifiers: &[EventModifier],
    ) -> Result<i32> {
        let mut state = lock(&self.state, "scripted vm");
        state.ensure_alive()?;
        if !matches!(
            event_kind,
            EVENT_KIND_SINGLE_STEP
                | EVENT_KIND_BREAKPOINT
                | EVENT_KIND_EXCEPTION
                | EVENT_KIND_CLASS_PREPARE
        ) {
            return Err(JdwpError::VmError(ERROR_INVALID_EVENT_TYPE));
        }
        let rejected = modifiers.iter().any(|m| match m {
            EventModifier::ClassMatch { pattern } => state.rejected_matches.contains(pattern),
            _ => false,
        });
        if rejected {
            return Err(JdwpError::VmError(ERROR_INVALID_CLASS));
        }
        let request = Request {
            kind: event_kind,
            suspend_policy: suspend_policy.min(SUSPEND_POLICY_ALL),
            modifiers: modifiers.to_vec(),
        };
        if let Some((thread, _)) = request.step() {
            let duplicate = state
                .requests
                .values()
                .filter_map(Request::step)
                .any(|(other, _)| other == thread);
            if duplicate {
                return Err(JdwpError::VmError(ERROR_DUPLICATE));
            }
        }
        let id = state.next_request_id;
        state.next_request_id += 1;
        state.requests.insert(id, request);
        Ok(id)
    }

    async fn clear_event_request(&self, event_kind: u8, request_id: i32) -> Result<()> {
        let mut state = lock(&self.state, "scripted vm");
        state.ensure_alive()?;
        if state
            .requests
            .get(&request_id)
            .is_some_and(|r| r.kind == event_kind)
        {
            state.requests.remove(&request_id);
        }
        Ok(())
    }

    async fn classes_by_signature(&self, signature: &str) -> Result<Vec<ClassInfo>> {
        let state = lock(&self.state, "scripted vm");
        state.ensure_alive()?;
        Ok(state
            .classes
            .iter()
            .enumerate()
            .map(|(index, class)| (index as ReferenceTypeId + 1, class))
            .filter(|(id, class)| class.signature == signature && state.prepared.contains(id))
            .map(|(type_id, class)| ClassInfo {
                ref_type_tag: TYPE_TAG_CLASS,
                type_id,
                signature: class.signature.clone(),
                status: CLASS_STATUS_INITIALIZED,
            })
            .collect())
    }

    async fn signature(&self, class_id: ReferenceTypeId) -> Result<String> {
        let state = lock(&self.state, "scripted vm");
        Ok(state.class(class_id)?.signature.clone())
    }

    async fn methods(&self, class_id: ReferenceTypeId) -> Result<Vec<MethodInfo>> {
        let state = lock(&self.state, "scripted vm");
        Ok(state
            .class(class_id)?
            .methods
            .iter()
            .map(|m| MethodInfo {
                method_id: m.method_id,
                name: m.name.clone(),
                signature: m.signature.clone(),
                mod_bits: 0x0001,
            })
            .collect())
    }

    async fn superclass(&self, class_id: ReferenceTypeId) -> Result<Option<ReferenceTypeId>> {
        let state = lock(&self.state, "scripted vm");
        Ok(state.class(class_id)?.superclass)
    }

    async fn line_table(
        &self,
        class_id: ReferenceTypeId,
        method_id: MethodId,
    ) -> Result<LineTable> {
        let state = lock(&self.state, "scripted vm");
        let method = state.method(class_id, method_id)?;
        let lines: Vec<_> = method
            .lines
            .iter()
            .map(|line| LineTableEntry {
                code_index: u64::from(*line),
                line: *line as i32,
            })
            .collect();
        Ok(LineTable {
            start: lines.first().map_or(0, |e| e.code_index),
            end: lines.last().map_or(0, |e| e.code_index),
            lines,
        })
    }

    async fn variable_table(
        &self,
        class_id: ReferenceTypeId,
        method_id: MethodId,
    ) -> Result<Vec<VariableInfo>> {
        let state = lock(&self.state, "scripted vm");
        state.method(class_id, method_id)?;
        Ok(state.variables(class_id, method_id))
    }

    async fn frames(&self, thread: ThreadId, start: i32, length: i32) -> Result<Vec<FrameInfo>> {
        let state = lock(&self.state, "scripted vm");
        let (index, step) = state.suspended_step(thread)?;
        if start > 0 || length == 0 {
            return Ok(Vec::new());
        }
        Ok(vec![FrameInfo {
            frame_id: index as FrameId + 1,
            location: step.location(),
        }])
    }

    async fn frame_values(
        &self,
        thread: ThreadId,
        frame_id: FrameId,
        slots: &[(u32, String)],
    ) -> Result<Vec<JdwpValue>> {
        let state = lock(&self.state, "scripted vm");
        let (index, step) = state.suspended_step(thread)?;
        if frame_id != index as FrameId + 1 {
            return Err(JdwpError::VmError(ERROR_INVALID_FRAMEID));
        }
        let vars = state.variables(step.class_id, step.method_id);
        slots
            .iter()
            .map(|(slot, _)| {
                let name = vars
                    .iter()
                    .find(|v| v.slot == *slot)
                    .map(|v| v.name.as_str())
                    .ok_or(JdwpError::VmError(ERROR_INVALID_SLOT))?;
                step.locals
                    .iter()
                    .find(|(local, _)| local == name)
                    .map(|(_, value)| *value)
                    .ok_or(JdwpError::VmError(ERROR_INVALID_SLOT))
            })
            .collect()
    }

    async fn object_type(&self, object: ObjectId) -> Result<ReferenceTypeId> {
        let state = lock(&self.state, "scripted vm");
        Ok(state.object(object)?.class_id)
    }

    async fn string_value(&self, object: ObjectId) -> Result<String> {
        let state = lock(&self.state, "scripted vm");
        match &state.object(object)?.kind {
            ObjectKind::Str(value) => Ok(value.clone()),
            _ => Err(JdwpError::VmError(ERROR_INVALID_STRING)),
        }
    }

    async fn array_length(&self, array: ObjectId) -> Result<i32> {
        let state = lock(&self.state, "scripted vm");
        match &state.object(array)?.kind {
            ObjectKind::Array(values) => Ok(values.len() as i32),
            _ => Err(JdwpError::VmError(ERROR_INVALID_ARRAY)),
        }
    }

    async fn array_values(
        &self,
        array: ObjectId,
        first_index: i32,
        length: i32,
    ) -> Result<Vec<JdwpValue>> {
        let state = lock(&self.state, "scripted vm");
        let ObjectKind::Array(values) = &state.object(array)?.kind else {
            return Err(JdwpError::VmError(ERROR_INVALID_ARRAY));
        };
        let start =
            usize::try_from(first_index).map_err(|_| JdwpError::VmError(ERROR_INVALID_ARRAY))?;
        let len = usize::try_from(length).map_err(|_| JdwpError::VmError(ERROR_INVALID_ARRAY))?;
        values
            .get(start..start + len)
            .map(<[JdwpValue]>::to_vec)
            .ok_or(JdwpError::VmError(ERROR_INVALID_ARRAY))
    }

    async fn invoke_method(
        &self,
        object: ObjectId,
        thread: ThreadId,
        class_id: ReferenceTypeId,
        method_id: MethodId,
        _args: &[JdwpValue],
        _options: u32,
    ) -> Result<InvokeResult> {
        let (outcome, reentrant) = {
            let mut state = lock(&self.state, "scripted vm");
            state.ensure_alive()?;
            let (_, step) = state.suspended_step(thread)?;
            let location = step.location();
            let method = state
                .inherited_method(class_id, method_id)
                .ok_or(JdwpError::VmError(ERROR_INVALID_METHODID))?
                .to_string();
            let (object_class, reentrant, scripted) = {
                let obj = state.object(object)?;
                (
                    obj.class_id,
                    obj.reentrant.contains(&method),
                    obj.outcomes.get(&method).cloned(),
                )
            };
            let class_name = state.class(object_class)?.name.clone();
            state.invocations.push(format!("{class_name}.{method}"));

            let outcome = match scripted {
                Some(outcome) => outcome,
                None if method == "toString" => state.default_to_string(object)?,
                None => return Err(JdwpError::VmError(ERROR_INVALID_METHODID)),
            };
            if reentrant {
                state.invoking = true;
                state.emit(EventSet {
                    suspend_policy: SUSPEND_POLICY_EVENT_THREAD,
                    events: vec![JdwpEvent::Breakpoint {
                        request_id: 0,
                        thread,
                        location,
                    }],
                });
            }
            (outcome, reentrant)
        };

        if reentrant {
            self.invoke_resumed.notified().await;
            lock(&self.state, "scripted vm").invoking = false;
        }

        Ok(match outcome {
            Outcome::Return(value) => InvokeResult {
                value,
                exception: None,
            },
            Outcome::Throw(exception) => InvokeResult {
                value: JdwpValue::null(),
                exception: exception.object_id(),
            },
        })
    }

    async fn disable_collection(&self, object: ObjectId) -> Result<()> {
        let mut state = lock(&self.state, "scripted vm");
        state.object(object)?;
        *state.pins.entry(object).or_default() += 1;
        Ok(())
    }

    async fn enable_collection(&self, object: ObjectId) -> Result<()> {
        let mut state = lock(&self.state, "scripted vm");
        if let Some(count) = state.pins.get_mut(&object) {
            *count -= 1;
            if *count == 0 {
                state.pins.remove(&object);
            }
        }
        Ok(())
    }
}
