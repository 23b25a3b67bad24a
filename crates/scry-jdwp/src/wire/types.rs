use std::io;

use thiserror::Error;

pub type ObjectId = u64;
pub type ThreadId = ObjectId;
pub type ReferenceTypeId = u64;
pub type MethodId = u64;
pub type FieldId = u64;
pub type FrameId = u64;

pub type Result<T> = std::result::Result<T, JdwpError>;

pub const HEADER_LEN: usize = 11;

pub const EVENT_KIND_SINGLE_STEP: u8 = 1;
pub const EVENT_KIND_BREAKPOINT: u8 = 2;
pub const EVENT_KIND_EXCEPTION: u8 = 4;
pub const EVENT_KIND_CLASS_PREPARE: u8 = 8;
pub const EVENT_KIND_VM_START: u8 = 90;
pub const EVENT_KIND_VM_DEATH: u8 = 99;

pub const SUSPEND_POLICY_NONE: u8 = 0;
pub const SUSPEND_POLICY_EVENT_THREAD: u8 = 1;
pub const SUSPEND_POLICY_ALL: u8 = 2;

pub const STEP_SIZE_LINE: u32 = 1;
pub const STEP_DEPTH_INTO: u32 = 0;
pub const STEP_DEPTH_OVER: u32 = 1;
pub const STEP_DEPTH_OUT: u32 = 2;

pub const TYPE_TAG_CLASS: u8 = 1;

pub const TAG_ARRAY: u8 = b'[';
pub const TAG_OBJECT: u8 = b'L';
pub const TAG_STRING: u8 = b's';
pub const TAG_THREAD: u8 = b't';

/// `ObjectReference.InvokeMethod` option: only the invoking thread resumes.
pub const INVOKE_SINGLE_THREADED: u32 = 0x01;

pub const ERROR_INVALID_THREAD: u16 = 10;
pub const ERROR_THREAD_NOT_SUSPENDED: u16 = 13;
pub const ERROR_INVALID_OBJECT: u16 = 20;
pub const ERROR_INVALID_CLASS: u16 = 21;
pub const ERROR_INVALID_METHODID: u16 = 23;
pub const ERROR_INVALID_FRAMEID: u16 = 30;
pub const ERROR_INVALID_SLOT: u16 = 35;
pub const ERROR_DUPLICATE: u16 = 40;
pub const ERROR_INVALID_STRING: u16 = 506;
pub const ERROR_INVALID_ARRAY: u16 = 508;
pub const ERROR_ABSENT_INFORMATION: u16 = 101;
pub const ERROR_INVALID_EVENT_TYPE: u16 = 102;
pub const ERROR_VM_DEAD: u16 = 112;

#[derive(Debug, Error)]
pub enum JdwpError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("vm returned error code {0}")]
    VmError(u16),
    #[error("timed out waiting for reply")]
    Timeout,
    #[error("request cancelled")]
    Cancelled,
    #[error("connection closed")]
    ConnectionClosed,
}

impl JdwpError {
    pub fn vm_error_code(&self) -> Option<u16> {
        match self {
            JdwpError::VmError(code) => Some(*code),
            _ => None,
        }
    }

    /// The connection is gone; no further command can succeed.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            JdwpError::ConnectionClosed | JdwpError::Cancelled | JdwpError::VmError(ERROR_VM_DEAD)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JdwpIdSizes {
    pub field_id: usize,
    pub method_id: usize,
    pub object_id: usize,
    pub reference_type_id: usize,
    pub frame_id: usize,
}

impl Default for JdwpIdSizes {
    fn default() -> Self {
        Self {
            field_id: 8,
            method_id: 8,
            object_id: 8,
            reference_type_id: 8,
            frame_id: 8,
        }
    }
}

/// An executable position: class, method and bytecode index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Location {
    pub type_tag: u8,
    pub class_id: ReferenceTypeId,
    pub method_id: MethodId,
    pub index: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum JdwpValue {
    Void,
    Boolean(bool),
    Byte(i8),
    Char(u16),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    /// Any reference value. `id == 0` is `null`.
    Object { tag: u8, id: ObjectId },
}

impl JdwpValue {
    pub fn null() -> Self {
        JdwpValue::Object {
            tag: TAG_OBJECT,
            id: 0,
        }
    }

    pub fn tag(&self) -> u8 {
        match *self {
            JdwpValue::Void => b'V',
            JdwpValue::Boolean(_) => b'Z',
            JdwpValue::Byte(_) => b'B',
            JdwpValue::Char(_) => b'C',
            JdwpValue::Short(_) => b'S',
            JdwpValue::Int(_) => b'I',
            JdwpValue::Long(_) => b'J',
            JdwpValue::Float(_) => b'F',
            JdwpValue::Double(_) => b'D',
            JdwpValue::Object { tag, .. } => tag,
        }
    }

    pub fn object_id(&self) -> Option<ObjectId> {
        match *self {
            JdwpValue::Object { id, .. } if id != 0 => Some(id),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, JdwpValue::Object { id: 0, .. })
    }
}

/// Primitive tags are transmitted untagged inside array regions.
pub fn is_primitive_tag(tag: u8) -> bool {
    matches!(tag, b'Z' | b'B' | b'C' | b'S' | b'I' | b'J' | b'F' | b'D' | b'V')
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassInfo {
    pub ref_type_tag: u8,
    pub type_id: ReferenceTypeId,
    pub signature: String,
    pub status: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodInfo {
    pub method_id: MethodId,
    pub name: String,
    pub signature: String,
    pub mod_bits: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineTableEntry {
    pub code_index: u64,
    pub line: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LineTable {
    pub start: u64,
    pub end: u64,
    pub lines: Vec<LineTableEntry>,
}

impl LineTable {
    /// Source line for a code index: the last entry at or before it.
    pub fn line_for_index(&self, index: u64) -> Option<i32> {
        self.lines
            .iter()
            .filter(|entry| entry.code_index <= index)
            .max_by_key(|entry| entry.code_index)
            .map(|entry| entry.line)
    }

    /// Lowest code index that starts `line`, if any.
    pub fn first_index_of_line(&self, line: i32) -> Option<u64> {
        self.lines
            .iter()
            .filter(|entry| entry.line == line)
            .map(|entry| entry.code_index)
            .min()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableInfo {
    pub code_index: u64,
    pub name: String,
    pub signature: String,
    pub length: u32,
    pub slot: u32,
}

impl VariableInfo {
    pub fn is_live_at(&self, index: u64) -> bool {
        index >= self.code_index && index < self.code_index.saturating_add(u64::from(self.length))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    pub frame_id: FrameId,
    pub location: Location,
}

/// Reply of `ObjectReference.InvokeMethod`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InvokeResult {
    pub value: JdwpValue,
    /// Thrown exception, if the invoked method completed abruptly.
    pub exception: Option<ObjectId>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum JdwpEvent {
    VmStart {
        request_id: i32,
        thread: ThreadId,
    },
    SingleStep {
        request_id: i32,
        thread: ThreadId,
        location: Location,
    },
    Breakpoint {
        request_id: i32,
        thread: ThreadId,
        location: Location,
    },
    Exception {
        request_id: i32,
        thread: ThreadId,
        location: Location,
        exception: JdwpValue,
        catch_location: Option<Location>,
    },
    ClassPrepare {
        request_id: i32,
        thread: ThreadId,
        ref_type_tag: u8,
        type_id: ReferenceTypeId,
        signature: String,
        status: u32,
    },
    VmDeath {
        request_id: i32,
    },
}

impl JdwpEvent {
    pub fn kind(&self) -> u8 {
        match self {
            JdwpEvent::VmStart { .. } => EVENT_KIND_VM_START,
            JdwpEvent::SingleStep { .. } => EVENT_KIND_SINGLE_STEP,
            JdwpEvent::Breakpoint { .. } => EVENT_KIND_BREAKPOINT,
            JdwpEvent::Exception { .. } => EVENT_KIND_EXCEPTION,
            JdwpEvent::ClassPrepare { .. } => EVENT_KIND_CLASS_PREPARE,
            JdwpEvent::VmDeath { .. } => EVENT_KIND_VM_DEATH,
        }
    }

    pub fn thread(&self) -> Option<ThreadId> {
        match *self {
            JdwpEvent::VmStart { thread, .. }
            | JdwpEvent::SingleStep { thread, .. }
            | JdwpEvent::Breakpoint { thread, .. }
            | JdwpEvent::Exception { thread, .. }
            | JdwpEvent::ClassPrepare { thread, .. } => Some(thread),
            JdwpEvent::VmDeath { .. } => None,
        }
    }
}

/// One composite event packet: every event in it shares a suspend policy.
#[derive(Debug, Clone, PartialEq)]
pub struct EventSet {
    pub suspend_policy: u8,
    pub events: Vec<JdwpEvent>,
}

impl EventSet {
    pub fn suspends(&self) -> bool {
        self.suspend_policy != SUSPEND_POLICY_NONE
    }
}
