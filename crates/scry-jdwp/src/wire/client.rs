use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    sync::{mpsc, oneshot, Mutex},
};
use tokio_util::sync::CancellationToken;

use super::{
    codec::{
        encode_command, JdwpReader, JdwpWriter, EVENT_COMMAND_COMPOSITE, EVENT_COMMAND_SET,
        FLAG_REPLY, HANDSHAKE,
    },
    signature::signature_to_tag,
    types::{
        ClassInfo, EventSet, FrameId, FrameInfo, InvokeResult, JdwpError, JdwpEvent, JdwpIdSizes,
        JdwpValue, LineTable, LineTableEntry, Location, MethodId, MethodInfo, ObjectId,
        ReferenceTypeId, Result, ThreadId, VariableInfo, EVENT_KIND_BREAKPOINT,
        EVENT_KIND_CLASS_PREPARE, EVENT_KIND_EXCEPTION, EVENT_KIND_SINGLE_STEP,
        EVENT_KIND_VM_DEATH, EVENT_KIND_VM_START, HEADER_LEN,
    },
};

#[derive(Debug, Clone)]
pub struct JdwpClientConfig {
    pub handshake_timeout: Duration,
    pub reply_timeout: Duration,
}

impl Default for JdwpClientConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(5),
            reply_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug)]
struct Reply {
    error_code: u16,
    payload: Vec<u8>,
}

type PendingReplies = HashMap<u32, oneshot::Sender<std::result::Result<Reply, JdwpError>>>;

#[derive(Debug)]
struct Inner {
    writer: Mutex<tokio::net::tcp::OwnedWriteHalf>,
    pending: Mutex<PendingReplies>,
    next_id: AtomicU32,
    id_sizes: Mutex<JdwpIdSizes>,
    events: Mutex<mpsc::UnboundedReceiver<EventSet>>,
    shutdown: CancellationToken,
    config: JdwpClientConfig,
}

/// Async JDWP client over TCP.
///
/// Replies are matched to commands by packet id on a background read task.
/// Composite event packets are delivered in arrival order through
/// [`JdwpClient::next_event_set`]; the stream ends when the connection closes.
#[derive(Clone, Debug)]
pub struct JdwpClient {
    inner: Arc<Inner>,
}

impl JdwpClient {
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        Self::connect_with_config(addr, JdwpClientConfig::default()).await
    }

    pub async fn connect_with_config(addr: SocketAddr, config: JdwpClientConfig) -> Result<Self> {
        let mut stream = TcpStream::connect(addr).await?;
        let _ = stream.set_nodelay(true);

        tokio::time::timeout(config.handshake_timeout, stream.write_all(HANDSHAKE))
            .await
            .map_err(|_| JdwpError::Timeout)??;

        let mut handshake = [0u8; HANDSHAKE.len()];
        tokio::time::timeout(config.handshake_timeout, stream.read_exact(&mut handshake))
            .await
            .map_err(|_| JdwpError::Timeout)??;

        if handshake != *HANDSHAKE {
            return Err(JdwpError::Protocol(format!(
                "invalid handshake reply: {:?}",
                String::from_utf8_lossy(&handshake)
            )));
        }

        let (reader, writer) = stream.into_split();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(Inner {
            writer: Mutex::new(writer),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU32::new(1),
            id_sizes: Mutex::new(JdwpIdSizes::default()),
            events: Mutex::new(events_rx),
            shutdown: CancellationToken::new(),
            config,
        });

        tokio::spawn(read_loop(reader, inner.clone(), events_tx));

        let client = Self { inner };
        // Every id-bearing reply and event depends on the negotiated sizes.
        let sizes = client.idsizes().await?;
        tracing::debug!(target: "scry.jdwp", %addr, ?sizes, "jdwp connection established");

        Ok(client)
    }

    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    /// Cancelled when the client is shut down or the TCP connection closes.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    /// Next composite event packet, or `None` once the connection is gone.
    pub async fn next_event_set(&self) -> Option<EventSet> {
        self.inner.events.lock().await.recv().await
    }

    async fn send_command_raw(
        &self,
        command_set: u8,
        command: u8,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>> {
        if self.inner.shutdown.is_cancelled() {
            return Err(JdwpError::ConnectionClosed);
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        self.inner.pending.lock().await.insert(id, tx);

        let packet = encode_command(id, command_set, command, &payload);
        {
            let mut writer = self.inner.writer.lock().await;
            if let Err(err) = writer.write_all(&packet).await {
                drop(writer);
                self.remove_pending(id).await;
                return Err(err.into());
            }
        }

        let reply = tokio::select! {
            _ = self.inner.shutdown.cancelled() => {
                self.remove_pending(id).await;
                return Err(JdwpError::Cancelled);
            }
            res = tokio::time::timeout(self.inner.config.reply_timeout, rx) => {
                match res {
                    Ok(Ok(r)) => r,
                    Ok(Err(_closed)) => return Err(JdwpError::ConnectionClosed),
                    Err(_elapsed) => {
                        self.remove_pending(id).await;
                        tracing::warn!(
                            target: "scry.jdwp",
                            command_set,
                            command,
                            "timed out waiting for jdwp reply"
                        );
                        return Err(JdwpError::Timeout);
                    }
                }
            }
        }?;

        if reply.error_code != 0 {
            return Err(JdwpError::VmError(reply.error_code));
        }

        Ok(reply.payload)
    }

    async fn remove_pending(&self, id: u32) {
        self.inner.pending.lock().await.remove(&id);
    }

    async fn id_sizes(&self) -> JdwpIdSizes {
        *self.inner.id_sizes.lock().await
    }

    /// VirtualMachine.IDSizes (1, 7)
    pub async fn idsizes(&self) -> Result<JdwpIdSizes> {
        let payload = self.send_command_raw(1, 7, Vec::new()).await?;
        let mut r = JdwpReader::new(&payload);
        let sizes = JdwpIdSizes {
            field_id: r.read_u32()? as usize,
            method_id: r.read_u32()? as usize,
            object_id: r.read_u32()? as usize,
            reference_type_id: r.read_u32()? as usize,
            frame_id: r.read_u32()? as usize,
        };
        *self.inner.id_sizes.lock().await = sizes;
        Ok(sizes)
    }

    /// VirtualMachine.ClassesBySignature (1, 2)
    pub async fn classes_by_signature(&self, signature: &str) -> Result<Vec<ClassInfo>> {
        let mut w = JdwpWriter::new();
        w.write_string(signature);
        let payload = self.send_command_raw(1, 2, w.into_vec()).await?;
        let sizes = self.id_sizes().await;
        let mut r = JdwpReader::new(&payload);

        let count = r.read_u32()? as usize;
        let mut classes = Vec::with_capacity(count);
        for _ in 0..count {
            classes.push(ClassInfo {
                ref_type_tag: r.read_u8()?,
                type_id: r.read_reference_type_id(&sizes)?,
                signature: signature.to_string(),
                status: r.read_u32()?,
            });
        }
        Ok(classes)
    }

    /// VirtualMachine.Resume (1, 9)
    pub async fn vm_resume(&self) -> Result<()> {
        self.send_command_raw(1, 9, Vec::new()).await.map(drop)
    }

    /// VirtualMachine.Exit (1, 10)
    pub async fn vm_exit(&self, exit_code: i32) -> Result<()> {
        let mut w = JdwpWriter::new();
        w.write_i32(exit_code);
        self.send_command_raw(1, 10, w.into_vec()).await.map(drop)
    }

    /// ReferenceType.Signature (2, 1)
    pub async fn reference_type_signature(&self, class_id: ReferenceTypeId) -> Result<String> {
        let sizes = self.id_sizes().await;
        let mut w = JdwpWriter::new();
        w.write_reference_type_id(class_id, &sizes);
        let payload = self.send_command_raw(2, 1, w.into_vec()).await?;
        JdwpReader::new(&payload).read_string()
    }

    /// ReferenceType.Methods (2, 5)
    pub async fn reference_type_methods(
        &self,
        class_id: ReferenceTypeId,
    ) -> Result<Vec<MethodInfo>> {
        let sizes = self.id_sizes().await;
        let mut w = JdwpWriter::new();
        w.write_reference_type_id(class_id, &sizes);
        let payload = self.send_command_raw(2, 5, w.into_vec()).await?;
        let mut r = JdwpReader::new(&payload);
        let count = r.read_u32()? as usize;
        let mut methods = Vec::with_capacity(count);
        for _ in 0..count {
            methods.push(MethodInfo {
                method_id: r.read_id(sizes.method_id)?,
                name: r.read_string()?,
                signature: r.read_string()?,
                mod_bits: r.read_u32()?,
            });
        }
        Ok(methods)
    }

    /// ClassType.Superclass (3, 1). `None` for `java.lang.Object` and interfaces.
    pub async fn class_type_superclass(
        &self,
        class_id: ReferenceTypeId,
    ) -> Result<Option<ReferenceTypeId>> {
        let sizes = self.id_sizes().await;
        let mut w = JdwpWriter::new();
        w.write_reference_type_id(class_id, &sizes);
        let payload = self.send_command_raw(3, 1, w.into_vec()).await?;
        let superclass = JdwpReader::new(&payload).read_reference_type_id(&sizes)?;
        Ok((superclass != 0).then_some(superclass))
    }

    /// Method.LineTable (6, 1)
    pub async fn method_line_table(
        &self,
        class_id: ReferenceTypeId,
        method_id: MethodId,
    ) -> Result<LineTable> {
        let sizes = self.id_sizes().await;
        let mut w = JdwpWriter::new();
        w.write_reference_type_id(class_id, &sizes);
        w.write_id(method_id, sizes.method_id);
        let payload = self.send_command_raw(6, 1, w.into_vec()).await?;
        let mut r = JdwpReader::new(&payload);
        let start = r.read_u64()?;
        let end = r.read_u64()?;
        let count = r.read_u32()? as usize;
        let mut lines = Vec::with_capacity(count);
        for _ in 0..count {
            lines.push(LineTableEntry {
                code_index: r.read_u64()?,
                line: r.read_i32()?,
            });
        }
        Ok(LineTable { start, end, lines })
    }

    /// Method.VariableTable (6, 2). The argument count is dropped.
    pub async fn method_variable_table(
        &self,
        class_id: ReferenceTypeId,
        method_id: MethodId,
    ) -> Result<Vec<VariableInfo>> {
        let sizes = self.id_sizes().await;
        let mut w = JdwpWriter::new();
        w.write_reference_type_id(class_id, &sizes);
        w.write_id(method_id, sizes.method_id);
        let payload = self.send_command_raw(6, 2, w.into_vec()).await?;
        let mut r = JdwpReader::new(&payload);
        let _arg_count = r.read_u32()?;
        let count = r.read_u32()? as usize;
        let mut vars = Vec::with_capacity(count);
        for _ in 0..count {
            vars.push(VariableInfo {
                code_index: r.read_u64()?,
                name: r.read_string()?,
                signature: r.read_string()?,
                length: r.read_u32()?,
                slot: r.read_u32()?,
            });
        }
        Ok(vars)
    }

    /// ObjectReference.ReferenceType (9, 1)
    pub async fn object_reference_reference_type(
        &self,
        object_id: ObjectId,
    ) -> Result<ReferenceTypeId> {
        let sizes = self.id_sizes().await;
        let mut w = JdwpWriter::new();
        w.write_object_id(object_id, &sizes);
        let payload = self.send_command_raw(9, 1, w.into_vec()).await?;
        let mut r = JdwpReader::new(&payload);
        let _ref_type_tag = r.read_u8()?;
        r.read_reference_type_id(&sizes)
    }

    /// ObjectReference.InvokeMethod (9, 6)
    pub async fn object_reference_invoke_method(
        &self,
        object_id: ObjectId,
        thread: ThreadId,
        class_id: ReferenceTypeId,
        method_id: MethodId,
        args: &[JdwpValue],
        options: u32,
    ) -> Result<InvokeResult> {
        let sizes = self.id_sizes().await;
        let mut w = JdwpWriter::new();
        w.write_object_id(object_id, &sizes);
        w.write_object_id(thread, &sizes);
        w.write_reference_type_id(class_id, &sizes);
        w.write_id(method_id, sizes.method_id);
        w.write_u32(args.len() as u32);
        for arg in args {
            w.write_tagged_value(arg, &sizes);
        }
        w.write_u32(options);
        let payload = self.send_command_raw(9, 6, w.into_vec()).await?;
        let mut r = JdwpReader::new(&payload);
        let value = r.read_tagged_value(&sizes)?;
        let exception = r.read_tagged_value(&sizes)?.object_id();
        Ok(InvokeResult { value, exception })
    }

    /// ObjectReference.DisableCollection (9, 7)
    pub async fn object_reference_disable_collection(&self, object_id: ObjectId) -> Result<()> {
        self.object_command(9, 7, object_id).await.map(drop)
    }

    /// ObjectReference.EnableCollection (9, 8)
    pub async fn object_reference_enable_collection(&self, object_id: ObjectId) -> Result<()> {
        self.object_command(9, 8, object_id).await.map(drop)
    }

    /// StringReference.Value (10, 1)
    pub async fn string_reference_value(&self, string_id: ObjectId) -> Result<String> {
        let payload = self.object_command(10, 1, string_id).await?;
        JdwpReader::new(&payload).read_string()
    }

    /// ThreadReference.Resume (11, 3)
    pub async fn thread_resume(&self, thread: ThreadId) -> Result<()> {
        self.object_command(11, 3, thread).await.map(drop)
    }

    /// ThreadReference.Frames (11, 6)
    pub async fn frames(
        &self,
        thread: ThreadId,
        start: i32,
        length: i32,
    ) -> Result<Vec<FrameInfo>> {
        let sizes = self.id_sizes().await;
        let mut w = JdwpWriter::new();
        w.write_object_id(thread, &sizes);
        w.write_i32(start);
        w.write_i32(length);
        let payload = self.send_command_raw(11, 6, w.into_vec()).await?;
        let mut r = JdwpReader::new(&payload);
        let count = r.read_u32()? as usize;
        let mut frames = Vec::with_capacity(count);
        for _ in 0..count {
            let frame_id = r.read_id(sizes.frame_id)?;
            let location = r.read_location(&sizes)?;
            frames.push(FrameInfo { frame_id, location });
        }
        Ok(frames)
    }

    /// ArrayReference.Length (13, 1)
    pub async fn array_reference_length(&self, array_id: ObjectId) -> Result<i32> {
        let payload = self.object_command(13, 1, array_id).await?;
        JdwpReader::new(&payload).read_i32()
    }

    /// ArrayReference.GetValues (13, 2)
    pub async fn array_reference_get_values(
        &self,
        array_id: ObjectId,
        first_index: i32,
        length: i32,
    ) -> Result<Vec<JdwpValue>> {
        let sizes = self.id_sizes().await;
        let mut w = JdwpWriter::new();
        w.write_object_id(array_id, &sizes);
        w.write_i32(first_index);
        w.write_i32(length);
        let payload = self.send_command_raw(13, 2, w.into_vec()).await?;
        JdwpReader::new(&payload).read_array_region(&sizes)
    }

    /// EventRequest.Set (15, 1)
    pub async fn event_request_set(
        &self,
        event_kind: u8,
        suspend_policy: u8,
        modifiers: &[EventModifier],
    ) -> Result<i32> {
        let sizes = self.id_sizes().await;
        let mut w = JdwpWriter::new();
        w.write_u8(event_kind);
        w.write_u8(suspend_policy);
        w.write_u32(modifiers.len() as u32);
        for modifier in modifiers {
            modifier.encode(&mut w, &sizes);
        }
        let payload = self.send_command_raw(15, 1, w.into_vec()).await?;
        JdwpReader::new(&payload).read_i32()
    }

    /// EventRequest.Clear (15, 2)
    pub async fn event_request_clear(&self, event_kind: u8, request_id: i32) -> Result<()> {
        let mut w = JdwpWriter::new();
        w.write_u8(event_kind);
        w.write_i32(request_id);
        self.send_command_raw(15, 2, w.into_vec()).await.map(drop)
    }

    /// StackFrame.GetValues (16, 1)
    pub async fn stack_frame_get_values(
        &self,
        thread: ThreadId,
        frame_id: FrameId,
        slots: &[(u32, String)],
    ) -> Result<Vec<JdwpValue>> {
        let sizes = self.id_sizes().await;
        let mut w = JdwpWriter::new();
        w.write_object_id(thread, &sizes);
        w.write_id(frame_id, sizes.frame_id);
        w.write_u32(slots.len() as u32);
        for (slot, signature) in slots {
            w.write_u32(*slot);
            w.write_u8(signature_to_tag(signature));
        }
        let payload = self.send_command_raw(16, 1, w.into_vec()).await?;
        let mut r = JdwpReader::new(&payload);
        let count = r.read_u32()? as usize;
        let mut values = Vec::with_capacity(count);
        for _ in 0..count {
            values.push(r.read_tagged_value(&sizes)?);
        }
        Ok(values)
    }

    /// Commands whose payload is a single object id.
    async fn object_command(&self, command_set: u8, command: u8, id: ObjectId) -> Result<Vec<u8>> {
        let sizes = self.id_sizes().await;
        let mut w = JdwpWriter::new();
        w.write_object_id(id, &sizes);
        self.send_command_raw(command_set, command, w.into_vec()).await
    }
}

/// Filters attached to an `EventRequest.Set`.
#[derive(Debug, Clone, PartialEq)]
pub enum EventModifier {
    ClassMatch {
        pattern: String,
    },
    ClassExclude {
        pattern: String,
    },
    LocationOnly {
        location: Location,
    },
    ExceptionOnly {
        exception_or_null: ReferenceTypeId,
        caught: bool,
        uncaught: bool,
    },
    Step {
        thread: ThreadId,
        size: u32,
        depth: u32,
    },
}

impl EventModifier {
    fn encode(&self, w: &mut JdwpWriter, sizes: &JdwpIdSizes) {
        match self {
            EventModifier::ClassMatch { pattern } => {
                w.write_u8(5);
                w.write_string(pattern);
            }
            EventModifier::ClassExclude { pattern } => {
                w.write_u8(6);
                w.write_string(pattern);
            }
            EventModifier::LocationOnly { location } => {
                w.write_u8(7);
                w.write_location(location, sizes);
            }
            EventModifier::ExceptionOnly {
                exception_or_null,
                caught,
                uncaught,
            } => {
                w.write_u8(8);
                w.write_reference_type_id(*exception_or_null, sizes);
                w.write_bool(*caught);
                w.write_bool(*uncaught);
            }
            EventModifier::Step {
                thread,
                size,
                depth,
            } => {
                w.write_u8(10);
                w.write_object_id(*thread, sizes);
                w.write_u32(*size);
                w.write_u32(*depth);
            }
        }
    }
}

async fn read_loop(
    mut reader: tokio::net::tcp::OwnedReadHalf,
    inner: Arc<Inner>,
    events: mpsc::UnboundedSender<EventSet>,
) {
    loop {
        let mut header = [0u8; HEADER_LEN];
        let header_read = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            res = reader.read_exact(&mut header) => res,
        };
        if let Err(err) = header_read {
            tracing::debug!(target: "scry.jdwp", error = %err, "jdwp connection closed");
            break;
        }

        let length = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
        if length < HEADER_LEN {
            tracing::error!(target: "scry.jdwp", length, "malformed jdwp packet length");
            break;
        }

        let id = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
        let flags = header[8];
        let mut payload = vec![0u8; length - HEADER_LEN];
        let payload_read = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            res = reader.read_exact(&mut payload) => res,
        };
        if let Err(err) = payload_read {
            tracing::debug!(target: "scry.jdwp", error = %err, "jdwp connection closed mid-packet");
            break;
        }

        if (flags & FLAG_REPLY) != 0 {
            let error_code = u16::from_be_bytes([header[9], header[10]]);
            let tx = inner.pending.lock().await.remove(&id);
            if let Some(tx) = tx {
                let _ = tx.send(Ok(Reply {
                    error_code,
                    payload,
                }));
            }
            continue;
        }

        let (command_set, command) = (header[9], header[10]);
        if command_set != EVENT_COMMAND_SET || command != EVENT_COMMAND_COMPOSITE {
            tracing::debug!(
                target: "scry.jdwp",
                command_set,
                command,
                "ignoring unsupported vm command packet"
            );
            continue;
        }

        let sizes = *inner.id_sizes.lock().await;
        match parse_event_set(&payload, &sizes) {
            Ok(set) => {
                if events.send(set).is_err() {
                    tracing::debug!(target: "scry.jdwp", "event receiver dropped");
                }
            }
            Err(err) => {
                tracing::error!(target: "scry.jdwp", error = %err, "failed to parse event packet");
                break;
            }
        }
    }

    inner.shutdown.cancel();

    let pending = std::mem::take(&mut *inner.pending.lock().await);
    for (_id, tx) in pending {
        let _ = tx.send(Err(JdwpError::ConnectionClosed));
    }
}

/// Parses the payload of an `Event.Composite` (64, 100) packet.
pub fn parse_event_set(payload: &[u8], sizes: &JdwpIdSizes) -> Result<EventSet> {
    let mut r = JdwpReader::new(payload);
    let suspend_policy = r.read_u8()?;
    let event_count = r.read_u32()? as usize;
    let mut events = Vec::with_capacity(event_count.min(64));
    for _ in 0..event_count {
        let kind = r.read_u8()?;
        let request_id = r.read_i32()?;
        let event = match kind {
            EVENT_KIND_SINGLE_STEP => JdwpEvent::SingleStep {
                request_id,
                thread: r.read_object_id(sizes)?,
                location: r.read_location(sizes)?,
            },
            EVENT_KIND_BREAKPOINT => JdwpEvent::Breakpoint {
                request_id,
                thread: r.read_object_id(sizes)?,
                location: r.read_location(sizes)?,
            },
            EVENT_KIND_EXCEPTION => JdwpEvent::Exception {
                request_id,
                thread: r.read_object_id(sizes)?,
                location: r.read_location(sizes)?,
                exception: r.read_tagged_value(sizes)?,
                catch_location: r.read_optional_location(sizes)?,
            },
            EVENT_KIND_CLASS_PREPARE => JdwpEvent::ClassPrepare {
                request_id,
                thread: r.read_object_id(sizes)?,
                ref_type_tag: r.read_u8()?,
                type_id: r.read_reference_type_id(sizes)?,
                signature: r.read_string()?,
                status: r.read_u32()?,
            },
            EVENT_KIND_VM_START => JdwpEvent::VmStart {
                request_id,
                thread: r.read_object_id(sizes)?,
            },
            EVENT_KIND_VM_DEATH => JdwpEvent::VmDeath { request_id },
            other => {
                // Layout unknown: the rest of the packet cannot be decoded.
                tracing::debug!(target: "scry.jdwp", kind = other, "unsupported event kind");
                break;
            }
        };
        events.push(event);
    }
    Ok(EventSet {
        suspend_policy,
        events,
    })
}
