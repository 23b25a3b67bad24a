use std::future::Future;

use tokio_util::sync::CancellationToken;

use crate::wire::{
    ClassInfo, EventModifier, EventSet, FrameId, FrameInfo, InvokeResult, JdwpClient, JdwpValue,
    LineTable, MethodId, MethodInfo, ObjectId, ReferenceTypeId, Result, ThreadId, VariableInfo,
};

/// The JDWP command subset the debugger engine drives.
///
/// [`JdwpClient`] implements it over TCP; tests use the scripted VM behind the
/// `test-support` feature.
pub trait TargetVm: Send + Sync + 'static {
    /// Next composite event packet, in arrival order. `None` once the target is gone.
    fn next_event(&self) -> impl Future<Output = Option<EventSet>> + Send;

    /// Cancelled as soon as the connection to the target is lost.
    fn disconnect_token(&self) -> CancellationToken;

    fn resume(&self) -> impl Future<Output = Result<()>> + Send;

    fn resume_thread(&self, thread: ThreadId) -> impl Future<Output = Result<()>> + Send;

    fn exit(&self, exit_code: i32) -> impl Future<Output = Result<()>> + Send;

    fn set_event_request(
        &self,
        event_kind: u8,
        suspend_policy: u8,
        modifiers: &[EventModifier],
    ) -> impl Future<Output = Result<i32>> + Send;

    fn clear_event_request(
        &self,
        event_kind: u8,
        request_id: i32,
    ) -> impl Future<Output = Result<()>> + Send;

    fn classes_by_signature(
        &self,
        signature: &str,
    ) -> impl Future<Output = Result<Vec<ClassInfo>>> + Send;

    fn signature(&self, class_id: ReferenceTypeId) -> impl Future<Output = Result<String>> + Send;

    fn methods(
        &self,
        class_id: ReferenceTypeId,
    ) -> impl Future<Output = Result<Vec<MethodInfo>>> + Send;

    fn superclass(
        &self,
        class_id: ReferenceTypeId,
    ) -> impl Future<Output = Result<Option<ReferenceTypeId>>> + Send;

    fn line_table(
        &self,
        class_id: ReferenceTypeId,
        method_id: MethodId,
    ) -> impl Future<Output = Result<LineTable>> + Send;

    fn variable_table(
        &self,
        class_id: ReferenceTypeId,
        method_id: MethodId,
    ) -> impl Future<Output = Result<Vec<VariableInfo>>> + Send;

    fn frames(
        &self,
        thread: ThreadId,
        start: i32,
        length: i32,
    ) -> impl Future<Output = Result<Vec<FrameInfo>>> + Send;

    fn frame_values(
        &self,
        thread: ThreadId,
        frame_id: FrameId,
        slots: &[(u32, String)],
    ) -> impl Future<Output = Result<Vec<JdwpValue>>> + Send;

    fn object_type(&self, object: ObjectId)
        -> impl Future<Output = Result<ReferenceTypeId>> + Send;

    fn string_value(&self, object: ObjectId) -> impl Future<Output = Result<String>> + Send;

    fn array_length(&self, array: ObjectId) -> impl Future<Output = Result<i32>> + Send;

    fn array_values(
        &self,
        array: ObjectId,
        first_index: i32,
        length: i32,
    ) -> impl Future<Output = Result<Vec<JdwpValue>>> + Send;

    fn invoke_method(
        &self,
        object: ObjectId,
        thread: ThreadId,
        class_id: ReferenceTypeId,
        method_id: MethodId,
        args: &[JdwpValue],
        options: u32,
    ) -> impl Future<Output = Result<InvokeResult>> + Send;

    fn disable_collection(&self, object: ObjectId) -> impl Future<Output = Result<()>> + Send;

    fn enable_collection(&self, object: ObjectId) -> impl Future<Output = Result<()>> + Send;
}

impl TargetVm for JdwpClient {
    async fn next_event(&self) -> Option<EventSet> {
        self.next_event_set().await
    }

    fn disconnect_token(&self) -> CancellationToken {
        self.shutdown_token()
    }

    async fn resume(&self) -> Result<()> {
        self.vm_resume().await
    }

    async fn resume_thread(&self, thread: ThreadId) -> Result<()> {
        self.thread_resume(thread).await
    }

    async fn exit(&self, exit_code: i32) -> Result<()> {
        self.vm_exit(exit_code).await
    }

    async fn set_event_request(
        &self,
        event_kind: u8,
        suspend_policy: u8,
        modifiers: &[EventModifier],
    ) -> Result<i32> {
        self.event_request_set(event_kind, suspend_policy, modifiers)
            .await
    }

    async fn clear_event_request(&self, event_kind: u8, request_id: i32) -> Result<()> {
        self.event_request_clear(event_kind, request_id).await
    }

    async fn classes_by_signature(&self, signature: &str) -> Result<Vec<ClassInfo>> {
        JdwpClient::classes_by_signature(self, signature).await
    }

    async fn signature(&self, class_id: ReferenceTypeId) -> Result<String> {
        self.reference_type_signature(class_id).await
    }

    async fn methods(&self, class_id: ReferenceTypeId) -> Result<Vec<MethodInfo>> {
        self.reference_type_methods(class_id).await
    }

    async fn superclass(&self, class_id: ReferenceTypeId) -> Result<Option<ReferenceTypeId>> {
        self.class_type_superclass(class_id).await
    }

    async fn line_table(
        &self,
        class_id: ReferenceTypeId,
        method_id: MethodId,
    ) -> Result<LineTable> {
        self.method_line_table(class_id, method_id).await
    }

    async fn variable_table(
        &self,
        class_id: ReferenceTypeId,
        method_id: MethodId,
    ) -> Result<Vec<VariableInfo>> {
        self.method_variable_table(class_id, method_id).await
    }

    async fn frames(&self, thread: ThreadId, start: i32, length: i32) -> Result<Vec<FrameInfo>> {
        JdwpClient::frames(self, thread, start, length).await
    }

    async fn frame_values(
        &self,
        thread: ThreadId,
        frame_id: FrameId,
        slots: &[(u32, String)],
    ) -> Result<Vec<JdwpValue>> {
        self.stack_frame_get_values(thread, frame_id, slots).await
    }

    async fn object_type(&self, object: ObjectId) -> Result<ReferenceTypeId> {
        self.object_reference_reference_type(object).await
    }

    async fn string_value(&self, object: ObjectId) -> Result<String> {
        self.string_reference_value(object).await
    }

    async fn array_length(&self, array: ObjectId) -> Result<i32> {
        self.array_reference_length(array).await
    }

    async fn array_values(
        &self,
        array: ObjectId,
        first_index: i32,
        length: i32,
    ) -> Result<Vec<JdwpValue>> {
        self.array_reference_get_values(array, first_index, length)
            .await
    }

    async fn invoke_method(
        &self,
        object: ObjectId,
        thread: ThreadId,
        class_id: ReferenceTypeId,
        method_id: MethodId,
        args: &[JdwpValue],
        options: u32,
    ) -> Result<InvokeResult> {
        self.object_reference_invoke_method(object, thread, class_id, method_id, args, options)
            .await
    }

    async fn disable_collection(&self, object: ObjectId) -> Result<()> {
        self.object_reference_disable_collection(object).await
    }

    async fn enable_collection(&self, object: ObjectId) -> Result<()> {
        self.object_reference_enable_collection(object).await
    }
}
