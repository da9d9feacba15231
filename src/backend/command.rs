// Command recording
//
// Two ways to get commands to the GPU:
// - Recording: the per-frame command buffer handed out by begin_frame and
//   consumed by end_frame. Every call that records frame work takes it.
// - Transient commands: one-shot buffers submitted on a dedicated fence and
//   waited on synchronously, used for uploads and transitions outside a frame.

use super::error::{BackendError, BackendResult};
use super::rendertarget::RenderTarget;
use super::VulkanDevice;
use ash::vk;
use std::rc::Rc;
use std::sync::Arc;

/// Pool and fence reserved for transient commands.
pub struct TransientPool {
    pool: vk::CommandPool,
    fence: vk::Fence,
}

impl TransientPool {
    pub fn new(device: &ash::Device, queue_family: u32) -> BackendResult<Self> {
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(queue_family)
            .flags(
                vk::CommandPoolCreateFlags::TRANSIENT
                    | vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
            );
        let pool = unsafe { device.create_command_pool(&pool_info, None)? };

        let fence_info = vk::FenceCreateInfo::builder();
        let fence = match unsafe { device.create_fence(&fence_info, None) } {
            Ok(fence) => fence,
            Err(e) => {
                unsafe { device.destroy_command_pool(pool, None) };
                return Err(e.into());
            }
        };

        Ok(Self { pool, fence })
    }

    /// Allocates a primary buffer and begins it for one submission.
    pub fn begin(&self, device: &ash::Device) -> BackendResult<vk::CommandBuffer> {
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let cmd = unsafe { device.allocate_command_buffers(&alloc_info)? }
            .into_iter()
            .next()
            .ok_or_else(|| BackendError::ExternalApi("no transient command buffer".into()))?;

        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        if let Err(e) = unsafe { device.begin_command_buffer(cmd, &begin_info) } {
            unsafe { device.free_command_buffers(self.pool, &[cmd]) };
            return Err(e.into());
        }
        Ok(cmd)
    }

    /// Ends, submits and waits for `cmd`, then frees it.
    pub fn execute(
        &self,
        device: &ash::Device,
        queue: vk::Queue,
        cmd: vk::CommandBuffer,
        timeout: u64,
    ) -> BackendResult<()> {
        let result = self.submit_and_wait(device, queue, cmd, timeout);
        unsafe { device.free_command_buffers(self.pool, &[cmd]) };
        result
    }

    fn submit_and_wait(
        &self,
        device: &ash::Device,
        queue: vk::Queue,
        cmd: vk::CommandBuffer,
        timeout: u64,
    ) -> BackendResult<()> {
        let command_buffers = [cmd];
        let submit_info = vk::SubmitInfo::builder()
            .command_buffers(&command_buffers)
            .build();

        unsafe {
            device.end_command_buffer(cmd)?;
            device.reset_fences(&[self.fence])?;
            device.queue_submit(queue, &[submit_info], self.fence)?;
            match device.wait_for_fences(&[self.fence], true, timeout) {
                Ok(()) => Ok(()),
                Err(vk::Result::TIMEOUT) => Err(BackendError::ExternalApi(
                    "timed out waiting for transient command".into(),
                )),
                Err(e) => Err(e.into()),
            }
        }
    }

    pub fn destroy(&self, device: &ash::Device) {
        unsafe {
            device.destroy_fence(self.fence, None);
            device.destroy_command_pool(self.pool, None);
        }
    }
}

/// Records `f` into the frame's command buffer when `recording` is given,
/// otherwise into a transient command that is executed before returning.
pub fn record_commands<F>(
    device: &VulkanDevice,
    recording: Option<&Recording>,
    f: F,
) -> BackendResult<()>
where
    F: FnOnce(vk::CommandBuffer) -> BackendResult<()>,
{
    match recording {
        Some(rec) => f(rec.command_buffer),
        None => {
            let cmd = device.begin_transient_command()?;
            match f(cmd) {
                Ok(()) => device.execute_transient_command(cmd),
                Err(e) => {
                    // Still submit so the buffer goes back to the pool.
                    let _ = device.execute_transient_command(cmd);
                    Err(e)
                }
            }
        }
    }
}

/// Per-frame recording context.
///
/// Returned by `begin_frame`, threaded through every call that records
/// frame work and consumed by `end_frame`. It is deliberately not `Clone`:
/// holding one means the frame slot is in the recording state.
pub struct Recording {
    pub(crate) device: Arc<VulkanDevice>,
    pub(crate) command_buffer: vk::CommandBuffer,
    pub(crate) frame_index: usize,
    pub(crate) serial: u64,
    pub(crate) rendertarget: Option<Rc<RenderTarget>>,
    pub(crate) pass_open: bool,
    pub(crate) viewport: [i32; 4],
    pub(crate) scissor: [i32; 4],
}

impl Recording {
    pub fn command_buffer(&self) -> vk::CommandBuffer {
        self.command_buffer
    }

    /// Frame slot this recording belongs to.
    pub fn frame_index(&self) -> usize {
        self.frame_index
    }

    /// Monotonic frame counter, starting at 0.
    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn viewport(&self) -> [i32; 4] {
        self.viewport
    }

    pub fn set_viewport(&mut self, viewport: [i32; 4]) {
        self.viewport = viewport;
    }

    pub fn scissor(&self) -> [i32; 4] {
        self.scissor
    }

    pub fn set_scissor(&mut self, scissor: [i32; 4]) {
        self.scissor = scissor;
    }

    /// Render target of the current pass, if any.
    pub fn rendertarget(&self) -> Option<&Rc<RenderTarget>> {
        self.rendertarget.as_ref()
    }

    pub fn is_pass_open(&self) -> bool {
        self.pass_open
    }

    /// Begins a render pass on `rt`, ending the current one first.
    pub fn begin_render_pass(&mut self, rt: &Rc<RenderTarget>) -> BackendResult<()> {
        self.end_render_pass();
        rt.begin_pass(self.command_buffer, false)?;
        self.rendertarget = Some(Rc::clone(rt));
        self.pass_open = true;
        Ok(())
    }

    /// Ends the current render pass. No-op when none is active.
    pub fn end_render_pass(&mut self) {
        self.suspend_render_pass();
        self.rendertarget = None;
    }

    /// Closes the native pass but keeps the render target current, so that
    /// the next draw resumes it with its contents loaded.
    pub(crate) fn suspend_render_pass(&mut self) {
        if self.pass_open {
            if let Some(rt) = &self.rendertarget {
                rt.end_pass(self.command_buffer);
            }
            self.pass_open = false;
        }
    }

    /// Re-opens a suspended pass. Returns the active render target.
    pub(crate) fn resume_render_pass(&mut self) -> BackendResult<Rc<RenderTarget>> {
        let rt = self
            .rendertarget
            .clone()
            .ok_or_else(|| BackendError::invalid_usage("no render pass is active"))?;
        if !self.pass_open {
            rt.begin_pass(self.command_buffer, true)?;
            self.pass_open = true;
        }
        Ok(rt)
    }

    /// Command buffer usable for transfer work: the frame's own when no
    /// render pass is open, `None` otherwise.
    pub(crate) fn transfer_target(&self) -> Option<&Recording> {
        (!self.pass_open).then_some(self)
    }
}
