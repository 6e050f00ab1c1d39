//! Command buffer management
//!
//! Every [`CommandBuffer`] carries a [`CommandBufferState`]; each operation
//! checks the current state and moves it along:
//!
//! ```text
//! NotAllocated -> Ready -> Recording -> InRenderPass -> RecordingEnded -> Submitted -> Ready
//! ```
//!
//! `reset` returns any state to `Ready`.

use ash::{vk, Device};

use super::context::{VulkanError, VulkanResult};

/// Lifecycle state of a command buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandBufferState {
    /// Freed or never allocated
    NotAllocated,
    /// Allocated and not recording
    Ready,
    /// Between `begin` and `end`
    Recording,
    /// Inside a render pass
    InRenderPass,
    /// `end` was called (or the render pass closed)
    RecordingEnded,
    /// Handed to a queue
    Submitted,
}

impl CommandBufferState {
    fn transition(self, allowed: &[Self], to: Self, operation: &str) -> VulkanResult<Self> {
        if allowed.contains(&self) {
            Ok(to)
        } else {
            Err(VulkanError::InvalidOperation {
                reason: format!("Cannot {operation} a command buffer in state {self:?}"),
            })
        }
    }

    /// `Ready -> Recording`
    pub fn begin(self) -> VulkanResult<Self> {
        self.transition(&[Self::Ready], Self::Recording, "begin")
    }

    /// `Recording -> InRenderPass`
    pub fn begin_render_pass(self) -> VulkanResult<Self> {
        self.transition(&[Self::Recording], Self::InRenderPass, "begin a render pass on")
    }

    /// `InRenderPass -> RecordingEnded`
    pub fn end_render_pass(self) -> VulkanResult<Self> {
        self.transition(&[Self::InRenderPass], Self::RecordingEnded, "end a render pass on")
    }

    /// `Recording | RecordingEnded -> RecordingEnded`
    pub fn end(self) -> VulkanResult<Self> {
        self.transition(&[Self::Recording, Self::RecordingEnded], Self::RecordingEnded, "end")
    }

    /// `RecordingEnded -> Submitted`
    pub fn submit(self) -> VulkanResult<Self> {
        self.transition(&[Self::RecordingEnded], Self::Submitted, "submit")
    }

    /// Any allocated state -> `Ready`
    pub fn reset(self) -> VulkanResult<Self> {
        if self == Self::NotAllocated {
            Err(VulkanError::InvalidOperation {
                reason: "Cannot reset a command buffer that is not allocated".to_string(),
            })
        } else {
            Ok(Self::Ready)
        }
    }
}

/// Usage flags for `begin`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BeginFlags {
    /// Submitted once, then reset or freed
    pub single_use: bool,
    /// Secondary buffer entirely inside a render pass
    pub renderpass_continue: bool,
    /// May be pending on several queues at once
    pub simultaneous_use: bool,
}

impl BeginFlags {
    /// Flags for a one-shot upload buffer
    pub const SINGLE_USE: Self = Self {
        single_use: true,
        renderpass_continue: false,
        simultaneous_use: false,
    };

    fn to_vk(self) -> vk::CommandBufferUsageFlags {
        let mut flags = vk::CommandBufferUsageFlags::empty();
        if self.single_use {
            flags |= vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT;
        }
        if self.renderpass_continue {
            flags |= vk::CommandBufferUsageFlags::RENDER_PASS_CONTINUE;
        }
        if self.simultaneous_use {
            flags |= vk::CommandBufferUsageFlags::SIMULTANEOUS_USE;
        }
        flags
    }
}

/// Command buffer with tracked state
pub struct CommandBuffer {
    device: Device,
    command_buffer: vk::CommandBuffer,
    state: CommandBufferState,
}

impl CommandBuffer {
    /// Allocate one buffer from `pool`
    pub fn allocate(device: &Device, pool: vk::CommandPool, primary: bool) -> VulkanResult<Self> {
        let level = if primary {
            vk::CommandBufferLevel::PRIMARY
        } else {
            vk::CommandBufferLevel::SECONDARY
        };
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(pool)
            .level(level)
            .command_buffer_count(1);

        let command_buffer = unsafe {
            device.allocate_command_buffers(&alloc_info)
                .map_err(VulkanError::Api)?
        }
        .into_iter()
        .next()
        .ok_or_else(|| VulkanError::InvalidOperation {
            reason: "Driver returned no command buffer".to_string(),
        })?;

        Ok(Self {
            device: device.clone(),
            command_buffer,
            state: CommandBufferState::Ready,
        })
    }

    /// Return the buffer to its pool
    pub fn free(&mut self, pool: vk::CommandPool) {
        if self.state != CommandBufferState::NotAllocated {
            unsafe {
                self.device.free_command_buffers(pool, &[self.command_buffer]);
            }
            self.command_buffer = vk::CommandBuffer::null();
            self.state = CommandBufferState::NotAllocated;
        }
    }

    /// Start recording
    pub fn begin(&mut self, flags: BeginFlags) -> VulkanResult<()> {
        let next = self.state.begin()?;
        let begin_info = vk::CommandBufferBeginInfo::builder().flags(flags.to_vk());
        unsafe {
            self.device.begin_command_buffer(self.command_buffer, &begin_info)
                .map_err(VulkanError::Api)?;
        }
        self.state = next;
        Ok(())
    }

    /// Finish recording
    pub fn end(&mut self) -> VulkanResult<()> {
        let next = self.state.end()?;
        unsafe {
            self.device.end_command_buffer(self.command_buffer)
                .map_err(VulkanError::Api)?;
        }
        self.state = next;
        Ok(())
    }

    /// Record that the buffer was handed to a queue
    pub fn mark_submitted(&mut self) -> VulkanResult<()> {
        self.state = self.state.submit()?;
        Ok(())
    }

    /// Back to `Ready` (the pool resets the buffer implicitly on the next `begin`)
    pub fn reset(&mut self) -> VulkanResult<()> {
        self.state = self.state.reset()?;
        Ok(())
    }

    pub(crate) fn enter_render_pass(&mut self) -> VulkanResult<()> {
        self.state = self.state.begin_render_pass()?;
        Ok(())
    }

    pub(crate) fn leave_render_pass(&mut self) -> VulkanResult<()> {
        self.state = self.state.end_render_pass()?;
        Ok(())
    }

    /// Allocate a primary buffer and begin it for a single submission
    pub fn allocate_and_begin_single_use(device: &Device, pool: vk::CommandPool) -> VulkanResult<Self> {
        let mut buffer = Self::allocate(device, pool, true)?;
        if let Err(e) = buffer.begin(BeginFlags::SINGLE_USE) {
            buffer.free(pool);
            return Err(e);
        }
        Ok(buffer)
    }

    /// End, submit to `queue`, wait for completion, then free.
    ///
    /// With a fence the wait is on that fence, otherwise on the queue going idle.
    /// The buffer is freed whether or not the submission succeeded.
    pub fn end_single_use(mut self, pool: vk::CommandPool, queue: vk::Queue, fence: Option<vk::Fence>) -> VulkanResult<()> {
        let result = self.submit_and_wait(queue, fence);
        self.free(pool);
        result
    }

    fn submit_and_wait(&mut self, queue: vk::Queue, fence: Option<vk::Fence>) -> VulkanResult<()> {
        self.end()?;

        let command_buffers = [self.command_buffer];
        let submit_info = vk::SubmitInfo::builder().command_buffers(&command_buffers);
        unsafe {
            self.device.queue_submit(queue, &[submit_info.build()], fence.unwrap_or_default())
                .map_err(VulkanError::from_result)?;
        }
        self.mark_submitted()?;

        let waited = unsafe {
            match fence {
                Some(fence) => self.device.wait_for_fences(&[fence], true, u64::MAX),
                None => self.device.queue_wait_idle(queue),
            }
        };
        waited.map_err(VulkanError::from_result)?;
        self.reset()
    }

    /// Get command buffer handle
    pub fn handle(&self) -> vk::CommandBuffer {
        self.command_buffer
    }

    /// Current lifecycle state
    pub fn state(&self) -> CommandBufferState {
        self.state
    }

    /// Set the dynamic viewport
    pub fn set_viewport(&self, viewport: vk::Viewport) {
        unsafe {
            self.device.cmd_set_viewport(self.command_buffer, 0, &[viewport]);
        }
    }

    /// Set the dynamic scissor
    pub fn set_scissor(&self, scissor: vk::Rect2D) {
        unsafe {
            self.device.cmd_set_scissor(self.command_buffer, 0, &[scissor]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_frame_cycle() {
        let state = CommandBufferState::Ready;
        let state = state.begin().unwrap();
        assert_eq!(state, CommandBufferState::Recording);
        let state = state.begin_render_pass().unwrap();
        assert_eq!(state, CommandBufferState::InRenderPass);
        let state = state.end_render_pass().unwrap();
        assert_eq!(state, CommandBufferState::RecordingEnded);
        let state = state.end().unwrap();
        assert_eq!(state, CommandBufferState::RecordingEnded);
        let state = state.submit().unwrap();
        assert_eq!(state, CommandBufferState::Submitted);
        assert_eq!(state.reset().unwrap(), CommandBufferState::Ready);
    }

    #[test]
    fn test_upload_cycle_without_render_pass() {
        let state = CommandBufferState::Ready.begin().unwrap().end().unwrap();
        assert_eq!(state.submit().unwrap(), CommandBufferState::Submitted);
    }

    #[test]
    fn test_invalid_transitions_are_rejected() {
        assert!(CommandBufferState::Recording.begin().is_err());
        assert!(CommandBufferState::Ready.begin_render_pass().is_err());
        assert!(CommandBufferState::Recording.end_render_pass().is_err());
        assert!(CommandBufferState::Ready.end().is_err());
        assert!(CommandBufferState::Recording.submit().is_err());
        assert!(CommandBufferState::NotAllocated.reset().is_err());
    }

    #[test]
    fn test_reset_from_any_allocated_state() {
        for state in [
            CommandBufferState::Ready,
            CommandBufferState::Recording,
            CommandBufferState::InRenderPass,
            CommandBufferState::RecordingEnded,
            CommandBufferState::Submitted,
        ] {
            assert_eq!(state.reset().unwrap(), CommandBufferState::Ready);
        }
    }

    #[test]
    fn test_begin_flags_map_to_usage_bits() {
        assert_eq!(BeginFlags::default().to_vk(), vk::CommandBufferUsageFlags::empty());
        assert_eq!(BeginFlags::SINGLE_USE.to_vk(), vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        let all = BeginFlags {
            single_use: true,
            renderpass_continue: true,
            simultaneous_use: true,
        };
        assert_eq!(
            all.to_vk(),
            vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT
                | vk::CommandBufferUsageFlags::RENDER_PASS_CONTINUE
                | vk::CommandBufferUsageFlags::SIMULTANEOUS_USE
        );
    }
}
