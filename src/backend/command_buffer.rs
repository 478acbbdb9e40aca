// Command buffers
//
// A native command buffer plus an explicit state tag. Every operation checks
// the tag before touching the driver and reports misuse as a typed error.

use anyhow::{Context, Result};
use ash::vk;
use thiserror::Error;

use super::VulkanDevice;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandBufferState {
    /// Uninitialised or freed
    NotAllocated,
    /// Allocated, not recording
    Ready,
    Recording,
    /// Recording inside a render pass
    InRenderPass,
    /// Finished recording, ready to submit
    RecordingEnded,
    Submitted,
}

/// Operations that move a command buffer between states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOp {
    Allocate,
    BeginRecording,
    BeginRenderPass,
    EndRenderPass,
    EndRecording,
    Submit,
    Reset,
    Free,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("illegal command buffer transition: {op:?} while {state:?}")]
pub struct CommandBufferError {
    pub op: CommandOp,
    pub state: CommandBufferState,
}

impl CommandBufferState {
    /// The state reached by applying `op`, or an error if `op` is not legal here.
    pub fn apply(self, op: CommandOp) -> Result<Self, CommandBufferError> {
        use CommandBufferState::*;

        let next = match (self, op) {
            (NotAllocated, CommandOp::Allocate) => Ready,
            (Ready, CommandOp::BeginRecording) => Recording,
            (Recording, CommandOp::BeginRenderPass) => InRenderPass,
            (InRenderPass, CommandOp::EndRenderPass) => Recording,
            (Recording, CommandOp::EndRecording) => RecordingEnded,
            (RecordingEnded, CommandOp::Submit) => Submitted,
            // A finished-but-unsubmitted recording may be thrown away
            (Ready | RecordingEnded | Submitted, CommandOp::Reset) => Ready,
            (state, CommandOp::Free) if state != NotAllocated => NotAllocated,
            (state, op) => return Err(CommandBufferError { op, state }),
        };
        Ok(next)
    }
}

pub struct CommandBuffer {
    handle: vk::CommandBuffer,
    pool: vk::CommandPool,
    state: CommandBufferState,
}

impl CommandBuffer {
    pub fn allocate(device: &VulkanDevice, pool: vk::CommandPool, primary: bool) -> Result<Self> {
        let level = if primary {
            vk::CommandBufferLevel::PRIMARY
        } else {
            vk::CommandBufferLevel::SECONDARY
        };
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(pool)
            .level(level)
            .command_buffer_count(1);

        let buffers = unsafe { device.device.allocate_command_buffers(&alloc_info) }
            .context("Failed to allocate command buffer")?;
        let handle = buffers
            .first()
            .copied()
            .context("Driver returned no command buffer")?;

        Ok(Self {
            handle,
            pool,
            state: CommandBufferState::NotAllocated.apply(CommandOp::Allocate)?,
        })
    }

    pub fn handle(&self) -> vk::CommandBuffer {
        self.handle
    }

    pub fn free(&mut self, device: &VulkanDevice) -> Result<()> {
        let next = self.state.apply(CommandOp::Free)?;
        unsafe {
            device.device.free_command_buffers(self.pool, &[self.handle]);
        }
        self.handle = vk::CommandBuffer::null();
        self.state = next;
        Ok(())
    }

    /// Begin recording. The three hints are declared by the caller and map
    /// directly onto `vk::CommandBufferUsageFlags`.
    pub fn begin_recording(
        &mut self,
        device: &VulkanDevice,
        single_use: bool,
        render_pass_continue: bool,
        simultaneous_use: bool,
    ) -> Result<()> {
        let next = self.state.apply(CommandOp::BeginRecording)?;

        let begin_info = vk::CommandBufferBeginInfo::builder().flags(usage_flags(
            single_use,
            render_pass_continue,
            simultaneous_use,
        ));
        unsafe { device.device.begin_command_buffer(self.handle, &begin_info) }
            .context("Failed to begin recording command buffer")?;

        self.state = next;
        Ok(())
    }

    pub fn end_recording(&mut self, device: &VulkanDevice) -> Result<()> {
        let next = self.state.apply(CommandOp::EndRecording)?;
        unsafe { device.device.end_command_buffer(self.handle) }
            .context("Failed to end recording command buffer")?;
        self.state = next;
        Ok(())
    }

    /// Track entry into a render pass. Called by `RenderPass::begin`.
    pub fn enter_render_pass(&mut self) -> Result<(), CommandBufferError> {
        self.state = self.state.apply(CommandOp::BeginRenderPass)?;
        Ok(())
    }

    /// Track exit from a render pass. Called by `RenderPass::end`.
    pub fn leave_render_pass(&mut self) -> Result<(), CommandBufferError> {
        self.state = self.state.apply(CommandOp::EndRenderPass)?;
        Ok(())
    }

    pub fn mark_submitted(&mut self) -> Result<(), CommandBufferError> {
        self.state = self.state.apply(CommandOp::Submit)?;
        Ok(())
    }

    /// Reset for re-recording. The caller must know the GPU is done with it.
    pub fn reset(&mut self, device: &VulkanDevice) -> Result<()> {
        let next = self.state.apply(CommandOp::Reset)?;
        unsafe {
            device
                .device
                .reset_command_buffer(self.handle, vk::CommandBufferResetFlags::empty())
        }
        .context("Failed to reset command buffer")?;
        self.state = next;
        Ok(())
    }

    /// Allocate a primary buffer from the device pool and start a one-time recording.
    pub fn allocate_and_begin_single_use(device: &VulkanDevice) -> Result<Self> {
        let mut command_buffer = Self::allocate(device, device.command_pool, true)?;
        if let Err(e) = command_buffer.begin_recording(device, true, false, false) {
            command_buffer.free(device)?;
            return Err(e);
        }
        Ok(command_buffer)
    }

    /// Finish a single-use recording, submit it and block until `queue` is
    /// idle, then free the buffer. Setup-time transfers only.
    pub fn end_single_use(mut self, device: &VulkanDevice, queue: vk::Queue) -> Result<()> {
        let result = self.submit_and_wait(device, queue);
        self.free(device)?;
        result
    }

    fn submit_and_wait(&mut self, device: &VulkanDevice, queue: vk::Queue) -> Result<()> {
        self.end_recording(device)?;

        let command_buffers = [self.handle];
        let submit_info = vk::SubmitInfo::builder().command_buffers(&command_buffers);

        unsafe {
            device
                .device
                .queue_submit(queue, &[submit_info.build()], vk::Fence::null())
                .context("Failed to submit single use command buffer")?;
            self.mark_submitted()?;
            device
                .device
                .queue_wait_idle(queue)
                .context("Failed to wait for queue idle")?;
        }
        Ok(())
    }
}

fn usage_flags(
    single_use: bool,
    render_pass_continue: bool,
    simultaneous_use: bool,
) -> vk::CommandBufferUsageFlags {
    let mut flags = vk::CommandBufferUsageFlags::empty();
    if single_use {
        flags |= vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT;
    }
    if render_pass_continue {
        flags |= vk::CommandBufferUsageFlags::RENDER_PASS_CONTINUE;
    }
    if simultaneous_use {
        flags |= vk::CommandBufferUsageFlags::SIMULTANEOUS_USE;
    }
    flags
}

#[cfg(test)]
mod tests {
    use super::*;
    use CommandBufferState::*;

    const STATES: [CommandBufferState; 6] =
        [NotAllocated, Ready, Recording, InRenderPass, RecordingEnded, Submitted];

    #[test]
    fn full_frame_cycle_is_legal() {
        let ops = [
            (CommandOp::Allocate, Ready),
            (CommandOp::BeginRecording, Recording),
            (CommandOp::BeginRenderPass, InRenderPass),
            (CommandOp::EndRenderPass, Recording),
            (CommandOp::EndRecording, RecordingEnded),
            (CommandOp::Submit, Submitted),
            (CommandOp::Reset, Ready),
            (CommandOp::Free, NotAllocated),
        ];

        let mut state = NotAllocated;
        for (op, expected) in ops {
            state = state.apply(op).unwrap();
            assert_eq!(state, expected, "after {:?}", op);
        }
    }

    #[test]
    fn begin_recording_only_from_ready() {
        for state in STATES {
            let result = state.apply(CommandOp::BeginRecording);
            if state == Ready {
                assert_eq!(result, Ok(Recording));
            } else {
                assert_eq!(
                    result,
                    Err(CommandBufferError {
                        op: CommandOp::BeginRecording,
                        state
                    })
                );
            }
        }
    }

    #[test]
    fn end_recording_requires_render_pass_to_be_closed() {
        for state in STATES {
            let result = state.apply(CommandOp::EndRecording);
            if state == Recording {
                assert_eq!(result, Ok(RecordingEnded));
            } else {
                assert!(result.is_err(), "EndRecording accepted from {:?}", state);
            }
        }

        let closed = InRenderPass.apply(CommandOp::EndRenderPass).unwrap();
        assert_eq!(closed.apply(CommandOp::EndRecording), Ok(RecordingEnded));
    }

    #[test]
    fn render_pass_cannot_nest_or_start_outside_recording() {
        assert!(InRenderPass.apply(CommandOp::BeginRenderPass).is_err());
        assert!(Ready.apply(CommandOp::BeginRenderPass).is_err());
        assert!(Recording.apply(CommandOp::EndRenderPass).is_err());
    }

    #[test]
    fn submit_only_after_recording_ended() {
        for state in STATES {
            let legal = state == RecordingEnded;
            assert_eq!(state.apply(CommandOp::Submit).is_ok(), legal, "{:?}", state);
        }
    }

    #[test]
    fn reset_is_rejected_while_recording() {
        assert!(Recording.apply(CommandOp::Reset).is_err());
        assert!(InRenderPass.apply(CommandOp::Reset).is_err());
        assert!(NotAllocated.apply(CommandOp::Reset).is_err());
        assert_eq!(Submitted.apply(CommandOp::Reset), Ok(Ready));
    }

    #[test]
    fn free_returns_to_not_allocated_once() {
        for state in STATES {
            let result = state.apply(CommandOp::Free);
            if state == NotAllocated {
                assert!(result.is_err());
            } else {
                assert_eq!(result, Ok(NotAllocated));
            }
        }
        assert!(Ready.apply(CommandOp::Allocate).is_err());
    }

    #[test]
    fn usage_hints_map_independently() {
        assert!(usage_flags(false, false, false).is_empty());
        assert_eq!(
            usage_flags(true, false, false),
            vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT
        );
        assert_eq!(
            usage_flags(false, true, true),
            vk::CommandBufferUsageFlags::RENDER_PASS_CONTINUE
                | vk::CommandBufferUsageFlags::SIMULTANEOUS_USE
        );
    }
}
