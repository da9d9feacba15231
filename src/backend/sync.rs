// Frame slots - per in-flight frame synchronization
//
// Each slot owns a command buffer, a fence and the two semaphores linking
// acquire -> submit -> present. A slot cycles IDLE -> RECORDING -> SUBMITTED
// and only returns to IDLE once its fence has signalled, so a slot is never
// recorded while the GPU may still be executing its previous submission.

use super::error::{BackendError, BackendResult};
use ash::vk;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Idle,
    Recording,
    Submitted,
}

impl SlotState {
    pub fn begin_recording(self) -> BackendResult<Self> {
        match self {
            Self::Idle => Ok(Self::Recording),
            other => Err(BackendError::invalid_usage(format!(
                "cannot record a frame slot in state {:?}",
                other
            ))),
        }
    }

    pub fn submit(self) -> BackendResult<Self> {
        match self {
            Self::Recording => Ok(Self::Submitted),
            other => Err(BackendError::invalid_usage(format!(
                "cannot submit a frame slot in state {:?}",
                other
            ))),
        }
    }

    /// A failed submission leaves the command buffer ended but unsubmitted.
    pub fn abandon(self) -> Self {
        match self {
            Self::Recording => Self::Idle,
            other => other,
        }
    }

    /// Only a submitted slot has a fence that will signal.
    pub fn awaits_fence(self) -> bool {
        self == Self::Submitted
    }

    /// The slot's fence has signalled.
    pub fn complete(self) -> Self {
        match self {
            Self::Submitted | Self::Idle => Self::Idle,
            Self::Recording => Self::Recording,
        }
    }
}

pub struct FrameSlot {
    pub command_buffer: vk::CommandBuffer,
    pub in_flight_fence: vk::Fence,
    pub image_available: vk::Semaphore,
    pub render_finished: vk::Semaphore,
    pub state: SlotState,
    // Submission lists, cleared at the start of every frame
    pub wait_semaphores: Vec<vk::Semaphore>,
    pub wait_stages: Vec<vk::PipelineStageFlags>,
    pub signal_semaphores: Vec<vk::Semaphore>,
}

impl FrameSlot {
    pub fn new(device: &ash::Device, command_buffer: vk::CommandBuffer) -> BackendResult<Self> {
        let semaphore_info = vk::SemaphoreCreateInfo::builder();
        // Start signaled so the first wait on this slot returns immediately
        let fence_info = vk::FenceCreateInfo::builder().flags(vk::FenceCreateFlags::SIGNALED);

        unsafe {
            let image_available = device.create_semaphore(&semaphore_info, None)?;
            let render_finished = match device.create_semaphore(&semaphore_info, None) {
                Ok(s) => s,
                Err(e) => {
                    device.destroy_semaphore(image_available, None);
                    return Err(e.into());
                }
            };
            let in_flight_fence = match device.create_fence(&fence_info, None) {
                Ok(f) => f,
                Err(e) => {
                    device.destroy_semaphore(image_available, None);
                    device.destroy_semaphore(render_finished, None);
                    return Err(e.into());
                }
            };

            Ok(Self {
                command_buffer,
                in_flight_fence,
                image_available,
                render_finished,
                state: SlotState::Idle,
                wait_semaphores: Vec::with_capacity(2),
                wait_stages: Vec::with_capacity(2),
                signal_semaphores: Vec::with_capacity(2),
            })
        }
    }

    /// Blocks until the previous submission of this slot has finished.
    pub fn wait(&mut self, device: &ash::Device, timeout: u64) -> BackendResult<()> {
        if !self.state.awaits_fence() {
            return Ok(());
        }
        match unsafe { device.wait_for_fences(&[self.in_flight_fence], true, timeout) } {
            Ok(()) => {
                self.state = self.state.complete();
                Ok(())
            }
            Err(vk::Result::TIMEOUT) => Err(BackendError::ExternalApi(
                "timed out waiting for frame fence".into(),
            )),
            Err(e) => Err(e.into()),
        }
    }

    pub fn clear_lists(&mut self) {
        self.wait_semaphores.clear();
        self.wait_stages.clear();
        self.signal_semaphores.clear();
    }

    pub fn begin(&mut self, device: &ash::Device) -> BackendResult<()> {
        let next = self.state.begin_recording()?;
        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { device.begin_command_buffer(self.command_buffer, &begin_info)? };
        self.state = next;
        Ok(())
    }

    /// Ends the command buffer and submits it on the slot's fence. Pending
    /// wait semaphores are consumed; signal semaphores are only attached
    /// when `signal` is set, so a mid-frame submission leaves them for the
    /// final one.
    pub fn submit(
        &mut self,
        device: &ash::Device,
        queue: vk::Queue,
        signal: bool,
    ) -> BackendResult<()> {
        let next = self.state.submit()?;
        let command_buffers = [self.command_buffer];
        let signal_semaphores: &[vk::Semaphore] = if signal {
            &self.signal_semaphores
        } else {
            &[]
        };
        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&self.wait_semaphores)
            .wait_dst_stage_mask(&self.wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(signal_semaphores)
            .build();

        let submitted = unsafe {
            device
                .end_command_buffer(self.command_buffer)
                .and_then(|()| device.reset_fences(&[self.in_flight_fence]))
                .and_then(|()| device.queue_submit(queue, &[submit_info], self.in_flight_fence))
        };
        if let Err(e) = submitted {
            // Nothing will signal the fence, so don't wait on it
            self.state = self.state.abandon();
            return Err(e.into());
        }
        self.state = next;
        self.wait_semaphores.clear();
        self.wait_stages.clear();
        Ok(())
    }

    pub fn destroy(&self, device: &ash::Device) {
        unsafe {
            device.destroy_semaphore(self.image_available, None);
            device.destroy_semaphore(self.render_finished, None);
            device.destroy_fence(self.in_flight_fence, None);
        }
    }
}

pub fn next_frame_index(index: usize, count: usize) -> usize {
    (index + 1) % count.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_lifecycle() {
        let state = SlotState::Idle;
        let state = state.begin_recording().unwrap();
        assert_eq!(state, SlotState::Recording);
        let state = state.submit().unwrap();
        assert_eq!(state, SlotState::Submitted);
        assert_eq!(state.complete(), SlotState::Idle);
    }

    #[test]
    fn test_submitted_slot_cannot_be_recorded() {
        let err = SlotState::Submitted.begin_recording().unwrap_err();
        assert!(matches!(err, BackendError::InvalidUsage(_)));
        assert!(SlotState::Idle.submit().is_err());
    }

    #[test]
    fn test_fence_does_not_interrupt_recording() {
        assert_eq!(SlotState::Recording.complete(), SlotState::Recording);
    }

    #[test]
    fn test_failed_submit_does_not_wait_on_the_fence() {
        let state = SlotState::Idle.begin_recording().unwrap();
        assert!(!state.awaits_fence());
        let state = state.abandon();
        assert_eq!(state, SlotState::Idle);
        assert!(!state.awaits_fence());
        // The slot can be recorded again straight away
        assert_eq!(state.begin_recording().unwrap(), SlotState::Recording);

        assert!(SlotState::Submitted.awaits_fence());
        assert_eq!(SlotState::Submitted.abandon(), SlotState::Submitted);
    }

    #[test]
    fn test_ring_never_overlaps_a_slot() {
        // Simulate frames where the GPU finishes a slot only when the host
        // waits on it, as begin_frame does.
        let count = 3;
        let mut slots = vec![SlotState::Idle; count];
        let mut index = 0;
        for _ in 0..20 {
            slots[index] = slots[index].complete();
            slots[index] = slots[index].begin_recording().unwrap();
            slots[index] = slots[index].submit().unwrap();
            index = next_frame_index(index, count);
        }
        assert!(slots.iter().all(|s| *s == SlotState::Submitted));
        // Skipping the fence wait is rejected
        assert!(slots[index].begin_recording().is_err());
    }

    #[test]
    fn test_next_frame_index_wraps() {
        assert_eq!(next_frame_index(0, 2), 1);
        assert_eq!(next_frame_index(1, 2), 0);
        assert_eq!(next_frame_index(0, 1), 0);
    }
}
