//! Vulkan synchronization primitives for GPU/CPU coordination
//!
//! Semaphores order GPU work against GPU work (acquire -> render -> present).
//! Fences let the CPU block until a frame slot's submission has retired.
//!
//! A [`Fence`] tracks its own signaled flag in a [`FenceState`], so waiting on
//! a fence that is already known to be signaled returns immediately without a
//! driver call, and resetting a fence that is not signaled is skipped.

use ash::{vk, Device};

use super::context::{VulkanError, VulkanResult};

/// Semaphore wrapper with RAII cleanup
pub struct Semaphore {
    device: Device,
    semaphore: vk::Semaphore,
}

impl Semaphore {
    /// Create a binary semaphore
    pub fn new(device: &Device) -> VulkanResult<Self> {
        let create_info = vk::SemaphoreCreateInfo::builder();
        let semaphore = unsafe {
            device.create_semaphore(&create_info, None)
                .map_err(VulkanError::Api)?
        };

        Ok(Self {
            device: device.clone(),
            semaphore,
        })
    }

    /// Get semaphore handle
    pub fn handle(&self) -> vk::Semaphore {
        self.semaphore
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_semaphore(self.semaphore, None);
        }
    }
}

/// How a fence wait ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceWaitOutcome {
    /// The fence is signaled
    Signaled,
    /// The timeout elapsed first
    Timeout,
    /// The device was lost while waiting
    DeviceLost,
    /// Host allocation failed
    OutOfHostMemory,
    /// Device allocation failed
    OutOfDeviceMemory,
    /// Any other result code
    Unknown(vk::Result),
}

impl FenceWaitOutcome {
    /// Classify the driver's answer to `vkWaitForFences`
    pub fn classify(result: Result<(), vk::Result>) -> Self {
        match result {
            Ok(()) => Self::Signaled,
            Err(vk::Result::TIMEOUT) => Self::Timeout,
            Err(vk::Result::ERROR_DEVICE_LOST) => Self::DeviceLost,
            Err(vk::Result::ERROR_OUT_OF_HOST_MEMORY) => Self::OutOfHostMemory,
            Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY) => Self::OutOfDeviceMemory,
            Err(other) => Self::Unknown(other),
        }
    }

    /// Whether the fence may now be treated as signaled
    pub fn is_signaled(self) -> bool {
        self == Self::Signaled
    }
}

/// CPU-side view of a fence's signal state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FenceState {
    signaled: bool,
}

impl FenceState {
    /// Initial state, matching the create flag
    pub fn new(signaled: bool) -> Self {
        Self { signaled }
    }

    /// Last known signal state
    pub fn is_signaled(&self) -> bool {
        self.signaled
    }

    /// A wait only reaches the driver when the fence is not known to be signaled
    pub fn needs_wait(&self) -> bool {
        !self.signaled
    }

    /// Fold a wait outcome into the state, logging failures
    pub fn record_wait(&mut self, outcome: FenceWaitOutcome) -> bool {
        match outcome {
            FenceWaitOutcome::Signaled => {
                self.signaled = true;
                true
            }
            FenceWaitOutcome::Timeout => {
                log::warn!("Fence wait timed out");
                false
            }
            FenceWaitOutcome::DeviceLost => {
                log::error!("Fence wait failed: device lost");
                false
            }
            FenceWaitOutcome::OutOfHostMemory => {
                log::error!("Fence wait failed: out of host memory");
                false
            }
            FenceWaitOutcome::OutOfDeviceMemory => {
                log::error!("Fence wait failed: out of device memory");
                false
            }
            FenceWaitOutcome::Unknown(result) => {
                log::error!("Fence wait failed: unknown error {:?}", result);
                false
            }
        }
    }

    /// Resetting an unsignaled fence is skipped entirely
    pub fn needs_reset(&self) -> bool {
        self.signaled
    }

    /// Mark the fence unsignaled after a driver reset
    pub fn record_reset(&mut self) {
        self.signaled = false;
    }
}

/// Fence wrapper with RAII cleanup
pub struct Fence {
    device: Device,
    fence: vk::Fence,
    state: FenceState,
}

impl Fence {
    /// Create a fence, optionally already signaled
    pub fn new(device: &Device, signaled: bool) -> VulkanResult<Self> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };

        let create_info = vk::FenceCreateInfo::builder().flags(flags);
        let fence = unsafe {
            device.create_fence(&create_info, None)
                .map_err(VulkanError::Api)?
        };

        Ok(Self {
            device: device.clone(),
            fence,
            state: FenceState::new(signaled),
        })
    }

    /// Wait for the fence, returning `true` once it is signaled
    pub fn wait(&mut self, timeout_ns: u64) -> bool {
        self.wait_outcome(timeout_ns).is_signaled()
    }

    /// Wait for the fence and report exactly how the wait ended
    pub fn wait_outcome(&mut self, timeout_ns: u64) -> FenceWaitOutcome {
        if !self.state.needs_wait() {
            return FenceWaitOutcome::Signaled;
        }

        let result = unsafe { self.device.wait_for_fences(&[self.fence], true, timeout_ns) };
        let outcome = FenceWaitOutcome::classify(result);
        self.state.record_wait(outcome);
        outcome
    }

    /// Reset the fence to unsignaled; no-op when it is not signaled
    pub fn reset(&mut self) -> VulkanResult<()> {
        if self.state.needs_reset() {
            unsafe {
                self.device.reset_fences(&[self.fence])
                    .map_err(VulkanError::from_result)?;
            }
            self.state.record_reset();
        }
        Ok(())
    }

    /// Last known signal state
    pub fn is_signaled(&self) -> bool {
        self.state.is_signaled()
    }

    /// Get fence handle
    pub fn handle(&self) -> vk::Fence {
        self.fence
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_fence(self.fence, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signaled_fence_skips_driver_wait() {
        let state = FenceState::new(true);
        assert!(!state.needs_wait());
        assert!(state.is_signaled());
    }

    #[test]
    fn test_unsignaled_fence_reset_is_idempotent() {
        let mut state = FenceState::new(false);
        assert!(!state.needs_reset());
        let before = state;
        // nothing to do, nothing changes
        if state.needs_reset() {
            state.record_reset();
        }
        assert_eq!(state, before);
    }

    #[test]
    fn test_wait_then_reset_cycle() {
        let mut state = FenceState::new(false);
        assert!(state.needs_wait());
        assert!(state.record_wait(FenceWaitOutcome::Signaled));
        assert!(state.is_signaled());
        assert!(state.needs_reset());
        state.record_reset();
        assert!(!state.is_signaled());
    }

    #[test]
    fn test_failed_waits_leave_fence_unsignaled() {
        for outcome in [
            FenceWaitOutcome::Timeout,
            FenceWaitOutcome::DeviceLost,
            FenceWaitOutcome::OutOfHostMemory,
            FenceWaitOutcome::OutOfDeviceMemory,
            FenceWaitOutcome::Unknown(vk::Result::ERROR_UNKNOWN),
        ] {
            let mut state = FenceState::new(false);
            assert!(!state.record_wait(outcome));
            assert!(!state.is_signaled());
        }
    }

    #[test]
    fn test_classify_wait_results() {
        assert_eq!(FenceWaitOutcome::classify(Ok(())), FenceWaitOutcome::Signaled);
        assert_eq!(FenceWaitOutcome::classify(Err(vk::Result::TIMEOUT)), FenceWaitOutcome::Timeout);
        assert_eq!(
            FenceWaitOutcome::classify(Err(vk::Result::ERROR_DEVICE_LOST)),
            FenceWaitOutcome::DeviceLost
        );
        assert_eq!(
            FenceWaitOutcome::classify(Err(vk::Result::ERROR_INITIALIZATION_FAILED)),
            FenceWaitOutcome::Unknown(vk::Result::ERROR_INITIALIZATION_FAILED)
        );
    }
}
