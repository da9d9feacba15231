// Backend error taxonomy
//
// Every native failure is translated here so callers only ever see
// BackendError. Memory and ExternalApi are fatal; the rest describe a
// rejected request that leaves the context usable.

use ash::vk;
use thiserror::Error;

pub type BackendResult<T> = Result<T, BackendError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("Out of memory: {0}")]
    Memory(String),

    #[error("Graphics API call failed: {0}")]
    ExternalApi(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Unsupported feature: {0}")]
    UnsupportedFeature(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid usage: {0}")]
    InvalidUsage(String),
}

impl BackendError {
    /// Fatal errors leave the device in an unknown state; the frame loop
    /// should stop instead of continuing on a degraded path.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Memory(_) | Self::ExternalApi(_))
    }

    pub fn invalid_usage(msg: impl Into<String>) -> Self {
        Self::InvalidUsage(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }
}

impl From<vk::Result> for BackendError {
    fn from(result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_OUT_OF_HOST_MEMORY
            | vk::Result::ERROR_OUT_OF_DEVICE_MEMORY
            | vk::Result::ERROR_OUT_OF_POOL_MEMORY
            | vk::Result::ERROR_FRAGMENTED_POOL => Self::Memory(format!("{:?}", result)),
            vk::Result::ERROR_FORMAT_NOT_SUPPORTED => {
                Self::UnsupportedFormat(format!("{:?}", result))
            }
            vk::Result::ERROR_FEATURE_NOT_PRESENT
            | vk::Result::ERROR_EXTENSION_NOT_PRESENT
            | vk::Result::ERROR_LAYER_NOT_PRESENT
            | vk::Result::ERROR_INCOMPATIBLE_DRIVER => {
                Self::UnsupportedFeature(format!("{:?}", result))
            }
            other => Self::ExternalApi(format!("{:?}", other)),
        }
    }
}

impl From<gpu_allocator::AllocationError> for BackendError {
    fn from(err: gpu_allocator::AllocationError) -> Self {
        Self::Memory(err.to_string())
    }
}

impl From<ash::LoadingError> for BackendError {
    fn from(err: ash::LoadingError) -> Self {
        Self::ExternalApi(format!("Failed to load Vulkan library: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_errors_are_classified() {
        let err: BackendError = vk::Result::ERROR_OUT_OF_DEVICE_MEMORY.into();
        assert!(matches!(err, BackendError::Memory(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_unsupported_errors_are_not_fatal() {
        let err: BackendError = vk::Result::ERROR_FORMAT_NOT_SUPPORTED.into();
        assert!(matches!(err, BackendError::UnsupportedFormat(_)));
        assert!(!err.is_fatal());

        let err: BackendError = vk::Result::ERROR_EXTENSION_NOT_PRESENT.into();
        assert!(matches!(err, BackendError::UnsupportedFeature(_)));
    }

    #[test]
    fn test_unclassified_results_are_external() {
        let err: BackendError = vk::Result::ERROR_DEVICE_LOST.into();
        assert_eq!(err, BackendError::ExternalApi("ERROR_DEVICE_LOST".to_string()));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_display() {
        let err = BackendError::invalid_usage("render target is not readable");
        assert_eq!(err.to_string(), "Invalid usage: render target is not readable");
    }
}
