use ash::vk;
/// Possible errors
use thiserror::Error;

use crate::command::StreamState;
use crate::shader::ShaderStage;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GalError {
    #[error("Handle does not refer to a live resource")]
    InvalidHandle,

    #[error("Failed to compile {stage:?} stage of shader {name}: {message}")]
    ShaderCompilation {
        name: String,
        stage: ShaderStage,
        message: String,
    },

    #[error("Shader {0} is missing a required stage")]
    ShaderStageMissing(String),

    #[error("Pipeline creation failed")]
    PipelineCreation,

    #[error("Resource memory is not host visible")]
    InvalidMemoryLocation,

    #[error("Device lacks capability: {0}")]
    NoCapability(&'static str),

    #[error("Command stream is {found:?}, expected {expected:?}")]
    InvalidStreamState {
        expected: StreamState,
        found: StreamState,
    },

    #[error("shaderc encountered an error")]
    ShadercError,

    #[error(transparent)]
    VkError(#[from] vk::Result),
}
