use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VmSentryError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Validation error for {field}: {message}")]
    Validation { field: String, message: String },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("TOML error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("Instance not found: {name}")]
    InstanceNotFound { name: String },

    #[error("Instance '{instance}' is missing required file {file}")]
    MissingFile { instance: String, file: String },

    #[error("Image '{image}' not found in the image pool")]
    ImageNotFound { image: String },

    #[error("VM operation '{operation}' failed: {details}")]
    VmOperationFailed { operation: String, details: String },

    #[error("Command '{command}' on {node} exited with {exit_code}: {stderr}")]
    RemoteCommand {
        node: String,
        command: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("Operation '{operation}' timed out after {duration:?}")]
    Timeout { operation: String, duration: Duration },

    #[error("Invalid operation '{operation}': {reason}")]
    InvalidOperation { operation: String, reason: String },

    #[error("Scenario step {step} failed: {message}")]
    ScenarioFailed { step: usize, message: String },

    #[error("Probe error: {0}")]
    ProbeError(String),

    #[error("Internal error: {message}")]
    Internal { message: String },
}

pub type VmSentryResult<T> = Result<T, VmSentryError>;

impl VmSentryError {
    /// Create a validation error for a named config field
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        VmSentryError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn vm_operation(operation: impl Into<String>, details: impl Into<String>) -> Self {
        VmSentryError::VmOperationFailed {
            operation: operation.into(),
            details: details.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        VmSentryError::Internal {
            message: message.into(),
        }
    }

    pub fn scenario(step: usize, message: impl Into<String>) -> Self {
        VmSentryError::ScenarioFailed {
            step,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages_carry_context() {
        let err = VmSentryError::vm_operation("virsh undefine", "domain not found");
        assert_eq!(
            err.to_string(),
            "VM operation 'virsh undefine' failed: domain not found"
        );

        let err = VmSentryError::RemoteCommand {
            node: "node1".to_string(),
            command: "virsh start vm1".to_string(),
            exit_code: 1,
            stderr: "error: failed to get domain".to_string(),
        };
        assert!(err.to_string().contains("node1"));
        assert!(err.to_string().contains("exited with 1"));
    }

    #[test]
    fn test_io_error_conversion() {
        fn read() -> VmSentryResult<()> {
            Err(std::io::Error::new(std::io::ErrorKind::NotFound, "gone"))?;
            Ok(())
        }
        assert!(matches!(read(), Err(VmSentryError::IoError(_))));
    }
}
