use async_trait::async_trait;

use crate::error::Result;
use crate::function::FunctionSpec;

/// Code artifacts for one function. Both fields are opaque bytes; the
/// compiled binary wins when present.
#[derive(Debug, Clone, Default)]
pub struct FunctionCode {
    pub source_code: Vec<u8>,
    pub compiled_binary: Vec<u8>,
}

impl FunctionCode {
    /// The bytes that go onto the code drive.
    pub fn payload(&self) -> &[u8] {
        if self.compiled_binary.is_empty() {
            &self.source_code
        } else {
            &self.compiled_binary
        }
    }
}

/// Read side of the metadata store, an external collaborator. The data plane
/// only consumes function definitions and code; writes stay with the control
/// plane.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn list_functions(&self) -> Result<Vec<FunctionSpec>>;

    async fn get_function_by_name(&self, name: &str) -> Result<Option<FunctionSpec>>;

    async fn get_function_code(&self, fn_id: &str) -> Result<FunctionCode>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_prefers_compiled_binary() {
        let code = FunctionCode {
            source_code: b"print(1)".to_vec(),
            compiled_binary: b"\x7fELF".to_vec(),
        };
        assert_eq!(code.payload(), b"\x7fELF");
    }

    #[test]
    fn payload_falls_back_to_source() {
        let code = FunctionCode {
            source_code: b"print(1)".to_vec(),
            compiled_binary: Vec::new(),
        };
        assert_eq!(code.payload(), b"print(1)");
    }
}
