use serde::Serialize;

pub type FileId = usize;

#[derive(Clone, Debug, Serialize)]
pub struct WorkflowFile {
    pub id: String,
    /// Size in bytes.
    pub size: u64,
}
