pub mod read_dataset;
pub mod registry;
pub mod run_code;
pub mod todo_write;

pub use read_dataset::ReadDatasetTool;
pub use registry::{validate_args, Tool, ToolContext, ToolOutput, ToolRegistry};
pub use run_code::RunCodeTool;
pub use todo_write::TodoWriteTool;
