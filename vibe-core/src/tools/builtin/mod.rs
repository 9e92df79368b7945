//! The four built-in file tools every program gets for free (§4.D
//! "Built-in tools"): `readFile`, `writeFile`, `glob`, `editFile`. All four
//! are confined to the program's working folder via [`super::sandbox`].

mod edit_file;
mod glob_tool;
mod read_file;
mod write_file;

use std::path::PathBuf;
use std::sync::Arc;

use super::ToolRegistry;

pub use edit_file::EditFileTool;
pub use glob_tool::GlobTool;
pub use read_file::ReadFileTool;
pub use write_file::WriteFileTool;

/// Registers all four built-ins against `working_folder`.
pub async fn register_builtins(registry: &ToolRegistry, working_folder: Arc<PathBuf>) {
    registry
        .register_native(Arc::new(ReadFileTool::new(working_folder.clone())))
        .await;
    registry
        .register_native(Arc::new(WriteFileTool::new(working_folder.clone())))
        .await;
    registry
        .register_native(Arc::new(GlobTool::new(working_folder.clone())))
        .await;
    registry
        .register_native(Arc::new(EditFileTool::new(working_folder)))
        .await;
}
