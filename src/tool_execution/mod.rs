pub mod file_edit;

pub use file_edit::{FileEditHandler, EDIT_FILE_TOOL};

use std::path::Path;
use std::sync::Arc;

use crate::capabilities::Capabilities;
use crate::tools::ToolDispatcher;

/// Dispatcher with every built-in tool registered for `workspace_root`.
pub fn default_dispatcher(workspace_root: &Path, capabilities: Arc<Capabilities>) -> ToolDispatcher {
    let mut dispatcher = ToolDispatcher::new(capabilities);
    dispatcher.register(EDIT_FILE_TOOL, Arc::new(FileEditHandler::new(workspace_root)));
    dispatcher
}
