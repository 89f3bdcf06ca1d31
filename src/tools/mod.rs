//! 工具层：能力契约（Tool）、注册表、带超时与审计的执行器，以及各检索 / 写入 / 分析后端

pub mod analyze;
pub mod code_write;
pub mod executor;
pub mod filesystem;
pub mod registry;
pub mod search;
pub mod web_search;

pub use analyze::AnalyzeCodeTool;
pub use code_write::{unified_diff, CodeChange, CodeHistory, WriteFileTool};
pub use executor::ToolExecutor;
pub use filesystem::SafeFs;
pub use registry::{required_str, Tool, ToolError, ToolOutput, ToolRegistry};
pub use search::{hits_from_output, InternalSearchTool, SearchHit};
pub use web_search::ExternalSearchTool;
