//! 核心层：应用上下文、流水线错误、会话监管

pub mod context;
pub mod error;
pub mod session_supervisor;

pub use context::{create_llm_from_config, AppContext};
pub use error::PipelineError;
pub use session_supervisor::SessionSupervisor;
