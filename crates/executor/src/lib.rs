pub mod executor;
pub mod stream;

pub use executor::{ExecuteRequest, ExecutionResult, Executor, ExecutorError};
pub use stream::{StreamAggregate, StreamParser, ToolResultInfo, ToolUseInfo};
