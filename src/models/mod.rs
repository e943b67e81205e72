pub mod query;
pub mod status;
pub mod tools;

pub use query::{FieldInfo, QueryParam, QueryResult};
pub use status::{ConnectionStatus, PoolStatus, TunnelStateSnapshot, TunnelStatus};
pub use tools::{ToolContent, ToolResponse};
