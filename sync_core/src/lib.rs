pub mod batch;
pub mod config;
pub mod error;
pub mod lark;
pub mod maintenance;
pub mod schema;
pub mod user_mapper;
pub mod workflow;

mod runtime;

pub use config::{BindingId, Config, TableBinding};
pub use error::{ErrorSeverity, SyncError};
pub use lark::{LarkClient, SinkClient, SinkError, SinkUser};
pub use runtime::{Runtime, RuntimeHandle};
pub use schema::Schema;
pub use workflow::{CycleReport, WorkflowManager};
