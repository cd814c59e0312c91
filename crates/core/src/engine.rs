use async_trait::async_trait;
use thiserror::Error;

use crate::records::ResultSet;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct EngineError {
    message: String,
}

impl EngineError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

#[async_trait]
pub trait EngineConnection: Send + Sync + 'static {
    async fn execute(&self, sql: &str) -> Result<(), EngineError>;

    async fn query(&self, sql: &str) -> Result<ResultSet, EngineError>;

    // Must tolerate repeated calls and calls made while a statement is
    // still running on another task.
    fn close(&self);
}

#[async_trait]
pub trait Engine: Send + Sync + 'static {
    type Connection: EngineConnection;

    async fn connect(&self) -> Result<Self::Connection, EngineError>;

    async fn reset(&self) -> Result<(), EngineError>;

    async fn terminate(&self) -> Result<(), EngineError>;
}
