use crate::errors::ToolError;
use crate::managers::remote_fs::RemoteFsManager;
use crate::services::logger::Logger;
use crate::services::session_pool::{ConnectionPool, PoolConfig};
use crate::services::ssh_transport::Ssh2Connector;
use crate::services::tool_executor::{ToolExecutor, ToolHandler};
use crate::services::transport::Connector;
use crate::services::validation::Validation;
use std::collections::HashMap;
use std::sync::Arc;

pub const FS_TOOL: &str = "fs";

pub struct App {
    pub logger: Logger,
    pub pool: ConnectionPool,
    pub tool_executor: Arc<ToolExecutor>,
}

impl App {
    pub fn initialize() -> Result<Self, ToolError> {
        let logger = Logger::new("ssh-fs");
        let connector: Arc<dyn Connector> = Arc::new(Ssh2Connector::new(logger.clone()));
        Ok(Self::with_connector(logger, PoolConfig::from_env(), connector))
    }

    /// Wires the action surface over an arbitrary transport.
    pub fn with_connector(logger: Logger, config: PoolConfig, connector: Arc<dyn Connector>) -> Self {
        let validation = Validation::new();
        let pool = ConnectionPool::new(config, connector, logger.clone());
        let fs_manager = Arc::new(RemoteFsManager::new(
            logger.clone(),
            validation,
            pool.clone(),
        ));

        let mut handlers: HashMap<String, Arc<dyn ToolHandler>> = HashMap::new();
        handlers.insert(FS_TOOL.to_string(), fs_manager);
        let tool_executor = Arc::new(ToolExecutor::new(logger.clone(), handlers));

        Self {
            logger,
            pool,
            tool_executor,
        }
    }
}
