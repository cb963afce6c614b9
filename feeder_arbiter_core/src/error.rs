use crate::state::FeederId;

/// Failure raised by a decision strategy, either while loading or while deciding.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PluginError {
    #[error("unknown strategy '{0}'")]
    UnknownStrategy(String),

    #[error("invalid plugin parameters: {0}")]
    InvalidParams(String),

    #[error("failed to read plugin file {path}: {reason}")]
    Unreadable { path: String, reason: String },

    #[error("decision failed: {0}")]
    Runtime(String),

    #[error("decision panicked: {0}")]
    Panicked(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ArbiterError {
    #[error("agent not found: {0}")]
    AgentNotFound(String),

    #[error("feeder not found: {0}")]
    FeederNotFound(FeederId),

    #[error("plugin load failed: {0}")]
    PluginLoad(PluginError),

    #[error("plugin runtime error: {0}")]
    PluginRuntime(PluginError),

    #[error("dispense failed on feeder {feeder_id}: {reason}")]
    HardwareDispense { feeder_id: FeederId, reason: String },

    #[error("invalid configuration:\n{0}")]
    InvalidConfig(String),

    #[error("config parse error: {0}")]
    ConfigParse(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ArbiterError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::AgentNotFound(_) | Self::FeederNotFound(_))
    }
}

impl From<PluginError> for ArbiterError {
    fn from(e: PluginError) -> Self {
        match e {
            PluginError::Runtime(_) | PluginError::Panicked(_) => Self::PluginRuntime(e),
            other => Self::PluginLoad(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, ArbiterError>;
