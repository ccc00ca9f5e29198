use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required setting: {0}")]
    MissingSetting(String),
    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
    #[error("failed to read configuration file {path}: {source}")]
    Read { path: String, source: std::io::Error },
    #[error("failed to parse YAML in {path}: {source}")]
    Parse { path: String, source: serde_yaml::Error },
}

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("workspace directory {0} is not readable: {1}")]
    WorkspaceUnreadable(String, std::io::Error),
    #[error("duplicate route prefix {0} declared by more than one worker")]
    DuplicateRoutePrefix(String),
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("build failed for worker {worker}: {reason}")]
    Failed { worker: String, reason: String },
    #[error("no builder registered for runtime {0:?}")]
    UnknownRuntime(String),
}

#[derive(Debug, Error)]
pub enum PortExhaustionError {
    #[error("no free port available in range {start}-{end}")]
    RangeExhausted { start: u16, end: u16 },
}

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("failed to spawn process for worker {worker}: {source}")]
    Spawn { worker: String, source: std::io::Error },
    #[error("worker {worker} did not pass its health probe within the warm-up window")]
    WarmupTimeout { worker: String },
}

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("no worker matches path {0}")]
    NoRouteMatched(String),
    #[error("worker {0} is not healthy")]
    WorkerUnhealthy(String),
    #[error("upstream for worker {worker} unavailable: {reason}")]
    UpstreamUnavailable { worker: String, reason: String },
}

#[derive(Debug, Error)]
pub enum FastCgiError {
    #[error("failed to dial FastCGI backend at {0}: {1}")]
    Dial(String, std::io::Error),
    #[error("I/O error talking to FastCGI backend: {0}")]
    Io(#[from] std::io::Error),
    #[error("FastCGI backend closed the connection before EndRequest")]
    PrematureClose,
    #[error("malformed FastCGI record encountered while decoding EndRequest")]
    ProtocolDecode,
    #[error("FastCGI request timed out")]
    Timeout,
    #[error("FastCGI connection pool exhausted")]
    PoolExhausted,
}

#[derive(Debug, Error)]
pub enum RunwayError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
    #[error(transparent)]
    Build(#[from] BuildError),
    #[error(transparent)]
    PortExhaustion(#[from] PortExhaustionError),
    #[error(transparent)]
    Launch(#[from] LaunchError),
    #[error(transparent)]
    Proxy(#[from] ProxyError),
    #[error(transparent)]
    FastCgi(#[from] FastCgiError),
}

impl RunwayError {
    pub fn http_status_code(&self) -> u16 {
        match self {
            RunwayError::Proxy(ProxyError::NoRouteMatched(_)) => 404,
            RunwayError::Proxy(ProxyError::WorkerUnhealthy(_)) => 503,
            RunwayError::Proxy(ProxyError::UpstreamUnavailable { .. }) => 502,
            RunwayError::FastCgi(_) => 502,
            _ => 500,
        }
    }
}
