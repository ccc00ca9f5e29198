use std::path::PathBuf;
use std::sync::OnceLock;

use clap::Parser;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationMode {
    Dev,
    Prod,
}

impl std::str::FromStr for OperationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "dev" => Ok(OperationMode::Dev),
            "prod" => Ok(OperationMode::Prod),
            other => Err(format!("unknown operation mode: {}", other)),
        }
    }
}

impl std::fmt::Display for OperationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationMode::Dev => write!(f, "dev"),
            OperationMode::Prod => write!(f, "prod"),
        }
    }
}

#[derive(Parser, Debug, Clone)]
#[command(name = "runway", version, about = "Local multi-runtime worker supervisor and reverse proxy")]
pub struct CliArgs {
    #[arg(long, default_value = "workspace")]
    pub workspace: PathBuf,

    #[arg(long, default_value = "config/server.yaml")]
    pub config: PathBuf,

    #[arg(short = 'm', long, default_value = "dev")]
    pub mode: OperationMode,

    #[arg(long)]
    pub log_level: Option<String>,
}

static CLI_ARGS_SINGLETON: OnceLock<CliArgs> = OnceLock::new();

pub fn get_cli_args() -> &'static CliArgs {
    CLI_ARGS_SINGLETON.get_or_init(CliArgs::parse)
}
