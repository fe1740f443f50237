//! CLI command definitions and subcommands

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::domain::StageName;
use crate::queue::TaskStatus;

/// footprintd - aggregate footprint pipeline
#[derive(Parser)]
#[command(
    name = "pd",
    about = "Pipeline orchestration for aggregate footprint metrics",
    version = env!("CARGO_PKG_VERSION"),
    after_help = "Logs are written to: ~/.local/share/footprintd/logs/footprintd.log"
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true, help = "Enable verbose output")]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// CLI subcommands
#[derive(Subcommand)]
pub enum Command {
    /// Start a product and run the pipeline until the queue is idle
    Run {
        /// Product name
        name: String,

        /// Free-text product description
        #[arg(short, long)]
        description: Option<String>,

        /// Product mass in kilograms
        #[arg(short, long)]
        mass: Option<f64>,
    },

    /// Start a product without running it; a worker picks it up
    Start {
        name: String,

        #[arg(short, long)]
        description: Option<String>,

        #[arg(short, long)]
        mass: Option<f64>,
    },

    /// Drain the task queue until interrupted
    Worker,

    /// Show the material tree of a product
    Status {
        /// Product or material id; lists products when omitted
        id: Option<String>,

        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// List queued and finished tasks
    Tasks {
        /// Only tasks in this status
        #[arg(short, long)]
        status: Option<TaskStatus>,
    },

    /// Requeue failed tasks
    Resume {
        /// Only tasks of this stage
        #[arg(short, long)]
        stage: Option<StageName>,
    },

    /// Show the event journal
    Events {
        /// Number of entries to show
        #[arg(short, long, default_value = "50")]
        lines: usize,
    },
}

/// Output format for status output
#[derive(Clone, Debug, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" | "plain" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => Err(format!("Unknown format: {}. Use: text or json", s)),
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Json => write!(f, "json"),
        }
    }
}

/// Get the log file path
pub fn get_log_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("footprintd")
        .join("logs")
        .join("footprintd.log")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_no_command() {
        let cli = Cli::parse_from(["pd"]);
        assert!(cli.command.is_none());
    }

    #[test]
    fn test_cli_parse_run() {
        let cli = Cli::parse_from(["pd", "run", "Desk Lamp", "--mass", "2.5"]);
        if let Some(Command::Run {
            name,
            description,
            mass,
        }) = cli.command
        {
            assert_eq!(name, "Desk Lamp");
            assert!(description.is_none());
            assert_eq!(mass, Some(2.5));
        } else {
            panic!("Expected Run command");
        }
    }

    #[test]
    fn test_cli_parse_tasks_status() {
        let cli = Cli::parse_from(["pd", "tasks", "--status", "failed"]);
        assert!(matches!(
            cli.command,
            Some(Command::Tasks {
                status: Some(TaskStatus::Failed)
            })
        ));
    }

    #[test]
    fn test_cli_parse_resume_stage() {
        let cli = Cli::parse_from(["pd", "resume", "--stage", "supplier_finder"]);
        assert!(matches!(
            cli.command,
            Some(Command::Resume {
                stage: Some(StageName::SupplierFinder)
            })
        ));
    }

    #[test]
    fn test_cli_rejects_unknown_stage() {
        assert!(Cli::try_parse_from(["pd", "resume", "--stage", "polishing"]).is_err());
    }

    #[test]
    fn test_output_format_from_str() {
        assert!(matches!("text".parse::<OutputFormat>(), Ok(OutputFormat::Text)));
        assert!(matches!("json".parse::<OutputFormat>(), Ok(OutputFormat::Json)));
        assert!("table".parse::<OutputFormat>().is_err());
    }

    #[test]
    fn test_cli_with_config() {
        let cli = Cli::parse_from(["pd", "-c", "/path/to/config.yml", "worker"]);
        assert_eq!(cli.config, Some(PathBuf::from("/path/to/config.yml")));
        assert!(matches!(cli.command, Some(Command::Worker)));
    }
}
