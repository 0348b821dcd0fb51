use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "rkosd", version, about = "rk8s OSD agent")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the agent and keep local OSDs converged with desired state
    Start {
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Print the committed partition scheme of this node as JSON
    Scheme {
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Remove a device from this node's desired state
    RemoveDevice {
        #[arg(short, long)]
        config: PathBuf,
        /// GPT disk GUID of the device
        #[arg(long)]
        uuid: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_remove_device() {
        let cli = Cli::try_parse_from([
            "rkosd",
            "remove-device",
            "--config",
            "/etc/rkosd.yaml",
            "--uuid",
            "2f6c7cdb",
        ])
        .unwrap();
        match cli.command {
            Commands::RemoveDevice { config, uuid } => {
                assert_eq!(config, PathBuf::from("/etc/rkosd.yaml"));
                assert_eq!(uuid, "2f6c7cdb");
            }
            _ => panic!("expected remove-device"),
        }
    }

    #[test]
    fn test_start_requires_config() {
        assert!(Cli::try_parse_from(["rkosd", "start"]).is_err());
        assert!(Cli::try_parse_from(["rkosd", "start", "-c", "a.yaml"]).is_ok());
    }
}
