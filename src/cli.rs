use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "netjail")]
#[command(
    about = "Attach and detach container network namespaces via CNI plugin chains",
    long_about = None
)]
pub struct Cli {
    /// Path to the adapter configuration file (JSON)
    #[arg(long)]
    pub config_file: PathBuf,

    /// One-shot action to perform (up or down)
    #[arg(long)]
    pub action: Option<String>,

    /// Container handle the action applies to
    #[arg(long)]
    pub handle: Option<String>,

    /// Unix socket path; when set, run as a daemon receiving namespace
    /// descriptors over the socket instead of performing a one-shot action
    #[arg(long)]
    pub socket: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Up,
    Down,
}

impl Action {
    pub fn parse(action: &str) -> Result<Self, String> {
        match action.to_lowercase().as_str() {
            "up" => Ok(Action::Up),
            "down" => Ok(Action::Down),
            _ => Err(format!("Invalid action '{action}'. Supported: up, down")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_action() {
        assert_eq!(Action::parse("up"), Ok(Action::Up));
        assert_eq!(Action::parse("down"), Ok(Action::Down));
        assert_eq!(Action::parse("UP"), Ok(Action::Up));
        assert!(Action::parse("sideways").is_err());
    }

    #[test]
    fn test_cli_one_shot_flags() {
        let cli = Cli::parse_from([
            "netjail",
            "--config-file",
            "/etc/netjail.json",
            "--action",
            "up",
            "--handle",
            "some-handle",
        ]);
        assert_eq!(cli.config_file, PathBuf::from("/etc/netjail.json"));
        assert_eq!(cli.action.as_deref(), Some("up"));
        assert_eq!(cli.handle.as_deref(), Some("some-handle"));
        assert!(cli.socket.is_none());
        assert!(!cli.verbose);
    }

    #[test]
    fn test_cli_daemon_flags() {
        let cli = Cli::parse_from([
            "netjail",
            "--config-file",
            "/etc/netjail.json",
            "--socket",
            "/var/run/netjail.sock",
            "--verbose",
        ]);
        assert_eq!(cli.socket, Some(PathBuf::from("/var/run/netjail.sock")));
        assert!(cli.verbose);
        assert!(cli.action.is_none());
    }
}
