use clap::Parser;
use std::path::PathBuf;

use camlink::config::{Config, ConfigError};

#[derive(Parser, Debug)]
#[command(name = "camlink")]
#[command(author = "Camlink Team")]
#[command(version)]
#[command(about = "Camera viewer: signaling, WebRTC sessions and stream liveness", long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "camlink.toml")]
    pub config: PathBuf,

    /// Signaling server WebSocket URL
    #[arg(short, long)]
    pub server: Option<String>,

    /// Local viewer identity
    #[arg(short, long)]
    pub identity: Option<String>,

    /// Bearer credential for the control channel
    #[arg(long, env = "CAMLINK_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Verbose logging
    #[arg(short, long, action)]
    pub verbose: bool,

    /// Log per-session health samples
    #[arg(long, action)]
    pub stats: bool,

    /// Camera identities to open sessions with
    pub cameras: Vec<String>,
}

impl Args {
    /// Load the config file and apply command line overrides.
    pub fn load_config(&self) -> Result<Config, ConfigError> {
        let mut config = Config::load(&self.config)?;
        if let Some(server) = &self.server {
            config.server.url = server.clone();
        }
        if let Some(identity) = &self.identity {
            config.server.identity = Some(identity.clone());
        }
        if let Some(token) = &self.token {
            config.server.token = Some(token.clone());
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::Args;
    use clap::Parser;

    #[test]
    fn overrides_apply_over_file_defaults() {
        let args = Args::parse_from([
            "camlink",
            "--config",
            "/nonexistent/camlink.toml",
            "--server",
            "wss://cams.example.com/ws",
            "--identity",
            "v1",
            "c7",
            "c8",
        ]);
        let config = args.load_config().unwrap();
        assert_eq!(config.server.url, "wss://cams.example.com/ws");
        assert_eq!(config.server.identity.as_deref(), Some("v1"));
        assert_eq!(args.cameras, vec!["c7", "c8"]);
    }
}
