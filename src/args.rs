use clap::Parser;
use std::path::PathBuf;

use crate::config;

#[derive(Parser, Debug)]
#[command(name = "feedrelay")]
#[command(author = "Feedrelay Team")]
#[command(version = "0.1.0")]
#[command(about = "Signaling and session orchestrator for a live video relay", long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/feedrelay.toml")]
    pub config: PathBuf,

    /// Bind address
    #[arg(long)]
    pub host: Option<String>,

    /// Signaling/HTTP port
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Verbose logging
    #[arg(short, long, action)]
    pub verbose: bool,

    /// Lowest RTC port
    #[arg(long)]
    pub rtc_min_port: Option<u16>,

    /// Highest RTC port
    #[arg(long)]
    pub rtc_max_port: Option<u16>,

    /// Wait after spawning an ingest pipeline before creating its producer
    #[arg(long)]
    pub ready_grace_ms: Option<u64>,
}

impl Args {
    pub fn load_config(&self) -> Result<config::Config, Box<dyn std::error::Error>> {
        config::Config::load(&self.config)
    }

    /// Apply command line overrides on top of the file configuration
    pub fn apply_overrides(&self, config: &mut config::Config) {
        if let Some(ref host) = self.host {
            config.server.host = host.clone();
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(port) = self.rtc_min_port {
            config.engine.rtc_min_port = port;
        }
        if let Some(port) = self.rtc_max_port {
            config.engine.rtc_max_port = port;
        }
        if let Some(grace) = self.ready_grace_ms {
            config.ingest.ready_grace_ms = grace;
        }
        if self.verbose {
            config.logging.level = "debug".to_string();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_win_over_file() {
        let args = Args::parse_from([
            "feedrelay",
            "--port",
            "9100",
            "--rtc-min-port",
            "41000",
            "--ready-grace-ms",
            "250",
            "-v",
        ]);
        let mut config = config::Config::default();
        args.apply_overrides(&mut config);
        assert_eq!(config.server.port, 9100);
        assert_eq!(config.engine.rtc_min_port, 41000);
        assert_eq!(config.ingest.ready_grace_ms, 250);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.server.host, "0.0.0.0");
    }
}
