use clap::{ArgAction, Parser};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(
    name = "wsbridge",
    version,
    about = "Tiny WebSocket connection bridge server",
    disable_version_flag = true
)]
pub struct Cli {
    /// The server URL (e.g. wss://echo.websocket.org/echo)
    pub url: String,

    /// Listening host name [default: 127.0.0.1]
    #[arg(long)]
    pub host: Option<String>,

    /// Listening port [default: 8080]
    #[arg(long)]
    pub port: Option<u16>,

    /// HTTP proxy used to connect the server [default: from environment]
    #[arg(long)]
    pub proxy: Option<String>,

    /// Handshake timeout, e.g. "30s" or "1m" [default: 1m]
    #[arg(long, value_parser = humantime::parse_duration)]
    pub handshake_timeout: Option<Duration>,

    /// Path to an optional YAML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Log filter, e.g. "info" or "ws_bridge=debug" [default: info]
    #[arg(long)]
    pub log_level: Option<String>,

    /// Print version
    #[arg(short = 'v', long, action = ArgAction::Version)]
    #[allow(dead_code)]
    version: Option<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::error::ErrorKind;

    #[test]
    fn url_only() {
        let cli = Cli::try_parse_from(["wsbridge", "wss://echo.websocket.org/echo"]).unwrap();
        assert_eq!(cli.url, "wss://echo.websocket.org/echo");
        assert!(cli.host.is_none());
        assert!(cli.port.is_none());
        assert!(cli.proxy.is_none());
        assert!(cli.handshake_timeout.is_none());
        assert!(cli.config.is_none());
    }

    #[test]
    fn all_options() {
        let cli = Cli::try_parse_from([
            "wsbridge",
            "--host",
            "0.0.0.0",
            "--port",
            "9000",
            "--proxy",
            "http://proxy.local:3128",
            "--handshake-timeout",
            "30s",
            "-c",
            "bridge.yaml",
            "--log-level",
            "debug",
            "ws://example.com/echo",
        ])
        .unwrap();

        assert_eq!(cli.host.as_deref(), Some("0.0.0.0"));
        assert_eq!(cli.port, Some(9000));
        assert_eq!(cli.proxy.as_deref(), Some("http://proxy.local:3128"));
        assert_eq!(cli.handshake_timeout, Some(Duration::from_secs(30)));
        assert_eq!(cli.config, Some(PathBuf::from("bridge.yaml")));
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
    }

    #[test]
    fn url_is_required() {
        let err = Cli::try_parse_from(["wsbridge"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingRequiredArgument);
        assert!(err.use_stderr());
    }

    #[test]
    fn short_v_prints_version() {
        let err = Cli::try_parse_from(["wsbridge", "-v"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DisplayVersion);
        assert!(!err.use_stderr());
    }

    #[test]
    fn rejects_bad_duration() {
        let err = Cli::try_parse_from([
            "wsbridge",
            "--handshake-timeout",
            "soon",
            "ws://example.com/echo",
        ])
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValueValidation);
    }
}
