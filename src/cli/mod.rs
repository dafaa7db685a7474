use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "camstream")]
#[command(about = "📷 Stream JPEG frames to an image server over WebSocket", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Stream a test pattern to a server
    Stream {
        /// Server host or IP
        #[arg(long, default_value = "localhost")]
        host: String,

        /// Server port
        #[arg(short, long, default_value = "9000")]
        port: String,

        /// Username for the authenticate handshake
        #[arg(short, long)]
        user: Option<String>,

        /// Password (prompted when --user is given without it)
        #[arg(long)]
        password: Option<String>,

        /// Use wss:// instead of ws://
        #[arg(long)]
        secure: bool,

        /// Upload frequency in Hz (0 pauses uploads)
        #[arg(long, default_value_t = 10)]
        fps: u32,

        /// Frame width in pixels
        #[arg(long, default_value_t = camstream::capture::DEFAULT_WIDTH)]
        width: u32,

        /// Frame height in pixels
        #[arg(long, default_value_t = camstream::capture::DEFAULT_HEIGHT)]
        height: u32,

        /// Stop after this many seconds (runs until Ctrl-C otherwise)
        #[arg(long)]
        duration: Option<u64>,
    },

    /// Run an image server that receives streams
    Serve {
        /// Address to bind to
        #[arg(short, long, default_value = "0.0.0.0:9000")]
        addr: String,

        /// Require clients to authenticate as this user
        #[arg(short, long, requires = "password")]
        user: Option<String>,

        /// Password clients must present
        #[arg(long, requires = "user")]
        password: Option<String>,

        /// Save received frames into this directory
        #[arg(short, long)]
        save: Option<PathBuf>,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serve_credentials_come_in_pairs() {
        assert!(Cli::try_parse_from(["camstream", "serve", "--password", "x"]).is_err());
        assert!(Cli::try_parse_from(["camstream", "serve", "--user", "cam"]).is_err());

        let cli = Cli::try_parse_from(["camstream", "serve", "--user", "cam", "--password", "x"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Serve { user: Some(_), password: Some(_), .. }
        ));
    }

    #[test]
    fn test_stream_defaults() {
        let cli = Cli::try_parse_from(["camstream", "stream"]).unwrap();
        let Commands::Stream { host, port, fps, user, .. } = cli.command else {
            panic!("expected stream");
        };
        assert_eq!(host, "localhost");
        assert_eq!(port, "9000");
        assert_eq!(fps, 10);
        assert!(user.is_none());
    }
}
