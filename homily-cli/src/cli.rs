use clap::{Parser, Subcommand, ValueEnum};
use homily_core::{ByteSize, Connectivity, ConnectionType};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "homily", version, about = "Download sermon audio for offline listening")]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,

    /// Directory holding downloads, queue state and settings
    #[arg(long, env = "HOMILY_DATA_DIR", global = true)]
    pub data_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Queue sermons and download them
    Fetch {
        /// JSON file with an array of sermon messages
        #[arg(short, long)]
        manifest: Option<PathBuf>,

        /// A single sermon as `id=url`, may be repeated
        #[arg(short = 'M', long = "message", value_parser = parse_message_arg)]
        messages: Vec<(String, String)>,

        /// Network the downloads are running on
        #[arg(long, value_enum, default_value_t = NetworkArg::Wifi)]
        network: NetworkArg,

        /// Override the WiFi-only setting for this run
        #[arg(long)]
        wifi_only: Option<bool>,

        /// Override the storage limit for this run, e.g. `500MB`
        #[arg(long)]
        storage_limit: Option<ByteSize>,
    },

    /// List downloaded sermons and pending queue items
    List {
        /// Only show downloads whose title, speaker or series matches
        #[arg(short, long)]
        search: Option<String>,
    },

    /// Delete a downloaded sermon
    Remove {
        /// Sermon identifier
        id: String,
    },

    /// Show disk space used by downloads
    Usage,

    /// Delete the oldest downloads until usage is at most the target
    Free {
        /// Target usage, e.g. `1GB`
        target: ByteSize,
    },

    /// Show or change download settings
    Settings {
        /// Only download over WiFi
        #[arg(long)]
        wifi_only: Option<bool>,

        /// Storage limit, e.g. `2GB`
        #[arg(long, conflicts_with = "no_storage_limit")]
        storage_limit: Option<ByteSize>,

        /// Remove the storage limit
        #[arg(long)]
        no_storage_limit: bool,
    },
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkArg {
    Wifi,
    Ethernet,
    Cellular,
    Offline,
}

impl From<NetworkArg> for Connectivity {
    fn from(value: NetworkArg) -> Self {
        match value {
            NetworkArg::Wifi => Connectivity::WIFI,
            NetworkArg::Ethernet => Connectivity {
                connected: true,
                kind: ConnectionType::Ethernet,
            },
            NetworkArg::Cellular => Connectivity::CELLULAR,
            NetworkArg::Offline => Connectivity::OFFLINE,
        }
    }
}

fn parse_message_arg(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((id, url)) if !id.is_empty() && !url.is_empty() => {
            Ok((id.trim().to_string(), url.trim().to_string()))
        }
        _ => Err(format!("expected `id=url`, got `{s}`")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn command_definition_is_valid() {
        Args::command().debug_assert();
    }

    #[test]
    fn parses_message_pairs() {
        assert_eq!(
            parse_message_arg("42=https://example.org/a.mp3?x=1").unwrap(),
            ("42".to_string(), "https://example.org/a.mp3?x=1".to_string())
        );
        assert!(parse_message_arg("no-url").is_err());
        assert!(parse_message_arg("=https://example.org").is_err());
    }

    #[test]
    fn parses_fetch_flags() {
        let args = Args::try_parse_from([
            "homily",
            "fetch",
            "-M",
            "a=https://example.org/a.mp3",
            "--network",
            "cellular",
            "--storage-limit",
            "500MB",
        ])
        .unwrap();
        let Commands::Fetch {
            messages,
            network,
            storage_limit,
            ..
        } = args.command
        else {
            panic!("expected fetch");
        };
        assert_eq!(messages.len(), 1);
        assert_eq!(network, NetworkArg::Cellular);
        assert_eq!(storage_limit.map(|s| s.to_bytes()), Some(500 * 1024 * 1024));
    }
}
