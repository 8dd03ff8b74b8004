use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug, Clone, PartialEq, Eq)]
#[command(
    name = "dungeon-tracker",
    about = "Track dungeon runs from captured game traffic and chat transcripts",
    version
)]
pub struct CliOptions {
    #[arg(
        long,
        global = true,
        value_name = "PATH",
        help = "Directory holding the tracker stores (defaults to ~/.dungeon-tracker)"
    )]
    pub data_dir: Option<PathBuf>,

    #[arg(
        long = "settings",
        global = true,
        value_name = "FILE",
        help = "JSON file overriding tracker settings"
    )]
    pub settings_path: Option<PathBuf>,

    #[arg(
        long = "client-data",
        global = true,
        value_name = "FILE",
        help = "init_client_data JSON used to build the dungeon catalog"
    )]
    pub client_data_path: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Feed a recorded capture through the tracker
    Replay {
        #[arg(value_name = "CAPTURE")]
        capture_path: PathBuf,
    },
    /// Follow a capture file as it grows
    Watch {
        #[arg(value_name = "CAPTURE")]
        capture_path: PathBuf,
    },
    /// Recover runs from a saved chat transcript
    Backfill {
        #[arg(value_name = "TRANSCRIPT")]
        transcript_path: PathBuf,
    },
    /// Print stored runs as JSON
    History {
        #[arg(value_name = "DUNGEON_HRID")]
        dungeon_id: Option<String>,
        #[arg(value_name = "TIER")]
        difficulty_tier: Option<u32>,
    },
    /// Print overall, per-team and per-dungeon statistics
    Stats,
}
