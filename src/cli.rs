use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Index every photo under a directory.
    ///
    /// Already indexed photos are reused. Ctrl-C stops at the next photo,
    /// keeping everything indexed so far.
    Index {
        /// Photo library root
        dir: PathBuf,
    },

    /// Find photos matching a text description
    Search {
        /// e.g. "dog on a beach"
        text: String,

        /// Photo library root, used to print file paths
        #[clap(short, long)]
        dir: Option<PathBuf>,

        /// Maximum results (defaults to `search_limit` from config)
        #[clap(short, long)]
        limit: Option<usize>,
    },

    /// Find photos similar to an indexed photo
    Similar {
        /// Photo id as printed by `search` or `stats`
        id: u64,

        /// Photo library root, used to print file paths
        #[clap(short, long)]
        dir: Option<PathBuf>,

        #[clap(short, long)]
        limit: Option<usize>,
    },

    /// Show the stored record of a photo
    Show {
        id: u64,
    },

    /// Print embedding store statistics
    Stats {},

    /// Delete every stored embedding
    Clear {
        /// Auto confirm
        #[clap(short, long, default_value = "false")]
        yes: bool,
    },

    /// Print the token ids and attention mask of a text query as JSON
    Tokenize {
        text: String,
    },
}
