use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum ModelsAction {
    /// List registered embedders and rerankers
    List {},
    /// Point the active setting at an embedder/reranker pair.
    /// A running daemon picks it up on reload.
    Activate {
        embedder_id: u64,
        reranker_id: u64,
    },
    /// Load the active models, downloading base models if none are usable
    Reload {},
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start tagrec as a service.
    Daemon {},

    /// Create a taxonomy from a csv file with `tag,type,reference` columns
    Import {
        name: String,

        csv: PathBuf,

        #[clap(short, long)]
        description: Option<String>,
    },

    /// Append csv entries to an existing taxonomy.
    /// Updates its index too if one was built.
    Add { taxonomy: String, csv: PathBuf },

    /// Build the index of a taxonomy
    Build { taxonomy: String },

    /// Search a taxonomy
    Query {
        taxonomy: String,

        #[clap(allow_hyphen_values = true)]
        query: String,

        /// Number of results
        #[clap(short, long)]
        k: Option<usize>,

        /// Rerank candidates with the active reranker
        #[clap(short, long, default_value = "false")]
        rerank: bool,
    },

    /// Show known taxonomies and built indices
    Stats {},

    /// Delete a taxonomy and its index
    DeleteTaxonomy { name: String },

    /// Manage embedding and reranking models
    Models {
        #[clap(subcommand)]
        action: ModelsAction,
    },
}

impl Command {
    /// Commands that write the catalog or index directory. `query` loads the
    /// active models first, which registers the base pair on a fresh catalog.
    pub fn mutates(&self) -> bool {
        match self {
            Command::Stats {} => false,
            Command::Models {
                action: ModelsAction::List {},
            } => false,
            _ => true,
        }
    }
}
