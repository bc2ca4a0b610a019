//! CLI definitions using clap.

use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::model::{MergeMode, Order, DEFAULT_PAGE_SIZE};

pub mod commands;

/// soupsync - offline JSON soups with resumable sync
#[derive(Parser, Debug)]
#[command(name = "soupsync", author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Database path (default: ~/.soupsync/data/soupsync.db)
    #[arg(long, global = true, env = "SOUPSYNC_DB")]
    pub db: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true)]
    pub json: bool,

    /// Increase logging verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Quiet mode (no output except errors)
    #[arg(short, long, global = true)]
    pub quiet: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Soup management
    Soup {
        #[command(subcommand)]
        command: SoupCommands,
    },

    /// Insert or update a record
    Upsert(UpsertArgs),

    /// Fetch records by entry id
    Get {
        /// Soup name
        soup: String,

        /// Entry ids
        #[arg(required = true)]
        ids: Vec<i64>,
    },

    /// Query a soup
    Query(QueryArgs),

    /// Delete records by entry id
    Delete {
        /// Soup name
        soup: String,

        /// Entry ids
        #[arg(required = true)]
        ids: Vec<i64>,

        /// Mark as locally deleted so the next sync up removes them remotely
        #[arg(long)]
        local: bool,
    },

    /// Sync soups with the remote service
    Sync {
        #[command(subcommand)]
        command: SyncCommands,
    },

    /// Remote connection settings
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },

    /// Print version information
    Version,
}

/// Supported shells for completions.
#[derive(ValueEnum, Clone, Debug)]
pub enum Shell {
    Bash,
    Zsh,
    Fish,
    PowerShell,
    Elvish,
}

/// Sort direction flag.
#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

impl From<SortOrder> for Order {
    fn from(order: SortOrder) -> Self {
        match order {
            SortOrder::Asc => Self::Ascending,
            SortOrder::Desc => Self::Descending,
        }
    }
}

/// Merge mode flag.
#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MergeModeArg {
    #[default]
    Overwrite,
    LeaveIfChanged,
}

impl From<MergeModeArg> for MergeMode {
    fn from(mode: MergeModeArg) -> Self {
        match mode {
            MergeModeArg::Overwrite => Self::Overwrite,
            MergeModeArg::LeaveIfChanged => Self::LeaveIfChanged,
        }
    }
}

// ============================================================================
// Soup Commands
// ============================================================================

#[derive(Subcommand, Debug)]
pub enum SoupCommands {
    /// Register a soup, or change the indices of an existing one
    Register {
        /// Soup name
        name: String,

        /// Index as path[:type], type one of string, integer, floating, json1
        #[arg(short, long = "index", required = true)]
        indices: Vec<String>,
    },

    /// Drop a soup and all of its records
    Drop {
        /// Soup name
        name: String,
    },

    /// Remove all records but keep the soup
    Clear {
        /// Soup name
        name: String,
    },

    /// List soups
    List,

    /// Show the indices of a soup
    Describe {
        /// Soup name
        name: String,
    },
}

#[derive(Args, Debug)]
pub struct UpsertArgs {
    /// Soup name
    pub soup: String,

    /// Record as JSON, or `-` to read stdin
    pub record: String,

    /// Match existing records on this indexed path instead of the entry id
    #[arg(long)]
    pub external_id: Option<String>,

    /// Mark the record dirty so the next sync up sends it
    #[arg(long)]
    pub local: bool,
}

// ============================================================================
// Query Commands
// ============================================================================

#[derive(Args, Debug)]
pub struct QueryArgs {
    #[command(subcommand)]
    pub kind: QueryKind,

    /// Records per page
    #[arg(long, global = true, default_value_t = DEFAULT_PAGE_SIZE)]
    pub page_size: usize,

    /// Zero-based page index
    #[arg(long, global = true, default_value_t = 0)]
    pub page: usize,

    /// Print the number of matches instead of records
    #[arg(long, global = true)]
    pub count: bool,
}

#[derive(Subcommand, Debug)]
pub enum QueryKind {
    /// Every record of a soup
    All {
        soup: String,

        /// Indexed path to order by
        #[arg(long)]
        order_path: Option<String>,

        #[arg(long, value_enum, default_value_t)]
        order: SortOrder,
    },

    /// Records whose indexed path equals a value
    Exact {
        soup: String,
        path: String,

        /// Value (parsed as JSON when possible)
        value: String,

        #[arg(long)]
        order_path: Option<String>,

        #[arg(long, value_enum, default_value_t)]
        order: SortOrder,
    },

    /// Records whose indexed path lies in an inclusive range
    Range {
        soup: String,
        path: String,

        /// Lower bound (open when omitted)
        #[arg(long)]
        begin: Option<String>,

        /// Upper bound (open when omitted)
        #[arg(long)]
        end: Option<String>,

        #[arg(long)]
        order_path: Option<String>,

        #[arg(long, value_enum, default_value_t)]
        order: SortOrder,
    },

    /// Records whose indexed path matches a LIKE pattern
    Like {
        soup: String,
        path: String,
        pattern: String,

        #[arg(long)]
        order_path: Option<String>,

        #[arg(long, value_enum, default_value_t)]
        order: SortOrder,
    },

    /// Logical SQL with {soup} and {soup:path} references
    Smart {
        sql: String,
    },
}

// ============================================================================
// Sync Commands
// ============================================================================

#[derive(Subcommand, Debug)]
pub enum SyncCommands {
    /// Download records into a soup
    Down {
        /// Destination soup
        #[arg(long)]
        soup: String,

        /// Query to run (shorthand for a query target)
        #[arg(long, conflicts_with = "target", required_unless_present = "target")]
        query: Option<String>,

        /// Full target as JSON
        #[arg(long)]
        target: Option<String>,

        /// Name to register the sync under
        #[arg(long)]
        name: Option<String>,

        #[arg(long, value_enum, default_value_t)]
        merge_mode: MergeModeArg,
    },

    /// Upload dirty records from a soup
    Up {
        /// Source soup
        #[arg(long)]
        soup: String,

        /// Object type for records that do not carry one
        #[arg(long, conflicts_with = "target")]
        object_type: Option<String>,

        /// Send records in composite batches of this size
        #[arg(long, conflicts_with = "target")]
        batch_size: Option<usize>,

        /// Full target as JSON
        #[arg(long)]
        target: Option<String>,

        /// Fields to send (comma-separated)
        #[arg(long, value_delimiter = ',')]
        fieldlist: Option<Vec<String>>,

        /// Name to register the sync under
        #[arg(long)]
        name: Option<String>,

        #[arg(long, value_enum, default_value_t)]
        merge_mode: MergeModeArg,
    },

    /// Run an existing sync again
    Resync {
        /// Sync id or name
        sync: String,
    },

    /// Show one sync
    Status {
        /// Sync id or name
        sync: String,
    },

    /// List syncs
    List {
        /// Only syncs in this status (NEW, RUNNING, DONE, FAILED, STOPPED)
        #[arg(long)]
        status: Option<String>,
    },

    /// Forget a sync (its records stay)
    Delete {
        /// Sync id or name
        sync: String,
    },

    /// Remove local records of a sync down that no longer exist remotely
    CleanGhosts {
        /// Sync id or name
        sync: String,
    },
}

// ============================================================================
// Config Commands
// ============================================================================

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Show effective settings (the token is masked)
    Show,

    /// Update saved settings
    Set {
        #[arg(long)]
        instance_url: Option<String>,

        #[arg(long)]
        access_token: Option<String>,

        #[arg(long)]
        api_version: Option<String>,
    },
}
