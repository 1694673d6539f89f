use clap::{Parser, Subcommand, ValueEnum};

const BLUEKEY_LONG_VERSION: &str = concat!(
    "version: ", env!("CARGO_PKG_VERSION"), "\n",
    "git sha: ", env!("BLUEKEY_GIT_SHA"), "\n",
    "build time (UTC): ", env!("BLUEKEY_BUILD_TIME"), "\n",
    "target: ", env!("BLUEKEY_TARGET"), "\n",
    "features: ", env!("BLUEKEY_FEATURES")
);

#[derive(Parser)]
#[command(
    name = "bluekey",
    version = env!("CARGO_PKG_VERSION"),
    long_version = BLUEKEY_LONG_VERSION,
    about = "🔑 BlueKey: personal credential vault with sync"
)]
pub struct Cli {
    /// Vault file path override
    #[arg(long, global = true)]
    pub path: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create the master credential and an empty encrypted vault
    Init {
        /// Master username (prompted when omitted and BLUEKEY_USER is unset)
        #[arg(long)]
        user: Option<String>,
    },
    /// Change the master credential and re-encrypt the vault
    Passwd {
        /// New master username (defaults to the current one)
        #[arg(long)]
        user: Option<String>,
    },
    /// Add an entry (password from BLUEKEY_ENTRY_PASSWORD or a prompt)
    Add {
        #[arg(long)]
        label: Option<String>,
        #[arg(long)]
        user: Option<String>,
        /// Tag, repeatable
        #[arg(long = "tag")]
        tags: Vec<String>,
    },
    /// List entries (labels only by default)
    List {
        /// Only entries carrying this tag
        #[arg(long)]
        tag: Option<String>,
        /// Filter by label or tag substring (case-insensitive)
        #[arg(long)]
        query: Option<String>,
        /// Show usernames alongside labels
        #[arg(long)]
        show_users: bool,
        /// Output a JSON array (never includes passwords)
        #[arg(long)]
        json: bool,
        #[arg(long, value_enum, default_value = "insertion")]
        sort: SortArg,
    },
    /// Show one entry; `key` is a label, an id or an id prefix
    Show {
        key: String,
        #[arg(long)]
        reveal_password: bool,
    },
    /// Edit fields of an entry
    Edit {
        key: String,
        #[arg(long)]
        label: Option<String>,
        #[arg(long)]
        user: Option<String>,
        /// Replace all tags (repeatable)
        #[arg(long = "tag")]
        tags: Option<Vec<String>>,
        /// Prompt for a new password
        #[arg(long)]
        password: bool,
    },
    /// Remove an entry
    Rm {
        key: String,
        /// Do not ask for confirmation
        #[arg(long)]
        yes: bool,
    },
    /// Copy a field to the clipboard; secrets are cleared after the TTL
    Copy {
        key: String,
        #[arg(long, value_enum, default_value = "password")]
        field: FieldArg,
        /// Clipboard TTL in seconds (overrides BLUEKEY_CLIP_TTL)
        #[arg(long)]
        ttl: Option<u64>,
    },
    /// Run one sync pass against the configured remote
    Sync,
    /// Keep syncing in the background until Ctrl-C
    Watch,
    /// List conflicted copies left by sync
    Conflicts {
        #[arg(long)]
        json: bool,
    },
    /// Print the encrypted vault header (no secrets are revealed)
    Header,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
pub enum FieldArg {
    Label,
    User,
    Password,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
pub enum SortArg {
    Insertion,
    Label,
}
