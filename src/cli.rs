use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "gangway",
    version,
    about = "Bridge between an agent and stdio capability servers"
)]
pub struct Cli {
    #[arg(long)]
    pub config: Option<String>,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Show configured servers with availability and catalogue size
    List,
    /// Re-discover tool catalogues, for one server or all of them
    Refresh {
        server: Option<String>,
    },
    /// Print the full descriptor of a single tool
    Describe {
        /// Tool address in the form server/tool
        address: String,
    },
    /// Print the lean catalogue summary within a character budget
    Summary {
        #[arg(long, default_value_t = 2000)]
        budget: usize,
        /// Wrap the summary in its prompt framing
        #[arg(long)]
        framed: bool,
    },
    /// Invoke a tool and print a synopsis plus a result pointer
    Invoke {
        /// Tool address in the form server/tool
        address: String,
        /// Tool arguments as a JSON object
        #[arg(long, default_value = "{}")]
        args: String,
        /// Per-call timeout override in seconds
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
    /// Print the full stored record behind a result pointer
    Result {
        pointer: String,
    },
    /// Report token savings of lean summaries against raw listings
    Savings,
}
