//! CLI argument parsing for boardkeep.

use boardkeep::{AdapterKind, TaskStatus, Visibility};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "bk",
    about = "Project, epic and task board with pluggable storage and API keys",
    version = env!("GIT_DESCRIBE"),
    after_help = "Logs are written to: ~/.local/share/boardkeep/logs/boardkeep.log"
)]
pub struct Cli {
    /// Board root directory (default: current directory)
    #[arg(short = 'd', long, global = true)]
    pub dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum BackendArg {
    File,
    Sqlite,
    Postgres,
}

impl From<BackendArg> for AdapterKind {
    fn from(arg: BackendArg) -> Self {
        match arg {
            BackendArg::File => AdapterKind::File,
            BackendArg::Sqlite => AdapterKind::Sqlite,
            BackendArg::Postgres => AdapterKind::Postgres,
        }
    }
}

#[derive(Subcommand)]
pub enum Command {
    /// Initialize a board in the current directory
    Init {
        /// Storage backend
        #[arg(short, long, value_enum, default_value = "file")]
        backend: BackendArg,

        /// Remote database URL (postgres backend)
        #[arg(long)]
        database_url: Option<String>,
    },

    /// Manage projects
    #[command(subcommand)]
    Project(ProjectCommand),

    /// Manage epics
    #[command(subcommand)]
    Epic(EpicCommand),

    /// Manage tasks
    #[command(subcommand)]
    Task(TaskCommand),

    /// Manage API keys
    #[command(subcommand)]
    Key(KeyCommand),

    /// Encrypt a secret for the config file (password from BOARDKEEP_SECRET)
    Encrypt {
        /// Value to encrypt
        value: String,
    },

    /// Decrypt a value produced by `encrypt`
    Decrypt {
        /// Ciphertext to decrypt
        ciphertext: String,
    },

    /// Run the daemon in foreground
    Daemon,

    /// Stop the running daemon
    DaemonStop,

    /// Check daemon status
    DaemonStatus,
}

#[derive(Subcommand)]
pub enum ProjectCommand {
    /// Create a project
    Create {
        /// Project name
        name: String,

        /// Description
        #[arg(short = 'D', long)]
        description: Option<String>,

        /// Make the project private
        #[arg(long)]
        private: bool,
    },

    /// List projects
    List,

    /// Rename or change visibility of a project
    Update {
        /// Project ID
        id: String,

        #[arg(short, long)]
        name: Option<String>,

        #[arg(short = 'D', long)]
        description: Option<String>,

        /// public or private
        #[arg(long)]
        visibility: Option<Visibility>,
    },

    /// Delete a project with all its epics and tasks
    Delete {
        /// Project ID
        id: String,
    },
}

#[derive(Subcommand)]
pub enum EpicCommand {
    /// Create an epic
    Create {
        /// Owning project ID
        project_id: String,

        /// Epic title
        title: String,

        #[arg(short = 'D', long)]
        description: Option<String>,
    },

    /// List epics of a project
    List {
        /// Project ID
        project_id: String,
    },

    /// Delete an epic; its tasks stay in the project
    Delete {
        /// Epic ID
        id: String,
    },
}

#[derive(Subcommand)]
pub enum TaskCommand {
    /// Create a task
    Create {
        /// Owning project ID
        project_id: String,

        /// Task title
        title: String,

        /// Epic ID
        #[arg(short, long)]
        epic: Option<String>,

        /// Priority (0=high, 2=low)
        #[arg(short, long)]
        priority: Option<u8>,

        #[arg(short, long)]
        notes: Option<String>,

        /// Task IDs this task depends on (comma-separated)
        #[arg(long, value_delimiter = ',')]
        depends_on: Vec<String>,
    },

    /// List tasks of a project
    List {
        /// Project ID
        project_id: String,
    },

    /// Get a task by ID
    Get {
        /// Task ID
        id: String,
    },

    /// Set a task's status (todo, in_progress, review, done)
    Status {
        /// Task ID
        id: String,

        status: TaskStatus,
    },

    /// Delete a task
    Delete {
        /// Task ID
        id: String,
    },
}

#[derive(Subcommand)]
pub enum KeyCommand {
    /// Issue a new API key; the key is printed once
    Create {
        /// Label for the key
        #[arg(short, long)]
        name: Option<String>,

        /// Restrict the key to these project IDs (comma-separated); omit for a server key
        #[arg(short, long, value_delimiter = ',')]
        projects: Vec<String>,
    },

    /// List issued keys
    List,

    /// Revoke a key
    Revoke {
        /// Key ID
        id: String,
    },
}
