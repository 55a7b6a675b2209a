//! This module defines the command-line interface for the application using `clap`.
//!
//! It provides a `Cli` struct that represents the parsed command-line arguments,
//! and a `Commands` enum that represents the available subcommands and their
//! options.
//!
//! Chat commands authenticate with `--user`/`--password` (or `GEMIS_USER` and
//! `GEMIS_PASSWORD`) and act on `--thread`, defaulting to the user's most
//! recently active chat.
//!
//! # Examples
//!
//! ```no_run
//! use clap::Parser;
//! use gemis::commands::{Cli, Commands};
//!
//! let cli = Cli::parse();
//! match cli.command {
//!     Commands::Send { text, files, .. } => {
//!         // Run one turn
//!     }
//!     _ => {}
//! }
//! ```

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// Represents the parsed command-line arguments.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None, propagate_version = true, color = clap::ColorChoice::Always)]
pub struct Cli {
    /// Configuration file. Defaults to `config.yaml` in the platform config directory.
    #[arg(long, global = true, env = "GEMIS_CONFIG")]
    pub config: Option<PathBuf>,

    /// The parsed subcommand and its options.
    #[command(subcommand)]
    pub command: Commands,
}

/// Who is acting.
#[derive(Args, Debug, Clone)]
pub struct Login {
    #[arg(long, short = 'u', env = "GEMIS_USER")]
    pub user: String,

    #[arg(long, short = 'p', env = "GEMIS_PASSWORD", hide_env_values = true)]
    pub password: String,
}

/// Who is acting and on which chat.
#[derive(Args, Debug, Clone)]
pub struct ChatTarget {
    #[command(flatten)]
    pub login: Login,

    /// Thread to act on. Defaults to the most recently active chat.
    #[arg(long)]
    pub thread: Option<String>,
}

#[derive(Subcommand, Debug)]
#[command(about, long_about = None, color = clap::ColorChoice::Always)]
pub enum Commands {
    /// Write a default configuration file and create the store.
    Init,

    /// Manage users.
    #[command(subcommand)]
    User(UserCommand),

    /// Manage chats.
    #[command(subcommand)]
    Chats(ChatsCommand),

    /// Submit one turn: files first, then the text.
    #[clap(name = "send", alias = "s")]
    Send {
        #[command(flatten)]
        target: ChatTarget,

        /// A file to upload with this turn. Repeatable.
        #[arg(long = "file", short = 'f')]
        files: Vec<PathBuf>,

        text: Option<String>,
    },

    /// Print the transcript of a chat.
    History {
        #[command(flatten)]
        target: ChatTarget,
    },

    /// List the attachments of a chat, newest first.
    Files {
        #[command(flatten)]
        target: ChatTarget,
    },

    /// Maintenance on individual messages.
    #[command(subcommand)]
    Message(MessageCommand),

    /// Chat in a loop. Lines starting with `/` are commands, see `/help`.
    #[clap(name = "interactive", alias = "i")]
    Interactive {
        #[command(flatten)]
        target: ChatTarget,
    },
}

#[derive(Subcommand, Debug)]
pub enum UserCommand {
    /// Create a user.
    Add {
        name: String,
        #[arg(long, short = 'p', env = "GEMIS_PASSWORD", hide_env_values = true)]
        password: String,
    },

    /// List users.
    List,

    /// Replace a user's password.
    Passwd {
        name: String,
        #[arg(long, short = 'p', env = "GEMIS_PASSWORD", hide_env_values = true)]
        password: String,
    },
}

#[derive(Subcommand, Debug)]
pub enum ChatsCommand {
    /// List chats, most recently active first.
    List {
        #[command(flatten)]
        login: Login,
    },

    /// Create a chat named `Chat N`.
    New {
        #[command(flatten)]
        login: Login,
    },

    /// Rename a chat.
    Rename {
        #[command(flatten)]
        target: ChatTarget,
        title: String,
    },

    /// Delete a chat with its messages and attachments.
    Delete {
        #[command(flatten)]
        target: ChatTarget,
    },
}

#[derive(Subcommand, Debug)]
pub enum MessageCommand {
    /// Delete a message by id.
    Drop { id: i32 },

    /// Replace the content of a message.
    Edit { id: i32, content: String },
}
