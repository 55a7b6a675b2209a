//! Main module for the Gemis CLI application.
//!
//! Parses the command line, loads the configuration and dispatches to the
//! store (user and message maintenance) or to a [`ChatService`] (everything a
//! logged-in user does). Only `send` and `interactive` load the embedder, the
//! index and the model client.
//!
//! # Examples
//!
//! ```sh
//! gemis init
//! gemis user add ana --password hunter2
//! gemis send -u ana -p hunter2 --file report.pdf "What are the totals?"
//! gemis interactive -u ana -p hunter2
//! ```

use std::error::Error;
use std::io::{Write, stdout};
use std::path::{Path, PathBuf};

use clap::Parser;
use crossterm::ExecutableCommand;
use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};
use once_cell::sync::OnceCell;
use tracing::{debug, info};

use gemis::commands::{ChatTarget, ChatsCommand, Cli, Commands, Login, MessageCommand, UserCommand};
use gemis::config::{self, GemisConfig};
use gemis::ingest::{Turn, TurnReport};
use gemis::models::{Attachment, Chat, ChatMessage};
use gemis::service::{ChatService, ChatView};
use gemis::session::{SessionContext, SessionError};
use gemis::store::Database;

static TRACING: OnceCell<()> = OnceCell::new();

fn main() -> Result<(), Box<dyn Error>> {
    TRACING.get_or_init(|| {
        tracing_subscriber::fmt().with_writer(std::io::stderr).init();
    });
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(run())
}

async fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    let config_path = match cli.config {
        Some(path) => path,
        None => gemis::config_dir()?.join("config.yaml"),
    };
    let base = config_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    match cli.command {
        Commands::Init => init(&config_path, &base),
        Commands::User(command) => users(&load(&config_path, &base)?, command),
        Commands::Message(command) => messages(&load(&config_path, &base)?, command),
        Commands::Chats(command) => chats(&load(&config_path, &base)?, command),
        Commands::Send {
            target,
            files,
            text,
        } => {
            let text = text.unwrap_or_default();
            if text.trim().is_empty() && files.is_empty() {
                return Err("Nothing to send: pass a message or --file".into());
            }
            let config = load(&config_path, &base)?;
            let mut service = ChatService::from_config(&config)?;
            let (session, view) = open_session(&mut service, &target.login, target.thread.as_deref())?;
            let mut history = view.transcript;
            let report = service
                .submit_turn(&session, &mut history, Turn { text, files })
                .await?;
            print_report(&report);
            Ok(())
        }
        Commands::History { target } => {
            let config = load(&config_path, &base)?;
            let mut service = ChatService::store_only(&config)?;
            let (_, view) = open_session(&mut service, &target.login, target.thread.as_deref())?;
            print_transcript(&view.transcript);
            Ok(())
        }
        Commands::Files { target } => {
            let config = load(&config_path, &base)?;
            let mut service = ChatService::store_only(&config)?;
            let (_, view) = open_session(&mut service, &target.login, target.thread.as_deref())?;
            print_files(&view.attachments);
            Ok(())
        }
        Commands::Interactive { target } => {
            interactive(&load(&config_path, &base)?, &target).await
        }
    }
}

/// Read the config file and root its relative paths at `base`.
fn load(config_path: &Path, base: &Path) -> Result<GemisConfig, Box<dyn Error>> {
    debug!(path = %config_path.display(), "loading config");
    let path = config_path.to_str().ok_or("config path is not valid UTF-8")?;
    Ok(config::load_config(path)?.rooted_at(base))
}

/// Write a default configuration (unless one exists) and create the store.
fn init(config_path: &Path, base: &Path) -> Result<(), Box<dyn Error>> {
    if config_path.exists() {
        info!(path = %config_path.display(), "config already exists, leaving it alone");
    } else {
        info!(path = %config_path.display(), "creating config file");
        let config = GemisConfig {
            api_key: "CHANGEME".to_string(),
            ..GemisConfig::default()
        };
        config::save_config(&config, config_path)?;
    }

    let config = load(config_path, base)?;
    std::fs::create_dir_all(&config.upload_root)?;
    Database::open(&config.session_db_url)?;
    info!(db = %config.session_db_url, uploads = %config.upload_root.display(), "store ready");
    Ok(())
}

fn users(config: &GemisConfig, command: UserCommand) -> Result<(), Box<dyn Error>> {
    let mut db = Database::open(&config.session_db_url)?;
    match command {
        UserCommand::Add { name, password } => {
            let id = db.create_user(name.trim(), &password)?;
            println!("Created user {name} ({id})");
        }
        UserCommand::List => {
            for user in db.list_users()? {
                println!("{}\t{}\t{}", user.id, user.username, user.created_at);
            }
        }
        UserCommand::Passwd { name, password } => {
            if !db.set_secret(&name, &password)? {
                return Err(format!("No such user: {name}").into());
            }
            println!("Password updated for {name}");
        }
    }
    Ok(())
}

fn messages(config: &GemisConfig, command: MessageCommand) -> Result<(), Box<dyn Error>> {
    let mut db = Database::open(&config.session_db_url)?;
    let (id, found, verb) = match command {
        MessageCommand::Drop { id } => (id, db.delete_message(id)?, "deleted"),
        MessageCommand::Edit { id, content } => (id, db.edit_message(id, &content)?, "updated"),
    };
    if !found {
        return Err(format!("No such message: {id}").into());
    }
    println!("Message {id} {verb}");
    Ok(())
}

fn chats(config: &GemisConfig, command: ChatsCommand) -> Result<(), Box<dyn Error>> {
    let mut service = ChatService::store_only(config)?;
    match command {
        ChatsCommand::List { login } => {
            let (session, view) = open_session(&mut service, &login, None)?;
            print_chats(&view.chats, session.thread_id());
        }
        ChatsCommand::New { login } => {
            let (mut session, _) = open_session(&mut service, &login, None)?;
            let view = service.new_chat(&mut session)?;
            print_view_header(&view);
        }
        ChatsCommand::Rename { target, title } => {
            let (session, _) = open_session(&mut service, &target.login, target.thread.as_deref())?;
            service.rename_current_chat(&session, &title)?;
            print_chats(&service.chats(&session)?, session.thread_id());
        }
        ChatsCommand::Delete { target } => {
            let (mut session, _) =
                open_session(&mut service, &target.login, target.thread.as_deref())?;
            let view = service.delete_current_chat(&mut session)?;
            print_view_header(&view);
        }
    }
    Ok(())
}

/// Log in, select the latest chat, then `thread` if given.
fn open_session(
    service: &mut ChatService,
    login: &Login,
    thread: Option<&str>,
) -> Result<(SessionContext, ChatView), Box<dyn Error>> {
    let mut session = service.login(&login.user, &login.password)?;
    let mut view = service.resume(&mut session)?;
    if let Some(thread) = thread {
        view = service.switch_chat(&mut session, thread)?;
    }
    Ok((session, view))
}

const REPL_HELP: &str = "\
/upload PATH...   upload files now
/attach PATH...   attach files to the next message
/new              start a new chat
/chats            list chats
/switch THREAD    select a chat
/rename TITLE     rename this chat
/delete           delete this chat
/files            list this chat's files
/history          print this chat's transcript
/help             show this list
/quit             leave";

async fn interactive(config: &GemisConfig, target: &ChatTarget) -> Result<(), Box<dyn Error>> {
    let mut service = ChatService::from_config(config)?;
    let (mut session, view) = open_session(&mut service, &target.login, target.thread.as_deref())?;
    println!("{}", view.greeting);
    print_view_header(&view);
    print_transcript(&view.transcript);

    let mut history = view.transcript;
    let mut attached: Vec<PathBuf> = Vec::new();
    let mut out = stdout();

    loop {
        out.execute(SetForegroundColor(Color::Green))?
            .execute(Print("\nYou: "))?
            .execute(ResetColor)?;
        out.flush()?;

        let mut line = String::new();
        if std::io::stdin().read_line(&mut line)? == 0 {
            break;
        }
        let line = line.trim();
        let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
        let rest = rest.trim();

        let outcome: Result<(), SessionError> = match command {
            "" => continue,
            "/quit" | "exit" => break,
            "/help" => {
                println!("{REPL_HELP}");
                Ok(())
            }
            "/attach" => {
                attached.extend(split_paths(rest));
                println!("{} file(s) attached to your next message", attached.len());
                Ok(())
            }
            "/upload" => {
                let turn = Turn {
                    text: String::new(),
                    files: split_paths(rest),
                };
                service
                    .submit_turn(&session, &mut history, turn)
                    .await
                    .map(|report| print_report(&report))
            }
            "/new" => service.new_chat(&mut session).map(|view| {
                print_view_header(&view);
                history = view.transcript;
            }),
            "/chats" => service
                .chats(&session)
                .map(|chats| print_chats(&chats, session.thread_id())),
            "/switch" => service.switch_chat(&mut session, rest).map(|view| {
                print_view_header(&view);
                print_transcript(&view.transcript);
                history = view.transcript;
            }),
            "/rename" => service.rename_current_chat(&session, rest),
            "/delete" => service.delete_current_chat(&mut session).map(|view| {
                print_view_header(&view);
                history = view.transcript;
            }),
            "/files" => service.files(&session).map(|files| print_files(&files)),
            "/history" => service
                .transcript(&session)
                .map(|transcript| print_transcript(&transcript)),
            _ => {
                let turn = Turn {
                    text: line.to_string(),
                    files: std::mem::take(&mut attached),
                };
                service
                    .submit_turn(&session, &mut history, turn)
                    .await
                    .map(|report| print_report(&report))
            }
        };

        match outcome {
            Ok(()) => {}
            Err(SessionError::Expired) => {
                eprintln!("{}", SessionError::Expired);
                break;
            }
            Err(err) => eprintln!("error: {err}"),
        }
    }

    service.logout(&mut session);
    Ok(())
}

fn split_paths(args: &str) -> Vec<PathBuf> {
    args.split_whitespace().map(PathBuf::from).collect()
}

fn print_report(report: &TurnReport) {
    for warning in &report.warnings {
        eprintln!("warning: {warning}");
    }
    if let Some(reply) = &report.reply {
        println!("{reply}");
    }
    if let Some(title) = &report.title {
        println!("(chat renamed to \"{title}\")");
    }
}

fn print_view_header(view: &ChatView) {
    match &view.title {
        Some(title) => println!("== {title} [{}]", view.thread_id),
        None => println!("== [{}] (empty)", view.thread_id),
    }
}

fn print_chats(chats: &[Chat], current: Option<&str>) {
    for chat in chats {
        let marker = if Some(chat.thread_id.as_str()) == current { "*" } else { " " };
        println!("{marker} {}\t{}\t{}", chat.thread_id, chat.title, chat.updated_at);
    }
}

fn print_transcript(transcript: &[ChatMessage]) {
    for message in transcript {
        match message {
            ChatMessage::Text { role, text } => println!("{role}: {text}"),
            ChatMessage::File { role, path } => println!("{role}: [file] {}", path.display()),
        }
    }
}

fn print_files(files: &[Attachment]) {
    for file in files {
        println!(
            "{}\t{}\t{}\t{}",
            file.id,
            file.original_name,
            file.created_at,
            file.stored_path
        );
    }
}
