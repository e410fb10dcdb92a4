//! Boardkeep CLI - project, epic and task board with pluggable storage.

use boardkeep::auth::master_key_from_env;
use boardkeep::config::{self, SECRET_ENV};
use boardkeep::credential::{decrypt, encrypt};
use boardkeep::{
    Backend, Client, Config, Daemon, DaemonConfig, KeyRing, KeyScope, ProjectPatch, Store, TaskFields, TaskPatch,
    TaskStatus, Visibility, is_daemon_running,
};
use clap::Parser;
use colored::*;
use eyre::{Context, Result, bail};
use log::info;
use std::fs;
use std::path::{Path, PathBuf};

mod cli;

use cli::{Cli, Command, EpicCommand, KeyCommand, ProjectCommand, TaskCommand};

fn setup_logging() -> Result<()> {
    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("boardkeep")
        .join("logs");

    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    let log_file = log_dir.join("boardkeep.log");

    let target = Box::new(
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file)
            .context("Failed to open log file")?,
    );

    env_logger::Builder::from_default_env()
        .target(env_logger::Target::Pipe(target))
        .init();

    info!("Logging initialized, writing to: {}", log_file.display());
    Ok(())
}

fn get_board_dir(cli: &Cli) -> PathBuf {
    cli.dir
        .clone()
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")))
}

fn format_status(status: &TaskStatus) -> ColoredString {
    match status {
        TaskStatus::Todo => "todo".normal(),
        TaskStatus::InProgress => "in_progress".yellow(),
        TaskStatus::Review => "review".magenta(),
        TaskStatus::Done => "done".green(),
    }
}

fn format_visibility(visibility: &Visibility) -> ColoredString {
    match visibility {
        Visibility::Public => "public".green(),
        Visibility::Private => "private".red(),
    }
}

async fn open_store(root: &Path) -> Result<Store<Backend>> {
    let config = Config::load(root).context("Failed to load config")?;
    let backend = config.open_backend(root)?;
    Store::open(backend).await.context("Failed to open store")
}

fn secret() -> Result<String> {
    match std::env::var(SECRET_ENV) {
        Ok(secret) if !secret.is_empty() => Ok(secret),
        _ => bail!("{} must be set", SECRET_ENV),
    }
}

async fn run(cli: Cli) -> Result<()> {
    let board_dir = get_board_dir(&cli);

    match cli.command {
        Command::Init { backend, database_url } => {
            let mut config = Config::load_file(&board_dir)?;
            config.backend = backend.into();
            if database_url.is_some() {
                config.database_url = database_url;
            }
            config.save(&board_dir)?;
            open_store(&board_dir).await.context("Failed to initialize board")?;
            println!(
                "{} Initialized {} board in {}",
                "✓".green(),
                config.backend,
                board_dir.display()
            );
        }

        Command::Project(cmd) => {
            let store = open_store(&board_dir).await?;
            match cmd {
                ProjectCommand::Create {
                    name,
                    description,
                    private,
                } => {
                    let visibility = private.then_some(Visibility::Private);
                    let project = store.create_project(&name, description.as_deref(), visibility).await?;
                    println!("{} Created: {} {}", "✓".green(), project.id.cyan(), project.name);
                }

                ProjectCommand::List => {
                    let projects = store.get_projects();
                    if projects.is_empty() {
                        println!("{}", "No projects found".dimmed());
                    }
                    for project in projects {
                        println!(
                            "{} {} {}",
                            project.id.cyan(),
                            format_visibility(&project.visibility),
                            project.name
                        );
                    }
                }

                ProjectCommand::Update {
                    id,
                    name,
                    description,
                    visibility,
                } => {
                    let patch = ProjectPatch {
                        name,
                        description: description.map(Some),
                        visibility,
                    };
                    match store.update_project(&id, &patch).await? {
                        Some(project) => println!("{} Updated: {} {}", "✓".green(), project.id.cyan(), project.name),
                        None => bail!("Project not found: {}", id),
                    }
                }

                ProjectCommand::Delete { id } => {
                    if store.delete_project(&id).await? {
                        println!("{} Deleted: {}", "✓".green(), id.cyan());
                    } else {
                        println!("{} No such project: {}", "✗".red(), id);
                    }
                }
            }
        }

        Command::Epic(cmd) => {
            let store = open_store(&board_dir).await?;
            match cmd {
                EpicCommand::Create {
                    project_id,
                    title,
                    description,
                } => {
                    let epic = store.create_epic(&project_id, &title, description.as_deref()).await?;
                    println!("{} Created: {} {}", "✓".green(), epic.id.cyan(), epic.title);
                }

                EpicCommand::List { project_id } => {
                    let epics = store.get_epics(&project_id);
                    if epics.is_empty() {
                        println!("{}", "No epics found".dimmed());
                    }
                    for epic in epics {
                        println!("{} {}", epic.id.cyan(), epic.title);
                    }
                }

                EpicCommand::Delete { id } => {
                    if store.delete_epic(&id).await? {
                        println!("{} Deleted: {}", "✓".green(), id.cyan());
                    } else {
                        println!("{} No such epic: {}", "✗".red(), id);
                    }
                }
            }
        }

        Command::Task(cmd) => {
            let store = open_store(&board_dir).await?;
            match cmd {
                TaskCommand::Create {
                    project_id,
                    title,
                    epic,
                    priority,
                    notes,
                    depends_on,
                } => {
                    let fields = TaskFields {
                        priority,
                        notes,
                        depends_on,
                        ..TaskFields::default()
                    };
                    let task = store.create_task(&project_id, &title, epic.as_deref(), fields).await?;
                    println!("{} Created: {} {}", "✓".green(), task.id.cyan(), task.title);
                }

                TaskCommand::List { project_id } => {
                    let tasks = store.get_tasks(&project_id);
                    if tasks.is_empty() {
                        println!("{}", "No tasks found".dimmed());
                    }
                    for task in &tasks {
                        let blocked = if task.is_blocked(&tasks) {
                            " blocked".red().to_string()
                        } else {
                            String::new()
                        };
                        println!(
                            "{} {} P{} {}{}",
                            format_status(&task.status),
                            task.id.cyan(),
                            task.priority,
                            task.title,
                            blocked
                        );
                    }
                }

                TaskCommand::Get { id } => match store.get_task(&id) {
                    Some(task) => {
                        println!("{}: {}", "ID".bold(), task.id.cyan());
                        println!("{}: {}", "Title".bold(), task.title);
                        println!("{}: {}", "Project".bold(), task.project_id);
                        if let Some(epic_id) = &task.epic_id {
                            println!("{}: {}", "Epic".bold(), epic_id);
                        }
                        println!("{}: {}", "Status".bold(), format_status(&task.status));
                        println!("{}: P{}", "Priority".bold(), task.priority);
                        if let Some(notes) = &task.notes {
                            println!("{}: {}", "Notes".bold(), notes);
                        }
                        if !task.depends_on.is_empty() {
                            println!("{}: {}", "Depends on".bold(), task.depends_on.join(", "));
                        }
                        println!("{}: {}", "Created".bold(), task.created_at);
                        println!("{}: {}", "Updated".bold(), task.updated_at);
                    }
                    None => {
                        eprintln!("{} Task not found: {}", "✗".red(), id);
                        std::process::exit(1);
                    }
                },

                TaskCommand::Status { id, status } => match store.update_task(&id, &TaskPatch::status(status)).await? {
                    Some(task) => println!("{} {} {}", format_status(&task.status), task.id.cyan(), task.title),
                    None => bail!("Task not found: {}", id),
                },

                TaskCommand::Delete { id } => {
                    if store.delete_task(&id).await? {
                        println!("{} Deleted: {}", "✓".green(), id.cyan());
                    } else {
                        println!("{} No such task: {}", "✗".red(), id);
                    }
                }
            }
        }

        Command::Key(cmd) => {
            let mut keys = KeyRing::open(config::keys_path(&board_dir))?;
            match cmd {
                KeyCommand::Create { name, projects } => {
                    let scope = if projects.is_empty() {
                        KeyScope::Server
                    } else {
                        KeyScope::Project { project_ids: projects }
                    };
                    let issued = keys.issue(name.as_deref(), scope)?;
                    println!("{} Issued: {}", "✓".green(), issued.record.id.cyan());
                    println!("  {}", issued.key.bold());
                    println!("  {}", "Store this key now; it cannot be shown again.".dimmed());
                }

                KeyCommand::List => {
                    if keys.is_empty() {
                        println!("{}", "No keys issued".dimmed());
                    }
                    for key in keys.list() {
                        let scope = match &key.scope {
                            KeyScope::Server => "server".to_string(),
                            KeyScope::Project { project_ids } => format!("project [{}]", project_ids.join(", ")),
                        };
                        println!(
                            "{} {}… {} {}",
                            key.id.cyan(),
                            key.prefix,
                            scope,
                            key.name.as_deref().unwrap_or("").dimmed()
                        );
                    }
                }

                KeyCommand::Revoke { id } => {
                    if keys.revoke(&id)? {
                        println!("{} Revoked: {}", "✓".green(), id.cyan());
                    } else {
                        println!("{} No such key: {}", "✗".red(), id);
                    }
                }
            }
        }

        Command::Encrypt { value } => {
            println!("{}{}", config::ENCRYPTED_PREFIX, encrypt(&value, &secret()?)?);
        }

        Command::Decrypt { ciphertext } => {
            let ciphertext = ciphertext.strip_prefix(config::ENCRYPTED_PREFIX).unwrap_or(&ciphertext);
            match decrypt(ciphertext, &secret()?) {
                Some(value) => println!("{}", value),
                None => bail!("Decryption failed: wrong secret or corrupted value"),
            }
        }

        Command::Daemon => {
            println!("{} Starting daemon for {}", "→".blue(), board_dir.display());

            let daemon = Daemon::open(DaemonConfig::new(&board_dir))
                .await
                .context("Failed to create daemon")?;
            daemon.run().await.context("Daemon error")?;
        }

        Command::DaemonStop => {
            if !is_daemon_running(&board_dir) {
                println!("{} Daemon is not running", "✗".red());
                std::process::exit(1);
            }

            let mut client = Client::connect(&board_dir, false)
                .context("Failed to connect to daemon")?
                .with_token(master_key_from_env());
            client.shutdown().context("Failed to shutdown daemon")?;
            println!("{} Daemon stopped", "✓".green());
        }

        Command::DaemonStatus => {
            if is_daemon_running(&board_dir) {
                println!("{} Daemon is running", "✓".green());

                if let Ok(mut client) = Client::connect(&board_dir, false)
                    && client.ping().is_ok()
                {
                    println!("  {} Responding to requests", "✓".green());
                }
            } else {
                println!("{} Daemon is not running", "✗".red());
            }
        }
    }

    Ok(())
}

fn main() -> Result<()> {
    setup_logging().context("Failed to setup logging")?;

    let cli = Cli::parse();
    info!("Command: {:?}", std::env::args().collect::<Vec<_>>());

    let rt = tokio::runtime::Runtime::new().context("Failed to create runtime")?;
    if let Err(e) = rt.block_on(run(cli)) {
        eprintln!("{} {:#}", "Error:".red().bold(), e);
        std::process::exit(1);
    }

    Ok(())
}
