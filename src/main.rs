use chrono::{Local, Utc};
use clap::{Parser, Subcommand};
use colored::Colorize;
use eyre::{Context, Result, eyre};
use std::fs;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use todostore::{Config, ListFailurePolicy, RecordStore, Todo, TodoService, TodoStats, record, transfer};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "todostore")]
#[command(about = "TodoStore CLI - Local todo list backed by SQLite")]
#[command(version)]
struct Cli {
    /// Store directory (default: from the config file, else the user data directory)
    #[arg(short, long)]
    store_dir: Option<PathBuf>,

    /// Config file (default: <config dir>/todostore/config.yaml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Fail when the list cannot be read instead of showing it empty
    #[arg(long)]
    strict_list: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check that the store can be opened
    Status,

    /// Add a todo
    Add { text: String },

    /// Show all todos, oldest first
    List {
        /// Print as JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Mark a todo done, or not done
    Toggle { id: i64 },

    /// Delete a todo
    Delete { id: i64 },

    /// Delete every todo
    Clear {
        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },

    /// Write all todos to a JSON backup
    Export {
        /// Output file, or "-" for stdout (default: todos-backup-<date>.json)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Replace all todos with the contents of a JSON backup
    Import { file: PathBuf },
}

fn main() -> Result<()> {
    // Logs go to stderr so exports on stdout stay clean
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default()?,
    };
    let store_dir = match cli.store_dir {
        Some(dir) => dir,
        None => config.store_dir()?,
    };
    let policy = if cli.strict_list {
        ListFailurePolicy::Strict
    } else {
        config.list_failures
    };

    let mut service = TodoService::new(RecordStore::new(&store_dir), policy);
    let result = run(&mut service, &store_dir, cli.command);
    service.close();
    result
}

fn run(service: &mut TodoService, store_dir: &Path, command: Commands) -> Result<()> {
    match command {
        Commands::Status => {
            if !service.is_database_available() {
                return Err(eyre!("Database not available at {}", store_dir.display()));
            }
            println!("{} Store available at {}", "✓".green(), store_dir.display());
        }
        Commands::Add { text } => {
            let text = record::check_text(&text).map_err(|e| eyre!(e))?;
            let (id, todos) = service.refresh_after(|s| s.add_todo(text))?;
            println!("Added todo #{}", id);
            print_todos(&todos);
        }
        Commands::List { json } => {
            let todos = service.get_all_todos()?;
            if json {
                println!("{}", transfer::render_export(&todos)?);
            } else {
                print_todos(&todos);
            }
        }
        Commands::Toggle { id } => {
            let (flag, todos) = service.refresh_after(|s| s.toggle_todo(id))?;
            match flag {
                Some(true) => println!("Completed todo #{}", id),
                Some(false) => println!("Reopened todo #{}", id),
                None => println!("No todo #{}", id),
            }
            print_todos(&todos);
        }
        Commands::Delete { id } => {
            let (deleted, todos) = service.refresh_after(|s| s.delete_todo(id))?;
            if deleted {
                println!("Deleted todo #{}", id);
            } else {
                println!("No todo #{}", id);
            }
            print_todos(&todos);
        }
        Commands::Clear { yes } => {
            if !yes && !confirm("Are you sure you want to delete all todos? This action cannot be undone.")? {
                println!("Nothing deleted");
                return Ok(());
            }
            let (removed, todos) = service.refresh_after(|s| s.clear_all_todos())?;
            println!("Deleted {} todos", removed);
            print_todos(&todos);
        }
        Commands::Export { output } => {
            let json = service.export_todos()?;
            match output {
                Some(path) if path.as_os_str() == "-" => println!("{}", json),
                other => {
                    let path =
                        other.unwrap_or_else(|| PathBuf::from(transfer::backup_file_name(Utc::now().date_naive())));
                    fs::write(&path, json).with_context(|| format!("Failed to write export to {:?}", path))?;
                    println!("Exported todos to {}", path.display());
                }
            }
        }
        Commands::Import { file } => {
            let json = fs::read_to_string(&file).with_context(|| format!("Failed to read {:?}", file))?;
            let (count, todos) = service.refresh_after(|s| s.import_todos(&json))?;
            println!("Imported {} todos", count);
            print_todos(&todos);
        }
    }

    Ok(())
}

fn print_todos(todos: &[Todo]) {
    if todos.is_empty() {
        println!("{}", "No todos yet".dimmed());
        return;
    }

    for todo in todos {
        let id = format!("#{}", todo.id);
        let created = todo.created_at.with_timezone(&Local).format("%b %-d, %H:%M").to_string();
        if todo.completed {
            println!(
                "{} {:>5}  {}  {}",
                "[x]".green(),
                id,
                todo.text.as_str().strikethrough().dimmed(),
                created.dimmed()
            );
        } else {
            println!("[ ] {:>5}  {}  {}", id, todo.text, created.dimmed());
        }
    }

    println!("{}", TodoStats::from_todos(todos).to_string().bold());
}

fn confirm(prompt: &str) -> Result<bool> {
    print!("{} [y/N] ", prompt);
    io::stdout().flush()?;

    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;
    Ok(matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"))
}
