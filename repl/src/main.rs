//! Ember interactive shell

mod commands;
pub mod display;
mod history;
mod prompt;
mod query;

use anyhow::Context;
use clap::Parser;
use ember_core::{Config as DbConfig, Db, MEMORY_PATH, SyncPolicy};
use rustyline::error::ReadlineError;
use rustyline::history::DefaultHistory;
use rustyline::{Config, Editor};
use std::time::Instant;
use tracing::debug;
use tracing_subscriber::EnvFilter;

pub use self::commands::{CommandHandler, CommandResult};
pub use self::display::DisplayConfig;
use self::query::Query;

/// Entries listed by `.history`.
const HISTORY_SHOWN: usize = 20;

/// Interactive shell for an Ember database.
#[derive(Parser, Debug)]
#[command(name = "ember", version, about)]
struct Args {
	/// Database file, or ":memory:" for a database without a file.
	#[arg(default_value = MEMORY_PATH)]
	path: String,

	/// Fsync policy: never, everysecond or always.
	#[arg(long, value_name = "POLICY")]
	sync: Option<SyncPolicy>,

	/// Never shrink the log in the background.
	#[arg(long)]
	no_auto_shrink: bool,

	/// Run a command and exit. May be repeated.
	#[arg(short = 'c', long = "command", value_name = "COMMAND")]
	commands: Vec<String>,

	/// Suppress the banner and timing output.
	#[arg(short, long)]
	quiet: bool,
}

fn get_env_filter() -> EnvFilter {
	EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
}

pub struct Repl {
	editor: Editor<(), DefaultHistory>,
	db: Db,
	path: String,
	command_handler: CommandHandler,
	display_config: DisplayConfig,
	history: history::HistoryManager,
	command_count: usize,
	start_time: Instant,
}

impl Repl {
	pub fn new(db: Db, path: String, quiet: bool) -> rustyline::Result<Self> {
		let config = Config::builder()
			.history_ignore_space(true)
			.edit_mode(rustyline::EditMode::Emacs)
			.build();
		let mut editor = Editor::<(), DefaultHistory>::with_config(config)?;

		let history = history::HistoryManager::for_database(&path);
		history.load(&mut editor);

		let display_config = DisplayConfig {
			show_timing: !quiet,
			..DisplayConfig::default()
		};

		Ok(Self {
			editor,
			db,
			path,
			command_handler: CommandHandler::new(),
			display_config,
			history,
			command_count: 0,
			start_time: Instant::now(),
		})
	}

	pub fn run_interactive(&mut self, quiet: bool) -> rustyline::Result<()> {
		if !quiet {
			display::print_welcome(&self.path);
			if self.path == MEMORY_PATH {
				display::print_info("In-memory database; nothing is written to disk");
			}
		}

		loop {
			let prompt_str =
				prompt::generate_prompt("ember", self.command_count, &self.display_config);

			match self.editor.readline(&prompt_str) {
				Ok(line) => {
					if !self.handle_line(line)? {
						break;
					}
				}
				Err(ReadlineError::Interrupted) => {
					display::print_hint("Use .exit or Ctrl+D to quit");
				}
				Err(ReadlineError::Eof) => {
					println!();
					display::print_goodbye(self.command_count, self.start_time.elapsed());
					break;
				}
				Err(err) => {
					display::print_error(&format!("Readline error: {:?}", err));
					break;
				}
			}
		}

		self.history.save(&mut self.editor)
	}

	/// Run commands non-interactively. Returns whether all of them succeeded.
	pub fn run_commands(&mut self, commands: &[String]) -> bool {
		let mut ok = true;
		for command in commands {
			let trimmed = command.trim();
			if trimmed.starts_with('.') {
				match self.command_handler.handle(trimmed, &mut self.display_config) {
					CommandResult::Exit => break,
					CommandResult::Error(msg) => {
						display::print_error(&msg);
						ok = false;
					}
					_ => {}
				}
			} else {
				ok &= self.execute_query(trimmed);
			}
		}
		ok
	}

	fn handle_line(&mut self, line: String) -> rustyline::Result<bool> {
		let trimmed = line.trim();
		if trimmed.is_empty() {
			return Ok(true);
		}
		self.editor.add_history_entry(trimmed)?;

		if trimmed.starts_with('.') {
			return self.handle_command(trimmed);
		}
		self.execute_query(trimmed);
		Ok(true)
	}

	fn handle_command(&mut self, line: &str) -> rustyline::Result<bool> {
		match self.command_handler.handle(line, &mut self.display_config) {
			CommandResult::Continue => Ok(true),
			CommandResult::Exit => {
				display::print_goodbye(self.command_count, self.start_time.elapsed());
				Ok(false)
			}
			CommandResult::Error(msg) => {
				display::print_error(&msg);
				Ok(true)
			}
			CommandResult::ClearScreen => {
				display::clear_screen();
				display::print_welcome(&self.path);
				Ok(true)
			}
			CommandResult::ShowHistory => {
				self.history.display(&self.editor, HISTORY_SHOWN)?;
				Ok(true)
			}
			CommandResult::ExecuteFromHistory(n) => {
				match self.history.get_entry(&self.editor, n) {
					Some(entry) if entry.trim_start().starts_with('.') => {
						display::print_warning("History entry is a shell command; not re-running it");
					}
					Some(entry) => {
						self.execute_query(&entry);
					}
					None => display::print_error(&format!("History entry {} not found", n)),
				}
				Ok(true)
			}
		}
	}

	fn execute_query(&mut self, line: &str) -> bool {
		let query = match Query::parse(line) {
			Ok(query) => query,
			Err(msg) => {
				display::print_error(&msg);
				return false;
			}
		};

		self.command_count += 1;
		let start = Instant::now();
		let result = query.execute(&self.db);
		let duration = start.elapsed();

		match result {
			Ok(reply) => {
				display::print_reply(&reply, duration, &self.display_config);
				true
			}
			Err(e) => {
				display::print_error(&query::describe(&e));
				if e.is_retryable() {
					display::print_hint("The database is busy; try again shortly");
				}
				false
			}
		}
	}

	pub fn close(self) -> ember_core::EmberResult<()> {
		self.db.close()
	}
}

fn main() -> anyhow::Result<()> {
	let args = Args::parse();

	tracing_subscriber::fmt()
		.with_env_filter(get_env_filter())
		.with_writer(std::io::stderr)
		.with_target(false)
		.compact()
		.init();

	let mut config = DbConfig::default();
	if let Some(policy) = args.sync {
		config.sync_policy = policy;
	}
	config.auto_shrink_disabled = args.no_auto_shrink;

	let db = Db::open_with_config(&args.path, config)
		.with_context(|| format!("failed to open database at {}", args.path))?;
	let mut repl = Repl::new(db, args.path.clone(), args.quiet)?;

	if args.commands.is_empty() {
		repl.run_interactive(args.quiet)?;
		repl.close()?;
		return Ok(());
	}

	debug!(count = args.commands.len(), "running commands from arguments");
	let ok = repl.run_commands(&args.commands);
	repl.close()?;
	if !ok {
		std::process::exit(1);
	}
	Ok(())
}
