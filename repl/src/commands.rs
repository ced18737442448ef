use super::display::{self, DisplayConfig};
use colored::Colorize;

/// Outcome of a dot command.
#[derive(Debug, PartialEq, Eq)]
pub enum CommandResult {
    Continue,
    Exit,
    Error(String),
    ClearScreen,
    ShowHistory,
    ExecuteFromHistory(usize),
}

/// Handles the shell's own dot commands (`.help`, `.exit`, ...).
pub struct CommandHandler;

impl CommandHandler {
    pub fn new() -> Self {
        CommandHandler
    }

    pub fn handle(&self, line: &str, display_config: &mut DisplayConfig) -> CommandResult {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let Some(command) = parts.first() else {
            return CommandResult::Continue;
        };

        match *command {
            ".help" | ".h" | ".?" => {
                self.show_help();
                CommandResult::Continue
            }
            ".exit" | ".quit" | ".q" => CommandResult::Exit,
            ".clear" | ".cls" => CommandResult::ClearScreen,
            ".timing" | ".time" => {
                display_config.show_timing = !display_config.show_timing;
                display::print_toggle("Command timing", display_config.show_timing);
                CommandResult::Continue
            }
            ".color" | ".colors" => {
                display_config.use_colors = !display_config.use_colors;
                colored::control::set_override(display_config.use_colors);
                display::print_toggle("Colors", display_config.use_colors);
                CommandResult::Continue
            }
            ".history" | ".hist" => match parts.get(1) {
                Some(n) => match n.parse::<usize>() {
                    Ok(n) => CommandResult::ExecuteFromHistory(n),
                    Err(_) => CommandResult::Error(format!("Invalid history number: {}", n)),
                },
                None => CommandResult::ShowHistory,
            },
            _ => CommandResult::Error(format!(
                "Unknown command: {}. Type .help for help.",
                command
            )),
        }
    }

    fn show_help(&self) {
        println!("\n{}", "Ember Shell Commands".bright_cyan().bold());
        println!("{}", "─".repeat(50).bright_black());

        let commands = [
            ("Data:", ""),
            ("SET key value [EX secs]", "Set a key, optionally expiring"),
            ("GET key", "Read a key"),
            ("DEL key", "Delete a key"),
            ("TTL key", "Time left before a key expires"),
            ("KEYS pattern [DESC]", "List keys matching a glob"),
            ("LEN", "Count items"),
            ("FLUSHDB", "Delete every item"),
            ("", ""),
            ("Indexes:", ""),
            ("CREATEINDEX name pattern [type] [DESC]", ""),
            ("", "type: binary|string|int|uint|float|json:<path>"),
            ("DROPINDEX name", "Drop an index"),
            ("INDEXES", "List indexes"),
            ("SCAN [index] [DESC]", "Walk an index, or all keys"),
            ("", ""),
            ("Maintenance:", ""),
            ("SHRINK", "Compact the log file"),
            ("SAVE path / LOAD path", "Write or read a snapshot"),
            ("CONFIG [SYNC policy]", "Show config or set the sync policy"),
            ("", ""),
            ("Shell:", ""),
            (".help, .h, .?", "Show this help message"),
            (".exit, .quit, .q", "Exit the shell"),
            (".clear, .cls", "Clear the screen"),
            (".timing, .time", "Toggle command timing"),
            (".color, .colors", "Toggle colors"),
            (".history [n]", "Show history, or run entry n"),
        ];

        for (cmd, desc) in commands {
            if cmd.is_empty() && desc.is_empty() {
                println!();
            } else if desc.is_empty() {
                if cmd.ends_with(':') {
                    println!("{}", cmd.bright_yellow());
                } else {
                    println!("  {}", cmd.bright_green());
                }
            } else {
                println!("  {:24} {}", cmd.bright_green(), desc.bright_white());
            }
        }
        println!();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_commands() {
        let handler = CommandHandler::new();
        let mut config = DisplayConfig::default();

        assert_eq!(handler.handle(".q", &mut config), CommandResult::Exit);
        assert_eq!(handler.handle(".cls", &mut config), CommandResult::ClearScreen);
        assert_eq!(handler.handle(".history", &mut config), CommandResult::ShowHistory);
        assert_eq!(
            handler.handle(".history 3", &mut config),
            CommandResult::ExecuteFromHistory(3)
        );
        assert!(matches!(
            handler.handle(".history x", &mut config),
            CommandResult::Error(_)
        ));
        assert!(matches!(handler.handle(".nope", &mut config), CommandResult::Error(_)));

        assert!(config.show_timing);
        handler.handle(".timing", &mut config);
        assert!(!config.show_timing);
    }
}
