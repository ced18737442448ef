use crate::query::Reply;
use colored::Colorize;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct DisplayConfig {
	pub show_timing: bool,
	pub use_colors: bool,
}

impl Default for DisplayConfig {
	fn default() -> Self {
		Self {
			show_timing: true,
			use_colors: true,
		}
	}
}

pub fn print_welcome(path: &str) {
	println!(
		"\n{}",
		"╔═══════════════════════════════════════╗".bright_cyan()
	);
	println!(
		"{}",
		"║          Ember key-value shell        ║"
			.bright_cyan()
			.bold()
	);
	println!(
		"{}",
		"╚═══════════════════════════════════════╝".bright_cyan()
	);
	println!();
	println!("Database: {}", path.bright_white());
	println!(
		"Type {} for help, {} to exit",
		".help".bright_green(),
		".exit".bright_green()
	);
	println!();
}

pub fn print_goodbye(command_count: usize, duration: Duration) {
	println!();
	println!("{}", "─".repeat(40).bright_black());
	println!("   Ran {} commands in {:.1?}", command_count, duration);
	println!();
}

pub fn clear_screen() {
	print!("\x1B[2J\x1B[1;1H");
}

pub fn print_error(msg: &str) {
	println!("{} {}", "✗".bright_red().bold(), msg.bright_red());
}

pub fn print_warning(msg: &str) {
	println!("{} {}", "⚠".bright_yellow(), msg.bright_yellow());
}

pub fn print_info(msg: &str) {
	println!("{} {}", "ℹ".bright_blue(), msg.bright_white());
}

pub fn print_success(msg: &str) {
	println!("{} {}", "✓".bright_green().bold(), msg.bright_green());
}

pub fn print_hint(msg: &str) {
	println!("{} {}", "»".bright_white(), msg.bright_white().dimmed());
}

pub fn print_toggle(feature: &str, enabled: bool) {
	let status = if enabled {
		"ON".bright_green().bold()
	} else {
		"OFF".bright_red()
	};
	println!("{}: {}", feature, status);
}

fn format_duration(duration: Duration) -> String {
	let secs = duration.as_secs();
	if secs >= 1 {
		format!("{}s", secs)
	} else {
		format!("{}ms", duration.as_millis())
	}
}

pub fn print_reply(reply: &Reply, duration: Duration, config: &DisplayConfig) {
	match reply {
		Reply::Ok => print_success("OK"),
		Reply::Value(value) => println!("\"{}\"", value),
		Reply::Replaced(None) => print_success("OK"),
		Reply::Replaced(Some(previous)) => {
			print_success(&format!("OK (replaced \"{}\")", previous));
		}
		Reply::Count(n) => println!("(integer) {}", n),
		Reply::Ttl(None) => println!("{}", "no expiration".bright_black()),
		Reply::Ttl(Some(left)) => println!("{}", format_duration(*left)),
		Reply::List(items) => {
			if items.is_empty() {
				println!("{}", "(empty)".bright_black());
			}
			for (i, item) in items.iter().enumerate() {
				println!("{:4}) {}", i + 1, item);
			}
		}
		Reply::Pairs(pairs) => {
			if pairs.is_empty() {
				println!("{}", "(empty)".bright_black());
			}
			for (i, (key, value)) in pairs.iter().enumerate() {
				println!("{:4}) {} {} {}", i + 1, key.bright_cyan(), "→".bright_black(), value);
			}
		}
		Reply::Text(text) => println!("{}", text),
	}

	if config.show_timing {
		println!(
			"  {} {:.3}ms",
			"Time:".bright_black(),
			duration.as_secs_f64() * 1000.0
		);
	}
}
