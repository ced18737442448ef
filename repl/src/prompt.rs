use super::display::DisplayConfig;
use colored::Colorize;

pub fn generate_prompt(name: &str, command_count: usize, config: &DisplayConfig) -> String {
    if config.use_colors {
        format!(
            "{}{}> ",
            name.bright_cyan().bold(),
            format!("[{}]", command_count).bright_black()
        )
    } else {
        format!("{}[{}]> ", name, command_count)
    }
}
