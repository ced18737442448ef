use ember_core::MEMORY_PATH;
use rustyline::history::{DefaultHistory, History, SearchDirection};
use rustyline::{Editor, Helper, Result};
use std::path::{Path, PathBuf};

/// History shared by every shell on a database without a file.
const MEMORY_HISTORY_FILE: &str = ".ember_history";

/// Widest entry shown before eliding.
const ENTRY_WIDTH: usize = 60;

/// Line history kept beside the database it was typed against.
pub struct HistoryManager {
    history_file: PathBuf,
}

impl HistoryManager {
    pub fn for_database(path: &str) -> Self {
        let history_file = if path == MEMORY_PATH {
            PathBuf::from(MEMORY_HISTORY_FILE)
        } else {
            PathBuf::from(format!("{path}.history"))
        };
        Self { history_file }
    }

    pub fn file(&self) -> &Path {
        &self.history_file
    }

    pub fn load<H: Helper>(&self, editor: &mut Editor<H, DefaultHistory>) {
        // Missing on first run.
        let _ = editor.load_history(&self.history_file);
    }

    pub fn save<H: Helper>(&self, editor: &mut Editor<H, DefaultHistory>) -> Result<()> {
        editor.save_history(&self.history_file)
    }

    /// Print the `limit` most recent entries, numbered for `.history <n>`.
    pub fn display<H: Helper>(&self, editor: &Editor<H, DefaultHistory>, limit: usize) -> Result<()> {
        let history = editor.history();
        if history.is_empty() {
            println!("No history yet");
            return Ok(());
        }

        println!();
        for i in history.len().saturating_sub(limit)..history.len() {
            if let Some(found) = history.get(i, SearchDirection::Forward)? {
                println!("{:4} │ {}", i + 1, elide(&found.entry));
            }
        }
        println!();
        Ok(())
    }

    /// Entry `n`, counting from 1 as `display` numbers them.
    pub fn get_entry<H: Helper>(&self, editor: &Editor<H, DefaultHistory>, n: usize) -> Option<String> {
        let index = n.checked_sub(1)?;
        editor
            .history()
            .get(index, SearchDirection::Forward)
            .ok()
            .flatten()
            .map(|found| found.entry.into_owned())
    }
}

fn elide(entry: &str) -> String {
    if entry.chars().count() <= ENTRY_WIDTH {
        return entry.to_string();
    }
    let head: String = entry.chars().take(ENTRY_WIDTH).collect();
    format!("{head}...")
}
