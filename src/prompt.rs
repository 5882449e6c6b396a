use std::io::{self, Write};
use std::time::Duration;

use crossterm::event::{self, Event, KeyCode, KeyEventKind};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};

use crate::cache::Confirm;
use crate::catalog::ProteomeEntry;

/// Asks on the terminal before a proteome download. Any terminal failure
/// counts as "no".
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalConfirm;

impl TerminalConfirm {
    fn ask(entry: &ProteomeEntry) -> io::Result<bool> {
        let mut stderr = io::stderr();
        write!(
            stderr,
            "Reference proteome {} ({}) is not cached. Download it from UniProt? [y/n] ",
            entry.proteome, entry.organism.name
        )?;
        stderr.flush()?;

        enable_raw_mode()?;
        let answer = read_answer();
        disable_raw_mode()?;

        let answer = answer?;
        writeln!(stderr, "{}", if answer { "y" } else { "n" })?;
        Ok(answer)
    }
}

fn read_answer() -> io::Result<bool> {
    loop {
        if !event::poll(Duration::from_millis(100))? {
            continue;
        }
        if let Event::Key(key) = event::read()? {
            if key.kind != KeyEventKind::Press {
                continue;
            }
            match key.code {
                KeyCode::Char('y') | KeyCode::Char('Y') => return Ok(true),
                KeyCode::Char('n') | KeyCode::Char('N') | KeyCode::Esc => return Ok(false),
                _ => {}
            }
        }
    }
}

impl Confirm for TerminalConfirm {
    fn confirm(&self, entry: &ProteomeEntry) -> bool {
        match Self::ask(entry) {
            Ok(answer) => answer,
            Err(err) => {
                tracing::warn!(proteome = %entry.proteome, "confirmation prompt failed: {err}");
                false
            }
        }
    }
}
