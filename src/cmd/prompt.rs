//! Terminal prompts: no-echo password entry and y/n confirmation.

use std::io::{BufRead, Write};

use anyhow::{bail, Context, Result};
use crossterm::event::{Event, KeyCode, KeyEventKind, KeyModifiers};
use crossterm::terminal;

/// Read a password from the terminal without echoing it. Characters are
/// collected in raw mode; Enter submits, Backspace edits, Ctrl+C aborts.
pub fn read_password(prompt: &str) -> Result<Vec<u8>> {
    eprint!("{prompt}");
    std::io::stderr().flush().context("flush stderr")?;

    terminal::enable_raw_mode().context("enable raw terminal mode")?;
    let result = read_password_raw();
    let restore = terminal::disable_raw_mode().context("disable raw terminal mode");
    eprintln!();

    restore?;
    result
}

fn read_password_raw() -> Result<Vec<u8>> {
    let mut password = Vec::new();

    loop {
        let Event::Key(key) = crossterm::event::read().context("read terminal event")? else {
            continue;
        };
        if key.kind != KeyEventKind::Press {
            continue;
        }

        match key.code {
            KeyCode::Enter => return Ok(password),
            KeyCode::Backspace => {
                password.pop();
            }
            KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => {
                bail!("operation canceled by user");
            }
            KeyCode::Char(c) => {
                let mut encoded = [0u8; 4];
                password.extend_from_slice(c.encode_utf8(&mut encoded).as_bytes());
            }
            _ => {}
        }
    }
}

/// Ask a y/n question on stderr and read the answer from stdin. Only a
/// plain `y` (case-insensitive) confirms.
pub fn confirm(question: &str) -> Result<bool> {
    eprint!("{question} (y/n) > ");
    std::io::stderr().flush().context("flush stderr")?;

    let mut answer = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut answer)
        .context("read answer")?;

    Ok(answer.trim().eq_ignore_ascii_case("y"))
}
