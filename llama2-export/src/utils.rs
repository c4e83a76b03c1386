use std::{
    cell::Cell,
    io::{self, Write},
};

/// Single-line progress bar on stderr, redrawn when the percentage moves.
#[derive(Debug)]
pub(crate) struct ProgressTracker {
    total: usize,
    last_percent: Cell<Option<usize>>,
    label: String,
}

impl ProgressTracker {
    const BAR_WIDTH: usize = 30;
    const DESCRIPTION_WIDTH: usize = 42;

    pub fn new(total: usize, label: &str) -> Self {
        Self { total, last_percent: Cell::new(None), label: label.to_string() }
    }

    pub fn set_current(&self, current: usize, description: &str) {
        let Some(line) = self.render(current, description) else {
            return;
        };

        let mut stderr = io::stderr().lock();
        let _ = write!(stderr, "\r{line}");
        if current >= self.total {
            let _ = writeln!(stderr);
        }
        let _ = stderr.flush();
    }

    /// Returns the line to draw, or `None` when nothing visible changed.
    fn render(&self, current: usize, description: &str) -> Option<String> {
        let total = self.total.max(1);
        let current = current.min(total);
        let percent = current * 100 / total;

        if self.last_percent.get() == Some(percent) && current < total {
            return None;
        }
        self.last_percent.set(Some(percent));

        let filled = current * Self::BAR_WIDTH / total;
        let bar = "█".repeat(filled) + &"░".repeat(Self::BAR_WIDTH - filled);

        Some(format!(
            "{}: [{bar}] {current}/{total} ({percent}%): {}",
            self.label,
            fixed_len(description, Self::DESCRIPTION_WIDTH)
        ))
    }
}

fn fixed_len(description: &str, width: usize) -> String {
    let count = description.chars().count();
    if count > width {
        let mut cut: String = description.chars().take(width.saturating_sub(2)).collect();
        cut.push_str("..");
        cut
    } else {
        format!("{description:width$}")
    }
}
