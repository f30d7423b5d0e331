//! Terminal output for local generation: a progress bar and coloured lines.

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

/// Progress of a local generation run.
///
/// Failures are printed above the bar in red; the final summary is green
/// when every variant succeeded.
pub struct BatchProgress {
    pb: ProgressBar,
    green: Style,
    red: Style,
    yellow: Style,
}

impl BatchProgress {
    pub fn start(total: u64) -> Self {
        Self::with_bar(ProgressBar::new(total))
    }

    /// Draws nothing; used when output goes to stdout.
    pub fn hidden(total: u64) -> Self {
        let pb = ProgressBar::hidden();
        pb.set_length(total);
        Self::with_bar(pb)
    }

    fn with_bar(pb: ProgressBar) -> Self {
        let style = ProgressStyle::with_template("{spinner:.cyan} [{bar:30.cyan/blue}] {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> ");
        pb.set_style(style);
        Self {
            pb,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
        }
    }

    pub fn advance(&self, id: u64) {
        self.pb.set_message(format!("#{id}"));
        self.pb.inc(1);
    }

    pub fn failed(&self, id: u64, reason: &str) {
        self.pb
            .println(format!("  {} #{id}: {reason}", self.red.apply_to("✗")));
        self.pb.inc(1);
    }

    #[allow(dead_code)]
    pub fn position(&self) -> u64 {
        self.pb.position()
    }

    pub fn finish(&self, generated: usize, failed: usize) {
        self.pb.finish_and_clear();
        if failed == 0 {
            eprintln!("  {} {generated} variants generated", self.green.apply_to("✓"));
        } else {
            eprintln!(
                "  {} {generated} generated, {failed} failed",
                self.yellow.apply_to("!")
            );
        }
    }

    pub fn ok_line(&self, message: &str) -> String {
        format!("{} {message}", self.green.apply_to("✓"))
    }

    pub fn error_line(&self, message: &str) -> String {
        format!("{} {message}", self.red.apply_to("✗"))
    }
}
