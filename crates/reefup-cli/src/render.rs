use std::io::IsTerminal;
use std::time::Duration;

use anstyle::{AnsiColor, Style};
use indicatif::{ProgressBar, ProgressStyle};

fn rich_output() -> bool {
    std::io::stdout().is_terminal()
}

fn status_style(status: &str) -> Style {
    let color = match status {
        "failed" => AnsiColor::Red,
        "done" => AnsiColor::Green,
        _ => AnsiColor::Cyan,
    };
    Style::new().bold().fg_color(Some(color.into()))
}

pub fn print_status(status: &str, message: &str) {
    if rich_output() {
        let style = status_style(status);
        println!(
            "{}{status:>8}{} {message}",
            style.render(),
            style.render_reset()
        );
    } else {
        println!("{status:>8} {message}");
    }
}

/// One tick per completed binary stage.
pub fn stage_progress(total: u64) -> ProgressBar {
    if !rich_output() {
        return ProgressBar::hidden();
    }
    let bar = ProgressBar::new(total.max(1));
    if let Ok(style) = ProgressStyle::with_template(
        "{spinner:.cyan.bold} stages [{bar:20.cyan/blue}] {pos}/{len} {elapsed_precise}",
    ) {
        bar.set_style(style.progress_chars("=>-"));
    }
    bar.enable_steady_tick(Duration::from_millis(120));
    bar
}
