use indicatif::{ProgressBar, ProgressStyle};
use nu_ansi_term::{Color, Style};
use std::fmt::Display;
use std::io::IsTerminal;
use std::time::{Duration, Instant};

use derivation::engine::{ActionRecord, ActionState};
use derivation::Table;

pub struct Ui {
    palette: Palette,
    paint: bool,
    quiet: bool,
    spinner_style: Option<ProgressStyle>,
}

impl Ui {
    /// `quiet` is set for JSON output: no spinners, no colours.
    pub fn new(quiet: bool) -> Self {
        let paint = std::io::stdout().is_terminal() && !quiet;

        #[cfg(windows)]
        if paint {
            let _ = nu_ansi_term::enable_ansi_support();
        }

        let spinner_style = ProgressStyle::with_template("{prefix} {spinner} {msg}")
            .ok()
            .map(|style| style.tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏"));

        Self {
            palette: if paint {
                Palette::dark()
            } else {
                Palette::plain()
            },
            paint,
            quiet,
            spinner_style,
        }
    }

    pub fn section<'a, I, V>(&self, title: &str, rows: I)
    where
        I: IntoIterator<Item = (&'a str, V)>,
        V: Display,
    {
        let rows: Vec<(String, String)> = rows
            .into_iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();

        if rows.is_empty() {
            return;
        }

        self.heading(title);
        let key_width = rows.iter().map(|(k, _)| k.len()).max().unwrap_or(0);
        for (key, value) in rows {
            if self.paint {
                println!(
                    "  {} {}",
                    self.palette.key.paint(format!("{key:>key_width$}:")),
                    self.palette.value.paint(value)
                );
            } else {
                println!("  {key:>key_width$}: {value}");
            }
        }
    }

    pub fn list<I>(&self, title: &str, entries: I)
    where
        I: IntoIterator<Item = String>,
    {
        let entries: Vec<String> = entries.into_iter().collect();
        if entries.is_empty() {
            return;
        }
        self.heading(title);
        for entry in entries {
            if self.paint {
                println!("  {} {entry}", self.palette.bullet.paint("•"));
            } else {
                println!("  - {entry}");
            }
        }
    }

    /// One line per action, coloured by state.
    pub fn records(&self, title: &str, records: &[ActionRecord]) {
        let lines = records.iter().map(|record| {
            let state = match record.state {
                ActionState::Applied => self.palette.success.paint(record.state.as_str()),
                ActionState::Failed | ActionState::RollbackFailed => {
                    self.palette.warn.paint(record.state.as_str())
                }
                _ => self.palette.value.paint(record.state.as_str()),
            };
            let rows = record
                .rows
                .map(|rows| format!(" rows={rows}"))
                .unwrap_or_default();
            format!(
                "{} ({}) {state}{rows} {}",
                record.id,
                record.kind,
                format_duration(Duration::from_millis(record.elapsed_ms))
            )
        });
        self.list(title, lines);
    }

    /// Columns and the first `limit` rows of a table.
    pub fn table(&self, title: &str, table: &Table, limit: usize) {
        self.heading(title);
        println!("  {}", table.columns().join(" | "));
        for row in table.rows().take(limit) {
            let cells: Vec<String> = table
                .columns()
                .iter()
                .map(|column| row.get(column).map(ToString::to_string).unwrap_or_default())
                .collect();
            println!("  {}", cells.join(" | "));
        }
        if table.len() > limit {
            println!("  … {} more rows", table.len() - limit);
        }
    }

    pub fn success(&self, message: &str) {
        let prefix = if self.paint {
            self.palette.success.paint(SUCCESS_ICON)
        } else {
            Style::new().paint(SUCCESS_ICON)
        };
        println!("{prefix} {message}");
    }

    pub fn warn(&self, message: &str) {
        let prefix = if self.paint {
            self.palette.warn.paint(WARNING_ICON)
        } else {
            Style::new().paint(WARNING_ICON)
        };
        eprintln!("{prefix} {message}");
    }

    pub fn task<'a>(&'a self, label: impl Into<String>) -> TaskGuard<'a> {
        let label = label.into();
        let pb = match (&self.spinner_style, self.quiet) {
            (Some(style), false) => {
                let pb = ProgressBar::new_spinner();
                pb.set_style(style.clone());
                let prefix = if self.paint {
                    self.palette.info.paint(PROGRESS_ICON).to_string()
                } else {
                    PROGRESS_ICON.to_string()
                };
                pb.set_prefix(prefix);
                pb.set_message(label.clone());
                pb.enable_steady_tick(Duration::from_millis(120));
                Some(pb)
            }
            _ => None,
        };
        TaskGuard {
            ui: self,
            label,
            start: Instant::now(),
            finished: false,
            pb,
        }
    }

    fn heading(&self, title: &str) {
        let formatted = format!("{HEADING_ICON} {title}");
        if self.paint {
            println!("{}", self.palette.heading.paint(formatted));
        } else {
            println!("{formatted}");
        }
    }
}

pub struct TaskGuard<'a> {
    ui: &'a Ui,
    label: String,
    start: Instant,
    finished: bool,
    pb: Option<ProgressBar>,
}

impl<'a> TaskGuard<'a> {
    pub fn finish(mut self) -> Duration {
        self.finished = true;
        let elapsed = self.start.elapsed();
        if let Some(pb) = self.pb.take() {
            pb.finish_and_clear();
        }
        elapsed
    }
}

impl<'a> Drop for TaskGuard<'a> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let elapsed = format_duration(self.start.elapsed());
        if let Some(pb) = self.pb.take() {
            pb.abandon_with_message(format!("{} interrupted after {elapsed}", self.label));
        } else if !self.ui.quiet {
            self.ui
                .warn(&format!("{} interrupted after {elapsed}", self.label));
        }
    }
}

pub fn format_duration(duration: Duration) -> String {
    if duration.as_secs_f64() >= 1.0 {
        format!("{:.2}s", duration.as_secs_f64())
    } else {
        format!("{:.0}ms", duration.as_secs_f64() * 1_000.0)
    }
}

struct Palette {
    heading: Style,
    key: Style,
    value: Style,
    bullet: Style,
    info: Style,
    success: Style,
    warn: Style,
}

impl Palette {
    fn dark() -> Self {
        Self {
            heading: Style::new().fg(Color::Purple).bold(),
            key: Style::new().fg(Color::LightBlue).bold(),
            value: Style::new().fg(Color::White),
            bullet: Style::new().fg(Color::LightBlue),
            info: Style::new().fg(Color::LightCyan),
            success: Style::new().fg(Color::LightGreen).bold(),
            warn: Style::new().fg(Color::Yellow).bold(),
        }
    }

    fn plain() -> Self {
        Self {
            heading: Style::new(),
            key: Style::new(),
            value: Style::new(),
            bullet: Style::new(),
            info: Style::new(),
            success: Style::new(),
            warn: Style::new(),
        }
    }
}

const HEADING_ICON: &str = "▸";
const SUCCESS_ICON: &str = "✔";
const WARNING_ICON: &str = "⚠";
const PROGRESS_ICON: &str = "▶";
