use console::{Emoji, style};

use crate::core::orchestrator::{DrainSummary, JobPhase};

pub static SUCCESS_ICON: Emoji<'_, '_> = Emoji("✅ ", "");
pub static INFO_ICON: Emoji<'_, '_> = Emoji("ℹ️  ", "");
pub static WARN_ICON: Emoji<'_, '_> = Emoji("⚠️  ", "");
pub static ERROR_ICON: Emoji<'_, '_> = Emoji("❌ ", "");
pub static GLOBE: Emoji<'_, '_> = Emoji("🌐 ", "");
pub static GEAR: Emoji<'_, '_> = Emoji("⚙️  ", "");

pub fn print_success(msg: &str) {
    println!("{} {}", SUCCESS_ICON, style(msg).green());
}

pub fn print_info(msg: &str) {
    println!("{} {}", INFO_ICON, style(msg).blue());
}

pub fn print_warn(msg: &str) {
    println!("{} {}", WARN_ICON, style(msg).yellow());
}

pub fn print_error(msg: &str) {
    eprintln!("{} {}", ERROR_ICON, style(msg).red().bold());
}

pub fn print_status(label: &str, msg: &str) {
    println!("  {} {}: {}", GEAR, style(label).bold().cyan(), msg);
}

pub fn print_link(label: &str, url: &str) {
    println!(
        "  {} {}: {}",
        GLOBE,
        style(label).bold(),
        style(url).underlined().cyan()
    );
}

pub fn print_banner() {
    println!(
        "\n{} {}\n{}\n",
        style("analysisd").bold().cyan(),
        style(env!("CARGO_PKG_VERSION")).dim(),
        style("Queue-driven company analysis against an external AI service.").dim()
    );
}

/// Titled list of `command  description` rows for the help screen.
pub struct GuideSection {
    title: &'static str,
    rows: Vec<(&'static str, &'static str)>,
}

impl GuideSection {
    pub fn new(title: &'static str) -> Self {
        Self {
            title,
            rows: Vec::new(),
        }
    }

    pub fn command(mut self, name: &'static str, about: &'static str) -> Self {
        self.rows.push((name, about));
        self
    }

    pub fn print(&self) {
        println!(" {}", style(self.title).bold().underlined());
        let width = self.rows.iter().map(|(n, _)| n.len()).max().unwrap_or(0);
        for (name, about) in &self.rows {
            println!(
                "   {:width$}  {}",
                style(name).green(),
                about,
                width = width
            );
        }
        println!();
    }
}

pub fn print_drain_summary(summary: &DrainSummary) {
    if summary.processed == 0 {
        print_info("Queue is empty, nothing to analyze.");
        return;
    }
    print_success(&summary.describe());
    for outcome in &summary.outcomes {
        let label = match outcome.status {
            JobPhase::Completed => style(outcome.status.as_str()).green(),
            JobPhase::Deferred | JobPhase::Stopped => style(outcome.status.as_str()).yellow(),
            _ => style(outcome.status.as_str()).red(),
        };
        let detail = outcome
            .error
            .as_deref()
            .map(|e| format!(" ({})", e))
            .unwrap_or_default();
        println!(
            "   {} {} steps={}{}",
            style(&outcome.company_id).bold(),
            label,
            outcome.completed_steps.len(),
            detail
        );
    }
}

pub fn print_goodbye() {
    println!("\n{}", style("analysisd stopped.").bold().cyan());
}
