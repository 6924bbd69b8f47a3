use console::{Emoji, style};

pub static INFO_ICON: Emoji<'_, '_> = Emoji("ℹ️  ", "");
pub static WARN_ICON: Emoji<'_, '_> = Emoji("⚠️  ", "");
pub static ERROR_ICON: Emoji<'_, '_> = Emoji("❌ ", "");
pub static GLOBE: Emoji<'_, '_> = Emoji("🌐 ", "");
pub static GEAR: Emoji<'_, '_> = Emoji("⚙️  ", "");
pub static SPARKLE: Emoji<'_, '_> = Emoji("✨ ", "");

pub fn print_info(msg: &str) {
    println!("{} {}", INFO_ICON, style(msg).blue());
}

pub fn print_warn(msg: &str) {
    println!("{} {}", WARN_ICON, style(msg).yellow());
}

pub fn print_error(msg: &str) {
    eprintln!("{} {}", ERROR_ICON, style(msg).red().bold());
}

pub fn print_banner() {
    println!(
        "\n{} {}\n{}\n",
        SPARKLE,
        style("agentbox").bold().cyan(),
        style("Long-running agent sessions, queued, scheduled and resumed.").dim()
    );
}

pub fn print_goodbye() {
    println!("\n{} {}", SPARKLE, style("agentbox stopped.").bold().cyan());
}

enum GuideLine {
    Command(String, String),
    Status(String, String),
    Link(String, String),
    Text(String),
    Info(String),
    Warn(String),
    Blank,
}

/// A titled block of aligned help or status lines.
pub struct GuideSection {
    title: String,
    lines: Vec<GuideLine>,
}

impl GuideSection {
    pub fn new(title: &str) -> Self {
        Self {
            title: title.to_string(),
            lines: Vec::new(),
        }
    }

    pub fn command(mut self, name: &str, description: &str) -> Self {
        self.lines
            .push(GuideLine::Command(name.to_string(), description.to_string()));
        self
    }

    pub fn status(mut self, label: &str, value: &str) -> Self {
        self.lines
            .push(GuideLine::Status(label.to_string(), value.to_string()));
        self
    }

    pub fn link(mut self, label: &str, url: &str) -> Self {
        self.lines
            .push(GuideLine::Link(label.to_string(), url.to_string()));
        self
    }

    pub fn text(mut self, text: &str) -> Self {
        self.lines.push(GuideLine::Text(text.to_string()));
        self
    }

    pub fn info(mut self, text: &str) -> Self {
        self.lines.push(GuideLine::Info(text.to_string()));
        self
    }

    pub fn warn(mut self, text: &str) -> Self {
        self.lines.push(GuideLine::Warn(text.to_string()));
        self
    }

    pub fn blank(mut self) -> Self {
        self.lines.push(GuideLine::Blank);
        self
    }

    pub fn print(&self) {
        println!("\n {}", style(&self.title).bold().underlined());
        let width = self
            .lines
            .iter()
            .filter_map(|line| match line {
                GuideLine::Command(name, _) => Some(name.len()),
                _ => None,
            })
            .max()
            .unwrap_or(0);
        for line in &self.lines {
            match line {
                GuideLine::Command(name, description) => println!(
                    "   {}  {}",
                    style(format!("{:<width$}", name, width = width)).green(),
                    description
                ),
                GuideLine::Status(label, value) => {
                    println!("  {} {}: {}", GEAR, style(label).bold().cyan(), value)
                }
                GuideLine::Link(label, url) => println!(
                    "  {} {}: {}",
                    GLOBE,
                    style(label).bold(),
                    style(url).underlined().cyan()
                ),
                GuideLine::Text(text) => println!("   {}", text),
                GuideLine::Info(text) => println!("  {} {}", INFO_ICON, style(text).blue()),
                GuideLine::Warn(text) => println!("  {} {}", WARN_ICON, style(text).yellow()),
                GuideLine::Blank => println!(),
            }
        }
    }
}
