use comfy_table::modifiers::UTF8_ROUND_CORNERS;
use comfy_table::presets::UTF8_FULL;
use comfy_table::{Attribute, Cell, CellAlignment, Color, ContentArrangement, Table};
use console::style;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};

const MONTH_BAR_TEMPLATE: &str =
    "{spinner:.green} {msg} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} months";

pub enum StyleType {
    Title,
    TotalLabel,
    Success,
    Warning,
    Error,
    Subtle,
}

pub fn style_text(text: &str, style_type: StyleType) -> String {
    let styled = match style_type {
        StyleType::Title => style(text).bold().underlined(),
        StyleType::TotalLabel => style(text).bold(),
        StyleType::Success => style(text).green().bold(),
        StyleType::Warning => style(text).yellow(),
        StyleType::Error => style(text).red(),
        StyleType::Subtle => style(text).dim(),
    };
    styled.to_string()
}

/// Rounded UTF-8 table that wraps to the terminal width.
pub fn new_styled_table() -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table
}

pub fn header_cell(text: &str) -> Cell {
    Cell::new(text)
        .fg(Color::Cyan)
        .add_attribute(Attribute::Bold)
}

/// Right-aligned count; zero is dimmed.
pub fn count_cell(count: usize) -> Cell {
    let cell = Cell::new(count).set_alignment(CellAlignment::Right);
    if count == 0 {
        cell.fg(Color::DarkGrey)
    } else {
        cell
    }
}

/// Green "ok", red "failed", or grey "-" when the step did not run.
pub fn status_cell(status: Option<bool>) -> Cell {
    match status {
        Some(true) => Cell::new("ok").fg(Color::Green),
        Some(false) => Cell::new("failed")
            .fg(Color::Red)
            .add_attribute(Attribute::Bold),
        None => Cell::new("-").fg(Color::DarkGrey),
    }
}

/// Progress over the requested months. A hidden bar still counts, so callers
/// never branch on `visible`.
pub fn month_progress_bar(months: usize, visible: bool) -> ProgressBar {
    let pb = ProgressBar::new(months as u64);
    if !visible {
        pb.set_draw_target(ProgressDrawTarget::hidden());
    }
    pb.set_style(
        ProgressStyle::default_bar()
            .template(MONTH_BAR_TEMPLATE)
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );
    pb
}
