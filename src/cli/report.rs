use super::ui;
use crate::pipeline::RunReport;
use comfy_table::Cell;

impl RunReport {
    pub fn display_as_table(&self) -> String {
        let mut output = String::new();

        if let Some(collect) = &self.collect {
            let range = match (collect.months.first(), collect.months.last()) {
                (Some(first), Some(last)) => format!("{first} .. {last}"),
                _ => "none".to_string(),
            };
            output.push_str(&format!(
                "Months: {} ({})\n",
                ui::style_text(&range, ui::StyleType::TotalLabel),
                collect.months.len()
            ));
            for (source, rows) in &collect.accepted {
                output.push_str(&format!("Rows read from {source}: {rows}\n"));
            }
        }

        if !self.written.is_empty() || !self.uploaded.is_empty() || !self.load_failures.is_empty() {
            let mut table = ui::new_styled_table();
            table.set_header(vec![
                ui::header_cell("Table"),
                ui::header_cell("Layer"),
                ui::header_cell("Rows"),
                ui::header_cell("Rejected"),
                ui::header_cell("Upload"),
            ]);

            let mut names: Vec<_> = self.written.iter().map(|w| w.table).collect();
            names.extend(self.uploaded.iter().copied());
            names.extend(self.load_failures.iter().map(|f| f.table));
            names.sort();
            names.dedup();

            for name in names {
                let rows = self
                    .written
                    .iter()
                    .find(|w| w.table == name)
                    .map_or(Cell::new("-"), |w| ui::count_cell(w.rows));
                let rejected = self
                    .collect
                    .as_ref()
                    .and_then(|c| c.rejections.get(&name).copied())
                    .unwrap_or_default();
                let upload = if self.uploaded.contains(&name) {
                    Some(true)
                } else if self.load_failures.iter().any(|f| f.table == name) {
                    Some(false)
                } else {
                    None
                };
                table.add_row(vec![
                    Cell::new(name.as_str()),
                    Cell::new(name.layer().dir_name()),
                    rows,
                    ui::count_cell(rejected),
                    ui::status_cell(upload),
                ]);
            }
            output.push('\n');
            output.push_str(&table.to_string());
            output.push('\n');
        }

        if let Some(collect) = &self.collect
            && !collect.unavailable.is_empty()
        {
            output.push_str(&format!(
                "\n{}\n",
                ui::style_text("Unavailable sources", ui::StyleType::Title)
            ));
            let mut table = ui::new_styled_table();
            table.set_header(vec![
                ui::header_cell("Source"),
                ui::header_cell("Month"),
                ui::header_cell("Location"),
                ui::header_cell("Reason"),
            ]);
            for missing in &collect.unavailable {
                table.add_row(vec![
                    Cell::new(missing.source),
                    Cell::new(missing.month),
                    Cell::new(&missing.location),
                    Cell::new(&missing.reason),
                ]);
            }
            output.push_str(&table.to_string());
            output.push('\n');
        }

        for failure in &self.load_failures {
            output.push_str(&format!(
                "\n{} {}: {}",
                ui::style_text("Load failed", ui::StyleType::Error),
                failure.table,
                ui::style_text(&failure.reason, ui::StyleType::Subtle)
            ));
        }

        if let Some(export) = &self.frontend {
            output.push_str(&format!(
                "\nFrontend payload: {} funds in {}\n",
                export.funds,
                export.index.display()
            ));
        }

        let status = if self.has_failures() {
            ui::style_text("Finished with load failures", ui::StyleType::Error)
        } else if self
            .collect
            .as_ref()
            .is_some_and(|c| c.total_rejections() > 0 || !c.unavailable.is_empty())
        {
            ui::style_text("Finished with warnings", ui::StyleType::Warning)
        } else {
            ui::style_text("Finished", ui::StyleType::Success)
        };
        output.push_str(&format!("\n{status}"));
        output
    }
}
