use comfy_table::modifiers::UTF8_ROUND_CORNERS;
use comfy_table::presets::UTF8_FULL;
use comfy_table::{Cell, Color as TableColor, ContentArrangement, Table};

use crate::job::When;

/// Table and cell creation helpers
pub fn create_table() -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table
}

pub fn when_cell(when: When) -> Cell {
    let cell = Cell::new(when);
    match when {
        When::OnSuccess | When::Always => cell.fg(TableColor::Green),
        When::Manual | When::Delayed => cell.fg(TableColor::Yellow),
        When::OnFailure => cell.fg(TableColor::Magenta),
        When::Never => cell.fg(TableColor::DarkGrey),
    }
}

pub fn allow_failure_cell(allow_failure: bool) -> Cell {
    if allow_failure {
        Cell::new("true").fg(TableColor::Yellow)
    } else {
        Cell::new("false")
    }
}
