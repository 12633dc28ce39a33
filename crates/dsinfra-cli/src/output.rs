use serde::Serialize;

pub fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    println!("{json}");
    Ok(())
}

/// Left-aligned columns separated by two spaces, with a dashed rule under
/// the header. Prints nothing for an empty table.
pub fn print_table(headers: &[&str], rows: &[Vec<String>]) {
    if rows.is_empty() {
        return;
    }

    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.len());
        }
    }

    let line = |cells: &mut dyn Iterator<Item = &str>| {
        let padded: Vec<String> = cells
            .zip(&widths)
            .map(|(cell, &width)| format!("{cell:width$}"))
            .collect();
        println!("{}", padded.join("  ").trim_end());
    };

    let rule: Vec<String> = widths.iter().map(|&w| "-".repeat(w)).collect();
    line(&mut headers.iter().copied());
    line(&mut rule.iter().map(String::as_str));
    for row in rows {
        line(&mut row.iter().map(String::as_str));
    }
}

/// `title (n)` followed by the table, or `title: none`.
pub fn print_section(title: &str, headers: &[&str], rows: &[Vec<String>]) {
    if rows.is_empty() {
        println!("{title}: none");
    } else {
        println!("{title} ({})", rows.len());
        print_table(headers, rows);
    }
    println!();
}
