// ── ANSI styling ─────────────────────────────────────────────────────────

pub(crate) const RESET: &str = "\x1b[0m";
pub(crate) const BOLD: &str = "\x1b[1m";
pub(crate) const DIM: &str = "\x1b[2m";
pub(crate) const GREEN: &str = "\x1b[32m";
pub(crate) const CYAN: &str = "\x1b[36m";
pub(crate) const RED: &str = "\x1b[31m";

const RULE_WIDTH: usize = 64;

// ── Formatting ───────────────────────────────────────────────────────────

pub(crate) fn format_duration(d: std::time::Duration) -> String {
    let secs = d.as_secs_f64();
    if secs >= 1.0 {
        format!("{secs:.2}s")
    } else if secs >= 0.001 {
        format!("{:.0}ms", secs * 1000.0)
    } else {
        format!("{}us", d.as_micros())
    }
}

/// Group digits in threes: 1234567 -> "1,234,567".
pub(crate) fn format_count(n: u64) -> String {
    let digits = n.to_string();
    let lead = digits.len() % 3;
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i != 0 && (i + 3 - lead) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

// ── UI output ────────────────────────────────────────────────────────────

pub(crate) fn header(title: &str) {
    println!();
    println!("{BOLD}{title}{RESET}");
    println!("{DIM}{}{RESET}", "=".repeat(RULE_WIDTH));
}

pub(crate) fn section(title: &str) {
    println!();
    println!("{CYAN}{BOLD}{title}{RESET}");
    println!("{DIM}{}{RESET}", "-".repeat(RULE_WIDTH));
}

pub(crate) fn kv(label: &str, value: &str) {
    println!("  {DIM}{label:>20}{RESET}  {value}");
}

pub(crate) fn kv_highlight(label: &str, value: &str) {
    println!("  {DIM}{label:>20}{RESET}  {BOLD}{GREEN}{value}{RESET}");
}
