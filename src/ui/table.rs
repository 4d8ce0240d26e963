use sharedlock::LockRecord;
use tabled::{settings::Style, Table, Tabled};

use crate::ui::theme::{paint, Tone};

#[derive(Tabled)]
struct RecordRow {
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Session")]
    session: u64,
    #[tabled(rename = "Confirmed")]
    confirmed: &'static str,
    #[tabled(rename = "TTL")]
    ttl: String,
    #[tabled(rename = "Remaining")]
    remaining: String,
}

impl RecordRow {
    fn new(record: &LockRecord, now: i64) -> Self {
        let remaining = if record.is_live(now) {
            format!("{}s", record.remaining(now))
        } else {
            paint(Tone::Expired, "expired")
        };
        Self {
            name: record.name.clone(),
            session: record.connection_id,
            confirmed: if record.lock_acquired { "yes" } else { "no" },
            ttl: format!("{}s", record.ttl),
            remaining,
        }
    }
}

/// Render registry records, `now` in unix seconds
pub fn records_table(records: &[LockRecord], now: i64) -> String {
    if records.is_empty() {
        return String::new();
    }
    let rows: Vec<RecordRow> = records.iter().map(|r| RecordRow::new(r, now)).collect();
    Table::new(&rows).with(Style::rounded()).to_string()
}
