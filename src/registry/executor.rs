//! Corruption-resilient statement execution
//!
//! A registry statement that fails because the store reports the table as
//! damaged triggers one table repair and one retry. A second damage report,
//! or a repair that does not end with status `OK`, is fatal.

use crate::store::{RepairRow, StoreGateway, StoreResult};
use crate::{Error, Result};

/// Run `op` against the gateway, repairing `table` once if it reports damage
pub fn run_resilient<G, T, F>(gateway: &mut G, table: &str, quoted_table: &str, mut op: F) -> Result<T>
where
    G: StoreGateway + ?Sized,
    F: FnMut(&mut G) -> StoreResult<T>,
{
    match op(gateway) {
        Err(err) if err.is_corruption() => {
            tracing::warn!("Table {} reported as damaged, repairing: {}", table, err);
            repair_table(gateway, table, quoted_table)?;

            op(gateway).map_err(|err| {
                if err.is_corruption() {
                    Error::TableRepair {
                        table: table.to_string(),
                        status: None,
                        messages: vec![format!("still damaged after repair: {}", err)],
                    }
                } else {
                    Error::Store(err)
                }
            })
        }
        other => other.map_err(Error::from),
    }
}

/// Repair the table and check the reported status
pub fn repair_table<G>(gateway: &mut G, table: &str, quoted_table: &str) -> Result<()>
where
    G: StoreGateway + ?Sized,
{
    let rows = gateway.repair_table(quoted_table).map_err(|err| Error::TableRepair {
        table: table.to_string(),
        status: None,
        messages: vec![err.to_string()],
    })?;

    let (status, messages) = summarize(&rows);
    match status {
        Some(status) if status.eq_ignore_ascii_case("OK") => {
            tracing::info!("Table {} repaired", table);
            Ok(())
        }
        status => Err(Error::TableRepair {
            table: table.to_string(),
            status,
            messages,
        }),
    }
}

/// Split a repair report into the final status and the remaining messages
fn summarize(rows: &[RepairRow]) -> (Option<String>, Vec<String>) {
    let mut status = None;
    let mut messages = Vec::new();
    for row in rows {
        if row.msg_type == "status" {
            status = Some(row.msg_text.clone());
        } else {
            messages.push(format!("{}: {}", row.msg_type, row.msg_text));
        }
    }
    (status, messages)
}
