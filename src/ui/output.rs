use std::fmt::Display;
use std::path::Path;
use std::time::Duration;

use super::theme::{paint, Tone};

const LOCK: &str = "🔒";
const UNLOCK: &str = "🔓";
const CHECK: &str = "✅";
const CROSS: &str = "❌";
const WARN: &str = "⚠️";
const DATABASE: &str = "🗄️";
const CLOCK: &str = "⏱️";
const WRENCH: &str = "🔧";
const GEAR: &str = "⚙️";

fn line(icon: &str, label: &str, value: &str) {
    println!("{} {}: {}", icon, paint(Tone::Faint, label), value);
}

fn done(text: &str) {
    println!("{} {}", CHECK, paint(Tone::Good, text));
}

pub fn config_written(path: &Path) {
    line(GEAR, "Config", &path.display().to_string());
}

pub fn config_missing(path: &Path) {
    eprintln!(
        "{} {}",
        WARN,
        paint(
            Tone::Caution,
            &format!("No config at {}, using the default sqlite store", path.display())
        )
    );
}

pub fn initialized(table: &str, database: &str) {
    line(DATABASE, "Registry", &format!("{} ({})", table, database));
    done("Initialized");
}

pub fn registry_heading(count: usize, table: &str) {
    println!(
        "{} {}",
        LOCK,
        paint(Tone::Heading, &format!("{} lock(s) in {}", count, table))
    );
}

pub fn registry_empty(table: &str) {
    line(DATABASE, table, "no locks held");
}

pub fn repairing(table: &str) {
    line(WRENCH, "Repairing", table);
}

pub fn repaired() {
    done("Table repaired");
}

pub fn acquired(name: &str, waited: Duration, ttl: u64) {
    let detail = format!("(waited {:.1?}, ttl {}s)", waited, ttl);
    line(LOCK, "Acquired", &format!("{} {}", name, paint(Tone::Faint, &detail)));
}

pub fn released(name: &str) {
    line(UNLOCK, "Released", name);
}

/// The lock was gone by the time the command finished
pub fn release_failed(err: &dyn Display) {
    eprintln!("{} {}", CROSS, paint(Tone::Bad, &err.to_string()));
    eprintln!(
        "  {}",
        paint(Tone::Faint, "the lock may have expired while the command ran")
    );
}

pub fn exit_status(code: i32) {
    println!("  {} {}", CLOCK, paint(Tone::Faint, &format!("exit status {}", code)));
}
