//! CLI output formatting utilities.
//!
//! Provides consistent formatting for terminal output including colored status
//! messages, relative timestamps, and Unicode symbols.

use anyhow::Context;
use chrono::{DateTime, Utc};
use owo_colors::{OwoColorize, Stream};

pub mod symbols {
  pub const SUCCESS: &str = "✓";
  pub const ERROR: &str = "✗";
  pub const WARNING: &str = "⚠";
  pub const INFO: &str = "•";
  pub const ARROW: &str = "→";
  pub const ADD: &str = "+";
  pub const MODIFY: &str = "~";
  pub const REMOVE: &str = "-";
}

/// Render a past timestamp as a whole-second relative age, e.g. `2h 5m ago`.
pub fn format_age(when: DateTime<Utc>) -> String {
  let age = Utc::now().signed_duration_since(when).to_std().unwrap_or_default();
  let age = std::time::Duration::from_secs(age.as_secs());
  format!("{} ago", humantime::format_duration(age))
}

pub fn print_success(message: &str) {
  println!(
    "{} {}",
    symbols::SUCCESS.if_supports_color(Stream::Stdout, |s| s.green()),
    message
  );
}

pub fn print_error(message: &str) {
  eprintln!(
    "{} {}",
    symbols::ERROR.if_supports_color(Stream::Stderr, |s| s.red()),
    message.if_supports_color(Stream::Stderr, |s| s.red())
  );
}

pub fn print_warning(message: &str) {
  eprintln!(
    "{} {}",
    symbols::WARNING.if_supports_color(Stream::Stderr, |s| s.yellow()),
    message.if_supports_color(Stream::Stderr, |s| s.yellow())
  );
}

pub fn print_info(message: &str) {
  println!(
    "{} {}",
    symbols::INFO.if_supports_color(Stream::Stdout, |s| s.blue()),
    message
  );
}

pub fn print_stat(label: &str, value: &str) {
  println!(
    "  {}: {}",
    label.if_supports_color(Stream::Stdout, |s| s.dimmed()),
    value
  );
}

pub fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
  let json = serde_json::to_string_pretty(value).context("Failed to serialize to JSON")?;
  println!("{}", json);
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_format_age() {
    let rendered = format_age(Utc::now() - chrono::Duration::seconds(90));
    assert_eq!(rendered, "1m 30s ago");
  }

  #[test]
  fn test_format_age_future_timestamp_clamps_to_zero() {
    let rendered = format_age(Utc::now() + chrono::Duration::seconds(90));
    assert_eq!(rendered, "0s ago");
  }
}
