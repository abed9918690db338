use std::io::{self, BufRead, Write};
use std::str::FromStr;

use anyhow::{Context, bail};

/// Print `label` and read one trimmed line from stdin.
pub fn line(label: &str) -> anyhow::Result<String> {
    print!("{label}: ");
    io::stdout().flush()?;
    let mut input = String::new();
    let read = io::stdin().lock().read_line(&mut input)?;
    if read == 0 {
        bail!("stdin closed while waiting for {label}");
    }
    Ok(input.trim().to_string())
}

/// A line that must not be empty.
pub fn required(label: &str) -> anyhow::Result<String> {
    let value = line(label)?;
    if value.is_empty() {
        bail!("{label} is required");
    }
    Ok(value)
}

/// Parse a line, falling back to `default` on empty input.
pub fn parsed<T>(label: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr + std::fmt::Display,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let value = line(&format!("{label} [{default}]"))?;
    if value.is_empty() {
        return Ok(default);
    }
    value
        .parse()
        .with_context(|| format!("invalid {label}: {value}"))
}
