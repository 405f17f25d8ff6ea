use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use std::io::Read;

use crate::diagnostics::{TickObserver, WorkerTick};

pub fn parse_values(text: &str) -> Result<Vec<i64>> {
    text.split_whitespace()
        .enumerate()
        .map(|(position, token)| {
            token
                .parse::<i64>()
                .with_context(|| format!("Invalid integer #{}: {:?}", position + 1, token))
        })
        .collect()
}

pub fn read_values<R: Read>(mut reader: R) -> Result<Vec<i64>> {
    let mut text = String::new();
    reader
        .read_to_string(&mut text)
        .context("Failed to read values from input")?;
    parse_values(&text)
}

pub fn create_progress_bar(total_items: usize) -> Result<ProgressBar> {
    let pb = ProgressBar::new(total_items as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} items ({eta})")
            .context("Invalid progress bar template")?
            .progress_chars("#>-"),
    );
    Ok(pb)
}

/// Advances a progress bar once per folded item.
pub struct ProgressObserver {
    bar: ProgressBar,
}

impl ProgressObserver {
    pub fn new(bar: ProgressBar) -> Self {
        Self { bar }
    }
}

impl TickObserver for ProgressObserver {
    fn on_worker_tick(&self, _tick: &WorkerTick<'_>) -> Result<()> {
        self.bar.inc(1);
        Ok(())
    }
}
