//! Word frequency counter pipeline
//!
//! Reads lines from stdin, splits them into words across a pool of workers, normalizes
//! each word in a second pool, and counts frequencies as results arrive.
//!
//! Usage: cargo run --example word_count --release
//!        (Then type lines of text and press Ctrl-D to finish)

use std::collections::HashMap;
use std::io::{self, BufRead};
use streamline::{Emitter, PipelineBuilder, Stage, StageError};
use tracing_subscriber::EnvFilter;

/// Normalizes words, keeping a per-worker cache of already cleaned spellings
struct WordCleaner {
    cache: HashMap<String, String>,
}

impl Stage for WordCleaner {
    type Input = String;
    type Output = Option<String>;

    fn process(
        &mut self,
        word: String,
        out: &mut Emitter<'_, Option<String>>,
    ) -> Result<(), StageError> {
        let cleaned = self
            .cache
            .entry(word)
            .or_insert_with_key(|w| {
                w.chars()
                    .filter(|c| c.is_alphanumeric())
                    .flat_map(char::to_lowercase)
                    .collect()
            })
            .clone();
        out.emit((cleaned.len() > 2).then_some(cleaned))?;
        Ok(())
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    println!("Word Frequency Counter Pipeline");
    println!("================================");
    println!("Enter lines of text (Ctrl-D to finish):");
    println!();

    let pipeline = PipelineBuilder::new()
        .supply("split", 2, |line: String| {
            Ok(line
                .split_whitespace()
                .map(str::to_string)
                .collect::<Vec<_>>())
        })
        .with_capacity(200)
        .transform_with("clean", 4, |_| WordCleaner {
            cache: HashMap::new(),
        })
        .build()?;

    let lines: Vec<String> = io::stdin().lock().lines().collect::<Result<_, _>>()?;

    let mut running = pipeline.start()?;
    let mut counts: HashMap<String, usize> = HashMap::new();
    for word in running.drive(lines)? {
        if let Some(word) = word? {
            *counts.entry(word).or_insert(0) += 1;
        }
    }

    let mut top: Vec<_> = counts.into_iter().collect();
    top.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    println!("\n=== Top 10 Words ===");
    for (i, (word, count)) in top.iter().take(10).enumerate() {
        println!("{:2}. {} ({})", i + 1, word, count);
    }

    println!("\n{}", running.metrics_summary());
    println!("Processing complete!");

    Ok(())
}
