//! Archive extraction pipeline
//!
//! Expands synthetic web-archive segments into page records, keeps the records of the
//! hosts of interest, and extracts a headline from each page in a pool of workers.
//!
//! Usage: cargo run --example archive_extract --release [config.toml]
//!        RUST_LOG=streamline=debug for worker lifecycle logs

use std::time::Duration;
use streamline::{EngineConfig, PipelineBuilder, StageError};
use thiserror::Error;
use tracing::info;
use tracing_subscriber::EnvFilter;

const HOSTS: [&str; 4] = ["news.example", "blog.example", "wire.example", "ads.example"];

/// Location of one archive segment
#[derive(Debug, Clone)]
struct Segment {
    name: String,
    records: usize,
}

#[derive(Debug)]
struct Record {
    url: String,
    body: String,
}

#[derive(Debug)]
struct Article {
    url: String,
    headline: String,
}

#[derive(Error, Debug)]
#[error("record {url} has no <title>")]
struct MissingTitle {
    url: String,
}

/// Stand-in for reading a segment from storage; every record is a small page
fn read_segment(segment: &Segment) -> impl Iterator<Item = Result<Record, StageError>> {
    let name = segment.name.clone();
    (0..segment.records).map(move |i| {
        let host = HOSTS[i % HOSTS.len()];
        let url = format!("https://{host}/{name}/{i}");
        let body = format!("<html><head><title>{name} story {i}</title></head><body>...</body></html>");
        Ok(Record { url, body })
    })
}

fn extract(record: Record) -> Result<Article, StageError> {
    let start = record.body.find("<title>").map(|at| at + "<title>".len());
    let end = record.body.find("</title>");
    match (start, end) {
        (Some(start), Some(end)) if start <= end => Ok(Article {
            headline: record.body[start..end].trim().to_string(),
            url: record.url,
        }),
        _ => Err(Box::new(MissingTitle { url: record.url })),
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default().with_poll_interval(Duration::from_millis(20)),
    };

    let pipeline = PipelineBuilder::from_config(config)
        .try_supply("segments", 2, |segment: Segment| {
            Ok(read_segment(&segment).filter(|record| match record {
                Ok(r) => !r.url.contains("ads.example"),
                Err(_) => true,
            }))
        })
        .with_capacity(32)
        .with_channels(2)
        .transform("extract", 6, extract)
        .build()?;

    let segments: Vec<Segment> = (0..8)
        .map(|i| Segment {
            name: format!("CC-2024-{i:05}"),
            records: 40,
        })
        .collect();

    let mut running = pipeline.start()?;
    let mut articles = Vec::new();
    for article in running.drive(segments)? {
        articles.push(article?);
    }

    articles.sort_by(|a, b| a.url.cmp(&b.url));
    for article in articles.iter().take(5) {
        println!("{:<45} {}", article.url, article.headline);
    }
    info!(articles = articles.len(), "extraction complete");

    println!("\n{}", running.metrics_summary());
    Ok(())
}
