//! Ingest command implementation.

use anyhow::{Context, Result};
use clap::Args;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::time::Instant;
use walkdir::WalkDir;

use crate::cli::output::{IngestFailure, IngestSummary, get_formatter};
use crate::models::{Config, OutputFormat};
use crate::pipeline::Pipeline;
use crate::services::IngestOptions;
use crate::utils::file::{
    calculate_checksum, document_id_for_path, get_relative_path, is_ingestable_file,
    read_file_content, title_from_path,
};
use crate::utils::text::has_meaningful_content;

use super::parse_key_value;

#[derive(Debug, Args)]
pub struct IngestArgs {
    /// File or directory of extracted text to ingest
    #[arg(required = true)]
    pub path: PathBuf,

    #[arg(long, help = "Document id (single file only; derived from the path otherwise)")]
    pub id: Option<String>,

    #[arg(long, short = 't', help = "Document title (single file only)")]
    pub title: Option<String>,

    #[arg(long, short = 'l', help = "Document language code (e.g. en, de)")]
    pub language: Option<String>,

    #[arg(
        long = "meta",
        short = 'm',
        value_parser = parse_key_value,
        help = "Extra metadata stored on every chunk (key=value, repeatable)"
    )]
    pub meta: Vec<(String, String)>,

    #[arg(long, help = "Override the configured chunk size")]
    pub chunk_size: Option<usize>,

    #[arg(long, help = "Override the configured chunk overlap")]
    pub overlap: Option<usize>,

    #[arg(long, short = 'e', help = "Glob patterns to exclude (repeatable)")]
    pub exclude: Vec<String>,

    #[arg(long, help = "List the files that would be ingested and exit")]
    pub dry_run: bool,
}

pub async fn handle_ingest(args: IngestArgs, format: OutputFormat, verbose: bool) -> Result<()> {
    let config = Config::load()?;
    let formatter = get_formatter(format);
    let start_time = Instant::now();

    let path = args.path.canonicalize().context("invalid path")?;
    let single_file = path.is_file();
    if !single_file && (args.id.is_some() || args.title.is_some()) {
        anyhow::bail!("--id and --title only apply when ingesting a single file");
    }

    let files = collect_files(&path, &args.exclude, &config.ingestion.exclude_patterns)?;
    if files.is_empty() {
        println!("{}", formatter.format_message("No files found to ingest."));
        return Ok(());
    }

    if verbose {
        eprintln!("Found {} files to process", files.len());
    }

    if args.dry_run {
        println!(
            "{}",
            formatter.format_message(&format!("Dry run: would ingest {} files", files.len()))
        );
        for file in &files {
            println!("  {}", file.display());
        }
        return Ok(());
    }

    let max_file_size = config.ingestion.max_file_size;
    let pipeline = Pipeline::from_config(config)
        .await
        .context("failed to initialize pipeline")?;

    let pb = ProgressBar::new(files.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template(
                "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})",
            )
            .context("invalid progress template")?
            .progress_chars("#>-"),
    );

    let base = if single_file {
        path.parent().map(Path::to_path_buf).unwrap_or_default()
    } else {
        path.clone()
    };

    let mut summary = IngestSummary {
        files_scanned: files.len() as u64,
        ..Default::default()
    };

    for file_path in &files {
        pb.inc(1);

        if !is_ingestable_file(file_path) {
            summary.files_skipped += 1;
            continue;
        }

        let content = match read_file_content(file_path, max_file_size) {
            Ok(c) => c,
            Err(e) => {
                if verbose {
                    pb.println(format!("Skipping {}: {}", file_path.display(), e));
                }
                summary.files_skipped += 1;
                continue;
            }
        };
        if !has_meaningful_content(&content) {
            summary.files_skipped += 1;
            continue;
        }

        let relative = get_relative_path(&base, file_path)
            .unwrap_or_else(|| file_path.to_string_lossy().to_string());
        let document_id = args
            .id
            .clone()
            .unwrap_or_else(|| document_id_for_path(&relative));
        let options = document_options(&args, file_path, &relative, &content);

        match pipeline
            .ingest_document(&document_id, &content, &options)
            .await
        {
            Ok(report) => {
                if verbose {
                    pb.println(format!(
                        "{} -> {} ({} chunks, {} pending)",
                        relative, document_id, report.chunks_written, report.chunks_failed
                    ));
                }
                summary.documents.push(report);
            }
            Err(e) => {
                pb.println(format!("Failed {}: {}", relative, e));
                summary.failures.push(IngestFailure {
                    document_id,
                    error: e.to_string(),
                });
            }
        }
    }

    pb.finish_and_clear();
    summary.duration_ms = start_time.elapsed().as_millis() as u64;
    print!("{}", formatter.format_ingest(&summary));

    if summary.documents.is_empty() && !summary.failures.is_empty() {
        anyhow::bail!("no documents were ingested");
    }
    Ok(())
}

fn document_options(
    args: &IngestArgs,
    file_path: &Path,
    relative: &str,
    content: &str,
) -> IngestOptions {
    let title = args
        .title
        .clone()
        .unwrap_or_else(|| title_from_path(file_path));

    let mut options = IngestOptions::titled(title)
        .with_language(args.language.clone().unwrap_or_default())
        .with_extra("source_path", relative)
        .with_extra("checksum", calculate_checksum(content));
    for (key, value) in &args.meta {
        options = options.with_extra(key.clone(), value.clone());
    }
    options.chunk_size = args.chunk_size;
    options.overlap = args.overlap;
    options
}

fn collect_files(path: &Path, exclude: &[String], default_exclude: &[String]) -> Result<Vec<PathBuf>> {
    if path.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }

    let patterns: Vec<glob::Pattern> = exclude
        .iter()
        .chain(default_exclude.iter())
        .filter_map(|p| glob::Pattern::new(p).ok())
        .collect();

    let mut files = Vec::new();
    for entry in WalkDir::new(path).follow_links(false).sort_by_file_name() {
        let entry = entry.context("failed to read directory entry")?;
        let entry_path = entry.path();
        if !entry_path.is_file() {
            continue;
        }

        let path_str = entry_path.to_string_lossy();
        if patterns.iter().any(|p| p.matches(&path_str)) {
            continue;
        }
        files.push(entry_path.to_path_buf());
    }

    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_collect_files_applies_excludes() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("drafts")).unwrap();
        std::fs::write(dir.path().join("b.md"), "b").unwrap();
        std::fs::write(dir.path().join("a.txt"), "a").unwrap();
        std::fs::write(dir.path().join("drafts/c.md"), "c").unwrap();

        let files = collect_files(dir.path(), &["**/drafts/**".to_string()], &[]).unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|f| f.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["a.txt", "b.md"]);
    }

    #[test]
    fn test_document_options_carry_metadata() {
        let args = IngestArgs {
            path: PathBuf::from("docs"),
            id: None,
            title: None,
            language: Some("de".into()),
            meta: vec![("product".into(), "router".into())],
            chunk_size: Some(500),
            overlap: None,
            exclude: Vec::new(),
            dry_run: false,
        };
        let options = document_options(&args, Path::new("docs/user_guide.md"), "user_guide.md", "x");
        assert_eq!(options.document_title, "user guide");
        assert_eq!(options.language, "de");
        assert_eq!(options.chunk_size, Some(500));
        assert_eq!(options.extra["product"], "router");
        assert_eq!(options.extra["source_path"], "user_guide.md");
        assert!(options.extra.contains_key("checksum"));
    }
}
