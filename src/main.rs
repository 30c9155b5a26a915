use ahash::AHashSet;
use clap::{Parser, Subcommand};
use colored::Colorize;
use ignore::WalkBuilder;
use rayon::iter::{IntoParallelRefIterator, ParallelIterator};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;

/// lectio - Cross-reference checker for recurring scripture passages in
/// liturgical commentary archives
#[derive(Parser)]
#[command(name = "lectio")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Book vocabulary file overriding the built-in table
    #[arg(short, long, global = true)]
    books: Option<PathBuf>,

    /// Quiet mode - suppress non-essential output
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Cross-reference a current document against a historical corpus
    Check {
        /// Current document to check
        current: PathBuf,

        /// Historical documents (files or directories)
        #[arg(required = true)]
        historical: Vec<PathBuf>,

        /// Keep only the first match from each historical file
        #[arg(long)]
        latest_only: bool,

        /// Output as JSON
        #[arg(long)]
        json: bool,

        /// Directory for matched.json, failed.json and passages.csv
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Segment a single document into dated entries
    Scan {
        /// Document to segment
        file: PathBuf,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show the reference vocabulary
    Books {
        /// List every accepted surface form per book
        #[arg(long)]
        full: bool,
    },
}

// Result structures

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
struct Entry {
    date: String,
    passage_ref: String,
    text: String,
    file_name: String,
}

#[derive(Serialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
struct Segmented {
    resolved: Vec<Entry>,
    failed: Vec<Entry>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
struct PassageGroup {
    passage_ref: String,
    current_entries: Vec<Entry>,
    historical_entries: Vec<Entry>,
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct ExtractionResult {
    matched: Vec<PassageGroup>,
    failed: Vec<Entry>,
}

#[derive(Debug)]
struct RawDocument {
    file_name: String,
    text: String,
}

#[derive(Debug, Error)]
enum LectioError {
    #[error("no year in historical file name: {0}")]
    InvalidFileName(String),

    #[error("unsupported file type: {0} (expected .txt, .text or .md; convert Word documents to plain text first)")]
    UnsupportedFileType(String),

    #[error("failed to read {path}: {source}")]
    Read { path: String, source: std::io::Error },
}

fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Check { current, historical, latest_only, json, output } => cmd_check(
            &current,
            &historical,
            latest_only,
            json,
            output.as_deref(),
            cli.books.as_deref(),
            cli.quiet,
        ),
        Commands::Scan { file, json } => cmd_scan(&file, json, cli.books.as_deref(), cli.quiet),
        Commands::Books { full } => cmd_books(full, cli.books.as_deref()),
    };

    if let Err(e) = result {
        eprintln!("{}: {}", "error".red().bold(), e);
        std::process::exit(1);
    }
}

fn cmd_check(
    current: &Path,
    historical: &[PathBuf],
    latest_only: bool,
    json: bool,
    output: Option<&Path>,
    books: Option<&Path>,
    quiet: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let start = Instant::now();

    let table = BookTable::load(books)?;
    let segmenter = Segmenter::new(&table)?;

    let corpus = collect_corpus_paths(historical)?;
    if corpus.is_empty() {
        return Err("no historical documents found".into());
    }

    // Year gate before any file content is read
    let ordered = order_corpus(corpus)?;

    if !quiet && !json {
        println!(
            "{} {} against {} historical files",
            "Checking".cyan().bold(),
            current.display(),
            ordered.len().to_string().cyan()
        );
    }

    let old_segments: Vec<Segmented> = ordered
        .par_iter()
        .map(|path| {
            let doc = read_document(path)?;
            Ok(segmenter.segment(&doc.text, &doc.file_name))
        })
        .collect::<Result<Vec<_>, LectioError>>()?;

    let current_doc = read_document(current)?;
    let current_segments = segmenter.segment(&current_doc.text, &current_doc.file_name);

    // One flat pool, most recent file first
    let mut historical_pool = Vec::new();
    let mut failed = Vec::new();
    for segment in old_segments {
        historical_pool.extend(segment.resolved);
        failed.extend(segment.failed);
    }

    let mut matched = match_passages(&current_segments.resolved, &historical_pool);
    failed.extend(current_segments.failed);

    if latest_only {
        for group in &mut matched {
            keep_first_per_file(&mut group.historical_entries);
        }
    }

    let result = ExtractionResult { matched, failed };

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_report(&result, quiet, start.elapsed());
    }

    if let Some(dir) = output {
        export_result(&result, dir, quiet)?;
    }

    Ok(())
}

fn cmd_scan(
    file: &Path,
    json: bool,
    books: Option<&Path>,
    quiet: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let table = BookTable::load(books)?;
    let segmenter = Segmenter::new(&table)?;

    let doc = read_document(file)?;
    let segmented = segmenter.segment(&doc.text, &doc.file_name);

    if json {
        println!("{}", serde_json::to_string_pretty(&segmented)?);
        return Ok(());
    }

    if segmented.resolved.is_empty() && segmented.failed.is_empty() {
        println!("{}", "No dated entries found.".yellow());
        return Ok(());
    }

    for entry in &segmented.resolved {
        let kind = segmenter
            .extractor
            .extract_with_kind(&entry.text)
            .map(|(kind, _)| kind)
            .unwrap_or("-");
        println!(
            "{}  {} {}",
            entry.date.cyan(),
            entry.passage_ref.yellow(),
            format!("[{}]", kind).dimmed()
        );
        println!("    {}", preview(&entry.text).dimmed());
    }

    for entry in &segmented.failed {
        println!("{}  {}", entry.date.red(), "no passage reference".dimmed());
        println!("    {}", preview(&entry.text).dimmed());
    }

    if !quiet {
        println!();
        println!(
            "{} resolved, {} failed",
            segmented.resolved.len().to_string().green(),
            segmented.failed.len().to_string().red()
        );
    }

    Ok(())
}

fn cmd_books(full: bool, books: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    let table = BookTable::load(books)?;
    let total_forms: usize = table.book.iter().map(|b| b.forms.len()).sum();

    println!("{}", "Reference Vocabulary".green().bold());
    println!();
    println!("  Books:         {}", table.book.len().to_string().cyan());
    println!("  Surface forms: {}", total_forms.to_string().cyan());
    println!();

    for book in &table.book {
        if full {
            println!("{}", book.canonical.cyan());
            for chunk in book.forms.chunks(8) {
                println!("  {}", chunk.join(", "));
            }
        } else {
            let bar = "=".repeat(book.forms.len().min(40));
            println!(
                "  {:>28} {:>2} {}",
                book.canonical.cyan(),
                book.forms.len(),
                bar.dimmed()
            );
        }
    }

    Ok(())
}

// Reference vocabulary

const BUILTIN_BOOKS: &str = include_str!("../data/books.toml");

#[derive(Debug, Deserialize)]
struct BookTable {
    book: Vec<Book>,
}

#[derive(Debug, Deserialize)]
struct Book {
    canonical: String,
    forms: Vec<String>,
}

impl BookTable {
    /// Load the built-in vocabulary, or a user-supplied TOML table of the
    /// same shape.
    fn load(path: Option<&Path>) -> Result<BookTable, Box<dyn std::error::Error>> {
        let raw = match path {
            Some(p) => fs::read_to_string(p)
                .map_err(|e| format!("failed to read book table {}: {}", p.display(), e))?,
            None => BUILTIN_BOOKS.to_string(),
        };

        let table: BookTable = toml::from_str(&raw)?;
        if table.book.is_empty() {
            return Err("book table has no entries".into());
        }
        Ok(table)
    }

    /// All surface forms as one escaped alternation. Book names are not
    /// prefix-free, so forms are listed longest first and every spaced,
    /// unspaced, abbreviated and full variant appears explicitly in the
    /// table instead of being derived.
    fn alternation(&self) -> String {
        let mut forms: Vec<&str> = self
            .book
            .iter()
            .flat_map(|b| b.forms.iter().map(String::as_str))
            .collect();
        forms.sort_by(|a, b| b.len().cmp(&a.len()).then(a.cmp(b)));
        forms.dedup();

        forms
            .iter()
            .map(|form| regex::escape(form))
            .collect::<Vec<_>>()
            .join("|")
    }
}

// Passage extraction

struct CitationPattern {
    kind: &'static str,
    re: Regex,
}

struct PassageExtractor {
    patterns: Vec<CitationPattern>,
}

impl PassageExtractor {
    fn new(table: &BookTable) -> Result<PassageExtractor, regex::Error> {
        let books = table.alternation();

        // Formal liturgical commentary cites four readings joined by
        // semicolons; when that shape is present it is the reference.
        let sub = format!(r"(?:{books})\s\d[[:word:],.\-(); ]*");
        let compound = Regex::new(&format!(
            r"{sub};\s{sub};\s{sub};\s(?:{books})\s\d[[:word:],.\-();° ]*"
        ))?;

        let single = Regex::new(&format!(
            r"\b(?:{books})\s*,?\s*\d+[-,\d]*[a-z]*\s*(?:\(\d+\))?\b"
        ))?;

        Ok(PassageExtractor {
            patterns: vec![
                CitationPattern { kind: "compound", re: compound },
                CitationPattern { kind: "single", re: single },
            ],
        })
    }

    /// Best-matching citation in `text`, or empty when nothing matches.
    /// Patterns are tried in order and the first match wins.
    fn extract(&self, text: &str) -> String {
        self.extract_with_kind(text)
            .map(|(_, reference)| reference)
            .unwrap_or_default()
    }

    fn extract_with_kind(&self, text: &str) -> Option<(&'static str, String)> {
        for pattern in &self.patterns {
            if let Some(found) = pattern.re.find(text) {
                return Some((pattern.kind, trim_reference(found.as_str()).to_string()));
            }
        }
        None
    }
}

/// Strip the trailing punctuation and markers that cling to citations in
/// running text, so textually ragged references share one grouping key.
fn trim_reference(reference: &str) -> &str {
    reference.trim_end_matches(|c: char| c == '.' || c == ';' || c == '°' || c.is_whitespace())
}

// Document segmentation

const WEEKDAYS: [&str; 7] = [
    "Domenica", "Lunedì", "Martedì", "Mercoledì", "Giovedì", "Venerdì", "Sabato",
];

const MONTHS: [&str; 12] = [
    "gennaio", "febbraio", "marzo", "aprile", "maggio", "giugno",
    "luglio", "agosto", "settembre", "ottobre", "novembre", "dicembre",
];

fn date_marker_pattern() -> String {
    format!(
        r"(?:{})(?: Santo)? [0-9]{{1,2}} (?:{})",
        WEEKDAYS.join("|"),
        MONTHS.join("|")
    )
}

struct Segmenter {
    dates: Regex,
    extractor: PassageExtractor,
}

impl Segmenter {
    fn new(table: &BookTable) -> Result<Segmenter, regex::Error> {
        Ok(Segmenter {
            dates: Regex::new(&date_marker_pattern())?,
            extractor: PassageExtractor::new(table)?,
        })
    }

    /// Split a document at its date markers and tag each entry with the
    /// citation extracted from its text. The chunk before the first marker
    /// is boilerplate and is dropped. A document with no markers yields
    /// nothing at all; this never fails, it only classifies.
    fn segment(&self, text: &str, file_name: &str) -> Segmented {
        let markers: Vec<regex::Match> = self.dates.find_iter(text).collect();

        let mut segmented = Segmented::default();

        for (j, marker) in markers.iter().enumerate() {
            let end = markers.get(j + 1).map(|m| m.start()).unwrap_or(text.len());
            let entry_text = &text[marker.start()..end];
            let passage_ref = self.extractor.extract(entry_text);

            let entry = Entry {
                date: marker.as_str().to_string(),
                passage_ref,
                text: entry_text.to_string(),
                file_name: file_name.to_string(),
            };

            if entry.date.is_empty() || entry.passage_ref.is_empty() {
                segmented.failed.push(entry);
            } else {
                segmented.resolved.push(entry);
            }
        }

        segmented
    }
}

// Historical corpus ordering

fn document_year(file_name: &str) -> Option<u32> {
    let year_re = Regex::new(r"[0-9]{4}").unwrap();
    year_re.find(file_name).and_then(|m| m.as_str().parse().ok())
}

/// Sort historical documents most recent first, by the first four-digit run
/// in each file name. A file name with no year poisons the whole batch, so
/// the request is rejected before any content is read. Ties keep input
/// order.
fn order_corpus(paths: Vec<PathBuf>) -> Result<Vec<PathBuf>, LectioError> {
    let mut keyed: Vec<(u32, PathBuf)> = Vec::with_capacity(paths.len());

    for path in paths {
        let name = display_name(&path);
        match document_year(&name) {
            Some(year) => keyed.push((year, path)),
            None => return Err(LectioError::InvalidFileName(name)),
        }
    }

    keyed.sort_by(|a, b| b.0.cmp(&a.0));
    Ok(keyed.into_iter().map(|(_, path)| path).collect())
}

// Cross-reference matching

/// Group current entries with the historical entries citing the same exact
/// reference. References unique to the current document are dropped; the
/// point is showing repetition, not novelty. Groups come out in the order
/// their reference first appears in the current document, regardless of how
/// the per-reference lookups are scheduled.
fn match_passages(current: &[Entry], historical: &[Entry]) -> Vec<PassageGroup> {
    let mut seen = AHashSet::new();
    let mut refs: Vec<&str> = Vec::new();
    for entry in current {
        if seen.insert(entry.passage_ref.as_str()) {
            refs.push(entry.passage_ref.as_str());
        }
    }

    refs.par_iter()
        .map(|passage_ref| {
            let historical_entries: Vec<Entry> = historical
                .iter()
                .filter(|e| e.passage_ref == *passage_ref)
                .cloned()
                .collect();
            if historical_entries.is_empty() {
                return None;
            }

            let current_entries: Vec<Entry> = current
                .iter()
                .filter(|e| e.passage_ref == *passage_ref)
                .cloned()
                .collect();

            Some(PassageGroup {
                passage_ref: passage_ref.to_string(),
                current_entries,
                historical_entries,
            })
        })
        .collect::<Vec<Option<PassageGroup>>>()
        .into_iter()
        .flatten()
        .collect()
}

/// Collapse a group's historical entries to the first one per file. Files
/// arrive most recent first, so this keeps each file's most recent match.
fn keep_first_per_file(entries: &mut Vec<Entry>) {
    let mut seen = AHashSet::new();
    entries.retain(|entry| seen.insert(entry.file_name.clone()));
}

// Document intake

fn supported_extension(path: &Path) -> bool {
    matches!(
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase())
            .as_deref(),
        Some("txt" | "text" | "md")
    )
}

fn ensure_supported(path: &Path) -> Result<(), LectioError> {
    if supported_extension(path) {
        Ok(())
    } else {
        Err(LectioError::UnsupportedFileType(display_name(path)))
    }
}

fn read_document(path: &Path) -> Result<RawDocument, LectioError> {
    ensure_supported(path)?;

    let text = fs::read_to_string(path).map_err(|source| LectioError::Read {
        path: path.display().to_string(),
        source,
    })?;

    Ok(RawDocument {
        file_name: display_name(path),
        text,
    })
}

/// Explicit files must carry a supported extension; directories are walked
/// and silently filtered down to supported files.
fn collect_corpus_paths(inputs: &[PathBuf]) -> Result<Vec<PathBuf>, LectioError> {
    let mut paths = Vec::new();

    for input in inputs {
        if input.is_dir() {
            let mut walked: Vec<PathBuf> = WalkBuilder::new(input)
                .build()
                .filter_map(|e| e.ok())
                .map(|e| e.into_path())
                .filter(|p| p.is_file() && supported_extension(p))
                .collect();
            walked.sort();
            paths.extend(walked);
        } else {
            ensure_supported(input)?;
            paths.push(input.clone());
        }
    }

    Ok(paths)
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .unwrap_or_else(|| path.to_string_lossy().to_string())
}

// Reporting and export

fn print_report(result: &ExtractionResult, quiet: bool, elapsed: Duration) {
    if result.matched.is_empty() {
        println!("{}", "No matching passages found.".yellow());
    } else {
        println!(
            "{} recurring passages\n",
            result.matched.len().to_string().green().bold()
        );

        for group in &result.matched {
            println!("{}", group.passage_ref.yellow().bold());
            for entry in &group.current_entries {
                println!("  {} {} ({})", "now".cyan(), entry.date, entry.file_name.dimmed());
            }
            for entry in &group.historical_entries {
                println!("  {} {} ({})", "was".dimmed(), entry.date, entry.file_name.dimmed());
            }
            println!();
        }
    }

    if !result.failed.is_empty() {
        println!(
            "{} entries without a usable date or passage reference",
            result.failed.len().to_string().red().bold()
        );
        for entry in &result.failed {
            let reason = if entry.date.is_empty() {
                "no date"
            } else {
                "no passage reference"
            };
            println!(
                "  {} {} {} {}",
                "!".red(),
                entry.file_name,
                entry.date.dimmed(),
                reason.dimmed()
            );
        }
        println!();
    }

    if !quiet {
        println!("{}", "Summary".green().bold());
        println!("  Matched passages: {}", result.matched.len().to_string().cyan());
        println!("  Failed entries:   {}", result.failed.len().to_string().cyan());
        println!("  Time elapsed:     {:.2?}", elapsed);
    }
}

fn export_result(
    result: &ExtractionResult,
    dir: &Path,
    quiet: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    fs::create_dir_all(dir)?;

    fs::write(
        dir.join("matched.json"),
        serde_json::to_string_pretty(&result.matched)?,
    )?;
    fs::write(
        dir.join("failed.json"),
        serde_json::to_string_pretty(&result.failed)?,
    )?;
    fs::write(dir.join("passages.csv"), passages_csv(&result.matched))?;

    if !quiet {
        println!(
            "{} {}",
            "Reports written to".green(),
            dir.display().to_string().cyan()
        );
    }

    Ok(())
}

/// One row per matched passage: the current date, the reference, then the
/// historical dates most recent first, padded to the widest group.
fn passages_csv(matched: &[PassageGroup]) -> String {
    let width = matched
        .iter()
        .map(|g| g.historical_entries.len())
        .max()
        .unwrap_or(0);

    let mut out = String::from("Date,Passage");
    for i in 1..=width {
        out.push_str(&format!(",Old_Date_{}", i));
    }
    out.push('\n');

    for group in matched {
        let current_date = group
            .current_entries
            .first()
            .map(|e| e.date.as_str())
            .unwrap_or("");

        let mut row = vec![csv_field(current_date), csv_field(&group.passage_ref)];
        for i in 0..width {
            let date = group
                .historical_entries
                .get(i)
                .map(|e| e.date.as_str())
                .unwrap_or("");
            row.push(csv_field(date));
        }

        out.push_str(&row.join(","));
        out.push('\n');
    }

    out
}

fn csv_field(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

fn preview(text: &str) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() > 72 {
        let cut: String = flat.chars().take(72).collect();
        format!("{}...", cut)
    } else {
        flat
    }
}
