//! CLI binary for edgequake-exam2json.
//!
//! A thin shim over the library crate that maps CLI flags
//! to `ExtractionConfig` and prints results.

use anyhow::{Context, Result};
use clap::Parser;
use edgequake_exam2json::{
    extract_with_cancel, load_pages, reextract_answer, reextract_question, write_output, CancelToken,
    ExtractionConfig, ExtractionProgressCallback, ProgressCallback, QuestionContext,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Terminal progress callback. Starts as a spinner while structure analysis
/// runs, then becomes a bar over booklets (plus one step for the answer key).
struct CliProgressCallback {
    bar: ProgressBar,
    /// Whether the bar includes a step for the answer key.
    counts_answers: AtomicBool,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let spinner_style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(TICKS);
        bar.set_style(spinner_style);
        bar.set_prefix("Preparing");
        bar.set_message("Loading pages…");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            counts_answers: AtomicBool::new(false),
        })
    }

    fn activate_bar(&self, total: usize) {
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} steps  \
             ⏱ {elapsed_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS);

        self.bar.set_length(total as u64);
        self.bar.set_style(style);
        self.bar.set_prefix("Extracting");
        self.bar.reset_eta();
    }
}

impl ExtractionProgressCallback for CliProgressCallback {
    fn on_extraction_start(&self, total_pages: usize) {
        self.bar.set_prefix("Structure");
        self.bar.set_message(format!("analysing {total_pages} page(s)…"));
    }

    fn on_structure_complete(&self, booklets: usize, answer_pages: usize) {
        let has_answers = answer_pages > 0;
        self.counts_answers.store(has_answers, Ordering::SeqCst);
        self.activate_bar(booklets + usize::from(has_answers));
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("{booklets} booklet(s), {answer_pages} answer page(s)"))
        ));
    }

    fn on_booklet_start(&self, label: &str, _page_count: usize) {
        self.bar.set_message(label.to_string());
    }

    fn on_booklet_retry(&self, label: &str, attempt: u32, issues: usize) {
        self.bar.println(format!(
            "  {} {:<20}  {}",
            cyan("↻"),
            label,
            dim(&format!("retry {attempt} ({issues} issue(s))")),
        ));
    }

    fn on_booklet_complete(&self, label: &str, questions_found: usize, issues: usize) {
        let mark = if issues == 0 { green("✓") } else { red("✗") };
        let detail = if issues == 0 {
            dim(&format!("{questions_found:>3} questions"))
        } else {
            format!(
                "{}  {}",
                dim(&format!("{questions_found:>3} questions")),
                red(&format!("{issues} issue(s)"))
            )
        };
        self.bar.println(format!("  {} {:<20}  {}", mark, label, detail));
        self.bar.inc(1);
    }

    fn on_answers_complete(&self, answers_found: usize, problem: Option<&str>) {
        if !self.counts_answers.load(Ordering::SeqCst) {
            return;
        }
        match problem {
            None => self.bar.println(format!(
                "  {} {:<20}  {}",
                green("✓"),
                "answer key",
                dim(&format!("{answers_found:>3} answers"))
            )),
            Some(p) => self
                .bar
                .println(format!("  {} {:<20}  {}", red("✗"), "answer key", red(p))),
        }
        self.bar.inc(1);
    }

    fn on_extraction_complete(&self, questions_found: usize, issues: usize) {
        self.bar.finish_and_clear();
        if issues == 0 {
            eprintln!(
                "{} {} questions extracted",
                green("✔"),
                bold(&questions_found.to_string())
            );
        } else {
            eprintln!(
                "{} {} questions extracted  ({} issue(s))",
                cyan("⚠"),
                bold(&questions_found.to_string()),
                red(&issues.to_string()),
            );
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # A directory of page scans (natural order: page2 before page10)
  exam2json scans/

  # Explicit pages, write to file
  exam2json p1.png p2.png p3.jpg -o paper.json

  # Pages served over HTTP
  exam2json https://example.com/p1.png https://example.com/p2.png

  # Only the BatchResult, no report or stats
  exam2json --result-only scans/ > result.json

  # Re-locate question 7 on one page (page index 4 of the paper)
  exam2json --question 7 --page-index 4 --previous 6 --next 8 page4.png

  # Re-read the answer for question 12 from an answer page
  exam2json --answer 12 --page-index 11 page11.png

ENVIRONMENT VARIABLES:
  OPENAI_API_KEY          OpenAI API key
  ANTHROPIC_API_KEY       Anthropic API key
  GEMINI_API_KEY          Google Gemini API key
  EDGEQUAKE_LLM_PROVIDER  Override provider (openai, anthropic, gemini, ollama)
  EDGEQUAKE_MODEL         Override model ID
  RUST_LOG                Log filter (overrides -v / -q)

EXIT STATUS:
  0  extraction finished (check the report for per-booklet issues)
  1  fatal error: no pages, no provider, or structure analysis failed
"#;

/// Extract questions and answers from scanned exam papers using Vision LLMs.
#[derive(Parser, Debug)]
#[command(
    name = "exam2json",
    version,
    about = "Extract questions and answers from scanned exam papers using Vision LLMs",
    long_about = "Decompose a scanned exam paper (page images as files, a directory or URLs) \
into booklets, per-question crop regions and an answer key. Question numbering is validated \
per booklet and inconsistent booklets are retried with feedback.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Page images: files, directories or HTTP/HTTPS URLs, in page order.
    #[arg(required = true)]
    inputs: Vec<String>,

    /// Write JSON to this file instead of stdout.
    #[arg(short, long, env = "EXAM2JSON_OUTPUT")]
    output: Option<PathBuf>,

    /// Print only the BatchResult (no report, no stats).
    #[arg(long, env = "EXAM2JSON_RESULT_ONLY")]
    result_only: bool,

    /// LLM model ID (e.g. gpt-4.1-nano, gpt-4.1, claude-sonnet-4-20250514).
    #[arg(long, env = "EDGEQUAKE_MODEL")]
    model: Option<String>,

    /// LLM provider: openai, anthropic, gemini, ollama, azure.
    #[arg(long, env = "EDGEQUAKE_PROVIDER")]
    provider: Option<String>,

    /// Number of booklets extracted at once.
    #[arg(short, long, env = "EXAM2JSON_CONCURRENCY", default_value_t = 8)]
    concurrency: usize,

    /// Validation retries per booklet (0–3).
    #[arg(long, env = "EXAM2JSON_RETRIES", default_value_t = 1,
          value_parser = clap::value_parser!(u32).range(0..=3))]
    retries: u32,

    /// Max LLM output tokens per call.
    #[arg(long, env = "EXAM2JSON_MAX_TOKENS", default_value_t = 16384)]
    max_tokens: usize,

    /// LLM temperature (0.0–2.0).
    #[arg(long, env = "EXAM2JSON_TEMPERATURE", default_value_t = 0.1)]
    temperature: f32,

    /// Transport retries per call on provider failure.
    #[arg(long, env = "EXAM2JSON_MAX_RETRIES", default_value_t = 3)]
    max_retries: u32,

    /// Longest side of each page image sent to the model, in pixels.
    #[arg(long, env = "EXAM2JSON_MAX_PIXELS", default_value_t = 2000)]
    max_pixels: u32,

    /// Replacement for line breaks inside answer text.
    #[arg(long, env = "EXAM2JSON_SEPARATOR", default_value = " | ")]
    separator: String,

    /// HTTP download timeout in seconds.
    #[arg(long, env = "EXAM2JSON_DOWNLOAD_TIMEOUT", default_value_t = 120)]
    download_timeout: u64,

    /// Per-call LLM timeout in seconds.
    #[arg(long, env = "EXAM2JSON_API_TIMEOUT", default_value_t = 180)]
    api_timeout: u64,

    /// Re-locate this one question on the single input page.
    #[arg(long, conflicts_with = "answer")]
    question: Option<String>,

    /// Re-read the answer for this one question from the single input page.
    #[arg(long)]
    answer: Option<String>,

    /// Original page index of the single input page (with --question / --answer).
    #[arg(long, default_value_t = 0)]
    page_index: usize,

    /// Question just before the one being re-located.
    #[arg(long, requires = "question")]
    previous: Option<String>,

    /// Question just after the one being re-located.
    #[arg(long, requires = "question")]
    next: Option<String>,

    /// Disable progress bar.
    #[arg(long, env = "EXAM2JSON_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "EXAM2JSON_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "EXAM2JSON_QUIET")]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar replaces INFO-level library logs.
    let single = cli.question.is_some() || cli.answer.is_some();
    let show_progress = !cli.quiet && !cli.no_progress && !single;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_writer(io::stderr)
        .init();

    let progress_cb: Option<ProgressCallback> = if show_progress {
        Some(CliProgressCallback::new() as Arc<dyn ExtractionProgressCallback>)
    } else {
        None
    };

    let config = build_config(&cli, progress_cb)?;

    // ── Single-item mode ─────────────────────────────────────────────────
    if single {
        return run_single(&cli, &config).await;
    }

    // ── Full extraction ──────────────────────────────────────────────────
    let pages = load_pages(&cli.inputs, config.download_timeout_secs)
        .await
        .context("Failed to load page images")?;

    let cancel = CancelToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("{} interrupted, cancelling in-flight calls…", cyan("⚠"));
                cancel.cancel();
            }
        });
    }

    let output = extract_with_cancel(&pages, &config, &cancel)
        .await
        .context("Extraction failed")?;

    match cli.output {
        Some(ref path) if !cli.result_only => {
            write_output(&output, path).await.context("Failed to write output")?;
        }
        Some(ref path) => {
            let json = serde_json::to_string_pretty(&output.result).context("Failed to serialise result")?;
            tokio::fs::write(path, json)
                .await
                .with_context(|| format!("Failed to write {}", path.display()))?;
        }
        None if cli.result_only => {
            println!(
                "{}",
                serde_json::to_string_pretty(&output.result).context("Failed to serialise result")?
            );
        }
        None => {
            println!(
                "{}",
                serde_json::to_string_pretty(&output).context("Failed to serialise output")?
            );
        }
    }

    if !cli.quiet {
        if !output.report.is_clean() {
            eprintln!("{}", output.report.summary());
        }
        let s = &output.stats;
        eprintln!(
            "   {} pages  /  {} booklets  /  {} answers  /  {} calls ({} retries)  /  {}ms",
            dim(&s.total_pages.to_string()),
            dim(&s.booklets.to_string()),
            dim(&s.answers_found.to_string()),
            dim(&s.oracle_calls.to_string()),
            dim(&s.retries.to_string()),
            s.total_duration_ms,
        );
        if let Some(ref path) = cli.output {
            eprintln!("   →  {}", bold(&path.display().to_string()));
        }
    }

    Ok(())
}

/// `--question` / `--answer`: one page, one item, JSON on stdout.
async fn run_single(cli: &Cli, config: &ExtractionConfig) -> Result<()> {
    let pages = load_pages(&cli.inputs, config.download_timeout_secs)
        .await
        .context("Failed to load page image")?;
    if pages.len() != 1 {
        anyhow::bail!("--question / --answer take exactly one page image (got {})", pages.len());
    }
    let page = &pages[0];

    let json = match (&cli.question, &cli.answer) {
        (Some(num), _) => {
            let context = QuestionContext {
                previous: cli.previous.clone(),
                next: cli.next.clone(),
            };
            let question = reextract_question(page, cli.page_index, num, &context, config)
                .await
                .with_context(|| format!("Failed to re-extract question {num}"))?;
            serde_json::to_string_pretty(&question)?
        }
        (None, Some(num)) => {
            let answer = reextract_answer(page, cli.page_index, num, config)
                .await
                .with_context(|| format!("Failed to re-extract answer {num}"))?;
            serde_json::to_string_pretty(&answer)?
        }
        (None, None) => anyhow::bail!("--question or --answer is required"),
    };

    println!("{json}");
    Ok(())
}

/// Map CLI args to `ExtractionConfig`.
fn build_config(cli: &Cli, progress: Option<ProgressCallback>) -> Result<ExtractionConfig> {
    let mut builder = ExtractionConfig::builder()
        .concurrency(cli.concurrency)
        .validation_retries(cli.retries)
        .max_tokens(cli.max_tokens)
        .temperature(cli.temperature)
        .transport_retries(cli.max_retries)
        .max_image_pixels(cli.max_pixels)
        .answer_separator(cli.separator.clone())
        .download_timeout_secs(cli.download_timeout)
        .api_timeout_secs(cli.api_timeout);

    if let Some(ref model) = cli.model {
        builder = builder.model(model.clone());
    }
    if let Some(ref provider) = cli.provider {
        builder = builder.provider_name(provider.clone());
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    builder.build().context("Invalid configuration")
}
