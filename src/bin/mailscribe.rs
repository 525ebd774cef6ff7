//! CLI binary for mailscribe.
//!
//! A thin shim over the library crate that maps CLI flags to
//! `SanitizeConfig`, feeds the inputs through `sanitize_batch` and writes
//! the results.

use anyhow::{Context, Result};
use clap::Parser;
use futures::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use mailscribe::{
    sanitize_batch, write_document, BatchItem, BatchProgressCallback, BatchResult,
    CancellationToken, ImageRef, PolicyName, ProgressCallback, SanitizeConfig, SanitizeStats,
};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
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

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Terminal progress callback: a live progress bar plus one log line per
/// message. Messages complete out of order, so start times are keyed by id.
struct CliProgressCallback {
    bar: ProgressBar,
    start_times: Mutex<HashMap<String, Instant>>,
    errors: AtomicUsize,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} messages  \
             ⏱ {elapsed_precise}  ETA {eta_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);

        bar.set_style(style);
        bar.set_prefix("Sanitising");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            start_times: Mutex::new(HashMap::new()),
            errors: AtomicUsize::new(0),
        })
    }

    fn elapsed_secs(&self, id: &str) -> f64 {
        self.start_times
            .lock()
            .ok()
            .and_then(|mut times| times.remove(id))
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0)
    }
}

impl BatchProgressCallback for CliProgressCallback {
    fn on_batch_start(&self, total: usize) {
        self.bar.set_length(total as u64);
        self.bar.reset_eta();
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("Sanitising {total} messages…"))
        ));
    }

    fn on_message_start(&self, id: &str, _total: usize) {
        if let Ok(mut times) = self.start_times.lock() {
            times.insert(id.to_string(), Instant::now());
        }
        self.bar.set_message(id.to_string());
    }

    fn on_message_complete(&self, id: &str, _total: usize, html_len: usize) {
        let secs = self.elapsed_secs(id);
        self.bar.println(format!(
            "  {} {:<40}  {:<12}  {}",
            green("✓"),
            id,
            dim(&format!("{html_len:>7} bytes")),
            dim(&format!("{secs:.1}s")),
        ));
        self.bar.inc(1);
    }

    fn on_message_error(&self, id: &str, _total: usize, error: &str) {
        let secs = self.elapsed_secs(id);
        self.errors.fetch_add(1, Ordering::SeqCst);

        let msg: String = if error.chars().count() > 80 {
            format!("{}\u{2026}", error.chars().take(79).collect::<String>())
        } else {
            error.to_string()
        };

        self.bar.println(format!(
            "  {} {:<40}  {}  {}",
            red("✗"),
            id,
            red(&msg),
            dim(&format!("{secs:.1}s")),
        ));
        self.bar.inc(1);
    }

    fn on_batch_complete(&self, total: usize, success_count: usize) {
        let failed = self.errors.load(Ordering::SeqCst);
        self.bar.finish_and_clear();

        if failed == 0 {
            eprintln!(
                "{} {} messages sanitised",
                green("✔"),
                bold(&success_count.to_string())
            );
        } else {
            eprintln!(
                "{} {}/{} messages sanitised  ({} failed)",
                if failed == total { red("✘") } else { cyan("⚠") },
                bold(&success_count.to_string()),
                total,
                red(&failed.to_string()),
            );
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # One message to stdout
  mailscribe message.html

  # Highest fidelity, written to a file
  mailscribe --policy layout-preserving message.html -o render.html

  # A whole directory, no network at all
  mailscribe --offline --policy aggressive inbox/ -o renders/

  # Plaintext-only message (wrapped in a <pre> fallback)
  mailscribe body.txt -o render.html

  # Image diagnostics as JSON
  mailscribe --json message.html > report.json

  # Your own relay instead of the public ones
  mailscribe --proxy 'https://relay.internal/fetch?u=' message.html

POLICIES:
  aggressive         No style blocks, minimal attributes, images always placeholders
  balanced           Styles kept, images probed then proxied (default)
  layout-preserving  As balanced, plus CTA button emphasis and layout-keeping placeholders

ENVIRONMENT VARIABLES:
  Every option has a MAILSCRIBE_* equivalent, e.g. MAILSCRIBE_POLICY,
  MAILSCRIBE_OFFLINE, MAILSCRIBE_PROXY (comma-separated), MAILSCRIBE_CONCURRENCY.
  RUST_LOG overrides the log filter.
"#;

/// Sanitise email HTML into a render-safe document for screenshots.
#[derive(Parser, Debug)]
#[command(
    name = "mailscribe",
    version,
    about = "Sanitise email HTML into a render-safe, layout-stable document for screenshots",
    long_about = "Strip scripts, event handlers and dangerous URLs from email HTML, neutralise \
positioning and animation CSS, resolve cross-origin images through CORS relays (or replace them \
with fixed-size placeholders) and wrap the result in a deterministic document shell.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// `.html`/`.htm` files, `.txt` plaintext bodies, or directories of them.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,

    /// Sanitisation policy.
    #[arg(long, env = "MAILSCRIBE_POLICY", value_enum, default_value = "balanced")]
    policy: PolicyArg,

    /// Output file (one input) or directory (several inputs).
    #[arg(short, long, env = "MAILSCRIBE_OUTPUT")]
    output: Option<PathBuf>,

    /// Never fetch images; every cross-origin image becomes a placeholder.
    #[arg(long, env = "MAILSCRIBE_OFFLINE")]
    offline: bool,

    /// CORS relay base URL, tried in order. Replaces the default relays.
    #[arg(long = "proxy", env = "MAILSCRIBE_PROXY", value_delimiter = ',')]
    proxies: Vec<String>,

    /// Direct image load timeout in milliseconds.
    #[arg(long, env = "MAILSCRIBE_PROBE_TIMEOUT", default_value_t = 3000)]
    probe_timeout: u64,

    /// Per-relay timeout in milliseconds.
    #[arg(long, env = "MAILSCRIBE_PROXY_TIMEOUT", default_value_t = 5000)]
    proxy_timeout: u64,

    /// Messages sanitised concurrently.
    #[arg(short, long, env = "MAILSCRIBE_CONCURRENCY", default_value_t = 4)]
    concurrency: usize,

    /// Image fetches in flight per message.
    #[arg(long, env = "MAILSCRIBE_IMAGE_CONCURRENCY", default_value_t = 4)]
    image_concurrency: usize,

    /// Do not preload the web font (the local @font-face fallback stays).
    #[arg(long, env = "MAILSCRIBE_NO_FONT_PRELOAD")]
    no_font_preload: bool,

    /// Emit image diagnostics and stats as JSON on stdout.
    #[arg(long, env = "MAILSCRIBE_JSON")]
    json: bool,

    /// Disable progress bar.
    #[arg(long, env = "MAILSCRIBE_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "MAILSCRIBE_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "MAILSCRIBE_QUIET")]
    quiet: bool,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum PolicyArg {
    Aggressive,
    Balanced,
    LayoutPreserving,
}

impl From<PolicyArg> for PolicyName {
    fn from(v: PolicyArg) -> Self {
        match v {
            PolicyArg::Aggressive => PolicyName::Aggressive,
            PolicyArg::Balanced => PolicyName::Balanced,
            PolicyArg::LayoutPreserving => PolicyName::LayoutPreserving,
        }
    }
}

/// Per-message JSON record for multi-input `--json` runs.
#[derive(Serialize)]
struct MessageReport<'a> {
    id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    output_path: Option<&'a Path>,
    #[serde(skip_serializing_if = "Option::is_none")]
    images: Option<&'a [ImageRef]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stats: Option<&'a SanitizeStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // INFO-level library logs are suppressed while the progress bar is up.
    let files = collect_inputs(&cli.inputs)?;
    let multi = files.len() > 1;
    let show_progress = multi && !cli.quiet && !cli.no_progress && !cli.json;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    // ── Build config ─────────────────────────────────────────────────────
    let progress_cb: Option<ProgressCallback> = if show_progress {
        Some(CliProgressCallback::new() as Arc<dyn BatchProgressCallback>)
    } else {
        None
    };

    let cancel = CancellationToken::new();
    let config = build_config(&cli, progress_cb, cancel.clone())?;

    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("{} interrupted; finishing with placeholders", cyan("⚠"));
                cancel.cancel();
            }
        });
    }

    // ── Read inputs ──────────────────────────────────────────────────────
    let mut items = Vec::with_capacity(files.len());
    let mut paths: HashMap<String, PathBuf> = HashMap::new();
    for file in &files {
        let body = tokio::fs::read_to_string(file)
            .await
            .with_context(|| format!("Failed to read {}", file.display()))?;
        let id = file.display().to_string();
        let item = if is_plaintext(file) {
            BatchItem::text(id.clone(), body)
        } else {
            BatchItem::html(id.clone(), body)
        };
        items.push(item);
        paths.insert(id, file.clone());
    }

    // ── Run ──────────────────────────────────────────────────────────────
    let policy: PolicyName = cli.policy.into();
    let mut results: Vec<BatchResult> = sanitize_batch(items, policy, &config).collect().await;
    results.sort_by(|a, b| a.id.cmp(&b.id));

    let failed = results.iter().filter(|r| r.output.is_err()).count();

    if !multi && cli.output.is_none() {
        emit_single_to_stdout(&cli, &results)?;
    } else {
        let targets = output_paths(cli.output.as_deref(), &files);
        let mut reports = Vec::with_capacity(results.len());
        for result in &results {
            let source = paths.get(&result.id).map(PathBuf::as_path);
            let target = source.and_then(|s| targets.get(s).cloned());
            let report = match (&result.output, target) {
                (Ok(out), Some(target)) => {
                    let written = write_document(&target, &out.html).await;
                    let error = written.err().map(|e| e.to_string());
                    if let Some(ref e) = error {
                        eprintln!("{} {}: {e}", red("✗"), result.id);
                    } else if !cli.quiet && !show_progress && !cli.json {
                        eprintln!(
                            "{}  {}  {}  →  {}",
                            green("✔"),
                            result.id,
                            dim(&format!(
                                "{} placeholders, {}ms",
                                out.stats.images_placeholder, out.stats.duration_ms
                            )),
                            bold(&target.display().to_string()),
                        );
                    }
                    (error, Some(target))
                }
                (Ok(_), None) => (Some("unknown input".to_string()), None),
                (Err(e), _) => {
                    if !show_progress {
                        eprintln!("{} {}: {e}", red("✗"), result.id);
                    }
                    (Some(e.to_string()), None)
                }
            };
            reports.push(report);
        }

        let failures = reports.iter().filter(|(e, _)| e.is_some()).count();

        if cli.json {
            let json: Vec<MessageReport<'_>> = results
                .iter()
                .zip(&reports)
                .map(|(r, (error, target))| MessageReport {
                    id: &r.id,
                    output_path: target.as_deref(),
                    images: r.output.as_ref().ok().map(|o| o.images.as_slice()),
                    stats: r.output.as_ref().ok().map(|o| &o.stats),
                    error: error.clone(),
                })
                .collect();
            println!(
                "{}",
                serde_json::to_string_pretty(&json).context("Failed to serialise report")?
            );
        }

        if failures > 0 {
            anyhow::bail!("{failures} of {} messages failed", results.len());
        }
    }

    if failed > 0 {
        anyhow::bail!("{failed} of {} messages failed", results.len());
    }
    Ok(())
}

/// One input, no `-o`: the document (or its JSON report) goes to stdout.
fn emit_single_to_stdout(cli: &Cli, results: &[BatchResult]) -> Result<()> {
    let Some(result) = results.first() else {
        return Ok(());
    };
    let output = match &result.output {
        Ok(out) => out,
        Err(e) => {
            eprintln!("{} {}: {e}", red("✗"), result.id);
            return Ok(());
        }
    };

    if cli.json {
        let json = serde_json::to_string_pretty(output).context("Failed to serialise output")?;
        println!("{json}");
    } else {
        let stdout = io::stdout();
        let mut handle = stdout.lock();
        handle
            .write_all(output.html.as_bytes())
            .context("Failed to write to stdout")?;
        if !output.html.ends_with('\n') {
            handle.write_all(b"\n").ok();
        }
    }

    if !cli.quiet && !cli.json {
        eprintln!(
            "Sanitised in {}ms  ({} kept, {} proxied, {} placeholders)",
            output.stats.duration_ms,
            output.stats.images_kept,
            output.stats.images_proxied,
            output.stats.images_placeholder,
        );
    }
    Ok(())
}

/// Map CLI args to `SanitizeConfig`.
fn build_config(
    cli: &Cli,
    progress: Option<ProgressCallback>,
    cancel: CancellationToken,
) -> Result<SanitizeConfig> {
    let mut builder = SanitizeConfig::builder()
        .probe_timeout_ms(cli.probe_timeout)
        .proxy_timeout_ms(cli.proxy_timeout)
        .concurrency(cli.concurrency)
        .image_concurrency(cli.image_concurrency)
        .cancellation(cancel);

    if cli.offline {
        builder = builder.offline();
    }
    if !cli.proxies.is_empty() {
        builder = builder.proxies(cli.proxies.iter().cloned());
    }
    if cli.no_font_preload {
        builder = builder.font_preload_url(None);
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    builder.build().context("Invalid configuration")
}

/// Expand directories into their html/txt files, sorted by path. A file
/// named more than once is processed once.
fn collect_inputs(inputs: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = Vec::new();
    for input in inputs {
        if input.is_dir() {
            let mut found: Vec<PathBuf> = std::fs::read_dir(input)
                .with_context(|| format!("Failed to list {}", input.display()))?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|p| p.is_file() && is_supported(p))
                .collect();
            found.sort();
            files.extend(found);
        } else if input.is_file() {
            files.push(input.clone());
        } else {
            anyhow::bail!("Input not found: {}", input.display());
        }
    }
    let mut seen = HashSet::new();
    files.retain(|f| seen.insert(f.canonicalize().unwrap_or_else(|_| f.clone())));
    if files.is_empty() {
        anyhow::bail!("No .html, .htm or .txt files found in the given inputs");
    }
    Ok(files)
}

fn extension(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default()
}

fn is_supported(path: &Path) -> bool {
    matches!(extension(path).as_str(), "html" | "htm" | "txt")
}

fn is_plaintext(path: &Path) -> bool {
    extension(path) == "txt"
}

/// Where each source's document is written, one distinct path per source.
///
/// One input: `-o` is the file. Several inputs: `-o` is a directory and each
/// document is named after its source; without `-o` documents land next to
/// their sources as `<stem>.sanitized.html`. Sources whose names would clash
/// keep their extension (`welcome.txt.html`), and a numeric suffix separates
/// whatever still clashes.
fn output_paths(output: Option<&Path>, sources: &[PathBuf]) -> HashMap<PathBuf, PathBuf> {
    let mut planned = HashMap::new();
    if let (Some(out), [source]) = (output, sources) {
        planned.insert(source.clone(), out.to_path_buf());
        return planned;
    }

    let by_stem: Vec<PathBuf> = sources
        .iter()
        .map(|s| named_output(output, s, &file_label(s, false)))
        .collect();
    let mut taken = HashSet::new();
    for (source, candidate) in sources.iter().zip(&by_stem) {
        if planned.contains_key(source) {
            continue;
        }
        let clashes = by_stem.iter().filter(|c| *c == candidate).count() > 1;
        let label = file_label(source, clashes);
        let mut target = named_output(output, source, &label);
        let mut n = 2;
        while !taken.insert(target.clone()) {
            target = named_output(output, source, &format!("{label}-{n}"));
            n += 1;
        }
        planned.insert(source.clone(), target);
    }
    planned
}

fn file_label(source: &Path, with_extension: bool) -> String {
    let name = if with_extension {
        source.file_name()
    } else {
        source.file_stem()
    };
    name.and_then(|s| s.to_str()).unwrap_or("message").to_string()
}

fn named_output(output: Option<&Path>, source: &Path, label: &str) -> PathBuf {
    match output {
        Some(dir) => dir.join(format!("{label}.html")),
        None => source.with_file_name(format!("{label}.sanitized.html")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(output: Option<&str>, sources: &[&str]) -> Vec<PathBuf> {
        let sources: Vec<PathBuf> = sources.iter().map(PathBuf::from).collect();
        let planned = output_paths(output.map(Path::new), &sources);
        sources.iter().map(|s| planned[s].clone()).collect()
    }

    #[test]
    fn single_input_uses_output_as_file() {
        assert_eq!(plan(Some("out.html"), &["in/a.html"]), [PathBuf::from("out.html")]);
    }

    #[test]
    fn distinct_stems_keep_short_names() {
        assert_eq!(
            plan(Some("renders"), &["inbox/a.html", "inbox/b.txt"]),
            [PathBuf::from("renders/a.html"), PathBuf::from("renders/b.html")]
        );
        assert_eq!(
            plan(None, &["inbox/a.html", "inbox/b.txt"]),
            [
                PathBuf::from("inbox/a.sanitized.html"),
                PathBuf::from("inbox/b.sanitized.html")
            ]
        );
    }

    #[test]
    fn same_stem_different_extension_keeps_extension() {
        assert_eq!(
            plan(Some("renders"), &["inbox/welcome.html", "inbox/welcome.txt"]),
            [
                PathBuf::from("renders/welcome.html.html"),
                PathBuf::from("renders/welcome.txt.html")
            ]
        );
        assert_eq!(
            plan(None, &["inbox/welcome.html", "inbox/welcome.txt"]),
            [
                PathBuf::from("inbox/welcome.html.sanitized.html"),
                PathBuf::from("inbox/welcome.txt.sanitized.html")
            ]
        );
    }

    #[test]
    fn same_file_name_in_two_directories_gets_a_suffix() {
        assert_eq!(
            plan(Some("renders"), &["a/x.html", "b/x.html"]),
            [PathBuf::from("renders/x.html.html"), PathBuf::from("renders/x.html-2.html")]
        );
        // Next to their sources they cannot clash.
        assert_eq!(
            plan(None, &["a/x.html", "b/x.html"]),
            [
                PathBuf::from("a/x.sanitized.html"),
                PathBuf::from("b/x.sanitized.html")
            ]
        );
    }

    #[test]
    fn every_target_is_distinct() {
        let sources = ["a/x.html", "b/x.html", "c/x.htm", "x.txt", "d/x.html.html"];
        let targets = plan(Some("renders"), &sources);
        let unique: HashSet<_> = targets.iter().collect();
        assert_eq!(unique.len(), sources.len(), "{targets:?}");
    }
}
