//! answerly: ask the answer service questions from the terminal.
//! Keeps one session open, streams each answer to stdout as it arrives and
//! prints its sources once the answer goes quiet.

use std::io::{self, Write};
use std::path::PathBuf;
use std::time::Duration;

use answerly_client::render::{citations_block, unprinted_suffix};
use answerly_client::{config, Citation, ConnectionState, QueryState, SessionHandle, SessionSnapshot};
use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::Instant;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "answerly")]
#[command(about = "Ask questions and stream cited answers", long_about = None)]
struct Cli {
    /// Config file (default: ~/.answerly/config.yaml)
    #[arg(long, env = "ANSWERLY_CONFIG")]
    config: Option<PathBuf>,

    /// Service endpoint, overrides the config
    #[arg(long)]
    url: Option<String>,

    /// Exit after the first answer
    #[arg(long)]
    once: bool,

    /// Seconds without new frames before an answer counts as finished
    #[arg(long, default_value_t = 2)]
    idle_secs: u64,

    /// Seconds to wait for the first connection
    #[arg(long, default_value_t = 5)]
    connect_timeout: u64,

    /// Seconds to wait for answer text before giving up on a query
    #[arg(long, default_value_t = 60)]
    answer_timeout: u64,

    #[arg(short, long)]
    verbose: bool,

    /// Question to ask first; further questions are read from stdin
    question: Option<String>,
}

fn init_logging(verbose: bool) {
    // RUST_LOG wins; stdout is reserved for answers.
    let default_level = if verbose { "debug" } else { "warn" };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(io::stderr)
        .with_target(false)
        .compact()
        .init();
}

fn load_config(cli: &Cli) -> Result<config::Config> {
    match &cli.config {
        Some(path) => config::load(path).with_context(|| format!("failed to load config from {}", path.display())),
        None => match config::default_config_path() {
            Some(path) => config::load_or_default(&path)
                .with_context(|| format!("failed to load config from {}", path.display())),
            None => Ok(config::Config::default()),
        },
    }
}

/// What has been printed for the current answer.
#[derive(Default)]
struct AnswerView {
    active: bool,
    printed: String,
    citations: Vec<Citation>,
    submitted_at: Option<Instant>,
}

impl AnswerView {
    fn start(&mut self) {
        self.active = true;
        self.printed.clear();
        self.citations.clear();
        self.submitted_at = Some(Instant::now());
    }

    fn update(&mut self, out: &mut impl Write, snap: &SessionSnapshot) -> io::Result<()> {
        if !self.active {
            return Ok(());
        }
        match unprinted_suffix(&snap.answer_text, &self.printed) {
            Some("") => {}
            Some(suffix) => {
                write!(out, "{}", suffix)?;
                self.printed.push_str(suffix);
            }
            None => {
                writeln!(out)?;
                write!(out, "{}", snap.answer_text)?;
                self.printed = snap.answer_text.clone();
            }
        }
        self.citations = snap.citations.clone();
        out.flush()
    }

    fn finish(&mut self, out: &mut impl Write) -> io::Result<()> {
        if !self.active {
            return Ok(());
        }
        self.active = false;
        self.submitted_at = None;
        writeln!(out)?;
        if !self.citations.is_empty() {
            write!(out, "\n{}", citations_block(&self.citations))?;
        }
        out.flush()
    }
}

async fn wait_connected(session: &SessionHandle, url: &str, timeout: Duration) -> Result<()> {
    let mut rx = session.subscribe();
    tokio::time::timeout(timeout, rx.wait_for(|s| s.connection == ConnectionState::Connected))
        .await
        .map_err(|_| anyhow!("connection failed: could not reach {} within {}s", url, timeout.as_secs()))?
        .map_err(|_| anyhow!("session closed before connecting"))?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let cfg = load_config(&cli)?;
    let url = cli.url.clone().unwrap_or_else(|| cfg.endpoint());
    let idle = Duration::from_secs(cli.idle_secs);
    let answer_timeout = Duration::from_secs(cli.answer_timeout);

    let session = SessionHandle::spawn(url.clone());
    wait_connected(&session, &url, Duration::from_secs(cli.connect_timeout)).await?;

    let stdout = io::stdout();
    let mut view = AnswerView::default();
    let mut snapshots = session.subscribe();
    let mut last_change = Instant::now();
    let mut answered = false;

    if let Some(question) = cli.question.as_deref() {
        session.submit_query(question).await.context("query rejected")?;
        view.start();
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        if !view.active && ((answered && cli.once) || !stdin_open) {
            break;
        }
        let state = snapshots.borrow().query_state;
        let idle_deadline = last_change + idle;
        let answer_deadline = view.submitted_at.map(|t| t + answer_timeout).unwrap_or(last_change);

        tokio::select! {
            line = lines.next_line(), if stdin_open => {
                let Some(line) = line.context("failed to read stdin")? else {
                    stdin_open = false;
                    continue;
                };
                let text = line.trim();
                match text {
                    "" => {}
                    "/quit" => break,
                    "/new" => {
                        view.finish(&mut stdout.lock())?;
                        session.reset_session().await;
                        eprintln!("-- new session --");
                    }
                    _ => {
                        view.finish(&mut stdout.lock())?;
                        match session.submit_follow_up(text).await {
                            Ok(()) => {
                                view.start();
                                last_change = Instant::now();
                            }
                            Err(e) => eprintln!("Error: {}", e),
                        }
                    }
                }
            }
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let snap = snapshots.borrow_and_update().clone();
                view.update(&mut stdout.lock(), &snap)?;
                last_change = Instant::now();
            }
            _ = tokio::time::sleep_until(idle_deadline), if view.active && state == QueryState::StreamingAnswer => {
                view.finish(&mut stdout.lock())?;
                answered = true;
            }
            _ = tokio::time::sleep_until(answer_deadline), if view.active && state == QueryState::AwaitingResults => {
                view.finish(&mut stdout.lock())?;
                if cli.once || !stdin_open {
                    bail!("no answer received within {}s", answer_timeout.as_secs());
                }
                eprintln!("Error: no answer received within {}s", answer_timeout.as_secs());
            }
        }
    }

    view.finish(&mut stdout.lock())?;
    session.shutdown().await;
    Ok(())
}
