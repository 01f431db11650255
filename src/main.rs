use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use anyhow::bail;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc::UnboundedReceiver;

use critique::buffer::BufferSettings;
use critique::client::{InferenceClient, PromptBuilder};
use critique::config::Config;
use critique::manager::{TaskHandlers, TaskManager};
use critique::source::load_source;
use critique::task::TaskEvent;

const USAGE: &str = "usage: critique review <file> | critique check";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    dotenvy::dotenv().ok();

    let config = Config::load();
    config.validate()?;
    let client = Arc::new(InferenceClient::from_config(&config)?);

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.as_slice() {
        [cmd] if cmd == "check" => check(&client).await,
        [cmd, file] if cmd == "review" => review(client, &config, Path::new(file)).await,
        _ => bail!(USAGE),
    }
}

async fn check(client: &InferenceClient) -> anyhow::Result<()> {
    if client.test_connection().await {
        println!("inference server reachable at {}", client.liveness_url());
        Ok(())
    } else {
        bail!("inference server not reachable at {}", client.liveness_url())
    }
}

async fn review(client: Arc<InferenceClient>, config: &Config, path: &Path) -> anyhow::Result<()> {
    let code = load_source(path).await?;

    let liveness_url = client.liveness_url();
    let prompts = PromptBuilder::new(config.model.clone(), config.max_conversation_length);
    let (mut manager, mut events) =
        TaskManager::new(client, prompts, BufferSettings::from_config(config));
    if !manager.test_connection().await {
        tracing::warn!(url = %liveness_url, "inference server did not answer the liveness check");
    }
    let mut console = Console::default();

    manager.start_review(code);
    match drive(&mut manager, &mut events, &mut console).await? {
        Outcome::Finished => {}
        Outcome::Cancelled => return Ok(()),
        Outcome::Failed => bail!("review of {} failed", path.display()),
    }

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    loop {
        eprint!("\nfollow-up (empty line to quit)> ");
        let _ = std::io::stderr().flush();

        let Some(line) = stdin.next_line().await? else {
            break;
        };
        let question = line.trim();
        if question.is_empty() {
            break;
        }

        manager.start_followup(console.transcript.clone(), question);
        if drive(&mut manager, &mut events, &mut console).await? == Outcome::Cancelled {
            break;
        }
    }

    tracing::info!(stats = ?manager.stats(), "session finished");
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Finished,
    Failed,
    Cancelled,
}

/// Pump events for the current task until it ends or Ctrl-C cancels it.
async fn drive(
    manager: &mut TaskManager<InferenceClient>,
    events: &mut UnboundedReceiver<TaskEvent>,
    console: &mut Console,
) -> anyhow::Result<Outcome> {
    console.outcome = None;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                manager.cancel_current();
                eprintln!("\n[cancelled]");
                return Ok(Outcome::Cancelled);
            }
            event = events.recv() => {
                let Some(event) = event else {
                    bail!("task event channel closed");
                };
                manager.deliver(event, console);
                if let Some(outcome) = console.outcome.take() {
                    return Ok(outcome);
                }
            }
        }
    }
}

/// Streams content to stdout and keeps everything shown so far as context
/// for follow-up questions.
#[derive(Default)]
struct Console {
    transcript: String,
    outcome: Option<Outcome>,
}

impl TaskHandlers for Console {
    fn on_content(&mut self, text: &str) {
        self.transcript.push_str(text);
        let mut stdout = std::io::stdout().lock();
        let _ = stdout.write_all(text.as_bytes());
        let _ = stdout.flush();
    }

    fn on_progress(&mut self, message: &str) {
        tracing::info!("{message}");
    }

    fn on_error(&mut self, message: &str) {
        eprintln!("\nerror: {message}");
        self.outcome = Some(Outcome::Failed);
    }

    fn on_finished(&mut self) {
        println!();
        self.outcome = Some(Outcome::Finished);
    }
}
