//! Webpilot CLI.
//!
//! Thin entry point around the agent: takes the task as a positional
//! argument, picks the model/provider, runs to completion, and prints the
//! final result.
//!
//! Usage examples:
//!   $ ANTHROPIC_API_KEY=... webpilot "find the cheapest flight to Lisbon"
//!   $ OPENAI_API_KEY=... webpilot "summarize the front page" gpt-4o openai

use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use webpilot::agent::{Agent, RunOptions};
use webpilot::config::{PilotConfig, ProviderKind, Verbosity};

#[derive(Parser)]
#[command(
    name = "webpilot",
    author,
    version,
    about = "Autonomous browser-driving agent"
)]
struct Cli {
    /// Natural-language task for the agent to complete.
    task: String,

    /// Model identifier passed to the provider.
    model: Option<String>,

    /// Provider wire shape: "anthropic" or "openai".
    provider: Option<String>,

    /// Maximum number of steps before the run is cut off.
    #[arg(long)]
    max_steps: Option<usize>,

    /// Show the browser window instead of running headless.
    #[arg(long)]
    show_browser: bool,

    /// Increase log verbosity (pass twice for DEBUG).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_env_logger();
    let cli = Cli::parse();

    let mut config = PilotConfig::from_env().context("failed to load configuration")?;
    if let Some(model) = cli.model {
        config.model_name = model;
    }
    if let Some(provider) = cli.provider {
        config.provider = match provider.to_ascii_lowercase().as_str() {
            "openai" => ProviderKind::OpenAi,
            "anthropic" => ProviderKind::Anthropic,
            other => anyhow::bail!("unknown provider '{other}'; expected anthropic or openai"),
        };
    }
    if let Some(max_steps) = cli.max_steps {
        config.max_steps = max_steps;
    }
    config.headless = !cli.show_browser;
    config.verbose = match cli.verbose {
        0 => config.verbose,
        1 => Verbosity::Medium,
        _ => Verbosity::Detailed,
    };

    info!(
        "running task with model={} provider={:?}",
        config.model_name, config.provider
    );

    let agent = Agent::from_config(config).context("failed to construct agent")?;
    let output = agent
        .run(RunOptions {
            prompt: Some(cli.task),
            ..RunOptions::default()
        })
        .await
        .context("agent run failed")?;

    info!("run finished after {} steps", output.step_count);

    if let Some(error) = &output.result.error {
        println!("Task ended with an error: {error}");
    } else if let Some(content) = &output.result.content {
        println!("{content}");
    } else {
        println!("Task ended without a result.");
    }

    if output.result.give_control {
        println!("The agent requested human control of the browser.");
    }

    Ok(())
}

fn init_env_logger() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .try_init();
}
