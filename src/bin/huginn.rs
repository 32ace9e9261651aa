//! huginn command-line front end
//!
//! Exercises the resilient client against a live backend.

use std::io::{self, IsTerminal, Read};
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use huginn::{ChatOptions, Config, InferenceClient, Message};

/// Huginn CLI
#[derive(Parser)]
#[command(name = "huginn")]
#[command(version)]
#[command(about = "Rate-governed, caching client for Ollama-compatible backends")]
struct Args {
    /// Config file (default: ~/.huginn/config.toml if present)
    #[arg(short, long, env = "HUGINN_CONFIG")]
    config: Option<PathBuf>,

    /// Backend base URL, overriding the config file
    #[arg(long, env = "HUGINN_BASE_URL")]
    base_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Chat with a model
    Chat {
        /// User message (or omit to read from stdin)
        prompt: Option<String>,
        /// Model to use instead of the configured chat model
        #[arg(short, long)]
        model: Option<String>,
        /// Sampling temperature
        #[arg(short, long)]
        temperature: Option<f32>,
    },

    /// Generate an embedding for text
    Embed {
        /// Text to embed (or omit to read from stdin)
        text: Option<String>,
    },

    /// Embed a text repeatedly and report governor, cache and client stats
    Probe {
        /// Number of embed calls
        #[arg(short = 'n', long, default_value_t = 5)]
        count: usize,
        /// Text to embed
        #[arg(default_value = "huginn probe")]
        text: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialise tracing (default: huginn=info; override with RUST_LOG).
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("huginn=info")),
        )
        .init();

    let args = Args::parse();

    let mut config = Config::load(args.config.as_deref())?;
    if let Some(url) = args.base_url {
        config.client.base_url = url;
    }

    let mut builder = config.client_builder();
    if let Some(store) = config.open_store().await? {
        builder = builder.cache_store(store);
    }
    let client = Arc::new(builder.build()?);
    let restored = client.restore_cache().await;
    if restored > 0 {
        tracing::info!(restored, "embedding cache restored");
    }

    match args.command {
        Command::Chat {
            prompt,
            model,
            temperature,
        } => {
            let prompt = resolve_text(prompt, "chat")?;
            let mut options = ChatOptions::new();
            if let Some(model) = model {
                options = options.model(model);
            }
            if let Some(t) = temperature {
                options = options.temperature(t);
            }
            let response = client.chat(&[Message::user(prompt)], None, &options).await?;
            println!("{}", response.message.content);
            let usage = response.usage;
            eprintln!(
                "model: {}, tokens: {} prompt + {} completion{}",
                response.model,
                usage.prompt_tokens,
                usage.completion_tokens,
                if usage.estimated { " (estimated)" } else { "" }
            );
        }

        Command::Embed { text } => {
            let text = resolve_text(text, "embed")?;
            let vector = client.embed(&text).await?;
            println!("model: {}", client.config().embed_model);
            println!("dimensions: {}", vector.len());
            println!(
                "values: [{:.4}, {:.4}, ... ({} total)]",
                vector.first().unwrap_or(&0.0),
                vector.get(1).unwrap_or(&0.0),
                vector.len()
            );
        }

        Command::Probe { count, text } => {
            for i in 0..count {
                let vector = client.embed(&text).await?;
                println!("embed {}: {} dimensions", i + 1, vector.len());
            }
            print_stats(&client);
        }
    }

    // Persistence failures are logged by the client and never fatal here.
    let _ = client.persist_cache().await;
    Ok(())
}

/// Text for a command: the argument, followed by piped stdin if any.
fn resolve_text(arg: Option<String>, command: &str) -> Result<String, Box<dyn std::error::Error>> {
    let mut piped = String::new();
    if !io::stdin().is_terminal() {
        io::stdin().read_to_string(&mut piped)?;
    }
    let parts: Vec<&str> = arg
        .as_deref()
        .into_iter()
        .chain(Some(piped.trim()))
        .filter(|part| !part.is_empty())
        .collect();
    if parts.is_empty() {
        return Err(format!("{command}: nothing to send; pass text or pipe it on stdin").into());
    }
    Ok(parts.join("\n\n"))
}

fn print_stats(client: &InferenceClient) {
    let stats = client.stats();
    let governor = client.governor().stats();
    let cache = client.cache().stats();

    println!("\nclient:");
    println!("  requests:    {}", stats.requests);
    println!("  retries:     {}", stats.retries);
    println!("  provisions:  {}", stats.provisions);
    println!("  failures:    {}", stats.failures);

    println!("governor:");
    println!("  mode:        {:?}", governor.state.mode);
    println!("  rpm:         {}", governor.state.current_rpm);
    println!("  in window:   {}", governor.in_window);
    if let Some(ema) = governor.state.ema_latency_ms {
        println!("  ema latency: {ema:.1} ms");
    }

    println!("cache:");
    println!("  size:        {}", cache.size);
    println!("  hits:        {}", cache.hits);
    println!("  misses:      {}", cache.misses);
    println!("  evictions:   {}", cache.evictions);
    println!("  memory:      {} bytes", cache.memory_bytes);
}
