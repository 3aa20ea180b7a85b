use anyhow::Result;
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use duckchat_proxy::openai::resolve_model;
use duckchat_proxy::relay::{ChunkSink, SinkClosed, relay};
use duckchat_proxy::types::{ChatRequest, Part};
use duckchat_proxy::{AppState, Config, run_server};
use std::io::{self, Write};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "duckchat-proxy")]
#[command(about = "OpenAI-compatible proxy for DuckDuckGo AI chat", long_about = None)]
struct Args {
    #[command(flatten)]
    config: Config,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP proxy (default)
    Serve,
    /// Talk to duckchat directly from the terminal
    Chat {
        /// The message to send; starts an interactive session when omitted
        #[arg(short, long)]
        message: Option<String>,

        /// The model to use
        #[arg(long)]
        model: Option<String>,

        /// Enable streaming output
        #[arg(short, long)]
        stream: bool,
    },
}

/// Prints the content of each relayed chunk as it arrives.
struct StdoutSink;

#[async_trait]
impl ChunkSink for StdoutSink {
    async fn write_chunk(&mut self, chunk: String) -> Result<(), SinkClosed> {
        let payload = chunk.trim_start_matches("data: ").trim_end();
        let Ok(json) = serde_json::from_str::<serde_json::Value>(payload) else {
            return Ok(());
        };
        if let Some(content) = json["choices"][0]["delta"]["content"].as_str() {
            print!("{}", content);
            io::stdout().flush().map_err(|_| SinkClosed)?;
        }
        Ok(())
    }
}

async fn ask(
    state: &AppState,
    request: &ChatRequest,
    stream: bool,
) -> duckchat_proxy::Result<String> {
    let response = state.open_chat(request).await?;
    relay(response.bytes_stream(), &mut StdoutSink, &request.model, stream).await
}

async fn chat(
    state: &AppState,
    message: Option<String>,
    model: Option<String>,
    stream: bool,
) -> Result<()> {
    let model = resolve_model(model.as_deref());

    if let Some(message) = message {
        let mut request = ChatRequest::new(&model);
        request.add_message("user", message, None);
        let response = ask(state, &request, stream).await?;
        if stream {
            println!();
        } else {
            println!("{}", response);
        }
        return Ok(());
    }

    println!("DuckDuckGo AI Chat (type 'exit' to quit)");
    println!("Model: {}", model);
    println!();

    let mut history = ChatRequest::new(&model);
    loop {
        print!("> ");
        io::stdout().flush()?;

        let mut input = String::new();
        if io::stdin().read_line(&mut input)? == 0 {
            break;
        }
        let input = input.trim();

        if input.is_empty() {
            continue;
        }
        if input == "exit" || input == "quit" {
            println!("Goodbye!");
            break;
        }

        history.add_message("user", input, None);
        match ask(state, &history, stream).await {
            Ok(response) => {
                if stream {
                    println!("\n");
                } else {
                    println!("{}\n", response);
                }
                let parts = Some(vec![Part::text(response.clone())]);
                history.add_message("assistant", response, parts);
            }
            Err(err) => {
                // keep the history replayable
                history.messages.pop();
                eprintln!("Error: {}\n", err);
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = match std::env::var("RUST_LOG") {
        Ok(directives) if !args.debug => EnvFilter::new(directives),
        _ if args.debug => EnvFilter::new("debug"),
        _ => EnvFilter::new("info"),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => run_server(&args.config).await,
        Command::Chat { message, model, stream } => {
            let state = AppState::from_config(&args.config)?;
            let outcome = chat(&state, message, model, stream).await;
            state.shutdown().await;
            outcome
        }
    }
}
