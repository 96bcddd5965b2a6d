use agent_session_client::{
    capture::CpalMicrophone, transport::WebSocketTransport, AgentClient, AgentEvent, ClientConfig,
};
use anyhow::Context;
use clap::Parser;
use futures_util::StreamExt;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser)]
#[command(name = "agent-client")]
#[command(about = "Interactive client for the realtime voice/text agent")]
#[command(long_about = "
Connects to the agent and forwards each line typed on stdin as a question.
Events from the agent are printed as JSON, one per line.

Configuration comes from the environment (or .env):
  AGENT_ENDPOINT                 full WebSocket URL, or
  AGENT_BASE_URL + AGENT_APP_ID  base URL plus application id

COMMANDS (typed on stdin):
  /mic    toggle microphone streaming
  /new    start a new session
  /quit   exit
")]
struct Args {
    /// Start streaming the microphone right after connecting
    #[arg(long)]
    mic: bool,

    /// Input device name for audio capture
    #[arg(long)]
    input_device: Option<String>,

    /// Override the endpoint from the environment
    #[arg(long)]
    endpoint: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let config = match &args.endpoint {
        Some(endpoint) => ClientConfig::with_endpoint(endpoint.clone()),
        None => ClientConfig::from_env(),
    }
    .context("Failed to load client configuration")?;

    let client = AgentClient::new(
        config,
        Arc::new(WebSocketTransport::new()),
        Arc::new(CpalMicrophone::new(args.input_device.clone())),
    );

    let mut events = client.events();
    let printer = tokio::spawn(async move {
        while let Some(event) = events.next().await {
            match event {
                Ok(event) => print_event(&event),
                Err(e) => log::warn!("Event stream lagged: {}", e),
            }
        }
    });

    client.connect().await.context("Failed to connect to agent")?;
    log::info!("🚀 Connected, type a question or /quit");

    if args.mic {
        client.start_mic().await;
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                log::info!("🛑 Interrupted");
                break;
            }
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    break;
                };
                match line.trim() {
                    "/quit" => break,
                    "/mic" if client.is_capturing() => client.stop_mic().await,
                    "/mic" => client.start_mic().await,
                    "/new" => {
                        if let Err(e) = client.start_new_session().await {
                            log::error!("❌ Failed to start a new session: {}", e);
                        }
                    }
                    question => client.send_text(question).await,
                }
            }
        }
    }

    client.dispose().await;
    let _ = printer.await;
    Ok(())
}

fn print_event(event: &AgentEvent) {
    // the meter is too chatty for stdout
    if matches!(event, AgentEvent::AudioLevel { .. }) {
        log::trace!("{:?}", event);
        return;
    }
    match serde_json::to_string(event) {
        Ok(json) => println!("{}", json),
        Err(e) => log::error!("Failed to serialize event: {}", e),
    }
}
