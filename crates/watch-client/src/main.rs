use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{debug, error};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use runwatch_core::{EventId, SessionInfo, WireEvent, WireType};
use watch_client::{RunwatchClient, SessionWatcher, UiState, WatcherConfig};

/// runwatch - follow agent sessions live from the terminal
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Server base URL
    #[arg(
        short,
        long,
        env = "RUNWATCH_SERVER",
        default_value = "http://127.0.0.1:8090",
        global = true
    )]
    server: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a session for a query and start it
    Submit {
        query: String,

        /// Follow the session until it finishes
        #[arg(short, long)]
        watch: bool,

        /// Consumer group to read with (defaults to a private one)
        #[arg(short, long)]
        group: Option<String>,
    },

    /// Follow the events of a session
    Watch {
        #[arg(value_name = "SESSION_ID")]
        session_id: Uuid,

        /// Resume after this event id
        #[arg(long, value_name = "ID")]
        from: Option<EventId>,

        /// Consumer group to read with (defaults to a private one)
        #[arg(short, long)]
        group: Option<String>,
    },

    /// Show the state of a session
    Status {
        #[arg(value_name = "SESSION_ID")]
        session_id: Uuid,
    },

    /// Abort a running session
    Cancel {
        #[arg(value_name = "SESSION_ID")]
        session_id: Uuid,
    },

    /// List known sessions
    List,
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    init_tracing();

    match run().await {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            std::process::ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    let client = RunwatchClient::new(cli.server);

    match cli.command {
        Commands::Submit {
            query,
            watch,
            group,
        } => {
            let session = client
                .prepare_session(&query)
                .await
                .context("failed to create session")?;
            client
                .execute_session(session.id)
                .await
                .context("failed to start session")?;
            println!("{}", session.id);
            if watch {
                follow(&client, session.id, None, group).await?;
            }
            Ok(())
        }
        Commands::Watch {
            session_id,
            from,
            group,
        } => follow(&client, session_id, from, group).await,
        Commands::Status { session_id } => {
            let info = client.session_state(session_id).await?;
            print_info(&info);
            Ok(())
        }
        Commands::Cancel { session_id } => {
            let status = client.cancel_session(session_id).await?;
            println!("{} {}", session_id, status.as_str());
            Ok(())
        }
        Commands::List => {
            let sessions = client.list_sessions().await?;
            if sessions.is_empty() {
                println!("No sessions");
            }
            for info in &sessions {
                println!(
                    "{}  {:<9}  {:>5}  {}",
                    info.id,
                    info.status.as_str(),
                    info.last_event_id,
                    truncate(&info.query, 60)
                );
            }
            Ok(())
        }
    }
}

async fn follow(
    client: &RunwatchClient,
    session_id: Uuid,
    from: Option<EventId>,
    group: Option<String>,
) -> Result<()> {
    let mut watcher =
        SessionWatcher::spawn(client, session_id, from, group, WatcherConfig::default());
    let mut state = watcher.state();
    let mut shown = UiState::Standby;
    let mut state_open = true;

    loop {
        tokio::select! {
            frame = watcher.next_event() => {
                let Some(frame) = frame else { break };
                print_frame(&frame);
            }
            changed = state.changed(), if state_open => {
                if changed.is_err() {
                    state_open = false;
                    continue;
                }
                let current = *state.borrow_and_update();
                if current != shown {
                    println!("      -- {}", current);
                    shown = current;
                }
            }
        }
    }

    watcher.finish().await?;
    Ok(())
}

fn print_frame(frame: &WireEvent) {
    match frame.kind {
        WireType::KeepAlive => debug!("keep-alive"),
        WireType::Connected => {
            println!(
                "      connected (resume after {}, group {})",
                frame.data["resumeAfter"],
                frame.data["group"].as_str().unwrap_or("-")
            );
        }
        WireType::EventsMissed => {
            eprintln!(
                "warning: events {}..{} are no longer available",
                frame.data["requestedAfter"], frame.data["firstAvailable"]
            );
        }
        kind => {
            let id = frame.id.as_deref().unwrap_or("-");
            let payload = frame.payload().to_string();
            println!("{:>5} {:<16} {}", id, kind.as_str(), truncate(&payload, 100));
        }
    }
}

fn print_info(info: &SessionInfo) {
    println!("Session:     {}", info.id);
    println!("Query:       {}", info.query);
    println!("Status:      {}", info.status.as_str());
    println!("Created:     {}", info.created_at.to_rfc3339());
    if let Some(finished) = info.finished_at {
        println!("Finished:    {}", finished.to_rfc3339());
    }
    println!("Last event:  {}", info.last_event_id);
    println!("Subscribers: {}", info.subscribers);
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max.saturating_sub(3)).collect();
    out.push_str("...");
    out
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
