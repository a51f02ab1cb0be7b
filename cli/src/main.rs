//! SkillSwap terminal client
//!
//! Browse reservation slots, request sessions with a peer, answer requests
//! and keep an eye on upcoming meetings.

mod config;
mod render;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use skillswap_core::rtc::{SampleDevices, WebRtcConnector};
use skillswap_core::{Clock, MediaDevices, PeerConnector, SessionState, SkillSwapClient, TimeSlot};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "skillswap")]
#[command(about = "Schedule peer screen-share sessions")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Directory holding config.json and session.json
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Change the saved server settings
    Configure {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        tls: Option<bool>,
        #[arg(long)]
        api_prefix: Option<String>,
        /// Offset of the reference timezone in minutes
        #[arg(long)]
        utc_offset_minutes: Option<i32>,
    },

    /// Log in with an access key
    Login {
        #[arg(long)]
        email: String,
        #[arg(long)]
        key: String,
    },

    /// Forget the saved login
    Logout,

    /// List reservation slots
    Slots {
        /// Only this date (YYYY-MM-DD)
        #[arg(long)]
        date: Option<String>,
    },

    /// Request a session with a peer
    Request {
        peer: String,
        /// YYYY-MM-DD
        #[arg(long)]
        date: String,
        /// HH:00
        #[arg(long)]
        time: String,
        /// Minutes
        #[arg(long, default_value_t = 60)]
        duration: u32,
    },

    /// Pending request and meeting with a peer
    Status { peer: String },

    /// Accept the peer's pending request
    Accept { peer: String },

    /// Reject the peer's pending request
    Reject { peer: String },

    /// Every upcoming meeting
    Meetings,

    /// Delete a meeting
    Delete { id: i64 },

    /// Join a meeting that is under way, until it ends or is interrupted
    Join {
        id: i64,
        /// Share the screen once connected
        #[arg(long)]
        share: bool,
    },

    /// Follow a peer (or all meetings) until interrupted
    Watch { peer: Option<String> },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "skillswap=info,skillswap_core=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let data_dir = cli.data_dir.unwrap_or_else(config::data_dir);
    tracing::debug!("Data directory: {:?}", data_dir);

    let mut settings = config::load(&data_dir)?;

    let command = cli.command;
    if let Commands::Configure {
        host,
        port,
        tls,
        api_prefix,
        utc_offset_minutes,
    } = &command
    {
        if let Some(host) = host {
            settings.server_host = host.clone();
        }
        if let Some(port) = *port {
            settings.server_port = port;
        }
        if let Some(tls) = *tls {
            settings.use_tls = tls;
        }
        if let Some(prefix) = api_prefix {
            settings.api_prefix = prefix.clone();
        }
        if let Some(offset) = *utc_offset_minutes {
            settings.utc_offset_minutes = offset;
        }
        config::save(&settings, &data_dir)?;
        println!("Server: {}{}", settings.http_url(), settings.api_prefix);
        return Ok(());
    }

    let client = SkillSwapClient::new(settings)?;
    let now = client.clock().now().timestamp();
    if let Some(session) = config::load_session(&data_dir, now)? {
        client.restore(&session);
    }

    match command {
        Commands::Configure { .. } => {}
        Commands::Login { email, key } => {
            let email = email.trim().to_ascii_lowercase();
            let session = client.login(&email, &key).await?;
            config::save_session(&session, &data_dir)?;
            println!("Logged in as {}", session.email);
        }
        Commands::Logout => {
            client.logout();
            config::clear_session(&data_dir)?;
            println!("Logged out");
        }
        Commands::Slots { date } => {
            let slots: Vec<TimeSlot> = client
                .slots()
                .into_iter()
                .filter(|s| date.as_deref().map_or(true, |d| s.date == d))
                .collect();
            for line in render::slots(&slots) {
                println!("{}", line);
            }
        }
        Commands::Request {
            peer,
            date,
            time,
            duration,
        } => request(&client, &peer, &date, &time, duration).await?,
        Commands::Status { peer } => {
            let schedule = client.peer(&peer)?;
            schedule.refresh().await?;
            print_lines(render::snapshot(
                &schedule.snapshot(),
                schedule.me(),
                schedule.peer(),
                &client.clock().now(),
            ));
        }
        Commands::Accept { peer } => {
            let schedule = client.peer(&peer)?;
            schedule.refresh().await?;
            let meeting = schedule.accept().await?;
            println!("Meeting #{} booked with {}", meeting.id, peer);
        }
        Commands::Reject { peer } => {
            let schedule = client.peer(&peer)?;
            schedule.refresh().await?;
            schedule.reject().await?;
            println!("Request from {} rejected", peer);
        }
        Commands::Meetings => {
            let board = client.board()?;
            board.refresh().await?;
            print_lines(render::board(&board.entries(), &client.clock().zone()));
        }
        Commands::Delete { id } => {
            let board = client.board()?;
            board.delete(id).await?;
            println!("Meeting #{} deleted", id);
        }
        Commands::Join { id, share } => join(&client, id, share).await?,
        Commands::Watch { peer } => watch(&client, peer.as_deref()).await?,
    }

    Ok(())
}

fn print_lines(lines: Vec<String>) {
    for line in lines {
        println!("{}", line);
    }
}

async fn request(
    client: &SkillSwapClient,
    peer: &str,
    date: &str,
    time: &str,
    duration: u32,
) -> anyhow::Result<()> {
    let schedule = client.peer(peer)?;
    schedule.refresh().await?;
    if !schedule.can_schedule() {
        print_lines(render::snapshot(
            &schedule.snapshot(),
            schedule.me(),
            schedule.peer(),
            &client.clock().now(),
        ));
        anyhow::bail!("A request or meeting with {} already exists", peer);
    }

    let slot = TimeSlot::parse(date, time)?;
    let offered = client.slots().contains(&slot);
    let upcoming = slot
        .resolve(&client.clock().zone())
        .map_or(false, |at| at > client.clock().now());
    if !offered && upcoming {
        anyhow::bail!("{} {} is not an offered slot, see `skillswap slots`", slot.date, slot.time);
    }

    let created = schedule.request(Some(&slot), duration).await?;
    println!("Request #{} sent to {}", created.id, peer);
    Ok(())
}

async fn join(client: &SkillSwapClient, id: i64, share: bool) -> anyhow::Result<()> {
    let board = client.board()?;
    let meetings = board.refresh().await?;
    let meeting = meetings
        .iter()
        .find(|m| m.id == id)
        .ok_or_else(|| anyhow::anyhow!("No upcoming meeting #{}", id))?;

    let stream_id = format!("skillswap-{}", meeting.id);
    let devices: Arc<dyn MediaDevices> = Arc::new(SampleDevices::new(&stream_id, true, share));
    let connector: Arc<dyn PeerConnector> = Arc::new(WebRtcConnector);
    let mut session = client.media_session(meeting, devices, connector)?;

    session.start(client.clock().now()).await?;
    println!("Joined meeting #{} ({})", meeting.id, session.state());

    let mut shared = false;
    let mut tick = tokio::time::interval(std::time::Duration::from_secs(60));
    loop {
        tokio::select! {
            next = session.process_next() => {
                let Some(state) = next else { break };
                println!("Call {}", state);
                match state {
                    SessionState::Connected if share && !shared => {
                        shared = true;
                        match session.start_screen_share().await {
                            Ok(()) => println!("Sharing screen"),
                            Err(e) => println!("Screen share failed: {}", e),
                        }
                    }
                    SessionState::Failed => {
                        if let Some(failure) = session.failure() {
                            println!("{}", failure.message);
                        }
                        break;
                    }
                    SessionState::Ended => break,
                    _ => {}
                }
            }
            _ = tick.tick() => {
                let now = client.clock().now();
                if !meeting.is_joinable(&now) {
                    println!("Meeting time is up");
                    break;
                }
                let left = meeting.countdown(&now).map(|c| c.to_string()).unwrap_or_default();
                println!("{} elapsed, {}", session.elapsed_label(&now), left);
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    session.end().await;
    println!("Left meeting #{}", meeting.id);
    Ok(())
}

async fn watch(client: &SkillSwapClient, peer: Option<&str>) -> anyhow::Result<()> {
    let period = client.config().state_refresh();

    match peer {
        Some(peer) => {
            let schedule = Arc::new(client.peer(peer)?);
            let mut updates = schedule.subscribe();
            let _refresh = schedule.spawn_refresh(period);

            loop {
                tokio::select! {
                    changed = updates.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let snapshot = updates.borrow_and_update().clone();
                        println!("--");
                        print_lines(render::snapshot(&snapshot, schedule.me(), peer, &client.clock().now()));
                    }
                    _ = tokio::signal::ctrl_c() => break,
                }
            }
        }
        None => {
            let board = Arc::new(client.board()?);
            let mut updates = board.subscribe();
            let _refresh = board.spawn_refresh(period);

            loop {
                tokio::select! {
                    changed = updates.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        updates.borrow_and_update();
                        println!("--");
                        print_lines(render::board(&board.entries(), &client.clock().zone()));
                    }
                    _ = tokio::signal::ctrl_c() => break,
                }
            }
        }
    }

    Ok(())
}
