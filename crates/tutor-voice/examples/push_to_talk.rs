//! Push-to-talk demo against the realtime API.
//!
//! Press Enter to start talking and Enter again to send. Type `i` + Enter to
//! interrupt the tutor, `q` + Enter to quit.
//!
//! Requires `OPENAI_API_KEY` (a `.env` file is loaded) and audio devices:
//!
//! ```bash
//! RUST_LOG=info cargo run -p tutor-voice --example push_to_talk
//! ```
//!
//! An optional first argument picks the voice, e.g. `-- shimmer`.

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tutor_voice::{
    Session, SessionConfig, SessionEvent, Speaker, SystemAudio, TurnState, WsConnector,
};

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut config = SessionConfig::load().context("loading configuration")?;
    if let Some(voice) = std::env::args().nth(1) {
        config.realtime = config.realtime.with_voice(voice);
    }
    if config.realtime.api_key.is_none() {
        warn!("OPENAI_API_KEY is not set; the server will likely reject the connection");
    }

    let mut session = Session::connect(config, WsConnector::new(), SystemAudio::new())
        .await
        .context("connecting to the realtime service")?;
    let mut events = session
        .take_events()
        .context("event receiver already taken")?;

    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                SessionEvent::Transcript(t) if t.is_complete => match t.speaker {
                    Speaker::User => println!("you:   {}", t.text),
                    Speaker::Model => println!("tutor: {}", t.text),
                },
                SessionEvent::TurnChanged(state) => info!(state = state.as_str(), "turn"),
                SessionEvent::NothingCaptured => println!("(didn't catch that, try again)"),
                SessionEvent::Interrupted => println!("(interrupted)"),
                SessionEvent::Error(err) => error!("{}", err),
                SessionEvent::Disconnected => {
                    println!("disconnected");
                    break;
                }
                _ => {}
            }
        }
    });

    println!("Press Enter to talk, Enter again to send. `i` interrupts, `q` quits.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let result = match line.trim() {
            "q" => break,
            "i" => session.interrupt().await,
            _ if session.turn_state() == TurnState::Recording => session.stop_recording().await,
            _ => session.start_recording().await,
        };
        if let Err(e) = result {
            warn!("{}", e);
        }
        if !session.is_connected() {
            break;
        }
    }

    session.disconnect().await?;
    Ok(())
}
