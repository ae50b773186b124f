use clap::Parser;
use coinfall_shared::{ClientMessage, ServerMessage, WORLD_WIDTH};
use futures_util::{SinkExt, StreamExt};
use log::{info, warn};
use rand::Rng;
use std::time::Duration;
use tokio::time::interval;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

/// Headless client that joins the room and wanders left and right.
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// WebSocket URL of the room
    #[clap(short, long, default_value = "ws://127.0.0.1:8080")]
    url: String,
    /// Display name to join with
    #[clap(short, long, default_value = "bot")]
    name: String,
    /// Move messages per second
    #[clap(short, long, default_value = "10")]
    rate: u32,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let (socket, _) = connect_async(args.url.as_str()).await?;
    info!("Connected to {}", args.url);
    let (mut sink, mut frames) = socket.split();

    let join = ClientMessage::Join {
        name: args.name.clone(),
        user_id: None,
        cosmetic_id: None,
    };
    sink.send(Message::text(join.to_json()?)).await?;

    let mut ticker = interval(Duration::from_secs_f32(1.0 / args.rate.max(1) as f32));
    let mut x = WORLD_WIDTH / 2.0;

    loop {
        tokio::select! {
            frame = frames.next() => {
                let Some(frame) = frame else {
                    info!("Server closed the connection");
                    break;
                };
                match frame? {
                    Message::Text(text) => match ServerMessage::from_json(text.as_str()) {
                        Ok(ServerMessage::Welcome { player_id }) => info!("Joined as player {}", player_id),
                        Ok(ServerMessage::GameOver { players }) => {
                            for standing in players {
                                info!("{}: {}", standing.name, standing.score);
                            }
                        }
                        Ok(message) => info!("Received {}", message.kind()),
                        Err(e) => warn!("Unreadable server message: {}", e),
                    },
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            _ = ticker.tick() => {
                x = (x + rand::thread_rng().gen_range(-40.0..40.0)).clamp(0.0, WORLD_WIDTH);
                let movement = ClientMessage::Move { x };
                sink.send(Message::text(movement.to_json()?)).await?;
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    Ok(())
}
