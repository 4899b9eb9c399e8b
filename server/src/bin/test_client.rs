use clap::Parser;
use shared::{
    decode_batch, encode_frames, encode_hello, ClientFrame, MapXY, Payload, PlayerIdMsg,
    RemoveSpriteMsg, ServerFrame, ServerOpcode, SpriteMsg, SpriteMsg16, StatusMsg, DEFAULT_PORT,
    MAX_DATAGRAM,
};
use std::net::SocketAddr;
use tokio::net::UdpSocket;
use tokio::time::{sleep, timeout, Duration, Instant};

/// Joins a running server, plays a few seconds of scripted input and leaves.
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Server address
    #[clap(short, long, default_value_t = SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)))]
    server: SocketAddr,
    /// Player name
    #[clap(short, long, default_value = "tester")]
    name: String,
    /// Join as a spectator
    #[clap(long)]
    spectator: bool,
    /// Team to request
    #[clap(short, long, default_value = "0")]
    team: u8,
    /// How long to stay connected, in seconds
    #[clap(short, long, default_value = "5")]
    duration: u64,
}

fn describe(frame: &ServerFrame) -> String {
    match frame.opcode {
        ServerOpcode::StatusMessage => match StatusMsg::from_bytes(frame.payload) {
            Ok(msg) => format!("status \"{}\"", msg.text()),
            Err(e) => format!("bad status: {}", e),
        },
        ServerOpcode::PlayerId => match PlayerIdMsg::from_bytes(frame.payload) {
            Ok(msg) => format!("player {} is {}", msg.owner_id, msg.name()),
            Err(e) => format!("bad player id: {}", e),
        },
        ServerOpcode::StartAck | ServerOpcode::ChangeViewport => {
            match MapXY::from_bytes(frame.payload) {
                Ok(at) => format!("{:?} at ({}, {})", frame.opcode, at.mapx, at.mapy),
                Err(e) => format!("bad map position: {}", e),
            }
        }
        ServerOpcode::Sprite => match SpriteMsg::from_bytes(frame.payload) {
            Ok(s) => format!("sprite {} ({}) at +({}, {})", s.objid, s.id, s.x, s.y),
            Err(e) => format!("bad sprite: {}", e),
        },
        ServerOpcode::Sprite16 => match SpriteMsg16::from_bytes(frame.payload) {
            Ok(s) => format!("sprite {} ({}) at ({}, {})", s.objid, s.id, s.x, s.y),
            Err(e) => format!("bad sprite: {}", e),
        },
        ServerOpcode::RemoveSprite => match RemoveSpriteMsg::from_bytes(frame.payload) {
            Ok(msg) => format!("sprite {} removed ({})", msg.objid, msg.reason),
            Err(e) => format!("bad sprite removal: {}", e),
        },
        other => format!("{:?}", other),
    }
}

async fn receive_batch(socket: &UdpSocket, wait: Duration) -> Option<Vec<u8>> {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    match timeout(wait, socket.recv_from(&mut buf)).await {
        Ok(Ok((len, _))) => Some(buf[..len].to_vec()),
        Ok(Err(e)) => {
            println!("Receive error: {}", e);
            None
        }
        Err(_) => None,
    }
}

fn print_batch(data: &[u8]) -> Vec<ServerOpcode> {
    match decode_batch(data) {
        Ok(frames) => {
            for frame in &frames {
                println!("  {}", describe(frame));
            }
            frames.iter().map(|frame| frame.opcode).collect()
        }
        Err(e) => {
            println!("  undecodable batch: {}", e);
            Vec::new()
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    println!("Client socket bound to {}", socket.local_addr()?);

    println!("Joining {} as {}", args.server, args.name);
    socket
        .send_to(&encode_hello(&args.name, args.spectator), args.server)
        .await?;

    let Some(reply) = receive_batch(&socket, Duration::from_secs(2)).await else {
        println!("No reply from server");
        return Ok(());
    };
    if !print_batch(&reply).contains(&ServerOpcode::AckOk) {
        println!("Join refused");
        return Ok(());
    }

    let setup = encode_frames(&[
        ClientFrame::ClientReady,
        ClientFrame::TeamRequest(args.team),
        ClientFrame::MatchmakingStart,
        ClientFrame::MatchmakingReady,
    ])?;
    socket.send_to(&setup, args.server).await?;

    let end = Instant::now() + Duration::from_secs(args.duration);
    let mut controls: u8 = 0;
    while Instant::now() < end {
        controls = controls.wrapping_add(1);
        let input = encode_frames(&[ClientFrame::Control(controls), ClientFrame::Ping])?;
        socket.send_to(&input, args.server).await?;

        while let Some(batch) = receive_batch(&socket, Duration::from_millis(50)).await {
            println!("Batch of {} bytes:", batch.len());
            print_batch(&batch);
        }
        sleep(Duration::from_millis(200)).await;
    }

    println!("Leaving");
    socket
        .send_to(&encode_frames(&[ClientFrame::Bye])?, args.server)
        .await?;
    while let Some(batch) = receive_batch(&socket, Duration::from_secs(1)).await {
        if print_batch(&batch).contains(&ServerOpcode::ByeAck) {
            println!("Server acknowledged leave");
            break;
        }
    }

    Ok(())
}
