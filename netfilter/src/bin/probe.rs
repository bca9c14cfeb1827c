use clap::Parser;
use rand::Rng;
use shared::{info_query, InfoReply, CONNECTIONLESS_HEADER};
use std::net::SocketAddr;
use std::time::Instant;
use tokio::net::UdpSocket;
use tokio::time::{sleep, timeout, Duration};

/// Sends info queries (and optionally junk) at a filtered game server.
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Server address
    #[clap(short, long, default_value = "127.0.0.1:27015")]
    server: SocketAddr,
    /// Number of info queries to send
    #[clap(short, long, default_value = "1")]
    count: u32,
    /// Delay between queries in milliseconds
    #[clap(short, long, default_value = "100")]
    delay_ms: u64,
    /// Also send this many random datagrams before querying
    #[clap(long, default_value = "0")]
    flood: u32,
    /// How long to wait for each reply in milliseconds
    #[clap(long, default_value = "1000")]
    wait_ms: u64,
}

/// Random bytes behind a connectionless header, or a bare random datagram.
fn junk_datagram(rng: &mut impl Rng) -> Vec<u8> {
    let len = rng.gen_range(0..64);
    let mut data: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
    if rng.gen_bool(0.5) && data.len() >= 5 {
        data[..4].copy_from_slice(&CONNECTIONLESS_HEADER.to_le_bytes());
    }
    data
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Create local socket
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    println!("Probe socket bound to {}", socket.local_addr()?);

    if args.flood > 0 {
        let mut rng = rand::thread_rng();
        for _ in 0..args.flood {
            socket.send_to(&junk_datagram(&mut rng), args.server).await?;
        }
        println!("Sent {} junk datagrams", args.flood);
    }

    let query = info_query();
    let mut buf = [0u8; 2048];
    let mut answered = 0;

    for i in 0..args.count {
        let sent_at = Instant::now();
        socket.send_to(&query, args.server).await?;

        match timeout(Duration::from_millis(args.wait_ms), socket.recv_from(&mut buf)).await {
            Ok(Ok((len, addr))) => match InfoReply::decode(&buf[..len]) {
                Ok(reply) => {
                    answered += 1;
                    println!(
                        "#{} {} in {:?}: \"{}\" on {} ({}/{} players, {} bots) v{} tags \"{}\"",
                        i + 1,
                        addr,
                        sent_at.elapsed(),
                        reply.server_name,
                        reply.map_name,
                        reply.num_clients,
                        reply.max_clients,
                        reply.num_bots,
                        reply.game_version,
                        reply.tags
                    );
                }
                Err(e) => println!("#{} undecodable reply from {}: {}", i + 1, addr, e),
            },
            Ok(Err(e)) => println!("#{} receive error: {}", i + 1, e),
            Err(_) => println!("#{} no reply", i + 1),
        }

        if i + 1 < args.count {
            sleep(Duration::from_millis(args.delay_ms)).await;
        }
    }

    println!("{}/{} queries answered", answered, args.count);
    Ok(())
}
