use clap::Parser;
use log::{debug, error, info, warn};
use netfilter::{ControlCommand, FilterConfig, Gamemode, Netfilter, ReceivePipeline, ServerInfo};
use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::time::{interval, Duration, Instant, MissedTickBehavior};

// Command line arguments
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// IP address to bind the game socket to
    #[clap(short = 'H', long, default_value = "0.0.0.0")]
    host: String,
    /// Game port to listen on
    #[clap(short, long, default_value = "27015")]
    port: u16,
    /// How often the game loop drains the socket (per second)
    #[clap(short, long, default_value = "66")]
    tick_rate: u32,
    /// TOML file with filter settings
    #[clap(short, long)]
    config: Option<PathBuf>,
    /// Read the socket from a dedicated thread
    #[clap(long)]
    threaded: bool,
    /// Answer info queries from the reply cache
    #[clap(long)]
    reply_cache: bool,
    /// Apply strict checks to connectionless packets
    #[clap(long)]
    strict: bool,
    /// Rate limit info queries
    #[clap(long)]
    limit_queries: bool,
    /// Keep a ring of recent raw datagrams
    #[clap(long)]
    sampling: bool,
    /// Name advertised in info replies
    #[clap(long, default_value = "netfilter test server")]
    server_name: String,
    /// Map advertised in info replies
    #[clap(long, default_value = "gm_construct")]
    map: String,
    /// Slot count advertised in info replies
    #[clap(long, default_value = "24")]
    max_players: u32,
    /// Seconds between stats log lines
    #[clap(long, default_value = "10")]
    stats_interval: u64,
}

/// Stand-in game server used when running the filter on its own.
/// Every distinct peer that sent accepted traffic counts as a player.
struct StandaloneServer {
    name: String,
    map: String,
    max_players: u32,
    port: u16,
    players: AtomicU32,
}

impl ServerInfo for StandaloneServer {
    fn server_name(&self) -> String {
        self.name.clone()
    }
    fn map_name(&self) -> String {
        self.map.clone()
    }
    fn game_dir(&self) -> String {
        "garrysmod".to_string()
    }
    fn game_description(&self) -> String {
        "Sandbox".to_string()
    }
    fn app_id(&self) -> u32 {
        4000
    }
    fn num_clients(&self) -> u32 {
        self.players.load(Ordering::Relaxed)
    }
    fn num_bots(&self) -> u32 {
        0
    }
    fn max_clients(&self) -> u32 {
        self.max_players
    }
    fn has_password(&self) -> bool {
        false
    }
    fn is_secure(&self) -> bool {
        false
    }
    fn steam_id(&self) -> Option<u64> {
        None
    }
    fn udp_port(&self) -> u16 {
        self.port
    }
    fn gamemode(&self) -> Gamemode {
        Gamemode {
            name: "sandbox".to_string(),
            workshop_id: None,
        }
    }
    fn game_version(&self) -> Option<String> {
        None
    }
}

/// Peers idle longer than this stop counting as players.
const PEER_TIMEOUT: Duration = Duration::from_secs(30);
/// Upper bound on tracked peers, whatever the traffic looks like.
const MAX_PEERS: usize = 1024;

/// Recently active peers, keyed by address and port.
struct PeerTracker {
    last_seen: HashMap<SocketAddr, Instant>,
    capacity: usize,
    timeout: Duration,
}

impl PeerTracker {
    fn new(capacity: usize, timeout: Duration) -> Self {
        Self {
            last_seen: HashMap::new(),
            capacity,
            timeout,
        }
    }

    /// Records traffic from `from`. Returns true when it became tracked.
    fn touch(&mut self, from: SocketAddr, now: Instant) -> bool {
        if let Some(seen) = self.last_seen.get_mut(&from) {
            *seen = now;
            return false;
        }
        if self.last_seen.len() >= self.capacity {
            self.check_timeouts(now);
            if self.last_seen.len() >= self.capacity {
                return false;
            }
        }
        self.last_seen.insert(from, now);
        true
    }

    /// Drops peers that went quiet. Returns how many were removed.
    fn check_timeouts(&mut self, now: Instant) -> usize {
        let before = self.last_seen.len();
        let timeout = self.timeout;
        self.last_seen
            .retain(|_, seen| now.saturating_duration_since(*seen) <= timeout);
        before - self.last_seen.len()
    }

    fn len(&self) -> usize {
        self.last_seen.len()
    }
}

/// Parses arguments and attaches the filter, then hands over to the game loop.
fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => FilterConfig::load(path)?,
        None => FilterConfig::default(),
    };
    config.threaded_socket |= args.threaded;
    config.reply_cache |= args.reply_cache;
    config.strict_validation |= args.strict;
    config.query_limiter |= args.limit_queries;
    config.packet_sampling |= args.sampling;

    let address = format!("{}:{}", args.host, args.port);
    let socket = UdpSocket::bind(&address)?;
    info!("Listening on {}", socket.local_addr()?);

    let server = Arc::new(StandaloneServer {
        name: args.server_name.clone(),
        map: args.map.clone(),
        max_players: args.max_players,
        port: args.port,
        players: AtomicU32::new(0),
    });
    let filter = Arc::new(Netfilter::new(&config, server.clone()));

    // The pipeline owns a private runtime; it is started before ours exists.
    let mut pipeline = ReceivePipeline::new(socket, filter, config.queue_capacity)?;
    if let Err(e) = pipeline.start() {
        error!("Failed to start receive pipeline: {}", e);
        return Err(e.into());
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        // Create bounded channel for control commands
        let (cmd_sender, cmd_receiver) = mpsc::channel::<ControlCommand>(1000);
        let control_handle = tokio::spawn(read_control_commands(cmd_sender));

        tokio::select! {
            _ = run_game_loop(&pipeline, &server, cmd_receiver, &args) => {}
            result = control_handle => {
                if let Err(e) = result {
                    error!("Control task panicked: {}", e);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down gracefully...");
            }
        }
    });

    pipeline.stop();
    info!("Final counters: {}", pipeline.filter().stats());
    Ok(())
}

/// Reads operator commands from stdin for the lifetime of the process.
async fn read_control_commands(cmd_sender: mpsc::Sender<ControlCommand>) {
    forward_control_lines(BufReader::new(tokio::io::stdin()), cmd_sender).await;

    // Detached stdin; keep the filter running.
    std::future::pending::<()>().await;
}

/// Forwards one command per line until the input ends or fails. A bad line
/// is logged and skipped.
async fn forward_control_lines<R>(input: R, cmd_sender: mpsc::Sender<ControlCommand>)
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = input.split(b'\n');
    loop {
        let raw = match lines.next_segment().await {
            Ok(Some(raw)) => raw,
            Ok(None) => return,
            Err(e) => {
                warn!("Failed to read control input: {}", e);
                return;
            }
        };

        match ControlCommand::from_line(&raw) {
            Ok(Some(cmd)) => {
                if cmd_sender.send(cmd).await.is_err() {
                    return;
                }
            }
            Ok(None) => {}
            Err(e) => warn!("{}", e),
        }
    }
}

/// Drains screened datagrams at the tick rate, the way a game server's
/// frame loop would.
async fn run_game_loop(
    pipeline: &ReceivePipeline,
    server: &StandaloneServer,
    mut cmd_receiver: mpsc::Receiver<ControlCommand>,
    args: &Args,
) {
    let mut interval_timer =
        interval(Duration::from_secs_f32(1.0 / args.tick_rate.max(1) as f32));
    interval_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let stats_every = Duration::from_secs(args.stats_interval.max(1));
    let mut last_stats = Instant::now();
    let mut peers = PeerTracker::new(MAX_PEERS, PEER_TIMEOUT);
    let mut buf = vec![0u8; shared::MAX_DATAGRAM_SIZE];

    loop {
        interval_timer.tick().await;

        // Handle incoming commands
        while let Ok(cmd) = cmd_receiver.try_recv() {
            process_control_command(pipeline.filter(), cmd);
        }

        loop {
            match pipeline.recv_from(&mut buf) {
                Ok((len, from)) => {
                    if peers.touch(from, Instant::now()) {
                        debug!("New peer {} ({} bytes)", from, len);
                        server.players.store(peers.len() as u32, Ordering::Relaxed);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("Error receiving packet: {}", e);
                    break;
                }
            }
        }

        if last_stats.elapsed() >= stats_every {
            last_stats = Instant::now();
            let expired = peers.check_timeouts(last_stats);
            if expired > 0 {
                debug!("{} peers timed out", expired);
                server.players.store(peers.len() as u32, Ordering::Relaxed);
            }
            info!(
                "{} (queued {}, threaded {})",
                pipeline.filter().stats(),
                pipeline.queue().len(),
                pipeline.is_threaded()
            );
        }
    }
}

/// Applies a control command to the filter and prints anything it reports.
fn process_control_command(filter: &Netfilter, cmd: ControlCommand) {
    let description = format!("{:?}", cmd);
    match cmd.apply(filter) {
        Ok(Some(output)) => println!("{}", output),
        Ok(None) => info!("Applied {}", description),
        Err(e) => warn!("Command {} failed: {}", description, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[tokio::test]
    async fn test_bad_control_line_is_skipped() {
        let (cmd_sender, mut cmd_receiver) = mpsc::channel(8);
        let input: &[u8] = b"stats\n\xff\xfe\nbogus\n\nsample next\n";
        forward_control_lines(input, cmd_sender).await;

        assert_eq!(cmd_receiver.recv().await, Some(ControlCommand::Stats));
        assert_eq!(cmd_receiver.recv().await, Some(ControlCommand::NextSample));
        assert_eq!(cmd_receiver.recv().await, None);
    }

    #[test]
    fn test_rotating_ports_stay_bounded() {
        let mut peers = PeerTracker::new(8, Duration::from_secs(30));
        let now = Instant::now();
        for port in 1000..1300 {
            peers.touch(peer(port), now);
        }
        assert_eq!(peers.len(), 8);
        assert!(!peers.touch(peer(2000), now));
    }

    #[test]
    fn test_idle_peers_time_out() {
        let mut peers = PeerTracker::new(8, Duration::from_secs(30));
        let start = Instant::now();
        assert!(peers.touch(peer(1), start));
        assert!(peers.touch(peer(2), start));
        assert!(!peers.touch(peer(2), start + Duration::from_secs(20)));

        assert_eq!(peers.check_timeouts(start + Duration::from_secs(40)), 1);
        assert_eq!(peers.len(), 1);
        assert!(peers.touch(peer(1), start + Duration::from_secs(40)));
    }

    #[test]
    fn test_full_tracker_makes_room_after_timeout() {
        let mut peers = PeerTracker::new(2, Duration::from_secs(30));
        let start = Instant::now();
        peers.touch(peer(1), start);
        peers.touch(peer(2), start);
        assert!(!peers.touch(peer(3), start + Duration::from_secs(10)));
        assert!(peers.touch(peer(3), start + Duration::from_secs(31)));
        assert_eq!(peers.len(), 1);
    }
}
