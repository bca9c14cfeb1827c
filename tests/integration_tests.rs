//! Integration tests for the filter and its receive pipeline
//!
//! These tests attach the filter to real loopback sockets and talk to it the
//! way game clients and query tools would.

use netfilter::{
    ControlCommand, FilterConfig, Gamemode, Netfilter, ReceivePipeline, SampledPacket,
    ServerInfo,
};
use shared::{info_query, InfoReply};
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

struct TestServer;

impl ServerInfo for TestServer {
    fn server_name(&self) -> String {
        "Integration Server".to_string()
    }
    fn map_name(&self) -> String {
        "gm_flatgrass".to_string()
    }
    fn game_dir(&self) -> String {
        "/home/srv/garrysmod".to_string()
    }
    fn game_description(&self) -> String {
        "Sandbox".to_string()
    }
    fn app_id(&self) -> u32 {
        4000
    }
    fn num_clients(&self) -> u32 {
        5
    }
    fn num_bots(&self) -> u32 {
        0
    }
    fn max_clients(&self) -> u32 {
        16
    }
    fn has_password(&self) -> bool {
        false
    }
    fn is_secure(&self) -> bool {
        true
    }
    fn steam_id(&self) -> Option<u64> {
        Some(76561198000000000)
    }
    fn udp_port(&self) -> u16 {
        27015
    }
    fn gamemode(&self) -> Gamemode {
        Gamemode {
            name: "sandbox".to_string(),
            workshop_id: Some("123456".to_string()),
        }
    }
    fn game_version(&self) -> Option<String> {
        Some("2024.06.28".to_string())
    }
}

/// Binds a loopback game socket and starts a pipeline on it.
fn attach(config: FilterConfig) -> (ReceivePipeline, SocketAddr) {
    let socket = UdpSocket::bind("127.0.0.1:0").expect("Failed to bind game socket");
    let address = socket.local_addr().unwrap();
    let filter = Arc::new(Netfilter::new(&config, Arc::new(TestServer)));
    let mut pipeline = ReceivePipeline::new(socket, filter, config.queue_capacity).unwrap();
    pipeline.start().unwrap();
    (pipeline, address)
}

fn threaded() -> FilterConfig {
    FilterConfig {
        threaded_socket: true,
        ..FilterConfig::default()
    }
}

fn client() -> UdpSocket {
    let socket = UdpSocket::bind("127.0.0.1:0").expect("Failed to bind client socket");
    socket
        .set_read_timeout(Some(Duration::from_millis(500)))
        .unwrap();
    socket
}

/// Game traffic: a positive channel number followed by a payload byte.
fn game_packet(marker: u8) -> Vec<u8> {
    vec![0x01, 0x00, 0x00, 0x00, marker]
}

/// Polls the consumer side until a datagram shows up or `wait` passes.
fn recv_within(pipeline: &ReceivePipeline, wait: Duration) -> Option<(Vec<u8>, SocketAddr)> {
    let deadline = Instant::now() + wait;
    let mut buf = [0u8; 2048];
    loop {
        match pipeline.recv_from(&mut buf) {
            Ok((len, from)) => return Some((buf[..len].to_vec(), from)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if Instant::now() >= deadline {
                    return None;
                }
                thread::sleep(Duration::from_millis(2));
            }
            Err(e) => panic!("Unexpected receive error: {}", e),
        }
    }
}

fn apply(pipeline: &ReceivePipeline, line: &str) -> Option<String> {
    line.parse::<ControlCommand>()
        .unwrap()
        .apply(pipeline.filter())
        .unwrap()
}

/// RECEIVE PIPELINE TESTS
mod pipeline_tests {
    use super::*;

    /// Game traffic passes through the receive thread unchanged
    #[test]
    fn threaded_pipeline_delivers_game_traffic() {
        let (pipeline, address) = attach(threaded());
        assert!(pipeline.is_threaded());

        let client = client();
        client.send_to(&game_packet(7), address).unwrap();

        let (data, from) = recv_within(&pipeline, Duration::from_secs(1)).expect("no packet");
        assert_eq!(data, game_packet(7));
        assert_eq!(from, client.local_addr().unwrap());
        assert_eq!(pipeline.filter().stats().delivered, 1);
    }

    /// Without the receive thread the consumer screens inline
    #[test]
    fn direct_reads_are_screened() {
        let (pipeline, address) = attach(FilterConfig::default());
        assert!(!pipeline.is_threaded());

        let client = client();
        client.send_to(&[0xFE, 0xFF, 0xFF, 0xFF, 0x00], address).unwrap();
        client.send_to(&game_packet(1), address).unwrap();

        let (data, _) = recv_within(&pipeline, Duration::from_secs(1)).expect("no packet");
        assert_eq!(data, game_packet(1));
        assert_eq!(pipeline.filter().stats().invalid, 1);
    }

    /// A cached reply goes straight back to the querier and the game never
    /// sees the query
    #[test]
    fn cached_info_reply_reaches_client() {
        let (pipeline, address) = attach(FilterConfig {
            reply_cache: true,
            ..threaded()
        });

        let client = client();
        client.send_to(&info_query(), address).unwrap();

        let mut buf = [0u8; 2048];
        let (len, from) = client.recv_from(&mut buf).expect("no info reply");
        assert_eq!(from, address);

        let reply = InfoReply::decode(&buf[..len]).unwrap();
        assert_eq!(reply.server_name, "Integration Server");
        assert_eq!(reply.game_dir, "garrysmod");
        assert_eq!(reply.num_clients, 5);
        assert_eq!(reply.max_clients, 16);
        assert_eq!(reply.game_version, "2024.06.28");
        assert_eq!(reply.tags, " gm:sandbox gmws:123456");

        assert!(recv_within(&pipeline, Duration::from_millis(300)).is_none());
        assert_eq!(pipeline.filter().stats().answered, 1);
    }

    /// An async query tool gets its answer from the receive thread
    #[tokio::test]
    async fn async_client_receives_cached_reply() {
        let (pipeline, address) = attach(FilterConfig {
            reply_cache: true,
            ..threaded()
        });

        let socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        socket.send_to(&info_query(), address).await.unwrap();

        let mut buf = [0u8; 2048];
        let (len, _) = tokio::time::timeout(Duration::from_secs(1), socket.recv_from(&mut buf))
            .await
            .expect("no info reply")
            .unwrap();
        let reply = InfoReply::decode(&buf[..len]).unwrap();
        assert_eq!(reply.map_name, "gm_flatgrass");
        assert_eq!(pipeline.filter().stats().answered, 1);
    }

    /// Info queries are passed on to the game when the cache is off
    #[test]
    fn info_query_reaches_game_without_cache() {
        let (pipeline, address) = attach(threaded());
        let client = client();
        client.send_to(&info_query(), address).unwrap();

        let (data, _) = recv_within(&pipeline, Duration::from_secs(1)).expect("no packet");
        assert_eq!(data, info_query());
    }

    /// Denied sources are dropped before anything else looks at them
    #[test]
    fn denied_source_never_reaches_consumer() {
        let (pipeline, address) = attach(FilterConfig {
            reply_cache: true,
            deny_list_enabled: true,
            deny_list: vec!["127.0.0.1".parse().unwrap()],
            ..threaded()
        });

        let client = client();
        client.send_to(&game_packet(1), address).unwrap();
        client.send_to(&info_query(), address).unwrap();

        let mut buf = [0u8; 2048];
        assert!(client.recv_from(&mut buf).is_err());
        assert!(recv_within(&pipeline, Duration::from_millis(200)).is_none());
        assert_eq!(pipeline.filter().stats().denied, 2);
    }

    /// Only the allowed number of queries per window get an answer
    #[test]
    fn info_queries_are_rate_limited() {
        let (pipeline, address) = attach(FilterConfig {
            reply_cache: true,
            query_limiter: true,
            max_queries_per_window: 2,
            ..threaded()
        });

        let client = client();
        client
            .set_read_timeout(Some(Duration::from_millis(300)))
            .unwrap();
        for _ in 0..4 {
            client.send_to(&info_query(), address).unwrap();
        }

        let mut buf = [0u8; 2048];
        let mut replies = 0;
        while client.recv_from(&mut buf).is_ok() {
            replies += 1;
        }
        assert_eq!(replies, 2);

        let stats = pipeline.filter().stats();
        assert_eq!(stats.answered, 2);
        assert_eq!(stats.rate_limited, 2);
        assert!(recv_within(&pipeline, Duration::from_millis(100)).is_none());
    }

    /// Stopping returns promptly even when the socket is silent
    #[test]
    fn stop_is_bounded() {
        let (mut pipeline, _) = attach(threaded());
        thread::sleep(Duration::from_millis(50));

        let start = Instant::now();
        pipeline.stop();
        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(!pipeline.is_threaded());

        // Restarting after a stop works.
        pipeline.start().unwrap();
        assert!(pipeline.is_threaded());
    }

    /// A full queue pauses socket reads; nothing is lost and order is kept
    #[test]
    fn full_queue_applies_backpressure() {
        let (pipeline, address) = attach(FilterConfig {
            queue_capacity: 4,
            ..threaded()
        });

        let client = client();
        for marker in 0..10u8 {
            client.send_to(&game_packet(marker), address).unwrap();
        }

        let deadline = Instant::now() + Duration::from_secs(1);
        while !pipeline.queue().is_full() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(pipeline.queue().is_full());

        thread::sleep(Duration::from_millis(100));
        assert_eq!(pipeline.queue().len(), 4);
        assert!(pipeline.filter().stats().stalls > 0);

        let markers: Vec<u8> = (0..10)
            .map(|_| recv_within(&pipeline, Duration::from_secs(1)).expect("packet lost").0[4])
            .collect();
        assert_eq!(markers, (0..10).collect::<Vec<u8>>());
    }

    /// Turning the threaded mode off hands reads back to the consumer
    #[test]
    fn toggling_threaded_mode_keeps_traffic_flowing() {
        let (pipeline, address) = attach(threaded());
        let client = client();

        client.send_to(&game_packet(1), address).unwrap();
        assert!(recv_within(&pipeline, Duration::from_secs(1)).is_some());

        apply(&pipeline, "threaded off");
        thread::sleep(Duration::from_millis(250));
        assert!(!pipeline.is_threaded());

        client.send_to(&game_packet(2), address).unwrap();
        let (data, _) = recv_within(&pipeline, Duration::from_secs(1)).expect("no packet");
        assert_eq!(data, game_packet(2));

        apply(&pipeline, "threaded on");
        client.send_to(&game_packet(3), address).unwrap();
        let (data, _) = recv_within(&pipeline, Duration::from_secs(1)).expect("no packet");
        assert_eq!(data, game_packet(3));
    }
}

/// CONTROL SURFACE TESTS
mod control_tests {
    use super::*;

    /// Sampled traffic can be exported and read back
    #[test]
    fn sampled_traffic_round_trips_through_file() {
        let (pipeline, address) = attach(threaded());
        apply(&pipeline, "sampling on");
        apply(&pipeline, "validation on");

        let client = client();
        let port = client.local_addr().unwrap().port();
        client.send_to(&[0xFF, 0xFF, 0xFF, 0xFF, b'U', 1], address).unwrap();
        client.send_to(&game_packet(9), address).unwrap();
        assert!(recv_within(&pipeline, Duration::from_secs(1)).is_some());

        let path = std::env::temp_dir().join(format!("netfilter-it-{}.bin", std::process::id()));
        let output = apply(&pipeline, &format!("sample save {}", path.display())).unwrap();
        assert!(output.starts_with("saved 2 samples"));

        let bytes = std::fs::read(&path).unwrap();
        let samples: Vec<SampledPacket> = bincode::deserialize(&bytes).unwrap();
        let _ = std::fs::remove_file(&path);

        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].data, vec![0xFF, 0xFF, 0xFF, 0xFF, b'U', 1]);
        assert_eq!(samples[0].host_port(), port);
        assert_eq!(samples[1].data, game_packet(9));
        assert_eq!(pipeline.filter().stats().invalid, 1);
    }

    /// List edits take effect on the live pipeline
    #[test]
    fn deny_list_edits_apply_immediately() {
        let (pipeline, address) = attach(threaded());
        let client = client();

        apply(&pipeline, "deny add 127.0.0.1");
        apply(&pipeline, "deny on");
        client.send_to(&game_packet(1), address).unwrap();
        assert!(recv_within(&pipeline, Duration::from_millis(300)).is_none());

        apply(&pipeline, "deny remove 127.0.0.1");
        client.send_to(&game_packet(2), address).unwrap();
        let (data, _) = recv_within(&pipeline, Duration::from_secs(1)).expect("no packet");
        assert_eq!(data, game_packet(2));
    }
}
