//! End-to-end handoff.
//!
//! The parent test binds two listeners, then re-executes this test binary
//! filtered down to `child_generation_serves_inherited_listeners`, which
//! runs as the warm child generation. Outside of that spawn the child test
//! finds no inherited listeners and returns immediately.

use std::ffi::OsString;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use handoff::{Coordinator, HandoffConfig, HandoffError, Serve, Startup, Supervisor};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

const CHILD_TEST: &str = "child_generation_serves_inherited_listeners";

/// Answers `<name> <pid> <local addr>` per connection; `restart` asks the
/// coordinator to restart this generation.
async fn serve_replies(
    name: &'static str,
    coordinator: Coordinator,
    listener: TcpListener,
    shutdown: CancellationToken,
) -> io::Result<()> {
    loop {
        let (stream, _) = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            accepted = listener.accept() => accepted?,
        };

        let mut stream = BufReader::new(stream);
        let mut line = String::new();
        stream.read_line(&mut line).await?;

        if line.trim() == "restart" {
            stream.get_mut().write_all(b"restarting\n").await?;
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                let _ = coordinator.request_restart().await;
            });
        } else {
            let reply = format!("{name} {} {}\n", std::process::id(), listener.local_addr()?);
            stream.get_mut().write_all(reply.as_bytes()).await?;
        }
    }
}

fn replies(name: &'static str, coordinator: Coordinator) -> impl Serve {
    move |listener: TcpListener, shutdown: CancellationToken| {
        serve_replies(name, coordinator, listener, shutdown)
    }
}

async fn exchange(addr: SocketAddr, request: &str) -> String {
    tokio::time::timeout(Duration::from_secs(30), async {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(format!("{request}\n").as_bytes()).await.unwrap();
        let mut reply = String::new();
        BufReader::new(stream).read_line(&mut reply).await.unwrap();
        reply.trim().to_string()
    })
    .await
    .expect("no reply from child generation")
}

#[tokio::test]
async fn child_generation_serves_inherited_listeners() {
    let mut startup = Startup::from_env(HandoffConfig::default()).unwrap();
    if !startup.is_warm() {
        return;
    }

    assert_eq!(startup.handoff_env().resolve_handoff_slot("a").unwrap(), 3);
    assert_eq!(startup.handoff_env().resolve_handoff_slot("b").unwrap(), 4);

    // Addresses are ignored on a warm start; nothing is rebound.
    let a = startup.acquire("a", "tcp", "127.0.0.1:0").unwrap();
    let b = startup.acquire("b", "tcp", "127.0.0.1:0").unwrap();
    assert!(matches!(
        startup.acquire("c", "tcp", "127.0.0.1:0"),
        Err(HandoffError::NotFound { .. })
    ));

    let generation = startup.finish();
    assert_eq!(generation.registry().lookup("a").unwrap().raw_fd(), 3);
    assert_eq!(generation.registry().lookup("b").unwrap().raw_fd(), 4);

    let coordinator = generation.coordinator();
    assert!(coordinator.is_supervised());
    coordinator.start("a", a, replies("a", coordinator.clone()));
    coordinator.start("b", b, replies("b", coordinator.clone()));

    coordinator.wait().await.unwrap();
}

#[tokio::test]
async fn respawned_generation_resolves_slots_and_serves() {
    let config = HandoffConfig::default().with_grace_period(Duration::from_secs(5));
    let mut startup = Startup::from_parts(config, std::env::vars_os(), Vec::<OsString>::new()).unwrap();
    if startup.is_warm() {
        return;
    }

    let addr_a = startup.acquire("a", "tcp", "127.0.0.1:0").unwrap().local_addr().unwrap();
    let addr_b = startup.acquire("b", "tcp", "127.0.0.1:0").unwrap().local_addr().unwrap();
    let generation = startup.finish();
    let handoff_vars = generation
        .child_env()
        .iter()
        .filter(|(key, _)| key.to_string_lossy().starts_with("__graceful__"))
        .count();
    assert_eq!(handoff_vars, 2);

    let exe = std::env::current_exe().unwrap();
    let supervisor = Supervisor::new(generation, exe).with_args([
        CHILD_TEST,
        "--exact",
        "--nocapture",
        "--test-threads=1",
    ]);
    let mut child = supervisor.spawn_generation().unwrap();
    let pid = child.id().unwrap();

    for (name, addr) in [("a", addr_a), ("b", addr_b)] {
        let reply = exchange(addr, "hello").await;
        let fields: Vec<&str> = reply.split(' ').collect();
        assert_eq!(fields.len(), 3, "unexpected reply {reply:?}");
        assert_eq!(fields[0], name);
        assert_eq!(fields[1], pid.to_string(), "reply did not come from the child generation");
        assert_eq!(fields[2], addr.to_string());
    }

    assert_eq!(exchange(addr_a, "restart").await, "restarting");

    let status = tokio::time::timeout(Duration::from_secs(30), child.wait())
        .await
        .expect("child generation did not exit after restart")
        .unwrap();
    assert!(status.success(), "child generation failed: {status}");
}
