use flock_fabric::{FlockConfig, FlockRegistry, IncomingKind, Member, MemberCallbacks};
use serde_json::json;
use std::time::Duration;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args: Vec<String> = std::env::args().collect();

    let mut member_count: usize = 3;
    let mut channel = "flock_demo".to_string();
    let mut debug = false;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--members" => {
                member_count = args
                    .get(i + 1)
                    .and_then(|value| value.parse().ok())
                    .unwrap_or_else(|| usage(&args[0]));
                i += 2;
            }
            "--channel" => {
                channel = args.get(i + 1).cloned().unwrap_or_else(|| usage(&args[0]));
                i += 2;
            }
            "--debug" => {
                debug = true;
                i += 1;
            }
            _ => {
                usage::<()>(&args[0]);
            }
        }
    }

    if member_count == 0 {
        usage::<()>(&args[0]);
    }

    tracing::info!("Starting {} members on channel {}", member_count, channel);

    let mut members = Vec::new();
    for n in 0..member_count {
        let config = FlockConfig {
            channel_name: channel.clone(),
            debug,
            ..FlockConfig::default()
        };
        let callbacks = MemberCallbacks::new()
            .on_request(move |payload| async move {
                json!({ "handled_by": n, "echo": payload })
            })
            .on_message(move |message| async move {
                let kind = match message.kind {
                    IncomingKind::LeaderMessage => "leader message",
                    IncomingKind::Broadcast => "broadcast",
                    IncomingKind::DirectMessage => "direct message",
                };
                tracing::info!("Member #{} got {} from {}", n, kind, message.sender);
            })
            .on_leadership_change(move |leader| async move {
                match leader {
                    Some(id) => tracing::info!("Member #{} sees leader {}", n, id),
                    None => tracing::info!("Member #{} stepped down", n),
                }
            });
        members.push(Member::join(config, callbacks)?);
    }

    // Followers poke the leader once a leader has settled.
    let requester = members.pop().expect("at least one member");
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(3));
        loop {
            interval.tick().await;
            if requester.is_leader() {
                requester.broadcast_to_members(json!({ "tick": "from-leader" }));
                continue;
            }
            match requester.send_request(json!({ "ping": true })).await {
                Ok(reply) => tracing::info!("Request answered: {}", reply),
                Err(e) => tracing::warn!("Request failed: {}", e),
            }
        }
    });

    // Stats reporter.
    let registry = FlockRegistry::global();
    let stats_channel = channel.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(5));
        loop {
            interval.tick().await;
            if let Some(flock) = registry.get(&stats_channel) {
                let snapshot = flock.snapshot();
                tracing::info!(
                    "Channel {}: leader={:?} local_members={} fresh_remote={}",
                    snapshot.channel_name,
                    snapshot.leader_id,
                    snapshot.local_members.len(),
                    snapshot.fresh_remote_members
                );
            }
        }
    });

    tracing::info!("Press Ctrl+C to shutdown");
    tokio::signal::ctrl_c().await?;

    for member in &members {
        member.resign();
    }
    Ok(())
}

fn usage<T>(program: &str) -> T {
    eprintln!(
        "Usage: {} [--members <n>] [--channel <name>] [--debug]",
        program
    );
    eprintln!("Example: {} --members 3 --channel flock_demo", program);
    std::process::exit(1);
}
