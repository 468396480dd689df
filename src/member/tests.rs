//! Member Module Tests
//!
//! Exercises the delivery layer against live coordinators under virtual
//! time: request/response round trips, the one-way leader message and its
//! ack, timeout into the retry queue, retry exhaustion, and the leader-only
//! fan-out operations.

#[cfg(test)]
mod tests {
    use crate::error::FlockError;
    use crate::flock::registry::FlockRegistry;
    use crate::flock::types::{FlockConfig, IncomingKind, IncomingMessage, MemberCallbacks};
    use crate::member::service::Member;
    use serde_json::json;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn unique_channel(tag: &str) -> String {
        format!("{}-{}", tag, uuid::Uuid::new_v4())
    }

    /// Callbacks that record every delivered user-level message.
    fn message_recorder() -> (MemberCallbacks, Arc<Mutex<Vec<IncomingMessage>>>) {
        let messages = Arc::new(Mutex::new(Vec::new()));
        let sink = messages.clone();
        let callbacks = MemberCallbacks::new().on_message(move |message| {
            let sink = sink.clone();
            async move {
                sink.lock().unwrap().push(message);
            }
        });
        (callbacks, messages)
    }

    /// One member per registry, so the two coordinators only meet over the
    /// shared medium, like two separate execution contexts would. The first
    /// member settles as leader before the second one joins.
    async fn two_contexts(
        channel: &str,
        leader_callbacks: MemberCallbacks,
        follower_callbacks: MemberCallbacks,
    ) -> (Member, Member, FlockRegistry, FlockRegistry) {
        let registry_a = FlockRegistry::new();
        let registry_b = FlockRegistry::new();
        let leader = Member::join_with_registry(
            FlockConfig::for_channel(channel),
            leader_callbacks,
            &registry_a,
        )
        .unwrap();
        tokio::time::sleep(Duration::from_millis(600)).await;
        let follower = Member::join_with_registry(
            FlockConfig::for_channel(channel),
            follower_callbacks,
            &registry_b,
        )
        .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        (leader, follower, registry_a, registry_b)
    }

    // ============================================================
    // REQUEST / RESPONSE
    // ============================================================

    #[tokio::test(start_paused = true)]
    async fn test_request_round_trip_resolves_with_leader_reply() {
        let channel = unique_channel("round-trip");
        let registry_a = FlockRegistry::new();
        let registry_b = FlockRegistry::new();

        let m1 = Member::join_with_registry(
            FlockConfig::for_channel(channel.as_str()),
            MemberCallbacks::new()
                .on_request(|payload| async move { json!({ "echo": payload }) }),
            &registry_a,
        )
        .unwrap();
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(m1.is_leader());

        let m2 = Member::join_with_registry(
            FlockConfig::for_channel(channel.as_str()),
            MemberCallbacks::new(),
            &registry_b,
        )
        .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let reply = m2.send_request(json!({ "x": 1 })).await.unwrap();
        assert_eq!(reply, json!({ "echo": { "x": 1 } }));
        let depths = m2.queue_depths();
        assert_eq!(depths.pending, 0);
        assert_eq!(depths.retry, 0);

        registry_a.reset();
        registry_b.reset();
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_sent_before_discovery_still_resolves() {
        let channel = unique_channel("early-send");
        let registry_a = FlockRegistry::new();
        let registry_b = FlockRegistry::new();

        let _m1 = Member::join_with_registry(
            FlockConfig::for_channel(channel.as_str()),
            MemberCallbacks::new().on_request(|_| async move { json!("pong") }),
            &registry_a,
        )
        .unwrap();
        tokio::time::sleep(Duration::from_millis(600)).await;

        // The follower fires before it has ever heard who the leader is;
        // requests are addressed to the role, not the member.
        let m2 = Member::join_with_registry(
            FlockConfig::for_channel(channel.as_str()),
            MemberCallbacks::new(),
            &registry_b,
        )
        .unwrap();
        let reply = m2.send_request(json!("ping")).await.unwrap();
        assert_eq!(reply, json!("pong"));

        registry_a.reset();
        registry_b.reset();
    }

    // ============================================================
    // MESSAGE TO LEADER
    // ============================================================

    #[tokio::test(start_paused = true)]
    async fn test_message_to_leader_delivered_once_and_acked() {
        let channel = unique_channel("leader-msg");
        let (leader_callbacks, messages) = message_recorder();
        let (m1, m2, registry_a, registry_b) =
            two_contexts(&channel, leader_callbacks, MemberCallbacks::new()).await;
        assert!(m1.is_leader());

        m2.send_message_to_leader(json!({ "note": 7 }));
        tokio::time::sleep(Duration::from_millis(500)).await;

        let messages = messages.lock().unwrap().clone();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].kind, IncomingKind::LeaderMessage);
        assert_eq!(messages[0].sender, *m2.id());
        assert_eq!(messages[0].payload, json!({ "note": 7 }));

        // The synthetic ack cleared the pending entry.
        let depths = m2.queue_depths();
        assert_eq!(depths.pending, 0);
        assert_eq!(depths.retry, 0);

        registry_a.reset();
        registry_b.reset();
    }

    // ============================================================
    // TIMEOUT AND RETRY
    // ============================================================

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_request_times_out_and_exhausts_retries() {
        let channel = unique_channel("exhaust");
        // The leader advertises no request handler, so nothing ever replies.
        let (m1, m2, registry_a, registry_b) =
            two_contexts(&channel, MemberCallbacks::new(), MemberCallbacks::new()).await;
        assert!(m1.is_leader());

        let (result, ()) = tokio::join!(m2.send_request(json!({ "x": 1 })), async {
            // After the first timeout the send sits in the retry queue,
            // never in both queues at once.
            tokio::time::sleep(Duration::from_millis(6000)).await;
            let depths = m2.queue_depths();
            assert_eq!(depths.pending, 0);
            assert_eq!(depths.retry, 1);
        });

        assert!(matches!(result, Err(FlockError::MaxRetriesReached(_))));
        let depths = m2.queue_depths();
        assert_eq!(depths.pending, 0);
        assert_eq!(depths.retry, 0);

        registry_a.reset();
        registry_b.reset();
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_is_abandoned_when_sender_becomes_leader() {
        let channel = unique_channel("self-leader");
        let (m1, m2, registry_a, registry_b) =
            two_contexts(&channel, MemberCallbacks::new(), MemberCallbacks::new()).await;
        assert!(m1.is_leader());

        let (result, ()) = tokio::join!(
            m2.send_request_with_timeout(json!({ "x": 1 }), Duration::from_secs(60)),
            async {
                tokio::time::sleep(Duration::from_millis(300)).await;
                // The leader's coordinator dies before replying; the
                // follower is promoted and drops its self-addressed work.
                registry_a.get(&channel).unwrap().shutdown();
            }
        );

        assert!(matches!(result, Err(FlockError::Abandoned(_))));
        assert!(m2.is_leader());
        let depths = m2.queue_depths();
        assert_eq!(depths.pending, 0);
        assert_eq!(depths.retry, 0);

        registry_b.reset();
    }

    // ============================================================
    // LEADER FAN-OUT
    // ============================================================

    #[tokio::test(start_paused = true)]
    async fn test_leader_broadcast_and_direct_message() {
        let registry = FlockRegistry::new();
        let channel = unique_channel("fanout");

        let m1 = Member::join_with_registry(
            FlockConfig::for_channel(channel.as_str()),
            MemberCallbacks::new(),
            &registry,
        )
        .unwrap();
        tokio::time::sleep(Duration::from_millis(600)).await;

        let (follower_callbacks, messages) = message_recorder();
        let m2 = Member::join_with_registry(
            FlockConfig::for_channel(channel.as_str()),
            follower_callbacks,
            &registry,
        )
        .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        m1.broadcast_to_members(json!({ "hello": "all" }));
        m1.send_to_member(m2.id(), json!({ "hello": "you" }));

        // Follower invocations of the fan-out calls are silent no-ops.
        m2.broadcast_to_members(json!({ "ignored": true }));
        m2.send_to_member(m1.id(), json!({ "ignored": true }));

        tokio::time::sleep(Duration::from_millis(200)).await;

        let messages = messages.lock().unwrap().clone();
        assert_eq!(messages.len(), 2);
        assert!(messages.iter().any(|m| {
            m.kind == IncomingKind::Broadcast && m.payload == json!({ "hello": "all" })
        }));
        assert!(messages.iter().any(|m| {
            m.kind == IncomingKind::DirectMessage && m.payload == json!({ "hello": "you" })
        }));
        assert!(messages.iter().all(|m| m.sender == *m1.id()));

        registry.reset();
    }

    #[tokio::test(start_paused = true)]
    async fn test_members_info_merges_local_and_remote() {
        let channel = unique_channel("members-info");
        let (m1, m2, registry_a, registry_b) =
            two_contexts(&channel, MemberCallbacks::new(), MemberCallbacks::new()).await;

        tokio::time::sleep(Duration::from_millis(1000)).await;

        let seen_by_m1 = m1.get_members_info();
        let seen_by_m2 = m2.get_members_info();
        assert!(seen_by_m1.contains(m1.id()));
        assert!(seen_by_m1.contains(m2.id()));
        assert!(seen_by_m2.contains(m1.id()));
        assert!(seen_by_m2.contains(m2.id()));

        registry_a.reset();
        registry_b.reset();
    }
}
