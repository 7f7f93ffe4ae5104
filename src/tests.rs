//! Integration tests: client and broker talking to each other over real sockets.
//!
//! Unlike the inline unit tests in each module, these spin up a broker on a
//! loopback port and drive it with the client, covering the full wire path
//! (connect, subscribe, publish, receive) for both protocol versions.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::types::{Authenticator, Message, ProtocolVersion};
use crate::{Broker, BrokerConfig, Client, ClientConfig};

/// Hand out a fresh loopback port for each test so they can run concurrently.
fn find_available_port() -> u16 {
    static PORT: AtomicUsize = AtomicUsize::new(19000);
    PORT.fetch_add(1, Ordering::SeqCst) as u16
}

async fn spawn_broker(config: BrokerConfig) {
    let broker = Broker::new(config);
    tokio::spawn(async move {
        let _ = broker.serve().await;
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
}

async fn spawn_broker_with(builder: crate::BrokerBuilder) {
    let broker = builder.build();
    tokio::spawn(async move {
        let _ = broker.serve().await;
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
}

mod connect_tests {
    use super::*;

    #[tokio::test]
    async fn connect_and_disconnect() {
        let port = find_available_port();
        let addr = format!("127.0.0.1:{port}");
        spawn_broker(BrokerConfig::new(&addr)).await;

        let client = Client::connect(ClientConfig::new(&addr, "basic-client")).await;
        assert!(client.is_ok(), "connect failed: {:?}", client.err());
        client.unwrap().disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let port = find_available_port();
        let addr = format!("127.0.0.1:{port}");
        spawn_broker(BrokerConfig::new(&addr)).await;

        let client = Client::connect(ClientConfig::new(&addr, "idempotent-client"))
            .await
            .unwrap();
        client.disconnect().await.unwrap();
        client.disconnect().await.unwrap();
        assert!(!client.is_running());
    }

    #[tokio::test]
    async fn v5_connect_with_session_expiry() {
        let port = find_available_port();
        let addr = format!("127.0.0.1:{port}");
        spawn_broker(BrokerConfig::new(&addr)).await;

        let client = Client::connect(
            ClientConfig::new(&addr, "v5-session")
                .with_protocol(ProtocolVersion::V5)
                .with_session_expiry(3600)
                .with_clean_session(false),
        )
        .await;
        assert!(client.is_ok(), "v5 connect with session expiry failed");
        client.unwrap().disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn duplicate_client_id_takes_over() {
        let port = find_available_port();
        let addr = format!("127.0.0.1:{port}");
        spawn_broker(BrokerConfig::new(&addr)).await;

        let first = Client::connect(ClientConfig::new(&addr, "dup-client")).await.unwrap();
        first.subscribe(&["takeover/topic"]).await.unwrap();

        // A second connection with the same client ID evicts the first.
        let second = Client::connect(ClientConfig::new(&addr, "dup-client")).await.unwrap();
        second.subscribe(&["takeover/topic"]).await.unwrap();

        // Publish from a third party; only the surviving client should see it,
        // since the first connection's subscription was pruned on takeover.
        let publisher = Client::connect(ClientConfig::new(&addr, "dup-publisher")).await.unwrap();
        publisher.publish("takeover/topic", b"hi").await.unwrap();

        let msg = second.recv_timeout(Duration::from_secs(2)).await;
        assert!(msg.is_ok(), "surviving connection should receive the message");

        publisher.disconnect().await.unwrap();
        second.disconnect().await.unwrap();
    }
}

mod pubsub_tests {
    use super::*;

    #[tokio::test]
    async fn publish_and_receive_qos0() {
        let port = find_available_port();
        let addr = format!("127.0.0.1:{port}");
        spawn_broker(BrokerConfig::new(&addr)).await;

        let client = Client::connect(ClientConfig::new(&addr, "pubsub-client")).await.unwrap();
        client.subscribe(&["test/topic"]).await.unwrap();
        client.publish("test/topic", b"hello").await.unwrap();

        let msg = client.recv_timeout(Duration::from_secs(2)).await.unwrap();
        assert_eq!(msg.topic, "test/topic");
        assert_eq!(msg.payload.as_ref(), b"hello");

        client.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn single_level_wildcard() {
        let port = find_available_port();
        let addr = format!("127.0.0.1:{port}");
        spawn_broker(BrokerConfig::new(&addr)).await;

        let sub = Client::connect(ClientConfig::new(&addr, "wildcard-sub")).await.unwrap();
        sub.subscribe(&["sensor/+/temp"]).await.unwrap();

        let pub_client = Client::connect(ClientConfig::new(&addr, "wildcard-pub")).await.unwrap();
        pub_client.publish("sensor/room1/temp", b"25").await.unwrap();

        let msg = sub.recv_timeout(Duration::from_secs(2)).await.unwrap();
        assert_eq!(msg.topic, "sensor/room1/temp");

        sub.disconnect().await.unwrap();
        pub_client.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn multi_level_wildcard() {
        let port = find_available_port();
        let addr = format!("127.0.0.1:{port}");
        spawn_broker(BrokerConfig::new(&addr)).await;

        let sub = Client::connect(ClientConfig::new(&addr, "hash-sub")).await.unwrap();
        sub.subscribe(&["home/#"]).await.unwrap();

        let pub_client = Client::connect(ClientConfig::new(&addr, "hash-pub")).await.unwrap();
        pub_client.publish("home/living/light", b"on").await.unwrap();

        let msg = sub.recv_timeout(Duration::from_secs(2)).await.unwrap();
        assert_eq!(msg.topic, "home/living/light");

        sub.disconnect().await.unwrap();
        pub_client.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn shared_subscription_round_robins_across_members() {
        let port = find_available_port();
        let addr = format!("127.0.0.1:{port}");
        spawn_broker(BrokerConfig::new(&addr)).await;

        let worker_a = Client::connect(ClientConfig::new(&addr, "worker-a")).await.unwrap();
        let worker_b = Client::connect(ClientConfig::new(&addr, "worker-b")).await.unwrap();
        worker_a.subscribe(&["$share/pool/jobs/incoming"]).await.unwrap();
        worker_b.subscribe(&["$share/pool/jobs/incoming"]).await.unwrap();

        let producer = Client::connect(ClientConfig::new(&addr, "producer")).await.unwrap();
        for i in 0..4u8 {
            producer.publish("jobs/incoming", &[i]).await.unwrap();
        }

        let mut seen_a = 0;
        let mut seen_b = 0;
        for _ in 0..4 {
            tokio::select! {
                m = worker_a.recv_timeout(Duration::from_millis(500)) => if m.is_ok() { seen_a += 1 },
                m = worker_b.recv_timeout(Duration::from_millis(500)) => if m.is_ok() { seen_b += 1 },
            }
        }

        assert_eq!(seen_a + seen_b, 4, "all four jobs should be delivered exactly once total");
        assert!(seen_a > 0 && seen_b > 0, "both group members should get a share of the work");

        producer.disconnect().await.unwrap();
        worker_a.disconnect().await.unwrap();
        worker_b.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn sys_topics_are_isolated_from_root_wildcard() {
        let port = find_available_port();
        let addr = format!("127.0.0.1:{port}");
        spawn_broker(BrokerConfig::new(&addr)).await;

        let sub = Client::connect(ClientConfig::new(&addr, "sys-watcher")).await.unwrap();
        sub.subscribe(&["#"]).await.unwrap();

        // Connecting a second client fires a $SYS/brokers/.../connected event,
        // which must not reach a plain "#" subscriber.
        let other = Client::connect(ClientConfig::new(&addr, "sys-trigger")).await.unwrap();
        other.publish("plain/topic", b"visible").await.unwrap();

        let msg = sub.recv_timeout(Duration::from_secs(2)).await.unwrap();
        assert_eq!(msg.topic, "plain/topic");

        // No further message should show up quickly; in particular not a $SYS one.
        let second = sub.recv_timeout(Duration::from_millis(300)).await;
        assert!(second.is_err(), "$SYS events must not leak into a root-level # subscription");

        other.disconnect().await.unwrap();
        sub.disconnect().await.unwrap();
    }
}

mod auth_and_acl_tests {
    use super::*;

    struct CredentialAuth {
        username: &'static str,
        password: &'static [u8],
    }

    impl Authenticator for CredentialAuth {
        fn authenticate(&self, _client_id: &str, username: &str, password: &[u8]) -> bool {
            username == self.username && password == self.password
        }
        fn acl(&self, _client_id: &str, _topic: &str, _write: bool) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn rejects_bad_credentials() {
        let port = find_available_port();
        let addr = format!("127.0.0.1:{port}");
        let builder = Broker::builder(BrokerConfig::new(&addr)).authenticator(CredentialAuth {
            username: "admin",
            password: b"secret",
        });
        spawn_broker_with(builder).await;

        let ok = Client::connect(
            ClientConfig::new(&addr, "auth-ok").with_credentials("admin", b"secret".to_vec()),
        )
        .await;
        assert!(ok.is_ok(), "correct credentials should connect");
        ok.unwrap().disconnect().await.unwrap();

        let bad = Client::connect(
            ClientConfig::new(&addr, "auth-bad").with_credentials("admin", b"wrong".to_vec()),
        )
        .await;
        assert!(bad.is_err(), "wrong credentials should be refused");
    }

    #[tokio::test]
    async fn v5_auth_failure_is_reported() {
        let port = find_available_port();
        let addr = format!("127.0.0.1:{port}");
        let builder = Broker::builder(BrokerConfig::new(&addr)).authenticator(CredentialAuth {
            username: "admin",
            password: b"secret",
        });
        spawn_broker_with(builder).await;

        let bad = Client::connect(
            ClientConfig::new(&addr, "v5-auth-bad")
                .with_protocol(ProtocolVersion::V5)
                .with_credentials("admin", b"wrong".to_vec()),
        )
        .await;
        assert!(bad.is_err(), "v5 auth should fail with wrong credentials");
    }

    struct PrefixAcl {
        prefix: &'static str,
        write: bool,
    }

    impl Authenticator for PrefixAcl {
        fn authenticate(&self, _: &str, _: &str, _: &[u8]) -> bool {
            true
        }
        fn acl(&self, _client_id: &str, topic: &str, write: bool) -> bool {
            if write == self.write {
                topic.starts_with(self.prefix)
            } else {
                true
            }
        }
    }

    #[tokio::test]
    async fn publish_denied_outside_allowed_prefix() {
        let port = find_available_port();
        let addr = format!("127.0.0.1:{port}");

        let received = Arc::new(Mutex::new(Vec::<String>::new()));
        let received_clone = Arc::clone(&received);

        struct RecordingHandler(Arc<Mutex<Vec<String>>>);
        impl crate::Handler for RecordingHandler {
            fn handle(&self, _client_id: &str, msg: &Message) {
                self.0.lock().push(msg.topic.clone());
            }
        }

        let builder = Broker::builder(BrokerConfig::new(&addr))
            .authenticator(PrefixAcl { prefix: "allowed/", write: true })
            .handler(RecordingHandler(received_clone));
        spawn_broker_with(builder).await;

        let client = Client::connect(ClientConfig::new(&addr, "acl-pub")).await.unwrap();
        client.publish("allowed/topic", b"yes").await.unwrap();
        client.publish("forbidden/topic", b"no").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let seen = received.lock();
        assert!(seen.contains(&"allowed/topic".to_string()));
        assert!(!seen.contains(&"forbidden/topic".to_string()));

        client.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn subscribe_denied_outside_allowed_prefix() {
        let port = find_available_port();
        let addr = format!("127.0.0.1:{port}");
        let builder = Broker::builder(BrokerConfig::new(&addr))
            .authenticator(PrefixAcl { prefix: "public/", write: false });
        spawn_broker_with(builder).await;

        let client = Client::connect(ClientConfig::new(&addr, "acl-sub")).await.unwrap();

        let allowed = client.subscribe(&["public/news"]).await;
        assert!(allowed.is_ok(), "subscribe to public/ should succeed");

        let denied = client.subscribe(&["private/data"]).await;
        assert!(denied.is_err(), "subscribe to private/ should be rejected");

        client.disconnect().await.unwrap();
    }
}

mod callback_tests {
    use super::*;

    #[tokio::test]
    async fn on_connect_and_on_disconnect_fire() {
        let port = find_available_port();
        let addr = format!("127.0.0.1:{port}");

        let connected = Arc::new(Mutex::new(Vec::<String>::new()));
        let disconnected = Arc::new(Mutex::new(Vec::<String>::new()));
        let connected_clone = Arc::clone(&connected);
        let disconnected_clone = Arc::clone(&disconnected);

        let builder = Broker::builder(BrokerConfig::new(&addr))
            .on_connect(move |id| connected_clone.lock().push(id.to_string()))
            .on_disconnect(move |id| disconnected_clone.lock().push(id.to_string()));
        spawn_broker_with(builder).await;

        let client = Client::connect(ClientConfig::new(&addr, "callback-test")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(connected.lock().contains(&"callback-test".to_string()));

        client.disconnect().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(
            disconnected.lock().contains(&"callback-test".to_string()),
            "on_disconnect should fire after disconnect"
        );
    }
}

mod cross_version_tests {
    use super::*;

    #[tokio::test]
    async fn v4_and_v5_clients_exchange_messages() {
        let port = find_available_port();
        let addr = format!("127.0.0.1:{port}");
        spawn_broker(BrokerConfig::new(&addr)).await;

        let v4_client = Client::connect(
            ClientConfig::new(&addr, "mixed-v4").with_protocol(ProtocolVersion::V4),
        )
        .await
        .unwrap();
        v4_client.subscribe(&["from-v5"]).await.unwrap();

        let v5_client = Client::connect(
            ClientConfig::new(&addr, "mixed-v5").with_protocol(ProtocolVersion::V5),
        )
        .await
        .unwrap();
        v5_client.subscribe(&["from-v4"]).await.unwrap();

        v4_client.publish("from-v4", b"hello from v4").await.unwrap();
        let msg = v5_client.recv_timeout(Duration::from_secs(2)).await.unwrap();
        assert_eq!(msg.payload.as_ref(), b"hello from v4");

        v5_client.publish("from-v5", b"hello from v5").await.unwrap();
        let msg = v4_client.recv_timeout(Duration::from_secs(2)).await.unwrap();
        assert_eq!(msg.payload.as_ref(), b"hello from v5");

        v4_client.disconnect().await.unwrap();
        v5_client.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn protocol_version_is_auto_detected_per_connection() {
        let port = find_available_port();
        let addr = format!("127.0.0.1:{port}");
        spawn_broker(BrokerConfig::new(&addr)).await;

        let v4 = Client::connect(ClientConfig::new(&addr, "auto-v4").with_protocol(ProtocolVersion::V4))
            .await;
        let v5 = Client::connect(ClientConfig::new(&addr, "auto-v5").with_protocol(ProtocolVersion::V5))
            .await;
        assert!(v4.is_ok() && v5.is_ok(), "broker should accept both protocol versions on one listener");

        v4.unwrap().disconnect().await.unwrap();
        v5.unwrap().disconnect().await.unwrap();
    }
}

mod config_limit_tests {
    use super::*;

    #[tokio::test]
    async fn subscription_limit_is_enforced() {
        let port = find_available_port();
        let addr = format!("127.0.0.1:{port}");
        spawn_broker(BrokerConfig::new(&addr).with_max_subscriptions_per_client(1)).await;

        let client = Client::connect(ClientConfig::new(&addr, "limited-client")).await.unwrap();
        assert!(client.subscribe(&["one/topic"]).await.is_ok());
        assert!(
            client.subscribe(&["two/topic"]).await.is_err(),
            "second subscription should be rejected once the per-client limit is hit"
        );

        client.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn oversized_topic_is_rejected() {
        let port = find_available_port();
        let addr = format!("127.0.0.1:{port}");
        spawn_broker(BrokerConfig::new(&addr).with_max_topic_length(8)).await;

        let client = Client::connect(ClientConfig::new(&addr, "long-topic-client")).await.unwrap();
        // Publishing is fire-and-forget at QoS 0; the broker just drops the
        // oversized publish server-side rather than acking an error back.
        let result = client.publish("this/topic/is/definitely/too/long", b"x").await;
        assert!(result.is_ok(), "publish call itself succeeds; rejection happens broker-side");

        client.disconnect().await.unwrap();
    }
}
