//! Randomized-trace invariants for the connection registry.
//!
//! For any sequence of add/remove/snapshot operations, every cardinality
//! cap holds at every point, and draining the registry leaves it empty.

use std::sync::Arc;

use proptest::prelude::*;
use wireline_proto::SessionKeys;
use wireline_server::{ConnRegistry, Connection, RegistryLimits};

type TestConn = Connection<tokio::io::DuplexStream>;

#[derive(Debug, Clone)]
enum Op {
    Add(u8),
    Del(usize),
    Snapshot(u8),
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u8..6).prop_map(Op::Add),
        (0usize..16).prop_map(Op::Del),
        (0u8..6).prop_map(Op::Snapshot),
    ]
}

fn new_conn(keys: &SessionKeys, user: u8) -> Arc<TestConn> {
    let (a, _b) = tokio::io::duplex(64);
    Arc::new(Connection::new(a, keys, "svc", format!("user-{user}"), None))
}

proptest! {
    #[test]
    fn caps_hold_across_arbitrary_traces(ops in proptest::collection::vec(arb_op(), 1..80)) {
        let limits = RegistryLimits { max_conns: 8, max_users: 3, max_conns_per_user: 2 };
        let registry: ConnRegistry<tokio::io::DuplexStream> = ConnRegistry::new(limits);
        let keys = SessionKeys::derive(b"registry traces", None);
        let mut live: Vec<Arc<TestConn>> = Vec::new();

        for op in ops {
            match op {
                Op::Add(user) => {
                    let conn = new_conn(&keys, user);
                    if registry.add(Arc::clone(&conn)).is_ok() {
                        live.push(conn);
                    }
                },
                Op::Del(index) => {
                    if !live.is_empty() {
                        let conn = live.remove(index % live.len());
                        prop_assert!(registry.remove(&conn));
                        // Removal is idempotent.
                        prop_assert!(!registry.remove(&conn));
                    }
                },
                Op::Snapshot(user) => {
                    let snapshot = registry.get("svc", &format!("user-{user}"));
                    prop_assert!(snapshot.len() <= limits.max_conns_per_user);
                },
            }

            prop_assert!(registry.conn_count() <= limits.max_conns);
            prop_assert!(registry.user_count() <= limits.max_users);
            for user in 0..6u8 {
                let username = format!("user-{user}");
                prop_assert!(
                    registry.conns_for_user("svc", &username)
                        <= limits.max_conns_per_user
                );
            }
        }

        let total: usize = live.len();
        prop_assert_eq!(registry.conn_count(), total);
        for conn in live {
            registry.remove(&conn);
        }
        prop_assert_eq!(registry.conn_count(), 0);
        prop_assert_eq!(registry.user_count(), 0);
    }

    #[test]
    fn add_del_add_behaves_like_a_single_add(user in 0u8..4) {
        let registry: ConnRegistry<tokio::io::DuplexStream> =
            ConnRegistry::new(RegistryLimits { max_conns_per_user: 1, ..Default::default() });
        let keys = SessionKeys::derive(b"registry traces", None);

        let conn = new_conn(&keys, user);
        registry.add(Arc::clone(&conn)).unwrap();
        registry.remove(&conn);
        registry.add(Arc::clone(&conn)).unwrap();

        prop_assert_eq!(registry.conn_count(), 1);
        prop_assert_eq!(registry.get("svc", &format!("user-{user}")).len(), 1);
    }
}
