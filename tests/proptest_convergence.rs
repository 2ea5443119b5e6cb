//! Property tests for replication.
//!
//! Arbitrary master and backup contents, drawn from a small shared uuid pool
//! so records overlap, diverge and reference each other:
//! - one pass converges every family
//! - a second pass performs no operation
//! - the role invariant holds after any sequence of master losses

mod common;

use std::sync::Arc;

use proptest::prelude::*;

use failover_store::{
    Badge, BackendConfig, BackendHandle, BackendKind, Entity, EntityStore, InMemoryStore, Interest, InterestGroup,
    MemoryPointerStore, ReplicationEngine, Role, User,
};

use common::{assert_converged, Cluster};

const USERS: &[&str] = &["u0", "u1", "u2", "u3"];
const BADGES: &[&str] = &["b0", "b1", "b2"];
const GROUPS: &[&str] = &["g0", "g1"];
const INTERESTS: &[&str] = &["i0", "i1", "i2", "i3"];

fn subset(pool: &'static [&'static str]) -> impl Strategy<Value = Vec<String>> {
    proptest::sample::subsequence(pool, 0..=pool.len()).prop_map(|v| v.into_iter().map(String::from).collect())
}

fn name() -> impl Strategy<Value = String> {
    prop_oneof![Just("a".to_string()), Just("b".to_string()), "[a-z]{1,6}"]
}

fn user(uuid: &'static str) -> impl Strategy<Value = Entity> {
    (name(), subset(BADGES), subset(INTERESTS), subset(USERS), subset(USERS), proptest::option::of(name()))
        .prop_map(move |(username, badges, interests, followers, following, location)| {
            let mut u = User::new(uuid, username, format!("{}@example.com", uuid), "hash");
            u.badges = badges;
            u.followed_interests = interests;
            u.followers_count = followers.len() as i64;
            u.followers = followers;
            u.following_count = following.len() as i64;
            u.following = following;
            u.location = location;
            Entity::from(u)
        })
}

fn badge(uuid: &'static str) -> impl Strategy<Value = Entity> {
    name().prop_map(move |n| Entity::from(Badge::new(uuid, "icon", n)))
}

fn group(uuid: &'static str) -> impl Strategy<Value = Entity> {
    (name(), subset(INTERESTS)).prop_map(move |(n, interests)| {
        let mut g = InterestGroup::new(uuid, n);
        g.interests = interests;
        Entity::from(g)
    })
}

fn interest(uuid: &'static str) -> impl Strategy<Value = Entity> {
    (name(), subset(USERS), proptest::sample::select(GROUPS)).prop_map(move |(n, followers, group)| {
        let mut i = Interest::new(uuid, n, group);
        i.followers = followers;
        Entity::from(i)
    })
}

/// Each pool member present or absent, with arbitrary contents.
fn store_contents() -> impl Strategy<Value = Vec<Entity>> {
    let users: Vec<_> = USERS.iter().map(|u| proptest::option::of(user(*u))).collect();
    let badges: Vec<_> = BADGES.iter().map(|b| proptest::option::of(badge(*b))).collect();
    let groups: Vec<_> = GROUPS.iter().map(|g| proptest::option::of(group(*g))).collect();
    let interests: Vec<_> = INTERESTS.iter().map(|i| proptest::option::of(interest(*i))).collect();
    (users, badges, groups, interests).prop_map(|(u, b, g, i)| {
        u.into_iter()
            .chain(b)
            .chain(g)
            .chain(i)
            .flatten()
            .collect()
    })
}

fn fill(entities: &[Entity]) -> Arc<InMemoryStore> {
    let store = Arc::new(InMemoryStore::new());
    for entity in entities {
        store.seed(entity.clone());
    }
    store
}

fn handle(name: &str, store: &Arc<InMemoryStore>) -> BackendHandle {
    BackendHandle {
        name: name.to_string(),
        config: BackendConfig::new(BackendKind::Sqlite, Role::Backup),
        store: store.clone() as Arc<dyn EntityStore>,
    }
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_single_pass_converges(master in store_contents(), backup in store_contents()) {
        let (master, backup) = (fill(&master), fill(&backup));
        runtime().block_on(async {
            let report = ReplicationEngine::new()
                .replicate(&handle("master", &master), &[handle("backup", &backup)])
                .await;
            assert!(report.is_clean());
        });
        assert_converged(&master, &backup);
    }

    #[test]
    fn prop_second_pass_is_noop(master in store_contents(), backup in store_contents()) {
        let (master, backup) = (fill(&master), fill(&backup));
        let engine = ReplicationEngine::new();
        runtime().block_on(async {
            engine.replicate(&handle("master", &master), &[handle("backup", &backup)]).await;
            let writes = backup.writes();
            let second = engine.replicate(&handle("master", &master), &[handle("backup", &backup)]).await;
            assert_eq!(second.total_ops(), 0);
            assert_eq!(backup.writes(), writes);
        });
    }

    #[test]
    fn prop_master_untouched_by_pass(master in store_contents(), backup in store_contents()) {
        let (master, backup) = (fill(&master), fill(&backup));
        let before = master.writes();
        runtime().block_on(async {
            ReplicationEngine::new()
                .replicate(&handle("master", &master), &[handle("backup", &backup)])
                .await;
        });
        prop_assert_eq!(master.writes(), before);
    }

    #[test]
    fn prop_exactly_one_master_after_losses(losses in proptest::collection::vec(0usize..3, 0..6)) {
        let names = ["primary", "b1", "b2"];
        let cluster = Cluster::new(common::table(&["b1", "b2"]), &names, MemoryPointerStore::new());
        runtime().block_on(async {
            cluster.engine.start().await.unwrap();
            for victim in losses {
                // Take one backend down, fail over if it was the master, bring it back
                cluster.store(names[victim]).set_reachable(false);
                let _ = cluster.engine.failover().ensure_master().await;
                cluster.store(names[victim]).set_reachable(true);
                let _ = cluster.engine.failover().ensure_master().await;
                assert_eq!(cluster.masters().len(), 1);
            }
        });
        prop_assert_eq!(cluster.masters().len(), 1);
    }
}
