use common::cluster::{BucketProps, DaemonInfo, Role, Smap};
use common::hrw::{hrw_proxy, hrw_target};
use common::msgs::{parse_range, ActionMsg, BatchSpec};
use common::owner::{MetaOwner, OwnerError};
use common::vote::{VoteLedger, VoteRequest};

fn target(id: &str, ip: &str, port: &str) -> DaemonInfo {
    DaemonInfo::new(id, Role::Target, ip, port)
}

fn proxy(id: &str, port: &str) -> DaemonInfo {
    DaemonInfo::new(id, Role::Proxy, "127.0.0.1", port)
}

fn smap_with_targets(infos: Vec<DaemonInfo>) -> Smap {
    let mut smap = Smap::default();
    for si in infos {
        smap.add_target(si);
    }
    smap
}

#[test]
fn test_hrw_ignores_addresses() {
    // same daemon ids, completely different ips and ports
    let a = smap_with_targets(vec![
        target("t1", "10.0.0.1", "8081"),
        target("t2", "10.0.0.2", "8082"),
        target("t3", "10.0.0.3", "8083"),
    ]);
    let b = smap_with_targets(vec![
        target("t3", "192.168.7.3", "9993"),
        target("t2", "192.168.7.2", "9992"),
        target("t1", "192.168.7.1", "9991"),
    ]);

    for i in 0..200 {
        let obj = format!("dir/obj-{i}");
        let owner_a = hrw_target("bck", &obj, &a).expect("non-empty tmap");
        let owner_b = hrw_target("bck", &obj, &b).expect("non-empty tmap");
        assert_eq!(owner_a.daemon_id, owner_b.daemon_id, "object {obj}");
    }
}

#[test]
fn test_hrw_insertion_order_irrelevant() {
    let ids = ["t-a", "t-b", "t-c", "t-d", "t-e"];
    let forward = smap_with_targets(
        ids.iter()
            .map(|id| target(id, "127.0.0.1", "8081"))
            .collect(),
    );
    let reverse = smap_with_targets(
        ids.iter()
            .rev()
            .map(|id| target(id, "127.0.0.1", "8081"))
            .collect(),
    );

    for i in 0..200 {
        let obj = format!("obj-{i}");
        assert_eq!(
            hrw_target("bck", &obj, &forward).map(|d| &d.daemon_id),
            hrw_target("bck", &obj, &reverse).map(|d| &d.daemon_id),
        );
    }
}

#[test]
fn test_hrw_spreads_keys() {
    let smap = smap_with_targets(vec![
        target("t1", "10.0.0.1", "8081"),
        target("t2", "10.0.0.2", "8082"),
        target("t3", "10.0.0.3", "8083"),
    ]);
    let mut seen = std::collections::HashSet::new();
    for i in 0..300 {
        let obj = format!("obj-{i}");
        seen.insert(hrw_target("b", &obj, &smap).map(|d| d.daemon_id.clone()));
    }
    assert_eq!(seen.len(), 3, "300 keys should land on all 3 targets");
}

#[test]
fn test_hrw_empty_tmap() {
    let smap = Smap::default();
    assert!(hrw_target("bck", "obj", &smap).is_none());
}

#[test]
fn test_hrw_proxy_excludes_failed_primary() {
    let mut smap = Smap::default();
    smap.add_proxy(proxy("p1", "8080"));
    smap.add_proxy(proxy("p2", "8180"));
    smap.add_proxy(proxy("p3", "8280"));
    smap.primary = "p1".to_string();

    let next = hrw_proxy(&smap, "p1").expect("two proxies remain");
    assert_ne!(next.daemon_id, "p1");

    // deterministic across repeated calls
    for _ in 0..10 {
        assert_eq!(hrw_proxy(&smap, "p1").map(|d| &d.daemon_id), Some(&next.daemon_id));
    }

    // nobody left to elect
    let mut lone = Smap::default();
    lone.add_proxy(proxy("p1", "8080"));
    lone.primary = "p1".to_string();
    assert!(hrw_proxy(&lone, "p1").is_none());
}

#[test]
fn test_parse_range() {
    assert_eq!(parse_range("").unwrap(), (0, 0));
    assert_eq!(parse_range(":5").unwrap(), (0, 5));
    assert_eq!(parse_range("3:").unwrap(), (3, 0));
    assert_eq!(parse_range("3:5").unwrap(), (3, 5));
    assert_eq!(parse_range(":").unwrap(), (0, 0));

    // a bare number is not a range
    assert!(parse_range("7").is_err());
    assert!(parse_range("a:5").is_err());
    assert!(parse_range("3:b").is_err());
}

#[test]
fn test_owner_version_monotone() {
    let owner = MetaOwner::new(Smap::default());

    let mut v1 = Smap::default();
    v1.version = 1;
    v1.add_target(target("t1", "127.0.0.1", "8081"));
    assert_eq!(owner.put(v1.clone()), Ok(true));

    // identical copy at the same version is a no-op
    assert_eq!(owner.put(v1.clone()), Ok(false));

    // same version, different content, is a divergence
    let mut v1b = v1.clone();
    v1b.add_target(target("t2", "127.0.0.1", "8082"));
    assert_eq!(owner.put(v1b), Err(OwnerError::Divergent(1)));

    let mut v3 = v1.clone();
    v3.version = 3;
    assert_eq!(owner.put(v3), Ok(true));

    // going back down is rejected and the snapshot is untouched
    let mut v2 = v1.clone();
    v2.version = 2;
    assert_eq!(owner.put(v2), Err(OwnerError::Stale { have: 3, got: 2 }));
    assert_eq!(owner.get().version, 3);
}

#[test]
fn test_owner_publish_bumps_version() {
    let owner = MetaOwner::new(Smap::default());
    let snap0 = owner.get();

    let snap1 = owner.publish(|m| m.add_target(target("t1", "127.0.0.1", "8081")));
    assert_eq!(snap1.version, 1);
    let snap2 = owner.publish(|m| m.add_target(target("t2", "127.0.0.1", "8082")));
    assert_eq!(snap2.version, 2);

    // previously issued snapshots stay consistent
    assert_eq!(snap0.version, 0);
    assert_eq!(snap0.count_targets(), 0);
    assert_eq!(snap1.count_targets(), 1);
}

#[test]
fn test_action_msg_tagged_payloads() {
    let msg: ActionMsg = serde_json::from_str(
        r#"{"action":"delete","value":{"objnames":["a","b"],"wait":true}}"#,
    )
    .unwrap();
    match msg {
        ActionMsg::Delete(BatchSpec::List(list)) => {
            assert_eq!(list.objnames, vec!["a", "b"]);
            assert!(list.wait);
            assert_eq!(list.deadline_ms, 0);
        }
        other => panic!("parsed as {other:?}"),
    }

    let msg: ActionMsg = serde_json::from_str(
        r#"{"action":"prefetch","value":{"prefix":"x/","regex":"\\d+","range":"10:20"}}"#,
    )
    .unwrap();
    assert!(matches!(msg, ActionMsg::Prefetch(BatchSpec::Range(_))));

    // unit actions carry no payload
    let msg: ActionMsg = serde_json::from_str(r#"{"action":"shutdown"}"#).unwrap();
    assert!(matches!(msg, ActionMsg::Shutdown));

    let msg: ActionMsg =
        serde_json::from_str(r#"{"action":"setprops","value":{"cloud_provider":"aws"}}"#).unwrap();
    match msg {
        ActionMsg::Setprops(props) => assert_eq!(props.cloud_provider, "aws"),
        other => panic!("parsed as {other:?}"),
    }
}

#[test]
fn test_action_msg_rejects_ambiguous_payloads() {
    // a body that mixes list and range fields matches neither shape
    let err = serde_json::from_str::<ActionMsg>(
        r#"{"action":"delete","value":{"objnames":["a"],"regex":"\\d+","prefix":"","range":""}}"#,
    );
    assert!(err.is_err());

    // a batch action without a payload is invalid
    assert!(serde_json::from_str::<ActionMsg>(r#"{"action":"evict"}"#).is_err());

    // a props payload on a batch action is invalid
    assert!(serde_json::from_str::<ActionMsg>(
        r#"{"action":"prefetch","value":{"cloud_provider":"aws"}}"#
    )
    .is_err());
}

#[test]
fn test_bucket_props_roundtrip() {
    let props: BucketProps = serde_json::from_str(
        r#"{"cloud_provider":"gcp","read_policy":"next_tier","versioning":true}"#,
    )
    .unwrap();
    assert_eq!(props.read_policy.as_str(), "next_tier");
    assert_eq!(props.write_policy.as_str(), "cloud");
    assert!(props.versioning);
}

#[test]
fn test_vote_ledger_grant_rules() {
    let ledger = VoteLedger::new();
    let req = |cand: &str, term: i64| VoteRequest {
        candidate_id: cand.to_string(),
        smap_version: term,
    };

    // reachable primary and a newer local map: refuse
    assert!(!ledger.grant(&req("p2", 3), 5, true));
    assert!(!ledger.in_progress());

    // unreachable primary: grant, and the vote window opens
    assert!(ledger.grant(&req("p2", 5), 5, false));
    assert!(ledger.in_progress());

    // one vote per term: same candidate yes, different candidate no
    assert!(ledger.grant(&req("p2", 5), 5, false));
    assert!(!ledger.grant(&req("p3", 5), 5, false));

    // a later term is a fresh ballot
    assert!(ledger.grant(&req("p3", 6), 5, false));

    ledger.clear();
    assert!(!ledger.in_progress());
}
