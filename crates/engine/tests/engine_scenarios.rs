//! End-to-end engine scenarios: concurrent writers racing on one
//! resource, serialization conflicts between transactions, transfer from
//! Buffer to Database under load, and recovery after a simulated crash.

use concourse_core::{Key, Operator, Record, Value};
use concourse_engine::Engine;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

fn key(s: &str) -> Key {
    Key::new(s).unwrap()
}

fn s(text: &str) -> Value {
    Value::String(text.into())
}

#[test]
fn concurrent_adds_of_the_same_fact_agree_on_one_winner() {
    let dir = tempdir().unwrap();
    let engine = Arc::new(Engine::open(dir.path()).unwrap());
    let env = engine.default_environment().unwrap();

    let mut handles = Vec::new();
    for _ in 0..2 {
        let env = env.clone();
        handles.push(std::thread::spawn(move || {
            env.add(key("salary"), Value::Int32(100), Record::new(1)).unwrap()
        }));
    }
    let outcomes: Vec<bool> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    // exactly one add observed an absent value and won
    assert_eq!(outcomes.iter().filter(|&&won| won).count(), 1);
    assert_eq!(env.select(&key("salary"), Record::new(1), None), vec![Value::Int32(100)]);
    engine.stop().unwrap();
}

#[test]
fn transaction_loses_to_an_intervening_committer() {
    let dir = tempdir().unwrap();
    let engine = Engine::open(dir.path()).unwrap();
    let env = engine.default_environment().unwrap();

    let mut txn = env.start_transaction().unwrap();
    assert!(txn.select(&key("k"), Record::new(1)).unwrap().is_empty());
    txn.add(key("k"), s("v"), Record::new(1)).unwrap();

    // an auto-committed write invalidates the transaction's expectations
    env.add(key("k"), s("v"), Record::new(1)).unwrap();

    let err = env.commit_transaction(txn).unwrap_err();
    assert!(err.is_retry());
    assert_eq!(env.select(&key("k"), Record::new(1), None), vec![s("v")]);
    engine.stop().unwrap();
}

#[test]
fn writes_survive_transfer_to_the_database() {
    let dir = tempdir().unwrap();
    // a tiny page size plus a fast tick keeps several transfers in flight
    let engine = Engine::builder(dir.path())
        .page_size_bytes(256)
        .transfer_interval(Duration::from_millis(10))
        .open()
        .unwrap();
    let env = engine.default_environment().unwrap();

    for i in 1..=200u64 {
        env.add(key("serial"), Value::Int64(i as i64), Record::new(i)).unwrap();
    }
    // give the background thread time to drain sealed pages
    std::thread::sleep(Duration::from_millis(200));

    for i in 1..=200u64 {
        let found = env
            .find(&key("serial"), Operator::Equals, &[Value::Int64(i as i64)], None)
            .unwrap();
        assert_eq!(found, BTreeSet::from([Record::new(i)]), "write {i} lost");
    }
    engine.stop().unwrap();
}

#[test]
fn acknowledged_writes_survive_a_crash() {
    let dir = tempdir().unwrap();
    {
        let engine = Engine::builder(dir.path()).page_size_bytes(512).open().unwrap();
        let env = engine.default_environment().unwrap();
        for i in 1..=100u64 {
            env.add(key("crash"), Value::Int64(i as i64), Record::new(i)).unwrap();
        }
        // no clean shutdown: threads halt, nothing flushed, locks left
        engine.simulate_crash();
    }
    let engine = Engine::open(dir.path()).unwrap();
    let env = engine.default_environment().unwrap();
    for i in 1..=100u64 {
        assert!(
            env.verify(&key("crash"), &Value::Int64(i as i64), Record::new(i), None),
            "acknowledged write {i} lost after crash"
        );
    }
    engine.stop().unwrap();
}

#[test]
fn chronologize_reports_every_state_the_value_set_passed_through() {
    let dir = tempdir().unwrap();
    let engine = Engine::open(dir.path()).unwrap();
    let env = engine.default_environment().unwrap();
    let record = Record::new(1);

    env.add(key("k"), s("v1"), record).unwrap();
    env.add(key("k"), s("v2"), record).unwrap();
    env.remove(key("k"), s("v1"), record).unwrap();
    env.add(key("k"), s("v3"), record).unwrap();

    let timeline = env.chronologize(&key("k"), record, 0, u64::MAX);
    assert_eq!(timeline.len(), 4);
    let (_, final_state) = timeline.last().unwrap();
    assert_eq!(final_state, &vec![s("v2"), s("v3")]);
    engine.stop().unwrap();
}

#[test]
fn review_reads_like_an_audit_trail() {
    let dir = tempdir().unwrap();
    let engine = Engine::open(dir.path()).unwrap();
    let env = engine.default_environment().unwrap();
    let record = Record::new(42);

    env.add(key("name"), s("alice"), record).unwrap();
    env.remove(key("name"), s("alice"), record).unwrap();

    let trail = env.review(record, None);
    assert_eq!(trail.len(), 2);
    assert!(trail[0].1.starts_with("ADDED"));
    assert!(trail[1].1.starts_with("REMOVED"));
    assert!(trail[0].0 < trail[1].0);
    engine.stop().unwrap();
}

#[test]
fn search_spans_buffer_and_database() {
    let dir = tempdir().unwrap();
    let engine = Engine::builder(dir.path())
        .page_size_bytes(128)
        .transfer_interval(Duration::from_millis(10))
        .open()
        .unwrap();
    let env = engine.default_environment().unwrap();

    env.add(key("bio"), s("keeps bees in the back garden"), Record::new(1)).unwrap();
    // push enough data that the first write's page seals and transfers
    for i in 2..=50u64 {
        env.add(key("bio"), s("nothing of note"), Record::new(i)).unwrap();
    }
    std::thread::sleep(Duration::from_millis(100));

    assert_eq!(
        env.search(&key("bio"), "back garden", None),
        BTreeSet::from([Record::new(1)])
    );
    engine.stop().unwrap();
}
