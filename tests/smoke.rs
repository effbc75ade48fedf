//! Workspace-level smoke test: the prelude wires the facade, engine, and
//! data model together.

use concourse::prelude::*;
use tempfile::tempdir;

#[test]
fn open_write_read_close() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let dir = tempdir().unwrap();
    let db = Concourse::open(dir.path()).unwrap();

    db.add("name", Value::String("alice".into()), Record::new(1)).unwrap();
    assert_eq!(
        db.select("name", Record::new(1)).unwrap(),
        vec![Value::String("alice".into())]
    );

    let token = db.start_transaction().unwrap();
    db.add_in(&token, "age", Value::Int32(30), Record::new(1)).unwrap();
    assert!(db.commit(&token).unwrap());

    assert_eq!(
        db.describe(Record::new(1)).unwrap().len(),
        2,
        "both keys should be live"
    );
    db.close().unwrap();
}
