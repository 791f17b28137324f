#![allow(missing_docs)]

use std::fs;
use std::path::Path;
use std::sync::Weak;

use hopdb::codec::RecordReader;
use hopdb::manager::NodeManager;
use hopdb::model::{Node, NodeParts, NodeRef, NodeState, Property, Value, DEFAULT_PROTOTYPE};
use hopdb::storage::{Database, IdGenerator, XmlDatabase};
use hopdb::{AppContext, Config, Error, Result};
use proptest::prelude::*;
use tempfile::tempdir;
use time::OffsetDateTime;

fn open(home: &Path) -> Result<XmlDatabase> {
    let mut db = XmlDatabase::new(false);
    db.init(home, &AppContext::new(Config::default().with_home(home)))?;
    Ok(db)
}

fn read(db: &XmlDatabase, id: &str) -> Result<NodeRef> {
    db.get_node(id, &RecordReader::new(None, Weak::<NodeManager>::new()))
}

fn temp_files(home: &Path) -> Vec<String> {
    fs::read_dir(home)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|name| name.ends_with(".tmp"))
        .collect()
}

fn record(id: &str, name: &str, props: Vec<Property>) -> NodeRef {
    let mut parts = NodeParts::new(id, NodeState::Clean);
    parts.name = Some(name.to_string());
    parts.prototype = Some("Story".to_string());
    parts.props = props;
    Node::from_parts(parts)
}

fn store(db: &XmlDatabase, node: &NodeRef) -> Result<()> {
    let mut txn = db.begin_transaction("store")?;
    db.update_node(&mut txn, &node.id(), node)?;
    db.commit_transaction(&mut txn)
}

#[test]
fn init_creates_layout_and_roots() -> Result<()> {
    let dir = tempdir()?;
    let home = dir.path().join("db");
    let db = open(&home)?;
    assert!(home.join("helma.xsl").exists());
    assert!(home.join("0.xml").exists());
    assert!(home.join("1.xml").exists());

    let root = read(&db, "0")?;
    assert_eq!(root.name(), "root");
    assert_eq!(root.prototype(), "Root");
    let users = read(&db, "1")?;
    assert_eq!(users.name(), "users");
    assert_eq!(users.prototype(), "__userroot__");

    // Idempotent on an existing store.
    let again = open(&home)?;
    assert_eq!(read(&again, "0")?.name(), "root");
    Ok(())
}

#[test]
fn init_rejects_unusable_home() -> Result<()> {
    let dir = tempdir()?;
    let blocker = dir.path().join("file");
    fs::write(&blocker, "not a directory")?;
    let mut db = XmlDatabase::new(false);
    let err = db
        .init(&blocker.join("db"), &AppContext::new(Config::default()))
        .unwrap_err();
    assert!(matches!(err, Error::Database(_)), "{err:?}");
    Ok(())
}

#[test]
fn lookups_of_unknown_ids_report_not_found() -> Result<()> {
    let dir = tempdir()?;
    let db = open(dir.path())?;
    let err = read(&db, "999").unwrap_err();
    assert!(err.is_not_found());
    Ok(())
}

#[test]
fn malformed_record_names_its_file() -> Result<()> {
    let dir = tempdir()?;
    let db = open(dir.path())?;
    fs::write(dir.path().join("77.xml"), "<xmlroot><hopobject id=\"77\"")?;
    match read(&db, "77") {
        Err(Error::Malformed { path, .. }) => assert!(path.ends_with("77.xml")),
        other => panic!("expected malformed record, got {other:?}"),
    }
    Ok(())
}

#[test]
fn insert_over_existing_record_fails() -> Result<()> {
    let dir = tempdir()?;
    let db = open(dir.path())?;
    let mut txn = db.begin_transaction("dup")?;
    let err = db
        .insert_node(&mut txn, "0", &record("0", "again", Vec::new()))
        .unwrap_err();
    assert!(matches!(err, Error::DuplicateKey(id) if id == "0"));
    db.abort_transaction(&mut txn)?;
    Ok(())
}

#[test]
fn abort_discards_staged_files() -> Result<()> {
    let dir = tempdir()?;
    let db = open(dir.path())?;
    let node = record("5", "draft", vec![Property::new("title", Value::String("v1".into()))]);
    let mut txn = db.begin_transaction("draft")?;
    db.insert_node(&mut txn, "5", &node)?;
    assert_eq!(temp_files(dir.path()).len(), 1);
    db.abort_transaction(&mut txn)?;

    assert!(temp_files(dir.path()).is_empty());
    assert!(read(&db, "5").unwrap_err().is_not_found());
    assert!(db.commit_transaction(&mut txn).is_err());
    Ok(())
}

#[test]
fn interrupted_commit_keeps_previous_version() -> Result<()> {
    let dir = tempdir()?;
    {
        let db = open(dir.path())?;
        store(&db, &record("8", "stable", vec![Property::new("v", Value::Integer(1))]))?;
    }
    // A commit that died between staging and rename leaves only a temp file.
    let stale = dir.path().join("8.xml.a1b2c3.tmp");
    fs::write(&stale, "<xmlroot><hopobject id=\"8\" name=\"half\"")?;

    let db = open(dir.path())?;
    assert!(!stale.exists());
    let node = read(&db, "8")?;
    assert_eq!(node.name(), "stable");
    assert_eq!(node.get_integer("v"), 1);
    Ok(())
}

#[test]
fn failed_rename_abandons_the_rest_of_the_commit() -> Result<()> {
    let dir = tempdir()?;
    let db = open(dir.path())?;
    store(&db, &record("22", "doomed", Vec::new()))?;

    let mut txn = db.begin_transaction("partial")?;
    db.update_node(&mut txn, "20", &record("20", "blocked", Vec::new()))?;
    db.update_node(&mut txn, "21", &record("21", "later", Vec::new()))?;
    db.delete_node(&mut txn, "22")?;
    // A directory where the record should land makes the rename fail.
    fs::create_dir(dir.path().join("20.xml"))?;
    assert!(matches!(db.commit_transaction(&mut txn), Err(Error::Io(_))));

    assert!(!dir.path().join("21.xml").exists());
    assert!(temp_files(dir.path()).is_empty());
    assert_eq!(read(&db, "22")?.name(), "doomed");
    Ok(())
}

#[test]
fn update_replaces_record_and_delete_removes_it() -> Result<()> {
    let dir = tempdir()?;
    let db = open(dir.path())?;
    store(&db, &record("9", "first", Vec::new()))?;
    store(&db, &record("9", "second", Vec::new()))?;
    assert_eq!(read(&db, "9")?.name(), "second");

    let mut txn = db.begin_transaction("delete")?;
    db.delete_node(&mut txn, "9")?;
    db.delete_node(&mut txn, "never-stored")?;
    db.commit_transaction(&mut txn)?;
    assert!(read(&db, "9").unwrap_err().is_not_found());
    assert!(temp_files(dir.path()).is_empty());
    Ok(())
}

#[test]
fn charset_is_named_in_declaration() -> Result<()> {
    let dir = tempdir()?;
    let config = Config {
        charset: Some("ISO-8859-1".into()),
        ..Config::default()
    };
    let mut db = XmlDatabase::new(false);
    db.init(dir.path(), &AppContext::new(config))?;
    store(&db, &record("10", "latin", Vec::new()))?;
    let text = fs::read_to_string(dir.path().join("10.xml"))?;
    assert!(text.starts_with("<?xml version=\"1.0\" encoding=\"ISO-8859-1\"?>"), "{text}");
    Ok(())
}

#[test]
fn ids_survive_restart() -> Result<()> {
    let dir = tempdir()?;
    let mut issued = Vec::new();
    {
        let db = open(dir.path())?;
        for _ in 0..5 {
            issued.push(db.next_id()?.parse::<u64>().unwrap());
        }
        // The counter is flushed with the next commit.
        let mut txn = db.begin_transaction("flush")?;
        db.commit_transaction(&mut txn)?;
    }
    let persisted = IdGenerator::load(&dir.path().join("idgen.xml"))?;
    assert_eq!(persisted.value(), *issued.last().unwrap());

    let db = open(dir.path())?;
    let next: u64 = db.next_id()?.parse().unwrap();
    assert!(issued.windows(2).all(|w| w[0] < w[1]));
    assert!(next > *issued.last().unwrap());
    Ok(())
}

#[test]
fn id_base_value_applies_to_fresh_store() -> Result<()> {
    let dir = tempdir()?;
    let mut config = Config::default();
    config
        .properties
        .insert("idBaseValue".into(), "5000".into());
    let mut db = XmlDatabase::new(false);
    db.init(dir.path(), &AppContext::new(config))?;
    let id: u64 = db.next_id()?.parse().unwrap();
    assert!(id > 5000);
    Ok(())
}

fn literal_value() -> impl Strategy<Value = Value> {
    prop_oneof![
        "[a-zA-Z0-9&<>\"'äöü]{1,20}".prop_map(Value::String),
        any::<bool>().prop_map(Value::Boolean),
        any::<i64>().prop_map(Value::Integer),
        (-1.0e12f64..1.0e12).prop_map(Value::Float),
        (0i64..4_000_000_000_000).prop_map(|ms| {
            Value::Date(
                OffsetDateTime::from_unix_timestamp_nanos(ms as i128 * 1_000_000).unwrap(),
            )
        }),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn records_round_trip(
        name in "[a-z][a-z0-9 ]{0,12}[a-z0-9]",
        prototype in proptest::option::of("[A-Z][a-zA-Z]{0,10}"),
        created in 0i64..4_000_000_000_000,
        props in prop::collection::btree_map("k[a-z0-9]{0,7}", literal_value(), 0..8),
    ) {
        let dir = tempdir().unwrap();
        let db = open(dir.path()).unwrap();
        let mut parts = NodeParts::new("42", NodeState::Clean);
        parts.name = Some(name.clone());
        parts.prototype = prototype.clone();
        parts.created = created;
        parts.last_modified = created + 1;
        parts.props = props
            .iter()
            .map(|(k, v)| Property::new(k.clone(), v.clone()))
            .collect();
        store(&db, &Node::from_parts(parts)).unwrap();

        let back = read(&db, "42").unwrap();
        prop_assert_eq!(back.id(), "42");
        prop_assert_eq!(back.name(), name);
        prop_assert_eq!(back.declared_prototype(), prototype.clone());
        prop_assert_eq!(back.prototype(), prototype.as_deref().unwrap_or(DEFAULT_PROTOTYPE));
        prop_assert_eq!(back.created(), created);
        prop_assert_eq!(back.last_modified(), created + 1);
        prop_assert_eq!(back.properties().len(), props.len());
        for (key, value) in &props {
            let stored = back.get(key);
            prop_assert!(
                stored.as_ref().is_some_and(|s| s.same_as(value)),
                "{} was {:?}, expected {:?}", key, stored, value
            );
        }
    }
}
