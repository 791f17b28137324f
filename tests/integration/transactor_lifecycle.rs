#![allow(missing_docs)]

use std::fs;
use std::path::Path;
use std::sync::Arc;

use hopdb::codec::{write_to_string, TreeReader, WriterOptions};
use hopdb::model::{Node, NodeHandle};
use hopdb::{
    AppContext, Config, DbKey, Error, NodeChangeSet, NodeManager, NodeState, Result, Transactor,
    Value,
};
use parking_lot::Mutex;
use tempfile::tempdir;

fn manager(home: &Path) -> Result<Arc<NodeManager>> {
    AppContext::new(Config {
        sync_on_commit: false,
        ..Config::default().with_home(home)
    })
    .open_node_manager()
}

fn temp_files(home: &Path) -> usize {
    fs::read_dir(home)
        .unwrap()
        .filter(|e| {
            e.as_ref()
                .unwrap()
                .file_name()
                .to_string_lossy()
                .ends_with(".tmp")
        })
        .count()
}

#[test]
fn stored_graph_matches_transient_one() -> Result<()> {
    let dir = tempdir()?;
    let a = Node::transient(Some("a"));
    a.set_string("title", "hello")?;
    let b = a.create_node(Some("child1"), None)?;
    b.set_integer("count", 42)?;

    let xml = write_to_string(&a, WriterOptions::tree(usize::MAX))?;
    let a2 = TreeReader::new().read_str(&xml, Path::new("a.xml"))?;
    assert_eq!(a2.get_string("title").as_deref(), Some("hello"));
    assert_eq!(a2.get_node("child1").map(|n| n.get_integer("count")), Some(42));

    {
        let nmgr = manager(dir.path())?;
        let tx = nmgr.begin("store a")?;
        nmgr.root()?.set_node("a", &a)?;
        assert_eq!(a.state(), NodeState::New);
        assert_eq!(b.state(), NodeState::New);
        tx.commit()?;
        Transactor::release()?;
    }

    let nmgr = manager(dir.path())?;
    let stored = nmgr.root()?.get_subnode("a/child1").expect("child1 below a");
    assert_eq!(stored.get_integer("count"), 42);
    assert_eq!(stored.parent().map(|p| p.get_string("title")), Some(Some("hello".into())));
    Ok(())
}

#[test]
fn abort_reloads_stored_state() -> Result<()> {
    let dir = tempdir()?;
    let nmgr = manager(dir.path())?;
    let tx = nmgr.begin("seed")?;
    let note = nmgr.root()?.create_node(Some("note"), None)?;
    note.set_string("text", "kept")?;
    tx.commit()?;

    let tx = nmgr.begin("scratch")?;
    note.set_string("text", "scribbled")?;
    let extra = nmgr.root()?.create_node(None, None)?;
    assert!(temp_files(dir.path()) == 0);
    tx.abort()?;

    assert_eq!(note.state(), NodeState::Invalid);
    assert_eq!(extra.state(), NodeState::Invalid);
    assert_eq!(temp_files(dir.path()), 0);
    let fresh = nmgr.get_node_by_id(&note.id())?;
    assert!(!Arc::ptr_eq(&fresh, &note));
    assert_eq!(fresh.get_string("text").as_deref(), Some("kept"));
    assert_eq!(nmgr.root()?.number_of_nodes(), 0);
    Transactor::release()?;
    Ok(())
}

#[test]
fn invalidate_hands_out_a_fresh_instance() -> Result<()> {
    let dir = tempdir()?;
    let nmgr = manager(dir.path())?;
    let tx = nmgr.begin("invalidate")?;
    let key = DbKey::embedded("0");
    let root = nmgr.get_node(&key)?;
    assert!(Arc::ptr_eq(&root, &nmgr.get_node(&key)?));

    root.invalidate()?;
    assert_eq!(root.state(), NodeState::Invalid);
    let again = nmgr.get_node(&key)?;
    assert!(!Arc::ptr_eq(&root, &again));
    assert_eq!(again.state(), NodeState::Clean);
    assert!(root.set_string("x", "y").unwrap_err().is_conflict());
    tx.commit()?;
    Transactor::release()?;
    Ok(())
}

#[test]
fn persisted_properties_resolve_through_the_cache() -> Result<()> {
    let dir = tempdir()?;
    let nmgr = manager(dir.path())?;
    let a = Node::transient(Some("a"));
    let b = a.create_node(Some("child1"), None)?;
    a.set_node("link", &b)?;

    let tx = nmgr.begin("store a")?;
    nmgr.root()?.set_node("a", &a)?;
    tx.commit()?;
    assert!(matches!(a.get("link"), Some(Value::Node(NodeHandle::Key(_)))));
    assert!(matches!(a.get("child1"), Some(Value::Node(NodeHandle::Key(_)))));

    let tx = nmgr.begin("reload b")?;
    b.invalidate()?;
    let linked = a.get_node("link").expect("link resolves");
    assert!(!Arc::ptr_eq(&linked, &b));
    assert_eq!(linked.state(), NodeState::Clean);
    assert_eq!(linked.id(), b.id());
    let child = a.get_node("child1").expect("child1 resolves");
    assert!(Arc::ptr_eq(&child, &linked));
    linked.set_string("seen", "yes")?;
    tx.commit()?;
    assert_eq!(
        nmgr.get_node_by_id(&b.id())?.get_string("seen").as_deref(),
        Some("yes")
    );
    Transactor::release()?;
    Ok(())
}

#[test]
fn begin_while_active_aborts_previous_work() -> Result<()> {
    let dir = tempdir()?;
    let nmgr = manager(dir.path())?;
    let tx = nmgr.begin("first")?;
    let root = nmgr.root()?;
    root.set_string("marker", "unsaved")?;
    let same = nmgr.begin("second")?;
    assert!(Arc::ptr_eq(&tx, &same));
    assert_eq!(root.state(), NodeState::Invalid);
    assert!(tx.dirty_nodes().is_empty());
    assert_eq!(nmgr.root()?.get_string("marker"), None);
    same.commit()?;
    Transactor::release()?;
    Ok(())
}

#[test]
fn commit_reports_changes_in_order() -> Result<()> {
    let dir = tempdir()?;
    let nmgr = manager(dir.path())?;
    let seen: Arc<Mutex<Vec<NodeChangeSet>>> = Arc::default();
    let sink = Arc::clone(&seen);
    nmgr.add_listener(Arc::new(move |changes: &NodeChangeSet| {
        sink.lock().push(changes.clone());
    }));

    let tx = nmgr.begin("build")?;
    let root = nmgr.root()?;
    let list = root.create_node(Some("list"), None)?;
    let first = list.create_node(None, None)?;
    tx.commit()?;

    let tx = nmgr.begin("reorder")?;
    let second = list.create_node(None, None)?;
    list.add_node(&first, None)?;
    assert_eq!(list.number_of_nodes(), 2);
    assert_eq!(list.contains(&first), Some(1));
    let changes = tx.commit()?;
    assert_eq!(changes.counts(), (1, 1, 0));
    assert!(changes.updated_parents.iter().any(|p| p.is_same(&list)));
    assert!(changes.inserted[0].is_same(&second));

    let seen = seen.lock();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0].inserted.len(), 2);
    Transactor::release()?;
    Ok(())
}

#[test]
fn cascade_spares_named_references() -> Result<()> {
    let dir = tempdir()?;
    let nmgr = manager(dir.path())?;
    let tx = nmgr.begin("setup")?;
    let root = nmgr.root()?;
    let owner = root.create_node(None, None)?;
    let owned = owner.create_node(None, None)?;
    let shared = root.create_node(Some("shared"), None)?;
    owner.set_node("link", &shared)?;
    tx.commit()?;

    let tx = nmgr.begin("cascade")?;
    owner.remove()?;
    let changes = tx.commit()?;
    assert_eq!(changes.deleted.len(), 2);
    assert!(changes.deleted.iter().any(|n| n.is_same(&owned)));
    assert_eq!(shared.state(), NodeState::Clean);
    assert!(nmgr.root()?.get_node("shared").is_some());
    Transactor::release()?;
    Ok(())
}

#[test]
fn mutations_outside_transactions_are_refused() -> Result<()> {
    let dir = tempdir()?;
    let nmgr = manager(dir.path())?;
    Transactor::release()?;
    let root = nmgr.root()?;
    assert!(matches!(root.set_boolean("flag", true), Err(Error::NoTransactor)));
    assert!(matches!(
        root.create_node(Some("x"), None),
        Err(Error::NoTransactor)
    ));
    assert_eq!(root.state(), NodeState::Clean);
    Ok(())
}

#[test]
fn thread_exit_aborts_open_transaction() -> Result<()> {
    let dir = tempdir()?;
    let nmgr = manager(dir.path())?;
    let worker = {
        let nmgr = Arc::clone(&nmgr);
        std::thread::spawn(move || -> Result<(Arc<Transactor>, String)> {
            let tx = nmgr.begin("abandoned")?;
            let node = nmgr.root()?.create_node(None, None)?;
            Ok((tx, node.id()))
        })
    };
    let (tx, id) = worker.join().expect("worker panicked")?;
    assert!(!tx.is_alive());
    assert!(!tx.is_active());
    assert!(nmgr.get_node_by_id(&id).unwrap_err().is_not_found());

    // The root's write lock went with the dead transactor.
    let tx = nmgr.begin("after")?;
    nmgr.root()?.set_string("ok", "yes")?;
    tx.commit()?;
    Transactor::release()?;
    Ok(())
}
