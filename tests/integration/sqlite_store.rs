#![allow(missing_docs)]

use std::path::Path;
use std::sync::Arc;

use hopdb::storage::{BackendKind, SqliteDatabase};
use hopdb::{AppContext, Config, Database, NodeManager, NodeState, Result, Transactor};
use tempfile::tempdir;

fn app(home: &Path) -> AppContext {
    AppContext::new(
        Config::default()
            .with_home(home)
            .with_backend(BackendKind::Sqlite),
    )
}

fn manager(home: &Path) -> Result<Arc<NodeManager>> {
    app(home).open_node_manager()
}

#[test]
fn graph_survives_reopen() -> Result<()> {
    let dir = tempdir()?;
    let story_id;
    {
        let nmgr = manager(dir.path())?;
        let tx = nmgr.begin("write graph")?;
        let root = nmgr.root()?;
        let story = root.create_node(Some("story"), None)?;
        story.set_string("title", "Persistence")?;
        story.set_integer("views", 3)?;
        for n in 0..3 {
            let comment = story.create_node(None, None)?;
            comment.set_integer("n", n)?;
        }
        story_id = story.id();
        let changes = tx.commit()?;
        assert_eq!(changes.inserted.len(), 4);
        Transactor::release()?;
        nmgr.shutdown()?;
    }

    let nmgr = manager(dir.path())?;
    let story = nmgr.root()?.get_node("story").expect("story reference");
    assert_eq!(story.id(), story_id);
    assert_eq!(story.state(), NodeState::Clean);
    assert_eq!(story.get_string("title").as_deref(), Some("Persistence"));
    assert_eq!(story.get_integer("views"), 3);
    let ns: Vec<i64> = story.subnodes().iter().map(|c| c.get_integer("n")).collect();
    assert_eq!(ns, vec![0, 1, 2]);
    let parent = story.subnodes()[0].parent().expect("parent link");
    assert!(Arc::ptr_eq(&parent, &story));
    Ok(())
}

#[test]
fn rows_are_indexed_by_parent() -> Result<()> {
    let dir = tempdir()?;
    {
        let nmgr = manager(dir.path())?;
        let tx = nmgr.begin("children")?;
        let users = nmgr.user_root()?;
        users.create_node(Some("alice"), None)?;
        users.create_node(Some("bob"), None)?;
        tx.commit()?;
        Transactor::release()?;
        nmgr.shutdown()?;
    }
    let mut db = SqliteDatabase::new(false);
    db.init(dir.path(), &app(dir.path()))?;
    assert_eq!(db.count()?, 4);
    assert_eq!(db.child_ids("1")?.len(), 2);
    assert!(db.child_ids("0")?.is_empty());
    Ok(())
}

#[test]
fn removed_nodes_disappear() -> Result<()> {
    let dir = tempdir()?;
    let nmgr = manager(dir.path())?;
    let tx = nmgr.begin("create")?;
    let root = nmgr.root()?;
    let doomed = root.create_node(None, None)?;
    let doomed_child = doomed.create_node(None, None)?;
    tx.commit()?;
    let ids = (doomed.id(), doomed_child.id());

    let tx = nmgr.begin("remove")?;
    doomed.remove()?;
    let changes = tx.commit()?;
    assert_eq!(changes.deleted.len(), 2);
    assert_eq!(doomed.state(), NodeState::Invalid);
    assert_eq!(root.number_of_nodes(), 0);
    Transactor::release()?;

    assert!(nmgr.get_node_by_id(&ids.0).unwrap_err().is_not_found());
    assert!(nmgr.get_node_by_id(&ids.1).unwrap_err().is_not_found());
    Ok(())
}

#[test]
fn counter_never_goes_back() -> Result<()> {
    let dir = tempdir()?;
    let first: u64;
    {
        let nmgr = manager(dir.path())?;
        let tx = nmgr.begin("one")?;
        first = nmgr.root()?.create_node(None, None)?.id().parse().unwrap();
        tx.commit()?;
        Transactor::release()?;
        nmgr.shutdown()?;
    }
    let nmgr = manager(dir.path())?;
    let next: u64 = nmgr.db().next_id()?.parse().unwrap();
    assert!(next > first);
    Ok(())
}
