#![allow(missing_docs)]

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Barrier};
use std::thread;

use hopdb::storage::BackendKind;
use hopdb::{AppContext, Config, NodeManager, NodeRef, Result, Transactor};
use tempfile::tempdir;

const NUM_THREADS: usize = 8;
const NODES_PER_THREAD: usize = 20;

fn manager(home: &Path, backend: BackendKind) -> Result<Arc<NodeManager>> {
    AppContext::new(Config {
        sync_on_commit: false,
        ..Config::default().with_home(home).with_backend(backend)
    })
    .open_node_manager()
}

#[test]
fn locked_node_conflicts_across_threads() -> Result<()> {
    let dir = tempdir()?;
    let nmgr = manager(dir.path(), BackendKind::Xml)?;
    let locked = Arc::new(Barrier::new(2));
    let tried = Arc::new(Barrier::new(2));

    let holder = {
        let (nmgr, locked, tried) = (Arc::clone(&nmgr), Arc::clone(&locked), Arc::clone(&tried));
        thread::spawn(move || -> Result<()> {
            let tx = nmgr.begin("holder")?;
            nmgr.root()?.set_string("owner", "holder")?;
            locked.wait();
            tried.wait();
            tx.commit()?;
            Transactor::release()
        })
    };

    locked.wait();
    let tx = nmgr.begin("contender")?;
    let err = nmgr.root()?.set_string("owner", "contender").unwrap_err();
    tried.wait();
    assert!(err.is_conflict(), "{err:?}");
    tx.abort()?;
    holder.join().expect("holder panicked")?;

    // Once the holder committed the node is free again.
    let tx = nmgr.begin("after")?;
    let root = nmgr.root()?;
    assert_eq!(root.get_string("owner").as_deref(), Some("holder"));
    root.set_string("owner", "contender")?;
    tx.commit()?;
    Transactor::release()?;
    Ok(())
}

#[test]
fn concurrent_loads_share_one_instance() -> Result<()> {
    let dir = tempdir()?;
    let nmgr = manager(dir.path(), BackendKind::Xml)?;
    let barrier = Arc::new(Barrier::new(NUM_THREADS));
    let handles: Vec<_> = (0..NUM_THREADS)
        .map(|_| {
            let (nmgr, barrier) = (Arc::clone(&nmgr), Arc::clone(&barrier));
            thread::spawn(move || -> Result<NodeRef> {
                barrier.wait();
                nmgr.get_node_by_id("0")
            })
        })
        .collect();
    let roots = handles
        .into_iter()
        .map(|h| h.join().expect("loader panicked"))
        .collect::<Result<Vec<_>>>()?;
    assert!(roots.iter().all(|r| Arc::ptr_eq(r, &roots[0])));
    assert!(Arc::ptr_eq(&roots[0], &nmgr.root()?));
    Ok(())
}

fn create_in_parallel(backend: BackendKind) -> Result<()> {
    let dir = tempdir()?;
    let nmgr = manager(dir.path(), backend)?;
    let barrier = Arc::new(Barrier::new(NUM_THREADS));
    let handles: Vec<_> = (0..NUM_THREADS)
        .map(|t| {
            let (nmgr, barrier) = (Arc::clone(&nmgr), Arc::clone(&barrier));
            thread::spawn(move || -> Result<Vec<String>> {
                barrier.wait();
                let mut ids = Vec::with_capacity(NODES_PER_THREAD);
                for i in 0..NODES_PER_THREAD {
                    let tx = nmgr.begin(&format!("worker {t} #{i}"))?;
                    let node = nmgr.create_node(None, Some("Item"));
                    node.set_integer("worker", t as i64)?;
                    nmgr.persist(&node)?;
                    ids.push(node.id());
                    tx.commit()?;
                }
                Transactor::release()?;
                Ok(ids)
            })
        })
        .collect();

    let mut all = Vec::new();
    for handle in handles {
        all.extend(handle.join().expect("worker panicked")?);
    }
    let unique: HashSet<&String> = all.iter().collect();
    assert_eq!(all.len(), NUM_THREADS * NODES_PER_THREAD);
    assert_eq!(unique.len(), all.len());
    nmgr.shutdown()?;

    let reopened = manager(dir.path(), backend)?;
    for id in &all {
        assert_eq!(reopened.get_node_by_id(id)?.prototype(), "Item");
    }
    let highest = all.iter().map(|id| id.parse::<u64>().unwrap()).max().unwrap();
    let next: u64 = reopened.db().next_id()?.parse().unwrap();
    assert!(next > highest);
    Ok(())
}

#[test]
fn parallel_creation_issues_unique_ids_xml() -> Result<()> {
    create_in_parallel(BackendKind::Xml)
}

#[test]
fn parallel_creation_issues_unique_ids_sqlite() -> Result<()> {
    create_in_parallel(BackendKind::Sqlite)
}
