mod common;

use std::path::PathBuf;
use std::time::Duration;

use tempfile::TempDir;
use tokio::net::TcpListener;

use common::*;
use journal::command::MemberInfo;
use journal::protocol::{read_frame, write_frame, Frame, JoinReply};
use journal::{
    EnvironmentState, JournalConfig, JournalEnvironment, JournalError, NodeConfig, NodeRole,
    ReadMode,
};

/// 1 master + 2 followers, all on fresh storage.
struct Cluster {
    _dirs: Vec<TempDir>,
    master_addr: String,
    master_path: PathBuf,
    master: JournalEnvironment,
    follower_addrs: Vec<String>,
    follower_paths: Vec<PathBuf>,
    followers: Vec<JournalEnvironment>,
}

impl Cluster {
    async fn start() -> Cluster {
        init_logger();
        let mut dirs = Vec::new();

        let master_dir = TempDir::new().unwrap();
        let master_addr = free_addr();
        let master_path = master_dir.path().to_path_buf();
        let master = environment(&master_path, "master", &master_addr, &master_addr, true);
        master.setup().await.unwrap();
        assert!(master.segment_indexes().unwrap().is_empty());
        assert_eq!(master.role().unwrap(), NodeRole::Master);
        dirs.push(master_dir);

        let mut follower_addrs = Vec::new();
        let mut follower_paths = Vec::new();
        let mut followers = Vec::new();
        for i in 0..2 {
            let dir = TempDir::new().unwrap();
            let addr = free_addr();
            let follower = environment(
                dir.path(),
                &format!("follower{}", i),
                &addr,
                &master_addr,
                true,
            );
            follower.setup().await.unwrap();
            assert!(follower.segment_indexes().unwrap().is_empty());
            follower_paths.push(dir.path().to_path_buf());
            follower_addrs.push(addr);
            followers.push(follower);
            dirs.push(dir);
        }

        Cluster {
            _dirs: dirs,
            master_addr,
            master_path,
            master,
            follower_addrs,
            follower_paths,
            followers,
        }
    }

    async fn close(&self) {
        self.master.close().await;
        for follower in &self.followers {
            follower.close().await;
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_setup_standalone() {
    init_logger();
    let dir = TempDir::new().unwrap();
    let addr = free_addr();
    let env = environment(dir.path(), "standalone", &addr, &addr, true);
    env.setup().await.unwrap();
    assert_eq!(env.state(), EnvironmentState::Ready);
    assert_eq!(env.role().unwrap(), NodeRole::Master);

    let db = env.open_segment("testdb").await.unwrap();
    assert_eq!(db.index(), 0);
    let key = random_entry();
    let value = random_entry();
    db.put(&key, &value).await.unwrap();
    assert_eq!(db.get(&key, ReadMode::Committed).unwrap(), Some(value));

    // the same name shares one handle
    let again = env.open_segment("testdb").await.unwrap();
    assert_eq!(again.index(), 0);
    assert_eq!(env.segment_names().unwrap(), vec!["testdb".to_string()]);
    env.close().await;
    assert_eq!(env.state(), EnvironmentState::Closed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_setup_standalone_multitimes() {
    init_logger();
    let addr = free_addr();
    let first_dir = TempDir::new().unwrap();
    let second_dir = TempDir::new().unwrap();

    let first = environment(first_dir.path(), "standalone", &addr, &addr, true);
    first.setup().await.unwrap();

    let second = environment(second_dir.path(), "standalone", &addr, &addr, true);
    match second.setup().await {
        Err(JournalError::BindConflict { attempts, .. }) => assert_eq!(attempts, 3),
        other => panic!("expected a bind conflict, got {:?}", other),
    }
    assert_eq!(second.state(), EnvironmentState::BindFailed);
    // a failed environment is not set up again
    assert!(matches!(
        second.setup().await,
        Err(JournalError::IllegalState(_))
    ));
    second.close().await;
    assert_eq!(second.state(), EnvironmentState::BindFailed);
    first.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_storage_path_is_exclusive() {
    init_logger();
    let dir = TempDir::new().unwrap();
    let first_addr = free_addr();
    let second_addr = free_addr();

    let first = environment(dir.path(), "first", &first_addr, &first_addr, true);
    first.setup().await.unwrap();
    let second = environment(dir.path(), "second", &second_addr, &second_addr, true);
    assert!(matches!(
        second.setup().await,
        Err(JournalError::StorageInUse(_))
    ));
    assert_eq!(second.state(), EnvironmentState::BindFailed);
    second.close().await;
    first.close().await;

    // the lock goes away with close
    let again = environment(dir.path(), "first", &first_addr, &first_addr, true);
    again.setup().await.unwrap();
    again.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_storage_lock_held_elsewhere() {
    use fs2::FileExt;

    init_logger();
    let dir = TempDir::new().unwrap();
    let lock = std::fs::File::create(dir.path().join("LOCK")).unwrap();
    lock.try_lock_exclusive().unwrap();

    let addr = free_addr();
    let env = environment(dir.path(), "standalone", &addr, &addr, true);
    assert!(matches!(
        env.setup().await,
        Err(JournalError::StorageInUse(_))
    ));
    env.close().await;
    assert!(!dir.path().join("node.meta").exists());
    lock.unlock().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_observer_cannot_bootstrap() {
    init_logger();
    let dir = TempDir::new().unwrap();
    let addr = free_addr();
    let env = environment(dir.path(), "observer", &addr, &addr, false);
    assert!(matches!(env.setup().await, Err(JournalError::Config(_))));
    env.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_join_through_unreachable_helper_fails() {
    init_logger();
    let dir = TempDir::new().unwrap();
    let env = environment(dir.path(), "follower0", &free_addr(), &free_addr(), true);
    assert!(matches!(
        env.setup().await,
        Err(JournalError::JoinFailure { .. })
    ));
    assert_eq!(env.state(), EnvironmentState::SyncFailed);
    env.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_normal_cluster() {
    let cluster = Cluster::start().await;

    // master write
    let master_db = cluster.master.open_segment("0").await.unwrap();
    assert_eq!(cluster.master.segment_indexes().unwrap(), vec![0]);
    let key = random_entry();
    let value = random_entry();
    master_db.put(&key, &value).await.unwrap();

    // follower read
    for follower in &cluster.followers {
        assert!(
            wait_until(PROPAGATION_TIMEOUT, || {
                follower.segment_indexes().unwrap() == vec![0]
            })
            .await
        );
        let db = follower.open_segment("0").await.unwrap();
        assert!(
            wait_until(PROPAGATION_TIMEOUT, || {
                db.get(&key, ReadMode::Committed).unwrap().as_ref() == Some(&value)
            })
            .await
        );
        assert_eq!(follower.role().unwrap(), NodeRole::Follower);
        assert!(matches!(
            db.put(&key, b"nope").await,
            Err(JournalError::NotWritable { .. })
        ));
        assert!(matches!(
            follower.open_segment("1").await,
            Err(JournalError::NotWritable { .. })
        ));
        assert_eq!(
            follower.leader_address().unwrap().as_deref(),
            Some(cluster.master_addr.as_str())
        );
    }

    // add observer
    let observer_dir = TempDir::new().unwrap();
    let observer_addr = free_addr();
    let observer = environment(
        observer_dir.path(),
        "observer",
        &observer_addr,
        &cluster.master_addr,
        false,
    );
    observer.setup().await.unwrap();

    // observer read, caught up at setup
    assert_eq!(observer.segment_indexes().unwrap(), vec![0]);
    let observer_db = observer.open_segment("0").await.unwrap();
    assert_eq!(
        observer_db.get(&key, ReadMode::Committed).unwrap(),
        Some(value.clone())
    );
    assert_eq!(observer.role().unwrap(), NodeRole::Observer);
    assert!(matches!(
        observer.remove_segment("0").await,
        Err(JournalError::NotWritable { .. })
    ));

    let members = cluster.master.members().unwrap();
    assert_eq!(members.len(), 4);
    assert_eq!(members.iter().filter(|m| !m.voter).count(), 1);

    // the observer leaves again
    cluster.master.remove_member(&observer_addr).await.unwrap();
    assert_eq!(cluster.master.members().unwrap().len(), 3);
    assert!(cluster
        .master
        .remove_member(&cluster.master_addr)
        .await
        .is_err());

    cluster.close().await;
    observer.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_delete_segments() {
    let cluster = Cluster::start().await;

    let key = random_entry();
    let value = random_entry();
    let indexes: Vec<u64> = vec![0, 1, 2, 9, 10];
    for (i, index) in indexes.iter().enumerate() {
        let name = index.to_string();
        let master_db = cluster.master.open_segment(&name).await.unwrap();
        assert_eq!(cluster.master.segment_indexes().unwrap(), indexes[..=i].to_vec());
        master_db.put(&key, &value).await.unwrap();

        for follower in &cluster.followers {
            assert!(
                wait_until(PROPAGATION_TIMEOUT, || {
                    follower.segment_indexes().unwrap() == indexes[..=i].to_vec()
                })
                .await
            );
            let db = follower.open_segment(&name).await.unwrap();
            assert!(
                wait_until(PROPAGATION_TIMEOUT, || {
                    db.get(&key, ReadMode::Committed).unwrap().as_ref() == Some(&value)
                })
                .await
            );
        }
    }

    // below the highest index ever created
    assert!(matches!(
        cluster.master.open_segment("5").await,
        Err(JournalError::InvalidSegment { .. })
    ));

    // drop the first two
    cluster.master.remove_segment("0").await.unwrap();
    cluster.master.remove_segment("1").await.unwrap();
    assert!(matches!(
        cluster.master.remove_segment("1").await,
        Err(JournalError::SegmentNotFound(_))
    ));

    let expected = vec![2, 9, 10];
    assert_eq!(cluster.master.segment_indexes().unwrap(), expected);
    for follower in &cluster.followers {
        assert!(
            wait_until(PROPAGATION_TIMEOUT, || {
                follower.segment_indexes().unwrap() == expected
            })
            .await
        );
        assert!(matches!(
            follower.remove_segment("2").await,
            Err(JournalError::NotWritable { .. })
        ));
    }

    cluster.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_operations_after_close_fail() {
    init_logger();
    let dir = TempDir::new().unwrap();
    let addr = free_addr();
    let env = environment(dir.path(), "standalone", &addr, &addr, true);
    env.setup().await.unwrap();
    let db = env.open_segment("0").await.unwrap();
    db.put(b"k", b"v").await.unwrap();

    env.close().await;
    env.close().await;
    assert_eq!(env.state(), EnvironmentState::Closed);
    assert!(matches!(
        env.open_segment("0").await,
        Err(JournalError::Closed(_))
    ));
    assert!(matches!(env.segment_indexes(), Err(JournalError::Closed(_))));
    assert!(matches!(
        db.get(b"k", ReadMode::Committed),
        Err(JournalError::Closed(_))
    ));
    assert!(matches!(
        db.put(b"k", b"w").await,
        Err(JournalError::Closed(_))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_restart_replays_local_history() {
    init_logger();
    let dir = TempDir::new().unwrap();
    let addr = free_addr();
    {
        let env = environment(dir.path(), "standalone", &addr, &addr, true);
        env.setup().await.unwrap();
        let db = env.open_segment("catalog").await.unwrap();
        db.put(b"k", b"v").await.unwrap();
        env.close().await;
    }

    let env = environment(dir.path(), "standalone", &addr, &addr, true);
    env.setup().await.unwrap();
    assert_eq!(env.segment_names().unwrap(), vec!["catalog".to_string()]);
    let db = env.open_segment("catalog").await.unwrap();
    assert_eq!(db.get(b"k", ReadMode::Committed).unwrap(), Some(b"v".to_vec()));
    assert!(
        wait_until(PROPAGATION_TIMEOUT, || env.role().unwrap() == NodeRole::Master).await
    );
    env.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_rollback_exception_on_setup_cluster() {
    let cluster = Cluster::start().await;

    // master write segment 0
    let master_db = cluster.master.open_segment("0").await.unwrap();
    let key = random_entry();
    let value = random_entry();
    master_db.put(&key, &value).await.unwrap();

    // followers read segment 0
    for follower in &cluster.followers {
        assert!(
            wait_until(PROPAGATION_TIMEOUT, || {
                follower.segment_indexes().unwrap() == vec![0]
            })
            .await
        );
        let db = follower.open_segment("0").await.unwrap();
        assert!(
            wait_until(PROPAGATION_TIMEOUT, || {
                db.get(&key, ReadMode::Committed).unwrap().as_ref() == Some(&value)
            })
            .await
        );
    }

    // manually back up the followers' storage
    let backup_dir = TempDir::new().unwrap();
    let backups: Vec<PathBuf> = (0..2)
        .map(|i| backup_dir.path().join(format!("follower{}_bk", i)))
        .collect();
    for (path, backup) in cluster.follower_paths.iter().zip(&backups) {
        copy_dir(path, backup).unwrap();
    }

    // master writes 100 records into a new segment and quits
    let master_db = cluster.master.open_segment("1").await.unwrap();
    for _ in 0..100 {
        master_db.put(&random_entry(), &random_entry()).await.unwrap();
    }
    assert_eq!(cluster.master.segment_indexes().unwrap(), vec![0, 1]);
    cluster.close().await;

    // restore the followers' storage
    for (path, backup) in cluster.follower_paths.iter().zip(&backups) {
        std::fs::remove_dir_all(path).unwrap();
        copy_dir(backup, path).unwrap();
    }

    // restarted followers only know the pre-backup state
    let mut followers = Vec::new();
    for i in 0..2 {
        let follower = environment(
            &cluster.follower_paths[i],
            &format!("follower{}", i),
            &cluster.follower_addrs[i],
            &cluster.follower_addrs[0],
            true,
        );
        follower.setup().await.unwrap();
        assert_eq!(follower.segment_indexes().unwrap(), vec![0]);
        followers.push(follower);
    }

    // the master's newer history is unknown to the group
    let master = environment(
        &cluster.master_path,
        "master",
        &cluster.master_addr,
        &cluster.follower_addrs[0],
        true,
    );
    match master.setup().await {
        Err(e @ JournalError::RollbackDivergence { .. }) => assert!(e.is_fatal()),
        other => panic!("expected rollback divergence, got {:?}", other),
    }
    assert_eq!(master.state(), EnvironmentState::RollbackFailed);
    master.close().await;

    for follower in &followers {
        assert_eq!(follower.segment_indexes().unwrap(), vec![0]);
        follower.close().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_follower_takes_over_when_master_leaves() {
    let cluster = Cluster::start().await;
    let master_db = cluster.master.open_segment("0").await.unwrap();
    master_db.put(b"before", b"1").await.unwrap();
    for follower in &cluster.followers {
        assert!(
            wait_until(PROPAGATION_TIMEOUT, || {
                follower.segment_indexes().unwrap() == vec![0]
            })
            .await
        );
    }

    cluster.master.close().await;

    let mut new_master = None;
    assert!(
        wait_until(Duration::from_secs(20), || {
            new_master = cluster
                .followers
                .iter()
                .position(|f| f.role().map(|r| r == NodeRole::Master).unwrap_or(false));
            new_master.is_some()
        })
        .await
    );
    let leader = &cluster.followers[new_master.unwrap()];
    let other = &cluster.followers[1 - new_master.unwrap()];
    assert_eq!(other.role().unwrap(), NodeRole::Follower);
    assert!(
        wait_until(PROPAGATION_TIMEOUT, || {
            other.leader_address().unwrap().as_deref()
                == Some(cluster.follower_addrs[new_master.unwrap()].as_str())
        })
        .await
    );

    let db = leader.open_segment("0").await.unwrap();
    db.put(b"after", b"2").await.unwrap();
    assert_eq!(
        db.get(b"before", ReadMode::Committed).unwrap(),
        Some(b"1".to_vec())
    );
    let other_db = other.open_segment("0").await.unwrap();
    assert!(
        wait_until(PROPAGATION_TIMEOUT, || {
            other_db.get(b"after", ReadMode::Committed).unwrap().as_deref() == Some(&b"2"[..])
        })
        .await
    );

    cluster.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_committed_reads_skip_pending_write() {
    let cluster = Cluster::start().await;
    let db = cluster.master.open_segment("0").await.unwrap();
    db.put(b"k", b"v1").await.unwrap();

    // without the followers nothing commits
    for follower in &cluster.followers {
        follower.close().await;
    }
    let writer = db.clone();
    let pending = tokio::spawn(async move { writer.put(b"k", b"v2").await });

    assert!(
        wait_until(PROPAGATION_TIMEOUT, || {
            db.get(b"k", ReadMode::Uncommitted).unwrap().as_deref() == Some(&b"v2"[..])
        })
        .await
    );
    assert_eq!(
        db.get(b"k", ReadMode::Committed).unwrap(),
        Some(b"v1".to_vec())
    );

    assert!(matches!(
        pending.await.unwrap(),
        Err(JournalError::CommitTimeout(_))
    ));
    assert_eq!(
        db.get(b"k", ReadMode::Committed).unwrap(),
        Some(b"v1".to_vec())
    );
    assert_eq!(
        db.get(b"k", ReadMode::Uncommitted).unwrap(),
        Some(b"v1".to_vec())
    );
    cluster.close().await;
}

/// Admits every joiner with a commit index it never replicates.
async fn stalled_helper(listener: TcpListener, leader_addr: String) {
    loop {
        let (mut stream, _) = match listener.accept().await {
            Ok(conn) => conn,
            Err(_) => return,
        };
        let leader_addr = leader_addr.clone();
        tokio::spawn(async move {
            while let Ok(Some(frame)) = read_frame(&mut stream).await {
                if let Frame::Join(_) = frame {
                    let reply = Frame::JoinReply(JoinReply::Accepted {
                        node_id: 2,
                        commit: 50,
                        members: vec![MemberInfo {
                            id: 1,
                            label: "master".to_string(),
                            addr: leader_addr.clone(),
                            voter: true,
                        }],
                    });
                    if write_frame(&mut stream, &reply).await.is_err() {
                        return;
                    }
                }
            }
        });
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_catch_up_deadline_fails_setup() {
    init_logger();
    let helper = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let helper_addr = helper.local_addr().unwrap().to_string();
    let server = tokio::spawn(stalled_helper(helper, helper_addr.clone()));

    let dir = TempDir::new().unwrap();
    let addr = free_addr();
    let env = JournalEnvironment::new(
        NodeConfig::new(dir.path(), "follower0", &addr, &helper_addr, true),
        JournalConfig {
            sync_timeout_sec: 2,
            ..test_config()
        },
    );
    match env.setup().await {
        Err(JournalError::SyncTimeout {
            target, applied, ..
        }) => {
            assert_eq!(target, 50);
            assert!(applied < 50);
        }
        other => panic!("expected a sync timeout, got {:?}", other),
    }
    assert_eq!(env.state(), EnvironmentState::SyncFailed);
    env.close().await;
    assert_eq!(env.state(), EnvironmentState::SyncFailed);
    server.abort();
}
