//! Integration tests for the daemon over its Unix socket.
//!
//! Each test starts a daemon on a temp board, talks to it through the
//! blocking [`Client`], and shuts it down.

mod common;

use boardkeep::{
    AuthError, Client, Daemon, DaemonConfig, FileAdapter, Handler, KeyRing, KeyScope, TaskFields, Visibility,
};
use common::TestEnv;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::task::JoinHandle;

const MASTER: &str = "test-master-key";

async fn start(env: TestEnv<FileAdapter>, keys: KeyRing, master_key: Option<&str>) -> (PathBuf, JoinHandle<()>) {
    let TestEnv { temp_dir, store } = env;
    let root = temp_dir.path().to_path_buf();
    let config = DaemonConfig::new(&root);
    let socket = config.socket_path();
    let daemon = Daemon::new(config, Handler::new(store, keys, master_key.map(String::from)));

    let handle = tokio::spawn(async move {
        let _temp_dir = temp_dir;
        daemon.run().await.unwrap();
    });

    for _ in 0..100 {
        if socket.exists() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    (root, handle)
}

fn connect(root: &Path, token: Option<&str>) -> Client {
    Client::connect(root, false)
        .expect("Failed to connect")
        .with_token(token.map(String::from))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_round_trip_dev_mode() {
    let env = TestEnv::file().await;
    let (root, handle) = start(env, KeyRing::in_memory(), None).await;

    tokio::task::spawn_blocking(move || {
        let mut client = connect(&root, None);
        client.ping().unwrap();

        let project = client.create_project("Board", None, Some(Visibility::Private)).unwrap();
        let epic = client.create_epic(&project.id, "Epic", None).unwrap();
        let task = client
            .create_task(&project.id, "Task", Some(&epic.id), TaskFields::new())
            .unwrap();

        assert_eq!(client.list_projects().unwrap(), vec![project.clone()]);
        assert_eq!(client.list_epics(&project.id).unwrap(), vec![epic]);
        assert_eq!(client.get_task(&task.id).unwrap(), Some(task.clone()));
        assert!(client.delete_task(&task.id).unwrap());
        assert!(!client.delete_task(&task.id).unwrap());

        client.shutdown().unwrap();
    })
    .await
    .unwrap();

    handle.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_master_key_gates_writes_and_private_reads() {
    let env = TestEnv::file().await;
    let private = env
        .store
        .create_project("Secret", None, Some(Visibility::Private))
        .await
        .unwrap();
    let public = env.create_project("Open").await;
    let (root, handle) = start(env, KeyRing::in_memory(), Some(MASTER)).await;

    tokio::task::spawn_blocking(move || {
        let mut anonymous = connect(&root, None);
        assert_eq!(anonymous.get_project(&private.id).unwrap(), None);
        assert_eq!(anonymous.get_project(&public.id).unwrap(), Some(public.clone()));
        assert_eq!(anonymous.list_projects().unwrap(), vec![public.clone()]);

        let err = anonymous.create_project("Nope", None, None).unwrap_err();
        assert_eq!(err.downcast_ref::<AuthError>(), Some(&AuthError::Unauthorized));
        assert!(anonymous.shutdown().is_err());

        let mut wrong = connect(&root, Some("not-the-key"));
        let err = wrong.create_project("Nope", None, None).unwrap_err();
        assert_eq!(err.downcast_ref::<AuthError>(), Some(&AuthError::Unauthorized));

        let mut admin = connect(&root, Some(MASTER));
        assert_eq!(admin.get_project(&private.id).unwrap(), Some(private));
        assert_eq!(admin.list_projects().unwrap().len(), 2);
        admin.shutdown().unwrap();
    })
    .await
    .unwrap();

    handle.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_project_scoped_key_over_socket() {
    let env = TestEnv::file().await;
    let p1 = env
        .store
        .create_project("P1", None, Some(Visibility::Private))
        .await
        .unwrap();
    let p2 = env.create_project("P2").await;
    let p3 = env
        .store
        .create_project("P3", None, Some(Visibility::Private))
        .await
        .unwrap();

    let mut keys = KeyRing::in_memory();
    let scoped = keys
        .issue(
            Some("p1 only"),
            KeyScope::Project {
                project_ids: vec![p1.id.clone()],
            },
        )
        .unwrap();
    let (root, handle) = start(env, keys, Some(MASTER)).await;

    tokio::task::spawn_blocking(move || {
        let mut client = connect(&root, Some(&scoped.key));
        assert_eq!(client.list_projects().unwrap(), vec![p1.clone(), p2.clone()]);
        assert!(client.create_task(&p1.id, "Mine", None, TaskFields::new()).is_ok());
        assert!(client.create_task(&p3.id, "Not mine", None, TaskFields::new()).is_err());
        assert!(client.list_tasks(&p3.id).is_err());

        connect(&root, Some(MASTER)).shutdown().unwrap();
    })
    .await
    .unwrap();

    handle.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_clients_all_persist() {
    let env = TestEnv::file().await;
    let project = env.create_project("Board").await;
    let (root, handle) = start(env, KeyRing::in_memory(), None).await;

    let workers: Vec<_> = (0..10)
        .map(|i| {
            let root = root.clone();
            let project_id = project.id.clone();
            tokio::task::spawn_blocking(move || {
                let mut client = connect(&root, None);
                client
                    .create_task(&project_id, &format!("Task {}", i), None, TaskFields::new())
                    .unwrap()
                    .id
            })
        })
        .collect();

    let mut ids = Vec::new();
    for worker in workers {
        ids.push(worker.await.unwrap());
    }
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 10);

    let root_for_check = root.clone();
    let listed = tokio::task::spawn_blocking(move || {
        let mut client = connect(&root_for_check, None);
        let tasks = client.list_tasks(&project.id).unwrap();
        client.shutdown().unwrap();
        tasks
    })
    .await
    .unwrap();
    assert_eq!(listed.len(), 10);

    handle.await.unwrap();
}
