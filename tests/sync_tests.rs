//! Multi-client convergence: several sync clients, in-process and over the network,
//! must settle on exactly the store's rows for their identity.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tempfile::tempdir;

use smartmark::config::{ProviderConfig, ServerConfig};
use smartmark::identity::Identity;
use smartmark::server::{self, AppState};
use smartmark::sync::{LocalBackend, RemoteBackend, SyncClient, SyncConfig, SyncHandle, SyncState};

fn alice() -> Identity { Identity::new("u-alice", "alice@example.test", "Alice") }
fn bob() -> Identity { Identity::new("u-bob", "bob@example.test", "Bob") }

fn local_client(state: &AppState, who: &Identity) -> SyncHandle {
    let backend = Arc::new(LocalBackend::from_state(state));
    backend.sign_in(who.clone()).expect("local sign-in");
    let handle = SyncClient::spawn(backend, SyncConfig::default());
    handle.set_identity(Some(who.clone()));
    handle
}

async fn eventually<F: FnMut(&SyncState) -> bool>(h: &SyncHandle, pred: F) -> SyncState {
    tokio::time::timeout(Duration::from_secs(10), h.wait_for(pred))
        .await
        .expect("client did not converge")
        .expect("sync task stopped")
}

fn titles(s: &SyncState) -> Vec<String> {
    s.bookmarks.iter().map(|b| b.title.clone()).collect()
}

#[tokio::test]
async fn two_tabs_of_one_identity_converge() -> Result<()> {
    let state = AppState::from_config(ServerConfig::default())?;
    let tab1 = local_client(&state, &alice());
    let tab2 = local_client(&state, &alice());
    eventually(&tab1, |s| s.subscribed).await;
    eventually(&tab2, |s| s.subscribed).await;

    let first = tab1.create("First", "https://one.test").await?;
    tab1.create("Second", "https://two.test").await?;
    let seen = eventually(&tab2, |s| s.bookmarks.len() == 2).await;
    assert_eq!(titles(&seen), vec!["Second".to_string(), "First".to_string()]);

    tab2.delete(first.id).await?;
    let seen = eventually(&tab1, |s| s.bookmarks.len() == 1).await;
    assert_eq!(titles(&seen), vec!["Second".to_string()]);

    tab1.shutdown().await;
    tab2.shutdown().await;
    assert_eq!(state.feed.active_subscriptions("u-alice"), 0);
    Ok(())
}

#[tokio::test]
async fn identities_never_see_each_other() -> Result<()> {
    let state = AppState::from_config(ServerConfig::default())?;
    let a = local_client(&state, &alice());
    let b = local_client(&state, &bob());
    eventually(&a, |s| s.subscribed).await;
    eventually(&b, |s| s.subscribed).await;

    b.create("Bob's", "https://b.test").await?;
    a.create("Alice's", "https://a.test").await?;
    let a_state = eventually(&a, |s| s.bookmarks.len() == 1).await;
    let b_state = eventually(&b, |s| s.bookmarks.len() == 1).await;
    assert_eq!(titles(&a_state), vec!["Alice's".to_string()]);
    assert_eq!(titles(&b_state), vec!["Bob's".to_string()]);

    // bob cannot remove alice's row, even knowing its id
    b.delete(a_state.bookmarks[0].id).await?;
    a.refresh();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(a.state().bookmarks.len(), 1);
    Ok(())
}

#[tokio::test]
async fn burst_of_writes_settles_on_final_state() -> Result<()> {
    let state = AppState::from_config(ServerConfig::default())?;
    let writer = local_client(&state, &alice());
    let reader = local_client(&state, &alice());
    eventually(&reader, |s| s.subscribed).await;

    let mut ids = Vec::new();
    for i in 0..20 {
        ids.push(writer.create(&format!("b{}", i), "https://x.test").await?.id);
    }
    for id in ids.iter().take(15) {
        writer.delete(*id).await?;
    }
    let settled = eventually(&reader, |s| s.bookmarks.len() == 5).await;
    let expected: Vec<String> = (15..20).rev().map(|i| format!("b{}", i)).collect();
    assert_eq!(titles(&settled), expected);
    Ok(())
}

#[tokio::test]
async fn remote_and_local_clients_converge() -> Result<()> {
    let tmp = tempdir()?;
    let config = ServerConfig {
        secure_cookies: false,
        snapshot_path: Some(tmp.path().join("bookmarks.bin")),
        provider: ProviderConfig::Dev { users: vec![("alice@example.test".to_string(), "Alice".to_string())] },
        ..ServerConfig::default()
    };
    let state = AppState::from_config(config)?;
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let server_task = tokio::spawn(server::serve(listener, state.clone()));

    let remote = Arc::new(RemoteBackend::new(&format!("http://{}", addr))?);
    assert!(remote.me().await?.is_none());
    let who = remote.sign_in(Some("alice@example.test")).await?;
    assert_eq!(who.id, "dev:alice@example.test");

    let browser = SyncClient::spawn(remote.clone(), SyncConfig::default());
    browser.set_identity(Some(who.clone()));
    eventually(&browser, |s| s.subscribed).await;

    let other_tab = local_client(&state, &who);
    eventually(&other_tab, |s| s.subscribed).await;

    other_tab.create("From local", "https://local.test").await?;
    let seen = eventually(&browser, |s| s.bookmarks.len() == 1).await;
    assert_eq!(titles(&seen), vec!["From local".to_string()]);

    let made = browser.create("From remote", "https://remote.test").await?;
    eventually(&other_tab, |s| s.bookmarks.len() == 2).await;

    browser.delete(made.id).await?;
    let seen = eventually(&other_tab, |s| s.bookmarks.len() == 1).await;
    assert_eq!(titles(&seen), vec!["From local".to_string()]);

    let err = browser.create("", "https://remote.test").await.unwrap_err();
    assert!(err.is_validation());

    browser.shutdown().await;
    remote.sign_out().await?;
    assert!(remote.me().await?.is_none());
    server_task.abort();
    Ok(())
}
