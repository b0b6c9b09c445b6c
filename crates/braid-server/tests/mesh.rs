//! Peer links, sync, pruning and reconnects over real websockets.

mod common;

use braid_server::{ServerConfig, ServerError};
use braid_transport::SocketLimits;
use common::{config, wait_until, Node, Proxy};
use serde_json::json;

#[tokio::test]
async fn test_linked_nodes_share_data() {
    let mut a = Node::spawn(config(1)).await;
    let mut b = Node::spawn(config(2)).await;
    a.server.set("before", json!("link"));

    let remote = b.server.connect_to_peer(&a.address, json!(null)).await.unwrap();
    assert_eq!(remote, a.id());
    wait_until("initial sync", || b.server.get("before") == Some(json!("link"))).await;

    a.server.set("after", json!(2));
    wait_until("live update", || b.server.get("after") == Some(json!(2))).await;
    b.server.delete("before");
    wait_until("delete", || !a.server.has("before")).await;

    wait_until("adjacency", || {
        a.server.peer_graph().get(&b.id()) == Some(&vec![a.id()])
    })
    .await;

    b.stop().await;
    a.stop().await;
}

#[tokio::test]
async fn test_duplicate_and_self_links() {
    let mut a = Node::spawn(config(1)).await;
    let mut b = Node::spawn(config(2)).await;

    b.server.connect_to_peer(&a.address, json!(null)).await.unwrap();
    let again = b.server.connect_to_peer(&a.address, json!(null)).await.unwrap();
    assert_eq!(again, a.id());
    assert_eq!(b.server.connected_peers(), vec![a.id()]);

    let err = a
        .server
        .connect_to_peer(&a.address, json!(null))
        .await
        .unwrap_err();
    assert!(matches!(err, ServerError::SelfLink), "{err}");

    b.stop().await;
    a.stop().await;
}

#[tokio::test]
async fn test_departed_peer_is_pruned_across_chain() {
    let mut a = Node::spawn(config(1)).await;
    let mut b = Node::spawn(config(2)).await;
    let mut c = Node::spawn(config(3)).await;

    b.server.connect_to_peer(&a.address, json!(null)).await.unwrap();
    c.server.connect_to_peer(&b.address, json!(null)).await.unwrap();
    c.server
        .provide("^room:", |_, _| {}, Default::default())
        .unwrap();
    wait_until("c known to a", || {
        a.server.peer_graph().contains_key(&c.id()) && a.server.providers().contains_key(&c.id())
    })
    .await;

    c.stop().await;
    wait_until("c pruned from a", || {
        !a.server.peer_graph().contains_key(&c.id()) && !a.server.providers().contains_key(&c.id())
    })
    .await;
    assert_eq!(a.server.connected_peers(), vec![b.id()]);

    b.stop().await;
    a.stop().await;
}

#[tokio::test]
async fn test_losing_middle_node_splits_chain() {
    let mut a = Node::spawn(config(1)).await;
    let mut b = Node::spawn(config(2)).await;
    let mut c = Node::spawn(config(3)).await;

    b.server.connect_to_peer(&a.address, json!(null)).await.unwrap();
    c.server.connect_to_peer(&b.address, json!(null)).await.unwrap();
    a.server.provide("^a:", |_, _| {}, Default::default()).unwrap();
    c.server.provide("^c:", |_, _| {}, Default::default()).unwrap();
    wait_until("ends know each other", || {
        a.server.peer_graph().contains_key(&c.id())
            && c.server.peer_graph().contains_key(&a.id())
            && a.server.providers().contains_key(&c.id())
            && c.server.providers().contains_key(&a.id())
    })
    .await;

    b.stop().await;
    wait_until("ends pruned each other", || {
        let (graph_a, graph_c) = (a.server.peer_graph(), c.server.peer_graph());
        !graph_a.contains_key(&c.id())
            && !graph_a.contains_key(&b.id())
            && !graph_c.contains_key(&a.id())
            && !graph_c.contains_key(&b.id())
            && !a.server.providers().contains_key(&c.id())
            && !c.server.providers().contains_key(&a.id())
    })
    .await;
    assert!(a.server.connected_peers().is_empty());
    assert!(c.server.connected_peers().is_empty());

    c.stop().await;
    a.stop().await;
}

#[tokio::test]
async fn test_roles_reconverge_after_abrupt_link_loss() {
    let mut a = Node::spawn(config(1)).await;
    let mut b = Node::spawn(config(2)).await;
    let proxy = Proxy::spawn(&a).await;

    a.server.provide("^room:", |_, _| {}, Default::default()).unwrap();
    b.server
        .receive("^cmd:", |_, _, _| {}, |_, _, _| {}, |_, _| {})
        .unwrap();
    b.server.connect_to_peer(&proxy.address, json!(null)).await.unwrap();
    wait_until("roles replicated", || {
        a.server.providers() == b.server.providers()
            && a.server.receivers() == b.server.receivers()
            && b.server.providers().contains_key(&a.id())
            && a.server.receivers().contains_key(&b.id())
    })
    .await;
    let providers = a.server.providers();
    let receivers = b.server.receivers();

    proxy.sever();
    wait_until("link loss detected", || {
        b.server.connected_peers().is_empty()
            && !b.server.providers().contains_key(&a.id())
            && !a.server.receivers().contains_key(&b.id())
    })
    .await;

    wait_until("roles restored", || {
        a.server.providers() == providers
            && b.server.providers() == providers
            && a.server.receivers() == receivers
            && b.server.receivers() == receivers
    })
    .await;
    assert_eq!(b.server.connected_peers(), vec![a.id()]);

    b.stop().await;
    a.stop().await;
}

#[tokio::test]
async fn test_link_reconnects_after_remote_restart() {
    let mut a = Node::spawn(config(1)).await;
    let mut b = Node::spawn(config(2)).await;
    b.server.connect_to_peer(&a.address, json!(null)).await.unwrap();

    let port = a.port;
    a.stop().await;
    wait_until("link lost", || b.server.connected_peers().is_empty()).await;

    let mut restarted = Node::spawn_on(config(1), port).await;
    restarted.server.set("fresh", json!(true));
    wait_until("relinked", || b.server.get("fresh") == Some(json!(true))).await;
    assert_eq!(b.server.connected_peers(), vec![restarted.id()]);

    b.stop().await;
    restarted.stop().await;
}

#[tokio::test]
async fn test_large_values_cross_links_in_chunks() {
    let small = |id| ServerConfig {
        limits: SocketLimits {
            max_payload: 16 * 1024,
            ..SocketLimits::default()
        },
        sync_chunk_size: 8,
        ..config(id)
    };
    let mut a = Node::spawn(small(1)).await;
    let mut b = Node::spawn(small(2)).await;

    let big = json!("x".repeat(100_000));
    a.server.set("big", big.clone());
    for i in 0..40 {
        a.server.set(format!("k{i}"), json!(i));
    }

    b.server.connect_to_peer(&a.address, json!(null)).await.unwrap();
    wait_until("bulk sync", || b.server.keys().len() == 41).await;
    assert_eq!(b.server.get("big"), Some(big));

    let bigger = json!("y".repeat(200_000));
    a.server.set("bigger", bigger.clone());
    wait_until("live multipart", || b.server.get("bigger") == Some(bigger.clone())).await;

    b.stop().await;
    a.stop().await;
}

#[tokio::test]
async fn test_custom_maps_replicate() {
    let mut a = Node::spawn(config(1)).await;
    let mut b = Node::spawn(config(2)).await;
    a.server.get_map("rooms").set("lobby", json!(1));
    a.server.get_set("online").add(json!("ada"));

    b.server.connect_to_peer(&a.address, json!(null)).await.unwrap();
    wait_until("custom sync", || {
        b.server.get_map("rooms").get("lobby") == Some(json!(1))
            && b.server.get_set("online").has(&json!("ada"))
    })
    .await;

    b.server.get_set("online").delete(&json!("ada"));
    wait_until("custom delete", || !a.server.get_set("online").has(&json!("ada"))).await;

    b.stop().await;
    a.stop().await;
}

#[tokio::test]
async fn test_shutdown_leaks_nothing() {
    let mut a = Node::spawn(config(1)).await;
    let mut b = Node::spawn(config(2)).await;
    b.server.connect_to_peer(&a.address, json!(null)).await.unwrap();
    a.server.set("k", json!(1));
    wait_until("replicated", || b.server.has("k")).await;

    b.stop().await;
    a.stop().await;
    a.server.check_leaked_references().unwrap();
    b.server.check_leaked_references().unwrap();
}
