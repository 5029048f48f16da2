use std::time::Duration;

use anyhow::Result;
use futures::future::Future;

use knot::{Doc, Engine, LiveEvent, ShareMode};
use knot_docs::Query;
use knot_gossip::{net::Gossip, proto::Config};
use knot_net::Network;

const TIMEOUT: Duration = Duration::from_secs(10);

fn setup_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init()
        .ok();
}

fn spawn_node(network: &Network) -> Engine {
    let endpoint = network.endpoint();
    let gossip = Gossip::spawn(endpoint.clone(), Config::default());
    Engine::spawn(
        endpoint,
        gossip,
        knot_docs::Store::new(),
        knot_blobs::Store::new(),
    )
}

/// Poll `check` until it returns true or the timeout expires.
async fn wait_for<F, Fut>(check: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    tokio::time::timeout(TIMEOUT, async {
        loop {
            if check().await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("condition not met in time");
}

/// Wait for a live event matching the predicate, skipping everything else.
async fn wait_for_event(
    events: &flume::Receiver<LiveEvent>,
    matches: impl Fn(&LiveEvent) -> bool,
) -> LiveEvent {
    tokio::time::timeout(TIMEOUT, async {
        loop {
            let event = events.recv_async().await.expect("event stream ended");
            if matches(&event) {
                break event;
            }
        }
    })
    .await
    .expect("event not received in time")
}

/// Whether the document holds `expected` entries, all with content available.
async fn doc_converged(doc: &Doc, expected: usize) -> bool {
    let entries = doc.get_many(Query::all()).unwrap();
    entries.len() == expected
        && entries
            .iter()
            .all(|entry| doc.content_bytes(entry).is_some())
}

#[tokio::test(flavor = "multi_thread")]
async fn sync_two_nodes() -> Result<()> {
    setup_logging();
    let network = Network::new();
    let node0 = spawn_node(&network);
    let node1 = spawn_node(&network);

    let author0 = node0.docs().new_author(&mut rand::rngs::OsRng);
    let doc0 = node0.create_doc()?;
    doc0.set_bytes(&author0, "greet/en", "hello")?;
    doc0.set_bytes(&author0, "greet/de", "hallo")?;
    doc0.start_sync(vec![]).await?;
    let ticket = doc0.share(ShareMode::Write)?;

    let doc1 = node1.import_ticket(ticket).await?;
    let events1 = doc1.subscribe().await?;
    wait_for(|| doc_converged(&doc1, 2)).await;

    let entry = doc1.get_one(author0.id(), "greet/en")?.expect("entry synced");
    assert_eq!(doc1.content_bytes(&entry).unwrap(), "hello");

    // writes on the joined node flow back once the swarm is connected
    wait_for_event(&events1, |event| matches!(event, LiveEvent::NeighborUp(_))).await;
    let author1 = node1.docs().new_author(&mut rand::rngs::OsRng);
    doc1.set_bytes(&author1, "greet/fr", "salut")?;
    wait_for(|| doc_converged(&doc0, 3)).await;

    node0.shutdown().await?;
    node1.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn sync_emits_joined() -> Result<()> {
    setup_logging();
    let network = Network::new();
    let node = spawn_node(&network);

    let doc = node.create_doc()?;
    let events = doc.subscribe().await?;
    doc.start_sync(vec![]).await?;

    // joining the swarm is reported even with no peers to bootstrap from
    wait_for_event(&events, |event| matches!(event, LiveEvent::Joined)).await;

    node.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn sync_gossip_live_updates() -> Result<()> {
    setup_logging();
    let network = Network::new();
    let node0 = spawn_node(&network);
    let node1 = spawn_node(&network);

    let author = node0.docs().new_author(&mut rand::rngs::OsRng);
    let doc0 = node0.create_doc()?;
    doc0.start_sync(vec![]).await?;
    // subscribe before the second node joins, so its arrival is observable
    let events0 = doc0.subscribe().await?;

    let doc1 = node1.import_ticket(doc0.share(ShareMode::Write)?).await?;
    let events = doc1.subscribe().await?;
    wait_for_event(&events0, |event| matches!(event, LiveEvent::NeighborUp(_))).await;

    let hash = doc0.set_bytes(&author, "live", "over gossip")?;

    let event = wait_for_event(&events, |event| {
        matches!(event, LiveEvent::InsertRemote { .. })
    })
    .await;
    let LiveEvent::InsertRemote { entry, .. } = event else {
        unreachable!()
    };
    assert_eq!(entry.key(), b"live");
    assert_eq!(*entry.content_hash(), hash);

    // the content is fetched from the writer right after
    wait_for_event(
        &events,
        |event| matches!(event, LiveEvent::ContentReady { hash: ready } if *ready == hash),
    )
    .await;
    let entry = doc1.get_one(author.id(), "live")?.expect("entry received");
    assert_eq!(doc1.content_bytes(&entry).unwrap(), "over gossip");

    node0.shutdown().await?;
    node1.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn sync_three_nodes_converge() -> Result<()> {
    setup_logging();
    let network = Network::new();
    let nodes = [
        spawn_node(&network),
        spawn_node(&network),
        spawn_node(&network),
    ];

    let author0 = nodes[0].docs().new_author(&mut rand::rngs::OsRng);
    let doc0 = nodes[0].create_doc()?;
    doc0.set_bytes(&author0, "origin", "node0")?;
    doc0.start_sync(vec![]).await?;
    let ticket = doc0.share(ShareMode::Write)?;

    // both nodes bootstrap via node0 only
    let doc1 = nodes[1].import_ticket(ticket.clone()).await?;
    let doc2 = nodes[2].import_ticket(ticket).await?;

    let author1 = nodes[1].docs().new_author(&mut rand::rngs::OsRng);
    let author2 = nodes[2].docs().new_author(&mut rand::rngs::OsRng);
    doc1.set_bytes(&author1, "from/1", "one")?;
    doc2.set_bytes(&author2, "from/2", "two")?;

    wait_for(|| doc_converged(&doc0, 3)).await;
    wait_for(|| doc_converged(&doc1, 3)).await;
    wait_for(|| doc_converged(&doc2, 3)).await;

    for node in &nodes {
        node.shutdown().await?;
    }
    Ok(())
}

#[tokio::test]
async fn sync_deletes_propagate() -> Result<()> {
    setup_logging();
    let network = Network::new();
    let node0 = spawn_node(&network);
    let node1 = spawn_node(&network);

    let author = node0.docs().new_author(&mut rand::rngs::OsRng);
    let doc0 = node0.create_doc()?;
    doc0.set_bytes(&author, "ephemeral", "short lived")?;
    doc0.start_sync(vec![]).await?;
    let doc1 = node1.import_ticket(doc0.share(ShareMode::Write)?).await?;
    wait_for(|| doc_converged(&doc1, 1)).await;

    doc0.del(&author, "ephemeral")?;
    wait_for(|| async { doc1.get_one(author.id(), "ephemeral").unwrap().is_none() }).await;

    node0.shutdown().await?;
    node1.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn gc_protects_document_content() -> Result<()> {
    setup_logging();
    let network = Network::new();
    let node = spawn_node(&network);

    let author = node.docs().new_author(&mut rand::rngs::OsRng);
    let doc = node.create_doc()?;
    let hash = doc.set_bytes(&author, "data", "precious")?;

    // a live entry keeps the content alive through a gc pass
    let protect = node.gc_protect_callback();
    node.blobs().gc(protect());
    assert!(node.blobs().get(&hash).is_some());

    // once the entry is a tombstone the content is swept
    doc.del(&author, "data")?;
    node.blobs().gc(protect());
    assert!(node.blobs().get(&hash).is_none());

    node.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn sync_file_roundtrip() -> Result<()> {
    setup_logging();
    let network = Network::new();
    let node0 = spawn_node(&network);
    let node1 = spawn_node(&network);
    let dir = tempfile::tempdir()?;

    let in_path = dir.path().join("in.txt");
    std::fs::write(&in_path, b"file content")?;

    let author = node0.docs().new_author(&mut rand::rngs::OsRng);
    let doc0 = node0.create_doc()?;
    let key = knot::util::fs::path_to_key(&in_path, None, Some(dir.path().to_owned()))?;
    let (hash, len) = doc0.import_file(&author, &key, &in_path).await?;
    assert_eq!(len, 12);
    doc0.start_sync(vec![]).await?;

    let doc1 = node1.import_ticket(doc0.share(ShareMode::Write)?).await?;
    wait_for(|| doc_converged(&doc1, 1)).await;

    let entry = doc1.get_one(author.id(), &key)?.expect("entry synced");
    assert_eq!(*entry.content_hash(), hash);
    let out_path = dir.path().join("out.txt");
    doc1.export_file(&entry, &out_path).await?;
    assert_eq!(std::fs::read(&out_path)?, b"file content");

    node0.shutdown().await?;
    node1.shutdown().await?;
    Ok(())
}
