//! Recovery protocol scenarios: restarts, replays and rate limiting.

mod common;

use common::{build_signed_payload, inner_message, Cluster};
use dbft_consensus::{
    ConsensusMessageBody, ConsensusMessageType, ConsensusPhase, RecoveryRequest,
};
use dbft_core::Transaction;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64
}

#[tokio::test]
async fn restarted_node_catches_up_through_recovery() {
    let mut cluster = Cluster::new(4);
    let lagging = 3usize;
    let running: Vec<usize> = (0..4).filter(|i| *i != lagging).collect();

    // The proposal names a transaction the lagging node has never seen;
    // recovery must carry it.
    let tx = Transaction::new(21, vec![0xDD], 100);
    cluster.add_transaction(&tx, &running);

    cluster.init(&running).await;
    cluster.pump(&running).await;

    let expected_hash = cluster.nodes[running[0]].ledger.tip_hash();
    for &i in &running {
        assert_eq!(cluster.nodes[i].ledger.height(), 1);
    }

    // The fourth node starts from scratch: empty mempool, ledger at 0.
    cluster.init(&[lagging]).await;
    assert_eq!(cluster.nodes[lagging].ledger.height(), 0);
    assert_eq!(
        cluster.nodes[lagging].engine.context().phase(),
        ConsensusPhase::Backup
    );

    // Idle long enough, it solicits recovery.
    cluster.nodes[lagging].engine.on_recovery_timer().await.unwrap();
    let solicitations = cluster.nodes[lagging].network.drain();
    assert_eq!(solicitations.len(), 1);
    assert_eq!(
        inner_message(&solicitations[0]).message_type(),
        ConsensusMessageType::RecoveryRequest
    );

    // A committed node answers with its full round state.
    let responder = running[0];
    cluster.nodes[responder]
        .engine
        .on_payload(solicitations[0].clone())
        .await
        .unwrap();
    let replies = cluster.nodes[responder].network.drain();
    assert_eq!(replies.len(), 1);
    let reply = inner_message(&replies[0]);
    assert_eq!(reply.message_type(), ConsensusMessageType::RecoveryMessage);
    match &reply.body {
        ConsensusMessageBody::RecoveryMessage(recovery) => {
            assert!(recovery.prepare_request.is_some());
            assert!(recovery.preparation_payloads.len() >= 2);
            assert!(recovery.commit_payloads.len() >= 3);
            assert_eq!(recovery.transactions.len(), 1);
        }
        other => panic!("unexpected body: {other:?}"),
    }

    // Ingesting the reply reconstructs the block without waiting for the
    // next height.
    cluster.nodes[lagging]
        .engine
        .on_payload(replies[0].clone())
        .await
        .unwrap();

    assert_eq!(cluster.nodes[lagging].ledger.height(), 1);
    assert_eq!(cluster.nodes[lagging].ledger.tip_hash(), expected_hash);
    let block = cluster.nodes[lagging].ledger.block(1).unwrap();
    assert_eq!(block.transactions[0].hash(), tx.hash());
}

#[tokio::test]
async fn replaying_known_state_is_a_noop() {
    let mut cluster = Cluster::new(4);
    let online = [0, 1, 2, 3];
    cluster.init(&online).await;
    cluster.pump(&online).await;

    // Ask node 1 for a recovery reply.
    let request = build_signed_payload(
        &cluster.config,
        &cluster.keys[2],
        2,
        1,
        0,
        ConsensusMessageBody::RecoveryRequest(RecoveryRequest { timestamp: now_ms() }),
    );
    cluster.nodes[1].engine.on_payload(request).await.unwrap();
    let replies = cluster.nodes[1].network.drain();
    assert_eq!(replies.len(), 1);

    // Node 0 already holds everything the reply carries: ingesting it must
    // not change state or produce outbound payloads.
    let phase_before = cluster.nodes[0].engine.context().phase();
    let height_before = cluster.nodes[0].ledger.height();
    cluster.nodes[0].network.drain();

    cluster.nodes[0]
        .engine
        .on_payload(replies[0].clone())
        .await
        .unwrap();

    assert_eq!(cluster.nodes[0].engine.context().phase(), phase_before);
    assert_eq!(cluster.nodes[0].ledger.height(), height_before);
    assert!(cluster.nodes[0].network.drain().is_empty());
}

#[tokio::test]
async fn recovery_replies_are_rate_limited() {
    let mut cluster = Cluster::new(4);
    let online = [0, 1, 2, 3];
    cluster.init(&online).await;
    cluster.pump(&online).await;

    let responder = 1usize;
    let requester = 2u8;
    let stats = cluster.nodes[responder].engine.stats_handle();

    let first = build_signed_payload(
        &cluster.config,
        &cluster.keys[requester as usize],
        requester,
        1,
        0,
        ConsensusMessageBody::RecoveryRequest(RecoveryRequest { timestamp: now_ms() }),
    );
    // A distinct payload (different timestamp) from the same requester at
    // the same height.
    let second = build_signed_payload(
        &cluster.config,
        &cluster.keys[requester as usize],
        requester,
        1,
        0,
        ConsensusMessageBody::RecoveryRequest(RecoveryRequest {
            timestamp: now_ms() + 1,
        }),
    );

    cluster.nodes[responder].engine.on_payload(first).await.unwrap();
    assert_eq!(cluster.nodes[responder].network.drain().len(), 1);

    cluster.nodes[responder].engine.on_payload(second).await.unwrap();
    assert!(cluster.nodes[responder].network.drain().is_empty());
    assert_eq!(stats.read().recovery_replies_throttled, 1);

    // Once the window passes, replies flow again.
    tokio::time::sleep(Duration::from_millis(
        cluster.config.block_time_ms + 50,
    ))
    .await;
    let third = build_signed_payload(
        &cluster.config,
        &cluster.keys[requester as usize],
        requester,
        1,
        0,
        ConsensusMessageBody::RecoveryRequest(RecoveryRequest {
            timestamp: now_ms() + 2,
        }),
    );
    cluster.nodes[responder].engine.on_payload(third).await.unwrap();
    assert_eq!(cluster.nodes[responder].network.drain().len(), 1);
}
