//! End-to-end cluster tests over the in-process transport: DKG, beacon
//! rounds, catch-up after downtime, resharing and hostile input.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rusty_beacon_crypto::{decode_g2, tbls};
use rusty_beacon_net::{LocalBus, NodeMessage, RelayConfig, Transport};
use rusty_beacon_node::{time, Node, NodeConfig};
use rusty_beacon_types::{Group, GroupProposal, PartialBeacon, Scheme};
use tempfile::TempDir;

const DKG_TIMEOUT: Duration = Duration::from_secs(30);

async fn start_node(bus: &Arc<LocalBus>, base: &Path, index: usize) -> Arc<Node> {
    let config = NodeConfig {
        address: format!("node-{index}"),
        tls: false,
        base_dir: base.join(format!("node-{index}")),
        relay: RelayConfig {
            fanout: 4,
            ..Default::default()
        },
    };
    let transport: Arc<LocalBus> = bus.clone();
    let node = Node::start(config, transport).await.unwrap();
    bus.register(node.address(), node.inbox(), node.public_api())
        .await;
    node
}

async fn start_cluster(bus: &Arc<LocalBus>, base: &Path, n: usize) -> Vec<Arc<Node>> {
    let mut nodes = Vec::with_capacity(n);
    for i in 0..n {
        nodes.push(start_node(bus, base, i).await);
    }
    nodes
}

async fn run_dkg(nodes: &[Arc<Node>], threshold: u32, period: u64, scheme: Scheme) -> Group {
    let mut identities = Vec::new();
    for node in nodes {
        identities.push(node.identity());
    }
    let proposal = GroupProposal {
        nodes: identities,
        threshold,
        period,
        genesis_time: time::now_unix() + 2,
        scheme,
        transition_time: None,
    };

    let runs = nodes.iter().enumerate().map(|(i, node)| {
        let node = node.clone();
        let proposal = proposal.clone();
        async move { node.init_dkg(proposal, i == 0, DKG_TIMEOUT).await }
    });
    let mut groups: Vec<Group> = futures::future::join_all(runs)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    let group = groups.pop().unwrap();
    for other in groups {
        assert_eq!(other.public_key(), group.public_key());
        assert_eq!(other.chain_hash(), group.chain_hash());
    }
    group
}

/// Latest stored round, cheap enough for poll loops.
fn last_round(node: &Arc<Node>) -> u64 {
    node.query().public_rand(0).map(|b| b.round).unwrap_or(0)
}

async fn wait_for_round(node: &Arc<Node>, round: u64, deadline: Duration) {
    let started = Instant::now();
    while last_round(node) < round {
        if started.elapsed() > deadline {
            panic!(
                "timed out waiting for round {round}; node {} is at {}",
                node.address(),
                last_round(node)
            );
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn chained_genesis_five_nodes() {
    let dir = TempDir::new().unwrap();
    let bus = Arc::new(LocalBus::new());
    let nodes = start_cluster(&bus, dir.path(), 5).await;
    let group = run_dkg(&nodes, 3, 2, Scheme::Chained).await;
    let group_pk = decode_g2(group.public_key()).unwrap();

    for node in &nodes {
        wait_for_round(node, 2, Duration::from_secs(20)).await;
    }

    // round 1 chains off the genesis seed, round 2 off round 1
    let reference = nodes[0].query().public_rand(1).unwrap();
    assert_eq!(reference.previous_signature, group.genesis_seed.to_vec());
    let second = nodes[0].query().public_rand(2).unwrap();
    assert_eq!(second.previous_signature, reference.signature);

    for node in &nodes {
        for round in 1..=2u64 {
            let beacon = node.query().public_rand(round).unwrap();
            // determinism: every node stores the same signature
            let expect = nodes[0].query().public_rand(round).unwrap();
            assert_eq!(beacon.signature, expect.signature);
            let msg = group
                .scheme
                .message_for(beacon.round, &beacon.previous_signature);
            tbls::verify(&group_pk, &msg, &beacon.signature).unwrap();
        }
    }

    for node in &nodes {
        node.shutdown().await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn one_silent_signer_and_catch_up() {
    let dir = TempDir::new().unwrap();
    let bus = Arc::new(LocalBus::new());
    let mut nodes = start_cluster(&bus, dir.path(), 5).await;
    run_dkg(&nodes, 3, 1, Scheme::Chained).await;

    for node in &nodes {
        wait_for_round(node, 2, Duration::from_secs(15)).await;
    }

    // node 4 (index 4) goes silent
    let silent = nodes.pop().unwrap();
    silent.shutdown().await.unwrap();
    bus.unregister(silent.address()).await;
    let stopped_at = last_round(&silent);
    // release the node so its stores close before the restart
    drop(silent);
    tokio::time::sleep(Duration::from_millis(500)).await;

    // the remaining 4 nodes keep producing with t=3
    let target = stopped_at + 4;
    for node in &nodes {
        wait_for_round(node, target, Duration::from_secs(15)).await;
    }

    // restart node 4 from its on-disk state; it catches up within a round
    let node4 = start_node(&bus, dir.path(), 4).await;
    let caught_up_target = last_round(&nodes[0]);
    wait_for_round(&node4, caught_up_target, Duration::from_secs(10)).await;

    for node in &nodes {
        node.shutdown().await.unwrap();
    }
    node4.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn two_silent_signers_stall_a_t4_group() {
    let dir = TempDir::new().unwrap();
    let bus = Arc::new(LocalBus::new());
    let nodes = start_cluster(&bus, dir.path(), 5).await;
    run_dkg(&nodes, 4, 1, Scheme::Chained).await;

    for node in &nodes {
        wait_for_round(node, 1, Duration::from_secs(15)).await;
    }

    nodes[3].shutdown().await.unwrap();
    bus.unregister(nodes[3].address()).await;
    nodes[4].shutdown().await.unwrap();
    bus.unregister(nodes[4].address()).await;

    // give the survivors a couple of rounds' worth of time
    tokio::time::sleep(Duration::from_secs(3)).await;
    let frozen = last_round(&nodes[0]);
    tokio::time::sleep(Duration::from_secs(3)).await;

    // only 3 of the required 4 partials exist: no new rounds appear
    for node in &nodes[..3] {
        assert!(
            last_round(node) <= frozen + 1,
            "round advanced without a quorum"
        );
    }

    for node in &nodes[..3] {
        node.shutdown().await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn unchained_rounds_verify_independently() {
    let dir = TempDir::new().unwrap();
    let bus = Arc::new(LocalBus::new());
    let nodes = start_cluster(&bus, dir.path(), 5).await;
    let group = run_dkg(&nodes, 3, 1, Scheme::Unchained).await;
    let group_pk = decode_g2(group.public_key()).unwrap();

    for node in &nodes {
        wait_for_round(node, 2, Duration::from_secs(15)).await;
    }

    for round in 1..=2u64 {
        let beacon = nodes[2].query().public_rand(round).unwrap();
        // message depends on the round alone
        let msg = Scheme::Unchained.message_for(round, &[]);
        tbls::verify(&group_pk, &msg, &beacon.signature).unwrap();
    }

    for node in &nodes {
        node.shutdown().await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn reshare_adds_a_node_and_keeps_the_key() {
    let dir = TempDir::new().unwrap();
    let bus = Arc::new(LocalBus::new());
    let nodes = start_cluster(&bus, dir.path(), 5).await;
    let group = run_dkg(&nodes, 3, 1, Scheme::Chained).await;
    let old_pk = group.public_key().to_vec();

    for node in &nodes {
        wait_for_round(node, 1, Duration::from_secs(15)).await;
    }

    let newcomer = start_node(&bus, dir.path(), 5).await;
    let mut identities: Vec<_> = nodes.iter().map(|n| n.identity()).collect();
    identities.push(newcomer.identity());
    let proposal = GroupProposal {
        nodes: identities,
        threshold: 4,
        period: group.period,
        genesis_time: group.genesis_time,
        scheme: group.scheme,
        transition_time: Some(time::now_unix() + 2),
    };

    let mut runs = Vec::new();
    for (i, node) in nodes.iter().enumerate() {
        let node = node.clone();
        let proposal = proposal.clone();
        runs.push(tokio::spawn(async move {
            node.init_reshare(None, proposal, i == 0, DKG_TIMEOUT).await
        }));
    }
    {
        let newcomer = newcomer.clone();
        let proposal = proposal.clone();
        let old_group = group.clone();
        runs.push(tokio::spawn(async move {
            newcomer
                .init_reshare(Some(old_group), proposal, false, DKG_TIMEOUT)
                .await
        }));
    }
    for run in runs {
        let new_group = run.await.unwrap().unwrap();
        assert_eq!(new_group.public_key(), &old_pk[..]);
        assert_eq!(new_group.threshold, 4);
        assert_eq!(new_group.len(), 6);
    }

    // the rotated group keeps the beacon going and the newcomer follows
    let resume = last_round(&nodes[0]) + 2;
    for node in &nodes {
        wait_for_round(node, resume, Duration::from_secs(20)).await;
    }
    wait_for_round(&newcomer, resume, Duration::from_secs(20)).await;

    // still the same chain: old key verifies the new rounds
    let group_pk = decode_g2(&old_pk).unwrap();
    let beacon = newcomer.query().public_rand(resume).unwrap();
    let msg = group.scheme.message_for(beacon.round, &beacon.previous_signature);
    tbls::verify(&group_pk, &msg, &beacon.signature).unwrap();

    for node in &nodes {
        node.shutdown().await.unwrap();
    }
    newcomer.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn garbage_partial_does_not_stall_rounds() {
    let dir = TempDir::new().unwrap();
    let bus = Arc::new(LocalBus::new());
    let nodes = start_cluster(&bus, dir.path(), 5).await;
    run_dkg(&nodes, 3, 1, Scheme::Chained).await;

    for node in &nodes {
        wait_for_round(node, 1, Duration::from_secs(15)).await;
    }

    // hammer node 0 with in-range but meaningless partials
    let client = bus.client(nodes[0].address()).unwrap();
    let next = last_round(&nodes[0]) + 1;
    for round in next..next + 3 {
        for index in 1..=5u32 {
            let _ = client
                .send(NodeMessage::Partial(PartialBeacon {
                    round,
                    signer_index: index,
                    partial_signature: vec![0xab; 48],
                }))
                .await;
        }
    }

    // honest partials still complete the rounds
    wait_for_round(&nodes[0], next + 1, Duration::from_secs(15)).await;

    for node in &nodes {
        node.shutdown().await.unwrap();
    }
}
