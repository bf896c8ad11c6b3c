// End-to-end integration tests for the relay pipeline.
//
// Each test starts a real relay server and connects real `RelayClient`
// instances for the market, participants, and the simulation controller,
// verifying the full path over TCP: registration handshakes, bid relay with
// acknowledgement, settlement delivery tracking, lifecycle fan-out, and the
// post-simulation shutdown watchdog.
//
// These tests exercise the same code paths as live deployments — the only
// test-specific code is the deadline polling in `TestClient`.

use std::thread;
use std::time::Duration;

use serde_json::{Value, json};

use microgrid_protocol::message::{ClientMessage, ServerMessage, Settlement};
use microgrid_protocol::types::AckId;
use simulation_tests::{TestClient, start_test_relay};

/// Register a market, join one participant, and complete the join
/// handshake (market ack + participant greeting).
fn join_participant(market: &mut TestClient, addr: std::net::SocketAddr, id: &str) -> TestClient {
    let mut participant = TestClient::connect(addr);
    assert!(
        participant
            .client
            .join_market("m1", id, "Residential")
            .unwrap()
    );

    let ack = match market.wait_for("ParticipantConnected", |m| {
        matches!(m, ServerMessage::ParticipantConnected { participant_id, .. } if participant_id == id)
    }) {
        ServerMessage::ParticipantConnected { ack, .. } => ack,
        _ => unreachable!(),
    };
    market.client.acknowledge(ack, Value::Null).unwrap();

    participant.wait_for("UpdateMarketInfo", |m| {
        matches!(m, ServerMessage::UpdateMarketInfo { market_id } if market_id == "m1")
    });
    participant
}

/// Pull the ack id out of a relayed `Settled` message.
fn settled_ack(msg: &ServerMessage) -> AckId {
    match msg {
        ServerMessage::Settled { ack, .. } => *ack,
        other => panic!("expected Settled, got {other:?}"),
    }
}

#[test]
fn round_and_generation_lifecycle() {
    let (handle, addr) = start_test_relay();

    let mut market = TestClient::connect(addr);
    assert!(market.client.register_market("m1").unwrap());

    let mut controller = TestClient::connect(addr);
    assert!(controller.client.register_sim_controller("ctl", "m1").unwrap());
    controller.client.send(&ClientMessage::IsMarketOnline).unwrap();
    controller.wait_for("MarketOnline", |m| matches!(m, ServerMessage::MarketOnline));

    let mut p1 = join_participant(&mut market, addr, "p1");
    let mut p2 = join_participant(&mut market, addr, "p2");
    controller.wait_for("ParticipantJoined p1", |m| {
        matches!(m, ServerMessage::ParticipantJoined { participant_id } if participant_id == "p1")
    });
    controller.wait_for("ParticipantJoined p2", |m| {
        matches!(m, ServerMessage::ParticipantJoined { participant_id } if participant_id == "p2")
    });

    // Controller kicks the round; the market hears it and fans out.
    controller
        .client
        .send(&ClientMessage::StartRoundSimulation {
            round: json!({"round": 1}),
        })
        .unwrap();
    market.wait_for("StartRound", |m| matches!(m, ServerMessage::StartRound { .. }));
    market
        .client
        .send(&ClientMessage::StartRound {
            round: json!({"round": 1}),
        })
        .unwrap();
    p1.wait_for("StartRound", |m| matches!(m, ServerMessage::StartRound { .. }));
    p2.wait_for("StartRound", |m| matches!(m, ServerMessage::StartRound { .. }));

    // A bid flows to the market; the market's uuid ack confirms it.
    p1.client.send_bid(json!({"quantity": 20, "price": 0.11})).unwrap();
    let bid_ack = match market.wait_for("Bid", |m| matches!(m, ServerMessage::Bid { .. })) {
        ServerMessage::Bid { body, ack, .. } => {
            assert_eq!(body["quantity"], 20);
            ack
        }
        _ => unreachable!(),
    };
    market
        .client
        .acknowledge(bid_ack, json!({"uuid": "u-1", "quantity": 20}))
        .unwrap();
    p1.wait_for("BidSuccess", |m| matches!(m, ServerMessage::BidSuccess { .. }));

    // Turn and round completion reach the controller.
    p1.client.send(&ClientMessage::EndTurn).unwrap();
    p2.client.send(&ClientMessage::EndTurn).unwrap();
    controller.wait_for("EndTurn p1", |m| {
        matches!(m, ServerMessage::EndTurn { participant_id } if participant_id == "p1")
    });
    controller.wait_for("EndTurn p2", |m| {
        matches!(m, ServerMessage::EndTurn { participant_id } if participant_id == "p2")
    });
    market
        .client
        .send(&ClientMessage::EndRound {
            summary: json!({"round": 1}),
        })
        .unwrap();
    controller.wait_for("EndRound", |m| matches!(m, ServerMessage::EndRound { .. }));

    // Generation fan-out reaches market and participants, not the sender.
    controller
        .client
        .send(&ClientMessage::EndGeneration {
            generation: json!({"generation": 0}),
        })
        .unwrap();
    market.wait_for("EndGeneration", |m| matches!(m, ServerMessage::EndGeneration { .. }));
    p1.wait_for("EndGeneration", |m| matches!(m, ServerMessage::EndGeneration { .. }));
    p2.wait_for("EndGeneration", |m| matches!(m, ServerMessage::EndGeneration { .. }));

    handle.stop();
}

#[test]
fn settlement_delivered_after_both_receipts() {
    let (handle, addr) = start_test_relay();

    let mut market = TestClient::connect(addr);
    assert!(market.client.register_market("m1").unwrap());
    let mut p1 = join_participant(&mut market, addr, "p1");
    let mut p2 = join_participant(&mut market, addr, "p2");

    market
        .client
        .send_settlement(Settlement {
            buyer_id: "p1".into(),
            seller_id: "p2".into(),
            commit_id: "c1".into(),
            buy_price: Some(0.131),
            sell_price: Some(0.069),
            details: json!({"quantity": 17}),
        })
        .unwrap();

    let buyer_msg = p1.wait_for("Settled", |m| matches!(m, ServerMessage::Settled { .. }));
    match &buyer_msg {
        ServerMessage::Settled { price, .. } => assert_eq!(*price, Some(0.131)),
        _ => unreachable!(),
    }
    let seller_msg = p2.wait_for("Settled", |m| matches!(m, ServerMessage::Settled { .. }));
    match &seller_msg {
        ServerMessage::Settled { price, .. } => assert_eq!(*price, Some(0.069)),
        _ => unreachable!(),
    }

    // One receipt is not enough.
    p1.client.acknowledge(settled_ack(&buyer_msg), Value::Null).unwrap();
    market.assert_never("early SettlementDelivered", |m| {
        matches!(m, ServerMessage::SettlementDelivered { .. })
    });

    // The second receipt delivers, exactly once.
    p2.client.acknowledge(settled_ack(&seller_msg), Value::Null).unwrap();
    market.wait_for("SettlementDelivered", |m| {
        matches!(m, ServerMessage::SettlementDelivered { commit_id } if commit_id == "c1")
    });
    market.assert_never("duplicate SettlementDelivered", |m| {
        matches!(m, ServerMessage::SettlementDelivered { .. })
    });

    handle.stop();
}

#[test]
fn settlement_with_offline_party_delivers_immediately() {
    let (handle, addr) = start_test_relay();

    let mut market = TestClient::connect(addr);
    assert!(market.client.register_market("m1").unwrap());
    let mut p1 = join_participant(&mut market, addr, "p1");
    let mut p2 = join_participant(&mut market, addr, "p2");

    // The seller leaves; give the relay time to process the disconnect.
    p2.client.disconnect();
    thread::sleep(Duration::from_millis(150));

    market
        .client
        .send_settlement(Settlement {
            buyer_id: "p1".into(),
            seller_id: "p2".into(),
            commit_id: "c2".into(),
            buy_price: None,
            sell_price: None,
            details: json!({"quantity": 5}),
        })
        .unwrap();

    market.wait_for("SettlementDelivered", |m| {
        matches!(m, ServerMessage::SettlementDelivered { commit_id } if commit_id == "c2")
    });
    p1.assert_never("Settled for skipped handshake", |m| {
        matches!(m, ServerMessage::Settled { .. })
    });

    handle.stop();
}

#[test]
fn settlement_against_grid_relays_nothing() {
    let (handle, addr) = start_test_relay();

    let mut market = TestClient::connect(addr);
    assert!(market.client.register_market("m1").unwrap());
    let mut p1 = join_participant(&mut market, addr, "p1");

    market
        .client
        .send_settlement(Settlement {
            buyer_id: "grid".into(),
            seller_id: "p1".into(),
            commit_id: "c3".into(),
            buy_price: None,
            sell_price: None,
            details: json!({"quantity": 9}),
        })
        .unwrap();

    p1.assert_never("Settled against the grid", |m| {
        matches!(m, ServerMessage::Settled { .. })
    });
    market.assert_never("SettlementDelivered against the grid", |m| {
        matches!(m, ServerMessage::SettlementDelivered { .. })
    });

    handle.stop();
}

#[test]
fn join_of_unregistered_market_rejected() {
    let (handle, addr) = start_test_relay();

    let mut participant = TestClient::connect(addr);
    assert!(
        !participant
            .client
            .join_market("nowhere", "p1", "Residential")
            .unwrap()
    );

    handle.stop();
}

#[test]
fn participant_disconnect_reaches_controller() {
    let (handle, addr) = start_test_relay();

    let mut market = TestClient::connect(addr);
    assert!(market.client.register_market("m1").unwrap());
    let mut controller = TestClient::connect(addr);
    assert!(controller.client.register_sim_controller("ctl", "m1").unwrap());
    let mut p1 = join_participant(&mut market, addr, "p1");
    controller.wait_for("ParticipantJoined", |m| {
        matches!(m, ServerMessage::ParticipantJoined { .. })
    });

    p1.client.disconnect();
    controller.wait_for("ParticipantDisconnected", |m| {
        matches!(m, ServerMessage::ParticipantDisconnected { participant_id } if participant_id == "p1")
    });

    handle.stop();
}

#[test]
fn relay_terminates_after_end_simulation() {
    let (handle, addr) = start_test_relay();

    let mut market = TestClient::connect(addr);
    assert!(market.client.register_market("m1").unwrap());
    let mut controller = TestClient::connect(addr);
    assert!(controller.client.register_sim_controller("ctl", "m1").unwrap());
    let mut p1 = join_participant(&mut market, addr, "p1");

    controller.client.send(&ClientMessage::EndSimulation).unwrap();
    market.wait_for("EndSimulation", |m| matches!(m, ServerMessage::EndSimulation));
    p1.wait_for("EndSimulation", |m| matches!(m, ServerMessage::EndSimulation));

    // Clients drain out; the relay's watchdog notices the empty registry
    // and the server thread finishes without `stop()` being called.
    p1.client.disconnect();
    market.client.disconnect();
    controller.client.disconnect();
    handle.wait();
}
