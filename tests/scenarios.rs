//! End-to-end round scenarios against the engines, wallet and dispatcher.

use parlay::config::{CrashConfig, PlatformConfig};
use parlay::dispatch::{DispatchOutcome, Dispatcher};
use parlay::errors::GameError;
use parlay::games::crash::CrashState;
use parlay::games::turn_card::{Card, CardColor, CardValue, TurnPhase};
use parlay::ledger::Ledger;
use parlay::money::{Amount, Mult};
use parlay::protocol::ClientOp;
use parlay::rooms::{GameState, Registry, RoomHandle};
use parlay::test_services;
use parlay::wallet::Wallet;
use parlay::Services;
use std::sync::Arc;
use tokio::time::{advance, Duration};

fn funded_wallet(users: &[&str], units: i64) -> Wallet {
    let wallet = Wallet::new(Arc::new(Ledger::in_memory()));
    for user in users {
        wallet.grant_bonus(user, Amount::from_units(units)).unwrap();
    }
    wallet
}

async fn run_flight_to_crash(state: &mut CrashState, wallet: &Wallet) {
    // Tick at 100ms until the round ends, like the driver would.
    loop {
        advance(Duration::from_millis(100)).await;
        let (_, crashed) = state.tick(wallet).unwrap();
        if crashed {
            break;
        }
    }
}

#[tokio::test(start_paused = true)]
async fn crash_auto_cashout_beats_the_crash() {
    let wallet = funded_wallet(&["alice"], 100);
    let mut state = CrashState::new("crash".into(), CrashConfig::default());
    state.begin_waiting();
    state
        .place_bet("alice", Amount::from_units(10), 1, Some(Mult(200)), &wallet)
        .unwrap();
    assert_eq!(wallet.balance("alice"), Amount::from_units(90));

    let round_id = state.round_id.clone();
    state.begin_flight(42, Mult(350));
    run_flight_to_crash(&mut state, &wallet).await;

    // 10 x 2.00 paid at the auto target, before the 3.50 crash.
    assert_eq!(wallet.balance("alice"), Amount::from_units(110));
    let totals = wallet.ledger().round_totals(&round_id);
    assert_eq!(totals.debits, Amount::from_units(10));
    assert_eq!(totals.payouts, Amount::from_units(20));
    // Every leg is closed: recovery would find nothing.
    assert!(wallet.ledger().unsettled_bets().is_empty());
}

#[tokio::test(start_paused = true)]
async fn crash_manual_cashout_at_server_multiplier() {
    let wallet = funded_wallet(&["alice"], 100);
    let mut state = CrashState::new("crash".into(), CrashConfig::default());
    state.begin_waiting();
    state
        .place_bet("alice", Amount::from_units(10), 1, None, &wallet)
        .unwrap();
    state.begin_flight(42, Mult(10_000));

    // Walk the multiplier up to exactly 1.73.
    while state.current < Mult(173) {
        advance(Duration::from_millis(100)).await;
        state.tick(&wallet).unwrap();
    }
    assert_eq!(state.current, Mult(173));
    state.cash_out("alice", 1, &wallet).unwrap();
    assert_eq!(wallet.balance("alice"), Amount::from_cents(10_730));
}

#[tokio::test(start_paused = true)]
async fn crash_auto_target_just_above_crash_point_loses() {
    let wallet = funded_wallet(&["alice"], 100);
    let mut state = CrashState::new("crash".into(), CrashConfig::default());
    state.begin_waiting();
    state
        .place_bet("alice", Amount::from_units(10), 1, Some(Mult(500)), &wallet)
        .unwrap();
    state.begin_flight(42, Mult(499));
    run_flight_to_crash(&mut state, &wallet).await;

    assert_eq!(wallet.balance("alice"), Amount::from_units(90));
    // The lost bet still closed its leg, at zero.
    assert!(wallet.ledger().unsettled_bets().is_empty());
}

async fn turn_card_room(
    services: &Arc<Services>,
    dispatcher: &Arc<Dispatcher>,
) -> Arc<RoomHandle> {
    for user in ["alice", "bob"] {
        services
            .wallet
            .grant_bonus(user, Amount::from_units(100))
            .unwrap();
    }
    let DispatchOutcome::RoomCreated(handle) = dispatcher
        .dispatch(
            "alice",
            "alice",
            None,
            ClientOp::CreateRoom {
                entry_amount: Amount::from_units(50),
                max_seats: 2,
            },
        )
        .await
        .unwrap()
    else {
        panic!("expected a created room");
    };
    let room_id = handle.id.clone();
    dispatcher
        .dispatch("bob", "bob", Some(&room_id), ClientOp::Join)
        .await
        .unwrap();
    dispatcher
        .dispatch("bob", "bob", Some(&room_id), ClientOp::ToggleReady)
        .await
        .unwrap();
    dispatcher
        .dispatch("alice", "alice", Some(&room_id), ClientOp::Start)
        .await
        .unwrap();
    handle
}

#[tokio::test]
async fn turn_card_win_conserves_money() {
    let services = test_services();
    let registry = Registry::new(services.clone());
    let dispatcher = Dispatcher::new(registry.clone(), services.clone());
    let handle = turn_card_room(&services, &dispatcher).await;
    let room_id = handle.id.clone();

    // Rig the active seat one legal card from victory.
    {
        let mut room = handle.state.lock().await;
        let GameState::TurnCard(state) = &mut room.game else {
            panic!("wrong game state")
        };
        let top_color = state.discard.last().unwrap().color.unwrap();
        let winner = state.current_turn;
        state.seats[winner].hand = vec![Card::colored(top_color, CardValue::Number(3))];
    }
    let (active, other) = {
        let room = handle.state.lock().await;
        let GameState::TurnCard(state) = &room.game else {
            panic!("wrong game state")
        };
        let active = state.seats[state.current_turn].user_id.clone();
        let other = state
            .seats
            .iter()
            .find(|s| s.user_id != active)
            .unwrap()
            .user_id
            .clone();
        (active, other)
    };
    dispatcher
        .dispatch(
            &active,
            &active,
            Some(&room_id),
            ClientOp::PlayCard {
                card_index: 0,
                wild_color: None,
            },
        )
        .await
        .unwrap();

    // Entry 50 each, zero edge: winner nets +50, loser -50.
    assert_eq!(
        services.wallet.balance(&active),
        Amount::from_units(150)
    );
    assert_eq!(services.wallet.balance(&other), Amount::from_units(50));
    let totals = services.wallet.ledger().round_totals(&room_id);
    assert_eq!(totals.house_take(), Amount::ZERO);
    assert!(services.wallet.ledger().unsettled_bets().is_empty());
}

#[tokio::test]
async fn wrong_turn_play_changes_nothing() {
    let services = test_services();
    let registry = Registry::new(services.clone());
    let dispatcher = Dispatcher::new(registry.clone(), services.clone());
    let handle = turn_card_room(&services, &dispatcher).await;
    let room_id = handle.id.clone();

    let (version_before, waiting) = {
        let room = handle.state.lock().await;
        let GameState::TurnCard(state) = &room.game else {
            panic!("wrong game state")
        };
        let waiting = state
            .seats
            .iter()
            .enumerate()
            .find(|(i, _)| *i != state.current_turn)
            .map(|(_, s)| s.user_id.clone())
            .unwrap();
        (room.version, waiting)
    };
    let err = dispatcher
        .dispatch(
            &waiting,
            &waiting,
            Some(&room_id),
            ClientOp::PlayCard {
                card_index: 0,
                wild_color: None,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, GameError::NotYourTurn));
    assert_eq!(handle.state.lock().await.version, version_before);
}

#[tokio::test]
async fn plus_two_chain_settles_as_four_cards() {
    let services = test_services();
    let registry = Registry::new(services.clone());
    let dispatcher = Dispatcher::new(registry.clone(), services.clone());
    let handle = turn_card_room(&services, &dispatcher).await;
    let room_id = handle.id.clone();

    let (first, second) = {
        let mut room = handle.state.lock().await;
        let GameState::TurnCard(state) = &mut room.game else {
            panic!("wrong game state")
        };
        let first_seat = state.current_turn;
        let second_seat = (first_seat + 1) % state.seats.len();
        state.seats[first_seat].hand.insert(
            0,
            Card::colored(state.current_color.unwrap(), CardValue::DrawTwo),
        );
        state.seats[second_seat]
            .hand
            .insert(0, Card::colored(CardColor::Blue, CardValue::DrawTwo));
        (
            state.seats[first_seat].user_id.clone(),
            state.seats[second_seat].user_id.clone(),
        )
    };
    dispatcher
        .dispatch(
            &first,
            &first,
            Some(&room_id),
            ClientOp::PlayCard {
                card_index: 0,
                wild_color: None,
            },
        )
        .await
        .unwrap();
    dispatcher
        .dispatch(
            &second,
            &second,
            Some(&room_id),
            ClientOp::PlayCard {
                card_index: 0,
                wild_color: None,
            },
        )
        .await
        .unwrap();

    // Back on the first seat with four cards pending; drawing takes all four.
    let hand_before = {
        let room = handle.state.lock().await;
        let GameState::TurnCard(state) = &room.game else {
            panic!("wrong game state")
        };
        assert_eq!(state.pending_draw, 4);
        state.seats[state.current_turn].hand.len()
    };
    dispatcher
        .dispatch(
            &first,
            &first,
            Some(&room_id),
            ClientOp::DrawCard {
                play_if_legal: false,
                wild_color: None,
            },
        )
        .await
        .unwrap();
    let room = handle.state.lock().await;
    let GameState::TurnCard(state) = &room.game else {
        panic!("wrong game state")
    };
    assert_eq!(state.pending_draw, 0);
    let first_seat = state.seats.iter().position(|s| s.user_id == first).unwrap();
    assert_eq!(state.seats[first_seat].hand.len(), hand_before + 4);
}

#[tokio::test]
async fn leaver_forfeits_and_last_seat_takes_pot() {
    let services = test_services();
    let registry = Registry::new(services.clone());
    let dispatcher = Dispatcher::new(registry.clone(), services.clone());
    let handle = turn_card_room(&services, &dispatcher).await;
    let room_id = handle.id.clone();

    dispatcher
        .dispatch("alice", "alice", Some(&room_id), ClientOp::Leave)
        .await
        .unwrap();
    let room = handle.state.lock().await;
    let GameState::TurnCard(state) = &room.game else {
        panic!("wrong game state")
    };
    assert_eq!(
        state.phase,
        TurnPhase::Finished {
            winner: Some("bob".into())
        }
    );
    assert_eq!(services.wallet.balance("bob"), Amount::from_units(150));
    assert_eq!(services.wallet.balance("alice"), Amount::from_units(50));
}

#[test]
fn restart_refunds_open_bets_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ledger.jsonl");
    let round_id;
    {
        let ledger = Arc::new(Ledger::open(&path).unwrap());
        let wallet = Wallet::new(ledger);
        wallet.grant_bonus("alice", Amount::from_units(100)).unwrap();
        let mut state = CrashState::new("crash".into(), CrashConfig::default());
        state.begin_waiting();
        state
            .place_bet("alice", Amount::from_units(10), 1, None, &wallet)
            .unwrap();
        round_id = state.round_id.clone();
        // Process dies here: the room and its open bet are gone.
    }
    let ledger = Arc::new(Ledger::open(&path).unwrap());
    let wallet = Wallet::new(ledger.clone());
    assert_eq!(wallet.balance("alice"), Amount::from_units(90));
    assert_eq!(wallet.recover_open_bets().unwrap(), 1);
    assert_eq!(wallet.balance("alice"), Amount::from_units(100));
    let totals = ledger.round_totals(&round_id);
    assert_eq!(totals.house_take(), Amount::ZERO);
}

#[tokio::test]
async fn config_defaults_boot_a_registry() {
    let config = PlatformConfig::default();
    assert!(config.validate().is_ok());
    let services = test_services();
    let registry = Registry::new(services.clone());
    registry.bootstrap();
    assert!(registry.get("crash").is_ok());
    assert!(registry.get("pool_flip").is_ok());
    assert_eq!(registry.list().await.len(), 2);
}
